// src/signature.rs

//! Ed25519 signature verification for repository indexes and manifests
//!
//! Repositories are pinned by the SHA-256 fingerprint of their Ed25519
//! public key. Signed documents carry the public key alongside the
//! signature; verification first checks that the embedded key hashes to
//! the pinned fingerprint, then checks the signature over the document
//! bytes. A key that does not match its pin is rejected before any
//! signature math happens.

use crate::error::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Length of a serialized public key
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length of a detached signature
pub const SIGNATURE_LEN: usize = 64;
/// Length of a key fingerprint (SHA-256)
pub const FINGERPRINT_LEN: usize = 32;

/// Lowercase-hex SHA-256 fingerprint of a public key
pub fn fingerprint(public_key: &[u8; PUBLIC_KEY_LEN]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Verify `signature` over `message` with `public_key`, requiring the
/// key to match the pinned fingerprint (lowercase hex).
pub fn verify_pinned(
    origin: &str,
    message: &[u8],
    public_key: &[u8; PUBLIC_KEY_LEN],
    signature: &[u8; SIGNATURE_LEN],
    pinned_fingerprint: &str,
) -> Result<()> {
    let actual = fingerprint(public_key);
    if !actual.eq_ignore_ascii_case(pinned_fingerprint) {
        return Err(Error::SignatureInvalid {
            origin: origin.to_string(),
            reason: format!(
                "signing key fingerprint {actual} does not match pinned {pinned_fingerprint}"
            ),
        });
    }
    verify(origin, message, public_key, signature)
}

/// Verify `signature` over `message` with `public_key`
pub fn verify(
    origin: &str,
    message: &[u8],
    public_key: &[u8; PUBLIC_KEY_LEN],
    signature: &[u8; SIGNATURE_LEN],
) -> Result<()> {
    let key = VerifyingKey::from_bytes(public_key).map_err(|e| Error::SignatureInvalid {
        origin: origin.to_string(),
        reason: format!("malformed public key: {e}"),
    })?;
    let sig = Signature::from_bytes(signature);
    key.verify(message, &sig).map_err(|_| Error::SignatureInvalid {
        origin: origin.to_string(),
        reason: "signature does not verify".to_string(),
    })
}

/// Signing half, used by repository build tooling and the test suite.
pub struct RepoSigner {
    key: SigningKey,
}

impl RepoSigner {
    /// Create a signer from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key.verifying_key().to_bytes()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.key.sign(message).to_bytes()
    }
}
