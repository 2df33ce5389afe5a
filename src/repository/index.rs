// src/repository/index.rs

//! Catalog wire format
//!
//! A repository publishes its catalog at `<base_url>/INDEX` as a
//! length-prefixed record stream:
//!
//! ```text
//! [u32-be len][manifest record bytes]    repeated
//! [u32-be 0]                             terminator
//! [32-byte key fingerprint]
//! [32-byte Ed25519 public key]
//! [64-byte signature]
//! ```
//!
//! The signature covers the concatenation of the record bytes (without
//! the length prefixes). Decoding verifies the embedded key against
//! the repository's pinned fingerprint before trusting anything.

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::signature::{self, RepoSigner, FINGERPRINT_LEN, PUBLIC_KEY_LEN, SIGNATURE_LEN};

/// Largest record we will read; anything bigger is a malformed stream
const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

/// Encode a catalog document, signing it with the repository key
pub fn encode(manifests: &[Manifest], signer: &RepoSigner) -> Result<Vec<u8>> {
    let mut records = Vec::new();
    let mut out = Vec::new();
    for manifest in manifests {
        let bytes = serde_json::to_vec(manifest)
            .map_err(|e| Error::Parse(format!("manifest encode failed: {e}")))?;
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&bytes);
        records.extend_from_slice(&bytes);
    }
    out.extend_from_slice(&0u32.to_be_bytes());

    let fingerprint = hex::decode(signer.fingerprint())
        .map_err(|e| Error::Parse(format!("bad fingerprint encoding: {e}")))?;
    out.extend_from_slice(&fingerprint);
    out.extend_from_slice(&signer.public_key());
    out.extend_from_slice(&signer.sign(&records));
    Ok(out)
}

/// Decoded catalog plus the key that signed it
pub struct DecodedIndex {
    pub manifests: Vec<Manifest>,
    pub public_key: [u8; PUBLIC_KEY_LEN],
}

/// Decode and verify a catalog document against a pinned fingerprint
pub fn decode(origin: &str, bytes: &[u8], pinned_fingerprint: &str) -> Result<DecodedIndex> {
    decode_inner(origin, bytes, Some(pinned_fingerprint))
}

/// Decode a catalog without signature checks. Only reachable when
/// `security.require_signatures` is off.
pub fn decode_unverified(origin: &str, bytes: &[u8]) -> Result<DecodedIndex> {
    decode_inner(origin, bytes, None)
}

fn decode_inner(origin: &str, bytes: &[u8], pinned_fingerprint: Option<&str>) -> Result<DecodedIndex> {
    let mut offset = 0usize;
    let mut record_bytes = Vec::new();
    let mut manifests = Vec::new();

    loop {
        let len = read_u32(origin, bytes, offset)?;
        offset += 4;
        if len == 0 {
            break;
        }
        if len > MAX_RECORD_LEN {
            return Err(malformed(origin, "oversized record"));
        }
        let end = offset
            .checked_add(len as usize)
            .filter(|&e| e <= bytes.len())
            .ok_or_else(|| malformed(origin, "truncated record"))?;
        let record = &bytes[offset..end];
        manifests.push(Manifest::from_bytes(record)?);
        record_bytes.extend_from_slice(record);
        offset = end;
    }

    let trailer_len = FINGERPRINT_LEN + PUBLIC_KEY_LEN + SIGNATURE_LEN;
    if bytes.len() != offset + trailer_len {
        return Err(malformed(origin, "bad signature trailer"));
    }

    let fingerprint = &bytes[offset..offset + FINGERPRINT_LEN];
    let public_key: [u8; PUBLIC_KEY_LEN] = bytes
        [offset + FINGERPRINT_LEN..offset + FINGERPRINT_LEN + PUBLIC_KEY_LEN]
        .try_into()
        .expect("slice length is fixed");
    let sig: [u8; SIGNATURE_LEN] = bytes[offset + FINGERPRINT_LEN + PUBLIC_KEY_LEN..]
        .try_into()
        .expect("slice length is fixed");

    if let Some(pin) = pinned_fingerprint {
        // The embedded fingerprint must agree with the embedded key,
        // and both must agree with the pin.
        if hex::encode(fingerprint) != signature::fingerprint(&public_key) {
            return Err(Error::SignatureInvalid {
                origin: origin.to_string(),
                reason: "embedded fingerprint does not match embedded key".to_string(),
            });
        }
        signature::verify_pinned(origin, &record_bytes, &public_key, &sig, pin)?;
    }

    Ok(DecodedIndex {
        manifests,
        public_key,
    })
}

fn read_u32(origin: &str, bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes(b.try_into().expect("slice length is fixed")))
        .ok_or_else(|| malformed(origin, "truncated length prefix"))
}

fn malformed(origin: &str, what: &str) -> Error {
    Error::Parse(format!("malformed catalog from {origin}: {what}"))
}

/// Sign each manifest's canonical bytes with the repository key.
/// Repository tooling; clients only verify.
pub fn sign_manifests(manifests: &mut [Manifest], signer: &RepoSigner) -> Result<()> {
    for manifest in manifests.iter_mut() {
        let bytes = manifest.canonical_bytes()?;
        manifest.signature = Some(hex::encode(signer.sign(&bytes)));
    }
    Ok(())
}

/// Verify one manifest's detached signature with the repository key
pub fn verify_manifest(
    manifest: &Manifest,
    public_key: &[u8; PUBLIC_KEY_LEN],
) -> Result<()> {
    let origin = manifest.id().to_string();
    let sig_hex = manifest.signature.as_ref().ok_or_else(|| Error::SignatureInvalid {
        origin: origin.clone(),
        reason: "manifest is unsigned".to_string(),
    })?;
    let sig_bytes = hex::decode(sig_hex).map_err(|e| Error::SignatureInvalid {
        origin: origin.clone(),
        reason: format!("bad signature encoding: {e}"),
    })?;
    let sig: [u8; SIGNATURE_LEN] = sig_bytes.try_into().map_err(|_| Error::SignatureInvalid {
        origin: origin.clone(),
        reason: "bad signature length".to_string(),
    })?;
    signature::verify(&origin, &manifest.canonical_bytes()?, public_key, &sig)
}
