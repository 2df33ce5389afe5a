// src/error.rs

use thiserror::Error;

/// Core error types for Strata
///
/// Every failure surfaced by the library is one of these tagged
/// variants; numeric codes never cross the internal API.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input: config, version string, constraint, manifest
    #[error("Parse error: {0}")]
    Parse(String),

    /// Artifact or file bytes did not hash to the recorded checksum
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Signature did not verify against the pinned repository key
    #[error("Signature invalid for {origin}: {reason}")]
    SignatureInvalid { origin: String, reason: String },

    /// The resolver could not produce a plan
    #[error(transparent)]
    Resolution(#[from] crate::resolver::ResolutionError),

    /// Two packages (or two files) cannot coexist
    #[error(transparent)]
    Conflict(#[from] ConflictKind),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network transport failure
    #[error("Download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    /// Another instance owns the lock
    #[error("Lock unavailable at {path}: {reason}")]
    Lock { path: String, reason: String },

    /// A configured trust or resource policy refused the operation
    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    /// A lifecycle script exited non-zero
    #[error("Script {script} of {package} exited with status {status}")]
    Script {
        package: String,
        script: String,
        status: i32,
    },

    /// The local state store is unusable
    #[error("State store corrupt: {0}")]
    StateCorrupt(String),
}

/// The two flavors of conflict a transaction can trip over
#[derive(Error, Debug)]
pub enum ConflictKind {
    /// Two packages own the same path and neither declares it shared
    #[error("File collision on {path}: owned by both {first} and {second}")]
    FileCollision {
        path: String,
        first: String,
        second: String,
    },

    /// Symmetric `conflicts` declaration between two packages
    #[error("Package conflict: {package} conflicts with {other}")]
    PackageConflict { package: String, other: String },
}

impl Error {
    /// True for failures worth a single retry (transient network and
    /// I/O classes). Everything else fails the enclosing operation.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Download { .. } => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Result type alias using Strata's Error type
pub type Result<T> = std::result::Result<T, Error>;
