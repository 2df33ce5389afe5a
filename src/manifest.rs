// src/manifest.rs

//! Package data model
//!
//! A [`Manifest`] is the immutable descriptor of one package version:
//! identity, payload metadata, file list, relations, lifecycle
//! scripts, and a detached signature over the canonical manifest
//! bytes. The canonical bytes are the JSON encoding of the manifest
//! with the signature field cleared; that is what repository keys
//! sign and what clients re-verify.

use crate::error::{Error, Result};
use crate::version::{Constraint, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Target architecture. `Any` matches every concrete target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Any,
    X86_64,
    Aarch64,
    Riscv64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Any => "any",
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
            Arch::Riscv64 => "riscv64",
        }
    }

    /// Whether a package built for `self` can install on `target`
    pub fn compatible_with(&self, target: Arch) -> bool {
        *self == Arch::Any || *self == target
    }

    /// The architecture of the running host
    pub fn host() -> Arch {
        if cfg!(target_arch = "x86_64") {
            Arch::X86_64
        } else if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else if cfg!(target_arch = "riscv64") {
            Arch::Riscv64
        } else {
            Arch::Any
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "any" => Ok(Arch::Any),
            "x86_64" => Ok(Arch::X86_64),
            "aarch64" => Ok(Arch::Aarch64),
            "riscv64" => Ok(Arch::Riscv64),
            _ => Err(Error::Parse(format!("unknown architecture: {s}"))),
        }
    }
}

/// Compression codec of the package artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    Gzip,
    Zstd,
}

/// Full package identity: `(name, version, architecture)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageId {
    pub name: String,
    pub version: Version,
    pub arch: Arch,
}

impl PackageId {
    pub fn new(name: impl Into<String>, version: Version, arch: Arch) -> Self {
        Self {
            name: name.into(),
            version,
            arch,
        }
    }

    /// Artifact file name under the repository pool:
    /// `<name>_<version>_<arch>.pkg`
    pub fn artifact_name(&self) -> String {
        format!("{}_{}_{}.pkg", self.name, self.version, self.arch)
    }

    /// Path of the artifact relative to a repository base URL:
    /// `pool/<first2>/<name>_<version>_<arch>.pkg`
    pub fn pool_path(&self) -> String {
        let shard: String = self.name.chars().take(2).collect();
        format!("pool/{}/{}", shard, self.artifact_name())
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{} [{}]", self.name, self.version, self.arch)
    }
}

/// Kind of an entry in a package's file list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    /// Configuration file: user edits are preserved and tracked
    Config,
}

/// One file shipped by a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the install prefix, e.g. `usr/bin/foo`
    pub path: String,
    pub mode: u32,
    pub owner: String,
    /// SHA-256 of the file content; empty for directories and symlinks
    #[serde(default)]
    pub sha256: String,
    pub kind: FileKind,
    /// Shared paths may be owned by several packages at once
    #[serde(default)]
    pub shared: bool,
}

/// A relation entry: a package name plus an optional version bound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<Constraint>,
}

impl Relation {
    pub fn new(name: impl Into<String>, constraint: Option<Constraint>) -> Self {
        Self {
            name: name.into(),
            constraint,
        }
    }

    /// Whether the given concrete `(name, version)` satisfies this relation
    pub fn satisfied_by(&self, name: &str, version: &Version) -> bool {
        self.name == name && self.constraint.as_ref().map_or(true, |c| c.matches(version))
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some(c) => write!(f, "{} {}", self.name, c),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for Relation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Parse("empty relation".into()));
        }
        match s.find(|c: char| c.is_whitespace() || "=!<>~".contains(c)) {
            Some(idx) if idx > 0 => {
                let (name, rest) = s.split_at(idx);
                let constraint = rest.trim().parse::<Constraint>()?;
                validate_name(name)?;
                Ok(Relation::new(name, Some(constraint)))
            }
            _ => {
                validate_name(s)?;
                Ok(Relation::new(s, None))
            }
        }
    }
}

/// Package names are case-sensitive ASCII tokens
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '+' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(Error::Parse(format!("invalid package name: {name:?}")))
    }
}

/// Lifecycle scripts, each an opaque shell fragment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scripts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_install: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_install: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_remove: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_remove: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configure: Option<String>,
}

impl Scripts {
    pub fn is_empty(&self) -> bool {
        self.pre_install.is_none()
            && self.post_install.is_none()
            && self.pre_remove.is_none()
            && self.post_remove.is_none()
            && self.configure.is_none()
    }
}

/// Immutable descriptor of one package version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: Version,
    pub arch: Arch,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub maintainer: String,
    pub download_size: u64,
    pub installed_size: u64,
    pub codec: Codec,
    /// SHA-256 of the on-wire artifact, lowercase hex
    pub download_checksum: String,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub depends: Vec<Relation>,
    #[serde(default)]
    pub recommends: Vec<Relation>,
    #[serde(default)]
    pub conflicts: Vec<Relation>,
    #[serde(default)]
    pub replaces: Vec<Relation>,
    #[serde(default)]
    pub provides: Vec<Relation>,
    #[serde(default, skip_serializing_if = "Scripts::is_empty")]
    pub scripts: Scripts,
    /// Detached Ed25519 signature over [`Manifest::canonical_bytes`],
    /// lowercase hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Manifest {
    pub fn id(&self) -> PackageId {
        PackageId::new(self.name.clone(), self.version.clone(), self.arch)
    }

    /// The bytes a repository key signs: the JSON encoding with the
    /// signature field cleared. Field order is fixed by the struct,
    /// so the encoding is deterministic.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        serde_json::to_vec(&unsigned)
            .map_err(|e| Error::Parse(format!("manifest encode failed: {e}")))
    }

    /// SHA-256 of the canonical bytes, lowercase hex
    pub fn digest(&self) -> Result<String> {
        let bytes = self.canonical_bytes()?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Digest over the fields known before the artifact is assembled.
    ///
    /// The MANIFEST embedded in an artifact cannot carry the
    /// artifact's own checksum or size, so it ships with those fields
    /// blank; comparing a staged artifact against its index entry
    /// therefore compares this digest, not [`Manifest::digest`].
    pub fn payload_digest(&self) -> Result<String> {
        let mut reduced = self.clone();
        reduced.signature = None;
        reduced.download_checksum = String::new();
        reduced.download_size = 0;
        let bytes = serde_json::to_vec(&reduced)
            .map_err(|e| Error::Parse(format!("manifest encode failed: {e}")))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Decode one manifest record from its wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Parse(format!("manifest decode failed: {e}")))
    }

    /// Whether this package conflicts with the given `(name, version)`
    pub fn conflicts_with(&self, name: &str, version: &Version) -> bool {
        self.conflicts.iter().any(|r| r.satisfied_by(name, version))
    }

    /// All names this manifest can stand in for: its own plus provides
    pub fn provided_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.provides.iter().map(|r| r.name.as_str()))
    }
}
