// src/version.rs

//! Version and constraint algebra
//!
//! Versions are ordered tuples of `(epoch, release components, pre-release
//! tag)` written as `[epoch:]a.b.c[~tag]`, e.g. `1.4.0`, `2:1.0.0~rc1`.
//! The pre-release tag orders *before* the unqualified release, so
//! `1.0.0~rc1 < 1.0.0`. Constraints pair a comparison operator with a
//! bound version; `~>` is the compatible-with operator.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// An immutable package version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    epoch: u32,
    release: Vec<u64>,
    pre_release: Option<String>,
}

impl Version {
    /// Build a version from parts. Release must be non-empty.
    pub fn new(epoch: u32, release: Vec<u64>, pre_release: Option<String>) -> Result<Self> {
        if release.is_empty() {
            return Err(Error::Parse("version has no release components".into()));
        }
        if let Some(tag) = &pre_release {
            validate_tag(tag)?;
        }
        Ok(Self {
            epoch,
            release,
            pre_release,
        })
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn release(&self) -> &[u64] {
        &self.release
    }

    pub fn pre_release(&self) -> Option<&str> {
        self.pre_release.as_deref()
    }
}

fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(Error::Parse("empty pre-release tag".into()));
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.')
    {
        return Err(Error::Parse(format!("invalid pre-release tag: {tag}")));
    }
    Ok(())
}

/// One run of a pre-release tag: alphabetic runs compare
/// lexicographically, numeric runs numerically, and a numeric run
/// orders before an alphabetic one at the same position.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum TagSegment<'a> {
    Number(u64),
    Alpha(&'a str),
}

fn tag_segments(tag: &str) -> Vec<TagSegment<'_>> {
    let mut segments = Vec::new();
    let bytes = tag.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'.' {
            i += 1;
            continue;
        }
        let start = i;
        if bytes[i].is_ascii_digit() {
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            // Runs are bounded by validate_tag, so this cannot overflow a
            // parse except for absurdly long digit runs; saturate there.
            let n = tag[start..i].parse::<u64>().unwrap_or(u64::MAX);
            segments.push(TagSegment::Number(n));
        } else {
            while i < bytes.len() && !bytes[i].is_ascii_digit() && bytes[i] != b'.' {
                i += 1;
            }
            segments.push(TagSegment::Alpha(&tag[start..i]));
        }
    }
    segments
}

fn compare_tags(a: &str, b: &str) -> Ordering {
    tag_segments(a).cmp(&tag_segments(b))
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.epoch != other.epoch {
            return self.epoch.cmp(&other.epoch);
        }
        // Pairwise over release components, the shorter side padded
        // with zeros.
        let len = self.release.len().max(other.release.len());
        for i in 0..len {
            let a = self.release.get(i).copied().unwrap_or(0);
            let b = other.release.get(i).copied().unwrap_or(0);
            if a != b {
                return a.cmp(&b);
            }
        }
        // Absent tag > any tag: 1.0.0~rc1 < 1.0.0
        match (&self.pre_release, &other.pre_release) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => compare_tags(a, b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}:", self.epoch)?;
        }
        let release = self
            .release
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(".");
        write!(f, "{release}")?;
        if let Some(tag) = &self.pre_release {
            write!(f, "~{tag}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Parse("empty version string".into()));
        }

        let (epoch, rest) = match s.split_once(':') {
            Some((e, rest)) => {
                let epoch = e
                    .parse::<u32>()
                    .map_err(|_| Error::Parse(format!("invalid epoch in version: {s}")))?;
                (epoch, rest)
            }
            None => (0, s),
        };

        let (release_str, pre_release) = match rest.split_once('~') {
            Some((r, tag)) => {
                validate_tag(tag)?;
                (r, Some(tag.to_string()))
            }
            None => (rest, None),
        };

        if release_str.is_empty() {
            return Err(Error::Parse(format!("version has no release components: {s}")));
        }

        let release = release_str
            .split('.')
            .map(|c| {
                c.parse::<u64>()
                    .map_err(|_| Error::Parse(format!("invalid release component {c:?} in version: {s}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Version::new(epoch, release, pre_release)
    }
}

impl TryFrom<String> for Version {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> String {
        v.to_string()
    }
}

/// Constraint comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Compatible-with: same leading release prefix, version >= bound
    Compatible,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Compatible => "~>",
        }
    }
}

/// A single version constraint: `(operator, bound)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Constraint {
    pub op: Op,
    pub version: Version,
}

impl Constraint {
    pub fn new(op: Op, version: Version) -> Self {
        Self { op, version }
    }

    /// Whether `v` satisfies this constraint
    pub fn matches(&self, v: &Version) -> bool {
        match self.op {
            Op::Eq => v == &self.version,
            Op::Ne => v != &self.version,
            Op::Lt => v < &self.version,
            Op::Le => v <= &self.version,
            Op::Gt => v > &self.version,
            Op::Ge => v >= &self.version,
            Op::Compatible => {
                if v.epoch != self.version.epoch || v < &self.version {
                    return false;
                }
                // `~> a.b.c` pins the a.b prefix; `~> a` pins nothing
                // beyond the lower bound.
                let prefix = self.version.release.len().saturating_sub(1);
                (0..prefix).all(|i| {
                    v.release.get(i).copied().unwrap_or(0) == self.version.release[i]
                })
            }
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.as_str(), self.version)
    }
}

impl FromStr for Constraint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        // Two-character operators first so `<=` is not read as `<`.
        let (op, rest) = if let Some(rest) = s.strip_prefix("~>") {
            (Op::Compatible, rest)
        } else if let Some(rest) = s.strip_prefix("!=") {
            (Op::Ne, rest)
        } else if let Some(rest) = s.strip_prefix("<=") {
            (Op::Le, rest)
        } else if let Some(rest) = s.strip_prefix(">=") {
            (Op::Ge, rest)
        } else if let Some(rest) = s.strip_prefix('<') {
            (Op::Lt, rest)
        } else if let Some(rest) = s.strip_prefix('>') {
            (Op::Gt, rest)
        } else if let Some(rest) = s.strip_prefix('=') {
            (Op::Eq, rest)
        } else {
            return Err(Error::Parse(format!("constraint has no operator: {s}")));
        };

        let version = rest.trim().parse::<Version>()?;
        Ok(Constraint { op, version })
    }
}

impl TryFrom<String> for Constraint {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Constraint> for String {
    fn from(c: Constraint) -> String {
        c.to_string()
    }
}

/// Whether `v` satisfies an optional constraint. Absence matches
/// every version.
pub fn satisfies(v: &Version, constraint: Option<&Constraint>) -> bool {
    constraint.map_or(true, |c| c.matches(v))
}
