// src/state/records.rs

//! Installed-set records and the invariants every commit must uphold

use crate::error::{ConflictKind, Error, Result};
use crate::manifest::{FileEntry, Manifest, PackageId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What the state store persists per installed package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledRecord {
    pub manifest: Manifest,
    /// RFC 3339 install timestamp
    pub installed_at: String,
    /// Asked for by the user, as opposed to pulled in as a dependency
    pub explicit: bool,
    /// Exact file list with on-disk checksums at install time
    pub files: Vec<FileEntry>,
}

impl InstalledRecord {
    pub fn id(&self) -> PackageId {
        self.manifest.id()
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Whether this record satisfies a `(name, constraint)` requirement,
    /// by identity or by provides.
    pub fn satisfies(&self, relation: &crate::manifest::Relation) -> bool {
        if relation.satisfied_by(&self.manifest.name, &self.manifest.version) {
            return true;
        }
        self.manifest.provides.iter().any(|p| {
            p.name == relation.name
                && match (&relation.constraint, &p.constraint) {
                    (None, _) => true,
                    (Some(req), Some(provided)) => {
                        provided.op == crate::version::Op::Eq && req.matches(&provided.version)
                    }
                    (Some(_), None) => false,
                }
        })
    }
}

/// Check the installed-set invariants: every dependency satisfied, no
/// symmetric conflicts, no undeclared file-path sharing. Called at
/// every commit point; a violation means the caller must not commit.
pub fn check_invariants(records: &[InstalledRecord]) -> Result<()> {
    // 1. Dependency closure.
    for record in records {
        for dep in &record.manifest.depends {
            if !records.iter().any(|r| r.satisfies(dep)) {
                return Err(Error::Resolution(
                    crate::resolver::ResolutionError::WouldBreak {
                        dependent: record.id().to_string(),
                        requirement: dep.to_string(),
                    },
                ));
            }
        }
    }

    // 2. Symmetric conflicts.
    for a in records {
        for b in records {
            if a.manifest.name == b.manifest.name {
                continue;
            }
            if a.manifest.conflicts_with(&b.manifest.name, &b.manifest.version) {
                return Err(Error::Conflict(ConflictKind::PackageConflict {
                    package: a.id().to_string(),
                    other: b.id().to_string(),
                }));
            }
        }
    }

    // 3. File-path disjointness, shared paths excepted on both sides.
    let mut owners: HashMap<&str, (&InstalledRecord, &FileEntry)> = HashMap::new();
    for record in records {
        for file in &record.files {
            if let Some((prev_record, prev_file)) = owners.get(file.path.as_str()) {
                if !(file.shared && prev_file.shared) {
                    return Err(Error::Conflict(ConflictKind::FileCollision {
                        path: file.path.clone(),
                        first: prev_record.id().to_string(),
                        second: record.id().to_string(),
                    }));
                }
            } else {
                owners.insert(&file.path, (record, file));
            }
        }
    }

    Ok(())
}

/// Installed packages whose `depends` reference the given name (by
/// identity or provides). Computed by scanning; the data model keeps
/// no back-pointers.
pub fn dependents_of<'a>(
    records: &'a [InstalledRecord],
    name: &str,
) -> Vec<&'a InstalledRecord> {
    records
        .iter()
        .filter(|r| {
            r.manifest.depends.iter().any(|dep| {
                dep.name == name
                    || records
                        .iter()
                        .filter(|p| p.manifest.name == name)
                        .any(|p| p.satisfies(dep))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Arch, Codec, FileKind, Relation, Scripts};

    fn record(name: &str, version: &str) -> InstalledRecord {
        InstalledRecord {
            manifest: Manifest {
                name: name.to_string(),
                version: version.parse().unwrap(),
                arch: Arch::Any,
                description: String::new(),
                license: String::new(),
                maintainer: String::new(),
                download_size: 0,
                installed_size: 0,
                codec: Codec::Gzip,
                download_checksum: "00".repeat(32),
                files: Vec::new(),
                depends: Vec::new(),
                recommends: Vec::new(),
                conflicts: Vec::new(),
                replaces: Vec::new(),
                provides: Vec::new(),
                scripts: Scripts::default(),
                signature: None,
            },
            installed_at: "2026-01-01T00:00:00Z".to_string(),
            explicit: true,
            files: Vec::new(),
        }
    }

    fn file(path: &str, shared: bool) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            mode: 0o644,
            owner: "root".to_string(),
            sha256: "22".repeat(32),
            kind: FileKind::Regular,
            shared,
        }
    }

    #[test]
    fn test_consistent_set_passes() {
        let mut lib = record("lib", "1.2.0");
        lib.explicit = false;
        let mut app = record("app", "2.0.0");
        app.manifest.depends.push("lib >= 1.0".parse().unwrap());
        check_invariants(&[lib, app]).unwrap();
    }

    #[test]
    fn test_missing_dependency_fails() {
        let mut app = record("app", "2.0.0");
        app.manifest.depends.push("lib >= 1.0".parse().unwrap());
        assert!(check_invariants(&[app]).is_err());
    }

    #[test]
    fn test_provides_satisfies_dependency() {
        let mut mta = record("postfix", "3.8.0");
        mta.manifest.provides.push(Relation::new("mail-transport", None));
        let mut app = record("cron", "1.0");
        app.manifest.depends.push("mail-transport".parse().unwrap());
        check_invariants(&[mta, app]).unwrap();
    }

    #[test]
    fn test_symmetric_conflict_fails() {
        let mut a = record("pkg-a", "1.0");
        a.manifest.conflicts.push("pkg-b".parse().unwrap());
        let b = record("pkg-b", "1.0");
        let err = check_invariants(&[a, b]);
        assert!(matches!(
            err,
            Err(Error::Conflict(ConflictKind::PackageConflict { .. }))
        ));
    }

    #[test]
    fn test_file_collision_fails() {
        let mut a = record("pkg-a", "1.0");
        a.files.push(file("usr/bin/foo", false));
        let mut b = record("pkg-b", "1.0");
        b.files.push(file("usr/bin/foo", false));
        let err = check_invariants(&[a, b]);
        assert!(matches!(
            err,
            Err(Error::Conflict(ConflictKind::FileCollision { .. }))
        ));
    }

    #[test]
    fn test_shared_path_on_both_sides_allowed() {
        let mut a = record("pkg-a", "1.0");
        a.files.push(file("usr/share/common/locale", true));
        let mut b = record("pkg-b", "1.0");
        b.files.push(file("usr/share/common/locale", true));
        check_invariants(&[a, b]).unwrap();
    }

    #[test]
    fn test_shared_on_one_side_only_fails() {
        let mut a = record("pkg-a", "1.0");
        a.files.push(file("usr/share/common/locale", true));
        let mut b = record("pkg-b", "1.0");
        b.files.push(file("usr/share/common/locale", false));
        assert!(check_invariants(&[a, b]).is_err());
    }

    #[test]
    fn test_dependents_of() {
        let lib = record("lib", "1.0");
        let mut app = record("app", "1.0");
        app.manifest.depends.push("lib".parse().unwrap());
        let other = record("other", "1.0");
        let records = [lib, app, other];
        let deps = dependents_of(&records, "lib");
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].name(), "app");
    }
}
