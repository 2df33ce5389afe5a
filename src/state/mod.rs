// src/state/mod.rs

//! Local state store
//!
//! The installed-set lives in a single checksummed file
//! `<state>/state.db`, rewritten atomically at each commit with the
//! prior snapshot kept at `state.db.prev`. Transaction logs live under
//! `<state>/transactions/`. One process mutates state at a time,
//! enforced by an exclusive advisory lock on `<state>/.lock` held for
//! the lifetime of the process; read-only commands take a shared lock
//! and tolerate their snapshot being superseded.

pub mod records;
pub mod txlog;

pub use records::{check_invariants, dependents_of, InstalledRecord};

use crate::error::{Error, Result};
use fs4::FileExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const STATE_FILE: &str = "state.db";
const PREV_FILE: &str = "state.db.prev";
const LOCK_FILE: &str = ".lock";
const TRANSACTIONS_DIR: &str = "transactions";
const CHECKSUM_PREFIX: &str = "#sha256=";

/// How the process lock is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Mutating instance; exactly one per state root
    Exclusive,
    /// Read-only query instance
    Shared,
}

/// The installed-set, its on-disk home, and the process lock
pub struct StateDb {
    root: PathBuf,
    _lock: File,
    records: Vec<InstalledRecord>,
    by_name: HashMap<String, usize>,
    by_provides: HashMap<String, Vec<usize>>,
}

impl StateDb {
    /// Open the state store, acquiring the process lock for the
    /// lifetime of the returned value. Fails with `Error::Lock` when
    /// another instance holds a conflicting lock.
    pub fn open(root: &Path, mode: LockMode) -> Result<Self> {
        fs::create_dir_all(root)?;
        let lock_path = root.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        let acquired = match mode {
            LockMode::Exclusive => FileExt::try_lock_exclusive(&lock),
            LockMode::Shared => FileExt::try_lock_shared(&lock),
        };
        acquired.map_err(|_| Error::Lock {
            path: lock_path.display().to_string(),
            reason: "another strata instance owns the lock".to_string(),
        })?;

        let records = load_records(root)?;
        let mut db = Self {
            root: root.to_path_buf(),
            _lock: lock,
            records,
            by_name: HashMap::new(),
            by_provides: HashMap::new(),
        };
        db.rebuild_indexes();
        debug!(
            "Opened state store at {} with {} installed package(s)",
            root.display(),
            db.records.len()
        );
        Ok(db)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.root.join(TRANSACTIONS_DIR)
    }

    pub fn records(&self) -> &[InstalledRecord] {
        &self.records
    }

    /// The installed package of this exact name, if any
    pub fn get(&self, name: &str) -> Option<&InstalledRecord> {
        self.by_name.get(name).map(|&i| &self.records[i])
    }

    /// Installed packages satisfying `name` by identity or provides
    pub fn providers_of(&self, name: &str) -> Vec<&InstalledRecord> {
        let mut out = Vec::new();
        if let Some(&i) = self.by_name.get(name) {
            out.push(&self.records[i]);
        }
        if let Some(indexes) = self.by_provides.get(name) {
            for &i in indexes {
                out.push(&self.records[i]);
            }
        }
        out
    }

    /// The installed package owning `path`, if any
    pub fn owner_of(&self, path: &str) -> Option<&InstalledRecord> {
        self.records
            .iter()
            .find(|r| r.files.iter().any(|f| f.path == path))
    }

    /// Atomically replace the installed-set.
    ///
    /// The caller is responsible for having flushed the transaction
    /// log first; this only performs the temp-fsync-rename dance and
    /// keeps the prior snapshot at `state.db.prev`.
    pub fn commit(&mut self, new_records: Vec<InstalledRecord>) -> Result<()> {
        let text = encode_records(&new_records)?;

        let tmp_path = self.root.join(format!("{STATE_FILE}.tmp"));
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(text.as_bytes())?;
            tmp.sync_all()?;
        }

        let state_path = self.root.join(STATE_FILE);
        if state_path.exists() {
            fs::rename(&state_path, self.root.join(PREV_FILE))?;
        }
        fs::rename(&tmp_path, &state_path)?;
        txlog::sync_dir(&self.root)?;

        info!("Committed state.db with {} package(s)", new_records.len());
        self.records = new_records;
        self.rebuild_indexes();
        Ok(())
    }

    /// Indexes are derived data, rebuilt from the canonical record
    /// list; the records themselves carry no back-pointers.
    fn rebuild_indexes(&mut self) {
        self.by_name.clear();
        self.by_provides.clear();
        for (i, record) in self.records.iter().enumerate() {
            self.by_name.insert(record.manifest.name.clone(), i);
            for provide in &record.manifest.provides {
                self.by_provides
                    .entry(provide.name.clone())
                    .or_default()
                    .push(i);
            }
        }
    }
}

fn encode_records(records: &[InstalledRecord]) -> Result<String> {
    let body = serde_json::to_string_pretty(records)
        .map_err(|e| Error::Parse(format!("state encode failed: {e}")))?;
    let mut text = body;
    text.push('\n');
    let digest = hex::encode(Sha256::digest(text.as_bytes()));
    text.push_str(CHECKSUM_PREFIX);
    text.push_str(&digest);
    text.push('\n');
    Ok(text)
}

fn decode_records(text: &str) -> Result<Vec<InstalledRecord>> {
    let trailer_at = text
        .rfind(CHECKSUM_PREFIX)
        .ok_or_else(|| Error::StateCorrupt("state.db has no checksum trailer".to_string()))?;
    let body = &text[..trailer_at];
    let recorded = text[trailer_at + CHECKSUM_PREFIX.len()..].trim();
    let actual = hex::encode(Sha256::digest(body.as_bytes()));
    if actual != recorded {
        return Err(Error::StateCorrupt(format!(
            "state.db checksum mismatch: recorded {recorded}, actual {actual}"
        )));
    }
    serde_json::from_str(body).map_err(|e| Error::StateCorrupt(format!("state.db unreadable: {e}")))
}

/// Load the installed-set: `state.db` first, `state.db.prev` when the
/// current snapshot is missing or fails its checksum. A missing store
/// is an empty installed-set (first run).
fn load_records(root: &Path) -> Result<Vec<InstalledRecord>> {
    let state_path = root.join(STATE_FILE);
    match fs::read_to_string(&state_path) {
        Ok(text) => match decode_records(&text) {
            Ok(records) => return Ok(records),
            Err(e) => warn!("state.db damaged ({e}), falling back to prior snapshot"),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let prev_path = root.join(PREV_FILE);
    match fs::read_to_string(&prev_path) {
        Ok(text) => {
            let records = decode_records(&text)?;
            warn!(
                "Recovered installed-set from {} ({} package(s))",
                prev_path.display(),
                records.len()
            );
            Ok(records)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Arch, Codec, Manifest, Relation, Scripts};
    use tempfile::tempdir;

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

    #[test]
    fn test_open_empty_store() {
        let dir = tempdir().unwrap();
        let db = StateDb::open(dir.path(), LockMode::Exclusive).unwrap();
        assert!(db.records().is_empty());
    }

    #[test]
    fn test_commit_and_reload() {
        let dir = tempdir().unwrap();
        {
            let mut db = StateDb::open(dir.path(), LockMode::Exclusive).unwrap();
            db.commit(vec![record("hello", "1.0.0")]).unwrap();
        }
        let db = StateDb::open(dir.path(), LockMode::Exclusive).unwrap();
        assert_eq!(db.records().len(), 1);
        assert_eq!(db.get("hello").unwrap().manifest.version, "1.0.0".parse().unwrap());
    }

    #[test]
    fn test_second_exclusive_open_fails() {
        let dir = tempdir().unwrap();
        let _db = StateDb::open(dir.path(), LockMode::Exclusive).unwrap();
        let second = StateDb::open(dir.path(), LockMode::Exclusive);
        assert!(matches!(second, Err(Error::Lock { .. })));
    }

    #[test]
    fn test_shared_readers_coexist() {
        let dir = tempdir().unwrap();
        {
            let mut db = StateDb::open(dir.path(), LockMode::Exclusive).unwrap();
            db.commit(vec![record("hello", "1.0.0")]).unwrap();
        }
        let a = StateDb::open(dir.path(), LockMode::Shared).unwrap();
        let b = StateDb::open(dir.path(), LockMode::Shared).unwrap();
        assert_eq!(a.records().len(), 1);
        assert_eq!(b.records().len(), 1);
    }

    #[test]
    fn test_corrupt_state_falls_back_to_prev() {
        let dir = tempdir().unwrap();
        {
            let mut db = StateDb::open(dir.path(), LockMode::Exclusive).unwrap();
            db.commit(vec![record("hello", "1.0.0")]).unwrap();
            db.commit(vec![record("hello", "1.0.0"), record("lib", "0.5")])
                .unwrap();
        }

        // Flip a byte in the current snapshot.
        let path = dir.path().join(STATE_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0x01;
        fs::write(&path, bytes).unwrap();

        let db = StateDb::open(dir.path(), LockMode::Exclusive).unwrap();
        // The prior snapshot had only hello.
        assert_eq!(db.records().len(), 1);
        assert!(db.get("hello").is_some());
    }

    #[test]
    fn test_indexes_by_name_and_provides() {
        let dir = tempdir().unwrap();
        let mut db = StateDb::open(dir.path(), LockMode::Exclusive).unwrap();
        let mut mta = record("postfix", "3.8.0");
        mta.manifest.provides.push(Relation::new("mail-transport", None));
        db.commit(vec![mta, record("hello", "1.0")]).unwrap();

        assert!(db.get("postfix").is_some());
        assert!(db.get("mail-transport").is_none());
        let providers = db.providers_of("mail-transport");
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name(), "postfix");
        assert_eq!(db.providers_of("hello").len(), 1);
    }

    #[test]
    fn test_owner_of_path() {
        let dir = tempdir().unwrap();
        let mut db = StateDb::open(dir.path(), LockMode::Exclusive).unwrap();
        let mut r = record("hello", "1.0");
        r.files.push(crate::manifest::FileEntry {
            path: "usr/bin/hello".to_string(),
            mode: 0o755,
            owner: "root".to_string(),
            sha256: "11".repeat(32),
            kind: crate::manifest::FileKind::Regular,
            shared: false,
        });
        db.commit(vec![r]).unwrap();

        assert_eq!(db.owner_of("usr/bin/hello").unwrap().name(), "hello");
        assert!(db.owner_of("usr/bin/other").is_none());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let records = vec![record("a", "1.0"), record("b", "2:0.1~rc1")];
        let text = encode_records(&records).unwrap();
        let decoded = decode_records(&text).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_decode_rejects_tampering() {
        let text = encode_records(&[record("a", "1.0")]).unwrap();
        let tampered = text.replace("\"1.0\"", "\"6.6\"");
        assert!(matches!(
            decode_records(&tampered),
            Err(Error::StateCorrupt(_))
        ));
    }
}
