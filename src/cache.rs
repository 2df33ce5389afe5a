// src/cache.rs

//! Content-addressed artifact cache
//!
//! Artifacts live at `<root>/by-hash/<first2>/<rest>` keyed by the
//! SHA-256 of their bytes; collisions are treated as identity. Writers
//! hold an exclusive advisory lock on `<root>/.lock`; readers need no
//! lock because entries only ever appear via atomic rename. Access
//! times feed the LRU pruner from a sidecar journal rather than
//! filesystem atime, which is unreliable on most mounts.

use crate::error::{Error, Result};
use fs4::FileExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

const BY_HASH_DIR: &str = "by-hash";
const JOURNAL_FILE: &str = "access.journal";
const LOCK_FILE: &str = ".lock";

/// Streaming copy buffer size
const COPY_BUF: usize = 64 * 1024;

/// Content-addressed cache with a byte cap
pub struct Cache {
    root: PathBuf,
    max_bytes: u64,
}

/// RAII guard for the writer lock
struct WriteLock {
    file: File,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl Cache {
    /// Open (creating if needed) a cache rooted at `root`
    pub fn open_at(root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(BY_HASH_DIR))?;
        Ok(Self { root, max_bytes })
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// On-disk location of an entry (present or not)
    pub fn entry_path(&self, hash: &str) -> Result<PathBuf> {
        validate_hash(hash)?;
        Ok(self
            .root
            .join(BY_HASH_DIR)
            .join(&hash[..2])
            .join(&hash[2..]))
    }

    /// Whether the entry exists. A stat, nothing more.
    pub fn has(&self, hash: &str) -> bool {
        self.entry_path(hash).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Open an entry for reading, recording the access for the pruner.
    /// Returns `None` on miss.
    pub fn open(&self, hash: &str) -> Result<Option<File>> {
        let path = self.entry_path(hash)?;
        match File::open(&path) {
            Ok(file) => {
                self.record_access(hash);
                Ok(Some(file))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stream `reader` into the cache under `expected_hash`.
    ///
    /// Bytes land in a sibling temp file first; the final name appears
    /// only after the digest matched, via atomic rename. A digest
    /// mismatch removes the temp file and reports both hashes. Returns
    /// the entry size in bytes.
    pub fn insert(&self, mut reader: impl Read, expected_hash: &str) -> Result<u64> {
        let final_path = self.entry_path(expected_hash)?;
        let shard_dir = final_path.parent().expect("entry path has a shard parent");
        fs::create_dir_all(shard_dir)?;

        if final_path.is_file() {
            debug!("Cache already has {expected_hash}");
            self.record_access(expected_hash);
            return Ok(fs::metadata(&final_path)?.len());
        }

        // Stream without the lock so concurrent downloads overlap; only
        // admission and the rename are serialized.
        let mut temp = NamedTempFile::new_in(shard_dir)?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut buf = [0u8; COPY_BUF];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            temp.write_all(&buf[..n])?;
            size += n as u64;
        }

        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected_hash) {
            // Temp file is dropped (deleted) on return.
            return Err(Error::ChecksumMismatch {
                expected: expected_hash.to_string(),
                actual,
            });
        }

        temp.flush()?;
        temp.as_file().sync_all()?;

        let _lock = self.lock_exclusive()?;
        if final_path.is_file() {
            // Another writer beat us to it; identical bytes by construction.
            self.record_access(expected_hash);
            return Ok(size);
        }
        self.admit(size)?;
        temp.persist(&final_path)
            .map_err(|e| Error::Io(e.error))?;

        self.record_access(expected_hash);
        debug!("Cached {expected_hash} ({size} bytes)");
        Ok(size)
    }

    /// Remove a single entry if present
    pub fn remove(&self, hash: &str) -> Result<()> {
        let path = self.entry_path(hash)?;
        let _lock = self.lock_exclusive()?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Make room for `incoming` bytes, evicting if necessary. Fails
    /// with `PolicyDenied` when the entry cannot fit even after
    /// evicting everything evictable.
    fn admit(&self, incoming: u64) -> Result<()> {
        if incoming > self.max_bytes {
            return Err(Error::PolicyDenied(format!(
                "artifact of {incoming} bytes exceeds cache.max_bytes {}",
                self.max_bytes
            )));
        }
        let total = self.total_bytes()?;
        if total + incoming > self.max_bytes {
            self.prune_locked(self.max_bytes - incoming)?;
            let total = self.total_bytes()?;
            if total + incoming > self.max_bytes {
                return Err(Error::PolicyDenied(format!(
                    "cache cannot fit {incoming} bytes under cap {} ({} in use, nothing evictable)",
                    self.max_bytes, total
                )));
            }
        }
        Ok(())
    }

    /// Evict least-recently-accessed entries until total ≤ `target_bytes`
    pub fn prune(&self, target_bytes: u64) -> Result<u64> {
        let _lock = self.lock_exclusive()?;
        self.prune_locked(target_bytes)
    }

    fn prune_locked(&self, target_bytes: u64) -> Result<u64> {
        let mut entries = self.list_entries()?;
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= target_bytes {
            return Ok(0);
        }

        let accesses = self.load_journal();
        // Unknown entries have no recorded access and go first.
        entries.sort_by_key(|e| accesses.get(&e.hash).copied().unwrap_or(0));

        let mut evicted: u64 = 0;
        for entry in &entries {
            if total <= target_bytes {
                break;
            }
            fs::remove_file(&entry.path)?;
            total -= entry.size;
            evicted += entry.size;
            debug!("Evicted {} ({} bytes)", entry.hash, entry.size);
        }

        self.compact_journal(&accesses)?;
        info!("Pruned cache by {evicted} bytes to {total}");
        Ok(evicted)
    }

    /// Sum of entry sizes currently on disk
    pub fn total_bytes(&self) -> Result<u64> {
        Ok(self.list_entries()?.iter().map(|e| e.size).sum())
    }

    fn list_entries(&self) -> Result<Vec<EntryInfo>> {
        let mut entries = Vec::new();
        let by_hash = self.root.join(BY_HASH_DIR);
        for shard in fs::read_dir(&by_hash)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().into_owned();
            for file in fs::read_dir(shard.path())? {
                let file = file?;
                let meta = file.metadata()?;
                if !meta.is_file() {
                    continue;
                }
                let rest = file.file_name().to_string_lossy().into_owned();
                // Skip in-flight temp files.
                if rest.len() != 62 {
                    continue;
                }
                entries.push(EntryInfo {
                    hash: format!("{prefix}{rest}"),
                    path: file.path(),
                    size: meta.len(),
                });
            }
        }
        Ok(entries)
    }

    fn lock_exclusive(&self) -> Result<WriteLock> {
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.lock_exclusive().map_err(|e| Error::Lock {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(WriteLock { file })
    }

    /// Append an access record. Best-effort: a lost journal line only
    /// skews eviction order, never correctness.
    fn record_access(&self, hash: &str) {
        let now = unix_now();
        let line = format!("{hash} {now}\n");
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(JOURNAL_FILE))
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!("Failed to journal cache access for {hash}: {e}");
        }
    }

    /// Latest access time per hash
    fn load_journal(&self) -> HashMap<String, u64> {
        let mut accesses = HashMap::new();
        let Ok(file) = File::open(self.root.join(JOURNAL_FILE)) else {
            return accesses;
        };
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            if let Some((hash, ts)) = line.split_once(' ') {
                if let Ok(ts) = ts.parse::<u64>() {
                    accesses.insert(hash.to_string(), ts);
                }
            }
        }
        accesses
    }

    /// Rewrite the journal to one line per surviving entry
    fn compact_journal(&self, accesses: &HashMap<String, u64>) -> Result<()> {
        let mut lines = String::new();
        for entry in self.list_entries()? {
            let ts = accesses.get(&entry.hash).copied().unwrap_or(0);
            lines.push_str(&format!("{} {}\n", entry.hash, ts));
        }
        let temp = self.root.join(format!("{JOURNAL_FILE}.tmp"));
        fs::write(&temp, lines)?;
        fs::rename(&temp, self.root.join(JOURNAL_FILE))?;
        Ok(())
    }
}

struct EntryInfo {
    hash: String,
    path: PathBuf,
    size: u64,
}

fn validate_hash(hash: &str) -> Result<()> {
    if hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(Error::Parse(format!("invalid content hash: {hash:?}")))
    }
}

/// Compute the lowercase-hex SHA-256 of a reader
pub fn sha256_hex(mut reader: impl Read) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; COPY_BUF];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute the lowercase-hex SHA-256 of a file on disk
pub fn sha256_file(path: &Path) -> Result<String> {
    sha256_hex(File::open(path)?)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
