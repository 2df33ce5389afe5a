// src/state/txlog.rs

//! Append-only transaction logs
//!
//! Every transaction writes one event stream at
//! `<state>/transactions/<txn_id>.log`, one JSON object per line, each
//! line fsynced before the filesystem mutation it licenses. The log is
//! the source of truth for rollback and for crash recovery: replaying
//! it tells exactly which file operations had completed when the
//! process died.

use crate::error::{Error, Result};
use crate::state::records::InstalledRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// What a transaction set out to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnKind {
    Install,
    Remove,
    Upgrade,
}

/// Transaction lifecycle states. Monotone: once terminal, immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnStatus {
    Pending,
    Downloading,
    Verifying,
    Staging,
    Committing,
    Completed,
    RolledBack,
    Failed,
}

impl TxnStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxnStatus::Completed | TxnStatus::RolledBack | TxnStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxnStatus::Pending => "pending",
            TxnStatus::Downloading => "downloading",
            TxnStatus::Verifying => "verifying",
            TxnStatus::Staging => "staging",
            TxnStatus::Committing => "committing",
            TxnStatus::Completed => "completed",
            TxnStatus::RolledBack => "rolled_back",
            TxnStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxnStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TxnStatus::Pending),
            "downloading" => Ok(TxnStatus::Downloading),
            "verifying" => Ok(TxnStatus::Verifying),
            "staging" => Ok(TxnStatus::Staging),
            "committing" => Ok(TxnStatus::Committing),
            "completed" => Ok(TxnStatus::Completed),
            "rolled_back" => Ok(TxnStatus::RolledBack),
            "failed" => Ok(TxnStatus::Failed),
            _ => Err(Error::Parse(format!("invalid transaction status: {s}"))),
        }
    }
}

/// One journaled file operation of the Committing phase.
///
/// Each op is idempotent under replay: `Place` with a missing source
/// and an existing destination already happened; `Delete` with a
/// missing destination already happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOp {
    /// Move a staged file into the live prefix. `backup` is where a
    /// displaced prior file goes (upgrade case), pre-assigned so
    /// rollback and replay agree on it.
    Place {
        package: String,
        source: PathBuf,
        dest: PathBuf,
        backup: Option<PathBuf>,
    },
    /// Remove a file owned by an outgoing package, preserving it at
    /// `backup` until the transaction seals.
    Delete {
        package: String,
        dest: PathBuf,
        backup: PathBuf,
    },
}

/// One line of the transaction log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TxnEvent {
    Started {
        id: String,
        kind: TxnKind,
        targets: Vec<String>,
        time: String,
    },
    Status {
        status: TxnStatus,
        time: String,
    },
    /// Written at the committing boundary: the full set of planned
    /// file operations and the installed-set that will hold after
    /// them. Everything recovery needs.
    CommitPlan {
        ops: Vec<FileOp>,
        new_records: Vec<InstalledRecord>,
    },
    /// Op `index` of the commit plan completed
    FileOpDone {
        index: usize,
    },
    Finished {
        status: TxnStatus,
        time: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Append-only writer for one transaction's log
pub struct TxnLog {
    path: PathBuf,
    file: File,
}

impl TxnLog {
    /// Create the log for a new transaction
    pub fn create(transactions_dir: &Path, txn_id: &str) -> Result<Self> {
        fs::create_dir_all(transactions_dir)?;
        let path = transactions_dir.join(format!("{txn_id}.log"));
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        sync_dir(transactions_dir)?;
        Ok(Self { path, file })
    }

    /// Re-open an existing log for appending (crash recovery)
    pub fn reopen(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event and fsync before returning. The mutation the
    /// event licenses must not start until this returns.
    pub fn append(&mut self, event: &TxnEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)
            .map_err(|e| Error::Parse(format!("event encode failed: {e}")))?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Summary view of one transaction, reconstructed from its log
#[derive(Debug, Clone)]
pub struct TxnRecord {
    pub id: String,
    pub kind: TxnKind,
    pub status: TxnStatus,
    pub start_time: String,
    pub end_time: Option<String>,
    pub targets: Vec<String>,
    pub error: Option<String>,
    pub log_path: PathBuf,
}

/// Fully parsed log, for recovery
#[derive(Debug)]
pub struct ParsedLog {
    pub record: TxnRecord,
    pub commit_plan: Option<(Vec<FileOp>, Vec<InstalledRecord>)>,
    pub ops_done: Vec<usize>,
}

/// Read one transaction log. Unparsable trailing lines (torn write at
/// crash) are ignored; everything before them stands.
pub fn read_log(path: &Path) -> Result<ParsedLog> {
    let file = File::open(path)?;
    let mut record: Option<TxnRecord> = None;
    let mut commit_plan = None;
    let mut ops_done = Vec::new();

    for line in BufReader::new(file).lines() {
        let line = line?;
        let event: TxnEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(_) => break,
        };
        match event {
            TxnEvent::Started {
                id,
                kind,
                targets,
                time,
            } => {
                record = Some(TxnRecord {
                    id,
                    kind,
                    status: TxnStatus::Pending,
                    start_time: time,
                    end_time: None,
                    targets,
                    error: None,
                    log_path: path.to_path_buf(),
                });
            }
            TxnEvent::Status { status, .. } => {
                if let Some(r) = record.as_mut() {
                    r.status = status;
                }
            }
            TxnEvent::CommitPlan { ops, new_records } => {
                commit_plan = Some((ops, new_records));
            }
            TxnEvent::FileOpDone { index } => ops_done.push(index),
            TxnEvent::Finished {
                status,
                time,
                error,
            } => {
                if let Some(r) = record.as_mut() {
                    r.status = status;
                    r.end_time = Some(time);
                    r.error = error;
                }
            }
        }
    }

    let record = record.ok_or_else(|| {
        Error::StateCorrupt(format!("transaction log {} has no start event", path.display()))
    })?;
    Ok(ParsedLog {
        record,
        commit_plan,
        ops_done,
    })
}

/// All transactions in the directory, oldest first. Ids sort
/// chronologically by construction.
pub fn list_transactions(transactions_dir: &Path) -> Result<Vec<TxnRecord>> {
    let mut records = Vec::new();
    let entries = match fs::read_dir(transactions_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
        Err(e) => return Err(e.into()),
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .collect();
    paths.sort();
    for path in paths {
        match read_log(&path) {
            Ok(parsed) => records.push(parsed.record),
            Err(e) => debug!("Skipping unreadable transaction log {}: {e}", path.display()),
        }
    }
    Ok(records)
}

/// The most recent transaction, if any
pub fn latest_transaction(transactions_dir: &Path) -> Result<Option<ParsedLog>> {
    let mut records = list_transactions(transactions_dir)?;
    match records.pop() {
        Some(record) => Ok(Some(read_log(&record.log_path)?)),
        None => Ok(None),
    }
}

pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}
