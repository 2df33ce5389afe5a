// src/transaction.rs

//! Transaction engine
//!
//! Drives a resolver [`Plan`] through the phase machine:
//!
//! ```text
//! pending ──► downloading ──► verifying ──► staging ──► committing ──► completed
//!                                 │              │            │
//!                                 ▼              ▼            ▼
//!                              failed         failed     rolled_back
//! ```
//!
//! Every file mutation of the Committing phase is journaled to the
//! transaction log before the next one starts, which makes rollback
//! and crash recovery pure log replays. Failures before Committing
//! leave the live prefix untouched and mark the transaction `failed`;
//! failures during Committing undo the journaled operations in reverse
//! and mark it `rolled_back`. Lifecycle scripts run only on the
//! forward path, never during rollback.

use crate::cache::sha256_file;
use crate::context::Context;
use crate::error::{ConflictKind, Error, Result};
use crate::fetch::FetchJob;
use crate::manifest::{FileKind, Manifest};
use crate::resolver::{Plan, Step};
use crate::scripts::{self, ScriptKind};
use crate::signature;
use crate::state::records::{check_invariants, InstalledRecord};
use crate::state::txlog::{
    self, FileOp, ParsedLog, TxnEvent, TxnKind, TxnLog, TxnStatus,
};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const STAGING_DIR: &str = "staging";
const BACKUP_DIR: &str = ".backup";
/// Suffix a new config file gets when the on-disk one carries user edits
const CONFIG_NEW_SUFFIX: &str = ".strata-new";

/// Outcome of a driven transaction
#[derive(Debug)]
pub struct TxnOutcome {
    pub id: String,
    pub status: TxnStatus,
    pub installed: usize,
    pub removed: usize,
}

/// Execute `plan` as one atomic transaction
pub fn execute(ctx: &mut Context, kind: TxnKind, plan: &Plan) -> Result<TxnOutcome> {
    if plan.is_empty() {
        return Ok(TxnOutcome {
            id: String::new(),
            status: TxnStatus::Completed,
            installed: 0,
            removed: 0,
        });
    }

    let id = next_txn_id();
    let staging = ctx.state.root().join(STAGING_DIR).join(&id);
    fs::create_dir_all(staging.join(BACKUP_DIR))?;

    let mut log = TxnLog::create(&ctx.state.transactions_dir(), &id)?;
    log.append(&TxnEvent::Started {
        id: id.clone(),
        kind,
        targets: describe_targets(plan),
        time: now(),
    })?;
    info!("Transaction {id} started");

    let deadline = match ctx.config.download.transaction_timeout_seconds {
        0 => None,
        secs => Some(Instant::now() + Duration::from_secs(secs)),
    };

    let mut driver = Driver {
        ctx,
        log,
        id: id.clone(),
        staging: staging.clone(),
        deadline,
    };

    match driver.run(plan) {
        Ok(outcome) => {
            let _ = fs::remove_dir_all(&staging);
            driver.prune_cache_if_over_cap();
            info!(
                "Transaction {id} completed: {} installed, {} removed",
                outcome.installed, outcome.removed
            );
            Ok(outcome)
        }
        Err(RunError {
            error,
            rolled_back,
        }) => {
            let status = if rolled_back {
                TxnStatus::RolledBack
            } else {
                TxnStatus::Failed
            };
            driver
                .log
                .append(&TxnEvent::Finished {
                    status,
                    time: now(),
                    error: Some(error.to_string()),
                })
                .unwrap_or_else(|e| warn!("Failed to seal transaction log: {e}"));
            let _ = fs::remove_dir_all(&staging);
            warn!("Transaction {id} {status}: {error}");
            Err(error)
        }
    }
}

/// Internal failure wrapper distinguishing "live prefix untouched"
/// from "mutations undone"
struct RunError {
    error: Error,
    rolled_back: bool,
}

impl RunError {
    fn failed(error: Error) -> Self {
        Self {
            error,
            rolled_back: false,
        }
    }
}

struct StagedPackage {
    manifest: Manifest,
    explicit: bool,
    files_root: PathBuf,
}

struct Driver<'a> {
    ctx: &'a mut Context,
    log: TxnLog,
    id: String,
    staging: PathBuf,
    deadline: Option<Instant>,
}

impl Driver<'_> {
    fn run(&mut self, plan: &Plan) -> std::result::Result<TxnOutcome, RunError> {
        self.phase(TxnStatus::Downloading).map_err(RunError::failed)?;
        self.download(plan).map_err(RunError::failed)?;

        self.phase(TxnStatus::Verifying).map_err(RunError::failed)?;
        self.verify(plan).map_err(RunError::failed)?;

        self.phase(TxnStatus::Staging).map_err(RunError::failed)?;
        let staged = self.stage(plan).map_err(RunError::failed)?;

        self.phase(TxnStatus::Committing).map_err(RunError::failed)?;
        let (ops, removal_op_count, new_records) = self
            .build_commit_plan(plan, &staged)
            .map_err(RunError::failed)?;
        self.log
            .append(&TxnEvent::CommitPlan {
                ops: ops.clone(),
                new_records: new_records.clone(),
            })
            .map_err(RunError::failed)?;

        let mut done: Vec<usize> = Vec::new();
        match self.commit(plan, &staged, &ops, removal_op_count, &mut done, &new_records) {
            Ok(()) => {
                self.log
                    .append(&TxnEvent::Finished {
                        status: TxnStatus::Completed,
                        time: now(),
                        error: None,
                    })
                    .map_err(RunError::failed)?;
                Ok(TxnOutcome {
                    id: self.id.clone(),
                    status: TxnStatus::Completed,
                    installed: staged.len(),
                    removed: plan.removals().count(),
                })
            }
            Err(error) => {
                warn!("Commit of {} failed ({error}), rolling back", self.id);
                if let Err(undo) = rollback_ops(&ops, &done) {
                    // The log still holds the truth; recovery finishes
                    // the job on next startup.
                    warn!("Rollback incomplete: {undo}");
                }
                Err(RunError {
                    error,
                    rolled_back: true,
                })
            }
        }
    }

    fn phase(&mut self, status: TxnStatus) -> Result<()> {
        self.check_deadline()?;
        debug!("Transaction {} entering {status}", self.id);
        self.log.append(&TxnEvent::Status {
            status,
            time: now(),
        })
    }

    fn check_deadline(&self) -> Result<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(Error::Download {
                    url: String::new(),
                    reason: format!("transaction {} exceeded its deadline", self.id),
                });
            }
        }
        Ok(())
    }

    fn download(&mut self, plan: &Plan) -> Result<()> {
        let mut jobs = Vec::new();
        for step in &plan.steps {
            if let Step::FetchAndInstall {
                manifest, repo_id, ..
            } = step
            {
                if self.ctx.cache.has(&manifest.download_checksum) {
                    continue;
                }
                jobs.push(FetchJob {
                    url: self.ctx.repos.artifact_url(repo_id, manifest)?,
                    checksum: manifest.download_checksum.clone(),
                });
            }
        }
        self.ctx.fetcher.fetch_into_cache(&jobs, &self.ctx.cache)
    }

    /// Re-verify manifest signatures against the pinned repository
    /// keys and confirm every artifact is in cache.
    fn verify(&mut self, plan: &Plan) -> Result<()> {
        use rayon::prelude::*;

        let require_signatures = self.ctx.config.security.require_signatures;
        let checks: Vec<(&Manifest, &str)> = plan
            .steps
            .iter()
            .filter_map(|s| match s {
                Step::FetchAndInstall {
                    manifest, repo_id, ..
                } => Some((manifest, repo_id.as_str())),
                _ => None,
            })
            .collect();

        if require_signatures {
            let repos = &self.ctx.repos;
            // Pure CPU work, spread over the global pool.
            checks.par_iter().try_for_each(|(manifest, repo_id)| {
                let key = repos.signing_key(repo_id).ok_or_else(|| {
                    Error::SignatureInvalid {
                        origin: manifest.id().to_string(),
                        reason: format!("repository {repo_id} has no signing key on record"),
                    }
                })?;
                let pinned = repos
                    .repo_config(repo_id)
                    .map(|c| c.signing_key_fingerprint.clone())
                    .unwrap_or_default();
                let actual = signature::fingerprint(&key);
                if !actual.eq_ignore_ascii_case(&pinned) {
                    return Err(Error::SignatureInvalid {
                        origin: manifest.id().to_string(),
                        reason: format!(
                            "repository {repo_id} key {actual} does not match pinned {pinned}"
                        ),
                    });
                }
                crate::repository::index::verify_manifest(manifest, &key)
            })?;
        }

        for (manifest, _) in &checks {
            if !self.ctx.cache.has(&manifest.download_checksum) {
                return Err(Error::ChecksumMismatch {
                    expected: manifest.download_checksum.clone(),
                    actual: "<absent from cache>".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Extract artifacts, verify payload checksums against the
    /// manifest, reject collisions, and run pre-install scripts
    /// against the staged trees.
    fn stage(&mut self, plan: &Plan) -> Result<Vec<StagedPackage>> {
        let mut staged = Vec::new();
        for step in &plan.steps {
            let Step::FetchAndInstall {
                manifest, explicit, ..
            } = step
            else {
                continue;
            };

            let artifact = self.ctx.cache.entry_path(&manifest.download_checksum)?;
            let dest = self.staging.join("pkg").join(&manifest.name);
            let extracted = crate::archive::extract_artifact(&artifact, manifest.codec, &dest)?;

            if extracted.manifest.payload_digest()? != manifest.payload_digest()? {
                return Err(Error::ChecksumMismatch {
                    expected: manifest.payload_digest()?,
                    actual: extracted.manifest.payload_digest()?,
                });
            }

            for file in &manifest.files {
                if !matches!(file.kind, FileKind::Regular | FileKind::Config) {
                    continue;
                }
                let on_disk = extracted.files_root.join(&file.path);
                if !on_disk.is_file() {
                    return Err(Error::Parse(format!(
                        "artifact of {} is missing payload file {}",
                        manifest.id(),
                        file.path
                    )));
                }
                if !file.sha256.is_empty() {
                    let actual = sha256_file(&on_disk)?;
                    if actual != file.sha256 {
                        return Err(Error::ChecksumMismatch {
                            expected: file.sha256.clone(),
                            actual,
                        });
                    }
                }
            }

            staged.push(StagedPackage {
                manifest: manifest.clone(),
                explicit: *explicit,
                files_root: extracted.files_root,
            });
        }

        self.check_collisions(plan, &staged)?;

        for pkg in &staged {
            scripts::run(
                ScriptKind::PreInstall,
                &pkg.manifest,
                &pkg.manifest.files,
                &pkg.files_root,
                &self.id,
            )?;
        }

        Ok(staged)
    }

    /// Union file list over pending packages, plus the kept
    /// installed-set. Shared paths must be declared on both sides.
    fn check_collisions(&self, plan: &Plan, staged: &[StagedPackage]) -> Result<()> {
        let leaving: HashSet<&str> = plan
            .removals()
            .map(|id| id.name.as_str())
            .chain(staged.iter().map(|p| p.manifest.name.as_str()))
            .collect();

        let mut owners: BTreeMap<&str, (&str, bool)> = BTreeMap::new();
        for record in self.ctx.state.records() {
            if leaving.contains(record.name()) {
                continue;
            }
            for file in &record.files {
                owners.insert(&file.path, (record.name(), file.shared));
            }
        }

        for pkg in staged {
            for file in &pkg.manifest.files {
                if let Some((owner, owner_shared)) = owners.get(file.path.as_str()) {
                    if !(file.shared && *owner_shared) {
                        return Err(Error::Conflict(ConflictKind::FileCollision {
                            path: file.path.clone(),
                            first: owner.to_string(),
                            second: pkg.manifest.id().to_string(),
                        }));
                    }
                } else {
                    owners.insert(&file.path, (&pkg.manifest.name, file.shared));
                }
            }
        }
        Ok(())
    }

    /// Compute the journaled file operations and the installed-set
    /// that will hold after them.
    fn build_commit_plan(
        &self,
        plan: &Plan,
        staged: &[StagedPackage],
    ) -> Result<(Vec<FileOp>, usize, Vec<InstalledRecord>)> {
        let mut ops = Vec::new();
        let mut backup_seq = 0usize;
        let mut next_backup = |seq: &mut usize| -> PathBuf {
            let path = self.staging.join(BACKUP_DIR).join(seq.to_string());
            *seq += 1;
            path
        };

        let incoming_paths: HashSet<&str> = staged
            .iter()
            .flat_map(|p| p.manifest.files.iter().map(|f| f.path.as_str()))
            .collect();

        // Removal deletes. Files also owned by an incoming package stay
        // put; the Place op will overwrite them with a backup.
        for id in plan.removals() {
            let record = self.ctx.state.get(&id.name).ok_or_else(|| {
                Error::StateCorrupt(format!("plan removes {id}, which is not installed"))
            })?;
            for file in record.files.iter().rev() {
                if matches!(file.kind, FileKind::Directory) {
                    continue;
                }
                if incoming_paths.contains(file.path.as_str()) {
                    continue;
                }
                ops.push(FileOp::Delete {
                    package: record.name().to_string(),
                    dest: self.ctx.prefix.join(&file.path),
                    backup: next_backup(&mut backup_seq),
                });
            }
        }
        let removal_op_count = ops.len();

        // Upgrade leftovers: files of the outgoing same-name version
        // that the incoming version no longer ships.
        for pkg in staged {
            if let Some(old) = self.ctx.state.get(&pkg.manifest.name) {
                for file in old.files.iter().rev() {
                    if matches!(file.kind, FileKind::Directory) {
                        continue;
                    }
                    if incoming_paths.contains(file.path.as_str()) {
                        continue;
                    }
                    ops.push(FileOp::Delete {
                        package: old.name().to_string(),
                        dest: self.ctx.prefix.join(&file.path),
                        backup: next_backup(&mut backup_seq),
                    });
                }
            }
        }

        // Placements, in manifest file order.
        for pkg in staged {
            let old = self.ctx.state.get(&pkg.manifest.name);
            for file in &pkg.manifest.files {
                if matches!(file.kind, FileKind::Directory) {
                    continue;
                }
                let mut dest = self.ctx.prefix.join(&file.path);
                if matches!(file.kind, FileKind::Config) {
                    if let Some(old) = old {
                        if config_user_edited(&dest, old, &file.path)? {
                            // Preserve the user's file; park the new
                            // one beside it.
                            dest = self
                                .ctx
                                .prefix
                                .join(format!("{}{CONFIG_NEW_SUFFIX}", file.path));
                        }
                    }
                }
                let backup = dest.exists().then(|| next_backup(&mut backup_seq));
                ops.push(FileOp::Place {
                    package: pkg.manifest.name.clone(),
                    source: pkg.files_root.join(&file.path),
                    dest,
                    backup,
                });
            }
        }

        // The installed-set after this transaction.
        let removed: HashSet<&str> = plan.removals().map(|id| id.name.as_str()).collect();
        let replaced: HashSet<&str> = staged.iter().map(|p| p.manifest.name.as_str()).collect();
        let mut new_records: Vec<InstalledRecord> = self
            .ctx
            .state
            .records()
            .iter()
            .filter(|r| !removed.contains(r.name()) && !replaced.contains(r.name()))
            .cloned()
            .collect();
        for pkg in staged {
            let explicit = pkg.explicit
                || self
                    .ctx
                    .state
                    .get(&pkg.manifest.name)
                    .is_some_and(|old| old.explicit);
            new_records.push(InstalledRecord {
                manifest: pkg.manifest.clone(),
                installed_at: now(),
                explicit,
                files: pkg.manifest.files.clone(),
            });
        }
        new_records.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));

        check_invariants(&new_records)?;
        Ok((ops, removal_op_count, new_records))
    }

    fn commit(
        &mut self,
        plan: &Plan,
        staged: &[StagedPackage],
        ops: &[FileOp],
        removal_op_count: usize,
        done: &mut Vec<usize>,
        new_records: &[InstalledRecord],
    ) -> Result<()> {
        self.check_deadline()?;

        // Pre-remove scripts, from the outgoing records' manifests.
        for id in plan.removals() {
            if let Some(record) = self.ctx.state.get(&id.name) {
                scripts::run(
                    ScriptKind::PreRemove,
                    &record.manifest,
                    &record.files,
                    &self.ctx.prefix,
                    &self.id,
                )?;
            }
        }

        for (i, op) in ops.iter().enumerate().take(removal_op_count) {
            exec_op(op)?;
            self.log.append(&TxnEvent::FileOpDone { index: i })?;
            done.push(i);
        }

        for id in plan.removals() {
            if let Some(record) = self.ctx.state.get(&id.name) {
                scripts::run(
                    ScriptKind::PostRemove,
                    &record.manifest,
                    &record.files,
                    &self.ctx.prefix,
                    &self.id,
                )?;
            }
        }

        // Directories are not journaled; creating them is idempotent.
        for pkg in staged {
            for file in &pkg.manifest.files {
                if matches!(file.kind, FileKind::Directory) {
                    fs::create_dir_all(self.ctx.prefix.join(&file.path))?;
                }
            }
        }

        for (i, op) in ops.iter().enumerate().skip(removal_op_count) {
            exec_op(op)?;
            self.log.append(&TxnEvent::FileOpDone { index: i })?;
            done.push(i);
        }

        // Directories emptied by the deletes go away too; best effort,
        // never journaled.
        for op in ops {
            if let FileOp::Delete { dest, .. } = op {
                remove_empty_parents(&self.ctx.prefix, dest);
            }
        }

        for pkg in staged {
            scripts::run(
                ScriptKind::PostInstall,
                &pkg.manifest,
                &pkg.manifest.files,
                &self.ctx.prefix,
                &self.id,
            )?;
        }
        for step in &plan.steps {
            if let Step::Reconfigure { id } = step {
                if let Some(pkg) = staged.iter().find(|p| p.manifest.name == id.name) {
                    scripts::run(
                        ScriptKind::Configure,
                        &pkg.manifest,
                        &pkg.manifest.files,
                        &self.ctx.prefix,
                        &self.id,
                    )?;
                }
            }
        }

        // Single commit point: the log is already flushed, now the
        // installed-set flips atomically.
        self.ctx.state.commit(new_records.to_vec())
    }

    fn prune_cache_if_over_cap(&self) {
        let cap = self.ctx.cache.max_bytes();
        match self.ctx.cache.total_bytes() {
            Ok(total) if total > cap => {
                if let Err(e) = self.ctx.cache.prune(cap) {
                    warn!("Cache prune failed: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Cache size check failed: {e}"),
        }
    }
}

/// Whether the on-disk config file differs from the checksum recorded
/// at install time (a user edit we must preserve)
fn config_user_edited(dest: &Path, old: &InstalledRecord, rel_path: &str) -> Result<bool> {
    if !dest.is_file() {
        return Ok(false);
    }
    let Some(recorded) = old.files.iter().find(|f| f.path == rel_path) else {
        return Ok(false);
    };
    if recorded.sha256.is_empty() {
        return Ok(false);
    }
    Ok(sha256_file(dest)? != recorded.sha256)
}

/// Execute one journaled operation. Idempotent under replay.
fn exec_op(op: &FileOp) -> Result<()> {
    match op {
        FileOp::Place {
            source,
            dest,
            backup,
            ..
        } => {
            if !source.exists() {
                // Replay of an op that already ran.
                return Ok(());
            }
            if let Some(backup) = backup {
                if dest.exists() && !backup.exists() {
                    move_file(dest, backup)?;
                }
            }
            move_file(source, dest)
        }
        FileOp::Delete { dest, backup, .. } => {
            if dest.exists() {
                move_file(dest, backup)?;
            }
            Ok(())
        }
    }
}

/// Undo completed operations in reverse order. Restores file state
/// only; scripts are not re-run.
fn rollback_ops(ops: &[FileOp], done: &[usize]) -> Result<()> {
    for &i in done.iter().rev() {
        match &ops[i] {
            FileOp::Place {
                source,
                dest,
                backup,
                ..
            } => {
                if dest.exists() {
                    move_file(dest, source)?;
                }
                if let Some(backup) = backup {
                    if backup.exists() {
                        move_file(backup, dest)?;
                    }
                }
            }
            FileOp::Delete { dest, backup, .. } => {
                if backup.exists() {
                    move_file(backup, dest)?;
                }
            }
        }
    }
    Ok(())
}

/// Walk up from `path`, removing directories as long as they are empty
/// and inside the prefix
fn remove_empty_parents(prefix: &Path, path: &Path) {
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == prefix || !d.starts_with(prefix) {
            break;
        }
        if fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}

/// Rename, falling back to copy-fsync-rename across filesystems
fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        // EXDEV: destination lives on another filesystem.
        Err(e) if e.raw_os_error() == Some(18) => {
            let tmp = dst.with_extension("strata-tmp");
            fs::copy(src, &tmp)?;
            fs::File::open(&tmp)?.sync_all()?;
            fs::rename(&tmp, dst)?;
            fs::remove_file(src)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Finish whatever the previous process left behind. Called once at
/// startup while holding the exclusive lock.
pub fn recover_pending(ctx: &mut Context) -> Result<()> {
    let transactions_dir = ctx.state.transactions_dir();
    let Some(parsed) = txlog::latest_transaction(&transactions_dir)? else {
        return Ok(());
    };
    let staging = ctx.state.root().join(STAGING_DIR).join(&parsed.record.id);

    if parsed.record.status.is_terminal() {
        // Normal startup; clear any staging leftovers just in case.
        let _ = fs::remove_dir_all(&staging);
        return Ok(());
    }

    warn!(
        "Recovering transaction {} found in state {}",
        parsed.record.id, parsed.record.status
    );
    let mut log = TxnLog::reopen(&parsed.record.log_path)?;

    match &parsed {
        ParsedLog {
            record,
            commit_plan: Some((ops, new_records)),
            ops_done,
        } if record.status == TxnStatus::Committing => {
            // Mid-commit: every journaled op is idempotent, so replay
            // the ones not recorded as done and finish the commit.
            let done: HashSet<usize> = ops_done.iter().copied().collect();
            for (i, op) in ops.iter().enumerate() {
                if done.contains(&i) {
                    continue;
                }
                exec_op(op)?;
                log.append(&TxnEvent::FileOpDone { index: i })?;
            }
            ctx.state.commit(new_records.clone())?;
            log.append(&TxnEvent::Finished {
                status: TxnStatus::Completed,
                time: now(),
                error: None,
            })?;
            info!("Transaction {} replayed to completion", parsed.record.id);
        }
        _ => {
            // Died before any live mutation: nothing to undo beyond
            // dropping the staging directory.
            log.append(&TxnEvent::Finished {
                status: TxnStatus::RolledBack,
                time: now(),
                error: Some("interrupted before commit".to_string()),
            })?;
            info!("Transaction {} rolled back", parsed.record.id);
        }
    }

    let _ = fs::remove_dir_all(&staging);
    Ok(())
}

fn describe_targets(plan: &Plan) -> Vec<String> {
    plan.steps
        .iter()
        .map(|step| match step {
            Step::FetchAndInstall { manifest, .. } => format!("install {}", manifest.id()),
            Step::Remove { id } => format!("remove {id}"),
            Step::Reconfigure { id } => format!("configure {id}"),
        })
        .collect()
}

fn next_txn_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("txn-{millis:013}-{}", std::process::id())
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}
