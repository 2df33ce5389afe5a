// src/repository/mod.rs

//! Repository management: refresh, snapshots, and candidate queries
//!
//! Each configured repository publishes a signed catalog at
//! `<base_url>/INDEX`. A verified catalog becomes an on-disk snapshot
//! at `<state>/indexes/<repo_id>.idx`, replaced atomically on refresh;
//! a failed refresh always preserves the prior snapshot. Queries run
//! against the snapshots only, so a repository being unreachable never
//! blocks candidate selection.

pub mod index;

use crate::config::{Config, RepoConfig, SecurityConfig};
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::manifest::{Arch, Manifest};
use crate::signature::PUBLIC_KEY_LEN;
use crate::version::Constraint;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// A parsed catalog with its provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub repo_id: String,
    /// RFC 3339 fetch timestamp
    pub fetched_at: String,
    /// Hex-encoded Ed25519 key the catalog was signed with, empty if
    /// the repository is unsigned
    #[serde(default)]
    pub public_key: String,
    pub manifests: Vec<Manifest>,
}

impl IndexSnapshot {
    /// Age of the snapshot in seconds; `None` when the timestamp is
    /// unparsable (treated as stale by callers).
    pub fn age_seconds(&self) -> Option<u64> {
        let fetched = chrono::DateTime::parse_from_rfc3339(&self.fetched_at).ok()?;
        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs() as i64;
        Some(now.saturating_sub(fetched.timestamp()).max(0) as u64)
    }

    pub fn signing_key(&self) -> Option<[u8; PUBLIC_KEY_LEN]> {
        let bytes = hex::decode(&self.public_key).ok()?;
        bytes.try_into().ok()
    }
}

/// One candidate manifest annotated with its repository's standing
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub manifest: &'a Manifest,
    pub repo_id: &'a str,
    pub priority: i32,
    pub trusted: bool,
}

struct Repo {
    id: String,
    config: RepoConfig,
    snapshot: Option<IndexSnapshot>,
}

/// The set of enabled repositories and their loaded snapshots
pub struct RepoSet {
    indexes_dir: PathBuf,
    security: SecurityConfig,
    repos: Vec<Repo>,
}

impl RepoSet {
    /// Load snapshots for every enabled repository. Missing snapshots
    /// are fine; they appear after the first `refresh`.
    pub fn load(state_root: &Path, config: &Config) -> Result<Self> {
        let indexes_dir = state_root.join("indexes");
        fs::create_dir_all(&indexes_dir)?;

        let mut repos = Vec::new();
        for (id, repo_config) in config.enabled_repositories() {
            let snapshot = read_snapshot(&indexes_dir, id)?;
            repos.push(Repo {
                id: id.to_string(),
                config: repo_config.clone(),
                snapshot,
            });
        }
        Ok(Self {
            indexes_dir,
            security: config.security.clone(),
            repos,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }

    pub fn repo_config(&self, repo_id: &str) -> Option<&RepoConfig> {
        self.repos.iter().find(|r| r.id == repo_id).map(|r| &r.config)
    }

    /// The key a repository's current snapshot was signed with
    pub fn signing_key(&self, repo_id: &str) -> Option<[u8; PUBLIC_KEY_LEN]> {
        self.repos
            .iter()
            .find(|r| r.id == repo_id)
            .and_then(|r| r.snapshot.as_ref())
            .and_then(|s| s.signing_key())
    }

    /// Absolute download URL of a manifest's artifact
    pub fn artifact_url(&self, repo_id: &str, manifest: &Manifest) -> Result<String> {
        let repo = self
            .repo_config(repo_id)
            .ok_or_else(|| Error::Parse(format!("unknown repository: {repo_id}")))?;
        Ok(format!(
            "{}/{}",
            repo.url.trim_end_matches('/'),
            manifest.id().pool_path()
        ))
    }

    /// Refresh every enabled repository. All repositories are
    /// attempted; the first failure is reported after the sweep so one
    /// dead mirror cannot shadow the rest.
    pub fn refresh_all(&mut self, fetcher: &Fetcher) -> Result<usize> {
        let mut refreshed = 0;
        let mut first_error = None;
        for i in 0..self.repos.len() {
            match self.refresh_one(i, fetcher) {
                Ok(()) => refreshed += 1,
                Err(e) => {
                    warn!("Refresh of repository {} failed: {e}", self.repos[i].id);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(refreshed),
        }
    }

    /// Opportunistically refresh snapshots older than their TTL.
    /// Failures are logged and the stale snapshot stays in service.
    pub fn refresh_stale(&mut self, fetcher: &Fetcher) {
        for i in 0..self.repos.len() {
            let stale = match &self.repos[i].snapshot {
                None => true,
                Some(s) => s
                    .age_seconds()
                    .map_or(true, |age| age > self.repos[i].config.index_ttl_seconds),
            };
            if !stale {
                continue;
            }
            if let Err(e) = self.refresh_one(i, fetcher) {
                warn!(
                    "Opportunistic refresh of {} failed, serving cached index: {e}",
                    self.repos[i].id
                );
            }
        }
    }

    fn refresh_one(&mut self, i: usize, fetcher: &Fetcher) -> Result<()> {
        let (id, config) = {
            let repo = &self.repos[i];
            (repo.id.clone(), repo.config.clone())
        };
        info!("Refreshing repository {id}");

        let url = format!("{}/INDEX", config.url.trim_end_matches('/'));
        let bytes = fetcher.fetch_bytes(&url)?;

        let pinned = self
            .security
            .require_signatures
            .then_some(config.signing_key_fingerprint.as_str());
        let decoded = decode_catalog(&id, &bytes, pinned)?;

        if self.security.require_signatures {
            verify_manifests(&decoded)?;
        }

        let snapshot = IndexSnapshot {
            repo_id: id.clone(),
            fetched_at: chrono::Utc::now().to_rfc3339(),
            public_key: hex::encode(decoded.public_key),
            manifests: decoded.manifests,
        };
        write_snapshot(&self.indexes_dir, &snapshot)?;

        info!(
            "Repository {id} now has {} manifest(s)",
            snapshot.manifests.len()
        );
        self.repos[i].snapshot = Some(snapshot);
        Ok(())
    }

    /// All known manifests for `name`, by exact name or by `provides`
    /// token, highest-priority repository first, version descending
    /// within a repository.
    pub fn query(&self, name: &str) -> Vec<Candidate<'_>> {
        let mut out = Vec::new();
        for repo in &self.repos {
            let Some(snapshot) = &repo.snapshot else { continue };
            for manifest in &snapshot.manifests {
                if manifest.provided_names().any(|n| n == name) {
                    out.push(Candidate {
                        manifest,
                        repo_id: &repo.id,
                        priority: repo.config.priority,
                        trusted: repo.config.trusted,
                    });
                }
            }
        }
        // repos is already priority-ordered; settle versions within it.
        out.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.repo_id.cmp(b.repo_id))
                .then_with(|| b.manifest.version.cmp(&a.manifest.version))
        });
        out
    }

    /// Substring search over package names and descriptions
    pub fn search(&self, pattern: &str) -> Vec<Candidate<'_>> {
        let needle = pattern.to_lowercase();
        let mut out: Vec<Candidate<'_>> = Vec::new();
        for repo in &self.repos {
            let Some(snapshot) = &repo.snapshot else { continue };
            for manifest in &snapshot.manifests {
                let hit = manifest.name.to_lowercase().contains(&needle)
                    || manifest.description.to_lowercase().contains(&needle);
                if hit {
                    out.push(Candidate {
                        manifest,
                        repo_id: &repo.id,
                        priority: repo.config.priority,
                        trusted: repo.config.trusted,
                    });
                }
            }
        }
        out.sort_by(|a, b| {
            a.manifest
                .name
                .cmp(&b.manifest.name)
                .then_with(|| b.manifest.version.cmp(&a.manifest.version))
        });
        out
    }

    /// Best candidate for `name` under `constraint` on `target` arch:
    /// highest priority, then highest version.
    pub fn candidate(
        &self,
        name: &str,
        constraint: Option<&Constraint>,
        target: Arch,
    ) -> Option<Candidate<'_>> {
        self.query(name)
            .into_iter()
            .find(|c| eligible(c, name, constraint, target))
    }

    /// All eligible candidates in deterministic preference order; the
    /// resolver iterates these during backtracking.
    pub fn candidates(
        &self,
        name: &str,
        constraint: Option<&Constraint>,
        target: Arch,
    ) -> Vec<Candidate<'_>> {
        self.query(name)
            .into_iter()
            .filter(|c| eligible(c, name, constraint, target))
            .collect()
    }
}

fn eligible(c: &Candidate<'_>, name: &str, constraint: Option<&Constraint>, target: Arch) -> bool {
    if !c.manifest.arch.compatible_with(target) {
        return false;
    }
    if c.manifest.name == name {
        return constraint.map_or(true, |con| con.matches(&c.manifest.version));
    }
    // Virtual provide: the provide's declared version (if any) must
    // satisfy the requirement; a bare provide satisfies only bare
    // requirements.
    c.manifest.provides.iter().any(|p| {
        p.name == name
            && match (constraint, &p.constraint) {
                (None, _) => true,
                (Some(req), Some(provided)) => {
                    provided.op == crate::version::Op::Eq && req.matches(&provided.version)
                }
                (Some(_), None) => false,
            }
    })
}

fn verify_manifests(decoded: &index::DecodedIndex) -> Result<()> {
    use rayon::prelude::*;
    // Pure CPU work; fan out over the global pool.
    decoded
        .manifests
        .par_iter()
        .try_for_each(|m| index::verify_manifest(m, &decoded.public_key))
}

fn decode_catalog(
    repo_id: &str,
    bytes: &[u8],
    pinned: Option<&str>,
) -> Result<index::DecodedIndex> {
    match pinned {
        Some(pin) => index::decode(repo_id, bytes, pin),
        None => index::decode_unverified(repo_id, bytes),
    }
}

fn snapshot_path(indexes_dir: &Path, repo_id: &str) -> PathBuf {
    indexes_dir.join(format!("{repo_id}.idx"))
}

fn read_snapshot(indexes_dir: &Path, repo_id: &str) -> Result<Option<IndexSnapshot>> {
    let path = snapshot_path(indexes_dir, repo_id);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str::<IndexSnapshot>(&text) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            // A damaged snapshot is not fatal; the next refresh rewrites it.
            warn!("Ignoring unreadable index snapshot {}: {e}", path.display());
            Ok(None)
        }
    }
}

/// Write-to-temp-then-rename so a concurrent reader never observes a
/// partial snapshot.
fn write_snapshot(indexes_dir: &Path, snapshot: &IndexSnapshot) -> Result<()> {
    let path = snapshot_path(indexes_dir, &snapshot.repo_id);
    let bytes = serde_json::to_vec(snapshot)
        .map_err(|e| Error::Parse(format!("snapshot encode failed: {e}")))?;

    let mut temp = tempfile::NamedTempFile::new_in(indexes_dir)?;
    temp.write_all(&bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(&path).map_err(|e| Error::Io(e.error))?;
    debug!("Stored index snapshot {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::manifest::Codec;
    use crate::signature::RepoSigner;
    use tempfile::tempdir;

    fn manifest(name: &str, version: &str, arch: Arch) -> Manifest {
        Manifest {
            name: name.to_string(),
            version: version.parse().unwrap(),
            arch,
            description: format!("{name} package"),
            license: String::new(),
            maintainer: String::new(),
            download_size: 1,
            installed_size: 1,
            codec: Codec::Gzip,
            download_checksum: "00".repeat(32),
            files: Vec::new(),
            depends: Vec::new(),
            recommends: Vec::new(),
            conflicts: Vec::new(),
            replaces: Vec::new(),
            provides: Vec::new(),
            scripts: Default::default(),
            signature: None,
        }
    }

    fn write_repo(dir: &Path, manifests: Vec<Manifest>, signer: &RepoSigner) {
        let mut manifests = manifests;
        index::sign_manifests(&mut manifests, signer).unwrap();
        let bytes = index::encode(&manifests, signer).unwrap();
        fs::write(dir.join("INDEX"), bytes).unwrap();
    }

    fn config_for(repos: &[(&str, &Path, i32, &RepoSigner)]) -> Config {
        let mut text = String::new();
        for (id, dir, priority, signer) in repos {
            text.push_str(&format!(
                "[repository.{id}]\nurl = \"file://{}\"\npriority = {priority}\n\
                 trusted = true\nsigning_key_fingerprint = \"{}\"\n\n",
                dir.display(),
                signer.fingerprint()
            ));
        }
        Config::from_toml(&text).unwrap()
    }

    fn fetcher() -> Fetcher {
        Fetcher::new(&Default::default()).unwrap()
    }

    #[test]
    fn test_refresh_and_query() {
        let repo_dir = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        let signer = RepoSigner::from_seed(&[1u8; 32]);
        write_repo(
            repo_dir.path(),
            vec![
                manifest("hello", "1.0.0", Arch::Any),
                manifest("hello", "1.1.0", Arch::Any),
                manifest("other", "0.1", Arch::Any),
            ],
            &signer,
        );

        let config = config_for(&[("main", repo_dir.path(), 500, &signer)]);
        let mut repos = RepoSet::load(state_dir.path(), &config).unwrap();
        repos.refresh_all(&fetcher()).unwrap();

        let found = repos.query("hello");
        assert_eq!(found.len(), 2);
        // Version descending within the repository.
        assert_eq!(found[0].manifest.version, "1.1.0".parse().unwrap());

        let best = repos.candidate("hello", None, Arch::X86_64).unwrap();
        assert_eq!(best.manifest.version, "1.1.0".parse().unwrap());
    }

    #[test]
    fn test_snapshot_survives_reload() {
        let repo_dir = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        let signer = RepoSigner::from_seed(&[2u8; 32]);
        write_repo(repo_dir.path(), vec![manifest("hello", "1.0.0", Arch::Any)], &signer);

        let config = config_for(&[("main", repo_dir.path(), 500, &signer)]);
        {
            let mut repos = RepoSet::load(state_dir.path(), &config).unwrap();
            repos.refresh_all(&fetcher()).unwrap();
        }

        // Fresh load with no network activity sees the snapshot.
        let repos = RepoSet::load(state_dir.path(), &config).unwrap();
        assert_eq!(repos.query("hello").len(), 1);
    }

    #[test]
    fn test_refresh_twice_is_idempotent() {
        let repo_dir = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        let signer = RepoSigner::from_seed(&[3u8; 32]);
        write_repo(repo_dir.path(), vec![manifest("hello", "1.0.0", Arch::Any)], &signer);

        let config = config_for(&[("main", repo_dir.path(), 500, &signer)]);
        let mut repos = RepoSet::load(state_dir.path(), &config).unwrap();
        repos.refresh_all(&fetcher()).unwrap();
        let first: Vec<Manifest> = repos.query("hello").iter().map(|c| c.manifest.clone()).collect();
        repos.refresh_all(&fetcher()).unwrap();
        let second: Vec<Manifest> = repos.query("hello").iter().map(|c| c.manifest.clone()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_bad_signature_preserves_prior_index() {
        let repo_dir = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        let signer = RepoSigner::from_seed(&[4u8; 32]);
        write_repo(repo_dir.path(), vec![manifest("hello", "1.0.0", Arch::Any)], &signer);

        let config = config_for(&[("main", repo_dir.path(), 500, &signer)]);
        let mut repos = RepoSet::load(state_dir.path(), &config).unwrap();
        repos.refresh_all(&fetcher()).unwrap();

        // Replace the catalog with one signed by an impostor key.
        let impostor = RepoSigner::from_seed(&[9u8; 32]);
        write_repo(repo_dir.path(), vec![manifest("hello", "9.9.9", Arch::Any)], &impostor);

        let err = repos.refresh_all(&fetcher());
        assert!(matches!(err, Err(Error::SignatureInvalid { .. })));

        // Prior snapshot still serves queries, in memory and on disk.
        let best = repos.candidate("hello", None, Arch::X86_64).unwrap();
        assert_eq!(best.manifest.version, "1.0.0".parse().unwrap());
        let reloaded = RepoSet::load(state_dir.path(), &config).unwrap();
        assert_eq!(
            reloaded.candidate("hello", None, Arch::X86_64).unwrap().manifest.version,
            "1.0.0".parse().unwrap()
        );
    }

    #[test]
    fn test_priority_wins_over_version() {
        let main_dir = tempdir().unwrap();
        let sec_dir = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        let signer = RepoSigner::from_seed(&[5u8; 32]);
        write_repo(main_dir.path(), vec![manifest("openssl", "3.0.9", Arch::Any)], &signer);
        write_repo(sec_dir.path(), vec![manifest("openssl", "3.0.7", Arch::Any)], &signer);

        let config = config_for(&[
            ("main", main_dir.path(), 500, &signer),
            ("security", sec_dir.path(), 900, &signer),
        ]);
        let mut repos = RepoSet::load(state_dir.path(), &config).unwrap();
        repos.refresh_all(&fetcher()).unwrap();

        // security (900) beats main (500) even with a lower version.
        let best = repos.candidate("openssl", None, Arch::X86_64).unwrap();
        assert_eq!(best.repo_id, "security");
        assert_eq!(best.manifest.version, "3.0.7".parse().unwrap());
    }

    #[test]
    fn test_arch_filter() {
        let repo_dir = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        let signer = RepoSigner::from_seed(&[6u8; 32]);
        write_repo(
            repo_dir.path(),
            vec![manifest("native", "1.0", Arch::Aarch64)],
            &signer,
        );

        let config = config_for(&[("main", repo_dir.path(), 500, &signer)]);
        let mut repos = RepoSet::load(state_dir.path(), &config).unwrap();
        repos.refresh_all(&fetcher()).unwrap();

        assert!(repos.candidate("native", None, Arch::X86_64).is_none());
        assert!(repos.candidate("native", None, Arch::Aarch64).is_some());
    }

    #[test]
    fn test_provides_satisfies_query() {
        let repo_dir = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        let signer = RepoSigner::from_seed(&[7u8; 32]);
        let mut mta = manifest("postfix", "3.8.0", Arch::Any);
        mta.provides.push(crate::manifest::Relation::new("mail-transport", None));
        write_repo(repo_dir.path(), vec![mta], &signer);

        let config = config_for(&[("main", repo_dir.path(), 500, &signer)]);
        let mut repos = RepoSet::load(state_dir.path(), &config).unwrap();
        repos.refresh_all(&fetcher()).unwrap();

        let found = repos.candidate("mail-transport", None, Arch::X86_64).unwrap();
        assert_eq!(found.manifest.name, "postfix");
    }
}
