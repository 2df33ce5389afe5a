// src/context.rs

//! Explicit operating context
//!
//! Everything that would otherwise be a global singleton (cache, state
//! store, repository set, download pool) lives in one [`Context`]
//! value threaded through all operations. Tests construct contexts
//! pointing at temp directories; nothing in the library reaches for
//! ambient state.

use crate::cache::Cache;
use crate::config::Config;
use crate::error::Result;
use crate::fetch::Fetcher;
use crate::manifest::Arch;
use crate::repository::RepoSet;
use crate::resolver::Policy;
use crate::state::{LockMode, StateDb};
use std::path::PathBuf;
use tracing::debug;

pub struct Context {
    pub config: Config,
    /// Root of the managed filesystem subtree packages install into
    pub prefix: PathBuf,
    pub cache: Cache,
    pub state: StateDb,
    pub repos: RepoSet,
    pub fetcher: Fetcher,
    pub target_arch: Arch,
}

impl Context {
    /// Open a full mutating context: exclusive process lock, crash
    /// recovery for any transaction the previous process left behind.
    pub fn open(config: Config, prefix: PathBuf) -> Result<Self> {
        let mut ctx = Self::open_with(config, prefix, LockMode::Exclusive)?;
        crate::transaction::recover_pending(&mut ctx)?;
        Ok(ctx)
    }

    /// Open a read-only context (shared lock, no recovery)
    pub fn open_read_only(config: Config, prefix: PathBuf) -> Result<Self> {
        Self::open_with(config, prefix, LockMode::Shared)
    }

    fn open_with(config: Config, prefix: PathBuf, mode: LockMode) -> Result<Self> {
        let cache = Cache::open_at(&config.cache.root, config.cache.max_bytes)?;
        let state = StateDb::open(&config.state.root, mode)?;
        let repos = RepoSet::load(&config.state.root, &config)?;
        let fetcher = Fetcher::new(&config.download)?;
        debug!(
            "Context open: prefix {}, state {}, cache {}",
            prefix.display(),
            config.state.root.display(),
            config.cache.root.display()
        );
        Ok(Self {
            config,
            prefix,
            cache,
            state,
            repos,
            fetcher,
            target_arch: Arch::host(),
        })
    }

    /// The candidate-filtering policy derived from configuration
    pub fn policy(&self) -> Policy {
        Policy {
            target_arch: self.target_arch,
            require_trusted_repos: self.config.security.require_trusted_repos,
        }
    }
}
