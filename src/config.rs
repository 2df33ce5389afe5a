// src/config.rs

//! Configuration file handling
//!
//! Strata reads a single human-editable TOML file with `cache`,
//! `state`, `download`, and `security` sections plus one
//! `[repository.<id>]` block per configured repository. Every key has
//! a default; an empty file is a valid configuration with no
//! repositories.

use crate::error::{Error, Result};
use crate::manifest::validate_name;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/strata/strata.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cache: CacheConfig,
    pub state: StateConfig,
    pub download: DownloadConfig,
    pub security: SecurityConfig,
    pub repository: BTreeMap<String, RepoConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            state: StateConfig::default(),
            download: DownloadConfig::default(),
            security: SecurityConfig::default(),
            repository: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/cache/strata"),
            max_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    pub root: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/strata"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadConfig {
    pub parallelism: usize,
    /// 0 = unlimited
    pub rate_limit_bytes_per_sec: u64,
    pub timeout_seconds: u64,
    /// Deadline for a whole transaction, checked between phases;
    /// 0 = unlimited
    pub transaction_timeout_seconds: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            rate_limit_bytes_per_sec: 0,
            timeout_seconds: 120,
            transaction_timeout_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    pub require_signatures: bool,
    pub require_trusted_repos: bool,
    pub min_risk_level: RiskLevel,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_signatures: true,
            require_trusted_repos: false,
            min_risk_level: RiskLevel::Clean,
        }
    }
}

/// Risk classification levels for policy gating
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Clean,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Clean => "clean",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "clean" => Ok(RiskLevel::Clean),
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            _ => Err(Error::Parse(format!("unknown risk level: {s}"))),
        }
    }
}

/// One `[repository.<id>]` block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    pub url: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub signing_key_fingerprint: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Index age, in seconds, after which a query triggers an
    /// opportunistic refresh
    #[serde(default = "default_ttl")]
    pub index_ttl_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_ttl() -> u64 {
    3600
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)
            .map_err(|e| Error::Parse(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.download.parallelism == 0 {
            return Err(Error::Parse(
                "download.parallelism must be at least 1".into(),
            ));
        }
        for (id, repo) in &self.repository {
            validate_name(id)
                .map_err(|_| Error::Parse(format!("invalid repository id: {id:?}")))?;
            if repo.url.is_empty() {
                return Err(Error::Parse(format!("repository {id} has an empty url")));
            }
            let fp = &repo.signing_key_fingerprint;
            if self.security.require_signatures
                && repo.enabled
                && (fp.len() != 64 || !fp.chars().all(|c| c.is_ascii_hexdigit()))
            {
                return Err(Error::Parse(format!(
                    "repository {id} needs a 64-hex-digit signing_key_fingerprint \
                     while security.require_signatures is on"
                )));
            }
        }
        Ok(())
    }

    /// Enabled repositories, highest priority first, then by id for a
    /// stable order between equal priorities.
    pub fn enabled_repositories(&self) -> Vec<(&str, &RepoConfig)> {
        let mut repos: Vec<_> = self
            .repository
            .iter()
            .filter(|(_, r)| r.enabled)
            .map(|(id, r)| (id.as_str(), r))
            .collect();
        repos.sort_by(|a, b| b.1.priority.cmp(&a.1.priority).then(a.0.cmp(b.0)));
        repos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [cache]
        root = "/tmp/strata-cache"
        max_bytes = 1048576

        [download]
        parallelism = 8
        rate_limit_bytes_per_sec = 500000
        timeout_seconds = 30

        [security]
        require_signatures = true
        require_trusted_repos = true
        min_risk_level = "low"

        [repository.main]
        url = "https://pkgs.example.org/main"
        priority = 500
        trusted = true
        signing_key_fingerprint = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"

        [repository.security]
        url = "https://pkgs.example.org/security"
        priority = 900
        trusted = true
        signing_key_fingerprint = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.cache.max_bytes, 1048576);
        assert_eq!(config.download.parallelism, 8);
        assert_eq!(config.security.min_risk_level, RiskLevel::Low);
        assert_eq!(config.repository.len(), 2);
        assert_eq!(config.repository["main"].priority, 500);
        assert!(config.repository["security"].enabled);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.download.parallelism, 4);
        assert_eq!(config.download.rate_limit_bytes_per_sec, 0);
        assert!(config.security.require_signatures);
        assert!(config.repository.is_empty());
    }

    #[test]
    fn test_enabled_repositories_ordered_by_priority() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let repos = config.enabled_repositories();
        assert_eq!(repos[0].0, "security");
        assert_eq!(repos[1].0, "main");
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result = Config::from_toml("[cache]\nroot = \"/x\"\nmax_byts = 1\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_risk_level_rejected() {
        let result = Config::from_toml("[security]\nmin_risk_level = \"scary\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let result = Config::from_toml("[download]\nparallelism = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_fingerprint_rejected_when_signatures_required() {
        let text = r#"
            [repository.main]
            url = "https://pkgs.example.org/main"
        "#;
        assert!(Config::from_toml(text).is_err());

        let relaxed = format!("[security]\nrequire_signatures = false\n{text}");
        assert!(Config::from_toml(&relaxed).is_ok());
    }
}
