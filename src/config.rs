//! stackform.toml configuration
//!
//! Every key is optional; a missing file means defaults everywhere.
//! Command-line flags override what the file says.

use anyhow::{Context, Result, bail};
use declarative::engine::DEFAULT_LOCK_TTL_SECS;
use declarative::context::DEFAULT_JOBS;
use regex::Regex;
use serde::{Deserialize, Serialize};
use statestore::RetryConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::paths;

static STACK_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9-]{0,127}$")
        .unwrap_or_else(|e| panic!("invalid stack name regex: {e}"))
});

/// One week; longer locks are better cleared with force-unlock
const MAX_TTL_SECS: u64 = 7 * 24 * 60 * 60;

// ============================================================================
// Main Config Schema
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Stack name used when `--stack` is not given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Value of `Stack::Region`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Template used when `--template` is not given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Maximum provider calls in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub lock: LockConfig,

    /// Local provider settings keyed by resource type
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// Which state backend to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    /// Process-local; state is lost on exit
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// SQLite database path (default: `<state dir>/state.db`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Holder identity recorded in the lock (default: `user@host:pid`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_ttl_secs() -> u64 {
    DEFAULT_LOCK_TTL_SECS as u64
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            holder: None,
            retry: RetrySettings::default(),
        }
    }
}

/// Backoff while another holder owns the lock
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            backoff_factor: defaults.backoff_factor,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Settings for the local provider of one resource type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Properties whose change forces replacement
    #[serde(default)]
    pub replace_on: BTreeSet<String>,
    /// Properties exported as attributes for `Fn::GetAtt`
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Directory holding this type's resources (default: `<state dir>/resources`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl Config {
    /// Load config from an explicit path, or the first candidate that exists
    ///
    /// Returns the path that was read, if any.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            let path = paths::expand(&path.to_string_lossy());
            return Ok((Self::load_from(&path)?, Some(path)));
        }

        for candidate in paths::config_candidates() {
            if candidate.exists() {
                log::debug!("Using config {}", candidate.display());
                return Ok((Self::load_from(&candidate)?, Some(candidate)));
            }
        }

        log::debug!("No config file found; using defaults");
        Ok((Self::default(), None))
    }

    fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Invalid TOML format")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(stack) = &self.stack {
            validate_stack_name(stack)?;
        }
        if self.jobs == Some(0) {
            bail!("jobs must be at least 1");
        }
        if self.lock.ttl_secs == 0 || self.lock.ttl_secs > MAX_TTL_SECS {
            bail!("lock.ttl_secs must be between 1 and {MAX_TTL_SECS}");
        }
        let retry = &self.lock.retry;
        if retry.max_attempts == 0 {
            bail!("lock.retry.max_attempts must be at least 1");
        }
        if !(retry.backoff_factor >= 1.0) {
            bail!("lock.retry.backoff_factor must be at least 1.0");
        }
        if self.state.backend == BackendKind::Memory && self.state.path.is_some() {
            bail!("state.path has no effect with the memory backend");
        }
        for (resource_type, provider) in &self.providers {
            if resource_type.trim().is_empty() {
                bail!("provider resource type must not be empty");
            }
            if let Some(name) = provider.attributes.iter().find(|a| a.as_str() == "Arn") {
                bail!("[providers.\"{resource_type}\"] attribute '{name}' is always exported");
            }
        }
        Ok(())
    }

    pub fn jobs(&self) -> usize {
        self.jobs.unwrap_or(DEFAULT_JOBS)
    }

    pub fn region(&self) -> &str {
        self.region.as_deref().unwrap_or("local")
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock.ttl_secs.min(MAX_TTL_SECS) as i64)
    }

    /// SQLite database path
    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state.path {
            Some(path) => Ok(paths::expand(path)),
            None => Ok(paths::state_dir()?.join("state.db")),
        }
    }

    /// Resource directory for a local provider type
    pub fn provider_root(&self, resource_type: &str) -> Result<PathBuf> {
        match self.providers.get(resource_type).and_then(|p| p.root.as_deref()) {
            Some(root) => Ok(paths::expand(root)),
            None => Ok(paths::state_dir()?.join("resources")),
        }
    }
}

/// Stack names end up in state keys and resource identifiers
pub fn validate_stack_name(name: &str) -> Result<()> {
    if STACK_NAME.is_match(name) {
        Ok(())
    } else {
        bail!(
            "invalid stack name '{name}': use letters, digits and '-', starting with a letter"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.jobs(), DEFAULT_JOBS);
        assert_eq!(config.region(), "local");
        assert_eq!(config.state.backend, BackendKind::Sqlite);
        assert_eq!(config.lock.ttl_secs, 300);
        assert_eq!(config.lock.retry.to_retry_config().max_attempts, 5);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
stack = "web-prod"
region = "eu-west-1"
jobs = 8

[state]
backend = "sqlite"
path = "/tmp/stackform/state.db"

[lock]
ttl_secs = 60
holder = "ci"

[lock.retry]
max_attempts = 3
base_delay_ms = 100
backoff_factor = 1.5
max_delay_ms = 1000

[providers."Storage::Table"]
replace_on = ["KeySchema"]
attributes = ["Name"]
root = "/tmp/stackform/tables"
"#,
        )
        .unwrap();

        assert_eq!(config.stack.as_deref(), Some("web-prod"));
        assert_eq!(config.jobs(), 8);
        assert_eq!(config.lock_ttl(), chrono::Duration::seconds(60));
        let retry = config.lock.retry.to_retry_config();
        assert_eq!(retry.base_delay, Duration::from_millis(100));
        let table = &config.providers["Storage::Table"];
        assert!(table.replace_on.contains("KeySchema"));
        assert_eq!(
            config.provider_root("Storage::Table").unwrap(),
            PathBuf::from("/tmp/stackform/tables")
        );
        assert_eq!(
            config.state_path().unwrap(),
            PathBuf::from("/tmp/stackform/state.db")
        );
    }

    #[test]
    fn test_rejects_zero_jobs_and_ttl() {
        assert!(Config::parse("jobs = 0").is_err());
        assert!(Config::parse("[lock]\nttl_secs = 0").is_err());
        assert!(Config::parse("[lock]\nttl_secs = 99999999999").is_err());
        assert!(Config::parse("[lock.retry]\nmax_attempts = 0").is_err());
        assert!(Config::parse("[lock.retry]\nbackoff_factor = 0.5").is_err());
    }

    #[test]
    fn test_rejects_unknown_keys() {
        assert!(Config::parse("stacks = \"typo\"").is_err());
    }

    #[test]
    fn test_stack_names() {
        assert!(validate_stack_name("web-prod").is_ok());
        assert!(validate_stack_name("1stack").is_err());
        assert!(validate_stack_name("has space").is_err());
        assert!(Config::parse("stack = \"a/b\"").is_err());
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stackform.toml");
        std::fs::write(&path, "stack = \"demo\"\n").unwrap();
        let (config, used) = Config::load(Some(&path)).unwrap();
        assert_eq!(config.stack.as_deref(), Some("demo"));
        assert_eq!(used, Some(path));
    }
}
