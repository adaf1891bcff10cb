//! Daemon configuration.
//!
//! Loaded from a YAML file, with environment overrides (`QGATE_` prefix)
//! and `.env` support. The daemon re-reads the file whenever its mtime
//! moves forward, so most settings can be changed without a restart.
//!
//! Precedence (highest to lowest):
//! 1. Environment variables
//! 2. Configuration file
//! 3. Default values

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::accounts::AccountMap;
use crate::admission::{AdmissionLimits, AdmissionQueue, QuotaSpec};
use crate::cache::RetryPolicy;
use crate::error::{ConfigError, ConfigResult};
use crate::layout::{DirectoryLayout, expand_home};
use crate::pbs::CommandsConfig;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "QGATE_CONFIG";

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// User the daemon runs as and submits for.
    #[serde(default = "default_user")]
    pub user: String,

    /// Users whose inboxes are served. Must include `user`.
    pub users: Vec<String>,

    #[serde(default)]
    pub directories: DirectoryLayout,

    #[serde(default)]
    pub queue: QueueConfig,

    /// The (cluster, queue) jobs are admitted into.
    #[serde(default)]
    pub admission: AdmissionQueue,

    #[serde(default)]
    pub quotas: Vec<QuotaSpec>,

    #[serde(default)]
    pub accounts: AccountMap,

    #[serde(default)]
    pub commands: CommandsConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub handoff: HandoffConfig,

    #[serde(default)]
    pub control: ControlConfig,
}

/// Admission limits and pacing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Running jobs at which the queue counts as full.
    #[serde(default = "default_run_limit")]
    pub run_limit: usize,

    /// Queued jobs at which the queue counts as full.
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,

    /// Pause between cycles, in seconds.
    #[serde(default = "default_sleep_secs")]
    pub sleep_secs: u64,

    /// Oldest acceptable snapshot, in seconds. Defaults to one second less
    /// than the sleep interval.
    #[serde(default)]
    pub stale_secs: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            run_limit: default_run_limit(),
            queue_limit: default_queue_limit(),
            sleep_secs: default_sleep_secs(),
            stale_secs: None,
        }
    }
}

/// Cluster state cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory shared by every daemon for cache files. Without one, each
    /// process caches in memory only.
    #[serde(default)]
    pub dir: Option<String>,

    #[serde(default = "default_parse_attempts")]
    pub parse_attempts: u32,

    #[serde(default = "default_parse_backoff_secs")]
    pub parse_backoff_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            parse_attempts: default_parse_attempts(),
            parse_backoff_secs: default_parse_backoff_secs(),
        }
    }
}

/// Hand-off settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Seconds a file may sit in staging before it is recovered.
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            orphan_grace_secs: default_orphan_grace_secs(),
        }
    }
}

/// Operator controls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Setting this to `true` stops every daemon reading the file.
    #[serde(default)]
    pub shutdown: bool,

    /// Seconds the config file may be missing before the daemon exits.
    #[serde(default = "default_missing_config_grace_secs")]
    pub missing_config_grace_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            shutdown: false,
            missing_config_grace_secs: default_missing_config_grace_secs(),
        }
    }
}

fn default_user() -> String {
    current_user().unwrap_or_default()
}

fn default_run_limit() -> usize {
    10
}

fn default_queue_limit() -> usize {
    10
}

fn default_sleep_secs() -> u64 {
    60
}

fn default_parse_attempts() -> u32 {
    crate::cache::MAX_PARSE_ATTEMPTS
}

fn default_parse_backoff_secs() -> u64 {
    crate::cache::PARSE_RETRY_BACKOFF.as_secs()
}

fn default_orphan_grace_secs() -> u64 {
    crate::handoff::DEFAULT_ORPHAN_GRACE.as_secs()
}

fn default_missing_config_grace_secs() -> u64 {
    3600
}

/// Login name of the user running this process, from the environment.
pub fn current_user() -> Option<String> {
    ["LOGNAME", "USER", "LNAME", "USERNAME"]
        .into_iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
}

impl DaemonConfig {
    /// Load configuration from a YAML file, applying environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Load `.env`, then the configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_file(path)
    }

    /// Parse YAML, apply environment overrides, and validate.
    pub fn parse(contents: &str) -> ConfigResult<Self> {
        let config: DaemonConfig = serde_yaml_ng::from_str(contents)?;
        let config = config.merge_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    ///
    /// Only variables that are set override; unparseable numbers are
    /// ignored.
    pub fn merge_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("QGATE_USER") {
            self.user = v;
        }
        if let Some(v) = lookup("QGATE_CACHE_DIR") {
            self.cache.dir = Some(v);
        }
        if let Some(Ok(v)) = lookup("QGATE_RUN_LIMIT").map(|v| v.parse()) {
            self.queue.run_limit = v;
        }
        if let Some(Ok(v)) = lookup("QGATE_QUEUE_LIMIT").map(|v| v.parse()) {
            self.queue.queue_limit = v;
        }
        if let Some(Ok(v)) = lookup("QGATE_SLEEP_SECS").map(|v| v.parse()) {
            self.queue.sleep_secs = v;
        }
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.user.is_empty() {
            return Err(ConfigError::Invalid(
                "user is not set and could not be determined from the environment".to_string(),
            ));
        }
        if self.users.is_empty() {
            return Err(ConfigError::Invalid("users must not be empty".to_string()));
        }
        if !self.users.contains(&self.user) {
            return Err(ConfigError::Invalid(format!(
                "User running the daemon ({}) is not in users {:?}",
                self.user, self.users
            )));
        }

        if self.queue.run_limit == 0 || self.queue.queue_limit == 0 {
            return Err(ConfigError::Invalid(
                "run_limit and queue_limit must be greater than 0".to_string(),
            ));
        }
        if self.queue.sleep_secs == 0 {
            return Err(ConfigError::Invalid("sleep_secs must be greater than 0".to_string()));
        }

        if !self.directories.base_dir.contains(crate::layout::USER_PLACEHOLDER) && self.users.len() > 1 {
            return Err(ConfigError::Invalid(format!(
                "base_dir {:?} must contain {} when serving several users",
                self.directories.base_dir,
                crate::layout::USER_PLACEHOLDER
            )));
        }
        let names = self.directories.subdirectory_names();
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() || name.contains('/') || *name == "." || *name == ".." {
                return Err(ConfigError::Invalid(format!("Invalid directory name: {name:?}")));
            }
            if names[..i].contains(name) {
                return Err(ConfigError::Invalid(format!("Directory name used twice: {name:?}")));
            }
        }

        if self.admission.cluster.as_str().is_empty() || self.admission.queue.is_empty() {
            return Err(ConfigError::Invalid(
                "admission cluster and queue must be set".to_string(),
            ));
        }
        if self.accounts.is_empty() {
            return Err(ConfigError::Invalid("account map must not be empty".to_string()));
        }
        for quota in &self.quotas {
            if quota.soft_jobs > quota.hard_jobs {
                return Err(ConfigError::Invalid(format!(
                    "Quota for {}/{}: soft_jobs exceeds hard_jobs",
                    quota.cluster, quota.queue
                )));
            }
        }
        if self.cache.parse_attempts == 0 {
            return Err(ConfigError::Invalid("parse_attempts must be at least 1".to_string()));
        }

        Ok(())
    }

    /// Pause between cycles.
    pub fn sleep(&self) -> Duration {
        Duration::from_secs(self.queue.sleep_secs)
    }

    /// Oldest acceptable cluster snapshot.
    pub fn stale_after(&self) -> Duration {
        let secs = self
            .queue
            .stale_secs
            .unwrap_or_else(|| self.queue.sleep_secs.saturating_sub(1).max(1));
        Duration::from_secs(secs)
    }

    /// Quota for the admission queue, if one is configured.
    pub fn admission_quota(&self) -> Option<&QuotaSpec> {
        self.quotas
            .iter()
            .find(|q| q.covers(&self.admission.cluster, &self.admission.queue))
    }

    /// Effective admission limits.
    pub fn admission_limits(&self) -> AdmissionLimits {
        AdmissionLimits::new(
            self.queue.run_limit,
            self.queue.queue_limit,
            self.admission_quota(),
        )
    }

    /// Parse retry policy for the cache.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.cache.parse_attempts,
            backoff: Duration::from_secs(self.cache.parse_backoff_secs),
        }
    }

    /// Expanded cache directory.
    pub fn cache_dir(&self) -> Option<PathBuf> {
        self.cache.dir.as_deref().map(expand_home)
    }

    /// How long a staged file may sit before it is recovered.
    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.handoff.orphan_grace_secs)
    }
}

/// Result of checking the configuration file.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigUpdate {
    /// Nothing new.
    Unchanged,
    /// A newer file was loaded.
    Reloaded(Arc<DaemonConfig>),
    /// The file is gone but still within its grace period.
    Missing { for_secs: u64 },
}

/// Tracks the configuration file and reloads it when it changes.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    seen_mtime: Option<SystemTime>,
    last_seen: Instant,
    current: Option<Arc<DaemonConfig>>,
}

impl ConfigWatcher {
    /// Watch the configuration file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seen_mtime: None,
            last_seen: Instant::now(),
            current: None,
        }
    }

    /// Path of the watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last successfully loaded configuration.
    pub fn current(&self) -> Option<Arc<DaemonConfig>> {
        self.current.clone()
    }

    /// Check the file and reload it if its mtime moved forward.
    ///
    /// Before the first successful load every failure is an error. After
    /// that, an unreadable or invalid file keeps the previous configuration
    /// (and is retried on the next poll), and a missing file is tolerated
    /// for the configured grace period.
    pub async fn poll(&mut self) -> ConfigResult<ConfigUpdate> {
        let meta = match fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && self.current.is_some() => {
                let grace = self
                    .current
                    .as_ref()
                    .map_or(0, |c| c.control.missing_config_grace_secs);
                let missing = self.last_seen.elapsed();
                if missing > Duration::from_secs(grace) {
                    return Err(ConfigError::MissingTooLong {
                        path: self.path.clone(),
                        missing_secs: missing.as_secs(),
                        grace_secs: grace,
                    });
                }
                warn!(path = %self.path.display(), missing_secs = missing.as_secs(), "Config file not found, keeping current configuration");
                return Ok(ConfigUpdate::Missing {
                    for_secs: missing.as_secs(),
                });
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        self.last_seen = Instant::now();

        let mtime = meta.modified().map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        if self.seen_mtime.is_some_and(|seen| mtime <= seen) {
            return Ok(ConfigUpdate::Unchanged);
        }

        let loaded = match fs::read_to_string(&self.path).await {
            Ok(contents) => DaemonConfig::parse(&contents),
            Err(source) => Err(ConfigError::Io {
                path: self.path.clone(),
                source,
            }),
        };

        match loaded {
            Ok(config) => {
                info!(path = %self.path.display(), "Loaded configuration");
                let config = Arc::new(config);
                self.current = Some(Arc::clone(&config));
                self.seen_mtime = Some(mtime);
                Ok(ConfigUpdate::Reloaded(config))
            }
            Err(e) if self.current.is_some() => {
                warn!(path = %self.path.display(), error = %e, "Ignoring bad configuration, keeping previous one");
                Ok(ConfigUpdate::Unchanged)
            }
            Err(e) => Err(e),
        }
    }
}
