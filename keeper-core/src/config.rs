//! Keeper Configuration Module
//!
//! Configuration for data placement, background sync, idle reclamation and
//! remote backup. Loaded from environment variables with defaults suitable
//! for development.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Default background sync interval.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
/// Default idle threshold before a tenant store is reclaimed.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(30 * 60);
/// Default housekeeping cadence.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default LMDB map size per tenant.
pub const DEFAULT_CACHE_MAP_SIZE_MB: usize = 64;

// ============================================================================
// BACKUP TARGET
// ============================================================================

/// Where snapshots are pushed after a successful sync.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum BackupTarget {
    /// No remote backup.
    #[default]
    None,
    /// Copy snapshots into a local or mounted directory.
    Directory(PathBuf),
    /// `PUT` snapshots to an HTTP endpoint.
    Http {
        endpoint: String,
        token: Option<String>,
    },
}

impl BackupTarget {
    pub fn is_none(&self) -> bool {
        matches!(self, BackupTarget::None)
    }
}

impl fmt::Debug for BackupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupTarget::None => f.write_str("None"),
            BackupTarget::Directory(path) => f.debug_tuple("Directory").field(path).finish(),
            BackupTarget::Http { endpoint, token } => f
                .debug_struct("Http")
                .field("endpoint", endpoint)
                .field("token", &token.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

// ============================================================================
// KEEPER CONFIGURATION
// ============================================================================

/// Runtime configuration for a store provider.
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    /// Base directory holding one sub-directory per tenant.
    pub data_dir: PathBuf,

    /// Whether remote backup is enabled.
    pub cloud_mode: bool,

    /// Backup destination used when `cloud_mode` is on.
    pub backup: BackupTarget,

    /// Background sync interval. `None` disables the background flush.
    pub sync_interval: Option<Duration>,

    /// Stores whose last sync is older than this are reclaimed.
    pub idle_threshold: Duration,

    /// How often housekeeping looks for idle stores.
    pub cleanup_interval: Duration,

    /// LMDB map size per tenant in megabytes.
    pub cache_map_size_mb: usize,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cloud_mode: false,
            backup: BackupTarget::None,
            sync_interval: Some(DEFAULT_SYNC_INTERVAL),
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            cache_map_size_mb: DEFAULT_CACHE_MAP_SIZE_MB,
        }
    }
}

impl KeeperConfig {
    /// Config rooted at `data_dir` with every other field defaulted.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Config for tests and short-lived processes: no background sync.
    pub fn ephemeral(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            sync_interval: None,
            ..Self::new(data_dir)
        }
    }

    pub fn with_sync_interval(mut self, interval: Option<Duration>) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    /// Enable cloud mode with the given backup target.
    pub fn with_backup(mut self, target: BackupTarget) -> Self {
        self.cloud_mode = true;
        self.backup = target;
        self
    }

    /// Create KeeperConfig from environment variables.
    ///
    /// Environment variables:
    /// - `KEEPER_DATA_DIR`: Base data directory (default: ./data)
    /// - `KEEPER_CLOUD_MODE`: "true" or "false" (default: false)
    /// - `KEEPER_BACKUP_DIR`: Directory backup target
    /// - `KEEPER_BACKUP_URL`: HTTP backup endpoint (wins over KEEPER_BACKUP_DIR)
    /// - `KEEPER_BACKUP_TOKEN`: Bearer token for the HTTP endpoint
    /// - `KEEPER_SYNC_INTERVAL_SECS`: Background sync interval, 0 disables (default: 30)
    /// - `KEEPER_IDLE_THRESHOLD_SECS`: Idle threshold (default: 1800)
    /// - `KEEPER_CLEANUP_INTERVAL_SECS`: Housekeeping cadence (default: 300)
    /// - `KEEPER_CACHE_MAP_SIZE_MB`: LMDB map size per tenant (default: 64)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`KeeperConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let data_dir = get("KEEPER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let cloud_mode = match get("KEEPER_CLOUD_MODE") {
            Some(raw) => parse_bool("KEEPER_CLOUD_MODE", &raw)?,
            None => false,
        };

        let backup = if let Some(endpoint) = get("KEEPER_BACKUP_URL") {
            BackupTarget::Http {
                endpoint,
                token: get("KEEPER_BACKUP_TOKEN"),
            }
        } else if let Some(dir) = get("KEEPER_BACKUP_DIR") {
            BackupTarget::Directory(PathBuf::from(dir))
        } else {
            BackupTarget::None
        };

        let sync_interval = match get("KEEPER_SYNC_INTERVAL_SECS") {
            Some(raw) => match parse_u64("KEEPER_SYNC_INTERVAL_SECS", &raw)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            None => defaults.sync_interval,
        };

        let idle_threshold = match get("KEEPER_IDLE_THRESHOLD_SECS") {
            Some(raw) => Duration::from_secs(parse_u64("KEEPER_IDLE_THRESHOLD_SECS", &raw)?),
            None => defaults.idle_threshold,
        };

        let cleanup_interval = match get("KEEPER_CLEANUP_INTERVAL_SECS") {
            Some(raw) => Duration::from_secs(parse_u64("KEEPER_CLEANUP_INTERVAL_SECS", &raw)?),
            None => defaults.cleanup_interval,
        };

        let cache_map_size_mb = match get("KEEPER_CACHE_MAP_SIZE_MB") {
            Some(raw) => parse_u64("KEEPER_CACHE_MAP_SIZE_MB", &raw)? as usize,
            None => defaults.cache_map_size_mb,
        };

        let config = Self {
            data_dir,
            cloud_mode,
            backup,
            sync_interval,
            idle_threshold,
            cleanup_interval,
            cache_map_size_mb,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "data_dir".to_string(),
            });
        }
        if self.cloud_mode && self.backup.is_none() {
            return Err(ConfigError::MissingRequired {
                field: "backup target".to_string(),
            });
        }
        if self.cache_map_size_mb == 0 {
            return Err(invalid("cache_map_size_mb", "0", "must be greater than zero"));
        }
        if self.idle_threshold.is_zero() {
            return Err(invalid("idle_threshold", "0", "must be greater than zero"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(invalid("cleanup_interval", "0", "must be greater than zero"));
        }
        if matches!(self.sync_interval, Some(interval) if interval.is_zero()) {
            return Err(invalid("sync_interval", "0", "use None to disable background sync"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(field: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(field, raw, "expected true or false")),
    }
}

fn parse_u64(field: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse()
        .map_err(|_| invalid(field, raw, "expected a non-negative integer"))
}
