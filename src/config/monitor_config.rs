//! Monitor Configuration - detector, storage, site and remote settings as TOML
//!
//! Every section implements `Default`, so an empty file (or no file at all)
//! yields a working local-only configuration.

use super::defaults::{CONFIG_ENV_VAR, LOCAL_CONFIG_FILE};
use super::validation::{validate_unknown_keys, ValidationWarning};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one detector station.
///
/// Load with `MonitorConfig::load()` which searches:
/// 1. an explicit path (`--config`)
/// 2. `$MUON_CONFIG`
/// 3. `./muon_config.toml`
/// 4. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Buffering and anomaly detection
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Session directories and local persistence
    #[serde(default)]
    pub storage: StorageConfig,

    /// Station owner and location
    #[serde(default)]
    pub user: UserConfig,

    /// Remote replication of anomaly snapshots
    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit(PathBuf),
    Environment(PathBuf),
    WorkingDir(PathBuf),
    Defaults,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Explicit(p) => write!(f, "{}", p.display()),
            ConfigSource::Environment(p) => write!(f, "{} (from {CONFIG_ENV_VAR})", p.display()),
            ConfigSource::WorkingDir(p) => write!(f, "{}", p.display()),
            ConfigSource::Defaults => write!(f, "built-in defaults"),
        }
    }
}

/// A validated configuration plus what the loader has to report.
///
/// Logging is not initialised while the config loads, so warnings are
/// returned to the caller instead of being logged here.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: MonitorConfig,
    pub source: ConfigSource,
    pub warnings: Vec<ValidationWarning>,
}

impl MonitorConfig {
    /// Load configuration using the standard search order.
    ///
    /// A file that is named (explicitly or through the environment) but
    /// cannot be read, parsed or validated is an error; there is no silent
    /// fallback to defaults.
    pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        if let Some(path) = explicit {
            let (config, warnings) = Self::load_from_file(path)?;
            return Ok(LoadedConfig {
                config,
                source: ConfigSource::Explicit(path.to_path_buf()),
                warnings,
            });
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(path);
            let (config, warnings) = Self::load_from_file(&p)?;
            return Ok(LoadedConfig {
                config,
                source: ConfigSource::Environment(p),
                warnings,
            });
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            let (config, warnings) = Self::load_from_file(&local)?;
            return Ok(LoadedConfig {
                config,
                source: ConfigSource::WorkingDir(local),
                warnings,
            });
        }

        let config = Self::default();
        config.validate()?;
        Ok(LoadedConfig {
            config,
            source: ConfigSource::Defaults,
            warnings: Vec::new(),
        })
    }

    /// Load and validate a specific TOML file, returning unknown-key warnings.
    pub fn load_from_file(path: &Path) -> Result<(Self, Vec<ValidationWarning>), ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(contents: &str) -> Result<(Self, Vec<ValidationWarning>), ConfigError> {
        // Two-pass: unknown keys first (warnings only)
        let warnings = validate_unknown_keys(contents);
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok((config, warnings))
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Same as [`to_toml`](Self::to_toml) with the remote password masked.
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut copy = self.clone();
        if !copy.remote.password.is_empty() {
            copy.remote.password = "********".to_string();
        }
        copy.to_toml()
    }

    /// True when a remote endpoint is configured.
    pub fn replication_enabled(&self) -> bool {
        self.remote.endpoint.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    /// Validate every section, collecting all violations.
    ///
    /// Rules:
    /// - `buff_size > window_size > 0`
    /// - `anomaly_threshold > 1.0`, `max_median_frequency > 0`
    /// - coordinates finite and in range; not both zero when replicating
    /// - queue and backoff settings positive, `max_backoff >= initial_backoff`
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();
        let d = &self.detector;

        if d.window_size == 0 {
            errors.push("detector.window_size must be > 0".to_string());
        }
        if d.buff_size <= d.window_size {
            errors.push(format!(
                "detector.buff_size ({}) must be greater than detector.window_size ({})",
                d.buff_size, d.window_size
            ));
        }
        // NaN comparisons silently pass, so check finiteness first
        if !d.anomaly_threshold.is_finite() || d.anomaly_threshold <= 1.0 {
            errors.push(format!(
                "detector.anomaly_threshold ({}) must be a finite value > 1.0",
                d.anomaly_threshold
            ));
        }
        if !d.max_median_frequency.is_finite() || d.max_median_frequency <= 0.0 {
            errors.push(format!(
                "detector.max_median_frequency ({}) must be a finite value > 0",
                d.max_median_frequency
            ));
        }

        if self.storage.dispatch_capacity == 0 {
            errors.push("storage.dispatch_capacity must be > 0".to_string());
        }

        let u = &self.user;
        if !u.latitude.is_finite() || !(-90.0..=90.0).contains(&u.latitude) {
            errors.push(format!("user.latitude ({}) must be within -90..=90", u.latitude));
        }
        if !u.longitude.is_finite() || !(-180.0..=180.0).contains(&u.longitude) {
            errors.push(format!("user.longitude ({}) must be within -180..=180", u.longitude));
        }

        if self.replication_enabled() {
            let r = &self.remote;
            let endpoint = r.endpoint.as_deref().unwrap_or_default();
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                errors.push(format!("remote.endpoint ({endpoint}) must be an http(s) URL"));
            }
            if u.name.trim().is_empty() {
                errors.push("user.name must be set when remote.endpoint is configured".to_string());
            }
            if u.latitude == 0.0 && u.longitude == 0.0 {
                errors.push(
                    "user.latitude and user.longitude must be set when remote.endpoint is configured"
                        .to_string(),
                );
            }
            if r.initial_backoff_secs == 0 {
                errors.push("remote.initial_backoff_secs must be > 0".to_string());
            }
            if r.max_backoff_secs < r.initial_backoff_secs {
                errors.push(format!(
                    "remote.max_backoff_secs ({}) must be >= remote.initial_backoff_secs ({})",
                    r.max_backoff_secs, r.initial_backoff_secs
                ));
            }
            if r.queue_capacity == 0 {
                errors.push("remote.queue_capacity must be > 0".to_string());
            }
            if r.timeout_secs == 0 {
                errors.push("remote.timeout_secs must be > 0".to_string());
            }
            if r.queue_file.trim().is_empty() {
                errors.push("remote.queue_file must not be empty".to_string());
            }
        }

        if self.logging.progress_interval == 0 {
            errors.push("logging.progress_interval must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Detector
// ============================================================================

/// Which clock stamps incoming events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampSource {
    /// Host wall clock at line receipt
    #[default]
    Host,
    /// Detector's own millisecond clock, anchored to the first host receipt
    Detector,
}

/// Ring buffer, window and anomaly rule parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Ring buffer capacity `C` (events)
    #[serde(default = "default_buff_size")]
    pub buff_size: usize,

    /// Sliding window width `W` (events)
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Multiplicative sensitivity `T`
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,

    /// Ceiling `M` on a trustworthy baseline (events/s)
    #[serde(default = "default_max_median_frequency")]
    pub max_median_frequency: f64,

    /// Persist a snapshot every primed cycle, not only on anomalies
    #[serde(default)]
    pub save_all: bool,

    /// Persist at most one anomaly snapshot per `window_size` ingested records
    #[serde(default = "default_true")]
    pub dedupe_anomalies: bool,

    #[serde(default)]
    pub timestamp_source: TimestampSource,

    /// Data begins after the first line containing this text (empty = unused)
    #[serde(default)]
    pub start_string: String,

    /// Number of leading lines to discard when `start_string` is empty
    #[serde(default)]
    pub ignore_header_lines: u32,
}

fn default_buff_size() -> usize { 200 }
fn default_window_size() -> usize { 10 }
fn default_anomaly_threshold() -> f64 { 2.0 }
fn default_max_median_frequency() -> f64 { 1.0 }
fn default_true() -> bool { true }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            buff_size: default_buff_size(),
            window_size: default_window_size(),
            anomaly_threshold: default_anomaly_threshold(),
            max_median_frequency: default_max_median_frequency(),
            save_all: false,
            dedupe_anomalies: true,
            timestamp_source: TimestampSource::Host,
            start_string: String::new(),
            ignore_header_lines: 0,
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory under which one session directory is created per run
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Refuse snapshot writes when the filesystem has less free space (MiB)
    #[serde(default = "default_min_free_mb")]
    pub min_free_mb: u64,

    /// Pending snapshot writes held between the loop and the writer
    #[serde(default = "default_dispatch_capacity")]
    pub dispatch_capacity: usize,
}

fn default_root_dir() -> PathBuf { PathBuf::from("muon_data") }
fn default_min_free_mb() -> u64 { 50 }
fn default_dispatch_capacity() -> usize { 64 }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            min_free_mb: default_min_free_mb(),
            dispatch_capacity: default_dispatch_capacity(),
        }
    }
}

// ============================================================================
// User / Site
// ============================================================================

/// Station owner and location; forms the remote directory name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default = "default_user_name")]
    pub name: String,

    /// Decimal degrees
    #[serde(default)]
    pub latitude: f64,

    /// Decimal degrees
    #[serde(default)]
    pub longitude: f64,
}

fn default_user_name() -> String { "station".to_string() }

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            name: default_user_name(),
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}

// ============================================================================
// Remote
// ============================================================================

/// WebDAV-style remote store. No endpoint disables replication entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL, e.g. `https://dav.example.org/muon`
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub user_name: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Give up on a file after this many failed uploads (0 = never)
    #[serde(default)]
    pub max_attempts: u32,

    /// Add up to 10 % random jitter to each backoff
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Maximum files waiting for upload; the oldest is dropped beyond this
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Pending uploads saved at shutdown, relative to `storage.root_dir`
    #[serde(default = "default_queue_file")]
    pub queue_file: String,

    /// Per-request HTTP timeout
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_initial_backoff() -> u64 { 2 }
fn default_max_backoff() -> u64 { 300 }
fn default_queue_capacity() -> usize { 100 }
fn default_queue_file() -> String { "upload_queue.txt".to_string() }
fn default_timeout() -> u64 { 30 }

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            user_name: String::new(),
            password: String::new(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_attempts: 0,
            jitter: true,
            queue_capacity: default_queue_capacity(),
            queue_file: default_queue_file(),
            timeout_secs: default_timeout(),
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_level")]
    pub level: String,

    /// Log a progress line every N events
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
}

fn default_level() -> String { "info".to_string() }
fn default_progress_interval() -> u64 { 100 }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            progress_interval: default_progress_interval(),
        }
    }
}
