//! System-wide default constants.
//!
//! Values that are not operator-tunable live here, grouped by subsystem.

// ============================================================================
// Configuration
// ============================================================================

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MUON_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "muon_config.toml";

// ============================================================================
// Acquisition
// ============================================================================

/// Capacity of the channel between the ingest task and the acquisition loop.
///
/// Cosmic-ray coincidence rates are well under 10 Hz; 1 024 lines is minutes
/// of slack if the loop stalls.
pub const INGEST_CHANNEL_CAPACITY: usize = 1_024;

/// Number of leading events logged at info level; later ones go to debug.
pub const VERBOSE_EVENT_COUNT: u64 = 3;

/// Base delay between replayed lines at `--speed 1` (milliseconds).
///
/// `delay_ms = FILE_REPLAY_BASE_DELAY_MS / speed`
pub const FILE_REPLAY_BASE_DELAY_MS: u64 = 1_000;

// ============================================================================
// TCP Source
// ============================================================================

/// Initial reconnection delay (doubles each attempt).
pub const TCP_INITIAL_RECONNECT_DELAY_SECS: u64 = 2;

/// Maximum reconnection delay cap (seconds).
pub const TCP_MAX_RECONNECT_DELAY_SECS: u64 = 60;

/// Connect timeout for one TCP attempt (seconds).
pub const TCP_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Silence on an open connection before it is treated as dead (seconds).
///
/// Coincidence rates are around 0.1 Hz, so five minutes without a line
/// means the detector or the link is gone.
pub const TCP_STALE_CONNECTION_SECS: u64 = 300;

// ============================================================================
// Storage
// ============================================================================

/// Activity log written inside each session directory.
pub const SESSION_LOG_FILE: &str = "muon_log.txt";

/// Session directory name format (local time).
pub const SESSION_DIR_FORMAT: &str = "%y%m%d_%H%M%S";

/// Version stamped into the first line of every snapshot file.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// How long the persistence worker may spend draining at shutdown (seconds).
pub const PERSIST_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Grace period after the drain timeout before remaining tasks are aborted (seconds).
pub const SHUTDOWN_ABORT_GRACE_SECS: u64 = 5;

// ============================================================================
// Replication
// ============================================================================

/// Upper bound of random jitter added to each backoff, as a fraction of it.
pub const BACKOFF_JITTER_FRACTION: f64 = 0.1;

/// How often an idle replicator re-checks its queue (milliseconds).
pub const REPLICATOR_IDLE_POLL_MS: u64 = 500;

/// When input ends normally, how long the replicator may keep uploading
/// before it is stopped (seconds).
pub const REPLICATOR_FLUSH_TIMEOUT_SECS: u64 = 30;
