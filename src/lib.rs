//! muon-watch: coincidence muon detector acquisition
//!
//! Rolling-rate anomaly detection for a desktop muon detector pair.
//!
//! ## Architecture
//!
//! - **Acquisition**: detector line parsing into timestamped event records
//! - **Buffer**: fixed-capacity rolling event history
//! - **Baseline**: sliding-window rates, median baseline, anomaly rule
//! - **Pipeline**: ingest / acquisition / persistence / replication tasks
//! - **Storage**: per-run session directory and CSV snapshots
//! - **Remote**: best-effort WebDAV replication of anomaly snapshots

pub mod acquisition;
pub mod baseline;
pub mod buffer;
pub mod config;
pub mod pipeline;
pub mod remote;
pub mod storage;
pub mod types;

// Re-export configuration
pub use config::{ConfigError, MonitorConfig};

// Re-export commonly used types
pub use types::{
    AnomalyFlag, BufferSnapshot, Classification, Decision, Direction, EventRecord, SuppressReason,
};

// Re-export pipeline entry points
pub use buffer::RingBuffer;
pub use pipeline::{run_pipeline, MonitorContext, PipelineOptions, PipelineReport, Replication};
