//! Run-wide, read-only context handed to the pipeline at construction.

use crate::config::MonitorConfig;
use crate::remote::user_id;
use crate::storage::{SessionLayout, SnapshotHeader};
use std::path::PathBuf;

/// Everything the pipeline tasks need to know about this run.
///
/// Built once at startup and never mutated; tasks receive clones or
/// references instead of reading any global.
#[derive(Debug, Clone)]
pub struct MonitorContext {
    pub config: MonitorConfig,
    /// Station identifier, also the remote directory name
    pub user_id: String,
    pub session: SessionLayout,
}

impl MonitorContext {
    pub fn new(config: MonitorConfig, session: SessionLayout) -> Self {
        let user_id = user_id(&config.user);
        Self {
            config,
            user_id,
            session,
        }
    }

    pub fn snapshot_header(&self) -> SnapshotHeader {
        SnapshotHeader {
            user_id: self.user_id.clone(),
            buff_size: self.config.detector.buff_size,
            window_size: self.config.detector.window_size,
            anomaly_threshold: self.config.detector.anomaly_threshold,
        }
    }

    /// Where the upload queue is saved between runs.
    pub fn queue_file(&self) -> PathBuf {
        self.session.root().join(&self.config.remote.queue_file)
    }
}
