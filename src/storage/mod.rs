//! Snapshot Persistence
//!
//! Local, durable storage of buffer snapshots. The acquisition loop never
//! touches the filesystem: it pushes [`PersistJob`]s onto the bounded
//! [`DispatchQueue`] and the [`PersistenceWorker`] writes them on a blocking
//! thread.
//!
//! ## Layout
//!
//! - **SessionLayout**: one directory per run under the configured root
//! - **SnapshotWriter**: CSV snapshot files in `anomaly/` and `all/`
//! - **DispatchQueue**: priority-aware hand-off (`all` writes drop first)
//! - **PersistenceWorker**: drains the queue, forwards anomaly files to replication
//!
//! A failed write is logged and the snapshot dropped; it is never retried
//! and never forwarded for replication.

pub mod disk;
pub mod dispatch;
pub mod session;
pub mod snapshot_writer;
mod worker;

pub use dispatch::{DispatchQueue, DispatchStats, PersistJob, PushOutcome};
pub use session::SessionLayout;
pub use snapshot_writer::{SnapshotHeader, SnapshotWriter};
pub use worker::{PersistStats, PersistenceWorker};

use std::path::{Path, PathBuf};

/// Snapshot persistence errors
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("insufficient disk space: {available_mb} MiB free, {required_mb} MiB required")]
    DiskFull { available_mb: u64, required_mb: u64 },

    #[error("storage root does not exist or is not a directory: {}", .0.display())]
    MissingRoot(PathBuf),

    #[error("snapshot has no events")]
    EmptySnapshot,
}

impl PersistError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        PersistError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
