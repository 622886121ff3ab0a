//! Persistence worker task

use super::dispatch::{DispatchQueue, PersistJob};
use super::snapshot_writer::SnapshotWriter;
use super::PersistError;
use crate::remote::RetryQueue;
use crate::types::Classification;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Counters reported when the worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub anomaly_written: u64,
    pub all_written: u64,
    pub failed: u64,
    /// Anomaly files handed to the replicator
    pub forwarded: u64,
}

/// Drains the dispatch queue in order until it is closed and empty.
pub struct PersistenceWorker {
    queue: Arc<DispatchQueue>,
    writer: Arc<SnapshotWriter>,
    /// Present only when replication is enabled
    retry: Option<Arc<RetryQueue>>,
}

impl PersistenceWorker {
    pub fn new(
        queue: Arc<DispatchQueue>,
        writer: Arc<SnapshotWriter>,
        retry: Option<Arc<RetryQueue>>,
    ) -> Self {
        Self { queue, writer, retry }
    }

    pub async fn run(self) -> PersistStats {
        info!(
            session = %self.writer.session().dir().display(),
            replication = self.retry.is_some(),
            "[Persistence] Task starting"
        );
        let mut stats = PersistStats::default();

        while let Some(job) = self.queue.pop().await {
            let cycle = job.snapshot.cycle;
            let classification = job.classification;

            match self.write(job).await {
                Ok(path) => {
                    debug!(cycle, class = %classification, path = %path.display(), "Snapshot written");
                    match classification {
                        Classification::All => stats.all_written += 1,
                        Classification::Anomaly => {
                            stats.anomaly_written += 1;
                            info!(cycle, path = %path.display(), "Anomaly snapshot saved");
                            if let Some(retry) = &self.retry {
                                retry.enqueue(path);
                                stats.forwarded += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    stats.failed += 1;
                    match e {
                        PersistError::DiskFull { .. } => {
                            error!(cycle, class = %classification, error = %e, "Snapshot dropped")
                        }
                        _ => warn!(cycle, class = %classification, error = %e, "Snapshot write failed, dropped"),
                    }
                }
            }
        }

        info!(
            anomaly = stats.anomaly_written,
            all = stats.all_written,
            failed = stats.failed,
            "[Persistence] Queue drained, stopping"
        );
        stats
    }

    async fn write(&self, job: PersistJob) -> Result<PathBuf, PersistError> {
        let writer = Arc::clone(&self.writer);
        let PersistJob { snapshot, classification } = job;
        tokio::task::spawn_blocking(move || writer.write(&snapshot, classification))
            .await
            .unwrap_or_else(|e| {
                Err(PersistError::Io {
                    path: PathBuf::new(),
                    source: std::io::Error::other(e.to_string()),
                })
            })
    }
}
