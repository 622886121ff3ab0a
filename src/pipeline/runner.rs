//! Task wiring and supervision.
//!
//! ```text
//! Ingest ──mpsc──▶ Acquisition ──DispatchQueue──▶ Persistence ──RetryQueue──▶ Replicator
//! ```
//!
//! Shutdown order: the root token stops Ingest and Acquisition; Acquisition
//! closes the dispatch queue; Persistence drains what was already queued
//! (bounded by the drain timeout); only then is the replicator's own token
//! cancelled, so it logs and saves whatever is still unsent.

use super::context::MonitorContext;
use super::engine::{CycleEngine, LoopStats};
use super::processing_loop::{run_ingest, AcquisitionLoop, IngestStats};
use super::source::EventSource;
use crate::acquisition::{LineParser, ParserOptions};
use crate::config::defaults::{
    INGEST_CHANNEL_CAPACITY, PERSIST_DRAIN_TIMEOUT_SECS, REPLICATOR_FLUSH_TIMEOUT_SECS,
    SHUTDOWN_ABORT_GRACE_SECS,
};
use crate::remote::{Clock, RemoteStore, Replicator, ReplicatorReport, ReplicatorSettings, RetryQueue};
use crate::storage::{DispatchQueue, DispatchStats, PersistStats, PersistenceWorker, SnapshotWriter};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskName {
    Ingest,
    Acquisition,
    Persistence,
    Replicator,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::Ingest => write!(f, "Ingest"),
            TaskName::Acquisition => write!(f, "Acquisition"),
            TaskName::Persistence => write!(f, "Persistence"),
            TaskName::Replicator => write!(f, "Replicator"),
        }
    }
}

/// What each task hands back when it finishes.
#[derive(Debug)]
enum TaskReport {
    Ingest(IngestStats),
    Acquisition(LoopStats),
    Persistence(PersistStats),
    Replicator(ReplicatorReport),
}

impl TaskReport {
    fn name(&self) -> TaskName {
        match self {
            TaskReport::Ingest(_) => TaskName::Ingest,
            TaskReport::Acquisition(_) => TaskName::Acquisition,
            TaskReport::Persistence(_) => TaskName::Persistence,
            TaskReport::Replicator(_) => TaskName::Replicator,
        }
    }
}

// ============================================================================
// Pipeline Setup
// ============================================================================

/// Remote replication collaborators. Absent when no endpoint is configured.
pub struct Replication {
    pub store: Arc<dyn RemoteStore>,
    pub clock: Arc<dyn Clock>,
    pub queue: Arc<RetryQueue>,
    pub settings: ReplicatorSettings,
}

/// Shutdown timing.
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    /// Time persistence may take to drain after cancellation
    pub drain_timeout: Duration,
    /// Time the replicator may keep uploading after input ends normally
    pub flush_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(PERSIST_DRAIN_TIMEOUT_SECS),
            flush_timeout: Duration::from_secs(REPLICATOR_FLUSH_TIMEOUT_SECS),
        }
    }
}

/// Final statistics of every task that reported.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub ingest: Option<IngestStats>,
    pub acquisition: Option<LoopStats>,
    pub persistence: Option<PersistStats>,
    pub replication: Option<ReplicatorReport>,
    pub dispatch: DispatchStats,
}

/// Run the acquisition pipeline until the source ends or `cancel` fires.
pub async fn run_pipeline<S: EventSource>(
    ctx: &MonitorContext,
    source: S,
    replication: Option<Replication>,
    cancel: CancellationToken,
    options: PipelineOptions,
) -> Result<PipelineReport> {
    let detector = &ctx.config.detector;
    info!(
        session = %ctx.session.dir().display(),
        user_id = %ctx.user_id,
        buff_size = detector.buff_size,
        window_size = detector.window_size,
        threshold = detector.anomaly_threshold,
        ceiling = detector.max_median_frequency,
        save_all = detector.save_all,
        replication = replication.is_some(),
        "Starting acquisition pipeline"
    );

    let dispatch = Arc::new(DispatchQueue::new(ctx.config.storage.dispatch_capacity));
    let writer = Arc::new(SnapshotWriter::new(
        ctx.session.clone(),
        ctx.snapshot_header(),
        ctx.config.storage.min_free_mb,
    ));
    let retry_queue = replication.as_ref().map(|r| Arc::clone(&r.queue));
    let replicator_cancel = CancellationToken::new();

    let mut task_set: JoinSet<Result<TaskReport>> = JoinSet::new();

    // Task 1: Ingest
    let (tx, rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
    let parser = LineParser::new(ParserOptions::from_config(detector));
    let ingest_cancel = cancel.clone();
    task_set.spawn(async move {
        let stats = run_ingest(source, parser, tx, ingest_cancel).await?;
        Ok(TaskReport::Ingest(stats))
    });

    // Task 2: Acquisition
    let acquisition = AcquisitionLoop::new(
        CycleEngine::new(detector),
        Arc::clone(&dispatch),
        cancel.clone(),
        ctx.config.logging.progress_interval,
    );
    task_set.spawn(async move { Ok(TaskReport::Acquisition(acquisition.run(rx).await)) });

    // Task 3: Persistence
    let worker = PersistenceWorker::new(Arc::clone(&dispatch), writer, retry_queue.clone());
    task_set.spawn(async move { Ok(TaskReport::Persistence(worker.run().await)) });

    // Task 4: Replicator
    if let Some(replication) = replication {
        let replicator = Replicator::new(
            replication.store,
            replication.queue,
            replication.clock,
            replication.settings,
        );
        let token = replicator_cancel.clone();
        task_set.spawn(async move { Ok(TaskReport::Replicator(replicator.run(token).await)) });
    }

    let supervisor = Supervisor {
        cancel,
        replicator_cancel,
        dispatch: Arc::clone(&dispatch),
        retry_queue,
        options,
    };
    let mut report = supervisor.run(&mut task_set).await?;
    report.dispatch = dispatch.stats();
    Ok(report)
}

// ============================================================================
// Supervisor
// ============================================================================

struct Supervisor {
    cancel: CancellationToken,
    replicator_cancel: CancellationToken,
    dispatch: Arc<DispatchQueue>,
    retry_queue: Option<Arc<RetryQueue>>,
    options: PipelineOptions,
}

impl Supervisor {
    /// Monitor tasks until all have finished, enforcing the shutdown order.
    async fn run(self, task_set: &mut JoinSet<Result<TaskReport>>) -> Result<PipelineReport> {
        info!("Supervisor: all tasks spawned, monitoring");

        let mut report = PipelineReport::default();
        let mut first_error: Option<anyhow::Error> = None;
        let mut persistence_done = false;
        let mut drain_deadline: Option<Instant> = None;
        let mut drain_expired = false;
        let mut abort_deadline: Option<Instant> = None;
        let mut flush_deadline: Option<Instant> = None;

        loop {
            let flushing = flush_deadline.is_some() && !self.replicator_cancel.is_cancelled();

            tokio::select! {
                _ = self.cancel.cancelled(), if drain_deadline.is_none() => {
                    info!("Supervisor: shutdown signal received, draining persistence");
                    drain_deadline = Some(Instant::now() + self.options.drain_timeout);
                    if persistence_done {
                        self.replicator_cancel.cancel();
                    }
                }
                _ = sleep_until_opt(drain_deadline), if !persistence_done && !drain_expired => {
                    drain_expired = true;
                    warn!(
                        pending = self.dispatch.len(),
                        "Supervisor: persistence did not drain in time"
                    );
                    self.dispatch.close();
                    self.replicator_cancel.cancel();
                    abort_deadline = Some(Instant::now() + Duration::from_secs(SHUTDOWN_ABORT_GRACE_SECS));
                }
                _ = sleep_until_opt(abort_deadline) => {
                    error!("Supervisor: tasks still running after grace period, aborting");
                    task_set.abort_all();
                    abort_deadline = None;
                }
                _ = self.wait_flushed(flush_deadline), if flushing => {
                    info!("Supervisor: replication flush finished");
                    self.replicator_cancel.cancel();
                }
                result = task_set.join_next() => {
                    match result {
                        Some(Ok(Ok(task))) => {
                            info!("Supervisor: task {} completed normally", task.name());
                            match task {
                                TaskReport::Ingest(stats) => report.ingest = Some(stats),
                                TaskReport::Acquisition(stats) => report.acquisition = Some(stats),
                                TaskReport::Persistence(stats) => {
                                    report.persistence = Some(stats);
                                    persistence_done = true;
                                    if self.cancel.is_cancelled() {
                                        self.replicator_cancel.cancel();
                                    } else if self.retry_queue.is_some() {
                                        info!(
                                            timeout_secs = self.options.flush_timeout.as_secs_f64(),
                                            "Supervisor: input finished, letting replication flush"
                                        );
                                        flush_deadline = Some(Instant::now() + self.options.flush_timeout);
                                    }
                                }
                                TaskReport::Replicator(stats) => report.replication = Some(stats),
                            }
                        }
                        Some(Ok(Err(e))) => {
                            error!("Supervisor: task failed with error: {:#}", e);
                            self.cancel.cancel();
                            first_error.get_or_insert(e);
                        }
                        Some(Err(e)) if e.is_cancelled() => {
                            warn!("Supervisor: task aborted");
                        }
                        Some(Err(e)) => {
                            error!("Supervisor: task panicked: {}", e);
                            self.cancel.cancel();
                            first_error.get_or_insert_with(|| anyhow::anyhow!("Task panicked: {}", e));
                        }
                        None => {
                            info!("Supervisor: all tasks completed");
                            break;
                        }
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Resolves when the retry queue is empty or the flush deadline passes.
    async fn wait_flushed(&self, deadline: Option<Instant>) {
        let Some(deadline) = deadline else {
            return std::future::pending().await;
        };
        loop {
            let empty = self.retry_queue.as_ref().map_or(true, |q| q.is_empty());
            let now = Instant::now();
            if empty || now >= deadline {
                return;
            }
            let step = (deadline - now).min(Duration::from_millis(100));
            tokio::time::sleep(step).await;
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
