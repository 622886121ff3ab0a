//! Remote Replicator - best-effort upload of anomaly snapshots
//!
//! ## State Machine
//!
//! ```text
//!   Disconnected --(work queued, backoff elapsed)--> Connecting
//!   Connecting   --ok--> Connected
//!   Connecting   --err--> Disconnected (retry scheduled)
//!   Connected    --(file queued)--> Uploading
//!   Uploading    --ok--> Connected
//!   Uploading    --err--> Disconnected (file re-queued, retry scheduled)
//! ```
//!
//! The replicator only ever reads the retry queue and local files; it never
//! deletes anything on disk. On cancellation it puts any in-flight file
//! back, logs every unsent file and saves the queue for the next run. Files
//! the bounded queue evicted are logged as permanently failed.

use super::clock::Clock;
use super::client::{RemoteError, RemoteStore};
use super::queue::{PendingUpload, RetryQueue};
use crate::config::defaults::{BACKOFF_JITTER_FRACTION, REPLICATOR_IDLE_POLL_MS};
use crate::config::RemoteConfig;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// Backoff
// ============================================================================

/// Exponential retry delay: `min(initial * 2^(n-1), max)` for the n-th failure.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Backoff {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            initial: Duration::from_secs(config.initial_backoff_secs),
            max: Duration::from_secs(config.max_backoff_secs),
            jitter: config.jitter,
        }
    }

    /// Delay without jitter. Non-decreasing in `failures`, never above `max`.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay with up to 10 % random jitter, still capped at `max`.
    ///
    /// Jitter is smaller than the doubling step, so the sequence stays
    /// non-decreasing.
    pub fn delay(&self, failures: u32) -> Duration {
        let base = self.base_delay(failures);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let fraction = rand::thread_rng().gen_range(0.0..BACKOFF_JITTER_FRACTION);
        (base + base.mul_f64(fraction)).min(self.max)
    }
}

// ============================================================================
// Replicator
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicatorState {
    Disconnected,
    Connecting,
    Connected,
    Uploading(PathBuf),
}

/// Result of one state-machine step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Nothing queued
    Idle,
    /// Disconnected and backing off until the given instant
    Waiting(Instant),
    Connected,
    ConnectFailed { retry_in: Duration },
    Uploaded(PathBuf),
    UploadFailed { path: PathBuf, retry_in: Duration },
    /// File dropped without upload (missing locally, or out of attempts)
    Dropped(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ReplicatorSettings {
    pub backoff: Backoff,
    /// Failed uploads before a file is given up on (0 = never)
    pub max_attempts: u32,
    /// Where pending uploads are saved at shutdown
    pub queue_file: Option<PathBuf>,
}

impl ReplicatorSettings {
    pub fn from_config(config: &RemoteConfig, queue_file: Option<PathBuf>) -> Self {
        Self {
            backoff: Backoff::from_config(config),
            max_attempts: config.max_attempts,
            queue_file,
        }
    }
}

/// Counters reported when the replicator stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicatorReport {
    pub uploaded: u64,
    pub connect_failures: u64,
    pub upload_failures: u64,
    pub given_up: u64,
    pub missing: u64,
    /// Files still queued at shutdown
    pub unsent: Vec<PathBuf>,
    /// Files evicted from the full queue, never replicated
    pub evicted: Vec<PathBuf>,
}

pub struct Replicator {
    store: Arc<dyn RemoteStore>,
    queue: Arc<RetryQueue>,
    clock: Arc<dyn Clock>,
    settings: ReplicatorSettings,
    state: ReplicatorState,
    consecutive_failures: u32,
    retry_at: Option<Instant>,
    in_flight: Option<PendingUpload>,
    /// Last connection error logged at warn; repeats go to debug
    last_error: Option<String>,
    report: ReplicatorReport,
}

impl Replicator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        queue: Arc<RetryQueue>,
        clock: Arc<dyn Clock>,
        settings: ReplicatorSettings,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            settings,
            state: ReplicatorState::Disconnected,
            consecutive_failures: 0,
            retry_at: None,
            in_flight: None,
            last_error: None,
            report: ReplicatorReport::default(),
        }
    }

    pub fn state(&self) -> &ReplicatorState {
        &self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn report(&self) -> &ReplicatorReport {
        &self.report
    }

    /// Advance the state machine by one transition.
    pub async fn step(&mut self) -> Step {
        match self.state {
            ReplicatorState::Disconnected | ReplicatorState::Connecting => self.try_connect().await,
            ReplicatorState::Connected | ReplicatorState::Uploading(_) => self.try_upload().await,
        }
    }

    async fn try_connect(&mut self) -> Step {
        if self.queue.is_empty() {
            return Step::Idle;
        }
        if let Some(at) = self.retry_at {
            if self.clock.now() < at {
                return Step::Waiting(at);
            }
        }

        self.state = ReplicatorState::Connecting;
        match self.store.connect().await {
            Ok(()) => {
                if self.consecutive_failures > 0 {
                    info!(
                        store = %self.store.describe(),
                        failures = self.consecutive_failures,
                        "Remote store reachable again"
                    );
                } else {
                    info!(store = %self.store.describe(), "Connected to remote store");
                }
                self.state = ReplicatorState::Connected;
                self.consecutive_failures = 0;
                self.retry_at = None;
                self.last_error = None;
                Step::Connected
            }
            Err(e) => {
                self.report.connect_failures += 1;
                let retry_in = self.schedule_retry(&e);
                Step::ConnectFailed { retry_in }
            }
        }
    }

    async fn try_upload(&mut self) -> Step {
        let Some(item) = self.queue.pop() else {
            self.state = ReplicatorState::Connected;
            return Step::Idle;
        };

        if !item.path.exists() {
            info!(path = %item.path.display(), "Queued file no longer exists, dropping");
            self.report.missing += 1;
            return Step::Dropped(item.path);
        }

        let path = item.path.clone();
        self.state = ReplicatorState::Uploading(path.clone());
        self.in_flight = Some(item);
        let result = self.store.upload(&path).await;
        let mut item = match self.in_flight.take() {
            Some(item) => item,
            None => PendingUpload::new(path.clone()),
        };

        match result {
            Ok(()) => {
                self.state = ReplicatorState::Connected;
                self.report.uploaded += 1;
                info!(path = %path.display(), "Snapshot replicated");
                Step::Uploaded(path)
            }
            Err(RemoteError::MissingFile(_)) => {
                self.state = ReplicatorState::Connected;
                info!(path = %path.display(), "Queued file no longer exists, dropping");
                self.report.missing += 1;
                Step::Dropped(path)
            }
            Err(e) => {
                self.report.upload_failures += 1;
                item.attempts += 1;
                let retry_in = self.schedule_retry(&e);
                if self.settings.max_attempts > 0 && item.attempts >= self.settings.max_attempts {
                    error!(
                        path = %path.display(),
                        attempts = item.attempts,
                        error = %e,
                        "Giving up on snapshot upload"
                    );
                    self.report.given_up += 1;
                    return Step::Dropped(path);
                }
                self.queue.requeue(item);
                Step::UploadFailed { path, retry_in }
            }
        }
    }

    /// Record a failure, drop to Disconnected and schedule the next attempt.
    fn schedule_retry(&mut self, e: &RemoteError) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let retry_in = self.settings.backoff.delay(self.consecutive_failures);
        self.retry_at = Some(self.clock.now() + retry_in);
        self.state = ReplicatorState::Disconnected;

        let message = e.to_string();
        if self.last_error.as_deref() == Some(message.as_str()) {
            debug!(error = %message, retry_in_secs = retry_in.as_secs_f64(), "Remote store still failing");
        } else {
            warn!(
                store = %self.store.describe(),
                error = %message,
                retry_in_secs = retry_in.as_secs_f64(),
                "Remote store failure, will retry"
            );
            self.last_error = Some(message);
        }
        retry_in
    }

    /// Run until cancelled, then log unsent files and save the queue.
    pub async fn run(mut self, cancel: CancellationToken) -> ReplicatorReport {
        info!(store = %self.store.describe(), "[Replicator] Task starting");
        let idle_poll = Duration::from_millis(REPLICATOR_IDLE_POLL_MS);

        // A started connect or upload runs to completion (bounded by the
        // store's request timeout); cancellation is observed between steps.
        while !cancel.is_cancelled() {
            match self.step().await {
                Step::Idle => {
                    let deadline = self.clock.now() + idle_poll;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.queue.notified() => {}
                        _ = self.clock.sleep_until(deadline) => {}
                    }
                }
                Step::Waiting(until) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.clock.sleep_until(until) => {}
                    }
                }
                _ => {}
            }
        }

        self.shutdown()
    }

    /// Return the in-flight file to the queue, log what is unsent and save it.
    pub fn shutdown(mut self) -> ReplicatorReport {
        if let Some(item) = self.in_flight.take() {
            self.queue.requeue(item);
        }

        let unsent = self.queue.paths();
        for path in &unsent {
            warn!(path = %path.display(), "Snapshot not replicated before shutdown");
        }
        let evicted = self.queue.take_evicted();
        for path in &evicted {
            error!(
                path = %path.display(),
                "Snapshot permanently failed to replicate: evicted from full upload queue"
            );
        }

        if let Some(queue_file) = &self.settings.queue_file {
            if let Err(e) = self.queue.save(queue_file) {
                error!(error = %e, "Failed to save upload queue");
            }
        }

        info!(
            uploaded = self.report.uploaded,
            unsent = unsent.len(),
            evicted = evicted.len(),
            "[Replicator] Stopped"
        );
        self.report.unsent = unsent;
        self.report.evicted = evicted;
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::clock::ManualClock;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Store that fails while `down` is set and records uploads.
    #[derive(Default)]
    struct FakeStore {
        down: AtomicBool,
        reject_uploads: AtomicBool,
        connects: AtomicU32,
        uploaded: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl RemoteStore for FakeStore {
        async fn connect(&self) -> Result<(), RemoteError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                Err(RemoteError::Connection("connection refused".into()))
            } else {
                Ok(())
            }
        }

        async fn upload(&self, local: &Path) -> Result<(), RemoteError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(RemoteError::Connection("connection reset".into()));
            }
            if self.reject_uploads.load(Ordering::SeqCst) {
                return Err(RemoteError::Status { status: 507, url: "x".into() });
            }
            self.uploaded.lock().unwrap().push(local.to_path_buf());
            Ok(())
        }

        fn describe(&self) -> String {
            "fake://store/".into()
        }
    }

    fn backoff() -> Backoff {
        Backoff {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(300),
            jitter: false,
        }
    }

    fn setup(
        max_attempts: u32,
    ) -> (Replicator, Arc<FakeStore>, Arc<RetryQueue>, Arc<ManualClock>, tempfile::TempDir) {
        let store = Arc::new(FakeStore::default());
        let queue = Arc::new(RetryQueue::new(100));
        let clock = Arc::new(ManualClock::new());
        let dir = tempfile::tempdir().unwrap();
        let replicator = Replicator::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            ReplicatorSettings {
                backoff: backoff(),
                max_attempts,
                queue_file: Some(dir.path().join("upload_queue.txt")),
            },
        );
        (replicator, store, queue, clock, dir)
    }

    fn local_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, "data").unwrap();
        path
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let b = backoff();
        let delays: Vec<u64> = (1..=10).map(|n| b.base_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 64, 128, 256, 300, 300]);
        assert_eq!(b.base_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_jittered_backoff_non_decreasing_and_bounded() {
        let b = Backoff { jitter: true, ..backoff() };
        let mut previous = Duration::ZERO;
        for n in 1..40 {
            let d = b.delay(n);
            assert!(d >= previous, "delay {n} went down");
            assert!(d >= b.base_delay(n));
            assert!(d <= b.max);
            previous = d;
        }
    }

    #[tokio::test]
    async fn test_idle_without_work() {
        let (mut r, store, ..) = setup(0);
        assert_eq!(r.step().await, Step::Idle);
        assert_eq!(store.connects.load(Ordering::SeqCst), 0);
        assert_eq!(r.state(), &ReplicatorState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_then_upload() {
        let (mut r, store, queue, _clock, dir) = setup(0);
        let file = local_file(&dir, "a.csv");
        queue.enqueue(file.clone());

        assert_eq!(r.step().await, Step::Connected);
        assert_eq!(r.state(), &ReplicatorState::Connected);
        assert_eq!(r.step().await, Step::Uploaded(file.clone()));
        assert_eq!(r.step().await, Step::Idle);

        assert_eq!(store.uploaded.lock().unwrap().clone(), vec![file.clone()]);
        assert!(queue.is_empty());
        // local files are never removed
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_unreachable_store_backs_off_and_keeps_files() {
        let (mut r, store, queue, clock, dir) = setup(0);
        store.down.store(true, Ordering::SeqCst);
        queue.enqueue(local_file(&dir, "a.csv"));
        queue.enqueue(local_file(&dir, "b.csv"));

        assert_eq!(r.step().await, Step::ConnectFailed { retry_in: Duration::from_secs(2) });
        assert_eq!(r.state(), &ReplicatorState::Disconnected);
        // still inside the backoff window: no new attempt
        assert!(matches!(r.step().await, Step::Waiting(_)));
        assert_eq!(store.connects.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(2));
        assert_eq!(r.step().await, Step::ConnectFailed { retry_in: Duration::from_secs(4) });
        clock.advance(Duration::from_secs(4));
        assert_eq!(r.step().await, Step::ConnectFailed { retry_in: Duration::from_secs(8) });

        assert_eq!(queue.len(), 2);
        assert_eq!(r.consecutive_failures(), 3);

        // recovery resets the schedule and drains the queue
        store.down.store(false, Ordering::SeqCst);
        clock.advance(Duration::from_secs(8));
        assert_eq!(r.step().await, Step::Connected);
        assert_eq!(r.consecutive_failures(), 0);
        assert!(matches!(r.step().await, Step::Uploaded(_)));
        assert!(matches!(r.step().await, Step::Uploaded(_)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_upload_failure_requeues() {
        let (mut r, store, queue, _clock, dir) = setup(0);
        let file = local_file(&dir, "a.csv");
        queue.enqueue(file.clone());
        assert_eq!(r.step().await, Step::Connected);

        store.reject_uploads.store(true, Ordering::SeqCst);
        assert_eq!(
            r.step().await,
            Step::UploadFailed { path: file.clone(), retry_in: Duration::from_secs(2) }
        );
        assert_eq!(r.state(), &ReplicatorState::Disconnected);
        assert_eq!(queue.paths(), vec![file]);
    }

    #[tokio::test]
    async fn test_max_attempts_gives_up() {
        let (mut r, store, queue, clock, dir) = setup(2);
        store.reject_uploads.store(true, Ordering::SeqCst);
        let file = local_file(&dir, "a.csv");
        queue.enqueue(file.clone());

        assert_eq!(r.step().await, Step::Connected);
        assert!(matches!(r.step().await, Step::UploadFailed { .. }));
        clock.advance(Duration::from_secs(2));
        assert_eq!(r.step().await, Step::Connected);
        assert_eq!(r.step().await, Step::Dropped(file));
        assert!(queue.is_empty());
        assert_eq!(r.report().given_up, 1);
    }

    #[tokio::test]
    async fn test_missing_local_file_dropped() {
        let (mut r, _store, queue, _clock, dir) = setup(0);
        queue.enqueue(dir.path().join("vanished.csv"));
        assert_eq!(r.step().await, Step::Connected);
        assert!(matches!(r.step().await, Step::Dropped(_)));
        assert_eq!(r.report().missing, 1);
    }

    #[tokio::test]
    async fn test_shutdown_saves_unsent_queue() {
        let (r, store, queue, _clock, dir) = setup(0);
        store.down.store(true, Ordering::SeqCst);
        let file = local_file(&dir, "a.csv");
        queue.enqueue(file.clone());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(r.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let report = handle.await.unwrap();

        assert_eq!(report.unsent, vec![file.clone()]);
        assert!(report.connect_failures >= 1);
        let saved = std::fs::read_to_string(dir.path().join("upload_queue.txt")).unwrap();
        assert_eq!(saved.trim(), file.to_string_lossy());
    }

    #[test]
    fn test_overflow_reported_as_evicted_at_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::default());
        store.down.store(true, Ordering::SeqCst);
        let queue = Arc::new(RetryQueue::new(2));
        let queue_file = dir.path().join("upload_queue.txt");
        let r = Replicator::new(
            store,
            queue.clone(),
            Arc::new(ManualClock::new()),
            ReplicatorSettings {
                backoff: backoff(),
                max_attempts: 0,
                queue_file: Some(queue_file.clone()),
            },
        );

        let files: Vec<PathBuf> = ["a0.csv", "a1.csv", "a2.csv"]
            .iter()
            .map(|name| local_file(&dir, name))
            .collect();
        for file in &files {
            queue.enqueue(file.clone());
        }

        let report = r.shutdown();
        assert_eq!(report.evicted, vec![files[0].clone()]);
        assert_eq!(report.unsent, files[1..].to_vec());
        let mut accounted = report.evicted.clone();
        accounted.extend(report.unsent.iter().cloned());
        assert_eq!(accounted, files);
        assert!(queue_file.exists());
    }
}
