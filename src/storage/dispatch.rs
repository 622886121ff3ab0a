//! Bounded, priority-aware hand-off from the acquisition loop to the
//! persistence worker.
//!
//! `push` never blocks. When the queue is full the oldest pending `all`
//! write is evicted first; an `anomaly` write is only ever evicted when the
//! whole queue is anomalies, and that is logged at error level.

use crate::types::{BufferSnapshot, Classification};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{error, warn};

/// One pending snapshot write.
#[derive(Debug, Clone)]
pub struct PersistJob {
    pub snapshot: Arc<BufferSnapshot>,
    pub classification: Classification,
}

/// What happened to a pushed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest pending write of the given class and cycle
    Evicted { classification: Classification, cycle: u64 },
    /// The pushed `all` job itself was dropped (queue full of anomalies)
    Discarded,
    /// Queue closed; nothing accepted
    Closed,
}

/// Dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub queued: u64,
    pub dropped_all: u64,
    pub dropped_anomaly: u64,
    pub high_water: usize,
}

#[derive(Debug, Default)]
struct DispatchState {
    jobs: VecDeque<PersistJob>,
    closed: bool,
    stats: DispatchStats,
}

/// Single-consumer job queue.
#[derive(Debug)]
pub struct DispatchQueue {
    state: Mutex<DispatchState>,
    notify: Notify,
    capacity: usize,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(DispatchState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Enqueue without blocking, evicting per the priority rule when full.
    pub fn push(&self, job: PersistJob) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }

            let outcome = if state.jobs.len() < self.capacity {
                PushOutcome::Queued
            } else if let Some(idx) = state
                .jobs
                .iter()
                .position(|j| j.classification == Classification::All)
            {
                let evicted = state.jobs.remove(idx);
                state.stats.dropped_all += 1;
                PushOutcome::Evicted {
                    classification: Classification::All,
                    cycle: evicted.map_or(0, |j| j.snapshot.cycle),
                }
            } else if job.classification == Classification::All {
                state.stats.dropped_all += 1;
                return PushOutcome::Discarded;
            } else {
                let evicted = state.jobs.pop_front();
                state.stats.dropped_anomaly += 1;
                PushOutcome::Evicted {
                    classification: Classification::Anomaly,
                    cycle: evicted.map_or(0, |j| j.snapshot.cycle),
                }
            };

            state.jobs.push_back(job);
            state.stats.queued += 1;
            state.stats.high_water = state.stats.high_water.max(state.jobs.len());
            outcome
        };

        match outcome {
            PushOutcome::Evicted { classification: Classification::Anomaly, cycle } => {
                error!(
                    cycle,
                    capacity = self.capacity,
                    "Persistence exhausted: dropped pending anomaly snapshot"
                );
            }
            PushOutcome::Evicted { cycle, .. } => {
                warn!(cycle, "Persistence backlog: dropped oldest pending save-all snapshot");
            }
            _ => {}
        }

        self.notify.notify_one();
        outcome
    }

    /// Wait for the next job. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<PersistJob> {
        loop {
            {
                let mut state = self.lock();
                if let Some(job) = state.jobs.pop_front() {
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting jobs; pending jobs are still handed out by `pop`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DispatchStats {
        self.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Decision, SuppressReason};
    use chrono::Utc;

    fn job(cycle: u64, classification: Classification) -> PersistJob {
        PersistJob {
            snapshot: Arc::new(BufferSnapshot {
                cycle,
                captured_at: Utc::now(),
                events: Vec::new(),
                window_frequencies: Vec::new(),
                baseline: None,
                decision: Decision::Suppressed(SuppressReason::UndefinedBaseline),
            }),
            classification,
        }
    }

    fn drain(queue: &DispatchQueue) -> Vec<(u64, Classification)> {
        let mut state = queue.lock();
        state
            .jobs
            .drain(..)
            .map(|j| (j.snapshot.cycle, j.classification))
            .collect()
    }

    #[test]
    fn test_full_queue_evicts_oldest_all_first() {
        let queue = DispatchQueue::new(3);
        queue.push(job(1, Classification::Anomaly));
        queue.push(job(2, Classification::All));
        queue.push(job(3, Classification::All));

        let outcome = queue.push(job(4, Classification::Anomaly));
        assert_eq!(
            outcome,
            PushOutcome::Evicted { classification: Classification::All, cycle: 2 }
        );
        assert_eq!(
            drain(&queue),
            vec![
                (1, Classification::Anomaly),
                (3, Classification::All),
                (4, Classification::Anomaly)
            ]
        );
        assert_eq!(queue.stats().dropped_anomaly, 0);
    }

    #[test]
    fn test_all_job_discarded_when_full_of_anomalies() {
        let queue = DispatchQueue::new(2);
        queue.push(job(1, Classification::Anomaly));
        queue.push(job(2, Classification::Anomaly));
        assert_eq!(queue.push(job(3, Classification::All)), PushOutcome::Discarded);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_anomaly_evicted_only_under_exhaustion() {
        let queue = DispatchQueue::new(2);
        queue.push(job(1, Classification::Anomaly));
        queue.push(job(2, Classification::Anomaly));
        let outcome = queue.push(job(3, Classification::Anomaly));
        assert_eq!(
            outcome,
            PushOutcome::Evicted { classification: Classification::Anomaly, cycle: 1 }
        );
        assert_eq!(queue.stats().dropped_anomaly, 1);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = Arc::new(DispatchQueue::new(4));
        queue.push(job(1, Classification::All));
        queue.push(job(2, Classification::Anomaly));
        queue.close();
        assert_eq!(queue.push(job(3, Classification::All)), PushOutcome::Closed);

        assert_eq!(queue.pop().await.map(|j| j.snapshot.cycle), Some(1));
        assert_eq!(queue.pop().await.map(|j| j.snapshot.cycle), Some(2));
        assert!(queue.pop().await.is_none());
    }

    #[test]
    fn test_pop_pending_until_closed() {
        let queue = DispatchQueue::new(4);
        let mut pop = tokio_test::task::spawn(queue.pop());
        tokio_test::assert_pending!(pop.poll());
        queue.close();
        assert!(pop.is_woken());
        assert!(tokio_test::assert_ready!(pop.poll()).is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(DispatchQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await.map(|j| j.snapshot.cycle) })
        };
        tokio::task::yield_now().await;
        queue.push(job(9, Classification::Anomaly));
        assert_eq!(consumer.await.unwrap(), Some(9));
    }
}
