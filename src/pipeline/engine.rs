//! Per-cycle rate evaluation.
//!
//! The engine owns the ring buffer. Every record is pushed; once the buffer
//! is primed each push is one *cycle*: window frequencies are recomputed
//! over the whole buffer, the baseline is re-derived and the central window
//! is judged against it. The engine decides which snapshots to persist but
//! never performs I/O itself.

use crate::baseline::{baseline_of, AnomalyRule, WindowFrequencyCalculator};
use crate::buffer::RingBuffer;
use crate::config::DetectorConfig;
use crate::storage::PersistJob;
use crate::types::{BufferSnapshot, Classification, Decision, Direction, EventRecord, SuppressReason};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Cycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub records: u64,
    pub cycles: u64,
    pub high: u64,
    pub low: u64,
    pub suppressed: u64,
    /// Anomalous cycles not persisted because their block of `W` records already saved one
    pub deduplicated: u64,
    pub anomaly_dispatched: u64,
    pub all_dispatched: u64,
    pub dispatch_dropped: u64,
}

/// Result of one primed cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub cycle: u64,
    pub decision: Decision,
    pub baseline: Option<f64>,
    pub central_frequency: Option<f64>,
    /// Snapshot writes requested this cycle, anomaly first
    pub jobs: Vec<PersistJob>,
}

pub struct CycleEngine {
    buffer: RingBuffer,
    windows: WindowFrequencyCalculator,
    rule: AnomalyRule,
    save_all: bool,
    dedupe: bool,
    cycle: u64,
    /// Cleared by a persisted anomaly, re-armed every `W` ingested records
    anomaly_armed: bool,
    above_ceiling: bool,
    stats: LoopStats,
}

impl CycleEngine {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            buffer: RingBuffer::new(config.buff_size),
            windows: WindowFrequencyCalculator::new(config.window_size),
            rule: AnomalyRule::new(
                config.anomaly_threshold,
                config.max_median_frequency,
                config.window_size,
            ),
            save_all: config.save_all,
            dedupe: config.dedupe_anomalies,
            cycle: 0,
            anomaly_armed: true,
            above_ceiling: false,
            stats: LoopStats::default(),
        }
    }

    pub fn buffer(&self) -> &RingBuffer {
        &self.buffer
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Record dispatch results reported by the caller.
    pub fn stats_mut(&mut self) -> &mut LoopStats {
        &mut self.stats
    }

    /// Push one record and, once primed, evaluate the cycle.
    ///
    /// Returns `None` while the buffer is still filling.
    pub fn process(&mut self, record: EventRecord) -> Option<CycleOutcome> {
        self.buffer.push(record);
        self.stats.records += 1;
        if self.stats.records % self.windows.width() as u64 == 0 {
            self.anomaly_armed = true;
        }

        if !self.buffer.is_primed() {
            return None;
        }
        if self.cycle == 0 {
            info!(buff_size = self.buffer.capacity(), "Buffer primed, anomaly evaluation active");
        }
        self.cycle += 1;
        self.stats.cycles += 1;

        let frequencies = self.windows.compute(&self.buffer);
        let baseline = baseline_of(&frequencies);
        let central_frequency = frequencies.get(self.buffer.len() / 2).copied().flatten();
        let decision = self.rule.evaluate(central_frequency, baseline);

        self.track_ceiling(&decision);

        let persist_anomaly = match decision.direction() {
            Some(direction) if decision.is_anomaly() => {
                match direction {
                    Direction::High => self.stats.high += 1,
                    Direction::Low => self.stats.low += 1,
                }
                self.should_persist_anomaly()
            }
            _ => {
                if let Decision::Suppressed(_) = decision {
                    self.stats.suppressed += 1;
                }
                false
            }
        };

        let mut jobs = Vec::new();
        if persist_anomaly || self.save_all {
            let snapshot = Arc::new(BufferSnapshot {
                cycle: self.cycle,
                captured_at: Utc::now(),
                events: self.buffer.snapshot(),
                window_frequencies: frequencies,
                baseline,
                decision,
            });
            if persist_anomaly {
                jobs.push(PersistJob {
                    snapshot: Arc::clone(&snapshot),
                    classification: Classification::Anomaly,
                });
            }
            if self.save_all {
                jobs.push(PersistJob {
                    snapshot,
                    classification: Classification::All,
                });
            }
        }

        Some(CycleOutcome {
            cycle: self.cycle,
            decision,
            baseline,
            central_frequency,
            jobs,
        })
    }

    /// At most one anomaly snapshot per block of `W` ingested records.
    fn should_persist_anomaly(&mut self) -> bool {
        if !self.dedupe {
            return true;
        }
        if self.anomaly_armed {
            self.anomaly_armed = false;
            true
        } else {
            self.stats.deduplicated += 1;
            false
        }
    }

    fn track_ceiling(&mut self, decision: &Decision) {
        let above = matches!(
            decision,
            Decision::Suppressed(SuppressReason::BaselineAboveCeiling { .. })
        );
        if above && !self.above_ceiling {
            if let Decision::Suppressed(reason) = decision {
                warn!(
                    cycle = self.cycle,
                    %reason,
                    "Baseline above ceiling, anomaly evaluation suspended; check the detector is in coincidence mode"
                );
            }
        } else if !above && self.above_ceiling {
            info!(cycle = self.cycle, "Baseline back below ceiling, anomaly evaluation resumed");
        }
        self.above_ceiling = above;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use std::time::Duration;

    fn config(buff_size: usize, window_size: usize) -> DetectorConfig {
        DetectorConfig {
            buff_size,
            window_size,
            anomaly_threshold: 4.0,
            max_median_frequency: 1.0,
            ..DetectorConfig::default()
        }
    }

    /// Feed records spaced by `gaps_ms`; the first record has no interval.
    struct Feed {
        seq: u64,
        at: DateTime<Utc>,
    }

    impl Feed {
        fn new() -> Self {
            Self { seq: 0, at: Utc.timestamp_millis_opt(1_760_884_205_000).unwrap() }
        }

        fn next(&mut self, gap_ms: u64) -> EventRecord {
            let interval = (self.seq > 0).then(|| Duration::from_millis(gap_ms));
            if self.seq > 0 {
                self.at += chrono::Duration::milliseconds(gap_ms as i64);
            }
            let record = EventRecord {
                timestamp: self.at,
                sequence: self.seq,
                detector_event: self.seq,
                detector_time_ms: self.seq * gap_ms,
                adc: 400,
                sipm_mv: 30.0,
                dead_time_ms: 0,
                temperature_c: 21.0,
                interval,
            };
            self.seq += 1;
            record
        }
    }

    #[test]
    fn test_no_decision_before_primed() {
        let mut engine = CycleEngine::new(&config(10, 3));
        let mut feed = Feed::new();
        for _ in 0..9 {
            assert!(engine.process(feed.next(10_000)).is_none());
        }
        let outcome = engine.process(feed.next(10_000)).unwrap();
        assert_eq!(outcome.cycle, 1);
        assert_eq!(engine.stats().records, 10);
    }

    #[test]
    fn test_constant_rate_is_normal() {
        let mut engine = CycleEngine::new(&config(10, 3));
        let mut feed = Feed::new();
        let mut outcomes = Vec::new();
        for _ in 0..30 {
            outcomes.extend(engine.process(feed.next(10_000)));
        }
        // the first primed cycle still sees the interval-less first record in the buffer
        for outcome in &outcomes[1..] {
            let flag = outcome.decision.flag().unwrap();
            assert!(!flag.triggered);
            assert!((flag.baseline - 0.1).abs() < 1e-12);
            assert!(outcome.jobs.is_empty());
        }
    }

    #[test]
    fn test_burst_flags_high_once_per_run() {
        let mut engine = CycleEngine::new(&config(10, 3));
        let mut feed = Feed::new();
        for _ in 0..20 {
            engine.process(feed.next(10_000));
        }

        let mut anomalies = Vec::new();
        for _ in 0..3 {
            let outcome = engine.process(feed.next(100)).unwrap();
            assert!(outcome.jobs.is_empty(), "burst not yet at the centre");
        }
        for _ in 0..10 {
            let outcome = engine.process(feed.next(10_000)).unwrap();
            if outcome.decision.is_anomaly() {
                assert_eq!(outcome.decision.direction(), Some(Direction::High));
                anomalies.push(outcome);
            }
        }

        assert!(!anomalies.is_empty());
        let persisted: Vec<&CycleOutcome> = anomalies.iter().filter(|o| !o.jobs.is_empty()).collect();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].jobs[0].classification, Classification::Anomaly);
        assert_eq!(engine.stats().high, anomalies.len() as u64);
        assert_eq!(engine.stats().deduplicated, anomalies.len() as u64 - 1);
    }

    #[test]
    fn test_dedupe_rearms_every_window_of_records() {
        let mut engine = CycleEngine::new(&config(10, 3));
        let mut feed = Feed::new();
        assert!(engine.should_persist_anomaly());
        assert!(!engine.should_persist_anomaly());

        // two records do not complete a block of three
        engine.process(feed.next(10_000));
        engine.process(feed.next(10_000));
        assert!(!engine.should_persist_anomaly());

        engine.process(feed.next(10_000));
        assert!(engine.should_persist_anomaly());
        assert!(!engine.should_persist_anomaly());
        assert_eq!(engine.stats().deduplicated, 3);
    }

    #[test]
    fn test_simultaneous_burst_flags_high() {
        let mut engine = CycleEngine::new(&config(10, 3));
        let mut feed = Feed::new();
        for _ in 0..20 {
            engine.process(feed.next(10_000));
        }
        let mut gaps = vec![0; 3];
        gaps.extend([10_000; 10]);
        for gap in gaps {
            engine.process(feed.next(gap));
        }
        let stats = engine.stats();
        assert!(stats.high >= 1, "{stats:?}");
        assert_eq!(stats.suppressed, 0);
    }

    #[test]
    fn test_without_dedupe_every_anomalous_cycle_persists() {
        let mut cfg = config(20, 3);
        cfg.dedupe_anomalies = false;
        let mut engine = CycleEngine::new(&cfg);
        let mut feed = Feed::new();
        for _ in 0..30 {
            engine.process(feed.next(10_000));
        }
        let mut persisted = 0;
        let mut triggered = 0;
        // a four-event burst fills the central window for two consecutive cycles
        let mut gaps = vec![100; 4];
        gaps.extend([10_000; 12]);
        for gap in gaps {
            let outcome = engine.process(feed.next(gap)).unwrap();
            triggered += u64::from(outcome.decision.is_anomaly());
            persisted += outcome.jobs.len() as u64;
        }
        assert_eq!(triggered, 2);
        assert_eq!(persisted, triggered);
    }

    #[test]
    fn test_gap_flags_low() {
        let mut engine = CycleEngine::new(&config(10, 3));
        let mut feed = Feed::new();
        for _ in 0..20 {
            engine.process(feed.next(10_000));
        }
        let mut saw_low = false;
        let mut gaps = vec![200_000];
        gaps.extend([10_000; 9]);
        for gap in gaps {
            let outcome = engine.process(feed.next(gap)).unwrap();
            saw_low |= outcome.decision.direction() == Some(Direction::Low);
        }
        assert!(saw_low);
        assert!(engine.stats().low > 0);
    }

    #[test]
    fn test_ceiling_suppresses_decision_but_not_save_all() {
        let mut cfg = config(10, 3);
        cfg.save_all = true;
        let mut engine = CycleEngine::new(&cfg);
        let mut feed = Feed::new();
        let mut outcomes = Vec::new();
        // 5 Hz baseline, above the 1 Hz ceiling
        for _ in 0..15 {
            outcomes.extend(engine.process(feed.next(200)));
        }
        for outcome in &outcomes[1..] {
            assert!(matches!(
                outcome.decision,
                Decision::Suppressed(SuppressReason::BaselineAboveCeiling { .. })
            ));
            assert_eq!(outcome.jobs.len(), 1);
            assert_eq!(outcome.jobs[0].classification, Classification::All);
        }
        assert!(engine.stats().suppressed >= outcomes.len() as u64 - 1);
        assert_eq!(engine.stats().high + engine.stats().low, 0);
    }

    #[test]
    fn test_snapshot_matches_buffer_at_capture() {
        let mut cfg = config(4, 1);
        cfg.save_all = true;
        let mut engine = CycleEngine::new(&cfg);
        let mut feed = Feed::new();
        let mut last = None;
        for _ in 0..6 {
            if let Some(outcome) = engine.process(feed.next(10_000)) {
                last = Some(outcome);
            }
        }
        let outcome = last.unwrap();
        let snapshot = &outcome.jobs[0].snapshot;
        let seqs: Vec<u64> = snapshot.events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![2, 3, 4, 5]);
        assert_eq!(snapshot.window_frequencies.len(), 4);

        // later pushes do not touch the captured snapshot
        engine.process(feed.next(10_000));
        assert_eq!(snapshot.events[0].sequence, 2);
    }
}
