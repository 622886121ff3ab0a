//! Ingest task and acquisition loop.
//!
//! ```text
//! EventSource --lines--> [ingest: LineParser] --mpsc--> [acquisition: CycleEngine] --> DispatchQueue
//! ```
//!
//! The ingest task is the only place that waits on the detector; the
//! acquisition loop never waits on anything but the channel, so a slow disk
//! or an unreachable remote store cannot stall ingestion.

use super::engine::{CycleEngine, CycleOutcome, LoopStats};
use super::source::{EventSource, SourceError, SourceEvent};
use crate::acquisition::{LineParser, ParsedLine};
use crate::config::defaults::VERBOSE_EVENT_COUNT;
use crate::storage::{DispatchQueue, PushOutcome};
use crate::types::{Classification, Decision, EventRecord};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Ingest
// ============================================================================

/// Ingest counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub lines: u64,
    pub events: u64,
    pub parse_errors: u64,
    pub banners: u64,
    pub header_lines: u64,
}

/// Read lines from `source`, parse them and forward events in arrival order.
///
/// Ends on EOF, on cancellation or when the acquisition side hangs up.
pub async fn run_ingest<S: EventSource>(
    mut source: S,
    mut parser: LineParser,
    tx: mpsc::Sender<EventRecord>,
    cancel: CancellationToken,
) -> Result<IngestStats, SourceError> {
    let mut stats = IngestStats::default();
    info!(source = source.source_name(), "[Ingest] Task starting");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                info!("[Ingest] Shutdown signal received");
                break;
            }
            result = source.next_line() => result?,
        };

        let line = match event {
            SourceEvent::Line(line) => line,
            SourceEvent::Eof => {
                info!(lines = stats.lines, events = stats.events, "[Ingest] Source reached end");
                break;
            }
        };
        stats.lines += 1;

        let record = match parser.parse_line(&line, Utc::now()) {
            Ok(ParsedLine::Event(record)) => record,
            Ok(ParsedLine::Banner(text)) => {
                stats.banners += 1;
                info!(line = %text, "Detector banner mid-run (reboot?), buffer kept");
                continue;
            }
            Ok(ParsedLine::Header) => {
                stats.header_lines += 1;
                debug!(line = %line, "Skipping header line");
                if parser.is_started() {
                    info!("Start of data found");
                }
                continue;
            }
            Ok(ParsedLine::Blank) => continue,
            Err(e) => {
                stats.parse_errors += 1;
                warn!(line = %line, error = %e, "Skipping malformed detector line");
                continue;
            }
        };

        stats.events += 1;
        log_event(&record, stats.events <= VERBOSE_EVENT_COUNT);

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[Ingest] Shutdown signal received");
                break;
            }
            sent = tx.send(record) => {
                if sent.is_err() {
                    info!("[Ingest] Acquisition loop gone, stopping");
                    break;
                }
            }
        }
    }

    Ok(stats)
}

fn log_event(record: &EventRecord, verbose: bool) {
    macro_rules! event_fields {
        ($level:ident) => {
            $level!(
                seq = record.sequence,
                timestamp = %record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                event = record.detector_event,
                detector_ms = record.detector_time_ms,
                adc = record.adc,
                sipm_mv = record.sipm_mv,
                dead_time_ms = record.dead_time_ms,
                temp_c = record.temperature_c,
                interval_s = record.interval_secs().unwrap_or(f64::NAN),
                "Event"
            )
        };
    }
    if verbose {
        event_fields!(info);
    } else {
        event_fields!(debug);
    }
}

// ============================================================================
// Acquisition Loop
// ============================================================================

/// Sole owner of the ring buffer; turns records into cycles and snapshot jobs.
pub struct AcquisitionLoop {
    engine: CycleEngine,
    dispatch: Arc<DispatchQueue>,
    cancel: CancellationToken,
    progress_interval: u64,
}

impl AcquisitionLoop {
    pub fn new(
        engine: CycleEngine,
        dispatch: Arc<DispatchQueue>,
        cancel: CancellationToken,
        progress_interval: u64,
    ) -> Self {
        Self {
            engine,
            dispatch,
            cancel,
            progress_interval,
        }
    }

    /// Run until the channel closes or cancellation, then close the dispatch queue.
    pub async fn run(mut self, mut rx: mpsc::Receiver<EventRecord>) -> LoopStats {
        info!(
            buff_size = self.engine.buffer().capacity(),
            "[Acquisition] Task starting"
        );

        loop {
            let record = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("[Acquisition] Shutdown signal received");
                    break;
                }
                record = rx.recv() => match record {
                    Some(r) => r,
                    None => {
                        info!("[Acquisition] Input ended");
                        break;
                    }
                },
            };

            if let Some(outcome) = self.engine.process(record) {
                self.handle_cycle(outcome);
            }

            let records = self.engine.stats().records;
            if self.progress_interval > 0 && records % self.progress_interval == 0 {
                let stats = self.engine.stats();
                info!(
                    records,
                    cycles = stats.cycles,
                    high = stats.high,
                    low = stats.low,
                    suppressed = stats.suppressed,
                    pending_writes = self.dispatch.len(),
                    "Progress"
                );
            }
        }

        // Persistence drains what is already queued, then stops
        self.dispatch.close();

        let stats = self.engine.stats();
        info!(
            records = stats.records,
            cycles = stats.cycles,
            high = stats.high,
            low = stats.low,
            suppressed = stats.suppressed,
            deduplicated = stats.deduplicated,
            anomaly_snapshots = stats.anomaly_dispatched,
            all_snapshots = stats.all_dispatched,
            dropped = stats.dispatch_dropped,
            "[Acquisition] Final statistics"
        );
        stats
    }

    fn handle_cycle(&mut self, outcome: CycleOutcome) {
        match &outcome.decision {
            Decision::Evaluated(flag) if flag.triggered => {
                info!(
                    cycle = outcome.cycle,
                    direction = %flag.direction.map_or_else(String::new, |d| d.to_string()),
                    ratio = flag.ratio,
                    central_hz = flag.central_frequency,
                    baseline_hz = flag.baseline,
                    p_value = flag.p_value.unwrap_or(f64::NAN),
                    persisted = !outcome.jobs.is_empty(),
                    "Rate anomaly"
                );
            }
            Decision::Evaluated(flag) => {
                debug!(
                    cycle = outcome.cycle,
                    ratio = flag.ratio,
                    baseline_hz = flag.baseline,
                    "Cycle normal"
                );
            }
            Decision::Suppressed(reason) => {
                debug!(cycle = outcome.cycle, %reason, "Cycle suppressed");
            }
        }

        for job in outcome.jobs {
            let classification = job.classification;
            let pushed = self.dispatch.push(job);
            let stats = self.engine.stats_mut();
            match pushed {
                PushOutcome::Queued => {}
                // an older pending write made room for this one
                PushOutcome::Evicted { .. } => stats.dispatch_dropped += 1,
                PushOutcome::Discarded | PushOutcome::Closed => {
                    stats.dispatch_dropped += 1;
                    continue;
                }
            }
            match classification {
                Classification::Anomaly => stats.anomaly_dispatched += 1,
                Classification::All => stats.all_dispatched += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::ParserOptions;
    use crate::config::{DetectorConfig, TimestampSource};
    use crate::pipeline::source::ReaderSource;
    use std::io::Cursor;
    use std::time::Duration;

    fn detector_parser() -> LineParser {
        LineParser::new(ParserOptions {
            timestamp_source: TimestampSource::Detector,
            ..ParserOptions::default()
        })
    }

    fn source(text: &str) -> ReaderSource<Cursor<Vec<u8>>> {
        ReaderSource::new(Cursor::new(text.as_bytes().to_vec()), "test", Duration::ZERO)
    }

    #[tokio::test]
    async fn test_ingest_skips_bad_lines_and_keeps_order() {
        let text = "\
### CosmicWatch: The Desktop Muon Detector
Event  Time  ADC  SiPM  Deadtime  Temp
1 1000 400 30.1 0 20.5
garbage line
2 2000 410 31.0 0 20.5

### CosmicWatch: The Desktop Muon Detector
3 3000 420 32.0 0 20.6
";
        let (tx, mut rx) = mpsc::channel(16);
        let stats = run_ingest(source(text), detector_parser(), tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.events, 3);
        assert_eq!(stats.parse_errors, 1);
        assert_eq!(stats.banners, 1);
        assert_eq!(stats.header_lines, 2);

        let mut seqs = Vec::new();
        while let Some(record) = rx.recv().await {
            seqs.push((record.sequence, record.detector_event));
        }
        assert_eq!(seqs, vec![(0, 1), (1, 2), (2, 3)]);
    }

    #[tokio::test]
    async fn test_ingest_stops_on_cancel() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = run_ingest(source("1 1000 400 30.1 0 20.5\n"), detector_parser(), tx, cancel)
            .await
            .unwrap();
        assert_eq!(stats.events, 0);
    }

    #[tokio::test]
    async fn test_acquisition_closes_dispatch_on_end() {
        let config = DetectorConfig {
            buff_size: 4,
            window_size: 1,
            save_all: true,
            ..DetectorConfig::default()
        };
        let dispatch = Arc::new(DispatchQueue::new(16));
        let acquisition = AcquisitionLoop::new(
            CycleEngine::new(&config),
            dispatch.clone(),
            CancellationToken::new(),
            0,
        );

        let (tx, rx) = mpsc::channel(16);
        let mut parser = detector_parser();
        for n in 1..=6u64 {
            let line = format!("{n} {} 400 30.1 0 20.5", n * 10_000);
            if let Ok(ParsedLine::Event(record)) = parser.parse_line(&line, Utc::now()) {
                tx.send(record).await.unwrap();
            }
        }
        drop(tx);

        let stats = acquisition.run(rx).await;
        assert_eq!(stats.records, 6);
        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.all_dispatched, 3);

        let mut cycles = Vec::new();
        while let Some(job) = dispatch.pop().await {
            cycles.push(job.snapshot.cycle);
        }
        assert_eq!(cycles, vec![1, 2, 3]);
    }
}
