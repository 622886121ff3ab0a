//! Detector Line Parser
//!
//! The detector prints one event per line as whitespace-separated numbers:
//!
//! ```text
//! event  detector_time_ms  adc  sipm_mv  dead_time_ms  temp_c
//! 1234   5678901           410  38.21    1024          23.5
//! ```
//!
//! Before the data starts the firmware prints a banner and column headers.
//! Lines containing `###` are banner lines; they also reappear mid-run when
//! the detector reboots. The parser swallows everything before the start of
//! data according to [`StartMode`], then turns each data line into an
//! [`EventRecord`] with a host-side sequence index, a non-decreasing
//! timestamp and the interval since the previous accepted event.

use crate::config::{DetectorConfig, TimestampSource};
use crate::types::{EventRecord, SensorFields};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use thiserror::Error;

/// Minimum number of whitespace-separated fields in a data line.
pub const DATA_FIELD_COUNT: usize = 6;

/// Marker the firmware uses for banner and reboot lines.
pub const BANNER_MARKER: &str = "###";

/// Line parse errors
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("expected at least 6 fields, found {found}")]
    TooFewFields { found: usize },

    #[error("invalid {field} value '{value}'")]
    InvalidField { field: &'static str, value: String },
}

/// How the parser finds the first data line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartMode {
    /// Data begins on the line after the first line containing this text
    Marker(String),
    /// Skip exactly this many lines, then treat everything as data
    SkipLines(u32),
    /// Data begins at the first line that parses as an event
    AutoDetect,
}

/// Parser settings, usually derived from `[detector]` config.
#[derive(Debug, Clone)]
pub struct ParserOptions {
    pub start_mode: StartMode,
    pub timestamp_source: TimestampSource,
}

impl ParserOptions {
    pub fn from_config(cfg: &DetectorConfig) -> Self {
        let start_mode = if !cfg.start_string.is_empty() {
            StartMode::Marker(cfg.start_string.clone())
        } else if cfg.ignore_header_lines > 0 {
            StartMode::SkipLines(cfg.ignore_header_lines)
        } else {
            StartMode::AutoDetect
        };
        Self {
            start_mode,
            timestamp_source: cfg.timestamp_source,
        }
    }
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            start_mode: StartMode::AutoDetect,
            timestamp_source: TimestampSource::Host,
        }
    }
}

/// Result of feeding one line to the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// An accepted detector event
    Event(EventRecord),
    /// Banner / reboot line seen after data started
    Banner(String),
    /// Consumed while waiting for the start of data
    Header,
    /// Empty line
    Blank,
}

/// Stateful line-to-event converter.
///
/// Owns the sequence counter and the last accepted timestamp, so one parser
/// must be used for the whole run (it survives source reconnects).
#[derive(Debug)]
pub struct LineParser {
    options: ParserOptions,
    started: bool,
    header_lines_skipped: u32,
    next_sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
    /// Host time and detector clock of the event that anchors detector-time stamping
    detector_anchor: Option<(DateTime<Utc>, u64)>,
}

impl LineParser {
    pub fn new(options: ParserOptions) -> Self {
        Self {
            options,
            started: false,
            header_lines_skipped: 0,
            next_sequence: 0,
            last_timestamp: None,
            detector_anchor: None,
        }
    }

    /// True once the start of data has been found.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Feed one raw line received at `received_at`.
    ///
    /// Malformed data lines return `Err` and leave the sequence index untouched.
    pub fn parse_line(
        &mut self,
        line: &str,
        received_at: DateTime<Utc>,
    ) -> Result<ParsedLine, ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(ParsedLine::Blank);
        }

        if !self.started {
            match &self.options.start_mode {
                StartMode::Marker(marker) => {
                    if line.contains(marker.as_str()) {
                        self.started = true;
                    }
                    return Ok(ParsedLine::Header);
                }
                StartMode::SkipLines(n) => {
                    if self.header_lines_skipped < *n {
                        self.header_lines_skipped += 1;
                        return Ok(ParsedLine::Header);
                    }
                    self.started = true;
                }
                StartMode::AutoDetect => {
                    if line.contains(BANNER_MARKER) {
                        return Ok(ParsedLine::Header);
                    }
                    return match parse_fields(line) {
                        Ok(fields) => {
                            self.started = true;
                            Ok(ParsedLine::Event(self.accept(fields, received_at)))
                        }
                        Err(_) => Ok(ParsedLine::Header),
                    };
                }
            }
        }

        if line.contains(BANNER_MARKER) {
            return Ok(ParsedLine::Banner(line.to_string()));
        }

        let fields = parse_fields(line)?;
        Ok(ParsedLine::Event(self.accept(fields, received_at)))
    }

    fn accept(&mut self, fields: SensorFields, received_at: DateTime<Utc>) -> EventRecord {
        let raw = match self.options.timestamp_source {
            TimestampSource::Host => received_at,
            TimestampSource::Detector => self.detector_timestamp(fields.detector_time_ms, received_at),
        };
        let raw = truncate_to_millis(raw);

        // Clamp so timestamps never go backwards
        let timestamp = match self.last_timestamp {
            Some(last) if raw < last => last,
            _ => raw,
        };

        let interval = self
            .last_timestamp
            .map(|last| (timestamp - last).to_std().unwrap_or(Duration::ZERO));

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.last_timestamp = Some(timestamp);

        EventRecord {
            timestamp,
            sequence,
            detector_event: fields.detector_event,
            detector_time_ms: fields.detector_time_ms,
            adc: fields.adc,
            sipm_mv: fields.sipm_mv,
            dead_time_ms: fields.dead_time_ms,
            temperature_c: fields.temperature_c,
            interval,
        }
    }

    fn detector_timestamp(&mut self, detector_ms: u64, received_at: DateTime<Utc>) -> DateTime<Utc> {
        match self.detector_anchor {
            Some((host, anchor_ms)) if detector_ms >= anchor_ms => {
                let offset = i64::try_from(detector_ms - anchor_ms).unwrap_or(i64::MAX);
                host.checked_add_signed(ChronoDuration::milliseconds(offset))
                    .unwrap_or(received_at)
            }
            Some(_) => {
                // Detector clock went backwards: the board rebooted
                tracing::info!(detector_ms, "Detector clock reset, re-anchoring timestamps");
                self.detector_anchor = Some((received_at, detector_ms));
                received_at
            }
            None => {
                self.detector_anchor = Some((received_at, detector_ms));
                received_at
            }
        }
    }
}

fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// Parse the six leading numeric fields of a data line.
pub fn parse_fields(line: &str) -> Result<SensorFields, ParseError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < DATA_FIELD_COUNT {
        return Err(ParseError::TooFewFields { found: parts.len() });
    }

    Ok(SensorFields {
        detector_event: parse_num(parts[0], "event")?,
        detector_time_ms: parse_num(parts[1], "detector_time_ms")?,
        adc: parse_num(parts[2], "adc")?,
        sipm_mv: parse_num(parts[3], "sipm_mv")?,
        dead_time_ms: parse_num(parts[4], "dead_time_ms")?,
        temperature_c: parse_num(parts[5], "temperature_c")?,
    })
}

fn parse_num<T: std::str::FromStr>(value: &str, field: &'static str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}
