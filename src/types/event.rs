//! Detector event records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Event Record
// ============================================================================

/// One coincidence event reported by the detector.
///
/// Created by the line parser and never mutated afterwards. The sensor
/// fields are passed through untouched; only `timestamp`, `sequence` and
/// `interval` are derived on the host side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Wall-clock time of the event (millisecond resolution, non-decreasing)
    pub timestamp: DateTime<Utc>,
    /// Host-side sequence index, strictly increasing across accepted lines
    pub sequence: u64,
    /// Event counter reported by the detector firmware
    pub detector_event: u64,
    /// Detector clock at the event (ms since detector boot)
    pub detector_time_ms: u64,
    /// Pulse amplitude (ADC counts)
    pub adc: u32,
    /// Derived SiPM peak voltage (mV), the firmware's energy estimate
    pub sipm_mv: f64,
    /// Accumulated detector dead time (ms)
    pub dead_time_ms: u64,
    /// Detector board temperature (°C)
    pub temperature_c: f64,
    /// Time since the previous accepted event; `None` for the first event of a run
    #[serde(with = "interval_ms")]
    pub interval: Option<Duration>,
}

impl EventRecord {
    /// Interval to the previous event in seconds, if known.
    pub fn interval_secs(&self) -> Option<f64> {
        self.interval.map(|d| d.as_secs_f64())
    }
}

/// Raw sensor fields of one detector line, before host-side stamping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorFields {
    pub detector_event: u64,
    pub detector_time_ms: u64,
    pub adc: u32,
    pub sipm_mv: f64,
    pub dead_time_ms: u64,
    pub temperature_c: f64,
}

/// Serialize `Option<Duration>` as optional milliseconds.
mod interval_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_interval_serializes_as_millis() {
        let record = EventRecord {
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            sequence: 7,
            detector_event: 7,
            detector_time_ms: 12_345,
            adc: 512,
            sipm_mv: 48.2,
            dead_time_ms: 3,
            temperature_c: 21.5,
            interval: Some(Duration::from_millis(1_250)),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["interval"], 1250);

        let back: EventRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.interval_secs(), Some(1.25));
    }
}
