//! Anomaly decisions and buffer snapshots

use super::EventRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Anomaly Decision
// ============================================================================

/// Direction of a rate excursion relative to the baseline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    High,
    Low,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::High => write!(f, "high"),
            Direction::Low => write!(f, "low"),
        }
    }
}

/// Outcome of comparing the central window frequency against the baseline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AnomalyFlag {
    pub triggered: bool,
    /// Set only when `triggered`
    pub direction: Option<Direction>,
    /// Central frequency divided by baseline
    pub ratio: f64,
    /// Baseline (events/s) at decision time
    pub baseline: f64,
    /// Central window frequency (events/s)
    pub central_frequency: f64,
    /// Poisson tail probability of the central window span at the baseline rate
    pub p_value: Option<f64>,
}

/// Why a primed cycle produced no anomaly evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum SuppressReason {
    /// Baseline above `max_median_frequency`; usually not running in coincidence mode
    BaselineAboveCeiling { baseline: f64, ceiling: f64 },
    /// No window in the buffer had a defined frequency
    UndefinedBaseline,
    /// The central window had no defined frequency (zero span or missing interval)
    UndefinedCentralWindow,
}

impl std::fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuppressReason::BaselineAboveCeiling { baseline, ceiling } => write!(
                f,
                "baseline {baseline:.4} Hz exceeds ceiling {ceiling:.4} Hz"
            ),
            SuppressReason::UndefinedBaseline => write!(f, "baseline undefined"),
            SuppressReason::UndefinedCentralWindow => write!(f, "central window undefined"),
        }
    }
}

/// Per-cycle decision once the buffer is primed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum Decision {
    Evaluated(AnomalyFlag),
    Suppressed(SuppressReason),
}

impl Decision {
    /// The anomaly flag, if this cycle was evaluated.
    pub fn flag(&self) -> Option<&AnomalyFlag> {
        match self {
            Decision::Evaluated(flag) => Some(flag),
            Decision::Suppressed(_) => None,
        }
    }

    /// True when the cycle was evaluated and flagged an anomaly.
    pub fn is_anomaly(&self) -> bool {
        self.flag().is_some_and(|f| f.triggered)
    }

    pub fn direction(&self) -> Option<Direction> {
        self.flag().and_then(|f| f.direction)
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// Storage classification of a persisted snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Written when the cycle's anomaly flag triggered; eligible for replication
    Anomaly,
    /// Written every cycle when the save-all policy is enabled
    All,
}

impl Classification {
    /// Session subdirectory holding snapshots of this class.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Classification::Anomaly => "anomaly",
            Classification::All => "all",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Immutable capture of the ring buffer at the end of one cycle.
///
/// Shared as `Arc<BufferSnapshot>` between the acquisition loop and the
/// persistence worker; nothing mutates it after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSnapshot {
    /// Primed-cycle counter that produced this snapshot (1-based)
    pub cycle: u64,
    /// Host time at capture
    pub captured_at: DateTime<Utc>,
    /// Buffer contents, oldest first
    pub events: Vec<EventRecord>,
    /// Window frequency per buffer position (`None` where undefined)
    pub window_frequencies: Vec<Option<f64>>,
    /// Median of the defined window frequencies
    pub baseline: Option<f64>,
    pub decision: Decision,
}

impl BufferSnapshot {
    /// Timestamp of the newest event in the snapshot.
    pub fn newest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|e| e.timestamp)
    }
}
