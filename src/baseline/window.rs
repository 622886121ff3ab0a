//! Sliding window event-rate calculation
//!
//! Centered convention: the window for buffer position `i` covers the `W`
//! events starting at `i - W/2`. Its span is the sum of those events'
//! inter-arrival intervals, so a stream with constant interval Δ yields
//! exactly `1/Δ` at every defined position. Simultaneous events give a zero
//! span and an unbounded (`f64::INFINITY`) rate; only a missing interval
//! leaves a window undefined.
//!
//! Spans are summed as `Duration` (integer nanoseconds) and the whole buffer
//! is recomputed on every call, so results never drift between cycles.

use crate::buffer::RingBuffer;
use std::time::Duration;

/// Computes per-position window frequencies over a ring buffer.
#[derive(Debug, Clone, Copy)]
pub struct WindowFrequencyCalculator {
    width: usize,
}

impl WindowFrequencyCalculator {
    pub fn new(width: usize) -> Self {
        Self { width: width.max(1) }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Offset from a window's first event to the position it is reported at.
    fn half_width(&self) -> usize {
        self.width / 2
    }

    /// Window frequency (events/s) for every buffer position, `None` where undefined.
    pub fn compute(&self, buffer: &RingBuffer) -> Vec<Option<f64>> {
        let intervals: Vec<Option<Duration>> = buffer.iter().map(|e| e.interval).collect();
        self.compute_from_intervals(&intervals)
    }

    /// Same as [`compute`](Self::compute) over raw inter-arrival intervals.
    pub fn compute_from_intervals(&self, intervals: &[Option<Duration>]) -> Vec<Option<f64>> {
        let n = intervals.len();
        let w = self.width;
        let mut out = vec![None; n];
        if w > n {
            return out;
        }

        let mut span = Duration::ZERO;
        let mut missing = 0usize;
        for interval in &intervals[..w] {
            match interval {
                Some(d) => span += *d,
                None => missing += 1,
            }
        }

        let half = self.half_width();
        for start in 0..=(n - w) {
            if start > 0 {
                match intervals[start - 1] {
                    Some(d) => span -= d,
                    None => missing -= 1,
                }
                match intervals[start + w - 1] {
                    Some(d) => span += d,
                    None => missing += 1,
                }
            }
            if missing == 0 {
                out[start + half] = Some(if span.is_zero() {
                    f64::INFINITY
                } else {
                    w as f64 / span.as_secs_f64()
                });
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(n: usize, millis: u64) -> Vec<Option<Duration>> {
        vec![Some(Duration::from_millis(millis)); n]
    }

    #[test]
    fn test_constant_rate_gives_inverse_interval() {
        let calc = WindowFrequencyCalculator::new(3);
        let freqs = calc.compute_from_intervals(&constant(10, 500));
        let defined: Vec<f64> = freqs.iter().flatten().copied().collect();
        assert_eq!(defined.len(), 8);
        for f in defined {
            assert!((f - 2.0).abs() < 1e-12, "expected 2 Hz, got {f}");
        }
    }

    #[test]
    fn test_edges_undefined_centered() {
        let calc = WindowFrequencyCalculator::new(4);
        let freqs = calc.compute_from_intervals(&constant(10, 1000));
        // half = 2: positions 0,1 and 9 are undefined
        assert!(freqs[0].is_none());
        assert!(freqs[1].is_none());
        assert!(freqs[2].is_some());
        assert!(freqs[8].is_some());
        assert!(freqs[9].is_none());
    }

    #[test]
    fn test_missing_interval_poisons_only_its_windows() {
        let calc = WindowFrequencyCalculator::new(3);
        let mut intervals = constant(8, 1000);
        intervals[0] = None;
        let freqs = calc.compute_from_intervals(&intervals);
        // window starting at 0 (reported at 1) contains the missing interval
        assert!(freqs[1].is_none());
        assert_eq!(freqs[2], Some(1.0));
    }

    #[test]
    fn test_zero_span_is_unbounded_rate() {
        let calc = WindowFrequencyCalculator::new(2);
        let freqs = calc.compute_from_intervals(&[Some(Duration::ZERO); 4]);
        assert_eq!(freqs[0], None);
        assert!(freqs[1..].iter().all(|f| *f == Some(f64::INFINITY)));
    }

    #[test]
    fn test_burst_raises_local_rate() {
        let calc = WindowFrequencyCalculator::new(3);
        let mut intervals = constant(9, 1000);
        intervals[4] = Some(Duration::from_millis(50));
        let freqs = calc.compute_from_intervals(&intervals);
        // windows covering index 4 are starts 2,3,4 -> positions 3,4,5
        let expected = 3.0 / 2.05;
        for pos in 3..=5 {
            assert!((freqs[pos].unwrap() - expected).abs() < 1e-12);
        }
        assert_eq!(freqs[2], Some(1.0));
        assert_eq!(freqs[6], Some(1.0));
    }

    #[test]
    fn test_window_wider_than_buffer() {
        let calc = WindowFrequencyCalculator::new(5);
        let freqs = calc.compute_from_intervals(&constant(3, 1000));
        assert_eq!(freqs, vec![None, None, None]);
    }
}
