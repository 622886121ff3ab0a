//! Rate Baseline Module - sliding window rates, median baseline, anomaly rule
//!
//! ## Architecture
//!
//! - `WindowFrequencyCalculator`: local event rate per buffer position
//! - `median` / `baseline_of`: adaptive "normal rate" over the whole buffer
//! - `AnomalyRule`: compares the central window against the baseline
//!
//! The baseline adapts as the buffer slides: it is always the median of the
//! window frequencies currently in the buffer, so slow drift in the detector
//! rate (temperature, pressure) moves the baseline with it while a short
//! burst or gap only moves a few windows.

mod decision;
mod window;

pub use decision::AnomalyRule;
pub use window::WindowFrequencyCalculator;

/// Median of `values`, averaging the two middle values for an even count.
///
/// Returns `None` for an empty slice.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Baseline over per-position window frequencies, ignoring undefined positions.
pub fn baseline_of(window_frequencies: &[Option<f64>]) -> Option<f64> {
    let defined: Vec<f64> = window_frequencies.iter().flatten().copied().collect();
    median(&defined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd() {
        assert_eq!(median(&[5.0, 1.0, 3.0]), Some(3.0));
    }

    #[test]
    fn test_median_even_averages_middle_pair() {
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[0.2, 0.2, 0.4, 0.9, 0.1, 0.3]), Some(0.25));
    }

    #[test]
    fn test_median_empty() {
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_baseline_skips_undefined_positions() {
        let freqs = [None, Some(0.3), Some(0.1), Some(0.2), None, Some(10.0), None];
        // defined: 0.1 0.2 0.3 10.0 -> (0.2 + 0.3) / 2
        assert_eq!(baseline_of(&freqs), Some(0.25));
        assert_eq!(baseline_of(&[None, None]), None);
    }
}
