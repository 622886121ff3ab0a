//! Baseline-vs-central anomaly rule

use crate::types::{AnomalyFlag, Decision, Direction, SuppressReason};
use statrs::distribution::{ContinuousCDF, Gamma};

/// Two-sided rate excursion rule with a ceiling on trustworthy baselines.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyRule {
    /// Multiplicative sensitivity `T` (> 1)
    pub threshold: f64,
    /// Maximum trustworthy baseline `M` (events/s)
    pub ceiling: f64,
    /// Window width `W`, used for the significance estimate
    pub window_width: usize,
}

impl AnomalyRule {
    pub fn new(threshold: f64, ceiling: f64, window_width: usize) -> Self {
        Self {
            threshold,
            ceiling,
            window_width,
        }
    }

    /// Evaluate one cycle.
    ///
    /// High when `central >= baseline * T`, low when `central <= baseline / T`.
    /// A baseline above the ceiling suppresses the cycle entirely. An infinite
    /// central rate (simultaneous events) is high, without a p-value.
    pub fn evaluate(&self, central: Option<f64>, baseline: Option<f64>) -> Decision {
        let Some(baseline) = baseline else {
            return Decision::Suppressed(SuppressReason::UndefinedBaseline);
        };
        if baseline > self.ceiling {
            return Decision::Suppressed(SuppressReason::BaselineAboveCeiling {
                baseline,
                ceiling: self.ceiling,
            });
        }
        let Some(central) = central else {
            return Decision::Suppressed(SuppressReason::UndefinedCentralWindow);
        };

        let direction = if central >= baseline * self.threshold {
            Some(Direction::High)
        } else if central <= baseline / self.threshold {
            Some(Direction::Low)
        } else {
            None
        };

        let p_value = direction.and_then(|d| self.tail_probability(central, baseline, d));

        Decision::Evaluated(AnomalyFlag {
            triggered: direction.is_some(),
            direction,
            ratio: central / baseline,
            baseline,
            central_frequency: central,
            p_value,
        })
    }

    /// Probability that `W` events of a Poisson process at `baseline` span a
    /// time at least as extreme as the observed central window.
    fn tail_probability(&self, central: f64, baseline: f64, direction: Direction) -> Option<f64> {
        if !central.is_finite() || central <= 0.0 || baseline <= 0.0 {
            return None;
        }
        let w = self.window_width as f64;
        let span = w / central;
        let gamma = Gamma::new(w, baseline).ok()?;
        let cdf = gamma.cdf(span);
        let p = match direction {
            Direction::High => cdf,
            Direction::Low => 1.0 - cdf,
        };
        p.is_finite().then_some(p)
    }
}
