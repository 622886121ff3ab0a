//! Time source for retry scheduling
//!
//! The replicator never reads the clock directly, so tests can drive its
//! backoff schedule without waiting in real time.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Sleep until `deadline` (returns at once if it has passed).
    async fn sleep_until(&self, deadline: Instant);
}

/// Wall clock backed by tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }
}

/// Clock that only moves when told to.
///
/// `sleep_until` jumps straight to the deadline, so a replicator running on
/// a `ManualClock` retries as fast as the runtime schedules it.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *elapsed += by;
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    async fn sleep_until(&self, deadline: Instant) {
        {
            let mut elapsed = self.elapsed.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let target = deadline.saturating_duration_since(self.origin);
            if target > *elapsed {
                *elapsed = target;
            }
        }
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_jumps_to_deadline() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, Duration::from_secs(5));

        clock.sleep_until(start + Duration::from_secs(65)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(65));

        // a deadline in the past does not move the clock back
        clock.sleep_until(start).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(65));
    }
}
