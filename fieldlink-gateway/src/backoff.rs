//! Reconnect delay policy for the cloud link.

use std::time::Duration;

use rand::Rng;

/// Doubling backoff with a cap and a fixed fallback.
///
/// Delays run floor, 2×floor, ... up to the cap. Once doubling would pass
/// the cap, every further delay is the fallback until [`Backoff::reset`].
/// Each delay gets a random extra in `[0, jitter)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    fallback: Duration,
    jitter: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(2),
            Duration::from_secs(128),
            Duration::from_secs(16),
            Duration::from_secs(1),
        )
    }
}

impl Backoff {
    pub fn new(floor: Duration, cap: Duration, fallback: Duration, jitter: Duration) -> Self {
        Self {
            floor,
            cap,
            fallback,
            jitter,
            current: floor,
        }
    }

    /// Next delay without jitter.
    pub fn next_base(&mut self) -> Duration {
        if self.current > self.cap {
            return self.fallback;
        }
        let delay = self.current;
        self.current = self.current.saturating_mul(2);
        delay
    }

    /// Next delay including jitter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next_base();
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..jitter_ms))
    }

    /// Back to the floor after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}
