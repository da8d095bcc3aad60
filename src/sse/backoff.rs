//! Reconnect delay policy.

use std::time::Duration;

/// Exponential reconnect delay: `min(initial * 2^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1_000),
            max: Duration::from_millis(30_000),
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before reconnect number `attempt + 1`, where `attempt` counts the
    /// reconnects already scheduled since the last successful open.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (0..7).map(|a| backoff.delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_delay_saturates_for_long_sessions() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(31), backoff.max);
        assert_eq!(backoff.delay(32), backoff.max);
        assert_eq!(backoff.delay(u32::MAX), backoff.max);
    }
}
