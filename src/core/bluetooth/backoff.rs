//! Exponential backoff used between automatic reconnection attempts

use std::time::Duration;

use crate::core::bluetooth::constants::{RECONNECT_BASE_DELAY_MS, RECONNECT_MAX_DELAY_MS};

/// Maps a reconnect attempt number to the delay before that attempt.
///
/// Attempt numbering starts at 1 after the first failure. The first attempt
/// waits `base`, every following attempt doubles the wait, and no delay
/// exceeds `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(RECONNECT_BASE_DELAY_MS),
            Duration::from_millis(RECONNECT_MAX_DELAY_MS),
        )
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Delay before reconnect attempt `attempt`; attempt 0 is treated as 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.ceiling, |d| d.min(self.ceiling))
    }
}
