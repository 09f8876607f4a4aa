use std::time::Duration;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, first one included. Must be at least 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Per-unit hardware retries: two tries, one retry.
    pub const fn unit_default() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
        }
    }

    /// Optimistic ledger commit retries.
    pub const fn allocation_default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(50),
        }
    }

    pub const fn immediate(max_attempts: u32) -> Self {
        Self { max_attempts, initial_backoff: Duration::ZERO, max_backoff: Duration::ZERO }
    }

    /// Whether another try may follow `attempts_made` tries.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before the try that follows `attempts_made` tries.
    pub fn backoff_for(&self, attempts_made: u32) -> Duration {
        let exp = attempts_made.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1 << exp).min(self.max_backoff)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1");
        }
        if self.initial_backoff > self.max_backoff {
            return Err("initial backoff exceeds max backoff");
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unit_default()
    }
}
