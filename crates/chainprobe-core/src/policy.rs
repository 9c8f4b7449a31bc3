//! Backoff schedules and deadlines for correlator scans and poll requests.

use std::time::Duration;

use tokio::time::Instant;

/// Stand-in deadline for timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `started + timeout`, saturating to a far-future instant instead of
/// overflowing.
pub fn deadline_after(started: Instant, timeout: Duration) -> Instant {
    started
        .checked_add(timeout)
        .unwrap_or_else(|| started + FAR_FUTURE)
}

/// Configuration for an exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Multiplier applied to the delay on each attempt.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// A schedule that always waits `interval`.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
            multiplier: 1.0,
        }
    }
}

/// Stateful backoff: each call to [`Backoff::next_delay`] grows the delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt, capped at `max` and never zero.
    pub fn next_delay(&mut self) -> Duration {
        let base_ms = self.config.initial.as_millis() as f64
            * self.config.multiplier.powi(self.attempt.min(32) as i32);
        let capped = base_ms.min(self.config.max.as_millis() as f64);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis((capped as u64).max(1))
    }

    /// The largest delay this schedule can produce.
    pub fn max_delay(&self) -> Duration {
        self.config.max.max(Duration::from_millis(1))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Bounded retry budget for transient request failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (not counting the first try).
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffConfig {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(2),
                multiplier: 2.0,
            },
        }
    }
}
