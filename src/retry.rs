//! Exponential backoff policy used by protocol clients and the batch
//! writers.

use rand::Rng;
use std::time::Duration;

/// Backoff schedule: `initial · multiplier^attempt`, capped, with
/// optional jitter to keep a fleet of retries from synchronizing.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            initial_delay,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based: the delay after the
    /// first failure is `delay_for(0)`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let secs = if self.jitter {
            // Up to 10% early, never late: keeps the cap a true cap.
            capped * rand::thread_rng().gen_range(0.9..=1.0)
        } else {
            capped
        };
        Duration::from_secs_f64(secs)
    }

    /// Sleep out the backoff for `attempt`.
    pub async fn backoff(&self, attempt: u32) {
        tokio::time::sleep(self.delay_for(attempt)).await;
    }
}
