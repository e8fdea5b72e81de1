//! Capped exponential backoff for transient platform failures.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use adbandit_connectors::PlatformError;

/// Retry schedule: base 1s, doubling, capped at 60s, five attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base.as_secs_f64() * exp;
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `op` until it succeeds, fails permanently, or exhausts retries.
///
/// Only transient errors are retried; a permanent error is returned
/// immediately so the caller can record it and move on.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: BackoffPolicy,
    what: &str,
    mut op: F,
) -> Result<T, PlatformError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PlatformError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                warn!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, backing off"
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
