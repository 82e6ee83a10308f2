use log::warn;
use std::future::Future;
use std::time::Duration;

/// Errors that know whether repeating the same request could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Same delay before every retry.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
        }
    }

    pub fn none() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    /// delay = base_delay * multiplier^attempt, capped at max_delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are spent. The last error is returned unchanged.
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F
) -> Result<T, E>
    where F: FnMut() -> Fut, Fut: Future<Output = Result<T, E>>, E: Retryable + std::fmt::Display
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                    label,
                    attempt + 1,
                    policy.max_retries + 1,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(err);
            }
        }
    }
}
