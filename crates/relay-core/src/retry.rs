//! Bounded retry with exponential backoff for transient failures.
//!
//! Lock acquisition and callback delivery share the same policy: a small
//! fixed attempt budget with linear-base backoff plus jitter. Only errors
//! classified transient by [`Error::is_transient`] are retried; everything
//! else surfaces immediately.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Retry policy parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Base delay multiplied by the attempt number.
    pub base: Duration,
    /// Upper bound on the random jitter added to each delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// The storage policy: 3 attempts, 150ms x attempt + jitter.
    #[must_use]
    pub const fn storage() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(150),
            jitter: Duration::from_millis(50),
        }
    }

    /// Returns the delay before the next attempt (1-indexed).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base * attempt + Duration::from_millis(jitter_ms(self.jitter))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::storage()
    }
}

/// Runs `op` until it succeeds, fails non-transiently, or exhausts the
/// attempt budget.
///
/// # Errors
///
/// Returns the last error when attempts are exhausted, or the first
/// non-transient error.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if err.is_transient() {
                    return Err(Error::Internal {
                        message: format!(
                            "{op_name} failed after {attempt} attempts: {err}"
                        ),
                    });
                }
                return Err(err);
            }
        }
    }
}

/// Generates bounded random jitter without a rand dependency.
fn jitter_ms(bound: Duration) -> u64 {
    use std::time::SystemTime;
    let bound_ms = bound.as_millis() as u64;
    if bound_ms == 0 {
        return 0;
    }
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % bound_ms
}
