//! Bounded exponential backoff for cluster actions.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RolloutSettings;
use crate::error::{ClusterError, RolloutError};

/// Retry policy applied to each action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Multiplier applied after each retry.
    pub factor: u32,
}

impl RetryPolicy {
    /// Builds the policy from rollout settings.
    #[must_use]
    pub fn from_settings(settings: &RolloutSettings) -> Self {
        Self {
            attempts: settings.retry_attempts.max(1),
            base_delay: settings.retry_base_delay,
            factor: settings.retry_factor.max(1),
        }
    }

    /// Delay before attempt `attempt + 1` (`attempt` starts at 1).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        self.base_delay
            .saturating_mul(self.factor.saturating_pow(exponent))
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only transient cluster errors are retried.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::ApplyActionFailed`] carrying the last error.
    pub async fn run<T, F, Fut>(&self, description: &str, mut op: F) -> Result<T, RolloutError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let delay = self.delay_for(attempt);
                    warn!("{description} failed (attempt {attempt}/{}): {e}", self.attempts);
                    debug!("Retrying {description} in {}ms", delay.as_millis());
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(RolloutError::ApplyActionFailed {
                        action: description.to_string(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            factor: 2,
        }
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = policy()
            .run("create ConfigMap/dev/app", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ClusterError::network("connection refused"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_exhausted() {
        let calls = AtomicU32::new(0);
        let err = policy()
            .run("update Deployment/dev/web", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ClusterError::network("i/o timeout"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, RolloutError::ApplyActionFailed { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_fails_fast() {
        let calls = AtomicU32::new(0);
        let err = policy()
            .run("create Service/dev/web", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ClusterError::Rejected {
                    resource: String::from("Service/dev/web"),
                    message: String::from("invalid"),
                })
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RolloutError::ApplyActionFailed { attempts: 1, .. }));
    }
}
