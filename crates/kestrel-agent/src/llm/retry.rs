//! Retry policy for backend calls.
//!
//! Every backend call in the agent goes through
//! [`RetryPolicy::execute_with_retry`].  Each attempt is bounded by a
//! per-attempt timeout and raced against the turn's cancellation token;
//! failures are retried only when [`AgentError::is_retryable`] says so, with
//! exponential backoff between attempts.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,
    /// Delay before the first retry; doubled after each failure.
    pub base_delay: Duration,
    /// Upper bound on the backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(180),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(30);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.  The last error is returned unchanged.
    ///
    /// Cancellation interrupts both an in-flight attempt and a backoff sleep
    /// and yields [`AgentError::Cancelled`].
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_retry_while(label, cancel, op, || true).await
    }

    /// Like [`RetryPolicy::execute_with_retry`], but a retryable failure is
    /// retried only while `may_retry` still returns true.  Streaming callers
    /// use this to stop retrying once output has reached the user.
    pub async fn execute_with_retry_while<T, F, Fut, P>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
        may_retry: P,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn() -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                res = tokio::time::timeout(self.attempt_timeout, op()) => res,
            };

            let err = match outcome {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        tracing::info!(label, attempt, "backend call succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(err)) => err,
                Err(_) => AgentError::NetworkFailure {
                    reason: format!(
                        "attempt timed out after {}s",
                        self.attempt_timeout.as_secs_f64()
                    ),
                },
            };

            if !err.is_retryable() {
                tracing::debug!(label, attempt, error = %err, "non-retryable failure");
                return Err(err);
            }

            if !may_retry() {
                tracing::debug!(label, attempt, error = %err, "retry vetoed by caller");
                return Err(err);
            }

            if attempt >= max_attempts {
                tracing::warn!(label, attempts = attempt, error = %err, "retry budget exhausted");
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            tracing::warn!(
                label,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying backend call"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            attempt_timeout: Duration::from_millis(200),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = fast_policy(3)
            .execute_with_retry("test", &CancellationToken::new(), move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(AgentError::EmptyResponse)
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_auth_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = fast_policy(3)
            .execute_with_retry("test", &CancellationToken::new(), move || {
                c.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(AgentError::AuthenticationFailure {
                        status: 401,
                        body: "bad key".into(),
                    })
                }
            })
            .await;
        assert!(matches!(
            result,
            Err(AgentError::AuthenticationFailure { status: 401, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_is_retried_to_the_bound_and_surfaces_network_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_millis(20),
            ..fast_policy(3)
        };
        let result: Result<()> = policy
            .execute_with_retry("test", &CancellationToken::new(), move || {
                c.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(AgentError::NetworkFailure { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn vetoed_retry_returns_first_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = fast_policy(3)
            .execute_with_retry_while(
                "test",
                &CancellationToken::new(),
                move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Err(AgentError::EmptyResponse) }
                },
                || false,
            )
            .await;
        assert!(matches!(result, Err(AgentError::EmptyResponse)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_immediately() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let token = cancel.clone();
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            ..fast_policy(3)
        };
        let result: Result<()> = policy
            .execute_with_retry("test", &cancel, move || {
                c.fetch_add(1, Ordering::SeqCst);
                token.cancel();
                async { Err(AgentError::RateLimited { body: String::new() }) }
            })
            .await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = fast_policy(2)
            .execute_with_retry("test", &CancellationToken::new(), move || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err(AgentError::ServerError {
                        status: 500 + n as u16,
                        body: String::new(),
                    })
                }
            })
            .await;
        assert!(matches!(
            result,
            Err(AgentError::ServerError { status: 501, .. })
        ));
    }
}
