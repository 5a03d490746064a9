//! Bounded retry with exponential backoff

use std::future::Future;
use std::time::{Duration, Instant};

use phimask_storage::ConnectorError;
use tracing::warn;

use crate::error::ProcessorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Per-attempt timeout for reads, writes and checkpoint commits.
    pub op_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
            op_timeout: Duration::from_secs(30),
        }
    }
}

/// Successful result of a retried operation.
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
    /// Duration of the attempt that succeeded.
    pub elapsed: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or runs
    /// out of attempts. Each attempt is bounded by `op_timeout`.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<Attempted<T>, ProcessorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = match tokio::time::timeout(self.op_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ConnectorError::Timeout {
                    operation,
                    timeout: self.op_timeout,
                }),
            };

            let err = match result {
                Ok(value) => {
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(ProcessorError::Connector {
                    operation,
                    source: err,
                });
            }
            if attempt >= max_attempts {
                return Err(ProcessorError::RetriesExhausted {
                    operation,
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.backoff(attempt);
            warn!(
                operation = operation,
                attempt = attempt,
                max_attempts = max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(2),
            op_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(1000),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let calls = &AtomicU32::new(0);
        let result = fast()
            .run("write", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ConnectorError::Unavailable("flaky".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(result.value, 7);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let err = fast()
            .run("read", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ConnectorError::Unavailable("down".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let err = fast()
            .run("write", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ConnectorError::Fatal("schema violation".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Connector { operation: "write", .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeouts_count_as_transient() {
        let policy = RetryPolicy {
            max_attempts: 2,
            op_timeout: Duration::from_millis(10),
            ..fast()
        };
        let err = policy
            .run("read", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ConnectorError>(())
            })
            .await
            .unwrap_err();
        match err {
            ProcessorError::RetriesExhausted { source, .. } => {
                assert!(matches!(source, ConnectorError::Timeout { operation: "read", .. }))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
