use memoria_core::{MemoriaError, MemoriaResult, RetryPolicy};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Type alias for the injectable sleep function used in tests.
#[cfg(test)]
type SleepFn = Box<
    dyn Fn(u64) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

/// Runs an external lookup under a per-attempt timeout, retrying timeouts and
/// other retryable failures with bounded exponential backoff.
///
/// A timed-out attempt becomes [`MemoriaError::Retryable`]. Non-retryable
/// errors are returned immediately. When every attempt is exhausted the last
/// retryable error surfaces to the caller.
pub struct BoundedRetry {
    policy: RetryPolicy,
    timeout: Duration,
    #[cfg(test)]
    sleep_fn: Option<SleepFn>,
}

impl BoundedRetry {
    /// Create a runner with the given backoff policy and per-attempt bound.
    pub fn new(policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            policy,
            timeout,
            #[cfg(test)]
            sleep_fn: None,
        }
    }

    /// The backoff policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Replace the sleep function (test-only).
    #[cfg(test)]
    fn with_sleep_fn(mut self, f: SleepFn) -> Self {
        self.sleep_fn = Some(f);
        self
    }

    async fn do_sleep(&self, ms: u64) {
        #[cfg(test)]
        if let Some(ref f) = self.sleep_fn {
            f(ms).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    /// Call `op` with the zero-based attempt number until it succeeds, fails
    /// permanently, or retries run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> MemoriaResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = MemoriaResult<T>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.policy.max_retries {
            let outcome = match tokio::time::timeout(self.timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(MemoriaError::Retryable(format!(
                    "{label} timed out after {}ms",
                    self.timeout.as_millis()
                ))),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    if attempt < self.policy.max_retries {
                        let delay = self.policy.backoff_ms(attempt);
                        warn!(
                            lookup = label,
                            attempt = attempt + 1,
                            max_retries = self.policy.max_retries,
                            delay_ms = delay,
                            error = %e,
                            "Retryable lookup failure, backing off"
                        );
                        self.do_sleep(delay).await;
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            MemoriaError::Retryable(format!("{label} exhausted its retries"))
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base_ms: 100,
            backoff_max_ms: 250,
        }
    }

    fn recording_retry(max_retries: u32, timeout_ms: u64) -> (BoundedRetry, Arc<Mutex<Vec<u64>>>) {
        let delays = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delays);
        let retry = BoundedRetry::new(policy(max_retries), Duration::from_millis(timeout_ms))
            .with_sleep_fn(Box::new(move |ms| {
                sink.lock().unwrap().push(ms);
                Box::pin(async {}) as std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
            }));
        (retry, delays)
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let (retry, delays) = recording_retry(3, 1_000);
        let calls = AtomicU32::new(0);
        let result = retry
            .run("reviewer", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(MemoriaError::Retryable("busy".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(*delays.lock().unwrap(), vec![100, 200]);
    }

    #[tokio::test]
    async fn test_timeout_becomes_retryable_and_surfaces() {
        let (retry, delays) = recording_retry(2, 10);
        let err = retry
            .run("reviewer", |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, MemoriaError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
        assert_eq!(*delays.lock().unwrap(), vec![100, 200]);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let (retry, delays) = recording_retry(5, 1_000);
        let calls = AtomicU32::new(0);
        let err = retry
            .run("reviewer", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(MemoriaError::NotFound("proposal".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MemoriaError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(delays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backoff_respects_cap() {
        let (retry, delays) = recording_retry(4, 1_000);
        let _ = retry
            .run("reviewer", |_| async {
                Err::<(), _>(MemoriaError::Retryable("down".into()))
            })
            .await;
        assert_eq!(*delays.lock().unwrap(), vec![100, 200, 250, 250]);
    }
}
