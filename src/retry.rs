use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::LiveError;

/// Bounded exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 means exactly one attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter_enabled: bool,
    /// Fractional spread around the nominal delay, e.g. 0.25 for ±25%.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_factor: 2.0,
            jitter_enabled: true,
            jitter_factor: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Policy used for stream reconnection unless overridden.
    pub fn reconnect_default() -> Self {
        Self {
            max_retries: 10,
            ..Self::default()
        }
    }

    /// Delay before the n-th retry (1-based), jittered when enabled.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let nominal = (self.initial_delay.as_millis() as f64
            * self.backoff_factor.powi(retry.saturating_sub(1) as i32))
        .min(self.max_delay.as_millis() as f64);

        let millis = if self.jitter_enabled && self.jitter_factor > 0.0 {
            let low = nominal * (1.0 - self.jitter_factor);
            let high = nominal * (1.0 + self.jitter_factor);
            rand::thread_rng().gen_range(low..=high)
        } else {
            nominal
        };

        Duration::from_millis(millis.max(0.0) as u64)
    }
}

/// Observation hooks for a single `execute` call.
#[derive(Default)]
pub struct RetryHooks<'a> {
    /// Fired before each retry sleep with the 1-based retry number,
    /// the chosen delay in milliseconds, and the error being retried.
    pub on_retry: Option<&'a (dyn Fn(u32, u64, &LiveError) + Send + Sync)>,
    /// Fired on success with the total number of attempts made.
    pub on_success: Option<&'a (dyn Fn(u32) + Send + Sync)>,
    /// Overrides the error's own retryability classification.
    pub is_retryable: Option<&'a (dyn Fn(&LiveError) -> bool + Send + Sync)>,
}

/// Runs a fallible operation under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, the error is classified permanent,
    /// the retry budget runs out, or the scope is cancelled mid-sleep.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: Option<&CancelToken>,
        hooks: RetryHooks<'_>,
        mut op: F,
    ) -> Result<T, LiveError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LiveError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if let Some(on_success) = hooks.on_success {
                        on_success(attempt);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let retryable = hooks
                        .is_retryable
                        .map_or_else(|| err.is_retryable(), |f| f(&err));
                    let retries_done = attempt - 1;
                    if !retryable || retries_done >= self.policy.max_retries {
                        return Err(err);
                    }

                    let retry = retries_done + 1;
                    let delay = self.policy.delay_for(retry);
                    warn!(
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    if let Some(on_retry) = hooks.on_retry {
                        on_retry(retry, delay.as_millis() as u64, &err);
                    }

                    match cancel {
                        Some(token) => {
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                () = token.cancelled() => return Err(LiveError::Cancelled),
                            }
                        }
                        None => tokio::time::sleep(delay).await,
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            backoff_factor: 2.0,
            jitter_enabled: false,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_nominal_delays_grow_and_cap() {
        let policy = fast_policy(5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for(4), Duration::from_millis(80));
        assert_eq!(policy.delay_for(5), Duration::from_millis(80));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy {
            jitter_enabled: true,
            jitter_factor: 0.25,
            ..fast_policy(3)
        };
        for _ in 0..100 {
            let delay = policy.delay_for(2).as_millis() as f64;
            assert!((15.0..=25.0).contains(&delay), "delay {} out of band", delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let executor = RetryExecutor::new(fast_policy(3));
        let calls = Arc::new(AtomicU32::new(0));
        let retries_seen = Arc::new(AtomicU32::new(0));
        let successes = Arc::new(AtomicU32::new(0));

        let on_retry_calls = Arc::clone(&retries_seen);
        let on_retry = move |n: u32, _delay: u64, _err: &LiveError| {
            on_retry_calls.store(n, Ordering::SeqCst);
        };
        let on_success_calls = Arc::clone(&successes);
        let on_success = move |attempts: u32| {
            on_success_calls.store(attempts, Ordering::SeqCst);
        };

        let op_calls = Arc::clone(&calls);
        let result = executor
            .execute(
                None,
                RetryHooks {
                    on_retry: Some(&on_retry),
                    on_success: Some(&on_success),
                    is_retryable: None,
                },
                move || {
                    let calls = Arc::clone(&op_calls);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(LiveError::Transport("flaky".to_string()))
                        } else {
                            Ok(42)
                        }
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Last on_retry call carried retry number 2.
        assert_eq!(retries_seen.load(Ordering::SeqCst), 2);
        // on_success counts the successful attempt.
        assert_eq!(successes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_means_one_attempt() {
        let executor = RetryExecutor::new(fast_policy(0));
        let calls = Arc::new(AtomicU32::new(0));

        let op_calls = Arc::clone(&calls);
        let err = executor
            .execute(None, RetryHooks::default(), move || {
                let calls = Arc::clone(&op_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(LiveError::Transport("down".to_string()))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LiveError::Transport(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_errors_short_circuit() {
        let executor = RetryExecutor::new(fast_policy(5));
        let calls = Arc::new(AtomicU32::new(0));

        let op_calls = Arc::clone(&calls);
        let err = executor
            .execute(None, RetryHooks::default(), move || {
                let calls = Arc::clone(&op_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(LiveError::NotGeoJson("a csv file".to_string()))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LiveError::NotGeoJson(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_sleep_fails_promptly() {
        let executor = RetryExecutor::new(RetryPolicy {
            initial_delay: Duration::from_secs(3600),
            ..fast_policy(3)
        });
        let token = CancelToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel();
            })
        };

        let err = executor
            .execute(Some(&token), RetryHooks::default(), || async {
                Err::<(), _>(LiveError::Transport("down".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LiveError::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_retryable_override_wins() {
        let executor = RetryExecutor::new(fast_policy(2));
        let calls = Arc::new(AtomicU32::new(0));
        let never = |_err: &LiveError| false;

        let op_calls = Arc::clone(&calls);
        let err = executor
            .execute(
                None,
                RetryHooks {
                    is_retryable: Some(&never),
                    ..RetryHooks::default()
                },
                move || {
                    let calls = Arc::clone(&op_calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(LiveError::Transport("down".to_string()))
                    }
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LiveError::Transport(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
