//! Bounded retry with exponential backoff around a fallible async operation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::policy::{ExternalService, RetryPolicy};
use crate::error::ServiceError;

/// Decides whether an error is worth another attempt.
pub type RetryCondition<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
/// Called with the number of the attempt that just failed, before the next one.
pub type RetryHook<E> = Arc<dyn Fn(u32, &E) + Send + Sync>;
/// Called once with the last error when the attempt budget is spent.
pub type ExhaustedHook<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Policy plus hooks for one kind of call.
pub struct RetryConfig<E> {
    pub policy: RetryPolicy,
    retry_condition: RetryCondition<E>,
    on_retry: Option<RetryHook<E>>,
    on_max_attempts_reached: Option<ExhaustedHook<E>>,
}

impl<E> RetryConfig<E> {
    /// Retry every error under `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_condition: Arc::new(|_| true),
            on_retry: None,
            on_max_attempts_reached: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Arc::new(condition);
        self
    }

    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32, &E) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn on_max_attempts_reached<F>(mut self, hook: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.on_max_attempts_reached = Some(Arc::new(hook));
        self
    }

    pub fn should_retry(&self, error: &E) -> bool {
        (self.retry_condition)(error)
    }
}

impl RetryConfig<ServiceError> {
    /// Preset for `service`, retrying only errors that are transient.
    pub fn for_service(service: ExternalService) -> Self {
        Self::new(RetryPolicy::for_service(service)).with_retry_condition(ServiceError::is_retryable)
    }
}

impl<E> Default for RetryConfig<E> {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl<E> Clone for RetryConfig<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            retry_condition: Arc::clone(&self.retry_condition),
            on_retry: self.on_retry.clone(),
            on_max_attempts_reached: self.on_max_attempts_reached.clone(),
        }
    }
}

impl<E> core::fmt::Debug for RetryConfig<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("policy", &self.policy)
            .field("on_retry", &self.on_retry.is_some())
            .field("on_max_attempts_reached", &self.on_max_attempts_reached.is_some())
            .finish_non_exhaustive()
    }
}

/// A successful result together with how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// The error that ended a retry loop, with the same bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
    pub elapsed: Duration,
    /// `true` when the budget ran out; `false` when the retry condition
    /// rejected the error and the loop stopped early.
    pub exhausted: bool,
}

/// Runs operations under a [`RetryConfig`].
///
/// Backoff delays are `tokio::time::sleep`s, so the runtime keeps serving other
/// tasks meanwhile. Dropping the returned future abandons the loop; there is no
/// other cancellation.
#[derive(Debug, Clone, Copy)]
pub struct RetryExecutor {
    label: &'static str,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new("operation")
    }
}

impl RetryExecutor {
    /// `label` only appears in log lines.
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }

    pub fn for_service(service: ExternalService) -> Self {
        Self::new(service.name())
    }

    /// Run `operation` until it succeeds, the retry condition rejects an error,
    /// or the attempt budget is spent. The last error is returned unchanged.
    pub async fn execute<T, E, F, Fut>(&self, operation: F, config: &RetryConfig<E>) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: core::fmt::Display,
    {
        self.execute_with_metadata(operation, config)
            .await
            .map(|ok| ok.value)
            .map_err(|failure| failure.error)
    }

    /// Like [`execute`](Self::execute), additionally reporting attempt count
    /// and elapsed time on both paths.
    pub async fn execute_with_metadata<T, E, F, Fut>(
        &self,
        mut operation: F,
        config: &RetryConfig<E>,
    ) -> Result<Attempted<T>, RetryFailure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: core::fmt::Display,
    {
        let started = Instant::now();
        let max_attempts = config.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = self.label, attempts = attempt, "succeeded after retry");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
                Err(error) => error,
            };

            if !config.should_retry(&error) {
                debug!(operation = self.label, attempt, error = %error, "error is not retryable");
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                    exhausted: false,
                });
            }

            if attempt >= max_attempts {
                warn!(
                    operation = self.label,
                    attempts = attempt,
                    error = %error,
                    "max attempts reached"
                );
                if let Some(hook) = &config.on_max_attempts_reached {
                    hook(&error);
                }
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                    exhausted: true,
                });
            }

            let delay = config.policy.delay_for_attempt(attempt);
            debug!(
                operation = self.label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;

            if let Some(hook) = &config.on_retry {
                hook(attempt, &error);
            }
        }
    }

    /// Service-call flavour: exhaustion is reported as
    /// [`ServiceError::RetryExhausted`]; non-retryable errors pass through as-is.
    pub async fn call<T, F, Fut>(
        &self,
        operation: F,
        config: &RetryConfig<ServiceError>,
    ) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        match self.execute_with_metadata(operation, config).await {
            Ok(ok) => Ok(ok.value),
            Err(failure) if failure.exhausted => Err(ServiceError::RetryExhausted {
                attempts: failure.attempts,
                elapsed: failure.elapsed,
                source: Box::new(failure.error),
            }),
            Err(failure) => Err(failure.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use castline_core::DomainError;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_attempts, Duration::from_millis(100), Duration::from_millis(250))
    }

    #[tokio::test(start_paused = true)]
    async fn fails_twice_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));

        let retries_hook = retries.clone();
        let config = RetryConfig::<String>::new(fast_policy(3))
            .on_retry(move |_, _| {
                retries_hook.fetch_add(1, Ordering::SeqCst);
            });

        let counter = calls.clone();
        let result = RetryExecutor::default()
            .execute_with_metadata(
                || {
                    let counter = counter.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        if n < 3 { Err(format!("attempt {n} failed")) } else { Ok("done") }
                    }
                },
                &config,
            )
            .await
            .unwrap();

        assert_eq!(result.value, "done");
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
        // 100ms + 200ms of virtual backoff
        assert_eq!(result.elapsed, Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));

        let retries_hook = retries.clone();
        let config = RetryConfig::<ServiceError>::new(fast_policy(5))
            .with_retry_condition(|_| false)
            .on_retry(move |_, _| {
                retries_hook.fetch_add(1, Ordering::SeqCst);
            });

        let counter = calls.clone();
        let err = RetryExecutor::default()
            .execute(
                || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(ServiceError::from(DomainError::validation("bad url")))
                    }
                },
                &config,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retries.load(Ordering::SeqCst), 0);
        assert!(matches!(err, ServiceError::Domain(DomainError::Validation(ref m)) if m == "bad url"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_rethrows_last_error_and_fires_hook() {
        let exhausted = Arc::new(AtomicU32::new(0));
        let hook = exhausted.clone();
        let config = RetryConfig::<String>::new(fast_policy(3)).on_max_attempts_reached(move |_| {
            hook.fetch_add(1, Ordering::SeqCst);
        });

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let failure = RetryExecutor::default()
            .execute_with_metadata(
                || {
                    let counter = counter.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        Err::<(), _>(format!("failure #{n}"))
                    }
                },
                &config,
            )
            .await
            .unwrap_err();

        assert_eq!(failure.error, "failure #3");
        assert_eq!(failure.attempts, 3);
        assert!(failure.exhausted);
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
        // 100ms + 200ms; no sleep after the final attempt
        assert_eq!(failure.elapsed, Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn service_call_wraps_exhaustion() {
        let config = RetryConfig::<ServiceError>::new(fast_policy(2))
            .with_retry_condition(ServiceError::is_retryable);

        let err = RetryExecutor::new("cdn")
            .call(
                || async { Err::<(), _>(ServiceError::external("cdn", "gateway timeout")) },
                &config,
            )
            .await
            .unwrap_err();

        match err {
            ServiceError::RetryExhausted { attempts, source, .. } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*source, ServiceError::ExternalService { service: "cdn", .. }));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_max_attempts_still_tries_once() {
        let config = RetryConfig::<String>::new(fast_policy(0));
        let value = RetryExecutor::default()
            .execute(|| async { Ok::<_, String>(42) }, &config)
            .await
            .unwrap();
        assert_eq!(value, 42);
    }
}
