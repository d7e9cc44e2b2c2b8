//! Resilience patterns for outbound service calls.
//!
//! [`ResilientExecutor`] layers bounded retry on top of a
//! [`CircuitBreaker`]. Each attempt is admitted by the breaker, and only
//! dependency faults are recorded as breaker failures. Breaker rejections,
//! non-retryable errors and cancellation end the loop at once.

mod circuit_breaker;
mod retry;

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tonic::Status;

pub use circuit_breaker::{
    Admission, BreakerError, BreakerState, CircuitBreaker, CircuitBreakerConfig, Counts, Outcome,
};
pub use retry::{ErrorCategory, RetryPolicy, is_backend_fault};

use crate::infrastructure::clock::SharedClock;
use crate::infrastructure::metrics;

/// Final, classified error from a resilient call.
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    /// The breaker is open.
    #[error("circuit breaker is open")]
    BreakerOpen,
    /// Half-open trial slots are taken.
    #[error("circuit breaker is half-open and at capacity")]
    TooManyRequests,
    /// The caller cancelled or its deadline passed.
    #[error("operation cancelled")]
    Cancelled,
    /// Last error returned by the dependency.
    #[error("upstream call failed: {}", .0.message())]
    Upstream(Status),
}

impl From<BreakerError> for ResilienceError {
    fn from(err: BreakerError) -> Self {
        match err {
            BreakerError::Open => Self::BreakerOpen,
            BreakerError::TooManyRequests => Self::TooManyRequests,
        }
    }
}

impl From<ResilienceError> for Status {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::BreakerOpen | ResilienceError::TooManyRequests => {
                Self::resource_exhausted(err.to_string())
            }
            ResilienceError::Cancelled => Self::cancelled(err.to_string()),
            ResilienceError::Upstream(status) => status,
        }
    }
}

/// Circuit breaker plus retry policy for one dependency.
#[derive(Debug)]
pub struct ResilientExecutor {
    breaker: CircuitBreaker,
    policy: RetryPolicy,
}

impl ResilientExecutor {
    /// Create an executor with its own breaker.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        breaker: CircuitBreakerConfig,
        policy: RetryPolicy,
        clock: SharedClock,
    ) -> Self {
        Self {
            breaker: CircuitBreaker::new(name, breaker, clock),
            policy,
        }
    }

    /// Breaker guarding this dependency.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Retry policy in use.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` with breaker admission and bounded retry.
    ///
    /// `cancel` aborts the inter-attempt wait and any running attempt; no
    /// attempt starts after it fires.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError`] describing why the call ultimately failed.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let attempts = self.policy.effective_attempts();

        for attempt in 1..=attempts {
            if attempt > 1 {
                metrics::record_retry(self.breaker.name());
                self.pause(cancel).await?;
            }
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }

            let admission = self.breaker.admit()?;

            // Dropping `admission` unsettled (cancel branch, caller timeout,
            // panic in `op`) releases it as abandoned.
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    admission.abandon();
                    return Err(ResilienceError::Cancelled);
                }
                result = op() => result,
            };

            let status = match result {
                Ok(value) => {
                    admission.record(Outcome::Success);
                    return Ok(value);
                }
                Err(status) => status,
            };

            let outcome = if is_backend_fault(status.code()) {
                Outcome::Failure
            } else {
                Outcome::Success
            };
            admission.record(outcome);

            let category = ErrorCategory::from_code(status.code());
            if !category.is_retryable() || attempt == attempts {
                return Err(ResilienceError::Upstream(status));
            }

            tracing::debug!(
                breaker = %self.breaker.name(),
                attempt,
                attempts,
                code = ?status.code(),
                error = status.message(),
                "Retrying outbound call"
            );
        }

        // `attempts` is at least one, so the loop always returns.
        Err(ResilienceError::Cancelled)
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), ResilienceError> {
        if self.policy.retry_delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ResilienceError::Cancelled),
            () = tokio::time::sleep(self.policy.retry_delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::infrastructure::clock::ManualClock;

    fn executor(attempts: u32, delay: Duration) -> ResilientExecutor {
        ResilientExecutor::new(
            "test",
            CircuitBreakerConfig::default(),
            RetryPolicy::new(attempts, delay),
            Arc::new(ManualClock::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt() {
        let executor = executor(3, Duration::from_millis(100));
        let calls = AtomicU32::new(0);

        let result = executor
            .execute(&CancellationToken::new(), || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(Status::unavailable("not yet"))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(assert_ok!(result), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_surface_last_error() {
        let executor = executor(3, Duration::from_millis(10));
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Status::unavailable("down"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::Upstream(ref s) if s.code() == tonic::Code::Unavailable));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_attempts_runs_once() {
        let executor = executor(0, Duration::ZERO);
        let calls = AtomicU32::new(0);

        let result = executor
            .execute(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Status::unavailable("down"))
            })
            .await;

        assert_err!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_retryable_stops_immediately() {
        let executor = executor(5, Duration::ZERO);
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Status::invalid_argument("bad input"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::Upstream(ref s) if s.code() == tonic::Code::InvalidArgument));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Client faults are not dependency failures.
        assert_eq!(executor.breaker().counts().total_failures, 0);
    }

    #[tokio::test]
    async fn open_breaker_never_invokes_operation() {
        let executor = executor(1, Duration::ZERO);
        for _ in 0..10 {
            let _ = executor
                .execute(&CancellationToken::new(), || async {
                    Err::<(), _>(Status::unavailable("down"))
                })
                .await;
        }
        assert_eq!(executor.breaker().state(), BreakerState::Open);

        let calls = AtomicU32::new(0);
        for _ in 0..5 {
            let err = executor
                .execute(&CancellationToken::new(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap_err();
            assert!(matches!(err, ResilienceError::BreakerOpen));
            assert_eq!(Status::from(err).code(), tonic::Code::ResourceExhausted);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn breaker_rejection_does_not_consume_retries() {
        let executor = executor(3, Duration::ZERO);
        for _ in 0..4 {
            let _ = executor
                .execute(&CancellationToken::new(), || async {
                    Err::<(), _>(Status::unavailable("down"))
                })
                .await;
        }
        // 12 failures with minimum 10 requests: open after the 10th.
        assert_eq!(executor.breaker().state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_delay_aborts() {
        let executor = Arc::new(executor(3, Duration::from_secs(10)));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let task = {
            let executor = Arc::clone(&executor);
            let cancel = cancel.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                executor
                    .execute(&cancel, || {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err::<(), _>(Status::unavailable("down"))
                        }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ResilienceError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_attempt() {
        let executor = executor(3, Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(&cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::Cancelled));
        assert_eq!(Status::from(err).code(), tonic::Code::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    async fn trip_with_failures(executor: &ResilientExecutor) {
        for _ in 0..10 {
            let _ = executor
                .execute(&CancellationToken::new(), || async {
                    Err::<(), _>(Status::unavailable("down"))
                })
                .await;
        }
        assert_eq!(executor.breaker().state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_trial_calls_do_not_wedge_half_open() {
        let clock = Arc::new(ManualClock::new());
        let executor = ResilientExecutor::new(
            "test",
            CircuitBreakerConfig::default(),
            RetryPolicy::no_retry(),
            clock.clone(),
        );
        trip_with_failures(&executor).await;
        clock.advance(Duration::from_secs(30));

        for _ in 0..3 {
            let token = CancellationToken::new();
            let slow = executor.execute(&token, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            });
            assert!(tokio::time::timeout(Duration::from_millis(10), slow).await.is_err());
        }
        clock.advance(Duration::from_secs(3600));
        assert_eq!(executor.breaker().state(), BreakerState::HalfOpen);

        let result = executor
            .execute(&CancellationToken::new(), || async { Ok("healthy") })
            .await;
        assert_eq!(assert_ok!(result), "healthy");
    }

    #[tokio::test]
    async fn panicking_trial_call_releases_its_slot() {
        use futures::FutureExt;

        let clock = Arc::new(ManualClock::new());
        let executor = ResilientExecutor::new(
            "test",
            CircuitBreakerConfig::default(),
            RetryPolicy::no_retry(),
            clock.clone(),
        );
        trip_with_failures(&executor).await;
        clock.advance(Duration::from_secs(30));

        for _ in 0..3 {
            let token = CancellationToken::new();
            let call = executor.execute(&token, || async {
                if executor.policy().effective_attempts() > 0 {
                    panic!("dependency client exploded");
                }
                Ok(())
            });
            assert!(std::panic::AssertUnwindSafe(call).catch_unwind().await.is_err());
        }

        for _ in 0..3 {
            let result = executor
                .execute(&CancellationToken::new(), || async { Ok(()) })
                .await;
            assert_ok!(result);
        }
        assert_eq!(executor.breaker().state(), BreakerState::Closed);
    }
}
