//! Inbound Request Pipeline
//!
//! Every RPC handler runs inside [`Pipeline::run`], which applies the
//! stages in a fixed order:
//!
//! ```text
//! trace ─► shutdown admission ─► cancellation/deadline race
//!                                   └─► panic guard ─► rate limiter ─► handler
//! logger armed first, records the outcome on the way out (or on drop)
//! ```
//!
//! The trace ID, cancellation token and deadline travel in an explicit
//! [`CallContext`] instead of task-local state.

pub mod context;
pub mod logger;
pub mod panic_guard;
pub mod rate_limiter;
pub mod shutdown;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::{Response, Status};

pub use context::{CallContext, TRACE_ID_HEADER};
pub use rate_limiter::{MethodRateLimiter, RateLimit, TokenBucket};
pub use shutdown::{CallPermit, ShutdownCoordinator, ShutdownOutcome};

/// Ordered middleware chain shared by all handlers of a server.
#[derive(Debug)]
pub struct Pipeline {
    limiter: Option<MethodRateLimiter>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl Pipeline {
    /// Create a pipeline. `None` disables rate limiting.
    #[must_use]
    pub const fn new(limiter: Option<MethodRateLimiter>, shutdown: Arc<ShutdownCoordinator>) -> Self {
        Self { limiter, shutdown }
    }

    /// Shutdown coordinator used for admission.
    #[must_use]
    pub const fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Run `handler` for the call `operation` through every stage.
    ///
    /// The trace ID is echoed in the response metadata on success and on
    /// error.
    ///
    /// # Errors
    ///
    /// Returns the handler's error, or the status produced by a stage:
    /// `Unavailable` while shutting down, `ResourceExhausted` when rate
    /// limited, `Internal` on panic, `Cancelled` or `DeadlineExceeded`.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        metadata: &MetadataMap,
        handler: F,
    ) -> Result<Response<T>, Status>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let started = Instant::now();
        let admission = self.shutdown.admit();
        let cancel = admission
            .as_ref()
            .map_or_else(|_| CancellationToken::new(), CallPermit::cancellation);
        let ctx = CallContext::from_metadata(operation, metadata, cancel);
        let log = logger::CompletionLog::start(ctx.clone(), started);

        let outcome = match admission {
            Ok(permit) => {
                let outcome = self.execute(&ctx, handler).await;
                drop(permit);
                outcome
            }
            Err(status) => Err(status),
        };

        log.finish(&outcome);

        match outcome {
            Ok(message) => {
                let mut response = Response::new(message);
                ctx.echo_trace_id(response.metadata_mut());
                Ok(response)
            }
            Err(mut status) => {
                ctx.echo_trace_id(status.metadata_mut());
                Err(status)
            }
        }
    }

    async fn execute<T, F, Fut>(&self, ctx: &CallContext, handler: F) -> Result<T, Status>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let guarded = panic_guard::guard(ctx, async {
            if let Some(limiter) = &self.limiter {
                limiter.check(ctx.operation())?;
            }
            handler(ctx.clone()).await
        });

        let deadline = async {
            match ctx.deadline() {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = ctx.cancellation().cancelled() => Err(Status::cancelled("request cancelled")),
            () = deadline => Err(Status::deadline_exceeded("deadline exceeded")),
            result = guarded => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::infrastructure::clock::ManualClock;

    const OP: &str = "/spot.v1.SpotInstrumentService/ViewMarkets";

    fn pipeline(limiter: Option<MethodRateLimiter>) -> Pipeline {
        Pipeline::new(limiter, Arc::new(ShutdownCoordinator::new()))
    }

    fn trace_of(metadata: &MetadataMap) -> String {
        metadata
            .get(TRACE_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn handler_sees_caller_trace_id_and_it_is_echoed() {
        let mut metadata = MetadataMap::new();
        metadata.insert(TRACE_ID_HEADER, "trace-42".parse().unwrap());

        let response = pipeline(None)
            .run(OP, &metadata, |ctx| async move { Ok(ctx.trace_id().to_string()) })
            .await
            .unwrap();

        assert_eq!(response.get_ref(), "trace-42");
        assert_eq!(trace_of(response.metadata()), "trace-42");
    }

    #[tokio::test]
    async fn errors_carry_trace_id() {
        let status = pipeline(None)
            .run(OP, &MetadataMap::new(), |_ctx| async {
                Err::<(), _>(Status::invalid_argument("bad"))
            })
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(uuid::Uuid::parse_str(&trace_of(status.metadata())).is_ok());
    }

    #[tokio::test]
    async fn rate_limited_call_skips_handler() {
        let limiter = MethodRateLimiter::new(RateLimit::new(1.0, 1), Arc::new(ManualClock::new()));
        let pipeline = pipeline(Some(limiter));
        let calls = std::sync::atomic::AtomicUsize::new(0);

        for _ in 0..2 {
            let _ = pipeline
                .run(OP, &MetadataMap::new(), |_ctx| async {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                })
                .await;
        }
        let status = pipeline
            .run(OP, &MetadataMap::new(), |_ctx| async { Ok(()) })
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panic_is_reported_as_internal_and_service_keeps_serving() {
        let pipeline = pipeline(None);
        let status = pipeline
            .run(OP, &MetadataMap::new(), |ctx| async move {
                if !ctx.trace_id().is_empty() {
                    panic!("handler exploded");
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);

        let next = pipeline
            .run(OP, &MetadataMap::new(), |_ctx| async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(*next.get_ref(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_not_swallowed_as_internal() {
        let mut metadata = MetadataMap::new();
        metadata.insert("grpc-timeout", "100m".parse().unwrap());

        let status = pipeline(None)
            .run(OP, &metadata, |_ctx| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_shutdown_cancels_running_call() {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let pipeline = Arc::new(Pipeline::new(None, Arc::clone(&shutdown)));

        let running = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                pipeline
                    .run(OP, &MetadataMap::new(), |_ctx| async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(shutdown.in_flight(), 1);

        let outcome = shutdown.shutdown(Duration::from_secs(1)).await;
        assert_eq!(outcome, ShutdownOutcome::Forced);

        let status = running.await.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Cancelled);

        let rejected = pipeline
            .run(OP, &MetadataMap::new(), |_ctx| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(rejected.code(), tonic::Code::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_call_is_still_logged_and_released() {
        let (events, _guard) = logger::capture::CaptureLayer::install();
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let pipeline = Pipeline::new(None, Arc::clone(&shutdown));

        let metadata = MetadataMap::new();
        let call = pipeline.run(OP, &metadata, |_ctx| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), call).await.is_err());

        let failed = events.with_message("grpc request failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].fields["method"], OP);
        assert_eq!(failed[0].fields["grpc_code"], "Cancelled");
        assert!(events.with_message("grpc request completed").is_empty());
        assert_eq!(shutdown.in_flight(), 0);
    }

    #[tokio::test]
    async fn recovered_panic_logs_one_error_entry() {
        let (events, _guard) = logger::capture::CaptureLayer::install();
        let mut metadata = MetadataMap::new();
        metadata.insert(TRACE_ID_HEADER, "panic-trace".parse().unwrap());

        let status = pipeline(None)
            .run(OP, &metadata, |ctx| async move {
                if !ctx.trace_id().is_empty() {
                    panic!("handler exploded");
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);

        let recovered = events.with_message("panic recovered");
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].level, tracing::Level::ERROR);
        assert_eq!(recovered[0].fields["trace_id"], "panic-trace");
        assert_eq!(recovered[0].fields["panic"], "handler exploded");

        let failed = events.with_message("grpc request failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].fields["grpc_code"], "Internal");
    }

    #[tokio::test]
    async fn rejected_during_shutdown_is_logged_once() {
        let (events, _guard) = logger::capture::CaptureLayer::install();
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let pipeline = Pipeline::new(None, Arc::clone(&shutdown));
        assert_eq!(
            shutdown.shutdown(Duration::from_secs(1)).await,
            ShutdownOutcome::Drained
        );

        let status = pipeline
            .run(OP, &MetadataMap::new(), |_ctx| async { Ok(()) })
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::Unavailable);
        let failed = events.with_message("grpc request failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].fields["grpc_code"], "Unavailable");
    }
}
