//! Completion logging for inbound calls.
//!
//! [`CompletionLog`] is armed before any other stage runs, so a call whose
//! future is dropped mid-flight (client reset, transport shutdown) still
//! gets exactly one entry.

use std::time::{Duration, Instant};

use tonic::{Code, Status};

use super::context::CallContext;
use crate::infrastructure::metrics;

/// Message logged for calls dropped before producing an outcome.
pub const DROPPED_BEFORE_COMPLETION: &str = "request dropped before completion";

/// Log one entry for a finished call and record request metrics.
///
/// Never alters the outcome.
pub fn log_completion<T>(ctx: &CallContext, elapsed: Duration, outcome: &Result<T, Status>) {
    #[allow(clippy::cast_possible_truncation)]
    let duration_ms = elapsed.as_millis() as u64;

    match outcome {
        Ok(_) => {
            tracing::info!(
                method = ctx.operation(),
                duration_ms,
                trace_id = ctx.trace_id(),
                "grpc request completed"
            );
            metrics::record_request(ctx.operation(), Code::Ok, elapsed);
        }
        Err(status) => {
            tracing::error!(
                method = ctx.operation(),
                duration_ms,
                trace_id = ctx.trace_id(),
                grpc_code = ?status.code(),
                error = status.message(),
                "grpc request failed"
            );
            metrics::record_request(ctx.operation(), status.code(), elapsed);
        }
    }
}

/// Guard that writes the completion entry exactly once.
#[derive(Debug)]
#[must_use = "dropping the guard logs the call as cancelled"]
pub struct CompletionLog {
    ctx: CallContext,
    started: Instant,
    finished: bool,
}

impl CompletionLog {
    /// Arm the guard for a call that began at `started`.
    pub const fn start(ctx: CallContext, started: Instant) -> Self {
        Self {
            ctx,
            started,
            finished: false,
        }
    }

    /// Log the call's real outcome.
    pub fn finish<T>(mut self, outcome: &Result<T, Status>) {
        self.finished = true;
        log_completion(&self.ctx, self.started.elapsed(), outcome);
    }
}

impl Drop for CompletionLog {
    fn drop(&mut self) {
        if !self.finished {
            let outcome: Result<(), Status> = Err(Status::cancelled(DROPPED_BEFORE_COMPLETION));
            log_completion(&self.ctx, self.started.elapsed(), &outcome);
        }
    }
}


#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;
    use tracing::Level;

    use super::capture::CaptureLayer;
    use super::*;

    fn ctx() -> CallContext {
        CallContext::new("/svc/Op", CancellationToken::new())
    }

    #[test]
    fn success_is_logged_at_info() {
        let (events, _guard) = CaptureLayer::install();
        let ctx = ctx();

        log_completion(&ctx, Duration::from_millis(12), &Ok::<_, Status>(()));

        let completed = events.with_message("grpc request completed");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].level, Level::INFO);
        assert_eq!(completed[0].fields["method"], "/svc/Op");
        assert_eq!(completed[0].fields["trace_id"], ctx.trace_id());
        assert_eq!(completed[0].fields["duration_ms"], "12");
        assert!(events.with_message("grpc request failed").is_empty());
    }

    #[test]
    fn failure_is_logged_at_error_with_code() {
        let (events, _guard) = CaptureLayer::install();

        let outcome: Result<(), Status> = Err(Status::not_found("no such market"));
        log_completion(&ctx(), Duration::ZERO, &outcome);

        let failed = events.with_message("grpc request failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].level, Level::ERROR);
        assert_eq!(failed[0].fields["grpc_code"], "NotFound");
        assert_eq!(failed[0].fields["error"], "no such market");
    }

    #[test]
    fn finished_guard_logs_once() {
        let (events, _guard) = CaptureLayer::install();

        CompletionLog::start(ctx(), Instant::now()).finish(&Ok::<_, Status>(()));

        assert_eq!(events.with_message("grpc request completed").len(), 1);
        assert!(events.with_message("grpc request failed").is_empty());
    }

    #[test]
    fn dropped_guard_logs_cancellation() {
        let (events, _guard) = CaptureLayer::install();

        drop(CompletionLog::start(ctx(), Instant::now()));

        let failed = events.with_message("grpc request failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].fields["grpc_code"], "Cancelled");
        assert_eq!(failed[0].fields["error"], DROPPED_BEFORE_COMPLETION);
    }
}
