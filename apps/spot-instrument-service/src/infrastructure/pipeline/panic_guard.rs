//! Last-resort boundary that turns a handler panic into `Internal`.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tonic::Status;

use super::context::CallContext;
use crate::infrastructure::metrics;

/// Message returned to callers when a handler panics.
pub const INTERNAL_SERVER_ERROR: &str = "internal server error";

/// Run `stage`, converting a panic into an internal error.
///
/// # Errors
///
/// Returns the stage's own error, or `Internal` if it panicked.
pub async fn guard<T, F>(ctx: &CallContext, stage: F) -> Result<T, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    match AssertUnwindSafe(stage).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let panic = panic_message(payload.as_ref());
            tracing::error!(
                method = ctx.operation(),
                trace_id = ctx.trace_id(),
                panic = %panic,
                "panic recovered"
            );
            metrics::record_panic_recovered(ctx.operation());
            Err(Status::internal(INTERNAL_SERVER_ERROR))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn ctx() -> CallContext {
        CallContext::new("/svc/Op", CancellationToken::new())
    }

    #[tokio::test]
    async fn passes_through_success_and_errors() {
        let ok: Result<u32, Status> = guard(&ctx(), async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u32, Status> =
            guard(&ctx(), async { Err(Status::not_found("nope")) }).await;
        assert_eq!(err.unwrap_err().code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn panic_becomes_internal() {
        let markets: Vec<u32> = Vec::new();
        let result: Result<u32, Status> = guard(&ctx(), async {
            if markets.is_empty() {
                panic!("boom");
            }
            Ok(markets[0])
        })
        .await;

        let status = result.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let text: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(text.as_ref()), "static");

        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");

        let other: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
