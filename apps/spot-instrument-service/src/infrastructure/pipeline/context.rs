//! Per-call context and trace propagation.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tonic::metadata::{MetadataMap, MetadataValue};

/// Metadata key carrying the correlation identifier.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Standard gRPC deadline header.
const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Immutable per-call values threaded through every pipeline stage.
#[derive(Debug, Clone)]
pub struct CallContext {
    operation: String,
    trace_id: String,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Create a context with a fresh trace ID and no deadline.
    #[must_use]
    pub fn new(operation: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            operation: operation.into(),
            trace_id: new_trace_id(),
            cancel,
            deadline: None,
        }
    }

    /// Build the context for an inbound call.
    ///
    /// Uses the caller's `x-trace-id` when present, otherwise generates one.
    /// A `grpc-timeout` header becomes the call deadline.
    #[must_use]
    pub fn from_metadata(
        operation: impl Into<String>,
        metadata: &MetadataMap,
        cancel: CancellationToken,
    ) -> Self {
        let trace_id = metadata
            .get(TRACE_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map_or_else(new_trace_id, str::to_string);

        let deadline = metadata
            .get(GRPC_TIMEOUT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_grpc_timeout)
            .map(|timeout| Instant::now() + timeout);

        Self {
            operation: operation.into(),
            trace_id,
            cancel,
            deadline,
        }
    }

    /// Replace the deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Full method path of the call.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Correlation identifier.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Cancellation signal for this call.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Deadline, if the caller set one.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Write the trace ID into outbound metadata.
    pub fn echo_trace_id(&self, metadata: &mut MetadataMap) {
        match MetadataValue::try_from(self.trace_id.as_str()) {
            Ok(value) => {
                metadata.insert(TRACE_ID_HEADER, value);
            }
            Err(_) => {
                tracing::debug!(trace_id = %self.trace_id, "Trace ID is not a valid header value");
            }
        }
    }
}

fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Parse a `grpc-timeout` value such as `500m` or `3S`.
#[must_use]
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}
