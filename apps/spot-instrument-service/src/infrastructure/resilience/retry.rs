//! Retry policy and error classification for outbound gRPC calls.
//!
//! # Classification
//!
//! | Code | Retried | Counts as breaker failure |
//! |------|---------|---------------------------|
//! | `Unavailable` | yes | yes |
//! | `DeadlineExceeded` | yes | yes |
//! | `ResourceExhausted` | yes | yes |
//! | `Aborted` | yes | yes |
//! | `Internal`, `Unknown`, `DataLoss` | no | yes |
//! | everything else | no | no |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tonic::Code;

/// How a failed attempt should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient dependency fault; another attempt may succeed.
    Retryable,
    /// Retrying cannot help.
    NonRetryable,
}

impl ErrorCategory {
    /// Classify a gRPC status code.
    #[must_use]
    pub const fn from_code(code: Code) -> Self {
        match code {
            Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted | Code::Aborted => {
                Self::Retryable
            }
            _ => Self::NonRetryable,
        }
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable)
    }
}

/// Whether `code` reflects a fault on the dependency's side rather than
/// a problem with the caller's input.
#[must_use]
pub const fn is_backend_fault(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Aborted
            | Code::Internal
            | Code::Unknown
            | Code::DataLoss
    )
}

/// Bounded retry with a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts. Zero is treated as one.
    pub attempts: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(attempts: u32, retry_delay: Duration) -> Self {
        Self {
            attempts,
            retry_delay,
        }
    }

    /// Single attempt, no retry. This is the default.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Attempts actually made.
    #[must_use]
    pub const fn effective_attempts(&self) -> u32 {
        if self.attempts == 0 { 1 } else { self.attempts }
    }
}
