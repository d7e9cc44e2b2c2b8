//! Graceful shutdown: drain in-flight calls, then force-cancel stragglers.
//!
//! ```text
//! accepting ──shutdown()──► draining ──all done──────► Drained
//!                               └──grace elapsed──► cancel force token ► Forced
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::{TaskTracker, task_tracker::TaskTrackerToken};
use tonic::Status;

/// Message returned to calls arriving after shutdown began.
pub const SHUTTING_DOWN: &str = "server is shutting down";

/// How a shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight call finished within the grace period.
    Drained,
    /// The grace period expired and remaining calls were cancelled.
    Forced,
}

/// Tracks in-flight calls and coordinates drain versus force-stop.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    accepting: AtomicBool,
    tracker: TaskTracker,
    force: CancellationToken,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by an admitted call for its whole lifetime.
#[derive(Debug)]
pub struct CallPermit {
    _token: TaskTrackerToken,
    cancel: CancellationToken,
}

impl CallPermit {
    /// Token cancelled when shutdown escalates to force-stop.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl ShutdownCoordinator {
    /// Create a coordinator that accepts calls.
    #[must_use]
    pub fn new() -> Self {
        Self {
            accepting: AtomicBool::new(true),
            tracker: TaskTracker::new(),
            force: CancellationToken::new(),
        }
    }

    /// Register a new call.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` once shutdown has begun.
    pub fn admit(&self) -> Result<CallPermit, Status> {
        // Token first: a call that sees `accepting` set is already counted.
        let token = self.tracker.token();
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Status::unavailable(SHUTTING_DOWN));
        }
        Ok(CallPermit {
            _token: token,
            cancel: self.force.child_token(),
        })
    }

    /// Whether new calls are admitted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Calls currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop admitting calls and wait up to `grace` for in-flight ones.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        self.accepting.store(false, Ordering::SeqCst);
        self.tracker.close();

        tracing::info!(
            in_flight = self.tracker.len(),
            grace_secs = grace.as_secs_f64(),
            "Draining in-flight calls"
        );

        tokio::select! {
            () = self.tracker.wait() => {
                tracing::info!("Graceful shutdown completed");
                ShutdownOutcome::Drained
            }
            () = tokio::time::sleep(grace) => {
                tracing::warn!(
                    remaining = self.tracker.len(),
                    "Graceful shutdown timed out, forcing stop"
                );
                self.force.cancel();
                ShutdownOutcome::Forced
            }
        }
    }
}
