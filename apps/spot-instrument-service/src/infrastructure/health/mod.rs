//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks and Prometheus metrics, used by container
//! orchestrators and load balancers.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (serving and accepting calls)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::market::MarketRegistry;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::pipeline::ShutdownCoordinator;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Catalog statistics.
    pub markets: MarketsStatus,
    /// Calls currently being handled.
    pub in_flight: usize,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Serving and accepting calls.
    Serving,
    /// Draining or stopped.
    NotServing,
}

/// Catalog statistics.
#[derive(Debug, Clone, Serialize)]
pub struct MarketsStatus {
    /// Markets in the registry, deleted included.
    pub total: usize,
    /// Enabled, non-deleted markets.
    pub available: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
#[derive(Debug)]
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    serving: AtomicBool,
    registry: Arc<MarketRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl HealthServerState {
    /// Create new health server state. Starts out serving.
    #[must_use]
    pub fn new(
        version: String,
        registry: Arc<MarketRegistry>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            serving: AtomicBool::new(true),
            registry,
            shutdown,
        }
    }

    /// Report the service as serving.
    pub fn set_serving(&self) {
        self.serving.store(true, Ordering::SeqCst);
    }

    /// Report the service as not serving.
    pub fn set_not_serving(&self) {
        self.serving.store(false, Ordering::SeqCst);
    }

    /// Serving and still accepting calls.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.serving.load(Ordering::SeqCst) && self.shutdown.is_accepting()
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Routes served by the health server.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Serving => StatusCode::OK,
        HealthStatus::NotServing => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let status = if state.is_ready() {
        HealthStatus::Serving
    } else {
        HealthStatus::NotServing
    };

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        markets: MarketsStatus {
            total: state.registry.count(),
            available: state.registry.list_available().len(),
        },
        in_flight: state.shutdown.in_flight(),
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind health server to port {0}: {1}")]
    BindFailed(u16, String),
    /// Server encountered a fatal error.
    #[error("health server failed: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::domain::market::MarketRecord;

    fn state() -> Arc<HealthServerState> {
        let registry = Arc::new(MarketRegistry::from_records([
            MarketRecord::new("BTC-USDT", "Bitcoin"),
            MarketRecord::new("OFF-USDT", "Paused").with_enabled(false),
        ]));
        Arc::new(HealthServerState::new(
            "test".to_string(),
            registry,
            Arc::new(ShutdownCoordinator::new()),
        ))
    }

    async fn get_status(state: &Arc<HealthServerState>, path: &str) -> StatusCode {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        router(Arc::clone(state))
            .oneshot(request)
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let state = state();
        state.set_not_serving();
        assert_eq!(get_status(&state, "/healthz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_follows_serving_flag() {
        let state = state();
        assert_eq!(get_status(&state, "/readyz").await, StatusCode::OK);

        state.set_not_serving();
        assert_eq!(
            get_status(&state, "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.set_serving();
        assert_eq!(get_status(&state, "/readyz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn not_ready_once_shutdown_begins() {
        let state = state();
        let _ = state.shutdown.shutdown(Duration::ZERO).await;
        assert_eq!(
            get_status(&state, "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn health_response_counts_markets() {
        let response = build_health_response(&state());
        assert_eq!(response.status, HealthStatus::Serving);
        assert_eq!(response.markets.total, 2);
        assert_eq!(response.markets.available, 1);
        assert_eq!(response.in_flight, 0);
    }

    #[test]
    fn health_status_serializes_snake_case() {
        let json = serde_json::to_string(&HealthStatus::NotServing).unwrap();
        assert_eq!(json, "\"not_serving\"");
    }
}
