//! Spot Instrument Service Binary
//!
//! Starts the market catalog gRPC server, the `grpc.health.v1` service on
//! the same port, and the HTTP health endpoint.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin spot-instrument-service
//! ```
//!
//! # Environment Variables
//!
//! - `SPOT_SERVICE_CONFIG`: Config file path (default: configs/config.yaml)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: spot-instrument-service)
//! - `RUST_LOG`: Log filter, overrides `logging.level`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use spot_instrument_service::infrastructure::clock::SystemClock;
use spot_instrument_service::infrastructure::config::{self, Config};
use spot_instrument_service::infrastructure::metrics::set_markets_available;
use spot_instrument_service::infrastructure::telemetry::{self, TelemetryConfig};
use spot_instrument_service::proto::spot_instrument_service_server::SpotInstrumentServiceServer;
use spot_instrument_service::{
    GrpcHealth, HealthServer, HealthServerState, MarketCatalog, MarketRegistry, Pipeline,
    ShutdownCoordinator, ShutdownOutcome, SpotInstrumentServer, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

/// Time allowed for the transport to close after calls have drained.
const TRANSPORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let config_path = config::config_path();
    let config = config::load_config(Some(&config_path))
        .with_context(|| format!("loading configuration from {config_path}"))?;

    // Initialize telemetry (tracing + optional OpenTelemetry)
    let _telemetry_guard =
        telemetry::init_with_config(TelemetryConfig::from_env().with_logging(&config.logging));

    tracing::info!("Starting Spot Instrument Service");

    // Initialize Prometheus metrics
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Metrics recorder not installed");
    }

    log_config(&config, &config_path);

    let registry = Arc::new(MarketRegistry::from_records(config.market_records()?));
    set_markets_available(registry.list_available().len());
    tracing::info!(
        markets = registry.count(),
        available = registry.list_available().len(),
        "Market registry seeded"
    );

    let clock = SystemClock::shared();
    let coordinator = Arc::new(ShutdownCoordinator::new());
    let pipeline = Arc::new(Pipeline::new(
        config.rate_limit.build(clock),
        Arc::clone(&coordinator),
    ));
    let catalog = MarketCatalog::new(registry.clone());
    let grpc_server = SpotInstrumentServer::new(catalog, pipeline);

    let transport_token = CancellationToken::new();

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&registry),
        Arc::clone(&coordinator),
    ));
    if config.health.enabled {
        let health_server = HealthServer::new(
            config.health.port,
            Arc::clone(&health_state),
            transport_token.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    // Spawn gRPC server
    let grpc_addr = config
        .server
        .socket_addr()
        .with_context(|| format!("invalid server.host '{}'", config.server.host))?;
    let (grpc_health, grpc_health_service) = GrpcHealth::new().await;
    let grpc_shutdown = transport_token.clone();
    let mut grpc_handle = tokio::spawn(async move {
        tracing::info!(addr = %grpc_addr, "gRPC server listening");
        if let Err(e) = Server::builder()
            .add_service(grpc_health_service)
            .add_service(SpotInstrumentServiceServer::new(grpc_server))
            .serve_with_shutdown(grpc_addr, grpc_shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "gRPC server error");
        }
        tracing::info!("gRPC server stopped");
    });

    grpc_health.set_serving().await;
    tracing::info!("Spot instrument service ready");

    await_shutdown().await;

    health_state.set_not_serving();
    grpc_health.set_not_serving().await;

    let grace = Duration::from_secs(config.server.shutdown_timeout_secs);
    tracing::info!(timeout_secs = grace.as_secs(), "Graceful shutdown started");
    match coordinator.shutdown(grace).await {
        ShutdownOutcome::Drained => tracing::info!("All in-flight calls completed"),
        ShutdownOutcome::Forced => tracing::warn!("In-flight calls cancelled after grace period"),
    }

    transport_token.cancel();
    if tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, &mut grpc_handle)
        .await
        .is_err()
    {
        tracing::warn!("gRPC transport did not close in time, aborting");
        grpc_handle.abort();
    }

    tracing::info!("Spot instrument service stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &Config, path: &str) {
    tracing::info!(
        path,
        host = %config.server.host,
        grpc_port = config.server.port,
        health_port = config.health.port,
        health_enabled = config.health.enabled,
        rate_limit_enabled = config.rate_limit.enabled,
        "Configuration loaded"
    );
    tracing::debug!(
        requests_per_second = config.rate_limit.requests_per_second,
        burst = config.rate_limit.burst,
        method_overrides = config.rate_limit.methods.len(),
        "Rate limits"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
