#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_truncation
    )
)]

//! Spot Instrument Service - Role-Filtered Market Catalog
//!
//! A gRPC service that lists the spot markets a caller may see, given the
//! roles an upstream gateway has already authenticated. Every call runs
//! behind a request pipeline, and the bundled client protects callers with
//! a circuit breaker and bounded retry.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Market records, roles and the access policy
//!   - `market`: `MarketRecord`, `UserRole`, `MarketRegistry`
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: `MarketSource`
//!   - `services`: `MarketCatalog`
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `grpc`: `SpotInstrumentService` server and client
//!   - `pipeline`: trace propagation, panic guard, rate limiting, logging
//!   - `resilience`: circuit breaker and retry
//!   - `config`: YAML configuration
//!   - `health`: health check HTTP endpoint
//!
//! # Request Flow
//!
//! ```text
//! caller ──► trace ──► shutdown gate ──► panic guard ──► rate limiter ──► ViewMarkets
//!                                                                            │
//!            response + x-trace-id ◄── request logger ◄── MarketCatalog ◄────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market types with no transport dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{
    MarketRecord, MarketRegistry, RegistryError, RoleParseError, RoleSet, UserRole,
    is_accessible,
};

// Application services
pub use application::ports::MarketSource;
pub use application::services::{MarketCatalog, MarketSummary};

// Infrastructure config
pub use infrastructure::config::{Config, ConfigError, load_config, load_config_from_string};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// gRPC server and client (for integration tests)
pub use infrastructure::grpc::{
    ClientConfig, ClientError, GrpcHealth, SpotClient, SpotInstrumentServer, VIEW_MARKETS_PATH,
    proto::spot::v1 as proto,
};

// Pipeline
pub use infrastructure::pipeline::{
    CallContext, MethodRateLimiter, Pipeline, RateLimit, ShutdownCoordinator, ShutdownOutcome,
    TRACE_ID_HEADER,
};

// Resilience
pub use infrastructure::resilience::{
    BreakerError, BreakerState, CircuitBreaker, CircuitBreakerConfig, ResilienceError,
    ResilientExecutor, RetryPolicy,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
