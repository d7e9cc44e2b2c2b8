//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the transport, configuration and observability
//! adapters around the application layer.

/// Time source for rate limiting and the circuit breaker.
pub mod clock;

/// YAML configuration loading and validation.
pub mod config;

/// gRPC server, client and generated protocol code.
pub mod grpc;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Inbound middleware: tracing, panic recovery, rate limiting, logging.
pub mod pipeline;

/// Circuit breaker and retry for outbound calls.
pub mod resilience;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;
