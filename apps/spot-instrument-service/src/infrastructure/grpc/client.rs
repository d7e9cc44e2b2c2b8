//! Breaker-protected client for `SpotInstrumentService`.
//!
//! Every call is admitted by a circuit breaker and retried with a fixed
//! delay on transient failures. All attempts of one logical call share a
//! single trace ID.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, Endpoint};

use super::proto::spot::v1::{
    UserRole as WireRole, ViewMarketsRequest,
    spot_instrument_service_client::SpotInstrumentServiceClient,
};
use crate::application::services::MarketSummary;
use crate::domain::market::UserRole;
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::config::CircuitBreakerSettings;
use crate::infrastructure::pipeline::TRACE_ID_HEADER;
use crate::infrastructure::resilience::{
    CircuitBreaker, CircuitBreakerConfig, ResilienceError, ResilientExecutor, RetryPolicy,
};

/// Breaker name used in logs and metrics.
const BREAKER_NAME: &str = "spot-instrument-service";

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, e.g. `http://127.0.0.1:50051`.
    pub address: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Breaker settings.
    pub breaker: CircuitBreakerConfig,
    /// Retry settings. Three attempts 100 ms apart by default.
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:50051".to_string(),
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::new(3, Duration::from_millis(100)),
        }
    }
}

impl ClientConfig {
    /// Default settings for `address`.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Apply the breaker and retry section of the service config.
    #[must_use]
    pub fn with_resilience(mut self, settings: &CircuitBreakerSettings) -> Self {
        self.breaker = settings.breaker();
        self.retry = settings.retry();
        self
    }
}

/// Errors creating a client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The address is not a valid URI.
    #[error("invalid server address {address}: {source}")]
    InvalidAddress {
        /// Address as configured.
        address: String,
        /// Parse failure.
        #[source]
        source: tonic::transport::Error,
    },
    /// The connection could not be established.
    #[error("failed to connect: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Client for the market catalog.
#[derive(Debug, Clone)]
pub struct SpotClient {
    inner: SpotInstrumentServiceClient<Channel>,
    executor: Arc<ResilientExecutor>,
}

impl SpotClient {
    /// Connect eagerly.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or the server is
    /// unreachable.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let channel = endpoint(&config)?.connect().await?;
        Ok(Self::from_channel(channel, &config))
    }

    /// Create a client that connects on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid.
    pub fn connect_lazy(config: ClientConfig) -> Result<Self, ClientError> {
        let channel = endpoint(&config)?.connect_lazy();
        Ok(Self::from_channel(channel, &config))
    }

    /// Wrap an existing channel.
    #[must_use]
    pub fn from_channel(channel: Channel, config: &ClientConfig) -> Self {
        Self {
            inner: SpotInstrumentServiceClient::new(channel),
            executor: Arc::new(ResilientExecutor::new(
                BREAKER_NAME,
                config.breaker.clone(),
                config.retry,
                SystemClock::shared(),
            )),
        }
    }

    /// Breaker guarding this client.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        self.executor.breaker()
    }

    /// List the markets visible to `roles`.
    ///
    /// `trace_id` is sent as `x-trace-id` on every attempt; one is generated
    /// when absent or not valid metadata.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError`] when the breaker rejects the call, the
    /// caller cancels, or the server keeps failing.
    pub async fn view_markets(
        &self,
        roles: &[UserRole],
        trace_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<MarketSummary>, ResilienceError> {
        let trace = trace_value(trace_id);
        let message = ViewMarketsRequest {
            user_roles: roles.iter().map(|&role| WireRole::from(role) as i32).collect(),
        };

        let response = self
            .executor
            .execute(cancel, || {
                let mut client = self.inner.clone();
                let mut request = Request::new(message.clone());
                request
                    .metadata_mut()
                    .insert(TRACE_ID_HEADER, trace.clone());
                async move { client.view_markets(request).await }
            })
            .await?;

        Ok(response
            .into_inner()
            .markets
            .into_iter()
            .map(MarketSummary::from)
            .collect())
    }
}

fn endpoint(config: &ClientConfig) -> Result<Endpoint, ClientError> {
    Endpoint::from_shared(config.address.clone())
        .map(|endpoint| {
            endpoint
                .timeout(config.timeout)
                .connect_timeout(config.connect_timeout)
        })
        .map_err(|source| ClientError::InvalidAddress {
            address: config.address.clone(),
            source,
        })
}

fn trace_value(trace_id: Option<&str>) -> AsciiMetadataValue {
    if let Some(value) = trace_id.and_then(|id| AsciiMetadataValue::try_from(id).ok()) {
        return value;
    }
    if let Some(id) = trace_id {
        tracing::warn!(trace_id = id, "Trace ID is not valid metadata, generating a new one");
    }
    let generated = uuid::Uuid::new_v4().to_string();
    // A hyphenated UUID is always valid ASCII metadata.
    AsciiMetadataValue::try_from(generated.as_str())
        .unwrap_or_else(|_| AsciiMetadataValue::from_static("unknown"))
}
