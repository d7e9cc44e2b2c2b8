//! Configuration module for the spot instrument service.
//!
//! Loads a YAML file, interpolates environment variables and validates the
//! result before any component is built.
//!
//! # Usage
//!
//! ```rust,ignore
//! use spot_instrument_service::infrastructure::config::load_config;
//!
//! // Path from SPOT_SERVICE_CONFIG, or configs/config.yaml
//! let config = load_config(None)?;
//!
//! println!("gRPC port: {}", config.server.port);
//! ```

mod circuit_breaker;
mod logging;
mod markets;
mod rate_limit;
mod server;

use std::collections::HashSet;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use circuit_breaker::CircuitBreakerSettings;
pub use logging::{LogFormat, LoggingConfig};
pub use markets::MarketSeed;
pub use rate_limit::RateLimitConfig;
pub use server::{HealthConfig, ServerConfig};

use crate::domain::market::MarketRecord;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "SPOT_SERVICE_CONFIG";

/// Config file used when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "configs/config.yaml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("Failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// gRPC server.
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Inbound rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Health HTTP server.
    #[serde(default)]
    pub health: HealthConfig,
    /// Outbound breaker and retry.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    /// Seed markets.
    #[serde(default)]
    pub markets: Vec<MarketSeed>,
}

impl Config {
    /// Seed markets as domain records.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unknown role name.
    pub fn market_records(&self) -> Result<Vec<MarketRecord>, ConfigError> {
        self.markets
            .iter()
            .cloned()
            .map(|seed| {
                let id = seed.id.clone();
                MarketRecord::try_from(seed).map_err(|e| {
                    ConfigError::ValidationError(format!("markets[{id}].allowed_roles: {e}"))
                })
            })
            .collect()
    }
}

pub(crate) const fn default_true() -> bool {
    true
}

// ============================================
// Configuration Loading
// ============================================

/// Resolve the config path from [`CONFIG_PATH_ENV`].
#[must_use]
pub fn config_path() -> String {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|path| !path.is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

/// Load configuration from a YAML file with environment variable interpolation.
///
/// # Arguments
///
/// * `path` - Optional path to the config file. Defaults to [`config_path`].
///
/// # Errors
///
/// Returns a `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, str::to_string);

    let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
        path: path.clone(),
        source: e,
    })?;

    load_config_from_string(&contents)
}

/// Load configuration from a YAML string (useful for testing).
///
/// # Errors
///
/// Returns a `ConfigError` if the YAML cannot be parsed or validated.
pub fn load_config_from_string(yaml: &str) -> Result<Config, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    let config: Config = serde_yaml_bw::from_str(&interpolated)?;
    validate_config(&config)?;
    Ok(config)
}

/// Interpolate environment variables in a string.
///
/// Supports both `${VAR}` and `${VAR:-default}` syntax. Unset or empty
/// variables without a default become empty.
fn interpolate_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: OnceLock<Option<regex::Regex>> = OnceLock::new();

    let Some(re) = ENV_VAR_REGEX
        .get_or_init(|| regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").ok())
        .as_ref()
    else {
        return input.to_string();
    };

    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let default_value = caps.get(2).map_or("", |m| m.as_str());
        match std::env::var(&caps[1]) {
            Ok(value) if !value.is_empty() => value,
            _ => default_value.to_string(),
        }
    })
    .into_owned()
}

/// Validate configuration values.
fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port must be non-zero".to_string(),
        ));
    }

    if config.health.enabled {
        if config.health.port == 0 {
            return Err(ConfigError::ValidationError(
                "health.port must be non-zero".to_string(),
            ));
        }
        if config.health.port == config.server.port {
            return Err(ConfigError::ValidationError(
                "health.port and server.port must be different".to_string(),
            ));
        }
    }

    let rate_limit = &config.rate_limit;
    validate_rate("rate_limit.requests_per_second", rate_limit.requests_per_second)?;
    for (method, limit) in &rate_limit.methods {
        validate_rate(
            &format!("rate_limit.methods[{method}].requests_per_second"),
            limit.requests_per_second,
        )?;
    }

    let ratio = config.circuit_breaker.failure_ratio;
    if !(ratio > 0.0 && ratio <= 1.0) {
        return Err(ConfigError::ValidationError(
            "circuit_breaker.failure_ratio must be in (0.0, 1.0]".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for market in &config.markets {
        if market.id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "markets: id must not be empty".to_string(),
            ));
        }
        if !seen.insert(market.id.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "markets: duplicate id '{}'",
                market.id
            )));
        }
    }
    config.market_records()?;

    Ok(())
}

fn validate_rate(field: &str, rate: f64) -> Result<(), ConfigError> {
    if rate.is_finite() && rate >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "{field} must be a non-negative finite number"
        )))
    }
}
