//! gRPC Transport
//!
//! Exposes the market catalog as `spot.v1.SpotInstrumentService` and ships
//! the matching client.
//!
//! # Architecture
//!
//! Each inbound call:
//!
//! 1. Enters the shared [`Pipeline`](crate::infrastructure::pipeline::Pipeline)
//! 2. Decodes wire roles into domain roles
//! 3. Asks the [`MarketCatalog`](crate::application::services::MarketCatalog)
//!    for the visible markets
//! 4. Encodes the result back into protobuf messages
//!
//! Outbound calls go through [`SpotClient`], which wraps every request in a
//! circuit breaker with bounded retry.
//!
//! [`GrpcHealth`] publishes the standard `grpc.health.v1` status on the
//! same port.

pub mod client;
pub mod health;
pub mod server;

// Allow clippy warnings and missing docs in generated code
#[allow(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]
pub mod proto {
    pub mod spot {
        pub mod v1 {
            include!("proto/spot.v1.rs");
        }
    }
}

use proto::spot::v1 as pb;

use crate::application::services::MarketSummary;
use crate::domain::market::UserRole;

/// Full method path of `ViewMarkets`.
pub const VIEW_MARKETS_PATH: &str = "/spot.v1.SpotInstrumentService/ViewMarkets";

pub use client::{ClientConfig, ClientError, SpotClient};
pub use health::GrpcHealth;
pub use server::SpotInstrumentServer;

// =============================================================================
// Wire Conversions
// =============================================================================

impl From<UserRole> for pb::UserRole {
    fn from(role: UserRole) -> Self {
        match role {
            UserRole::Common => Self::Common,
            UserRole::Verified => Self::Verified,
            UserRole::Premium => Self::Premium,
            UserRole::Admin => Self::Admin,
        }
    }
}

impl From<MarketSummary> for pb::Market {
    fn from(market: MarketSummary) -> Self {
        Self {
            id: market.id,
            name: market.name,
            description: market.description,
            enabled: market.enabled,
        }
    }
}

impl From<pb::Market> for MarketSummary {
    fn from(market: pb::Market) -> Self {
        Self {
            id: market.id,
            name: market.name,
            description: market.description,
            enabled: market.enabled,
        }
    }
}

/// Map a wire role to a domain role.
///
/// `Ok(None)` for `USER_ROLE_UNSPECIFIED`, which carries no access.
///
/// # Errors
///
/// Returns the raw value when it names no known role.
pub fn decode_role(value: i32) -> Result<Option<UserRole>, i32> {
    match pb::UserRole::try_from(value) {
        Ok(pb::UserRole::Unspecified) => Ok(None),
        Ok(pb::UserRole::Common) => Ok(Some(UserRole::Common)),
        Ok(pb::UserRole::Verified) => Ok(Some(UserRole::Verified)),
        Ok(pb::UserRole::Premium) => Ok(Some(UserRole::Premium)),
        Ok(pb::UserRole::Admin) => Ok(Some(UserRole::Admin)),
        Err(_) => Err(value),
    }
}
