//! gRPC Server Implementation
//!
//! Implements `SpotInstrumentService` on top of the market catalog.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use super::proto::spot::v1::{
    Market, ViewMarketsRequest, ViewMarketsResponse,
    spot_instrument_service_server::SpotInstrumentService,
};
use super::{VIEW_MARKETS_PATH, decode_role};
use crate::application::services::MarketCatalog;
use crate::domain::market::RoleSet;
use crate::infrastructure::pipeline::Pipeline;

/// gRPC front end for the market catalog.
#[derive(Debug, Clone)]
pub struct SpotInstrumentServer {
    catalog: MarketCatalog,
    pipeline: Arc<Pipeline>,
}

impl SpotInstrumentServer {
    /// Create a server answering from `catalog`, with every call run through
    /// `pipeline`.
    #[must_use]
    pub const fn new(catalog: MarketCatalog, pipeline: Arc<Pipeline>) -> Self {
        Self { catalog, pipeline }
    }
}

/// Decode the caller's wire roles.
///
/// Unspecified entries are ignored and duplicates collapse.
fn decode_roles(values: &[i32]) -> Result<RoleSet, Status> {
    let mut roles = RoleSet::with_capacity(values.len());
    for &value in values {
        match decode_role(value) {
            Ok(Some(role)) => {
                roles.insert(role);
            }
            Ok(None) => {}
            Err(unknown) => {
                return Err(Status::invalid_argument(format!(
                    "unknown user role value: {unknown}"
                )));
            }
        }
    }
    Ok(roles)
}

#[tonic::async_trait]
impl SpotInstrumentService for SpotInstrumentServer {
    async fn view_markets(
        &self,
        request: Request<ViewMarketsRequest>,
    ) -> Result<Response<ViewMarketsResponse>, Status> {
        let (metadata, _extensions, message) = request.into_parts();
        let catalog = self.catalog.clone();

        self.pipeline
            .run(VIEW_MARKETS_PATH, &metadata, |ctx| async move {
                let roles = decode_roles(&message.user_roles)?;
                let markets: Vec<Market> = catalog
                    .view_markets(&roles)
                    .into_iter()
                    .map(Market::from)
                    .collect();

                tracing::debug!(
                    trace_id = %ctx.trace_id(),
                    roles = roles.len(),
                    markets = markets.len(),
                    "Resolved visible markets"
                );

                Ok(ViewMarketsResponse { markets })
            })
            .await
    }
}
