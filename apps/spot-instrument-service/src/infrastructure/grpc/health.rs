//! Standard `grpc.health.v1` service served next to the catalog.
//!
//! Reports both the server as a whole (empty service name) and
//! `spot.v1.SpotInstrumentService`, so orchestrators can probe either.

use tonic_health::ServingStatus;
use tonic_health::pb::health_server::{Health, HealthServer};
use tonic_health::server::HealthReporter;

use super::proto::spot::v1::spot_instrument_service_server::SERVICE_NAME;

/// Service name covering the whole server.
const OVERALL: &str = "";

/// Handle flipping the catalog's status in `grpc.health.v1`.
#[derive(Debug, Clone)]
pub struct GrpcHealth {
    reporter: HealthReporter,
}

impl GrpcHealth {
    /// Create the reporter and the service to add to the tonic server.
    ///
    /// The catalog starts out `NOT_SERVING` until [`Self::set_serving`].
    pub async fn new() -> (Self, HealthServer<impl Health>) {
        let (reporter, service) = tonic_health::server::health_reporter();
        let health = Self { reporter };
        health.set(ServingStatus::NotServing).await;
        (health, service)
    }

    /// Mark the catalog ready for traffic.
    pub async fn set_serving(&self) {
        self.set(ServingStatus::Serving).await;
    }

    /// Mark the catalog as going away.
    pub async fn set_not_serving(&self) {
        self.set(ServingStatus::NotServing).await;
    }

    async fn set(&self, status: ServingStatus) {
        // Clones share the same status map.
        #[allow(unused_mut)]
        let mut reporter = self.reporter.clone();
        for service in [OVERALL, SERVICE_NAME] {
            reporter.set_service_status(service, status).await;
        }
        tracing::info!(service = SERVICE_NAME, status = ?status, "gRPC health status updated");
    }
}
