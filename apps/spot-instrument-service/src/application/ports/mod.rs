//! Port Interfaces
//!
//! ## Driven Ports (Outbound)
//!
//! - `MarketSource`: where the catalog reads available markets from

use crate::domain::market::{MarketRecord, MarketRegistry};

/// Source of currently available markets.
#[cfg_attr(test, mockall::automock)]
pub trait MarketSource: Send + Sync {
    /// Snapshot of enabled, non-deleted markets.
    fn available_markets(&self) -> Vec<MarketRecord>;
}

impl MarketSource for MarketRegistry {
    fn available_markets(&self) -> Vec<MarketRecord> {
        self.list_available()
    }
}
