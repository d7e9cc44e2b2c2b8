//! Application Services
//!
//! - `MarketCatalog`: answers `ViewMarkets` from a [`MarketSource`]

use std::sync::Arc;

use serde::Serialize;

use crate::application::ports::MarketSource;
use crate::domain::market::{MarketRecord, RoleSet, is_accessible};

/// Market as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarketSummary {
    /// Market ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Enabled flag.
    pub enabled: bool,
}

impl From<MarketRecord> for MarketSummary {
    fn from(record: MarketRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            description: record.description,
            enabled: record.enabled,
        }
    }
}

/// Role-filtered view over available markets.
#[derive(Clone)]
pub struct MarketCatalog {
    source: Arc<dyn MarketSource>,
}

impl std::fmt::Debug for MarketCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketCatalog").finish_non_exhaustive()
    }
}

impl MarketCatalog {
    /// Create a catalog reading from `source`.
    #[must_use]
    pub fn new(source: Arc<dyn MarketSource>) -> Self {
        Self { source }
    }

    /// Available markets the caller may see, ordered by ID.
    #[must_use]
    pub fn view_markets(&self, roles: &RoleSet) -> Vec<MarketSummary> {
        let mut markets: Vec<MarketSummary> = self
            .source
            .available_markets()
            .into_iter()
            .filter(|record| is_accessible(record, roles))
            .map(MarketSummary::from)
            .collect();
        markets.sort_by(|a, b| a.id.cmp(&b.id));
        markets
    }
}
