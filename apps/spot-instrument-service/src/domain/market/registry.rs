//! Concurrent Market Registry
//!
//! Owns every [`MarketRecord`] behind a single reader/writer lock. Read
//! paths hand out clones so callers never observe a record mid-update.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::MarketRecord;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No market with this ID.
    #[error("market not found: {0}")]
    NotFound(String),
}

/// Thread-safe store of markets keyed by ID.
#[derive(Debug, Default)]
pub struct MarketRegistry {
    markets: RwLock<HashMap<String, MarketRecord>>,
}

impl MarketRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry seeded with `records`. Later duplicates win.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = MarketRecord>) -> Self {
        let markets = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Self {
            markets: RwLock::new(markets),
        }
    }

    /// Look up a market by ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<MarketRecord> {
        self.markets.read().get(id).cloned()
    }

    /// Snapshot of every record, including unavailable ones.
    #[must_use]
    pub fn list_all(&self) -> Vec<MarketRecord> {
        self.markets.read().values().cloned().collect()
    }

    /// Snapshot of enabled, non-deleted records.
    #[must_use]
    pub fn list_available(&self) -> Vec<MarketRecord> {
        self.markets
            .read()
            .values()
            .filter(|record| record.is_available())
            .cloned()
            .collect()
    }

    /// Insert or replace a record. Returns the previous record, if any.
    pub fn upsert(&self, record: MarketRecord) -> Option<MarketRecord> {
        let previous = self.markets.write().insert(record.id.clone(), record);
        if let Some(ref old) = previous {
            tracing::debug!(market_id = %old.id, "Market replaced");
        }
        previous
    }

    /// Soft-delete a market, stamping the current time.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if no market has this ID.
    pub fn soft_delete(&self, id: &str) -> Result<(), RegistryError> {
        self.soft_delete_at(id, Utc::now())
    }

    /// Soft-delete a market with an explicit timestamp.
    ///
    /// A market that is already deleted keeps its original stamp.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if no market has this ID.
    pub fn soft_delete_at(&self, id: &str, at: DateTime<Utc>) -> Result<(), RegistryError> {
        let mut markets = self.markets.write();
        let record = markets
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if record.deleted_at.is_none() {
            record.deleted_at = Some(at);
        }
        drop(markets);

        tracing::info!(market_id = %id, "Market soft-deleted");
        Ok(())
    }

    /// Number of records, deleted ones included.
    #[must_use]
    pub fn count(&self) -> usize {
        self.markets.read().len()
    }
}
