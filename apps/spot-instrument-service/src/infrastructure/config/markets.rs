//! Seed markets loaded at startup.

use serde::{Deserialize, Serialize};

use crate::domain::market::{MarketRecord, RoleParseError, RoleSet, UserRole};

/// One market entry in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSeed {
    /// Market ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Enabled flag.
    #[serde(default = "super::default_true")]
    pub enabled: bool,
    /// Role names allowed to see the market. Empty means public.
    #[serde(default)]
    pub allowed_roles: Vec<String>,
}

impl MarketSeed {
    /// Parsed allowed roles.
    ///
    /// # Errors
    ///
    /// Returns the first unknown role name.
    pub fn roles(&self) -> Result<RoleSet, RoleParseError> {
        self.allowed_roles
            .iter()
            .map(|name| name.parse::<UserRole>())
            .collect()
    }
}

impl TryFrom<MarketSeed> for MarketRecord {
    type Error = RoleParseError;

    fn try_from(seed: MarketSeed) -> Result<Self, Self::Error> {
        let roles = seed.roles()?;
        Ok(Self::new(seed.id, seed.name)
            .with_description(seed.description)
            .with_enabled(seed.enabled)
            .with_roles(roles))
    }
}
