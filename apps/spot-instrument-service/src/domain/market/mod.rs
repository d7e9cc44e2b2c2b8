//! Market Types and Access Policy
//!
//! A market is visible to a caller when it is *available* (enabled and not
//! soft-deleted) and *accessible* (public, or sharing at least one role
//! with the caller).
//!
//! # Access Rules
//!
//! | Allowed roles | Caller roles | Accessible |
//! |---------------|--------------|------------|
//! | empty         | any          | yes        |
//! | non-empty     | empty        | no         |
//! | non-empty     | overlapping  | yes        |
//! | non-empty     | disjoint     | no         |

mod registry;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use registry::{MarketRegistry, RegistryError};

// =============================================================================
// Roles
// =============================================================================

/// Caller role, already authenticated upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum UserRole {
    /// Regular account.
    Common,
    /// Account that passed verification.
    Verified,
    /// Paid tier.
    Premium,
    /// Operator access.
    Admin,
}

impl UserRole {
    /// Canonical role name as used in configuration files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Common => "USER_ROLE_COMMON",
            Self::Verified => "USER_ROLE_VERIFIED",
            Self::Premium => "USER_ROLE_PREMIUM",
            Self::Admin => "USER_ROLE_ADMIN",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown role name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown user role: {0}")]
pub struct RoleParseError(pub String);

impl FromStr for UserRole {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER_ROLE_COMMON" => Ok(Self::Common),
            "USER_ROLE_VERIFIED" => Ok(Self::Verified),
            "USER_ROLE_PREMIUM" => Ok(Self::Premium),
            "USER_ROLE_ADMIN" => Ok(Self::Admin),
            other => Err(RoleParseError(other.to_string())),
        }
    }
}

impl TryFrom<String> for UserRole {
    type Error = RoleParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UserRole> for String {
    fn from(role: UserRole) -> Self {
        role.as_str().to_string()
    }
}

/// Set of roles held by a caller or required by a market.
pub type RoleSet = HashSet<UserRole>;

// =============================================================================
// Market Record
// =============================================================================

/// A tradable instrument in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketRecord {
    /// Unique, immutable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Whether trading is switched on.
    pub enabled: bool,
    /// Soft-delete stamp. Set only by the registry.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Roles allowed to see this market. Empty means public.
    pub allowed_roles: RoleSet,
}

impl MarketRecord {
    /// Create an enabled, public market.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            enabled: true,
            deleted_at: None,
            allowed_roles: RoleSet::new(),
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the enabled flag.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Restrict the market to the given roles.
    #[must_use]
    pub fn with_roles(mut self, roles: impl IntoIterator<Item = UserRole>) -> Self {
        self.allowed_roles = roles.into_iter().collect();
        self
    }

    /// Mark as soft-deleted at the given time.
    #[must_use]
    pub const fn with_deleted_at(mut self, at: DateTime<Utc>) -> Self {
        self.deleted_at = Some(at);
        self
    }

    /// Enabled and not soft-deleted.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.enabled && self.deleted_at.is_none()
    }

    /// Whether a caller holding `roles` may see this market.
    #[must_use]
    pub fn is_accessible(&self, roles: &RoleSet) -> bool {
        is_accessible(self, roles)
    }
}

/// Access filter: public markets are open to everyone, restricted markets
/// need at least one shared role.
#[must_use]
pub fn is_accessible(record: &MarketRecord, roles: &RoleSet) -> bool {
    record.allowed_roles.is_empty() || !record.allowed_roles.is_disjoint(roles)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    fn roles(list: &[UserRole]) -> RoleSet {
        list.iter().copied().collect()
    }

    #[test_case("USER_ROLE_COMMON", UserRole::Common)]
    #[test_case("USER_ROLE_VERIFIED", UserRole::Verified)]
    #[test_case("USER_ROLE_PREMIUM", UserRole::Premium)]
    #[test_case("USER_ROLE_ADMIN", UserRole::Admin)]
    fn role_names_parse(name: &str, expected: UserRole) {
        assert_eq!(name.parse::<UserRole>().unwrap(), expected);
        assert_eq!(expected.as_str(), name);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let err = "USER_ROLE_ROOT".parse::<UserRole>().unwrap_err();
        assert_eq!(err, RoleParseError("USER_ROLE_ROOT".to_string()));
    }

    #[test]
    fn role_deserializes_from_name() {
        let role: UserRole = serde_json::from_str("\"USER_ROLE_PREMIUM\"").unwrap();
        assert_eq!(role, UserRole::Premium);
        assert!(serde_json::from_str::<UserRole>("\"premium\"").is_err());
    }

    #[test]
    fn availability_requires_enabled_and_not_deleted() {
        let active = MarketRecord::new("btc-usdt", "BTC/USDT");
        assert!(active.is_available());

        let disabled = active.clone().with_enabled(false);
        assert!(!disabled.is_available());

        let deleted = active.with_deleted_at(Utc::now());
        assert!(!deleted.is_available());
    }

    #[test]
    fn restricted_market_needs_shared_role() {
        let market = MarketRecord::new("premium", "Premium").with_roles([UserRole::Premium]);

        assert!(!market.is_accessible(&roles(&[])));
        assert!(!market.is_accessible(&roles(&[UserRole::Common])));
        assert!(market.is_accessible(&roles(&[UserRole::Common, UserRole::Premium])));
    }

    fn any_role() -> impl Strategy<Value = UserRole> {
        prop_oneof![
            Just(UserRole::Common),
            Just(UserRole::Verified),
            Just(UserRole::Premium),
            Just(UserRole::Admin),
        ]
    }

    proptest! {
        #[test]
        fn public_market_is_accessible_to_everyone(caller in prop::collection::hash_set(any_role(), 0..4)) {
            let market = MarketRecord::new("public", "Public");
            prop_assert!(is_accessible(&market, &caller));
        }

        #[test]
        fn restricted_market_is_hidden_from_anonymous(allowed in prop::collection::hash_set(any_role(), 1..4)) {
            let market = MarketRecord::new("restricted", "Restricted").with_roles(allowed);
            prop_assert!(!is_accessible(&market, &RoleSet::new()));
        }

        #[test]
        fn access_matches_intersection(
            allowed in prop::collection::hash_set(any_role(), 1..4),
            caller in prop::collection::hash_set(any_role(), 0..4),
        ) {
            let shares_role = allowed.iter().any(|role| caller.contains(role));
            let market = MarketRecord::new("m", "M").with_roles(allowed);
            prop_assert_eq!(is_accessible(&market, &caller), shares_role);
        }
    }
}
