//! Domain Layer - Market catalog types and business rules.
//!
//! This layer holds the market records, caller roles, access policy and
//! the in-memory registry. Nothing here knows about gRPC or configuration
//! files.

/// Market records, roles, access policy and the concurrent registry.
pub mod market;
