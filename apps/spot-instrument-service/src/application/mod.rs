//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the catalog use case and the port it reads
//! markets through.

/// Port interfaces for market sources.
pub mod ports;

/// Application services for the market catalog.
pub mod services;
