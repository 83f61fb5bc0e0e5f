//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (issuer, transport, sinks, ...).
pub mod ports;

/// Credential caching, downstream fan-out and snapshot sampling.
pub mod services;
