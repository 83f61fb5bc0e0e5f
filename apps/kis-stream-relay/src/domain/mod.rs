//! Domain Layer - Core relay types and business rules.
//!
//! This layer contains the credential, streaming and subscription types
//! shared by every other layer. Nothing here performs I/O.

/// Brokerage credentials and their validity rules.
pub mod credential;

/// Topics, ticks, snapshots and the downstream envelope.
pub mod streaming;

/// Per-connection topic filters.
pub mod subscription;
