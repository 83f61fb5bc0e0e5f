//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the process wiring around them.

/// Configuration loading.
pub mod config;

/// Component assembly and supervision.
pub mod coordinator;

/// Health check HTTP endpoint.
pub mod health;

/// KIS REST and WebSocket adapters.
pub mod kis;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Credential records and the snapshot CSV.
pub mod persistence;

/// Downstream WebSocket server.
pub mod server;

/// OpenTelemetry tracing integration.
pub mod telemetry;
