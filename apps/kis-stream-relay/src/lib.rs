#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! KIS Stream Relay - Real-time Market Data Relay
//!
//! Keeps one subscription to the Korea Investment & Securities real-time
//! WebSocket feed and relays its frames to many downstream WebSocket
//! consumers. A sampler polls the REST quote endpoint on an interval and
//! appends each snapshot to a CSV log.
//!
//! # Layers (inside to outside)
//!
//! - **Domain**: credentials, topics, ticks, snapshots, topic filters
//! - **Application**: ports plus the credential cache, subscriber registry
//!   and snapshot sampler
//! - **Infrastructure**: KIS adapters, persistence, the downstream server,
//!   health endpoint, configuration and the coordinator that wires them
//!
//! # Data Flow
//!
//! ```text
//!                      approval key
//! CredentialCache ───────────────────┐
//!        │ access token              ▼
//!        ▼                    UpstreamFeedClient ◄── KIS WS
//! SnapshotSampler ◄── KIS REST       │ ticks
//!        │ snapshots                 ▼
//!        └──────────────────► SubscriberRegistry ──► consumer 1..N
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core relay types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::credential::{Credential, CredentialKind, SafetyMargins};
pub use domain::streaming::{FeedPhase, RelayMessage, Snapshot, Topic};
pub use domain::subscription::{ConnectionId, TopicFilter};

// Services
pub use application::services::{
    CredentialCache, RegistryConfig, SnapshotSampler, SubscriberRegistry,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, RelayConfig};

// Coordinator
pub use infrastructure::coordinator::{RelayCoordinator, RelayMode, RelayServices};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::server::{RelayServer, ServerError};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
