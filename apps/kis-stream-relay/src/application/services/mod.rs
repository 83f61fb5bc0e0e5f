//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `CredentialCache`: single-flight credential refresh with durable reuse
//! - `SubscriberRegistry`: downstream connection set and fan-out
//! - `SnapshotSampler`: periodic quote snapshots

pub mod credential_cache;
pub mod registry;
pub mod snapshot_sampler;

pub use credential_cache::CredentialCache;
pub use registry::{
    BroadcastReport, CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION, OriginPolicy, RegistryConfig,
    RegistryError, SubscriberRegistry,
};
pub use snapshot_sampler::{SamplerConfig, SamplerStats, SnapshotError, SnapshotSampler};
