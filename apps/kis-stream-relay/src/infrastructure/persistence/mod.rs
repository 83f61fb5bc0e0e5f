//! Durable storage adapters.
//!
//! - [`FileCredentialStore`]: one JSON record per credential kind
//! - [`CsvSnapshotLog`]: append-only snapshot CSV

mod credential_store;
mod snapshot_log;

pub use credential_store::{CredentialRecord, FileCredentialStore};
pub use snapshot_log::{CSV_HEADER, CsvSnapshotLog};
