//! File-backed credential store.
//!
//! Each kind lives in `{dir}/{kind}.json`:
//!
//! ```json
//! {"token":"...","issued_date":"2026-03-06","issued_at":"...","expires_at":"..."}
//! ```
//!
//! Writes go to a temporary file that is renamed over the record, so a
//! crash never leaves a half-written credential behind.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::application::ports::{CredentialStore, StoreError};
use crate::domain::credential::{Credential, CredentialKind};

/// On-disk credential record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Token or approval key.
    pub token: String,
    /// Issuance day in the store's calendar offset.
    pub issued_date: NaiveDate,
    /// Issuance instant.
    pub issued_at: DateTime<Utc>,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("token", &"[REDACTED]")
            .field("issued_date", &self.issued_date)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Stores credentials as JSON files in one directory.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
    offset: FixedOffset,
}

impl FileCredentialStore {
    /// Create a store rooted at `dir`. The directory is created on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, offset: FixedOffset) -> Self {
        Self {
            dir: dir.into(),
            offset,
        }
    }

    /// Record path for a kind.
    #[must_use]
    pub fn path_for(&self, kind: CredentialKind) -> PathBuf {
        self.dir.join(format!("{}.json", kind.as_str()))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, kind: CredentialKind) -> Result<Option<Credential>, StoreError> {
        let raw = match tokio::fs::read(self.path_for(kind)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: CredentialRecord = serde_json::from_slice(&raw)?;
        let credential = Credential::new(record.token, record.issued_at, record.expires_at)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        Ok(Some(credential))
    }

    async fn save(&self, kind: CredentialKind, credential: &Credential) -> Result<(), StoreError> {
        let record = CredentialRecord {
            token: credential.value().to_string(),
            issued_date: credential.issuance_day(self.offset),
            issued_at: credential.issued_at(),
            expires_at: credential.expires_at(),
        };
        let json = serde_json::to_vec_pretty(&record)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(kind);
        let tmp_path = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &path).await?;

        tracing::debug!(kind = %kind, path = %path.display(), "Credential persisted");
        Ok(())
    }
}
