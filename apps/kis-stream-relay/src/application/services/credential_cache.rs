//! Credential Cache
//!
//! Hands out access and approval credentials, refreshing them through the
//! [`CredentialIssuer`] only when the cached value is inside its safety
//! margin.
//!
//! # Refresh Rules
//!
//! 1. A cached credential is returned while `now < expires_at - margin`.
//! 2. Otherwise, a same-day record from the [`CredentialStore`] is reused
//!    if it is still outside its margin.
//! 3. Otherwise the issuer is called. Success replaces the cached value;
//!    failure leaves the previous value in place.
//!
//! At most one refresh per kind is in flight. Callers that arrive while a
//! refresh is running wait for it and share its outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::application::ports::{AuthError, CredentialIssuer, CredentialStore};
use crate::domain::credential::{Credential, CredentialKind, SafetyMargins};
use crate::infrastructure::metrics;

// =============================================================================
// Slot
// =============================================================================

#[derive(Default)]
struct CredentialSlot {
    current: RwLock<Option<Credential>>,
    refresh: Mutex<()>,
    completed_refreshes: AtomicU64,
    last_outcome: RwLock<Option<Result<Credential, AuthError>>>,
}

impl CredentialSlot {
    fn usable(
        &self,
        now: DateTime<Utc>,
        margins: &SafetyMargins,
        kind: CredentialKind,
    ) -> Option<Credential> {
        self.current
            .read()
            .as_ref()
            .filter(|credential| credential.is_usable_at(now, margins.for_kind(kind)))
            .cloned()
    }
}

// =============================================================================
// Credential Cache
// =============================================================================

/// Exclusive owner of the relay's brokerage credentials.
pub struct CredentialCache {
    issuer: Arc<dyn CredentialIssuer>,
    store: Option<Arc<dyn CredentialStore>>,
    margins: SafetyMargins,
    day_offset: FixedOffset,
    access: CredentialSlot,
    approval: CredentialSlot,
}

impl CredentialCache {
    /// Create a cache backed by `issuer`.
    ///
    /// `day_offset` defines the calendar day used for durable reuse.
    #[must_use]
    pub fn new(
        issuer: Arc<dyn CredentialIssuer>,
        store: Option<Arc<dyn CredentialStore>>,
        margins: SafetyMargins,
        day_offset: FixedOffset,
    ) -> Self {
        Self {
            issuer,
            store,
            margins,
            day_offset,
            access: CredentialSlot::default(),
            approval: CredentialSlot::default(),
        }
    }

    /// Access token for REST calls.
    ///
    /// # Errors
    ///
    /// Returns `AuthError` when no usable credential exists and issuance fails.
    pub async fn access_credential(&self) -> Result<Credential, AuthError> {
        self.get(CredentialKind::Access, false).await
    }

    /// Discard the cached access token and issue a new one.
    ///
    /// Used when the REST API reports the token as expired.
    ///
    /// # Errors
    ///
    /// Returns `AuthError` when issuance fails.
    pub async fn reissue_access_credential(&self) -> Result<Credential, AuthError> {
        self.get(CredentialKind::Access, true).await
    }

    /// Approval key for the streaming endpoint.
    ///
    /// With `force_reissue`, the cache and store are bypassed.
    ///
    /// # Errors
    ///
    /// Returns `AuthError` when no usable credential exists and issuance fails.
    pub async fn approval_credential(&self, force_reissue: bool) -> Result<Credential, AuthError> {
        self.get(CredentialKind::Approval, force_reissue).await
    }

    /// The cached credential of a kind, regardless of validity.
    #[must_use]
    pub fn cached(&self, kind: CredentialKind) -> Option<Credential> {
        self.slot(kind).current.read().clone()
    }

    const fn slot(&self, kind: CredentialKind) -> &CredentialSlot {
        match kind {
            CredentialKind::Access => &self.access,
            CredentialKind::Approval => &self.approval,
        }
    }

    async fn get(&self, kind: CredentialKind, force: bool) -> Result<Credential, AuthError> {
        let slot = self.slot(kind);

        // Snapshot before the fast path so a refresh finishing in between is seen.
        let seen = slot.completed_refreshes.load(Ordering::Acquire);
        if !force && let Some(credential) = slot.usable(Utc::now(), &self.margins, kind) {
            return Ok(credential);
        }

        let _guard = slot.refresh.lock().await;

        if slot.completed_refreshes.load(Ordering::Acquire) != seen
            && let Some(outcome) = slot.last_outcome.read().clone()
        {
            tracing::debug!(kind = %kind, "Sharing result of concurrent credential refresh");
            return outcome;
        }
        if !force && let Some(credential) = slot.usable(Utc::now(), &self.margins, kind) {
            return Ok(credential);
        }

        let outcome = self.refresh(kind, force).await;
        *slot.last_outcome.write() = Some(outcome.clone());
        slot.completed_refreshes.fetch_add(1, Ordering::Release);
        outcome
    }

    async fn refresh(&self, kind: CredentialKind, force: bool) -> Result<Credential, AuthError> {
        let slot = self.slot(kind);

        if !force && let Some(credential) = self.load_same_day(kind).await {
            tracing::info!(
                kind = %kind,
                expires_at = %credential.expires_at(),
                "Reusing stored credential from today"
            );
            *slot.current.write() = Some(credential.clone());
            return Ok(credential);
        }

        let issued = match self.issuer.issue(kind).await {
            Ok(issued) => issued,
            Err(e) => {
                metrics::record_credential_issuance(kind, false);
                tracing::warn!(kind = %kind, error = %e, "Credential issuance failed");
                return Err(e);
            }
        };
        metrics::record_credential_issuance(kind, true);

        let credential = Credential::with_lifetime(issued.value, Utc::now(), issued.lifetime)
            .map_err(|e| AuthError::InvalidCredential(e.to_string()))?;

        if !credential.is_usable_at(credential.issued_at(), self.margins.for_kind(kind)) {
            tracing::warn!(
                kind = %kind,
                lifetime_secs = issued.lifetime.as_secs(),
                margin_secs = self.margins.for_kind(kind).as_secs(),
                "Issued credential lifetime is shorter than its safety margin"
            );
        }

        *slot.current.write() = Some(credential.clone());
        tracing::info!(
            kind = %kind,
            expires_at = %credential.expires_at(),
            "Credential issued"
        );

        if let Some(store) = &self.store
            && let Err(e) = store.save(kind, &credential).await
        {
            tracing::warn!(kind = %kind, error = %e, "Failed to persist credential");
        }

        Ok(credential)
    }

    async fn load_same_day(&self, kind: CredentialKind) -> Option<Credential> {
        let store = self.store.as_ref()?;
        let stored = match store.load(kind).await {
            Ok(stored) => stored?,
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "Failed to read stored credential");
                return None;
            }
        };

        let now = Utc::now();
        let today = now.with_timezone(&self.day_offset).date_naive();
        if stored.issuance_day(self.day_offset) != today {
            tracing::debug!(kind = %kind, "Stored credential is from a previous day");
            return None;
        }
        if !stored.is_usable_at(now, self.margins.for_kind(kind)) {
            tracing::debug!(kind = %kind, "Stored credential is inside its safety margin");
            return None;
        }
        Some(stored)
    }
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("margins", &self.margins)
            .field("day_offset", &self.day_offset)
            .field("has_store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
