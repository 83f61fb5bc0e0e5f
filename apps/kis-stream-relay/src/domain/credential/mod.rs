//! Credential Types
//!
//! Short-lived credentials issued by the brokerage. Two kinds exist with
//! independent lifetimes:
//!
//! - **Access**: bearer token for REST calls (quotes).
//! - **Approval**: key presented when subscribing on the streaming endpoint.
//!
//! A [`Credential`] is immutable. Refreshing replaces it wholesale.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, TimeDelta, Utc};

// =============================================================================
// Credential Kind
// =============================================================================

/// Which credential a value represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// REST access token.
    Access,
    /// Streaming approval key.
    Approval,
}

impl CredentialKind {
    /// Stable lowercase name, used for file names and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Approval => "approval",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Credential
// =============================================================================

/// An issued credential with its validity window.
///
/// Invariant: `expires_at > issued_at` and `value` is non-empty.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    value: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Credential {
    /// Create a credential from explicit timestamps.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is empty or the window is not positive.
    pub fn new(
        value: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self, CredentialError> {
        let value = value.into();
        if value.is_empty() {
            return Err(CredentialError::EmptyValue);
        }
        if expires_at <= issued_at {
            return Err(CredentialError::InvalidLifetime {
                issued_at,
                expires_at,
            });
        }
        Ok(Self {
            value,
            issued_at,
            expires_at,
        })
    }

    /// Create a credential issued at `issued_at` that lives for `lifetime`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is empty, the lifetime is zero, or the
    /// expiry does not fit in a timestamp.
    pub fn with_lifetime(
        value: impl Into<String>,
        issued_at: DateTime<Utc>,
        lifetime: Duration,
    ) -> Result<Self, CredentialError> {
        let expires_at = TimeDelta::from_std(lifetime)
            .ok()
            .and_then(|delta| issued_at.checked_add_signed(delta))
            .ok_or(CredentialError::LifetimeOutOfRange(lifetime))?;
        Self::new(value, issued_at, expires_at)
    }

    /// The raw token or key.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// When the credential was issued.
    #[must_use]
    pub const fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// When the credential stops being accepted upstream.
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// `Authorization` header value for REST calls.
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.value)
    }

    /// Whether the credential may still be handed out at `now`.
    ///
    /// Usable only while `now < expires_at - margin`. Reaching the margin
    /// exactly counts as stale.
    #[must_use]
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        TimeDelta::from_std(margin)
            .ok()
            .and_then(|margin| self.expires_at.checked_sub_signed(margin))
            .is_some_and(|deadline| now < deadline)
    }

    /// Calendar day of issuance in the given offset.
    #[must_use]
    pub fn issuance_day(&self, offset: FixedOffset) -> NaiveDate {
        self.issued_at.with_timezone(&offset).date_naive()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("value", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// =============================================================================
// Safety Margins
// =============================================================================

/// How long before expiry each credential kind is considered stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyMargins {
    /// Margin for access tokens.
    pub access: Duration,
    /// Margin for approval keys.
    pub approval: Duration,
}

impl Default for SafetyMargins {
    fn default() -> Self {
        Self {
            access: Duration::from_secs(60),
            approval: Duration::from_secs(600),
        }
    }
}

impl SafetyMargins {
    /// Margin for the given kind.
    #[must_use]
    pub const fn for_kind(&self, kind: CredentialKind) -> Duration {
        match kind {
            CredentialKind::Access => self.access,
            CredentialKind::Approval => self.approval,
        }
    }
}

/// Hours east of UTC of the exchange calendar.
pub const EXCHANGE_UTC_OFFSET_HOURS: i32 = 9;

/// Build a calendar offset from whole hours east of UTC.
///
/// Out-of-range values fall back to UTC.
#[must_use]
pub fn offset_from_hours(hours: i32) -> FixedOffset {
    hours
        .checked_mul(3600)
        .and_then(FixedOffset::east_opt)
        .unwrap_or_else(|| Utc.fix())
}

/// The exchange calendar offset.
#[must_use]
pub fn exchange_offset() -> FixedOffset {
    offset_from_hours(EXCHANGE_UTC_OFFSET_HOURS)
}

// =============================================================================
// Errors
// =============================================================================

/// Invalid credential construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    /// The token or key was empty.
    #[error("credential value cannot be empty")]
    EmptyValue,

    /// Expiry is not after issuance.
    #[error("credential expires at {expires_at} which is not after issuance at {issued_at}")]
    InvalidLifetime {
        /// Issuance time.
        issued_at: DateTime<Utc>,
        /// Expiry time.
        expires_at: DateTime<Utc>,
    },

    /// Lifetime cannot be represented.
    #[error("credential lifetime {0:?} is out of range")]
    LifetimeOutOfRange(Duration),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use test_case::test_case;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn hour_long() -> Credential {
        Credential::with_lifetime("tok", at(0), Duration::from_secs(3600)).unwrap()
    }

    #[test_case(0, true ; "fresh credential")]
    #[test_case(3539, true ; "one second before margin")]
    #[test_case(3540, false ; "exactly at margin")]
    #[test_case(3541, false ; "inside margin")]
    #[test_case(3600, false ; "at expiry")]
    #[test_case(7200, false ; "long expired")]
    fn usable_relative_to_access_margin(now: i64, expected: bool) {
        let credential = hour_long();
        assert_eq!(
            credential.is_usable_at(at(now), Duration::from_secs(60)),
            expected
        );
    }

    #[test]
    fn margin_longer_than_lifetime_is_never_usable() {
        let credential = hour_long();
        assert!(!credential.is_usable_at(at(0), Duration::from_secs(7200)));
    }

    #[test]
    fn rejects_empty_value() {
        let err = Credential::with_lifetime("", at(0), Duration::from_secs(10)).unwrap_err();
        assert_eq!(err, CredentialError::EmptyValue);
    }

    #[test]
    fn rejects_zero_lifetime() {
        let err = Credential::with_lifetime("tok", at(0), Duration::ZERO).unwrap_err();
        assert!(matches!(err, CredentialError::InvalidLifetime { .. }));
    }

    #[test]
    fn issuance_day_respects_offset() {
        // 2023-11-14T22:13:20Z is already the 15th in Seoul.
        let credential = hour_long();
        let utc = FixedOffset::east_opt(0).unwrap();
        let kst = FixedOffset::east_opt(9 * 3600).unwrap();

        assert_eq!(
            credential.issuance_day(utc),
            NaiveDate::from_ymd_opt(2023, 11, 14).unwrap()
        );
        assert_eq!(
            credential.issuance_day(kst),
            NaiveDate::from_ymd_opt(2023, 11, 15).unwrap()
        );
    }

    #[test]
    fn bearer_header() {
        assert_eq!(hour_long().bearer(), "Bearer tok");
    }

    #[test]
    fn debug_redacts_value() {
        let credential =
            Credential::with_lifetime("super-secret", at(0), Duration::from_secs(5)).unwrap();
        let debug = format!("{credential:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_margins() {
        let margins = SafetyMargins::default();
        assert_eq!(
            margins.for_kind(CredentialKind::Access),
            Duration::from_secs(60)
        );
        assert_eq!(
            margins.for_kind(CredentialKind::Approval),
            Duration::from_secs(600)
        );
    }
}
