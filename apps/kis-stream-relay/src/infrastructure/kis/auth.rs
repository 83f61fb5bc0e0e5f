//! KIS Credential Issuance
//!
//! Issues access tokens (`POST /oauth2/tokenP`) and streaming approval keys
//! (`POST /oauth2/Approval`).
//!
//! The brokerage rate-limits issuance (roughly one access token per minute
//! per app key), so callers go through `CredentialCache` rather than
//! calling this client directly.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use super::messages::{
    AccessTokenRequest, AccessTokenResponse, ApprovalKeyRequest, ApprovalKeyResponse, GRANT_TYPE,
    IssuanceErrorResponse,
};
use crate::application::ports::{AuthError, CredentialIssuer, IssuedCredential};
use crate::domain::credential::CredentialKind;
use crate::infrastructure::config::AppCredentials;

/// Access token lifetime when the response omits `expires_in`.
pub const DEFAULT_ACCESS_LIFETIME: Duration = Duration::from_secs(86_400);

/// Approval key lifetime. The endpoint does not report one.
pub const DEFAULT_APPROVAL_LIFETIME: Duration = Duration::from_secs(86_400);

/// Request timeout for issuance calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the issuance endpoints.
#[derive(Debug, Clone)]
pub struct KisAuthClient {
    client: Client,
    base_url: String,
    credentials: AppCredentials,
}

impl KisAuthClient {
    /// Create a client for `base_url` (no trailing slash).
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Network` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, credentials: AppCredentials) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AuthError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    async fn issue_access(&self) -> Result<IssuedCredential, AuthError> {
        let body = AccessTokenRequest {
            grant_type: GRANT_TYPE,
            appkey: self.credentials.app_key(),
            appsecret: self.credentials.app_secret(),
        };
        let response = self.post(CredentialKind::Access, "/oauth2/tokenP", &body).await?;
        let parsed: AccessTokenResponse =
            serde_json::from_str(&response).map_err(|e| AuthError::MalformedResponse(e.to_string()))?;

        if parsed.access_token.trim().is_empty() {
            return Err(AuthError::MalformedResponse("empty access_token".to_string()));
        }

        Ok(IssuedCredential {
            value: parsed.access_token,
            lifetime: lifetime_or(parsed.expires_in, DEFAULT_ACCESS_LIFETIME),
        })
    }

    async fn issue_approval(&self) -> Result<IssuedCredential, AuthError> {
        let body = ApprovalKeyRequest {
            grant_type: GRANT_TYPE,
            appkey: self.credentials.app_key(),
            secretkey: self.credentials.app_secret(),
        };
        let response = self.post(CredentialKind::Approval, "/oauth2/Approval", &body).await?;
        let parsed: ApprovalKeyResponse =
            serde_json::from_str(&response).map_err(|e| AuthError::MalformedResponse(e.to_string()))?;

        let value = parsed
            .approval_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| AuthError::MalformedResponse("missing approval_key".to_string()))?;

        Ok(IssuedCredential {
            value,
            lifetime: lifetime_or(parsed.expires_in, DEFAULT_APPROVAL_LIFETIME),
        })
    }

    async fn post<B: serde::Serialize + Sync>(
        &self,
        kind: CredentialKind,
        path: &str,
        body: &B,
    ) -> Result<String, AuthError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if status.is_success() {
            return Ok(text);
        }
        Err(rejection(kind, status, &text))
    }
}

#[async_trait]
impl CredentialIssuer for KisAuthClient {
    async fn issue(&self, kind: CredentialKind) -> Result<IssuedCredential, AuthError> {
        tracing::debug!(kind = %kind, "Requesting credential");
        match kind {
            CredentialKind::Access => self.issue_access().await,
            CredentialKind::Approval => self.issue_approval().await,
        }
    }
}

fn lifetime_or(expires_in: Option<u64>, default: Duration) -> Duration {
    expires_in
        .filter(|secs| *secs > 0)
        .map_or(default, Duration::from_secs)
}

fn rejection(kind: CredentialKind, status: StatusCode, body: &str) -> AuthError {
    let parsed: IssuanceErrorResponse = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .error_description
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| truncate(body, 200).to_string());

    AuthError::Rejected {
        kind,
        status: status.as_u16(),
        code: parsed.error_code,
        message,
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    text.char_indices()
        .nth(max_chars)
        .map_or(text, |(idx, _)| &text[..idx])
}
