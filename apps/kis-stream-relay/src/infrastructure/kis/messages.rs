//! KIS Wire Messages
//!
//! Request and response shapes for the brokerage's REST and streaming
//! endpoints.
//!
//! # Streaming subscribe frame
//!
//! ```json
//! {
//!   "header": {"approval_key": "...", "custtype": "P", "tr_type": "1", "content-type": "utf-8"},
//!   "body": {"input": {"tr_id": "H0STNAV0", "tr_key": "102110"}}
//! }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::streaming::Topic;

// =============================================================================
// Credential Issuance
// =============================================================================

/// Grant type sent with every issuance request.
pub const GRANT_TYPE: &str = "client_credentials";

/// `POST /oauth2/tokenP` body.
#[derive(Serialize)]
pub struct AccessTokenRequest<'a> {
    /// Always `client_credentials`.
    pub grant_type: &'static str,
    /// App key.
    pub appkey: &'a str,
    /// App secret.
    pub appsecret: &'a str,
}

/// `POST /oauth2/Approval` body. The secret goes under `secretkey` here.
#[derive(Serialize)]
pub struct ApprovalKeyRequest<'a> {
    /// Always `client_credentials`.
    pub grant_type: &'static str,
    /// App key.
    pub appkey: &'a str,
    /// App secret.
    pub secretkey: &'a str,
}

/// `POST /oauth2/tokenP` response.
#[derive(Deserialize)]
pub struct AccessTokenResponse {
    /// Bearer token.
    pub access_token: String,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// `POST /oauth2/Approval` response.
#[derive(Deserialize)]
pub struct ApprovalKeyResponse {
    /// Streaming approval key.
    #[serde(default)]
    pub approval_key: Option<String>,
    /// Lifetime in seconds, when reported.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Error body returned by the issuance endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct IssuanceErrorResponse {
    /// Brokerage error code (e.g. `EGW00133`).
    #[serde(default)]
    pub error_code: Option<String>,
    /// Human-readable description.
    #[serde(default)]
    pub error_description: Option<String>,
}

// =============================================================================
// Streaming
// =============================================================================

/// `tr_type` for a subscribe request.
pub const TR_TYPE_SUBSCRIBE: &str = "1";

/// `tr_type` for an unsubscribe request.
pub const TR_TYPE_UNSUBSCRIBE: &str = "2";

/// Subscribe or unsubscribe frame.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Frame header.
    pub header: SubscribeHeader,
    /// Frame body.
    pub body: SubscribeBody,
}

/// Subscribe frame header.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeHeader {
    /// Approval key from `/oauth2/Approval`.
    pub approval_key: String,
    /// Customer type.
    pub custtype: String,
    /// `1` subscribe, `2` unsubscribe.
    pub tr_type: String,
    /// Payload encoding.
    #[serde(rename = "content-type")]
    pub content_type: String,
}

/// Subscribe frame body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeBody {
    /// Channel and instrument.
    pub input: SubscribeInput,
}

/// Channel and instrument of a subscribe frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeInput {
    /// Channel id.
    pub tr_id: String,
    /// Instrument key.
    pub tr_key: String,
}

impl SubscribeRequest {
    fn new(approval_key: &str, custtype: &str, tr_type: &str, topic: &Topic) -> Self {
        Self {
            header: SubscribeHeader {
                approval_key: approval_key.to_string(),
                custtype: custtype.to_string(),
                tr_type: tr_type.to_string(),
                content_type: "utf-8".to_string(),
            },
            body: SubscribeBody {
                input: SubscribeInput {
                    tr_id: topic.channel_id().to_string(),
                    tr_key: topic.instrument_key().to_string(),
                },
            },
        }
    }

    /// Subscribe to `topic`.
    #[must_use]
    pub fn subscribe(approval_key: &str, custtype: &str, topic: &Topic) -> Self {
        Self::new(approval_key, custtype, TR_TYPE_SUBSCRIBE, topic)
    }

    /// Unsubscribe from `topic`.
    #[must_use]
    pub fn unsubscribe(approval_key: &str, custtype: &str, topic: &Topic) -> Self {
        Self::new(approval_key, custtype, TR_TYPE_UNSUBSCRIBE, topic)
    }

    /// The topic this frame targets.
    #[must_use]
    pub fn topic(&self) -> Topic {
        Topic::new(&self.body.input.tr_id, &self.body.input.tr_key)
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl fmt::Debug for SubscribeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeRequest")
            .field("tr_type", &self.header.tr_type)
            .field("custtype", &self.header.custtype)
            .field("approval_key", &"[REDACTED]")
            .field("input", &self.body.input)
            .finish()
    }
}

// =============================================================================
// Quotes
// =============================================================================

/// Transaction id of the current-price inquiry.
pub const QUOTE_TR_ID: &str = "FHKST01010100";

/// Path of the current-price inquiry.
pub const QUOTE_PATH: &str = "/uapi/domestic-stock/v1/quotations/inquire-price";

/// Message code for an expired access token.
pub const TOKEN_EXPIRED_CODE: &str = "EGW00123";

/// `inquire-price` response envelope.
#[derive(Debug, Deserialize)]
pub struct QuoteResponse {
    /// `"0"` on success.
    #[serde(default)]
    pub rt_cd: String,
    /// Message code.
    #[serde(default)]
    pub msg_cd: String,
    /// Message text.
    #[serde(default)]
    pub msg1: String,
    /// Quote fields, present on success.
    #[serde(default)]
    pub output: Option<QuoteOutput>,
}

impl QuoteResponse {
    /// Whether the call succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.rt_cd == "0"
    }
}

/// The `output` fields the relay projects into a snapshot.
///
/// Numbers arrive as strings.
#[derive(Debug, Clone, Deserialize)]
pub struct QuoteOutput {
    /// Current price.
    pub stck_prpr: String,
    /// Change versus previous close.
    pub prdy_vrss: String,
    /// Change rate versus previous close.
    pub prdy_ctrt: String,
    /// Business date, `YYYYMMDD`.
    #[serde(default)]
    pub stck_bsop_date: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn subscribe_frame_shape() {
        let topic = Topic::new("H0STNAV0", "102110");
        let frame = SubscribeRequest::subscribe("approval-123", "P", &topic);
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "header": {
                    "approval_key": "approval-123",
                    "custtype": "P",
                    "tr_type": "1",
                    "content-type": "utf-8"
                },
                "body": {"input": {"tr_id": "H0STNAV0", "tr_key": "102110"}}
            })
        );
        assert_eq!(frame.topic(), topic);
    }

    #[test]
    fn unsubscribe_uses_tr_type_two() {
        let frame = SubscribeRequest::unsubscribe("k", "B", &Topic::new("H0STCNT0", "005930"));
        assert_eq!(frame.header.tr_type, TR_TYPE_UNSUBSCRIBE);
        assert_eq!(frame.header.custtype, "B");
    }

    #[test]
    fn subscribe_debug_hides_approval_key() {
        let frame = SubscribeRequest::subscribe("secret-approval", "P", &Topic::new("A", "B"));
        let debug = format!("{frame:?}");
        assert!(!debug.contains("secret-approval"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn issuance_bodies_use_expected_keys() {
        let access = serde_json::to_value(AccessTokenRequest {
            grant_type: GRANT_TYPE,
            appkey: "key",
            appsecret: "secret",
        })
        .unwrap();
        assert_eq!(access, json!({"grant_type": "client_credentials", "appkey": "key", "appsecret": "secret"}));

        let approval = serde_json::to_value(ApprovalKeyRequest {
            grant_type: GRANT_TYPE,
            appkey: "key",
            secretkey: "secret",
        })
        .unwrap();
        assert_eq!(approval["secretkey"], "secret");
        assert!(approval.get("appsecret").is_none());
    }

    #[test]
    fn quote_response_parses_failure_without_output() {
        let response: QuoteResponse = serde_json::from_value(json!({
            "rt_cd": "1",
            "msg_cd": "EGW00123",
            "msg1": "기간이 만료된 token 입니다."
        }))
        .unwrap();
        assert!(!response.is_success());
        assert_eq!(response.msg_cd, TOKEN_EXPIRED_CODE);
        assert!(response.output.is_none());
    }
}
