//! KIS Current-Price Client
//!
//! REST adapter behind [`QuoteSource`]. Calls
//! `GET /uapi/domestic-stock/v1/quotations/inquire-price` with an access
//! token from the [`CredentialCache`].
//!
//! When the brokerage answers `EGW00123` (token expired) the access token is
//! reissued and the call is retried exactly once.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use rust_decimal::Decimal;

use super::messages::{QUOTE_PATH, QUOTE_TR_ID, QuoteOutput, QuoteResponse, TOKEN_EXPIRED_CODE};
use crate::application::ports::{QuoteError, QuoteSource};
use crate::application::services::CredentialCache;
use crate::domain::credential::Credential;
use crate::domain::streaming::{PriceQuote, compact_date};
use crate::infrastructure::config::AppCredentials;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Market division code for domestic stocks.
const MARKET_DIVISION: &str = "J";

/// Current-price client.
pub struct KisQuoteClient {
    client: Client,
    base_url: String,
    app: AppCredentials,
    custtype: String,
    credentials: Arc<CredentialCache>,
}

impl KisQuoteClient {
    /// Create a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `QuoteError::Network` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        app: AppCredentials,
        custtype: impl Into<String>,
        credentials: Arc<CredentialCache>,
    ) -> Result<Self, QuoteError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| QuoteError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app,
            custtype: custtype.into(),
            credentials,
        })
    }

    async fn request(&self, token: &Credential, stock_code: &str) -> Result<QuoteResponse, QuoteError> {
        let url = format!("{}{QUOTE_PATH}", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("authorization", token.bearer())
            .header("appkey", self.app.app_key())
            .header("appsecret", self.app.app_secret())
            .header("tr_id", QUOTE_TR_ID)
            .header("custtype", &self.custtype)
            .query(&[
                ("FID_COND_MRKT_DIV_CODE", MARKET_DIVISION),
                ("FID_INPUT_ISCD", stock_code),
            ])
            .send()
            .await
            .map_err(|e| QuoteError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| QuoteError::Network(e.to_string()))?;

        // Expired-token answers arrive with a 5xx status but a normal envelope.
        match serde_json::from_str::<QuoteResponse>(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => Err(QuoteError::Api {
                code: status.as_u16().to_string(),
                message: body.chars().take(200).collect(),
            }),
            Err(e) => Err(QuoteError::Malformed(e.to_string())),
        }
    }
}

#[async_trait]
impl QuoteSource for KisQuoteClient {
    async fn fetch_quote(&self, stock_code: &str) -> Result<PriceQuote, QuoteError> {
        let token = self.credentials.access_credential().await?;
        let mut response = self.request(&token, stock_code).await?;

        if response.msg_cd == TOKEN_EXPIRED_CODE {
            tracing::warn!(stock_code, "Access token rejected as expired, reissuing");
            let token = self.credentials.reissue_access_credential().await?;
            response = self.request(&token, stock_code).await?;
            if response.msg_cd == TOKEN_EXPIRED_CODE {
                return Err(QuoteError::TokenExpired);
            }
        }

        if !response.is_success() {
            return Err(QuoteError::Api {
                code: response.msg_cd,
                message: response.msg1,
            });
        }
        let output = response
            .output
            .ok_or_else(|| QuoteError::Malformed("missing output".to_string()))?;
        to_price_quote(&output)
    }
}

impl std::fmt::Debug for KisQuoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KisQuoteClient")
            .field("base_url", &self.base_url)
            .field("custtype", &self.custtype)
            .finish_non_exhaustive()
    }
}

fn to_price_quote(output: &QuoteOutput) -> Result<PriceQuote, QuoteError> {
    let business_date = match output.stck_bsop_date.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            NaiveDate::parse_from_str(raw, compact_date::FORMAT)
                .map_err(|e| QuoteError::Malformed(format!("stck_bsop_date '{raw}': {e}")))?,
        ),
    };

    Ok(PriceQuote {
        price: decimal("stck_prpr", &output.stck_prpr)?,
        change: decimal("prdy_vrss", &output.prdy_vrss)?,
        change_percent: decimal("prdy_ctrt", &output.prdy_ctrt)?,
        business_date,
    })
}

fn decimal(field: &str, raw: &str) -> Result<Decimal, QuoteError> {
    Decimal::from_str(raw.trim()).map_err(|e| QuoteError::Malformed(format!("{field} '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::domain::credential::{SafetyMargins, exchange_offset};
    use crate::infrastructure::kis::KisAuthClient;

    fn app() -> AppCredentials {
        AppCredentials::new("app-key", "app-secret").unwrap()
    }

    fn quote_client(server: &MockServer) -> KisQuoteClient {
        let issuer = Arc::new(KisAuthClient::new(server.uri(), app()).unwrap());
        let cache = Arc::new(CredentialCache::new(
            issuer,
            None,
            SafetyMargins::default(),
            exchange_offset(),
        ));
        KisQuoteClient::new(server.uri(), app(), "P", cache).unwrap()
    }

    async fn mount_token(server: &MockServer, token: &str, times: u64) {
        Mock::given(method("POST"))
            .and(path("/oauth2/tokenP"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": token,
                "expires_in": 86400
            })))
            .up_to_n_times(times)
            .expect(times)
            .mount(server)
            .await;
    }

    fn success_body() -> serde_json::Value {
        json!({
            "rt_cd": "0",
            "msg_cd": "MCA00000",
            "msg1": "정상처리 되었습니다.",
            "output": {
                "stck_prpr": "35120.00",
                "prdy_vrss": "-45.00",
                "prdy_ctrt": "-0.13",
                "stck_bsop_date": "20260306",
                "acml_vol": "123456"
            }
        })
    }

    #[tokio::test]
    async fn fetches_and_projects_quote() {
        let server = MockServer::start().await;
        mount_token(&server, "token-1", 1).await;
        Mock::given(method("GET"))
            .and(path(QUOTE_PATH))
            .and(header("authorization", "Bearer token-1"))
            .and(header("appkey", "app-key"))
            .and(header("appsecret", "app-secret"))
            .and(header("tr_id", QUOTE_TR_ID))
            .and(header("custtype", "P"))
            .and(query_param("FID_COND_MRKT_DIV_CODE", "J"))
            .and(query_param("FID_INPUT_ISCD", "102110"))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
            .expect(1)
            .mount(&server)
            .await;

        let quote = quote_client(&server).fetch_quote("102110").await.unwrap();

        assert_eq!(quote.price, Decimal::new(3_512_000, 2));
        assert_eq!(quote.change, Decimal::new(-4_500, 2));
        assert_eq!(quote.change_percent, Decimal::new(-13, 2));
        assert_eq!(quote.business_date, NaiveDate::from_ymd_opt(2026, 3, 6));
    }

    #[tokio::test]
    async fn expired_token_is_reissued_and_retried_once() {
        let server = MockServer::start().await;
        mount_token(&server, "token-1", 1).await;
        mount_token(&server, "token-2", 1).await;
        Mock::given(method("GET"))
            .and(path(QUOTE_PATH))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "rt_cd": "1",
                "msg_cd": "EGW00123",
                "msg1": "기간이 만료된 token 입니다."
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(QUOTE_PATH))
            .and(header("authorization", "Bearer token-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
            .expect(1)
            .mount(&server)
            .await;

        let quote = quote_client(&server).fetch_quote("102110").await.unwrap();
        assert_eq!(quote.price, Decimal::new(3_512_000, 2));
    }

    #[tokio::test]
    async fn second_expiry_gives_up() {
        let server = MockServer::start().await;
        mount_token(&server, "token-1", 1).await;
        mount_token(&server, "token-2", 1).await;
        Mock::given(method("GET"))
            .and(path(QUOTE_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "rt_cd": "1",
                "msg_cd": "EGW00123",
                "msg1": "expired"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let err = quote_client(&server).fetch_quote("102110").await.unwrap_err();
        assert_eq!(err, QuoteError::TokenExpired);
    }

    #[tokio::test]
    async fn api_error_is_reported() {
        let server = MockServer::start().await;
        mount_token(&server, "token-1", 1).await;
        Mock::given(method("GET"))
            .and(path(QUOTE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rt_cd": "7",
                "msg_cd": "OPSQ0002",
                "msg1": "없는 종목코드입니다."
            })))
            .mount(&server)
            .await;

        let err = quote_client(&server).fetch_quote("999999").await.unwrap_err();
        assert!(matches!(err, QuoteError::Api { ref code, .. } if code == "OPSQ0002"));
    }

    #[tokio::test]
    async fn token_failure_surfaces_as_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/tokenP"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error_code": "EGW00133",
                "error_description": "rate limited"
            })))
            .mount(&server)
            .await;

        let err = quote_client(&server).fetch_quote("102110").await.unwrap_err();
        assert!(matches!(err, QuoteError::Auth(_)));
    }

    #[test]
    fn blank_business_date_is_none() {
        let output = QuoteOutput {
            stck_prpr: "100".to_string(),
            prdy_vrss: "0".to_string(),
            prdy_ctrt: "0.00".to_string(),
            stck_bsop_date: Some(String::new()),
        };
        assert_eq!(to_price_quote(&output).unwrap().business_date, None);
    }

    #[test]
    fn non_numeric_price_is_malformed() {
        let output = QuoteOutput {
            stck_prpr: "n/a".to_string(),
            prdy_vrss: "0".to_string(),
            prdy_ctrt: "0".to_string(),
            stck_bsop_date: None,
        };
        assert!(matches!(to_price_quote(&output), Err(QuoteError::Malformed(_))));
    }
}
