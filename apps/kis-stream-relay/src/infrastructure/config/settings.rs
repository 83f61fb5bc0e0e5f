//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use chrono::FixedOffset;

use crate::domain::credential::{EXCHANGE_UTC_OFFSET_HOURS, SafetyMargins, offset_from_hours};
use crate::domain::streaming::Topic;

/// Brokerage app credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct AppCredentials {
    app_key: String,
    app_secret: String,
}

impl AppCredentials {
    /// Create credentials.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::EmptyValue` if either part is blank.
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Result<Self, ConfigError> {
        let app_key = app_key.into().trim().to_string();
        let app_secret = app_secret.into().trim().to_string();

        if app_key.is_empty() {
            return Err(ConfigError::EmptyValue("KIS_APP_KEY".to_string()));
        }
        if app_secret.is_empty() {
            return Err(ConfigError::EmptyValue("KIS_APP_SECRET".to_string()));
        }

        Ok(Self {
            app_key,
            app_secret,
        })
    }

    /// Read `KIS_APP_KEY` and `KIS_APP_SECRET`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` or `ConfigError::EmptyValue`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let app_key =
            lookup("KIS_APP_KEY").ok_or_else(|| ConfigError::MissingEnvVar("KIS_APP_KEY".to_string()))?;
        let app_secret = lookup("KIS_APP_SECRET")
            .ok_or_else(|| ConfigError::MissingEnvVar("KIS_APP_SECRET".to_string()))?;
        Self::new(app_key, app_secret)
    }

    /// App key.
    #[must_use]
    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    /// App secret.
    #[must_use]
    pub fn app_secret(&self) -> &str {
        &self.app_secret
    }
}

impl std::fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCredentials")
            .field("app_key", &"[REDACTED]")
            .field("app_secret", &"[REDACTED]")
            .finish()
    }
}

/// Brokerage endpoints and feed selection.
#[derive(Debug, Clone)]
pub struct KisSettings {
    /// REST base URL, used for issuance and quotes.
    pub base_url: String,
    /// Streaming endpoint.
    pub ws_url: String,
    /// Customer type (`P` personal, `B` corporate).
    pub custtype: String,
    /// Upstream topics to subscribe.
    pub subscriptions: Vec<Topic>,
    /// Instrument polled by the snapshot sampler.
    pub snapshot_stock_code: String,
    /// Snapshot sampling interval.
    pub snapshot_interval: Duration,
    /// Credential safety margins.
    pub margins: SafetyMargins,
    /// Calendar offset for credential reuse and snapshot timestamps.
    pub utc_offset_hours: i32,
}

impl Default for KisSettings {
    fn default() -> Self {
        Self {
            base_url: "https://openapi.koreainvestment.com:9443".to_string(),
            ws_url: "ws://ops.koreainvestment.com:31000".to_string(),
            custtype: "P".to_string(),
            subscriptions: vec![Topic::new("H0STNAV0", "102110")],
            snapshot_stock_code: "102110".to_string(),
            snapshot_interval: Duration::from_secs(300),
            margins: SafetyMargins::default(),
            utc_offset_hours: EXCHANGE_UTC_OFFSET_HOURS,
        }
    }
}

impl KisSettings {
    /// Calendar offset.
    #[must_use]
    pub fn offset(&self) -> FixedOffset {
        offset_from_hours(self.utc_offset_hours)
    }
}

/// Downstream server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// WebSocket server port.
    pub port: u16,
    /// WebSocket route.
    pub ws_path: String,
    /// Origin allow-list (empty = any).
    pub allowed_origins: Vec<String>,
    /// Per-connection outbound buffer.
    pub client_buffer: usize,
    /// Per-send timeout before a consumer is dropped.
    pub send_timeout: Duration,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8000,
            ws_path: "/ws/kospi200".to_string(),
            allowed_origins: Vec::new(),
            client_buffer: 1024,
            send_timeout: Duration::from_millis(1000),
            health_port: 8082,
        }
    }
}

/// Upstream WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout before considering connection dead.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Upstream connect timeout.
    pub connect_timeout: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(20),
            reconnect_delay_initial: Duration::from_millis(1000),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// App credentials. `None` runs the relay degraded.
    pub credentials: Option<AppCredentials>,
    /// Brokerage settings.
    pub kis: KisSettings,
    /// Downstream server settings.
    pub server: ServerSettings,
    /// Upstream connection settings.
    pub websocket: WebSocketSettings,
    /// Directory for the snapshot log and credential records.
    pub data_dir: PathBuf,
    /// Delay before a crashed background task is restarted.
    pub supervisor_restart_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            kis: KisSettings::default(),
            server: ServerSettings::default(),
            websocket: WebSocketSettings::default(),
            data_dir: PathBuf::from("data"),
            supervisor_restart_delay: Duration::from_secs(5),
        }
    }
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if `KIS_SUBSCRIPTIONS` is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if `KIS_SUBSCRIPTIONS` is malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = Self::default();

        let kis_defaults = defaults.kis;
        let subscriptions = match env.string("KIS_SUBSCRIPTIONS") {
            Some(raw) => parse_topics(&raw)?,
            None => kis_defaults.subscriptions,
        };
        let kis = KisSettings {
            base_url: env
                .string("KIS_BASE_URL")
                .map_or(kis_defaults.base_url, |url| url.trim_end_matches('/').to_string()),
            ws_url: env.string("KIS_WS_URL").unwrap_or(kis_defaults.ws_url),
            custtype: env.string("KIS_CUSTTYPE").unwrap_or(kis_defaults.custtype),
            subscriptions,
            snapshot_stock_code: env
                .string("KIS_SNAPSHOT_STOCK_CODE")
                .unwrap_or(kis_defaults.snapshot_stock_code),
            snapshot_interval: env.secs("KIS_SNAPSHOT_INTERVAL_SECS", kis_defaults.snapshot_interval),
            margins: SafetyMargins {
                access: env.secs("KIS_ACCESS_MARGIN_SECS", kis_defaults.margins.access),
                approval: env.secs("KIS_APPROVAL_MARGIN_SECS", kis_defaults.margins.approval),
            },
            utc_offset_hours: env
                .parse("KIS_CREDENTIAL_UTC_OFFSET_HOURS")
                .filter(|hours: &i32| (-23..=23).contains(hours))
                .unwrap_or(kis_defaults.utc_offset_hours),
        };

        let server_defaults = defaults.server;
        let server = ServerSettings {
            port: env.parse("RELAY_PORT").unwrap_or(server_defaults.port),
            ws_path: env
                .string("RELAY_WS_PATH")
                .map_or(server_defaults.ws_path, |path| normalize_path(&path)),
            allowed_origins: env
                .string("RELAY_ALLOWED_ORIGINS")
                .map(|raw| split_list(&raw))
                .unwrap_or(server_defaults.allowed_origins),
            client_buffer: env
                .parse("RELAY_CLIENT_BUFFER")
                .filter(|size: &usize| *size > 0)
                .unwrap_or(server_defaults.client_buffer),
            send_timeout: env.millis("RELAY_SEND_TIMEOUT_MS", server_defaults.send_timeout),
            health_port: env.parse("RELAY_HEALTH_PORT").unwrap_or(server_defaults.health_port),
        };

        let ws_defaults = defaults.websocket;
        let websocket = WebSocketSettings {
            heartbeat_interval: env.secs("RELAY_HEARTBEAT_INTERVAL_SECS", ws_defaults.heartbeat_interval),
            heartbeat_timeout: env.secs("RELAY_HEARTBEAT_TIMEOUT_SECS", ws_defaults.heartbeat_timeout),
            reconnect_delay_initial: env.millis(
                "RELAY_RECONNECT_DELAY_INITIAL_MS",
                ws_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.secs("RELAY_RECONNECT_DELAY_MAX_SECS", ws_defaults.reconnect_delay_max),
            reconnect_delay_multiplier: env
                .parse("RELAY_RECONNECT_DELAY_MULTIPLIER")
                .filter(|m: &f64| m.is_finite() && *m >= 1.0)
                .unwrap_or(ws_defaults.reconnect_delay_multiplier),
            connect_timeout: env.secs("RELAY_CONNECT_TIMEOUT_SECS", ws_defaults.connect_timeout),
        };

        Ok(Self {
            credentials: AppCredentials::from_lookup(&lookup).ok(),
            kis,
            server,
            websocket,
            data_dir: env.string("RELAY_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            supervisor_restart_delay: env.secs(
                "RELAY_SUPERVISOR_RESTART_DELAY_SECS",
                defaults.supervisor_restart_delay,
            ),
        })
    }

    /// Whether app credentials are present.
    #[must_use]
    pub const fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Path of the snapshot log.
    #[must_use]
    pub fn snapshot_log_path(&self) -> PathBuf {
        self.data_dir.join("snapshots.csv")
    }

    /// Directory of the durable credential records.
    #[must_use]
    pub fn credentials_dir(&self) -> PathBuf {
        self.data_dir.join("credentials")
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {name} is invalid: {reason}")]
    InvalidValue {
        /// Variable name.
        name: String,
        /// What was wrong.
        reason: String,
    },
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.string(key).and_then(|v| v.parse().ok())
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.parse::<u64>(key).map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.parse::<u64>(key).map_or(default, Duration::from_millis)
    }
}

fn parse_topics(raw: &str) -> Result<Vec<Topic>, ConfigError> {
    let topics = split_list(raw)
        .iter()
        .map(|entry| entry.parse::<Topic>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::InvalidValue {
            name: "KIS_SUBSCRIPTIONS".to_string(),
            reason: e.to_string(),
        })?;

    if topics.is_empty() {
        return Err(ConfigError::InvalidValue {
            name: "KIS_SUBSCRIPTIONS".to_string(),
            reason: "no topics listed".to_string(),
        });
    }
    Ok(topics)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<RelayConfig, ConfigError> {
        let vars: HashMap<&str, &str> = vars.iter().copied().collect();
        RelayConfig::from_lookup(|key| vars.get(key).map(|v| (*v).to_string()))
    }

    #[test]
    fn defaults_without_environment() {
        let config = config(&[]).unwrap();

        assert!(!config.has_credentials());
        assert_eq!(config.kis.subscriptions, vec![Topic::new("H0STNAV0", "102110")]);
        assert_eq!(config.kis.snapshot_interval, Duration::from_secs(300));
        assert_eq!(config.kis.margins.access, Duration::from_secs(60));
        assert_eq!(config.kis.margins.approval, Duration::from_secs(600));
        assert_eq!(config.kis.offset().local_minus_utc(), 9 * 3600);
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.ws_path, "/ws/kospi200");
        assert!(config.server.allowed_origins.is_empty());
        assert_eq!(config.websocket.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.websocket.reconnect_delay_max, Duration::from_secs(30));
        assert_eq!(config.snapshot_log_path(), PathBuf::from("data/snapshots.csv"));
        assert_eq!(config.credentials_dir(), PathBuf::from("data/credentials"));
    }

    #[test]
    fn overrides_are_applied() {
        let config = config(&[
            ("KIS_APP_KEY", "key"),
            ("KIS_APP_SECRET", "secret"),
            ("KIS_BASE_URL", "http://localhost:9443/"),
            ("KIS_SUBSCRIPTIONS", "H0STNAV0:102110, H0STCNT0:005930"),
            ("RELAY_ALLOWED_ORIGINS", "http://localhost:5173, https://dash.example"),
            ("RELAY_WS_PATH", "ws/feed"),
            ("RELAY_SEND_TIMEOUT_MS", "250"),
            ("KIS_CREDENTIAL_UTC_OFFSET_HOURS", "0"),
        ])
        .unwrap();

        let credentials = config.credentials.unwrap();
        assert_eq!(credentials.app_key(), "key");
        assert_eq!(config.kis.base_url, "http://localhost:9443");
        assert_eq!(config.kis.subscriptions.len(), 2);
        assert_eq!(config.kis.subscriptions[1], Topic::new("H0STCNT0", "005930"));
        assert_eq!(
            config.server.allowed_origins,
            vec!["http://localhost:5173".to_string(), "https://dash.example".to_string()]
        );
        assert_eq!(config.server.ws_path, "/ws/feed");
        assert_eq!(config.server.send_timeout, Duration::from_millis(250));
        assert_eq!(config.kis.offset().local_minus_utc(), 0);
    }

    #[test]
    fn malformed_numbers_fall_back_to_defaults() {
        let config = config(&[
            ("RELAY_PORT", "eighty"),
            ("RELAY_CLIENT_BUFFER", "0"),
            ("RELAY_RECONNECT_DELAY_MULTIPLIER", "0.5"),
            ("KIS_CREDENTIAL_UTC_OFFSET_HOURS", "99"),
        ])
        .unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.client_buffer, 1024);
        assert!((config.websocket.reconnect_delay_multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.kis.utc_offset_hours, 9);
    }

    #[test]
    fn malformed_subscription_is_rejected() {
        let err = config(&[("KIS_SUBSCRIPTIONS", "H0STNAV0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref name, .. } if name == "KIS_SUBSCRIPTIONS"));

        assert!(config(&[("KIS_SUBSCRIPTIONS", " , ")]).is_err());
    }

    #[test]
    fn blank_credentials_mean_degraded() {
        let config = config(&[("KIS_APP_KEY", "key"), ("KIS_APP_SECRET", "  ")]).unwrap();
        assert!(!config.has_credentials());
    }

    #[test]
    fn credential_errors_name_the_variable() {
        let missing = AppCredentials::from_lookup(|_| None).unwrap_err();
        assert_eq!(missing, ConfigError::MissingEnvVar("KIS_APP_KEY".to_string()));

        let empty = AppCredentials::new("key", "").unwrap_err();
        assert_eq!(empty, ConfigError::EmptyValue("KIS_APP_SECRET".to_string()));
    }

    #[test]
    fn credentials_redacted_debug() {
        let creds = AppCredentials::new("key123", "secret456").unwrap();
        let debug = format!("{creds:?}");
        assert!(!debug.contains("key123"));
        assert!(!debug.contains("secret456"));
        assert!(debug.contains("[REDACTED]"));
    }
}
