//! Configuration Module
//!
//! Configuration loading for the relay service.

mod settings;

pub use settings::{
    AppCredentials, ConfigError, KisSettings, RelayConfig, ServerSettings, WebSocketSettings,
};
