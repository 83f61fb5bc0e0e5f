//! KIS Stream Relay Binary
//!
//! Starts the market data relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin kis-stream-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Credentials
//! - `KIS_APP_KEY`, `KIS_APP_SECRET`: app credentials. When either is
//!   missing the relay starts degraded and refuses consumers.
//!
//! ## Optional
//! - `KIS_BASE_URL` / `KIS_WS_URL`: REST and WebSocket endpoints
//! - `KIS_SUBSCRIPTIONS`: comma-separated `CHANNEL:INSTRUMENT` topics
//! - `KIS_SNAPSHOT_STOCK_CODE`, `KIS_SNAPSHOT_INTERVAL_SECS`: snapshot sampling
//! - `RELAY_PORT`, `RELAY_WS_PATH`, `RELAY_ALLOWED_ORIGINS`: downstream server
//! - `RELAY_HEALTH_PORT`: health check HTTP port (default: 8082)
//! - `RELAY_DATA_DIR`: credential records and snapshot CSV (default: data)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kis_stream_relay::infrastructure::coordinator::registry_config;
use kis_stream_relay::infrastructure::kis::WsConnector;
use kis_stream_relay::infrastructure::telemetry;
use kis_stream_relay::{
    HealthServer, HealthServerState, RelayConfig, RelayCoordinator, RelayServer, RelayServices,
    SubscriberRegistry, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let telemetry_guard = telemetry::init();

    tracing::info!(
        span_export = telemetry_guard.is_exporting(),
        "Starting KIS stream relay"
    );

    let _metrics_handle = init_metrics();

    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let registry = Arc::new(SubscriberRegistry::new(registry_config(&config.server)));
    let services = RelayServices::from_config(&config, &registry, Arc::new(WsConnector::new()))
        .context("failed to assemble relay services")?;

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION"),
        Arc::clone(&registry),
        &services,
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let relay_server = RelayServer::new(&config.server, Arc::clone(&registry), shutdown_token.clone());
    let relay_listener = relay_server
        .bind()
        .await
        .context("relay WebSocket server could not start")?;
    tokio::spawn(async move {
        if let Err(e) = relay_server.serve(relay_listener).await {
            tracing::error!(error = %e, "Relay server error");
        }
    });

    let coordinator = RelayCoordinator::new(
        registry,
        services,
        config.supervisor_restart_delay,
        shutdown_token.child_token(),
    );
    let mode = coordinator.start().await;
    tracing::info!(mode = mode.as_str(), "Relay ready");

    await_shutdown().await;

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
    coordinator.shutdown(SHUTDOWN_TIMEOUT).await;
    shutdown_token.cancel();

    tracing::info!("Relay stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        credentials = config.has_credentials(),
        port = config.server.port,
        path = %config.server.ws_path,
        health_port = config.server.health_port,
        topics = config.kis.subscriptions.len(),
        snapshot_interval_secs = config.kis.snapshot_interval.as_secs(),
        "Configuration loaded"
    );
    tracing::debug!(
        base_url = %config.kis.base_url,
        ws_url = %config.kis.ws_url,
        data_dir = %config.data_dir.display(),
        "KIS endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for SIGTERM or SIGINT.
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
