//! Health and Metrics HTTP Server
//!
//! Probes and Prometheus scrapes, served on their own port.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status (feed phase, consumers, snapshots)
//! - `GET /healthz` - liveness probe (simple OK)
//! - `GET /readyz` - readiness probe (feed streaming, or degraded by configuration)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{SnapshotSampler, SubscriberRegistry};
use crate::domain::streaming::FeedPhase;
use crate::infrastructure::coordinator::{RelayMode, RelayServices};
use crate::infrastructure::kis::{FeedState, FeedStatus};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Relay mode.
    pub mode: RelayMode,
    /// Relay version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream feed, absent when running degraded.
    pub feed: Option<FeedStatus>,
    /// Downstream consumers.
    pub clients: ClientStatus,
    /// Snapshot sampling.
    pub snapshots: SnapshotStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Feed is streaming.
    Healthy,
    /// Serving, but without live data.
    Degraded,
    /// Feed has stopped.
    Unhealthy,
}

/// Downstream consumer counts.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    /// Connected consumers.
    pub total: usize,
    /// Consumers receiving every topic.
    pub wildcard: usize,
    /// Distinct topics requested explicitly.
    pub topics: usize,
}

/// Snapshot sampler counters.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotStatus {
    /// Whether quotes are available.
    pub enabled: bool,
    /// Snapshots captured.
    pub captured: u64,
    /// Failed samples.
    pub failed: u64,
    /// Time of the last capture.
    pub last_captured_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    mode: RelayMode,
    registry: Arc<SubscriberRegistry>,
    feed: Option<Arc<FeedState>>,
    sampler: Option<Arc<SnapshotSampler>>,
}

impl HealthServerState {
    /// Create state reporting on `services`.
    #[must_use]
    pub fn new(
        version: impl Into<String>,
        registry: Arc<SubscriberRegistry>,
        services: &RelayServices,
    ) -> Self {
        let mode = if services.credentials.is_some() {
            RelayMode::Live
        } else {
            RelayMode::Degraded
        };
        Self {
            version: version.into(),
            started_at: Instant::now(),
            mode,
            registry,
            feed: services.feed.as_ref().map(|feed| feed.state()),
            sampler: services.sampler.clone(),
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Serves the probe and metrics routes.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a server on `port`, stopping when `cancel` fires.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Routes served by the health server.
    #[must_use]
    pub fn router(&self) -> Router {
        router(Arc::clone(&self.state))
    }

    /// Bind the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the server stops
    /// abnormally.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError::ServerFailed` if the server stops abnormally.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HealthServerError> {
        let app = self.router();
        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(status))
        .route("/healthz", get(live))
        .route("/readyz", get(ready))
        .route("/metrics", get(prometheus))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn status(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let report = report(&state);
    let code = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}

async fn live() -> &'static str {
    "OK"
}

async fn ready(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let phase = state.feed.as_ref().map(|feed| feed.phase());
    if is_ready(state.mode, phase) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

async fn prometheus() -> impl IntoResponse {
    match get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", PROMETHEUS_CONTENT_TYPE)],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain")],
            "metrics recorder not installed".to_string(),
        ),
    }
}

fn report(state: &HealthServerState) -> HealthResponse {
    let feed = state.feed.as_ref().map(|feed| feed.status());
    let subscriptions = state.registry.subscription_stats();
    let snapshots = state.sampler.as_ref().map_or(
        SnapshotStatus {
            enabled: false,
            captured: 0,
            failed: 0,
            last_captured_at: None,
        },
        |sampler| {
            let stats = sampler.stats();
            SnapshotStatus {
                enabled: sampler.is_enabled(),
                captured: stats.captured,
                failed: stats.failed,
                last_captured_at: stats.last_captured_at,
            }
        },
    );

    HealthResponse {
        status: determine_health_status(state.mode, feed.as_ref().map(|f| f.phase)),
        mode: state.mode,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        feed,
        clients: ClientStatus {
            total: subscriptions.connection_count,
            wildcard: subscriptions.wildcard_count,
            topics: subscriptions.topic_count,
        },
        snapshots,
    }
}

const fn determine_health_status(mode: RelayMode, phase: Option<FeedPhase>) -> HealthStatus {
    match (mode, phase) {
        (RelayMode::Live, Some(FeedPhase::Streaming)) => HealthStatus::Healthy,
        (RelayMode::Live, Some(FeedPhase::Stopped)) => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}

const fn is_ready(mode: RelayMode, phase: Option<FeedPhase>) -> bool {
    matches!(
        (mode, phase),
        (RelayMode::Degraded, _) | (RelayMode::Live, Some(FeedPhase::Streaming))
    )
}

// =============================================================================
// Errors
// =============================================================================

/// Health server failures.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// The port could not be bound.
    #[error("health server could not bind port {0}: {1}")]
    BindFailed(u16, String),

    /// axum stopped with an error.
    #[error("health server failed: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
