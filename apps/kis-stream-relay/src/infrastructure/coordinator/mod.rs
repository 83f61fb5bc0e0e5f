//! Relay Coordinator
//!
//! Wires the credential cache, upstream feed, snapshot sampler and
//! subscriber registry together and owns their lifecycle.
//!
//! # Modes
//!
//! - **Live**: app credentials are configured. An access token is fetched
//!   eagerly (failure is logged, not fatal), then the feed and sampler loops
//!   run under supervision.
//! - **Degraded**: no app credentials. Neither loop starts and the registry
//!   turns consumers away with an explanatory close.
//!
//! Supervised loops that panic or return while the relay is running are
//! restarted after the configured delay.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{AuthError, CredentialStore, QuoteError, QuoteSource, UpstreamConnector};
use crate::application::services::{
    CLOSE_GOING_AWAY, CredentialCache, OriginPolicy, RegistryConfig, SamplerConfig,
    SnapshotSampler, SubscriberRegistry,
};
use crate::infrastructure::config::{RelayConfig, ServerSettings};
use crate::infrastructure::kis::{
    FeedClientConfig, HeartbeatConfig, KisAuthClient, KisQuoteClient, ReconnectConfig,
    UpstreamFeedClient,
};
use crate::infrastructure::metrics;
use crate::infrastructure::persistence::{CsvSnapshotLog, FileCredentialStore};

/// Close reason sent to consumers while running degraded.
pub const DEGRADED_REASON: &str = "KIS credentials are not configured; market data is unavailable";

/// Close reason sent to consumers on shutdown.
pub const SHUTDOWN_REASON: &str = "relay shutting down";

// =============================================================================
// Mode
// =============================================================================

/// Whether the relay has upstream access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Feed and sampler are running.
    Live,
    /// No credentials; consumers are refused.
    Degraded,
}

impl RelayMode {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Degraded => "degraded",
        }
    }
}

// =============================================================================
// Services
// =============================================================================

/// The components the coordinator supervises.
///
/// `credentials == None` means the relay runs degraded.
#[derive(Debug, Clone)]
pub struct RelayServices {
    /// Credential cache, when app credentials are configured.
    pub credentials: Option<Arc<CredentialCache>>,
    /// Upstream feed client.
    pub feed: Option<Arc<UpstreamFeedClient>>,
    /// Snapshot sampler.
    pub sampler: Option<Arc<SnapshotSampler>>,
}

impl RelayServices {
    /// Build every component from configuration.
    ///
    /// # Errors
    ///
    /// Returns `AssemblyError` if an HTTP client cannot be constructed.
    pub fn from_config(
        config: &RelayConfig,
        registry: &Arc<SubscriberRegistry>,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Result<Self, AssemblyError> {
        let offset = config.kis.offset();

        let Some(app) = config.credentials.clone() else {
            let sampler = SnapshotSampler::new(
                sampler_config(config),
                None,
                Arc::clone(registry),
                Arc::new(CsvSnapshotLog::new(config.snapshot_log_path(), offset)),
            );
            return Ok(Self {
                credentials: None,
                feed: None,
                sampler: Some(Arc::new(sampler)),
            });
        };

        let issuer = KisAuthClient::new(&config.kis.base_url, app.clone())?;
        let store: Arc<dyn CredentialStore> =
            Arc::new(FileCredentialStore::new(config.credentials_dir(), offset));
        let credentials = Arc::new(CredentialCache::new(
            Arc::new(issuer),
            Some(store),
            config.kis.margins,
            offset,
        ));

        let quotes: Arc<dyn QuoteSource> = Arc::new(KisQuoteClient::new(
            &config.kis.base_url,
            app,
            &config.kis.custtype,
            Arc::clone(&credentials),
        )?);
        let sampler = SnapshotSampler::new(
            sampler_config(config),
            Some(quotes),
            Arc::clone(registry),
            Arc::new(CsvSnapshotLog::new(config.snapshot_log_path(), offset)),
        );

        let feed_config = FeedClientConfig {
            url: config.kis.ws_url.clone(),
            custtype: config.kis.custtype.clone(),
            topics: config.kis.subscriptions.clone(),
            reconnect: ReconnectConfig::from(&config.websocket),
            heartbeat: HeartbeatConfig::from(&config.websocket),
            connect_timeout: config.websocket.connect_timeout,
        };
        let feed = UpstreamFeedClient::new(
            feed_config,
            Arc::clone(&credentials),
            connector,
            Arc::clone(registry),
        );

        Ok(Self {
            credentials: Some(credentials),
            feed: Some(Arc::new(feed)),
            sampler: Some(Arc::new(sampler)),
        })
    }
}

fn sampler_config(config: &RelayConfig) -> SamplerConfig {
    SamplerConfig {
        interval: config.kis.snapshot_interval,
        stock_code: config.kis.snapshot_stock_code.clone(),
        day_offset: config.kis.offset(),
    }
}

/// Registry settings derived from the server configuration.
#[must_use]
pub fn registry_config(settings: &ServerSettings) -> RegistryConfig {
    RegistryConfig {
        send_timeout: settings.send_timeout,
        origins: OriginPolicy::allow_only(&settings.allowed_origins),
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Composition root and supervisor.
pub struct RelayCoordinator {
    registry: Arc<SubscriberRegistry>,
    services: RelayServices,
    restart_delay: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayCoordinator {
    /// Create a coordinator. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        services: RelayServices,
        restart_delay: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            services,
            restart_delay,
            cancel,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Operating mode implied by the configured services.
    #[must_use]
    pub const fn mode(&self) -> RelayMode {
        if self.services.credentials.is_some() {
            RelayMode::Live
        } else {
            RelayMode::Degraded
        }
    }

    /// The supervised services.
    #[must_use]
    pub const fn services(&self) -> &RelayServices {
        &self.services
    }

    /// Start background work for the current mode.
    pub async fn start(&self) -> RelayMode {
        let Some(credentials) = &self.services.credentials else {
            tracing::warn!("KIS credentials are not configured, running degraded");
            self.registry.set_unavailable(Some(DEGRADED_REASON.to_string()));
            return RelayMode::Degraded;
        };

        match credentials.access_credential().await {
            Ok(credential) => {
                tracing::info!(expires_at = %credential.expires_at(), "Access credential ready");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Initial access credential fetch failed, continuing");
            }
        }

        let mut tasks = Vec::new();
        if let Some(feed) = &self.services.feed {
            let feed = Arc::clone(feed);
            tasks.push(supervise("feed", self.cancel.clone(), self.restart_delay, move |token| {
                Arc::clone(&feed).run(token)
            }));
        }
        if let Some(sampler) = &self.services.sampler {
            let sampler = Arc::clone(sampler);
            tasks.push(supervise("sampler", self.cancel.clone(), self.restart_delay, move |token| {
                Arc::clone(&sampler).run(token)
            }));
        }
        self.tasks.lock().extend(tasks);

        tracing::info!("Relay started");
        RelayMode::Live
    }

    /// Refuse new consumers, close existing ones, stop background loops and
    /// wait up to `timeout` for them to finish.
    pub async fn shutdown(&self, timeout: Duration) {
        self.registry.set_unavailable(Some(SHUTDOWN_REASON.to_string()));
        let closed = self.registry.close_all(CLOSE_GOING_AWAY, SHUTDOWN_REASON).await;
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let pending = tasks.len();
        if tokio::time::timeout(timeout, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!(pending, "Background tasks did not stop in time");
        }
        tracing::info!(closed_consumers = closed, "Relay stopped");
    }
}

impl std::fmt::Debug for RelayCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCoordinator")
            .field("mode", &self.mode())
            .field("restart_delay", &self.restart_delay)
            .finish_non_exhaustive()
    }
}

/// Run `make(token)` until `cancel` fires, restarting it after `restart_delay`
/// whenever it panics or returns early.
pub fn supervise<F, Fut>(
    name: &'static str,
    cancel: CancellationToken,
    restart_delay: Duration,
    mut make: F,
) -> JoinHandle<()>
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let outcome = tokio::spawn(make(cancel.child_token())).await;
            if cancel.is_cancelled() {
                break;
            }
            match outcome {
                Ok(()) => tracing::error!(task = name, "Background task exited unexpectedly"),
                Err(e) if e.is_panic() => tracing::error!(task = name, "Background task panicked"),
                Err(e) => tracing::error!(task = name, error = %e, "Background task aborted"),
            }
            metrics::record_task_restart(name);

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(restart_delay) => {}
            }
            tracing::info!(task = name, "Restarting background task");
        }
    })
}

// =============================================================================
// Errors
// =============================================================================

/// Component construction failed.
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    /// Issuance client could not be built.
    #[error("failed to build credential issuer: {0}")]
    Issuer(#[from] AuthError),

    /// Quote client could not be built.
    #[error("failed to build quote client: {0}")]
    Quotes(#[from] QuoteError),
}

// =============================================================================
// Tests
// =============================================================================
