//! Upstream Feed Client
//!
//! Owns the single persistent connection to the KIS streaming endpoint and
//! pushes every market data frame into the [`SubscriberRegistry`].
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> Streaming
//!      ^                                          |
//!      +---------- error / close / timeout -------+
//! ```
//!
//! - **Connecting**: get an approval key from the [`CredentialCache`] and
//!   open the transport (bounded by the connect timeout).
//! - **Subscribed**: send one subscribe frame per configured topic.
//! - **Streaming**: read frames, echo `PINGPONG` keep-alives upstream, relay
//!   everything else downstream, ping on the heartbeat interval.
//!
//! Any failure lands in `Disconnected`, waits out the backoff and starts
//! over. The loop only ends when the cancellation token fires, after which
//! the phase is `Stopped`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::codec::{self, FrameKind};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor};
use super::messages::SubscribeRequest;
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{
    AuthError, InboundFrame, TransportError, UpstreamConnector, UpstreamTransport,
};
use crate::application::services::{CredentialCache, SubscriberRegistry};
use crate::domain::credential::Credential;
use crate::domain::streaming::{FeedPhase, RelayMessage, Topic};
use crate::infrastructure::metrics;

/// Time allowed for unsubscribe and close on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// =============================================================================
// Error Type
// =============================================================================

/// Why an upstream session ended.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// No approval key could be obtained.
    #[error("approval credential unavailable: {0}")]
    Auth(#[from] AuthError),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Opening the transport took too long.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The upstream refused the approval key.
    #[error("approval key rejected: {0}")]
    ApprovalRejected(String),

    /// No traffic within the heartbeat tolerance.
    #[error("no upstream traffic for {0:?}")]
    HeartbeatTimeout(Duration),

    /// The upstream ended the stream.
    #[error("upstream closed the connection: {}", .0.as_deref().unwrap_or("no reason given"))]
    Closed(Option<String>),

    /// A subscribe frame could not be encoded.
    #[error("failed to encode subscribe frame: {0}")]
    Encode(String),
}

impl FeedError {
    /// Label used in metrics.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Transport(_) => "transport",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::ApprovalRejected(_) => "approval_rejected",
            Self::HeartbeatTimeout(_) => "heartbeat_timeout",
            Self::Closed(_) => "closed",
            Self::Encode(_) => "encode",
        }
    }
}

// =============================================================================
// Feed State
// =============================================================================

/// Point-in-time view of the feed, for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedStatus {
    /// Current phase.
    pub phase: FeedPhase,
    /// Text frames read from upstream, keep-alives included.
    pub frames_received: u64,
    /// `PINGPONG` frames filtered out.
    pub heartbeats_filtered: u64,
    /// Reconnect attempts since start.
    pub reconnect_attempts: u64,
    /// Most recent session error.
    pub last_error: Option<String>,
    /// When the feed last reached streaming.
    pub last_streaming_at: Option<DateTime<Utc>>,
}

/// Shared, observable feed state.
#[derive(Debug)]
pub struct FeedState {
    phase: RwLock<FeedPhase>,
    transitions: broadcast::Sender<FeedPhase>,
    frames_received: AtomicU64,
    heartbeats_filtered: AtomicU64,
    reconnect_attempts: AtomicU64,
    last_error: RwLock<Option<String>>,
    last_streaming_at: RwLock<Option<DateTime<Utc>>>,
}

impl Default for FeedState {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedState {
    /// Create state in `Disconnected`.
    #[must_use]
    pub fn new() -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            phase: RwLock::new(FeedPhase::Disconnected),
            transitions,
            frames_received: AtomicU64::new(0),
            heartbeats_filtered: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            last_error: RwLock::new(None),
            last_streaming_at: RwLock::new(None),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> FeedPhase {
        *self.phase.read()
    }

    /// Receive every phase change from now on.
    #[must_use]
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<FeedPhase> {
        self.transitions.subscribe()
    }

    /// Snapshot for health reporting.
    #[must_use]
    pub fn status(&self) -> FeedStatus {
        FeedStatus {
            phase: self.phase(),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            heartbeats_filtered: self.heartbeats_filtered.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
            last_streaming_at: *self.last_streaming_at.read(),
        }
    }

    fn transition(&self, next: FeedPhase) {
        let previous = std::mem::replace(&mut *self.phase.write(), next);
        if previous == next {
            return;
        }
        if next == FeedPhase::Streaming {
            *self.last_streaming_at.write() = Some(Utc::now());
        }
        metrics::set_feed_phase(next);
        tracing::debug!(from = %previous, to = %next, "Feed phase changed");
        // No receivers is fine.
        let _ = self.transitions.send(next);
    }

    fn record_error(&self, error: &FeedError) {
        *self.last_error.write() = Some(error.to_string());
        metrics::record_feed_error(error.error_type());
    }

    fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        metrics::record_frame_received();
    }

    fn record_heartbeat(&self) {
        self.heartbeats_filtered.fetch_add(1, Ordering::Relaxed);
        metrics::record_heartbeat_filtered();
    }

    fn record_reconnect(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        metrics::record_reconnect();
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Feed client settings.
#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    /// Streaming endpoint URL.
    pub url: String,
    /// Customer type for subscribe frames.
    pub custtype: String,
    /// Topics subscribed on every session.
    pub topics: Vec<Topic>,
    /// Backoff between sessions.
    pub reconnect: ReconnectConfig,
    /// Keep-alive settings.
    pub heartbeat: HeartbeatConfig,
    /// Limit on opening the transport.
    pub connect_timeout: Duration,
}

impl FeedClientConfig {
    /// Settings with default backoff and keep-alive.
    #[must_use]
    pub fn new(url: impl Into<String>, custtype: impl Into<String>, topics: Vec<Topic>) -> Self {
        Self {
            url: url.into(),
            custtype: custtype.into(),
            topics,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Feed Client
// =============================================================================

/// Upstream streaming client.
pub struct UpstreamFeedClient {
    config: FeedClientConfig,
    credentials: Arc<CredentialCache>,
    connector: Arc<dyn UpstreamConnector>,
    registry: Arc<SubscriberRegistry>,
    state: Arc<FeedState>,
    force_approval: AtomicBool,
}

impl UpstreamFeedClient {
    /// Create a client. Nothing connects until [`run`](Self::run).
    #[must_use]
    pub fn new(
        config: FeedClientConfig,
        credentials: Arc<CredentialCache>,
        connector: Arc<dyn UpstreamConnector>,
        registry: Arc<SubscriberRegistry>,
    ) -> Self {
        Self {
            config,
            credentials,
            connector,
            registry,
            state: Arc::new(FeedState::new()),
            force_approval: AtomicBool::new(false),
        }
    }

    /// Shared state handle.
    #[must_use]
    pub fn state(&self) -> Arc<FeedState> {
        Arc::clone(&self.state)
    }

    /// Run sessions until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        while !cancel.is_cancelled() {
            let Err(error) = self.session(&cancel, &mut policy).await else {
                break;
            };

            self.state.record_error(&error);
            self.state.transition(FeedPhase::Disconnected);

            let delay = policy.next_delay();
            self.state.record_reconnect();
            tracing::warn!(
                error = %error,
                attempt = policy.attempt_count(),
                delay_ms = delay.as_millis(),
                "Upstream session ended, reconnecting"
            );

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.state.transition(FeedPhase::Stopped);
        tracing::info!("Upstream feed stopped");
    }

    /// One connect-subscribe-stream cycle. `Ok` means cancelled.
    async fn session(
        &self,
        cancel: &CancellationToken,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), FeedError> {
        self.state.transition(FeedPhase::Connecting);

        let force = self.force_approval.swap(false, Ordering::AcqRel);
        let approval = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            result = self.credentials.approval_credential(force) => result.inspect_err(|_| {
                if force {
                    self.force_approval.store(true, Ordering::Release);
                }
            })?,
        };

        tracing::info!(url = %self.config.url, "Connecting to upstream feed");
        let mut transport = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            result = tokio::time::timeout(
                self.config.connect_timeout,
                self.connector.connect(&self.config.url),
            ) => result.map_err(|_| FeedError::ConnectTimeout(self.config.connect_timeout))??,
        };

        self.state.transition(FeedPhase::Subscribed);
        let subscribed = tokio::select! {
            () = cancel.cancelled() => None,
            result = self.subscribe_all(transport.as_mut(), &approval) => Some(result),
        };
        match subscribed {
            None => {
                self.shutdown(transport.as_mut(), &approval).await;
                return Ok(());
            }
            Some(Err(e)) => {
                let _ = transport.close().await;
                return Err(e);
            }
            Some(Ok(())) => {}
        }

        self.state.transition(FeedPhase::Streaming);
        tracing::info!(topics = self.config.topics.len(), "Upstream feed streaming");

        let result = self.stream(transport.as_mut(), cancel, policy).await;
        if result.is_ok() {
            self.shutdown(transport.as_mut(), &approval).await;
        } else if let Err(e) = transport.close().await {
            tracing::debug!(error = %e, "Closing failed upstream connection");
        }
        result
    }

    async fn subscribe_all(
        &self,
        transport: &mut dyn UpstreamTransport,
        approval: &Credential,
    ) -> Result<(), FeedError> {
        for topic in &self.config.topics {
            let frame = SubscribeRequest::subscribe(approval.value(), &self.config.custtype, topic)
                .to_json()
                .map_err(|e| FeedError::Encode(e.to_string()))?;
            transport.send_text(frame).await?;
            tracing::debug!(topic = %topic, "Subscribe frame sent");
        }
        Ok(())
    }

    async fn stream(
        &self,
        transport: &mut dyn UpstreamTransport,
        cancel: &CancellationToken,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), FeedError> {
        let mut heartbeat = HeartbeatMonitor::new(self.config.heartbeat.clone());
        // Backoff resets only once the upstream has accepted a frame.
        let mut proven = false;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                event = heartbeat.tick() => match event {
                    HeartbeatEvent::SendPing => transport.send_ping().await?,
                    HeartbeatEvent::Timeout(silent) => return Err(FeedError::HeartbeatTimeout(silent)),
                },
                frame = transport.next_frame() => {
                    let Some(frame) = frame else {
                        return Err(FeedError::Closed(None));
                    };
                    heartbeat.record_activity();
                    match frame? {
                        InboundFrame::Text(text) => {
                            self.handle_text(transport, text).await?;
                            if !proven {
                                proven = true;
                                policy.reset();
                            }
                        }
                        InboundFrame::Binary(data) => {
                            tracing::debug!(bytes = data.len(), "Ignoring binary upstream frame");
                        }
                        InboundFrame::Pong => {}
                        InboundFrame::Close(reason) => return Err(FeedError::Closed(reason)),
                    }
                }
            }
        }
    }

    async fn handle_text(
        &self,
        transport: &mut dyn UpstreamTransport,
        text: String,
    ) -> Result<(), FeedError> {
        self.state.record_frame();

        let topic = match codec::classify(&text) {
            FrameKind::Heartbeat => {
                self.state.record_heartbeat();
                transport.send_text(text).await?;
                return Ok(());
            }
            FrameKind::Control(control) => {
                if control.is_approval_rejection() {
                    self.force_approval.store(true, Ordering::Release);
                    return Err(FeedError::ApprovalRejected(control.message().to_string()));
                }
                if control.is_rejection() {
                    tracing::warn!(
                        topic = ?control.topic(),
                        message = control.message(),
                        "Upstream rejected a request"
                    );
                } else {
                    tracing::info!(
                        topic = ?control.topic(),
                        message = control.message(),
                        "Upstream acknowledged"
                    );
                }
                control.topic()
            }
            FrameKind::Data { topic } => topic,
        };

        self.registry
            .broadcast(topic.as_ref(), &RelayMessage::Tick(text))
            .await;
        Ok(())
    }

    async fn shutdown(&self, transport: &mut dyn UpstreamTransport, approval: &Credential) {
        let release = async {
            for topic in &self.config.topics {
                let frame =
                    SubscribeRequest::unsubscribe(approval.value(), &self.config.custtype, topic);
                if let Ok(json) = frame.to_json()
                    && transport.send_text(json).await.is_err()
                {
                    break;
                }
            }
            let _ = transport.close().await;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, release).await.is_err() {
            tracing::warn!("Upstream did not close within the shutdown grace period");
        }
    }
}

impl std::fmt::Debug for UpstreamFeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamFeedClient")
            .field("url", &self.config.url)
            .field("topics", &self.config.topics)
            .field("phase", &self.state.phase())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
