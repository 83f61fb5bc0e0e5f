//! Downstream WebSocket Server
//!
//! Accepts consumer connections on the configured path and attaches each one
//! to the [`SubscriberRegistry`].
//!
//! # Protocol
//!
//! - Connect: `GET {path}?topics=H0STNAV0:102110,...` (omit for all topics)
//! - Server → client: `{"type":"tick","data":"..."}` and
//!   `{"type":"snapshot_5min","data":{...}}`
//! - Client → server: `{"action":"subscribe"|"unsubscribe","topics":[...]}`
//!
//! Connections refused by the registry (disallowed origin, degraded mode)
//! are upgraded and immediately closed with code 1008 and the reason.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ConsumerSink, DownstreamSendError};
use crate::application::services::{CLOSE_POLICY_VIOLATION, SubscriberRegistry};
use crate::domain::streaming::{Topic, TopicParseError};
use crate::domain::subscription::{ConnectionId, TopicFilter};
use crate::infrastructure::config::ServerSettings;

/// Longest close reason allowed by RFC 6455.
const MAX_CLOSE_REASON_BYTES: usize = 123;

// =============================================================================
// Outbound Channel
// =============================================================================

/// A frame queued for one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized relay message.
    Text(Arc<str>),
    /// Close the socket.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// [`ConsumerSink`] backed by a bounded channel drained by the socket writer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Outbound>,
}

impl ChannelSink {
    /// Create a sink and the receiver its writer drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConsumerSink for ChannelSink {
    async fn send(&self, payload: Arc<str>) -> Result<(), DownstreamSendError> {
        self.tx.try_send(Outbound::Text(payload)).map_err(|e| match e {
            TrySendError::Full(_) => DownstreamSendError::BufferFull,
            TrySendError::Closed(_) => DownstreamSendError::Closed,
        })
    }

    async fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.try_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

// =============================================================================
// Client Commands
// =============================================================================

/// Text message a consumer may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientCommand {
    /// Add topics.
    Subscribe {
        /// `CHANNEL:INSTRUMENT` strings.
        topics: Vec<String>,
    },
    /// Remove topics.
    Unsubscribe {
        /// `CHANNEL:INSTRUMENT` strings.
        topics: Vec<String>,
    },
}

fn parse_topics<'a>(raw: impl IntoIterator<Item = &'a str>) -> Result<Vec<Topic>, TopicParseError> {
    raw.into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Topic::from_str)
        .collect()
}

// =============================================================================
// Server
// =============================================================================

#[derive(Debug)]
struct ServerState {
    registry: Arc<SubscriberRegistry>,
    client_buffer: usize,
    cancel: CancellationToken,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    topics: Option<String>,
}

/// Downstream WebSocket server.
#[derive(Debug)]
pub struct RelayServer {
    port: u16,
    path: String,
    state: Arc<ServerState>,
}

impl RelayServer {
    /// Create a server for `registry`. `cancel` stops the listener and
    /// every consumer task.
    #[must_use]
    pub fn new(
        settings: &ServerSettings,
        registry: Arc<SubscriberRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port: settings.port,
            path: settings.ws_path.clone(),
            state: Arc::new(ServerState {
                registry,
                client_buffer: settings.client_buffer,
                cancel,
            }),
        }
    }

    /// The axum router serving the WebSocket path.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.path, get(ws_handler))
            .with_state(Arc::clone(&self.state))
    }

    /// Bind the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if binding fails or the server stops abnormally.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Bind the configured port without serving yet.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::BindFailed` if the port is unavailable.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(self.port, e.to_string()))
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::ServerFailed` if the server stops abnormally.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener
            .local_addr()
            .map_err(|e| ServerError::ServerFailed(e.to_string()))?;
        tracing::info!(addr = %local, path = %self.path, "Relay WebSocket server listening");

        let cancel = self.state.cancel.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(|e| ServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Relay WebSocket server stopped");
        Ok(())
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let topics = match parse_topics(params.topics.as_deref().unwrap_or("").split(',')) {
        Ok(topics) => topics,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, origin, TopicFilter::from_topics(topics)))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<ServerState>,
    origin: Option<String>,
    filter: TopicFilter,
) {
    let (mut sender, mut receiver) = socket.split();
    let (sink, mut rx) = ChannelSink::channel(state.client_buffer);

    let id = match state.registry.connect(origin.as_deref(), Arc::new(sink), filter) {
        Ok(id) => id,
        Err(e) => {
            tracing::info!(origin = ?origin, reason = %e, "Refusing downstream consumer");
            let _ = sender
                .send(close_message(CLOSE_POLICY_VIOLATION, &e.to_string()))
                .await;
            return;
        }
    };

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Text(payload) => {
                    if sender.send(Message::Text(payload.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sender.send(close_message(code, &reason)).await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            () = state.cancel.cancelled() => break,
            _ = &mut writer => break,
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => handle_command(&state.registry, id, text.as_str()),
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.registry.disconnect(id);
    writer.abort();
}

fn handle_command(registry: &SubscriberRegistry, id: ConnectionId, text: &str) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            tracing::debug!(connection_id = %id, error = %e, "Ignoring unrecognized client message");
            return;
        }
    };

    let result = match &command {
        ClientCommand::Subscribe { topics } => parse_topics(topics.iter().map(String::as_str))
            .map(|topics| registry.subscribe(id, &topics)),
        ClientCommand::Unsubscribe { topics } => parse_topics(topics.iter().map(String::as_str))
            .map(|topics| registry.unsubscribe(id, &topics)),
    };

    match result {
        Ok(Ok(())) => tracing::debug!(connection_id = %id, command = ?command, "Client filter updated"),
        Ok(Err(e)) => tracing::debug!(connection_id = %id, error = %e, "Client filter update failed"),
        Err(e) => tracing::debug!(connection_id = %id, error = %e, "Client sent invalid topic"),
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: truncate_reason(reason).into(),
    }))
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

// =============================================================================
// Errors
// =============================================================================

/// Downstream server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
