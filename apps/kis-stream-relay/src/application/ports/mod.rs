//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`CredentialIssuer`]: network issuance of access/approval credentials
//! - [`CredentialStore`]: durable same-day credential reuse
//! - [`UpstreamConnector`] / [`UpstreamTransport`]: the streaming socket
//! - [`QuoteSource`]: REST price quotes
//! - [`SnapshotLog`]: append-only snapshot persistence
//! - [`ConsumerSink`]: one downstream consumer connection

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::credential::{Credential, CredentialKind};
use crate::domain::streaming::{PriceQuote, Snapshot};

// =============================================================================
// Credentials
// =============================================================================

/// A freshly issued credential before it is stamped with timestamps.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    /// Token or key.
    pub value: String,
    /// How long the issuer says it is valid.
    pub lifetime: Duration,
}

impl fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("value", &"[REDACTED]")
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

/// Issues credentials over the network.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Request a new credential of the given kind.
    async fn issue(&self, kind: CredentialKind) -> Result<IssuedCredential, AuthError>;
}

/// Persists one credential record per kind.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the stored credential, if any.
    async fn load(&self, kind: CredentialKind) -> Result<Option<Credential>, StoreError>;

    /// Replace the stored credential.
    async fn save(&self, kind: CredentialKind, credential: &Credential) -> Result<(), StoreError>;
}

// =============================================================================
// Upstream Feed
// =============================================================================

/// A frame read from the upstream transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Reply to a keep-alive ping.
    Pong,
    /// Peer closed the connection, with an optional reason.
    Close(Option<String>),
}

/// Opens upstream streaming connections.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Open a connection to `url`.
    async fn connect(&self, url: &str) -> Result<Box<dyn UpstreamTransport>, TransportError>;
}

/// One open upstream connection.
#[async_trait]
pub trait UpstreamTransport: Send {
    /// Send a text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Send a keep-alive ping.
    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Read the next frame. `None` means the stream ended.
    ///
    /// Must be cancel safe: dropping the future loses no frame.
    async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

// =============================================================================
// Quotes and Snapshots
// =============================================================================

/// Fetches REST price quotes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Fetch the current quote for a stock code.
    async fn fetch_quote(&self, stock_code: &str) -> Result<PriceQuote, QuoteError>;
}

/// Append-only snapshot storage.
#[async_trait]
pub trait SnapshotLog: Send + Sync {
    /// Append one snapshot.
    async fn append(&self, snapshot: &Snapshot) -> Result<(), SnapshotLogError>;
}

// =============================================================================
// Downstream
// =============================================================================

/// One downstream consumer connection.
#[async_trait]
pub trait ConsumerSink: Send + Sync {
    /// Deliver a serialized message.
    async fn send(&self, payload: Arc<str>) -> Result<(), DownstreamSendError>;

    /// Close the connection with a WebSocket close code and reason.
    async fn close(&self, code: u16, reason: &str);
}

// =============================================================================
// Errors
// =============================================================================

/// Credential issuance failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// App key/secret are not configured.
    #[error("brokerage credentials are not configured")]
    NotConfigured,

    /// The issuer could not be reached.
    #[error("credential issuer unreachable: {0}")]
    Network(String),

    /// The issuer refused the request.
    #[error("{kind} credential rejected with HTTP {status}: {message}")]
    Rejected {
        /// Requested kind.
        kind: CredentialKind,
        /// HTTP status.
        status: u16,
        /// Issuer error code, when provided.
        code: Option<String>,
        /// Issuer message.
        message: String,
    },

    /// The issuer response could not be understood.
    #[error("malformed issuer response: {0}")]
    MalformedResponse(String),

    /// The issued credential is unusable.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
}

/// Durable credential store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem error.
    #[error("credential store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded.
    #[error("credential record is malformed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record decoded but describes an invalid credential.
    #[error("credential record is invalid: {0}")]
    Invalid(String),
}

/// Upstream transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not open the connection.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading a frame failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// The connection is already closed.
    #[error("connection closed")]
    Closed,
}

/// REST quote failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuoteError {
    /// Could not obtain an access credential.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Request failed in transit.
    #[error("quote request failed: {0}")]
    Network(String),

    /// The access token was rejected as expired.
    #[error("access token expired")]
    TokenExpired,

    /// The API returned an error result.
    #[error("quote API error {code}: {message}")]
    Api {
        /// Brokerage message code.
        code: String,
        /// Brokerage message.
        message: String,
    },

    /// The response could not be understood.
    #[error("malformed quote response: {0}")]
    Malformed(String),
}

/// Snapshot log failure.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotLogError {
    /// Filesystem error.
    #[error("snapshot log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Delivery to one downstream consumer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DownstreamSendError {
    /// The consumer's outbound buffer is full.
    #[error("consumer buffer is full")]
    BufferFull,

    /// The consumer went away.
    #[error("consumer connection closed")]
    Closed,

    /// Delivery did not complete in time.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}
