//! KIS Open API Adapters
//!
//! Clients for the Korea Investment & Securities endpoints:
//!
//! - **Issuance**: access tokens and streaming approval keys (REST)
//! - **Streaming**: the real-time feed (WebSocket, pipe-delimited frames)
//! - **Quotes**: current-price inquiry (REST)

pub mod auth;
pub mod codec;
pub mod feed;
pub mod heartbeat;
pub mod messages;
pub mod quotes;
pub mod reconnect;
pub mod transport;

pub use auth::KisAuthClient;
pub use codec::{ControlFrame, FrameKind, HEARTBEAT_MARKER};
pub use feed::{FeedClientConfig, FeedError, FeedState, FeedStatus, UpstreamFeedClient};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor};
pub use messages::SubscribeRequest;
pub use quotes::KisQuoteClient;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use transport::{WsConnector, WsTransport};
