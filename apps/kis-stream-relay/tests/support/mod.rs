//! Fakes shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use kis_stream_relay::application::ports::{
    AuthError, CredentialIssuer, InboundFrame, IssuedCredential, TransportError,
    UpstreamConnector, UpstreamTransport,
};
use kis_stream_relay::domain::credential::exchange_offset;
use kis_stream_relay::infrastructure::kis::{FeedClientConfig, ReconnectConfig};
use kis_stream_relay::{CredentialCache, CredentialKind, SafetyMargins, Topic};

/// Issues numbered credentials and counts how many of each kind it issued.
#[derive(Default)]
pub struct CountingIssuer {
    pub access: AtomicUsize,
    pub approvals: AtomicUsize,
}

#[async_trait]
impl CredentialIssuer for CountingIssuer {
    async fn issue(&self, kind: CredentialKind) -> Result<IssuedCredential, AuthError> {
        let n = match kind {
            CredentialKind::Access => self.access.fetch_add(1, Ordering::SeqCst) + 1,
            CredentialKind::Approval => self.approvals.fetch_add(1, Ordering::SeqCst) + 1,
        };
        Ok(IssuedCredential {
            value: format!("{kind}-{n}"),
            lifetime: Duration::from_secs(3_600),
        })
    }
}

/// A credential cache over `issuer` with no durable store.
pub fn cache(issuer: &Arc<CountingIssuer>) -> Arc<CredentialCache> {
    Arc::new(CredentialCache::new(
        Arc::clone(issuer) as Arc<dyn CredentialIssuer>,
        None,
        SafetyMargins::default(),
        exchange_offset(),
    ))
}

pub type FrameSender = mpsc::UnboundedSender<Result<InboundFrame, TransportError>>;
type FrameReceiver = mpsc::UnboundedReceiver<Result<InboundFrame, TransportError>>;

/// Upstream connector whose sessions are fed by the test.
///
/// Each call to [`session`](Self::session) queues one future connection and
/// returns the sender that drives it. Dropping the sender closes that
/// connection. Connections beyond the queue stay silent.
#[derive(Default)]
pub struct ChannelConnector {
    sessions: Mutex<VecDeque<FrameReceiver>>,
    sent: Arc<Mutex<Vec<String>>>,
    connects: AtomicUsize,
}

impl ChannelConnector {
    pub fn session(&self) -> FrameSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().push_back(rx);
        tx
    }

    /// Every text frame the relay sent upstream, across sessions.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamConnector for ChannelConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn UpstreamTransport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let frames = self.sessions.lock().pop_front();
        Ok(Box::new(ChannelTransport {
            frames,
            sent: Arc::clone(&self.sent),
        }))
    }
}

struct ChannelTransport {
    frames: Option<FrameReceiver>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl UpstreamTransport for ChannelTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sent.lock().push(text);
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        match self.frames.as_mut() {
            Some(frames) => frames.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub fn text(frame: &str) -> Result<InboundFrame, TransportError> {
    Ok(InboundFrame::Text(frame.to_string()))
}

pub fn nav_topic() -> Topic {
    Topic::new("H0STNAV0", "102110")
}

/// Feed configuration with fast, jitter-free reconnects.
pub fn feed_config(topics: Vec<Topic>) -> FeedClientConfig {
    let mut config = FeedClientConfig::new("ws://upstream.test", "P", topics);
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
        jitter_factor: 0.0,
    };
    config
}

/// Poll `condition` every few milliseconds for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within two seconds");
}

// -- downstream server ---------------------------------------------------------

pub type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

pub const WS_PATH: &str = "/ws/kospi200";

/// Serve `registry` on an ephemeral local port.
pub async fn spawn_server(
    registry: Arc<kis_stream_relay::SubscriberRegistry>,
    cancel: tokio_util::sync::CancellationToken,
) -> std::net::SocketAddr {
    let settings = kis_stream_relay::infrastructure::config::ServerSettings {
        ws_path: WS_PATH.to_string(),
        client_buffer: 64,
        ..Default::default()
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = kis_stream_relay::RelayServer::new(&settings, registry, cancel);
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    addr
}

pub async fn connect(addr: std::net::SocketAddr, query: &str) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{WS_PATH}{query}"))
        .await
        .unwrap();
    client
}

/// Next text message, parsed as JSON. Skips control frames.
pub async fn next_json(client: &mut Client) -> serde_json::Value {
    use futures::StreamExt;
    use tokio_tungstenite::tungstenite::Message;

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                other => panic!("expected a text message, got {other:?}"),
            }
        }
    })
    .await
    .expect("no message within two seconds")
}

/// Wait for the close frame and return its code and reason.
pub async fn next_close(client: &mut Client) -> (u16, String) {
    use futures::StreamExt;
    use tokio_tungstenite::tungstenite::Message;

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(Some(frame)))) => {
                    return (u16::from(frame.code), frame.reason.as_str().to_string());
                }
                Some(Ok(Message::Text(_) | Message::Ping(_) | Message::Pong(_))) => {}
                other => panic!("expected a close frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("no close frame within two seconds")
}
