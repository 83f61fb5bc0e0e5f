//! WebSocket Transport
//!
//! `tokio-tungstenite` implementation of the upstream connector and
//! transport ports.
//!
//! Protocol-level pings from the server are answered by tungstenite itself
//! on the next read or write, so they never surface as frames.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{InboundFrame, TransportError, UpstreamConnector, UpstreamTransport};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` and `wss://` connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl UpstreamConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn UpstreamTransport>, TransportError> {
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(status = %response.status(), "Upstream handshake complete");
        Ok(Box::new(WsTransport { stream }))
    }
}

/// One open upstream WebSocket.
#[derive(Debug)]
pub struct WsTransport {
    stream: Stream,
}

#[async_trait]
impl UpstreamTransport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.stream
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            };
            let frame = match message {
                Message::Text(text) => InboundFrame::Text(text.to_string()),
                Message::Binary(data) => InboundFrame::Binary(data.to_vec()),
                Message::Pong(_) => InboundFrame::Pong,
                Message::Close(close) => InboundFrame::Close(close.map(|c| c.reason.to_string())),
                Message::Ping(_) | Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Err(TransportError::Closed),
            Err(e) => Err(TransportError::Send(e.to_string())),
        }
    }
}
