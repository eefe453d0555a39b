//! The abstract duplex transport consumed by the connection manager.
//!
//! The manager never dials sockets itself: it is handed a [`TransportFactory`]
//! and drives whatever [`Transport`] the factory opens. [`WsFactory`] is the
//! stock tokio-tungstenite implementation; tests substitute channel-backed
//! fakes at the same seam.

use async_trait::async_trait;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use crate::Result;
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A single frame on the wire.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text payload
    Text(String),
    /// Raw bytes (gzip-compressed envelopes travel as binary)
    Binary(Vec<u8>),
}

impl Frame {
    /// Raw bytes of the frame regardless of variant.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// Wrap an encoded payload: compressed output travels as binary,
    /// plain JSON as text.
    #[must_use]
    pub fn from_encoded(bytes: Vec<u8>) -> Self {
        if crate::compress::is_gzip(&bytes) {
            Self::Binary(bytes)
        } else {
            match String::from_utf8(bytes) {
                Ok(text) => Self::Text(text),
                Err(e) => Self::Binary(e.into_bytes()),
            }
        }
    }
}

/// An open duplex connection. Exclusively owned by the connection manager's
/// I/O task; nothing else may send on or close it.
#[async_trait]
pub trait Transport: Send {
    /// Transmit one frame.
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Await the next inbound frame. `Ok(None)` means the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>>;

    /// Close the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Opens transports on demand; the reconnect path calls this once per attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

/// WebSocket transport over tokio-tungstenite (`ws://` and `wss://`).
pub struct WsTransport {
    inner: WsStream,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
        };
        self.inner.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Frame::Text(text.to_string()))),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(Some(Frame::Binary(bytes.to_vec())));
                }
                Some(Ok(Message::Ping(payload))) => {
                    // Keepalive handled at this layer, invisible to the manager
                    self.inner.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.inner
            .close(None)
            .await
            .map_err(|_e| TransportError::Closed)?;
        Ok(())
    }
}

/// Factory dialing a fixed WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WsFactory {
    url: String,
}

impl WsFactory {
    #[must_use]
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl TransportFactory for WsFactory {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let (ws_stream, _) = connect_async(&self.url).await?;
        Ok(Box::new(WsTransport { inner: ws_stream }))
    }
}
