//! Socket abstraction the transport sits on.
//!
//! The transport never touches a concrete WebSocket: it asks a [`Connector`]
//! for a fresh [`Socket`] on every (re)connect and owns that socket only from
//! its connection task.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use tabpilot_core::{PilotError, Result};

/// One live duplex text connection.
#[async_trait]
pub trait Socket: Send {
    /// Write one text frame. Returns only after the socket accepted it.
    async fn send(&mut self, text: String) -> Result<()>;

    /// Next inbound text frame; `None` once the peer closed.
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn close(&mut self);
}

/// Opens sockets to a URL.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Socket>>;
}

/// tokio-tungstenite client connector.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Socket>> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| PilotError::TransportDisconnected(format!("connect {url}: {e}")))?;
        Ok(Box::new(WsSocket { stream }))
    }
}

pub struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Socket for WsSocket {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| PilotError::TransportDisconnected(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(t)) => return Some(Ok(t.as_str().to_owned())),
                Ok(Message::Binary(b)) => {
                    return Some(
                        String::from_utf8(b.to_vec())
                            .map_err(|e| PilotError::Protocol(format!("binary frame: {e}"))),
                    );
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "relay socket closed by peer");
                    return None;
                }
                // tungstenite answers pings itself
                Ok(_) => continue,
                Err(e) => return Some(Err(PilotError::TransportDisconnected(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
