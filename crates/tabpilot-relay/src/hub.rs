//! Relay hub: the WebSocket server agents connect to.
//!
//! Every client shares one [`Assembler`]. The lock around it is only held
//! for bookkeeping; completed documents are written after it is released.
//! Operator commands are broadcast to all connected clients;
//! `command_result` frames coming back are logged.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tabpilot_core::{Command, Frame, PilotError, Result};

use crate::assembler::{Assembler, AssemblerSettings, Verdict};

/// How often stale assemblies are swept.
const EVICT_INTERVAL: Duration = Duration::from_secs(30);

struct HubInner {
    assembler: Mutex<Assembler>,
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
    next_client: AtomicU64,
}

#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<HubInner>,
}

impl RelayHub {
    pub fn new(settings: AssemblerSettings) -> Self {
        Self {
            inner: Arc::new(HubInner {
                assembler: Mutex::new(Assembler::new(settings)),
                clients: Mutex::new(HashMap::new()),
                next_client: AtomicU64::new(1),
            }),
        }
    }

    pub async fn bind(listen: &str) -> Result<TcpListener> {
        TcpListener::bind(listen)
            .await
            .map_err(|e| PilotError::Config(format!("failed to bind {listen}: {e}")))
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Send `command` to every connected client. Returns how many took it.
    pub fn broadcast(&self, command: &Command) -> usize {
        let text = match serde_json::to_string(command) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "hub: failed to encode command");
                return 0;
            }
        };
        let clients = self.inner.clients.lock();
        let delivered = clients
            .values()
            .filter(|tx| tx.send(text.clone()).is_ok())
            .count();
        info!(command = %command.command, delivered, "hub: command broadcast");
        delivered
    }

    /// Accept clients until `shutdown` fires.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr()?;
        info!(listen = %local, "relay hub listening");

        let mut sweep = tokio::time::interval(EVICT_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    let evicted = self.inner.assembler.lock().evict_stale(Instant::now());
                    if evicted > 0 {
                        info!(evicted, "hub: dropped stale partial transfers");
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let hub = self.clone();
                        let token = shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = hub.serve_client(stream, peer, token).await {
                                warn!(peer = %peer, error = %e, "hub: client session ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "hub: accept failed"),
                },
            }
        }

        info!("relay hub stopped");
        Ok(())
    }

    async fn serve_client(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| PilotError::TransportDisconnected(format!("handshake with {peer}: {e}")))?;
        let (mut write, mut read) = ws.split();

        let client_id = self.inner.next_client.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.inner.clients.lock().insert(client_id, tx.clone());
        info!(peer = %peer, client = client_id, "hub: client connected");

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write.close().await;
                    break Ok(());
                }
                outgoing = rx.recv() => {
                    let Some(text) = outgoing else { break Ok(()) };
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        break Err(PilotError::TransportDisconnected(e.to_string()));
                    }
                }
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = self.on_text(text.as_str(), client_id).await {
                            let _ = tx.send(reply);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Err(PilotError::TransportDisconnected(e.to_string())),
                },
            }
        };

        self.inner.clients.lock().remove(&client_id);
        info!(peer = %peer, client = client_id, "hub: client disconnected");
        result
    }

    /// Handle one text frame from a client; returns the reply text.
    async fn on_text(&self, text: &str, client: u64) -> Option<String> {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(client, error = %e, "hub: unreadable frame");
                return None;
            }
        };

        match frame {
            Frame::CommandResult {
                command,
                ok,
                detail,
            } => {
                info!(client, command = %command, ok, detail = ?detail, "hub: command result");
                None
            }
            Frame::Ping { t } => {
                debug!(client, t, "hub: ping");
                None
            }
            frame => {
                let verdict = self.inner.assembler.lock().accept(frame, Instant::now())?;
                let reply = match verdict {
                    Verdict::Reply(reply) => reply,
                    Verdict::Write(pending) => {
                        let result = pending.write().await;
                        self.inner.assembler.lock().written(pending, result)
                    }
                };
                Some(reply.to_text())
            }
        }
    }
}
