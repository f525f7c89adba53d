//! In-process connector for tests and local wiring.
//!
//! Every successful `connect` produces a [`MemoryPeer`] on the channel
//! returned by [`MemoryConnector::new`]; dropping the peer closes the
//! connection from the far side.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use tabpilot_core::{Command, Frame, PilotError, Reply, Result};

use crate::socket::{Connector, Socket};

pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: AtomicUsize,
    attempts: Mutex<Vec<Instant>>,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers: tx,
            refuse: AtomicUsize::new(0),
            attempts: Mutex::new(Vec::new()),
        });
        (connector, rx)
    }

    /// Fail the next `n` connection attempts.
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Instants of every connection attempt, refused ones included.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Socket>> {
        self.attempts.lock().push(Instant::now());

        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(PilotError::TransportDisconnected(format!(
                "connection to {url} refused"
            )));
        }

        let (to_peer, from_client) = mpsc::unbounded_channel();
        let (to_client, from_peer) = mpsc::unbounded_channel();
        self.peers
            .send(MemoryPeer {
                from_client,
                to_client,
            })
            .map_err(|_| PilotError::TransportDisconnected("no listener for memory peers".into()))?;

        Ok(Box::new(MemorySocket {
            tx: Some(to_peer),
            rx: from_peer,
        }))
    }
}

struct MemorySocket {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Socket for MemorySocket {
    async fn send(&mut self, text: String) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| PilotError::TransportDisconnected("socket closed".into()))?;
        tx.send(text)
            .map_err(|_| PilotError::TransportDisconnected("peer went away".into()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

/// The far end of one in-memory connection.
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

impl MemoryPeer {
    /// Next raw text written by the client; `None` once it disconnected.
    pub async fn next_text(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next non-ping frame written by the client.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let text = self.next_text().await?;
            match Frame::parse(&text) {
                Ok(Frame::Ping { .. }) => continue,
                Ok(frame) => return Some(frame),
                Err(_) => continue,
            }
        }
    }

    /// Non-ping frames already written, without waiting.
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            if let Ok(frame) = Frame::parse(&text) {
                if !matches!(frame, Frame::Ping { .. }) {
                    frames.push(frame);
                }
            }
        }
        frames
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).is_ok()
    }

    pub fn reply(&self, reply: &Reply) -> bool {
        self.send_text(reply.to_text())
    }

    pub fn send_command(&self, command: &Command) -> bool {
        match serde_json::to_string(command) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }
}
