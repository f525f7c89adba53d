//! Sending half of the relay: one reconnecting connection, a FIFO outbox and
//! the transfer bookkeeping behind `send`.
//!
//! ```text
//!  send() ──► dedup check ──► begin ──► wait begin_ack ──► chunk* + end
//!                                 │          (bounded)          │
//!                                 ▼                             ▼
//!                             ┌───────────── outbox (FIFO) ─────────────┐
//!                             └──────────────────┬──────────────────────┘
//!                                                ▼
//!                  connection task: connect ► flush ► select{notify, ping, recv}
//!                                                │
//!             saved / already_saved ► ledger │ missing_chunks, decode ► one resend
//! ```
//!
//! A frame leaves the outbox only after the socket accepted it, so anything
//! not yet written when the connection drops is flushed, in order, by the
//! next connection.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tabpilot_core::{Command, Frame, Inbound, PilotError, Reply, Result, TransferMeta};

use crate::chunk::{self, Chunk};
use crate::ledger::DedupLedger;
use crate::socket::{Connector, Socket};

/// Failed ids remembered for [`RelayTransport::transfer_state`].
const RECENT_FAILURES: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    pub url: String,
    /// Raw bytes per chunk, before base64.
    pub chunk_size: usize,
    pub begin_ack_timeout: Duration,
    pub dedup_window: Duration,
    /// An in-flight transfer older than this may be superseded by an identical send.
    pub stale_after: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub heartbeat_interval: Duration,
    pub command_buffer: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765".into(),
            chunk_size: 60_000,
            begin_ack_timeout: Duration::from_secs(3),
            dedup_window: Duration::from_secs(300),
            stale_after: Duration::from_secs(60),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(20),
            command_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    BeginAcked,
    Sending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Queued,
    /// Identical content is in flight or was saved within the dedup window.
    Deduped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The receiver stored the payload. `path` is absent when it reported
    /// the content as already saved.
    Saved { id: String, path: Option<String> },
    Deduped { id: String },
    Failed { id: String, reason: String },
}

impl TransferOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, TransferOutcome::Saved { .. })
    }

    pub fn into_result(self) -> Result<Self> {
        match self {
            TransferOutcome::Failed { id, reason } => {
                Err(PilotError::TransferRejected { id, reason })
            }
            other => Ok(other),
        }
    }
}

/// Returned by [`RelayTransport::send`]. The final outcome follows a
/// `missing_chunks` or `decode` resend, so `id` is the id the transfer
/// started under.
#[derive(Debug)]
pub struct TransferHandle {
    pub id: String,
    pub status: SendStatus,
    pub chunks: usize,
    pub total_bytes: usize,
    outcome: oneshot::Receiver<TransferOutcome>,
}

impl TransferHandle {
    pub fn is_deduped(&self) -> bool {
        self.status == SendStatus::Deduped
    }

    pub async fn outcome(self) -> TransferOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => TransferOutcome::Failed {
                id: self.id,
                reason: "transport dropped the transfer".into(),
            },
        }
    }
}

struct InFlight {
    key: String,
    payload: Arc<str>,
    meta: TransferMeta,
    state: TransferState,
    started: Instant,
    is_retry: bool,
    outcome: Option<oneshot::Sender<TransferOutcome>>,
}

struct TransportState {
    in_flight: HashMap<String, InFlight>,
    ledger: DedupLedger,
    begin_waiters: HashMap<String, oneshot::Sender<()>>,
    outbox: VecDeque<String>,
    recent_failures: VecDeque<String>,
}

impl TransportState {
    fn new(dedup_window: Duration) -> Self {
        Self {
            in_flight: HashMap::new(),
            ledger: DedupLedger::new(dedup_window),
            begin_waiters: HashMap::new(),
            outbox: VecDeque::new(),
            recent_failures: VecDeque::new(),
        }
    }

    fn remember_failure(&mut self, id: String) {
        if self.recent_failures.len() == RECENT_FAILURES {
            self.recent_failures.pop_front();
        }
        self.recent_failures.push_back(id);
    }
}

struct Shared {
    settings: RelaySettings,
    connector: Arc<dyn Connector>,
    state: Mutex<TransportState>,
    outbox_ready: Notify,
    connected: AtomicBool,
    shutdown: CancellationToken,
    commands: mpsc::Sender<Command>,
}

/// Everything needed to put one transfer on the wire.
struct Outgoing {
    id: String,
    url: String,
    meta: TransferMeta,
    chunks: Vec<Chunk>,
    total_bytes: usize,
}

#[derive(Clone)]
pub struct RelayTransport {
    shared: Arc<Shared>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RelayTransport {
    /// Start the connection task. Commands decoded from inbound frames are
    /// delivered on the returned receiver.
    pub fn start(
        settings: RelaySettings,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::Receiver<Command>) {
        let (commands, command_rx) = mpsc::channel(settings.command_buffer.max(1));
        let state = TransportState::new(settings.dedup_window);
        let shared = Arc::new(Shared {
            settings,
            connector,
            state: Mutex::new(state),
            outbox_ready: Notify::new(),
            connected: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            commands,
        });

        let task = tokio::spawn(connection_loop(Arc::clone(&shared)));
        let transport = Self {
            shared,
            task: Arc::new(Mutex::new(Some(task))),
        };
        (transport, command_rx)
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.shared.settings
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Frames waiting for a connection.
    pub fn queued_frames(&self) -> usize {
        self.shared.state.lock().outbox.len()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight.len()
    }

    pub fn transfer_state(&self, id: &str) -> Option<TransferState> {
        let mut state = self.shared.state.lock();
        if let Some(entry) = state.in_flight.get(id) {
            return Some(entry.state);
        }
        if state.recent_failures.iter().any(|f| f == id) {
            return Some(TransferState::Failed);
        }
        if state.ledger.suppresses(id, Instant::now()) {
            return Some(TransferState::Completed);
        }
        None
    }

    /// Queue a non-transfer frame (e.g. `command_result`).
    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        let text = frame.to_text()?;
        self.shared.state.lock().outbox.push_back(text);
        self.shared.outbox_ready.notify_one();
        Ok(())
    }

    /// Relay `payload` under a content-derived id.
    ///
    /// Returns once `begin` was acknowledged (or its wait timed out) and the
    /// chunks and `end` are queued; await [`TransferHandle::outcome`] for the
    /// receiver's verdict.
    pub async fn send(
        &self,
        logical_key: &str,
        payload: &str,
        meta: TransferMeta,
    ) -> Result<TransferHandle> {
        if self.shared.shutdown.is_cancelled() {
            return Err(PilotError::Aborted("relay transport disposed".into()));
        }

        let id = chunk::stable_id(logical_key, payload, &meta);
        let chunks = chunk::split(payload, self.shared.settings.chunk_size);
        let total_bytes = payload.len();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        {
            let mut state = self.shared.state.lock();
            let now = Instant::now();

            let mut duplicate = state.ledger.suppresses(&id, now);
            if !duplicate {
                let stale_after = self.shared.settings.stale_after;
                let stale = match state.in_flight.get(&id) {
                    Some(entry) if now.duration_since(entry.started) < stale_after => {
                        duplicate = true;
                        false
                    }
                    Some(_) => true,
                    None => false,
                };
                if stale {
                    let superseded = state.in_flight.remove(&id).and_then(|old| old.outcome);
                    if let Some(tx) = superseded {
                        let _ = tx.send(TransferOutcome::Failed {
                            id: id.clone(),
                            reason: "superseded by a newer send".into(),
                        });
                    }
                    info!(id = %id, "relay: superseding stale transfer");
                }
            }

            if duplicate {
                debug!(id = %id, key = logical_key, "relay: send deduplicated");
                let _ = outcome_tx.send(TransferOutcome::Deduped { id: id.clone() });
                return Ok(TransferHandle {
                    id,
                    status: SendStatus::Deduped,
                    chunks: 0,
                    total_bytes,
                    outcome: outcome_rx,
                });
            }

            state.in_flight.insert(
                id.clone(),
                InFlight {
                    key: logical_key.to_string(),
                    payload: Arc::from(payload),
                    meta: meta.clone(),
                    state: TransferState::Pending,
                    started: now,
                    is_retry: false,
                    outcome: Some(outcome_tx),
                },
            );
        }

        let handle = TransferHandle {
            id: id.clone(),
            status: SendStatus::Queued,
            chunks: chunks.len(),
            total_bytes,
            outcome: outcome_rx,
        };

        let outgoing = Outgoing {
            id,
            url: logical_key.to_string(),
            meta,
            chunks,
            total_bytes,
        };
        if let Err(e) = transmit(&self.shared, outgoing).await {
            self.abandon(&handle.id, &e.to_string());
            return Err(e);
        }
        Ok(handle)
    }

    /// [`send`](Self::send), then wait up to `wait` for the receiver's
    /// verdict. A rejection, after its resend, surfaces as
    /// [`PilotError::TransferRejected`].
    pub async fn send_and_wait(
        &self,
        logical_key: &str,
        payload: &str,
        meta: TransferMeta,
        wait: Duration,
    ) -> Result<TransferOutcome> {
        let handle = self.send(logical_key, payload, meta).await?;
        let id = handle.id.clone();
        match tokio::time::timeout(wait, handle.outcome()).await {
            Ok(outcome) => outcome.into_result(),
            Err(_) => {
                warn!(id = %id, wait_s = wait.as_secs(), "relay: no verdict in time");
                Err(PilotError::TransportDisconnected(format!(
                    "no verdict for {id} from {} within {}s",
                    self.shared.settings.url,
                    wait.as_secs()
                )))
            }
        }
    }

    fn abandon(&self, id: &str, reason: &str) {
        let mut state = self.shared.state.lock();
        state.begin_waiters.remove(id);
        if let Some(tx) = state.in_flight.remove(id).and_then(|e| e.outcome) {
            let _ = tx.send(TransferOutcome::Failed {
                id: id.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    /// Close the connection, stop all timers and fail outstanding transfers.
    pub async fn dispose(&self) {
        self.shared.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let mut state = self.shared.state.lock();
        state.begin_waiters.clear();
        for (id, entry) in state.in_flight.drain() {
            if let Some(tx) = entry.outcome {
                let _ = tx.send(TransferOutcome::Failed {
                    id,
                    reason: "transport disposed".into(),
                });
            }
        }
        info!(queued = state.outbox.len(), "relay transport disposed");
    }
}

/// Queue `begin`, wait for its ack, then queue every chunk and `end` as one batch.
async fn transmit(shared: &Arc<Shared>, out: Outgoing) -> Result<()> {
    let begin = Frame::Begin {
        id: out.id.clone(),
        total: out.chunks.len(),
        total_bytes: out.total_bytes,
        url: out.url.clone(),
        meta: out.meta.clone(),
    }
    .to_text()?;

    let total = out.chunks.len();
    let mut batch = Vec::with_capacity(total + 1);
    for chunk in out.chunks {
        batch.push(
            Frame::Chunk {
                id: out.id.clone(),
                seq: chunk.seq,
                total,
                encoding: tabpilot_core::CHUNK_ENCODING.to_string(),
                data: chunk.data,
            }
            .to_text()?,
        );
    }
    batch.push(
        Frame::End {
            id: out.id.clone(),
            url: out.url,
            meta: out.meta,
        }
        .to_text()?,
    );

    let (ack_tx, ack_rx) = oneshot::channel();
    {
        let mut state = shared.state.lock();
        state.begin_waiters.insert(out.id.clone(), ack_tx);
        state.outbox.push_back(begin);
    }
    shared.outbox_ready.notify_one();
    debug!(id = %out.id, chunks = total, bytes = out.total_bytes, "relay: begin queued");

    let wait = shared.settings.begin_ack_timeout;
    tokio::select! {
        _ = shared.shutdown.cancelled() => {
            return Err(PilotError::Aborted("relay transport disposed".into()));
        }
        acked = tokio::time::timeout(wait, ack_rx) => {
            if acked.is_err() {
                warn!(
                    id = %out.id,
                    timeout_ms = wait.as_millis() as u64,
                    "relay: no begin_ack, sending chunks anyway"
                );
            }
        }
    }
    if shared.shutdown.is_cancelled() {
        return Err(PilotError::Aborted("relay transport disposed".into()));
    }

    {
        let mut state = shared.state.lock();
        state.begin_waiters.remove(&out.id);
        match state.in_flight.get_mut(&out.id) {
            Some(entry) => entry.state = TransferState::Sending,
            None => {
                debug!(id = %out.id, "relay: transfer settled before its chunks were queued");
                return Ok(());
            }
        }
        state.outbox.extend(batch);
    }
    shared.outbox_ready.notify_one();
    Ok(())
}

enum Disconnect {
    Shutdown,
    Lost(String),
}

async fn connection_loop(shared: Arc<Shared>) {
    let settings = &shared.settings;
    let mut backoff = settings.reconnect_min;

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        debug!(url = %settings.url, "relay: connecting");
        let connected = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            result = shared.connector.connect(&settings.url) => result,
        };

        match connected {
            Ok(mut socket) => {
                backoff = settings.reconnect_min;
                shared.connected.store(true, Ordering::SeqCst);
                info!(url = %settings.url, "relay connected");

                let reason = pump(&shared, socket.as_mut()).await;
                shared.connected.store(false, Ordering::SeqCst);
                socket.close().await;

                match reason {
                    Disconnect::Shutdown => break,
                    Disconnect::Lost(why) => {
                        let queued = shared.state.lock().outbox.len();
                        warn!(reason = %why, queued, "relay connection lost");
                    }
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "relay connect failed"
                );
            }
        }

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(settings.reconnect_max);
    }

    debug!("relay connection task stopped");
}

async fn pump(shared: &Arc<Shared>, socket: &mut dyn Socket) -> Disconnect {
    if let Err(e) = flush(shared, socket).await {
        return Disconnect::Lost(e.to_string());
    }

    let mut heartbeat = tokio::time::interval(shared.settings.heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return Disconnect::Shutdown,
            _ = shared.outbox_ready.notified() => {
                if let Err(e) = flush(shared, socket).await {
                    return Disconnect::Lost(e.to_string());
                }
            }
            _ = heartbeat.tick() => {
                let ping = Frame::Ping { t: chrono::Utc::now().timestamp_millis() };
                let sent = match ping.to_text() {
                    Ok(text) => socket.send(text).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    return Disconnect::Lost(format!("heartbeat failed: {e}"));
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(text)) => handle_inbound(shared, &text),
                Some(Err(e)) => return Disconnect::Lost(e.to_string()),
                None => return Disconnect::Lost("closed by peer".into()),
            },
        }
    }
}

/// Write queued frames in order. A frame is popped only after the socket took it.
async fn flush(shared: &Arc<Shared>, socket: &mut dyn Socket) -> Result<()> {
    loop {
        let next = shared.state.lock().outbox.front().cloned();
        let Some(text) = next else {
            return Ok(());
        };
        socket.send(text).await?;
        shared.state.lock().outbox.pop_front();
    }
}

fn handle_inbound(shared: &Arc<Shared>, text: &str) {
    match Inbound::parse(text) {
        Ok(Inbound::Reply(reply)) => handle_reply(shared, reply),
        Ok(Inbound::Command(command)) => {
            debug!(command = %command.command, "relay: command received");
            if let Err(e) = shared.commands.try_send(command) {
                warn!(error = %e, "relay: dropping command, host not keeping up");
            }
        }
        Ok(Inbound::Ping { t }) => trace!(?t, "relay: ping"),
        Ok(Inbound::Unknown(v)) => debug!(frame = %v, "relay: ignoring unknown frame"),
        Err(e) => warn!(error = %e, "relay: unreadable frame"),
    }
}

fn handle_reply(shared: &Arc<Shared>, reply: Reply) {
    match reply {
        Reply::BeginAck { id } => {
            let mut state = shared.state.lock();
            if let Some(waiter) = state.begin_waiters.remove(&id) {
                let _ = waiter.send(());
            }
            if let Some(entry) = state.in_flight.get_mut(&id) {
                if entry.state == TransferState::Pending {
                    entry.state = TransferState::BeginAcked;
                }
            }
            debug!(id = %id, "relay: begin acknowledged");
        }
        Reply::Ack { id, seq } => trace!(?id, ?seq, "relay: chunk ack"),
        Reply::Saved { id, saved } => complete(shared, &id, Some(saved)),
        Reply::Skipped { id: Some(id), reason } => {
            debug!(id = %id, reason = %reason, "relay: receiver skipped transfer");
            complete(shared, &id, None);
        }
        Reply::Skipped { id: None, reason } => {
            debug!(reason = %reason, "relay: skip without id");
        }
        Reply::Error {
            id: Some(id),
            error,
            missing,
            ..
        } => reject(shared, &id, &error, missing),
        Reply::Error { id: None, error, .. } => {
            warn!(error = %error, "relay: receiver error without id");
        }
    }
}

fn complete(shared: &Arc<Shared>, id: &str, path: Option<String>) {
    let mut state = shared.state.lock();
    state.ledger.record(id, Instant::now());
    state.begin_waiters.remove(id);

    match state.in_flight.remove(id) {
        Some(entry) => {
            info!(id = %id, key = %entry.key, saved = ?path, "relay: transfer saved");
            if let Some(tx) = entry.outcome {
                let _ = tx.send(TransferOutcome::Saved {
                    id: id.to_string(),
                    path,
                });
            }
        }
        None => debug!(id = %id, "relay: save confirmed for unknown transfer"),
    }
}

/// Receiver errors that earn the single automatic resend.
fn is_resendable(error: &str) -> bool {
    matches!(error, "missing_chunks" | "decode")
}

fn reject(shared: &Arc<Shared>, id: &str, error: &str, missing: Option<usize>) {
    let mut state = shared.state.lock();
    state.begin_waiters.remove(id);
    let Some(entry) = state.in_flight.remove(id) else {
        debug!(id = %id, error, "relay: rejection for unknown transfer");
        return;
    };

    if is_resendable(error) && !entry.is_retry {
        let meta = entry.meta.clone().with_salt(chunk::fresh_salt());
        let retry_id = chunk::stable_id(&entry.key, &entry.payload, &meta);
        let chunks = chunk::split(&entry.payload, shared.settings.chunk_size);
        warn!(
            id = %id,
            retry_id = %retry_id,
            error,
            missing = ?missing,
            "relay: receiver reported missing or invalid chunks, resending once"
        );

        let outgoing = Outgoing {
            id: retry_id.clone(),
            url: entry.key.clone(),
            meta: meta.clone(),
            chunks,
            total_bytes: entry.payload.len(),
        };
        state.in_flight.insert(
            retry_id.clone(),
            InFlight {
                key: entry.key,
                payload: entry.payload,
                meta,
                state: TransferState::Pending,
                started: Instant::now(),
                is_retry: true,
                outcome: entry.outcome,
            },
        );
        drop(state);

        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            if let Err(e) = transmit(&shared, outgoing).await {
                debug!(id = %retry_id, error = %e, "relay: resend abandoned");
            }
        });
        return;
    }

    let reason = match missing {
        Some(n) => format!("{error} ({n} missing)"),
        None => error.to_string(),
    };
    warn!(id = %id, reason = %reason, retried = entry.is_retry, "relay: transfer rejected");
    state.remember_failure(id.to_string());
    if let Some(tx) = entry.outcome {
        let _ = tx.send(TransferOutcome::Failed {
            id: id.to_string(),
            reason,
        });
    }
}
