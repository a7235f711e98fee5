//! Two-ended message relay with replay-on-reconnect.
//!
//! Data flow:
//! ```text
//! worker ──send──► [to_client queue] ──receive──► client
//!                  in-flight map ◄── pending requests delivered to client
//!                  replay queue  ◄── in-flight moved here on client release
//! client ──send──► [to_worker queue] ──receive──► worker
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kbroker_core::message::{self, MessageHeader};

use super::types::{PipeError, PipeMessage, PipeStats};

struct Shared {
    /// Label used in logs, set when the worker end connects.
    label: OnceLock<String>,
    to_client_tx: mpsc::UnboundedSender<Bytes>,
    to_client_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    to_worker_tx: mpsc::UnboundedSender<Bytes>,
    to_worker_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    worker_taken: AtomicBool,
    client_connected: AtomicBool,
    /// Fired when the worker end is released.
    worker_gone: CancellationToken,
    /// Fired when the client side is gone for good.
    closed: CancellationToken,
    /// Requests delivered to the current client, keyed by message id.
    in_flight: DashMap<u64, Bytes>,
    /// Orphaned requests in original send order.
    replay: Mutex<VecDeque<Bytes>>,
    /// First message the worker ever delivered.
    handshake: OnceLock<Bytes>,
}

impl Shared {
    fn label(&self) -> &str {
        self.label.get().map_or("<unbound>", String::as_str)
    }

    fn track_if_pending(&self, bytes: &Bytes) {
        match MessageHeader::parse(bytes) {
            Ok(header) if header.is_pending_request() => {
                self.in_flight.insert(header.id, bytes.clone());
            }
            Ok(_) => {}
            Err(e) => {
                warn!(pipe = self.label(), error = %e, "Worker produced malformed message");
            }
        }
    }
}

/// Relay between one worker end and at most one client end at a time.
///
/// Cloning yields another handle to the same pipe.
#[derive(Clone)]
pub struct MessagePipe {
    shared: Arc<Shared>,
}

impl Default for MessagePipe {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagePipe {
    pub fn new() -> Self {
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (to_worker_tx, to_worker_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                label: OnceLock::new(),
                to_client_tx,
                to_client_rx: tokio::sync::Mutex::new(to_client_rx),
                to_worker_tx,
                to_worker_rx: tokio::sync::Mutex::new(to_worker_rx),
                worker_taken: AtomicBool::new(false),
                client_connected: AtomicBool::new(false),
                worker_gone: CancellationToken::new(),
                closed: CancellationToken::new(),
                in_flight: DashMap::new(),
                replay: Mutex::new(VecDeque::new()),
                handshake: OnceLock::new(),
            }),
        }
    }

    /// Connect the worker end. Only one worker end can ever exist per pipe.
    pub fn connect_worker(&self, id: impl Into<String>) -> Result<WorkerEnd, PipeError> {
        if self
            .shared
            .worker_taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipeError::AlreadyConnected { end: "worker" });
        }
        let _ = self.shared.label.set(id.into());
        debug!(pipe = self.shared.label(), "Worker end connected");
        Ok(WorkerEnd {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Connect a client end. Fails while another client end is alive.
    pub fn connect_client(&self) -> Result<ClientEnd, PipeError> {
        if self
            .shared
            .client_connected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipeError::AlreadyConnected { end: "client" });
        }
        info!(
            pipe = self.shared.label(),
            queued_replays = self.shared.replay.lock().len(),
            "Client end connected"
        );
        Ok(ClientEnd {
            shared: Arc::clone(&self.shared),
            first_receive: AtomicBool::new(true),
        })
    }

    /// Mark the client side as permanently gone.
    ///
    /// Worker-side receives fail with [`PipeError::Disconnected`] from now on.
    pub fn close(&self) {
        if !self.shared.closed.is_cancelled() {
            debug!(pipe = self.shared.label(), "Pipe closed");
            self.shared.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Whether the worker end has been released.
    pub fn is_worker_gone(&self) -> bool {
        self.shared.worker_gone.is_cancelled()
    }

    pub fn is_client_connected(&self) -> bool {
        self.shared.client_connected.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PipeStats {
        PipeStats {
            in_flight: self.shared.in_flight.len(),
            queued_replays: self.shared.replay.lock().len(),
            handshake_cached: self.shared.handshake.get().is_some(),
            client_connected: self.is_client_connected(),
        }
    }
}

/// Worker-facing end of a [`MessagePipe`].
pub struct WorkerEnd {
    shared: Arc<Shared>,
}

impl WorkerEnd {
    /// Queue a message for the client. Never blocks.
    pub fn send(&self, message: impl Into<Bytes>) {
        // The receiver lives in `Shared`, so the queue cannot be closed.
        let _ = self.shared.to_client_tx.send(message.into());
    }

    /// Wait for the next client-originated message.
    pub async fn receive(&self, cancel: &CancellationToken) -> Result<Bytes, PipeError> {
        let shared = &self.shared;
        if shared.worker_gone.is_cancelled() || shared.closed.is_cancelled() {
            return Err(PipeError::Disconnected);
        }
        let mut rx = shared.to_worker_rx.lock().await;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PipeError::Cancelled),
            () = shared.worker_gone.cancelled() => Err(PipeError::Disconnected),
            () = shared.closed.cancelled() => Err(PipeError::Disconnected),
            msg = rx.recv() => msg.ok_or(PipeError::Disconnected),
        }
    }

    /// Release this end. Idempotent.
    pub fn disconnect(&self) {
        if !self.shared.worker_gone.is_cancelled() {
            info!(pipe = self.shared.label(), "Worker end disconnected");
            self.shared.worker_gone.cancel();
        }
    }
}

impl Drop for WorkerEnd {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Client-facing end of a [`MessagePipe`]. Released on drop.
pub struct ClientEnd {
    shared: Arc<Shared>,
    first_receive: AtomicBool,
}

impl std::fmt::Debug for ClientEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEnd").finish_non_exhaustive()
    }
}

impl ClientEnd {
    /// Forward a message to the worker, updating request bookkeeping.
    pub fn send(&self, message: impl Into<Bytes>) -> Result<(), PipeError> {
        let message = message.into();
        let shared = &self.shared;
        let header = MessageHeader::parse(&message)
            .map_err(|e| PipeError::MalformedMessage(e.to_string()))?;
        if shared.worker_gone.is_cancelled() {
            return Err(PipeError::Disconnected);
        }

        if message::is_cancel_all(&message) {
            let mut replay = shared.replay.lock();
            let dropped = shared.in_flight.len() + replay.len();
            shared.in_flight.clear();
            replay.clear();
            debug!(pipe = shared.label(), dropped, "Client cancelled all requests");
        } else if header.is_reply() {
            let request = header.correlation_id;
            shared.in_flight.remove(&request);
            // Answered before the replay reached this client.
            shared
                .replay
                .lock()
                .retain(|queued| message::id(queued).ok() != Some(request));
        }

        shared
            .to_worker_tx
            .send(message)
            .map_err(|_| PipeError::Disconnected)
    }

    /// Receive the next message for the client.
    ///
    /// Order: cached handshake (first call only), orphaned requests, then
    /// fresh worker output.
    pub async fn receive(&self, cancel: &CancellationToken) -> Result<PipeMessage, PipeError> {
        let shared = &self.shared;
        if shared.worker_gone.is_cancelled() {
            return Err(PipeError::Disconnected);
        }

        if self.first_receive.swap(false, Ordering::AcqRel)
            && let Some(handshake) = shared.handshake.get()
        {
            return Ok(PipeMessage::replay(handshake.clone()));
        }

        let replayed = shared.replay.lock().pop_front();
        if let Some(bytes) = replayed {
            shared.track_if_pending(&bytes);
            return Ok(PipeMessage::replay(bytes));
        }

        let bytes = {
            let mut rx = shared.to_client_rx.lock().await;
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PipeError::Cancelled),
                () = shared.worker_gone.cancelled() => return Err(PipeError::Disconnected),
                msg = rx.recv() => msg.ok_or(PipeError::Disconnected)?,
            }
        };

        let _ = shared.handshake.set(bytes.clone());
        shared.track_if_pending(&bytes);
        Ok(PipeMessage::fresh(bytes))
    }
}

impl Drop for ClientEnd {
    fn drop(&mut self) {
        let shared = &self.shared;
        let mut replay = shared.replay.lock();
        let mut orphaned: Vec<(u64, Bytes)> = shared
            .in_flight
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        shared.in_flight.clear();
        orphaned.extend(
            replay
                .drain(..)
                .filter_map(|bytes| message::id(&bytes).ok().map(|id| (id, bytes))),
        );
        orphaned.sort_by_key(|(id, _)| *id);
        let count = orphaned.len();
        replay.extend(orphaned.into_iter().map(|(_, bytes)| bytes));
        drop(replay);

        shared.client_connected.store(false, Ordering::Release);
        info!(pipe = shared.label(), orphaned = count, "Client end released");
    }
}
