//! Transport channel abstraction.
//!
//! A channel is the persistent, session-scoped duplex link: events flow
//! in, deltas flow out, ordered and reliable for the lifetime of one
//! physical connection. Reconnection is a new channel bound to the same
//! session. The in-memory implementation backs tests, demos and
//! single-process embeddings; a websocket transport implements the same
//! trait at the process edge.

use async_trait::async_trait;
use iolite_delta::{DeltaMsg, EventMsg, Seq};
use iolite_dispatch::SessionNotice;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// Messages a client sends to the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Open or resume a session. A missing/stale token (or a client with
    /// no local state, e.g. a brand-new tab) yields a fresh session and a
    /// full snapshot.
    Connect {
        session_token: Option<String>,
        last_seq: Option<Seq>,
    },
    Event(EventMsg),
    /// Acknowledge receipt of deltas up to `seq`.
    Ack { seq: Seq },
    /// Request a full snapshot (e.g. after a detected sequence gap).
    Resync,
    Ping,
}

/// Messages the engine sends to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Session established (or resynced): here is your token and a full
    /// snapshot to mirror. Seq 0 for a fresh session, the current
    /// sequence number for a resync baseline.
    Connected {
        session_token: String,
        snapshot: DeltaMsg,
    },
    /// Reconnect accepted; retained deltas follow, no snapshot needed.
    Resumed { session_token: String },
    Delta(DeltaMsg),
    Notice(SessionNotice),
    Pong,
}

/// Transport error type.
#[derive(Error, Clone, Debug)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Server side of one physical connection.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Send a message to the client. Ordered and reliable while the
    /// connection lives.
    async fn send(&self, message: ServerMessage) -> Result<(), ChannelError>;

    /// Take the inbound message stream. Called once per connection.
    fn subscribe(&self) -> mpsc::Receiver<ClientMessage>;

    /// Tear down the physical connection.
    fn close(&self);
}

type SharedClientRx = Mutex<Option<mpsc::Receiver<ClientMessage>>>;
type SharedServerRx = Mutex<Option<mpsc::Receiver<ServerMessage>>>;

/// In-memory server end of a connection.
pub struct MemoryChannel {
    out_tx: mpsc::Sender<ServerMessage>,
    in_rx: SharedClientRx,
    closed: AtomicBool,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, message: ServerMessage) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.out_tx
            .send(message)
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    fn subscribe(&self) -> mpsc::Receiver<ClientMessage> {
        self.in_rx
            .lock()
            .take()
            .expect("subscribe can only be called once")
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// In-memory client end of a connection.
pub struct ClientEndpoint {
    in_tx: mpsc::Sender<ClientMessage>,
    out_rx: SharedServerRx,
}

impl ClientEndpoint {
    /// Send a message to the engine.
    pub async fn send(&self, message: ClientMessage) -> Result<(), ChannelError> {
        self.in_tx
            .send(message)
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    /// Take the server message stream. Called once per connection.
    pub fn subscribe(&self) -> mpsc::Receiver<ServerMessage> {
        self.out_rx
            .lock()
            .take()
            .expect("subscribe can only be called once")
    }
}

/// Build a connected in-memory duplex: the server end is handed to
/// [`crate::Engine::accept`], the client end to a [`crate::Client`].
pub fn memory_pair(buffer: usize) -> (MemoryChannel, ClientEndpoint) {
    let (out_tx, out_rx) = mpsc::channel(buffer);
    let (in_tx, in_rx) = mpsc::channel(buffer);
    (
        MemoryChannel {
            out_tx,
            in_rx: Mutex::new(Some(in_rx)),
            closed: AtomicBool::new(false),
        },
        ClientEndpoint {
            in_tx,
            out_rx: Mutex::new(Some(out_rx)),
        },
    )
}
