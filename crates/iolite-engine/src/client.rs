//! The client side: a mirror of the session's state tree, fed by
//! snapshots and deltas, plus a message-driven client that owns one end
//! of a channel.
//!
//! The mirror is authoritative-by-server: optimistic local values exist
//! only as an overlay and are overwritten - never merged - the moment a
//! real delta for that field arrives. A delta whose sequence number is
//! not exactly `last + 1` fails loudly with `SequenceGap`, and the client
//! answers with a resync request.

use crate::channel::{ClientEndpoint, ClientMessage, ServerMessage};
use crate::error::{EngineError, Result};
use iolite_delta::{DeltaMsg, EventMsg, Seq};
use iolite_dispatch::SessionNotice;
use iolite_state::Value;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Handle for an installed derived-view watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

type WatchFn = Box<dyn Fn(&Value) + Send + Sync>;

struct Watcher {
    id: WatchId,
    node: String,
    field: String,
    callback: WatchFn,
}

/// Local mirror of a session's state tree.
#[derive(Default)]
pub struct ClientStore {
    last_seq: Seq,
    nodes: BTreeMap<String, BTreeMap<String, Value>>,
    /// Optimistic overlay keyed by (node path, field).
    optimistic: BTreeMap<(String, String), Value>,
    watchers: Vec<Watcher>,
    next_watch: u64,
}

impl ClientStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the last applied delta (or snapshot baseline).
    pub fn last_seq(&self) -> Seq {
        self.last_seq
    }

    /// Read a field: the optimistic overlay wins until the authoritative
    /// value arrives.
    pub fn get(&self, node: &str, field: &str) -> Option<&Value> {
        if let Some(value) = self
            .optimistic
            .get(&(node.to_string(), field.to_string()))
        {
            return Some(value);
        }
        self.authoritative(node, field)
    }

    /// Read the server-confirmed value, ignoring the optimistic overlay.
    pub fn authoritative(&self, node: &str, field: &str) -> Option<&Value> {
        self.nodes.get(node).and_then(|fields| fields.get(field))
    }

    /// Node paths currently mirrored, in order.
    pub fn node_paths(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    /// Install an optimistic value for snappy local feedback. The
    /// authoritative value is whatever the next delta reports.
    pub fn set_optimistic(&mut self, node: &str, field: &str, value: Value) {
        self.optimistic
            .insert((node.to_string(), field.to_string()), value);
    }

    /// Register a derived view bound to one field; re-run on every
    /// applied change to it.
    pub fn watch(
        &mut self,
        node: &str,
        field: &str,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> WatchId {
        self.next_watch += 1;
        let id = WatchId(self.next_watch);
        self.watchers.push(Watcher {
            id,
            node: node.to_string(),
            field: field.to_string(),
            callback: Box::new(callback),
        });
        id
    }

    pub fn unwatch(&mut self, id: WatchId) {
        self.watchers.retain(|w| w.id != id);
    }

    /// Merge a delta. Fails with `SequenceGap` unless `seq == last + 1`;
    /// on success the touched optimistic entries are dropped (overwritten,
    /// never merged) and bound derived views re-run.
    pub fn apply(&mut self, delta: &DeltaMsg) -> Result<()> {
        let expected = self.last_seq + 1;
        if delta.seq != expected {
            return Err(EngineError::SequenceGap {
                expected,
                got: delta.seq,
            });
        }

        for (path, fields) in &delta.nodes {
            let entry = self.nodes.entry(path.clone()).or_default();
            for (field, value) in fields {
                self.optimistic.remove(&(path.clone(), field.clone()));
                entry.insert(field.clone(), value.clone());
            }
        }
        self.last_seq = delta.seq;
        self.fire_watchers(delta);
        Ok(())
    }

    /// Replace the whole mirror with a snapshot and reset the sequence
    /// baseline. Clears the optimistic overlay.
    pub fn apply_snapshot(&mut self, snapshot: &DeltaMsg) {
        self.nodes = snapshot.nodes.clone();
        self.optimistic.clear();
        self.last_seq = snapshot.seq;
        self.fire_watchers(snapshot);
    }

    fn fire_watchers(&self, delta: &DeltaMsg) {
        for watcher in &self.watchers {
            if let Some(value) = delta.field(&watcher.node, &watcher.field) {
                (watcher.callback)(value);
            }
        }
    }
}

impl std::fmt::Debug for ClientStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStore")
            .field("last_seq", &self.last_seq)
            .field("nodes", &self.nodes)
            .field("optimistic", &self.optimistic.len())
            .finish()
    }
}

/// Outcome of a connect/reconnect handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// New session (or snapshot resync): mirror replaced.
    Fresh { session_token: String },
    /// Same session resumed; retained deltas follow.
    Resumed { session_token: String },
}

/// A message-driven client: one channel end, one store.
pub struct Client {
    endpoint: ClientEndpoint,
    rx: mpsc::Receiver<ServerMessage>,
    store: ClientStore,
    session_token: Option<String>,
    notices: Vec<SessionNotice>,
}

impl Client {
    pub fn new(endpoint: ClientEndpoint) -> Self {
        let rx = endpoint.subscribe();
        Self {
            endpoint,
            rx,
            store: ClientStore::new(),
            session_token: None,
            notices: Vec::new(),
        }
    }

    pub fn store(&self) -> &ClientStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ClientStore {
        &mut self.store
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    /// Notices received so far (handler failures etc.).
    pub fn notices(&self) -> &[SessionNotice] {
        &self.notices
    }

    /// Open a fresh session (a brand-new tab: no token, no local state).
    pub async fn connect(&mut self) -> Result<ConnectOutcome> {
        self.handshake(None, None).await
    }

    /// Reconnect with a previous session token and the last applied
    /// sequence number.
    pub async fn reconnect(
        &mut self,
        session_token: impl Into<String>,
        last_seq: Seq,
    ) -> Result<ConnectOutcome> {
        self.handshake(Some(session_token.into()), Some(last_seq)).await
    }

    async fn handshake(
        &mut self,
        session_token: Option<String>,
        last_seq: Option<Seq>,
    ) -> Result<ConnectOutcome> {
        self.endpoint
            .send(ClientMessage::Connect {
                session_token,
                last_seq,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;

        loop {
            let msg = self.rx.recv().await.ok_or(EngineError::ChannelClosed)?;
            match msg {
                ServerMessage::Connected {
                    session_token,
                    snapshot,
                } => {
                    self.store.apply_snapshot(&snapshot);
                    self.session_token = Some(session_token.clone());
                    return Ok(ConnectOutcome::Fresh { session_token });
                }
                ServerMessage::Resumed { session_token } => {
                    self.session_token = Some(session_token.clone());
                    return Ok(ConnectOutcome::Resumed { session_token });
                }
                other => self.handle(other).await?,
            }
        }
    }

    /// Emit an event to the engine.
    pub async fn emit(&self, handler_path: &str, args: Vec<Value>) -> Result<()> {
        let token = self
            .session_token
            .clone()
            .ok_or(EngineError::NotConnected)?;
        self.endpoint
            .send(ClientMessage::Event(EventMsg::new(token, handler_path, args)))
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Emit with an optimistic local value for one field.
    pub async fn emit_optimistic(
        &mut self,
        handler_path: &str,
        args: Vec<Value>,
        node: &str,
        field: &str,
        value: Value,
    ) -> Result<()> {
        self.store.set_optimistic(node, field, value);
        self.emit(handler_path, args).await
    }

    /// Receive and process one server message. Deltas are applied and
    /// acked; a sequence gap sends a resync request and surfaces the
    /// error to the caller.
    pub async fn process_next(&mut self) -> Result<ServerMessage> {
        let msg = self.rx.recv().await.ok_or(EngineError::ChannelClosed)?;
        self.handle(msg.clone()).await?;
        Ok(msg)
    }

    /// Process messages until the store satisfies a predicate. Sequence
    /// gaps are part of the resync flow here: the store recovers from the
    /// snapshot that follows.
    pub async fn process_until<F>(&mut self, predicate: F) -> Result<()>
    where
        F: Fn(&ClientStore) -> bool,
    {
        while !predicate(&self.store) {
            match self.process_next().await {
                Ok(_) => {}
                Err(EngineError::SequenceGap { .. }) => {
                    debug!("sequence gap; awaiting resync snapshot");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn handle(&mut self, msg: ServerMessage) -> Result<()> {
        match msg {
            ServerMessage::Delta(delta) => match self.store.apply(&delta) {
                Ok(()) => {
                    let _ = self
                        .endpoint
                        .send(ClientMessage::Ack { seq: delta.seq })
                        .await;
                    Ok(())
                }
                Err(err @ EngineError::SequenceGap { .. }) => {
                    warn!(%err, "delta discontinuity; requesting resync");
                    let _ = self.endpoint.send(ClientMessage::Resync).await;
                    Err(err)
                }
                Err(err) => Err(err),
            },
            ServerMessage::Connected {
                session_token,
                snapshot,
            } => {
                // Resync snapshot mid-stream: replace the mirror.
                self.store.apply_snapshot(&snapshot);
                self.session_token = Some(session_token);
                Ok(())
            }
            ServerMessage::Resumed { session_token } => {
                self.session_token = Some(session_token);
                Ok(())
            }
            ServerMessage::Notice(notice) => {
                self.notices.push(notice);
                Ok(())
            }
            ServerMessage::Pong => Ok(()),
        }
    }
}
