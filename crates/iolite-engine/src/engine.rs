//! The engine: accepts connections, runs the handshake, and routes
//! inbound traffic into per-session queues.
//!
//! Connection protocol:
//! - The client opens with `Connect { session_token?, last_seq? }`.
//!   Events arriving before the handshake completes are buffered and
//!   replayed into the queue afterwards, never dropped.
//! - A missing or stale token creates a fresh session and answers
//!   `Connected` with the seq-0 snapshot.
//! - A valid token resumes: if the delta log still covers the client's
//!   `last_seq`, the server answers `Resumed` and replays retained
//!   deltas; otherwise it answers `Connected` with a snapshot tagged
//!   with the current sequence number.
//! - Disconnects leave the session intact; the idle sweeper reclaims
//!   sessions that never come back.

use crate::channel::{Channel, ClientMessage, ServerMessage};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::session::{spawn_sweeper, SessionEntry, SessionManager};
use iolite_delta::{encode_snapshot, EventMsg, Seq};
use iolite_dispatch::{DispatchConfig, Dispatcher, HandlerRegistry, TaskId};
use iolite_state::{NodeSchema, StateTree, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The reactive state synchronization engine.
///
/// One engine serves many independent sessions; the schema and handler
/// registry are fixed at construction (dependency injection, no global
/// registries).
pub struct Engine {
    manager: Arc<SessionManager>,
    sweeper: JoinHandle<()>,
}

impl Engine {
    /// Build an engine from a schema, a handler registry and a config.
    /// Schema problems (dependency cycles, bad defaults, unknown computed
    /// inputs) surface here, before any session exists.
    pub fn new(
        schema: NodeSchema,
        registry: HandlerRegistry,
        config: EngineConfig,
    ) -> Result<Self> {
        // Instantiate once so structural errors fail at startup.
        let _ = StateTree::instantiate(&schema)?;

        let dispatcher = Arc::new(Dispatcher::with_config(
            Arc::new(registry),
            DispatchConfig {
                lock_timeout: config.lock_timeout,
            },
        ));
        let manager = Arc::new(SessionManager::new(Arc::new(schema), dispatcher, config));
        let sweeper = spawn_sweeper(manager.clone());
        Ok(Self { manager, sweeper })
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.manager.len()
    }

    /// Accept one physical connection. Returns immediately; the
    /// connection is served by a spawned task for its whole lifetime.
    pub fn accept<C: Channel>(&self, channel: C) {
        let manager = self.manager.clone();
        tokio::spawn(serve_connection(manager, Arc::new(channel)));
    }

    /// Submit a background handler directly (server-side), returning the
    /// task id for cancellation.
    pub fn submit_background(
        &self,
        session_token: &str,
        handler_path: &str,
        args: Vec<Value>,
    ) -> Result<TaskId> {
        let entry = self
            .manager
            .get(session_token)
            .ok_or_else(|| EngineError::SessionNotFound(session_token.to_string()))?;
        Ok(self
            .manager
            .dispatcher()
            .submit_background(entry.core(), handler_path, args)?)
    }

    /// Cancel a background task.
    pub fn cancel_task(&self, session_token: &str, task_id: TaskId) -> Result<bool> {
        let entry = self
            .manager
            .get(session_token)
            .ok_or_else(|| EngineError::SessionNotFound(session_token.to_string()))?;
        Ok(entry.core().cancel_task(task_id))
    }

    /// Save a session's state and sequence position as bytes. The
    /// save/load boundary for process restarts; the image format is an
    /// internal detail.
    pub async fn serialize_session(&self, session_token: &str) -> Result<Vec<u8>> {
        let entry = self
            .manager
            .get(session_token)
            .ok_or_else(|| EngineError::SessionNotFound(session_token.to_string()))?;
        let core = entry.core();
        let snapshot = {
            let mut tree = core.lock_state().await;
            encode_snapshot(core.token(), core.head_seq(), &mut tree)?
        };
        let image = SessionImage {
            token: core.token().to_string(),
            seq: snapshot.seq,
            nodes: snapshot.nodes,
        };
        Ok(serde_json::to_vec(&image)?)
    }

    /// Recreate a session from a saved image, returning its token. A
    /// still-live session under the same token is left untouched.
    pub async fn restore_session(&self, bytes: &[u8]) -> Result<String> {
        let image: SessionImage = serde_json::from_slice(bytes)?;
        if self.manager.get(&image.token).is_some() {
            return Ok(image.token);
        }

        let entry = self.manager.create_with_token(image.token.clone())?;
        let core = entry.core();
        {
            let mut tree = core.lock_state().await;
            for (path_str, fields) in &image.nodes {
                let path = iolite_state::NodePath::parse(path_str);
                if !tree.contains_node(&path) {
                    continue;
                }
                for (field, value) in fields {
                    // Computed fields re-derive from the restored inputs.
                    let is_plain = tree
                        .node(&path)
                        .map(|n| n.schema().fields.contains_key(field))
                        .unwrap_or(false);
                    if is_plain {
                        tree.set(&path, field, value.clone())?;
                    }
                }
            }
            // Settle baselines silently; the restored state is the new
            // flush baseline, not a delta.
            let _ = tree.flush_dirty()?;
        }
        core.rebase_log(image.seq);
        info!(session = %image.token, seq = image.seq, "session restored");
        Ok(image.token)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Serialized session image for the persistence boundary.
#[derive(Serialize, Deserialize)]
struct SessionImage {
    token: String,
    seq: Seq,
    nodes: BTreeMap<String, BTreeMap<String, Value>>,
}

/// Drive one physical connection from handshake to disconnect.
async fn serve_connection(manager: Arc<SessionManager>, channel: Arc<dyn Channel>) {
    let mut rx = channel.subscribe();

    // Establishment phase: wait for Connect, buffering early events.
    let mut pending: Vec<EventMsg> = Vec::new();
    let (token, last_seq) = loop {
        match rx.recv().await {
            Some(ClientMessage::Connect {
                session_token,
                last_seq,
            }) => break (session_token, last_seq),
            Some(ClientMessage::Event(event)) => {
                // Buffer-and-replay: never silently dropped.
                pending.push(event);
            }
            Some(ClientMessage::Ping) => {
                let _ = channel.send(ServerMessage::Pong).await;
            }
            Some(_) => {}
            None => return,
        }
    };

    let entry = match establish(&manager, &channel, token, last_seq).await {
        Ok(entry) => entry,
        Err(err) => {
            warn!(%err, "connection handshake failed");
            channel.close();
            return;
        }
    };

    for event in pending {
        entry.enqueue(event);
    }

    // Steady state: route inbound messages until the connection drops.
    while let Some(msg) = rx.recv().await {
        match msg {
            ClientMessage::Event(event) => entry.enqueue(event),
            ClientMessage::Ack { seq } => {
                entry.touch();
                entry.core().ack(seq);
            }
            ClientMessage::Resync => entry.request_snapshot(),
            ClientMessage::Ping => {
                let _ = channel.send(ServerMessage::Pong).await;
            }
            ClientMessage::Connect { .. } => {
                debug!(session = entry.token(), "duplicate Connect ignored");
            }
        }
    }

    entry.unbind();
    debug!(session = entry.token(), "connection closed");
}

/// Resolve the session for a connection and send the opening message
/// (snapshot or resume), then hand the channel to the session's pump.
async fn establish(
    manager: &Arc<SessionManager>,
    channel: &Arc<dyn Channel>,
    token: Option<String>,
    last_seq: Option<Seq>,
) -> Result<Arc<SessionEntry>> {
    if let Some(token) = token {
        if let Some(entry) = manager.get(&token) {
            let last_seq = last_seq.unwrap_or(0);
            let core = entry.core();
            if core.log_covers(last_seq) {
                // Plain resume: no snapshot, retained deltas replay.
                channel
                    .send(ServerMessage::Resumed {
                        session_token: token.clone(),
                    })
                    .await
                    .map_err(|_| EngineError::ChannelClosed)?;
                entry.bind(channel.clone(), last_seq);
                info!(session = %token, last_seq, "session resumed");
            } else {
                // The log no longer covers the client; fall back to a
                // snapshot tagged with the current sequence number.
                let snapshot = {
                    let mut tree = core.lock_state().await;
                    core.snapshot_now(&mut tree)?
                };
                let resume_from = snapshot.seq;
                channel
                    .send(ServerMessage::Connected {
                        session_token: token.clone(),
                        snapshot,
                    })
                    .await
                    .map_err(|_| EngineError::ChannelClosed)?;
                entry.bind(channel.clone(), resume_from);
                info!(session = %token, "session resynced via snapshot");
            }
            return Ok(entry);
        }
        debug!(stale = %token, "unknown session token; issuing fresh session");
    }

    // Fresh session: new token, seq-0 snapshot.
    let entry = manager.create_session()?;
    let core = entry.core();
    let snapshot = {
        let mut tree = core.lock_state().await;
        core.snapshot_now(&mut tree)?
    };
    let resume_from = snapshot.seq;
    channel
        .send(ServerMessage::Connected {
            session_token: entry.token().to_string(),
            snapshot,
        })
        .await
        .map_err(|_| EngineError::ChannelClosed)?;
    entry.bind(channel.clone(), resume_from);
    Ok(entry)
}
