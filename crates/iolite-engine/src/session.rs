//! Session entries, the outbound pump, and the session manager.
//!
//! A session outlives its physical connections: on disconnect the entry
//! (state tree, queue, delta log) stays put, and a reconnect rebinds a new
//! channel. The outbound pump is the single writer to the bound channel,
//! which keeps replayed and live deltas in sequence across rebinds.

use crate::channel::{Channel, ServerMessage};
use crate::config::EngineConfig;
use crate::error::Result;
use iolite_delta::{DeltaMsg, EventMsg, Seq};
use iolite_dispatch::{Dispatcher, SessionCore, SessionNotice};
use iolite_state::{NodeSchema, StateTree};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Control messages for a session's outbound pump.
pub(crate) enum PumpCtrl {
    /// Bind a (re)connected channel; retained deltas after `resume_from`
    /// are replayed before live traffic resumes.
    Bind {
        channel: Arc<dyn Channel>,
        resume_from: Seq,
    },
    /// Send a fresh snapshot in-line with the delta stream (resync).
    Snapshot,
    Unbind,
}

/// One live session.
pub struct SessionEntry {
    core: Arc<SessionCore>,
    event_tx: mpsc::UnboundedSender<EventMsg>,
    ctrl_tx: mpsc::UnboundedSender<PumpCtrl>,
    last_activity: Mutex<Instant>,
    bound: AtomicBool,
    dispatch_task: JoinHandle<()>,
    pump_task: JoinHandle<()>,
}

impl SessionEntry {
    pub fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    pub fn token(&self) -> &str {
        self.core.token()
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    /// Enqueue an event on the session's main FIFO.
    pub fn enqueue(&self, event: EventMsg) {
        self.touch();
        if self.event_tx.send(event).is_err() {
            error!(session = self.token(), "event queue closed");
        }
    }

    pub(crate) fn bind(&self, channel: Arc<dyn Channel>, resume_from: Seq) {
        self.bound.store(true, Ordering::SeqCst);
        self.touch();
        let _ = self.ctrl_tx.send(PumpCtrl::Bind {
            channel,
            resume_from,
        });
    }

    pub(crate) fn unbind(&self) {
        self.bound.store(false, Ordering::SeqCst);
        self.touch();
        let _ = self.ctrl_tx.send(PumpCtrl::Unbind);
    }

    pub(crate) fn request_snapshot(&self) {
        self.touch();
        let _ = self.ctrl_tx.send(PumpCtrl::Snapshot);
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn teardown(&self) {
        self.core.cancel_all_tasks();
        self.dispatch_task.abort();
        self.pump_task.abort();
    }
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("token", &self.token())
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// Owns all live sessions and the schema they instantiate.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    schema: Arc<NodeSchema>,
    dispatcher: Arc<Dispatcher>,
    config: EngineConfig,
}

impl SessionManager {
    pub fn new(schema: Arc<NodeSchema>, dispatcher: Arc<Dispatcher>, config: EngineConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            schema,
            dispatcher,
            config,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a session under a freshly minted unguessable token.
    pub fn create_session(&self) -> Result<Arc<SessionEntry>> {
        loop {
            let token = mint_token();
            if !self.sessions.read().contains_key(&token) {
                return self.create_with_token(token);
            }
        }
    }

    /// Create a session under a caller-supplied token (session restore).
    pub(crate) fn create_with_token(&self, token: String) -> Result<Arc<SessionEntry>> {
        let tree = StateTree::instantiate(&self.schema)?;
        let (core, delta_rx, notice_rx) = SessionCore::new(token.clone(), tree, self.config.delta_log_cap);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        let dispatch_task = tokio::spawn(self.dispatcher.clone().run(core.clone(), event_rx));
        let pump_task = tokio::spawn(pump(core.clone(), delta_rx, notice_rx, ctrl_rx));

        let entry = Arc::new(SessionEntry {
            core,
            event_tx,
            ctrl_tx,
            last_activity: Mutex::new(Instant::now()),
            bound: AtomicBool::new(false),
            dispatch_task,
            pump_task,
        });
        self.sessions.write().insert(token.clone(), entry.clone());
        info!(session = %token, "session created");
        Ok(entry)
    }

    pub fn get(&self, token: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.read().get(token).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Tear down a session explicitly.
    pub fn remove(&self, token: &str) -> bool {
        match self.sessions.write().remove(token) {
            Some(entry) => {
                entry.teardown();
                info!(session = %token, "session removed");
                true
            }
            None => false,
        }
    }

    /// Evict sessions with no bound channel that have been idle past the
    /// configured timeout. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let timeout = self.config.idle_timeout;
        let expired: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, entry)| !entry.is_bound() && entry.idle_for() > timeout)
            .map(|(token, _)| token.clone())
            .collect();

        for token in &expired {
            if self.remove(token) {
                debug!(session = %token, "session evicted after idle timeout");
            }
        }
        expired.len()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        for entry in self.sessions.get_mut().values() {
            entry.teardown();
        }
    }
}

/// Spawn the periodic eviction sweeper.
pub(crate) fn spawn_sweeper(manager: Arc<SessionManager>) -> JoinHandle<()> {
    let interval = manager.config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let evicted = manager.sweep();
            if evicted > 0 {
                debug!(evicted, "idle sweep");
            }
        }
    })
}

/// The session's outbound pump: single writer to whatever channel is
/// currently bound. Replay on bind precedes live deltas, and a
/// sequence-number high-water mark drops anything already delivered, so
/// the client sees a gap-free stream across rebinds.
async fn pump(
    core: Arc<SessionCore>,
    mut deltas: mpsc::UnboundedReceiver<DeltaMsg>,
    mut notices: mpsc::UnboundedReceiver<SessionNotice>,
    mut ctrl: mpsc::UnboundedReceiver<PumpCtrl>,
) {
    let mut current: Option<Arc<dyn Channel>> = None;
    let mut sent_up_to: Seq = 0;

    loop {
        tokio::select! {
            ctrl_msg = ctrl.recv() => match ctrl_msg {
                None => break,
                Some(PumpCtrl::Bind { channel, resume_from }) => {
                    sent_up_to = resume_from;
                    let mut alive = true;
                    for delta in core.replay_since(resume_from) {
                        let seq = delta.seq;
                        if channel.send(ServerMessage::Delta(delta)).await.is_err() {
                            alive = false;
                            break;
                        }
                        sent_up_to = seq;
                    }
                    current = alive.then_some(channel);
                }
                Some(PumpCtrl::Snapshot) => {
                    if let Some(channel) = &current {
                        let snapshot = {
                            let mut tree = core.lock_state().await;
                            core.snapshot_now(&mut tree)
                        };
                        match snapshot {
                            Ok(snapshot) => {
                                sent_up_to = snapshot.seq;
                                let msg = ServerMessage::Connected {
                                    session_token: core.token().to_string(),
                                    snapshot,
                                };
                                if channel.send(msg).await.is_err() {
                                    current = None;
                                }
                            }
                            Err(err) => {
                                error!(session = core.token(), %err, "snapshot failed");
                            }
                        }
                    }
                }
                Some(PumpCtrl::Unbind) => current = None,
            },
            delta = deltas.recv() => match delta {
                None => break,
                Some(delta) => {
                    // Already delivered by a bind replay, or retained in
                    // the log for the next reconnect.
                    if delta.seq <= sent_up_to {
                        continue;
                    }
                    if let Some(channel) = &current {
                        let seq = delta.seq;
                        if channel.send(ServerMessage::Delta(delta)).await.is_err() {
                            current = None;
                        } else {
                            sent_up_to = seq;
                        }
                    }
                }
            },
            notice = notices.recv() => match notice {
                None => break,
                Some(notice) => {
                    if let Some(channel) = &current {
                        let _ = channel.send(ServerMessage::Notice(notice)).await;
                    }
                }
            },
        }
    }
}

/// Mint an opaque, unguessable session token (128 bits of OS entropy,
/// hex-encoded).
fn mint_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use iolite_dispatch::HandlerRegistry;
    use iolite_state::{FieldKind, Value};

    fn manager(config: EngineConfig) -> SessionManager {
        let schema = NodeSchema::builder()
            .field("count", FieldKind::Int, Value::Int(0))
            .build()
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(HandlerRegistry::new())));
        SessionManager::new(Arc::new(schema), dispatcher, config)
    }

    #[test]
    fn test_tokens_are_unguessable_length() {
        let token = mint_token();
        assert_eq!(token.len(), 32);
        assert_ne!(token, mint_token());
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let manager = manager(EngineConfig::default());
        let entry = manager.create_session().unwrap();
        let token = entry.token().to_string();

        assert!(manager.get(&token).is_some());
        assert!(manager.get("bogus").is_none());
        assert_eq!(manager.len(), 1);

        assert!(manager.remove(&token));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_idle_unbound() {
        let config = EngineConfig {
            idle_timeout: Duration::from_millis(10),
            ..EngineConfig::default()
        };
        let manager = manager(config);
        let entry = manager.create_session().unwrap();
        let token = entry.token().to_string();

        // Not yet past the timeout.
        assert_eq!(manager.sweep(), 0);

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(manager.sweep(), 1);
        assert!(manager.get(&token).is_none());
    }
}
