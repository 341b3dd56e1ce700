//! Per-session shared core: the state tree behind its exclusive lock, the
//! delta log, and the outbound delta/notice channels the engine pumps to
//! the transport.

use crate::error::DispatchError;
use iolite_delta::{encode_snapshot, DeltaLog, DeltaMsg, Seq};
use iolite_state::StateTree;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use ulid::Ulid;

/// Identifier for a background task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(Ulid);

impl TaskId {
    fn mint() -> Self {
        Self(Ulid::new())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observable dispatch state of a session's main queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    /// No main-queue handler running.
    Idle,
    /// A main-queue handler holds the exclusive lock.
    Processing,
}

/// A session-visible report: handler failures and bad event targets are
/// surfaced to the owning session, never propagated to other sessions and
/// never allowed to crash the dispatcher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SessionNotice {
    HandlerNotFound {
        handler_path: String,
    },
    HandlerFailed {
        handler_path: String,
        message: String,
    },
    TaskFailed {
        task_id: String,
        handler_path: String,
        message: String,
    },
}

/// Tracks concurrently executing background tasks and their cancellation
/// flags.
#[derive(Debug, Default)]
pub struct BackgroundTracker {
    active: AtomicUsize,
    cancels: SyncMutex<HashMap<TaskId, Arc<AtomicBool>>>,
}

impl BackgroundTracker {
    pub fn register(&self) -> (TaskId, Arc<AtomicBool>) {
        let id = TaskId::mint();
        let flag = Arc::new(AtomicBool::new(false));
        self.cancels.lock().insert(id, flag.clone());
        self.active.fetch_add(1, Ordering::SeqCst);
        (id, flag)
    }

    pub fn finish(&self, id: TaskId) {
        if self.cancels.lock().remove(&id).is_some() {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Request cooperative cancellation. Returns false for unknown or
    /// already-finished tasks. Takes effect at the task's next suspension
    /// point, never mid-mutation.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.cancels.lock().get(&id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Cancel every live task (session teardown).
    pub fn cancel_all(&self) {
        for flag in self.cancels.lock().values() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Shared core of one session.
pub struct SessionCore {
    token: String,
    state: Arc<Mutex<StateTree>>,
    log: SyncMutex<DeltaLog>,
    delta_tx: mpsc::UnboundedSender<DeltaMsg>,
    notice_tx: mpsc::UnboundedSender<SessionNotice>,
    tasks: BackgroundTracker,
    processing: AtomicBool,
}

impl SessionCore {
    /// Build a core around a freshly instantiated tree. Returns the core
    /// plus the receiving ends of the outbound delta and notice streams.
    pub fn new(
        token: impl Into<String>,
        tree: StateTree,
        log_cap: usize,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<DeltaMsg>,
        mpsc::UnboundedReceiver<SessionNotice>,
    ) {
        let token = token.into();
        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let core = Arc::new(Self {
            log: SyncMutex::new(DeltaLog::with_capacity(token.clone(), log_cap)),
            token,
            state: Arc::new(Mutex::new(tree)),
            delta_tx,
            notice_tx,
            tasks: BackgroundTracker::default(),
            processing: AtomicBool::new(false),
        });
        (core, delta_rx, notice_rx)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Acquire the session's exclusive state lock.
    pub async fn lock_state(&self) -> OwnedMutexGuard<StateTree> {
        self.state.clone().lock_owned().await
    }

    pub(crate) fn state_handle(&self) -> Arc<Mutex<StateTree>> {
        self.state.clone()
    }

    pub fn dispatch_state(&self) -> DispatchState {
        if self.processing.load(Ordering::SeqCst) {
            DispatchState::Processing
        } else {
            DispatchState::Idle
        }
    }

    pub(crate) fn set_processing(&self, on: bool) {
        self.processing.store(on, Ordering::SeqCst);
    }

    pub fn background_active(&self) -> usize {
        self.tasks.active()
    }

    pub(crate) fn tasks(&self) -> &BackgroundTracker {
        &self.tasks
    }

    /// Cancel a background task by id.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.tasks.cancel(id)
    }

    pub fn cancel_all_tasks(&self) {
        self.tasks.cancel_all();
    }

    /// Flush the tree's dirty set into the delta log and emit the
    /// resulting delta. Returns the allocated sequence number, or `None`
    /// when nothing changed.
    pub fn flush_and_emit(&self, tree: &mut StateTree) -> Result<Option<Seq>, DispatchError> {
        let flush = tree.flush_dirty()?;
        let delta = self.log.lock().append(flush);
        match delta {
            Some(delta) => {
                let seq = delta.seq;
                // A closed receiver means the engine is tearing down; the
                // delta stays in the log for replay.
                let _ = self.delta_tx.send(delta);
                Ok(Some(seq))
            }
            None => Ok(None),
        }
    }

    /// Report a notice to the owning session.
    pub fn notify(&self, notice: SessionNotice) {
        let _ = self.notice_tx.send(notice);
    }

    /// Last allocated delta sequence number.
    pub fn head_seq(&self) -> Seq {
        self.log.lock().head()
    }

    /// Acknowledge client receipt up to `seq`.
    pub fn ack(&self, seq: Seq) {
        self.log.lock().ack(seq);
    }

    /// Rebase the log on an externally established baseline (e.g. a
    /// restored session image): sequence numbering continues after `seq`.
    pub fn rebase_log(&self, seq: Seq) {
        self.log.lock().rebase(seq);
    }

    /// Whether retained deltas can resume a client that last saw `seq`.
    pub fn log_covers(&self, seq: Seq) -> bool {
        self.log.lock().covers(seq)
    }

    /// Retained deltas after `seq`, for reconnect replay.
    pub fn replay_since(&self, seq: Seq) -> Vec<DeltaMsg> {
        self.log.lock().since(seq)
    }

    /// Encode a full snapshot of the current state, tagged with the
    /// current sequence number, and rebase the log on it.
    pub fn snapshot_now(&self, tree: &mut StateTree) -> Result<DeltaMsg, DispatchError> {
        let seq = self.log.lock().head();
        let snap = encode_snapshot(&self.token, seq, tree)?;
        self.log.lock().rebase(seq);
        Ok(snap)
    }
}

impl std::fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCore")
            .field("token", &self.token)
            .field("head_seq", &self.head_seq())
            .field("background_active", &self.background_active())
            .finish()
    }
}
