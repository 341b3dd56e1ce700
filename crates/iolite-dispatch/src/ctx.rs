//! Handler execution contexts.
//!
//! `EventCtx` is what a main-queue handler sees: it owns the session's
//! state lock for the whole invocation, so every read and write between
//! suspension points is atomic with respect to other handlers. Calling
//! `yield_now` flushes the dirty state, emits the delta immediately, and
//! parks the task once, which is the engine's progressive-update
//! mechanism.
//!
//! `TaskCtx` is the background equivalent: it does not hold the lock.
//! Each `update` call brackets one mutation window (acquire, mutate,
//! flush, release); between windows the main queue and other background
//! tasks interleave freely. Cancellation is observed at window entry and
//! at `checkpoint` calls, never mid-mutation.

use crate::error::{DispatchError, HandlerResult};
use crate::session::{SessionCore, TaskId};
use iolite_delta::Seq;
use iolite_state::{NodePath, StateTree, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// Context for a main-queue handler invocation.
pub struct EventCtx {
    core: Arc<SessionCore>,
    guard: OwnedMutexGuard<StateTree>,
    node: NodePath,
}

impl EventCtx {
    pub(crate) fn new(
        core: Arc<SessionCore>,
        guard: OwnedMutexGuard<StateTree>,
        node: NodePath,
    ) -> Self {
        Self { core, guard, node }
    }

    /// The node the dispatched handler belongs to.
    pub fn node_path(&self) -> &NodePath {
        &self.node
    }

    pub fn session_token(&self) -> &str {
        self.core.token()
    }

    /// Read any field in the session tree.
    pub fn get(&mut self, path: &NodePath, field: &str) -> Result<Value, DispatchError> {
        Ok(self.guard.get(path, field)?)
    }

    /// Write any field in the session tree.
    pub fn set(&mut self, path: &NodePath, field: &str, value: Value) -> Result<(), DispatchError> {
        Ok(self.guard.set(path, field, value)?)
    }

    /// Read a field of the handler's own node.
    pub fn get_local(&mut self, field: &str) -> Result<Value, DispatchError> {
        let node = self.node.clone();
        self.get(&node, field)
    }

    /// Write a field of the handler's own node.
    pub fn set_local(&mut self, field: &str, value: Value) -> Result<(), DispatchError> {
        let node = self.node.clone();
        self.set(&node, field, value)
    }

    /// Explicit suspension point: flush dirty state, emit the resulting
    /// delta immediately, then yield once so other sessions make progress.
    /// Returns the emitted sequence number, or `None` if nothing changed.
    pub async fn yield_now(&mut self) -> Result<Option<Seq>, DispatchError> {
        let seq = self.core.flush_and_emit(&mut self.guard)?;
        tokio::task::yield_now().await;
        Ok(seq)
    }

    pub(crate) fn tree_mut(&mut self) -> &mut StateTree {
        &mut self.guard
    }
}

/// Context for a background handler.
#[derive(Clone)]
pub struct TaskCtx {
    core: Arc<SessionCore>,
    node: NodePath,
    task_id: TaskId,
    cancel: Arc<AtomicBool>,
    lock_timeout: Option<Duration>,
}

impl TaskCtx {
    pub(crate) fn new(
        core: Arc<SessionCore>,
        node: NodePath,
        task_id: TaskId,
        cancel: Arc<AtomicBool>,
        lock_timeout: Option<Duration>,
    ) -> Self {
        Self {
            core,
            node,
            task_id,
            cancel,
            lock_timeout,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn node_path(&self) -> &NodePath {
        &self.node
    }

    pub fn session_token(&self) -> &str {
        self.core.token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Pure suspension point: observes cancellation and yields.
    pub async fn checkpoint(&self) -> HandlerResult {
        if self.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        tokio::task::yield_now().await;
        Ok(())
    }

    /// One bracketed mutation window: acquire the session's state lock
    /// (with the configured timeout, if any), run the closure, flush and
    /// emit, release. Cancellation is checked before the lock is taken —
    /// never once the window is open.
    pub async fn update<R, F>(&self, f: F) -> Result<R, DispatchError>
    where
        F: FnOnce(&mut StateTree) -> Result<R, DispatchError>,
    {
        if self.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let mut guard = self.acquire().await?;
        let result = f(&mut guard);
        match result {
            Ok(value) => {
                self.core.flush_and_emit(&mut guard)?;
                Ok(value)
            }
            Err(err) => {
                // A failed window never leaks partial mutations.
                guard.revert_dirty();
                Err(err)
            }
        }
    }

    /// Read-only access under the lock; nothing to flush.
    pub async fn read<R, F>(&self, f: F) -> Result<R, DispatchError>
    where
        F: FnOnce(&mut StateTree) -> Result<R, DispatchError>,
    {
        if self.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        let mut guard = self.acquire().await?;
        f(&mut guard)
    }

    async fn acquire(&self) -> Result<OwnedMutexGuard<StateTree>, DispatchError> {
        let state = self.core.state_handle();
        match self.lock_timeout {
            Some(timeout) => tokio::time::timeout(timeout, state.lock_owned())
                .await
                .map_err(|_| DispatchError::LockTimeout {
                    waited_ms: timeout.as_millis() as u64,
                }),
            None => Ok(state.lock_owned().await),
        }
    }
}
