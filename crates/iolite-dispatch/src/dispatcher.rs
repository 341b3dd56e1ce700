//! The per-session dispatch loop.
//!
//! Main-queue events are drained strictly in receipt order, one at a
//! time; each handler runs to completion (or failure) before the next is
//! dequeued. Background handlers leave the FIFO at dispatch time: they
//! are spawned as tracked tasks and run concurrently.
//!
//! The dispatch boundary is the error firewall. Handler errors and panics
//! are caught here, the un-flushed portion of the state is rolled back,
//! and a notice goes to the owning session; other sessions and the
//! process never observe the failure.

use crate::ctx::{EventCtx, TaskCtx};
use crate::error::DispatchError;
use crate::registry::{BackgroundHandler, Handler, HandlerRegistry, MainHandler};
use crate::session::{SessionCore, SessionNotice, TaskId};
use futures::FutureExt;
use iolite_delta::EventMsg;
use iolite_state::{NodePath, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Dispatcher configuration.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// How long a background task waits for the state lock before its
    /// window fails with `LockTimeout`. `None` waits forever.
    pub lock_timeout: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { lock_timeout: None }
    }
}

/// Routes events to handlers and enforces the session execution model.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self::with_config(registry, DispatchConfig::default())
    }

    pub fn with_config(registry: Arc<HandlerRegistry>, config: DispatchConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Drain a session's main queue until the sending side closes. This is
    /// the task the engine spawns per session.
    pub async fn run(self: Arc<Self>, core: Arc<SessionCore>, mut events: mpsc::UnboundedReceiver<EventMsg>) {
        debug!(session = core.token(), "dispatch loop started");
        while let Some(event) = events.recv().await {
            self.dispatch(&core, event).await;
        }
        debug!(session = core.token(), "dispatch loop ended");
    }

    /// Dispatch one event: resolve, then run inline (main) or spawn
    /// (background).
    pub async fn dispatch(&self, core: &Arc<SessionCore>, event: EventMsg) {
        let handler = match self.registry.resolve(&event.handler_path) {
            Ok(handler) => handler.clone(),
            Err(DispatchError::HandlerNotFound(path)) => {
                warn!(session = core.token(), handler = %path, "no handler for event");
                core.notify(SessionNotice::HandlerNotFound { handler_path: path });
                return;
            }
            Err(err) => {
                error!(session = core.token(), %err, "handler resolution failed");
                return;
            }
        };

        match handler {
            Handler::Main(f) => self.run_main(core, event, f).await,
            Handler::Background(f) => {
                let _ = self.spawn_background(core, event, f);
            }
        }
    }

    /// Submit a background handler directly (outside the main FIFO),
    /// returning the task id for cancellation.
    pub fn submit_background(
        &self,
        core: &Arc<SessionCore>,
        handler_path: &str,
        args: Vec<Value>,
    ) -> Result<TaskId, DispatchError> {
        match self.registry.resolve(handler_path)? {
            Handler::Background(f) => {
                let event = EventMsg::new(core.token(), handler_path, args);
                Ok(self.spawn_background(core, event, f.clone()))
            }
            Handler::Main(_) => Err(DispatchError::failed(format!(
                "handler '{}' is not registered as background",
                handler_path
            ))),
        }
    }

    async fn run_main(&self, core: &Arc<SessionCore>, event: EventMsg, f: MainHandler) {
        let node = target_node(&event.handler_path);
        let guard = core.lock_state().await;
        core.set_processing(true);

        let mut ctx = EventCtx::new(core.clone(), guard, node);
        let outcome = AssertUnwindSafe(f(&mut ctx, event.args.clone()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                // Final flush: whatever the handler dirtied after its last
                // yield goes out now.
                if let Err(err) = core.flush_and_emit(ctx.tree_mut()) {
                    error!(session = core.token(), %err, "final flush failed");
                }
            }
            Ok(Err(err)) => {
                ctx.tree_mut().revert_dirty();
                warn!(
                    session = core.token(),
                    handler = %event.handler_path,
                    %err,
                    "handler failed"
                );
                core.notify(SessionNotice::HandlerFailed {
                    handler_path: event.handler_path.clone(),
                    message: err.to_string(),
                });
            }
            Err(panic) => {
                ctx.tree_mut().revert_dirty();
                let message = panic_message(panic);
                error!(
                    session = core.token(),
                    handler = %event.handler_path,
                    panic = %message,
                    "handler panicked"
                );
                core.notify(SessionNotice::HandlerFailed {
                    handler_path: event.handler_path.clone(),
                    message,
                });
            }
        }

        core.set_processing(false);
        // The state lock releases when `ctx` drops here.
    }

    fn spawn_background(
        &self,
        core: &Arc<SessionCore>,
        event: EventMsg,
        f: BackgroundHandler,
    ) -> TaskId {
        let (task_id, cancel) = core.tasks().register();
        let node = target_node(&event.handler_path);
        let ctx = TaskCtx::new(
            core.clone(),
            node,
            task_id,
            cancel,
            self.config.lock_timeout,
        );
        let core = core.clone();

        debug!(
            session = core.token(),
            handler = %event.handler_path,
            task = %task_id,
            "background task spawned"
        );

        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(f(ctx, event.args.clone()))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {
                    debug!(session = core.token(), task = %task_id, "background task finished");
                }
                Ok(Err(DispatchError::Cancelled)) => {
                    debug!(session = core.token(), task = %task_id, "background task cancelled");
                }
                Ok(Err(err)) => {
                    warn!(session = core.token(), task = %task_id, %err, "background task failed");
                    core.notify(SessionNotice::TaskFailed {
                        task_id: task_id.to_string(),
                        handler_path: event.handler_path.clone(),
                        message: err.to_string(),
                    });
                }
                Err(panic) => {
                    // A panic may have unwound mid-window; scrub any
                    // unflushed dirt before reporting.
                    let mut tree = core.lock_state().await;
                    tree.revert_dirty();
                    drop(tree);

                    let message = panic_message(panic);
                    error!(session = core.token(), task = %task_id, panic = %message, "background task panicked");
                    core.notify(SessionNotice::TaskFailed {
                        task_id: task_id.to_string(),
                        handler_path: event.handler_path.clone(),
                        message,
                    });
                }
            }

            core.tasks().finish(task_id);
        });

        task_id
    }
}

/// The node a handler path belongs to: everything before the final
/// segment, or the root for single-segment paths.
fn target_node(handler_path: &str) -> NodePath {
    NodePath::split_field(handler_path)
        .map(|(node, _)| node)
        .unwrap_or_else(NodePath::root)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerResult;
    use futures::future::BoxFuture;
    use iolite_delta::DeltaMsg;
    use iolite_state::{FieldKind, NodeSchema, StateTree, Value};

    fn counter_schema() -> NodeSchema {
        NodeSchema::builder()
            .field("count", FieldKind::Int, Value::Int(0))
            .field("log", FieldKind::List, Value::List(Vec::new()))
            .build()
            .unwrap()
    }

    fn increment<'a>(ctx: &'a mut EventCtx, _args: Vec<Value>) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let count = ctx.get_local("count")?.as_int().unwrap_or(0);
            ctx.set_local("count", Value::Int(count + 1))?;
            Ok(())
        })
    }

    fn setup(
        registry: HandlerRegistry,
    ) -> (
        Arc<Dispatcher>,
        Arc<SessionCore>,
        mpsc::UnboundedReceiver<DeltaMsg>,
        mpsc::UnboundedReceiver<SessionNotice>,
    ) {
        let tree = StateTree::instantiate(&counter_schema()).unwrap();
        let (core, deltas, notices) = SessionCore::new("tok", tree, 64);
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry)));
        (dispatcher, core, deltas, notices)
    }

    #[tokio::test]
    async fn test_increment_emits_delta() {
        let registry = HandlerRegistry::new().on("root.increment", increment);
        let (dispatcher, core, mut deltas, _n) = setup(registry);

        dispatcher
            .dispatch(&core, EventMsg::new("tok", "root.increment", vec![]))
            .await;

        let delta = deltas.recv().await.unwrap();
        assert_eq!(delta.seq, 1);
        assert_eq!(delta.field("root", "count"), Some(&Value::Int(1)));
        assert_eq!(core.dispatch_state(), crate::session::DispatchState::Idle);
    }

    #[tokio::test]
    async fn test_handler_not_found_is_reported_not_fatal() {
        let registry = HandlerRegistry::new().on("root.increment", increment);
        let (dispatcher, core, mut deltas, mut notices) = setup(registry);

        dispatcher
            .dispatch(&core, EventMsg::new("tok", "root.missing", vec![]))
            .await;
        dispatcher
            .dispatch(&core, EventMsg::new("tok", "root.increment", vec![]))
            .await;

        let notice = notices.recv().await.unwrap();
        assert!(matches!(notice, SessionNotice::HandlerNotFound { .. }));
        // The queue kept going.
        assert_eq!(deltas.recv().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn test_failed_handler_reverts_and_reports() {
        fn failing<'a>(ctx: &'a mut EventCtx, _args: Vec<Value>) -> BoxFuture<'a, HandlerResult> {
            Box::pin(async move {
                ctx.set_local("count", Value::Int(99))?;
                Err(DispatchError::failed("boom"))
            })
        }

        let registry = HandlerRegistry::new()
            .on("root.fail", failing)
            .on("root.increment", increment);
        let (dispatcher, core, mut deltas, mut notices) = setup(registry);

        dispatcher
            .dispatch(&core, EventMsg::new("tok", "root.fail", vec![]))
            .await;

        let notice = notices.recv().await.unwrap();
        assert!(matches!(notice, SessionNotice::HandlerFailed { .. }));

        // The mutation was rolled back: the next increment starts from 0.
        dispatcher
            .dispatch(&core, EventMsg::new("tok", "root.increment", vec![]))
            .await;
        let delta = deltas.recv().await.unwrap();
        assert_eq!(delta.field("root", "count"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        fn panicking<'a>(_ctx: &'a mut EventCtx, _args: Vec<Value>) -> BoxFuture<'a, HandlerResult> {
            Box::pin(async move { panic!("kaboom") })
        }

        let registry = HandlerRegistry::new()
            .on("root.panic", panicking)
            .on("root.increment", increment);
        let (dispatcher, core, mut deltas, mut notices) = setup(registry);

        dispatcher
            .dispatch(&core, EventMsg::new("tok", "root.panic", vec![]))
            .await;

        let notice = notices.recv().await.unwrap();
        match notice {
            SessionNotice::HandlerFailed { message, .. } => assert!(message.contains("kaboom")),
            other => panic!("unexpected notice: {:?}", other),
        }

        // The dispatcher survived.
        dispatcher
            .dispatch(&core, EventMsg::new("tok", "root.increment", vec![]))
            .await;
        assert_eq!(deltas.recv().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn test_yield_emits_progressive_deltas() {
        fn two_phase<'a>(ctx: &'a mut EventCtx, _args: Vec<Value>) -> BoxFuture<'a, HandlerResult> {
            Box::pin(async move {
                ctx.set_local("count", Value::Int(1))?;
                ctx.yield_now().await?;
                ctx.set_local("count", Value::Int(2))?;
                ctx.yield_now().await?;
                ctx.set_local("count", Value::Int(3))?;
                Ok(())
            })
        }

        let registry = HandlerRegistry::new().on("root.steps", two_phase);
        let (dispatcher, core, mut deltas, _n) = setup(registry);

        dispatcher
            .dispatch(&core, EventMsg::new("tok", "root.steps", vec![]))
            .await;

        // Two yield flushes plus the final flush, in order, each carrying
        // only what changed since the previous one.
        for (seq, expected) in [(1u64, 1i64), (2, 2), (3, 3)] {
            let delta = deltas.recv().await.unwrap();
            assert_eq!(delta.seq, seq);
            assert_eq!(delta.field("root", "count"), Some(&Value::Int(expected)));
            assert_eq!(delta.field_count(), 1);
        }
    }
}
