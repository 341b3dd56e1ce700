//! Event queue and dispatcher for the Iolite engine.
//!
//! Each session has one FIFO main queue, drained serially: a main-queue
//! handler holds the session's exclusive state lock for its entire body,
//! so state invariants cannot be observed mid-mutation. Handlers marked as
//! background are spawned as concurrent tasks that acquire the lock only
//! for bracketed mutation windows, interleaving with the main queue and
//! with each other.
//!
//! Suspension points are explicit: `EventCtx::yield_now` and every
//! `TaskCtx::update` window flush the dirty state and emit a delta
//! immediately, which is what makes progressive (streamed) UI updates
//! possible. Errors and panics inside a handler are caught at the dispatch
//! boundary, rolled back to the last flushed state, and reported to that
//! session only.

pub mod ctx;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod session;

pub use ctx::{EventCtx, TaskCtx};
pub use dispatcher::{DispatchConfig, Dispatcher};
pub use error::{DispatchError, HandlerResult};
pub use registry::{BackgroundHandler, Handler, HandlerRegistry, MainHandler};
pub use session::{DispatchState, SessionCore, SessionNotice, TaskId};
