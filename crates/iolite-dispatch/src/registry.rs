//! Handler registry: explicit mapping from handler paths to executable
//! bodies, built at startup and injected into the dispatcher. Lookup
//! failure is the `HandlerNotFound` error, reported to the session and
//! non-fatal to its queue.

use crate::ctx::{EventCtx, TaskCtx};
use crate::error::{DispatchError, HandlerResult};
use futures::future::BoxFuture;
use iolite_state::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A main-queue handler body. Borrows the context for the duration of the
/// invocation; the dispatcher holds the session's state lock across it.
pub type MainHandler =
    Arc<dyn for<'a> Fn(&'a mut EventCtx, Vec<Value>) -> BoxFuture<'a, HandlerResult> + Send + Sync>;

/// A background handler body. Owns its context; runs concurrently with the
/// main queue and other background tasks.
pub type BackgroundHandler =
    Arc<dyn Fn(TaskCtx, Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// A registered handler.
#[derive(Clone)]
pub enum Handler {
    Main(MainHandler),
    /// Explicitly marked to run outside the main FIFO.
    Background(BackgroundHandler),
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Main(_) => write!(f, "Handler::Main"),
            Handler::Background(_) => write!(f, "Handler::Background"),
        }
    }
}

/// Maps dotted handler paths (`root.increment`) to handler bodies.
#[derive(Clone, Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a main-queue handler. Chainable.
    pub fn on<F>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut EventCtx, Vec<Value>) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.handlers
            .insert(path.into(), Handler::Main(Arc::new(handler)));
        self
    }

    /// Register a background handler. Chainable.
    pub fn on_background<F>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TaskCtx, Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static,
    {
        self.handlers
            .insert(path.into(), Handler::Background(Arc::new(handler)));
        self
    }

    pub fn resolve(&self, path: &str) -> Result<&Handler, DispatchError> {
        self.handlers
            .get(path)
            .ok_or_else(|| DispatchError::HandlerNotFound(path.to_string()))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.handlers.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered handler paths, unordered.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop<'a>(_ctx: &'a mut EventCtx, _args: Vec<Value>) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async { Ok(()) })
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = HandlerRegistry::new().on("root.increment", noop);
        assert!(registry.contains("root.increment"));
        assert!(matches!(
            registry.resolve("root.increment"),
            Ok(Handler::Main(_))
        ));
    }

    #[test]
    fn test_unknown_path_is_handler_not_found() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve("root.missing").unwrap_err();
        assert!(matches!(err, DispatchError::HandlerNotFound(_)));
    }

    #[test]
    fn test_background_marking() {
        let registry = HandlerRegistry::new()
            .on_background("root.stream", |_ctx, _args| Box::pin(async { Ok(()) }));
        assert!(matches!(
            registry.resolve("root.stream"),
            Ok(Handler::Background(_))
        ));
    }
}
