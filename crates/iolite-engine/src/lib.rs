//! Iolite engine - the server side of the reactive state synchronization
//! loop, plus the client-side mirror store.
//!
//! # Quick Start
//!
//! ```rust
//! use iolite_engine::{Client, Engine, EngineConfig, memory_pair};
//! use iolite_dispatch::{EventCtx, HandlerRegistry, HandlerResult};
//! use iolite_state::{FieldKind, NodeSchema, Value};
//! use futures::future::BoxFuture;
//!
//! fn increment<'a>(ctx: &'a mut EventCtx, _args: Vec<Value>) -> BoxFuture<'a, HandlerResult> {
//!     Box::pin(async move {
//!         let count = ctx.get_local("count")?.as_int().unwrap_or(0);
//!         ctx.set_local("count", Value::Int(count + 1))?;
//!         Ok(())
//!     })
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let schema = NodeSchema::builder()
//!     .field("count", FieldKind::Int, Value::Int(0))
//!     .build()?;
//! let registry = HandlerRegistry::new().on("root.increment", increment);
//! let engine = Engine::new(schema, registry, EngineConfig::default())?;
//!
//! let (server_end, client_end) = memory_pair(64);
//! engine.accept(server_end);
//!
//! let mut client = Client::new(client_end);
//! client.connect().await?;
//! client.emit("root.increment", vec![]).await?;
//! client.process_next().await?;
//! assert_eq!(client.store().get("root", "count"), Some(&Value::Int(1)));
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`channel`] - the duplex transport seam and an in-memory implementation
//! - [`session`] - session entries, token minting, idle eviction
//! - [`engine`] - connection handshake, reconnect/replay, outbound pump
//! - [`client`] - the client store mirror and a message-driven client
//! - [`config`] - engine configuration
//! - [`error`] - error types

pub mod channel;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod session;

pub use channel::{memory_pair, Channel, ChannelError, ClientEndpoint, ClientMessage, MemoryChannel, ServerMessage};
pub use client::{Client, ClientStore, ConnectOutcome, WatchId};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use session::{SessionEntry, SessionManager};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::channel::{memory_pair, Channel, ClientMessage, ServerMessage};
    pub use crate::client::{Client, ClientStore};
    pub use crate::config::EngineConfig;
    pub use crate::engine::Engine;
    pub use crate::error::EngineError;
    pub use iolite_dispatch::{EventCtx, HandlerRegistry, HandlerResult, TaskCtx};
    pub use iolite_state::{FieldKind, NodePath, NodeSchema, Value};
}
