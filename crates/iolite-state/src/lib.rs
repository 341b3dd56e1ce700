pub mod error;
pub mod node;
pub mod path;
pub mod schema;
pub mod tree;
pub mod value;

pub use error::{Result, StateError};
pub use node::{DirtyTracker, StateNode};
pub use path::{FieldAddr, NodePath};
pub use schema::{ComputeFn, ComputeScope, ComputedDef, FieldDef, FieldKind, NodeSchema, SchemaBuilder};
pub use tree::{FlushSet, StateTree};
pub use value::{NodeRef, Value, ValueKind};
