//! Declared state-node schemas.
//!
//! A schema describes the fields, computed fields and child nodes of one
//! state node. Schemas are built explicitly at startup and injected into the
//! engine at session-creation time; there is no process-wide registry of
//! node classes.
//!
//! Computed inputs name either a plain field of the same node (`"count"`)
//! or an absolute field address in another node (`"root.stats.total"`).
//! Cycles among computed fields are rejected at registration, never at
//! evaluation.

use crate::error::{Result, StateError};
use crate::value::{Value, ValueKind};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The declared semantic type of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
    Ref,
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldKind::Bool => "bool",
            FieldKind::Int => "int",
            FieldKind::Float => "float",
            FieldKind::Str => "str",
            FieldKind::List => "list",
            FieldKind::Map => "map",
            FieldKind::Ref => "ref",
        };
        write!(f, "{}", name)
    }
}

impl FieldKind {
    /// Whether a value is acceptable for this kind. `Null` is only valid
    /// for `Ref` fields (an unset pointer).
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value.kind()) {
            (FieldKind::Bool, ValueKind::Bool) => true,
            (FieldKind::Int, ValueKind::Int) => true,
            (FieldKind::Float, ValueKind::Float) => true,
            (FieldKind::Str, ValueKind::Str) => true,
            (FieldKind::List, ValueKind::List) => true,
            (FieldKind::Map, ValueKind::Map) => true,
            (FieldKind::Ref, ValueKind::Ref) => true,
            (FieldKind::Ref, ValueKind::Null) => true,
            _ => false,
        }
    }
}

/// A declared plain field: name, kind and default value.
#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub default: Value,
}

impl FieldDef {
    /// Validate a candidate value against the declared kind.
    pub fn validate(&self, value: &Value) -> Result<()> {
        if self.kind.accepts(value) {
            Ok(())
        } else {
            Err(StateError::TypeMismatch {
                field: self.name.clone(),
                expected: self.kind.to_string(),
                found: value.kind().to_string(),
            })
        }
    }
}

/// Read-only view of a computed field's resolved inputs.
///
/// The tree resolves and evaluates every declared input before invoking the
/// compute function, so compute bodies stay pure and cannot mutate state.
pub struct ComputeScope {
    inputs: BTreeMap<String, Value>,
}

impl ComputeScope {
    pub fn new(inputs: BTreeMap<String, Value>) -> Self {
        Self { inputs }
    }

    /// Get an input by its declared name. Missing inputs read as `Null`.
    pub fn get(&self, name: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.inputs.get(name).unwrap_or(&NULL)
    }

    pub fn int(&self, name: &str) -> i64 {
        self.get(name).as_int().unwrap_or(0)
    }

    pub fn str(&self, name: &str) -> &str {
        self.get(name).as_str().unwrap_or("")
    }

    pub fn list(&self, name: &str) -> &[Value] {
        self.get(name).as_list().unwrap_or(&[])
    }
}

/// A pure function from resolved inputs to a value.
pub type ComputeFn = Arc<dyn Fn(&ComputeScope) -> Value + Send + Sync>;

/// A declared computed field.
#[derive(Clone)]
pub struct ComputedDef {
    pub name: String,
    /// Input specs: bare field names (same node) or absolute
    /// `node.path.field` addresses.
    pub inputs: Vec<String>,
    pub compute: ComputeFn,
}

impl std::fmt::Debug for ComputedDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedDef")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .finish()
    }
}

/// The schema of one state node: plain fields, computed fields and child
/// node schemas (sub-state trees).
#[derive(Clone, Debug, Default)]
pub struct NodeSchema {
    pub fields: BTreeMap<String, FieldDef>,
    pub computed: BTreeMap<String, ComputedDef>,
    pub children: BTreeMap<String, NodeSchema>,
}

impl NodeSchema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Whether a name is declared as a plain or computed field.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name) || self.computed.contains_key(name)
    }
}

/// Builder for node schemas.
pub struct SchemaBuilder {
    schema: NodeSchema,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self {
            schema: NodeSchema::default(),
        }
    }

    /// Declare a plain field with its kind and default.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind, default: Value) -> Self {
        let name = name.into();
        self.schema.fields.insert(
            name.clone(),
            FieldDef {
                name,
                kind,
                default,
            },
        );
        self
    }

    /// Declare a computed field with its inputs and compute function.
    pub fn computed<I, S, F>(mut self, name: impl Into<String>, inputs: I, compute: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&ComputeScope) -> Value + Send + Sync + 'static,
    {
        let name = name.into();
        self.schema.computed.insert(
            name.clone(),
            ComputedDef {
                name,
                inputs: inputs.into_iter().map(Into::into).collect(),
                compute: Arc::new(compute),
            },
        );
        self
    }

    /// Attach a child node schema (sub-state tree).
    pub fn child(mut self, name: impl Into<String>, schema: NodeSchema) -> Self {
        self.schema.children.insert(name.into(), schema);
        self
    }

    /// Validate and finish. Defaults must match their declared kind, and
    /// same-node computed dependencies must be acyclic. Cross-node cycles
    /// are checked when the schema is instantiated into a tree, where
    /// absolute paths are known.
    pub fn build(self) -> Result<NodeSchema> {
        for def in self.schema.fields.values() {
            def.validate(&def.default)?;
        }
        check_local_cycles(&self.schema)?;
        Ok(self.schema)
    }
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Depth-first cycle check over same-node computed dependencies.
fn check_local_cycles(schema: &NodeSchema) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        schema: &NodeSchema,
        name: &str,
        marks: &mut BTreeMap<String, Mark>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(StateError::DependencyCycle(name.to_string())),
            None => {}
        }
        marks.insert(name.to_string(), Mark::Visiting);
        if let Some(def) = schema.computed.get(name) {
            for input in &def.inputs {
                // Only bare names can form local cycles; dotted inputs are
                // resolved (and cycle-checked) at tree instantiation.
                if !input.contains('.') && schema.computed.contains_key(input.as_str()) {
                    visit(schema, input, marks)?;
                }
            }
        }
        marks.insert(name.to_string(), Mark::Done);
        Ok(())
    }

    let mut marks = BTreeMap::new();
    for name in schema.computed.keys() {
        visit(schema, name, &mut marks)?;
    }
    for child in schema.children.values() {
        check_local_cycles(child)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_basic() {
        let schema = NodeSchema::builder()
            .field("count", FieldKind::Int, Value::Int(0))
            .computed("double", ["count"], |s| Value::Int(s.int("count") * 2))
            .build()
            .unwrap();

        assert!(schema.has_field("count"));
        assert!(schema.has_field("double"));
        assert!(!schema.has_field("missing"));
    }

    #[test]
    fn test_default_must_match_kind() {
        let err = NodeSchema::builder()
            .field("count", FieldKind::Int, Value::Str("oops".to_string()))
            .build()
            .unwrap_err();

        assert!(matches!(err, StateError::TypeMismatch { .. }));
    }

    #[test]
    fn test_local_cycle_rejected_at_build() {
        let err = NodeSchema::builder()
            .computed("a", ["b"], |_| Value::Null)
            .computed("b", ["a"], |_| Value::Null)
            .build()
            .unwrap_err();

        assert!(matches!(err, StateError::DependencyCycle(_)));
    }

    #[test]
    fn test_self_cycle_rejected() {
        let err = NodeSchema::builder()
            .computed("a", ["a"], |_| Value::Null)
            .build()
            .unwrap_err();

        assert!(matches!(err, StateError::DependencyCycle(_)));
    }

    #[test]
    fn test_computed_chain_is_fine() {
        let schema = NodeSchema::builder()
            .field("x", FieldKind::Int, Value::Int(1))
            .computed("y", ["x"], |s| Value::Int(s.int("x") + 1))
            .computed("z", ["y"], |s| Value::Int(s.int("y") + 1))
            .build();

        assert!(schema.is_ok());
    }

    #[test]
    fn test_null_only_for_refs() {
        assert!(FieldKind::Ref.accepts(&Value::Null));
        assert!(!FieldKind::Int.accepts(&Value::Null));
        assert!(!FieldKind::Str.accepts(&Value::Null));
    }
}
