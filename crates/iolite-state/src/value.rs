//! The wire-representable value model.
//!
//! Every field value is JSON-compatible: primitives, ordered sequences,
//! key-ordered mappings, plus a tagged-pointer form for nested state-node
//! references. References serialize as `{"__ref": "root.child"}` so a
//! referenced sub-node is shipped as a pointer, never an embedded copy.

use crate::path::NodePath;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A reference to another state node, serialized as `{"__ref": path}`.
/// Unknown keys are rejected so an ordinary mapping that merely contains
/// a `__ref` entry never parses as a reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeRef {
    #[serde(rename = "__ref")]
    pub path: NodePath,
}

impl NodeRef {
    pub fn new(path: impl Into<NodePath>) -> Self {
        Self { path: path.into() }
    }
}

/// A field value.
///
/// `Ref` must precede `Map` so the untagged deserializer claims
/// `{"__ref": ...}` objects before the generic mapping arm does.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Ref(NodeRef),
    Map(BTreeMap<String, Value>),
}

/// The semantic kind of a value, used for schema validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
    Ref,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Str => "str",
            ValueKind::List => "list",
            ValueKind::Map => "map",
            ValueKind::Ref => "ref",
        };
        write!(f, "{}", name)
    }
}

impl Value {
    /// Create a reference value pointing at another node.
    pub fn node_ref(path: impl Into<NodePath>) -> Self {
        Value::Ref(NodeRef::new(path))
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::List(_) => ValueKind::List,
            Value::Ref(_) => ValueKind::Ref,
            Value::Map(_) => ValueKind::Map,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_ref_path(&self) -> Option<&NodePath> {
        match self {
            Value::Ref(r) => Some(&r.path),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_json_roundtrip() {
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(42),
            Value::Float(2.5),
            Value::Str("hello".to_string()),
        ];
        for v in values {
            let json = serde_json::to_string(&v).unwrap();
            let back: Value = serde_json::from_str(&json).unwrap();
            assert_eq!(back, v);
        }
    }

    #[test]
    fn test_ref_serializes_as_tagged_pointer() {
        let v = Value::node_ref("root.todo");
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"__ref":"root.todo"}"#);

        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_plain_map_is_not_a_ref() {
        let mut m = BTreeMap::new();
        m.insert("a".to_string(), Value::Int(1));
        let v = Value::Map(m);
        let json = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), ValueKind::Map);
    }

    #[test]
    fn test_map_keys_serialize_ordered() {
        let mut m = BTreeMap::new();
        m.insert("zeta".to_string(), Value::Int(1));
        m.insert("alpha".to_string(), Value::Int(2));
        let json = serde_json::to_string(&Value::Map(m)).unwrap();
        assert_eq!(json, r#"{"alpha":2,"zeta":1}"#);
    }

    #[test]
    fn test_nested_list_roundtrip() {
        let v = Value::List(vec![
            Value::Int(1),
            Value::Str("two".to_string()),
            Value::node_ref("root.sub"),
        ]);
        let json = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
