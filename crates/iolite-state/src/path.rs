//! Path addressing for state nodes and fields.
//!
//! A node path is a dot-separated sequence of names from the root
//! (`root.todo`). A field address appends the field name
//! (`root.todo.items`). Paths are the only addressing contract the engine
//! exposes: deltas key on them, and markup binding generators consume them
//! as read-only symbolic references.

use serde::{Deserialize, Serialize};

/// A stable path identifying one state node within a session's tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePath(Vec<String>);

impl NodePath {
    /// The conventional root path.
    pub fn root() -> Self {
        Self(vec!["root".to_string()])
    }

    /// Create a path from segments.
    pub fn new(segments: Vec<String>) -> Self {
        Self(segments)
    }

    /// Parse a path from dot notation (e.g., "root.todo").
    pub fn parse(path: &str) -> Self {
        if path.is_empty() {
            return Self(Vec::new());
        }
        Self(path.split('.').map(|s| s.to_string()).collect())
    }

    /// Get the segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get the parent path.
    pub fn parent(&self) -> Option<Self> {
        if self.0.len() <= 1 {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Get the last segment.
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(|s| s.as_str())
    }

    /// Create a child path.
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut new = self.clone();
        new.0.push(name.into());
        new
    }

    /// Split a dotted `node.path.field` address into node path and field
    /// name. Returns `None` for paths with fewer than two segments.
    pub fn split_field(addr: &str) -> Option<(NodePath, String)> {
        let path = Self::parse(addr);
        if path.0.len() < 2 {
            return None;
        }
        let mut segments = path.0;
        let field = segments.pop().expect("checked above");
        Some((Self(segments), field))
    }
}

impl std::fmt::Display for NodePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<&str> for NodePath {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl Serialize for NodePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodePath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// A fully qualified field address: node path plus field name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldAddr {
    pub node: NodePath,
    pub field: String,
}

impl FieldAddr {
    pub fn new(node: NodePath, field: impl Into<String>) -> Self {
        Self {
            node,
            field: field.into(),
        }
    }

    /// Parse a dotted `node.path.field` address.
    pub fn parse(addr: &str) -> Option<Self> {
        NodePath::split_field(addr).map(|(node, field)| Self { node, field })
    }
}

impl std::fmt::Display for FieldAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node, self.field)
    }
}
