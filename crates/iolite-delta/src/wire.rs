//! Wire messages exchanged between the engine and its clients.
//!
//! Both message bodies are JSON-compatible. Deltas address changed fields
//! by node path; node-path and field maps are key-ordered so encodings are
//! deterministic.

use chrono::{DateTime, Utc};
use iolite_state::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Delta sequence number. Monotonic and gap-free per session.
pub type Seq = u64;

/// Sequence number reserved for the full snapshot of a fresh session.
pub const SNAPSHOT_SEQ: Seq = 0;

/// An inbound event: `{session_token, handler_path, args}` plus the
/// client-assigned send timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventMsg {
    pub session_token: String,
    /// Dotted `node.path.handler` address, e.g. `root.increment`.
    pub handler_path: String,
    pub args: Vec<Value>,
    /// When the client emitted the event.
    pub client_ts: DateTime<Utc>,
}

impl EventMsg {
    pub fn new(
        session_token: impl Into<String>,
        handler_path: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            session_token: session_token.into(),
            handler_path: handler_path.into(),
            args,
            client_ts: Utc::now(),
        }
    }

    /// The node path portion of the handler path (everything before the
    /// final segment), as a string.
    pub fn node_path(&self) -> Option<String> {
        self.handler_path
            .rsplit_once('.')
            .map(|(node, _)| node.to_string())
    }
}

/// An outbound delta: `{session_token, seq, nodes: {path: {field: value}}}`.
///
/// Applying deltas in sequence order reproduces the backend tree exactly.
/// Ordered-sequence fields use full-replacement encoding: a delta carries
/// the entire updated list, never a positional patch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeltaMsg {
    pub session_token: String,
    pub seq: Seq,
    pub nodes: BTreeMap<String, BTreeMap<String, Value>>,
}

impl DeltaMsg {
    pub fn new(session_token: impl Into<String>, seq: Seq) -> Self {
        Self {
            session_token: session_token.into(),
            seq,
            nodes: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total changed fields across all nodes.
    pub fn field_count(&self) -> usize {
        self.nodes.values().map(|fields| fields.len()).sum()
    }

    /// Look up a changed field by node path and name.
    pub fn field(&self, node: &str, field: &str) -> Option<&Value> {
        self.nodes.get(node).and_then(|fields| fields.get(field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let ev = EventMsg::new("tok", "root.increment", vec![Value::Int(1)]);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["session_token"], "tok");
        assert_eq!(json["handler_path"], "root.increment");
        assert_eq!(json["args"][0], 1);
    }

    #[test]
    fn test_event_node_path() {
        let ev = EventMsg::new("tok", "root.todo.add", vec![]);
        assert_eq!(ev.node_path().as_deref(), Some("root.todo"));
    }

    #[test]
    fn test_delta_roundtrip() {
        let mut delta = DeltaMsg::new("tok", 3);
        delta
            .nodes
            .entry("root".to_string())
            .or_default()
            .insert("count".to_string(), Value::Int(7));

        let json = serde_json::to_string(&delta).unwrap();
        let back: DeltaMsg = serde_json::from_str(&json).unwrap();
        assert_eq!(back, delta);
        assert_eq!(back.field("root", "count"), Some(&Value::Int(7)));
    }

    #[test]
    fn test_delta_nodes_are_key_ordered() {
        let mut delta = DeltaMsg::new("tok", 1);
        delta.nodes.entry("root.z".to_string()).or_default();
        delta.nodes.entry("root.a".to_string()).or_default();
        let json = serde_json::to_string(&delta).unwrap();
        let a = json.find("root.a").unwrap();
        let z = json.find("root.z").unwrap();
        assert!(a < z);
    }
}
