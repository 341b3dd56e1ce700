//! Delta encoding: turning a tree flush into a wire delta.
//!
//! Work is proportional to the number of dirty fields; the encoder never
//! walks the whole tree for an incremental delta. Nested state references
//! are already `Value::Ref` pointers, so a referenced sub-node travels as
//! a `{"__ref": path}` tag and is never embedded twice in one payload.

use crate::wire::{DeltaMsg, Seq};
use iolite_state::{FlushSet, Result, StateTree};

/// Encode a flush (the dirty set of an entire session tree, possibly many
/// nodes touched by one handler invocation) into a single delta.
pub fn encode_flush(session_token: &str, seq: Seq, flush: FlushSet) -> DeltaMsg {
    let mut delta = DeltaMsg::new(session_token, seq);
    for (path, changes) in flush {
        let fields = delta.nodes.entry(path.to_string()).or_default();
        for (field, value) in changes {
            fields.insert(field, value);
        }
    }
    delta
}

/// Encode a full-state snapshot: every field of every node, computed
/// fields included, tagged with the given sequence number (0 for a fresh
/// session, the current seq for a resync baseline).
pub fn encode_snapshot(session_token: &str, seq: Seq, tree: &mut StateTree) -> Result<DeltaMsg> {
    let snapshot = tree.snapshot()?;
    Ok(encode_flush(session_token, seq, snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::SNAPSHOT_SEQ;
    use iolite_state::{FieldKind, NodePath, NodeSchema, Value};

    fn demo_tree() -> StateTree {
        let sub = NodeSchema::builder()
            .field("total", FieldKind::Int, Value::Int(0))
            .build()
            .unwrap();
        let schema = NodeSchema::builder()
            .field("count", FieldKind::Int, Value::Int(0))
            .field("peer", FieldKind::Ref, Value::node_ref("root.stats"))
            .computed("double", ["count"], |s| Value::Int(s.int("count") * 2))
            .child("stats", sub)
            .build()
            .unwrap();
        StateTree::instantiate(&schema).unwrap()
    }

    #[test]
    fn test_encode_only_changed_fields() {
        let mut tree = demo_tree();
        let root = NodePath::root();
        tree.set(&root, "count", Value::Int(1)).unwrap();

        let delta = encode_flush("tok", 1, tree.flush_dirty().unwrap());
        assert_eq!(delta.seq, 1);
        assert_eq!(delta.field("root", "count"), Some(&Value::Int(1)));
        assert_eq!(delta.field("root", "double"), Some(&Value::Int(2)));
        // The untouched child node does not appear at all.
        assert!(!delta.nodes.contains_key("root.stats"));
        // Nor does the unchanged ref field.
        assert!(delta.field("root", "peer").is_none());
    }

    #[test]
    fn test_multi_node_flush_is_one_delta() {
        let mut tree = demo_tree();
        tree.set(&NodePath::root(), "count", Value::Int(2)).unwrap();
        tree.set(&NodePath::parse("root.stats"), "total", Value::Int(5))
            .unwrap();

        let delta = encode_flush("tok", 1, tree.flush_dirty().unwrap());
        assert_eq!(delta.nodes.len(), 2);
        assert_eq!(delta.field("root.stats", "total"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_snapshot_has_every_field() {
        let mut tree = demo_tree();
        let snap = encode_snapshot("tok", SNAPSHOT_SEQ, &mut tree).unwrap();
        assert_eq!(snap.seq, SNAPSHOT_SEQ);
        assert_eq!(snap.field("root", "count"), Some(&Value::Int(0)));
        assert_eq!(snap.field("root", "double"), Some(&Value::Int(0)));
        assert_eq!(snap.field("root.stats", "total"), Some(&Value::Int(0)));
    }

    #[test]
    fn test_refs_serialize_as_pointers() {
        let mut tree = demo_tree();
        let snap = encode_snapshot("tok", SNAPSHOT_SEQ, &mut tree).unwrap();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["nodes"]["root"]["peer"]["__ref"], "root.stats");
    }
}
