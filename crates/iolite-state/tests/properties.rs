//! Property-based tests for the dirty tracker contract:
//! flushes must report exactly the fields whose final value differs from
//! the value at the previous flush, with no false positives or negatives,
//! and computed fields must recompute correctly after their inputs change.

use iolite_state::{FieldKind, NodePath, NodeSchema, StateTree, Value};
use proptest::prelude::*;
use std::collections::BTreeMap;

const FIELDS: [&str; 3] = ["a", "b", "c"];

fn three_field_schema() -> NodeSchema {
    NodeSchema::builder()
        .field("a", FieldKind::Int, Value::Int(0))
        .field("b", FieldKind::Int, Value::Int(0))
        .field("c", FieldKind::Int, Value::Int(0))
        .build()
        .expect("static schema")
}

fn sum_schema() -> NodeSchema {
    NodeSchema::builder()
        .field("a", FieldKind::Int, Value::Int(0))
        .field("b", FieldKind::Int, Value::Int(0))
        .computed("sum", ["a", "b"], |s| Value::Int(s.int("a") + s.int("b")))
        .build()
        .expect("static schema")
}

/// A random sequence of (field index, value) writes.
fn writes_strategy() -> impl Strategy<Value = Vec<(usize, i64)>> {
    prop::collection::vec((0usize..3, -10i64..10), 0..30)
}

proptest! {
    #[test]
    fn flush_reports_exactly_net_changes(writes in writes_strategy()) {
        let mut tree = StateTree::instantiate(&three_field_schema()).unwrap();
        let root = NodePath::root();

        // Model: the value at the previous flush (defaults here).
        let at_flush: BTreeMap<&str, i64> = FIELDS.iter().map(|f| (*f, 0)).collect();
        let mut current = at_flush.clone();

        for (idx, value) in &writes {
            let field = FIELDS[*idx];
            tree.set(&root, field, Value::Int(*value)).unwrap();
            current.insert(field, *value);
        }

        let flush = tree.flush_dirty().unwrap();
        let mut reported: BTreeMap<String, i64> = BTreeMap::new();
        for (_, changes) in &flush {
            for (field, value) in changes {
                reported.insert(field.clone(), value.as_int().unwrap());
            }
        }

        for field in FIELDS {
            let expected_changed = current[field] != at_flush[field];
            prop_assert_eq!(
                reported.contains_key(field),
                expected_changed,
                "field {} misreported", field
            );
            if expected_changed {
                prop_assert_eq!(reported[field], current[field]);
            }
        }

        // A second flush with no writes reports nothing.
        prop_assert!(tree.flush_dirty().unwrap().is_empty());
    }

    #[test]
    fn flush_baseline_moves_forward(
        first in writes_strategy(),
        second in writes_strategy(),
    ) {
        let mut tree = StateTree::instantiate(&three_field_schema()).unwrap();
        let root = NodePath::root();

        for (idx, value) in &first {
            tree.set(&root, FIELDS[*idx], Value::Int(*value)).unwrap();
        }
        let _ = tree.flush_dirty().unwrap();

        let mut at_flush: BTreeMap<&str, i64> = BTreeMap::new();
        for field in FIELDS {
            at_flush.insert(field, tree.get(&root, field).unwrap().as_int().unwrap());
        }

        let mut current = at_flush.clone();
        for (idx, value) in &second {
            tree.set(&root, FIELDS[*idx], Value::Int(*value)).unwrap();
            current.insert(FIELDS[*idx], *value);
        }

        let flush = tree.flush_dirty().unwrap();
        let mut reported: BTreeMap<String, i64> = BTreeMap::new();
        for (_, changes) in &flush {
            for (field, value) in changes {
                reported.insert(field.clone(), value.as_int().unwrap());
            }
        }

        for field in FIELDS {
            prop_assert_eq!(reported.contains_key(field), current[field] != at_flush[field]);
        }
    }

    #[test]
    fn revert_restores_last_flush(
        first in writes_strategy(),
        second in writes_strategy(),
    ) {
        let mut tree = StateTree::instantiate(&three_field_schema()).unwrap();
        let root = NodePath::root();

        for (idx, value) in &first {
            tree.set(&root, FIELDS[*idx], Value::Int(*value)).unwrap();
        }
        let _ = tree.flush_dirty().unwrap();

        let mut at_flush: BTreeMap<&str, i64> = BTreeMap::new();
        for field in FIELDS {
            at_flush.insert(field, tree.get(&root, field).unwrap().as_int().unwrap());
        }

        for (idx, value) in &second {
            tree.set(&root, FIELDS[*idx], Value::Int(*value)).unwrap();
        }
        tree.revert_dirty();

        for field in FIELDS {
            prop_assert_eq!(
                tree.get(&root, field).unwrap().as_int().unwrap(),
                at_flush[field]
            );
        }
        prop_assert!(tree.flush_dirty().unwrap().is_empty());
    }

    #[test]
    fn computed_always_reads_current_inputs(writes in writes_strategy()) {
        let mut tree = StateTree::instantiate(&sum_schema()).unwrap();
        let root = NodePath::root();

        let mut a = 0i64;
        let mut b = 0i64;
        for (idx, value) in &writes {
            match idx % 2 {
                0 => {
                    tree.set(&root, "a", Value::Int(*value)).unwrap();
                    a = *value;
                }
                _ => {
                    tree.set(&root, "b", Value::Int(*value)).unwrap();
                    b = *value;
                }
            }
            prop_assert_eq!(tree.get(&root, "sum").unwrap(), Value::Int(a + b));
        }
    }
}
