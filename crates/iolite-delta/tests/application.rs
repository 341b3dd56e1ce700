//! Round-trip fidelity: applying the encoded deltas of successive flushes,
//! in sequence order, to a naive mirror must reproduce the backend tree
//! exactly at every step.

use iolite_delta::{encode_snapshot, DeltaLog, DeltaMsg, SNAPSHOT_SEQ};
use iolite_state::{FieldKind, NodePath, NodeSchema, StateTree, Value};
use proptest::prelude::*;
use std::collections::BTreeMap;

type Mirror = BTreeMap<String, BTreeMap<String, Value>>;

fn apply(mirror: &mut Mirror, delta: &DeltaMsg) {
    for (path, fields) in &delta.nodes {
        let entry = mirror.entry(path.clone()).or_default();
        for (field, value) in fields {
            entry.insert(field.clone(), value.clone());
        }
    }
}

fn schema() -> NodeSchema {
    let sub = NodeSchema::builder()
        .field("total", FieldKind::Int, Value::Int(0))
        .build()
        .unwrap();
    NodeSchema::builder()
        .field("count", FieldKind::Int, Value::Int(0))
        .field("log", FieldKind::List, Value::List(Vec::new()))
        .computed("double", ["count"], |s| Value::Int(s.int("count") * 2))
        .child("stats", sub)
        .build()
        .unwrap()
}

/// Random write batches: each batch becomes one flush/delta.
fn batches_strategy() -> impl Strategy<Value = Vec<Vec<(u8, i64)>>> {
    prop::collection::vec(prop::collection::vec((0u8..3, -20i64..20), 1..5), 0..10)
}

fn apply_write(tree: &mut StateTree, which: u8, value: i64) {
    let root = NodePath::root();
    match which {
        0 => tree.set(&root, "count", Value::Int(value)).unwrap(),
        1 => {
            let mut list = tree
                .get(&root, "log")
                .unwrap()
                .as_list()
                .unwrap_or(&[])
                .to_vec();
            list.push(Value::Int(value));
            tree.set(&root, "log", Value::List(list)).unwrap();
        }
        _ => tree
            .set(&NodePath::parse("root.stats"), "total", Value::Int(value))
            .unwrap(),
    }
}

proptest! {
    #[test]
    fn deltas_reproduce_backend_state(batches in batches_strategy()) {
        let mut tree = StateTree::instantiate(&schema()).unwrap();
        let mut log = DeltaLog::new("tok");

        // Baseline: the seq-0 snapshot.
        let mut mirror = Mirror::new();
        let snap = encode_snapshot("tok", SNAPSHOT_SEQ, &mut tree).unwrap();
        apply(&mut mirror, &snap);

        let mut expected_seq = 0u64;
        for batch in &batches {
            for (which, value) in batch {
                apply_write(&mut tree, *which, *value);
            }
            let flush = tree.flush_dirty().unwrap();
            if let Some(delta) = log.append(flush) {
                expected_seq += 1;
                prop_assert_eq!(delta.seq, expected_seq);
                apply(&mut mirror, &delta);
            }

            // After every applied delta the mirror matches a fresh
            // snapshot of the backend.
            let reference = encode_snapshot("tok", SNAPSHOT_SEQ, &mut tree).unwrap();
            let mut reference_mirror = Mirror::new();
            apply(&mut reference_mirror, &reference);
            prop_assert_eq!(&mirror, &reference_mirror);
        }
    }
}
