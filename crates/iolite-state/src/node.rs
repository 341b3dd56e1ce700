//! State nodes and dirty tracking.
//!
//! A node records, per touched field, the value as of the last flush (its
//! baseline). Flushes compare against the baseline, so a field set back to
//! its previous value is not reported, and a failed handler can be rolled
//! back to the last flushed state without a full tree copy.

use crate::error::{Result, StateError};
use crate::path::NodePath;
use crate::schema::NodeSchema;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Tracks which fields changed since the last flush.
#[derive(Clone, Debug, Default)]
pub struct DirtyTracker {
    /// Plain fields touched since the last flush.
    dirty: BTreeSet<String>,
    /// Value at the last flush for every touched field.
    baseline: BTreeMap<String, Value>,
    /// Computed fields whose memo was invalidated.
    dirty_computed: BTreeSet<String>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mutation of `field` whose pre-mutation value was `old`.
    /// Only the first mutation since a flush captures the baseline.
    pub fn record(&mut self, field: &str, old: &Value) {
        if !self.baseline.contains_key(field) {
            self.baseline.insert(field.to_string(), old.clone());
        }
        self.dirty.insert(field.to_string());
    }

    pub fn mark_computed(&mut self, name: &str) -> bool {
        self.dirty_computed.insert(name.to_string())
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty() || !self.dirty_computed.is_empty()
    }

    pub fn dirty_fields(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(|s| s.as_str())
    }

    pub fn dirty_computed(&self) -> impl Iterator<Item = &str> {
        self.dirty_computed.iter().map(|s| s.as_str())
    }

    pub fn baseline_of(&self, field: &str) -> Option<&Value> {
        self.baseline.get(field)
    }

    fn clear_plain(&mut self) {
        self.dirty.clear();
        self.baseline.clear();
    }
}

/// One state node: a structured bag of named fields plus computed fields,
/// addressed by a stable path within the session's tree.
#[derive(Clone, Debug)]
pub struct StateNode {
    path: NodePath,
    schema: Arc<NodeSchema>,
    values: BTreeMap<String, Value>,
    /// Current memoized computed values. An entry is trusted only while its
    /// name is absent from the tracker's dirty-computed set.
    memo: BTreeMap<String, Value>,
    /// Computed values as of the last flush/snapshot.
    flushed_computed: BTreeMap<String, Value>,
    tracker: DirtyTracker,
}

impl StateNode {
    /// Create a node with every field at its declared default.
    pub fn from_schema(path: NodePath, schema: Arc<NodeSchema>) -> Self {
        let values = schema
            .fields
            .iter()
            .map(|(name, def)| (name.clone(), def.default.clone()))
            .collect();
        Self {
            path,
            schema,
            values,
            memo: BTreeMap::new(),
            flushed_computed: BTreeMap::new(),
            tracker: DirtyTracker::new(),
        }
    }

    pub fn path(&self) -> &NodePath {
        &self.path
    }

    pub fn schema(&self) -> &NodeSchema {
        &self.schema
    }

    pub fn tracker(&self) -> &DirtyTracker {
        &self.tracker
    }

    /// Read a plain field.
    pub fn get(&self, field: &str) -> Result<&Value> {
        self.values
            .get(field)
            .ok_or_else(|| StateError::UnknownField(format!("{}.{}", self.path, field)))
    }

    /// Write a plain field, validating against the declared kind and
    /// recording the change for the next flush.
    pub fn set(&mut self, field: &str, value: Value) -> Result<()> {
        if self.schema.computed.contains_key(field) {
            return Err(StateError::ComputedFieldReadOnly(format!(
                "{}.{}",
                self.path, field
            )));
        }
        let def = self
            .schema
            .fields
            .get(field)
            .ok_or_else(|| StateError::UnknownField(format!("{}.{}", self.path, field)))?;
        def.validate(&value)?;

        let old = self.values.get(field).cloned().unwrap_or(Value::Null);
        self.tracker.record(field, &old);
        self.values.insert(field.to_string(), value);
        self.invalidate_local_dependents(field);
        Ok(())
    }

    /// Invalidate a computed field's memo. Returns true if it was not
    /// already invalid, and cascades to same-node dependents.
    pub fn invalidate_computed(&mut self, name: &str) -> bool {
        let newly = self.tracker.mark_computed(name);
        if newly {
            self.invalidate_local_dependents(name);
        }
        newly
    }

    /// Mark every same-node computed field that lists `input` among its
    /// bare-name inputs.
    fn invalidate_local_dependents(&mut self, input: &str) {
        let dependents: Vec<String> = self
            .schema
            .computed
            .values()
            .filter(|def| def.inputs.iter().any(|i| i == input))
            .map(|def| def.name.clone())
            .collect();
        for name in dependents {
            self.invalidate_computed(&name);
        }
    }

    /// Whether the memo for a computed field can be trusted.
    pub fn memo_valid(&self, name: &str) -> bool {
        self.memo.contains_key(name) && !self.tracker.dirty_computed.contains(name)
    }

    pub fn memo_of(&self, name: &str) -> Option<&Value> {
        self.memo.get(name)
    }

    /// Store a freshly computed value, marking the memo valid again.
    pub fn store_memo(&mut self, name: &str, value: Value) {
        self.memo.insert(name.to_string(), value);
        self.tracker.dirty_computed.remove(name);
    }

    pub fn flushed_computed_of(&self, name: &str) -> Option<&Value> {
        self.flushed_computed.get(name)
    }

    pub fn record_flushed_computed(&mut self, name: &str, value: Value) {
        self.flushed_computed.insert(name.to_string(), value);
    }

    pub fn is_dirty(&self) -> bool {
        self.tracker.is_dirty()
    }

    /// Drain plain-field changes: exactly the fields whose current value
    /// differs from the baseline at the previous flush.
    pub fn take_dirty_plain(&mut self) -> Vec<(String, Value)> {
        let mut changes = Vec::new();
        let dirty: Vec<String> = self.tracker.dirty.iter().cloned().collect();
        for field in dirty {
            let current = match self.values.get(&field) {
                Some(v) => v,
                None => continue,
            };
            if self.tracker.baseline.get(&field) != Some(current) {
                changes.push((field.clone(), current.clone()));
            }
        }
        self.tracker.clear_plain();
        changes
    }

    /// Restore every touched field to its baseline value, abandoning
    /// un-flushed mutations. Computed memos fall back to their last
    /// flushed values, which are consistent with the restored inputs.
    pub fn revert(&mut self) {
        let baseline = std::mem::take(&mut self.tracker.baseline);
        for (field, old) in baseline {
            self.values.insert(field, old);
        }
        self.tracker.dirty.clear();
        for name in std::mem::take(&mut self.tracker.dirty_computed) {
            match self.flushed_computed.get(&name) {
                Some(v) => {
                    let v = v.clone();
                    self.memo.insert(name, v);
                }
                None => {
                    self.memo.remove(&name);
                }
            }
        }
    }

    /// All plain field names and current values, in key order.
    pub fn all_fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// All computed field names, in key order.
    pub fn computed_names(&self) -> Vec<String> {
        self.schema.computed.keys().cloned().collect()
    }
}
