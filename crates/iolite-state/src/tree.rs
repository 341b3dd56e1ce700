//! The session-scoped state tree.
//!
//! Nodes live in an arena indexed by path; references between nodes are
//! path strings, never direct pointers, so nested and mutually-referential
//! layouts cannot form ownership cycles. Computed-field dependencies are
//! resolved to absolute field addresses when the schema is instantiated,
//! and the whole dependency graph is cycle-checked at that point.

use crate::error::{Result, StateError};
use crate::node::StateNode;
use crate::path::{FieldAddr, NodePath};
use crate::schema::{ComputeScope, NodeSchema};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Per-node field changes produced by a flush or snapshot, in path order.
pub type FlushSet = Vec<(NodePath, Vec<(String, Value)>)>;

/// Arena of state nodes for one session.
#[derive(Clone, Debug)]
pub struct StateTree {
    nodes: BTreeMap<NodePath, StateNode>,
    /// Reverse dependency index: input address -> computed fields that
    /// consume it (possibly in other nodes).
    dependents: HashMap<FieldAddr, Vec<FieldAddr>>,
    /// Nodes with pending dirty state, so flushing is proportional to what
    /// changed rather than to tree size.
    dirty_nodes: BTreeSet<NodePath>,
}

impl StateTree {
    /// Instantiate a schema into a fresh tree rooted at `root`, with every
    /// field at its default. Fails with `DependencyCycle` or
    /// `UnknownComputedInput` before any node is observable.
    pub fn instantiate(schema: &NodeSchema) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        build_nodes(NodePath::root(), schema, &mut nodes);

        let mut tree = Self {
            nodes,
            dependents: HashMap::new(),
            dirty_nodes: BTreeSet::new(),
        };
        tree.index_dependencies()?;
        tree.check_cycles()?;
        tree.prime_computed()?;
        Ok(tree)
    }

    /// All node paths, in order.
    pub fn node_paths(&self) -> impl Iterator<Item = &NodePath> {
        self.nodes.keys()
    }

    pub fn contains_node(&self, path: &NodePath) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn node(&self, path: &NodePath) -> Result<&StateNode> {
        self.nodes
            .get(path)
            .ok_or_else(|| StateError::NodeNotFound(path.to_string()))
    }

    /// Every addressable field path (`root.child.field`), plain and
    /// computed, in order. This is the naming contract consumed by markup
    /// binding generators.
    pub fn field_paths(&self) -> Vec<FieldAddr> {
        let mut out = Vec::new();
        for (path, node) in &self.nodes {
            for (field, _) in node.all_fields() {
                out.push(FieldAddr::new(path.clone(), field));
            }
            for name in node.computed_names() {
                out.push(FieldAddr::new(path.clone(), name));
            }
        }
        out
    }

    /// Read a field. Computed fields recompute lazily and memoize until an
    /// input is dirtied.
    pub fn get(&mut self, path: &NodePath, field: &str) -> Result<Value> {
        let is_computed = self.node(path)?.schema().computed.contains_key(field);
        if is_computed {
            let addr = FieldAddr::new(path.clone(), field);
            self.ensure_computed(&addr)
        } else {
            self.node(path)?.get(field).cloned()
        }
    }

    /// Write a field, marking it and every transitive computed dependent
    /// dirty. The dependent memos are invalidated without recomputing.
    pub fn set(&mut self, path: &NodePath, field: &str, value: Value) -> Result<()> {
        {
            let node = self
                .nodes
                .get_mut(path)
                .ok_or_else(|| StateError::NodeNotFound(path.to_string()))?;
            node.set(field, value)?;
        }
        self.dirty_nodes.insert(path.clone());
        self.invalidate_dependents(&FieldAddr::new(path.clone(), field));
        Ok(())
    }

    /// Whether any node has un-flushed changes.
    pub fn is_dirty(&self) -> bool {
        !self.dirty_nodes.is_empty()
    }

    /// Drain all pending changes: exactly the fields (plain and computed)
    /// whose value differs from the previous flush. Work is proportional to
    /// the number of dirty fields.
    pub fn flush_dirty(&mut self) -> Result<FlushSet> {
        let dirty: Vec<NodePath> = std::mem::take(&mut self.dirty_nodes).into_iter().collect();

        // Capture every node's dirty-computed names before recomputing
        // anything: recomputation clears the marks as a side effect, and a
        // cross-node input chain can settle a later node's computed field
        // while an earlier one flushes. The captured names are what must be
        // compared against their last flushed values, fresh memo or not.
        let dirty_computed: Vec<(NodePath, Vec<String>)> = dirty
            .iter()
            .map(|path| {
                let names = self
                    .nodes
                    .get(path)
                    .map(|n| n.tracker().dirty_computed().map(String::from).collect())
                    .unwrap_or_default();
                (path.clone(), names)
            })
            .collect();

        let mut out = Vec::new();
        for (path, computed) in dirty_computed {
            let mut changes = match self.nodes.get_mut(&path) {
                Some(node) => node.take_dirty_plain(),
                None => continue,
            };

            for name in computed {
                let addr = FieldAddr::new(path.clone(), &name);
                let value = self.ensure_computed(&addr)?;
                let node = self.nodes.get_mut(&path).expect("node existed above");
                if node.flushed_computed_of(&name) != Some(&value) {
                    node.record_flushed_computed(&name, value.clone());
                    changes.push((name, value));
                }
            }

            if !changes.is_empty() {
                out.push((path, changes));
            }
        }
        Ok(out)
    }

    /// Abandon all un-flushed changes, restoring the state as of the last
    /// successful flush.
    pub fn revert_dirty(&mut self) {
        for path in std::mem::take(&mut self.dirty_nodes) {
            if let Some(node) = self.nodes.get_mut(&path) {
                node.revert();
            }
        }
    }

    /// Every field of every node (computed included), for full-state
    /// snapshots. Also settles the flush baselines, so a snapshot counts as
    /// a flush of everything.
    pub fn snapshot(&mut self) -> Result<FlushSet> {
        // Settle pending dirt first so baselines reset.
        let _ = self.flush_dirty()?;

        let paths: Vec<NodePath> = self.nodes.keys().cloned().collect();
        let mut out = Vec::new();
        for path in paths {
            let mut fields: Vec<(String, Value)> = self
                .node(&path)?
                .all_fields()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect();
            for name in self.node(&path)?.computed_names() {
                let addr = FieldAddr::new(path.clone(), &name);
                let value = self.ensure_computed(&addr)?;
                let node = self.nodes.get_mut(&path).expect("node existed above");
                node.record_flushed_computed(&name, value.clone());
                fields.push((name, value));
            }
            out.push((path, fields));
        }
        Ok(out)
    }

    /// Recompute a computed field if its memo is stale, memoizing the
    /// result. Inputs that are themselves computed are ensured first; the
    /// registration-time cycle check guarantees termination.
    fn ensure_computed(&mut self, addr: &FieldAddr) -> Result<Value> {
        {
            let node = self.node(&addr.node)?;
            if node.memo_valid(&addr.field) {
                return Ok(node
                    .memo_of(&addr.field)
                    .expect("memo_valid implies present")
                    .clone());
            }
        }

        let def = self
            .node(&addr.node)?
            .schema()
            .computed
            .get(&addr.field)
            .cloned()
            .ok_or_else(|| StateError::UnknownField(addr.to_string()))?;

        let mut inputs = BTreeMap::new();
        for spec in &def.inputs {
            let input_addr = self.resolve_input(&addr.node, spec)?;
            let value = self.get(&input_addr.node, &input_addr.field)?;
            inputs.insert(spec.clone(), value);
        }

        let value = (def.compute)(&ComputeScope::new(inputs));
        let node = self
            .nodes
            .get_mut(&addr.node)
            .ok_or_else(|| StateError::NodeNotFound(addr.node.to_string()))?;
        node.store_memo(&addr.field, value.clone());
        Ok(value)
    }

    /// Resolve an input spec relative to `node`: bare names address the
    /// same node, dotted specs are absolute `node.path.field` addresses.
    fn resolve_input(&self, node: &NodePath, spec: &str) -> Result<FieldAddr> {
        if spec.contains('.') {
            FieldAddr::parse(spec).ok_or_else(|| StateError::InvalidPath(spec.to_string()))
        } else {
            Ok(FieldAddr::new(node.clone(), spec))
        }
    }

    /// Transitively invalidate computed fields consuming `input`. A
    /// visited set (not the per-node dirty marks, which the node may have
    /// set already for its local dependents) bounds the walk.
    fn invalidate_dependents(&mut self, input: &FieldAddr) {
        let mut visited: BTreeSet<FieldAddr> = BTreeSet::new();
        let mut stack = vec![input.clone()];
        while let Some(addr) = stack.pop() {
            let deps = match self.dependents.get(&addr) {
                Some(d) => d.clone(),
                None => continue,
            };
            for dep in deps {
                if !visited.insert(dep.clone()) {
                    continue;
                }
                if let Some(node) = self.nodes.get_mut(&dep.node) {
                    node.invalidate_computed(&dep.field);
                    self.dirty_nodes.insert(dep.node.clone());
                    stack.push(dep);
                }
            }
        }
    }

    /// Build the reverse dependency index, validating every declared input.
    fn index_dependencies(&mut self) -> Result<()> {
        let mut index: HashMap<FieldAddr, Vec<FieldAddr>> = HashMap::new();
        for (path, node) in &self.nodes {
            for def in node.schema().computed.values() {
                let target = FieldAddr::new(path.clone(), &def.name);
                for spec in &def.inputs {
                    let input = self.resolve_input(path, spec)?;
                    let input_node = self.nodes.get(&input.node).ok_or_else(|| {
                        StateError::UnknownComputedInput {
                            field: target.to_string(),
                            input: spec.clone(),
                        }
                    })?;
                    if !input_node.schema().has_field(&input.field) {
                        return Err(StateError::UnknownComputedInput {
                            field: target.to_string(),
                            input: spec.clone(),
                        });
                    }
                    index.entry(input).or_default().push(target.clone());
                }
            }
        }
        self.dependents = index;
        Ok(())
    }

    /// Depth-first cycle check over the computed dependency graph, across
    /// nodes. Runs once at instantiation.
    fn check_cycles(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            tree: &StateTree,
            addr: &FieldAddr,
            marks: &mut HashMap<FieldAddr, Mark>,
        ) -> Result<()> {
            match marks.get(addr) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(StateError::DependencyCycle(addr.to_string()))
                }
                None => {}
            }
            marks.insert(addr.clone(), Mark::Visiting);
            if let Ok(node) = tree.node(&addr.node) {
                if let Some(def) = node.schema().computed.get(&addr.field) {
                    for spec in &def.inputs {
                        let input = tree.resolve_input(&addr.node, spec)?;
                        let is_computed = tree
                            .node(&input.node)
                            .map(|n| n.schema().computed.contains_key(&input.field))
                            .unwrap_or(false);
                        if is_computed {
                            visit(tree, &input, marks)?;
                        }
                    }
                }
            }
            marks.insert(addr.clone(), Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        let targets: Vec<FieldAddr> = self
            .nodes
            .iter()
            .flat_map(|(path, node)| {
                node.schema()
                    .computed
                    .keys()
                    .map(|name| FieldAddr::new(path.clone(), name))
                    .collect::<Vec<_>>()
            })
            .collect();
        for addr in &targets {
            visit(self, addr, &mut marks)?;
        }
        Ok(())
    }

    /// Evaluate every computed field once so memos and flush baselines
    /// start consistent with the defaults.
    fn prime_computed(&mut self) -> Result<()> {
        let targets: Vec<FieldAddr> = self
            .nodes
            .iter()
            .flat_map(|(path, node)| {
                node.computed_names()
                    .into_iter()
                    .map(|name| FieldAddr::new(path.clone(), name))
                    .collect::<Vec<_>>()
            })
            .collect();
        for addr in targets {
            let value = self.ensure_computed(&addr)?;
            if let Some(node) = self.nodes.get_mut(&addr.node) {
                node.record_flushed_computed(&addr.field, value);
            }
        }
        Ok(())
    }
}

fn build_nodes(path: NodePath, schema: &NodeSchema, nodes: &mut BTreeMap<NodePath, StateNode>) {
    let own = NodeSchema {
        fields: schema.fields.clone(),
        computed: schema.computed.clone(),
        children: BTreeMap::new(),
    };
    nodes.insert(path.clone(), StateNode::from_schema(path.clone(), Arc::new(own)));
    for (name, child) in &schema.children {
        build_nodes(path.child(name.clone()), child, nodes);
    }
}
