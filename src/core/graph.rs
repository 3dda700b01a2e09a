//! Graph data structures for contextualized action dependencies.
//!
//! Nodes are keyed by `(action, reduced-context)` and hold their edges as key
//! values rather than references, so the graph is a flat arena without
//! ownership cycles.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use anyhow::{anyhow, Result};

use crate::core::context::ContextId;
use crate::core::model::ActionVersion;
use crate::core::script::DependencyKind;

/// Composite key of a graph node: action name plus reduced context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub action: String,
    pub context: ContextId,
}

impl NodeKey {
    pub fn new(action: impl Into<String>, context: ContextId) -> Self {
        Self {
            action: action.into(),
            context,
        }
    }

    /// Display label: action name, or `name@context` outside the global context.
    pub fn label(&self) -> String {
        if self.context.is_global() {
            self.action.clone()
        } else {
            format!("{}@{}", self.action, self.context.label())
        }
    }

    /// Directory-safe node identifier: action name plus context hash when
    /// non-global.
    pub fn dir_name(&self) -> String {
        if self.context.is_global() {
            self.action.clone()
        } else {
            format!("{}-{}", self.action, self.context.hash())
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Directed dependency edge from a node to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub target: NodeKey,
    pub kind: DependencyKind,
    /// Retainer node gating the edge; present iff `kind` is `Soft`.
    pub retainer: Option<NodeKey>,
}

impl Edge {
    pub fn strong(target: NodeKey) -> Self {
        Self {
            target,
            kind: DependencyKind::Strong,
            retainer: None,
        }
    }

    pub fn weak(target: NodeKey) -> Self {
        Self {
            target,
            kind: DependencyKind::Weak,
            retainer: None,
        }
    }

    pub fn soft(target: NodeKey, retainer: NodeKey) -> Self {
        Self {
            target,
            kind: DependencyKind::Soft,
            retainer: Some(retainer),
        }
    }
}

/// Node in the contextualized action graph: the unit of scheduling.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub key: NodeKey,
    /// Version selected for this node's invocation context.
    pub version: ActionVersion,
    pub dependencies: BTreeSet<Edge>,
    /// Reverse edges of every kind, for presentation and sharing counts.
    pub dependents: BTreeSet<NodeKey>,
    /// Per-node argument values (global + per-goal merged).
    pub args: BTreeMap<String, String>,
    /// Per-node flag values.
    pub flags: BTreeMap<String, bool>,
}

impl GraphNode {
    pub fn strong_dependencies(&self) -> impl Iterator<Item = &NodeKey> {
        self.dependencies
            .iter()
            .filter(|e| e.kind == DependencyKind::Strong)
            .map(|e| &e.target)
    }
}

/// A soft edge with its endpoints, as reported by [`ActionGraph::soft_edges`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftEdge {
    pub consumer: NodeKey,
    pub target: NodeKey,
    pub retainer: NodeKey,
}

/// Unified dependency graph over all goal invocations.
#[derive(Debug, Clone, Default)]
pub struct ActionGraph {
    pub nodes: BTreeMap<NodeKey, GraphNode>,
    pub goals: BTreeSet<NodeKey>,
}

impl ActionGraph {
    pub fn node(&self, key: &NodeKey) -> Result<&GraphNode> {
        self.nodes
            .get(key)
            .ok_or_else(|| anyhow!("node '{key}' not found in graph"))
    }

    /// Rebuild reverse edges from scratch.
    pub fn rebuild_dependents(&mut self) {
        let mut reverse: BTreeMap<NodeKey, BTreeSet<NodeKey>> = BTreeMap::new();
        for (key, node) in &self.nodes {
            for edge in &node.dependencies {
                reverse
                    .entry(edge.target.clone())
                    .or_default()
                    .insert(key.clone());
                if let Some(retainer) = &edge.retainer {
                    reverse
                        .entry(retainer.clone())
                        .or_default()
                        .insert(key.clone());
                }
            }
        }
        for (key, node) in &mut self.nodes {
            node.dependents = reverse.remove(key).unwrap_or_default();
        }
    }

    /// Nodes reachable from `from` via strong edges (inclusive).
    pub fn strong_reachable(&self, from: &BTreeSet<NodeKey>) -> BTreeSet<NodeKey> {
        let mut visited = BTreeSet::new();
        let mut queue: VecDeque<NodeKey> = from.iter().cloned().collect();
        while let Some(key) = queue.pop_front() {
            if !visited.insert(key.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&key) {
                for dep in node.strong_dependencies() {
                    if !visited.contains(dep) {
                        queue.push_back(dep.clone());
                    }
                }
            }
        }
        visited
    }

    /// Strong closure of a single node (inclusive).
    pub fn strong_closure(&self, key: &NodeKey) -> BTreeSet<NodeKey> {
        let mut from = BTreeSet::new();
        from.insert(key.clone());
        self.strong_reachable(&from)
    }

    /// Every soft edge in the graph.
    pub fn soft_edges(&self) -> Vec<SoftEdge> {
        let mut edges = Vec::new();
        for (key, node) in &self.nodes {
            for edge in &node.dependencies {
                if edge.kind == DependencyKind::Soft {
                    if let Some(retainer) = &edge.retainer {
                        edges.push(SoftEdge {
                            consumer: key.clone(),
                            target: edge.target.clone(),
                            retainer: retainer.clone(),
                        });
                    }
                }
            }
        }
        edges
    }

    /// Find a cycle in the strong edges, if any. Returns the cycle path with
    /// the entry node repeated at the end.
    pub fn find_strong_cycle(&self) -> Option<Vec<NodeKey>> {
        let mut visited: BTreeSet<NodeKey> = BTreeSet::new();
        let mut on_stack: BTreeSet<NodeKey> = BTreeSet::new();
        let mut path: Vec<NodeKey> = Vec::new();

        fn dfs(
            graph: &ActionGraph,
            key: &NodeKey,
            visited: &mut BTreeSet<NodeKey>,
            on_stack: &mut BTreeSet<NodeKey>,
            path: &mut Vec<NodeKey>,
        ) -> Option<Vec<NodeKey>> {
            visited.insert(key.clone());
            on_stack.insert(key.clone());
            path.push(key.clone());

            if let Some(node) = graph.nodes.get(key) {
                for dep in node.strong_dependencies() {
                    if !visited.contains(dep) {
                        if let Some(cycle) = dfs(graph, dep, visited, on_stack, path) {
                            return Some(cycle);
                        }
                    } else if on_stack.contains(dep) {
                        let start = path.iter().position(|k| k == dep).unwrap_or(0);
                        let mut cycle: Vec<NodeKey> = path[start..].to_vec();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                }
            }

            path.pop();
            on_stack.remove(key);
            None
        }

        let keys: Vec<NodeKey> = self.nodes.keys().cloned().collect();
        for key in keys {
            if !visited.contains(&key) {
                if let Some(cycle) = dfs(self, &key, &mut visited, &mut on_stack, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Topological order of `set` over strong edges (Kahn's algorithm).
    ///
    /// The ready set is drained in lexicographic node-key order, which makes
    /// the order deterministic; the resulting positions are the scheduler's
    /// tie-break key.
    pub fn topological_order(&self, set: &BTreeSet<NodeKey>) -> Result<Vec<NodeKey>> {
        let mut in_degree: BTreeMap<&NodeKey, usize> = set.iter().map(|k| (k, 0)).collect();
        for key in set {
            if let Some(node) = self.nodes.get(key) {
                let count = node
                    .strong_dependencies()
                    .filter(|dep| set.contains(*dep))
                    .count();
                in_degree.insert(key, count);
            }
        }

        let mut ready: BTreeSet<&NodeKey> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut order = Vec::with_capacity(set.len());

        while let Some(key) = ready.iter().next().cloned() {
            ready.remove(key);
            order.push(key.clone());

            if let Some(node) = self.nodes.get(key) {
                for dependent in &node.dependents {
                    if !set.contains(dependent) {
                        continue;
                    }
                    let depends_strongly = self
                        .nodes
                        .get(dependent)
                        .map(|d| d.strong_dependencies().any(|t| t == key))
                        .unwrap_or(false);
                    if !depends_strongly {
                        continue;
                    }
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.insert(dependent);
                        }
                    }
                }
            }
        }

        if order.len() != set.len() {
            let remaining: Vec<String> = set
                .iter()
                .filter(|k| !order.contains(k))
                .map(|k| k.label())
                .collect();
            return Err(anyhow!(
                "dependency graph contains cycles (actions involved: {})",
                remaining.join(", ")
            ));
        }

        Ok(order)
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use crate::core::model::test_fixtures::bash_version;

    pub fn key(name: &str) -> NodeKey {
        NodeKey::new(name, ContextId::empty())
    }

    pub fn node(name: &str, edges: Vec<Edge>) -> GraphNode {
        GraphNode {
            key: key(name),
            version: bash_version("ret ok:int=1", vec![]),
            dependencies: edges.into_iter().collect(),
            dependents: BTreeSet::new(),
            args: BTreeMap::new(),
            flags: BTreeMap::new(),
        }
    }

    pub fn graph(nodes: Vec<GraphNode>, goals: &[&str]) -> ActionGraph {
        let mut g = ActionGraph {
            nodes: nodes.into_iter().map(|n| (n.key.clone(), n)).collect(),
            goals: goals.iter().map(|n| key(n)).collect(),
        };
        g.rebuild_dependents();
        g
    }
}
