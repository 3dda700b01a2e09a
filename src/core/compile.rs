//! Compiler from resolved invocations to the unified contextualized graph.
//!
//! For each goal invocation a graph is grown recursively: every action gets a
//! context *reduced* to its axis footprint, so axis-independent actions unify
//! across invocations. Version selection always uses the full invocation
//! context; only the node key is reduced.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{bail, Result};
use tracing::debug;

use crate::core::context::ContextId;
use crate::core::graph::{ActionGraph, Edge, GraphNode, NodeKey};
use crate::core::invocation::Invocation;
use crate::core::model::{ActionVersion, Document};
use crate::core::script::{DependencyKind, Expansion};
use crate::core::types::Platform;

/// Result of compilation: the unified graph plus version-selection failures
/// for nodes that were referenced but could not select a version. Whether a
/// failure matters is the validator's call (a pruned weak target never runs,
/// so its failure is harmless).
#[derive(Debug, Clone, Default)]
pub struct CompiledGraph {
    pub graph: ActionGraph,
    pub selection_failures: BTreeMap<NodeKey, String>,
}

pub struct Compiler<'a> {
    document: &'a Document,
    platform: Platform,
}

impl<'a> Compiler<'a> {
    pub fn new(document: &'a Document, platform: Platform) -> Self {
        Self { document, platform }
    }

    /// Compile all invocations into one unified graph.
    pub fn compile(&self, invocations: &[Invocation]) -> Result<CompiledGraph> {
        let mut compiled = CompiledGraph::default();

        for invocation in invocations {
            self.compile_invocation(invocation, &mut compiled)?;
        }

        compiled.graph.rebuild_dependents();
        debug!(
            nodes = compiled.graph.nodes.len(),
            goals = compiled.graph.goals.len(),
            "compiled action graph"
        );
        Ok(compiled)
    }

    fn compile_invocation(
        &self,
        invocation: &Invocation,
        compiled: &mut CompiledGraph,
    ) -> Result<()> {
        let full_context = ContextId::from_map(&invocation.axis_values);
        let mut emitted: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(invocation.action.clone());

        let goal_key = self.node_key(&invocation.action, &full_context)?;
        compiled.graph.goals.insert(goal_key);

        while let Some(action_name) = queue.pop_front() {
            if !emitted.insert(action_name.clone()) {
                continue;
            }
            let key = self.node_key(&action_name, &full_context)?;

            let action = self.document.action(&action_name)?;
            let version = match action.select_version(&invocation.axis_values, self.platform) {
                Ok(version) => version.clone(),
                Err(err) => {
                    compiled
                        .selection_failures
                        .entry(key)
                        .or_insert_with(|| err.to_string());
                    continue;
                }
            };

            let edges = self.collect_edges(&version, &full_context, &mut queue)?;
            self.insert_node(compiled, key, version, edges, invocation)?;
        }

        Ok(())
    }

    /// Edges of one version, with each target keyed by its own reduced context.
    fn collect_edges(
        &self,
        version: &ActionVersion,
        full_context: &ContextId,
        queue: &mut VecDeque<String>,
    ) -> Result<BTreeSet<Edge>> {
        let mut edges = BTreeSet::new();

        for expansion in &version.expansions {
            match expansion {
                Expansion::Action { action, .. } => {
                    let target = self.node_key(action, full_context)?;
                    edges.insert(Edge::strong(target));
                    queue.push_back(action.clone());
                }
                Expansion::WeakAction { action, .. } => {
                    let target = self.node_key(action, full_context)?;
                    edges.insert(Edge::weak(target));
                    queue.push_back(action.clone());
                }
                _ => {}
            }
        }

        for decl in &version.dependencies {
            let target = self.node_key(&decl.action, full_context)?;
            queue.push_back(decl.action.clone());
            match decl.kind {
                DependencyKind::Strong => {
                    edges.insert(Edge::strong(target));
                }
                DependencyKind::Weak => {
                    edges.insert(Edge::weak(target));
                }
                DependencyKind::Soft => {
                    let retainer_name = decl
                        .retainer
                        .as_ref()
                        .ok_or_else(|| anyhow::anyhow!("soft dependency without retainer"))?;
                    let retainer = self.node_key(retainer_name, full_context)?;
                    queue.push_back(retainer_name.clone());
                    edges.insert(Edge::soft(target, retainer));
                }
            }
        }

        Ok(edges)
    }

    fn insert_node(
        &self,
        compiled: &mut CompiledGraph,
        key: NodeKey,
        version: ActionVersion,
        edges: BTreeSet<Edge>,
        invocation: &Invocation,
    ) -> Result<()> {
        if let Some(existing) = compiled.graph.nodes.get_mut(&key) {
            // Unification: same key means same reduced context, so the
            // selected version must agree; merged edges are unioned.
            if existing.version.conditions != version.conditions {
                bail!(
                    "conflicting version selection for '{}' across invocations",
                    existing.key
                );
            }
            if existing.args != invocation.args || existing.flags != invocation.flags {
                bail!(
                    "conflicting configuration for '{}': the same action and context was \
                     invoked with different arguments or flags",
                    existing.key
                );
            }
            existing.dependencies.extend(edges);
            return Ok(());
        }

        compiled.graph.nodes.insert(
            key.clone(),
            GraphNode {
                key,
                version,
                dependencies: edges,
                dependents: BTreeSet::new(),
                args: invocation.args.clone(),
                flags: invocation.flags.clone(),
            },
        );
        Ok(())
    }

    /// Node key for an action under the invocation's full context: context
    /// reduced to the action's axis footprint.
    fn node_key(&self, action_name: &str, full_context: &ContextId) -> Result<NodeKey> {
        let footprint = self.footprint(action_name, full_context)?;
        Ok(NodeKey::new(action_name, full_context.reduce_to(&footprint)))
    }

    /// Axis footprint of an action in a context (§ context algebra).
    ///
    /// Union of the axes referenced by conditions on the selected version and
    /// by conditions on any version of any transitively reachable dependency
    /// (through the potential dependency graph: all versions, all edge kinds,
    /// retainers included).
    fn footprint(&self, action_name: &str, full_context: &ContextId) -> Result<BTreeSet<String>> {
        let action = self.document.action(action_name)?;
        let axis_values = full_context.to_map();

        let mut axes: BTreeSet<String> =
            match action.select_version(&axis_values, self.platform) {
                Ok(version) => version.condition_axes(),
                // Selection failures surface later if the node is required;
                // footprint falls back to every version's axes.
                Err(_) => action.condition_axes(),
            };

        let mut visited: BTreeSet<String> = BTreeSet::new();
        visited.insert(action_name.to_string());
        let mut frontier: VecDeque<String> =
            action.potential_dependencies().into_iter().collect();

        while let Some(dep_name) = frontier.pop_front() {
            if !visited.insert(dep_name.clone()) {
                continue;
            }
            let Some(dep) = self.document.actions.get(&dep_name) else {
                // Unknown action: the validator reports it when the edge is live.
                continue;
            };
            axes.extend(dep.condition_axes());
            for next in dep.potential_dependencies() {
                if !visited.contains(&next) {
                    frontier.push_back(next);
                }
            }
        }

        Ok(axes)
    }
}
