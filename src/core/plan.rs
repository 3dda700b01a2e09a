//! Execution planning: pruning, topological ordering, and the dry-run view.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use tracing::debug;

use crate::core::graph::{ActionGraph, NodeKey, SoftEdge};
use crate::core::script::DependencyKind;

/// Pruned node sets, computed before validation so the validator can report
/// cycles and per-node problems over exactly the nodes that would run.
#[derive(Debug, Clone)]
pub struct PrunedSets {
    /// Initial executable set: strong reachability from the goals plus the
    /// retainers of surviving soft edges (and their strong closures). Soft
    /// targets outside this set only join at runtime, via promotion.
    pub executable: BTreeSet<NodeKey>,
    /// Soft edges whose consumer is executable; their retainers are planned.
    pub soft_edges: Vec<SoftEdge>,
    /// Strong reachability set from the goals (weak retention baseline).
    pub strong_set: BTreeSet<NodeKey>,
}

/// Executable plan over a validated graph.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub order: Vec<NodeKey>,
    pub executable: BTreeSet<NodeKey>,
    /// Plan-order position per node: the scheduler's tie-break key.
    pub position: BTreeMap<NodeKey, usize>,
    pub soft_edges: Vec<SoftEdge>,
    pub strong_set: BTreeSet<NodeKey>,
}

impl ExecutionPlan {
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.executable.contains(key)
    }
}

/// Prune the graph to the nodes a run would execute.
///
/// - Strong reachability set R from goals via strong edges only.
/// - A weak edge `u -> v` is kept iff `v` is in the executable set; pruned
///   weak targets simply never run.
/// - For each soft edge whose consumer survives, the retainer (with its
///   strong closure) is added as a strong requirement; the target is added
///   only if independently reachable.
pub fn prune(graph: &ActionGraph) -> PrunedSets {
    let strong_set = graph.strong_reachable(&graph.goals);
    let mut executable = strong_set.clone();

    // Retainers of surviving soft edges join the plan; a retainer's strong
    // closure can itself contain soft-edge consumers, so iterate to fixpoint.
    let mut soft_edges: Vec<SoftEdge> = Vec::new();
    loop {
        let mut grew = false;
        for soft in graph.soft_edges() {
            if !executable.contains(&soft.consumer) {
                continue;
            }
            if !soft_edges.contains(&soft) {
                soft_edges.push(soft.clone());
            }
            for key in graph.strong_closure(&soft.retainer) {
                if executable.insert(key) {
                    grew = true;
                }
            }
        }
        if !grew {
            break;
        }
    }
    soft_edges.sort_by(|a, b| (&a.consumer, &a.target).cmp(&(&b.consumer, &b.target)));

    PrunedSets {
        executable,
        soft_edges,
        strong_set,
    }
}

/// Topologically order the pruned sets into an executable plan.
///
/// Ordering is over strong edges only; the validator has already rejected
/// cycles by the time this runs.
pub fn build_plan(graph: &ActionGraph, pruned: &PrunedSets) -> Result<ExecutionPlan> {
    let order = graph.topological_order(&pruned.executable)?;
    let position: BTreeMap<NodeKey, usize> = order
        .iter()
        .enumerate()
        .map(|(i, k)| (k.clone(), i))
        .collect();

    debug!(
        planned = order.len(),
        soft_edges = pruned.soft_edges.len(),
        "built execution plan"
    );

    Ok(ExecutionPlan {
        order,
        executable: pruned.executable.clone(),
        position,
        soft_edges: pruned.soft_edges.clone(),
        strong_set: pruned.strong_set.clone(),
    })
}

/// How many distinct goals reach each planned node through strong edges.
/// Shared nodes are the visible payoff of context reduction.
pub fn sharing_counts(graph: &ActionGraph, plan: &ExecutionPlan) -> BTreeMap<NodeKey, usize> {
    let mut counts: BTreeMap<NodeKey, usize> = BTreeMap::new();
    for goal in &graph.goals {
        let mut from = BTreeSet::new();
        from.insert(goal.clone());
        for key in graph.strong_reachable(&from) {
            if plan.contains(&key) {
                *counts.entry(key).or_insert(0) += 1;
            }
        }
    }
    counts
}

/// Render the dry-run plan as plain text lines.
///
/// Dependency numbers reference plan positions; weak edges are prefixed `~`,
/// soft edges `?`. Nodes used by more than one goal context carry a
/// `(⏬N ctx)` annotation.
pub fn render_plan(graph: &ActionGraph, plan: &ExecutionPlan) -> Vec<String> {
    let counts = sharing_counts(graph, plan);
    let mut lines = Vec::with_capacity(plan.order.len());

    for (index, key) in plan.order.iter().enumerate() {
        let Ok(node) = graph.node(key) else {
            continue;
        };

        let mut dep_parts: Vec<String> = Vec::new();
        for edge in &node.dependencies {
            let Some(pos) = plan.position.get(&edge.target) else {
                continue;
            };
            match edge.kind {
                DependencyKind::Strong => dep_parts.push(format!("{}", pos + 1)),
                DependencyKind::Weak => dep_parts.push(format!("~{}", pos + 1)),
                DependencyKind::Soft => dep_parts.push(format!("?{}", pos + 1)),
            }
        }
        let deps = if dep_parts.is_empty() {
            "-".to_string()
        } else {
            dep_parts.join(", ")
        };

        let goal_marker = if graph.goals.contains(key) { " *" } else { "" };
        let shared = match counts.get(key) {
            Some(n) if *n > 1 => format!("  (⏬{n} ctx)"),
            _ => String::new(),
        };

        lines.push(format!(
            "{:>3}. [{}] {}{}  deps: {}{}",
            index + 1,
            key.context.label(),
            key.action,
            goal_marker,
            deps,
            shared,
        ));
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::test_fixtures::{graph, key, node};
    use crate::core::graph::Edge;

    fn plan_for(g: &ActionGraph) -> ExecutionPlan {
        build_plan(g, &prune(g)).expect("plan")
    }

    #[test]
    fn weak_target_outside_strong_set_is_not_planned() {
        let g = graph(
            vec![
                node("consumer", vec![Edge::weak(key("provider"))]),
                node("provider", vec![]),
            ],
            &["consumer"],
        );
        let plan = plan_for(&g);
        assert!(plan.contains(&key("consumer")));
        assert!(!plan.contains(&key("provider")));
    }

    #[test]
    fn weak_target_kept_when_strong_reachable_via_other_goal() {
        let g = graph(
            vec![
                node("consumer", vec![Edge::weak(key("provider"))]),
                node("user", vec![Edge::strong(key("provider"))]),
                node("provider", vec![]),
            ],
            &["consumer", "user"],
        );
        let plan = plan_for(&g);
        assert!(plan.contains(&key("provider")));
        // Provider must be ordered before its strong dependent.
        let pos = |name: &str| plan.position[&key(name)];
        assert!(pos("provider") < pos("user"));
    }

    #[test]
    fn soft_target_not_planned_but_retainer_is() {
        let g = graph(
            vec![
                node("consumer", vec![Edge::soft(key("target"), key("retainer"))]),
                node("target", vec![Edge::strong(key("dep-of-target"))]),
                node("dep-of-target", vec![]),
                node("retainer", vec![]),
            ],
            &["consumer"],
        );
        let plan = plan_for(&g);
        assert!(plan.contains(&key("retainer")));
        assert!(!plan.contains(&key("target")));
        assert!(!plan.contains(&key("dep-of-target")));
        assert_eq!(plan.soft_edges.len(), 1);
    }

    #[test]
    fn soft_target_planned_when_independently_reachable() {
        let g = graph(
            vec![
                node(
                    "consumer",
                    vec![
                        Edge::soft(key("target"), key("retainer")),
                        Edge::strong(key("target")),
                    ],
                ),
                node("target", vec![]),
                node("retainer", vec![]),
            ],
            &["consumer"],
        );
        let plan = plan_for(&g);
        assert!(plan.contains(&key("target")));
        assert!(plan.contains(&key("retainer")));
    }

    #[test]
    fn retainer_strong_closure_is_planned() {
        let g = graph(
            vec![
                node("consumer", vec![Edge::soft(key("target"), key("retainer"))]),
                node("target", vec![]),
                node("retainer", vec![Edge::strong(key("probe"))]),
                node("probe", vec![]),
            ],
            &["consumer"],
        );
        let plan = plan_for(&g);
        assert!(plan.contains(&key("probe")));
    }

    #[test]
    fn plan_order_positions_are_dense_and_stable() {
        let g = graph(
            vec![
                node("b", vec![Edge::strong(key("a"))]),
                node("a", vec![]),
                node("c", vec![Edge::strong(key("a"))]),
            ],
            &["b", "c"],
        );
        let plan = plan_for(&g);
        assert_eq!(plan.order.len(), 3);
        assert_eq!(plan.position[&key("a")], 0);
    }

    #[test]
    fn render_plan_annotates_edges_and_sharing() {
        let g = graph(
            vec![
                node("build", vec![Edge::strong(key("fetch")), Edge::weak(key("cache"))]),
                node("test", vec![Edge::strong(key("fetch"))]),
                node("fetch", vec![]),
                node("cache", vec![]),
            ],
            &["build", "test"],
        );
        let plan = plan_for(&g);
        let lines = render_plan(&g, &plan);
        assert_eq!(lines.len(), 3);
        let fetch_line = lines
            .iter()
            .find(|l| l.contains(" fetch"))
            .expect("fetch line");
        assert!(fetch_line.contains("(⏬2 ctx)"), "{fetch_line}");
        let build_line = lines
            .iter()
            .find(|l| l.contains(" build"))
            .expect("build line");
        assert!(build_line.contains("deps: 1"), "{build_line}");
    }
}
