//! Graph validation: every problem a run would hit is reported in one
//! aggregated batch before anything executes.

use std::collections::BTreeSet;
use std::fmt;

use crate::core::compile::CompiledGraph;
use crate::core::graph::{ActionGraph, NodeKey};
use crate::core::model::{Condition, Document};
use crate::core::plan::PrunedSets;
use crate::core::script::{DependencyKind, Expansion};

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    Cycle {
        path: Vec<NodeKey>,
    },
    MissingArgument {
        node: NodeKey,
        argument: String,
        defined: bool,
    },
    MissingFlagDefinition {
        node: NodeKey,
        flag: String,
    },
    UnknownAxis {
        action: String,
        axis: String,
    },
    InvalidAxisValue {
        action: String,
        axis: String,
        value: String,
    },
    MissingRequiredAxis {
        node: NodeKey,
        axis: String,
    },
    MissingEnv {
        node: NodeKey,
        variable: String,
    },
    MissingOutput {
        node: NodeKey,
        dependency: String,
        output: String,
    },
    NoMatchingVersion {
        node: NodeKey,
        detail: String,
    },
    RetainerWithConditionalDeps {
        retainer: NodeKey,
    },
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle { path } => {
                let cycle = path
                    .iter()
                    .map(|k| k.label())
                    .collect::<Vec<_>>()
                    .join(" -> ");
                write!(f, "dependency cycle: {cycle}")
            }
            Self::MissingArgument {
                node,
                argument,
                defined,
            } => {
                if *defined {
                    write!(
                        f,
                        "missing argument 'args.{argument}' for '{node}': no default and no \
                         value given on the command line"
                    )
                } else {
                    write!(
                        f,
                        "missing argument definition 'args.{argument}' referenced by '{node}'"
                    )
                }
            }
            Self::MissingFlagDefinition { node, flag } => {
                write!(
                    f,
                    "missing flag definition 'flags.{flag}' referenced by '{node}'"
                )
            }
            Self::UnknownAxis { action, axis } => {
                write!(
                    f,
                    "unknown axis '{axis}' referenced by a condition of action '{action}'"
                )
            }
            Self::InvalidAxisValue {
                action,
                axis,
                value,
            } => {
                write!(
                    f,
                    "condition of action '{action}' uses value '{value}' which is not allowed \
                     for axis '{axis}'"
                )
            }
            Self::MissingRequiredAxis { node, axis } => {
                write!(
                    f,
                    "missing required axis '{axis}' for '{node}': no binding and no default"
                )
            }
            Self::MissingEnv { node, variable } => {
                write!(f, "missing environment variable '{variable}' required by '{node}'")
            }
            Self::MissingOutput {
                node,
                dependency,
                output,
            } => {
                write!(
                    f,
                    "'{node}' references output '{output}' which action '{dependency}' does \
                     not declare"
                )
            }
            Self::NoMatchingVersion { node, detail } => {
                write!(f, "no version selected for '{node}': {detail}")
            }
            Self::RetainerWithConditionalDeps { retainer } => {
                write!(
                    f,
                    "retainer '{retainer}' declares weak or soft dependencies, which is not \
                     supported"
                )
            }
        }
    }
}

/// Validate the pruned graph. Returns every finding; an empty vector means
/// the plan is executable.
pub fn validate(
    document: &Document,
    compiled: &CompiledGraph,
    pruned: &PrunedSets,
    available_env: &BTreeSet<String>,
) -> Vec<Issue> {
    let graph = &compiled.graph;
    let mut issues = Vec::new();

    if let Some(path) = cycle_within(graph, &pruned.executable) {
        issues.push(Issue::Cycle { path });
    }

    check_conditions(document, &mut issues);

    for key in &pruned.executable {
        let Some(node) = graph.nodes.get(key) else {
            issues.push(version_issue(document, compiled, key));
            continue;
        };

        for expansion in &node.version.expansions {
            match expansion {
                Expansion::Args { name, .. } => {
                    if !node.args.contains_key(name) {
                        issues.push(Issue::MissingArgument {
                            node: key.clone(),
                            argument: name.clone(),
                            defined: document.arguments.contains_key(name),
                        });
                    }
                }
                Expansion::Flags { name, .. } => {
                    if !document.flags.contains_key(name) {
                        issues.push(Issue::MissingFlagDefinition {
                            node: key.clone(),
                            flag: name.clone(),
                        });
                    }
                }
                Expansion::Env { name, .. } => {
                    if !available_env.contains(name) {
                        issues.push(Issue::MissingEnv {
                            node: key.clone(),
                            variable: name.clone(),
                        });
                    }
                }
                Expansion::Action { action, output, .. } => {
                    check_output(graph, pruned, key, action, output, &mut issues);
                }
                _ => {}
            }
        }

        for variable in &node.version.env_dependencies {
            if !available_env.contains(variable) {
                issues.push(Issue::MissingEnv {
                    node: key.clone(),
                    variable: variable.clone(),
                });
            }
        }
    }

    for soft in &pruned.soft_edges {
        if let Some(retainer) = graph.nodes.get(&soft.retainer) {
            let conditional = retainer
                .version
                .dependencies
                .iter()
                .any(|d| d.kind != DependencyKind::Strong)
                || retainer
                    .version
                    .expansions
                    .iter()
                    .any(|e| matches!(e, Expansion::WeakAction { .. }));
            if conditional {
                let issue = Issue::RetainerWithConditionalDeps {
                    retainer: soft.retainer.clone(),
                };
                if !issues.contains(&issue) {
                    issues.push(issue);
                }
            }
        }
    }

    issues
}

/// Render a batch of findings as one error message.
pub fn render_batch(issues: &[Issue]) -> String {
    let mut out = String::from("validation failed:");
    for issue in issues {
        out.push_str("\n- ");
        out.push_str(&issue.to_string());
    }
    out
}

fn cycle_within(graph: &ActionGraph, set: &BTreeSet<NodeKey>) -> Option<Vec<NodeKey>> {
    // Restrict cycle detection to the executable set: a cycle among pruned
    // weak targets never runs, so it is not an error.
    let mut restricted = ActionGraph {
        nodes: graph
            .nodes
            .iter()
            .filter(|(k, _)| set.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        goals: graph.goals.clone(),
    };
    for node in restricted.nodes.values_mut() {
        node.dependencies
            .retain(|e| set.contains(&e.target) || e.kind != DependencyKind::Strong);
    }
    restricted.find_strong_cycle()
}

fn check_conditions(document: &Document, issues: &mut Vec<Issue>) {
    for (action_name, action) in &document.actions {
        for version in &action.versions {
            for condition in &version.conditions {
                let Condition::Axis { axis, value } = condition else {
                    continue;
                };
                match document.axes.get(axis) {
                    None => {
                        let issue = Issue::UnknownAxis {
                            action: action_name.clone(),
                            axis: axis.clone(),
                        };
                        if !issues.contains(&issue) {
                            issues.push(issue);
                        }
                    }
                    Some(def) if !def.allows(value) => {
                        let issue = Issue::InvalidAxisValue {
                            action: action_name.clone(),
                            axis: axis.clone(),
                            value: value.clone(),
                        };
                        if !issues.contains(&issue) {
                            issues.push(issue);
                        }
                    }
                    Some(_) => {}
                }
            }
        }
    }
}

fn check_output(
    graph: &ActionGraph,
    pruned: &PrunedSets,
    consumer: &NodeKey,
    dependency: &str,
    output: &str,
    issues: &mut Vec<Issue>,
) {
    // Find the strong edge target with this action name; its selected
    // version decides which outputs exist.
    let Some(node) = graph.nodes.get(consumer) else {
        return;
    };
    for edge in &node.dependencies {
        if edge.target.action != dependency || edge.kind != DependencyKind::Strong {
            continue;
        }
        if !pruned.executable.contains(&edge.target) {
            continue;
        }
        if let Some(target) = graph.nodes.get(&edge.target) {
            if !target.version.declares_return(output) {
                issues.push(Issue::MissingOutput {
                    node: consumer.clone(),
                    dependency: dependency.to_string(),
                    output: output.to_string(),
                });
            }
        }
    }
}

/// Classify a node with no version: missing required axis beats the generic
/// selection failure when an unbound axis explains it.
fn version_issue(document: &Document, compiled: &CompiledGraph, key: &NodeKey) -> Issue {
    if let Ok(action) = document.action(&key.action) {
        if action.is_multi_version() {
            let bound = key.context.to_map();
            for axis in action.condition_axes() {
                let has_default = document
                    .axes
                    .get(&axis)
                    .and_then(|d| d.default_value())
                    .is_some();
                if !bound.contains_key(&axis) && !has_default {
                    return Issue::MissingRequiredAxis {
                        node: key.clone(),
                        axis,
                    };
                }
            }
        }
    }
    let detail = compiled
        .selection_failures
        .get(key)
        .cloned()
        .unwrap_or_else(|| "no version matches the selected context".to_string());
    Issue::NoMatchingVersion {
        node: key.clone(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compile::Compiler;
    use crate::core::invocation::Invocation;
    use crate::core::model::test_fixtures::{action, axis, bash_version};
    use crate::core::model::Condition;
    use crate::core::plan::prune;
    use crate::core::types::Platform;
    use std::collections::BTreeMap;

    fn invocation(action: &str, axes: &[(&str, &str)]) -> Invocation {
        Invocation {
            action: action.to_string(),
            axis_values: axes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            args: BTreeMap::new(),
            flags: BTreeMap::new(),
        }
    }

    fn validate_doc(document: &Document, inv: Invocation) -> Vec<Issue> {
        let compiled = Compiler::new(document, Platform::Linux)
            .compile(&[inv])
            .expect("compile");
        let pruned = prune(&compiled.graph);
        let env: BTreeSet<String> = ["HOME".to_string()].into_iter().collect();
        validate(document, &compiled, &pruned, &env)
    }

    #[test]
    fn clean_document_validates_without_issues() {
        let mut document = Document::default();
        document.actions.insert(
            "a".to_string(),
            action("a", vec![bash_version("ret x:int=1\n", vec![])]),
        );
        document.actions.insert(
            "b".to_string(),
            action(
                "b",
                vec![bash_version("echo ${action.a.x}\nret y:int=2\n", vec![])],
            ),
        );
        let issues = validate_doc(&document, invocation("b", &[]));
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn cycle_is_reported_with_path() {
        let mut document = Document::default();
        document.actions.insert(
            "a".to_string(),
            action("a", vec![bash_version("dep action.b\nret x:int=1\n", vec![])]),
        );
        document.actions.insert(
            "b".to_string(),
            action("b", vec![bash_version("dep action.a\nret y:int=1\n", vec![])]),
        );
        let issues = validate_doc(&document, invocation("a", &[]));
        assert!(issues
            .iter()
            .any(|i| matches!(i, Issue::Cycle { path } if path.len() >= 3)));
    }

    #[test]
    fn missing_argument_and_flag_are_reported() {
        let mut document = Document::default();
        document.actions.insert(
            "a".to_string(),
            action(
                "a",
                vec![bash_version(
                    "echo ${args.target} ${flags.fast}\nret x:int=1\n",
                    vec![],
                )],
            ),
        );
        let issues = validate_doc(&document, invocation("a", &[]));
        assert!(issues.iter().any(|i| matches!(
            i,
            Issue::MissingArgument { argument, defined: false, .. } if argument == "target"
        )));
        assert!(issues
            .iter()
            .any(|i| matches!(i, Issue::MissingFlagDefinition { flag, .. } if flag == "fast")));
    }

    #[test]
    fn missing_env_is_reported_for_expansion_and_declaration() {
        let mut document = Document::default();
        document.actions.insert(
            "a".to_string(),
            action(
                "a",
                vec![bash_version(
                    "dep env.MISSING_ONE\necho ${env.MISSING_TWO} ${env.HOME}\nret x:int=1\n",
                    vec![],
                )],
            ),
        );
        let issues = validate_doc(&document, invocation("a", &[]));
        let missing: Vec<&str> = issues
            .iter()
            .filter_map(|i| match i {
                Issue::MissingEnv { variable, .. } => Some(variable.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(missing, vec!["MISSING_TWO", "MISSING_ONE"]);
    }

    #[test]
    fn undeclared_output_is_reported() {
        let mut document = Document::default();
        document.actions.insert(
            "a".to_string(),
            action("a", vec![bash_version("ret x:int=1\n", vec![])]),
        );
        document.actions.insert(
            "b".to_string(),
            action(
                "b",
                vec![bash_version("echo ${action.a.nope}\nret y:int=1\n", vec![])],
            ),
        );
        let issues = validate_doc(&document, invocation("b", &[]));
        assert!(issues
            .iter()
            .any(|i| matches!(i, Issue::MissingOutput { output, .. } if output == "nope")));
    }

    #[test]
    fn weak_reference_to_pruned_target_is_fine() {
        let mut document = Document::default();
        document.actions.insert(
            "p".to_string(),
            action("p", vec![bash_version("ret v:int=1\n", vec![])]),
        );
        document.actions.insert(
            "c".to_string(),
            action(
                "c",
                vec![bash_version(
                    "echo ${action.weak.p.v}\nret y:int=1\n",
                    vec![],
                )],
            ),
        );
        let issues = validate_doc(&document, invocation("c", &[]));
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn missing_required_axis_is_distinguished() {
        let mut document = Document::default();
        document.axes.insert(
            "mode".to_string(),
            axis("mode", &[("release", false), ("development", false)]),
        );
        document.actions.insert(
            "build".to_string(),
            action(
                "build",
                vec![
                    bash_version(
                        "ret x:int=1\n",
                        vec![Condition::Axis {
                            axis: "mode".to_string(),
                            value: "release".to_string(),
                        }],
                    ),
                    bash_version(
                        "ret x:int=2\n",
                        vec![Condition::Axis {
                            axis: "mode".to_string(),
                            value: "development".to_string(),
                        }],
                    ),
                ],
            ),
        );
        let issues = validate_doc(&document, invocation("build", &[]));
        assert!(issues
            .iter()
            .any(|i| matches!(i, Issue::MissingRequiredAxis { axis, .. } if axis == "mode")));
    }

    #[test]
    fn unknown_condition_axis_is_reported() {
        let mut document = Document::default();
        document.actions.insert(
            "build".to_string(),
            action(
                "build",
                vec![
                    bash_version(
                        "ret x:int=1\n",
                        vec![Condition::Axis {
                            axis: "ghost".to_string(),
                            value: "on".to_string(),
                        }],
                    ),
                    bash_version("ret x:int=2\n", vec![]),
                ],
            ),
        );
        let issues = validate_doc(&document, invocation("build", &[]));
        assert!(issues
            .iter()
            .any(|i| matches!(i, Issue::UnknownAxis { axis, .. } if axis == "ghost")));
    }

    #[test]
    fn retainer_with_weak_deps_is_rejected() {
        let mut document = Document::default();
        document.actions.insert(
            "target".to_string(),
            action("target", vec![bash_version("ret t:int=1\n", vec![])]),
        );
        document.actions.insert(
            "other".to_string(),
            action("other", vec![bash_version("ret o:int=1\n", vec![])]),
        );
        document.actions.insert(
            "decider".to_string(),
            action(
                "decider",
                vec![bash_version("weak action.other\nretain\nret d:int=1\n", vec![])],
            ),
        );
        document.actions.insert(
            "consumer".to_string(),
            action(
                "consumer",
                vec![bash_version(
                    "soft action.target retain.action.decider\nret c:int=1\n",
                    vec![],
                )],
            ),
        );
        let issues = validate_doc(&document, invocation("consumer", &[]));
        assert!(issues
            .iter()
            .any(|i| matches!(i, Issue::RetainerWithConditionalDeps { .. })));
    }

    #[test]
    fn batch_rendering_lists_every_issue() {
        let issues = vec![
            Issue::MissingFlagDefinition {
                node: crate::core::graph::NodeKey::new(
                    "a",
                    crate::core::context::ContextId::empty(),
                ),
                flag: "fast".to_string(),
            },
            Issue::MissingEnv {
                node: crate::core::graph::NodeKey::new(
                    "a",
                    crate::core::context::ContextId::empty(),
                ),
                variable: "HOME".to_string(),
            },
        ];
        let rendered = render_batch(&issues);
        assert!(rendered.contains("validation failed:"));
        assert_eq!(rendered.matches("\n- ").count(), 2);
    }
}
