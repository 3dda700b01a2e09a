//! Document entities: actions, versions, conditions, arguments, flags, axes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::{bail, Result};

use crate::core::script::{DependencyDeclaration, Expansion};
use crate::core::types::{Language, Platform, ReturnType};

/// Source location in a definition file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: usize,
    pub section: String,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (in '{}')", self.file, self.line, self.section)
    }
}

/// Predicate gating an action version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Condition {
    /// Satisfied when the resolved context binds `axis` to `value`.
    Axis { axis: String, value: String },
    /// Satisfied when the host platform matches.
    Platform(Platform),
}

impl Condition {
    pub fn matches(&self, axis_values: &BTreeMap<String, String>, platform: Platform) -> bool {
        match self {
            Self::Axis { axis, value } => axis_values.get(axis) == Some(value),
            Self::Platform(p) => *p == platform,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Axis { axis, value } => write!(f, "{axis}: {value}"),
            Self::Platform(p) => write!(f, "sys.platform: {p}"),
        }
    }
}

/// Return value declaration extracted from a version's script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnDeclaration {
    pub name: String,
    pub return_type: ReturnType,
    /// Source-level value expression; evaluated by the script, not the core.
    pub value_expression: String,
}

/// Command-line argument definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentDefinition {
    pub name: String,
    pub arg_type: ReturnType,
    /// Default value; `None` makes the argument mandatory.
    pub default_value: Option<String>,
    pub description: String,
    pub location: SourceLocation,
}

impl ArgumentDefinition {
    pub fn is_mandatory(&self) -> bool {
        self.default_value.is_none()
    }
}

/// Command-line flag definition. Flags are boolean and default to false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagDefinition {
    pub name: String,
    pub description: String,
    pub location: SourceLocation,
}

/// Single value in an axis definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisValue {
    pub value: String,
    pub is_default: bool,
}

/// Axis definition: an ordered set of allowed values, at most one default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisDefinition {
    pub name: String,
    pub values: Vec<AxisValue>,
    pub location: SourceLocation,
}

impl AxisDefinition {
    pub fn default_value(&self) -> Option<&str> {
        self.values
            .iter()
            .find(|v| v.is_default)
            .map(|v| v.value.as_str())
    }

    pub fn allows(&self, value: &str) -> bool {
        self.values.iter().any(|v| v.value == value)
    }

    pub fn value_names(&self) -> Vec<&str> {
        self.values.iter().map(|v| v.value.as_str()).collect()
    }
}

/// Single version of an action, bound by zero or more conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionVersion {
    pub script: String,
    pub language: Language,
    pub conditions: Vec<Condition>,
    pub expansions: Vec<Expansion>,
    pub returns: Vec<ReturnDeclaration>,
    pub dependencies: Vec<DependencyDeclaration>,
    /// Environment variables declared via `dep env.VAR`.
    pub env_dependencies: Vec<String>,
    pub location: SourceLocation,
}

impl ActionVersion {
    pub fn matches(&self, axis_values: &BTreeMap<String, String>, platform: Platform) -> bool {
        self.conditions
            .iter()
            .all(|c| c.matches(axis_values, platform))
    }

    /// Axis names referenced by this version's conditions.
    pub fn condition_axes(&self) -> BTreeSet<String> {
        self.conditions
            .iter()
            .filter_map(|c| match c {
                Condition::Axis { axis, .. } => Some(axis.clone()),
                Condition::Platform(_) => None,
            })
            .collect()
    }

    pub fn declares_return(&self, name: &str) -> bool {
        self.returns.iter().any(|r| r.name == name)
    }
}

/// Complete action definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionDefinition {
    pub name: String,
    pub versions: Vec<ActionVersion>,
    /// Required environment variables (name -> description).
    pub required_env_vars: BTreeMap<String, String>,
    pub description: String,
    pub location: SourceLocation,
}

impl ActionDefinition {
    pub fn is_multi_version(&self) -> bool {
        self.versions.len() > 1
    }

    /// Select the version for the given axis values and platform.
    ///
    /// Among versions whose conditions all hold, the one with the greatest
    /// condition count wins. A tie between distinct versions is an error, as
    /// is no version matching at all.
    pub fn select_version(
        &self,
        axis_values: &BTreeMap<String, String>,
        platform: Platform,
    ) -> Result<&ActionVersion> {
        let matching: Vec<&ActionVersion> = self
            .versions
            .iter()
            .filter(|v| v.matches(axis_values, platform))
            .collect();

        if matching.is_empty() {
            let bound = axis_values
                .iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect::<Vec<_>>()
                .join(", ");
            bail!(
                "no version of action '{}' matches axis values [{bound}]",
                self.name
            );
        }

        let best = matching
            .iter()
            .map(|v| v.conditions.len())
            .max()
            .unwrap_or(0);
        let winners: Vec<&ActionVersion> = matching
            .into_iter()
            .filter(|v| v.conditions.len() == best)
            .collect();

        if winners.len() > 1 {
            let locations = winners
                .iter()
                .map(|v| v.location.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            bail!(
                "ambiguous version selection for action '{}': {} versions with {} condition(s) match ({locations})",
                self.name,
                winners.len(),
                best
            );
        }

        Ok(winners[0])
    }

    /// All expansions across every version.
    pub fn all_expansions(&self) -> impl Iterator<Item = &Expansion> {
        self.versions.iter().flat_map(|v| v.expansions.iter())
    }

    /// Names of actions any version of this action may depend on.
    ///
    /// This is the "potential" dependency set used for footprint computation:
    /// version selection happens per context, so every version counts.
    pub fn potential_dependencies(&self) -> BTreeSet<String> {
        let mut deps = BTreeSet::new();
        for version in &self.versions {
            for expansion in &version.expansions {
                if let Expansion::Action { action, .. } | Expansion::WeakAction { action, .. } =
                    expansion
                {
                    deps.insert(action.clone());
                }
            }
            for decl in &version.dependencies {
                deps.insert(decl.action.clone());
                if let Some(retainer) = &decl.retainer {
                    deps.insert(retainer.clone());
                }
            }
        }
        deps
    }

    /// Axis names appearing in conditions of any version.
    pub fn condition_axes(&self) -> BTreeSet<String> {
        self.versions
            .iter()
            .flat_map(|v| v.condition_axes())
            .collect()
    }
}

/// Complete normalized document fed to the core by the markdown front-end.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub actions: BTreeMap<String, ActionDefinition>,
    pub arguments: BTreeMap<String, ArgumentDefinition>,
    pub flags: BTreeMap<String, FlagDefinition>,
    pub axes: BTreeMap<String, AxisDefinition>,
    /// Document-declared environment variables exported into every child.
    pub environment_vars: BTreeMap<String, String>,
    /// Variables forwarded from the parent process when present.
    pub passthrough_env_vars: Vec<String>,
}

impl Document {
    pub fn action(&self, name: &str) -> Result<&ActionDefinition> {
        self.actions.get(name).ok_or_else(|| {
            let available = self
                .actions
                .keys()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            anyhow::anyhow!("action '{name}' not found (available: {available})")
        })
    }

    /// Default context: union of every axis default.
    pub fn default_axis_values(&self) -> BTreeMap<String, String> {
        self.axes
            .iter()
            .filter_map(|(name, def)| {
                def.default_value()
                    .map(|value| (name.clone(), value.to_string()))
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::{action, bash_version, loc};
    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn single_unconditional_version_always_selected() {
        let a = action("build", vec![bash_version("ret ok:int=1", vec![])]);
        let version = a
            .select_version(&ctx(&[]), Platform::Linux)
            .expect("select");
        assert!(version.conditions.is_empty());
    }

    #[test]
    fn version_with_most_satisfied_conditions_wins() {
        let generic = bash_version(
            "ret mode:string=generic",
            vec![Condition::Axis {
                axis: "mode".to_string(),
                value: "release".to_string(),
            }],
        );
        let specific = bash_version(
            "ret mode:string=specific",
            vec![
                Condition::Axis {
                    axis: "mode".to_string(),
                    value: "release".to_string(),
                },
                Condition::Platform(Platform::Linux),
            ],
        );
        let a = action("build", vec![generic, specific]);

        let version = a
            .select_version(&ctx(&[("mode", "release")]), Platform::Linux)
            .expect("select");
        assert_eq!(version.conditions.len(), 2);
    }

    #[test]
    fn tie_between_versions_is_an_error() {
        let v1 = bash_version(
            "ret a:int=1",
            vec![Condition::Axis {
                axis: "mode".to_string(),
                value: "release".to_string(),
            }],
        );
        let v2 = bash_version(
            "ret b:int=2",
            vec![Condition::Platform(Platform::Linux)],
        );
        let a = action("build", vec![v1, v2]);

        let err = a
            .select_version(&ctx(&[("mode", "release")]), Platform::Linux)
            .expect_err("tie should fail");
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn no_matching_version_is_an_error() {
        let v = bash_version(
            "ret a:int=1",
            vec![Condition::Axis {
                axis: "mode".to_string(),
                value: "release".to_string(),
            }],
        );
        let a = action("build", vec![v]);

        let err = a
            .select_version(&ctx(&[("mode", "debug")]), Platform::Linux)
            .expect_err("no match should fail");
        assert!(err.to_string().contains("no version"));
    }

    #[test]
    fn potential_dependencies_cover_all_versions_and_retainers() {
        let v1 = bash_version("dep action.compile\nret a:int=1", vec![]);
        let v2 = bash_version(
            "soft action.extras retain.action.check-extras\nret a:int=1",
            vec![Condition::Platform(Platform::Linux)],
        );
        let a = action("build", vec![v1, v2]);

        let deps = a.potential_dependencies();
        assert!(deps.contains("compile"));
        assert!(deps.contains("extras"));
        assert!(deps.contains("check-extras"));
    }

    #[test]
    fn axis_default_lookup() {
        let axis = super::test_fixtures::axis("mode", &[("debug", true), ("release", false)]);
        assert_eq!(axis.default_value(), Some("debug"));
        assert!(axis.allows("release"));
        assert!(!axis.allows("profile"));
        let _ = loc();
    }
}
