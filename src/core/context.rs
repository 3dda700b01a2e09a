//! Context algebra: axis-valued contexts, reduction, labels, and identifiers.
//!
//! A context is a mapping from axis names to values. Nodes are keyed by their
//! *reduced* context (restricted to the axes their closure references), which
//! is what makes axis-independent actions shareable across invocations.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

use crate::core::model::AxisDefinition;

/// An execution context: sorted `(axis, value)` bindings.
///
/// Equality is by mapping; the empty context is the shared `global` context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ContextId {
    bindings: Vec<(String, String)>,
}

impl ContextId {
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        Self {
            bindings: map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_global(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.bindings.iter().cloned().collect()
    }

    pub fn bindings(&self) -> &[(String, String)] {
        &self.bindings
    }

    /// Restrict the context to the given axis names.
    pub fn reduce_to(&self, axes: &BTreeSet<String>) -> Self {
        Self {
            bindings: self
                .bindings
                .iter()
                .filter(|(name, _)| axes.contains(name))
                .cloned()
                .collect(),
        }
    }

    /// Human-readable label: `axis:value+axis:value`, or `global` when empty.
    pub fn label(&self) -> String {
        if self.bindings.is_empty() {
            return "global".to_string();
        }
        self.bindings
            .iter()
            .map(|(name, value)| format!("{name}:{value}"))
            .collect::<Vec<_>>()
            .join("+")
    }

    /// Stable directory-safe identifier: 8 hex chars of SHA-256 of the label.
    pub fn hash(&self) -> String {
        let digest = Sha256::digest(self.label().as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        hex[..8].to_string()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Check an axis value against a binding pattern.
///
/// `*` matches every value; `prefix*` matches values starting with `prefix`;
/// anything else matches exactly.
pub fn matches_pattern(value: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => value == pattern,
    }
}

pub fn is_wildcard(pattern: &str) -> bool {
    pattern.ends_with('*')
}

/// Expand an axis binding pattern to the allowed values it matches.
///
/// Returns values in axis declaration order. An empty expansion is an error.
pub fn expand_axis_pattern(axis: &AxisDefinition, pattern: &str) -> Result<Vec<String>> {
    let matched: Vec<String> = axis
        .values
        .iter()
        .filter(|v| matches_pattern(&v.value, pattern))
        .map(|v| v.value.clone())
        .collect();
    if matched.is_empty() {
        bail!("no matches for {}:{pattern}", axis.name);
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::test_fixtures::axis;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn label_is_sorted_and_stable() {
        let ctx = ContextId::from_map(&map(&[("scala", "2.13"), ("platform", "jvm")]));
        assert_eq!(ctx.label(), "platform:jvm+scala:2.13");
    }

    #[test]
    fn empty_context_is_global() {
        let ctx = ContextId::empty();
        assert!(ctx.is_global());
        assert_eq!(ctx.label(), "global");
    }

    #[test]
    fn hash_is_deterministic_and_distinguishes_contexts() {
        let a = ContextId::from_map(&map(&[("mode", "release")]));
        let b = ContextId::from_map(&map(&[("mode", "development")]));
        assert_eq!(a.hash(), a.hash());
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 8);
    }

    #[test]
    fn reduce_keeps_only_named_axes() {
        let ctx = ContextId::from_map(&map(&[("platform", "jvm"), ("scala", "2.13")]));
        let axes: BTreeSet<String> = ["platform".to_string()].into_iter().collect();
        let reduced = ctx.reduce_to(&axes);
        assert_eq!(reduced.label(), "platform:jvm");
    }

    #[test]
    fn reduce_to_nothing_yields_global() {
        let ctx = ContextId::from_map(&map(&[("platform", "jvm")]));
        let reduced = ctx.reduce_to(&BTreeSet::new());
        assert!(reduced.is_global());
    }

    #[test]
    fn pattern_matching() {
        assert!(matches_pattern("2.13.0", "*"));
        assert!(matches_pattern("2.13.0", "2.13*"));
        assert!(!matches_pattern("2.12.0", "2.13*"));
        assert!(matches_pattern("jvm", "jvm"));
        assert!(!matches_pattern("js", "jvm"));
    }

    #[test]
    fn expand_pattern_returns_matches_in_declaration_order() {
        let def = axis(
            "scala",
            &[("2.12.0", false), ("2.13.0", true), ("2.13.5", false), ("3.3.0", false)],
        );
        let values = expand_axis_pattern(&def, "2.13*").expect("expand");
        assert_eq!(values, vec!["2.13.0".to_string(), "2.13.5".to_string()]);

        let all = expand_axis_pattern(&def, "*").expect("expand");
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn empty_expansion_is_an_error() {
        let def = axis("scala", &[("2.13.0", true)]);
        let err = expand_axis_pattern(&def, "2.12*").expect_err("no match");
        assert_eq!(err.to_string(), "no matches for scala:2.12*");
    }
}
