//! CLI invocation layering: merging global and per-goal configuration and
//! expanding axis wildcards into concrete invocations.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use tracing::debug;

use crate::core::model::Document;

/// A goal invocation as tokenized from the command line.
///
/// Axis bindings may still contain wildcard patterns (`*`, `prefix*`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawInvocation {
    pub action: String,
    pub args: BTreeMap<String, String>,
    pub flags: BTreeMap<String, bool>,
    pub axes: BTreeMap<String, String>,
}

/// All custom CLI inputs: global scope plus one entry per `:goal`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliInputs {
    pub global_args: BTreeMap<String, String>,
    pub global_flags: BTreeMap<String, bool>,
    pub global_axes: BTreeMap<String, String>,
    pub invocations: Vec<RawInvocation>,
}

/// A fully resolved goal invocation: concrete axis bindings, merged args and
/// flags with defaults applied. This is the unit the graph compiler consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub action: String,
    pub axis_values: BTreeMap<String, String>,
    pub args: BTreeMap<String, String>,
    pub flags: BTreeMap<String, bool>,
}

/// Resolve raw CLI inputs into concrete invocations.
///
/// Layering: global bindings < per-invocation bindings (per-invocation wins),
/// then axis defaults fill unbound axes, argument defaults fill missing args,
/// and every defined flag defaults to false. Wildcard axis bindings expand
/// into the Cartesian product of their matches; concrete bindings are
/// preserved per child.
pub fn resolve_invocations(document: &Document, inputs: &CliInputs) -> Result<Vec<Invocation>> {
    let mut resolved = Vec::new();

    for raw in &inputs.invocations {
        if !document.actions.contains_key(&raw.action) {
            let available = document
                .actions
                .keys()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            bail!(
                "action '{}' not found (available: {available})",
                raw.action
            );
        }

        // Layer axis bindings, then apply defaults for axes left unbound.
        let mut patterns = inputs.global_axes.clone();
        patterns.extend(raw.axes.clone());
        for (axis_name, axis_def) in &document.axes {
            if !patterns.contains_key(axis_name) {
                if let Some(default) = axis_def.default_value() {
                    patterns.insert(axis_name.clone(), default.to_string());
                }
            }
        }

        let mut args = inputs.global_args.clone();
        args.extend(raw.args.clone());
        for (arg_name, arg_def) in &document.arguments {
            if !args.contains_key(arg_name) {
                if let Some(default) = &arg_def.default_value {
                    args.insert(arg_name.clone(), default.clone());
                }
            }
        }

        let mut flags: BTreeMap<String, bool> = document
            .flags
            .keys()
            .map(|name| (name.clone(), false))
            .collect();
        flags.extend(inputs.global_flags.clone());
        flags.extend(raw.flags.clone());

        for axis_values in expand_axis_products(document, &patterns)? {
            resolved.push(Invocation {
                action: raw.action.clone(),
                axis_values,
                args: args.clone(),
                flags: flags.clone(),
            });
        }
    }

    debug!(count = resolved.len(), "resolved goal invocations");
    Ok(resolved)
}

/// Expand a pattern binding map into concrete binding maps.
///
/// Axes are expanded in sorted name order so the product is deterministic.
fn expand_axis_products(
    document: &Document,
    patterns: &BTreeMap<String, String>,
) -> Result<Vec<BTreeMap<String, String>>> {
    let mut products: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];

    for (axis_name, pattern) in patterns {
        let axis_def = document.axes.get(axis_name).ok_or_else(|| {
            let known = document
                .axes
                .keys()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            anyhow::anyhow!("unknown axis '{axis_name}' (known axes: {known})")
        })?;

        let values = if crate::core::context::is_wildcard(pattern) {
            crate::core::context::expand_axis_pattern(axis_def, pattern)?
        } else {
            if !axis_def.allows(pattern) {
                bail!(
                    "invalid value '{pattern}' for axis '{axis_name}' (valid: {})",
                    axis_def.value_names().join(", ")
                );
            }
            vec![pattern.clone()]
        };

        let mut next = Vec::with_capacity(products.len() * values.len());
        for product in &products {
            for value in &values {
                let mut bound = product.clone();
                bound.insert(axis_name.clone(), value.clone());
                next.push(bound);
            }
        }
        products = next;
    }

    Ok(products)
}
