//! Scanning of script text: `${…}` expansions, dependency declarations,
//! and return declarations.
//!
//! Scanning is purely lexical and happens at document ingestion. The same
//! declarations double as runtime no-ops inside the rendered scripts, so a
//! script stays a valid bash or python program.

use std::sync::LazyLock;

use anyhow::{bail, Result};
use regex::Regex;

use crate::core::types::{Language, ReturnType};

/// A `${…}` reference found in a script.
///
/// `text` is the original expansion text including `${}`, used for textual
/// substitution when rendering bash scripts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expansion {
    /// `${sys.name}` - engine-provided system variable.
    System { text: String, name: String },
    /// `${env.NAME}` - environment variable.
    Env { text: String, name: String },
    /// `${args.name}` - CLI argument.
    Args { text: String, name: String },
    /// `${flags.name}` - CLI flag, rendered as `1`/`0`.
    Flags { text: String, name: String },
    /// `${action.name.output}` - output of a strong dependency.
    Action {
        text: String,
        action: String,
        output: String,
    },
    /// `${action.weak.name.output}` - output of a weak dependency, empty when pruned.
    WeakAction {
        text: String,
        action: String,
        output: String,
    },
    /// `${retained.weak.name}` - `1` when the weak target is in the executable set.
    RetainedWeak { text: String, action: String },
    /// `${retained.soft.name}` - `1` when the soft target was promoted.
    RetainedSoft { text: String, action: String },
}

impl Expansion {
    pub fn text(&self) -> &str {
        match self {
            Self::System { text, .. }
            | Self::Env { text, .. }
            | Self::Args { text, .. }
            | Self::Flags { text, .. }
            | Self::Action { text, .. }
            | Self::WeakAction { text, .. }
            | Self::RetainedWeak { text, .. }
            | Self::RetainedSoft { text, .. } => text,
        }
    }
}

/// Strength of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependencyKind {
    /// Must succeed before the dependent runs.
    Strong,
    /// Used only if the target is independently needed.
    Weak,
    /// Gated by a retainer action's retain signal.
    Soft,
}

/// Explicit dependency declaration parsed from a script.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyDeclaration {
    pub action: String,
    pub kind: DependencyKind,
    /// Retainer action; present iff `kind` is `Soft`.
    pub retainer: Option<String>,
}

/// Scan all `${…}` expansions in a script, in order of appearance.
///
/// Unknown namespaces are left alone: `${HOME}` and similar plain shell
/// expansions belong to the script, not to us.
pub fn scan_expansions(script: &str) -> Vec<Expansion> {
    static EXPANSION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\$\{(sys|env|args|flags|action|retained)\.([A-Za-z0-9_][A-Za-z0-9_.-]*)\}")
            .unwrap()
    });

    let mut expansions = Vec::new();
    for caps in EXPANSION_RE.captures_iter(script) {
        let text = caps.get(0).unwrap().as_str().to_string();
        let namespace = caps.get(1).unwrap().as_str();
        let path = caps.get(2).unwrap().as_str();

        let expansion = match namespace {
            "sys" => Some(Expansion::System {
                text,
                name: path.to_string(),
            }),
            "env" => Some(Expansion::Env {
                text,
                name: path.to_string(),
            }),
            "args" => Some(Expansion::Args {
                text,
                name: path.to_string(),
            }),
            "flags" => Some(Expansion::Flags {
                text,
                name: path.to_string(),
            }),
            "action" => parse_action_path(text, path),
            "retained" => parse_retained_path(text, path),
            _ => None,
        };
        if let Some(expansion) = expansion {
            expansions.push(expansion);
        }
    }
    expansions
}

fn parse_action_path(text: String, path: &str) -> Option<Expansion> {
    let segments: Vec<&str> = path.split('.').collect();
    match segments.as_slice() {
        ["weak", action, output] => Some(Expansion::WeakAction {
            text,
            action: action.to_string(),
            output: output.to_string(),
        }),
        [action, output] => Some(Expansion::Action {
            text,
            action: action.to_string(),
            output: output.to_string(),
        }),
        _ => None,
    }
}

fn parse_retained_path(text: String, path: &str) -> Option<Expansion> {
    let segments: Vec<&str> = path.split('.').collect();
    match segments.as_slice() {
        ["weak", action] => Some(Expansion::RetainedWeak {
            text,
            action: action.to_string(),
        }),
        ["soft", action] => Some(Expansion::RetainedSoft {
            text,
            action: action.to_string(),
        }),
        _ => None,
    }
}

/// Scan explicit dependency declarations in a script.
///
/// Returns `(action_dependencies, env_var_dependencies)`. Both the bash
/// pseudo-command form (`dep action.x`) and the python runtime-call form
/// (`mdl.dep("action.x")`) are recognized regardless of language; comment
/// lines are skipped.
pub fn scan_dependencies(script: &str) -> (Vec<DependencyDeclaration>, Vec<String>) {
    static BASH_DEP_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*dep\s+action\.([a-zA-Z][a-zA-Z0-9_-]*)\s*$").unwrap());
    static BASH_WEAK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*weak\s+action\.([a-zA-Z][a-zA-Z0-9_-]*)\s*$").unwrap());
    static BASH_SOFT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"^\s*soft\s+action\.([a-zA-Z][a-zA-Z0-9_-]*)\s+retain\.action\.([a-zA-Z][a-zA-Z0-9_-]*)\s*$",
        )
        .unwrap()
    });
    static BASH_ENV_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*dep\s+env\.([A-Z_][A-Z0-9_]*)\s*$").unwrap());
    static PY_DEP_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"^\s*mdl\.dep\s*\(\s*["']action\.([a-zA-Z][a-zA-Z0-9_-]*)["']"#).unwrap()
    });
    static PY_WEAK_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"^\s*mdl\.weak\s*\(\s*["']action\.([a-zA-Z][a-zA-Z0-9_-]*)["']"#).unwrap()
    });
    static PY_SOFT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r#"^\s*mdl\.soft\s*\(\s*["']action\.([a-zA-Z][a-zA-Z0-9_-]*)["']\s*,\s*["']action\.([a-zA-Z][a-zA-Z0-9_-]*)["']"#,
        )
        .unwrap()
    });
    static PY_ENV_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"^\s*mdl\.dep\s*\(\s*["']env\.([A-Z_][A-Z0-9_]*)["']"#).unwrap()
    });

    let mut deps = Vec::new();
    let mut env_deps = Vec::new();

    for line in script.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }

        if let Some(caps) = BASH_DEP_RE.captures(line).or_else(|| PY_DEP_RE.captures(line)) {
            deps.push(DependencyDeclaration {
                action: caps[1].to_string(),
                kind: DependencyKind::Strong,
                retainer: None,
            });
        } else if let Some(caps) = BASH_WEAK_RE
            .captures(line)
            .or_else(|| PY_WEAK_RE.captures(line))
        {
            deps.push(DependencyDeclaration {
                action: caps[1].to_string(),
                kind: DependencyKind::Weak,
                retainer: None,
            });
        } else if let Some(caps) = BASH_SOFT_RE
            .captures(line)
            .or_else(|| PY_SOFT_RE.captures(line))
        {
            deps.push(DependencyDeclaration {
                action: caps[1].to_string(),
                kind: DependencyKind::Soft,
                retainer: Some(caps[2].to_string()),
            });
        } else if let Some(caps) = BASH_ENV_RE
            .captures(line)
            .or_else(|| PY_ENV_RE.captures(line))
        {
            env_deps.push(caps[1].to_string());
        }
    }

    (deps, env_deps)
}

/// Scan return declarations in a script.
///
/// Bash: `ret name:type=value-expression` lines.
/// Python: `mdl.ret("name", expr, "type")` calls.
pub fn scan_returns(
    script: &str,
    language: Language,
) -> Result<Vec<crate::core::model::ReturnDeclaration>> {
    static BASH_RET_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*ret\s+([a-zA-Z][a-zA-Z0-9_-]*):([a-zA-Z]+)=(.*)$").unwrap()
    });
    static PY_RET_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"^\s*mdl\.ret\s*\(\s*["']([a-zA-Z][a-zA-Z0-9_-]*)["']\s*,\s*(.+?)\s*,\s*["']([a-zA-Z]+)["']\s*\)"#)
            .unwrap()
    });

    let mut returns = Vec::new();
    for line in script.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        let (name, type_str, value) = match language {
            Language::Bash => match BASH_RET_RE.captures(line) {
                Some(caps) => (
                    caps[1].to_string(),
                    caps[2].to_string(),
                    caps[3].trim().to_string(),
                ),
                None => continue,
            },
            Language::Python => match PY_RET_RE.captures(line) {
                Some(caps) => (
                    caps[1].to_string(),
                    caps[3].to_string(),
                    caps[2].trim().to_string(),
                ),
                None => continue,
            },
        };

        let return_type = ReturnType::parse(&type_str)
            .map_err(|err| anyhow::anyhow!("invalid return declaration '{name}': {err}"))?;

        if returns
            .iter()
            .any(|r: &crate::core::model::ReturnDeclaration| r.name == name)
        {
            bail!("duplicate return declaration '{name}'");
        }

        returns.push(crate::core::model::ReturnDeclaration {
            name,
            return_type,
            value_expression: value,
        });
    }
    Ok(returns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_all_expansion_kinds() {
        let script = "\
echo ${sys.project-root} ${env.HOME} ${args.target} ${flags.release}
cp ${action.build.out} ${action.weak.extras.dir}
if [ ${retained.weak.extras} = 1 ] && [ ${retained.soft.docs} = 1 ]; then :; fi
";
        let expansions = scan_expansions(script);
        assert_eq!(expansions.len(), 8);
        assert!(matches!(&expansions[0], Expansion::System { name, .. } if name == "project-root"));
        assert!(matches!(&expansions[4], Expansion::Action { action, output, .. }
            if action == "build" && output == "out"));
        assert!(matches!(&expansions[5], Expansion::WeakAction { action, output, .. }
            if action == "extras" && output == "dir"));
        assert!(matches!(&expansions[6], Expansion::RetainedWeak { action, .. } if action == "extras"));
        assert!(matches!(&expansions[7], Expansion::RetainedSoft { action, .. } if action == "docs"));
    }

    #[test]
    fn plain_shell_expansions_are_ignored() {
        let expansions = scan_expansions("echo ${HOME} ${1:-default} ${PATH}");
        assert!(expansions.is_empty());
    }

    #[test]
    fn scans_bash_dependency_declarations() {
        let script = "\
dep action.build
weak action.extras
soft action.docs retain.action.check-docs
dep env.CARGO_HOME
# dep action.commented-out
";
        let (deps, env_deps) = scan_dependencies(script);
        assert_eq!(deps.len(), 3);
        assert_eq!(deps[0].action, "build");
        assert_eq!(deps[0].kind, DependencyKind::Strong);
        assert_eq!(deps[1].kind, DependencyKind::Weak);
        assert_eq!(deps[2].kind, DependencyKind::Soft);
        assert_eq!(deps[2].retainer.as_deref(), Some("check-docs"));
        assert_eq!(env_deps, vec!["CARGO_HOME".to_string()]);
    }

    #[test]
    fn scans_python_dependency_declarations() {
        let script = r#"
mdl.dep("action.build")
mdl.weak('action.extras')
mdl.soft("action.docs", "action.check-docs")
mdl.dep("env.HOME")
"#;
        let (deps, env_deps) = scan_dependencies(script);
        assert_eq!(deps.len(), 3);
        assert_eq!(deps[2].retainer.as_deref(), Some("check-docs"));
        assert_eq!(env_deps, vec!["HOME".to_string()]);
    }

    #[test]
    fn scans_bash_returns() {
        let script = "ret out:file=$dir/a.txt\nret count:int=3\n";
        let returns = scan_returns(script, Language::Bash).expect("scan");
        assert_eq!(returns.len(), 2);
        assert_eq!(returns[0].name, "out");
        assert_eq!(returns[0].return_type, ReturnType::File);
        assert_eq!(returns[1].value_expression, "3");
    }

    #[test]
    fn scans_python_returns() {
        let script = r#"mdl.ret("count", 1 + 2, "int")"#;
        let returns = scan_returns(script, Language::Python).expect("scan");
        assert_eq!(returns.len(), 1);
        assert_eq!(returns[0].name, "count");
        assert_eq!(returns[0].return_type, ReturnType::Int);
    }

    #[test]
    fn duplicate_return_names_fail() {
        let script = "ret out:int=1\nret out:int=2\n";
        let err = scan_returns(script, Language::Bash).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate return"));
    }

    #[test]
    fn invalid_return_type_fails() {
        let err = scan_returns("ret out:float=1\n", Language::Bash).expect_err("bad type");
        assert!(err.to_string().contains("invalid type"));
    }
}
