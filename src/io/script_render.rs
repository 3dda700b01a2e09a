//! Rendering of runtime-assisted scripts.
//!
//! Bash scripts get every `${…}` expansion interpolated and a header that
//! sources the shared `runtime.sh`; python scripts get a generated preamble
//! that loads a per-node `context.json` and exposes the `mdl` surface. The
//! preamble is code generation, not reflection: the paths are baked in.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::json;

use crate::core::model::ActionVersion;
use crate::core::script::Expansion;
use crate::core::types::TypedValue;

/// Shared bash runtime, written once per run directory and sourced by every
/// rendered bash script.
const RUNTIME_SH: &str = r#"# Mudyla bash runtime. Sourced by every rendered script; do not edit.

declare -A __mdl_out_type __mdl_out_value
declare -a __mdl_out_order

__mdl_json_escape() {
    local s=$1
    s=${s//\\/\\\\}
    s=${s//\"/\\\"}
    s=${s//$'\n'/\\n}
    s=${s//$'\r'/\\r}
    s=${s//$'\t'/\\t}
    printf '%s' "$s"
}

__mdl_write_outputs() {
    local name type value first=1
    {
        printf '{'
        if [[ ${#__mdl_out_order[@]} -gt 0 ]]; then
            for name in "${__mdl_out_order[@]}"; do
                type=${__mdl_out_type[$name]}
                value=${__mdl_out_value[$name]}
                [[ $first -eq 1 ]] || printf ','
                first=0
                printf '"%s":{"type":"%s","value":' "$(__mdl_json_escape "$name")" "$type"
                case "$type" in
                    int)
                        printf '%s' "$value"
                        ;;
                    bool)
                        if [[ "$value" == "true" || "$value" == "1" ]]; then
                            printf 'true'
                        else
                            printf 'false'
                        fi
                        ;;
                    *)
                        printf '"%s"' "$(__mdl_json_escape "$value")"
                        ;;
                esac
                printf '}'
            done
        fi
        printf '}\n'
    } >"${MDL_OUTPUT_JSON:?}"
}

# ret name:type=value records a typed output and rewrites output.json.
# Unquoted values containing spaces arrive as several words; rejoin them.
ret() {
    local spec="$*"
    local name=${spec%%:*}
    local rest=${spec#*:}
    local type=${rest%%=*}
    local value=${rest#*=}
    if [[ -z ${__mdl_out_type[$name]+x} ]]; then
        __mdl_out_order+=("$name")
    fi
    __mdl_out_type[$name]=$type
    __mdl_out_value[$name]=$value
    __mdl_write_outputs
}

# Dependency declarations are extracted at parse time; at runtime they are
# no-ops so scripts stay plain bash.
dep() { :; }
weak() { :; }
soft() { :; }

# retain signals the coordinator to promote this retainer's soft targets.
retain() {
    : >"${MDL_RETAIN_FILE:?}"
}
"#;

/// Write the shared bash runtime into the run directory. Idempotent.
pub fn write_runtime(run_dir: &Path) -> Result<std::path::PathBuf> {
    let path = run_dir.join("runtime.sh");
    if !path.exists() {
        fs::write(&path, RUNTIME_SH).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(path)
}

/// Everything expansion resolution needs, assembled by the engine at
/// dispatch time.
#[derive(Debug, Clone, Default)]
pub struct RenderBindings {
    /// `${sys.*}` values: project-root, run-dir, action-dir, platform,
    /// axis.<name> for the node's reduced context.
    pub sys: BTreeMap<String, String>,
    /// Full environment visible to expansions (process + document vars).
    pub env: BTreeMap<String, String>,
    /// Document-declared variables exported explicitly into the child.
    pub document_env: BTreeMap<String, String>,
    pub args: BTreeMap<String, String>,
    pub flags: BTreeMap<String, bool>,
    /// Outputs of finished strong and retained-weak ancestors, by action name.
    pub action_outputs: BTreeMap<String, BTreeMap<String, TypedValue>>,
    /// Whether each weak/soft target is in the executable set, by action name.
    pub retained: BTreeMap<String, bool>,
}

impl RenderBindings {
    /// Resolve one expansion to its substitution text.
    fn resolve(&self, expansion: &Expansion) -> Result<String> {
        match expansion {
            Expansion::System { name, .. } => self
                .sys
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("system variable '{name}' not available")),
            Expansion::Env { name, .. } => self
                .env
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("environment variable '{name}' not available")),
            Expansion::Args { name, .. } => self
                .args
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("argument '{name}' not available")),
            Expansion::Flags { name, .. } => Ok(match self.flags.get(name) {
                Some(true) => "1".to_string(),
                _ => "0".to_string(),
            }),
            Expansion::Action { action, output, .. } => self
                .action_outputs
                .get(action)
                .and_then(|outputs| outputs.get(output))
                .map(TypedValue::render)
                .ok_or_else(|| {
                    anyhow::anyhow!("output '{output}' of action '{action}' not available")
                }),
            // Unresolved weak references render as the empty string.
            Expansion::WeakAction { action, output, .. } => Ok(self
                .action_outputs
                .get(action)
                .and_then(|outputs| outputs.get(output))
                .map(TypedValue::render)
                .unwrap_or_default()),
            Expansion::RetainedWeak { action, .. } | Expansion::RetainedSoft { action, .. } => {
                Ok(match self.retained.get(action) {
                    Some(true) => "1".to_string(),
                    _ => "0".to_string(),
                })
            }
        }
    }
}

/// Render a bash script: interpolate expansions and prepend the runtime
/// header plus document environment exports.
pub fn render_bash(
    version: &ActionVersion,
    bindings: &RenderBindings,
    runtime_path: &Path,
    output_json_path: &Path,
    action_dir: &Path,
) -> Result<String> {
    let mut body = version.script.clone();
    for expansion in &version.expansions {
        let value = bindings.resolve(expansion)?;
        body = body.replace(expansion.text(), &value);
    }

    let mut script = String::new();
    script.push_str("#!/usr/bin/env bash\n");
    script.push_str("# Generated by mdl; edits are lost on the next run.\n");
    script.push_str(&format!(
        "export MDL_OUTPUT_JSON=\"{}\"\n",
        bash_escape(&output_json_path.display().to_string())
    ));
    script.push_str(&format!(
        "export MDL_ACTION_DIR=\"{}\"\n",
        bash_escape(&action_dir.display().to_string())
    ));
    script.push_str(&format!(
        "export MDL_RETAIN_FILE=\"{}\"\n",
        bash_escape(&action_dir.join("retain.flag").display().to_string())
    ));
    script.push_str(&format!(
        "source \"{}\"\n",
        bash_escape(&runtime_path.display().to_string())
    ));

    if !bindings.document_env.is_empty() {
        script.push('\n');
        for (name, value) in &bindings.document_env {
            script.push_str(&format!("export {name}=\"{}\"\n", bash_escape(value)));
        }
    }

    script.push('\n');
    script.push_str(&body);
    if !script.ends_with('\n') {
        script.push('\n');
    }
    Ok(script)
}

fn bash_escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('`', "\\`")
}

/// Render a python script plus its `context.json` payload.
///
/// Values flow through the context file instead of interpolation; the
/// generated preamble exposes them as the `mdl` object.
pub fn render_python(
    version: &ActionVersion,
    bindings: &RenderBindings,
    context_json_path: &Path,
    output_json_path: &Path,
) -> Result<(String, serde_json::Value)> {
    let actions: BTreeMap<&String, BTreeMap<&String, serde_json::Value>> = bindings
        .action_outputs
        .iter()
        .map(|(action, outputs)| {
            let values = outputs
                .iter()
                .map(|(name, value)| {
                    let raw = match value {
                        TypedValue::Bool(b) => json!(b),
                        TypedValue::Int(i) => json!(i),
                        TypedValue::String(s) => json!(s),
                    };
                    (name, raw)
                })
                .collect();
            (action, values)
        })
        .collect();

    let context = json!({
        "sys": &bindings.sys,
        "env": &bindings.env,
        "args": &bindings.args,
        "flags": &bindings.flags,
        "actions": actions,
        "retained": &bindings.retained,
    });

    let context_path = context_json_path.display().to_string();
    let output_path = output_json_path.display().to_string();
    if context_path.contains('"') || output_path.contains('"') {
        bail!("run directory path contains a double quote, which the python preamble cannot embed");
    }

    let preamble = format!(
        r#"#!/usr/bin/env python3
# Generated by mdl; edits are lost on the next run.
import atexit as _mdl_atexit
import json as _mdl_json
import os as _mdl_os

_MDL_CONTEXT_PATH = r"{context_path}"
_MDL_OUTPUT_PATH = r"{output_path}"


class _MdlRuntime:
    def __init__(self, context):
        self.sys = context["sys"]
        self.env = context["env"]
        self.args = context["args"]
        self.flags = context["flags"]
        self.actions = context["actions"]
        self._retained = context["retained"]
        self._outputs = {{}}

    def ret(self, name, value, type):
        if type == "int":
            value = int(value)
        elif type == "bool":
            value = bool(value)
        elif type in ("string", "file", "directory"):
            value = str(value)
        else:
            raise ValueError("invalid return type: %s" % type)
        self._outputs[name] = {{"type": type, "value": value}}

    def dep(self, _target):
        pass

    def weak(self, _target):
        pass

    def soft(self, _target, _retainer):
        pass

    def retain(self):
        path = _mdl_os.environ.get("MDL_RETAIN_FILE")
        if path:
            open(path, "w").close()

    def is_retained(self, name):
        return bool(self._retained.get(name, False))

    def _write_outputs(self):
        with open(_MDL_OUTPUT_PATH, "w") as handle:
            _mdl_json.dump(self._outputs, handle, indent=2)


with open(_MDL_CONTEXT_PATH) as _mdl_handle:
    mdl = _MdlRuntime(_mdl_json.load(_mdl_handle))
_mdl_atexit.register(mdl._write_outputs)


"#
    );

    let mut script = preamble;
    script.push_str(&version.script);
    if !script.ends_with('\n') {
        script.push('\n');
    }
    Ok((script, context))
}
