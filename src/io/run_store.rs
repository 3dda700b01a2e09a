//! On-disk layout of runs: `.mdl/runs/<timestamp>-<nanos>/<node-id>/` with
//! captured streams, typed outputs, and completion metadata.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::graph::NodeKey;
use crate::core::model::ReturnDeclaration;
use crate::core::types::{ReturnType, TypedValue};

pub const RUNS_SUBDIR: &str = ".mdl/runs";

/// Completion record written next to a node's captured output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeMeta {
    pub action_name: String,
    pub success: bool,
    pub start_time: String,
    pub end_time: String,
    pub duration_seconds: f64,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One run's directory under `.mdl/runs/`.
#[derive(Debug, Clone)]
pub struct RunStore {
    pub project_root: PathBuf,
    pub run_id: String,
    pub run_dir: PathBuf,
}

impl RunStore {
    /// Create a fresh run directory.
    ///
    /// The run id is `<YYYYMMDD-HHMMSS>-<nanos within the second, zero
    /// padded>`: lexicographic order of run ids is creation order, which is
    /// what makes "latest run" a plain directory-name maximum.
    pub fn create(project_root: &Path) -> Result<Self> {
        let now = Local::now();
        let run_id = format!(
            "{}-{:09}",
            now.format("%Y%m%d-%H%M%S"),
            now.timestamp_subsec_nanos()
        );
        let run_dir = project_root.join(RUNS_SUBDIR).join(&run_id);
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("create run directory {}", run_dir.display()))?;
        debug!(run_id = %run_id, "created run directory");
        Ok(Self {
            project_root: project_root.to_path_buf(),
            run_id,
            run_dir,
        })
    }

    /// The most recent prior run directory, if any.
    pub fn latest_run_dir(project_root: &Path) -> Option<PathBuf> {
        let runs_dir = project_root.join(RUNS_SUBDIR);
        let entries = fs::read_dir(&runs_dir).ok()?;
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.path())
            .max()
    }

    /// Directory for a node, created on demand.
    pub fn node_dir(&self, key: &NodeKey) -> Result<PathBuf> {
        let dir = self.run_dir.join(key.dir_name());
        fs::create_dir_all(&dir)
            .with_context(|| format!("create action directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Delete the whole run directory (end-of-run cleanup on success).
    pub fn remove(&self) -> Result<()> {
        fs::remove_dir_all(&self.run_dir)
            .with_context(|| format!("remove run directory {}", self.run_dir.display()))
    }
}

pub fn write_meta(node_dir: &Path, meta: &NodeMeta) -> Result<()> {
    let path = node_dir.join("meta.json");
    let mut buf = serde_json::to_string_pretty(meta).context("serialize meta.json")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))
}

pub fn read_meta(node_dir: &Path) -> Result<NodeMeta> {
    let path = node_dir.join("meta.json");
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// One `{type, value}` record in `output.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OutputRecord {
    #[serde(rename = "type")]
    type_name: String,
    value: serde_json::Value,
}

/// Parse and validate a node's `output.json` against its declared returns.
///
/// Every declared return must be present and coerce to its declared type;
/// `file`/`directory` values must name paths that exist (relative paths
/// resolve against the project root). Undeclared extra entries are ignored.
pub fn read_outputs(
    output_json_path: &Path,
    declarations: &[ReturnDeclaration],
    project_root: &Path,
) -> Result<BTreeMap<String, TypedValue>> {
    let contents = fs::read_to_string(output_json_path)
        .with_context(|| format!("read {}", output_json_path.display()))?;
    let records: BTreeMap<String, OutputRecord> = serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", output_json_path.display()))?;

    let mut outputs = BTreeMap::new();
    for decl in declarations {
        let record = records
            .get(&decl.name)
            .with_context(|| format!("output '{}' missing from output.json", decl.name))?;
        let value = TypedValue::coerce(decl.return_type, &record.value)
            .with_context(|| format!("output '{}' has the wrong type", decl.name))?;

        if decl.return_type.is_path() {
            validate_path_output(decl, &value, project_root)?;
        }
        outputs.insert(decl.name.clone(), value);
    }
    Ok(outputs)
}

fn validate_path_output(
    decl: &ReturnDeclaration,
    value: &TypedValue,
    project_root: &Path,
) -> Result<()> {
    let raw = value.render();
    let path = PathBuf::from(&raw);
    let resolved = if path.is_absolute() {
        path
    } else {
        project_root.join(path)
    };
    if !resolved.exists() {
        bail!(
            "{} '{}' does not exist: {raw}",
            decl.return_type,
            decl.name
        );
    }
    if decl.return_type == ReturnType::File && !resolved.is_file() {
        bail!("output '{}' is not a file: {raw}", decl.name);
    }
    Ok(())
}

/// Whether a node can be restored from a previous run: its directory is
/// there and `meta.json` reports success.
pub fn can_restore(previous_run_dir: &Path, node_dir_name: &str) -> bool {
    let node_dir = previous_run_dir.join(node_dir_name);
    match read_meta(&node_dir) {
        Ok(meta) => meta.success,
        Err(_) => false,
    }
}

/// Copy a node directory from a previous run into the current one.
pub fn restore_node_dir(
    previous_run_dir: &Path,
    current_run_dir: &Path,
    node_dir_name: &str,
) -> Result<PathBuf> {
    let from = previous_run_dir.join(node_dir_name);
    let to = current_run_dir.join(node_dir_name);
    copy_dir(&from, &to)
        .with_context(|| format!("restore {} from {}", node_dir_name, from.display()))?;
    debug!(node = node_dir_name, "restored node directory from previous run");
    Ok(to)
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).with_context(|| format!("create {}", to.display()))?;
    for entry in fs::read_dir(from).with_context(|| format!("read {}", from.display()))? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::ContextId;

    fn decl(name: &str, ty: ReturnType) -> ReturnDeclaration {
        ReturnDeclaration {
            name: name.to_string(),
            return_type: ty,
            value_expression: String::new(),
        }
    }

    fn meta(success: bool) -> NodeMeta {
        NodeMeta {
            action_name: "a".to_string(),
            success,
            start_time: "2026-01-01T00:00:00".to_string(),
            end_time: "2026-01-01T00:00:01".to_string(),
            duration_seconds: 1.0,
            exit_code: 0,
            error_message: None,
        }
    }

    #[test]
    fn run_ids_are_lexicographically_ordered() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = RunStore::create(temp.path()).expect("create");
        let second = RunStore::create(temp.path()).expect("create");
        assert!(second.run_id >= first.run_id);

        let latest = RunStore::latest_run_dir(temp.path()).expect("latest");
        assert_eq!(latest, second.run_dir);
    }

    #[test]
    fn meta_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_meta(temp.path(), &meta(true)).expect("write");
        let loaded = read_meta(temp.path()).expect("read");
        assert!(loaded.success);
        assert_eq!(loaded.exit_code, 0);
    }

    #[test]
    fn error_message_is_omitted_when_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_meta(temp.path(), &meta(true)).expect("write");
        let raw = fs::read_to_string(temp.path().join("meta.json")).expect("read");
        assert!(!raw.contains("error_message"));
    }

    #[test]
    fn outputs_parse_and_coerce() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("output.json");
        fs::write(
            &path,
            r#"{"count":{"type":"int","value":3},"ok":{"type":"bool","value":true}}"#,
        )
        .expect("write");

        let outputs = read_outputs(
            &path,
            &[decl("count", ReturnType::Int), decl("ok", ReturnType::Bool)],
            temp.path(),
        )
        .expect("read");
        assert_eq!(outputs["count"], TypedValue::Int(3));
        assert_eq!(outputs["ok"], TypedValue::Bool(true));
    }

    #[test]
    fn missing_declared_output_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("output.json");
        fs::write(&path, "{}").expect("write");
        let err = read_outputs(&path, &[decl("count", ReturnType::Int)], temp.path())
            .expect_err("missing");
        assert!(err.to_string().contains("missing from output.json"));
    }

    #[test]
    fn type_mismatch_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("output.json");
        fs::write(&path, r#"{"count":{"type":"int","value":"many"}}"#).expect("write");
        let err = read_outputs(&path, &[decl("count", ReturnType::Int)], temp.path())
            .expect_err("mismatch");
        assert!(err.to_string().contains("wrong type"));
    }

    #[test]
    fn file_output_must_exist_and_be_a_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("output.json");
        fs::write(
            &path,
            r#"{"out":{"type":"file","value":"result.txt"}}"#,
        )
        .expect("write");

        let err = read_outputs(&path, &[decl("out", ReturnType::File)], temp.path())
            .expect_err("missing file");
        assert!(err.to_string().contains("does not exist"));

        fs::write(temp.path().join("result.txt"), "x").expect("write file");
        let outputs = read_outputs(&path, &[decl("out", ReturnType::File)], temp.path())
            .expect("read");
        assert_eq!(outputs["out"].render(), "result.txt");
    }

    #[test]
    fn directory_output_resolves_relative_to_project_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("build")).expect("mkdir");
        let path = temp.path().join("output.json");
        fs::write(&path, r#"{"d":{"type":"directory","value":"build"}}"#).expect("write");
        let outputs = read_outputs(&path, &[decl("d", ReturnType::Directory)], temp.path())
            .expect("read");
        assert_eq!(outputs["d"].render(), "build");
    }

    #[test]
    fn restore_requires_successful_meta() {
        let temp = tempfile::tempdir().expect("tempdir");
        let prev = temp.path().join("prev");
        let node = prev.join("build");
        fs::create_dir_all(&node).expect("mkdir");
        assert!(!can_restore(&prev, "build"));

        write_meta(&node, &meta(false)).expect("write");
        assert!(!can_restore(&prev, "build"));

        write_meta(&node, &meta(true)).expect("write");
        assert!(can_restore(&prev, "build"));
    }

    #[test]
    fn restore_copies_node_directory_recursively() {
        let temp = tempfile::tempdir().expect("tempdir");
        let prev = temp.path().join("prev");
        let curr = temp.path().join("curr");
        let node = prev.join("build");
        fs::create_dir_all(node.join("nested")).expect("mkdir");
        fs::write(node.join("stdout.log"), "hello").expect("write");
        fs::write(node.join("nested/file"), "deep").expect("write");
        fs::create_dir_all(&curr).expect("mkdir");

        let restored = restore_node_dir(&prev, &curr, "build").expect("restore");
        assert_eq!(
            fs::read_to_string(restored.join("stdout.log")).expect("read"),
            "hello"
        );
        assert_eq!(
            fs::read_to_string(restored.join("nested/file")).expect("read"),
            "deep"
        );
    }

    #[test]
    fn node_dir_uses_dir_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::create(temp.path()).expect("create");
        let key = NodeKey::new("build", ContextId::empty());
        let dir = store.node_dir(&key).expect("node dir");
        assert!(dir.ends_with("build"));
        assert!(dir.is_dir());
    }
}
