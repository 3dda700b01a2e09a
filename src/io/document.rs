//! Markdown definition front-end.
//!
//! This is deliberately a narrow collaborator: it discovers definition files
//! and turns them into the normalized [`Document`] the core consumes. The
//! format is line-oriented markdown:
//!
//! - `# action: <name>` sections with fenced `bash`/`python` scripts;
//!   `## definition when `cond, cond`` opens a conditional version and
//!   `## vars` lists required environment variables.
//! - `# arguments`, `# flags`, `# axis` sections with backtick items.
//! - `# environment` with `` `NAME`=`value` `` items and a `## passthrough`
//!   subsection of forwarded variable names.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use crate::core::model::{
    ActionDefinition, ActionVersion, ArgumentDefinition, AxisDefinition, AxisValue, Condition,
    Document, FlagDefinition, ReturnDeclaration, SourceLocation,
};
use crate::core::script::{scan_dependencies, scan_expansions, scan_returns};
use crate::core::types::{Language, Platform, ReturnType};

/// Default discovery pattern for definition files.
pub const DEFAULT_DEFS_PATTERN: &str = ".mdl/defs/**/*.md";

/// Discover definition files under `pattern`, resolved against the project
/// root.
///
/// Patterns without a wildcard name a single file. With wildcards, the
/// longest prefix before the first `*` is walked recursively and every
/// `.md` file below it matches; that covers the `<dir>/**/*.md` shape the
/// tool documents without a full glob engine.
pub fn discover_definition_files(project_root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let absolute = if Path::new(pattern).is_absolute() {
        PathBuf::from(pattern)
    } else {
        project_root.join(pattern)
    };

    if !pattern.contains('*') {
        if absolute.is_file() {
            return Ok(vec![absolute]);
        }
        bail!("no markdown files found matching pattern: {pattern}");
    }

    let pattern_str = absolute.to_string_lossy().to_string();
    let base = match pattern_str.split('*').next() {
        Some(prefix) => {
            let p = Path::new(prefix);
            if prefix.ends_with(std::path::MAIN_SEPARATOR) {
                p.to_path_buf()
            } else {
                p.parent().map(Path::to_path_buf).unwrap_or_default()
            }
        }
        None => absolute.clone(),
    };

    let mut files: Vec<PathBuf> = WalkDir::new(&base)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().map(|e| e == "md").unwrap_or(false))
        .collect();
    files.sort();

    if files.is_empty() {
        bail!("no markdown files found matching pattern: {pattern}");
    }
    debug!(count = files.len(), "discovered definition files");
    Ok(files)
}

/// Parse definition files into one normalized document.
pub fn parse_files(paths: &[PathBuf]) -> Result<Document> {
    let mut document = Document::default();

    for path in paths {
        let content =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        parse_file(&mut document, path, &content)
            .with_context(|| format!("parse {}", path.display()))?;
    }

    Ok(document)
}

static ACTION_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\s+action:\s*([a-zA-Z][a-zA-Z0-9_-]*)\s*$").unwrap());
static SECTION_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\s+([a-zA-Z][a-zA-Z0-9 _-]*)\s*$").unwrap());
static CONDITION_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{2,}\s*definition\s+when\s+`([^`]+)`\s*$").unwrap());
static SUBSECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{2,}\s*([a-zA-Z][a-zA-Z0-9 _-]*)\s*$").unwrap());
static ARG_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\s*-?\s*`args\.([a-zA-Z][a-zA-Z0-9_-]*)`:\s*([a-zA-Z]+)(?:="([^"]*)")?\s*;\s*(.*)$"#,
    )
    .unwrap()
});
static FLAG_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*-?\s*`flags\.([a-zA-Z][a-zA-Z0-9_-]*)`:\s*(.*)$").unwrap());
static AXIS_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*-?\s*`([a-zA-Z][a-zA-Z0-9_-]*)`\s*=\s*`\{([^}]+)\}`\s*$").unwrap()
});
static ENV_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*-?\s*`([A-Z_][A-Z0-9_]*)`\s*=\s*`([^`]*)`\s*$").unwrap());
static VAR_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*-?\s*`([A-Z_][A-Z0-9_]*)`:\s*(.*)$").unwrap());
static PASSTHROUGH_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*-?\s*`([A-Z_][A-Z0-9_]*)`\s*$").unwrap());
static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^```([a-zA-Z0-9_-]*)\s*$").unwrap());

/// One `# …` section with its body lines and their 1-based numbers.
struct Section<'a> {
    title: &'a str,
    line: usize,
    body: Vec<(usize, &'a str)>,
}

fn split_sections<'a>(content: &'a str) -> Vec<Section<'a>> {
    let mut sections: Vec<Section<'a>> = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let number = index + 1;
        if let Some(caps) = SECTION_HEADER_RE.captures(raw) {
            sections.push(Section {
                title: caps.get(1).unwrap().as_str().trim_end(),
                line: number,
                body: Vec::new(),
            });
            continue;
        }
        if ACTION_HEADER_RE.is_match(raw) {
            // `action: x` headers contain a colon, which the generic section
            // regex rejects; keep the raw title.
            sections.push(Section {
                title: raw.trim_start_matches('#').trim(),
                line: number,
                body: Vec::new(),
            });
            continue;
        }
        if let Some(section) = sections.last_mut() {
            section.body.push((number, raw));
        }
    }
    sections
}

fn parse_file(document: &mut Document, path: &Path, content: &str) -> Result<()> {
    for section in split_sections(content) {
        let title_lower = section.title.to_ascii_lowercase();
        let location = SourceLocation {
            file: path.display().to_string(),
            line: section.line,
            section: section.title.to_string(),
        };

        if let Some(name) = section.title.strip_prefix("action:").map(str::trim) {
            let action = parse_action(name, &section, path)?;
            if let Some(existing) = document.actions.get(name) {
                bail!(
                    "duplicate action '{name}':\n  first: {}\n  second: {}",
                    existing.location,
                    action.location
                );
            }
            document.actions.insert(name.to_string(), action);
        } else if title_lower == "arguments" {
            parse_arguments(document, &section, &location)?;
        } else if title_lower == "flags" {
            parse_flags(document, &section, &location)?;
        } else if title_lower == "axis" {
            parse_axes(document, &section, &location)?;
        } else if title_lower == "environment" {
            parse_environment(document, &section)?;
        }
        // Unknown sections are prose; skip them.
    }
    Ok(())
}

fn parse_arguments(
    document: &mut Document,
    section: &Section<'_>,
    location: &SourceLocation,
) -> Result<()> {
    for (line, raw) in &section.body {
        let Some(caps) = ARG_ITEM_RE.captures(raw) else {
            continue;
        };
        let name = caps[1].to_string();
        let arg_type = ReturnType::parse(&caps[2])
            .with_context(|| format!("{}:{line}: argument 'args.{name}'", location.file))?;
        document.arguments.insert(
            name.clone(),
            ArgumentDefinition {
                name,
                arg_type,
                default_value: caps.get(3).map(|m| m.as_str().to_string()),
                description: caps[4].trim().to_string(),
                location: SourceLocation {
                    file: location.file.clone(),
                    line: *line,
                    section: location.section.clone(),
                },
            },
        );
    }
    Ok(())
}

fn parse_flags(
    document: &mut Document,
    section: &Section<'_>,
    location: &SourceLocation,
) -> Result<()> {
    for (line, raw) in &section.body {
        let Some(caps) = FLAG_ITEM_RE.captures(raw) else {
            continue;
        };
        let name = caps[1].to_string();
        document.flags.insert(
            name.clone(),
            FlagDefinition {
                name,
                description: caps[2].trim().to_string(),
                location: SourceLocation {
                    file: location.file.clone(),
                    line: *line,
                    section: location.section.clone(),
                },
            },
        );
    }
    Ok(())
}

fn parse_axes(
    document: &mut Document,
    section: &Section<'_>,
    location: &SourceLocation,
) -> Result<()> {
    for (line, raw) in &section.body {
        let Some(caps) = AXIS_ITEM_RE.captures(raw) else {
            continue;
        };
        let name = caps[1].to_string();
        let values: Vec<AxisValue> = caps[2]
            .split('|')
            .map(|value| {
                let trimmed = value.trim();
                match trimmed.strip_suffix('*') {
                    Some(v) => AxisValue {
                        value: v.to_string(),
                        is_default: true,
                    },
                    None => AxisValue {
                        value: trimmed.to_string(),
                        is_default: false,
                    },
                }
            })
            .collect();

        let defaults = values.iter().filter(|v| v.is_default).count();
        if defaults > 1 {
            bail!(
                "{}:{line}: axis '{name}' has {defaults} default values, but must have zero or one",
                location.file
            );
        }

        document.axes.insert(
            name.clone(),
            AxisDefinition {
                name,
                values,
                location: SourceLocation {
                    file: location.file.clone(),
                    line: *line,
                    section: location.section.clone(),
                },
            },
        );
    }
    Ok(())
}

fn parse_environment(document: &mut Document, section: &Section<'_>) -> Result<()> {
    let mut in_passthrough = false;
    for (_, raw) in &section.body {
        if let Some(caps) = SUBSECTION_RE.captures(raw) {
            in_passthrough = caps[1].trim().eq_ignore_ascii_case("passthrough");
            continue;
        }
        if in_passthrough {
            if let Some(caps) = PASSTHROUGH_ITEM_RE.captures(raw) {
                let name = caps[1].to_string();
                if !document.passthrough_env_vars.contains(&name) {
                    document.passthrough_env_vars.push(name);
                }
            }
        } else if let Some(caps) = ENV_ITEM_RE.captures(raw) {
            document
                .environment_vars
                .insert(caps[1].to_string(), caps[2].to_string());
        }
    }
    Ok(())
}

fn parse_action(name: &str, section: &Section<'_>, path: &Path) -> Result<ActionDefinition> {
    let location = SourceLocation {
        file: path.display().to_string(),
        line: section.line,
        section: format!("action: {name}"),
    };

    let mut versions: Vec<ActionVersion> = Vec::new();
    let mut description_lines: Vec<&str> = Vec::new();
    let mut required_env_vars: BTreeMap<String, String> = BTreeMap::new();

    let mut conditions: Vec<Condition> = Vec::new();
    let mut in_vars = false;
    let mut fence: Option<(Language, usize, Vec<&str>)> = None;
    let mut seen_block = false;

    for (line, raw) in &section.body {
        if let Some((language, start, lines)) = &mut fence {
            if raw.trim() == "```" {
                let script = lines.join("\n");
                versions.push(build_version(
                    &script,
                    *language,
                    conditions.clone(),
                    &location,
                    *start,
                )?);
                fence = None;
            } else {
                lines.push(*raw);
            }
            continue;
        }

        if let Some(caps) = FENCE_RE.captures(raw) {
            match Language::parse(&caps[1]) {
                Some(language) => {
                    fence = Some((language, *line, Vec::new()));
                    seen_block = true;
                    in_vars = false;
                }
                // Other fences (sample output etc.) are prose.
                None => seen_block = true,
            }
            continue;
        }

        if let Some(caps) = CONDITION_HEADER_RE.captures(raw) {
            conditions = parse_conditions(&caps[1])
                .with_context(|| format!("{}:{line}", location.file))?;
            in_vars = false;
            seen_block = true;
            continue;
        }

        if let Some(caps) = SUBSECTION_RE.captures(raw) {
            in_vars = caps[1].trim().eq_ignore_ascii_case("vars");
            conditions.clear();
            seen_block = true;
            continue;
        }

        if in_vars {
            if let Some(caps) = VAR_ITEM_RE.captures(raw) {
                required_env_vars.insert(caps[1].to_string(), caps[2].trim().to_string());
            }
            continue;
        }

        if !seen_block && !raw.trim().is_empty() {
            description_lines.push(raw.trim());
        }
    }

    if fence.is_some() {
        bail!("{location}: unterminated code block in action '{name}'");
    }
    if versions.is_empty() {
        bail!("{location}: action '{name}' has no bash or python code block");
    }

    Ok(ActionDefinition {
        name: name.to_string(),
        versions,
        required_env_vars,
        description: description_lines.join("\n"),
        location,
    })
}

fn build_version(
    script: &str,
    language: Language,
    conditions: Vec<Condition>,
    location: &SourceLocation,
    line: usize,
) -> Result<ActionVersion> {
    let expansions = scan_expansions(script);
    let (dependencies, env_dependencies) = scan_dependencies(script);
    let returns: Vec<ReturnDeclaration> = scan_returns(script, language)
        .with_context(|| format!("{}:{line}", location.file))?;

    Ok(ActionVersion {
        script: script.to_string(),
        language,
        conditions,
        expansions,
        returns,
        dependencies,
        env_dependencies,
        location: SourceLocation {
            file: location.file.clone(),
            line,
            section: location.section.clone(),
        },
    })
}

/// Parse a comma-separated condition list: `axis: value` pairs with
/// `sys.platform: <value>` as the platform predicate.
fn parse_conditions(conditions_str: &str) -> Result<Vec<Condition>> {
    let mut conditions = Vec::new();
    for part in conditions_str.split(',') {
        let part = part.trim();
        let Some((name, value)) = part.split_once(':') else {
            bail!("invalid condition '{part}' (expected 'name: value')");
        };
        let name = name.trim();
        let value = value.trim();
        if name == "sys.platform" {
            conditions.push(Condition::Platform(Platform::parse(value)?));
        } else {
            conditions.push(Condition::Axis {
                axis: name.to_string(),
                value: value.to_string(),
            });
        }
    }
    Ok(conditions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::DependencyKind;

    fn parse_one(content: &str) -> Result<Document> {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("defs.md");
        fs::write(&path, content).expect("write");
        parse_files(&[path])
    }

    #[test]
    fn parses_simple_action_with_description() {
        let document = parse_one(
            "# action: build\n\nCompiles the project.\n\n```bash\nret ok:int=1\n```\n",
        )
        .expect("parse");
        let action = &document.actions["build"];
        assert_eq!(action.description, "Compiles the project.");
        assert_eq!(action.versions.len(), 1);
        assert_eq!(action.versions[0].language, Language::Bash);
        assert_eq!(action.versions[0].returns.len(), 1);
    }

    #[test]
    fn parses_conditional_versions() {
        let document = parse_one(
            "# action: build\n\
             \n\
             ## definition when `build-mode: release`\n\
             ```bash\nret mode:string=release\n```\n\
             \n\
             ## definition when `build-mode: development, sys.platform: linux`\n\
             ```bash\nret mode:string=development\n```\n",
        )
        .expect("parse");
        let action = &document.actions["build"];
        assert_eq!(action.versions.len(), 2);
        assert_eq!(action.versions[0].conditions.len(), 1);
        assert_eq!(action.versions[1].conditions.len(), 2);
        assert!(matches!(
            action.versions[1].conditions[1],
            Condition::Platform(Platform::Linux)
        ));
    }

    #[test]
    fn parses_python_action_with_vars() {
        let document = parse_one(
            "# action: deploy\n\
             \n\
             ## vars\n\
             - `DEPLOY_TOKEN`: auth token for the registry\n\
             \n\
             ```python\nmdl.ret(\"ok\", True, \"bool\")\n```\n",
        )
        .expect("parse");
        let action = &document.actions["deploy"];
        assert_eq!(action.versions[0].language, Language::Python);
        assert_eq!(
            action.required_env_vars.get("DEPLOY_TOKEN").map(String::as_str),
            Some("auth token for the registry")
        );
    }

    #[test]
    fn parses_arguments_flags_axes() {
        let document = parse_one(
            "# arguments\n\
             - `args.target`: string=\"all\"; what to build\n\
             - `args.jobs`: int; parallelism (mandatory)\n\
             \n\
             # flags\n\
             - `flags.fast`: skip checks\n\
             \n\
             # axis\n\
             - `build-mode`=`{development*|release}`\n\
             \n\
             # action: a\n```bash\nret x:int=1\n```\n",
        )
        .expect("parse");

        let target = &document.arguments["target"];
        assert_eq!(target.default_value.as_deref(), Some("all"));
        assert!(!target.is_mandatory());
        let jobs = &document.arguments["jobs"];
        assert!(jobs.is_mandatory());
        assert_eq!(jobs.arg_type, ReturnType::Int);

        assert!(document.flags.contains_key("fast"));

        let axis = &document.axes["build-mode"];
        assert_eq!(axis.default_value(), Some("development"));
        assert_eq!(axis.values.len(), 2);
    }

    #[test]
    fn parses_environment_and_passthrough() {
        let document = parse_one(
            "# environment\n\
             - `APP_ENV`=`ci`\n\
             \n\
             ## passthrough\n\
             - `HOME`\n\
             - `PATH`\n\
             \n\
             # action: a\n```bash\nret x:int=1\n```\n",
        )
        .expect("parse");
        assert_eq!(document.environment_vars.get("APP_ENV").map(String::as_str), Some("ci"));
        assert_eq!(document.passthrough_env_vars, vec!["HOME", "PATH"]);
    }

    #[test]
    fn action_scripts_carry_dependency_declarations() {
        let document = parse_one(
            "# action: a\n```bash\nret x:int=1\n```\n\
             \n\
             # action: b\n```bash\ndep action.a\nweak action.c\nret y:int=1\n```\n\
             \n\
             # action: c\n```bash\nret z:int=1\n```\n",
        )
        .expect("parse");
        let b = &document.actions["b"];
        let kinds: Vec<DependencyKind> =
            b.versions[0].dependencies.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![DependencyKind::Strong, DependencyKind::Weak]);
    }

    #[test]
    fn duplicate_action_across_files_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let one = temp.path().join("one.md");
        let two = temp.path().join("two.md");
        fs::write(&one, "# action: a\n```bash\nret x:int=1\n```\n").expect("write");
        fs::write(&two, "# action: a\n```bash\nret x:int=2\n```\n").expect("write");
        let err = parse_files(&[one, two]).expect_err("duplicate");
        assert!(err.root_cause().to_string().contains("duplicate action 'a'"));
    }

    #[test]
    fn action_without_code_block_fails() {
        let err = parse_one("# action: a\n\nJust prose.\n").expect_err("no block");
        assert!(err.root_cause().to_string().contains("no bash or python code block"));
    }

    #[test]
    fn multiple_axis_defaults_fail() {
        let err = parse_one(
            "# axis\n- `m`=`{a*|b*}`\n\n# action: a\n```bash\nret x:int=1\n```\n",
        )
        .expect_err("two defaults");
        assert!(err.root_cause().to_string().contains("default values"));
    }

    #[test]
    fn unterminated_fence_fails() {
        let err = parse_one("# action: a\n```bash\nret x:int=1\n").expect_err("unterminated");
        assert!(err.root_cause().to_string().contains("unterminated code block"));
    }

    #[test]
    fn non_script_fences_are_prose() {
        let document = parse_one(
            "# action: a\n\
             ```text\nsample output\n```\n\
             ```bash\nret x:int=1\n```\n",
        )
        .expect("parse");
        assert_eq!(document.actions["a"].versions.len(), 1);
    }

    #[test]
    fn discovery_walks_wildcard_patterns() {
        let temp = tempfile::tempdir().expect("tempdir");
        let defs = temp.path().join(".mdl/defs/nested");
        fs::create_dir_all(&defs).expect("mkdir");
        fs::write(defs.join("b.md"), "x").expect("write");
        fs::write(temp.path().join(".mdl/defs/a.md"), "x").expect("write");
        fs::write(defs.join("ignored.txt"), "x").expect("write");

        let files =
            discover_definition_files(temp.path(), DEFAULT_DEFS_PATTERN).expect("discover");
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with(".mdl/defs/a.md"));
        assert!(files[1].ends_with(".mdl/defs/nested/b.md"));
    }

    #[test]
    fn discovery_accepts_a_direct_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("defs.md"), "x").expect("write");
        let files = discover_definition_files(temp.path(), "defs.md").expect("discover");
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn discovery_with_no_matches_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = discover_definition_files(temp.path(), DEFAULT_DEFS_PATTERN)
            .expect_err("no files");
        assert!(err.to_string().contains("no markdown files found"));
    }
}
