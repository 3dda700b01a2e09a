//! CLI front-end: token grammar, option parsing, and the end-to-end driver.
//!
//! Grammar: `mdl [<global-opt|axis|arg|flag>]* (:goal [<local-...>]*)*`.
//! Tokens before the first `:goal` bind globally; later tokens bind to the
//! preceding goal. `--<name>=<value>` sets a document argument, `--<name>` a
//! document flag, and `--axis name:value` (aliases `-a`, `-u`, `--use`) an
//! axis binding; axis values may be wildcard patterns.

use std::collections::{BTreeMap, BTreeSet};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::core::compile::Compiler;
use crate::core::graph::NodeKey;
use crate::core::invocation::{resolve_invocations, CliInputs, RawInvocation};
use crate::core::model::{ActionDefinition, Document};
use crate::core::plan::{build_plan, prune, render_plan, ExecutionPlan};
use crate::core::script::{DependencyKind, Expansion};
use crate::core::types::Platform;
use crate::core::validate::{render_batch, validate};
use crate::exec::engine::{Engine, EngineConfig, RunStatus};
use crate::exec::logger::{ExecLogger, GithubLogger, LiveTableLogger, SimpleLogger, Style};
use crate::exec::wrapper::{CommandWrapper, DirectWrapper, HermeticWrapper};
use crate::exit_codes;
use crate::io::document::{discover_definition_files, parse_files, DEFAULT_DEFS_PATTERN};
use crate::io::run_store::RunStore;

/// Options recognized by the CLI itself (everything else is goals, axes, and
/// document-defined arguments and flags).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalOptions {
    pub defs: String,
    pub list_actions: bool,
    pub dry_run: bool,
    pub continue_run: bool,
    pub keep_run_dir: bool,
    pub without_nix: bool,
    pub verbose: bool,
    pub github_actions: bool,
    pub simple_log: bool,
    pub no_color: bool,
    pub seq: bool,
    pub out: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    pub autocomplete: Option<String>,
    pub autocomplete_axis: Option<String>,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            defs: DEFAULT_DEFS_PATTERN.to_string(),
            list_actions: false,
            dry_run: false,
            continue_run: false,
            keep_run_dir: false,
            without_nix: false,
            verbose: false,
            github_actions: false,
            simple_log: false,
            no_color: false,
            seq: false,
            out: None,
            timeout_ms: None,
            autocomplete: None,
            autocomplete_axis: None,
        }
    }
}

const AXIS_ALIASES: &[&str] = &["--axis", "--use", "-a", "-u"];

/// Parse command-line tokens into recognized options plus custom inputs.
pub fn parse_args(tokens: &[String]) -> Result<(GlobalOptions, CliInputs)> {
    let mut options = GlobalOptions::default();
    let mut inputs = CliInputs::default();
    let mut current: Option<RawInvocation> = None;

    let mut index = 0;
    while index < tokens.len() {
        let token = tokens[index].as_str();

        if let Some(goal) = token.strip_prefix(':') {
            let goal = goal.trim();
            if goal.is_empty() {
                bail!("goal name cannot be empty");
            }
            if let Some(done) = current.take() {
                inputs.invocations.push(done);
            }
            current = Some(RawInvocation {
                action: goal.to_string(),
                ..Default::default()
            });
        } else if let Some(value) = token.strip_prefix("--defs=") {
            options.defs = value.to_string();
        } else if token == "--list-actions" {
            options.list_actions = true;
        } else if token == "--dry-run" {
            options.dry_run = true;
        } else if token == "--continue" {
            options.continue_run = true;
        } else if token == "--keep-run-dir" {
            options.keep_run_dir = true;
        } else if token == "--without-nix" {
            options.without_nix = true;
        } else if token == "--verbose" {
            options.verbose = true;
        } else if token == "--github-actions" {
            options.github_actions = true;
        } else if token == "--simple-log" {
            options.simple_log = true;
        } else if token == "--no-color" {
            options.no_color = true;
        } else if token == "--seq" {
            options.seq = true;
        } else if let Some(value) = token.strip_prefix("--out=") {
            options.out = Some(PathBuf::from(value));
        } else if let Some(value) = token.strip_prefix("--timeout-ms=") {
            options.timeout_ms = Some(
                value
                    .parse()
                    .with_context(|| format!("invalid --timeout-ms value '{value}'"))?,
            );
        } else if let Some(value) = token.strip_prefix("--autocomplete-axis=") {
            options.autocomplete_axis = Some(value.to_string());
        } else if token == "--autocomplete" {
            let mode = tokens
                .get(index + 1)
                .filter(|t| !t.starts_with('-') && !t.starts_with(':'))
                .cloned();
            if mode.is_some() {
                index += 1;
            }
            options.autocomplete = Some(mode.unwrap_or_else(|| "actions".to_string()));
        } else if AXIS_ALIASES.contains(&token)
            || AXIS_ALIASES.iter().any(|a| {
                token.starts_with(a) && token.as_bytes().get(a.len()) == Some(&b'=')
            })
        {
            let assignment = if AXIS_ALIASES.contains(&token) {
                index += 1;
                tokens
                    .get(index)
                    .ok_or_else(|| anyhow::anyhow!("expected name:value after {token}"))?
                    .clone()
            } else {
                match token.split_once('=') {
                    Some((_, value)) => value.to_string(),
                    None => bail!("malformed axis option '{token}'"),
                }
            };
            let (name, value) = split_axis_binding(&assignment)?;
            match &mut current {
                Some(invocation) => invocation.axes.insert(name, value),
                None => inputs.global_axes.insert(name, value),
            };
        } else if let Some(stripped) = token.strip_prefix("--") {
            if stripped.is_empty() {
                bail!("malformed option '{token}'");
            }
            match stripped.split_once('=') {
                Some((name, value)) => {
                    if name.is_empty() {
                        bail!("malformed argument '{token}'");
                    }
                    match &mut current {
                        Some(invocation) => {
                            invocation.args.insert(name.to_string(), value.to_string())
                        }
                        None => inputs
                            .global_args
                            .insert(name.to_string(), value.to_string()),
                    };
                }
                None => {
                    match &mut current {
                        Some(invocation) => invocation.flags.insert(stripped.to_string(), true),
                        None => inputs.global_flags.insert(stripped.to_string(), true),
                    };
                }
            }
        } else {
            bail!("unexpected token '{token}' (goals start with ':', as in ':{token}')");
        }

        index += 1;
    }

    if let Some(done) = current.take() {
        inputs.invocations.push(done);
    }
    Ok((options, inputs))
}

/// Split an axis binding: `name:value` with `=` also accepted.
fn split_axis_binding(assignment: &str) -> Result<(String, String)> {
    let separator = assignment
        .find(':')
        .into_iter()
        .chain(assignment.find('='))
        .min();
    let Some(position) = separator else {
        bail!("axis binding '{assignment}' is invalid (expected name:value)");
    };
    let (name, value) = assignment.split_at(position);
    let value = &value[1..];
    if name.trim().is_empty() || value.trim().is_empty() {
        bail!("axis binding '{assignment}' is invalid (expected name:value)");
    }
    Ok((name.trim().to_string(), value.trim().to_string()))
}

/// Locate the project root: the closest ancestor containing `.mdl`, falling
/// back to the current directory.
pub fn find_project_root() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut dir = cwd.clone();
    loop {
        if dir.join(".mdl").is_dir() {
            return dir;
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => return cwd,
        }
    }
}

/// Run the CLI against a project root. Returns the process exit code.
pub fn run_with_args(project_root: &Path, tokens: &[String]) -> i32 {
    match run_inner(project_root, tokens) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::INVALID
        }
    }
}

fn run_inner(project_root: &Path, tokens: &[String]) -> Result<i32> {
    let (options, inputs) = parse_args(tokens)?;

    if let Some(mode) = &options.autocomplete {
        return handle_autocomplete(project_root, &options, mode);
    }

    let files = discover_definition_files(project_root, &options.defs)?;
    let document = parse_files(&files)?;
    debug!(
        files = files.len(),
        actions = document.actions.len(),
        "loaded definitions"
    );

    let style = Style::new(!options.no_color && std::io::stdout().is_terminal());

    if options.list_actions {
        list_actions(&document, &style);
        return Ok(exit_codes::OK);
    }

    if inputs.invocations.is_empty() {
        bail!("no goals specified (use `:action-name`, see --list-actions)");
    }

    let invocations = resolve_invocations(&document, &inputs)?;
    let platform = Platform::current();
    let compiled = Compiler::new(&document, platform).compile(&invocations)?;
    let pruned = prune(&compiled.graph);

    let mut available_env: BTreeSet<String> = std::env::vars().map(|(k, _)| k).collect();
    available_env.extend(document.environment_vars.keys().cloned());
    let issues = validate(&document, &compiled, &pruned, &available_env);
    if !issues.is_empty() {
        eprintln!("{}", render_batch(&issues));
        return Ok(exit_codes::INVALID);
    }

    let plan = build_plan(&compiled.graph, &pruned)?;

    print_goals(&compiled.graph.goals, &style);
    println!(
        "{}",
        style.dim(&format!("plan: {} action(s)", plan.order.len()))
    );
    for line in render_plan(&compiled.graph, &plan) {
        println!("{line}");
    }

    if options.dry_run {
        println!("{}", style.dim("dry run - not executing"));
        return Ok(exit_codes::OK);
    }

    // The previous run must be resolved before the engine creates this run's
    // directory, or "latest" would find the new empty one.
    let previous_run_dir = if options.continue_run {
        let previous = RunStore::latest_run_dir(project_root);
        if previous.is_none() {
            println!(
                "{}",
                style.yellow("no previous runs found, starting fresh")
            );
        }
        previous
    } else {
        None
    };

    let workers = if options.seq {
        1
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(32)
    };

    let logger = build_logger(&options, &style, &plan);
    let wrapper: Arc<dyn CommandWrapper> = if options.without_nix {
        Arc::new(DirectWrapper)
    } else {
        Arc::new(HermeticWrapper)
    };

    let engine = Engine::new(
        &document,
        compiled.graph.clone(),
        plan,
        EngineConfig {
            project_root: project_root.to_path_buf(),
            previous_run_dir,
            keep_run_dir: options.keep_run_dir,
            workers,
            echo_streams: options.verbose || options.github_actions,
            timeout: options.timeout_ms.map(Duration::from_millis),
            platform,
        },
        wrapper,
        Arc::clone(&logger),
    );

    let result = engine.run()?;

    if !result.restored.is_empty() {
        let restored: Vec<String> = result.restored.iter().map(|k| k.label()).collect();
        logger.summary(&format!(
            "restored from previous run: {}",
            restored.join(", ")
        ));
    }

    match result.status {
        RunStatus::Success => {
            let outputs = goal_outputs(&compiled.graph.goals, &result.results);
            let payload =
                serde_json::to_string_pretty(&outputs).context("serialize output JSON")?;
            logger.summary(&format!("{}", style.green("execution completed successfully")));
            println!("{payload}");
            if let Some(out_path) = &options.out {
                std::fs::write(out_path, format!("{payload}\n"))
                    .with_context(|| format!("write {}", out_path.display()))?;
            }
            if options.keep_run_dir && !result.run_dir_removed {
                logger.summary(
                    &style.dim(&format!("run directory: {}", result.run_dir.display())),
                );
            }
            Ok(exit_codes::OK)
        }
        RunStatus::Failed => {
            print_failures(&result.results, &style);
            logger.summary(&format!(
                "{} {}",
                style.red("execution failed, run directory:"),
                result.run_dir.display()
            ));
            Ok(exit_codes::ACTION_FAILED)
        }
        RunStatus::Cancelled => {
            logger.summary(&style.yellow("execution cancelled"));
            Ok(exit_codes::CANCELLED)
        }
    }
}

fn build_logger(
    options: &GlobalOptions,
    style: &Style,
    plan: &ExecutionPlan,
) -> Arc<dyn ExecLogger> {
    if options.github_actions {
        Arc::new(GithubLogger)
    } else if options.simple_log || options.verbose || !std::io::stdout().is_terminal() {
        Arc::new(SimpleLogger::new(*style))
    } else {
        Arc::new(LiveTableLogger::new(*style, &plan.order))
    }
}

fn print_goals(goals: &BTreeSet<NodeKey>, style: &Style) {
    let labels: Vec<String> = goals.iter().map(|g| style.cyan(&g.label())).collect();
    println!("{} {}", style.dim("goals:"), labels.join(", "));
}

fn goal_outputs(
    goals: &BTreeSet<NodeKey>,
    results: &BTreeMap<NodeKey, crate::exec::engine::NodeResult>,
) -> BTreeMap<String, BTreeMap<String, crate::core::types::TypedValue>> {
    goals
        .iter()
        .filter_map(|goal| {
            results
                .get(goal)
                .map(|result| (goal.label(), result.outputs.clone()))
        })
        .collect()
}

fn print_failures(
    results: &BTreeMap<NodeKey, crate::exec::engine::NodeResult>,
    style: &Style,
) {
    for result in results.values().filter(|r| !r.success) {
        println!(
            "{} {}",
            style.red("action failed:"),
            style.cyan(&result.key.label())
        );
        if let Some(message) = &result.error_message {
            println!("  {}", style.red(message));
        }
        for stream in ["stdout.log", "stderr.log"] {
            let path = result.node_dir.join(stream);
            println!("  {} {}", style.dim(stream), path.display());
            if let Ok(contents) = std::fs::read_to_string(&path) {
                for line in contents.lines() {
                    println!("    {line}");
                }
            }
        }
    }
}

fn handle_autocomplete(
    project_root: &Path,
    options: &GlobalOptions,
    mode: &str,
) -> Result<i32> {
    let Ok(files) = discover_definition_files(project_root, &options.defs) else {
        return Ok(exit_codes::INVALID);
    };
    let Ok(document) = parse_files(&files) else {
        return Ok(exit_codes::INVALID);
    };

    let suggestions: Vec<String> = match mode {
        "actions" => ordered_action_names(&document),
        "flags" => {
            let mut flags: BTreeSet<String> = [
                "--defs", "--list-actions", "--dry-run", "--continue", "--keep-run-dir",
                "--without-nix", "--verbose", "--github-actions", "--simple-log", "--no-color",
                "--seq", "--out", "--timeout-ms", "--axis", "--use",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect();
            flags.extend(document.flags.keys().map(|name| format!("--{name}")));
            flags.into_iter().collect()
        }
        "axis-names" => document.axes.keys().cloned().collect(),
        "axis-values" => {
            let Some(axis_name) = &options.autocomplete_axis else {
                return Ok(exit_codes::INVALID);
            };
            let Some(axis) = document.axes.get(axis_name) else {
                return Ok(exit_codes::INVALID);
            };
            axis.values.iter().map(|v| v.value.clone()).collect()
        }
        _ => return Ok(exit_codes::INVALID),
    };

    for suggestion in suggestions {
        println!("{suggestion}");
    }
    Ok(exit_codes::OK)
}

/// Action names with root actions (no dependencies) first, then the rest,
/// each group sorted.
fn ordered_action_names(document: &Document) -> Vec<String> {
    let mut roots: Vec<String> = Vec::new();
    let mut others: Vec<String> = Vec::new();
    for (name, action) in &document.actions {
        if action.potential_dependencies().is_empty() {
            roots.push(name.clone());
        } else {
            others.push(name.clone());
        }
    }
    roots.into_iter().chain(others).collect()
}

fn list_actions(document: &Document, style: &Style) {
    if !document.axes.is_empty() {
        println!("{}", style.dim("available axes:"));
        for (name, axis) in &document.axes {
            let values: Vec<String> = axis
                .values
                .iter()
                .map(|v| {
                    if v.is_default {
                        format!("{}*", v.value)
                    } else {
                        v.value.clone()
                    }
                })
                .collect();
            println!("  {}: {}", style.cyan(name), values.join(", "));
        }
        println!();
    }

    println!("{}", style.dim("available actions:"));
    for name in ordered_action_names(document) {
        let action = &document.actions[&name];
        println!("{}", style.cyan(&name));
        for line in action.description.lines().filter(|l| !l.trim().is_empty()) {
            println!("  {}", style.dim(line.trim()));
        }
        print_action_details(action, style);
        println!();
    }
}

fn print_action_details(action: &ActionDefinition, style: &Style) {
    let mut deps: BTreeMap<String, DependencyKind> = BTreeMap::new();
    let mut args_used: BTreeSet<String> = BTreeSet::new();
    let mut flags_used: BTreeSet<String> = BTreeSet::new();
    let mut env_used: BTreeSet<String> = action.required_env_vars.keys().cloned().collect();

    for version in &action.versions {
        for expansion in &version.expansions {
            match expansion {
                Expansion::Action { action: dep, .. } => {
                    deps.entry(dep.clone()).or_insert(DependencyKind::Strong);
                }
                Expansion::WeakAction { action: dep, .. } => {
                    deps.entry(dep.clone()).or_insert(DependencyKind::Weak);
                }
                Expansion::Args { name, .. } => {
                    args_used.insert(name.clone());
                }
                Expansion::Flags { name, .. } => {
                    flags_used.insert(name.clone());
                }
                Expansion::Env { name, .. } => {
                    env_used.insert(name.clone());
                }
                _ => {}
            }
        }
        for decl in &version.dependencies {
            deps.insert(decl.action.clone(), decl.kind);
        }
        env_used.extend(version.env_dependencies.iter().cloned());
    }

    if !deps.is_empty() {
        let rendered: Vec<String> = deps
            .iter()
            .map(|(name, kind)| match kind {
                DependencyKind::Strong => name.clone(),
                DependencyKind::Weak => format!("~{name}"),
                DependencyKind::Soft => format!("?{name}"),
            })
            .collect();
        println!("  {} {}", style.dim("dependencies:"), rendered.join(", "));
    }
    if !args_used.is_empty() {
        let list: Vec<&str> = args_used.iter().map(String::as_str).collect();
        println!("  {} {}", style.dim("arguments:"), list.join(", "));
    }
    if !flags_used.is_empty() {
        let list: Vec<&str> = flags_used.iter().map(String::as_str).collect();
        println!("  {} {}", style.dim("flags:"), list.join(", "));
    }
    if !env_used.is_empty() {
        let list: Vec<&str> = env_used.iter().map(String::as_str).collect();
        println!("  {} {}", style.dim("env vars:"), list.join(", "));
    }

    let mut returns: BTreeMap<&str, &crate::core::model::ReturnDeclaration> = BTreeMap::new();
    for version in &action.versions {
        for declaration in &version.returns {
            returns.insert(declaration.name.as_str(), declaration);
        }
    }
    if !returns.is_empty() {
        let rendered: Vec<String> = returns
            .values()
            .map(|d| format!("{}:{}", d.name, d.return_type))
            .collect();
        println!("  {} {}", style.dim("returns:"), rendered.join(", "));
    }

    if action.versions.len() > 1 {
        let rendered: Vec<String> = action
            .versions
            .iter()
            .enumerate()
            .map(|(index, version)| {
                if version.conditions.is_empty() {
                    format!("{}", index + 1)
                } else {
                    let conds: Vec<String> =
                        version.conditions.iter().map(|c| c.to_string()).collect();
                    format!("{} ({})", index + 1, conds.join(", "))
                }
            })
            .collect();
        println!("  {} {}", style.dim("versions:"), rendered.join(", "));
    }
}
