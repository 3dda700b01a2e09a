//! Parallel scheduler and executor.
//!
//! Single-process, thread-based: a bounded worker pool runs one child process
//! per node, and every state transition is serialized through a completion
//! channel back into the scheduler thread, which owns all graph state. The
//! retainer coordinator lives in that same thread: promotion of soft targets
//! happens while processing the retainer's completion, strictly before any
//! consumer of the edge can be dispatched.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Local;
use tracing::{debug, warn};

use crate::core::graph::{ActionGraph, NodeKey, SoftEdge};
use crate::core::model::{ActionVersion, Document};
use crate::core::plan::ExecutionPlan;
use crate::core::script::DependencyKind;
use crate::core::types::{Language, Platform, TypedValue};
use crate::exec::logger::{ExecLogger, NodeOutcome};
use crate::exec::wrapper::{interpreter_command, CommandWrapper};
use crate::io::process::run_supervised;
use crate::io::run_store::{
    can_restore, read_meta, read_outputs, restore_node_dir, write_meta, NodeMeta, RunStore,
};
use crate::io::script_render::{render_bash, render_python, write_runtime, RenderBindings};

/// Engine configuration for one run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub project_root: PathBuf,
    pub previous_run_dir: Option<PathBuf>,
    pub keep_run_dir: bool,
    /// Worker pool size; already clamped to `min(cpu_count, 32)` (1 for `--seq`).
    pub workers: usize,
    /// Mirror child output to the console (verbose / CI modes).
    pub echo_streams: bool,
    /// Global wall-clock budget for the whole run.
    pub timeout: Option<Duration>,
    pub platform: Platform,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failed,
    Cancelled,
}

/// Result of one node.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub key: NodeKey,
    pub success: bool,
    pub restored: bool,
    /// The node hit the (global) wall-clock deadline; the run is cancelled,
    /// not failed.
    pub timed_out: bool,
    pub outputs: BTreeMap<String, TypedValue>,
    pub exit_code: i32,
    pub duration_seconds: f64,
    pub error_message: Option<String>,
    pub node_dir: PathBuf,
}

/// Result of a whole run.
#[derive(Debug)]
pub struct EngineResult {
    pub status: RunStatus,
    pub results: BTreeMap<NodeKey, NodeResult>,
    pub restored: Vec<NodeKey>,
    pub run_id: String,
    pub run_dir: PathBuf,
    pub run_dir_removed: bool,
}

/// Everything a worker needs to run one node; assembled in the scheduler
/// thread at dispatch time so output snapshots and retained flags are fixed
/// at the moment the semantics require.
struct JobSpec {
    key: NodeKey,
    version: ActionVersion,
    bindings: RenderBindings,
    keep_vars: BTreeSet<String>,
    node_dir: PathBuf,
}

pub struct Engine {
    graph: ActionGraph,
    plan: ExecutionPlan,
    config: EngineConfig,
    environment_vars: BTreeMap<String, String>,
    passthrough_env_vars: Vec<String>,
    /// Declared `## vars` per action name, for the hermetic allow-list.
    required_env_by_action: BTreeMap<String, Vec<String>>,
    wrapper: Arc<dyn CommandWrapper>,
    logger: Arc<dyn ExecLogger>,
}

impl Engine {
    pub fn new(
        document: &Document,
        graph: ActionGraph,
        plan: ExecutionPlan,
        config: EngineConfig,
        wrapper: Arc<dyn CommandWrapper>,
        logger: Arc<dyn ExecLogger>,
    ) -> Self {
        let required_env_by_action = document
            .actions
            .iter()
            .map(|(name, action)| {
                (
                    name.clone(),
                    action.required_env_vars.keys().cloned().collect(),
                )
            })
            .collect();
        Self {
            graph,
            plan,
            config,
            environment_vars: document.environment_vars.clone(),
            passthrough_env_vars: document.passthrough_env_vars.clone(),
            required_env_by_action,
            wrapper,
            logger,
        }
    }

    /// Execute the plan to completion, failure, or cancellation.
    pub fn run(self) -> Result<EngineResult> {
        let store = RunStore::create(&self.config.project_root)?;
        let runtime_path = write_runtime(&store.run_dir)?;
        self.logger
            .run_started(&store.run_id, self.plan.order.len());

        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        let abort = Arc::new(AtomicBool::new(false));
        let outputs: Arc<Mutex<BTreeMap<NodeKey, BTreeMap<String, TypedValue>>>> =
            Arc::new(Mutex::new(BTreeMap::new()));

        let (job_tx, job_rx) = mpsc::channel::<JobSpec>();
        let (done_tx, done_rx) = mpsc::channel::<NodeResult>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut worker_handles = Vec::with_capacity(self.config.workers);
        for _ in 0..self.config.workers.max(1) {
            let job_rx = Arc::clone(&job_rx);
            let done_tx = done_tx.clone();
            let wrapper = Arc::clone(&self.wrapper);
            let logger = Arc::clone(&self.logger);
            let abort = Arc::clone(&abort);
            let project_root = self.config.project_root.clone();
            let runtime_path = runtime_path.clone();
            let echo = self.config.echo_streams;
            worker_handles.push(thread::spawn(move || loop {
                let job = {
                    let receiver = job_rx.lock().unwrap_or_else(|p| p.into_inner());
                    receiver.recv()
                };
                let Ok(job) = job else {
                    break;
                };
                let result = execute_node(
                    job,
                    &project_root,
                    &runtime_path,
                    wrapper.as_ref(),
                    logger.as_ref(),
                    &abort,
                    deadline,
                    echo,
                );
                if done_tx.send(result).is_err() {
                    break;
                }
            }));
        }
        drop(done_tx);

        let mut state = SchedulerState::new(&self.graph, &self.plan);
        let mut results: BTreeMap<NodeKey, NodeResult> = BTreeMap::new();
        let mut restored: Vec<NodeKey> = Vec::new();
        let mut in_flight = 0usize;

        loop {
            in_flight += self.dispatch_ready(
                &mut state,
                &store,
                &outputs,
                &job_tx,
                &mut results,
                &mut restored,
            )?;

            if state.finished() && in_flight == 0 {
                break;
            }
            if in_flight == 0 {
                if state.failing || state.cancelled {
                    break;
                }
                if !state.has_ready() {
                    bail!(
                        "scheduler stalled with {} of {} node(s) incomplete",
                        state.executable.len() - state.completed.len(),
                        state.executable.len()
                    );
                }
                continue;
            }

            match done_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(result) => {
                    in_flight -= 1;
                    self.handle_completion(&mut state, result, &outputs, &mut results, &mut restored);
                    if state.cancelled {
                        abort.store(true, Ordering::SeqCst);
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline && !state.cancelled {
                            warn!("global timeout exceeded, cancelling run");
                            state.cancelled = true;
                            abort.store(true, Ordering::SeqCst);
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    bail!("worker pool disconnected unexpectedly");
                }
            }
        }

        drop(job_tx);
        for handle in worker_handles {
            let _ = handle.join();
        }

        let status = if state.cancelled {
            RunStatus::Cancelled
        } else if state.failing {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };

        let mut run_dir_removed = false;
        if status == RunStatus::Success && !self.config.keep_run_dir {
            if let Err(err) = store.remove() {
                warn!(error = %err, "failed to clean up run directory");
            } else {
                run_dir_removed = true;
            }
        }

        Ok(EngineResult {
            status,
            results,
            restored,
            run_id: store.run_id.clone(),
            run_dir: store.run_dir.clone(),
            run_dir_removed,
        })
    }

    /// Dispatch every ready node; returns how many went to the worker pool.
    fn dispatch_ready(
        &self,
        state: &mut SchedulerState,
        store: &RunStore,
        outputs: &Arc<Mutex<BTreeMap<NodeKey, BTreeMap<String, TypedValue>>>>,
        job_tx: &mpsc::Sender<JobSpec>,
        results: &mut BTreeMap<NodeKey, NodeResult>,
        restored: &mut Vec<NodeKey>,
    ) -> Result<usize> {
        let mut dispatched = 0usize;
        loop {
            if state.failing || state.cancelled {
                return Ok(dispatched);
            }
            let ready = state.take_ready();
            if ready.is_empty() {
                return Ok(dispatched);
            }
            let mut restored_any = false;
            for key in ready {
                if state.failing || state.cancelled {
                    break;
                }
                self.logger.node_started(&key);

                if let Some(result) = self.try_restore(&key, store)? {
                    restored_any = true;
                    self.handle_completion(state, result, outputs, results, restored);
                    continue;
                }

                let spec = self.prepare_job(&key, state, store, outputs)?;
                job_tx
                    .send(spec)
                    .map_err(|_| anyhow::anyhow!("worker pool closed while dispatching"))?;
                dispatched += 1;
            }
            if !restored_any {
                return Ok(dispatched);
            }
            // Restored completions may have readied more nodes; loop.
        }
    }

    /// Restore the node from the previous run if its checkpoint is usable.
    fn try_restore(&self, key: &NodeKey, store: &RunStore) -> Result<Option<NodeResult>> {
        let Some(previous) = &self.config.previous_run_dir else {
            return Ok(None);
        };
        let dir_name = key.dir_name();
        if !can_restore(previous, &dir_name) {
            return Ok(None);
        }

        let node = self.graph.node(key)?;
        let node_dir = restore_node_dir(previous, &store.run_dir, &dir_name)?;
        let meta = read_meta(&node_dir)?;
        match read_outputs(
            &node_dir.join("output.json"),
            &node.version.returns,
            &self.config.project_root,
        ) {
            Ok(outputs) => Ok(Some(NodeResult {
                key: key.clone(),
                success: true,
                restored: true,
                timed_out: false,
                outputs,
                exit_code: meta.exit_code,
                duration_seconds: meta.duration_seconds,
                error_message: None,
                node_dir,
            })),
            Err(err) => {
                // A checkpoint that no longer validates is re-executed.
                warn!(node = %key, error = %err, "stale checkpoint, re-executing");
                let _ = fs::remove_dir_all(&node_dir);
                Ok(None)
            }
        }
    }

    /// Assemble a job spec: bindings snapshot, retained flags, allow-list.
    fn prepare_job(
        &self,
        key: &NodeKey,
        state: &SchedulerState,
        store: &RunStore,
        outputs: &Arc<Mutex<BTreeMap<NodeKey, BTreeMap<String, TypedValue>>>>,
    ) -> Result<JobSpec> {
        let node = self.graph.node(key)?;
        let node_dir = store.node_dir(key)?;

        let mut sys: BTreeMap<String, String> = BTreeMap::new();
        sys.insert(
            "project-root".to_string(),
            self.config.project_root.display().to_string(),
        );
        sys.insert("run-dir".to_string(), store.run_dir.display().to_string());
        sys.insert("action-dir".to_string(), node_dir.display().to_string());
        sys.insert("platform".to_string(), self.config.platform.to_string());
        for (axis, value) in key.context.bindings() {
            sys.insert(format!("axis.{axis}"), value.clone());
        }

        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        env.extend(self.environment_vars.clone());

        let snapshot = outputs.lock().unwrap_or_else(|p| p.into_inner());
        let mut action_outputs: BTreeMap<String, BTreeMap<String, TypedValue>> = BTreeMap::new();
        let mut retained: BTreeMap<String, bool> = BTreeMap::new();
        for edge in &node.dependencies {
            if let Some(values) = snapshot.get(&edge.target) {
                action_outputs.insert(edge.target.action.clone(), values.clone());
            }
            if edge.kind != DependencyKind::Strong {
                // Retained flags are decided here, at dispatch time: the
                // target is (or has been promoted) in the executable set.
                retained.insert(
                    edge.target.action.clone(),
                    state.executable.contains(&edge.target),
                );
            }
        }
        drop(snapshot);

        let mut keep_vars: BTreeSet<String> =
            self.passthrough_env_vars.iter().cloned().collect();
        if let Some(declared) = self.required_env_by_action.get(&key.action) {
            keep_vars.extend(declared.iter().cloned());
        }
        keep_vars.extend(node.version.env_dependencies.iter().cloned());
        // Document-declared variables and the retain sentinel location must
        // survive hermetic stripping.
        keep_vars.extend(self.environment_vars.keys().cloned());
        keep_vars.insert("MDL_RETAIN_FILE".to_string());

        let bindings = RenderBindings {
            sys,
            env,
            document_env: self.environment_vars.clone(),
            args: node.args.clone(),
            flags: node.flags.clone(),
            action_outputs,
            retained,
        };

        Ok(JobSpec {
            key: key.clone(),
            version: node.version.clone(),
            bindings,
            keep_vars,
            node_dir,
        })
    }

    fn handle_completion(
        &self,
        state: &mut SchedulerState,
        result: NodeResult,
        outputs: &Arc<Mutex<BTreeMap<NodeKey, BTreeMap<String, TypedValue>>>>,
        results: &mut BTreeMap<NodeKey, NodeResult>,
        restored: &mut Vec<NodeKey>,
    ) {
        let key = result.key.clone();
        state.completed.insert(key.clone());

        let outcome = if result.restored {
            restored.push(key.clone());
            NodeOutcome::Restored
        } else if result.success {
            NodeOutcome::Done
        } else if result.timed_out || state.cancelled {
            NodeOutcome::Cancelled
        } else {
            NodeOutcome::Failed
        };
        self.logger
            .node_finished(&key, outcome, result.duration_seconds);

        if result.success {
            outputs
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(key.clone(), result.outputs.clone());

            // Retainer coordination: promotion must land before any consumer
            // of the edge can become ready, which holds because consumers
            // strong-depend on the retainer we are processing right now.
            let signalled = result.node_dir.join("retain.flag").is_file();
            state.process_retainer(&self.graph, &key, signalled);
        } else if result.timed_out {
            state.cancelled = true;
        } else if !state.cancelled {
            state.failing = true;
        }

        state.mark_done(&key);
        results.insert(key, result);
    }
}

/// Mutable scheduling state, owned by the scheduler thread.
struct SchedulerState {
    executable: BTreeSet<NodeKey>,
    waits: BTreeMap<NodeKey, BTreeSet<NodeKey>>,
    position: BTreeMap<NodeKey, usize>,
    next_position: usize,
    started: BTreeSet<NodeKey>,
    completed: BTreeSet<NodeKey>,
    /// Soft edges grouped by retainer, pending until the retainer finishes.
    retainers: BTreeMap<NodeKey, Vec<SoftEdge>>,
    failing: bool,
    cancelled: bool,
}

impl SchedulerState {
    fn new(graph: &ActionGraph, plan: &ExecutionPlan) -> Self {
        let mut retainers: BTreeMap<NodeKey, Vec<SoftEdge>> = BTreeMap::new();
        for soft in &plan.soft_edges {
            retainers
                .entry(soft.retainer.clone())
                .or_default()
                .push(soft.clone());
        }

        let mut state = Self {
            executable: plan.executable.clone(),
            waits: BTreeMap::new(),
            position: plan.position.clone(),
            next_position: plan.order.len(),
            started: BTreeSet::new(),
            completed: BTreeSet::new(),
            retainers,
            failing: false,
            cancelled: false,
        };
        for key in state.executable.clone() {
            let waits = state.compute_waits(graph, &key);
            state.waits.insert(key, waits);
        }
        state
    }

    /// Wait set of a node: strong dependencies, executable weak targets, and
    /// for soft edges the retainer plus the target when it is executable.
    fn compute_waits(&self, graph: &ActionGraph, key: &NodeKey) -> BTreeSet<NodeKey> {
        let mut waits = BTreeSet::new();
        let Ok(node) = graph.node(key) else {
            return waits;
        };
        for edge in &node.dependencies {
            if self.executable.contains(&edge.target) {
                waits.insert(edge.target.clone());
            }
            if let Some(retainer) = &edge.retainer {
                if self.executable.contains(retainer) {
                    waits.insert(retainer.clone());
                }
            }
        }
        waits.retain(|k| !self.completed.contains(k));
        waits
    }

    /// Handle a finished retainer: when it signalled, promote each soft
    /// target's strong closure into the executable set and extend the
    /// consumers' wait sets.
    fn process_retainer(&mut self, graph: &ActionGraph, key: &NodeKey, signalled: bool) {
        let Some(edges) = self.retainers.remove(key) else {
            return;
        };
        if !signalled {
            debug!(retainer = %key, "retainer completed without retain signal");
            return;
        }
        for soft in edges {
            debug!(retainer = %key, target = %soft.target, "promoting soft target");
            self.promote(graph, &soft.target);
            if !self.started.contains(&soft.consumer)
                && self.executable.contains(&soft.target)
                && !self.completed.contains(&soft.target)
            {
                if let Some(waits) = self.waits.get_mut(&soft.consumer) {
                    waits.insert(soft.target.clone());
                }
            }
        }
    }

    /// Promote a node and its strong closure; newly promoted nodes with soft
    /// edges of their own pull in their retainers the same way the planner
    /// would have.
    fn promote(&mut self, graph: &ActionGraph, target: &NodeKey) {
        let mut worklist: Vec<NodeKey> = vec![target.clone()];
        let mut added: Vec<NodeKey> = Vec::new();

        while let Some(root) = worklist.pop() {
            for key in graph.strong_closure(&root) {
                if !self.executable.insert(key.clone()) {
                    continue;
                }
                self.position.insert(key.clone(), self.next_position);
                self.next_position += 1;
                added.push(key.clone());

                if let Ok(node) = graph.node(&key) {
                    for edge in &node.dependencies {
                        if edge.kind == DependencyKind::Soft {
                            if let Some(retainer) = &edge.retainer {
                                self.retainers
                                    .entry(retainer.clone())
                                    .or_default()
                                    .push(SoftEdge {
                                        consumer: key.clone(),
                                        target: edge.target.clone(),
                                        retainer: retainer.clone(),
                                    });
                                worklist.push(retainer.clone());
                            }
                        }
                    }
                }
            }
        }

        for key in added {
            let waits = self.compute_waits(graph, &key);
            self.waits.insert(key, waits);
        }
    }

    /// Remove a completed node from every wait set.
    fn mark_done(&mut self, key: &NodeKey) {
        for waits in self.waits.values_mut() {
            waits.remove(key);
        }
    }

    /// Ready nodes in dispatch order (plan position, then node key).
    fn take_ready(&mut self) -> Vec<NodeKey> {
        let mut ready: Vec<NodeKey> = self
            .waits
            .iter()
            .filter(|(key, waits)| waits.is_empty() && !self.started.contains(*key))
            .map(|(key, _)| key.clone())
            .collect();
        ready.sort_by_key(|key| {
            (
                self.position.get(key).copied().unwrap_or(usize::MAX),
                key.clone(),
            )
        });
        for key in &ready {
            self.started.insert(key.clone());
        }
        ready
    }

    fn has_ready(&self) -> bool {
        self.waits
            .iter()
            .any(|(key, waits)| waits.is_empty() && !self.started.contains(key))
    }

    fn finished(&self) -> bool {
        if self.failing || self.cancelled {
            return false;
        }
        self.completed.len() == self.executable.len()
    }
}

/// Run one node in a worker thread: render, spawn, capture, validate.
#[allow(clippy::too_many_arguments)]
fn execute_node(
    job: JobSpec,
    project_root: &std::path::Path,
    runtime_path: &std::path::Path,
    wrapper: &dyn CommandWrapper,
    logger: &dyn ExecLogger,
    abort: &AtomicBool,
    deadline: Option<Instant>,
    echo: bool,
) -> NodeResult {
    let started = Instant::now();
    let start_time = Local::now();

    let failure = |error: anyhow::Error, exit_code: i32| {
        let duration_seconds = started.elapsed().as_secs_f64();
        let meta = NodeMeta {
            action_name: job.key.action.clone(),
            success: false,
            start_time: start_time.to_rfc3339(),
            end_time: Local::now().to_rfc3339(),
            duration_seconds,
            exit_code,
            error_message: Some(format!("{error:#}")),
        };
        let _ = write_meta(&job.node_dir, &meta);
        NodeResult {
            key: job.key.clone(),
            success: false,
            restored: false,
            timed_out: false,
            outputs: BTreeMap::new(),
            exit_code,
            duration_seconds,
            error_message: meta.error_message,
            node_dir: job.node_dir.clone(),
        }
    };

    let output_json_path = job.node_dir.join("output.json");
    let script_path = job
        .node_dir
        .join(format!("script.{}", job.version.language.script_ext()));

    let render = match job.version.language {
        Language::Bash => render_bash(
            &job.version,
            &job.bindings,
            runtime_path,
            &output_json_path,
            &job.node_dir,
        )
        .and_then(|script| {
            fs::write(&script_path, script)
                .with_context(|| format!("write {}", script_path.display()))
        }),
        Language::Python => {
            let context_path = job.node_dir.join("context.json");
            render_python(&job.version, &job.bindings, &context_path, &output_json_path).and_then(
                |(script, context)| {
                    let payload = serde_json::to_string_pretty(&context)
                        .context("serialize context.json")?;
                    fs::write(&context_path, payload)
                        .with_context(|| format!("write {}", context_path.display()))?;
                    fs::write(&script_path, script)
                        .with_context(|| format!("write {}", script_path.display()))
                },
            )
        }
    };
    if let Err(err) = render {
        return failure(err, -1);
    }

    let base = interpreter_command(job.version.language, &script_path);
    let mut cmd = wrapper.build(&base, &job.keep_vars);
    cmd.current_dir(project_root);
    // Document-declared variables are exported into every child; the retain
    // sentinel location must be visible even when the script never sources
    // the bash runtime header (python path).
    for (name, value) in &job.bindings.document_env {
        cmd.env(name, value);
    }
    cmd.env(
        "MDL_RETAIN_FILE",
        job.node_dir.join("retain.flag").as_os_str(),
    );

    logger.group_start(&job.key);
    let supervised = run_supervised(
        cmd,
        &job.node_dir.join("stdout.log"),
        &job.node_dir.join("stderr.log"),
        echo,
        deadline,
        abort,
    );
    logger.group_end(&job.key);

    let supervised = match supervised {
        Ok(supervised) => supervised,
        Err(err) => return failure(err, -1),
    };

    if supervised.timed_out {
        let mut result = failure(anyhow::anyhow!("timed out"), supervised.exit_code());
        result.timed_out = true;
        return result;
    }
    if supervised.aborted {
        return failure(anyhow::anyhow!("cancelled"), supervised.exit_code());
    }
    if !supervised.status.success() {
        return failure(
            anyhow::anyhow!("script exited with code {}", supervised.exit_code()),
            supervised.exit_code(),
        );
    }

    if !output_json_path.is_file() {
        return failure(anyhow::anyhow!("no output.json generated"), 0);
    }
    let outputs = match read_outputs(&output_json_path, &job.version.returns, project_root) {
        Ok(outputs) => outputs,
        Err(err) => return failure(err, 0),
    };

    let duration_seconds = started.elapsed().as_secs_f64();
    let meta = NodeMeta {
        action_name: job.key.action.clone(),
        success: true,
        start_time: start_time.to_rfc3339(),
        end_time: Local::now().to_rfc3339(),
        duration_seconds,
        exit_code: 0,
        error_message: None,
    };
    if let Err(err) = write_meta(&job.node_dir, &meta) {
        return failure(err, 0);
    }

    NodeResult {
        key: job.key,
        success: true,
        restored: false,
        timed_out: false,
        outputs,
        exit_code: 0,
        duration_seconds,
        error_message: None,
        node_dir: job.node_dir,
    }
}
