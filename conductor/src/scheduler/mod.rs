//! Execution scheduler ("the loop").
//!
//! Each iteration renders the workflow, assigns stable node ids, grafts the
//! previous frame's execution state onto the new tree, activates every
//! pending runnable node on a scoped worker thread, waits for all of them,
//! settles phase/step units and loop iterations, and then decides whether to
//! stop.
//!
//! Termination priority: stop requested > max iterations > global timeout >
//! budget exhausted > frame storm > quiescent. Any node or unit failure
//! recorded along the way fails the execution whatever ended the loop.

mod handlers;
pub mod keys;

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentExecutor, CancelToken};
use crate::core::frame_storm::{FrameSignature, FrameStormGuard};
use crate::core::identity::{
    assign_ids, assign_iteration_ids, ensure_unique_ids, graft_exec, index_exec, reconcile,
};
use crate::core::loops::{LoopState, LoopStatus};
use crate::core::plan::{ExecState, Node, NodeKind, NodeStatus};
use crate::core::stop::{LoopSignals, Termination, decide_termination, millis};
use crate::core::types::{ExecutionStatus, UnitStatus};
use crate::errors::ConductorError;
use crate::io::agent_backend::AgentBackend;
use crate::io::config::{ExecutionConfig, OrphanPolicy, ToolDefaults};
use crate::io::store::{NewReport, ReportKind, Store};
use crate::io::vcs::{Changeset, ChangesetStore};
use crate::sequencer::{SequenceMode, Sequencer};
use crate::transaction::ToolWrapper;

pub use handlers::NodeResult;

use handlers::{HandlerContext, run_node};

const AWAIT_POLL: Duration = Duration::from_millis(50);

/// Produces the plan tree for one iteration.
pub trait Render: Send + Sync {
    fn render(&self, ctx: &RenderContext<'_>) -> Result<Node>;
}

impl<F> Render for F
where
    F: Fn(&RenderContext<'_>) -> Result<Node> + Send + Sync,
{
    fn render(&self, ctx: &RenderContext<'_>) -> Result<Node> {
        self(ctx)
    }
}

/// Inputs to [`Render::render`].
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub execution_id: &'a str,
    /// 0-based iteration being rendered.
    pub iteration: u32,
    /// Workflow variables written through `state_key`, frozen for this render.
    pub state: &'a BTreeMap<String, Value>,
    /// Tree from the previous iteration, with execution state attached.
    pub previous: Option<&'a Node>,
}

impl RenderContext<'_> {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.state.get(name)
    }
}

/// A registered tool implementation.
pub type ToolFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

pub fn tool_fn<F>(f: F) -> ToolFn
where
    F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Tools available to `tool` nodes, by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolFn>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.tools.keys()).finish()
    }
}

impl ToolRegistry {
    pub fn register(&mut self, name: impl Into<String>, tool: ToolFn) {
        self.tools.insert(name.into(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&ToolFn> {
        self.tools.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }
}

/// Collaborators shared by a scheduler, its handlers and child executions.
pub struct Runtime {
    store: Store,
    agents: AgentExecutor,
    tools: ToolRegistry,
    wrapper: Option<ToolWrapper>,
    changesets: Option<Arc<dyn ChangesetStore>>,
    workflows: BTreeMap<String, Arc<dyn Render>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("store", &self.store)
            .field("tools", &self.tools)
            .field("changesets", &self.changesets.as_ref().map(|c| c.workdir()))
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(store: Store, backend: Arc<dyn AgentBackend>) -> Self {
        Self {
            store,
            agents: AgentExecutor::new(backend),
            tools: ToolRegistry::default(),
            wrapper: None,
            changesets: None,
            workflows: BTreeMap::new(),
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>, tool: ToolFn) -> Self {
        self.tools.register(name, tool);
        self
    }

    /// Run tools transactionally over `changesets` and record step changesets.
    pub fn with_changesets(mut self, changesets: Arc<dyn ChangesetStore>, tools: &ToolDefaults) -> Self {
        self.wrapper = Some(
            ToolWrapper::from_config(Arc::clone(&changesets), tools).with_store(self.store.clone()),
        );
        self.changesets = Some(changesets);
        self
    }

    /// Make `render` available to `subagent` nodes as `name`.
    pub fn with_workflow(mut self, name: impl Into<String>, render: impl Render + 'static) -> Self {
        self.workflows.insert(name.into(), Arc::new(render));
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn wrapper(&self) -> Option<&ToolWrapper> {
        self.wrapper.as_ref()
    }
}

/// Raise the persisted stop flag of `execution_id`.
pub fn request_stop(store: &Store, execution_id: &str) -> Result<()> {
    store.set_state(&keys::stop(execution_id), &Value::Bool(true), "stop_requested")?;
    info!(execution_id, "stop requested");
    Ok(())
}

pub(crate) fn stop_flag_set(
    store: &Store,
    sources: &[String],
    parent_cancel: Option<&CancelToken>,
) -> Result<bool> {
    if parent_cancel.is_some_and(CancelToken::is_cancelled) {
        return Ok(true);
    }
    for execution_id in sources {
        if store.get_state(&keys::stop(execution_id))? == Some(Value::Bool(true)) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Final state of a [`Scheduler::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub end_reason: String,
    /// Iterations performed.
    pub iterations: u32,
    pub error: Option<String>,
    pub tree: Option<Node>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UnitRecord {
    record_id: String,
    snapshot_before: Option<String>,
}

#[derive(Debug, Clone)]
struct PhaseRef {
    name: String,
    node_id: String,
}

#[derive(Debug, Clone, Default)]
struct UnitScope {
    phase: Option<PhaseRef>,
    parallel_steps: bool,
    /// Sequencer scope prefix inside loop iterations.
    namespace: String,
}

#[derive(Debug, Clone)]
struct ActiveUnit {
    node_id: String,
    kind: NodeKind,
    name: String,
    scope: String,
    mode: SequenceMode,
    index: usize,
}

#[derive(Debug)]
enum Settle {
    Unit(ActiveUnit),
    Loop(String),
}

#[derive(Debug, Default)]
struct Discovery {
    pending: Vec<String>,
    /// Units and loops to settle, in pre-order.
    settle: Vec<Settle>,
    /// Node id registered under each `(scope, unit name)`.
    registered: HashMap<(String, String), String>,
    progressed: bool,
}

struct Frame {
    pending: usize,
    progressed: bool,
    stopped: bool,
    signature: FrameSignature,
}

/// Execution wall clock, including time spent before a resume.
#[derive(Debug, Clone, Copy)]
struct Clock {
    started: Instant,
    offset: Duration,
}

impl Clock {
    fn elapsed(&self) -> Duration {
        self.offset + self.started.elapsed()
    }
}

enum UnitOutcome {
    Waiting,
    Completed,
    Failed(String),
}

struct Completion {
    node_id: String,
    result: Result<NodeResult>,
    duration: Duration,
}

/// Drives one execution to a terminal status.
pub struct Scheduler {
    runtime: Arc<Runtime>,
    render: Arc<dyn Render>,
    config: ExecutionConfig,
    execution_id: String,
    stop_sources: Vec<String>,
    parent_cancel: Option<CancelToken>,
    cancel: CancelToken,
    iteration: u32,
    tree: Option<Node>,
    restored: HashMap<String, ExecState>,
    units: HashMap<String, UnitRecord>,
    sequencers: HashMap<String, Sequencer>,
    loops: HashMap<String, LoopState>,
    storm: FrameStormGuard,
    /// Execution time already spent before this process took over.
    elapsed_before: Duration,
    first_error: Option<String>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("execution_id", &self.execution_id)
            .field("iteration", &self.iteration)
            .field("first_error", &self.first_error)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a new top-level execution.
    pub fn start(
        runtime: Arc<Runtime>,
        render: Arc<dyn Render>,
        config: ExecutionConfig,
    ) -> Result<Self> {
        config.validate().context("invalid execution config")?;
        let config_json = serde_json::to_value(&config).context("serialize config")?;
        let execution_id = runtime.store.start_execution(
            &config.name,
            config.source.as_deref(),
            &config_json,
            None,
        )?;
        info!(execution_id = %execution_id, name = %config.name, "execution started");
        let stop_sources = vec![execution_id.clone()];
        Ok(Self::assemble(runtime, render, config, execution_id, stop_sources))
    }

    /// Create a child execution that also honors its ancestors' stop flags.
    pub(crate) fn start_child(
        runtime: Arc<Runtime>,
        render: Arc<dyn Render>,
        config: ExecutionConfig,
        parent_id: &str,
        parent_sources: &[String],
        parent_cancel: CancelToken,
    ) -> Result<Self> {
        config.validate().context("invalid child execution config")?;
        let config_json = serde_json::to_value(&config).context("serialize config")?;
        let execution_id = runtime.store.start_execution(
            &config.name,
            config.source.as_deref(),
            &config_json,
            Some(parent_id),
        )?;
        info!(execution_id = %execution_id, parent_id, "child execution started");
        let mut stop_sources = parent_sources.to_vec();
        stop_sources.push(execution_id.clone());
        let mut scheduler = Self::assemble(runtime, render, config, execution_id, stop_sources);
        scheduler.parent_cancel = Some(parent_cancel);
        Ok(scheduler)
    }

    /// Recover the single running top-level execution left by a crash.
    ///
    /// Restores the iteration count, settled node state and unit records, and
    /// fails agent records that were still running. Runnable nodes left
    /// running are re-run or failed per [`OrphanPolicy`]. Sequencer and loop
    /// state is loaded from the store on first use. The global timeout keeps
    /// counting from the first start.
    pub fn resume(
        runtime: Arc<Runtime>,
        render: Arc<dyn Render>,
        config: ExecutionConfig,
    ) -> Result<Option<Self>> {
        let Some(record) = runtime.store.find_incomplete_execution()? else {
            return Ok(None);
        };
        config.validate().context("invalid execution config")?;
        let execution_id = record.id;
        let orphaned = runtime
            .store
            .fail_orphaned_agents(&execution_id, "orphaned by crash; execution resumed")?;

        let started_at = DateTime::parse_from_rfc3339(&record.started_at)
            .with_context(|| format!("parse started_at {}", record.started_at))?;
        let elapsed_before = Utc::now()
            .signed_duration_since(started_at)
            .to_std()
            .unwrap_or_default();

        let unit_prefix = keys::unit_prefix(&execution_id);
        let mut units = HashMap::new();
        for (key, value) in runtime.store.state_with_prefix(&unit_prefix)? {
            let unit: UnitRecord = serde_json::from_value(value)
                .with_context(|| format!("parse unit record {key}"))?;
            if let Some(node_id) = key.strip_prefix(&unit_prefix) {
                units.insert(node_id.to_string(), unit);
            }
        }
        let loop_prefix = keys::loop_prefix(&execution_id);
        let loop_ids: HashSet<String> = runtime
            .store
            .state_with_prefix(&loop_prefix)?
            .into_iter()
            .filter_map(|(key, _)| key.strip_prefix(&loop_prefix).map(str::to_string))
            .collect();

        let node_prefix = keys::node_prefix(&execution_id);
        let mut restored = HashMap::new();
        let mut orphaned_nodes = Vec::new();
        for (key, value) in runtime.store.state_with_prefix(&node_prefix)? {
            let mut exec: ExecState = serde_json::from_value(value)
                .with_context(|| format!("parse node state {key}"))?;
            let Some(node_id) = key.strip_prefix(&node_prefix) else {
                continue;
            };
            let orphan = exec.status == NodeStatus::Running
                && !units.contains_key(node_id)
                && !loop_ids.contains(node_id);
            if orphan && config.orphan_policy == OrphanPolicy::Fail {
                exec.status = NodeStatus::Failed;
                exec.error_message = Some(ORPHAN_ERROR.to_string());
                persist_exec(&runtime.store, &execution_id, node_id, &exec)?;
                orphaned_nodes.push(node_id.to_string());
            }
            if exec.status.is_settled() {
                restored.insert(node_id.to_string(), exec);
            }
        }

        info!(
            execution_id = %execution_id,
            iteration = record.iterations,
            restored = restored.len(),
            orphaned,
            orphaned_nodes = orphaned_nodes.len(),
            elapsed_before_ms = millis(elapsed_before),
            "resuming execution"
        );
        for node_id in &orphaned_nodes {
            warn!(node_id = %node_id, "orphaned node failed");
        }
        let stop_sources = vec![execution_id.clone()];
        let mut scheduler = Self::assemble(runtime, render, config, execution_id, stop_sources);
        scheduler.iteration = record.iterations;
        scheduler.restored = restored;
        scheduler.units = units;
        scheduler.elapsed_before = elapsed_before;
        if !orphaned_nodes.is_empty() {
            scheduler.first_error = Some(ORPHAN_ERROR.to_string());
        }
        Ok(Some(scheduler))
    }

    fn assemble(
        runtime: Arc<Runtime>,
        render: Arc<dyn Render>,
        config: ExecutionConfig,
        execution_id: String,
        stop_sources: Vec<String>,
    ) -> Self {
        let storm = FrameStormGuard::new(config.frame_limits());
        Self {
            runtime,
            render,
            config,
            execution_id,
            stop_sources,
            parent_cancel: None,
            cancel: CancelToken::new(),
            iteration: 0,
            tree: None,
            restored: HashMap::new(),
            units: HashMap::new(),
            sequencers: HashMap::new(),
            loops: HashMap::new(),
            storm,
            elapsed_before: Duration::ZERO,
            first_error: None,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Iterations completed so far.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn tree(&self) -> Option<&Node> {
        self.tree.as_ref()
    }

    /// Loop until a termination condition holds and finalize the execution row.
    #[instrument(skip_all, fields(execution_id = %self.execution_id))]
    pub fn run(&mut self) -> Result<RunOutcome> {
        let clock = Clock {
            started: Instant::now(),
            offset: self.elapsed_before,
        };
        loop {
            let frame = match self.iterate(clock) {
                Ok(frame) => frame,
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(iteration = self.iteration, error = %message, "iteration failed");
                    return self.finish(ExecutionStatus::Failed, "error", Some(message));
                }
            };

            let record = self
                .runtime
                .store
                .get_execution(&self.execution_id)?
                .ok_or_else(|| anyhow!("execution {} disappeared", self.execution_id))?;
            let frame_storm = self
                .storm
                .check(frame.signature, Instant::now())
                .map(|storm| storm.to_string());
            let signals = LoopSignals {
                stop_requested: frame.stopped || self.stop_requested()?,
                iteration: self.iteration,
                max_iterations: Some(self.config.max_iterations),
                elapsed: clock.elapsed(),
                global_timeout: self.config.global_timeout(),
                budget_exhausted: self
                    .config
                    .budget()
                    .exhausted(record.total_tokens, record.total_tool_calls),
                frame_storm,
                quiescent: frame.pending == 0 && !frame.progressed,
            };
            debug!(
                iteration = self.iteration,
                pending = frame.pending,
                progressed = frame.progressed,
                "iteration finished"
            );
            if let Some(termination) = decide_termination(&signals) {
                return self.terminate(&termination);
            }
            self.iteration += 1;
            self.runtime
                .store
                .record_iteration(&self.execution_id, self.iteration)?;
        }
    }

    fn stop_requested(&self) -> Result<bool> {
        stop_flag_set(
            &self.runtime.store,
            &self.stop_sources,
            self.parent_cancel.as_ref(),
        )
    }

    /// Render, discover, dispatch and settle one frame.
    fn iterate(&mut self, clock: Clock) -> Result<Frame> {
        let var_prefix = keys::var_prefix(&self.execution_id);
        let vars: BTreeMap<String, Value> = self
            .runtime
            .store
            .state_with_prefix(&var_prefix)?
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&var_prefix)
                    .map(|name| (name.to_string(), value))
            })
            .collect();

        let previous = self.tree.take();
        let mut tree = self
            .render
            .render(&RenderContext {
                execution_id: &self.execution_id,
                iteration: self.iteration,
                state: &vars,
                previous: previous.as_ref(),
            })
            .context("render workflow")?;
        assign_ids(&mut tree)?;
        self.prepare_loops(&mut tree)?;
        ensure_unique_ids(&tree)?;
        let exec = match &previous {
            Some(prev) => index_exec(prev),
            None => std::mem::take(&mut self.restored),
        };
        let grafted = graft_exec(&mut tree, &exec);
        let diff = reconcile(&tree, previous.as_ref());
        debug!(
            iteration = self.iteration,
            nodes = tree.node_count(),
            grafted,
            mounted = diff.newly_mounted.len(),
            unmounted = diff.unmounted.len(),
            "rendered frame"
        );

        let mut discovery = Discovery::default();
        self.discover(&mut tree, &UnitScope::default(), &mut discovery)?;
        let stopped = self.dispatch(&mut tree, &discovery.pending, clock)?;
        if !stopped {
            self.settle(&mut tree, &discovery.settle, &mut discovery.progressed)?;
        }
        let signature = FrameSignature::of(&tree, &vars);
        self.tree = Some(tree);
        Ok(Frame {
            pending: discovery.pending.len(),
            progressed: discovery.progressed,
            stopped,
            signature,
        })
    }

    /// Give every loop body the ids of the loop's current iteration.
    fn prepare_loops(&mut self, node: &mut Node) -> Result<()> {
        if node.kind() == NodeKind::Loop {
            let iteration = self.loop_state(node)?.current_iteration;
            assign_iteration_ids(node, iteration)?;
        }
        for child in &mut node.children {
            self.prepare_loops(child)?;
        }
        Ok(())
    }

    /// Cached loop state, loaded from the store or created on first sight.
    fn loop_state(&mut self, node: &Node) -> Result<&LoopState> {
        let state = match self.loops.entry(node.id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let key = keys::loop_state(&self.execution_id, &node.id);
                let state = match self.runtime.store.get_state(&key)? {
                    Some(value) => serde_json::from_value(value)
                        .with_context(|| format!("parse loop state {key}"))?,
                    None => {
                        let state = LoopState::new(node)
                            .ok_or_else(|| anyhow!("node {} is not a loop", node.id))?;
                        persist_loop(&self.runtime.store, &key, &state, "loop_started")?;
                        state
                    }
                };
                entry.insert(state)
            }
        };
        Ok(state)
    }

    fn save_loop(&mut self, node_id: &str, state: LoopState, action: &str) -> Result<()> {
        let key = keys::loop_state(&self.execution_id, node_id);
        persist_loop(&self.runtime.store, &key, &state, action)?;
        self.loops.insert(node_id.to_string(), state);
        Ok(())
    }

    /// Pre-order walk collecting pending runnable nodes. Inactive units are
    /// not descended into.
    fn discover(&mut self, node: &mut Node, scope: &UnitScope, out: &mut Discovery) -> Result<()> {
        match node.kind() {
            NodeKind::Agent | NodeKind::Tool | NodeKind::HumanWait | NodeKind::Subagent => {
                if node.exec.status == NodeStatus::Pending {
                    out.pending.push(node.id.clone());
                }
            }
            NodeKind::Group => {
                for child in &mut node.children {
                    self.discover(child, scope, out)?;
                }
            }
            NodeKind::Phase | NodeKind::Step => self.discover_unit(node, scope, out)?,
            NodeKind::Loop => self.discover_loop(node, scope, out)?,
        }
        Ok(())
    }

    /// Start, continue or finish a loop at its current iteration.
    fn discover_loop(&mut self, node: &mut Node, scope: &UnitScope, out: &mut Discovery) -> Result<()> {
        if node.exec.status.is_settled() {
            return Ok(());
        }
        let mut state = self.loop_state(node)?.clone();
        let iteration = state.current_iteration;

        if !state.is_running() {
            if state.status == LoopStatus::Failed {
                node.exec.status = NodeStatus::Failed;
                node.exec.error_message = state.stop_reason.clone();
            } else {
                node.exec.status = NodeStatus::Completed;
                node.exec.result_summary = state.stop_reason.clone();
            }
            self.persist_node(node)?;
            return Ok(());
        }

        if node.children.iter().all(untouched)
            && let Some(exit) = state.exit_before_iteration(node)
        {
            state.finish(exit);
            self.save_loop(&node.id, state, "loop_finished")?;
            node.exec.status = NodeStatus::Completed;
            node.exec.result_summary = Some(format!(
                "{} after {iteration} iteration(s)",
                exit.as_str()
            ));
            self.persist_node(node)?;
            out.progressed = true;
            info!(node_id = %node.id, iterations = iteration, exit = exit.as_str(), "loop finished");
            return Ok(());
        }

        if node.exec.status == NodeStatus::Pending {
            node.exec.status = NodeStatus::Running;
            self.persist_node(node)?;
            out.progressed = true;
            debug!(node_id = %node.id, iteration, "loop iteration started");
        }
        out.settle.push(Settle::Loop(node.id.clone()));
        let body_scope = UnitScope {
            namespace: format!("{}loop:{}:{iteration}/", scope.namespace, node.id),
            ..scope.clone()
        };
        for child in &mut node.children {
            self.discover(child, &body_scope, out)?;
        }
        Ok(())
    }

    fn discover_unit(&mut self, node: &mut Node, scope: &UnitScope, out: &mut Discovery) -> Result<()> {
        let kind = node.kind();
        let name = node.sequence_name();
        let (local_scope, mode) = match (kind, &scope.phase) {
            (NodeKind::Phase, None) => ("phase".to_string(), SequenceMode::Sequential),
            (NodeKind::Phase, Some(parent)) => {
                (format!("phase:{}", parent.name), SequenceMode::Sequential)
            }
            (_, None) => ("step".to_string(), SequenceMode::Sequential),
            (_, Some(parent)) => {
                let mode = if scope.parallel_steps {
                    SequenceMode::Parallel
                } else {
                    SequenceMode::Sequential
                };
                (format!("step:{}", parent.name), mode)
            }
        };
        let scope_name = format!("{}{local_scope}", scope.namespace);
        match out.registered.entry((scope_name.clone(), name.clone())) {
            Entry::Occupied(entry) if *entry.get() != node.id => {
                return Err(ConductorError::Validation(format!(
                    "duplicate unit name '{name}' in {scope_name}"
                ))
                .into());
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(entry) => {
                entry.insert(node.id.clone());
            }
        }

        let (index, active) = {
            let sequencer = self.sequencer(&scope_name, mode)?;
            let index = sequencer.register(&name)?;
            (index, sequencer.is_active(index))
        };
        if node.exec.status.is_settled() || !active {
            return Ok(());
        }

        if node.prop_bool("skip") {
            if self.sequencer(&scope_name, mode)?.skip(index)? {
                mark_subtree(node, NodeStatus::Skipped);
                self.persist_node(node)?;
                out.progressed = true;
                debug!(unit = %node.unit_name(), "unit skipped");
            }
            return Ok(());
        }

        if node.exec.status == NodeStatus::Pending {
            self.begin_unit(node, kind, scope)?;
            out.progressed = true;
        }
        out.settle.push(Settle::Unit(ActiveUnit {
            node_id: node.id.clone(),
            kind,
            name: node.unit_name(),
            scope: scope_name,
            mode,
            index,
        }));

        let child_scope = if kind == NodeKind::Phase {
            UnitScope {
                phase: Some(PhaseRef {
                    name,
                    node_id: node.id.clone(),
                }),
                parallel_steps: node.prop_bool("parallel"),
                namespace: scope.namespace.clone(),
            }
        } else {
            scope.clone()
        };
        for child in &mut node.children {
            self.discover(child, &child_scope, out)?;
        }
        Ok(())
    }

    fn sequencer(&mut self, scope: &str, mode: SequenceMode) -> Result<&mut Sequencer> {
        let sequencer = match self.sequencers.entry(scope.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let loaded = Sequencer::load(
                    self.runtime.store.clone(),
                    &self.execution_id,
                    scope,
                    mode,
                )?
                .on_complete(|scope| info!(scope, "all units complete"))
                .on_error(|scope, unit, error| warn!(scope, unit, error, "unit failed"));
                entry.insert(loaded)
            }
        };
        sequencer.set_mode(mode);
        Ok(sequencer)
    }

    /// Open the unit's phase/step record (once per execution) and mark it running.
    fn begin_unit(&mut self, node: &mut Node, kind: NodeKind, scope: &UnitScope) -> Result<()> {
        if !self.units.contains_key(&node.id) {
            let name = node.unit_name();
            let store = &self.runtime.store;
            let record = if kind == NodeKind::Phase {
                UnitRecord {
                    record_id: store.start_phase(&self.execution_id, &name, self.iteration)?,
                    snapshot_before: None,
                }
            } else {
                let before = self.step_changeset(&format!("conductor step: before {name}"));
                let phase_id = scope
                    .phase
                    .as_ref()
                    .and_then(|phase| self.units.get(&phase.node_id))
                    .map(|unit| unit.record_id.clone());
                let snapshot_before = before.map(|changeset| changeset.id);
                UnitRecord {
                    record_id: store.start_step(
                        &self.execution_id,
                        phase_id.as_deref(),
                        &name,
                        snapshot_before.as_deref(),
                    )?,
                    snapshot_before,
                }
            };
            let value = serde_json::to_value(&record).context("serialize unit record")?;
            store.set_state(&keys::unit(&self.execution_id, &node.id), &value, "unit_started")?;
            info!(unit = %name, kind = ?kind, "unit started");
            self.units.insert(node.id.clone(), record);
        }
        node.exec.status = NodeStatus::Running;
        self.persist_node(node)
    }

    /// Activate every pending node and wait for all of them.
    ///
    /// Returns true when the stop flag cut activation short.
    fn dispatch(&mut self, tree: &mut Node, pending: &[String], clock: Clock) -> Result<bool> {
        if pending.is_empty() {
            return Ok(false);
        }
        let (tx, rx) = mpsc::channel::<Completion>();
        let ctx = HandlerContext {
            runtime: &self.runtime,
            config: &self.config,
            execution_id: &self.execution_id,
            stop_sources: &self.stop_sources,
            parent_cancel: self.parent_cancel.as_ref(),
            cancel: &self.cancel,
        };
        let store = &self.runtime.store;
        let execution_id = self.execution_id.as_str();
        let global_timeout = self.config.global_timeout();
        let mut failures = Vec::new();

        let stopped = thread::scope(|scope| -> Result<bool> {
            let mut stopped = false;
            for id in pending {
                if ctx.stop_requested()? {
                    info!("stop requested; admitting no further activations");
                    stopped = true;
                    break;
                }
                let Some(node) = tree.find_mut(id) else {
                    continue;
                };
                node.exec.status = NodeStatus::Running;
                persist_node(store, execution_id, node)?;
                let job = node.clone();
                let tx = tx.clone();
                let ctx = &ctx;
                debug!(node_id = %job.id, node_type = %job.node_type, "activating node");
                scope.spawn(move || {
                    let began = Instant::now();
                    let result = panic::catch_unwind(AssertUnwindSafe(|| run_node(ctx, &job)))
                        .unwrap_or_else(|payload| {
                            Err(ConductorError::Execution(format!(
                                "handler panicked: {}",
                                panic_message(payload.as_ref())
                            ))
                            .into())
                        });
                    let _ = tx.send(Completion {
                        node_id: job.id,
                        result,
                        duration: began.elapsed(),
                    });
                });
            }
            drop(tx);

            loop {
                match rx.recv_timeout(AWAIT_POLL) {
                    Ok(completion) => {
                        if let Some(failure) = apply_completion(store, execution_id, tree, completion)? {
                            failures.push(failure);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if ctx.cancel.is_cancelled() {
                            continue;
                        }
                        let timed_out = global_timeout.is_some_and(|limit| clock.elapsed() >= limit);
                        if timed_out || ctx.stop_requested()? {
                            info!(timed_out, "cancelling in-flight nodes");
                            ctx.cancel.cancel();
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            Ok(stopped)
        })?;

        if self.first_error.is_none() {
            self.first_error = failures.into_iter().next();
        }
        Ok(stopped)
    }

    /// Settle every active unit and loop whose subtree has settled, innermost
    /// first, then close the units left running in sequences that halted.
    fn settle(&mut self, tree: &mut Node, pending: &[Settle], progressed: &mut bool) -> Result<()> {
        for item in pending.iter().rev() {
            match item {
                Settle::Unit(unit) => self.settle_unit(tree, unit, progressed)?,
                Settle::Loop(node_id) => self.settle_loop(tree, node_id, progressed)?,
            }
        }
        for item in pending.iter().rev() {
            if let Settle::Unit(unit) = item {
                self.close_halted_sibling(tree, unit)?;
            }
        }
        Ok(())
    }

    fn settle_unit(&mut self, tree: &mut Node, unit: &ActiveUnit, progressed: &mut bool) -> Result<()> {
        let Some(node) = tree.find(&unit.node_id) else {
            return Ok(());
        };
        match unit_outcome(node) {
            UnitOutcome::Waiting => {}
            UnitOutcome::Completed => {
                if self.sequencer(&unit.scope, unit.mode)?.advance(unit.index)? {
                    self.end_unit(tree, unit, NodeStatus::Completed, None)?;
                    *progressed = true;
                }
            }
            UnitOutcome::Failed(error) => {
                if self.sequencer(&unit.scope, unit.mode)?.fail(unit.index, &error)? {
                    self.end_unit(tree, unit, NodeStatus::Failed, Some(&error))?;
                    self.first_error.get_or_insert(error);
                    *progressed = true;
                }
            }
        }
        Ok(())
    }

    /// End the current iteration of a loop whose body has settled.
    fn settle_loop(&mut self, tree: &mut Node, node_id: &str, progressed: &mut bool) -> Result<()> {
        let Some(node) = tree.find(node_id) else {
            return Ok(());
        };
        if node.exec.status.is_settled() {
            return Ok(());
        }
        let outcome = unit_outcome(node);
        let Some(mut state) = self.loops.get(node_id).cloned() else {
            return Ok(());
        };
        match outcome {
            UnitOutcome::Waiting => {}
            UnitOutcome::Completed => {
                state.current_iteration += 1;
                debug!(node_id, iteration = state.current_iteration, "loop iteration finished");
                self.save_loop(node_id, state, "loop_iteration")?;
                *progressed = true;
            }
            UnitOutcome::Failed(error) => {
                state.fail(&error);
                self.save_loop(node_id, state, "loop_failed")?;
                if let Some(node) = tree.find_mut(node_id) {
                    node.exec.status = NodeStatus::Failed;
                    node.exec.error_message = Some(error.clone());
                    self.persist_node(node)?;
                }
                warn!(node_id, error = %error, "loop failed");
                self.first_error.get_or_insert(error);
                *progressed = true;
            }
        }
        Ok(())
    }

    /// A unit still running after its sequence halted on a sibling is closed
    /// with the outcome of its subtree, or cancelled when unfinished.
    fn close_halted_sibling(&mut self, tree: &mut Node, unit: &ActiveUnit) -> Result<()> {
        let halted_at = self
            .sequencers
            .get(&unit.scope)
            .and_then(Sequencer::halted)
            .map(|halt| halt.index);
        if halted_at.is_none_or(|index| index == unit.index) {
            return Ok(());
        }
        let Some(node) = tree.find(&unit.node_id) else {
            return Ok(());
        };
        if node.exec.status.is_settled() {
            return Ok(());
        }
        match unit_outcome(node) {
            UnitOutcome::Completed => self.end_unit(tree, unit, NodeStatus::Completed, None),
            UnitOutcome::Failed(error) => {
                self.end_unit(tree, unit, NodeStatus::Failed, Some(&error))
            }
            UnitOutcome::Waiting => self.end_unit(
                tree,
                unit,
                NodeStatus::Cancelled,
                Some("cancelled: a sibling unit failed"),
            ),
        }
    }

    fn end_unit(
        &mut self,
        tree: &mut Node,
        unit: &ActiveUnit,
        status: NodeStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let unit_status = match status {
            NodeStatus::Completed => UnitStatus::Completed,
            NodeStatus::Cancelled => UnitStatus::Cancelled,
            _ => UnitStatus::Failed,
        };
        if let Some(record) = self.units.get(&unit.node_id).cloned() {
            let store = &self.runtime.store;
            if unit.kind == NodeKind::Phase {
                store.finish_phase(&record.record_id, unit_status, error)?;
            } else {
                let mut snapshot_after = None;
                let mut commit_id = None;
                if status == NodeStatus::Completed
                    && let Some(after) =
                        self.step_changeset(&format!("conductor step: after {}", unit.name))
                {
                    commit_id = Some(store.record_commit(
                        &self.execution_id,
                        Some(&record.record_id),
                        &after,
                    )?);
                    snapshot_after = Some(after.id);
                }
                store.finish_step(
                    &record.record_id,
                    unit_status,
                    snapshot_after.as_deref(),
                    commit_id.as_deref(),
                    error,
                )?;
            }
        }
        if let Some(node) = tree.find_mut(&unit.node_id) {
            node.exec.status = status;
            node.exec.error_message = error.map(str::to_string);
            self.persist_node(node)?;
        }
        info!(unit = %unit.name, status = status.as_str(), "unit finished");
        Ok(())
    }

    /// Record a step changeset when a changeset store is configured.
    fn step_changeset(&self, description: &str) -> Option<Changeset> {
        let changesets = self.runtime.changesets.as_ref()?;
        match changesets.create_changeset(description) {
            Ok(changeset) => Some(changeset),
            Err(err) => {
                warn!(error = %err, description, "step changeset failed");
                let content = format!("{description}: {err:#}");
                let report = NewReport {
                    execution_id: &self.execution_id,
                    agent_id: None,
                    kind: ReportKind::Warning,
                    title: "step changeset failed",
                    content: &content,
                    data: None,
                    severity: Some("warning"),
                };
                if let Err(err) = self.runtime.store.add_report(&report) {
                    warn!(error = %err, "failed to record warning report");
                }
                None
            }
        }
    }

    fn persist_node(&self, node: &Node) -> Result<()> {
        persist_node(&self.runtime.store, &self.execution_id, node)
    }

    /// Map the termination to a final status. The end reason always names
    /// what ended the loop; a recorded failure still fails the execution.
    fn terminate(&mut self, termination: &Termination) -> Result<RunOutcome> {
        let (status, error) = match termination {
            Termination::Quiescent
            | Termination::MaxIterations { .. }
            | Termination::BudgetExhausted { .. } => match &self.first_error {
                Some(error) => (ExecutionStatus::Failed, Some(error.clone())),
                None => (ExecutionStatus::Completed, None),
            },
            Termination::StopRequested => (ExecutionStatus::Cancelled, None),
            Termination::FrameStorm { reason } => (
                ExecutionStatus::Failed,
                Some(ConductorError::Execution(format!("frame storm: {reason}")).to_string()),
            ),
            Termination::GlobalTimeout { elapsed_ms, .. } => (
                ExecutionStatus::Failed,
                Some(
                    ConductorError::Timeout {
                        what: "execution".to_string(),
                        elapsed_ms: *elapsed_ms,
                    }
                    .to_string(),
                ),
            ),
        };
        if let Termination::BudgetExhausted { reason } = termination {
            info!(reason = %reason, "budget exhausted");
        }
        self.finish(status, termination.end_reason(), error)
    }

    fn finish(
        &mut self,
        status: ExecutionStatus,
        end_reason: &str,
        error: Option<String>,
    ) -> Result<RunOutcome> {
        let store = &self.runtime.store;
        let iterations = self.iteration + 1;
        store.record_iteration(&self.execution_id, iterations)?;
        store.finish_execution(&self.execution_id, status, end_reason, error.as_deref())?;

        let content = match &error {
            Some(error) => format!(
                "{} after {iterations} iteration(s) ({end_reason}): {error}",
                status.as_str()
            ),
            None => format!("{} after {iterations} iteration(s) ({end_reason})", status.as_str()),
        };
        let data = json!({
            "status": status.as_str(),
            "end_reason": end_reason,
            "iterations": iterations,
        });
        let kind = if status == ExecutionStatus::Failed {
            ReportKind::Error
        } else {
            ReportKind::Progress
        };
        store.add_report(&NewReport {
            execution_id: &self.execution_id,
            agent_id: None,
            kind,
            title: "execution finished",
            content: &content,
            data: Some(&data),
            severity: None,
        })?;
        info!(
            status = status.as_str(),
            end_reason,
            iterations,
            "execution finished"
        );
        Ok(RunOutcome {
            execution_id: self.execution_id.clone(),
            status,
            end_reason: end_reason.to_string(),
            iterations,
            error,
            tree: self.tree.clone(),
        })
    }
}

const ORPHAN_ERROR: &str = "orphaned by crash; execution resumed";

fn persist_node(store: &Store, execution_id: &str, node: &Node) -> Result<()> {
    persist_exec(store, execution_id, &node.id, &node.exec)
}

fn persist_exec(store: &Store, execution_id: &str, node_id: &str, exec: &ExecState) -> Result<()> {
    let value = serde_json::to_value(exec).context("serialize node state")?;
    store.set_state(
        &keys::node(execution_id, node_id),
        &value,
        &format!("node:{}", exec.status.as_str()),
    )?;
    Ok(())
}

fn persist_loop(store: &Store, key: &str, state: &LoopState, action: &str) -> Result<()> {
    let value = serde_json::to_value(state).context("serialize loop state")?;
    store.set_state(key, &value, action)?;
    Ok(())
}

/// Apply a worker result to the tree; returns the error text of a failure.
fn apply_completion(
    store: &Store,
    execution_id: &str,
    tree: &mut Node,
    completion: Completion,
) -> Result<Option<String>> {
    let Some(node) = tree.find_mut(&completion.node_id) else {
        return Ok(None);
    };
    match completion.result {
        Ok(result) => {
            node.exec.status = result.status;
            node.exec.result_summary = result.summary;
            node.exec.error_message = result.error;
            node.exec.agent_id = result.agent_id;
            node.exec.tokens_input = result.tokens_input;
            node.exec.tokens_output = result.tokens_output;
        }
        Err(err) => {
            node.exec.status = NodeStatus::Failed;
            node.exec.error_message = Some(format!("{err:#}"));
        }
    }
    node.exec.duration_ms = millis(completion.duration);
    persist_node(store, execution_id, node)?;
    debug!(
        node_id = %node.id,
        status = node.exec.status.as_str(),
        duration_ms = node.exec.duration_ms,
        "node finished"
    );
    if node.exec.status == NodeStatus::Failed {
        let error = node
            .exec
            .error_message
            .clone()
            .unwrap_or_else(|| format!("node {} failed", node.id));
        warn!(node_id = %node.id, error = %error, "node failed");
        return Ok(Some(error));
    }
    Ok(None)
}

/// Settledness of a unit's or loop's descendants (groups ignored).
///
/// Nested loops count as a single node: their bodies are settled by the loop.
fn unit_outcome(unit: &Node) -> UnitOutcome {
    let mut failed = None;
    let mut waiting = false;
    for child in &unit.children {
        collect_outcome(child, &mut failed, &mut waiting);
    }
    match (failed, waiting) {
        (Some(error), _) => UnitOutcome::Failed(error),
        (None, true) => UnitOutcome::Waiting,
        (None, false) => UnitOutcome::Completed,
    }
}

fn collect_outcome(node: &Node, failed: &mut Option<String>, waiting: &mut bool) {
    if node.kind() != NodeKind::Group {
        match node.exec.status {
            NodeStatus::Completed | NodeStatus::Skipped => {}
            NodeStatus::Failed => {
                if failed.is_none() {
                    *failed = Some(
                        node.exec
                            .error_message
                            .clone()
                            .unwrap_or_else(|| format!("node {} failed", node.id)),
                    );
                }
            }
            NodeStatus::Pending | NodeStatus::Running | NodeStatus::Cancelled => {
                *waiting = true;
            }
        }
    }
    if node.kind() == NodeKind::Loop {
        return;
    }
    for child in &node.children {
        collect_outcome(child, failed, waiting);
    }
}

/// Nothing in the subtree has started yet.
fn untouched(node: &Node) -> bool {
    node.exec.status == NodeStatus::Pending && node.children.iter().all(untouched)
}

fn mark_subtree(node: &mut Node, status: NodeStatus) {
    node.exec.status = status;
    for child in &mut node.children {
        mark_subtree(child, status);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;
    use crate::test_support::{
        FakeChangesets, ScriptedBackend, ScriptedReply, counting_tool, failing_tool, fixed_render,
    };

    fn runtime(dir: &std::path::Path) -> Runtime {
        let store = Store::open(dir).expect("store");
        Runtime::new(store, Arc::new(ScriptedBackend::new(Vec::new())))
    }

    fn config() -> ExecutionConfig {
        ExecutionConfig {
            human_poll_ms: 10,
            ..ExecutionConfig::default()
        }
    }

    fn recording_tool(log: &Arc<Mutex<Vec<String>>>) -> ToolFn {
        let log = Arc::clone(log);
        tool_fn(move |input: &Value| {
            let name = input.as_str().unwrap_or_default().to_string();
            log.lock().expect("log").push(name);
            Ok(input.clone())
        })
    }

    #[test]
    fn independent_nodes_run_once_then_quiesce() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tool, calls) = counting_tool();
        let runtime = Arc::new(runtime(dir.path()).with_tool("echo", tool));
        let tree = Node::group(vec![
            Node::tool("echo", json!("a")).with_key("a"),
            Node::tool("echo", json!("b")).with_key("b"),
        ]);
        let mut scheduler =
            Scheduler::start(Arc::clone(&runtime), Arc::new(fixed_render(tree)), config())
                .expect("start");

        let outcome = scheduler.run().expect("run");

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(outcome.end_reason, "quiescent");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let record = runtime
            .store()
            .get_execution(&outcome.execution_id)
            .expect("get")
            .expect("record");
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.total_tool_calls, 2);
        let reports = runtime.store().list_reports(&outcome.execution_id).expect("reports");
        assert!(reports.iter().any(|r| r.title == "execution finished"));
    }

    #[test]
    fn state_key_write_back_drives_the_next_render() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(Mutex::new(Vec::new()));
        let runtime = Arc::new(runtime(dir.path()).with_tool("record", recording_tool(&log)));
        let render = |ctx: &RenderContext<'_>| -> Result<Node> {
            let mut children = vec![
                Node::tool("record", json!("plan"))
                    .with_key("plan")
                    .with_prop("state_key", "plan"),
            ];
            if let Some(plan) = ctx.get("plan") {
                children.push(Node::tool("record", json!(format!("build {}", plan.as_str().unwrap_or("?")))).with_key("build"));
            }
            Ok(Node::group(children))
        };
        let mut scheduler =
            Scheduler::start(runtime, Arc::new(render), config()).expect("start");

        let outcome = scheduler.run().expect("run");

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(
            *log.lock().expect("log"),
            vec!["plan".to_string(), "build plan".to_string()]
        );
    }

    #[test]
    fn stop_flag_prevents_activation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tool, calls) = counting_tool();
        let runtime = Arc::new(runtime(dir.path()).with_tool("echo", tool));
        let tree = Node::tool("echo", json!(1));
        let mut scheduler =
            Scheduler::start(Arc::clone(&runtime), Arc::new(fixed_render(tree)), config())
                .expect("start");
        request_stop(runtime.store(), scheduler.execution_id()).expect("stop");

        let outcome = scheduler.run().expect("run");

        assert_eq!(outcome.status, ExecutionStatus::Cancelled);
        assert_eq!(outcome.end_reason, "stop_requested");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn max_iterations_completes_a_non_converging_workflow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tool, calls) = counting_tool();
        let runtime = Arc::new(runtime(dir.path()).with_tool("echo", tool));
        let render = |ctx: &RenderContext<'_>| -> Result<Node> {
            Ok(Node::tool("echo", json!(ctx.iteration)).with_key(format!("n{}", ctx.iteration)))
        };
        let config = ExecutionConfig {
            max_iterations: 3,
            ..config()
        };
        let mut scheduler = Scheduler::start(runtime, Arc::new(render), config).expect("start");

        let outcome = scheduler.run().expect("run");

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(outcome.end_reason, "max_iterations");
        assert_eq!(outcome.iterations, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn node_failure_fails_the_execution_at_quiescence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tool, calls) = counting_tool();
        let runtime = Arc::new(
            runtime(dir.path())
                .with_tool("boom", failing_tool("disk on fire"))
                .with_tool("echo", tool),
        );
        let tree = Node::group(vec![
            Node::tool("boom", Value::Null).with_key("bad"),
            Node::tool("echo", json!("ok")).with_key("good"),
        ]);
        let mut scheduler =
            Scheduler::start(runtime, Arc::new(fixed_render(tree)), config()).expect("start");

        let outcome = scheduler.run().expect("run");

        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.end_reason, "quiescent");
        assert!(outcome.error.as_deref().is_some_and(|e| e.contains("disk on fire")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_tool_fails_only_its_node() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(runtime(dir.path()));
        let tree = Node::tool("missing", Value::Null);
        let mut scheduler =
            Scheduler::start(runtime, Arc::new(fixed_render(tree)), config()).expect("start");

        let outcome = scheduler.run().expect("run");

        assert_eq!(outcome.status, ExecutionStatus::Failed);
        let tree = outcome.tree.expect("tree");
        assert_eq!(tree.exec.status, NodeStatus::Failed);
        assert!(
            tree.exec
                .error_message
                .as_deref()
                .is_some_and(|e| e.contains("unknown tool"))
        );
    }

    #[test]
    fn render_error_fails_the_execution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(runtime(dir.path()));
        let render = |_: &RenderContext<'_>| -> Result<Node> { Err(anyhow!("template exploded")) };
        let mut scheduler = Scheduler::start(runtime, Arc::new(render), config()).expect("start");

        let outcome = scheduler.run().expect("run");

        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.end_reason, "error");
        assert!(outcome.error.as_deref().is_some_and(|e| e.contains("template exploded")));
    }

    #[test]
    fn phases_run_in_declaration_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(Mutex::new(Vec::new()));
        let runtime = Arc::new(runtime(dir.path()).with_tool("record", recording_tool(&log)));
        let tree = Node::group(vec![
            Node::phase("design").with_child(Node::tool("record", json!("design"))),
            Node::phase("build")
                .with_child(Node::tool("record", json!("build-1")).with_key("1"))
                .with_child(Node::tool("record", json!("build-2")).with_key("2")),
            Node::phase("later").with_prop("skip", true).with_child(Node::tool("record", json!("never"))),
        ]);
        let mut scheduler =
            Scheduler::start(Arc::clone(&runtime), Arc::new(fixed_render(tree)), config())
                .expect("start");

        let outcome = scheduler.run().expect("run");

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        let log = log.lock().expect("log").clone();
        assert_eq!(log.first().map(String::as_str), Some("design"));
        assert_eq!(log.len(), 3);
        assert!(!log.contains(&"never".to_string()));
        let phases = runtime.store().list_phases(&outcome.execution_id).expect("phases");
        assert_eq!(
            phases.iter().map(|p| (p.name.as_str(), p.status)).collect::<Vec<_>>(),
            vec![("design", UnitStatus::Completed), ("build", UnitStatus::Completed)]
        );
    }

    #[test]
    fn failed_step_halts_its_siblings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tool, calls) = counting_tool();
        let runtime = Arc::new(
            runtime(dir.path())
                .with_tool("boom", failing_tool("lint failed"))
                .with_tool("echo", tool),
        );
        let tree = Node::phase("ship").with_children(vec![
            Node::step("lint").with_child(Node::tool("boom", Value::Null)),
            Node::step("deploy").with_child(Node::tool("echo", json!(1))),
        ]);
        let mut scheduler =
            Scheduler::start(Arc::clone(&runtime), Arc::new(fixed_render(tree)), config())
                .expect("start");

        let outcome = scheduler.run().expect("run");

        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let steps = runtime.store().list_steps(&outcome.execution_id).expect("steps");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, UnitStatus::Failed);
        assert!(steps[0].error.as_deref().is_some_and(|e| e.contains("lint failed")));
    }

    #[test]
    fn steps_record_before_and_after_changesets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let changesets = Arc::new(FakeChangesets::new());
        let (tool, _) = counting_tool();
        let runtime = Arc::new(
            runtime(dir.path())
                .with_tool("echo", tool)
                .with_changesets(changesets.clone(), &ToolDefaults::default()),
        );
        let tree = Node::step("edit").with_child(Node::tool("echo", json!(1)));
        let mut scheduler =
            Scheduler::start(Arc::clone(&runtime), Arc::new(fixed_render(tree)), config())
                .expect("start");

        let outcome = scheduler.run().expect("run");

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        let steps = runtime.store().list_steps(&outcome.execution_id).expect("steps");
        assert_eq!(steps.len(), 1);
        assert!(steps[0].snapshot_before.is_some());
        assert!(steps[0].snapshot_after.is_some());
        let commits = runtime.store().list_commits(&outcome.execution_id).expect("commits");
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].step_id.as_deref(), Some(steps[0].id.as_str()));
        assert!(
            changesets
                .created()
                .iter()
                .any(|changeset| changeset.description == "conductor step: after edit")
        );
    }

    #[test]
    fn human_response_completes_the_wait() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(runtime(dir.path()));
        let tree = Node::new("human")
            .with_prop("prompt", "ship it?")
            .with_prop("state_key", "approval");
        let mut scheduler =
            Scheduler::start(Arc::clone(&runtime), Arc::new(fixed_render(tree)), config())
                .expect("start");
        let execution_id = scheduler.execution_id().to_string();
        let store = runtime.store().clone();

        let responder = thread::spawn(move || {
            let prefix = keys::waiting_prefix(&execution_id);
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline {
                let waiting = store.state_with_prefix(&prefix).expect("waiting");
                if let Some((_, entry)) = waiting.into_iter().next() {
                    let node_id = entry["node_id"].as_str().expect("node id").to_string();
                    store
                        .set_state(
                            &keys::human(&execution_id, &node_id),
                            &json!({"approved": true, "comment": "lgtm"}),
                            "test",
                        )
                        .expect("respond");
                    return;
                }
                thread::sleep(Duration::from_millis(10));
            }
            panic!("human wait never appeared");
        });

        let outcome = scheduler.run().expect("run");
        responder.join().expect("responder");

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        let var = runtime
            .store()
            .get_state(&keys::var(&outcome.execution_id, "approval"))
            .expect("get");
        assert_eq!(var, Some(json!({"approved": true, "comment": "lgtm"})));
        let waiting = runtime
            .store()
            .state_with_prefix(&keys::waiting_prefix(&outcome.execution_id))
            .expect("waiting");
        assert!(waiting.is_empty());
    }

    #[test]
    fn agent_output_is_written_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path()).expect("store");
        let backend = Arc::new(ScriptedBackend::new(vec![ScriptedReply::Output(
            r#"{"tasks": 2}"#.to_string(),
        )]));
        let runtime = Arc::new(Runtime::new(store, backend));
        let tree = Node::agent("plan the work")
            .with_prop("schema", json!({"type": "object", "required": ["tasks"]}))
            .with_prop("state_key", "plan");
        let mut scheduler =
            Scheduler::start(Arc::clone(&runtime), Arc::new(fixed_render(tree)), config())
                .expect("start");

        let outcome = scheduler.run().expect("run");

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        let plan = runtime
            .store()
            .get_state(&keys::var(&outcome.execution_id, "plan"))
            .expect("get");
        assert_eq!(plan, Some(json!({"tasks": 2})));
        let record = runtime
            .store()
            .get_execution(&outcome.execution_id)
            .expect("get")
            .expect("record");
        assert_eq!(record.total_agents, 1);
        assert_eq!(record.total_tokens, 15);
    }

    #[test]
    fn subagent_runs_a_child_execution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tool, calls) = counting_tool();
        let runtime = Arc::new(
            runtime(dir.path())
                .with_tool("echo", tool)
                .with_workflow("child", fixed_render(Node::tool("echo", json!("inner")))),
        );
        let tree = Node::new("subagent")
            .with_prop("workflow", "child")
            .with_prop("state_key", "child");
        let mut scheduler =
            Scheduler::start(Arc::clone(&runtime), Arc::new(fixed_render(tree)), config())
                .expect("start");

        let outcome = scheduler.run().expect("run");

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let children = runtime
            .store()
            .list_child_executions(&outcome.execution_id)
            .expect("children");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].status, ExecutionStatus::Completed);
    }

    #[test]
    fn resume_skips_settled_nodes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tool, calls) = counting_tool();
        let runtime = Arc::new(runtime(dir.path()).with_tool("echo", tool));
        let tree = Node::group(vec![
            Node::tool("echo", json!("a")).with_key("a"),
            Node::tool("echo", json!("b")).with_key("b"),
        ]);

        let config_json = serde_json::to_value(config()).expect("config");
        let execution_id = runtime
            .store()
            .start_execution("workflow", None, &config_json, None)
            .expect("start");
        let mut settled = tree.clone();
        assign_ids(&mut settled).expect("ids");
        let first = &settled.children[0];
        let done = ExecState {
            status: NodeStatus::Completed,
            ..ExecState::default()
        };
        runtime
            .store()
            .set_state(
                &keys::node(&execution_id, &first.id),
                &serde_json::to_value(&done).expect("exec"),
                "test",
            )
            .expect("seed");

        let mut scheduler = Scheduler::resume(Arc::clone(&runtime), Arc::new(fixed_render(tree)), config())
            .expect("resume")
            .expect("incomplete execution");
        assert_eq!(scheduler.execution_id(), execution_id);

        let outcome = scheduler.run().expect("run");

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
