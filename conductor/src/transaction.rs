//! Transactional tool wrapper.
//!
//! Mutating tools run between a before and an after snapshot of the working
//! copy. A failed tool restores the before snapshot. Read-only tools bypass the
//! snapshot machinery entirely.
//!
//! Tool timeouts are a race: the tool runs on a worker thread and the caller
//! stops waiting when the limit elapses. The worker is not killed, so a timed
//! out tool may still finish its side effect after the rollback. Callers must
//! treat timed-out tools as at-least-once.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::cleanup::{CleanupCandidate, RetentionRules, select_for_cleanup};
use crate::core::stop::millis;
use crate::core::types::ToolCallStatus;
use crate::errors::ConductorError;
use crate::io::config::{DEFAULT_READ_ONLY_TOOLS, ToolDefaults};
use crate::io::repo_state::RepoStateTracker;
use crate::io::store::{NewToolCall, Store};
use crate::io::vcs::{Changeset, ChangesetStore};

/// Description prefix of every snapshot the wrapper creates.
pub const SNAPSHOT_PREFIX: &str = "conductor snapshot:";

const DEFAULT_CLEANUP_SCAN: usize = 1000;

/// Registry of per-working-directory mutexes.
///
/// Share one registry between wrappers that may touch the same directory.
#[derive(Debug, Default)]
pub struct WorkdirLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl WorkdirLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, workdir: &Path) -> Result<Arc<Mutex<()>>> {
        let key = workdir
            .canonicalize()
            .unwrap_or_else(|_| workdir.to_path_buf());
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| anyhow!("workdir lock registry poisoned"))?;
        Ok(Arc::clone(locks.entry(key).or_default()))
    }
}

/// Record-keeping context for a wrapped call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolContext<'a> {
    pub execution_id: Option<&'a str>,
    pub agent_id: Option<&'a str>,
    pub node_id: Option<&'a str>,
}

/// Per-call overrides of the wrapper defaults.
#[derive(Debug, Clone, Default)]
pub struct WrapOptions {
    pub require_clean: Option<bool>,
    pub timeout: Option<Duration>,
}

/// Result of one wrapped call. Expected failures land here, not in `Err`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutcome {
    pub tool: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub snapshot_before: Option<Changeset>,
    pub snapshot_after: Option<Changeset>,
    pub rolled_back: bool,
    pub rollback_error: Option<String>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    pub tool_call_id: Option<String>,
}

impl ToolOutcome {
    fn new(tool: &str) -> Self {
        Self {
            tool: tool.to_string(),
            success: false,
            result: None,
            error: None,
            snapshot_before: None,
            snapshot_after: None,
            rolled_back: false,
            rollback_error: None,
            warnings: Vec::new(),
            duration_ms: 0,
            tool_call_id: None,
        }
    }
}

/// Running counters. Only [`ToolWrapper::reset_metrics`] clears them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub snapshots_created: u64,
    pub rollbacks: u64,
    pub rollback_failures: u64,
    pub per_tool: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    pub rules: RetentionRules,
    pub dry_run: bool,
    /// How many recent changesets to scan (default 1000).
    pub scan_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    /// Snapshots the rules selected, oldest first.
    pub selected: Vec<String>,
    pub abandoned: Vec<String>,
    /// `(id, error)` for abandons that failed.
    pub failed: Vec<(String, String)>,
}

/// Wraps tool executions with snapshot, rollback and bookkeeping.
pub struct ToolWrapper {
    changesets: Arc<dyn ChangesetStore>,
    repo: RepoStateTracker,
    locks: Arc<WorkdirLocks>,
    read_only: BTreeSet<String>,
    require_clean: bool,
    timeout: Option<Duration>,
    metrics: Mutex<ToolMetrics>,
    store: Option<Store>,
}

impl ToolWrapper {
    pub fn new(changesets: Arc<dyn ChangesetStore>) -> Self {
        Self {
            repo: RepoStateTracker::new(Arc::clone(&changesets)),
            changesets,
            locks: Arc::new(WorkdirLocks::new()),
            read_only: DEFAULT_READ_ONLY_TOOLS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            require_clean: false,
            timeout: None,
            metrics: Mutex::new(ToolMetrics::default()),
            store: None,
        }
    }

    pub fn from_config(changesets: Arc<dyn ChangesetStore>, defaults: &ToolDefaults) -> Self {
        Self {
            read_only: defaults.read_only.iter().cloned().collect(),
            require_clean: defaults.require_clean,
            timeout: defaults.timeout_ms.map(Duration::from_millis),
            ..Self::new(changesets)
        }
    }

    /// Record tool calls and snapshots in `store` when a context names an execution.
    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_locks(mut self, locks: Arc<WorkdirLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_read_only<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read_only = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_read_only(&self, tool: &str) -> bool {
        self.read_only.contains(tool)
    }

    pub fn changesets(&self) -> &Arc<dyn ChangesetStore> {
        &self.changesets
    }

    /// Cached working-copy state used for clean checks.
    pub fn repo_state(&self) -> &RepoStateTracker {
        &self.repo
    }

    /// Run `execute` transactionally.
    ///
    /// Returns `Err` only when the call could not start safely: the working
    /// copy was required clean and was not ([`ConductorError::RepositoryNotClean`]),
    /// or the before snapshot failed ([`ConductorError::Snapshot`]). Every other
    /// failure is reported in the [`ToolOutcome`].
    #[instrument(skip_all, fields(tool))]
    pub fn wrap_tool<F>(
        &self,
        tool: &str,
        input: &Value,
        ctx: &ToolContext<'_>,
        options: &WrapOptions,
        execute: F,
    ) -> Result<ToolOutcome>
    where
        F: FnOnce() -> Result<Value> + Send + 'static,
    {
        let started = Instant::now();
        let mut outcome = ToolOutcome::new(tool);
        {
            let mut metrics = self.lock_metrics()?;
            metrics.total_calls += 1;
            *metrics.per_tool.entry(tool.to_string()).or_default() += 1;
        }
        outcome.tool_call_id = self.record_start(tool, input, ctx, &mut outcome.warnings);
        let timeout = options.timeout.or(self.timeout);

        if self.is_read_only(tool) {
            debug!("read-only tool, skipping snapshots");
            match run_raced(tool, timeout, execute) {
                Ok(value) => {
                    outcome.success = true;
                    outcome.result = Some(value);
                }
                Err(err) => outcome.error = Some(format!("{err:#}")),
            }
            return self.finish(outcome, started, ctx);
        }

        let lock = self.locks.lock_for(self.changesets.workdir())?;
        let _guard = lock
            .lock()
            .map_err(|_| anyhow!("workdir lock poisoned"))?;

        if options.require_clean.unwrap_or(self.require_clean) {
            let state = self
                .repo
                .state()
                .context("check working copy before tool")?;
            if !state.is_clean() {
                let paths = state.delta.paths();
                warn!(pending = paths.len(), "working copy not clean, refusing tool");
                outcome.error = Some(format!("repository not clean: {}", paths.join(", ")));
                self.finish(outcome, started, ctx)?;
                return Err(ConductorError::RepositoryNotClean { paths }.into());
            }
        }

        let before = match self
            .changesets
            .create_changeset(&format!("{SNAPSHOT_PREFIX} before {tool}"))
        {
            Ok(changeset) => changeset,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = %message, "before snapshot failed, tool not executed");
                outcome.error = Some(format!("before snapshot failed: {message}"));
                self.finish(outcome, started, ctx)?;
                return Err(ConductorError::Snapshot {
                    operation: "create".to_string(),
                    message,
                }
                .into());
            }
        };
        self.lock_metrics()?.snapshots_created += 1;
        self.record_snapshot(&before, ctx, outcome.tool_call_id.as_deref(), &mut outcome.warnings);
        outcome.snapshot_before = Some(before);

        match run_raced(tool, timeout, execute) {
            Ok(value) => {
                outcome.success = true;
                outcome.result = Some(value);
                match self
                    .changesets
                    .create_changeset(&format!("{SNAPSHOT_PREFIX} after {tool}"))
                {
                    Ok(after) => {
                        self.lock_metrics()?.snapshots_created += 1;
                        self.record_snapshot(
                            &after,
                            ctx,
                            outcome.tool_call_id.as_deref(),
                            &mut outcome.warnings,
                        );
                        outcome.snapshot_after = Some(after);
                    }
                    Err(err) => {
                        warn!(error = %err, "after snapshot failed");
                        outcome
                            .warnings
                            .push(format!("after snapshot failed: {err:#}"));
                    }
                }
            }
            Err(err) => {
                outcome.error = Some(format!("{err:#}"));
                let before_id = outcome
                    .snapshot_before
                    .as_ref()
                    .map(|cs| cs.id.clone())
                    .unwrap_or_default();
                info!(snapshot = %before_id, "tool failed, rolling back");
                match self.changesets.restore(&before_id) {
                    Ok(()) => {
                        outcome.rolled_back = true;
                        self.lock_metrics()?.rollbacks += 1;
                    }
                    Err(rollback_err) => {
                        warn!(error = %rollback_err, "rollback failed");
                        outcome.rollback_error = Some(
                            ConductorError::Snapshot {
                                operation: "restore".to_string(),
                                message: format!("{rollback_err:#}"),
                            }
                            .to_string(),
                        );
                        self.lock_metrics()?.rollback_failures += 1;
                    }
                }
            }
        }
        self.repo.invalidate();

        self.finish(outcome, started, ctx)
    }

    /// Abandon wrapper snapshots selected by `options.rules` (union of rules).
    #[instrument(skip_all, fields(dry_run = options.dry_run))]
    pub fn cleanup(&self, options: &CleanupOptions) -> Result<CleanupReport> {
        let mut report = CleanupReport {
            dry_run: options.dry_run,
            ..CleanupReport::default()
        };
        if options.rules.is_noop() {
            return Ok(report);
        }

        let limit = options.scan_limit.unwrap_or(DEFAULT_CLEANUP_SCAN);
        let candidates: Vec<CleanupCandidate> = self
            .changesets
            .list_changesets(limit)
            .context("list changesets for cleanup")?
            .into_iter()
            .filter(|cs| cs.description.starts_with(SNAPSHOT_PREFIX))
            .filter_map(|cs| match cs.created_at() {
                Ok(created_at) => Some(CleanupCandidate {
                    id: cs.id,
                    created_at,
                    is_empty: cs.is_empty,
                }),
                Err(err) => {
                    warn!(id = %cs.id, error = %err, "skipping snapshot with bad timestamp");
                    None
                }
            })
            .collect();

        report.selected = select_for_cleanup(&candidates, &options.rules, Utc::now());
        debug!(
            candidates = candidates.len(),
            selected = report.selected.len(),
            "cleanup selection"
        );
        if options.dry_run {
            return Ok(report);
        }

        let lock = self.locks.lock_for(self.changesets.workdir())?;
        let _guard = lock
            .lock()
            .map_err(|_| anyhow!("workdir lock poisoned"))?;
        for id in &report.selected {
            match self.changesets.abandon_changeset(id) {
                Ok(()) => report.abandoned.push(id.clone()),
                Err(err) => {
                    warn!(id = %id, error = %err, "abandon failed");
                    report.failed.push((id.clone(), format!("{err:#}")));
                }
            }
        }
        info!(
            abandoned = report.abandoned.len(),
            failed = report.failed.len(),
            "snapshot cleanup finished"
        );
        Ok(report)
    }

    pub fn metrics(&self) -> ToolMetrics {
        self.metrics
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn reset_metrics(&self) {
        if let Ok(mut metrics) = self.metrics.lock() {
            *metrics = ToolMetrics::default();
        }
    }

    fn lock_metrics(&self) -> Result<MutexGuard<'_, ToolMetrics>> {
        self.metrics
            .lock()
            .map_err(|_| anyhow!("tool metrics lock poisoned"))
    }

    fn finish(
        &self,
        mut outcome: ToolOutcome,
        started: Instant,
        ctx: &ToolContext<'_>,
    ) -> Result<ToolOutcome> {
        outcome.duration_ms = millis(started.elapsed());
        {
            let mut metrics = self.lock_metrics()?;
            if outcome.success {
                metrics.successful_calls += 1;
            } else {
                metrics.failed_calls += 1;
            }
        }
        if let (Some(store), Some(id)) = (&self.store, outcome.tool_call_id.as_deref()) {
            let status = if outcome.success {
                ToolCallStatus::Completed
            } else {
                ToolCallStatus::Failed
            };
            if let Err(err) =
                store.finish_tool_call(id, status, outcome.result.as_ref(), outcome.error.as_deref())
            {
                warn!(error = %err, "failed to record tool call result");
                outcome
                    .warnings
                    .push(format!("record tool call result: {err:#}"));
            }
            if let Some(execution_id) = ctx.execution_id
                && let Err(err) = store.add_execution_totals(execution_id, 0, 1, 0)
            {
                outcome
                    .warnings
                    .push(format!("record tool call total: {err:#}"));
            }
        }
        debug!(
            success = outcome.success,
            rolled_back = outcome.rolled_back,
            duration_ms = outcome.duration_ms,
            "tool finished"
        );
        Ok(outcome)
    }

    fn record_start(
        &self,
        tool: &str,
        input: &Value,
        ctx: &ToolContext<'_>,
        warnings: &mut Vec<String>,
    ) -> Option<String> {
        let store = self.store.as_ref()?;
        let execution_id = ctx.execution_id?;
        match store.start_tool_call(&NewToolCall {
            execution_id,
            agent_id: ctx.agent_id,
            node_id: ctx.node_id,
            tool_name: tool,
            input,
        }) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(error = %err, "failed to record tool call");
                warnings.push(format!("record tool call: {err:#}"));
                None
            }
        }
    }

    fn record_snapshot(
        &self,
        changeset: &Changeset,
        ctx: &ToolContext<'_>,
        tool_call_id: Option<&str>,
        warnings: &mut Vec<String>,
    ) {
        let (Some(store), Some(execution_id)) = (&self.store, ctx.execution_id) else {
            return;
        };
        let delta = match self.changesets.show_file_delta(&changeset.id) {
            Ok(delta) => delta,
            Err(err) => {
                warnings.push(format!("read snapshot delta: {err:#}"));
                Default::default()
            }
        };
        if let Err(err) = store.record_snapshot(execution_id, tool_call_id, changeset, &delta) {
            warnings.push(format!("record snapshot: {err:#}"));
        }
    }
}

/// Run `execute`, giving up after `timeout` when one is set.
fn run_raced<F>(tool: &str, timeout: Option<Duration>, execute: F) -> Result<Value>
where
    F: FnOnce() -> Result<Value> + Send + 'static,
{
    let Some(limit) = timeout else {
        return execute();
    };
    let started = Instant::now();
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("tool-{tool}"))
        .spawn(move || {
            let _ = tx.send(execute());
        })
        .context("spawn tool worker")?;
    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            warn!(tool, limit_ms = millis(limit), "tool timed out; worker left running");
            Err(ConductorError::Timeout {
                what: format!("tool {tool}"),
                elapsed_ms: millis(started.elapsed()),
            }
            .into())
        }
        Err(RecvTimeoutError::Disconnected) => {
            Err(anyhow!("tool {tool} worker exited without a result"))
        }
    }
}
