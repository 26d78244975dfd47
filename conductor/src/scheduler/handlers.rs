//! One handler per runnable node kind.
//!
//! Handlers run on scoped worker threads and return a [`NodeResult`]. An `Err`
//! marks only the node failed; the scheduler applies the result to the tree.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use super::{Runtime, Scheduler, keys, stop_flag_set};
use crate::agent::{AgentCall, CancelToken, StopReason, validate_call};
use crate::core::plan::{Node, NodeKind, NodeStatus};
use crate::core::stop::{StopConditions, millis};
use crate::core::types::{AgentStatus, ExecutionStatus, ToolCallStatus};
use crate::errors::ConductorError;
use crate::io::config::ExecutionConfig;
use crate::io::store::{
    AgentCompletion, NewAgent, NewReport, NewReview, NewToolCall, ReportKind,
};
use crate::transaction::{ToolContext, WrapOptions};

const SUMMARY_CHARS: usize = 200;

/// Borrowed view of the scheduler shared by every worker of one frame.
pub(crate) struct HandlerContext<'a> {
    pub runtime: &'a Arc<Runtime>,
    pub config: &'a ExecutionConfig,
    pub execution_id: &'a str,
    pub stop_sources: &'a [String],
    pub parent_cancel: Option<&'a CancelToken>,
    pub cancel: &'a CancelToken,
}

impl HandlerContext<'_> {
    pub fn stop_requested(&self) -> Result<bool> {
        stop_flag_set(&self.runtime.store, self.stop_sources, self.parent_cancel)
    }
}

/// What a handler reports back for its node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeResult {
    pub status: NodeStatus,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub agent_id: Option<String>,
    pub tokens_input: u64,
    pub tokens_output: u64,
}

impl NodeResult {
    fn completed(summary: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Completed,
            summary: Some(summary.into()),
            ..Self::default()
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Failed,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    fn cancelled() -> Self {
        Self {
            status: NodeStatus::Cancelled,
            error: Some("cancelled".to_string()),
            ..Self::default()
        }
    }
}

pub(crate) fn run_node(ctx: &HandlerContext<'_>, node: &Node) -> Result<NodeResult> {
    match node.kind() {
        NodeKind::Agent => run_agent(ctx, node),
        NodeKind::Tool => run_tool(ctx, node),
        NodeKind::HumanWait => run_human(ctx, node),
        NodeKind::Subagent => run_subagent(ctx, node),
        NodeKind::Phase | NodeKind::Step | NodeKind::Loop | NodeKind::Group => {
            Err(ConductorError::Validation(format!(
                "{} node {} is not runnable",
                node.node_type, node.id
            ))
            .into())
        }
    }
}

#[instrument(skip_all, fields(node_id = %node.id))]
fn run_agent(ctx: &HandlerContext<'_>, node: &Node) -> Result<NodeResult> {
    let prompt = required_prop(node, "prompt")?;
    let model = node
        .prop_str("model")
        .unwrap_or(&ctx.config.default_model)
        .to_string();
    let call = AgentCall {
        system_prompt: node.prop_str("system_prompt").map(str::to_string),
        allowed_tools: string_list(node, "allowed_tools"),
        permission_mode: node.prop_str("permission_mode").map(str::to_string),
        schema: node.prop("schema").cloned(),
        workdir: ctx
            .runtime
            .changesets
            .as_ref()
            .map(|changesets| changesets.workdir().to_path_buf()),
        stop: stop_conditions(node)?,
        backoff: ctx.config.backoff(),
        ..AgentCall::from_defaults(prompt, model.as_str(), &ctx.config.agent)
    };
    validate_call(&call).map_err(|err| ConductorError::Validation(format!("{err:#}")))?;

    let store = &ctx.runtime.store;
    let agent_id = store.start_agent(&NewAgent {
        execution_id: ctx.execution_id,
        node_id: &node.id,
        prompt,
        model: &model,
    })?;
    let result = ctx.runtime.agents.execute(&call, ctx.cancel);
    let status = match result.stop_reason {
        StopReason::Completed | StopReason::StopCondition => AgentStatus::Completed,
        StopReason::Cancelled => AgentStatus::Cancelled,
        StopReason::Error => AgentStatus::Failed,
    };
    store.finish_agent(
        &agent_id,
        &AgentCompletion {
            status,
            output: Some(result.output.clone()),
            structured: result.structured.clone(),
            tokens_input: result.tokens.input,
            tokens_output: result.tokens.output,
            turns_used: result.turns_used,
            stop_reason: Some(
                result
                    .stop_trigger
                    .clone()
                    .unwrap_or_else(|| result.stop_reason.as_str().to_string()),
            ),
            error: result.error.clone(),
        },
    )?;
    store.add_execution_totals(ctx.execution_id, 1, 0, result.tokens.total())?;
    debug!(
        stop_reason = result.stop_reason.as_str(),
        attempts = result.attempts,
        tokens = result.tokens.total(),
        "agent node finished"
    );

    if status == AgentStatus::Completed {
        let value = result
            .structured
            .clone()
            .unwrap_or_else(|| Value::String(result.output.clone()));
        write_back(ctx, node, &value)?;
        if let Some(target) = node.prop_str("review_target") {
            record_review(ctx, node, target, &model, &value)?;
        }
    }
    let node_status = match status {
        AgentStatus::Completed => NodeStatus::Completed,
        AgentStatus::Cancelled => NodeStatus::Cancelled,
        AgentStatus::Failed | AgentStatus::Running => NodeStatus::Failed,
    };
    Ok(NodeResult {
        status: node_status,
        summary: Some(summarize(&result.output)),
        error: result.error,
        agent_id: Some(agent_id),
        tokens_input: result.tokens.input,
        tokens_output: result.tokens.output,
    })
}

#[instrument(skip_all, fields(node_id = %node.id))]
fn run_tool(ctx: &HandlerContext<'_>, node: &Node) -> Result<NodeResult> {
    let tool = required_prop(node, "tool")?;
    let input = node.prop("input").cloned().unwrap_or(Value::Null);
    let func = ctx
        .runtime
        .tools
        .get(tool)
        .ok_or_else(|| ConductorError::Validation(format!("unknown tool '{tool}'")))?;
    let execute = {
        let func = Arc::clone(func);
        let input = input.clone();
        move || func(&input)
    };

    let Some(wrapper) = ctx.runtime.wrapper.as_ref() else {
        return run_tool_unwrapped(ctx, node, tool, &input, execute);
    };
    let options = WrapOptions {
        require_clean: node.prop("require_clean").and_then(Value::as_bool),
        timeout: node.prop_u64("timeout_ms").map(Duration::from_millis),
    };
    let tool_ctx = ToolContext {
        execution_id: Some(ctx.execution_id),
        agent_id: None,
        node_id: Some(&node.id),
    };
    let outcome = wrapper.wrap_tool(tool, &input, &tool_ctx, &options, execute)?;
    for warning in &outcome.warnings {
        report_warning(ctx, &format!("tool {tool}"), warning);
    }

    if outcome.success {
        let result = outcome.result.unwrap_or(Value::Null);
        write_back(ctx, node, &result)?;
        return Ok(NodeResult::completed(summarize(&result.to_string())));
    }
    let mut error = outcome
        .error
        .unwrap_or_else(|| format!("tool {tool} failed"));
    if let Some(rollback_error) = outcome.rollback_error {
        error = format!("{error}; {rollback_error}");
    } else if outcome.rolled_back {
        error.push_str(" (rolled back)");
    }
    Ok(NodeResult::failed(error))
}

fn run_tool_unwrapped<F>(
    ctx: &HandlerContext<'_>,
    node: &Node,
    tool: &str,
    input: &Value,
    execute: F,
) -> Result<NodeResult>
where
    F: FnOnce() -> Result<Value>,
{
    let store = &ctx.runtime.store;
    let call_id = store.start_tool_call(&NewToolCall {
        execution_id: ctx.execution_id,
        agent_id: None,
        node_id: Some(&node.id),
        tool_name: tool,
        input,
    })?;
    let result = execute();
    store.add_execution_totals(ctx.execution_id, 0, 1, 0)?;
    match result {
        Ok(value) => {
            store.finish_tool_call(&call_id, ToolCallStatus::Completed, Some(&value), None)?;
            write_back(ctx, node, &value)?;
            Ok(NodeResult::completed(summarize(&value.to_string())))
        }
        Err(err) => {
            let message = format!("{err:#}");
            store.finish_tool_call(&call_id, ToolCallStatus::Failed, None, Some(&message))?;
            Ok(NodeResult::failed(message))
        }
    }
}

/// Block until a response arrives, the execution stops, or `timeout_ms` elapses.
#[instrument(skip_all, fields(node_id = %node.id))]
fn run_human(ctx: &HandlerContext<'_>, node: &Node) -> Result<NodeResult> {
    let store = &ctx.runtime.store;
    let response_key = keys::human(ctx.execution_id, &node.id);
    let waiting_key = keys::waiting(ctx.execution_id, &node.id);
    store.set_state(
        &waiting_key,
        &json!({
            "node_id": node.id,
            "prompt": node.prop_str("prompt").unwrap_or_default(),
        }),
        "human_wait",
    )?;
    info!("waiting for human response");

    let poll = Duration::from_millis(ctx.config.human_poll_ms);
    let timeout = node.prop_u64("timeout_ms").map(Duration::from_millis);
    let started = Instant::now();
    let result = loop {
        if let Some(response) = store.get_state(&response_key)? {
            break human_response(ctx, node, &response);
        }
        if ctx.cancel.is_cancelled() || ctx.stop_requested()? {
            break Ok(NodeResult::cancelled());
        }
        if let Some(limit) = timeout
            && started.elapsed() >= limit
        {
            break Err(ConductorError::Timeout {
                what: format!("human response for {}", node.id),
                elapsed_ms: millis(started.elapsed()),
            }
            .into());
        }
        thread::sleep(poll);
    };
    store.delete_state(&waiting_key, "human_wait_finished")?;
    result
}

fn human_response(ctx: &HandlerContext<'_>, node: &Node, response: &Value) -> Result<NodeResult> {
    if response.get("approved").and_then(Value::as_bool) == Some(false) {
        let reason = response
            .get("comment")
            .and_then(Value::as_str)
            .unwrap_or("no reason given");
        info!(reason, "human rejected");
        return Ok(NodeResult::failed(format!("rejected by human: {reason}")));
    }
    write_back(ctx, node, response)?;
    Ok(NodeResult::completed(summarize(&response.to_string())))
}

/// Run a registered workflow as a child execution.
#[instrument(skip_all, fields(node_id = %node.id))]
fn run_subagent(ctx: &HandlerContext<'_>, node: &Node) -> Result<NodeResult> {
    let workflow = required_prop(node, "workflow")?;
    let render = ctx
        .runtime
        .workflows
        .get(workflow)
        .cloned()
        .ok_or_else(|| ConductorError::Validation(format!("unknown workflow '{workflow}'")))?;
    let mut config = ctx.config.clone();
    config.name = node.prop_str("name").unwrap_or(workflow).to_string();
    config.source = Some(format!("subagent:{}", node.id));
    if let Some(max) = node.prop_u64("max_iterations") {
        config.max_iterations = u32::try_from(max).unwrap_or(u32::MAX);
    }

    let mut child = Scheduler::start_child(
        Arc::clone(ctx.runtime),
        render,
        config,
        ctx.execution_id,
        ctx.stop_sources,
        ctx.cancel.clone(),
    )?;
    let outcome = child.run()?;
    let summary = format!(
        "child execution {} {} ({})",
        outcome.execution_id,
        outcome.status.as_str(),
        outcome.end_reason
    );
    info!(child = %outcome.execution_id, status = outcome.status.as_str(), "subagent finished");
    match outcome.status {
        ExecutionStatus::Completed => {
            write_back(
                ctx,
                node,
                &json!({
                    "execution_id": outcome.execution_id,
                    "status": outcome.status.as_str(),
                    "end_reason": outcome.end_reason,
                }),
            )?;
            Ok(NodeResult::completed(summary))
        }
        ExecutionStatus::Cancelled => Ok(NodeResult::cancelled()),
        ExecutionStatus::Failed | ExecutionStatus::Running => {
            Ok(NodeResult::failed(outcome.error.unwrap_or(summary)))
        }
    }
}

/// Commit `value` to the node's `state_key`, when it has one.
fn write_back(ctx: &HandlerContext<'_>, node: &Node, value: &Value) -> Result<()> {
    if let Some(name) = node.prop_str("state_key") {
        ctx.runtime.store.set_state(
            &keys::var(ctx.execution_id, name),
            value,
            &format!("node:{}", node.id),
        )?;
    }
    Ok(())
}

/// Store a reviewing agent's verdict (`{approved, summary, issues}`).
fn record_review(
    ctx: &HandlerContext<'_>,
    node: &Node,
    target: &str,
    model: &str,
    verdict: &Value,
) -> Result<()> {
    let Some(approved) = verdict.get("approved").and_then(Value::as_bool) else {
        report_warning(
            ctx,
            "review not recorded",
            &format!("review of {target} by node {} has no boolean 'approved'", node.id),
        );
        return Ok(());
    };
    let summary = verdict
        .get("summary")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let issues: Vec<String> = verdict
        .get("issues")
        .and_then(Value::as_array)
        .map(|issues| {
            issues
                .iter()
                .map(|issue| match issue {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    let reviewer = node.prop_str("reviewer").unwrap_or(model);
    let review_id = ctx.runtime.store.add_review(&NewReview {
        execution_id: ctx.execution_id,
        target,
        reviewer,
        approved,
        summary,
        issues: &issues,
    })?;
    info!(review_id = %review_id, target, approved, issues = issues.len(), "review recorded");
    Ok(())
}

fn report_warning(ctx: &HandlerContext<'_>, title: &str, warning: &str) {
    let report = NewReport {
        execution_id: ctx.execution_id,
        agent_id: None,
        kind: ReportKind::Warning,
        title,
        content: warning,
        data: None,
        severity: Some("warning"),
    };
    if let Err(err) = ctx.runtime.store.add_report(&report) {
        warn!(error = %err, "failed to record warning report");
    }
}

fn required_prop<'a>(node: &'a Node, name: &str) -> Result<&'a str> {
    node.prop_str(name).filter(|v| !v.trim().is_empty()).ok_or_else(|| {
        anyhow::Error::from(ConductorError::Validation(format!(
            "{} node {} requires a '{name}' prop",
            node.node_type, node.id
        )))
    })
}

fn string_list(node: &Node, name: &str) -> Vec<String> {
    node.prop(name)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn stop_conditions(node: &Node) -> Result<StopConditions> {
    let output_pattern = node
        .prop_str("stop_pattern")
        .map(Regex::new)
        .transpose()
        .map_err(|err| ConductorError::Validation(format!("invalid stop_pattern: {err}")))?;
    Ok(StopConditions {
        max_tokens: node.prop_u64("max_tokens"),
        max_duration: node.prop_u64("max_duration_ms").map(Duration::from_millis),
        max_turns: node
            .prop_u64("max_turns")
            .map(|turns| u32::try_from(turns).unwrap_or(u32::MAX)),
        output_pattern,
        predicate: None,
    })
}

fn summarize(text: &str) -> String {
    let mut summary: String = text.chars().take(SUMMARY_CHARS).collect();
    if text.chars().nth(SUMMARY_CHARS).is_some() {
        summary.push_str("...");
    }
    summary
}
