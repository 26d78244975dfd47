//! Agent executor: one logical agent call with retries, stop conditions and
//! output validation.
//!
//! Expected failures never surface as `Err`: [`AgentExecutor::execute`]
//! always returns an [`AgentResult`] whose [`StopReason`] says how it ended.
//!
//! Retry kinds:
//! - backend errors retry with exponential backoff, up to `max_retries`;
//! - schema failures send a corrective continuation that embeds the
//!   validation errors and the rejected output, up to `schema_retries`;
//! - caller-validator rejections retry as a continuation when enabled.

use std::fmt;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use jsonschema::{Validator, validator_for};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::backoff::Backoff;
use crate::core::stop::{PartialProgress, StopConditions, StopTrigger, millis};
use crate::errors::ConductorError;
use crate::io::agent_backend::{AgentBackend, AgentInvocation, AgentProgress};
use crate::io::config::AgentDefaults;

const SCHEMA_RETRY_TEMPLATE: &str = include_str!("prompts/schema_retry.md");
const VALIDATION_RETRY_TEMPLATE: &str = include_str!("prompts/validation_retry.md");
const CANCEL_POLL: Duration = Duration::from_millis(25);

/// Caller-supplied output check. `Err` carries the rejection reason.
pub type OutputValidator =
    Arc<dyn Fn(&str, Option<&Value>) -> std::result::Result<(), String> + Send + Sync>;

/// Box a closure as an [`OutputValidator`].
pub fn output_validator<F>(f: F) -> OutputValidator
where
    F: Fn(&str, Option<&Value>) -> std::result::Result<(), String> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Parameters for one logical agent call.
#[derive(Clone)]
pub struct AgentCall {
    pub prompt: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub permission_mode: Option<String>,
    pub workdir: Option<PathBuf>,
    pub stop: StopConditions,
    /// JSON Schema the final output must satisfy.
    pub schema: Option<Value>,
    pub validator: Option<OutputValidator>,
    /// Re-prompt on validator rejection instead of failing immediately.
    pub retry_on_validation_failure: bool,
    pub max_retries: u32,
    pub schema_retries: u32,
    pub backoff: Backoff,
    /// Per-attempt process timeout.
    pub timeout: Duration,
}

impl fmt::Debug for AgentCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentCall")
            .field("model", &self.model)
            .field("prompt_len", &self.prompt.len())
            .field("stop", &self.stop)
            .field("schema", &self.schema.is_some())
            .field("validator", &self.validator.is_some())
            .field("max_retries", &self.max_retries)
            .field("schema_retries", &self.schema_retries)
            .finish_non_exhaustive()
    }
}

impl AgentCall {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self::from_defaults(prompt, model, &AgentDefaults::default())
    }

    pub fn from_defaults(
        prompt: impl Into<String>,
        model: impl Into<String>,
        defaults: &AgentDefaults,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            system_prompt: None,
            allowed_tools: Vec::new(),
            permission_mode: None,
            workdir: None,
            stop: StopConditions::default(),
            schema: None,
            validator: None,
            retry_on_validation_failure: true,
            max_retries: defaults.max_retries,
            schema_retries: defaults.schema_retries,
            backoff: Backoff::new(
                Duration::from_millis(defaults.backoff_base_ms),
                Duration::from_millis(defaults.backoff_max_ms),
            ),
            timeout: Duration::from_secs(defaults.timeout_secs),
        }
    }
}

/// How an agent call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    StopCondition,
    Error,
    Cancelled,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::StopCondition => "stop_condition",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Outcome of [`AgentExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResult {
    pub output: String,
    pub structured: Option<Value>,
    pub tokens: TokenUsage,
    pub turns_used: u32,
    pub stop_reason: StopReason,
    /// Which stop condition fired, when `stop_reason` is `StopCondition`.
    pub stop_trigger: Option<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub session_id: Option<String>,
    /// Backend invocations made, including retries.
    pub attempts: u32,
}

impl AgentResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self.stop_reason,
            StopReason::Completed | StopReason::StopCondition
        )
    }
}

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Corrective prompt templates.
struct RetryPrompts {
    env: Environment<'static>,
}

impl RetryPrompts {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("schema_retry", SCHEMA_RETRY_TEMPLATE)
            .expect("schema retry template should be valid");
        env.add_template("validation_retry", VALIDATION_RETRY_TEMPLATE)
            .expect("validation retry template should be valid");
        Self { env }
    }

    fn schema_retry(&self, error: &str, previous_output: &str, schema: &Value) -> Result<String> {
        let schema = serde_json::to_string_pretty(schema)?;
        let rendered = self.env.get_template("schema_retry")?.render(context! {
            error => error,
            previous_output => previous_output.trim(),
            schema => schema,
        })?;
        Ok(rendered)
    }

    fn validation_retry(&self, error: &str, previous_output: &str) -> Result<String> {
        let rendered = self.env.get_template("validation_retry")?.render(context! {
            error => error,
            previous_output => previous_output.trim(),
        })?;
        Ok(rendered)
    }
}

/// Runs [`AgentCall`]s against a backend.
pub struct AgentExecutor {
    backend: Arc<dyn AgentBackend>,
    prompts: RetryPrompts,
}

/// Mutable bookkeeping across the attempts of one call.
struct Attempts {
    started: Instant,
    tokens: TokenUsage,
    turns: u32,
    session_id: Option<String>,
    count: u32,
}

impl Attempts {
    fn finish(
        &self,
        stop_reason: StopReason,
        output: String,
        structured: Option<Value>,
        error: Option<String>,
    ) -> AgentResult {
        AgentResult {
            output,
            structured,
            tokens: self.tokens,
            turns_used: self.turns,
            stop_reason,
            stop_trigger: None,
            duration_ms: millis(self.started.elapsed()),
            error,
            session_id: self.session_id.clone(),
            attempts: self.count,
        }
    }
}

enum Observed {
    Nothing,
    Cancelled,
    Stopped(StopTrigger),
}

impl AgentExecutor {
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        Self {
            backend,
            prompts: RetryPrompts::new(),
        }
    }

    /// Run `call` to a terminal [`AgentResult`].
    #[instrument(skip_all, fields(model = %call.model))]
    pub fn execute(&self, call: &AgentCall, cancel: &CancelToken) -> AgentResult {
        let mut state = Attempts {
            started: Instant::now(),
            tokens: TokenUsage::default(),
            turns: 0,
            session_id: None,
            count: 0,
        };

        let schema = match call.schema.as_ref().map(validator_for).transpose() {
            Ok(schema) => schema,
            Err(err) => {
                return state.finish(
                    StopReason::Error,
                    String::new(),
                    None,
                    Some(ConductorError::Validation(format!("invalid output schema: {err}")).to_string()),
                );
            }
        };

        let mut prompt = call.prompt.clone();
        let mut process_failures = 0u32;
        let mut schema_failures = 0u32;
        let mut validation_failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                info!("agent call cancelled before attempt");
                return state.finish(
                    StopReason::Cancelled,
                    String::new(),
                    None,
                    Some("cancelled".to_string()),
                );
            }
            state.count += 1;
            debug!(attempt = state.count, "invoking agent backend");

            let invocation = AgentInvocation {
                prompt: prompt.clone(),
                model: call.model.clone(),
                session_id: state.session_id.clone(),
                system_prompt: call.system_prompt.clone(),
                allowed_tools: call.allowed_tools.clone(),
                permission_mode: call.permission_mode.clone(),
                workdir: call.workdir.clone(),
                timeout: call.timeout,
            };
            let base_tokens = state.tokens.total();
            let base_turns = state.turns;
            let started = state.started;
            let mut observed = Observed::Nothing;
            let result = self.backend.run(&invocation, &mut |progress: &AgentProgress<'_>| {
                if cancel.is_cancelled() {
                    observed = Observed::Cancelled;
                    return ControlFlow::Break(());
                }
                let partial = PartialProgress {
                    output: progress.output,
                    tokens_used: base_tokens + progress.tokens_used,
                    turns_used: base_turns + progress.turns_used,
                    elapsed: started.elapsed(),
                };
                match call.stop.check(&partial) {
                    Some(trigger) => {
                        observed = Observed::Stopped(trigger);
                        ControlFlow::Break(())
                    }
                    None => ControlFlow::Continue(()),
                }
            });

            let out = match result {
                Ok(out) => out,
                Err(err) => {
                    let message = format!("{err:#}");
                    if process_failures >= call.max_retries {
                        warn!(attempts = state.count, error = %message, "agent retries exhausted");
                        return state.finish(StopReason::Error, String::new(), None, Some(message));
                    }
                    let delay = call.backoff.delay(process_failures);
                    process_failures += 1;
                    warn!(
                        attempt = state.count,
                        delay_ms = millis(delay),
                        error = %message,
                        "agent backend failed, retrying"
                    );
                    if !sleep_unless_cancelled(delay, cancel) {
                        return state.finish(
                            StopReason::Cancelled,
                            String::new(),
                            None,
                            Some("cancelled".to_string()),
                        );
                    }
                    continue;
                }
            };

            state.tokens.input += out.tokens_input;
            state.tokens.output += out.tokens_output;
            state.turns += out.turns_used;
            if out.session_id.is_some() {
                state.session_id = out.session_id.clone();
            }

            match observed {
                Observed::Cancelled => {
                    return state.finish(
                        StopReason::Cancelled,
                        out.output,
                        None,
                        Some("cancelled".to_string()),
                    );
                }
                Observed::Stopped(trigger) => {
                    info!(%trigger, "stop condition fired");
                    let structured = extract_json(&out.output);
                    let mut result =
                        state.finish(StopReason::StopCondition, out.output, structured, None);
                    result.stop_trigger = Some(trigger.to_string());
                    return result;
                }
                Observed::Nothing => {}
            }

            let structured = match (&schema, &call.schema) {
                (Some(validator), Some(raw_schema)) => {
                    match check_schema(validator, &out.output) {
                        Ok(value) => Some(value),
                        Err(message) => {
                            if schema_failures >= call.schema_retries {
                                warn!(error = %message, "schema retries exhausted");
                                return state.finish(
                                    StopReason::Error,
                                    out.output,
                                    None,
                                    Some(ConductorError::Validation(message).to_string()),
                                );
                            }
                            schema_failures += 1;
                            debug!(schema_failures, "sending corrective schema prompt");
                            prompt = match self.prompts.schema_retry(&message, &out.output, raw_schema)
                            {
                                Ok(p) => p,
                                Err(err) => {
                                    return state.finish(
                                        StopReason::Error,
                                        out.output,
                                        None,
                                        Some(format!("render schema retry prompt: {err:#}")),
                                    );
                                }
                            };
                            continue;
                        }
                    }
                }
                _ => extract_json(&out.output),
            };

            if let Some(validator) = &call.validator
                && let Err(reason) = validator(&out.output, structured.as_ref())
            {
                if call.retry_on_validation_failure && validation_failures < call.max_retries {
                    validation_failures += 1;
                    debug!(validation_failures, reason = %reason, "validator rejected output, retrying");
                    prompt = match self.prompts.validation_retry(&reason, &out.output) {
                        Ok(p) => p,
                        Err(err) => {
                            return state.finish(
                                StopReason::Error,
                                out.output,
                                structured,
                                Some(format!("render validation retry prompt: {err:#}")),
                            );
                        }
                    };
                    continue;
                }
                warn!(reason = %reason, "validator rejected output");
                return state.finish(
                    StopReason::Error,
                    out.output,
                    structured,
                    Some(ConductorError::Validation(reason).to_string()),
                );
            }

            debug!(attempts = state.count, "agent call completed");
            return state.finish(StopReason::Completed, out.output, structured, None);
        }
    }
}

/// Validate the JSON in `output` against `validator`; `Err` joins every error.
fn check_schema(validator: &Validator, output: &str) -> std::result::Result<Value, String> {
    let value = extract_json(output).ok_or_else(|| "output is not valid JSON".to_string())?;
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        Ok(value)
    } else {
        Err(messages.join("; "))
    }
}

/// Find the JSON payload in agent output: the whole text, a fenced block, or
/// the outermost object/array span.
pub fn extract_json(text: &str) -> Option<Value> {
    static FENCE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)```(?:json)?[ \t]*\n(.*?)```").expect("fence pattern should be valid")
    });

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    for caps in FENCE.captures_iter(trimmed) {
        if let Some(body) = caps.get(1)
            && let Ok(value) = serde_json::from_str(body.as_str().trim())
        {
            return Some(value);
        }
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close))
            && start < end
            && let Ok(value) = serde_json::from_str(&trimmed[start..=end])
        {
            return Some(value);
        }
    }
    None
}

/// Sleep for `delay`; false when cancelled first.
fn sleep_unless_cancelled(delay: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

/// Fail fast when a call is misconfigured.
pub fn validate_call(call: &AgentCall) -> Result<()> {
    if call.prompt.trim().is_empty() {
        return Err(anyhow!("agent prompt must be non-empty"));
    }
    if call.model.trim().is_empty() {
        return Err(anyhow!("agent model must be non-empty"));
    }
    if call.timeout.is_zero() {
        return Err(anyhow!("agent timeout must be > 0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stop::stop_predicate;
    use crate::test_support::{ScriptedBackend, ScriptedReply};
    use serde_json::json;

    fn fast_call(prompt: &str) -> AgentCall {
        AgentCall {
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(4)),
            ..AgentCall::new(prompt, "test-model")
        }
    }

    fn executor(replies: Vec<ScriptedReply>) -> (Arc<ScriptedBackend>, AgentExecutor) {
        let backend = Arc::new(ScriptedBackend::new(replies));
        let executor = AgentExecutor::new(backend.clone());
        (backend, executor)
    }

    #[test]
    fn plain_call_completes() {
        let (backend, exec) = executor(vec![ScriptedReply::Output("hello".to_string())]);
        let result = exec.execute(&fast_call("say hi"), &CancelToken::new());
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.output, "hello");
        assert_eq!(result.attempts, 1);
        assert!(result.tokens.total() > 0);
        assert_eq!(backend.prompts(), vec!["say hi"]);
    }

    #[test]
    fn backend_errors_retry_then_succeed() {
        let (_backend, exec) = executor(vec![
            ScriptedReply::Fail("spawn failed".to_string()),
            ScriptedReply::Fail("spawn failed".to_string()),
            ScriptedReply::Output("ok".to_string()),
        ]);
        let result = exec.execute(&fast_call("p"), &CancelToken::new());
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.attempts, 3);
    }

    #[test]
    fn backend_errors_exhaust_retries() {
        let call = AgentCall {
            max_retries: 1,
            ..fast_call("p")
        };
        let (_backend, exec) = executor(vec![
            ScriptedReply::Fail("first".to_string()),
            ScriptedReply::Fail("second".to_string()),
            ScriptedReply::Output("unreached".to_string()),
        ]);
        let result = exec.execute(&call, &CancelToken::new());
        assert_eq!(result.stop_reason, StopReason::Error);
        assert_eq!(result.attempts, 2);
        assert!(result.error.expect("error").contains("second"));
    }

    /// The corrective prompt embeds the validation error and the rejected output.
    #[test]
    fn schema_failure_sends_corrective_continuation() {
        let call = AgentCall {
            schema: Some(json!({
                "type": "object",
                "required": ["answer"],
                "properties": {"answer": {"type": "integer"}}
            })),
            ..fast_call("compute")
        };
        let (backend, exec) = executor(vec![
            ScriptedReply::Output(r#"{"answer": "forty-two"}"#.to_string()),
            ScriptedReply::Output("```json\n{\"answer\": 42}\n```".to_string()),
        ]);
        let result = exec.execute(&call, &CancelToken::new());
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.structured, Some(json!({"answer": 42})));

        let invocations = backend.invocations();
        assert_eq!(invocations.len(), 2);
        let corrective = &invocations[1];
        assert!(corrective.prompt.contains("forty-two"));
        assert!(corrective.prompt.contains("is not of type"));
        assert_eq!(invocations[0].session_id, None);
        assert!(corrective.session_id.is_some());
    }

    #[test]
    fn schema_retries_exhaust_with_last_error() {
        let call = AgentCall {
            schema: Some(json!({"type": "object", "required": ["answer"]})),
            schema_retries: 1,
            ..fast_call("compute")
        };
        let (backend, exec) = executor(vec![
            ScriptedReply::Output("not json".to_string()),
            ScriptedReply::Output(r#"{"other": 1}"#.to_string()),
        ]);
        let result = exec.execute(&call, &CancelToken::new());
        assert_eq!(result.stop_reason, StopReason::Error);
        let error = result.error.expect("error");
        assert!(error.contains("answer"), "error was {error}");
        assert_eq!(backend.invocations().len(), 2);
    }

    #[test]
    fn validator_rejection_retries_as_continuation() {
        let call = AgentCall {
            validator: Some(output_validator(|output, _| {
                if output.contains("DONE") {
                    Ok(())
                } else {
                    Err("missing DONE marker".to_string())
                }
            })),
            ..fast_call("work")
        };
        let (backend, exec) = executor(vec![
            ScriptedReply::Output("partial".to_string()),
            ScriptedReply::Output("all DONE".to_string()),
        ]);
        let result = exec.execute(&call, &CancelToken::new());
        assert_eq!(result.stop_reason, StopReason::Completed);
        let invocations = backend.invocations();
        assert!(invocations[1].prompt.contains("missing DONE marker"));
        assert!(invocations[1].session_id.is_some());
    }

    #[test]
    fn validator_rejection_without_retry_fails() {
        let call = AgentCall {
            validator: Some(output_validator(|_, _| Err("never good".to_string()))),
            retry_on_validation_failure: false,
            ..fast_call("work")
        };
        let (_backend, exec) = executor(vec![ScriptedReply::Output("x".to_string())]);
        let result = exec.execute(&call, &CancelToken::new());
        assert_eq!(result.stop_reason, StopReason::Error);
        assert!(result.error.expect("error").contains("never good"));
    }

    #[test]
    fn token_limit_stops_stream() {
        let call = AgentCall {
            stop: StopConditions {
                max_tokens: Some(25),
                ..StopConditions::default()
            },
            ..fast_call("long")
        };
        let (backend, exec) = executor(vec![ScriptedReply::Stream {
            chunks: vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()],
            tokens_per_chunk: 10,
        }]);
        let result = exec.execute(&call, &CancelToken::new());
        assert_eq!(result.stop_reason, StopReason::StopCondition);
        assert!(result.stop_trigger.expect("trigger").contains("token limit"));
        assert_eq!(backend.chunks_delivered(), 3);
    }

    #[test]
    fn pattern_and_custom_predicates_stop() {
        let call = AgentCall {
            stop: StopConditions {
                output_pattern: Some(Regex::new("FATAL").expect("regex")),
                ..StopConditions::default()
            },
            ..fast_call("p")
        };
        let (_b, exec) = executor(vec![ScriptedReply::Stream {
            chunks: vec!["ok".into(), "FATAL: boom".into(), "more".into()],
            tokens_per_chunk: 1,
        }]);
        let result = exec.execute(&call, &CancelToken::new());
        assert_eq!(result.stop_reason, StopReason::StopCondition);

        let call = AgentCall {
            stop: StopConditions {
                predicate: Some(stop_predicate(|p| p.turns_used >= 2)),
                ..StopConditions::default()
            },
            ..fast_call("p")
        };
        let (backend, exec) = executor(vec![ScriptedReply::Stream {
            chunks: vec!["1".into(), "2".into(), "3".into()],
            tokens_per_chunk: 1,
        }]);
        let result = exec.execute(&call, &CancelToken::new());
        assert_eq!(result.stop_reason, StopReason::StopCondition);
        assert_eq!(backend.chunks_delivered(), 2);
    }

    #[test]
    fn cancelled_token_short_circuits() {
        let (backend, exec) = executor(vec![ScriptedReply::Output("x".to_string())]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = exec.execute(&fast_call("p"), &cancel);
        assert_eq!(result.stop_reason, StopReason::Cancelled);
        assert!(backend.invocations().is_empty());
    }

    #[test]
    fn cancel_during_run_kills_attempt() {
        let (_backend, exec) = executor(vec![ScriptedReply::Hang(Duration::from_secs(10))]);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let started = Instant::now();
        let result = exec.execute(&fast_call("p"), &cancel);
        handle.join().expect("join");
        assert_eq!(result.stop_reason, StopReason::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn invalid_schema_is_an_error_result() {
        let call = AgentCall {
            schema: Some(json!({"type": 12})),
            ..fast_call("p")
        };
        let (backend, exec) = executor(vec![]);
        let result = exec.execute(&call, &CancelToken::new());
        assert_eq!(result.stop_reason, StopReason::Error);
        assert!(backend.invocations().is_empty());
    }

    #[test]
    fn extract_json_handles_common_shapes() {
        assert_eq!(extract_json(r#"{"a":1}"#), Some(json!({"a": 1})));
        assert_eq!(
            extract_json("Here you go:\n```json\n{\"a\": 2}\n```\nthanks"),
            Some(json!({"a": 2}))
        );
        assert_eq!(
            extract_json("result: {\"a\": {\"b\": 3}} end"),
            Some(json!({"a": {"b": 3}}))
        );
        assert_eq!(extract_json("[1, 2]"), Some(json!([1, 2])));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn validate_call_rejects_empty_prompt() {
        assert!(validate_call(&AgentCall::new(" ", "m")).is_err());
        assert!(validate_call(&AgentCall::new("p", "m")).is_ok());
    }
}
