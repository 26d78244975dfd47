//! Agent backend abstraction.
//!
//! The [`AgentBackend`] trait decouples the agent executor from the process
//! that actually talks to a model. [`CliAgentBackend`] drives an agent CLI in
//! stream-JSON mode; tests use scripted backends that return canned outputs
//! without spawning processes.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::stop::millis;
use crate::errors::ConductorError;
use crate::io::config::AgentDefaults;
use crate::io::process::run_command_streaming;

/// Parameters for one backend invocation.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub prompt: String,
    pub model: String,
    /// Continue an earlier session instead of starting a new one.
    pub session_id: Option<String>,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub permission_mode: Option<String>,
    pub workdir: Option<PathBuf>,
    pub timeout: Duration,
}

/// Running totals reported while the agent is still working.
#[derive(Debug, Clone, Copy)]
pub struct AgentProgress<'a> {
    pub output: &'a str,
    pub tokens_used: u64,
    pub turns_used: u32,
}

/// Final output of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOutput {
    pub output: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub turns_used: u32,
    pub session_id: Option<String>,
    /// The progress observer stopped the run before it finished.
    pub stopped: bool,
}

/// Abstraction over agent execution backends.
pub trait AgentBackend: Send + Sync {
    /// Run one invocation, reporting progress after every partial output.
    ///
    /// Returning `ControlFlow::Break` from `on_progress` must stop the agent;
    /// the partial output is then returned with `stopped = true`. Process
    /// failures are errors.
    fn run(
        &self,
        invocation: &AgentInvocation,
        on_progress: &mut dyn FnMut(&AgentProgress<'_>) -> ControlFlow<()>,
    ) -> Result<BackendOutput>;
}

/// Backend that spawns an agent CLI (`claude -p --output-format stream-json`).
#[derive(Debug, Clone)]
pub struct CliAgentBackend {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl CliAgentBackend {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
        }
    }

    pub fn from_config(defaults: &AgentDefaults) -> Self {
        Self::new(defaults.command.clone(), defaults.output_limit_bytes)
    }

    fn build_command(&self, invocation: &AgentInvocation) -> Result<Command> {
        let (program, base_args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent command must be non-empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(base_args)
            .arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--model")
            .arg(&invocation.model);
        if let Some(session) = &invocation.session_id {
            cmd.arg("--resume").arg(session);
        }
        if let Some(system) = &invocation.system_prompt {
            cmd.arg("--append-system-prompt").arg(system);
        }
        if !invocation.allowed_tools.is_empty() {
            cmd.arg("--allowedTools")
                .arg(invocation.allowed_tools.join(","));
        }
        if let Some(mode) = &invocation.permission_mode {
            cmd.arg("--permission-mode").arg(mode);
        }
        if let Some(dir) = &invocation.workdir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

impl AgentBackend for CliAgentBackend {
    #[instrument(skip_all, fields(model = %invocation.model, resume = invocation.session_id.is_some()))]
    fn run(
        &self,
        invocation: &AgentInvocation,
        on_progress: &mut dyn FnMut(&AgentProgress<'_>) -> ControlFlow<()>,
    ) -> Result<BackendOutput> {
        info!("starting agent process");
        let cmd = self.build_command(invocation)?;
        let started = Instant::now();
        let mut acc = StreamAccumulator::default();

        let output = run_command_streaming(
            cmd,
            Some(invocation.prompt.as_bytes()),
            invocation.timeout,
            self.output_limit_bytes,
            |line| {
                let Some(event) = parse_stream_event(line) else {
                    return ControlFlow::Continue(());
                };
                if !acc.apply(event) {
                    return ControlFlow::Continue(());
                }
                on_progress(&AgentProgress {
                    output: &acc.text,
                    tokens_used: acc.tokens_input + acc.tokens_output,
                    turns_used: acc.turns,
                })
            },
        )
        .context("run agent process")?;

        if output.interrupted {
            debug!("agent stopped by progress observer");
            return Ok(acc.finish(true));
        }
        if output.timed_out {
            warn!(timeout_secs = invocation.timeout.as_secs(), "agent timed out");
            return Err(ConductorError::Timeout {
                what: "agent process".to_string(),
                elapsed_ms: millis(started.elapsed()),
            }
            .into());
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent process failed");
            return Err(anyhow!(
                "agent process failed with status {:?}: {}",
                output.status.code(),
                output.stderr_lossy()
            ));
        }
        if let Some(message) = acc.error.take() {
            return Err(anyhow!("agent reported an error: {message}"));
        }
        debug!(turns = acc.turns, "agent process completed");
        Ok(acc.finish(false))
    }
}

/// One parsed line of the stream-JSON protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Init {
        session_id: String,
    },
    Assistant {
        text: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    Result {
        text: String,
        is_error: bool,
        turns: Option<u32>,
        session_id: Option<String>,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
}

/// Parse one stdout line; unknown or malformed lines yield `None`.
pub fn parse_stream_event(line: &str) -> Option<StreamEvent> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    match value.get("type")?.as_str()? {
        "system" => {
            let session_id = value.get("session_id")?.as_str()?.to_string();
            Some(StreamEvent::Init { session_id })
        }
        "assistant" => {
            let message = value.get("message")?;
            let text = message
                .get("content")
                .and_then(Value::as_array)
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                        .filter_map(|b| b.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            let usage = message.get("usage");
            Some(StreamEvent::Assistant {
                text,
                input_tokens: usage_field(usage, "input_tokens").unwrap_or(0),
                output_tokens: usage_field(usage, "output_tokens").unwrap_or(0),
            })
        }
        "result" => {
            let usage = value.get("usage");
            Some(StreamEvent::Result {
                text: value
                    .get("result")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                is_error: value
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                turns: value
                    .get("num_turns")
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok()),
                session_id: value
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                input_tokens: usage_field(usage, "input_tokens"),
                output_tokens: usage_field(usage, "output_tokens"),
            })
        }
        _ => None,
    }
}

fn usage_field(usage: Option<&Value>, field: &str) -> Option<u64> {
    usage?.get(field)?.as_u64()
}

#[derive(Debug, Default)]
struct StreamAccumulator {
    text: String,
    tokens_input: u64,
    tokens_output: u64,
    turns: u32,
    session_id: Option<String>,
    error: Option<String>,
}

impl StreamAccumulator {
    /// Fold an event in; returns true when the visible progress changed.
    fn apply(&mut self, event: StreamEvent) -> bool {
        match event {
            StreamEvent::Init { session_id } => {
                self.session_id = Some(session_id);
                false
            }
            StreamEvent::Assistant {
                text,
                input_tokens,
                output_tokens,
            } => {
                if !text.is_empty() {
                    if !self.text.is_empty() {
                        self.text.push('\n');
                    }
                    self.text.push_str(&text);
                }
                self.tokens_input += input_tokens;
                self.tokens_output += output_tokens;
                self.turns += 1;
                true
            }
            StreamEvent::Result {
                text,
                is_error,
                turns,
                session_id,
                input_tokens,
                output_tokens,
            } => {
                if is_error {
                    self.error = Some(if text.is_empty() {
                        "unknown error".to_string()
                    } else {
                        text.clone()
                    });
                }
                if !text.is_empty() {
                    self.text = text;
                }
                if let Some(turns) = turns {
                    self.turns = turns;
                }
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                if let Some(n) = input_tokens {
                    self.tokens_input = n;
                }
                if let Some(n) = output_tokens {
                    self.tokens_output = n;
                }
                true
            }
        }
    }

    fn finish(self, stopped: bool) -> BackendOutput {
        BackendOutput {
            output: self.text,
            tokens_input: self.tokens_input,
            tokens_output: self.tokens_output,
            turns_used: self.turns,
            session_id: self.session_id,
            stopped,
        }
    }
}
