//! Execution configuration, optionally stored as TOML next to the state database.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::Backoff;
use crate::core::frame_storm::FrameLimits;
use crate::core::stop::Budget;

/// Tools that never mutate the working copy and bypass snapshots.
pub const DEFAULT_READ_ONLY_TOOLS: &[&str] = &["Read", "Glob", "Grep", "LS", "WebFetch", "WebSearch"];

/// Execution configuration (TOML).
///
/// Missing fields default to values suitable for interactive runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Human-readable execution name.
    pub name: String,

    /// Reference to the workflow source (path or identifier).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Upper bound on loop iterations.
    pub max_iterations: u32,

    /// Wall-clock budget for the whole execution, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_timeout_secs: Option<u64>,

    /// Model used by agent nodes that do not name one.
    pub default_model: String,

    /// Poll interval for human-wait nodes, in milliseconds.
    pub human_poll_ms: u64,

    pub agent: AgentDefaults,
    pub tools: ToolDefaults,
    pub limits: LimitsConfig,
    pub frame_storm: FrameStormConfig,

    /// What resume does with nodes a crash left running.
    pub orphan_policy: OrphanPolicy,
}

/// Orphaned nodes are runnable nodes persisted as running with no live worker.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Reset them to pending and run them again.
    #[default]
    Retry,
    /// Mark them failed; the failure halts their sequence like any other.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FrameStormConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frames_per_second: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frames_per_minute: Option<u32>,
    /// Identical (plan, state) frames tolerated in the recent history.
    pub repeat_window: u32,
}

impl Default for FrameStormConfig {
    fn default() -> Self {
        Self {
            max_frames_per_second: None,
            max_frames_per_minute: None,
            repeat_window: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentDefaults {
    /// Retries after a backend (process) failure or validator rejection.
    pub max_retries: u32,
    /// Corrective retries after schema validation failures.
    pub schema_retries: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub backoff_base_ms: u64,
    /// Cap for the backoff delay, in milliseconds.
    pub backoff_max_ms: u64,
    /// Per-attempt process timeout, in seconds.
    pub timeout_secs: u64,
    /// Command used by the CLI backend (e.g. `["claude"]`).
    pub command: Vec<String>,
    /// Truncate captured agent output beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolDefaults {
    /// Tool names that bypass snapshotting.
    pub read_only: Vec<String>,
    /// Refuse mutating tools unless the working copy is clean.
    pub require_clean: bool,
    /// Race timeout for tool execution, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Tool outputs larger than this are stored as content-addressed blobs.
    pub spill_threshold_bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<u64>,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            schema_retries: 2,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            timeout_secs: 30 * 60,
            command: vec!["claude".to_string()],
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for ToolDefaults {
    fn default() -> Self {
        Self {
            read_only: DEFAULT_READ_ONLY_TOOLS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            require_clean: false,
            timeout_ms: None,
            spill_threshold_bytes: 1024,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            name: "workflow".to_string(),
            source: None,
            max_iterations: 100,
            global_timeout_secs: None,
            default_model: "sonnet".to_string(),
            human_poll_ms: 200,
            agent: AgentDefaults::default(),
            tools: ToolDefaults::default(),
            limits: LimitsConfig::default(),
            frame_storm: FrameStormConfig::default(),
            orphan_policy: OrphanPolicy::default(),
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("name must be non-empty"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.global_timeout_secs == Some(0) {
            return Err(anyhow!("global_timeout_secs must be > 0 when set"));
        }
        if self.default_model.trim().is_empty() {
            return Err(anyhow!("default_model must be non-empty"));
        }
        if self.human_poll_ms == 0 {
            return Err(anyhow!("human_poll_ms must be > 0"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.backoff_max_ms < self.agent.backoff_base_ms {
            return Err(anyhow!("agent.backoff_max_ms must be >= agent.backoff_base_ms"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.tools.spill_threshold_bytes == 0 {
            return Err(anyhow!("tools.spill_threshold_bytes must be > 0"));
        }
        if self.frame_storm.repeat_window == 0 {
            return Err(anyhow!("frame_storm.repeat_window must be > 0"));
        }
        if self.frame_storm.max_frames_per_second == Some(0)
            || self.frame_storm.max_frames_per_minute == Some(0)
        {
            return Err(anyhow!("frame_storm rate limits must be > 0 when set"));
        }
        Ok(())
    }

    pub fn global_timeout(&self) -> Option<Duration> {
        self.global_timeout_secs.map(Duration::from_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.agent.backoff_base_ms),
            Duration::from_millis(self.agent.backoff_max_ms),
        )
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_frames_per_second: self.frame_storm.max_frames_per_second,
            max_frames_per_minute: self.frame_storm.max_frames_per_minute,
            repeat_limit: self.frame_storm.repeat_window as usize,
        }
    }

    pub fn budget(&self) -> Budget {
        Budget {
            max_total_tokens: self.limits.max_total_tokens,
            max_tool_calls: self.limits.max_tool_calls,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ExecutionConfig::default()`.
pub fn load_config(path: &Path) -> Result<ExecutionConfig> {
    if !path.exists() {
        let cfg = ExecutionConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ExecutionConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ExecutionConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
