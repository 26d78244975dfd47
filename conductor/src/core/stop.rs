//! Stop conditions for agent runs and termination rules for the loop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

/// Snapshot of an in-progress agent run, evaluated on every partial output.
#[derive(Debug, Clone, Copy)]
pub struct PartialProgress<'a> {
    pub output: &'a str,
    pub tokens_used: u64,
    pub turns_used: u32,
    pub elapsed: Duration,
}

/// Caller-supplied stop predicate.
pub type StopPredicate = Arc<dyn Fn(&PartialProgress<'_>) -> bool + Send + Sync>;

/// Box a closure as a [`StopPredicate`].
pub fn stop_predicate<F>(predicate: F) -> StopPredicate
where
    F: Fn(&PartialProgress<'_>) -> bool + Send + Sync + 'static,
{
    Arc::new(predicate)
}

/// Conditions that end an agent run early. The first satisfied one wins.
#[derive(Clone, Default)]
pub struct StopConditions {
    pub max_tokens: Option<u64>,
    pub max_duration: Option<Duration>,
    pub max_turns: Option<u32>,
    pub output_pattern: Option<Regex>,
    pub predicate: Option<StopPredicate>,
}

impl fmt::Debug for StopConditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopConditions")
            .field("max_tokens", &self.max_tokens)
            .field("max_duration", &self.max_duration)
            .field("max_turns", &self.max_turns)
            .field(
                "output_pattern",
                &self.output_pattern.as_ref().map(Regex::as_str),
            )
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Which stop condition fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopTrigger {
    TokenLimit { used: u64, limit: u64 },
    TimeLimit { elapsed_ms: u64, limit_ms: u64 },
    TurnLimit { used: u32, limit: u32 },
    Pattern(String),
    Custom,
}

impl fmt::Display for StopTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenLimit { used, limit } => write!(f, "token limit reached ({used} >= {limit})"),
            Self::TimeLimit {
                elapsed_ms,
                limit_ms,
            } => write!(f, "time limit reached ({elapsed_ms}ms >= {limit_ms}ms)"),
            Self::TurnLimit { used, limit } => write!(f, "turn limit reached ({used} >= {limit})"),
            Self::Pattern(pattern) => write!(f, "output matched /{pattern}/"),
            Self::Custom => write!(f, "custom stop condition"),
        }
    }
}

impl StopConditions {
    pub fn is_empty(&self) -> bool {
        self.max_tokens.is_none()
            && self.max_duration.is_none()
            && self.max_turns.is_none()
            && self.output_pattern.is_none()
            && self.predicate.is_none()
    }

    /// Evaluate conditions in a fixed order: tokens, time, turns, pattern, custom.
    pub fn check(&self, progress: &PartialProgress<'_>) -> Option<StopTrigger> {
        if let Some(limit) = self.max_tokens
            && progress.tokens_used >= limit
        {
            return Some(StopTrigger::TokenLimit {
                used: progress.tokens_used,
                limit,
            });
        }
        if let Some(limit) = self.max_duration
            && progress.elapsed >= limit
        {
            return Some(StopTrigger::TimeLimit {
                elapsed_ms: millis(progress.elapsed),
                limit_ms: millis(limit),
            });
        }
        if let Some(limit) = self.max_turns
            && progress.turns_used >= limit
        {
            return Some(StopTrigger::TurnLimit {
                used: progress.turns_used,
                limit,
            });
        }
        if let Some(pattern) = &self.output_pattern
            && pattern.is_match(progress.output)
        {
            return Some(StopTrigger::Pattern(pattern.as_str().to_string()));
        }
        if let Some(predicate) = &self.predicate
            && predicate(progress)
        {
            return Some(StopTrigger::Custom);
        }
        None
    }
}

/// Execution-wide resource limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Budget {
    pub max_total_tokens: Option<u64>,
    pub max_tool_calls: Option<u64>,
}

impl Budget {
    /// Reason the budget is exhausted, if it is.
    pub fn exhausted(&self, total_tokens: u64, tool_calls: u64) -> Option<String> {
        if let Some(limit) = self.max_total_tokens
            && total_tokens >= limit
        {
            return Some(format!("token budget exhausted ({total_tokens} >= {limit})"));
        }
        if let Some(limit) = self.max_tool_calls
            && tool_calls >= limit
        {
            return Some(format!("tool call budget exhausted ({tool_calls} >= {limit})"));
        }
        None
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    StopRequested,
    MaxIterations { limit: u32 },
    GlobalTimeout { elapsed_ms: u64, limit_ms: u64 },
    BudgetExhausted { reason: String },
    FrameStorm { reason: String },
    Quiescent,
}

impl Termination {
    /// Stable end-reason string stored on the execution row.
    pub fn end_reason(&self) -> &'static str {
        match self {
            Self::StopRequested => "stop_requested",
            Self::MaxIterations { .. } => "max_iterations",
            Self::GlobalTimeout { .. } => "global_timeout",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::FrameStorm { .. } => "frame_storm",
            Self::Quiescent => "quiescent",
        }
    }
}

/// Inputs to the end-of-iteration decision.
#[derive(Debug, Clone, Default)]
pub struct LoopSignals {
    pub stop_requested: bool,
    /// 0-based index of the iteration that just finished.
    pub iteration: u32,
    pub max_iterations: Option<u32>,
    pub elapsed: Duration,
    pub global_timeout: Option<Duration>,
    pub budget_exhausted: Option<String>,
    /// The frame storm guard tripped on this frame.
    pub frame_storm: Option<String>,
    /// No pending work was found and no unit advanced this iteration.
    pub quiescent: bool,
}

/// Decide whether the loop ends, in priority order:
/// stop > max iterations > global timeout > budget > frame storm > quiescent.
pub fn decide_termination(signals: &LoopSignals) -> Option<Termination> {
    if signals.stop_requested {
        return Some(Termination::StopRequested);
    }
    if let Some(limit) = signals.max_iterations
        && signals.iteration.saturating_add(1) >= limit
    {
        return Some(Termination::MaxIterations { limit });
    }
    if let Some(limit) = signals.global_timeout
        && signals.elapsed >= limit
    {
        return Some(Termination::GlobalTimeout {
            elapsed_ms: millis(signals.elapsed),
            limit_ms: millis(limit),
        });
    }
    if let Some(reason) = &signals.budget_exhausted {
        return Some(Termination::BudgetExhausted {
            reason: reason.clone(),
        });
    }
    if let Some(reason) = &signals.frame_storm {
        return Some(Termination::FrameStorm {
            reason: reason.clone(),
        });
    }
    if signals.quiescent {
        return Some(Termination::Quiescent);
    }
    None
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
