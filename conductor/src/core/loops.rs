//! Persisted state of `while` and `ralph` loop nodes.
//!
//! A loop repeats its children. Each iteration runs a fresh copy of the body
//! (see [`crate::core::identity::assign_iteration_ids`]); whether another
//! iteration starts is decided at the boundary, against the latest render:
//! - `while` continues while its `condition` prop is true;
//! - `ralph` continues until its `done` prop is true;
//! - both stop once `max_iterations` iterations have run.

use serde::{Deserialize, Serialize};

use crate::core::plan::Node;

pub const DEFAULT_WHILE_MAX_ITERATIONS: u32 = 100;
pub const DEFAULT_RALPH_MAX_ITERATIONS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopKind {
    While,
    Ralph,
}

impl LoopKind {
    pub fn of(node_type: &str) -> Option<Self> {
        match node_type {
            "while" => Some(Self::While),
            "ralph" => Some(Self::Ralph),
            _ => None,
        }
    }

    pub fn default_max_iterations(self) -> u32 {
        match self {
            Self::While => DEFAULT_WHILE_MAX_ITERATIONS,
            Self::Ralph => DEFAULT_RALPH_MAX_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Running,
    Completed,
    MaxReached,
    Failed,
}

/// Why a loop ended at an iteration boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    MaxReached,
    ConditionFalse,
    Done,
}

impl LoopExit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaxReached => "max_reached",
            Self::ConditionFalse => "condition_false",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    pub kind: LoopKind,
    /// Iterations finished so far; also the index of the running one.
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub status: LoopStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl LoopState {
    /// Initial state for a loop node, or `None` when `node` is not a loop.
    pub fn new(node: &Node) -> Option<Self> {
        let kind = LoopKind::of(&node.node_type)?;
        let max_iterations = node
            .prop_u64("max_iterations")
            .map_or(kind.default_max_iterations(), |max| {
                u32::try_from(max).unwrap_or(u32::MAX)
            });
        Some(Self {
            kind,
            current_iteration: 0,
            max_iterations,
            status: LoopStatus::Running,
            stop_reason: None,
        })
    }

    pub fn is_running(&self) -> bool {
        self.status == LoopStatus::Running
    }

    /// Whether the loop ends instead of starting iteration `current_iteration`.
    pub fn exit_before_iteration(&self, node: &Node) -> Option<LoopExit> {
        if self.current_iteration >= self.max_iterations {
            return Some(LoopExit::MaxReached);
        }
        match self.kind {
            LoopKind::While => (!node.prop_bool("condition")).then_some(LoopExit::ConditionFalse),
            LoopKind::Ralph => node.prop_bool("done").then_some(LoopExit::Done),
        }
    }

    pub fn finish(&mut self, exit: LoopExit) {
        self.status = match exit {
            LoopExit::MaxReached => LoopStatus::MaxReached,
            LoopExit::ConditionFalse | LoopExit::Done => LoopStatus::Completed,
        };
        self.stop_reason = Some(exit.as_str().to_string());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = LoopStatus::Failed;
        self.stop_reason = Some(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn while_runs_until_condition_turns_false() {
        let node = Node::new("while").with_prop("condition", true);
        let mut state = LoopState::new(&node).expect("loop");
        assert_eq!(state.max_iterations, DEFAULT_WHILE_MAX_ITERATIONS);
        assert_eq!(state.exit_before_iteration(&node), None);

        state.current_iteration = 3;
        let stopped = Node::new("while").with_prop("condition", false);
        let exit = state.exit_before_iteration(&stopped).expect("exit");
        assert_eq!(exit, LoopExit::ConditionFalse);
        state.finish(exit);
        assert_eq!(state.status, LoopStatus::Completed);
        assert!(!state.is_running());
    }

    #[test]
    fn ralph_runs_until_done_or_max() {
        let node = Node::new("ralph").with_prop("max_iterations", 2);
        let mut state = LoopState::new(&node).expect("loop");
        assert_eq!(state.exit_before_iteration(&node), None);
        assert_eq!(
            state.exit_before_iteration(&node.clone().with_prop("done", true)),
            Some(LoopExit::Done)
        );

        state.current_iteration = 2;
        let exit = state.exit_before_iteration(&node).expect("exit");
        assert_eq!(exit, LoopExit::MaxReached);
        state.finish(exit);
        assert_eq!(state.status, LoopStatus::MaxReached);
        assert_eq!(state.stop_reason.as_deref(), Some("max_reached"));
    }

    #[test]
    fn non_loops_have_no_state() {
        assert!(LoopState::new(&Node::phase("p")).is_none());
    }
}
