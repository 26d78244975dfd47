//! State-store key layout for one execution.
//!
//! Every key is prefixed with the execution id, so concurrent and child
//! executions never share entries.

/// Stop flag polled before every activation.
pub fn stop(execution_id: &str) -> String {
    format!("{execution_id}/control/stop")
}

/// Persisted [`crate::core::plan::ExecState`] of one node.
pub fn node(execution_id: &str, node_id: &str) -> String {
    format!("{}{node_id}", node_prefix(execution_id))
}

pub fn node_prefix(execution_id: &str) -> String {
    format!("{execution_id}/node/")
}

/// Phase/step record bookkeeping for one unit node.
pub fn unit(execution_id: &str, node_id: &str) -> String {
    format!("{}{node_id}", unit_prefix(execution_id))
}

pub fn unit_prefix(execution_id: &str) -> String {
    format!("{execution_id}/unit/")
}

/// Persisted [`crate::core::loops::LoopState`] of one loop node.
pub fn loop_state(execution_id: &str, node_id: &str) -> String {
    format!("{}{node_id}", loop_prefix(execution_id))
}

pub fn loop_prefix(execution_id: &str) -> String {
    format!("{execution_id}/loop/")
}

/// Response written for a human-wait node.
pub fn human(execution_id: &str, node_id: &str) -> String {
    format!("{execution_id}/human/{node_id}")
}

/// Present while a human-wait node is blocked.
pub fn waiting(execution_id: &str, node_id: &str) -> String {
    format!("{}{node_id}", waiting_prefix(execution_id))
}

pub fn waiting_prefix(execution_id: &str) -> String {
    format!("{execution_id}/waiting/")
}

/// Workflow variable written back through a node's `state_key`.
pub fn var(execution_id: &str, name: &str) -> String {
    format!("{}{name}", var_prefix(execution_id))
}

pub fn var_prefix(execution_id: &str) -> String {
    format!("{execution_id}/vars/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_execution_prefix() {
        assert_eq!(stop("e1"), "e1/control/stop");
        assert_eq!(node("e1", "abc"), "e1/node/abc");
        assert!(var("e1", "plan").starts_with(&var_prefix("e1")));
        assert!(waiting("e1", "n").starts_with(&waiting_prefix("e1")));
        assert_ne!(human("e1", "n"), waiting("e1", "n"));
        assert!(!loop_state("e1", "n").starts_with(&node_prefix("e1")));
    }
}
