//! Declarative plan tree rendered by a workflow each iteration.
//!
//! A [`Node`] is an element of the rendered plan: a type tag, an optional key,
//! free-form props, children, and the execution state the scheduler grafts on
//! after identity assignment.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Execution status of a plan node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    /// True once the node will never run again in this execution.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Execution state carried on every node for plan visualization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecState {
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub duration_ms: u64,
}

/// Closed set of node behaviours the scheduler understands.
///
/// Runnable kinds get a handler; the rest only structure the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Agent,
    Tool,
    HumanWait,
    Subagent,
    Phase,
    Step,
    /// `while` and `ralph` loops repeating their children.
    Loop,
    Group,
}

impl NodeKind {
    /// Classify a node type tag. Unknown tags are structural groups.
    pub fn of(node_type: &str) -> Self {
        match node_type {
            "agent" => Self::Agent,
            "tool" => Self::Tool,
            "human" => Self::HumanWait,
            "subagent" => Self::Subagent,
            "phase" => Self::Phase,
            "step" => Self::Step,
            "while" | "ralph" => Self::Loop,
            _ => Self::Group,
        }
    }

    pub fn is_runnable(self) -> bool {
        matches!(
            self,
            Self::Agent | Self::Tool | Self::HumanWait | Self::Subagent
        )
    }
}

/// One element of the rendered plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub props: BTreeMap<String, Value>,
    #[serde(default)]
    pub children: Vec<Node>,
    /// Stable identity, assigned by [`crate::core::identity::assign_ids`].
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub exec: ExecState,
}

impl Node {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            key: None,
            props: BTreeMap::new(),
            children: Vec::new(),
            id: String::new(),
            exec: ExecState::default(),
        }
    }

    /// Structural container with the given children.
    pub fn group(children: Vec<Node>) -> Self {
        Self::new("group").with_children(children)
    }

    /// Phase unit named `name`.
    pub fn phase(name: &str) -> Self {
        Self::new("phase").with_prop("name", name)
    }

    /// Step unit named `name`.
    pub fn step(name: &str) -> Self {
        Self::new("step").with_prop("name", name)
    }

    /// Agent node with a prompt.
    pub fn agent(prompt: &str) -> Self {
        Self::new("agent").with_prop("prompt", prompt)
    }

    /// Tool node invoking a registered tool with `input`.
    pub fn tool(tool: &str, input: Value) -> Self {
        Self::new("tool")
            .with_prop("tool", tool)
            .with_prop("input", input)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_prop(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.props.insert(name.to_string(), value.into());
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::of(&self.node_type)
    }

    pub fn prop(&self, name: &str) -> Option<&Value> {
        self.props.get(name)
    }

    pub fn prop_str(&self, name: &str) -> Option<&str> {
        self.props.get(name).and_then(Value::as_str)
    }

    pub fn prop_bool(&self, name: &str) -> bool {
        self.props
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn prop_u64(&self, name: &str) -> Option<u64> {
        self.props.get(name).and_then(Value::as_u64)
    }

    /// Display name for units: the `name` prop, else the key, else the type.
    pub fn unit_name(&self) -> String {
        self.prop_str("name")
            .map(str::to_string)
            .or_else(|| self.key.clone())
            .unwrap_or_else(|| self.node_type.clone())
    }

    /// Name a unit registers under in its sequence: the `name` prop, else the
    /// key, else the node id. Unnamed siblings therefore never collide.
    pub fn sequence_name(&self) -> String {
        self.prop_str("name")
            .map(str::to_string)
            .or_else(|| self.key.clone())
            .unwrap_or_else(|| self.id.clone())
    }

    /// Find a node by id (pre-order).
    pub fn find(&self, id: &str) -> Option<&Node> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    /// Find a node by id (pre-order), mutably.
    pub fn find_mut(&mut self, id: &str) -> Option<&mut Node> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| child.find_mut(id))
    }

    /// Visit every node in pre-order.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Node)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    /// Count of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Node::node_count).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_types_are_groups() {
        assert_eq!(NodeKind::of("section"), NodeKind::Group);
        assert_eq!(NodeKind::of("agent"), NodeKind::Agent);
        assert!(NodeKind::of("human").is_runnable());
        assert!(!NodeKind::of("phase").is_runnable());
    }

    #[test]
    fn unit_name_prefers_name_prop_then_key() {
        assert_eq!(Node::phase("Build").unit_name(), "Build");
        assert_eq!(Node::new("phase").with_key("k").unit_name(), "k");
        assert_eq!(Node::new("phase").unit_name(), "phase");
    }

    #[test]
    fn unnamed_units_sequence_by_id() {
        let mut step = Node::new("step");
        step.id = "abc123".to_string();
        assert_eq!(step.sequence_name(), "abc123");
        assert_eq!(step.clone().with_key("k").sequence_name(), "k");
        assert_eq!(Node::step("lint").sequence_name(), "lint");
        assert_eq!(NodeKind::of("while"), NodeKind::Loop);
        assert_eq!(NodeKind::of("ralph"), NodeKind::Loop);
    }

    #[test]
    fn walk_is_pre_order() {
        let mut tree = Node::group(vec![
            Node::phase("a").with_child(Node::agent("x")),
            Node::tool("Write", json!({})),
        ]);
        tree.id = "root".to_string();
        tree.children[0].id = "a".to_string();
        tree.children[0].children[0].id = "x".to_string();
        tree.children[1].id = "w".to_string();

        let mut order = Vec::new();
        tree.walk(&mut |node| order.push(node.id.clone()));
        assert_eq!(order, vec!["root", "a", "x", "w"]);
        assert_eq!(tree.node_count(), 4);
        assert!(tree.find("x").is_some());
        tree.find_mut("w").expect("w").exec.status = NodeStatus::Completed;
        assert_eq!(tree.children[1].exec.status, NodeStatus::Completed);
    }
}
