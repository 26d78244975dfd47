//! Deterministic node identity and frame-to-frame reconciliation.
//!
//! Ids must be identical across processes so a resumed execution can match
//! persisted node state to a freshly rendered tree. An explicit `id` prop wins;
//! otherwise the id is a truncated SHA-256 over the parent id, the node's key
//! (or child index when unkeyed) and its type. Sibling keys must be unique,
//! and so must the resulting ids.
//!
//! Loop bodies are re-derived per loop iteration under a synthetic parent, so
//! each iteration runs fresh nodes while staying stable across restarts.

use std::collections::{BTreeSet, HashMap, HashSet};

use sha2::{Digest, Sha256};

use crate::core::plan::{ExecState, Node};
use crate::errors::ConductorError;

const ROOT_PARENT: &str = "root";
const ID_HEX_LEN: usize = 12;

/// Compute a node id from its position in the tree.
pub fn compute_node_id(parent_id: Option<&str>, key_or_index: &str, node_type: &str) -> String {
    let path = format!(
        "{}/{}:{}",
        parent_id.unwrap_or(ROOT_PARENT),
        key_or_index,
        node_type
    );
    let digest = Sha256::digest(path.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(ID_HEX_LEN);
    id
}

/// Synthetic parent id of the children of `loop_id` during `iteration`.
pub fn iteration_scope_id(loop_id: &str, iteration: u32) -> String {
    compute_node_id(Some(loop_id), &format!("iter:{iteration}"), "iteration")
}

/// Assign ids to every node of a freshly rendered tree.
pub fn assign_ids(root: &mut Node) -> Result<(), ConductorError> {
    assign(root, None, 0, "")?;
    ensure_unique_ids(root)
}

/// Re-derive the ids below a loop node for one loop iteration.
///
/// Explicit `id` props inside the body get an `@<iteration>` suffix.
pub fn assign_iteration_ids(loop_node: &mut Node, iteration: u32) -> Result<(), ConductorError> {
    let scope = iteration_scope_id(&loop_node.id, iteration);
    let suffix = format!("@{iteration}");
    for (i, child) in loop_node.children.iter_mut().enumerate() {
        assign(child, Some(&scope), i, &suffix)?;
    }
    Ok(())
}

fn assign(
    node: &mut Node,
    parent_id: Option<&str>,
    index: usize,
    suffix: &str,
) -> Result<(), ConductorError> {
    node.id = match node.prop_str("id") {
        Some(explicit) if !explicit.is_empty() => format!("{explicit}{suffix}"),
        _ => {
            let key_or_index = node.key.clone().unwrap_or_else(|| index.to_string());
            compute_node_id(parent_id, &key_or_index, &node.node_type)
        }
    };
    check_sibling_keys(node)?;
    let id = node.id.clone();
    for (i, child) in node.children.iter_mut().enumerate() {
        assign(child, Some(&id), i, suffix)?;
    }
    Ok(())
}

fn check_sibling_keys(parent: &Node) -> Result<(), ConductorError> {
    let mut seen = HashSet::new();
    for child in &parent.children {
        if let Some(key) = &child.key
            && !seen.insert(key.as_str())
        {
            return Err(ConductorError::Validation(format!(
                "duplicate key '{key}' among the children of {} node {}",
                parent.node_type, parent.id
            )));
        }
    }
    Ok(())
}

/// Reject trees where two nodes resolved to the same id.
pub fn ensure_unique_ids(tree: &Node) -> Result<(), ConductorError> {
    let mut seen = HashSet::new();
    let mut duplicate = None;
    tree.walk(&mut |node| {
        if duplicate.is_none() && !seen.insert(node.id.as_str()) {
            duplicate = Some(node.id.clone());
        }
    });
    match duplicate {
        Some(id) => Err(ConductorError::Validation(format!(
            "duplicate node id '{id}'"
        ))),
        None => Ok(()),
    }
}

/// Collect execution state by node id.
pub fn index_exec(tree: &Node) -> HashMap<String, ExecState> {
    let mut out = HashMap::new();
    tree.walk(&mut |node| {
        out.insert(node.id.clone(), node.exec.clone());
    });
    out
}

/// Copy execution state from a previous frame onto matching ids.
///
/// Nodes without a match keep their default (pending) state.
pub fn graft_exec(tree: &mut Node, previous: &HashMap<String, ExecState>) -> usize {
    let mut grafted = 0;
    graft(tree, previous, &mut grafted);
    grafted
}

fn graft(node: &mut Node, previous: &HashMap<String, ExecState>, grafted: &mut usize) {
    if let Some(exec) = previous.get(&node.id) {
        node.exec = exec.clone();
        *grafted += 1;
    }
    for child in &mut node.children {
        graft(child, previous, grafted);
    }
}

/// Difference in node ids between two frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub newly_mounted: Vec<String>,
    pub retained: Vec<String>,
    pub unmounted: Vec<String>,
}

/// Compare the ids of the current frame against the previous one.
pub fn reconcile(current: &Node, previous: Option<&Node>) -> Reconciliation {
    let current_ids = collect_ids(current);
    let previous_ids = previous.map(collect_ids).unwrap_or_default();
    Reconciliation {
        newly_mounted: current_ids.difference(&previous_ids).cloned().collect(),
        retained: current_ids.intersection(&previous_ids).cloned().collect(),
        unmounted: previous_ids.difference(&current_ids).cloned().collect(),
    }
}

fn collect_ids(tree: &Node) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    tree.walk(&mut |node| {
        ids.insert(node.id.clone());
    });
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::NodeStatus;

    fn sample() -> Node {
        Node::group(vec![
            Node::phase("build").with_child(Node::agent("compile it")),
            Node::agent("review").with_key("reviewer"),
        ])
    }

    #[test]
    fn ids_are_stable_across_renders() {
        let mut a = sample();
        let mut b = sample();
        assign_ids(&mut a).expect("ids");
        assign_ids(&mut b).expect("ids");
        assert_eq!(index_exec(&a).keys().count(), 4);
        assert_eq!(a, b);
        assert_eq!(a.id.len(), 12);
    }

    #[test]
    fn keyed_nodes_survive_reordering() {
        let mut first = sample();
        assign_ids(&mut first).expect("ids");
        let keyed_id = first.children[1].id.clone();

        let mut reordered = Node::group(vec![
            Node::agent("review").with_key("reviewer"),
            Node::phase("build").with_child(Node::agent("compile it")),
        ]);
        assign_ids(&mut reordered).expect("ids");
        assert_eq!(reordered.children[0].id, keyed_id);
        // Unkeyed siblings are positional, so the phase moved identities.
        assert_ne!(reordered.children[1].id, first.children[0].id);
    }

    #[test]
    fn explicit_id_prop_wins() {
        let mut tree = Node::group(vec![Node::agent("x").with_prop("id", "custom")]);
        assign_ids(&mut tree).expect("ids");
        assert_eq!(tree.children[0].id, "custom");
    }

    #[test]
    fn matches_known_digest() {
        let id = compute_node_id(None, "0", "agent");
        let expected = hex::encode(Sha256::digest(b"root/0:agent"));
        assert_eq!(id, expected[..12]);
    }

    #[test]
    fn graft_restores_exec_without_touching_new_nodes() {
        let mut previous = sample();
        assign_ids(&mut previous).expect("ids");
        previous.children[0].children[0].exec.status = NodeStatus::Completed;
        let exec = index_exec(&previous);

        let mut next = sample().with_child(Node::agent("new"));
        assign_ids(&mut next).expect("ids");
        let grafted = graft_exec(&mut next, &exec);

        assert_eq!(grafted, 4);
        assert_eq!(next.children[0].children[0].exec.status, NodeStatus::Completed);
        assert_eq!(next.children[2].exec.status, NodeStatus::Pending);

        let diff = reconcile(&next, Some(&previous));
        assert_eq!(diff.newly_mounted, vec![next.children[2].id.clone()]);
        assert!(diff.unmounted.is_empty());
        assert_eq!(diff.retained.len(), 4);
    }

    #[test]
    fn duplicate_sibling_keys_are_rejected() {
        let mut tree = Node::group(vec![
            Node::tool("echo", "a".into()).with_key("k"),
            Node::tool("echo", "b".into()).with_key("k"),
        ]);
        let err = assign_ids(&mut tree).expect_err("duplicate keys");
        assert!(matches!(err, ConductorError::Validation(ref m) if m.contains("duplicate key 'k'")));

        let mut cousins = Node::group(vec![
            Node::phase("a").with_child(Node::agent("x").with_key("k")),
            Node::phase("b").with_child(Node::agent("y").with_key("k")),
        ]);
        assign_ids(&mut cousins).expect("same key under different parents");
        assert_ne!(cousins.children[0].children[0].id, cousins.children[1].children[0].id);
    }

    #[test]
    fn duplicate_explicit_ids_are_rejected() {
        let mut tree = Node::group(vec![
            Node::agent("x").with_prop("id", "same"),
            Node::phase("p").with_child(Node::agent("y").with_prop("id", "same")),
        ]);
        let err = assign_ids(&mut tree).expect_err("duplicate ids");
        assert!(matches!(err, ConductorError::Validation(ref m) if m.contains("'same'")));
    }

    #[test]
    fn loop_bodies_get_fresh_ids_per_iteration() {
        let mut tree = Node::new("while").with_children(vec![
            Node::agent("work"),
            Node::agent("pinned").with_prop("id", "fixed"),
        ]);
        assign_ids(&mut tree).expect("ids");

        let mut first = tree.clone();
        assign_iteration_ids(&mut first, 0).expect("iteration 0");
        let mut again = tree.clone();
        assign_iteration_ids(&mut again, 0).expect("iteration 0 again");
        let mut second = tree.clone();
        assign_iteration_ids(&mut second, 1).expect("iteration 1");

        assert_eq!(first, again);
        assert_eq!(first.id, second.id);
        assert_ne!(first.children[0].id, second.children[0].id);
        assert_eq!(first.children[1].id, "fixed@0");
        assert_eq!(second.children[1].id, "fixed@1");
        ensure_unique_ids(&second).expect("unique");
    }
}
