//! Repository state snapshots and their field-level diff.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::types::FileDelta;

/// Observable state of the working copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoState {
    pub change_id: String,
    pub description: String,
    pub bookmarks: Vec<String>,
    pub delta: FileDelta,
    pub has_conflicts: bool,
}

impl RepoState {
    pub fn is_clean(&self) -> bool {
        self.delta.is_empty() && !self.has_conflicts
    }
}

/// A scalar field that changed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: &'static str,
    pub before: String,
    pub after: String,
}

/// A list field whose membership changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListChange {
    pub field: &'static str,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Everything that differs between two states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepoStateDiff {
    pub scalars: Vec<FieldChange>,
    pub lists: Vec<ListChange>,
}

impl RepoStateDiff {
    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty() && self.lists.is_empty()
    }
}

/// Diff scalars by equality and lists by set difference.
///
/// Returns `None` when nothing observable changed (list order is ignored).
pub fn diff_repo_state(before: &RepoState, after: &RepoState) -> Option<RepoStateDiff> {
    let mut diff = RepoStateDiff::default();

    scalar(&mut diff, "change_id", &before.change_id, &after.change_id);
    scalar(&mut diff, "description", &before.description, &after.description);
    scalar(
        &mut diff,
        "has_conflicts",
        &before.has_conflicts.to_string(),
        &after.has_conflicts.to_string(),
    );

    list(&mut diff, "bookmarks", &before.bookmarks, &after.bookmarks);
    list(&mut diff, "modified", &before.delta.modified, &after.delta.modified);
    list(&mut diff, "added", &before.delta.added, &after.delta.added);
    list(&mut diff, "deleted", &before.delta.deleted, &after.delta.deleted);

    (!diff.is_empty()).then_some(diff)
}

fn scalar(diff: &mut RepoStateDiff, field: &'static str, before: &str, after: &str) {
    if before != after {
        diff.scalars.push(FieldChange {
            field,
            before: before.to_string(),
            after: after.to_string(),
        });
    }
}

fn list(diff: &mut RepoStateDiff, field: &'static str, before: &[String], after: &[String]) {
    let before: BTreeSet<&String> = before.iter().collect();
    let after: BTreeSet<&String> = after.iter().collect();
    let added: Vec<String> = after.difference(&before).map(|s| (*s).clone()).collect();
    let removed: Vec<String> = before.difference(&after).map(|s| (*s).clone()).collect();
    if !added.is_empty() || !removed.is_empty() {
        diff.lists.push(ListChange {
            field,
            added,
            removed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(change: &str, modified: &[&str]) -> RepoState {
        RepoState {
            change_id: change.to_string(),
            delta: FileDelta {
                modified: modified.iter().map(|s| s.to_string()).collect(),
                ..FileDelta::default()
            },
            ..RepoState::default()
        }
    }

    #[test]
    fn identical_states_have_no_diff() {
        assert_eq!(diff_repo_state(&state("a", &["x"]), &state("a", &["x"])), None);
    }

    #[test]
    fn list_order_is_ignored() {
        let before = state("a", &["x", "y"]);
        let after = state("a", &["y", "x"]);
        assert_eq!(diff_repo_state(&before, &after), None);
    }

    #[test]
    fn reports_scalar_and_set_changes() {
        let before = state("a", &["x", "y"]);
        let after = state("b", &["y", "z"]);
        let diff = diff_repo_state(&before, &after).expect("diff");
        assert_eq!(
            diff.scalars,
            vec![FieldChange {
                field: "change_id",
                before: "a".to_string(),
                after: "b".to_string()
            }]
        );
        assert_eq!(
            diff.lists,
            vec![ListChange {
                field: "modified",
                added: vec!["z".to_string()],
                removed: vec!["x".to_string()],
            }]
        );
    }

    #[test]
    fn clean_means_no_delta_and_no_conflicts() {
        assert!(RepoState::default().is_clean());
        assert!(!state("a", &["x"]).is_clean());
    }
}
