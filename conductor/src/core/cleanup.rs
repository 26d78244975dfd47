//! Snapshot retention rules.
//!
//! Selection is pure: callers list snapshots, this module decides which ones to
//! abandon, and the transaction layer performs (or dry-runs) the abandon.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// A snapshot eligible for cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupCandidate {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub is_empty: bool,
}

/// Retention rules. A snapshot is selected when ANY rule selects it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionRules {
    /// Keep at most this many snapshots (newest first).
    pub max_count: Option<usize>,
    /// Drop snapshots older than this.
    pub max_age: Option<Duration>,
    /// Drop snapshots that recorded no file changes.
    pub empty_only: bool,
}

impl RetentionRules {
    pub fn is_noop(&self) -> bool {
        self.max_count.is_none() && self.max_age.is_none() && !self.empty_only
    }
}

/// Ids to abandon, oldest first, without duplicates.
pub fn select_for_cleanup(
    candidates: &[CleanupCandidate],
    rules: &RetentionRules,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut newest_first: Vec<&CleanupCandidate> = candidates.iter().collect();
    newest_first.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut selected = BTreeSet::new();
    if let Some(max_count) = rules.max_count {
        for candidate in newest_first.iter().skip(max_count) {
            selected.insert(candidate.id.as_str());
        }
    }
    if let Some(max_age) = rules.max_age {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        for candidate in &newest_first {
            if now.signed_duration_since(candidate.created_at) > max_age {
                selected.insert(candidate.id.as_str());
            }
        }
    }
    if rules.empty_only {
        for candidate in &newest_first {
            if candidate.is_empty {
                selected.insert(candidate.id.as_str());
            }
        }
    }

    let mut seen = BTreeSet::new();
    newest_first
        .iter()
        .rev()
        .filter(|candidate| selected.contains(candidate.id.as_str()))
        .filter(|candidate| seen.insert(candidate.id.as_str()))
        .map(|candidate| candidate.id.clone())
        .collect()
}
