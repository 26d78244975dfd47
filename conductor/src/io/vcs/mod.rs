//! Version-control primitives used for snapshots and rollback.
//!
//! [`ChangesetStore`] is the narrow surface the transaction layer and the repo
//! state tracker depend on. [`git::GitStore`] keeps snapshots as detached
//! commits under `refs/changesets/`; [`jj::JjStore`] uses jj changes directly.

pub mod git;
pub mod jj;

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::repo_diff::RepoState;
use crate::core::stop::millis;
use crate::core::types::FileDelta;
use crate::errors::ConductorError;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Upper bound for one git/jj invocation.
pub const VCS_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
/// Captured stdout/stderr beyond this is an error: parsers need all of it.
pub const VCS_OUTPUT_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// An immutable recorded state of the working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    /// Full commit id.
    pub id: String,
    /// Stable short change id (jj change id, or abbreviated git sha).
    pub change_id: String,
    pub description: String,
    pub author: String,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    pub parent_ids: Vec<String>,
    pub bookmarks: Vec<String>,
    pub is_empty: bool,
    pub has_conflicts: bool,
}

impl Changeset {
    pub fn created_at(&self) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|err| anyhow!("invalid changeset timestamp '{}': {err}", self.timestamp))
    }
}

/// Current state of the working copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingCopyStatus {
    pub change_id: String,
    pub description: String,
    pub bookmarks: Vec<String>,
    pub delta: FileDelta,
    pub has_conflicts: bool,
}

impl WorkingCopyStatus {
    pub fn is_clean(&self) -> bool {
        self.delta.is_empty() && !self.has_conflicts
    }
}

impl From<WorkingCopyStatus> for RepoState {
    fn from(status: WorkingCopyStatus) -> Self {
        RepoState {
            change_id: status.change_id,
            description: status.description,
            bookmarks: status.bookmarks,
            delta: status.delta,
            has_conflicts: status.has_conflicts,
        }
    }
}

/// Version-control backend operations.
pub trait ChangesetStore: Send + Sync {
    /// Root of the working copy this store operates on.
    fn workdir(&self) -> &Path;

    /// Record the current working copy as a new changeset.
    fn create_changeset(&self, description: &str) -> Result<Changeset>;

    /// Look up a changeset by id; `Ok(None)` when it does not exist.
    fn get_changeset(&self, id: &str) -> Result<Option<Changeset>>;

    /// Most recent changesets first.
    fn list_changesets(&self, limit: usize) -> Result<Vec<Changeset>>;

    /// Files touched by a changeset relative to its first parent.
    fn show_file_delta(&self, id: &str) -> Result<FileDelta>;

    fn create_bookmark(&self, name: &str, id: &str) -> Result<()>;

    fn delete_bookmark(&self, name: &str) -> Result<()>;

    /// Drop a changeset. Abandoning an unknown changeset is not an error.
    fn abandon_changeset(&self, id: &str) -> Result<()>;

    fn working_copy_status(&self) -> Result<WorkingCopyStatus>;

    /// Make the working copy match `id` exactly (tracked and untracked files).
    fn restore(&self, id: &str) -> Result<()>;
}

/// Backend selector for CLI and config use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsKind {
    Git,
    Jj,
}

/// Open a changeset store of the given kind rooted at `workdir`.
pub fn open_store(kind: VcsKind, workdir: &Path) -> Arc<dyn ChangesetStore> {
    match kind {
        VcsKind::Git => Arc::new(git::GitStore::new(workdir)),
        VcsKind::Jj => Arc::new(jj::JjStore::new(workdir)),
    }
}

/// Run a git/jj command under [`VCS_COMMAND_TIMEOUT`].
pub(crate) fn run_vcs(cmd: Command, label: &str) -> Result<CommandOutput> {
    run_bounded(cmd, label, VCS_COMMAND_TIMEOUT, VCS_OUTPUT_LIMIT_BYTES)
}

fn run_bounded(
    cmd: Command,
    label: &str,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let output = run_command_with_timeout(cmd, None, timeout, output_limit_bytes)
        .with_context(|| format!("spawn {label}"))?;
    if output.timed_out {
        return Err(ConductorError::Timeout {
            what: label.to_string(),
            elapsed_ms: millis(timeout),
        }
        .into());
    }
    if output.stdout_truncated > 0 {
        return Err(anyhow!(
            "{label} produced more than {output_limit_bytes} bytes of output"
        ));
    }
    Ok(output)
}
