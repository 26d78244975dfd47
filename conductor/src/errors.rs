//! Error taxonomy shared across the orchestrator.
//!
//! Plumbing returns `anyhow::Result`; these typed values travel inside the
//! `anyhow::Error` and are recovered with `downcast_ref::<ConductorError>()`.

use thiserror::Error;

/// Typed failures callers are expected to branch on.
#[derive(Debug, Error)]
pub enum ConductorError {
    /// Output failed a schema or caller-supplied validator.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A handler, tool, or agent process failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// An operation exceeded its time budget.
    #[error("{what} timed out after {elapsed_ms}ms")]
    Timeout { what: String, elapsed_ms: u64 },

    /// Creating or restoring a snapshot failed.
    #[error("snapshot {operation} failed: {message}")]
    Snapshot { operation: String, message: String },

    /// Misuse of the persistent state store.
    #[error(transparent)]
    State(#[from] StateError),

    /// A mutating tool required a clean working copy and it was not.
    #[error("repository not clean ({} pending change(s)): {}", .paths.len(), .paths.join(", "))]
    RepositoryNotClean { paths: Vec<String> },
}

/// State store failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("state store is closed")]
    Closed,

    #[error("version conflict on {key}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        key: String,
        expected: Option<i64>,
        actual: Option<i64>,
    },

    #[error("{kind} {id} already finalized as {status}")]
    AlreadyFinalized {
        kind: &'static str,
        id: String,
        status: String,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

impl ConductorError {
    /// Borrow the typed error carried by an `anyhow::Error`, if any.
    pub fn find(err: &anyhow::Error) -> Option<&ConductorError> {
        err.chain().find_map(|cause| cause.downcast_ref::<ConductorError>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn find_sees_through_context_layers() {
        let err = Err::<(), _>(anyhow::Error::from(ConductorError::RepositoryNotClean {
            paths: vec!["a.txt".to_string()],
        }))
        .context("wrap tool Write")
        .unwrap_err();

        match ConductorError::find(&err) {
            Some(ConductorError::RepositoryNotClean { paths }) => {
                assert_eq!(paths, &vec!["a.txt".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn state_errors_render_their_kind() {
        let err = ConductorError::from(StateError::AlreadyFinalized {
            kind: "agent",
            id: "a1".to_string(),
            status: "completed".to_string(),
        });
        assert_eq!(err.to_string(), "agent a1 already finalized as completed");
    }
}
