//! Execution rows: one per scheduler run, child rows for subagents.

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{Store, from_sql_int, new_id, now, state_error, to_json, to_sql_int};
use crate::core::types::ExecutionStatus;
use crate::errors::StateError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub name: String,
    pub source_ref: Option<String>,
    pub status: ExecutionStatus,
    pub config: Value,
    pub parent_execution_id: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub iterations: u32,
    pub total_agents: u64,
    pub total_tool_calls: u64,
    pub total_tokens: u64,
    pub error: Option<String>,
    pub end_reason: Option<String>,
}

const COLUMNS: &str = "id, name, source_ref, status, config, parent_execution_id, started_at, \
     completed_at, iterations, total_agents, total_tool_calls, total_tokens, error, end_reason";

struct RawExecution {
    id: String,
    name: String,
    source_ref: Option<String>,
    status: String,
    config: String,
    parent_execution_id: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    iterations: i64,
    total_agents: i64,
    total_tool_calls: i64,
    total_tokens: i64,
    error: Option<String>,
    end_reason: Option<String>,
}

impl RawExecution {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            source_ref: row.get(2)?,
            status: row.get(3)?,
            config: row.get(4)?,
            parent_execution_id: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
            iterations: row.get(8)?,
            total_agents: row.get(9)?,
            total_tool_calls: row.get(10)?,
            total_tokens: row.get(11)?,
            error: row.get(12)?,
            end_reason: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<ExecutionRecord> {
        Ok(ExecutionRecord {
            status: self.status.parse()?,
            config: serde_json::from_str(&self.config)
                .with_context(|| format!("parse config of execution {}", self.id))?,
            id: self.id,
            name: self.name,
            source_ref: self.source_ref,
            parent_execution_id: self.parent_execution_id,
            started_at: self.started_at,
            completed_at: self.completed_at,
            iterations: u32::try_from(self.iterations).unwrap_or(0),
            total_agents: from_sql_int(self.total_agents),
            total_tool_calls: from_sql_int(self.total_tool_calls),
            total_tokens: from_sql_int(self.total_tokens),
            error: self.error,
            end_reason: self.end_reason,
        })
    }
}

impl Store {
    /// Insert a running execution and return its id.
    #[instrument(skip_all, fields(name, parent = ?parent_execution_id))]
    pub fn start_execution(
        &self,
        name: &str,
        source_ref: Option<&str>,
        config: &Value,
        parent_execution_id: Option<&str>,
    ) -> Result<String> {
        let id = new_id();
        let config = to_json(config)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO executions(id, name, source_ref, status, config, parent_execution_id, started_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    name,
                    source_ref,
                    ExecutionStatus::Running.as_str(),
                    config,
                    parent_execution_id,
                    now()
                ],
            )?;
            Ok(())
        })?;
        debug!(execution_id = %id, "execution started");
        Ok(id)
    }

    pub fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        let raw = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM executions WHERE id = ?1"),
                    params![id],
                    RawExecution::from_row,
                )
                .optional()?)
        })?;
        raw.map(RawExecution::into_record).transpose()
    }

    /// The most recent top-level execution still marked running.
    pub fn find_incomplete_execution(&self) -> Result<Option<ExecutionRecord>> {
        let raw = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM executions \
                         WHERE status = 'running' AND completed_at IS NULL AND parent_execution_id IS NULL \
                         ORDER BY started_at DESC, rowid DESC LIMIT 1"
                    ),
                    [],
                    RawExecution::from_row,
                )
                .optional()?)
        })?;
        raw.map(RawExecution::into_record).transpose()
    }

    /// Newest first.
    pub fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM executions ORDER BY started_at DESC, rowid DESC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![to_sql_int(limit as u64)], RawExecution::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(RawExecution::into_record).collect()
    }

    /// Children spawned by subagent nodes of `parent_id`, oldest first.
    pub fn list_child_executions(&self, parent_id: &str) -> Result<Vec<ExecutionRecord>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM executions WHERE parent_execution_id = ?1 ORDER BY started_at, rowid"
            ))?;
            let rows = stmt
                .query_map(params![parent_id], RawExecution::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(RawExecution::into_record).collect()
    }

    pub fn record_iteration(&self, id: &str, iteration: u32) -> Result<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE executions SET iterations = ?2 WHERE id = ?1",
                params![id, iteration],
            )?;
            if updated == 0 {
                return Err(not_found(id));
            }
            Ok(())
        })
    }

    pub fn add_execution_totals(
        &self,
        id: &str,
        agents: u64,
        tool_calls: u64,
        tokens: u64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE executions SET total_agents = total_agents + ?2, \
                 total_tool_calls = total_tool_calls + ?3, total_tokens = total_tokens + ?4 \
                 WHERE id = ?1",
                params![id, to_sql_int(agents), to_sql_int(tool_calls), to_sql_int(tokens)],
            )?;
            if updated == 0 {
                return Err(not_found(id));
            }
            Ok(())
        })
    }

    /// Move a running execution to a terminal status. Terminal rows are immutable.
    #[instrument(skip_all, fields(id, status = status.as_str(), end_reason))]
    pub fn finish_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        end_reason: &str,
        error: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM executions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let current: ExecutionStatus = match current {
                Some(raw) => raw.parse()?,
                None => return Err(not_found(id)),
            };
            if current.is_terminal() {
                return Err(state_error(StateError::AlreadyFinalized {
                    kind: "execution",
                    id: id.to_string(),
                    status: current.as_str().to_string(),
                }));
            }
            tx.execute(
                "UPDATE executions SET status = ?2, end_reason = ?3, error = ?4, completed_at = ?5 WHERE id = ?1",
                params![id, status.as_str(), end_reason, error, now()],
            )?;
            tx.commit()?;
            Ok(())
        })?;
        debug!("execution finished");
        Ok(())
    }
}

fn not_found(id: &str) -> anyhow::Error {
    state_error(StateError::NotFound {
        kind: "execution",
        id: id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConductorError;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, Store) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Store::open(temp.path()).expect("open");
        (temp, store)
    }

    #[test]
    fn start_and_get_round_trip() {
        let (_temp, store) = store();
        let id = store
            .start_execution("demo", Some("flows/demo.toml"), &json!({"max_iterations": 3}), None)
            .expect("start");
        let record = store.get_execution(&id).expect("get").expect("record");
        assert_eq!(record.name, "demo");
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.config, json!({"max_iterations": 3}));
        assert_eq!(record.source_ref.as_deref(), Some("flows/demo.toml"));
    }

    #[test]
    fn second_terminal_write_is_rejected() {
        let (_temp, store) = store();
        let id = store.start_execution("demo", None, &json!({}), None).expect("start");
        store
            .finish_execution(&id, ExecutionStatus::Completed, "quiescent", None)
            .expect("finish");
        let err = store
            .finish_execution(&id, ExecutionStatus::Failed, "error", Some("late"))
            .expect_err("second finish");
        assert!(matches!(
            ConductorError::find(&err),
            Some(ConductorError::State(StateError::AlreadyFinalized { kind: "execution", .. }))
        ));
        let record = store.get_execution(&id).expect("get").expect("record");
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.end_reason.as_deref(), Some("quiescent"));
    }

    #[test]
    fn incomplete_lookup_ignores_children_and_finished_runs() {
        let (_temp, store) = store();
        let done = store.start_execution("old", None, &json!({}), None).expect("start");
        store
            .finish_execution(&done, ExecutionStatus::Completed, "quiescent", None)
            .expect("finish");
        let parent = store.start_execution("parent", None, &json!({}), None).expect("start");
        let child = store
            .start_execution("child", None, &json!({}), Some(&parent))
            .expect("start child");

        let found = store
            .find_incomplete_execution()
            .expect("find")
            .expect("incomplete");
        assert_eq!(found.id, parent);
        assert_eq!(
            store.list_child_executions(&parent).expect("children")[0].id,
            child
        );
    }

    #[test]
    fn totals_accumulate() {
        let (_temp, store) = store();
        let id = store.start_execution("demo", None, &json!({}), None).expect("start");
        store.add_execution_totals(&id, 1, 2, 100).expect("add");
        store.add_execution_totals(&id, 1, 0, 50).expect("add");
        store.record_iteration(&id, 4).expect("iteration");
        let record = store.get_execution(&id).expect("get").expect("record");
        assert_eq!(record.total_agents, 2);
        assert_eq!(record.total_tool_calls, 2);
        assert_eq!(record.total_tokens, 150);
        assert_eq!(record.iterations, 4);
    }

    #[test]
    fn unknown_execution_is_not_found() {
        let (_temp, store) = store();
        let err = store.record_iteration("missing", 1).expect_err("missing");
        assert!(matches!(
            ConductorError::find(&err),
            Some(ConductorError::State(StateError::NotFound { .. }))
        ));
    }
}
