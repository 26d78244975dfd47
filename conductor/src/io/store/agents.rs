//! Agent task rows. Created at dispatch, finalized exactly once.

use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::{Store, from_json, from_sql_int, new_id, now, state_error, to_json, to_sql_int};
use crate::core::types::AgentStatus;
use crate::errors::StateError;

#[derive(Debug, Clone)]
pub struct NewAgent<'a> {
    pub execution_id: &'a str,
    pub node_id: &'a str,
    pub prompt: &'a str,
    pub model: &'a str,
}

/// Terminal data written by [`Store::finish_agent`].
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCompletion {
    pub status: AgentStatus,
    pub output: Option<String>,
    pub structured: Option<Value>,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub turns_used: u32,
    pub stop_reason: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    pub id: String,
    pub execution_id: String,
    pub node_id: String,
    pub prompt: String,
    pub model: String,
    pub status: AgentStatus,
    pub output: Option<String>,
    pub structured: Option<Value>,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub turns_used: u32,
    pub stop_reason: Option<String>,
    pub error: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

struct RawAgent {
    record: AgentRecord,
    status: String,
    structured: Option<String>,
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<RawAgent> {
    Ok(RawAgent {
        record: AgentRecord {
            id: row.get(0)?,
            execution_id: row.get(1)?,
            node_id: row.get(2)?,
            prompt: row.get(3)?,
            model: row.get(4)?,
            status: AgentStatus::Running,
            output: row.get(6)?,
            structured: None,
            tokens_input: from_sql_int(row.get(8)?),
            tokens_output: from_sql_int(row.get(9)?),
            turns_used: row.get(10)?,
            stop_reason: row.get(11)?,
            error: row.get(12)?,
            started_at: row.get(13)?,
            completed_at: row.get(14)?,
        },
        status: row.get(5)?,
        structured: row.get(7)?,
    })
}

impl RawAgent {
    fn into_record(self) -> Result<AgentRecord> {
        let mut record = self.record;
        record.status = self.status.parse()?;
        record.structured = from_json(self.structured)?;
        Ok(record)
    }
}

const COLUMNS: &str = "id, execution_id, node_id, prompt, model, status, output, structured, \
     tokens_input, tokens_output, turns_used, stop_reason, error, started_at, completed_at";

impl Store {
    #[instrument(skip_all, fields(execution_id = agent.execution_id, node_id = agent.node_id))]
    pub fn start_agent(&self, agent: &NewAgent<'_>) -> Result<String> {
        let id = new_id();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agents(id, execution_id, node_id, prompt, model, status, started_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    agent.execution_id,
                    agent.node_id,
                    agent.prompt,
                    agent.model,
                    AgentStatus::Running.as_str(),
                    now()
                ],
            )?;
            Ok(())
        })?;
        debug!(agent_id = %id, "agent started");
        Ok(id)
    }

    /// Finalize a running agent row. A second finalization is a [`StateError`].
    #[instrument(skip_all, fields(id, status = completion.status.as_str()))]
    pub fn finish_agent(&self, id: &str, completion: &AgentCompletion) -> Result<()> {
        let structured = completion.structured.as_ref().map(to_json).transpose()?;
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let current: Option<String> = tx
                .query_row("SELECT status FROM agents WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            let current: AgentStatus = match current {
                Some(raw) => raw.parse()?,
                None => {
                    return Err(state_error(StateError::NotFound {
                        kind: "agent",
                        id: id.to_string(),
                    }));
                }
            };
            if current != AgentStatus::Running {
                return Err(state_error(StateError::AlreadyFinalized {
                    kind: "agent",
                    id: id.to_string(),
                    status: current.as_str().to_string(),
                }));
            }
            tx.execute(
                "UPDATE agents SET status = ?2, output = ?3, structured = ?4, tokens_input = ?5, \
                 tokens_output = ?6, turns_used = ?7, stop_reason = ?8, error = ?9, completed_at = ?10 \
                 WHERE id = ?1",
                params![
                    id,
                    completion.status.as_str(),
                    completion.output,
                    structured,
                    to_sql_int(completion.tokens_input),
                    to_sql_int(completion.tokens_output),
                    completion.turns_used,
                    completion.stop_reason,
                    completion.error,
                    now()
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Mark agents left running by a crashed process as failed.
    pub fn fail_orphaned_agents(&self, execution_id: &str, reason: &str) -> Result<usize> {
        let count = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE agents SET status = ?2, error = ?3, completed_at = ?4 \
                 WHERE execution_id = ?1 AND status = ?5",
                params![
                    execution_id,
                    AgentStatus::Failed.as_str(),
                    reason,
                    now(),
                    AgentStatus::Running.as_str()
                ],
            )?)
        })?;
        if count > 0 {
            warn!(execution_id, count, "failed orphaned agents");
        }
        Ok(count)
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>> {
        let raw = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM agents WHERE id = ?1"),
                    params![id],
                    agent_from_row,
                )
                .optional()?)
        })?;
        raw.map(RawAgent::into_record).transpose()
    }

    pub fn list_agents(&self, execution_id: &str) -> Result<Vec<AgentRecord>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM agents WHERE execution_id = ?1 ORDER BY started_at, rowid"
            ))?;
            let rows = stmt
                .query_map(params![execution_id], agent_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(RawAgent::into_record).collect()
    }
}
