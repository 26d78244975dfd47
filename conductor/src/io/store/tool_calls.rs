//! Tool call rows and content-addressed output blobs.
//!
//! Outputs up to the spill threshold stay inline in the row. Larger outputs
//! are written once to `blobs/<sha256>` and referenced from the row and from
//! an `artifacts` row.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use super::{Store, from_json, from_sql_int, new_id, now, state_error, to_json, to_sql_int};
use crate::core::types::ToolCallStatus;
use crate::errors::StateError;

const OUTPUT_ARTIFACT: &str = "tool_output";

#[derive(Debug, Clone)]
pub struct NewToolCall<'a> {
    pub execution_id: &'a str,
    pub agent_id: Option<&'a str>,
    pub node_id: Option<&'a str>,
    pub tool_name: &'a str,
    pub input: &'a Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub execution_id: String,
    pub agent_id: Option<String>,
    pub node_id: Option<String>,
    pub tool_name: String,
    pub input: Value,
    /// Output stored in the row (absent when spilled).
    pub output_inline: Option<Value>,
    /// Content hash of a spilled output.
    pub output_hash: Option<String>,
    pub output_size: Option<u64>,
    pub status: ToolCallStatus,
    pub error: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRecord {
    pub id: String,
    pub execution_id: String,
    pub tool_call_id: Option<String>,
    pub kind: String,
    pub hash: String,
    pub size: u64,
    pub created_at: String,
}

struct RawToolCall {
    record: ToolCallRecord,
    input: String,
    output_inline: Option<String>,
    status: String,
}

fn tool_call_from_row(row: &Row<'_>) -> rusqlite::Result<RawToolCall> {
    Ok(RawToolCall {
        record: ToolCallRecord {
            id: row.get(0)?,
            execution_id: row.get(1)?,
            agent_id: row.get(2)?,
            node_id: row.get(3)?,
            tool_name: row.get(4)?,
            input: Value::Null,
            output_inline: None,
            output_hash: row.get(7)?,
            output_size: row.get::<_, Option<i64>>(8)?.map(from_sql_int),
            status: ToolCallStatus::Running,
            error: row.get(10)?,
            started_at: row.get(11)?,
            completed_at: row.get(12)?,
        },
        input: row.get(5)?,
        output_inline: row.get(6)?,
        status: row.get(9)?,
    })
}

impl RawToolCall {
    fn into_record(self) -> Result<ToolCallRecord> {
        let mut record = self.record;
        record.input = serde_json::from_str(&self.input)
            .with_context(|| format!("parse input of tool call {}", record.id))?;
        record.output_inline = from_json(self.output_inline)?;
        record.status = self.status.parse()?;
        Ok(record)
    }
}

const COLUMNS: &str = "id, execution_id, agent_id, node_id, tool_name, input, output_inline, \
     output_hash, output_size, status, error, started_at, completed_at";

impl Store {
    #[instrument(skip_all, fields(tool = call.tool_name))]
    pub fn start_tool_call(&self, call: &NewToolCall<'_>) -> Result<String> {
        let id = new_id();
        let input = to_json(call.input)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tool_calls(id, execution_id, agent_id, node_id, tool_name, input, status, started_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    call.execution_id,
                    call.agent_id,
                    call.node_id,
                    call.tool_name,
                    input,
                    ToolCallStatus::Running.as_str(),
                    now()
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Finalize a running tool call, spilling a large output to the blob dir.
    #[instrument(skip_all, fields(id, status = status.as_str()))]
    pub fn finish_tool_call(
        &self,
        id: &str,
        status: ToolCallStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<()> {
        let serialized = output.map(to_json).transpose()?;
        let spilled = match &serialized {
            Some(raw) if raw.len() > self.spill_threshold => {
                let hash = write_blob(&self.blob_dir(), raw.as_bytes())?;
                debug!(hash = %hash, size = raw.len(), "spilled tool output");
                Some((hash, raw.len() as u64))
            }
            _ => None,
        };
        let inline = if spilled.is_some() { None } else { serialized };

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let current: Option<(String, String)> = tx
                .query_row(
                    "SELECT status, execution_id FROM tool_calls WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((current, execution_id)) = current else {
                return Err(state_error(StateError::NotFound {
                    kind: "tool call",
                    id: id.to_string(),
                }));
            };
            if current != ToolCallStatus::Running.as_str() {
                return Err(state_error(StateError::AlreadyFinalized {
                    kind: "tool call",
                    id: id.to_string(),
                    status: current,
                }));
            }
            let ts = now();
            tx.execute(
                "UPDATE tool_calls SET status = ?2, output_inline = ?3, output_hash = ?4, \
                 output_size = ?5, error = ?6, completed_at = ?7 WHERE id = ?1",
                params![
                    id,
                    status.as_str(),
                    inline,
                    spilled.as_ref().map(|(hash, _)| hash.as_str()),
                    spilled.as_ref().map(|(_, size)| to_sql_int(*size)),
                    error,
                    ts
                ],
            )?;
            if let Some((hash, size)) = &spilled {
                tx.execute(
                    "INSERT INTO artifacts(id, execution_id, tool_call_id, kind, hash, size, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![new_id(), execution_id, id, OUTPUT_ARTIFACT, hash, to_sql_int(*size), ts],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_tool_call(&self, id: &str) -> Result<Option<ToolCallRecord>> {
        let raw = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM tool_calls WHERE id = ?1"),
                    params![id],
                    tool_call_from_row,
                )
                .optional()?)
        })?;
        raw.map(RawToolCall::into_record).transpose()
    }

    /// Output of a finished tool call, read back from the blob dir if spilled.
    pub fn tool_call_output(&self, id: &str) -> Result<Option<Value>> {
        let Some(record) = self.get_tool_call(id)? else {
            return Err(state_error(StateError::NotFound {
                kind: "tool call",
                id: id.to_string(),
            }));
        };
        if let Some(hash) = &record.output_hash {
            let bytes = self.read_blob(hash)?;
            let value = serde_json::from_slice(&bytes)
                .with_context(|| format!("parse blob {hash}"))?;
            return Ok(Some(value));
        }
        Ok(record.output_inline)
    }

    pub fn list_tool_calls(&self, execution_id: &str) -> Result<Vec<ToolCallRecord>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM tool_calls WHERE execution_id = ?1 ORDER BY started_at, rowid"
            ))?;
            let rows = stmt
                .query_map(params![execution_id], tool_call_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(RawToolCall::into_record).collect()
    }

    pub fn list_artifacts(&self, execution_id: &str) -> Result<Vec<ArtifactRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, execution_id, tool_call_id, kind, hash, size, created_at \
                 FROM artifacts WHERE execution_id = ?1 ORDER BY created_at, rowid",
            )?;
            let rows = stmt
                .query_map(params![execution_id], |row| {
                    Ok(ArtifactRecord {
                        id: row.get(0)?,
                        execution_id: row.get(1)?,
                        tool_call_id: row.get(2)?,
                        kind: row.get(3)?,
                        hash: row.get(4)?,
                        size: from_sql_int(row.get(5)?),
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn read_blob(&self, hash: &str) -> Result<Vec<u8>> {
        let path = blob_path(&self.blob_dir(), hash)?;
        fs::read(&path).with_context(|| format!("read blob {}", path.display()))
    }
}

/// Write `bytes` under their SHA-256 hash (no-op when already present).
fn write_blob(dir: &Path, bytes: &[u8]) -> Result<String> {
    let hash = hex::encode(Sha256::digest(bytes));
    let path = blob_path(dir, &hash)?;
    if path.exists() {
        return Ok(hash);
    }
    fs::create_dir_all(dir).with_context(|| format!("create blob dir {}", dir.display()))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes)
        .with_context(|| format!("write temp blob {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &path).with_context(|| format!("replace blob {}", path.display()))?;
    Ok(hash)
}

fn blob_path(dir: &Path, hash: &str) -> Result<PathBuf> {
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(anyhow::anyhow!("invalid blob hash '{hash}'"));
    }
    Ok(dir.join(hash))
}
