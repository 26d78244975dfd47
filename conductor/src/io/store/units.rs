//! Phase and step rows.

use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;

use super::{Store, new_id, now, state_error};
use crate::core::types::UnitStatus;
use crate::errors::StateError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseRecord {
    pub id: String,
    pub execution_id: String,
    pub name: String,
    pub iteration: u32,
    pub status: UnitStatus,
    pub error: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub id: String,
    pub execution_id: String,
    pub phase_id: Option<String>,
    pub name: String,
    pub status: UnitStatus,
    pub snapshot_before: Option<String>,
    pub snapshot_after: Option<String>,
    pub commit_id: Option<String>,
    pub error: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

fn phase_from_row(row: &Row<'_>) -> rusqlite::Result<(PhaseRecord, String)> {
    Ok((
        PhaseRecord {
            id: row.get(0)?,
            execution_id: row.get(1)?,
            name: row.get(2)?,
            iteration: row.get(3)?,
            status: UnitStatus::Pending,
            error: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
        },
        row.get(4)?,
    ))
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<(StepRecord, String)> {
    Ok((
        StepRecord {
            id: row.get(0)?,
            execution_id: row.get(1)?,
            phase_id: row.get(2)?,
            name: row.get(3)?,
            status: UnitStatus::Pending,
            snapshot_before: row.get(5)?,
            snapshot_after: row.get(6)?,
            commit_id: row.get(7)?,
            error: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
        },
        row.get(4)?,
    ))
}

impl Store {
    pub fn start_phase(&self, execution_id: &str, name: &str, iteration: u32) -> Result<String> {
        let id = new_id();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO phases(id, execution_id, name, iteration, status, started_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, execution_id, name, iteration, UnitStatus::Running.as_str(), now()],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn finish_phase(&self, id: &str, status: UnitStatus, error: Option<&str>) -> Result<()> {
        self.finish_unit("phases", "phase", id, status, error)
    }

    pub fn list_phases(&self, execution_id: &str) -> Result<Vec<PhaseRecord>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, execution_id, name, iteration, status, error, started_at, completed_at \
                 FROM phases WHERE execution_id = ?1 ORDER BY started_at, rowid",
            )?;
            let rows = stmt
                .query_map(params![execution_id], phase_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(mut record, status)| {
                record.status = status.parse()?;
                Ok(record)
            })
            .collect()
    }

    pub fn start_step(
        &self,
        execution_id: &str,
        phase_id: Option<&str>,
        name: &str,
        snapshot_before: Option<&str>,
    ) -> Result<String> {
        let id = new_id();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO steps(id, execution_id, phase_id, name, status, snapshot_before, started_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    execution_id,
                    phase_id,
                    name,
                    UnitStatus::Running.as_str(),
                    snapshot_before,
                    now()
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn finish_step(
        &self,
        id: &str,
        status: UnitStatus,
        snapshot_after: Option<&str>,
        commit_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        self.finish_unit("steps", "step", id, status, error)?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE steps SET snapshot_after = ?2, commit_id = ?3 WHERE id = ?1",
                params![id, snapshot_after, commit_id],
            )?;
            Ok(())
        })
    }

    pub fn list_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, execution_id, phase_id, name, status, snapshot_before, snapshot_after, \
                 commit_id, error, started_at, completed_at \
                 FROM steps WHERE execution_id = ?1 ORDER BY started_at, rowid",
            )?;
            let rows = stmt
                .query_map(params![execution_id], step_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(mut record, status)| {
                record.status = status.parse()?;
                Ok(record)
            })
            .collect()
    }

    fn finish_unit(
        &self,
        table: &'static str,
        kind: &'static str,
        id: &str,
        status: UnitStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let current: Option<String> = tx
                .query_row(
                    &format!("SELECT status FROM {table} WHERE id = ?1"),
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match current.as_deref() {
                None => {
                    return Err(state_error(StateError::NotFound {
                        kind,
                        id: id.to_string(),
                    }));
                }
                Some(s) if s != UnitStatus::Running.as_str() => {
                    return Err(state_error(StateError::AlreadyFinalized {
                        kind,
                        id: id.to_string(),
                        status: s.to_string(),
                    }));
                }
                Some(_) => {}
            }
            tx.execute(
                &format!("UPDATE {table} SET status = ?2, error = ?3, completed_at = ?4 WHERE id = ?1"),
                params![id, status.as_str(), error, now()],
            )?;
            tx.commit()?;
            Ok(())
        })
    }
}
