//! Append-only history rows: snapshots, commits, reviews and reports.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Store, from_json, new_id, now, to_json};
use crate::core::types::FileDelta;
use crate::io::vcs::Changeset;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub execution_id: String,
    pub tool_call_id: Option<String>,
    pub changeset_id: String,
    pub change_id: String,
    pub description: String,
    pub delta: FileDelta,
    pub has_conflicts: bool,
    pub is_empty: bool,
    pub parent_change_id: Option<String>,
    pub bookmarks: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitRecord {
    pub id: String,
    pub execution_id: String,
    pub step_id: Option<String>,
    pub changeset_id: String,
    pub change_id: String,
    pub description: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewReview<'a> {
    pub execution_id: &'a str,
    pub target: &'a str,
    pub reviewer: &'a str,
    pub approved: bool,
    pub summary: &'a str,
    pub issues: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewRecord {
    pub id: String,
    pub execution_id: String,
    pub target: String,
    pub reviewer: String,
    pub approved: bool,
    pub summary: String,
    pub issues: Vec<String>,
    pub created_at: String,
}

/// Category of a report row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Progress,
    Finding,
    Warning,
    Error,
    Metric,
    Decision,
}

impl ReportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Finding => "finding",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Metric => "metric",
            Self::Decision => "decision",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "progress" => Ok(Self::Progress),
            "finding" => Ok(Self::Finding),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "metric" => Ok(Self::Metric),
            "decision" => Ok(Self::Decision),
            other => Err(anyhow!("unknown report kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewReport<'a> {
    pub execution_id: &'a str,
    pub agent_id: Option<&'a str>,
    pub kind: ReportKind,
    pub title: &'a str,
    pub content: &'a str,
    pub data: Option<&'a Value>,
    pub severity: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRecord {
    pub id: String,
    pub execution_id: String,
    pub agent_id: Option<String>,
    pub kind: ReportKind,
    pub title: String,
    pub content: String,
    pub data: Option<Value>,
    pub severity: Option<String>,
    pub created_at: String,
}

impl Store {
    /// Record a snapshot changeset taken for `execution_id`.
    pub fn record_snapshot(
        &self,
        execution_id: &str,
        tool_call_id: Option<&str>,
        changeset: &Changeset,
        delta: &FileDelta,
    ) -> Result<String> {
        let id = new_id();
        let delta_raw = serde_json::to_string(delta).context("serialize delta")?;
        let bookmarks = serde_json::to_string(&changeset.bookmarks).context("serialize bookmarks")?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO snapshots(id, execution_id, tool_call_id, changeset_id, change_id, description, \
                 delta, has_conflicts, is_empty, parent_change_id, bookmarks, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    id,
                    execution_id,
                    tool_call_id,
                    changeset.id,
                    changeset.change_id,
                    changeset.description,
                    delta_raw,
                    changeset.has_conflicts,
                    changeset.is_empty,
                    changeset.parent_ids.first(),
                    bookmarks,
                    changeset.timestamp
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn list_snapshots(&self, execution_id: &str) -> Result<Vec<SnapshotRecord>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, execution_id, tool_call_id, changeset_id, change_id, description, delta, \
                 has_conflicts, is_empty, parent_change_id, bookmarks, created_at \
                 FROM snapshots WHERE execution_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map(params![execution_id], |row| {
                    Ok((
                        SnapshotRecord {
                            id: row.get(0)?,
                            execution_id: row.get(1)?,
                            tool_call_id: row.get(2)?,
                            changeset_id: row.get(3)?,
                            change_id: row.get(4)?,
                            description: row.get(5)?,
                            delta: FileDelta::default(),
                            has_conflicts: row.get(7)?,
                            is_empty: row.get(8)?,
                            parent_change_id: row.get(9)?,
                            bookmarks: Vec::new(),
                            created_at: row.get(11)?,
                        },
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(10)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(mut record, delta, bookmarks)| {
                record.delta = serde_json::from_str(&delta).context("parse snapshot delta")?;
                record.bookmarks =
                    serde_json::from_str(&bookmarks).context("parse snapshot bookmarks")?;
                Ok(record)
            })
            .collect()
    }

    pub fn record_commit(
        &self,
        execution_id: &str,
        step_id: Option<&str>,
        changeset: &Changeset,
    ) -> Result<String> {
        let id = new_id();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO commits(id, execution_id, step_id, changeset_id, change_id, description, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    execution_id,
                    step_id,
                    changeset.id,
                    changeset.change_id,
                    changeset.description,
                    now()
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn list_commits(&self, execution_id: &str) -> Result<Vec<CommitRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, execution_id, step_id, changeset_id, change_id, description, created_at \
                 FROM commits WHERE execution_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map(params![execution_id], |row| {
                    Ok(CommitRecord {
                        id: row.get(0)?,
                        execution_id: row.get(1)?,
                        step_id: row.get(2)?,
                        changeset_id: row.get(3)?,
                        change_id: row.get(4)?,
                        description: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn add_review(&self, review: &NewReview<'_>) -> Result<String> {
        let id = new_id();
        let issues = serde_json::to_string(review.issues).context("serialize review issues")?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO reviews(id, execution_id, target, reviewer, approved, summary, issues, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    review.execution_id,
                    review.target,
                    review.reviewer,
                    review.approved,
                    review.summary,
                    issues,
                    now()
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn list_reviews(&self, execution_id: &str) -> Result<Vec<ReviewRecord>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, execution_id, target, reviewer, approved, summary, issues, created_at \
                 FROM reviews WHERE execution_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map(params![execution_id], |row| {
                    Ok((
                        ReviewRecord {
                            id: row.get(0)?,
                            execution_id: row.get(1)?,
                            target: row.get(2)?,
                            reviewer: row.get(3)?,
                            approved: row.get(4)?,
                            summary: row.get(5)?,
                            issues: Vec::new(),
                            created_at: row.get(7)?,
                        },
                        row.get::<_, String>(6)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(mut record, issues)| {
                record.issues = serde_json::from_str(&issues).context("parse review issues")?;
                Ok(record)
            })
            .collect()
    }

    pub fn add_report(&self, report: &NewReport<'_>) -> Result<String> {
        let id = new_id();
        let data = report.data.map(to_json).transpose()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO reports(id, execution_id, agent_id, kind, title, content, data, severity, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    report.execution_id,
                    report.agent_id,
                    report.kind.as_str(),
                    report.title,
                    report.content,
                    data,
                    report.severity,
                    now()
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn list_reports(&self, execution_id: &str) -> Result<Vec<ReportRecord>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, execution_id, agent_id, kind, title, content, data, severity, created_at \
                 FROM reports WHERE execution_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map(params![execution_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(
                |(id, execution_id, agent_id, kind, title, content, data, severity, created_at)| {
                    Ok(ReportRecord {
                        id,
                        execution_id,
                        agent_id,
                        kind: kind.parse()?,
                        title,
                        content,
                        data: from_json(data)?,
                        severity,
                        created_at,
                    })
                },
            )
            .collect()
    }
}
