//! SQLite-backed persistent state.
//!
//! One database file (`state.db`) per state directory holds the key-value
//! state with its transition log and every execution record. Large tool
//! outputs are written to `blobs/` under their SHA-256 hash.
//!
//! [`Store`] is a cheap clone over a shared connection; the record APIs are
//! split across the submodules as `impl Store` blocks.

mod agents;
mod executions;
mod history;
mod schema;
mod state;
mod tool_calls;
mod units;

pub use agents::{AgentCompletion, AgentRecord, NewAgent};
pub use executions::ExecutionRecord;
pub use history::{
    CommitRecord, NewReport, NewReview, ReportKind, ReportRecord, ReviewRecord, SnapshotRecord,
};
pub use state::{StateEntry, Transition};
pub use tool_calls::{ArtifactRecord, NewToolCall, ToolCallRecord};
pub use units::{PhaseRecord, StepRecord};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::errors::{ConductorError, StateError};

/// Default size above which tool outputs are spilled to the blob directory.
pub const DEFAULT_SPILL_THRESHOLD: usize = 1024;

const DB_FILE: &str = "state.db";
const BLOB_DIR: &str = "blobs";

/// Shared handle to the state database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Option<Connection>>>,
    state_dir: PathBuf,
    spill_threshold: usize,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("state_dir", &self.state_dir)
            .field("spill_threshold", &self.spill_threshold)
            .finish()
    }
}

impl Store {
    /// Open (or create) the store in `state_dir`.
    #[instrument(skip_all, fields(state_dir = %state_dir.as_ref().display()))]
    pub fn open(state_dir: impl AsRef<Path>) -> Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        fs::create_dir_all(state_dir.join(BLOB_DIR))
            .with_context(|| format!("create state dir {}", state_dir.display()))?;

        let db_path = state_dir.join(DB_FILE);
        let conn = Connection::open(&db_path)
            .with_context(|| format!("open state db {}", db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        schema::install(&conn).context("install schema")?;
        debug!("state store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            state_dir,
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
        })
    }

    pub fn with_spill_threshold(mut self, bytes: usize) -> Self {
        self.spill_threshold = bytes;
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.state_dir.join(BLOB_DIR)
    }

    /// Close the connection; every later call fails with [`StateError::Closed`].
    pub fn close(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))?;
        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, err)| anyhow!("close state db: {err}"))?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().map(|g| g.is_none()).unwrap_or(true)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))?;
        let conn = guard.as_mut().ok_or_else(|| state_error(StateError::Closed))?;
        f(conn)
    }
}

pub(crate) fn state_error(err: StateError) -> anyhow::Error {
    ConductorError::State(err).into()
}

pub(crate) fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn to_json(value: &Value) -> Result<String> {
    serde_json::to_string(value).context("serialize json")
}

pub(crate) fn from_json(raw: Option<String>) -> Result<Option<Value>> {
    raw.map(|s| serde_json::from_str(&s).with_context(|| format!("parse stored json '{s}'")))
        .transpose()
}

pub(crate) fn to_sql_int(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_int(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}
