//! Key-value state with an append-only transition log.
//!
//! Writes are last-writer-wins per key; [`Store::compare_and_set`] offers an
//! optimistic alternative keyed on the row version. JSON `null` is stored
//! like any other value; only [`Store::delete_state`] removes a key. Every
//! write, including deletes, appends one transition.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Transaction, params};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{Store, from_json, now, state_error, to_json};
use crate::errors::StateError;

/// Current value of a key with its version (1 on first write).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateEntry {
    pub value: Value,
    pub version: i64,
}

/// One logged state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub seq: i64,
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub trigger: String,
    pub created_at: String,
}

impl Store {
    pub fn get_state(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.get_state_versioned(key)?.map(|entry| entry.value))
    }

    pub fn get_state_versioned(&self, key: &str) -> Result<Option<StateEntry>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT value, version FROM state WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;
            row.map(|(raw, version)| {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("parse state value for {key}"))?;
                Ok(StateEntry { value, version })
            })
            .transpose()
        })
    }

    /// Last-writer-wins write. Returns the new version.
    #[instrument(skip_all, fields(key, trigger))]
    pub fn set_state(&self, key: &str, value: &Value, trigger: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let version = write_tx(&tx, key, Some(value), trigger)?;
            tx.commit()?;
            debug!(version, "state written");
            Ok(version)
        })
    }

    /// Remove `key`; the transition records `None` as the new value.
    #[instrument(skip_all, fields(key, trigger))]
    pub fn delete_state(&self, key: &str, trigger: &str) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            write_tx(&tx, key, None, trigger)?;
            tx.commit()?;
            debug!("state deleted");
            Ok(())
        })
    }

    /// Write only when the stored version matches `expected_version`
    /// (`None` means the key must be absent).
    #[instrument(skip_all, fields(key, trigger, expected_version))]
    pub fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<i64>,
        value: &Value,
        trigger: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let actual = current_tx(&tx, key)?.map(|(_, version)| version);
            if actual != expected_version {
                return Err(state_error(StateError::VersionConflict {
                    key: key.to_string(),
                    expected: expected_version,
                    actual,
                }));
            }
            let version = write_tx(&tx, key, Some(value), trigger)?;
            tx.commit()?;
            Ok(version)
        })
    }

    /// Apply several writes atomically.
    pub fn set_many(&self, entries: &[(&str, Value)], trigger: &str) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for (key, value) in entries {
                write_tx(&tx, key, Some(value), trigger)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Every current key and value.
    pub fn snapshot_state(&self) -> Result<BTreeMap<String, Value>> {
        self.state_with_prefix("")
    }

    /// Current keys starting with `prefix`.
    pub fn state_with_prefix(&self, prefix: &str) -> Result<BTreeMap<String, Value>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM state WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
            )?;
            let rows = stmt
                .query_map(params![prefix], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(key, raw)| {
                    let value = serde_json::from_str(&raw)
                        .with_context(|| format!("parse state value for {key}"))?;
                    Ok((key, value))
                })
                .collect()
        })
    }

    /// Transition log, oldest first. `key = None` returns every key.
    pub fn transitions(&self, key: Option<&str>, limit: usize) -> Result<Vec<Transition>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, key, old_value, new_value, cause, created_at FROM transitions \
                 WHERE ?1 IS NULL OR key = ?1 ORDER BY seq DESC LIMIT ?2",
            )?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt
                .query_map(params![key, limit], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut out = rows
                .into_iter()
                .map(|(seq, key, old, new, trigger, created_at)| {
                    Ok(Transition {
                        seq,
                        key,
                        old_value: from_json(old)?,
                        new_value: from_json(new)?,
                        trigger,
                        created_at,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            out.reverse();
            Ok(out)
        })
    }

    /// Rebuild the key-value map from the transition log alone.
    pub fn replay_transitions(&self) -> Result<BTreeMap<String, Value>> {
        let mut map = BTreeMap::new();
        for transition in self.transitions(None, usize::MAX)? {
            match transition.new_value {
                Some(value) => {
                    map.insert(transition.key, value);
                }
                None => {
                    map.remove(&transition.key);
                }
            }
        }
        Ok(map)
    }
}

fn current_tx(tx: &Transaction<'_>, key: &str) -> Result<Option<(String, i64)>> {
    Ok(tx
        .query_row(
            "SELECT value, version FROM state WHERE key = ?1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

/// Write `value`, or delete the key when `value` is `None`.
fn write_tx(tx: &Transaction<'_>, key: &str, value: Option<&Value>, trigger: &str) -> Result<i64> {
    let ts = now();
    let current = current_tx(tx, key)?;
    let old_raw = current.as_ref().map(|(raw, _)| raw.clone());

    let (new_raw, version) = if let Some(value) = value {
        let raw = to_json(value)?;
        let version = current.map_or(1, |(_, v)| v + 1);
        tx.execute(
            "INSERT INTO state(key, value, version, updated_at) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, version = excluded.version, \
             updated_at = excluded.updated_at",
            params![key, raw, version, ts],
        )?;
        (Some(raw), version)
    } else {
        tx.execute("DELETE FROM state WHERE key = ?1", params![key])?;
        (None, 0)
    };

    tx.execute(
        "INSERT INTO transitions(key, old_value, new_value, cause, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![key, old_raw, new_raw, trigger, ts],
    )?;
    Ok(version)
}
