//! Table definitions. Installed idempotently on every open.

use anyhow::Result;
use rusqlite::Connection;

pub(super) fn install(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS executions (
          id TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          source_ref TEXT,
          status TEXT NOT NULL,
          config TEXT NOT NULL,
          parent_execution_id TEXT REFERENCES executions(id),
          started_at TEXT NOT NULL,
          completed_at TEXT,
          iterations INTEGER NOT NULL DEFAULT 0,
          total_agents INTEGER NOT NULL DEFAULT 0,
          total_tool_calls INTEGER NOT NULL DEFAULT 0,
          total_tokens INTEGER NOT NULL DEFAULT 0,
          error TEXT,
          end_reason TEXT
        );

        CREATE TABLE IF NOT EXISTS phases (
          id TEXT PRIMARY KEY,
          execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
          name TEXT NOT NULL,
          iteration INTEGER NOT NULL,
          status TEXT NOT NULL,
          error TEXT,
          started_at TEXT NOT NULL,
          completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS steps (
          id TEXT PRIMARY KEY,
          execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
          phase_id TEXT REFERENCES phases(id),
          name TEXT NOT NULL,
          status TEXT NOT NULL,
          snapshot_before TEXT,
          snapshot_after TEXT,
          commit_id TEXT,
          error TEXT,
          started_at TEXT NOT NULL,
          completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS agents (
          id TEXT PRIMARY KEY,
          execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
          node_id TEXT NOT NULL,
          prompt TEXT NOT NULL,
          model TEXT NOT NULL,
          status TEXT NOT NULL,
          output TEXT,
          structured TEXT,
          tokens_input INTEGER NOT NULL DEFAULT 0,
          tokens_output INTEGER NOT NULL DEFAULT 0,
          turns_used INTEGER NOT NULL DEFAULT 0,
          stop_reason TEXT,
          error TEXT,
          started_at TEXT NOT NULL,
          completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS tool_calls (
          id TEXT PRIMARY KEY,
          execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
          agent_id TEXT,
          node_id TEXT,
          tool_name TEXT NOT NULL,
          input TEXT NOT NULL,
          output_inline TEXT,
          output_hash TEXT,
          output_size INTEGER,
          status TEXT NOT NULL,
          error TEXT,
          started_at TEXT NOT NULL,
          completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS state (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL,
          version INTEGER NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS transitions (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          key TEXT NOT NULL,
          old_value TEXT,
          new_value TEXT,
          cause TEXT NOT NULL,
          created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS transitions_key ON transitions(key, seq);

        CREATE TABLE IF NOT EXISTS artifacts (
          id TEXT PRIMARY KEY,
          execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
          tool_call_id TEXT REFERENCES tool_calls(id),
          kind TEXT NOT NULL,
          hash TEXT NOT NULL,
          size INTEGER NOT NULL,
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS commits (
          id TEXT PRIMARY KEY,
          execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
          step_id TEXT REFERENCES steps(id),
          changeset_id TEXT NOT NULL,
          change_id TEXT NOT NULL,
          description TEXT NOT NULL,
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS snapshots (
          id TEXT PRIMARY KEY,
          execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
          tool_call_id TEXT REFERENCES tool_calls(id),
          changeset_id TEXT NOT NULL,
          change_id TEXT NOT NULL,
          description TEXT NOT NULL,
          delta TEXT NOT NULL,
          has_conflicts INTEGER NOT NULL,
          is_empty INTEGER NOT NULL,
          parent_change_id TEXT,
          bookmarks TEXT NOT NULL,
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS reviews (
          id TEXT PRIMARY KEY,
          execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
          target TEXT NOT NULL,
          reviewer TEXT NOT NULL,
          approved INTEGER NOT NULL,
          summary TEXT NOT NULL,
          issues TEXT NOT NULL,
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS reports (
          id TEXT PRIMARY KEY,
          execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
          agent_id TEXT,
          kind TEXT NOT NULL,
          title TEXT NOT NULL,
          content TEXT NOT NULL,
          data TEXT,
          severity TEXT,
          created_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}
