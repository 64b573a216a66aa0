use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::MemKeeperError;

/// `(tool_count, last_analysis_count)` read together in one statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub tool_count: i64,
    pub last_analysis_count: i64,
}

impl CounterSnapshot {
    /// Events recorded since the last claimed batch
    pub fn delta(&self) -> i64 {
        self.tool_count - self.last_analysis_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionCounterRow {
    pub session_id: String,
    pub tool_count: i64,
    pub last_analysis_count: i64,
    pub updated_at: i64,
}

/// Per-session counters in `session_counters`.
///
/// `tool_count` only grows. `last_analysis_count` only moves through `try_claim`,
/// a compare-and-swap against the value a claimant read in its snapshot.
pub struct SessionCounter;

impl SessionCounter {
    /// Upsert the row and add one to `tool_count`
    pub fn increment(conn: &Connection, session_id: &str, now: i64) -> Result<(), MemKeeperError> {
        conn.execute(
            "INSERT INTO session_counters (session_id, tool_count, last_analysis_count, updated_at)
             VALUES (?, 1, 0, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                tool_count = tool_count + 1,
                updated_at = excluded.updated_at",
            params![session_id, now],
        )?;
        Ok(())
    }

    pub fn snapshot(conn: &Connection, session_id: &str) -> Result<Option<CounterSnapshot>, MemKeeperError> {
        let snapshot = conn
            .query_row(
                "SELECT tool_count, last_analysis_count FROM session_counters WHERE session_id = ?",
                [session_id],
                |row| {
                    Ok(CounterSnapshot {
                        tool_count: row.get(0)?,
                        last_analysis_count: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }

    /// Claim the batch `snapshot` describes: advance `last_analysis_count` to
    /// `snapshot.tool_count` only if it still equals `snapshot.last_analysis_count`.
    ///
    /// Returns false when another writer claimed first. A single conditional UPDATE
    /// is atomic in SQLite, so this is race free across processes.
    pub fn try_claim(
        conn: &Connection,
        session_id: &str,
        snapshot: &CounterSnapshot,
        now: i64,
    ) -> Result<bool, MemKeeperError> {
        let rows = conn.execute(
            "UPDATE session_counters
             SET last_analysis_count = ?, updated_at = ?
             WHERE session_id = ? AND last_analysis_count = ?",
            params![
                snapshot.tool_count,
                now,
                session_id,
                snapshot.last_analysis_count
            ],
        )?;
        Ok(rows == 1)
    }

    /// Returns true if a row was deleted
    pub fn delete(conn: &Connection, session_id: &str) -> Result<bool, MemKeeperError> {
        let rows = conn.execute(
            "DELETE FROM session_counters WHERE session_id = ?",
            [session_id],
        )?;
        Ok(rows == 1)
    }

    /// All counters, most recently updated first
    pub fn list(conn: &Connection) -> Result<Vec<SessionCounterRow>, MemKeeperError> {
        let mut stmt = conn.prepare(
            "SELECT session_id, tool_count, last_analysis_count, updated_at
             FROM session_counters
             ORDER BY updated_at DESC, session_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SessionCounterRow {
                    session_id: row.get(0)?,
                    tool_count: row.get(1)?,
                    last_analysis_count: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
