use rusqlite::{params, Connection, OptionalExtension};

use super::outcome::{Outcome, OutcomeEvent};
use crate::database::Database;
use crate::error::MemKeeperError;
use crate::utils::Utils;

/// A sanitized event ready to be appended
#[derive(Debug, Clone)]
pub struct NewOutcomeEvent<'a> {
    pub session_id: &'a str,
    pub tool_name: &'a str,
    pub outcome: Outcome,
    pub input: &'a str,
    pub message: &'a str,
}

/// Append-only access to `outcome_events`.
///
/// "Most recent" always means `ORDER BY created_at DESC, event_id DESC`, which is
/// total within a session because event ids are unique.
pub struct OutcomeEventStore;

impl OutcomeEventStore {
    /// Insert `event`, chained to the session's current latest event.
    ///
    /// The predecessor lookup and the insert share one IMMEDIATE transaction, so the
    /// chain reflects insertion order as seen by this writer.
    pub fn insert_chained(
        conn: &Connection,
        event: &NewOutcomeEvent<'_>,
        created_at: i64,
    ) -> Result<OutcomeEvent, MemKeeperError> {
        Database::immediate_transaction(conn, |c| {
            let preceding_id = Self::latest(c, event.session_id)?.map(|e| e.event_id);

            c.execute(
                "INSERT INTO outcome_events
                    (session_id, tool_name, outcome, input, message, preceding_id, analyzed, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
                params![
                    event.session_id,
                    event.tool_name,
                    event.outcome.as_i64(),
                    event.input,
                    event.message,
                    preceding_id,
                    created_at
                ],
            )?;

            Ok(OutcomeEvent {
                event_id: c.last_insert_rowid(),
                session_id: event.session_id.to_string(),
                tool_name: event.tool_name.to_string(),
                outcome: event.outcome,
                input: event.input.to_string(),
                message: event.message.to_string(),
                preceding_id,
                analyzed: false,
                created_at,
            })
        })
    }

    pub fn latest(conn: &Connection, session_id: &str) -> Result<Option<OutcomeEvent>, MemKeeperError> {
        let sql = format!(
            "SELECT {} FROM outcome_events
             WHERE session_id = ?
             ORDER BY created_at DESC, event_id DESC
             LIMIT 1",
            OutcomeEvent::COLUMNS
        );
        let event = conn
            .query_row(&sql, [session_id], OutcomeEvent::from_row)
            .optional()?;
        Ok(event)
    }

    /// The `limit` most recent events of the session, returned oldest first
    pub fn recent(
        conn: &Connection,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<OutcomeEvent>, MemKeeperError> {
        let sql = format!(
            "SELECT {} FROM outcome_events
             WHERE session_id = ?
             ORDER BY created_at DESC, event_id DESC
             LIMIT ?",
            OutcomeEvent::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut events = stmt
            .query_map(
                params![session_id, Utils::usize_to_i64(limit)],
                OutcomeEvent::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        events.reverse();
        Ok(events)
    }

    /// Flag events as analyzed. The only mutation an event ever sees.
    pub fn mark_analyzed(conn: &Connection, event_ids: &[i64]) -> Result<usize, MemKeeperError> {
        Database::immediate_transaction(conn, |c| {
            let mut stmt = c.prepare("UPDATE outcome_events SET analyzed = 1 WHERE event_id = ?")?;
            let mut updated = 0;
            for id in event_ids {
                updated += stmt.execute([id])?;
            }
            Ok(updated)
        })
    }

    pub fn count_for_session(conn: &Connection, session_id: &str) -> Result<usize, MemKeeperError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outcome_events WHERE session_id = ?",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(Utils::i64_to_usize(count))
    }
}
