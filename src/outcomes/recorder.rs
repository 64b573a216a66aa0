use log::{debug, error};
use std::sync::Arc;

use super::analyzer::{Analyzer, KnowledgeSink};
use super::counter::SessionCounter;
use super::event_store::{NewOutcomeEvent, OutcomeEventStore};
use super::outcome::{Outcome, OutcomeEvent, ToolCall};
use super::redact;
use super::trigger::{BatchTrigger, SessionEndReport};
use crate::config::OutcomeConfig;
use crate::database::Database;
use crate::error::MemKeeperError;
use crate::utils::Utils;

/// Entry point for the host: records each tool call and drives batch analysis.
///
/// Recording is strictly sequenced: insert the event, then bump the session
/// counter, then check for a claimable batch. Only the analysis itself is detached.
pub struct OutcomeRecorder {
    db: Database,
    config: OutcomeConfig,
    trigger: BatchTrigger,
}

impl OutcomeRecorder {
    /// Must be called from within a tokio runtime
    pub fn new(
        db: Database,
        config: OutcomeConfig,
        analyzer: Arc<dyn Analyzer>,
        sink: Arc<dyn KnowledgeSink>,
    ) -> Result<Self, MemKeeperError> {
        let trigger = BatchTrigger::new(db.clone(), config.clone(), analyzer, sink)?;
        Ok(Self {
            db,
            config,
            trigger,
        })
    }

    pub fn trigger(&self) -> &BatchTrigger {
        &self.trigger
    }

    /// Classify, sanitize and store one tool call.
    ///
    /// A failed insert is returned to the caller and nothing else happens. Everything
    /// after a successful insert is advisory: counter and trigger failures are logged
    /// and the stored event is still returned.
    pub fn record(&self, call: &ToolCall) -> Result<OutcomeEvent, MemKeeperError> {
        if call.session_id.trim().is_empty() {
            return Err(MemKeeperError::InvalidInput(
                "session id must not be empty".to_string(),
            ));
        }

        let outcome = Outcome::classify(call.succeeded, &call.output);
        let input = redact::sanitize(&call.input, self.config.max_input_chars);
        let message = redact::sanitize(&call.output, self.config.max_message_chars);

        let conn = self.db.get_connection()?;
        let event = OutcomeEventStore::insert_chained(
            &conn,
            &NewOutcomeEvent {
                session_id: &call.session_id,
                tool_name: &call.tool_name,
                outcome,
                input: &input,
                message: &message,
            },
            Utils::now_millis(),
        )?;

        debug!(
            "Recorded {} outcome {} for session {} ({})",
            event.outcome, event.event_id, event.session_id, event.tool_name
        );

        if let Err(e) = SessionCounter::increment(&conn, &call.session_id, Utils::now_millis()) {
            error!(
                "Failed to count event {} for session {}: {}",
                event.event_id, call.session_id, e
            );
            return Ok(event);
        }

        // Release the connection before the trigger takes its own
        drop(conn);

        if let Err(e) = self.trigger.on_event_recorded(&call.session_id) {
            error!("Batch check for session {} failed: {}", call.session_id, e);
        }

        Ok(event)
    }

    /// Final claim sweep for a session, then remove its counter
    pub fn end_session(&self, session_id: &str) -> Result<SessionEndReport, MemKeeperError> {
        self.trigger.end_session(session_id)
    }

    /// Wait for every dispatched analysis to finish
    pub async fn shutdown(&self) {
        self.trigger.wait_for_background().await;
    }
}
