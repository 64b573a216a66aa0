use log::{debug, error, info, Level};
use logging_timer::timer;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::analyzer::{Analyzer, KnowledgeEntry, KnowledgeSink, PatternCandidate};
use super::counter::{CounterSnapshot, SessionCounter};
use super::event_store::OutcomeEventStore;
use super::outcome::OutcomeEvent;
use crate::background::{panic_message, BackgroundTasks};
use crate::config::OutcomeConfig;
use crate::database::Database;
use crate::error::MemKeeperError;
use crate::utils::Utils;

/// A batch this process won the right to analyze
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedBatch {
    pub session_id: String,
    pub snapshot: CounterSnapshot,
    /// Oldest first
    pub events: Vec<OutcomeEvent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionEndReport {
    /// A final batch was claimed and handed to the analyzer
    pub dispatched: bool,
    /// The session had a counter row (now deleted)
    pub counter_existed: bool,
}

/// Decides when a session has accumulated enough new events to analyze, and
/// claims them so that exactly one writer analyzes each batch.
///
/// The claim is a compare-and-swap on the persisted counter, so it holds across
/// independent processes sharing the database. Losing a claim is an expected
/// outcome and is never reported as an error.
pub struct BatchTrigger {
    db: Database,
    analyzer: Arc<dyn Analyzer>,
    sink: Arc<dyn KnowledgeSink>,
    config: OutcomeConfig,
    background: BackgroundTasks,
}

impl BatchTrigger {
    /// Must be called from within a tokio runtime
    pub fn new(
        db: Database,
        config: OutcomeConfig,
        analyzer: Arc<dyn Analyzer>,
        sink: Arc<dyn KnowledgeSink>,
    ) -> Result<Self, MemKeeperError> {
        Ok(Self {
            db,
            analyzer,
            sink,
            config,
            background: BackgroundTasks::new()?,
        })
    }

    /// Snapshot, threshold check, CAS claim, batch fetch.
    ///
    /// Returns None when there is nothing to claim or another writer claimed first.
    pub fn check_and_claim(
        &self,
        session_id: &str,
        threshold: i64,
    ) -> Result<Option<ClaimedBatch>, MemKeeperError> {
        let _tmr = timer!(Level::Trace; "BatchTrigger::check_and_claim", "{}", session_id);
        let conn = self.db.get_connection()?;

        let Some(snapshot) = SessionCounter::snapshot(&conn, session_id)? else {
            return Ok(None);
        };

        let delta = snapshot.delta();
        if delta < threshold.max(1) {
            return Ok(None);
        }

        if !SessionCounter::try_claim(&conn, session_id, &snapshot, Utils::now_millis())? {
            info!(
                "Claim lost for session {}: another writer took the batch at {}",
                session_id, snapshot.last_analysis_count
            );
            return Ok(None);
        }

        let events = OutcomeEventStore::recent(&conn, session_id, Utils::i64_to_usize(delta))?;
        info!(
            "Claimed batch of {} event(s) for session {} (tool count {})",
            events.len(),
            session_id,
            snapshot.tool_count
        );

        Ok(Some(ClaimedBatch {
            session_id: session_id.to_string(),
            snapshot,
            events,
        }))
    }

    /// Periodic check after an event is recorded. Returns true if a batch was dispatched.
    pub fn on_event_recorded(&self, session_id: &str) -> Result<bool, MemKeeperError> {
        match self.check_and_claim(session_id, self.config.tool_count_threshold)? {
            Some(batch) => {
                self.dispatch(batch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Final sweep at session termination: claim whatever remains (threshold 1),
    /// dispatch it, then delete the session's counter.
    pub fn end_session(&self, session_id: &str) -> Result<SessionEndReport, MemKeeperError> {
        let mut report = SessionEndReport::default();

        if let Some(batch) = self.check_and_claim(session_id, 1)? {
            self.dispatch(batch);
            report.dispatched = true;
        }

        let conn = self.db.get_connection()?;
        report.counter_existed = SessionCounter::delete(&conn, session_id)?;

        debug!(
            "Session {} ended: final batch dispatched = {}, counter removed = {}",
            session_id, report.dispatched, report.counter_existed
        );

        Ok(report)
    }

    /// Hand a claimed batch to the analyzer, detached. Failures are logged; the claim stands.
    pub fn dispatch(&self, batch: ClaimedBatch) {
        let db = self.db.clone();
        let analyzer = Arc::clone(&self.analyzer);
        let sink = Arc::clone(&self.sink);
        let min_confidence = self.config.min_confidence;

        self.background.spawn_detached("outcome analysis", move || {
            let ClaimedBatch {
                session_id, events, ..
            } = batch;

            let candidates = match Self::run_analyzer(analyzer.as_ref(), &events) {
                Ok(candidates) => candidates,
                Err(e) => {
                    error!(
                        "Batch of {} event(s) for session {} discarded: {}",
                        events.len(),
                        session_id,
                        e
                    );
                    return Ok(());
                }
            };

            let mut stored = 0;
            // Strictly above the configured minimum
            for candidate in candidates.iter().filter(|c| c.confidence > min_confidence) {
                let entry = KnowledgeEntry::from_candidate(&session_id, candidate);
                match sink.store(entry) {
                    Ok(()) => stored += 1,
                    Err(e) => error!(
                        "Failed to store '{}' pattern for session {}: {}",
                        candidate.pattern_type, session_id, e
                    ),
                }
            }

            info!(
                "Analyzed {} event(s) for session {}: {} candidate(s), {} stored",
                events.len(),
                session_id,
                candidates.len(),
                stored
            );

            let ids: Vec<i64> = events.iter().map(|e| e.event_id).collect();
            let conn = db.get_connection()?;
            OutcomeEventStore::mark_analyzed(&conn, &ids)?;
            Ok(())
        });
    }

    /// Wait until every dispatched analysis has finished
    pub async fn wait_for_background(&self) {
        self.background.wait_idle().await;
    }

    /// Analyzer errors and panics both surface as `AnalysisFailure`
    fn run_analyzer(
        analyzer: &dyn Analyzer,
        events: &[OutcomeEvent],
    ) -> Result<Vec<PatternCandidate>, MemKeeperError> {
        match panic::catch_unwind(AssertUnwindSafe(|| analyzer.analyze(events))) {
            Ok(Ok(candidates)) => Ok(candidates),
            Ok(Err(MemKeeperError::AnalysisFailure(msg))) => Err(MemKeeperError::AnalysisFailure(msg)),
            Ok(Err(e)) => Err(MemKeeperError::AnalysisFailure(e.to_string())),
            Err(payload) => Err(MemKeeperError::AnalysisFailure(format!(
                "analyzer panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }
}
