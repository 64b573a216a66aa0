use serde::{Deserialize, Serialize};

use super::outcome::OutcomeEvent;
use crate::error::MemKeeperError;
use crate::jobs::Scope;
use crate::utils::Utils;

const MAX_TITLE_CHARS: usize = 80;

/// A recurring pattern the analyzer found in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternCandidate {
    pub pattern_type: String,
    pub description: String,
    pub confidence: f64,
    pub suggested_knowledge: String,
}

/// What the knowledge sink receives for each accepted candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeEntry {
    pub scope: Scope,
    pub title: String,
    pub content: String,
    pub provenance: String,
    pub confidence: f64,
}

impl KnowledgeEntry {
    /// Knowledge learned from a session is scoped to that session
    pub fn from_candidate(session_id: &str, candidate: &PatternCandidate) -> Self {
        let first_line = candidate.description.lines().next().unwrap_or("").trim();
        let title = if first_line.is_empty() {
            candidate.pattern_type.clone()
        } else {
            format!("{}: {}", candidate.pattern_type, first_line)
        };

        KnowledgeEntry {
            scope: Scope::new("session", session_id),
            title: Utils::truncate_chars(&title, MAX_TITLE_CHARS),
            content: candidate.suggested_knowledge.clone(),
            provenance: format!("outcome-analysis:{}", candidate.pattern_type),
            confidence: candidate.confidence,
        }
    }
}

/// Looks for patterns in a claimed batch. Events arrive oldest first.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, events: &[OutcomeEvent]) -> Result<Vec<PatternCandidate>, MemKeeperError>;
}

/// Destination for candidates above the confidence threshold
pub trait KnowledgeSink: Send + Sync {
    fn store(&self, entry: KnowledgeEntry) -> Result<(), MemKeeperError>;
}
