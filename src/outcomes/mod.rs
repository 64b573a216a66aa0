mod analyzer;
mod counter;
mod event_store;
mod outcome;
pub mod redact;
mod recorder;
mod trigger;

pub use analyzer::{Analyzer, KnowledgeEntry, KnowledgeSink, PatternCandidate};
pub use counter::{CounterSnapshot, SessionCounter, SessionCounterRow};
pub use event_store::{NewOutcomeEvent, OutcomeEventStore};
pub use outcome::{Outcome, OutcomeEvent, ToolCall};
pub use recorder::OutcomeRecorder;
pub use trigger::{BatchTrigger, ClaimedBatch, SessionEndReport};
