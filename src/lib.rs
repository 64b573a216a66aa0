//! Background execution core for an agent-memory service.
//!
//! Two independent pieces share one SQLite database:
//!
//! * [`jobs`]: a durable maintenance job queue with bounded concurrency,
//!   expiration, deduplication and merging of pending work.
//! * [`outcomes`]: an append-only log of tool-call outcomes whose per-session
//!   batches are claimed by compare-and-swap and handed to an analyzer.

pub mod background;
pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod outcomes;
mod schema;
pub mod utils;

pub use config::Config;
pub use database::Database;
pub use error::MemKeeperError;
pub use jobs::{ExecutionCallback, Job, JobQueueManager, JobStatus, Scope, TaskHandler, TaskRegistry};
pub use outcomes::{Analyzer, KnowledgeSink, OutcomeRecorder, ToolCall};
