use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemKeeperError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Queue full: {pending}/{max} jobs pending")]
    QueueFull { pending: usize, max: usize },

    #[error("Job {0} not found")]
    JobNotFound(i64),

    #[error("Execution callback failed: {0}")]
    CallbackFailure(String),

    #[error("Outcome analysis failed: {0}")]
    AnalysisFailure(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl MemKeeperError {
    /// True for failures of the storage layer itself (connection, SQL, pool)
    pub fn is_persistence_failure(&self) -> bool {
        matches!(
            self,
            MemKeeperError::DatabaseError(_) | MemKeeperError::PoolError(_)
        )
    }
}
