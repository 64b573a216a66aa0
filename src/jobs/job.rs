use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::job_status::JobStatus;
use crate::error::MemKeeperError;

/// The partition a job (or a knowledge entry) belongs to, e.g. `project:p1`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub scope_type: String,
    pub scope_id: String,
}

impl Scope {
    pub fn new(scope_type: impl Into<String>, scope_id: impl Into<String>) -> Self {
        Self {
            scope_type: scope_type.into(),
            scope_id: scope_id.into(),
        }
    }

    /// Grouping key used for merge eligibility: `scopeType:scopeId`
    pub fn key(&self) -> String {
        format!("{}:{}", self.scope_type, self.scope_id)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope_type, self.scope_id)
    }
}

/// Non-empty, duplicate-free list of task identifiers, in first-seen order.
///
/// Serialized to a JSON array in the `jobs.tasks` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct TaskSet(Vec<String>);

impl TaskSet {
    pub fn new<I, S>(tasks: I) -> Result<Self, MemKeeperError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut unique = Vec::new();

        for task in tasks {
            let task: String = task.into();
            let trimmed = task.trim();
            if trimmed.is_empty() {
                return Err(MemKeeperError::InvalidInput(
                    "task identifiers must not be empty".to_string(),
                ));
            }
            if seen.insert(trimmed.to_string()) {
                unique.push(trimmed.to_string());
            }
        }

        if unique.is_empty() {
            return Err(MemKeeperError::InvalidInput(
                "a job needs at least one task".to_string(),
            ));
        }

        Ok(Self(unique))
    }

    /// Union of several task sets, keeping first-seen order
    pub fn union<'a, I>(sets: I) -> Result<Self, MemKeeperError>
    where
        I: IntoIterator<Item = &'a TaskSet>,
    {
        Self::new(sets.into_iter().flat_map(|s| s.iter().map(str::to_string)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, task: &str) -> bool {
        self.0.iter().any(|t| t == task)
    }

    /// True if every task in `self` appears in `covered`
    pub fn is_covered_by(&self, covered: &HashSet<String>) -> bool {
        self.0.iter().all(|t| covered.contains(t))
    }

    pub fn to_json(&self) -> Result<String, MemKeeperError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, MemKeeperError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl TryFrom<Vec<String>> for TaskSet {
    type Error = MemKeeperError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        TaskSet::new(value)
    }
}

impl From<TaskSet> for Vec<String> {
    fn from(value: TaskSet) -> Self {
        value.0
    }
}

/// One unit of scheduled maintenance work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: i64,
    pub status: JobStatus,
    pub scope: Scope,
    pub tasks: TaskSet,
    pub created_at: i64,           // Unix ms (UTC)
    pub started_at: Option<i64>,   // Unix ms (UTC)
    pub completed_at: Option<i64>, // Unix ms (UTC)
    pub error: Option<String>,
    pub result: Option<String>,
}

impl Job {
    /// Column list matching `from_row`
    pub const COLUMNS: &'static str = "job_id, status, scope_type, scope_id, tasks, created_at, started_at, completed_at, error, result";

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let tasks_json: String = row.get(4)?;
        let tasks = TaskSet::from_json(&tasks_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    e.to_string(),
                )),
            )
        })?;

        Ok(Job {
            job_id: row.get(0)?,
            status: JobStatus::from_i64(row.get(1)?),
            scope: Scope::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
            tasks,
            created_at: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
            error: row.get(8)?,
            result: row.get(9)?,
        })
    }

    /// True when the job holds exactly one task (the merge candidates)
    pub fn is_single_task(&self) -> bool {
        self.tasks.len() == 1
    }

    /// Age in ms relative to `now`
    pub fn age_ms(&self, now: i64) -> i64 {
        now - self.created_at
    }
}
