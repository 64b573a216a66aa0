use log::warn;
use serde::{Deserialize, Serialize};

/// Job status enum: lifecycle state of a job in the `jobs` table.
///
/// Stored as an integer in `jobs.status`. Transitions only move forward:
/// Pending -> Running -> {Completed, Failed}, or Pending -> Failed on cancellation.
#[repr(i64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending = 0,   // Queued, waiting for a free slot
    Running = 1,   // Handed to the execution callback
    Completed = 2, // Finished successfully
    Failed = 3,    // Failed, cancelled, expired, merged, or interrupted
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => JobStatus::Pending,
            1 => JobStatus::Running,
            2 => JobStatus::Completed,
            3 => JobStatus::Failed,
            _ => {
                warn!(
                    "Invalid JobStatus value in database: {}, defaulting to Failed",
                    value
                );
                JobStatus::Failed
            }
        }
    }

    pub fn full_name(&self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" | "P" => Some(JobStatus::Pending),
            "RUNNING" | "R" => Some(JobStatus::Running),
            "COMPLETED" | "C" => Some(JobStatus::Completed),
            "FAILED" | "F" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Returns true if this is a terminal status (job is done)
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_name())
    }
}
