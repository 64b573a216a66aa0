use std::sync::Arc;

use super::job::{Job, Scope};
use super::job_manager::JobQueueManager;
use crate::error::MemKeeperError;

/// Performs the work of a started job
///
/// Registered once on the `JobQueueManager` before draining begins. `execute` runs
/// detached on the blocking pool after the job has transitioned to running.
///
/// The callback alone decides when the job ends: it calls `complete_job` or `fail_job`
/// on the manager it is given, either before returning or later from any thread.
/// Returning `Err` (or panicking) is treated as an implicit failure and converted to
/// `fail_job` at the dispatch site.
pub trait ExecutionCallback: Send + Sync {
    fn execute(&self, manager: &Arc<JobQueueManager>, job: Job) -> Result<(), MemKeeperError>;
}

/// One named maintenance task (e.g. "consolidation"), run by the `TaskRegistry`
///
/// Returns a short human-readable summary of what it did.
pub trait TaskHandler: Send + Sync {
    fn run(&self, scope: &Scope) -> Result<String, MemKeeperError>;
}

impl<F> TaskHandler for F
where
    F: Fn(&Scope) -> Result<String, MemKeeperError> + Send + Sync,
{
    fn run(&self, scope: &Scope) -> Result<String, MemKeeperError> {
        self(scope)
    }
}
