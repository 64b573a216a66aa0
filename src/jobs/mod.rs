mod job;
mod job_manager;
mod job_status;
mod job_store;
mod registry;
mod traits;

pub use job::{Job, Scope, TaskSet};
pub use job_manager::{CleanupReport, JobQueueManager, EXPIRED_REASON, INTERRUPTED_REASON};
pub use job_status::JobStatus;
pub use job_store::{JobCounts, JobStore};
pub use registry::TaskRegistry;
pub use traits::{ExecutionCallback, TaskHandler};
