use log::{debug, info};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::job::Job;
use super::job_manager::JobQueueManager;
use super::traits::{ExecutionCallback, TaskHandler};
use crate::error::MemKeeperError;

/// Execution callback that runs each of a job's tasks through a named handler.
///
/// Tasks run in the job's order. When all succeed the job completes with a JSON
/// summary `{"tasks": {"<name>": "<summary>", ...}}`. The first failing or
/// unregistered task fails the job and the remaining tasks are skipped.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `name`
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn task_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn run_tasks(&self, job: &Job) -> Result<String, MemKeeperError> {
        let mut summaries = Map::new();

        for task in job.tasks.iter() {
            let handler = self.handlers.get(task).ok_or_else(|| {
                MemKeeperError::CallbackFailure(format!("no handler registered for task '{}'", task))
            })?;

            debug!("Job {}: running task '{}' for {}", job.job_id, task, job.scope);
            let summary = handler.run(&job.scope).map_err(|e| {
                MemKeeperError::CallbackFailure(format!("task '{}' failed: {}", task, e))
            })?;

            summaries.insert(task.to_string(), Value::String(summary));
        }

        let mut result = Map::new();
        result.insert("tasks".to_string(), Value::Object(summaries));
        Ok(Value::Object(result).to_string())
    }
}

impl ExecutionCallback for TaskRegistry {
    fn execute(&self, manager: &Arc<JobQueueManager>, job: Job) -> Result<(), MemKeeperError> {
        let job_id = job.job_id;

        match self.run_tasks(&job) {
            Ok(summary) => {
                info!("Job {}: all {} task(s) finished", job_id, job.tasks.len());
                manager.complete_job(job_id, Some(&summary))?;
            }
            Err(e) => {
                manager.fail_job(job_id, &e.to_string())?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::database::test_support::temp_database;
    use crate::jobs::job::Scope;
    use crate::jobs::job_status::JobStatus;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn registry_with_log(log: Arc<Mutex<Vec<String>>>) -> TaskRegistry {
        let mut registry = TaskRegistry::new();

        let consolidation_log = Arc::clone(&log);
        registry.register(
            "consolidation",
            Arc::new(move |scope: &Scope| -> Result<String, MemKeeperError> {
                consolidation_log
                    .lock()
                    .unwrap()
                    .push(format!("consolidation@{}", scope));
                Ok("merged 3 entries".to_string())
            }),
        );

        let forgetting_log = Arc::clone(&log);
        registry.register(
            "forgetting",
            Arc::new(move |scope: &Scope| -> Result<String, MemKeeperError> {
                forgetting_log
                    .lock()
                    .unwrap()
                    .push(format!("forgetting@{}", scope));
                Ok("dropped 1 entry".to_string())
            }),
        );

        registry.register(
            "broken",
            Arc::new(|_: &Scope| -> Result<String, MemKeeperError> {
                Err(MemKeeperError::Error("index missing".into()))
            }),
        );

        registry
    }

    fn config() -> QueueConfig {
        QueueConfig {
            max_concurrent_jobs: 1,
            enable_merging: false,
            ..QueueConfig::default()
        }
    }

    #[tokio::test]
    async fn test_runs_tasks_in_order_and_completes() {
        let (_dir, db) = temp_database();
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = JobQueueManager::new(db, config()).unwrap();
        manager
            .set_execution_callback(Arc::new(registry_with_log(log.clone())))
            .unwrap();

        let job = manager
            .create_job(Scope::new("project", "p1"), ["forgetting", "consolidation"])
            .unwrap();
        manager.process_queue().unwrap().unwrap();
        manager.wait_for_background().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["forgetting@project:p1", "consolidation@project:p1"]
        );

        let job = manager.get_job(job.job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let result: Value = serde_json::from_str(job.result.as_deref().unwrap()).unwrap();
        assert_eq!(result["tasks"]["consolidation"], "merged 3 entries");
        assert_eq!(result["tasks"]["forgetting"], "dropped 1 entry");
    }

    #[tokio::test]
    async fn test_first_failure_stops_the_job() {
        let (_dir, db) = temp_database();
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = JobQueueManager::new(db, config()).unwrap();
        manager
            .set_execution_callback(Arc::new(registry_with_log(log.clone())))
            .unwrap();

        let job = manager
            .create_job(Scope::new("project", "p1"), ["broken", "consolidation"])
            .unwrap();
        manager.process_queue().unwrap().unwrap();
        manager.wait_for_background().await;

        assert!(log.lock().unwrap().is_empty());
        let job = manager.get_job(job.job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.unwrap();
        assert!(error.contains("broken"), "unexpected error {}", error);
        assert!(error.contains("index missing"), "unexpected error {}", error);
    }

    #[tokio::test]
    async fn test_unknown_task_fails_the_job() {
        let (_dir, db) = temp_database();
        let manager = JobQueueManager::new(db, config()).unwrap();
        manager
            .set_execution_callback(Arc::new(registry_with_log(Arc::default())))
            .unwrap();

        let job = manager
            .create_job(Scope::new("project", "p1"), ["embedding_backfill"])
            .unwrap();
        manager.process_queue().unwrap().unwrap();
        manager.wait_for_background().await;

        let job = manager.get_job(job.job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("no handler registered"));
    }

    #[test]
    fn test_task_names_sorted() {
        let registry = registry_with_log(Arc::default());
        assert_eq!(registry.task_names(), vec!["broken", "consolidation", "forgetting"]);
    }
}
