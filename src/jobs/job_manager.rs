use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use once_cell::sync::OnceCell;
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::job::{Job, Scope, TaskSet};
use super::job_status::JobStatus;
use super::job_store::{JobCounts, JobStore};
use super::traits::ExecutionCallback;
use crate::background::{panic_message, BackgroundTasks};
use crate::config::QueueConfig;
use crate::database::Database;
use crate::error::MemKeeperError;
use crate::utils::Utils;

pub const EXPIRED_REASON: &str = "expired";
pub const INTERRUPTED_REASON: &str = "interrupted by restart";

/// What a `cleanup` sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub pruned: usize,
    pub expired: usize,
}

/// Owns the job lifecycle: queue depth, expiration, deduplication, merging, and the drain loop.
///
/// There is no scheduler thread. Draining happens when `process_queue` is called: by the host,
/// by `initialize`, by a `cleanup` sweep, and as a detached continuation after every
/// `complete_job`/`fail_job`. The concurrency bound is a running-count check made in the same
/// IMMEDIATE transaction as the pending -> running transition.
///
/// Expected: one manager per database (scheduling domain).
pub struct JobQueueManager {
    db: Database,
    config: QueueConfig,
    callback: OnceCell<Arc<dyn ExecutionCallback>>,
    background: BackgroundTasks,
    drain_lock: Mutex<()>,
    is_shutting_down: AtomicBool,
}

impl JobQueueManager {
    /// Must be called from within a tokio runtime
    pub fn new(db: Database, config: QueueConfig) -> Result<Arc<Self>, MemKeeperError> {
        Ok(Arc::new(Self {
            db,
            config,
            callback: OnceCell::new(),
            background: BackgroundTasks::new()?,
            drain_lock: Mutex::new(()),
            is_shutting_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Register the execution callback. Can only be set once.
    pub fn set_execution_callback(
        &self,
        callback: Arc<dyn ExecutionCallback>,
    ) -> Result<(), MemKeeperError> {
        self.callback
            .set(callback)
            .map_err(|_| MemKeeperError::Error("Execution callback already registered".into()))
    }

    // ========================================
    // Lifecycle operations
    // ========================================

    /// Queue a new pending job for `scope`
    pub fn create_job<I, S>(&self, scope: Scope, tasks: I) -> Result<Job, MemKeeperError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.check_shutting_down()?;
        let tasks = TaskSet::new(tasks)?;
        let max = self.config.max_queue_depth;
        let conn = self.db.get_connection()?;

        let job = Database::immediate_transaction(&conn, |c| {
            let pending = JobStore::count_by_status(c, JobStatus::Pending)?;
            if pending >= max {
                return Err(MemKeeperError::QueueFull { pending, max });
            }

            let job = JobStore::insert_pending(c, &scope, &tasks, Utils::now_millis())?;

            if self.config.crosses_warning_depth(pending, pending + 1) {
                warn!(
                    "Job queue is nearly full: {}/{} jobs pending",
                    pending + 1,
                    max
                );
            }

            Ok(job)
        })?;

        debug!(
            "Created job {} for {} with tasks {:?}",
            job.job_id,
            job.scope,
            job.tasks.iter().collect::<Vec<_>>()
        );

        Ok(job)
    }

    /// pending -> running, unless every slot is taken (returns None)
    ///
    /// Only records the transition; dispatching to the callback is `process_queue`'s job.
    pub fn start_job(&self, job_id: i64) -> Result<Option<Job>, MemKeeperError> {
        let conn = self.db.get_connection()?;
        self.start_job_with(&conn, job_id)
    }

    /// running -> completed, then schedule a detached `process_queue`
    ///
    /// Returns None (and changes nothing) if the job is not running.
    pub fn complete_job(
        self: &Arc<Self>,
        job_id: i64,
        result: Option<&str>,
    ) -> Result<Option<Job>, MemKeeperError> {
        let conn = self.db.get_connection()?;

        let job = Database::immediate_transaction(&conn, |c| {
            Self::require_job(c, job_id)?;
            if JobStore::mark_completed(c, job_id, Utils::now_millis(), result)? {
                JobStore::get_by_id(c, job_id)
            } else {
                Ok(None)
            }
        })?;

        match &job {
            Some(_) => info!("Job {} completed", job_id),
            None => warn!("complete_job ignored: job {} is not running", job_id),
        }

        self.schedule_drain();
        Ok(job)
    }

    /// running -> failed with `error`, then schedule a detached `process_queue`
    ///
    /// Returns None (and changes nothing) if the job is not running.
    pub fn fail_job(self: &Arc<Self>, job_id: i64, error: &str) -> Result<Option<Job>, MemKeeperError> {
        let conn = self.db.get_connection()?;

        let job = Database::immediate_transaction(&conn, |c| {
            Self::require_job(c, job_id)?;
            if JobStore::mark_failed(c, job_id, JobStatus::Running, Utils::now_millis(), error)? {
                JobStore::get_by_id(c, job_id)
            } else {
                Ok(None)
            }
        })?;

        match &job {
            Some(_) => info!("Job {} failed: {}", job_id, error),
            None => warn!("fail_job ignored: job {} is not running", job_id),
        }

        self.schedule_drain();
        Ok(job)
    }

    /// pending -> failed with `reason`. Advisory: a no-op (Ok(None)) for running or finished jobs.
    pub fn cancel_job(&self, job_id: i64, reason: &str) -> Result<Option<Job>, MemKeeperError> {
        let conn = self.db.get_connection()?;
        Database::immediate_transaction(&conn, |c| {
            Self::require_job(c, job_id)?;
            Self::cancel_job_with(c, job_id, reason)
        })
    }

    // ========================================
    // Drain loop
    // ========================================

    /// Filter the pending queue and start the oldest surviving job.
    ///
    /// 1. No free slot: return None without touching anything.
    /// 2. Walk pending jobs oldest first, cancelling expired and already-covered jobs.
    /// 3. If merging is enabled, fold same-scope single-task jobs into one job.
    /// 4. Start the oldest survivor and hand it to the execution callback.
    pub fn process_queue(self: &Arc<Self>) -> Result<Option<Job>, MemKeeperError> {
        let _tmr = timer!(Level::Trace; "JobQueueManager::process_queue");

        // Serializes drains within this process; start_job's transaction covers the rest
        let _guard = self
            .drain_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.is_shutting_down.load(Ordering::Acquire) {
            return Ok(None);
        }

        let Some(callback) = self.callback.get().cloned() else {
            debug!("process_queue: no execution callback registered, not draining");
            return Ok(None);
        };

        let conn = self.db.get_connection()?;

        let running = JobStore::count_by_status(&conn, JobStatus::Running)?;
        if running >= self.config.max_concurrent_jobs {
            debug!(
                "process_queue: all {} slots busy",
                self.config.max_concurrent_jobs
            );
            return Ok(None);
        }

        let now = Utils::now_millis();
        let pending = JobStore::list_by_status(&conn, JobStatus::Pending)?;

        let mut survivors = Vec::with_capacity(pending.len());
        for job in pending {
            if self.filter_job(&conn, &job, now)? {
                survivors.push(job);
            }
        }

        if self.config.enable_merging {
            survivors = self.merge_pass(&conn, survivors, now)?;
        }

        let mut survivors = survivors.into_iter();
        let Some(next) = survivors.next() else {
            return Ok(None);
        };

        let Some(started) = self.start_job_with(&conn, next.job_id)? else {
            return Ok(None);
        };

        info!(
            "Starting job {} for {} ({} task(s))",
            started.job_id,
            started.scope,
            started.tasks.len()
        );
        self.dispatch(callback, started.clone());

        // Keep filling free slots while work is waiting
        if survivors.next().is_some() && running + 1 < self.config.max_concurrent_jobs {
            self.schedule_drain();
        }

        Ok(Some(started))
    }

    /// Periodic sweep: prune finished jobs past retention and expire stale pending jobs.
    /// Schedules a drain afterwards.
    pub fn cleanup(self: &Arc<Self>) -> Result<CleanupReport, MemKeeperError> {
        let _tmr = timer!(Level::Trace; "JobQueueManager::cleanup");
        let now = Utils::now_millis();
        let conn = self.db.get_connection()?;

        let pruned = Database::immediate_transaction(&conn, |c| {
            JobStore::delete_terminal_before(c, now - self.config.job_retention_ms)
        })?;

        let mut expired = 0;
        for job in JobStore::list_by_status(&conn, JobStatus::Pending)? {
            if self.is_expired(&job, now)
                && Self::cancel_job_with(&conn, job.job_id, EXPIRED_REASON)?.is_some()
            {
                expired += 1;
            }
        }

        info!(
            "Cleanup: pruned {} finished job(s), cancelled {} expired pending job(s)",
            pruned, expired
        );

        self.schedule_drain();
        Ok(CleanupReport { pruned, expired })
    }

    /// Startup reconciliation. Any job still marked running belonged to a process that is gone:
    /// fail it, then drain once. Returns the number of orphaned jobs failed.
    pub fn initialize(self: &Arc<Self>) -> Result<usize, MemKeeperError> {
        let conn = self.db.get_connection()?;
        let now = Utils::now_millis();

        let recovered = Database::immediate_transaction(&conn, |c| {
            let mut recovered = 0;
            for job in JobStore::list_by_status(c, JobStatus::Running)? {
                if JobStore::mark_failed(c, job.job_id, JobStatus::Running, now, INTERRUPTED_REASON)? {
                    warn!(
                        "Job {} was running when the previous process exited, marked failed",
                        job.job_id
                    );
                    recovered += 1;
                }
            }
            Ok(recovered)
        })?;

        info!("Initialized job queue: {} orphaned job(s) recovered", recovered);

        self.process_queue()?;
        Ok(recovered)
    }

    /// Stop accepting and starting jobs, then wait for detached work to finish.
    /// Running jobs are left to their callbacks; anything still running at exit is
    /// reconciled by the next `initialize`.
    pub async fn shutdown(&self) {
        self.is_shutting_down.store(true, Ordering::Release);

        let in_flight = self.background.in_flight();
        if in_flight > 0 {
            info!("Waiting for {} background job task(s) to complete...", in_flight);
        }
        self.background.wait_idle().await;
        info!("Job queue shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Acquire)
    }

    /// Wait until every detached callback and drain spawned so far (and whatever they
    /// spawn in turn) has finished
    pub async fn wait_for_background(&self) {
        self.background.wait_idle().await;
    }

    // ========================================
    // Introspection
    // ========================================

    pub fn get_job(&self, job_id: i64) -> Result<Option<Job>, MemKeeperError> {
        let conn = self.db.get_connection()?;
        JobStore::get_by_id(&conn, job_id)
    }

    pub fn list_jobs(&self, status: JobStatus) -> Result<Vec<Job>, MemKeeperError> {
        let conn = self.db.get_connection()?;
        JobStore::list_by_status(&conn, status)
    }

    pub fn job_counts(&self) -> Result<JobCounts, MemKeeperError> {
        let conn = self.db.get_connection()?;
        JobStore::counts(&conn)
    }

    // ========================================
    // Internals
    // ========================================

    fn start_job_with(&self, conn: &Connection, job_id: i64) -> Result<Option<Job>, MemKeeperError> {
        let max = self.config.max_concurrent_jobs;

        Database::immediate_transaction(conn, |c| {
            Self::require_job(c, job_id)?;

            let running = JobStore::count_by_status(c, JobStatus::Running)?;
            if running >= max {
                debug!("start_job {}: {}/{} jobs running", job_id, running, max);
                return Ok(None);
            }

            if JobStore::mark_running(c, job_id, Utils::now_millis())? {
                JobStore::get_by_id(c, job_id)
            } else {
                debug!("start_job {}: job is no longer pending", job_id);
                Ok(None)
            }
        })
    }

    /// Conditional pending -> failed. None if the job was not pending.
    fn cancel_job_with(
        conn: &Connection,
        job_id: i64,
        reason: &str,
    ) -> Result<Option<Job>, MemKeeperError> {
        if JobStore::mark_failed(conn, job_id, JobStatus::Pending, Utils::now_millis(), reason)? {
            info!("Cancelled job {}: {}", job_id, reason);
            JobStore::get_by_id(conn, job_id)
        } else {
            debug!("cancel_job {} ignored: job is not pending", job_id);
            Ok(None)
        }
    }

    fn require_job(conn: &Connection, job_id: i64) -> Result<Job, MemKeeperError> {
        JobStore::get_by_id(conn, job_id)?.ok_or(MemKeeperError::JobNotFound(job_id))
    }

    fn is_expired(&self, job: &Job, now: i64) -> bool {
        job.age_ms(now) > self.config.pending_job_expiration_ms
    }

    /// Expiration and deduplication for one pending job.
    /// Returns true if the job survives; cancels it otherwise.
    fn filter_job(&self, conn: &Connection, job: &Job, now: i64) -> Result<bool, MemKeeperError> {
        if self.is_expired(job, now) {
            Self::cancel_job_with(conn, job.job_id, EXPIRED_REASON)?;
            return Ok(false);
        }

        if let Some(covering_id) = self.find_covering_job(conn, job, now)? {
            info!(
                "Job {} skipped: tasks already performed by job {}",
                job.job_id, covering_id
            );
            Self::cancel_job_with(conn, job.job_id, &format!("covered by {}", covering_id))?;
            return Ok(false);
        }

        Ok(true)
    }

    /// If jobs of the same scope completed within the dedup window performed every task of `job`,
    /// returns the id of the most recently completed one that contributed.
    fn find_covering_job(
        &self,
        conn: &Connection,
        job: &Job,
        now: i64,
    ) -> Result<Option<i64>, MemKeeperError> {
        let since = now - self.config.deduplication_window_ms;
        let completed = JobStore::completed_since(conn, &job.scope, since)?;

        let mut covered = HashSet::new();
        let mut latest_contributor = None;

        // Most recent first
        for done in &completed {
            let contributes = done.tasks.iter().any(|t| job.tasks.contains(t));
            if contributes && latest_contributor.is_none() {
                latest_contributor = Some(done.job_id);
            }
            covered.extend(done.tasks.iter().map(str::to_string));
        }

        if job.tasks.is_covered_by(&covered) {
            Ok(latest_contributor)
        } else {
            Ok(None)
        }
    }

    /// Fold same-scope single-task survivors into one job per scope.
    /// Returns the surviving jobs, oldest first, with merged jobs in place of their members.
    fn merge_pass(
        &self,
        conn: &Connection,
        survivors: Vec<Job>,
        now: i64,
    ) -> Result<Vec<Job>, MemKeeperError> {
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, job) in survivors.iter().enumerate() {
            if job.is_single_task() {
                groups.entry(job.scope.key()).or_default().push(idx);
            }
        }

        let mut merged_away = HashSet::new();
        let mut merged_jobs = Vec::new();

        for members in groups.values().filter(|m| m.len() > 1) {
            let group: Vec<&Job> = members.iter().map(|&idx| &survivors[idx]).collect();

            if let Some(merged) = Self::merge_group(conn, &group)? {
                merged_away.extend(members.iter().copied());

                // The merged job goes through the same filters as everything else
                if self.filter_job(conn, &merged, now)? {
                    merged_jobs.push(merged);
                }
            }
        }

        let mut result: Vec<Job> = survivors
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !merged_away.contains(idx))
            .map(|(_, job)| job)
            .chain(merged_jobs)
            .collect();
        result.sort_by_key(|job| (job.created_at, job.job_id));

        Ok(result)
    }

    /// Create one pending job holding the union of `group`'s tasks and cancel the originals,
    /// atomically. The merged job keeps the earliest creation time so it holds its queue place.
    /// Returns None if any member stopped being pending in the meantime.
    fn merge_group(conn: &Connection, group: &[&Job]) -> Result<Option<Job>, MemKeeperError> {
        let Some(first) = group.first() else {
            return Ok(None);
        };
        let scope = first.scope.clone();
        let tasks = TaskSet::union(group.iter().map(|job| &job.tasks))?;
        let created_at = group
            .iter()
            .map(|job| job.created_at)
            .min()
            .unwrap_or(first.created_at);

        Database::immediate_transaction(conn, |c| {
            for job in group {
                let current = JobStore::get_by_id(c, job.job_id)?;
                if current.map(|j| j.status) != Some(JobStatus::Pending) {
                    debug!("Merge for {} skipped: job {} is no longer pending", scope, job.job_id);
                    return Ok(None);
                }
            }

            let merged = JobStore::insert_pending(c, &scope, &tasks, created_at)?;
            let reason = format!("merged into {}", merged.job_id);
            let now = Utils::now_millis();

            for job in group {
                JobStore::mark_failed(c, job.job_id, JobStatus::Pending, now, &reason)?;
            }

            info!(
                "Merged {} pending job(s) for {} into job {}",
                group.len(),
                scope,
                merged.job_id
            );

            Ok(Some(merged))
        })
    }

    /// Run the callback detached. An error or panic from it becomes `fail_job`.
    fn dispatch(self: &Arc<Self>, callback: Arc<dyn ExecutionCallback>, job: Job) {
        let manager = Arc::clone(self);

        self.background.spawn_detached("job callback", move || {
            let job_id = job.job_id;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback.execute(&manager, job)))
                .unwrap_or_else(|payload| {
                    Err(MemKeeperError::CallbackFailure(format!(
                        "callback panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                });

            match outcome {
                Ok(()) => Ok(()),
                Err(e) => {
                    let failure = match e {
                        MemKeeperError::CallbackFailure(msg) => MemKeeperError::CallbackFailure(msg),
                        other => MemKeeperError::CallbackFailure(other.to_string()),
                    };
                    error!("Job {}: {}", job_id, failure);
                    manager.fail_job(job_id, &failure.to_string()).map(|_| ())
                }
            }
        });
    }

    /// Detached `process_queue`; the caller never waits on the next job starting
    fn schedule_drain(self: &Arc<Self>) {
        if self.is_shutting_down.load(Ordering::Acquire) {
            return;
        }

        let manager = Arc::clone(self);
        self.background
            .spawn_detached("process_queue", move || manager.process_queue().map(|_| ()));
    }

    fn check_shutting_down(&self) -> Result<(), MemKeeperError> {
        if self.is_shutting_down.load(Ordering::Acquire) {
            Err(MemKeeperError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::temp_database;
    use crate::jobs::job_store::test_support::{backdate_completed, backdate_created};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Records every job it sees and leaves it running
    #[derive(Default)]
    struct HoldingCallback {
        seen: Mutex<Vec<i64>>,
    }

    impl ExecutionCallback for HoldingCallback {
        fn execute(&self, _manager: &Arc<JobQueueManager>, job: Job) -> Result<(), MemKeeperError> {
            self.seen.lock().unwrap().push(job.job_id);
            Ok(())
        }
    }

    /// Completes every job immediately, tracking peak concurrency
    #[derive(Default)]
    struct CompletingCallback {
        completed: AtomicUsize,
    }

    impl ExecutionCallback for CompletingCallback {
        fn execute(&self, manager: &Arc<JobQueueManager>, job: Job) -> Result<(), MemKeeperError> {
            let running = manager.job_counts()?.running;
            assert!(running <= manager.config().max_concurrent_jobs);
            manager.complete_job(job.job_id, Some("done"))?;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingCallback;

    impl ExecutionCallback for FailingCallback {
        fn execute(&self, _manager: &Arc<JobQueueManager>, _job: Job) -> Result<(), MemKeeperError> {
            Err(MemKeeperError::Error("disk on fire".into()))
        }
    }

    struct PanickingCallback;

    impl ExecutionCallback for PanickingCallback {
        fn execute(&self, _manager: &Arc<JobQueueManager>, _job: Job) -> Result<(), MemKeeperError> {
            panic!("callback exploded");
        }
    }

    fn test_config() -> QueueConfig {
        QueueConfig {
            max_concurrent_jobs: 1,
            max_queue_depth: 10,
            pending_job_expiration_ms: 60_000,
            deduplication_window_ms: 60_000,
            enable_merging: true,
            job_retention_ms: 60_000,
        }
    }

    fn manager_with(config: QueueConfig) -> (TempDir, Database, Arc<JobQueueManager>) {
        let (dir, db) = temp_database();
        let manager = JobQueueManager::new(db.clone(), config).unwrap();
        (dir, db, manager)
    }

    fn p1() -> Scope {
        Scope::new("project", "p1")
    }

    #[tokio::test]
    async fn test_create_job_returns_pending_job() {
        let (_dir, _db, manager) = manager_with(test_config());

        let job = manager.create_job(p1(), ["consolidation"]).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.scope, p1());
        assert_eq!(job.tasks.iter().collect::<Vec<_>>(), vec!["consolidation"]);
        assert_eq!(manager.get_job(job.job_id).unwrap(), Some(job));
    }

    #[tokio::test]
    async fn test_create_job_rejects_when_queue_full() {
        let (_dir, _db, manager) = manager_with(test_config());

        for i in 0..10 {
            manager
                .create_job(Scope::new("project", format!("p{}", i)), ["consolidation"])
                .unwrap();
        }

        let err = manager.create_job(p1(), ["consolidation"]).unwrap_err();
        assert!(matches!(err, MemKeeperError::QueueFull { pending: 10, max: 10 }));
        assert!(err.to_string().contains("10/10"));
        assert_eq!(manager.job_counts().unwrap().pending, 10);
    }

    #[tokio::test]
    async fn test_create_job_rejects_empty_tasks() {
        let (_dir, _db, manager) = manager_with(test_config());
        let err = manager.create_job(p1(), Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, MemKeeperError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_start_job_respects_concurrency_limit() {
        let (_dir, _db, manager) = manager_with(test_config());
        let a = manager.create_job(p1(), ["a"]).unwrap();
        let b = manager.create_job(Scope::new("project", "p2"), ["b"]).unwrap();

        let started = manager.start_job(a.job_id).unwrap().unwrap();
        assert_eq!(started.status, JobStatus::Running);
        assert!(started.started_at.is_some());

        assert_eq!(manager.start_job(b.job_id).unwrap(), None);
        assert_eq!(manager.get_job(b.job_id).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_lifecycle_on_unknown_job_is_not_found() {
        let (_dir, _db, manager) = manager_with(test_config());
        assert!(matches!(manager.start_job(42), Err(MemKeeperError::JobNotFound(42))));
        assert!(matches!(manager.cancel_job(42, "x"), Err(MemKeeperError::JobNotFound(42))));
        assert!(matches!(
            manager.complete_job(42, None),
            Err(MemKeeperError::JobNotFound(42))
        ));
        assert!(matches!(manager.fail_job(42, "x"), Err(MemKeeperError::JobNotFound(42))));
    }

    #[tokio::test]
    async fn test_cancel_only_affects_pending_jobs() {
        let (_dir, _db, manager) = manager_with(test_config());
        let pending = manager.create_job(p1(), ["a"]).unwrap();
        let running = manager.create_job(Scope::new("project", "p2"), ["b"]).unwrap();
        manager.start_job(running.job_id).unwrap().unwrap();

        let cancelled = manager.cancel_job(pending.job_id, "user request").unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.error.as_deref(), Some("user request"));

        // Running and terminal jobs: silent no-op
        assert_eq!(manager.cancel_job(running.job_id, "nope").unwrap(), None);
        assert_eq!(manager.cancel_job(pending.job_id, "again").unwrap(), None);
        assert_eq!(
            manager.get_job(running.job_id).unwrap().unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn test_process_queue_without_free_slot_is_idempotent() {
        let (_dir, db, manager) = manager_with(test_config());
        manager
            .set_execution_callback(Arc::new(HoldingCallback::default()))
            .unwrap();

        let running = manager.create_job(p1(), ["a"]).unwrap();
        manager.start_job(running.job_id).unwrap().unwrap();
        let expired = manager.create_job(Scope::new("project", "p2"), ["b"]).unwrap();
        {
            let conn = db.get_connection().unwrap();
            backdate_created(&conn, expired.job_id, 120_000);
        }

        let before = manager.list_jobs(JobStatus::Pending).unwrap();
        assert_eq!(manager.process_queue().unwrap(), None);
        let after = manager.list_jobs(JobStatus::Pending).unwrap();

        // Even the expired job is untouched: no slot, no filtering pass
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_process_queue_starts_oldest_and_dispatches() {
        let (_dir, _db, manager) = manager_with(test_config());
        let callback = Arc::new(HoldingCallback::default());
        manager.set_execution_callback(callback.clone()).unwrap();

        let first = manager.create_job(p1(), ["a", "b"]).unwrap();
        let second = manager.create_job(Scope::new("project", "p2"), ["c"]).unwrap();

        let started = manager.process_queue().unwrap().unwrap();
        assert_eq!(started.job_id, first.job_id);
        assert_eq!(started.status, JobStatus::Running);

        manager.wait_for_background().await;
        assert_eq!(*callback.seen.lock().unwrap(), vec![first.job_id]);
        assert_eq!(
            manager.get_job(second.job_id).unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_process_queue_without_callback_does_nothing() {
        let (_dir, _db, manager) = manager_with(test_config());
        let job = manager.create_job(p1(), ["a"]).unwrap();
        assert_eq!(manager.process_queue().unwrap(), None);
        assert_eq!(manager.get_job(job.job_id).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_expired_job_is_cancelled_not_started() {
        let (_dir, db, manager) = manager_with(test_config());
        let callback = Arc::new(HoldingCallback::default());
        manager.set_execution_callback(callback.clone()).unwrap();

        let job = manager.create_job(p1(), ["consolidation"]).unwrap();
        {
            let conn = db.get_connection().unwrap();
            backdate_created(&conn, job.job_id, test_config().pending_job_expiration_ms + 1);
        }

        assert_eq!(manager.process_queue().unwrap(), None);
        manager.wait_for_background().await;

        let job = manager.get_job(job.job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(EXPIRED_REASON));
        assert_eq!(job.started_at, None);
        assert!(callback.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_jobs_merge_by_scope() {
        let (_dir, _db, manager) = manager_with(test_config());
        let callback = Arc::new(HoldingCallback::default());
        manager.set_execution_callback(callback.clone()).unwrap();

        let a = manager.create_job(p1(), ["consolidation"]).unwrap();
        let b = manager.create_job(p1(), ["forgetting"]).unwrap();

        let started = manager.process_queue().unwrap().unwrap();
        manager.wait_for_background().await;

        assert_ne!(started.job_id, a.job_id);
        assert_ne!(started.job_id, b.job_id);
        assert_eq!(
            started.tasks.iter().collect::<Vec<_>>(),
            vec!["consolidation", "forgetting"]
        );
        assert_eq!(started.created_at, a.created_at.min(b.created_at));

        for original in [a.job_id, b.job_id] {
            let job = manager.get_job(original).unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            let error = job.error.unwrap();
            assert!(error.contains("merged into"), "unexpected error {}", error);
            assert_eq!(error, format!("merged into {}", started.job_id));
        }

        let counts = manager.job_counts().unwrap();
        assert_eq!(counts.running, 1);
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.failed, 2);
    }

    #[tokio::test]
    async fn test_merging_disabled_keeps_jobs_separate() {
        let config = QueueConfig {
            enable_merging: false,
            ..test_config()
        };
        let (_dir, _db, manager) = manager_with(config);
        manager
            .set_execution_callback(Arc::new(HoldingCallback::default()))
            .unwrap();

        let a = manager.create_job(p1(), ["consolidation"]).unwrap();
        let b = manager.create_job(p1(), ["forgetting"]).unwrap();

        let started = manager.process_queue().unwrap().unwrap();
        manager.wait_for_background().await;

        assert_eq!(started.job_id, a.job_id);
        assert_eq!(manager.get_job(b.job_id).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_multi_task_jobs_and_other_scopes_are_not_merged() {
        let (_dir, _db, manager) = manager_with(test_config());
        manager
            .set_execution_callback(Arc::new(HoldingCallback::default()))
            .unwrap();

        let multi = manager.create_job(p1(), ["consolidation", "backfill"]).unwrap();
        let single = manager.create_job(p1(), ["forgetting"]).unwrap();
        let other = manager.create_job(Scope::new("project", "p2"), ["forgetting"]).unwrap();

        let started = manager.process_queue().unwrap().unwrap();
        manager.wait_for_background().await;

        assert_eq!(started.job_id, multi.job_id);
        for id in [single.job_id, other.job_id] {
            assert_eq!(manager.get_job(id).unwrap().unwrap().status, JobStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_recently_completed_work_covers_pending_job() {
        let (_dir, _db, manager) = manager_with(test_config());
        manager
            .set_execution_callback(Arc::new(HoldingCallback::default()))
            .unwrap();

        let done = manager.create_job(p1(), ["consolidation", "forgetting"]).unwrap();
        manager.start_job(done.job_id).unwrap().unwrap();
        manager.complete_job(done.job_id, None).unwrap().unwrap();
        manager.wait_for_background().await;

        let redundant = manager.create_job(p1(), ["forgetting"]).unwrap();
        let needed = manager.create_job(p1(), ["consolidation", "backfill"]).unwrap();

        let started = manager.process_queue().unwrap().unwrap();
        manager.wait_for_background().await;

        let redundant = manager.get_job(redundant.job_id).unwrap().unwrap();
        assert_eq!(redundant.status, JobStatus::Failed);
        assert_eq!(
            redundant.error.as_deref(),
            Some(format!("covered by {}", done.job_id).as_str())
        );
        assert_eq!(started.job_id, needed.job_id);
    }

    #[tokio::test]
    async fn test_completed_work_outside_window_does_not_cover() {
        let (_dir, db, manager) = manager_with(test_config());
        manager
            .set_execution_callback(Arc::new(HoldingCallback::default()))
            .unwrap();

        let done = manager.create_job(p1(), ["forgetting"]).unwrap();
        manager.start_job(done.job_id).unwrap().unwrap();
        manager.complete_job(done.job_id, None).unwrap().unwrap();
        manager.wait_for_background().await;
        {
            let conn = db.get_connection().unwrap();
            backdate_completed(&conn, done.job_id, test_config().deduplication_window_ms + 1_000);
        }

        let again = manager.create_job(p1(), ["forgetting"]).unwrap();
        let started = manager.process_queue().unwrap().unwrap();
        assert_eq!(started.job_id, again.job_id);
        manager.wait_for_background().await;
    }

    #[tokio::test]
    async fn test_complete_and_fail_only_apply_to_running_jobs() {
        let (_dir, _db, manager) = manager_with(test_config());
        let job = manager.create_job(p1(), ["a"]).unwrap();

        assert_eq!(manager.complete_job(job.job_id, None).unwrap(), None);
        assert_eq!(manager.fail_job(job.job_id, "x").unwrap(), None);
        assert_eq!(manager.get_job(job.job_id).unwrap().unwrap().status, JobStatus::Pending);

        manager.start_job(job.job_id).unwrap().unwrap();
        let failed = manager.fail_job(job.job_id, "out of memory").unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("out of memory"));
        assert!(failed.completed_at.is_some());

        // Terminal: further transitions are ignored
        assert_eq!(manager.complete_job(job.job_id, None).unwrap(), None);
        manager.wait_for_background().await;
    }

    #[tokio::test]
    async fn test_completion_cascades_through_queue() {
        let config = QueueConfig {
            max_concurrent_jobs: 2,
            enable_merging: false,
            ..test_config()
        };
        let (_dir, _db, manager) = manager_with(config);
        let callback = Arc::new(CompletingCallback::default());
        manager.set_execution_callback(callback.clone()).unwrap();

        for i in 0..6 {
            manager
                .create_job(Scope::new("project", format!("p{}", i)), ["consolidation"])
                .unwrap();
        }

        manager.process_queue().unwrap().unwrap();
        manager.wait_for_background().await;

        assert_eq!(callback.completed.load(Ordering::SeqCst), 6);
        let counts = manager.job_counts().unwrap();
        assert_eq!(counts.completed, 6);
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.running, 0);
    }

    #[tokio::test]
    async fn test_callback_error_becomes_fail_job() {
        let (_dir, _db, manager) = manager_with(test_config());
        manager.set_execution_callback(Arc::new(FailingCallback)).unwrap();

        let job = manager.create_job(p1(), ["a"]).unwrap();
        manager.process_queue().unwrap().unwrap();
        manager.wait_for_background().await;

        let job = manager.get_job(job.job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_callback_panic_becomes_fail_job() {
        let (_dir, _db, manager) = manager_with(test_config());
        manager.set_execution_callback(Arc::new(PanickingCallback)).unwrap();

        let first = manager.create_job(p1(), ["a"]).unwrap();
        let second = manager.create_job(Scope::new("project", "p2"), ["b"]).unwrap();
        manager.process_queue().unwrap().unwrap();
        manager.wait_for_background().await;

        // Both fail: the failure of the first drains into the second, which also panics
        for id in [first.job_id, second.job_id] {
            let job = manager.get_job(id).unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert!(job.error.unwrap().contains("callback exploded"));
        }
    }

    #[tokio::test]
    async fn test_callback_can_only_be_registered_once() {
        let (_dir, _db, manager) = manager_with(test_config());
        manager.set_execution_callback(Arc::new(FailingCallback)).unwrap();
        assert!(manager.set_execution_callback(Arc::new(FailingCallback)).is_err());
    }

    #[tokio::test]
    async fn test_initialize_recovers_orphans_then_drains() {
        let (dir, db) = temp_database();

        // A previous process left one job running and one pending
        let (orphan, waiting) = {
            let conn = db.get_connection().unwrap();
            let orphan = JobStore::insert_pending(
                &conn,
                &p1(),
                &TaskSet::new(["a"]).unwrap(),
                Utils::now_millis(),
            )
            .unwrap();
            JobStore::mark_running(&conn, orphan.job_id, Utils::now_millis()).unwrap();
            let waiting = JobStore::insert_pending(
                &conn,
                &Scope::new("project", "p2"),
                &TaskSet::new(["b"]).unwrap(),
                Utils::now_millis(),
            )
            .unwrap();
            (orphan, waiting)
        };

        let reopened = Database::connect(dir.path()).unwrap();
        let manager = JobQueueManager::new(reopened, test_config()).unwrap();
        let callback = Arc::new(HoldingCallback::default());
        manager.set_execution_callback(callback.clone()).unwrap();

        assert_eq!(manager.initialize().unwrap(), 1);
        manager.wait_for_background().await;

        let orphan = manager.get_job(orphan.job_id).unwrap().unwrap();
        assert_eq!(orphan.status, JobStatus::Failed);
        assert_eq!(orphan.error.as_deref(), Some(INTERRUPTED_REASON));

        // The drain after recovery picked up the pending job
        assert_eq!(
            manager.get_job(waiting.job_id).unwrap().unwrap().status,
            JobStatus::Running
        );
        assert_eq!(*callback.seen.lock().unwrap(), vec![waiting.job_id]);
    }

    #[tokio::test]
    async fn test_cleanup_prunes_and_expires() {
        let (_dir, db, manager) = manager_with(test_config());

        let finished = manager.create_job(p1(), ["a"]).unwrap();
        manager.start_job(finished.job_id).unwrap().unwrap();
        manager.complete_job(finished.job_id, None).unwrap().unwrap();
        let stale = manager.create_job(Scope::new("project", "p2"), ["b"]).unwrap();
        let fresh = manager.create_job(Scope::new("project", "p3"), ["c"]).unwrap();
        {
            let conn = db.get_connection().unwrap();
            backdate_completed(&conn, finished.job_id, test_config().job_retention_ms + 1);
            backdate_created(&conn, stale.job_id, test_config().pending_job_expiration_ms + 1);
        }

        let report = manager.cleanup().unwrap();
        manager.wait_for_background().await;

        assert_eq!(report, CleanupReport { pruned: 1, expired: 1 });
        assert_eq!(manager.get_job(finished.job_id).unwrap(), None);
        let stale = manager.get_job(stale.job_id).unwrap().unwrap();
        assert_eq!(stale.error.as_deref(), Some(EXPIRED_REASON));
        assert_eq!(manager.get_job(fresh.job_id).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let (_dir, _db, manager) = manager_with(test_config());
        manager
            .set_execution_callback(Arc::new(HoldingCallback::default()))
            .unwrap();
        let job = manager.create_job(p1(), ["a"]).unwrap();

        manager.shutdown().await;

        assert!(manager.is_shutting_down());
        assert!(matches!(
            manager.create_job(p1(), ["b"]),
            Err(MemKeeperError::ShuttingDown)
        ));
        assert_eq!(manager.process_queue().unwrap(), None);
        assert_eq!(manager.get_job(job.job_id).unwrap().unwrap().status, JobStatus::Pending);
    }
}
