use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::job::{Job, Scope, TaskSet};
use super::job_status::JobStatus;
use crate::error::MemKeeperError;
use crate::utils::Utils;

/// Per-status job counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Job table operations
///
/// Associated functions only; callers supply the connection (and the transaction,
/// when several statements must be atomic). Every status change is a conditional
/// UPDATE on the expected current status, so a transition that lost a race simply
/// affects zero rows and reports `false`.
pub struct JobStore;

impl JobStore {
    pub fn insert_pending(
        conn: &Connection,
        scope: &Scope,
        tasks: &TaskSet,
        created_at: i64,
    ) -> Result<Job, MemKeeperError> {
        conn.execute(
            "INSERT INTO jobs (status, scope_type, scope_id, tasks, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                JobStatus::Pending.as_i64(),
                scope.scope_type,
                scope.scope_id,
                tasks.to_json()?,
                created_at,
            ],
        )?;

        Ok(Job {
            job_id: conn.last_insert_rowid(),
            status: JobStatus::Pending,
            scope: scope.clone(),
            tasks: tasks.clone(),
            created_at,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        })
    }

    pub fn get_by_id(conn: &Connection, job_id: i64) -> Result<Option<Job>, MemKeeperError> {
        let sql = format!("SELECT {} FROM jobs WHERE job_id = ?", Job::COLUMNS);
        let job = conn.query_row(&sql, [job_id], Job::from_row).optional()?;
        Ok(job)
    }

    /// Jobs in `status`, oldest first (FIFO by created_at, then job_id)
    pub fn list_by_status(conn: &Connection, status: JobStatus) -> Result<Vec<Job>, MemKeeperError> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE status = ? ORDER BY created_at ASC, job_id ASC",
            Job::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map([status.as_i64()], Job::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn count_by_status(conn: &Connection, status: JobStatus) -> Result<usize, MemKeeperError> {
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM jobs WHERE status = ?",
            [status.as_i64()],
            |row| row.get(0),
        )?;
        Ok(Utils::i64_to_usize(count))
    }

    pub fn counts(conn: &Connection) -> Result<JobCounts, MemKeeperError> {
        let mut stmt = conn.prepare("SELECT status, count(*) FROM jobs GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            let count = Utils::i64_to_usize(count);
            match JobStatus::from_i64(status) {
                JobStatus::Pending => counts.pending = count,
                JobStatus::Running => counts.running = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed += count,
            }
        }
        Ok(counts)
    }

    /// pending -> running
    pub fn mark_running(conn: &Connection, job_id: i64, now: i64) -> Result<bool, MemKeeperError> {
        let rows = conn.execute(
            "UPDATE jobs SET status = ?, started_at = ? WHERE job_id = ? AND status = ?",
            params![
                JobStatus::Running.as_i64(),
                now,
                job_id,
                JobStatus::Pending.as_i64()
            ],
        )?;
        Ok(rows == 1)
    }

    /// running -> completed
    pub fn mark_completed(
        conn: &Connection,
        job_id: i64,
        now: i64,
        result: Option<&str>,
    ) -> Result<bool, MemKeeperError> {
        let rows = conn.execute(
            "UPDATE jobs SET status = ?, completed_at = ?, result = ? WHERE job_id = ? AND status = ?",
            params![
                JobStatus::Completed.as_i64(),
                now,
                result,
                job_id,
                JobStatus::Running.as_i64()
            ],
        )?;
        Ok(rows == 1)
    }

    /// `from` -> failed, recording `error`. `from` must be Pending or Running.
    pub fn mark_failed(
        conn: &Connection,
        job_id: i64,
        from: JobStatus,
        now: i64,
        error: &str,
    ) -> Result<bool, MemKeeperError> {
        if !from.can_transition_to(JobStatus::Failed) {
            return Err(MemKeeperError::InvalidInput(format!(
                "cannot fail a job from status {}",
                from
            )));
        }

        let rows = conn.execute(
            "UPDATE jobs SET status = ?, completed_at = ?, error = ? WHERE job_id = ? AND status = ?",
            params![JobStatus::Failed.as_i64(), now, error, job_id, from.as_i64()],
        )?;
        Ok(rows == 1)
    }

    /// Jobs of `scope` that completed at or after `since`, most recent first
    pub fn completed_since(
        conn: &Connection,
        scope: &Scope,
        since: i64,
    ) -> Result<Vec<Job>, MemKeeperError> {
        let sql = format!(
            "SELECT {} FROM jobs
             WHERE scope_type = ? AND scope_id = ? AND status = ? AND completed_at >= ?
             ORDER BY completed_at DESC, job_id DESC",
            Job::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(
                params![
                    scope.scope_type,
                    scope.scope_id,
                    JobStatus::Completed.as_i64(),
                    since
                ],
                Job::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Delete completed/failed jobs that finished before `cutoff`. Returns the number deleted.
    pub fn delete_terminal_before(conn: &Connection, cutoff: i64) -> Result<usize, MemKeeperError> {
        let rows = conn.execute(
            "DELETE FROM jobs WHERE status IN (?, ?) AND completed_at IS NOT NULL AND completed_at < ?",
            params![
                JobStatus::Completed.as_i64(),
                JobStatus::Failed.as_i64(),
                cutoff
            ],
        )?;
        Ok(rows)
    }
}
