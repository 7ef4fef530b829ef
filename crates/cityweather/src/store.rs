//! Narrow repository interfaces, one per entity.
//!
//! Pipeline components hold these as `Arc<dyn …>` handles and never touch
//! SQL directly. `Database` implements all of them (see `db::*_repo`).

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::DatabaseError;
use crate::models::{BulkJob, City, JobStatus, Page, RefreshStatus, TaskResult};

/// Idempotent registry of known cities.
pub trait CityStore: Send + Sync {
    /// Create-or-fetch. Concurrent callers with the same name converge on
    /// one row.
    fn upsert(&self, name: &str, now: DateTime<Utc>) -> Result<City, DatabaseError>;

    /// Create-or-fetch for a batch of names inside one short transaction.
    fn upsert_batch(&self, names: &[String], now: DateTime<Utc>)
        -> Result<Vec<City>, DatabaseError>;

    /// Overwrites the refresh outcome. Last writer wins.
    fn record_outcome(
        &self,
        name: &str,
        status: RefreshStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    fn find(&self, name: &str) -> Result<Option<City>, DatabaseError>;

    fn count(&self) -> Result<u64, DatabaseError>;

    /// Refreshed cities, most recent first.
    fn recently_refreshed(
        &self,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<City>, DatabaseError>;
}

/// What [`JobStore::record_task_outcome`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTally {
    /// Task finalized and counted; `completed` if this moved the job to done.
    Counted { completed: bool },
    /// Task finalized, but the job was already at `total`.
    Overrun,
    /// The task was not pending (or the status was not terminal).
    Unchanged,
}

/// Bulk job records.
///
/// `total`, `status` and the timestamps are written by the coordinator;
/// the counters are written only through `record_task_outcome`.
pub trait JobStore: Send + Sync {
    fn create(&self, job_id: &str, now: DateTime<Utc>) -> Result<BulkJob, DatabaseError>;

    fn find(&self, job_id: &str) -> Result<Option<BulkJob>, DatabaseError>;

    fn list_by_status(&self, status: JobStatus) -> Result<Vec<BulkJob>, DatabaseError>;

    fn mark_started(&self, job_id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Raises `total` while the job is still being ingested.
    fn add_to_total(&self, job_id: &str, count: u64) -> Result<(), DatabaseError>;

    /// Fixes `total` to the number of task results and moves the job from
    /// `queued` to `running`. Returns false if the job was not queued.
    fn finalize_total(&self, job_id: &str, invalid_rows: u64) -> Result<bool, DatabaseError>;

    /// Moves an unfinished job to `failed`. Returns false if it had
    /// already finished.
    fn mark_failed(
        &self,
        job_id: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Finalizes a pending task and counts it in one transaction: the task
    /// row turns terminal, `processed` and one of `succeeded`/`failed` move,
    /// and a running job that reaches `total` becomes `done`. On error
    /// nothing changed and the task is still pending.
    fn record_task_outcome(
        &self,
        job_id: &str,
        city: &str,
        status: RefreshStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<TaskTally, DatabaseError>;

    /// `running -> done` once `processed == total`. Only the first caller
    /// to observe equality gets `true`.
    fn complete_if_finished(&self, job_id: &str, at: DateTime<Utc>)
        -> Result<bool, DatabaseError>;

    /// Sets the cancellation flag. Returns false for unknown or finished jobs.
    fn request_cancel(&self, job_id: &str) -> Result<bool, DatabaseError>;

    /// Recomputes the counters of an unfinished job from its task results.
    fn reconcile_counters(&self, job_id: &str) -> Result<(), DatabaseError>;
}

/// Per-job, per-city task records.
pub trait TaskStore: Send + Sync {
    /// Inserts `(job_id, name)` rows that do not exist yet and returns the
    /// names that were actually inserted, in input order.
    fn insert_if_absent(&self, job_id: &str, names: &[String])
        -> Result<Vec<String>, DatabaseError>;

    /// Bumps `attempt_count` on a pending task and returns the new value.
    /// `None` if the task is missing or already terminal.
    fn record_attempt(&self, job_id: &str, city: &str) -> Result<Option<u32>, DatabaseError>;

    fn find(&self, job_id: &str, city: &str) -> Result<Option<TaskResult>, DatabaseError>;

    /// Results for a job ordered by city name.
    fn page(
        &self,
        job_id: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<TaskResult>, DatabaseError>;

    /// Pending city names for a job, strictly after `after`, in name order.
    fn pending_after(
        &self,
        job_id: &str,
        after: Option<&str>,
        limit: u32,
    ) -> Result<Vec<String>, DatabaseError>;
}

/// A single online lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRecord {
    pub city_name: String,
    pub searched_at: DateTime<Utc>,
}

/// Append-only log of online lookups.
pub trait SearchHistoryStore: Send + Sync {
    fn append(&self, city: &str, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    fn recent(&self, limit: u32) -> Result<Vec<SearchRecord>, DatabaseError>;
}
