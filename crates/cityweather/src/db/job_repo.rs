//! Job repository: the `bulk_jobs` table.
//!
//! Every counter or status change is a conditional `UPDATE`; the row
//! count it reports tells the caller whether it won the transition. A
//! task outcome moves the task row, the counters and the completion
//! check together in one transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{get_timestamp, get_timestamp_opt, Database, DatabaseError};
use crate::clock::format_timestamp;
use crate::models::{BulkJob, JobStatus, RefreshStatus};
use crate::store::{JobStore, TaskTally};

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<BulkJob> {
    let status: String = row.get("status")?;
    let status = JobStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown job status '{}'", status).into(),
        )
    })?;
    Ok(BulkJob {
        job_id: row.get("job_id")?,
        total: row.get("total")?,
        processed: row.get("processed")?,
        succeeded: row.get("succeeded")?,
        failed: row.get("failed")?,
        status,
        created_at: get_timestamp(row, "created_at")?,
        started_at: get_timestamp_opt(row, "started_at")?,
        finished_at: get_timestamp_opt(row, "finished_at")?,
        error: row.get("error")?,
        invalid_rows: row.get("invalid_rows")?,
        cancel_requested: row.get("cancel_requested")?,
    })
}

impl JobStore for Database {
    fn create(&self, job_id: &str, now: DateTime<Utc>) -> Result<BulkJob, DatabaseError> {
        let created_at = format_timestamp(now);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO bulk_jobs (job_id, status, created_at) VALUES (?1, 'queued', ?2)",
                params![job_id, created_at],
            )?;
            let job = conn.query_row(
                "SELECT * FROM bulk_jobs WHERE job_id = ?1",
                params![job_id],
                job_from_row,
            )?;
            Ok(job)
        })
    }

    fn find(&self, job_id: &str) -> Result<Option<BulkJob>, DatabaseError> {
        self.with_conn(|conn| {
            let job = conn
                .query_row(
                    "SELECT * FROM bulk_jobs WHERE job_id = ?1",
                    params![job_id],
                    job_from_row,
                )
                .optional()?;
            Ok(job)
        })
    }

    fn list_by_status(&self, status: JobStatus) -> Result<Vec<BulkJob>, DatabaseError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM bulk_jobs WHERE status = ?1 ORDER BY created_at ASC",
            )?;
            let jobs = stmt
                .query_map(params![status.as_str()], job_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(jobs)
        })
    }

    fn mark_started(&self, job_id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let at = format_timestamp(at);
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE bulk_jobs SET started_at = COALESCE(started_at, ?2) WHERE job_id = ?1",
                params![job_id, at],
            )?;
            Ok(())
        })
    }

    fn add_to_total(&self, job_id: &str, count: u64) -> Result<(), DatabaseError> {
        if count == 0 {
            return Ok(());
        }
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE bulk_jobs SET total = total + ?2 WHERE job_id = ?1 AND status = 'queued'",
                params![job_id, count],
            )?;
            Ok(())
        })
    }

    fn finalize_total(&self, job_id: &str, invalid_rows: u64) -> Result<bool, DatabaseError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE bulk_jobs
                 SET total = (SELECT COUNT(*) FROM task_results WHERE job_id = ?1),
                     invalid_rows = ?2,
                     status = 'running'
                 WHERE job_id = ?1 AND status = 'queued'",
                params![job_id, invalid_rows],
            )?;
            Ok(changed == 1)
        })
    }

    fn mark_failed(
        &self,
        job_id: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let at = format_timestamp(at);
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE bulk_jobs SET status = 'failed', error = ?2, finished_at = ?3
                 WHERE job_id = ?1 AND status IN ('queued', 'running')",
                params![job_id, error, at],
            )?;
            Ok(changed == 1)
        })
    }

    fn record_task_outcome(
        &self,
        job_id: &str,
        city: &str,
        status: RefreshStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<TaskTally, DatabaseError> {
        if !status.is_terminal() {
            log::warn!(
                "Refusing to finalize task {}/{} with non-terminal status",
                job_id,
                city
            );
            return Ok(TaskTally::Unchanged);
        }
        let (ok, failed) = if status == RefreshStatus::Success {
            (1, 0)
        } else {
            (0, 1)
        };
        let at = format_timestamp(at);

        self.with_transaction(|tx| {
            let finalized = tx.execute(
                "UPDATE task_results SET status = ?3, last_error = ?4, last_refreshed_at = ?5
                 WHERE job_id = ?1 AND city_name = ?2 AND status = 'pending'",
                params![job_id, city, status.as_str(), error, at],
            )?;
            if finalized == 0 {
                return Ok(TaskTally::Unchanged);
            }

            let counted = tx.execute(
                "UPDATE bulk_jobs
                 SET processed = processed + 1,
                     succeeded = succeeded + ?2,
                     failed = failed + ?3
                 WHERE job_id = ?1 AND processed < total",
                params![job_id, ok, failed],
            )?;
            if counted == 0 {
                return Ok(TaskTally::Overrun);
            }

            let completed = tx.execute(
                "UPDATE bulk_jobs SET status = 'done', finished_at = ?2
                 WHERE job_id = ?1 AND status = 'running' AND processed = total",
                params![job_id, at],
            )?;
            Ok(TaskTally::Counted {
                completed: completed == 1,
            })
        })
    }

    fn complete_if_finished(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let at = format_timestamp(at);
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE bulk_jobs SET status = 'done', finished_at = ?2
                 WHERE job_id = ?1 AND status = 'running' AND processed = total",
                params![job_id, at],
            )?;
            Ok(changed == 1)
        })
    }

    fn request_cancel(&self, job_id: &str) -> Result<bool, DatabaseError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE bulk_jobs SET cancel_requested = 1
                 WHERE job_id = ?1 AND status IN ('queued', 'running')",
                params![job_id],
            )?;
            Ok(changed == 1)
        })
    }

    fn reconcile_counters(&self, job_id: &str) -> Result<(), DatabaseError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE bulk_jobs
                 SET succeeded = (SELECT COUNT(*) FROM task_results
                                  WHERE job_id = ?1 AND status = 'success'),
                     failed = (SELECT COUNT(*) FROM task_results
                               WHERE job_id = ?1 AND status = 'failed'),
                     processed = (SELECT COUNT(*) FROM task_results
                                  WHERE job_id = ?1 AND status != 'pending')
                 WHERE job_id = ?1 AND status IN ('queued', 'running')",
                params![job_id],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CityStore, TaskStore};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn find_job(db: &Database, job_id: &str) -> Option<BulkJob> {
        JobStore::find(db, job_id).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    /// Creates a job with `names` as task results and moves it to running.
    fn running_job(db: &Database, job_id: &str, names: &[&str]) {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        db.create(job_id, t0()).unwrap();
        db.upsert_batch(&names, t0()).unwrap();
        let inserted = db.insert_if_absent(job_id, &names).unwrap();
        db.add_to_total(job_id, inserted.len() as u64).unwrap();
        assert!(db.finalize_total(job_id, 0).unwrap());
    }

    #[test]
    fn test_create_and_find() {
        let db = test_db();
        let job = db.create("job-1", t0()).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.total, 0);
        assert_eq!(job.created_at, t0());
        assert!(job.started_at.is_none());
        assert!(!job.cancel_requested);

        assert_eq!(find_job(&db, "job-1"), Some(job));
        assert!(find_job(&db, "missing").is_none());
    }

    #[test]
    fn test_finalize_total_counts_distinct_tasks() {
        let db = test_db();
        running_job(&db, "job-1", &["paris", "london", "paris"]);
        let job = find_job(&db, "job-1").unwrap();
        assert_eq!(job.total, 2);
        assert_eq!(job.status, JobStatus::Running);

        // Only a queued job can be finalized.
        assert!(!db.finalize_total("job-1", 0).unwrap());
    }

    fn record(db: &Database, job_id: &str, city: &str, status: RefreshStatus) -> TaskTally {
        let error = (status == RefreshStatus::Failed).then_some("boom");
        db.record_task_outcome(job_id, city, status, error, t0())
            .unwrap()
    }

    #[test]
    fn test_record_task_outcome_counts_and_completes_once() {
        let db = test_db();
        running_job(&db, "job-1", &["a", "b"]);

        assert_eq!(
            record(&db, "job-1", "a", RefreshStatus::Success),
            TaskTally::Counted { completed: false }
        );
        assert_eq!(
            record(&db, "job-1", "b", RefreshStatus::Failed),
            TaskTally::Counted { completed: true }
        );
        assert!(!db.complete_if_finished("job-1", t0()).unwrap());

        let job = find_job(&db, "job-1").unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!((job.processed, job.succeeded, job.failed), (2, 1, 1));
        assert_eq!(job.finished_at, Some(t0()));

        let task = TaskStore::find(&db, "job-1", "b").unwrap().unwrap();
        assert_eq!(task.status, RefreshStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some("boom"));
        assert_eq!(task.last_refreshed_at, Some(t0()));
    }

    #[test]
    fn test_task_outcome_is_write_once() {
        let db = test_db();
        running_job(&db, "job-1", &["a", "b"]);
        record(&db, "job-1", "a", RefreshStatus::Failed);
        assert_eq!(
            record(&db, "job-1", "a", RefreshStatus::Success),
            TaskTally::Unchanged
        );
        assert_eq!(
            record(&db, "job-1", "b", RefreshStatus::Pending),
            TaskTally::Unchanged
        );
        assert_eq!(
            record(&db, "job-1", "missing", RefreshStatus::Success),
            TaskTally::Unchanged
        );

        let job = find_job(&db, "job-1").unwrap();
        assert_eq!((job.processed, job.failed), (1, 1));
        let task = TaskStore::find(&db, "job-1", "a").unwrap().unwrap();
        assert_eq!(task.status, RefreshStatus::Failed);
    }

    #[test]
    fn test_queued_job_counts_but_does_not_complete() {
        let db = test_db();
        let names = vec!["a".to_string()];
        db.create("job-1", t0()).unwrap();
        db.upsert_batch(&names, t0()).unwrap();
        db.insert_if_absent("job-1", &names).unwrap();
        db.add_to_total("job-1", 1).unwrap();

        // Still ingesting: counted, but only finalize_total may open completion.
        assert_eq!(
            record(&db, "job-1", "a", RefreshStatus::Success),
            TaskTally::Counted { completed: false }
        );
        assert!(db.finalize_total("job-1", 0).unwrap());
        assert!(db.complete_if_finished("job-1", t0()).unwrap());
    }

    #[test]
    fn test_counter_never_overruns_total() {
        let db = test_db();
        running_job(&db, "job-1", &["a"]);
        // A stray task row beyond the fixed total.
        db.upsert_batch(&["b".to_string()], t0()).unwrap();
        db.insert_if_absent("job-1", &["b".to_string()]).unwrap();

        record(&db, "job-1", "a", RefreshStatus::Success);
        assert_eq!(
            record(&db, "job-1", "b", RefreshStatus::Success),
            TaskTally::Overrun
        );
        let job = find_job(&db, "job-1").unwrap();
        assert_eq!(job.processed, 1);
    }

    #[test]
    fn test_concurrent_outcomes_are_atomic() {
        let db = Arc::new(test_db());
        let names: Vec<String> = (0..200).map(|i| format!("city-{:03}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        running_job(&db, "job-1", &refs);
        let names = Arc::new(names);

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let db = Arc::clone(&db);
                let names = Arc::clone(&names);
                std::thread::spawn(move || {
                    let mut transitions = 0;
                    for i in 0..25 {
                        let status = if (worker + i) % 3 != 0 {
                            RefreshStatus::Success
                        } else {
                            RefreshStatus::Failed
                        };
                        let city = &names[worker * 25 + i];
                        if let TaskTally::Counted { completed: true } =
                            record(&db, "job-1", city, status)
                        {
                            transitions += 1;
                        }
                    }
                    transitions
                })
            })
            .collect();
        let transitions: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        let job = find_job(&db, "job-1").unwrap();
        assert_eq!(transitions, 1);
        assert_eq!(job.processed, 200);
        assert_eq!(job.succeeded + job.failed, job.processed);
        assert_eq!(job.status, JobStatus::Done);
    }

    #[test]
    fn test_mark_failed_only_when_unfinished() {
        let db = test_db();
        db.create("job-1", t0()).unwrap();
        assert!(db.mark_failed("job-1", "no rows", t0()).unwrap());
        assert!(!db.mark_failed("job-1", "again", t0()).unwrap());
        let job = find_job(&db, "job-1").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("no rows"));
        assert_eq!(job.finished_at, Some(t0()));
    }

    #[test]
    fn test_mark_started_keeps_first_timestamp() {
        let db = test_db();
        db.create("job-1", t0()).unwrap();
        db.mark_started("job-1", t0()).unwrap();
        db.mark_started("job-1", t0() + chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(find_job(&db, "job-1").unwrap().started_at, Some(t0()));
    }

    #[test]
    fn test_request_cancel() {
        let db = test_db();
        running_job(&db, "job-1", &["a"]);
        assert!(db.request_cancel("job-1").unwrap());
        assert!(find_job(&db, "job-1").unwrap().cancel_requested);
        assert!(!db.request_cancel("unknown").unwrap());
    }

    #[test]
    fn test_reconcile_counters_from_task_results() {
        let db = test_db();
        running_job(&db, "job-1", &["a", "b", "c"]);
        record(&db, "job-1", "a", RefreshStatus::Success);
        record(&db, "job-1", "b", RefreshStatus::Failed);
        // Counters drifted from the task rows.
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE bulk_jobs SET processed = 0, succeeded = 0, failed = 0",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        db.reconcile_counters("job-1").unwrap();

        let job = find_job(&db, "job-1").unwrap();
        assert_eq!((job.processed, job.succeeded, job.failed), (2, 1, 1));
    }

    #[test]
    fn test_list_by_status() {
        let db = test_db();
        db.create("q", t0()).unwrap();
        running_job(&db, "r", &["a"]);
        let queued = db.list_by_status(JobStatus::Queued).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].job_id, "q");
        assert_eq!(db.list_by_status(JobStatus::Running).unwrap().len(), 1);
    }
}
