//! Folds terminal task outcomes into job counters.
//!
//! A terminal outcome finalizes the task row, bumps the counters and runs
//! the guarded `running -> done` update in one transaction, so any number
//! of workers can report concurrently and in any order, and a failed write
//! leaves the task pending for another attempt.

use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::db::DatabaseError;
use crate::events::{JobEventKind, JobProgressBroadcaster};
use crate::models::RefreshStatus;
use crate::store::{JobStore, TaskTally};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Counters moved; the job is not finished yet.
    Counted,
    /// Counters moved and this report completed the job.
    Completed,
    /// The task was finalized but the job was already at `total`.
    Ignored,
    /// The task was no longer pending; nothing changed.
    AlreadyFinal,
}

#[derive(Clone)]
pub struct ResultAggregator {
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    events: JobProgressBroadcaster,
}

impl ResultAggregator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        events: JobProgressBroadcaster,
    ) -> Self {
        Self {
            jobs,
            clock,
            events,
        }
    }

    /// Records one terminal outcome for `city` in `job_id`.
    ///
    /// On `Err` nothing was written and the task is still pending.
    pub fn report(
        &self,
        job_id: &str,
        city: &str,
        status: RefreshStatus,
        error: Option<&str>,
    ) -> Result<ReportOutcome, DatabaseError> {
        let now = self.clock.now();
        let completed = match self
            .jobs
            .record_task_outcome(job_id, city, status, error, now)?
        {
            TaskTally::Counted { completed } => completed,
            TaskTally::Overrun => {
                warn!(%job_id, %city, "Report ignored: job already at total");
                return Ok(ReportOutcome::Ignored);
            }
            TaskTally::Unchanged => return Ok(ReportOutcome::AlreadyFinal),
        };

        match self.jobs.find(job_id) {
            Ok(Some(job)) => self.events.emit(
                job_id,
                JobEventKind::TaskFinished {
                    city: city.to_string(),
                    succeeded: status == RefreshStatus::Success,
                    processed: job.processed,
                    total: job.total,
                },
                now,
            ),
            Ok(None) => {}
            Err(e) => warn!(%job_id, error = %e, "Could not read progress for event"),
        }

        if completed {
            self.announce_done(job_id, now);
            Ok(ReportOutcome::Completed)
        } else {
            Ok(ReportOutcome::Counted)
        }
    }

    /// Moves a running job with `processed == total` to done. Returns true
    /// only for the one caller that performed the transition.
    pub fn check_completion(&self, job_id: &str) -> Result<bool, DatabaseError> {
        let now = self.clock.now();
        if !self.jobs.complete_if_finished(job_id, now)? {
            return Ok(false);
        }
        self.announce_done(job_id, now);
        Ok(true)
    }

    fn announce_done(&self, job_id: &str, now: chrono::DateTime<chrono::Utc>) {
        info!(%job_id, "Bulk job done");
        self.events.emit(job_id, JobEventKind::Done, now);
    }
}
