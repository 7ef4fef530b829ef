//! Bulk import orchestration.
//!
//! The coordinator owns a job's lifecycle: it creates the record, streams
//! the input into the registry and the task queue, fixes the total once
//! ingestion is exhausted, and hands completion over to the aggregator.
//!
//! `total` only grows while the job is `queued`, always before the tasks
//! it accounts for are enqueued, and the job only becomes `running` after
//! the last batch. Workers may finish tasks during ingestion; completion
//! can still only fire on the final total.

use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::aggregator::ResultAggregator;
use crate::clock::Clock;
use crate::db::DatabaseError;
use crate::error::{DispatchError, ImportError};
use crate::events::{JobEventKind, JobProgressBroadcaster};
use crate::ingest::{CsvIngester, IngestOptions};
use crate::models::JobStatus;
use crate::queue::{Task, TaskQueue};
use crate::store::{CityStore, JobStore, TaskStore};
use crate::worker::CancelRegistry;

/// Error recorded on jobs whose ingestion was cut short by a restart.
pub const INTERRUPTED_ERROR: &str = "ingestion interrupted";

/// Page size used when re-enqueueing pending tasks after a restart.
const RESUME_PAGE: u32 = 500;

/// Outcome of a synchronous import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub total: u64,
    pub invalid_rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What restart recovery did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeReport {
    pub failed_jobs: Vec<String>,
    pub resumed_jobs: Vec<String>,
    pub requeued_tasks: u64,
}

/// Background ingestions, and whether new ones may start.
struct Ingestions {
    accepting: bool,
    threads: Vec<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct JobCoordinator {
    jobs: Arc<dyn JobStore>,
    cities: Arc<dyn CityStore>,
    tasks: Arc<dyn TaskStore>,
    queue: Arc<dyn TaskQueue>,
    aggregator: ResultAggregator,
    events: JobProgressBroadcaster,
    cancels: CancelRegistry,
    clock: Arc<dyn Clock>,
    options: IngestOptions,
    ingestions: Arc<Mutex<Ingestions>>,
}

/// Handles the coordinator is built from.
#[derive(Clone)]
pub struct CoordinatorHandles {
    pub jobs: Arc<dyn JobStore>,
    pub cities: Arc<dyn CityStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub aggregator: ResultAggregator,
    pub events: JobProgressBroadcaster,
    pub cancels: CancelRegistry,
    pub clock: Arc<dyn Clock>,
}

impl JobCoordinator {
    pub fn new(handles: CoordinatorHandles, options: IngestOptions) -> Self {
        Self {
            jobs: handles.jobs,
            cities: handles.cities,
            tasks: handles.tasks,
            queue: handles.queue,
            aggregator: handles.aggregator,
            events: handles.events,
            cancels: handles.cancels,
            clock: handles.clock,
            options,
            ingestions: Arc::new(Mutex::new(Ingestions {
                accepting: true,
                threads: Vec::new(),
            })),
        }
    }

    /// Creates a job and ingests `reader` on a background thread.
    ///
    /// Returns as soon as the job record exists. Fails without creating a
    /// job if the task queue no longer accepts work.
    pub fn start_import<R>(&self, reader: R) -> Result<String, ImportError>
    where
        R: Read + Send + 'static,
    {
        let mut ingestions = self.lock_ingestions();
        if !ingestions.accepting {
            return Err(ImportError::CoordinatorUnavailable(DispatchError::Closed));
        }
        let job_id = self.create_job()?;

        let coordinator = self.clone();
        let thread_job_id = job_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("import-{}", &job_id[..8.min(job_id.len())]))
            .spawn(move || {
                coordinator.ingest(&thread_job_id, reader);
            });

        match spawned {
            Ok(handle) => {
                ingestions.threads.retain(|t| !t.is_finished());
                ingestions.threads.push(handle);
                Ok(job_id)
            }
            Err(e) => {
                let message = format!("failed to spawn ingestion thread: {}", e);
                self.fail_job(&job_id, &message);
                Err(ImportError::SpawnFailed(e.to_string()))
            }
        }
    }

    /// Creates a job and ingests `reader` on the calling thread.
    pub fn run_import<R: Read>(&self, reader: R) -> Result<ImportSummary, ImportError> {
        if !self.lock_ingestions().accepting {
            return Err(ImportError::CoordinatorUnavailable(DispatchError::Closed));
        }
        let job_id = self.create_job()?;
        Ok(self.ingest(&job_id, reader))
    }

    /// Refuses new imports and blocks until every background ingestion has
    /// enqueued its last batch and left `queued`. The task queue must stay
    /// open and consumed until this returns.
    pub fn drain_ingestions(&self) {
        let threads = {
            let mut ingestions = self.lock_ingestions();
            ingestions.accepting = false;
            std::mem::take(&mut ingestions.threads)
        };
        if !threads.is_empty() {
            info!(count = threads.len(), "Waiting for ingestion to finish");
        }
        for thread in threads {
            let name = thread.thread().name().unwrap_or("import").to_string();
            if thread.join().is_err() {
                error!(thread = %name, "Ingestion thread panicked");
            }
        }
    }

    /// Requests cancellation. Tasks not yet executed are finalized as
    /// failed; tasks already running finish normally. Returns false for
    /// unknown or finished jobs.
    pub fn cancel(&self, job_id: &str) -> Result<bool, DatabaseError> {
        if !self.jobs.request_cancel(job_id)? {
            return Ok(false);
        }
        self.cancels.cancel(job_id);
        info!(%job_id, "Cancellation requested");
        self.events
            .emit(job_id, JobEventKind::CancelRequested, self.clock.now());
        Ok(true)
    }

    /// Restart recovery over persisted state.
    ///
    /// Jobs still `queued` lost their input stream and are failed. Jobs
    /// `running` get their counters rebuilt from task results, their
    /// pending tasks re-enqueued, and a fresh completion check.
    pub fn resume(&self) -> Result<ResumeReport, ImportError> {
        let mut report = ResumeReport::default();
        let now = self.clock.now();

        for job in self.jobs.list_by_status(JobStatus::Queued)? {
            if self.jobs.mark_failed(&job.job_id, INTERRUPTED_ERROR, now)? {
                warn!(job_id = %job.job_id, "Ingestion was interrupted, job failed");
                self.events.emit(
                    &job.job_id,
                    JobEventKind::Failed {
                        error: INTERRUPTED_ERROR.to_string(),
                    },
                    now,
                );
                report.failed_jobs.push(job.job_id);
            }
        }

        for job in self.jobs.list_by_status(JobStatus::Running)? {
            let job_id = job.job_id;
            self.jobs.reconcile_counters(&job_id)?;
            if job.cancel_requested {
                self.cancels.cancel(&job_id);
            }

            let mut after: Option<String> = None;
            loop {
                let page = self
                    .tasks
                    .pending_after(&job_id, after.as_deref(), RESUME_PAGE)?;
                let Some(last) = page.last().cloned() else {
                    break;
                };
                for city in page {
                    self.queue
                        .enqueue(Task::new(job_id.clone(), city))
                        .map_err(ImportError::CoordinatorUnavailable)?;
                    report.requeued_tasks += 1;
                }
                after = Some(last);
            }

            self.aggregator.check_completion(&job_id)?;
            info!(%job_id, "Resumed bulk job");
            report.resumed_jobs.push(job_id);
        }

        Ok(report)
    }

    fn lock_ingestions(&self) -> MutexGuard<'_, Ingestions> {
        self.ingestions.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn create_job(&self) -> Result<String, ImportError> {
        if self.queue.is_closed() {
            return Err(ImportError::CoordinatorUnavailable(DispatchError::Closed));
        }
        let job_id = Uuid::new_v4().to_string();
        let now = self.clock.now();
        self.jobs.create(&job_id, now)?;
        info!(%job_id, "Bulk job created");
        self.events.emit(&job_id, JobEventKind::Created, now);
        Ok(job_id)
    }

    /// Runs ingestion to the end. Every failure is folded into the job
    /// record rather than returned.
    fn ingest<R: Read>(&self, job_id: &str, reader: R) -> ImportSummary {
        let span = info_span!("ingest", %job_id);
        let _enter = span.enter();

        if let Err(e) = self.jobs.mark_started(job_id, self.clock.now()) {
            warn!(error = %e, "Failed to stamp started_at");
        }

        let mut ingester = CsvIngester::new(reader, self.options);
        loop {
            let batch = match ingester.next_batch() {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => return self.abort(job_id, &e.to_string(), ingester.stats().invalid),
            };
            if let Err(message) = self.dispatch_batch(job_id, &batch) {
                return self.abort(job_id, &message, ingester.stats().invalid);
            }
        }

        let stats = match ingester.finish() {
            Ok(stats) => stats,
            Err(e) => return self.abort(job_id, &e.to_string(), ingester.stats().invalid),
        };

        match self.jobs.finalize_total(job_id, stats.invalid) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Job left queued state during ingestion");
                return self.summary(job_id, stats.invalid);
            }
            Err(e) => return self.abort(job_id, &e.to_string(), stats.invalid),
        }

        let summary = self.summary(job_id, stats.invalid);
        info!(
            total = summary.total,
            invalid = stats.invalid,
            "Ingestion finished"
        );
        self.events.emit(
            job_id,
            JobEventKind::Running {
                total: summary.total,
            },
            self.clock.now(),
        );

        // Tasks may all have finished while the total was still open.
        match self.aggregator.check_completion(job_id) {
            Ok(true) => self.summary(job_id, stats.invalid),
            Ok(false) => summary,
            Err(e) => {
                error!(error = %e, "Completion check failed");
                summary
            }
        }
    }

    /// Registers one batch and enqueues its new tasks.
    fn dispatch_batch(&self, job_id: &str, names: &[String]) -> Result<(), String> {
        let now = self.clock.now();
        self.cities
            .upsert_batch(names, now)
            .map_err(|e| e.to_string())?;
        let inserted = self
            .tasks
            .insert_if_absent(job_id, names)
            .map_err(|e| e.to_string())?;
        if inserted.is_empty() {
            return Ok(());
        }

        self.jobs
            .add_to_total(job_id, inserted.len() as u64)
            .map_err(|e| e.to_string())?;
        debug!(count = inserted.len(), "Enqueueing batch");

        for city in inserted {
            self.queue
                .enqueue(Task::new(job_id, city))
                .map_err(|e| format!("task queue rejected work: {}", e))?;
        }
        Ok(())
    }

    fn abort(&self, job_id: &str, message: &str, invalid_rows: u64) -> ImportSummary {
        self.fail_job(job_id, message);
        let mut summary = self.summary(job_id, invalid_rows);
        summary.status = JobStatus::Failed;
        summary.error = Some(message.to_string());
        summary
    }

    fn fail_job(&self, job_id: &str, message: &str) {
        let now = self.clock.now();
        match self.jobs.mark_failed(job_id, message, now) {
            Ok(true) => {
                warn!(%job_id, error = %message, "Bulk job failed");
                self.events.emit(
                    job_id,
                    JobEventKind::Failed {
                        error: message.to_string(),
                    },
                    now,
                );
            }
            Ok(false) => {}
            Err(e) => error!(%job_id, error = %e, "Failed to mark job failed"),
        }
    }

    fn summary(&self, job_id: &str, invalid_rows: u64) -> ImportSummary {
        match self.jobs.find(job_id) {
            Ok(Some(job)) => ImportSummary {
                job_id: job.job_id,
                status: job.status,
                total: job.total,
                invalid_rows: job.invalid_rows.max(invalid_rows),
                error: job.error,
            },
            _ => ImportSummary {
                job_id: job_id.to_string(),
                status: JobStatus::Failed,
                total: 0,
                invalid_rows,
                error: None,
            },
        }
    }
}
