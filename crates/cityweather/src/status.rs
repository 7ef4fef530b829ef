//! Read-only projections over job, task and city state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::DatabaseError;
use crate::error::QueryError;
use crate::models::{BulkJob, City, JobStatus, Page, RefreshStatus, TaskResult};
use crate::store::{CityStore, JobStore, TaskStore};

pub const DEFAULT_PAGE_LIMIT: u32 = 100;
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Externally visible job progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: String,
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub invalid_rows: u64,
    pub cancel_requested: bool,
}

impl From<BulkJob> for JobStatusView {
    fn from(job: BulkJob) -> Self {
        Self {
            job_id: job.job_id,
            total: job.total,
            processed: job.processed,
            succeeded: job.succeeded,
            failed: job.failed,
            status: job.status,
            started_at: job.started_at,
            finished_at: job.finished_at,
            error: job.error,
            invalid_rows: job.invalid_rows,
            cancel_requested: job.cancel_requested,
        }
    }
}

/// One row of a job's per-city results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultView {
    pub city: String,
    pub status: RefreshStatus,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<TaskResult> for TaskResultView {
    fn from(result: TaskResult) -> Self {
        Self {
            city: result.city_name,
            status: result.status,
            last_refreshed_at: result.last_refreshed_at,
            last_error: result.last_error,
        }
    }
}

pub fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_PAGE_LIMIT)
}

fn map_query_error(e: DatabaseError) -> QueryError {
    match e {
        DatabaseError::InvalidCursor => QueryError::InvalidCursor,
        other => QueryError::Database(other),
    }
}

#[derive(Clone)]
pub struct StatusQueryService {
    jobs: Arc<dyn JobStore>,
    tasks: Arc<dyn TaskStore>,
    cities: Arc<dyn CityStore>,
}

impl StatusQueryService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        tasks: Arc<dyn TaskStore>,
        cities: Arc<dyn CityStore>,
    ) -> Self {
        Self {
            jobs,
            tasks,
            cities,
        }
    }

    pub fn get_job(&self, job_id: &str) -> Result<JobStatusView, QueryError> {
        self.jobs
            .find(job_id)?
            .map(JobStatusView::from)
            .ok_or_else(|| QueryError::JobNotFound(job_id.to_string()))
    }

    /// Results ordered by city name.
    pub fn get_job_results(
        &self,
        job_id: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<TaskResultView>, QueryError> {
        if self.jobs.find(job_id)?.is_none() {
            return Err(QueryError::JobNotFound(job_id.to_string()));
        }
        let page = self
            .tasks
            .page(job_id, clamp_limit(limit), cursor)
            .map_err(map_query_error)?;
        Ok(Page {
            items: page.items.into_iter().map(TaskResultView::from).collect(),
            next_cursor: page.next_cursor,
        })
    }

    /// Refreshed cities, newest first.
    pub fn recently_refreshed(
        &self,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<City>, QueryError> {
        self.cities
            .recently_refreshed(clamp_limit(limit), cursor)
            .map_err(map_query_error)
    }
}
