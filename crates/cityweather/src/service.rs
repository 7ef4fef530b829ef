//! The assembled pipeline.
//!
//! `CityWeatherService` owns the database handle, the shared cache and rate
//! limiter, the task queue with its delay queue, and the worker pool. It is
//! the only place where components are constructed and wired together.

use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::aggregator::ResultAggregator;
use crate::cache::WeatherCache;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::coordinator::{CoordinatorHandles, ImportSummary, JobCoordinator, ResumeReport};
use crate::db::{default_database_path, Database, DatabaseError};
use crate::error::{ConfigError, ImportError, LookupError, QueryError, Result};
use crate::events::{JobProgressBroadcaster, JobProgressEvent};
use crate::ingest::IngestOptions;
use crate::lookup::{WeatherLookup, WeatherReport};
use crate::models::{City, Page};
use crate::provider::{OpenWeatherProvider, RateLimitedProvider, WeatherProvider};
use crate::queue::{ChannelQueue, DelayQueue, TaskQueue};
use crate::retry::RetryPolicy;
use crate::secrets::{expand_home, resolve_secret};
use crate::status::{JobStatusView, StatusQueryService, TaskResultView};
use crate::store::SearchRecord;
use crate::worker::executor::ExecutorHandles;
use crate::worker::{CancelRegistry, TaskExecutor, WorkerPool};

/// Longest cache TTL honoured; larger values are clamped.
pub const MAX_CACHE_TTL_SECS: u64 = 365 * 24 * 60 * 60;

pub struct CityWeatherService {
    coordinator: JobCoordinator,
    status: StatusQueryService,
    lookup: WeatherLookup,
    events: JobProgressBroadcaster,
    queue: Arc<dyn TaskQueue>,
    delay: Arc<DelayQueue>,
    pool: Mutex<Option<WorkerPool>>,
}

impl CityWeatherService {
    /// Opens the configured database and talks to the configured upstream.
    pub fn open(config: &Config) -> Result<Self> {
        let path = database_path(config)?;
        let db = Database::open(&path)?;

        let provider = &config.provider;
        let api_key = resolve_secret(
            provider.api_key.as_deref(),
            provider.api_key_file.as_deref(),
            provider.api_key_env.as_deref(),
        )?;
        let upstream = OpenWeatherProvider::new(&provider.base_url, api_key).map_err(|e| {
            ConfigError::Validation {
                message: format!("provider: {}", e),
            }
        })?;
        let limited: Arc<dyn WeatherProvider> = Arc::new(RateLimitedProvider::new(
            Arc::new(upstream),
            provider.requests_per_second,
            provider.burst,
        ));

        Self::with_components(config, db, limited, Arc::new(SystemClock))
    }

    /// Builds the pipeline over explicit collaborators and resumes any
    /// unfinished jobs found in `db`.
    ///
    /// `provider` is used as-is by both workers and lookups; wrap it in a
    /// [`RateLimitedProvider`] to share one request budget.
    pub fn with_components(
        config: &Config,
        db: Database,
        provider: Arc<dyn WeatherProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = Arc::new(db);
        let events = JobProgressBroadcaster::default();
        let cancels = CancelRegistry::new();
        let ttl_secs = config.cache_ttl_secs.min(MAX_CACHE_TTL_SECS);
        let ttl = chrono::Duration::seconds(ttl_secs as i64);
        let cache = Arc::new(WeatherCache::new(ttl, clock.clone()));
        let timeout = Duration::from_millis(config.provider.timeout_ms);
        let aggregator = ResultAggregator::new(store.clone(), clock.clone(), events.clone());

        let queue: Arc<dyn TaskQueue> =
            Arc::new(ChannelQueue::new(config.effective_queue_capacity()));
        let delay = Arc::new(DelayQueue::start(queue.clone()).map_err(spawn_error)?);

        let executor = Arc::new(TaskExecutor::new(
            ExecutorHandles {
                cities: store.clone(),
                tasks: store.clone(),
                provider: provider.clone(),
                cache: cache.clone(),
                aggregator: aggregator.clone(),
                cancels: cancels.clone(),
                clock: clock.clone(),
            },
            RetryPolicy::from(&config.retry),
            timeout,
        ));
        let pool = WorkerPool::start(
            config.worker_count.max(1),
            queue.clone(),
            delay.clone(),
            executor,
        )
        .map_err(spawn_error)?;

        let coordinator = JobCoordinator::new(
            CoordinatorHandles {
                jobs: store.clone(),
                cities: store.clone(),
                tasks: store.clone(),
                queue: queue.clone(),
                aggregator,
                events: events.clone(),
                cancels,
                clock: clock.clone(),
            },
            IngestOptions {
                batch_size: config.ingest.batch_size,
                max_name_length: config.ingest.max_name_length,
                ..IngestOptions::default()
            },
        );
        let status = StatusQueryService::new(store.clone(), store.clone(), store.clone());
        let lookup = WeatherLookup::new(store.clone(), store, provider, cache, clock)
            .with_max_name_length(config.ingest.max_name_length)
            .with_timeout(timeout);

        let service = Self {
            coordinator,
            status,
            lookup,
            events,
            queue,
            delay,
            pool: Mutex::new(Some(pool)),
        };

        let report = service.resume()?;
        if !report.failed_jobs.is_empty() || !report.resumed_jobs.is_empty() {
            info!(
                failed = report.failed_jobs.len(),
                resumed = report.resumed_jobs.len(),
                requeued = report.requeued_tasks,
                "Recovered unfinished jobs"
            );
        }
        Ok(service)
    }

    /// Starts a bulk import in the background and returns its job id.
    pub fn start_import<R>(&self, reader: R) -> std::result::Result<String, ImportError>
    where
        R: Read + Send + 'static,
    {
        self.coordinator.start_import(reader)
    }

    /// Ingests on the calling thread. Tasks still run on the pool.
    pub fn run_import<R: Read>(&self, reader: R) -> std::result::Result<ImportSummary, ImportError> {
        self.coordinator.run_import(reader)
    }

    pub fn get_job_status(&self, job_id: &str) -> std::result::Result<JobStatusView, QueryError> {
        self.status.get_job(job_id)
    }

    pub fn get_job_results(
        &self,
        job_id: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> std::result::Result<Page<TaskResultView>, QueryError> {
        self.status.get_job_results(job_id, limit, cursor)
    }

    pub fn recently_refreshed(
        &self,
        limit: u32,
        cursor: Option<&str>,
    ) -> std::result::Result<Page<City>, QueryError> {
        self.status.recently_refreshed(limit, cursor)
    }

    pub fn get_cached_weather(&self, city: &str) -> std::result::Result<WeatherReport, LookupError> {
        self.lookup.get_cached_weather(city)
    }

    pub fn recent_searches(&self, limit: u32) -> std::result::Result<Vec<SearchRecord>, LookupError> {
        self.lookup.recent_searches(limit)
    }

    /// Returns false for unknown or already finished jobs.
    pub fn cancel_job(&self, job_id: &str) -> std::result::Result<bool, DatabaseError> {
        self.coordinator.cancel(job_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.events.subscribe()
    }

    pub fn resume(&self) -> std::result::Result<ResumeReport, ImportError> {
        self.coordinator.resume()
    }

    /// Stops accepting imports, lets running ingestions enqueue their last
    /// batch, then closes the queue, drops parked retries and waits for the
    /// workers to finish their current task. Unfinished tasks stay pending
    /// and are picked up again by [`CityWeatherService::resume`].
    pub fn shutdown(&self) {
        let pool = match self.pool.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(pool) = pool else {
            return;
        };

        // Workers keep consuming while ingestion finishes.
        self.coordinator.drain_ingestions();
        self.queue.close();
        let parked = self.delay.shutdown();
        if !parked.is_empty() {
            warn!(count = parked.len(), "Dropping parked retries on shutdown");
        }
        pool.wait();
        info!("Service stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.queue.is_closed()
    }
}

impl Drop for CityWeatherService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn database_path(config: &Config) -> std::result::Result<PathBuf, ConfigError> {
    match config.database_path.as_deref() {
        Some(path) => Ok(expand_home(path)),
        None => default_database_path().ok_or_else(|| ConfigError::Validation {
            message: "could not determine home directory for database_path".to_string(),
        }),
    }
}

fn spawn_error(e: std::io::Error) -> ImportError {
    ImportError::SpawnFailed(e.to_string())
}
