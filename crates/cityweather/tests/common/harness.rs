//! Test harness for isolated pipeline runs.
//!
//! `TestHarness` wires a real `CityWeatherService` (worker pool, delay
//! queue, coordinator) around test doubles:
//! - an in-memory (or caller-supplied) SQLite database
//! - `ScriptedProvider`, which replays per-city responses
//! - a `ManualClock` driving cache expiry and stored timestamps

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};

use cityweather::status::JobStatusView;
use cityweather::{
    CityWeatherService, Config, Database, JobStatus, ManualClock, ProviderError, Weather,
    WeatherProvider,
};

use super::builders::weather;

/// Replays scripted responses per city, then falls back to a default.
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<Result<Weather, ProviderError>>>>,
    always: Mutex<HashMap<String, ProviderError>>,
    calls: Mutex<HashMap<String, u32>>,
    latency: Duration,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Every call sleeps for `latency` first.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            always: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            latency,
        }
    }

    /// Queues responses for `city`; once used up, calls succeed.
    pub fn script(&self, city: &str, responses: Vec<Result<Weather, ProviderError>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(city.to_string(), responses.into());
    }

    /// Makes every call for `city` fail with `error`.
    pub fn fail_always(&self, city: &str, error: ProviderError) {
        self.always.lock().unwrap().insert(city.to_string(), error);
    }

    pub fn calls(&self, city: &str) -> u32 {
        self.calls.lock().unwrap().get(city).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

impl WeatherProvider for ScriptedProvider {
    fn fetch(&self, city: &str, _timeout: Duration) -> Result<Weather, ProviderError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        *self.calls.lock().unwrap().entry(city.to_string()).or_insert(0) += 1;

        if let Some(error) = self.always.lock().unwrap().get(city) {
            return Err(error.clone());
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(city)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or_else(|| Ok(weather(20.0, "Clear")))
    }
}

/// A running service plus handles on its collaborators.
pub struct TestHarness {
    pub db: Database,
    pub clock: Arc<ManualClock>,
    pub provider: Arc<ScriptedProvider>,
    pub service: CityWeatherService,
}

impl TestHarness {
    pub fn new(config: Config) -> Self {
        Self::with_provider(config, ScriptedProvider::new())
    }

    pub fn with_provider(config: Config, provider: ScriptedProvider) -> Self {
        let db = Database::open_in_memory().expect("Failed to open in-memory database");
        Self::with_database(config, db, provider)
    }

    /// Starts the service over an existing database; unfinished jobs in it
    /// are resumed.
    pub fn with_database(config: Config, db: Database, provider: ScriptedProvider) -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap(),
        ));
        let provider = Arc::new(provider);
        let service =
            CityWeatherService::with_components(&config, db.clone(), provider.clone(), clock.clone())
                .expect("Failed to start service");
        Self {
            db,
            clock,
            provider,
            service,
        }
    }

    /// Starts an import of `content` and returns the job id.
    pub fn import(&self, content: &str) -> String {
        self.service
            .start_import(Cursor::new(content.to_string()))
            .expect("Failed to start import")
    }

    /// Polls until the job reaches `done` or `failed`.
    pub fn wait_for_finish(&self, job_id: &str) -> JobStatusView {
        self.wait_until(job_id, |s| s.status.is_finished())
    }

    /// Polls until `done` specifically. `failed` jobs never get there, so
    /// this also waits out tasks that keep running after a failure.
    pub fn wait_for_done(&self, job_id: &str) -> JobStatusView {
        self.wait_until(job_id, |s| s.status == JobStatus::Done)
    }

    pub fn wait_until<F>(&self, job_id: &str, predicate: F) -> JobStatusView
    where
        F: Fn(&JobStatusView) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let status = self
                .service
                .get_job_status(job_id)
                .expect("Failed to read job status");
            if predicate(&status) {
                return status;
            }
            assert!(
                Instant::now() < deadline,
                "Timed out waiting on job {}: {:?}",
                job_id,
                status
            );
            thread::sleep(Duration::from_millis(5));
        }
    }
}
