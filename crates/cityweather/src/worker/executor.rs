//! One attempt at one task.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, info_span, warn};

use super::CancelRegistry;
use crate::aggregator::{ReportOutcome, ResultAggregator};
use crate::cache::WeatherCache;
use crate::clock::Clock;
use crate::db::DatabaseError;
use crate::models::RefreshStatus;
use crate::provider::WeatherProvider;
use crate::queue::Task;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{CityStore, TaskStore};

/// Error text recorded on tasks dropped by a cancellation.
pub const CANCELLED_ERROR: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    Failed,
    /// Transient failure, or the outcome could not be recorded; park the
    /// task for this long.
    Retry(Duration),
    /// The job was cancelled; the task was finalized as failed.
    Cancelled,
    /// The task was already terminal. Nothing was reported.
    Skipped,
}

/// Everything a worker touches while executing a task.
#[derive(Clone)]
pub struct ExecutorHandles {
    pub cities: Arc<dyn CityStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub provider: Arc<dyn WeatherProvider>,
    pub cache: Arc<WeatherCache>,
    pub aggregator: ResultAggregator,
    pub cancels: CancelRegistry,
    pub clock: Arc<dyn Clock>,
}

pub struct TaskExecutor {
    handles: ExecutorHandles,
    policy: RetryPolicy,
    timeout: Duration,
    rng: Mutex<StdRng>,
}

impl TaskExecutor {
    pub fn new(handles: ExecutorHandles, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            handles,
            policy,
            timeout,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Uses a fixed jitter seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn execute(&self, task: &Task) -> ExecutionOutcome {
        let span = info_span!("task", job_id = %task.job_id, city = %task.city);
        let _enter = span.enter();

        if self.handles.cancels.is_cancelled(&task.job_id) {
            return match self.finalize(task, RefreshStatus::Failed, Some(CANCELLED_ERROR)) {
                ExecutionOutcome::Failed => ExecutionOutcome::Cancelled,
                other => other,
            };
        }

        let attempt = match self.handles.tasks.record_attempt(&task.job_id, &task.city) {
            Ok(Some(attempt)) => attempt,
            Ok(None) => {
                debug!("Task already finished, skipping");
                return ExecutionOutcome::Skipped;
            }
            Err(e) => return self.fail_persistence(task, &e),
        };

        match self.handles.provider.fetch(&task.city, self.timeout) {
            Ok(weather) => {
                self.handles.cache.insert(&task.city, weather);
                let now = self.handles.clock.now();
                if let Err(e) =
                    self.handles
                        .cities
                        .record_outcome(&task.city, RefreshStatus::Success, None, now)
                {
                    return self.fail_persistence(task, &e);
                }
                debug!(attempt, "Weather refreshed");
                self.finalize(task, RefreshStatus::Success, None)
            }
            Err(failure) => {
                let decision = {
                    let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
                    self.policy.decide(&failure, attempt, &mut *rng)
                };
                match decision {
                    RetryDecision::RetryAfter(delay) => {
                        info!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure,
                            "Transient failure, will retry"
                        );
                        ExecutionOutcome::Retry(delay)
                    }
                    RetryDecision::GiveUp => {
                        warn!(attempt, error = %failure, "Refresh failed");
                        let message = failure.to_string();
                        let now = self.handles.clock.now();
                        if let Err(e) = self.handles.cities.record_outcome(
                            &task.city,
                            RefreshStatus::Failed,
                            Some(&message),
                            now,
                        ) {
                            return self.fail_persistence(task, &e);
                        }
                        self.finalize(task, RefreshStatus::Failed, Some(&message))
                    }
                }
            }
        }
    }

    /// Writes the terminal task status and counts it, once. If the write
    /// fails the task stays pending and comes back after a short backoff.
    fn finalize(
        &self,
        task: &Task,
        status: RefreshStatus,
        message: Option<&str>,
    ) -> ExecutionOutcome {
        match self
            .handles
            .aggregator
            .report(&task.job_id, &task.city, status, message)
        {
            Ok(ReportOutcome::AlreadyFinal) => {
                debug!("Task finalized elsewhere, not reporting");
                return ExecutionOutcome::Skipped;
            }
            Ok(ReportOutcome::Completed) => self.handles.cancels.forget(&task.job_id),
            Ok(_) => {}
            Err(e) => {
                let delay = {
                    let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
                    self.policy.backoff(1, &mut *rng)
                };
                error!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Failed to record task outcome, will retry"
                );
                return ExecutionOutcome::Retry(delay);
            }
        }

        if status == RefreshStatus::Success {
            ExecutionOutcome::Succeeded
        } else {
            ExecutionOutcome::Failed
        }
    }

    fn fail_persistence(&self, task: &Task, cause: &DatabaseError) -> ExecutionOutcome {
        error!(error = %cause, "Persistence failure during task");
        let message = format!("persistence error: {}", cause);
        self.finalize(task, RefreshStatus::Failed, Some(&message))
    }
}
