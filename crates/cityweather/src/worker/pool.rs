use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::error::DispatchError;
use crate::queue::{DelayQueue, TaskQueue};
use crate::worker::executor::{ExecutionOutcome, TaskExecutor};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fixed set of OS threads pulling tasks from a shared queue. At most
/// `worker_count` tasks execute at once.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    busy: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// # Panics
    /// Panics if `worker_count` is 0.
    pub fn start(
        worker_count: usize,
        queue: Arc<dyn TaskQueue>,
        delay: Arc<DelayQueue>,
        executor: Arc<TaskExecutor>,
    ) -> std::io::Result<Self> {
        assert!(worker_count > 0, "worker_count must be > 0");
        let shutdown = Arc::new(AtomicBool::new(false));
        let busy = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let ctx = WorkerContext {
                worker_id,
                queue: Arc::clone(&queue),
                delay: Arc::clone(&delay),
                executor: Arc::clone(&executor),
                shutdown: Arc::clone(&shutdown),
                busy: Arc::clone(&busy),
            };
            let spawned = thread::Builder::new()
                .name(format!("worker-{}", worker_id))
                .spawn(move || run_worker(ctx));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::SeqCst);
                    join_all(workers);
                    return Err(e);
                }
            }
        }

        info!("Started {} workers", worker_count);

        Ok(Self {
            workers,
            shutdown,
            busy,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Workers currently executing a task.
    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Asks workers to stop after their current task.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn wait(self) {
        self.shutdown();
        join_all(self.workers);
        info!("All workers have stopped");
    }
}

fn join_all(workers: Vec<JoinHandle<()>>) {
    for (i, worker) in workers.into_iter().enumerate() {
        if let Err(e) = worker.join() {
            error!("Worker {} panicked: {:?}", i, e);
        } else {
            debug!("Worker {} finished", i);
        }
    }
}

struct WorkerContext {
    worker_id: usize,
    queue: Arc<dyn TaskQueue>,
    delay: Arc<DelayQueue>,
    executor: Arc<TaskExecutor>,
    shutdown: Arc<AtomicBool>,
    busy: Arc<AtomicUsize>,
}

fn run_worker(ctx: WorkerContext) {
    debug!("Worker {} started", ctx.worker_id);

    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            debug!("Worker {} received shutdown signal", ctx.worker_id);
            break;
        }

        match ctx.queue.consume(POLL_INTERVAL) {
            Ok(Some(task)) => {
                ctx.busy.fetch_add(1, Ordering::SeqCst);
                let outcome = ctx.executor.execute(&task);
                ctx.busy.fetch_sub(1, Ordering::SeqCst);

                if let ExecutionOutcome::Retry(delay) = outcome {
                    ctx.delay.schedule(task, delay);
                }
            }
            Ok(None) => continue,
            Err(DispatchError::Closed) => {
                debug!("Worker {} queue closed", ctx.worker_id);
                break;
            }
            Err(e) => {
                error!("Worker {} failed to consume: {}", ctx.worker_id, e);
                break;
            }
        }
    }

    debug!("Worker {} stopped", ctx.worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ResultAggregator;
    use crate::cache::WeatherCache;
    use crate::clock::{Clock, SystemClock};
    use crate::db::Database;
    use crate::events::JobProgressBroadcaster;
    use crate::models::{JobStatus, Weather};
    use crate::provider::{ProviderError, WeatherProvider};
    use crate::queue::{ChannelQueue, Task};
    use crate::retry::RetryPolicy;
    use crate::store::{CityStore, JobStore, TaskStore};
    use crate::worker::executor::ExecutorHandles;
    use crate::worker::CancelRegistry;
    use std::time::Instant;

    /// Sleeps a little and tracks peak concurrency.
    struct SlowProvider {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl WeatherProvider for SlowProvider {
        fn fetch(&self, _city: &str, _timeout: Duration) -> Result<Weather, ProviderError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(Weather {
                temperature: 10.0,
                condition: "Rain".to_string(),
                humidity: 90,
            })
        }
    }

    #[test]
    fn test_pool_respects_concurrency_ceiling() {
        let db = Database::open_in_memory().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let names: Vec<String> = (0..24).map(|i| format!("city-{:02}", i)).collect();
        JobStore::create(&db, "job-1", clock.now()).unwrap();
        db.upsert_batch(&names, clock.now()).unwrap();
        db.insert_if_absent("job-1", &names).unwrap();
        db.add_to_total("job-1", names.len() as u64).unwrap();
        db.finalize_total("job-1", 0).unwrap();

        let store = Arc::new(db.clone());
        let provider = Arc::new(SlowProvider {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let executor = Arc::new(TaskExecutor::new(
            ExecutorHandles {
                cities: store.clone(),
                tasks: store.clone(),
                provider: provider.clone(),
                cache: Arc::new(WeatherCache::new(chrono::Duration::minutes(10), clock.clone())),
                aggregator: ResultAggregator::new(
                    store.clone(),
                    clock.clone(),
                    JobProgressBroadcaster::default(),
                ),
                cancels: CancelRegistry::new(),
                clock: clock.clone(),
            },
            RetryPolicy::default(),
            Duration::from_secs(1),
        ));

        let queue: Arc<dyn TaskQueue> = Arc::new(ChannelQueue::new(64));
        let delay = Arc::new(DelayQueue::start(queue.clone()).unwrap());
        let pool = WorkerPool::start(3, queue.clone(), delay, executor).unwrap();
        assert_eq!(pool.worker_count(), 3);

        for name in &names {
            queue.enqueue(Task::new("job-1", name.as_str())).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while JobStore::find(&db, "job-1").unwrap().unwrap().status != JobStatus::Done {
            assert!(Instant::now() < deadline, "job did not finish");
            thread::sleep(Duration::from_millis(10));
        }

        pool.wait();
        assert!(provider.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(CityStore::count(&db).unwrap(), 24);
        assert!(TaskStore::pending_after(&db, "job-1", None, 100)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_workers_exit_when_queue_closes() {
        let db = Database::open_in_memory().unwrap();
        let store = Arc::new(db);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let executor = Arc::new(TaskExecutor::new(
            ExecutorHandles {
                cities: store.clone(),
                tasks: store.clone(),
                provider: Arc::new(SlowProvider {
                    current: AtomicUsize::new(0),
                    peak: AtomicUsize::new(0),
                }),
                cache: Arc::new(WeatherCache::new(chrono::Duration::minutes(10), clock.clone())),
                aggregator: ResultAggregator::new(
                    store,
                    clock.clone(),
                    JobProgressBroadcaster::default(),
                ),
                cancels: CancelRegistry::new(),
                clock,
            },
            RetryPolicy::default(),
            Duration::from_secs(1),
        ));
        let queue: Arc<dyn TaskQueue> = Arc::new(ChannelQueue::new(4));
        let delay = Arc::new(DelayQueue::start(queue.clone()).unwrap());
        let pool = WorkerPool::start(2, queue.clone(), delay, executor).unwrap();

        queue.close();
        let started = Instant::now();
        // Joins without an explicit shutdown flag once the queue reports closed.
        for handle in pool.workers {
            handle.join().unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
