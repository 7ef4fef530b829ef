//! Parking lot for tasks waiting out a retry backoff.
//!
//! A single scheduler thread keeps parked tasks in a min-heap keyed by due
//! instant and hands each one back to the task queue when its delay has
//! passed. Workers never sleep through a backoff themselves.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{Task, TaskQueue};
use crate::error::DispatchError;

struct Parked {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Parked {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Parked {}

impl PartialOrd for Parked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Parked {
    // Reversed so the std max-heap pops the earliest due task first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct State {
    parked: BinaryHeap<Parked>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct DelayQueue {
    shared: Arc<Shared>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl DelayQueue {
    /// Starts the scheduler thread. Due tasks are pushed into `target`.
    pub fn start(target: Arc<dyn TaskQueue>) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wakeup: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("delay-queue".to_string())
            .spawn(move || run_scheduler(thread_shared, target))?;

        Ok(Self {
            shared,
            scheduler: Mutex::new(Some(handle)),
        })
    }

    /// Parks `task` for `delay`.
    pub fn schedule(&self, task: Task, delay: Duration) {
        let mut state = self.shared.lock();
        if state.shutdown {
            debug!(job_id = %task.job_id, city = %task.city, "Delay queue stopped, dropping retry");
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.parked.push(Parked {
            due: Instant::now() + delay,
            seq,
            task,
        });
        drop(state);
        self.shared.wakeup.notify_one();
    }

    /// Number of tasks currently parked.
    pub fn len(&self) -> usize {
        self.shared.lock().parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the scheduler and returns whatever was still parked.
    pub fn shutdown(&self) -> Vec<Task> {
        let remaining = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            std::mem::take(&mut state.parked)
                .into_sorted_vec()
                .into_iter()
                .rev()
                .map(|p| p.task)
                .collect()
        };
        self.shared.wakeup.notify_all();

        let handle = self
            .scheduler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Delay queue scheduler panicked");
            }
        }
        remaining
    }
}

impl Drop for DelayQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_scheduler(shared: Arc<Shared>, target: Arc<dyn TaskQueue>) {
    debug!("Delay queue scheduler started");
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            break;
        }
        let now = Instant::now();
        let next_due = state.parked.peek().map(|p| p.due);
        match next_due {
            Some(due) if due <= now => {
                let Some(parked) = state.parked.pop() else {
                    continue;
                };
                drop(state);
                forward(target.as_ref(), parked.task);
                state = shared.lock();
            }
            Some(due) => {
                state = shared
                    .wakeup
                    .wait_timeout(state, due - now)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|p| p.into_inner().0);
            }
            None => {
                state = shared
                    .wakeup
                    .wait(state)
                    .unwrap_or_else(|p| p.into_inner());
            }
        }
    }
    debug!("Delay queue scheduler stopped");
}

fn forward(target: &dyn TaskQueue, task: Task) {
    let (job_id, city) = (task.job_id.clone(), task.city.clone());
    match target.enqueue(task) {
        Ok(()) => debug!(%job_id, %city, "Retry re-enqueued"),
        Err(DispatchError::Closed) => {
            debug!(%job_id, %city, "Task queue closed, retry left pending")
        }
        Err(e) => warn!(%job_id, %city, error = %e, "Failed to re-enqueue retry"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ChannelQueue;

    fn setup() -> (Arc<ChannelQueue>, DelayQueue) {
        let queue = Arc::new(ChannelQueue::new(16));
        let delay = DelayQueue::start(queue.clone()).unwrap();
        (queue, delay)
    }

    #[test]
    fn test_task_released_after_delay() {
        let (queue, delay) = setup();
        let started = Instant::now();
        delay.schedule(Task::new("job", "oslo"), Duration::from_millis(30));
        assert_eq!(delay.len(), 1);

        let task = queue.consume(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(task.city, "oslo");
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(delay.is_empty());
    }

    #[test]
    fn test_earliest_due_released_first() {
        let (queue, delay) = setup();
        delay.schedule(Task::new("job", "late"), Duration::from_millis(80));
        delay.schedule(Task::new("job", "early"), Duration::from_millis(10));

        let first = queue.consume(Duration::from_secs(2)).unwrap().unwrap();
        let second = queue.consume(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(first.city, "early");
        assert_eq!(second.city, "late");
    }

    #[test]
    fn test_shutdown_returns_parked_tasks() {
        let (queue, delay) = setup();
        delay.schedule(Task::new("job", "b"), Duration::from_secs(60));
        delay.schedule(Task::new("job", "a"), Duration::from_secs(30));

        let remaining = delay.shutdown();
        let cities: Vec<_> = remaining.iter().map(|t| t.city.as_str()).collect();
        assert_eq!(cities, vec!["a", "b"]);
        assert!(queue.is_empty());

        // Scheduling after shutdown is a no-op.
        delay.schedule(Task::new("job", "c"), Duration::ZERO);
        assert!(delay.is_empty());
    }
}
