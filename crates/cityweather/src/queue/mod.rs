//! Task dispatch.
//!
//! The coordinator and workers only depend on [`TaskQueue`]. The shipped
//! implementation is an in-process bounded channel; retrying tasks are
//! parked in a [`DelayQueue`] and fed back when due.

pub mod delay;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};

use crate::error::DispatchError;

pub use delay::DelayQueue;

/// How often a blocked producer rechecks whether the queue was closed.
const CLOSE_POLL: Duration = Duration::from_millis(100);

/// One city refresh for one job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Task {
    pub job_id: String,
    pub city: String,
}

impl Task {
    pub fn new(job_id: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            city: city.into(),
        }
    }
}

pub trait TaskQueue: Send + Sync {
    /// Blocks while the queue is full.
    fn enqueue(&self, task: Task) -> Result<(), DispatchError>;

    /// Fails with [`DispatchError::Full`] instead of blocking.
    fn try_enqueue(&self, task: Task) -> Result<(), DispatchError>;

    /// Waits up to `timeout` for a task. `Ok(None)` on timeout,
    /// `Err(Closed)` once the queue is closed and drained.
    fn consume(&self, timeout: Duration) -> Result<Option<Task>, DispatchError>;

    /// Stops accepting new tasks. Already queued tasks can still be consumed.
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// FIFO queue over a bounded crossbeam channel.
pub struct ChannelQueue {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    closed: AtomicBool,
}

impl ChannelQueue {
    /// # Panics
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be > 0");
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity().unwrap_or(0)
    }
}

impl TaskQueue for ChannelQueue {
    fn enqueue(&self, mut task: Task) -> Result<(), DispatchError> {
        loop {
            if self.is_closed() {
                return Err(DispatchError::Closed);
            }
            match self.sender.send_timeout(task, CLOSE_POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(t)) => task = t,
                Err(SendTimeoutError::Disconnected(_)) => return Err(DispatchError::Closed),
            }
        }
    }

    fn try_enqueue(&self, task: Task) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        self.sender.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => DispatchError::Full,
            TrySendError::Disconnected(_) => DispatchError::Closed,
        })
    }

    fn consume(&self, timeout: Duration) -> Result<Option<Task>, DispatchError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(task) => Ok(Some(task)),
            Err(RecvTimeoutError::Timeout) if self.is_closed() && self.receiver.is_empty() => {
                Err(DispatchError::Closed)
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DispatchError::Closed),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn len(&self) -> usize {
        self.receiver.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let queue = ChannelQueue::new(4);
        for city in ["a", "b", "c"] {
            queue.enqueue(Task::new("job", city)).unwrap();
        }
        assert_eq!(queue.len(), 3);
        let order: Vec<String> = (0..3)
            .map(|_| queue.consume(Duration::from_millis(10)).unwrap().unwrap().city)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_try_enqueue_reports_full() {
        let queue = ChannelQueue::new(1);
        queue.try_enqueue(Task::new("job", "a")).unwrap();
        assert_eq!(
            queue.try_enqueue(Task::new("job", "b")),
            Err(DispatchError::Full)
        );
    }

    #[test]
    fn test_consume_times_out_when_empty() {
        let queue = ChannelQueue::new(1);
        let started = Instant::now();
        assert_eq!(queue.consume(Duration::from_millis(20)), Ok(None));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_close_rejects_producers_but_drains() {
        let queue = ChannelQueue::new(2);
        queue.enqueue(Task::new("job", "a")).unwrap();
        queue.close();

        assert_eq!(
            queue.enqueue(Task::new("job", "b")),
            Err(DispatchError::Closed)
        );
        assert_eq!(
            queue.try_enqueue(Task::new("job", "b")),
            Err(DispatchError::Closed)
        );
        assert_eq!(
            queue.consume(Duration::from_millis(10)).unwrap(),
            Some(Task::new("job", "a"))
        );
        assert_eq!(
            queue.consume(Duration::from_millis(10)),
            Err(DispatchError::Closed)
        );
    }

    #[test]
    fn test_blocked_producer_released_by_close() {
        let queue = Arc::new(ChannelQueue::new(1));
        queue.enqueue(Task::new("job", "a")).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.enqueue(Task::new("job", "b")))
        };
        std::thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(producer.join().unwrap(), Err(DispatchError::Closed));
    }

    #[test]
    fn test_blocked_producer_proceeds_when_space_frees() {
        let queue = Arc::new(ChannelQueue::new(1));
        queue.enqueue(Task::new("job", "a")).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.enqueue(Task::new("job", "b")))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.consume(Duration::from_millis(10)).unwrap();
        assert_eq!(producer.join().unwrap(), Ok(()));
        assert_eq!(queue.len(), 1);
    }
}
