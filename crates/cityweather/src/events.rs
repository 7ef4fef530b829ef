//! Job progress broadcaster for in-process subscribers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What happened to a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    Created,
    /// Ingestion finished; `total` is now fixed.
    Running { total: u64 },
    TaskFinished {
        city: String,
        succeeded: bool,
        processed: u64,
        total: u64,
    },
    Done,
    Failed { error: String },
    CancelRequested,
}

impl JobEventKind {
    /// No further events follow a terminal one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEventKind::Done | JobEventKind::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    #[serde(flatten)]
    pub kind: JobEventKind,
    pub timestamp: DateTime<Utc>,
}

impl JobProgressEvent {
    pub fn new(job_id: &str, kind: JobEventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind,
            timestamp,
        }
    }
}

/// Broadcasts job progress events. Cheap to clone.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: JobProgressEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn emit(&self, job_id: &str, kind: JobEventKind, at: DateTime<Utc>) {
        self.send(JobProgressEvent::new(job_id, kind, at));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}
