pub mod executor;
pub mod pool;

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

pub use executor::{ExecutionOutcome, TaskExecutor};
pub use pool::WorkerPool;

/// In-memory view of jobs with a pending cancellation, checked by workers
/// before every task. The persisted flag is the source of truth on restart.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    jobs: Arc<RwLock<HashSet<String>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, job_id: &str) {
        let mut jobs = self.jobs.write().unwrap_or_else(|p| p.into_inner());
        jobs.insert(job_id.to_string());
    }

    pub fn is_cancelled(&self, job_id: &str) -> bool {
        let jobs = self.jobs.read().unwrap_or_else(|p| p.into_inner());
        jobs.contains(job_id)
    }

    /// Drops a job once it has finished.
    pub fn forget(&self, job_id: &str) {
        let mut jobs = self.jobs.write().unwrap_or_else(|p| p.into_inner());
        jobs.remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_registry() {
        let registry = CancelRegistry::new();
        assert!(!registry.is_cancelled("job-1"));
        registry.cancel("job-1");

        let shared = registry.clone();
        assert!(shared.is_cancelled("job-1"));

        registry.forget("job-1");
        assert!(!shared.is_cancelled("job-1"));
    }
}
