//! Process-global registry of live jobs.
//!
//! The registry is a concurrent map from job ID to job instance, guarded by
//! a reader-writer lock: creation and deletion take the write lock, lookups
//! take the read lock. Jobs removed from the registry keep running until
//! explicitly torn down by their owner (the DELETE handler does both).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::job::Job;
use crate::types::JobId;

/// Concurrent mapping from job identifier to job instance.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<Job>>>,
}

impl JobRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        JobRegistry {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a job under its own ID.
    pub async fn insert(&self, job: Arc<Job>) {
        self.jobs.write().await.insert(job.id(), job);
    }

    /// Looks a job up by ID.
    pub async fn get(&self, id: JobId) -> Option<Arc<Job>> {
        self.jobs.read().await.get(&id).cloned()
    }

    /// Removes a job, returning it so the caller can tear it down.
    pub async fn remove(&self, id: JobId) -> Option<Arc<Job>> {
        self.jobs.write().await.remove(&id)
    }

    /// Number of registered jobs.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Returns true when no jobs are registered.
    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}
