//! In-process job registry.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use transq_models::{Job, JobId};

use crate::error::{RegistryError, RegistryResult};
use crate::registry::{Condition, JobRegistry, JobUpdate};

/// In-memory [`JobRegistry`]. The mutex makes each conditional write atomic.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    jobs: Mutex<BTreeMap<JobId, Job>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobRegistry for MemoryRegistry {
    async fn create(&self, job: &Job) -> RegistryResult<()> {
        let mut jobs = self.lock();
        if jobs.contains_key(&job.job_id) {
            return Err(RegistryError::duplicate_job(job.job_id.as_str()));
        }
        jobs.insert(job.job_id.clone(), job.clone());
        debug!(job_id = %job.job_id, "Created job record");
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> RegistryResult<Option<Job>> {
        Ok(self.lock().get(job_id).cloned())
    }

    async fn scan(&self) -> RegistryResult<Vec<Job>> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn list_for_owner(&self, owner_id: &str) -> RegistryResult<Vec<Job>> {
        Ok(self
            .lock()
            .values()
            .filter(|job| job.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn update_if(
        &self,
        job_id: &JobId,
        condition: &Condition,
        update: &JobUpdate,
    ) -> RegistryResult<bool> {
        update.check_against(condition)?;

        let mut jobs = self.lock();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| RegistryError::job_not_found(job_id.as_str()))?;

        if !condition.matches(job) {
            return Ok(false);
        }

        // Apply to a copy so a rejected transition leaves the record intact.
        let mut updated = job.clone();
        update.apply(&mut updated)?;
        *job = updated;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use transq_models::JobStatus;

    fn job(id: &str, owner: &str) -> Job {
        Job::new(
            JobId::from(id),
            owner,
            format!("raw/{id}.mov"),
            format!("out/{id}.mp4"),
            json!({}),
            Utc::now(),
        )
    }

    fn lock_update(worker: &str) -> JobUpdate {
        JobUpdate::Lock {
            worker_id: worker.into(),
            lock_expires_at: 1_000,
        }
    }

    #[tokio::test]
    async fn test_create_is_create_if_absent() {
        let registry = MemoryRegistry::new();
        registry.create(&job("v1", "a")).await.unwrap();

        let mut other = job("v1", "b");
        other.input_ref = "raw/other.mov".into();
        assert!(matches!(
            registry.create(&other).await,
            Err(RegistryError::DuplicateJob(_))
        ));

        let stored = registry.get(&JobId::from("v1")).await.unwrap().unwrap();
        assert_eq!(stored.owner_id, "a");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_update_if_condition_failure_is_not_an_error() {
        let registry = MemoryRegistry::new();
        registry.create(&job("v1", "a")).await.unwrap();
        let lockable = Condition::status_in(JobStatus::lockable());

        assert!(registry
            .update_if(&JobId::from("v1"), &lockable, &lock_update("w1"))
            .await
            .unwrap());
        assert!(!registry
            .update_if(&JobId::from("v1"), &lockable, &lock_update("w2"))
            .await
            .unwrap());

        let stored = registry.get(&JobId::from("v1")).await.unwrap().unwrap();
        assert_eq!(stored.locked_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_update_if_missing_job() {
        let registry = MemoryRegistry::new();
        let result = registry
            .update_if(
                &JobId::from("nope"),
                &Condition::status_in(JobStatus::lockable()),
                &lock_update("w1"),
            )
            .await;
        assert!(matches!(result, Err(RegistryError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_list_for_owner() {
        let registry = MemoryRegistry::new();
        registry.create(&job("v1", "a")).await.unwrap();
        registry.create(&job("v2", "b")).await.unwrap();
        registry.create(&job("v3", "a")).await.unwrap();

        let ids: Vec<_> = registry
            .list_for_owner("a")
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        assert_eq!(ids, vec![JobId::from("v1"), JobId::from("v3")]);
        assert_eq!(registry.scan().await.unwrap().len(), 3);
    }
}
