//! Job registry abstraction.
//!
//! The registry is the single source of truth for job state. Every status
//! change goes through [`JobRegistry::update_if`], a compare-and-set on the
//! stored record: the update is applied only if the record still satisfies
//! the [`Condition`] at write time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use transq_models::{Job, JobId, JobStatus, TransitionError};

use crate::error::{RegistryError, RegistryResult};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Redis URL
    pub redis_url: String,
    /// Key prefix for job records and indexes
    pub key_prefix: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "transq".to_string(),
        }
    }
}

impl RegistryConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: std::env::var("REGISTRY_PREFIX").unwrap_or(defaults.key_prefix),
        }
    }
}

/// Precondition of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    /// Current status must be one of these
    pub status_in: Vec<JobStatus>,
    /// If set, `lockExpiresAt` must be strictly before this epoch second
    pub lock_expired_before: Option<i64>,
    /// If set, `lockedBy` must equal this worker
    pub locked_by: Option<String>,
}

impl Condition {
    pub fn status_in(statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        Self {
            status_in: statuses.into_iter().collect(),
            lock_expired_before: None,
            locked_by: None,
        }
    }

    pub fn lock_expired_before(mut self, epoch_secs: i64) -> Self {
        self.lock_expired_before = Some(epoch_secs);
        self
    }

    pub fn locked_by(mut self, worker_id: impl Into<String>) -> Self {
        self.locked_by = Some(worker_id.into());
        self
    }

    /// Evaluate against a record.
    pub fn matches(&self, job: &Job) -> bool {
        if !self.status_in.contains(&job.status) {
            return false;
        }
        if let Some(before) = self.lock_expired_before {
            match job.lock_expires_at {
                Some(expires) if expires < before => {}
                _ => return false,
            }
        }
        if let Some(worker) = &self.locked_by {
            if job.locked_by.as_deref() != Some(worker.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Change applied by a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    /// Enter PROCESSING under a lease
    Lock {
        worker_id: String,
        lock_expires_at: i64,
    },
    /// Push the lease forward; never moves it back
    ExtendLease { lock_expires_at: i64 },
    /// Leave PROCESSING for a terminal status, clearing the lease
    Release {
        status: JobStatus,
        completed_at: DateTime<Utc>,
        error_message: Option<String>,
    },
}

impl JobUpdate {
    /// Status the record ends up in, if the update changes it.
    pub fn target_status(&self) -> Option<JobStatus> {
        match self {
            JobUpdate::Lock { .. } => Some(JobStatus::Processing),
            JobUpdate::ExtendLease { .. } => None,
            JobUpdate::Release { status, .. } => Some(*status),
        }
    }

    /// Apply to an in-memory record.
    pub fn apply(&self, job: &mut Job) -> Result<(), TransitionError> {
        match self {
            JobUpdate::Lock {
                worker_id,
                lock_expires_at,
            } => job.lock(worker_id.clone(), *lock_expires_at),
            JobUpdate::ExtendLease { lock_expires_at } => {
                job.extend_lock(*lock_expires_at);
                Ok(())
            }
            JobUpdate::Release {
                status,
                completed_at,
                error_message,
            } => job.release(*status, *completed_at, error_message.clone()),
        }
    }

    /// Reject a condition/update pair that could write an illegal transition.
    ///
    /// Every status the condition admits must be able to reach the target.
    /// Lease extensions are only meaningful on PROCESSING records.
    pub fn check_against(&self, condition: &Condition) -> RegistryResult<()> {
        if condition.status_in.is_empty() {
            return Err(RegistryError::invalid_transition(
                "condition admits no status",
            ));
        }
        for from in &condition.status_in {
            let legal = match self.target_status() {
                Some(to) => from.can_transition_to(to),
                None => from.is_locked(),
            };
            if !legal {
                return Err(RegistryError::invalid_transition(format!(
                    "{from} cannot take {self:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Durable store of job records with atomic conditional writes.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Insert a new record. Fails with `DuplicateJob` if the ID exists.
    async fn create(&self, job: &Job) -> RegistryResult<()>;

    async fn get(&self, job_id: &JobId) -> RegistryResult<Option<Job>>;

    /// All records.
    async fn scan(&self) -> RegistryResult<Vec<Job>>;

    async fn list_for_owner(&self, owner_id: &str) -> RegistryResult<Vec<Job>>;

    /// Apply `update` iff the record satisfies `condition`.
    ///
    /// Returns `Ok(false)` when the condition does not hold and
    /// `JobNotFound` when there is no record.
    async fn update_if(
        &self,
        job_id: &JobId,
        condition: &Condition,
        update: &JobUpdate,
    ) -> RegistryResult<bool>;
}
