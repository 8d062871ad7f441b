//! Per-job mutual exclusion on top of registry conditional writes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use transq_models::{Clock, JobId, JobStatus};

use crate::error::{RegistryError, RegistryResult};
use crate::registry::{Condition, JobRegistry, JobUpdate};

/// Lock manager.
///
/// A lock is the PROCESSING status plus `lockedBy` / `lockExpiresAt` on the
/// job record. At most one worker can win [`LockManager::try_acquire`] for a
/// job because the registry applies the write only if the job is still
/// QUEUED or FAILED.
#[derive(Clone)]
pub struct LockManager {
    registry: Arc<dyn JobRegistry>,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(registry: Arc<dyn JobRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { registry, clock }
    }

    fn expiry(&self, lease: Duration) -> i64 {
        self.clock.epoch_secs() + lease.as_secs() as i64
    }

    /// Take the lock for `lease`.
    ///
    /// `Ok(false)` means another worker holds it or the job is COMPLETED.
    pub async fn try_acquire(
        &self,
        job_id: &JobId,
        worker_id: &str,
        lease: Duration,
    ) -> RegistryResult<bool> {
        let lock_expires_at = self.expiry(lease);
        let acquired = self
            .registry
            .update_if(
                job_id,
                &Condition::status_in(JobStatus::lockable()),
                &JobUpdate::Lock {
                    worker_id: worker_id.to_string(),
                    lock_expires_at,
                },
            )
            .await?;

        if acquired {
            debug!(job_id = %job_id, worker_id, lock_expires_at, "Acquired job lock");
        } else {
            debug!(job_id = %job_id, worker_id, "Job lock not available");
        }
        Ok(acquired)
    }

    /// Refresh the lease to `now + lease`. Never shortens it.
    ///
    /// Best-effort: failures are logged and reported as `false`.
    pub async fn extend(&self, job_id: &JobId, worker_id: &str, lease: Duration) -> bool {
        let lock_expires_at = self.expiry(lease);
        let result = self
            .registry
            .update_if(
                job_id,
                &Condition::status_in([JobStatus::Processing]).locked_by(worker_id),
                &JobUpdate::ExtendLease { lock_expires_at },
            )
            .await;

        match result {
            Ok(true) => {
                debug!(job_id = %job_id, worker_id, lock_expires_at, "Extended job lock");
                true
            }
            Ok(false) => {
                warn!(job_id = %job_id, worker_id, "Job lock no longer held, not extended");
                false
            }
            Err(e) => {
                warn!(job_id = %job_id, worker_id, error = %e, "Failed to extend job lock");
                false
            }
        }
    }

    /// Move a PROCESSING job to its terminal status and clear the lock.
    ///
    /// Not an ownership check: whoever finishes the job releases it. Fails
    /// with `NotLocked` if the job already left PROCESSING.
    pub async fn release(
        &self,
        job_id: &JobId,
        status: JobStatus,
        error_message: Option<String>,
    ) -> RegistryResult<()> {
        let update = self.release_update(status, error_message);
        let applied = self
            .registry
            .update_if(job_id, &Condition::status_in([JobStatus::Processing]), &update)
            .await?;

        if !applied {
            return Err(RegistryError::not_locked(job_id.as_str()));
        }
        info!(job_id = %job_id, status = %status, "Released job lock");
        Ok(())
    }

    /// Like [`release`](Self::release), but only while the lease is still
    /// expired at write time. `Ok(false)` if the holder extended it or the
    /// job already left PROCESSING.
    pub async fn release_if_expired(
        &self,
        job_id: &JobId,
        status: JobStatus,
        error_message: Option<String>,
    ) -> RegistryResult<bool> {
        let condition = Condition::status_in([JobStatus::Processing])
            .lock_expired_before(self.clock.epoch_secs());
        let update = self.release_update(status, error_message);
        self.registry.update_if(job_id, &condition, &update).await
    }

    fn release_update(&self, status: JobStatus, error_message: Option<String>) -> JobUpdate {
        JobUpdate::Release {
            status,
            completed_at: self.clock.now(),
            error_message,
        }
    }
}
