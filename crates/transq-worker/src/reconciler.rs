//! Stale lock reconciler.
//!
//! A PROCESSING job whose lease ran out belongs to a worker that crashed or
//! hung. The sweep settles it from what is in object storage: an existing
//! output means the work got done, a missing one means it did not.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use transq_models::{AuditAction, AuditEvent, Clock, Job, JobStatus};
use transq_registry::{JobRegistry, LockManager};
use transq_storage::ObjectStorage;

use crate::audit::{emit, AuditSink};
use crate::context::Services;
use crate::error::WorkerResult;
use crate::metrics;
use crate::shutdown::{sleep_or_shutdown, wait_for_shutdown};

/// Error recorded on a job failed by the reconciler.
pub const STALE_LOCK_MESSAGE: &str = "stale lock, no output";

/// Actor of reconciler audit events.
pub const RECONCILER_ACTOR: &str = "reconciler";

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    /// PROCESSING jobs found with an expired lease
    pub expired: usize,
    pub completed: usize,
    pub failed: usize,
    /// Expired jobs left alone: storage unreachable, or the holder came back
    pub skipped: usize,
}

/// Resolves jobs stuck in PROCESSING.
#[derive(Clone)]
pub struct Reconciler {
    registry: Arc<dyn JobRegistry>,
    storage: Arc<dyn ObjectStorage>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    locks: LockManager,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        storage: Arc<dyn ObjectStorage>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = LockManager::new(registry.clone(), clock.clone());
        Self {
            registry,
            storage,
            audit,
            clock,
            locks,
        }
    }

    pub fn from_services(services: &Services) -> Self {
        Self::new(
            services.registry.clone(),
            services.storage.clone(),
            services.audit.clone(),
            services.clock.clone(),
        )
    }

    /// Sweep once now, then every `interval` until shutdown. A zero
    /// interval sweeps once and returns.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Reconciler started");

        loop {
            let sweep = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                sweep = self.sweep() => sweep,
            };
            if let Err(e) = sweep {
                error!(error = %e, "Reconciler sweep failed");
            }

            if interval.is_zero() || sleep_or_shutdown(interval, &mut shutdown).await {
                break;
            }
        }

        info!("Reconciler stopped");
    }

    /// Resolve every PROCESSING job whose lease has expired.
    ///
    /// Fails only if the registry cannot be scanned; problems with single
    /// jobs are logged and counted as skipped.
    pub async fn sweep(&self) -> WorkerResult<SweepReport> {
        let jobs = self.registry.scan().await?;
        let now = self.clock.epoch_secs();
        let mut report = SweepReport {
            scanned: jobs.len(),
            ..Default::default()
        };

        for job in jobs.iter().filter(|job| job.is_lock_expired(now)) {
            report.expired += 1;
            match self.resolve(job).await {
                Some(JobStatus::Completed) => report.completed += 1,
                Some(_) => report.failed += 1,
                None => report.skipped += 1,
            }
        }

        if report.expired > 0 {
            info!(
                scanned = report.scanned,
                expired = report.expired,
                completed = report.completed,
                failed = report.failed,
                skipped = report.skipped,
                "Reconciler sweep finished"
            );
        } else {
            debug!(scanned = report.scanned, "Reconciler found no stale locks");
        }
        Ok(report)
    }

    /// Settle one stale job. `None` if it was left alone.
    async fn resolve(&self, job: &Job) -> Option<JobStatus> {
        let output_exists = match self.storage.exists(&job.output_ref).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Cannot check output of stale job, skipping");
                return None;
            }
        };

        let (status, error_message) = if output_exists {
            (JobStatus::Completed, None)
        } else {
            (JobStatus::Failed, Some(STALE_LOCK_MESSAGE.to_string()))
        };

        // Conditioned on the lease still being expired, so a holder that
        // extended in the meantime keeps its job.
        match self
            .locks
            .release_if_expired(&job.job_id, status, error_message.clone())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(job_id = %job.job_id, "Stale job changed during the sweep, leaving it");
                return None;
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Failed to release stale job");
                return None;
            }
        }

        warn!(
            job_id = %job.job_id,
            locked_by = job.locked_by.as_deref().unwrap_or_default(),
            lock_expires_at = job.lock_expires_at.unwrap_or_default(),
            status = %status,
            "Resolved stale job lock"
        );
        metrics::record_reconciler_resolution(status.as_str());

        let (action, detail) = match error_message {
            None => (
                AuditAction::JobCompleted,
                json!({ "outputRef": job.output_ref, "lockedBy": job.locked_by }),
            ),
            Some(error) => (
                AuditAction::JobFailed,
                json!({ "error": error, "lockedBy": job.locked_by }),
            ),
        };
        emit(
            self.audit.as_ref(),
            AuditEvent::new(RECONCILER_ACTOR, job.job_id.clone(), action, detail, self.clock.now()),
        )
        .await;

        Some(status)
    }
}
