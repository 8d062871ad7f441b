//! Stale lock resolution.

mod common;

use std::time::Duration;

use common::{Harness, LEASE, START_EPOCH};
use transq_models::{AuditAction, JobStatus};
use transq_registry::JobRegistry;
use transq_worker::reconciler::RECONCILER_ACTOR;
use transq_worker::{shutdown, SweepReport};

#[tokio::test]
async fn test_crashed_worker_without_output_is_failed() {
    let h = Harness::new();
    let job_id = h.submit("v1").await;
    let locks = h.services().lock_manager();
    assert!(locks.try_acquire(&job_id, "worker-a", LEASE).await.unwrap());
    assert_eq!(h.job(&job_id).await.lock_expires_at, Some(START_EPOCH + 900));

    // worker-a dies here; the sweep runs 15 s after the lease ran out
    h.clock.advance_secs(905 + 10);
    let report = h.reconciler().sweep().await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            scanned: 1,
            expired: 1,
            completed: 0,
            failed: 1,
            skipped: 0
        }
    );

    let job = h.job(&job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("stale lock, no output"));
    assert!(job.completed_at.is_some());
    assert_eq!(job.locked_by, None);
    assert_eq!(job.lock_expires_at, None);

    let last = h.audit.events().pop().unwrap();
    assert_eq!(last.actor, RECONCILER_ACTOR);
    assert_eq!(last.action, AuditAction::JobFailed);
}

#[tokio::test]
async fn test_crashed_worker_with_output_is_completed() {
    let h = Harness::new();
    let job_id = h.submit("v1").await;
    let locks = h.services().lock_manager();
    assert!(locks.try_acquire(&job_id, "worker-a", LEASE).await.unwrap());

    // The upload finished before the crash
    h.storage.put("transcoded/owner-1/v1.mp4", b"mp4".to_vec());
    h.clock.advance_secs(1_000);

    let report = h.reconciler().sweep().await.unwrap();
    assert_eq!(report.completed, 1);

    let job = h.job(&job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.error_message, None);
    assert_eq!(
        h.audit.actions_for(&job_id).last(),
        Some(&AuditAction::JobCompleted)
    );
}

#[tokio::test]
async fn test_live_lease_is_left_alone() {
    let h = Harness::new();
    let job_id = h.submit("v1").await;
    let locks = h.services().lock_manager();
    assert!(locks.try_acquire(&job_id, "worker-a", LEASE).await.unwrap());

    // Expiry is strict: at exactly lockExpiresAt the lease still holds
    h.clock.advance_secs(900);
    let report = h.reconciler().sweep().await.unwrap();
    assert_eq!(report.expired, 0);
    assert_eq!(h.job(&job_id).await.status, JobStatus::Processing);
}

#[tokio::test]
async fn test_only_expired_processing_jobs_are_touched() {
    let h = Harness::new();
    let queued = h.submit("queued").await;
    let done = h.submit("done").await;
    let stale = h.submit("stale").await;
    let fresh = h.submit("fresh").await;

    let locks = h.services().lock_manager();
    assert!(locks.try_acquire(&done, "worker-a", LEASE).await.unwrap());
    locks.release(&done, JobStatus::Completed, None).await.unwrap();
    assert!(locks.try_acquire(&stale, "worker-b", LEASE).await.unwrap());

    h.clock.advance_secs(600);
    assert!(locks.try_acquire(&fresh, "worker-c", LEASE).await.unwrap());
    h.clock.advance_secs(600);

    let reconciler = h.reconciler();
    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.scanned, 4);
    assert_eq!(report.expired, 1);
    assert_eq!(report.failed, 1);

    assert_eq!(h.job(&queued).await.status, JobStatus::Queued);
    assert_eq!(h.job(&done).await.status, JobStatus::Completed);
    assert_eq!(h.job(&stale).await.status, JobStatus::Failed);
    assert_eq!(h.job(&fresh).await.status, JobStatus::Processing);

    // Converged: a second sweep finds nothing to do
    assert_eq!(reconciler.sweep().await.unwrap().expired, 0);

    for job in h.registry.scan().await.unwrap() {
        assert_eq!(job.invariant_violation(), None, "job {}", job.job_id);
    }
}

#[tokio::test]
async fn test_failed_stale_job_can_be_retried() {
    let h = Harness::new();
    let job_id = h.submit("v1").await;
    let locks = h.services().lock_manager();
    assert!(locks.try_acquire(&job_id, "worker-a", LEASE).await.unwrap());
    h.clock.advance_secs(1_000);
    h.reconciler().sweep().await.unwrap();

    assert!(locks.try_acquire(&job_id, "worker-b", LEASE).await.unwrap());
    let job = h.job(&job_id).await;
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.error_message, None);
    assert_eq!(job.completed_at, None);
}

#[tokio::test(start_paused = true)]
async fn test_run_sweeps_on_boot_and_on_interval() {
    let h = Harness::new();
    let first = h.submit("v1").await;
    let second = h.submit("v2").await;
    let locks = h.services().lock_manager();
    assert!(locks.try_acquire(&first, "worker-a", LEASE).await.unwrap());
    h.clock.advance_secs(1_000);
    assert!(locks.try_acquire(&second, "worker-b", LEASE).await.unwrap());

    let (tx, rx) = shutdown::channel();
    let reconciler = h.reconciler();
    let handle = tokio::spawn(async move { reconciler.run(Duration::from_secs(300), rx).await });

    // Boot sweep
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.job(&first).await.status, JobStatus::Failed);
    assert_eq!(h.job(&second).await.status, JobStatus::Processing);

    h.clock.advance_secs(1_000);
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.job(&second).await.status, JobStatus::Failed);

    tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_zero_interval_sweeps_once() {
    let h = Harness::new();
    let job_id = h.submit("v1").await;
    let locks = h.services().lock_manager();
    assert!(locks.try_acquire(&job_id, "worker-a", LEASE).await.unwrap());
    h.clock.advance_secs(1_000);

    let (_tx, rx) = shutdown::channel();
    h.reconciler().run(Duration::ZERO, rx).await;
    assert_eq!(h.job(&job_id).await.status, JobStatus::Failed);
}
