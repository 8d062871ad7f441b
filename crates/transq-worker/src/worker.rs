//! Worker main loop.
//!
//! One message at a time: receive, decode, lock, transcode under a
//! heartbeat, release, acknowledge. Only a COMPLETED job's message is
//! deleted; a FAILED one is left to the queue's redelivery and dead-letter
//! policy. Failures inside one message's handling end up in the job record
//! or in a redelivery and never stop the loop.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use transq_models::{
    AuditAction, AuditEvent, DecodeError, JobId, JobStatus, NotifyMessage, TranscodeMessage,
    WorkMessage,
};
use transq_queue::ReceivedMessage;
use transq_registry::{LockManager, RegistryError, RegistryResult};

use crate::audit::emit;
use crate::config::WorkerConfig;
use crate::context::Services;
use crate::heartbeat::{Heartbeat, HeartbeatTarget};
use crate::logging::JobLogger;
use crate::metrics;
use crate::retry::{retry_async, retry_async_if, RetryConfig, RetryResult};
use crate::shutdown::{sleep_or_shutdown, wait_for_shutdown};

/// Why a message was deleted without being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Body is not a decodable message
    Malformed,
    /// Well-formed message of a type this worker does not handle
    UnknownType,
    /// Message names a job the registry has never seen
    UnknownJob,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::UnknownType => "unknown_type",
            DropReason::UnknownJob => "unknown_job",
        }
    }
}

/// How the handling of one message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Deleted without touching the job
    Dropped(DropReason),
    /// Lock held elsewhere or job already COMPLETED; message left in the queue
    Contended,
    /// Registry unavailable while locking; message left in the queue
    Deferred,
    /// Job released as COMPLETED and message deleted
    Completed,
    /// Job released as FAILED; message left for redelivery or dead-lettering
    Failed,
    /// Task finished but the release did not go through; message left in the queue
    Unacknowledged,
}

/// A single-threaded consumer of the work queue.
pub struct Worker {
    config: WorkerConfig,
    services: Services,
    locks: LockManager,
}

impl Worker {
    pub fn new(config: WorkerConfig, services: Services) -> Self {
        let locks = services.lock_manager();
        Self {
            config,
            services,
            locks,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until `shutdown` turns true.
    ///
    /// Shutdown interrupts the long-poll and backoff sleeps but never a job
    /// in progress; the current message is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.config.worker_id, "Worker started");

        loop {
            let received = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                received = self.services.queue.receive(self.config.receive_wait) => received,
            };

            let pause = match received {
                Ok(Some(message)) => {
                    self.handle_message(message).await;
                    continue;
                }
                Ok(None) => self.config.idle_backoff,
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = %e, "Failed to receive message");
                    self.config.error_backoff
                }
            };

            if sleep_or_shutdown(pause, &mut shutdown).await {
                break;
            }
        }

        info!(worker_id = %self.config.worker_id, "Worker stopped");
    }

    /// Receive and handle at most one message. `None` if the queue stayed
    /// empty for the configured wait.
    pub async fn poll_once(&self) -> transq_queue::QueueResult<Option<MessageOutcome>> {
        match self.services.queue.receive(self.config.receive_wait).await? {
            Some(message) => Ok(Some(self.handle_message(message).await)),
            None => Ok(None),
        }
    }

    /// Handle one received message.
    pub async fn handle_message(&self, message: ReceivedMessage) -> MessageOutcome {
        let work = match WorkMessage::decode(&message.body) {
            Ok(work) => work,
            Err(DecodeError::Malformed(reason)) => {
                warn!(message_id = %message.message_id, reason = %reason, "Dropping malformed message");
                return self.drop_message(&message, DropReason::Malformed).await;
            }
            Err(DecodeError::UnknownType(kind)) => {
                warn!(message_id = %message.message_id, kind = %kind, "Dropping message of unknown type");
                return self.drop_message(&message, DropReason::UnknownType).await;
            }
        };

        debug!(
            message_id = %message.message_id,
            message_type = work.message_type(),
            job_id = %work.job_id(),
            receive_count = message.receive_count,
            "Received work message"
        );

        match work {
            WorkMessage::Transcode(task) => self.process(&message, task).await,
        }
    }

    async fn drop_message(&self, message: &ReceivedMessage, reason: DropReason) -> MessageOutcome {
        metrics::record_message_dropped(reason.as_str());
        if let Err(e) = self.services.queue.delete(&message.receipt).await {
            warn!(message_id = %message.message_id, error = %e, "Failed to delete dropped message");
        }
        MessageOutcome::Dropped(reason)
    }

    async fn process(&self, message: &ReceivedMessage, task: TranscodeMessage) -> MessageOutcome {
        let worker_id = self.config.worker_id.as_str();

        match self
            .locks
            .try_acquire(&task.job_id, worker_id, self.config.lease)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    job_id = %task.job_id,
                    worker_id,
                    receive_count = message.receive_count,
                    "Job is locked elsewhere or finished, leaving message for redelivery"
                );
                metrics::record_lock_contention();
                return MessageOutcome::Contended;
            }
            Err(RegistryError::JobNotFound(_)) => {
                warn!(job_id = %task.job_id, "Message references an unknown job");
                return self.drop_message(message, DropReason::UnknownJob).await;
            }
            Err(e) => {
                warn!(
                    job_id = %task.job_id,
                    worker_id,
                    error = %e,
                    "Could not lock job, leaving message for redelivery"
                );
                return MessageOutcome::Deferred;
            }
        }

        let logger = JobLogger::new(&task.job_id, worker_id);
        let span = logger.create_span();
        self.run_locked(message, task, logger).instrument(span).await
    }

    /// Everything between winning the lock and acknowledging the message.
    async fn run_locked(
        &self,
        message: &ReceivedMessage,
        task: TranscodeMessage,
        logger: JobLogger,
    ) -> MessageOutcome {
        let worker_id = self.config.worker_id.as_str();
        logger.log_start(&format!("{} -> {}", task.input_ref, task.output_ref));
        self.audit(
            &task.job_id,
            AuditAction::JobProcessing,
            json!({
                "workerId": worker_id,
                "inputRef": task.input_ref,
                "outputRef": task.output_ref,
                "receiveCount": message.receive_count,
            }),
        )
        .await;

        let heartbeat = Heartbeat::start(
            HeartbeatTarget {
                queue: self.services.queue.clone(),
                locks: self.locks.clone(),
                job_id: task.job_id.clone(),
                worker_id: worker_id.to_string(),
                receipt: message.receipt.clone(),
            },
            self.config.heartbeat_interval,
            self.config.lease,
        );

        let started = Instant::now();
        let result = self.execute(&task).await;
        let elapsed = started.elapsed().as_secs_f64();

        let beats = heartbeat.stop().await;
        debug!(
            job_id = %task.job_id,
            beats = beats.beats,
            lock_failures = beats.lock_failures,
            visibility_failures = beats.visibility_failures,
            "Heartbeat stopped"
        );

        let (status, error_message) = match result {
            Ok(()) => (JobStatus::Completed, None),
            Err(reason) => (JobStatus::Failed, Some(reason)),
        };

        if let Err(e) = self.release(&task.job_id, status, error_message.clone()).await {
            logger.log_error(&format!(
                "release as {status} failed, leaving message for redelivery: {e}"
            ));
            return MessageOutcome::Unacknowledged;
        }

        match error_message {
            None => {
                logger.log_completion(&format!("{} in {:.1}s", task.output_ref, elapsed));
                metrics::record_job_completed(elapsed);
                self.audit(
                    &task.job_id,
                    AuditAction::JobCompleted,
                    json!({ "outputRef": task.output_ref, "durationSecs": elapsed }),
                )
                .await;
                self.notify(&task).await;

                if let Err(e) = self.services.queue.delete(&message.receipt).await {
                    logger.log_warning(&format!(
                        "failed to delete message {}: {e}",
                        message.message_id
                    ));
                }
                MessageOutcome::Completed
            }
            Some(reason) => {
                logger.log_error(&format!(
                    "failed after {elapsed:.1}s on delivery {}, leaving message for redelivery: {reason}",
                    message.receive_count
                ));
                metrics::record_job_failed(elapsed);
                self.audit(
                    &task.job_id,
                    AuditAction::JobFailed,
                    json!({ "error": reason, "receiveCount": message.receive_count }),
                )
                .await;
                MessageOutcome::Failed
            }
        }
    }

    /// Run the transcode and check its output. `Err` carries the message
    /// stored on the FAILED job.
    async fn execute(&self, task: &TranscodeMessage) -> Result<(), String> {
        let timeout = self.config.transcode_timeout;
        let run = AssertUnwindSafe(self.services.transcoder.run(
            &task.input_ref,
            &task.output_ref,
            &task.params,
        ))
        .catch_unwind();

        match tokio::time::timeout(timeout, run).await {
            Err(_) => return Err(format!("transcode timed out after {}s", timeout.as_secs())),
            Ok(Err(_)) => return Err("transcode task panicked".to_string()),
            Ok(Ok(Err(e))) => return Err(e.summary()),
            Ok(Ok(Ok(()))) => {}
        }

        match self.services.storage.exists(&task.output_ref).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(format!("output missing after transcode: {}", task.output_ref)),
            Err(e) => Err(format!("output check failed: {e}")),
        }
    }

    async fn release(
        &self,
        job_id: &JobId,
        status: JobStatus,
        error_message: Option<String>,
    ) -> RegistryResult<()> {
        retry_async_if(
            &RetryConfig::new("release_job_lock"),
            || self.locks.release(job_id, status, error_message.clone()),
            RegistryError::is_retryable,
        )
        .await
        .into_result()
    }

    async fn notify(&self, task: &TranscodeMessage) {
        let Some(queue) = &self.services.notify_queue else {
            return;
        };
        let message = NotifyMessage::new(task.job_id.clone(), &task.owner_id, &task.output_ref);
        let body = match serde_json::to_string(&message) {
            Ok(body) => body,
            Err(e) => {
                warn!(job_id = %task.job_id, error = %e, "Failed to encode notification");
                return;
            }
        };

        let config = RetryConfig::new("send_notification")
            .with_max_retries(2)
            .with_base_delay(Duration::from_millis(200));
        if let RetryResult::Failed { error, attempts } =
            retry_async(&config, || queue.send(&body)).await
        {
            warn!(job_id = %task.job_id, attempts, error = %error, "Failed to publish notification");
        }
    }

    async fn audit(&self, job_id: &JobId, action: AuditAction, detail: serde_json::Value) {
        let event = AuditEvent::new(
            self.config.worker_id.clone(),
            job_id.clone(),
            action,
            detail,
            self.services.clock.now(),
        );
        emit(self.services.audit.as_ref(), event).await;
    }
}
