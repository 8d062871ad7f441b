//! Job submission.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use transq_models::{AuditAction, AuditEvent, Clock, Job, JobId, JobStatus, TranscodeMessage, WorkMessage};
use transq_queue::WorkQueue;
use transq_registry::{JobRegistry, RegistryError};

use crate::audit::{emit, AuditSink};
use crate::context::Services;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics;

/// What a caller asks to have transcoded.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub owner_id: String,
    pub input_ref: String,
    pub output_ref: String,
    pub params: serde_json::Value,
}

impl SubmitRequest {
    pub fn new(
        owner_id: impl Into<String>,
        input_ref: impl Into<String>,
        output_ref: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            input_ref: input_ref.into(),
            output_ref: output_ref.into(),
            params,
        }
    }

    fn validate(&self) -> WorkerResult<()> {
        for (field, value) in [
            ("ownerId", &self.owner_id),
            ("inputRef", &self.input_ref),
            ("outputRef", &self.output_ref),
        ] {
            if value.trim().is_empty() {
                return Err(WorkerError::invalid_request(format!("{field} must not be empty")));
            }
        }
        if !(self.params.is_object() || self.params.is_null()) {
            return Err(WorkerError::invalid_request("params must be a JSON object"));
        }
        Ok(())
    }
}

/// Creates job records and enqueues the matching work messages.
#[derive(Clone)]
pub struct Producer {
    registry: Arc<dyn JobRegistry>,
    queue: Arc<dyn WorkQueue>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl Producer {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        queue: Arc<dyn WorkQueue>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            queue,
            audit,
            clock,
        }
    }

    pub fn from_services(services: &Services) -> Self {
        Self::new(
            services.registry.clone(),
            services.queue.clone(),
            services.audit.clone(),
            services.clock.clone(),
        )
    }

    /// Submit a job under a freshly generated ID.
    pub async fn submit(&self, request: SubmitRequest) -> WorkerResult<JobId> {
        let job_id = JobId::generate_at(self.clock.now());
        self.submit_with_id(job_id, request).await
    }

    /// Submit a job under a caller-chosen ID.
    ///
    /// The record is written first and the message sent only after that
    /// succeeded. The two writes are not atomic: if the send fails the job
    /// stays QUEUED without a message and [`enqueue_existing`] puts one back.
    /// Submitting the same ID again fails with `DuplicateJob`.
    ///
    /// [`enqueue_existing`]: Self::enqueue_existing
    pub async fn submit_with_id(&self, job_id: JobId, request: SubmitRequest) -> WorkerResult<JobId> {
        request.validate()?;
        if job_id.as_str().is_empty() {
            return Err(WorkerError::invalid_request("jobId must not be empty"));
        }

        let params = if request.params.is_null() {
            json!({})
        } else {
            request.params
        };
        let job = Job::new(
            job_id,
            request.owner_id,
            request.input_ref,
            request.output_ref,
            params,
            self.clock.now(),
        );

        self.registry.create(&job).await?;
        info!(job_id = %job.job_id, owner_id = %job.owner_id, "Created job");

        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                job.owner_id.clone(),
                job.job_id.clone(),
                AuditAction::JobCreated,
                json!({
                    "inputRef": job.input_ref,
                    "outputRef": job.output_ref,
                    "params": job.params,
                }),
                self.clock.now(),
            ),
        )
        .await;

        if let Err(e) = self.send(&job).await {
            warn!(
                job_id = %job.job_id,
                error = %e,
                "Job created but not enqueued; requeue it to dispatch"
            );
            return Err(e);
        }

        metrics::record_job_submitted();
        Ok(job.job_id)
    }

    /// Send the work message for a job that already exists.
    ///
    /// Only QUEUED and FAILED jobs can be picked up by a worker, so any other
    /// status is rejected. Returns the queue message ID.
    pub async fn enqueue_existing(&self, job_id: &JobId) -> WorkerResult<String> {
        let job = self
            .registry
            .get(job_id)
            .await?
            .ok_or_else(|| RegistryError::job_not_found(job_id.as_str()))?;

        if !JobStatus::lockable().contains(&job.status) {
            return Err(WorkerError::invalid_request(format!(
                "job {} is {} and cannot be requeued",
                job.job_id, job.status
            )));
        }

        let message_id = self.send(&job).await?;
        info!(job_id = %job.job_id, message_id = %message_id, status = %job.status, "Requeued job");
        Ok(message_id)
    }

    async fn send(&self, job: &Job) -> WorkerResult<String> {
        let body = WorkMessage::Transcode(TranscodeMessage::for_job(job)).encode()?;
        Ok(self.queue.send(&body).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use std::time::Duration;
    use transq_models::ManualClock;
    use transq_queue::{MemoryQueue, QueueError, QueueResult, QueueDepth, ReceivedMessage};
    use transq_registry::MemoryRegistry;

    struct Fixture {
        producer: Producer,
        registry: Arc<MemoryRegistry>,
        queue: Arc<MemoryQueue>,
        audit: Arc<MemoryAuditSink>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(MemoryRegistry::new());
        let queue = Arc::new(MemoryQueue::default());
        let audit = Arc::new(MemoryAuditSink::new());
        let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
        let producer = Producer::new(registry.clone(), queue.clone(), audit.clone(), clock);
        Fixture {
            producer,
            registry,
            queue,
            audit,
        }
    }

    fn request() -> SubmitRequest {
        SubmitRequest::new("owner-1", "raw/v1.mov", "out/v1.mp4", json!({ "resolution": "720p" }))
    }

    #[tokio::test]
    async fn test_submit_writes_record_then_message() {
        let f = fixture();
        let job_id = f.producer.submit(request()).await.unwrap();
        assert!(job_id.as_str().starts_with("v_1700000000000_"));

        let job = f.registry.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let bodies = f.queue.bodies();
        assert_eq!(bodies.len(), 1);
        let WorkMessage::Transcode(msg) = WorkMessage::decode(&bodies[0]).unwrap();
        assert_eq!(msg.job_id, job_id);
        assert_eq!(msg.params["resolution"], "720p");

        assert_eq!(f.audit.actions_for(&job_id), vec![AuditAction::JobCreated]);
        assert_eq!(f.audit.events()[0].actor, "owner-1");
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected_without_second_message() {
        let f = fixture();
        let id = JobId::from("v1");
        f.producer.submit_with_id(id.clone(), request()).await.unwrap();

        let second = f.producer.submit_with_id(id.clone(), request()).await;
        assert!(matches!(
            second,
            Err(WorkerError::Registry(RegistryError::DuplicateJob(_)))
        ));
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_fields_are_invalid() {
        let f = fixture();
        let result = f
            .producer
            .submit(SubmitRequest::new("owner-1", "", "out/v1.mp4", json!({})))
            .await;
        assert!(matches!(result, Err(WorkerError::InvalidRequest(_))));
        assert!(f.registry.is_empty());
    }

    struct FailingQueue;

    #[async_trait::async_trait]
    impl WorkQueue for FailingQueue {
        async fn send(&self, _body: &str) -> QueueResult<String> {
            Err(QueueError::enqueue_failed("queue down"))
        }
        async fn receive(&self, _wait: Duration) -> QueueResult<Option<ReceivedMessage>> {
            Ok(None)
        }
        async fn delete(&self, _receipt: &str) -> QueueResult<()> {
            Ok(())
        }
        async fn extend_visibility(&self, _receipt: &str, _lease: Duration) -> QueueResult<()> {
            Ok(())
        }
        async fn depth(&self) -> QueueResult<QueueDepth> {
            Ok(QueueDepth::default())
        }
    }

    #[tokio::test]
    async fn test_failed_enqueue_leaves_job_for_requeue() {
        let registry = Arc::new(MemoryRegistry::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
        let broken = Producer::new(registry.clone(), Arc::new(FailingQueue), audit.clone(), clock.clone());

        let id = JobId::from("v1");
        let result = broken.submit_with_id(id.clone(), request()).await;
        assert!(matches!(result, Err(WorkerError::Queue(_))));
        assert_eq!(
            registry.get(&id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );

        let queue = Arc::new(MemoryQueue::default());
        let producer = Producer::new(registry, queue.clone(), audit, clock);
        producer.enqueue_existing(&id).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_requeue_unknown_job() {
        let f = fixture();
        let result = f.producer.enqueue_existing(&JobId::from("nope")).await;
        assert!(matches!(
            result,
            Err(WorkerError::Registry(RegistryError::JobNotFound(_)))
        ));
    }
}
