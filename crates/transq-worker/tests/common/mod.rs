//! Shared fixtures for the worker integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use transq_media::{MediaError, MediaResult, Transcoder};
use transq_models::{Job, JobId, ManualClock};
use transq_queue::MemoryQueue;
use transq_registry::{
    Condition, JobRegistry, JobUpdate, MemoryRegistry, RegistryError, RegistryResult,
};
use transq_storage::MemoryStorage;
use transq_worker::{
    MemoryAuditSink, Producer, Reconciler, Services, SubmitRequest, Worker, WorkerConfig,
};

pub const START_EPOCH: i64 = 1_700_000_000;
pub const LEASE: Duration = Duration::from_secs(900);

/// What the scripted transcoder does on its next runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    /// Write the output object
    Succeed,
    /// Report failure with this message
    Fail(String),
    /// Report success without writing anything
    NoOutput,
    Panic,
}

/// Transcoder double. Simulated work advances both tokio time and the
/// manual clock in 100 s steps.
pub struct ScriptedTranscoder {
    storage: Arc<MemoryStorage>,
    clock: Arc<ManualClock>,
    behavior: Mutex<Behavior>,
    work_steps: Mutex<u32>,
    calls: AtomicUsize,
}

impl ScriptedTranscoder {
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Number of 100 s steps each run takes.
    pub fn set_work_steps(&self, steps: u32) {
        *self.work_steps.lock().unwrap() = steps;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for ScriptedTranscoder {
    async fn run(
        &self,
        _input_ref: &str,
        output_ref: &str,
        _params: &serde_json::Value,
    ) -> MediaResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let steps = *self.work_steps.lock().unwrap();
        for _ in 0..steps {
            self.clock.advance_secs(100);
            tokio::time::sleep(Duration::from_secs(100)).await;
        }

        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            Behavior::Succeed => {
                self.storage.put(output_ref, b"mp4".to_vec());
                Ok(())
            }
            Behavior::Fail(message) => Err(MediaError::ffmpeg_failed(message, None, Some(1))),
            Behavior::NoOutput => Ok(()),
            Behavior::Panic => panic!("scripted transcoder panic"),
        }
    }
}

/// Registry wrapper counting every call.
pub struct CountingRegistry {
    inner: Arc<dyn JobRegistry>,
    calls: AtomicUsize,
}

impl CountingRegistry {
    pub fn new(inner: Arc<dyn JobRegistry>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobRegistry for CountingRegistry {
    async fn create(&self, job: &Job) -> RegistryResult<()> {
        self.count();
        self.inner.create(job).await
    }

    async fn get(&self, job_id: &JobId) -> RegistryResult<Option<Job>> {
        self.count();
        self.inner.get(job_id).await
    }

    async fn scan(&self) -> RegistryResult<Vec<Job>> {
        self.count();
        self.inner.scan().await
    }

    async fn list_for_owner(&self, owner_id: &str) -> RegistryResult<Vec<Job>> {
        self.count();
        self.inner.list_for_owner(owner_id).await
    }

    async fn update_if(
        &self,
        job_id: &JobId,
        condition: &Condition,
        update: &JobUpdate,
    ) -> RegistryResult<bool> {
        self.count();
        self.inner.update_if(job_id, condition, update).await
    }
}

/// Registry wrapper that can make lock or release writes fail as if the
/// backend were unreachable.
pub struct FaultyRegistry {
    inner: Arc<dyn JobRegistry>,
    fail_lock: AtomicBool,
    fail_release: AtomicBool,
    release_attempts: AtomicUsize,
}

impl FaultyRegistry {
    pub fn new(inner: Arc<dyn JobRegistry>) -> Self {
        Self {
            inner,
            fail_lock: AtomicBool::new(false),
            fail_release: AtomicBool::new(false),
            release_attempts: AtomicUsize::new(0),
        }
    }

    pub fn set_fail_lock(&self, fail: bool) {
        self.fail_lock.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    pub fn release_attempts(&self) -> usize {
        self.release_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobRegistry for FaultyRegistry {
    async fn create(&self, job: &Job) -> RegistryResult<()> {
        self.inner.create(job).await
    }

    async fn get(&self, job_id: &JobId) -> RegistryResult<Option<Job>> {
        self.inner.get(job_id).await
    }

    async fn scan(&self) -> RegistryResult<Vec<Job>> {
        self.inner.scan().await
    }

    async fn list_for_owner(&self, owner_id: &str) -> RegistryResult<Vec<Job>> {
        self.inner.list_for_owner(owner_id).await
    }

    async fn update_if(
        &self,
        job_id: &JobId,
        condition: &Condition,
        update: &JobUpdate,
    ) -> RegistryResult<bool> {
        let fail = match update {
            JobUpdate::Lock { .. } => self.fail_lock.load(Ordering::SeqCst),
            JobUpdate::Release { .. } => {
                self.release_attempts.fetch_add(1, Ordering::SeqCst);
                self.fail_release.load(Ordering::SeqCst)
            }
            JobUpdate::ExtendLease { .. } => false,
        };
        if fail {
            return Err(RegistryError::ConnectionFailed("registry unreachable".into()));
        }
        self.inner.update_if(job_id, condition, update).await
    }
}

/// In-memory backends wired together.
pub struct Harness {
    pub registry: Arc<MemoryRegistry>,
    pub queue: Arc<MemoryQueue>,
    pub notify: Arc<MemoryQueue>,
    pub storage: Arc<MemoryStorage>,
    pub transcoder: Arc<ScriptedTranscoder>,
    pub audit: Arc<MemoryAuditSink>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::at_epoch(START_EPOCH));
        let transcoder = Arc::new(ScriptedTranscoder {
            storage: storage.clone(),
            clock: clock.clone(),
            behavior: Mutex::new(Behavior::Succeed),
            work_steps: Mutex::new(0),
            calls: AtomicUsize::new(0),
        });
        Self {
            registry: Arc::new(MemoryRegistry::new()),
            queue: Arc::new(MemoryQueue::new(LEASE)),
            notify: Arc::new(MemoryQueue::new(LEASE)),
            storage,
            transcoder,
            audit: Arc::new(MemoryAuditSink::new()),
            clock,
        }
    }

    /// Dead-letter work messages after `max` deliveries.
    pub fn with_max_receives(max: u32) -> Self {
        Self {
            queue: Arc::new(MemoryQueue::new(LEASE).with_max_receives(max)),
            ..Self::new()
        }
    }

    pub fn services(&self) -> Services {
        Services {
            registry: self.registry.clone(),
            queue: self.queue.clone(),
            storage: self.storage.clone(),
            transcoder: self.transcoder.clone(),
            audit: self.audit.clone(),
            clock: self.clock.clone(),
            notify_queue: Some(self.notify.clone()),
        }
    }

    pub fn producer(&self) -> Producer {
        Producer::from_services(&self.services())
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::from_services(&self.services())
    }

    pub fn worker(&self, worker_id: &str) -> Worker {
        Worker::new(worker_config(worker_id), self.services())
    }

    pub async fn submit(&self, job_id: &str) -> JobId {
        self.producer()
            .submit_with_id(JobId::from(job_id), request(job_id))
            .await
            .unwrap()
    }

    pub async fn job(&self, job_id: &JobId) -> Job {
        self.registry.get(job_id).await.unwrap().unwrap()
    }
}

pub fn worker_config(worker_id: &str) -> WorkerConfig {
    WorkerConfig {
        worker_id: worker_id.to_string(),
        lease: LEASE,
        receive_wait: Duration::ZERO,
        ..Default::default()
    }
}

pub fn request(job_id: &str) -> SubmitRequest {
    SubmitRequest::new(
        "owner-1",
        format!("raw/owner-1/{job_id}.mov"),
        format!("transcoded/owner-1/{job_id}.mp4"),
        json!({ "resolution": "720p" }),
    )
}
