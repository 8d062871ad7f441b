//! Shared handles injected into the producer, worker and reconciler.

use std::sync::Arc;

use transq_media::Transcoder;
use transq_models::Clock;
use transq_queue::WorkQueue;
use transq_registry::{JobRegistry, LockManager};
use transq_storage::ObjectStorage;

use crate::audit::AuditSink;

/// Backends a process talks to. Binaries build one from config, tests from
/// the in-memory implementations.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<dyn JobRegistry>,
    pub queue: Arc<dyn WorkQueue>,
    pub storage: Arc<dyn ObjectStorage>,
    pub transcoder: Arc<dyn Transcoder>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
    /// Completion notifications; `None` disables them
    pub notify_queue: Option<Arc<dyn WorkQueue>>,
}

impl Services {
    /// Lock manager over this registry and clock.
    pub fn lock_manager(&self) -> LockManager {
        LockManager::new(self.registry.clone(), self.clock.clone())
    }
}
