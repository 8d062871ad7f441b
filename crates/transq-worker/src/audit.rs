//! Audit trail sinks.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{info, warn};

use transq_models::{AuditAction, AuditEvent, JobId};

use crate::error::WorkerResult;

/// Destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> WorkerResult<()>;
}

/// Record an event; a sink failure is logged and otherwise ignored.
pub async fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    let job_id = event.job_id.clone();
    let action = event.action;
    if let Err(e) = sink.record(event).await {
        warn!(job_id = %job_id, action = %action, error = %e, "Failed to record audit event");
    }
}

/// Writes each event as a structured log line on the `transq::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> WorkerResult<()> {
        let detail = serde_json::to_string(&event.detail)?;
        info!(
            target: "transq::audit",
            actor = %event.actor,
            job_id = %event.job_id,
            action = %event.action,
            at = %event.at.to_rfc3339(),
            detail = %detail,
            "audit"
        );
        Ok(())
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Actions recorded for one job, oldest first.
    pub fn actions_for(&self, job_id: &JobId) -> Vec<AuditAction> {
        self.events()
            .into_iter()
            .filter(|e| &e.job_id == job_id)
            .map(|e| e.action)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> WorkerResult<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
        Ok(())
    }
}
