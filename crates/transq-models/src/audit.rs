//! Audit events emitted on job lifecycle changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job::JobId;

/// Lifecycle action recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    JobCreated,
    JobProcessing,
    JobCompleted,
    JobFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::JobCreated => "JOB_CREATED",
            AuditAction::JobProcessing => "JOB_PROCESSING",
            AuditAction::JobCompleted => "JOB_COMPLETED",
            AuditAction::JobFailed => "JOB_FAILED",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Who caused the change: an owner, a worker ID or `reconciler`
    pub actor: String,
    pub job_id: JobId,
    pub action: AuditAction,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        actor: impl Into<String>,
        job_id: JobId,
        action: AuditAction,
        detail: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            actor: actor.into(),
            job_id,
            action,
            detail,
            at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_audit_event_wire_format() {
        let event = AuditEvent::new(
            "owner-1",
            JobId::from("v1"),
            AuditAction::JobCreated,
            json!({ "inputRef": "raw/v1.mov" }),
            Utc::now(),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "JOB_CREATED");
        assert_eq!(value["jobId"], "v1");
        assert_eq!(value["detail"]["inputRef"], "raw/v1.mov");
    }
}
