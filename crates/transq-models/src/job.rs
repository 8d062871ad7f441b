//! Job records as stored in the job registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::job_status::{JobStatus, TransitionError};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new job ID derived from the creation time.
    ///
    /// Format: `v_<epoch millis>_<8 hex chars>`. The random suffix keeps two
    /// producers submitting in the same millisecond apart.
    pub fn new() -> Self {
        Self::generate_at(Utc::now())
    }

    /// Generate a job ID for the given creation time.
    pub fn generate_at(now: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("v_{}_{}", now.timestamp_millis(), &suffix[..8]))
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A transcoding job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job ID (immutable)
    pub job_id: JobId,
    /// Owner identity
    pub owner_id: String,
    /// Object-storage key of the source
    pub input_ref: String,
    /// Object-storage key of the result
    pub output_ref: String,
    /// Requested parameters (free-form)
    #[serde(default)]
    pub params: serde_json::Value,
    /// Current status
    pub status: JobStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Set iff status is terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Present only when FAILED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Lock holder, present only while PROCESSING
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    /// Lock expiry in epoch seconds, present only while PROCESSING
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_expires_at: Option<i64>,
}

impl Job {
    /// Create a new QUEUED job.
    pub fn new(
        job_id: JobId,
        owner_id: impl Into<String>,
        input_ref: impl Into<String>,
        output_ref: impl Into<String>,
        params: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            owner_id: owner_id.into(),
            input_ref: input_ref.into(),
            output_ref: output_ref.into(),
            params,
            status: JobStatus::Queued,
            created_at,
            completed_at: None,
            error_message: None,
            locked_by: None,
            lock_expires_at: None,
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the job is PROCESSING and its lease ran out before `now_epoch`.
    pub fn is_lock_expired(&self, now_epoch: i64) -> bool {
        self.status.is_locked()
            && self
                .lock_expires_at
                .map(|expires| now_epoch > expires)
                .unwrap_or(false)
    }

    /// Take the lock: QUEUED/FAILED -> PROCESSING.
    ///
    /// Clears `completedAt` and `errorMessage` left over from a failed attempt.
    pub fn lock(
        &mut self,
        worker_id: impl Into<String>,
        lock_expires_at: i64,
    ) -> Result<(), TransitionError> {
        self.status = self.status.transition(JobStatus::Processing)?;
        self.locked_by = Some(worker_id.into());
        self.lock_expires_at = Some(lock_expires_at);
        self.completed_at = None;
        self.error_message = None;
        Ok(())
    }

    /// Push the lock expiry forward. Never moves it backwards.
    pub fn extend_lock(&mut self, lock_expires_at: i64) {
        if !self.status.is_locked() {
            return;
        }
        let current = self.lock_expires_at.unwrap_or(i64::MIN);
        self.lock_expires_at = Some(current.max(lock_expires_at));
    }

    /// Release the lock into a terminal status: PROCESSING -> COMPLETED/FAILED.
    pub fn release(
        &mut self,
        status: JobStatus,
        completed_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Result<(), TransitionError> {
        self.status = self.status.transition(status)?;
        self.completed_at = Some(completed_at);
        self.error_message = match status {
            JobStatus::Failed => error_message,
            _ => None,
        };
        self.locked_by = None;
        self.lock_expires_at = None;
        Ok(())
    }

    /// Check the record-level invariants.
    ///
    /// Returns a description of the first violation found.
    pub fn invariant_violation(&self) -> Option<String> {
        let has_lock = self.locked_by.is_some() || self.lock_expires_at.is_some();
        if self.status.is_locked() != has_lock {
            return Some(format!(
                "lock fields present={} with status {}",
                has_lock, self.status
            ));
        }
        if self.status.is_locked()
            && (self.locked_by.is_none() || self.lock_expires_at.is_none())
        {
            return Some("partial lock fields".to_string());
        }
        if self.status.is_terminal() != self.completed_at.is_some() {
            return Some(format!(
                "completedAt present={} with status {}",
                self.completed_at.is_some(),
                self.status
            ));
        }
        if self.error_message.is_some() && self.status != JobStatus::Failed {
            return Some(format!("errorMessage present with status {}", self.status));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queued() -> Job {
        Job::new(
            JobId::from("v1"),
            "owner-1",
            "raw/owner-1/v1.mov",
            "transcoded/owner-1/v1.mp4",
            json!({ "resolution": "720p" }),
            Utc::now(),
        )
    }

    #[test]
    fn test_job_id_format() {
        let now = Utc::now();
        let id = JobId::generate_at(now);
        let prefix = format!("v_{}_", now.timestamp_millis());
        assert!(id.as_str().starts_with(&prefix));
        assert_eq!(id.as_str().len(), prefix.len() + 8);
        assert_ne!(JobId::generate_at(now), JobId::generate_at(now));
    }

    #[test]
    fn test_lock_and_release_keep_invariants() {
        let mut job = queued();
        assert_eq!(job.invariant_violation(), None);

        job.lock("worker-a", 1_000).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.locked_by.as_deref(), Some("worker-a"));
        assert_eq!(job.invariant_violation(), None);

        job.release(JobStatus::Failed, Utc::now(), Some("boom".into()))
            .unwrap();
        assert_eq!(job.locked_by, None);
        assert_eq!(job.lock_expires_at, None);
        assert_eq!(job.error_message.as_deref(), Some("boom"));
        assert_eq!(job.invariant_violation(), None);
    }

    #[test]
    fn test_relock_failed_job_clears_outcome() {
        let mut job = queued();
        job.lock("worker-a", 1_000).unwrap();
        job.release(JobStatus::Failed, Utc::now(), Some("boom".into()))
            .unwrap();

        job.lock("worker-b", 2_000).unwrap();
        assert_eq!(job.completed_at, None);
        assert_eq!(job.error_message, None);
        assert_eq!(job.invariant_violation(), None);
    }

    #[test]
    fn test_completed_job_cannot_be_locked() {
        let mut job = queued();
        job.lock("worker-a", 1_000).unwrap();
        job.release(JobStatus::Completed, Utc::now(), None).unwrap();

        let before = job.clone();
        assert!(job.lock("worker-b", 2_000).is_err());
        assert_eq!(job, before);
    }

    #[test]
    fn test_extend_lock_is_monotonic() {
        let mut job = queued();
        job.lock("worker-a", 1_000).unwrap();
        job.extend_lock(900);
        assert_eq!(job.lock_expires_at, Some(1_000));
        job.extend_lock(1_500);
        assert_eq!(job.lock_expires_at, Some(1_500));
    }

    #[test]
    fn test_extend_lock_ignored_outside_processing() {
        let mut job = queued();
        job.extend_lock(1_500);
        assert_eq!(job.lock_expires_at, None);
    }

    #[test]
    fn test_lock_expiry() {
        let mut job = queued();
        assert!(!job.is_lock_expired(i64::MAX));
        job.lock("worker-a", 1_000).unwrap();
        assert!(!job.is_lock_expired(1_000));
        assert!(job.is_lock_expired(1_001));
    }

    #[test]
    fn test_job_record_field_names() {
        let mut job = queued();
        job.lock("worker-a", 1_000).unwrap();
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["jobId"], "v1");
        assert_eq!(value["status"], "PROCESSING");
        assert_eq!(value["lockedBy"], "worker-a");
        assert_eq!(value["lockExpiresAt"], 1_000);
        assert!(value.get("completedAt").is_none());
    }
}
