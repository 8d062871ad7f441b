//! Shared data models for transq job dispatch.
//!
//! This crate provides Serde-serializable types for:
//! - Job records and the status state machine
//! - Work queue messages
//! - Transcoding parameters
//! - Audit events
//!
//! It also defines the [`Clock`] used for lease arithmetic.

pub mod audit;
pub mod clock;
pub mod job;
pub mod job_status;
pub mod message;
pub mod params;

// Re-export common types
pub use audit::{AuditAction, AuditEvent};
pub use clock::{Clock, ManualClock, SystemClock};
pub use job::{Job, JobId};
pub use job_status::{JobStatus, TransitionError};
pub use message::{DecodeError, NotifyMessage, TranscodeMessage, WorkMessage, NOTIFY_TYPE, TRANSCODE_TYPE};
pub use params::{Resolution, TranscodeParams};
