//! Transcode job dispatch.
//!
//! This crate provides:
//! - [`Producer`]: creates job records and enqueues work messages
//! - [`Worker`]: the receive/lock/transcode/release loop with a lease [`Heartbeat`]
//! - [`Reconciler`]: resolves jobs whose lock expired without a report
//! - Audit sinks, configuration, metrics and logging shared by the binaries

pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod heartbeat;
pub mod logging;
pub mod metrics;
pub mod producer;
pub mod reconciler;
pub mod retry;
pub mod shutdown;
pub mod worker;

pub use audit::{AuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::WorkerConfig;
pub use context::Services;
pub use error::{WorkerError, WorkerResult};
pub use heartbeat::{Heartbeat, HeartbeatStats, HeartbeatTarget};
pub use logging::JobLogger;
pub use producer::{Producer, SubmitRequest};
pub use reconciler::{Reconciler, SweepReport, STALE_LOCK_MESSAGE};
pub use worker::{DropReason, MessageOutcome, Worker};
