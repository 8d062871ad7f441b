//! Prometheus metrics for the worker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing::{debug, warn};

use transq_queue::WorkQueue;

use crate::error::{WorkerError, WorkerResult};
use crate::shutdown::wait_for_shutdown;

/// Install the Prometheus recorder and serve it on `addr`.
///
/// Must be called from inside a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> WorkerResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config_error(format!("metrics exporter: {e}")))
}

/// Metric names as constants for consistency.
pub mod names {
    // Producer
    pub const JOBS_SUBMITTED_TOTAL: &str = "transq_jobs_submitted_total";

    // Worker
    pub const LOCK_CONTENTION_TOTAL: &str = "transq_lock_contention_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "transq_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "transq_jobs_failed_total";
    pub const MESSAGES_DROPPED_TOTAL: &str = "transq_messages_dropped_total";
    pub const HEARTBEAT_FAILURES_TOTAL: &str = "transq_heartbeat_failures_total";
    pub const TRANSCODE_DURATION_SECONDS: &str = "transq_transcode_duration_seconds";

    // Reconciler
    pub const RECONCILER_RESOLVED_TOTAL: &str = "transq_reconciler_resolved_total";

    // Queue
    pub const QUEUE_VISIBLE: &str = "transq_queue_visible";
    pub const QUEUE_IN_FLIGHT: &str = "transq_queue_in_flight";
    pub const QUEUE_DLQ_LENGTH: &str = "transq_queue_dlq_length";
}

pub fn record_job_submitted() {
    counter!(names::JOBS_SUBMITTED_TOTAL).increment(1);
}

pub fn record_lock_contention() {
    counter!(names::LOCK_CONTENTION_TOTAL).increment(1);
}

/// Record a job finished by a worker.
pub fn record_job_completed(duration_secs: f64) {
    counter!(names::JOBS_COMPLETED_TOTAL).increment(1);
    histogram!(names::TRANSCODE_DURATION_SECONDS, &[("outcome", "completed")])
        .record(duration_secs);
}

/// Record a job failed by a worker.
pub fn record_job_failed(duration_secs: f64) {
    counter!(names::JOBS_FAILED_TOTAL).increment(1);
    histogram!(names::TRANSCODE_DURATION_SECONDS, &[("outcome", "failed")]).record(duration_secs);
}

pub fn record_message_dropped(reason: &str) {
    let labels = [("reason", reason.to_string())];
    counter!(names::MESSAGES_DROPPED_TOTAL, &labels).increment(1);
}

pub fn record_heartbeat_failure(target: &str) {
    let labels = [("target", target.to_string())];
    counter!(names::HEARTBEAT_FAILURES_TOTAL, &labels).increment(1);
}

pub fn record_reconciler_resolution(status: &str) {
    let labels = [("status", status.to_string())];
    counter!(names::RECONCILER_RESOLVED_TOTAL, &labels).increment(1);
}

/// Poll queue depth into gauges until shutdown.
pub async fn report_queue_depth(
    queue: Arc<dyn WorkQueue>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }

        match queue.depth().await {
            Ok(depth) => {
                debug!(
                    visible = depth.visible,
                    in_flight = depth.in_flight,
                    dead_lettered = depth.dead_lettered,
                    "Queue depth"
                );
                gauge!(names::QUEUE_VISIBLE).set(depth.visible as f64);
                gauge!(names::QUEUE_IN_FLIGHT).set(depth.in_flight as f64);
                gauge!(names::QUEUE_DLQ_LENGTH).set(depth.dead_lettered as f64);
            }
            Err(e) => warn!(error = %e, "Failed to read queue depth"),
        }
    }
}
