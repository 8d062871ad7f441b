//! Tracing setup and structured job logging.

use tracing::{error, info, warn, Span};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use transq_models::JobId;

/// Initialize the global subscriber.
///
/// `LOG_FORMAT=json` switches to JSON lines; `RUST_LOG` adds directives on
/// top of `transq=info`.
pub fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let mut env_filter = EnvFilter::from_default_env();
    if let Ok(directive) = "transq=info".parse::<Directive>() {
        env_filter = env_filter.add_directive(directive);
    }

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

/// Lifecycle logger for one job handled by one worker.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    worker_id: String,
}

impl JobLogger {
    pub fn new(job_id: &JobId, worker_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            worker_id: worker_id.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            "Job started: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Span covering the lock-to-release section of a job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            worker_id = %self.worker_id
        )
    }
}
