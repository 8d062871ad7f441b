//! Worker configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{WorkerError, WorkerResult};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity written to `lockedBy` and used as the queue consumer name
    pub worker_id: String,
    /// Lock lease taken on each job
    pub lease: Duration,
    /// Interval for extending the lock and message visibility while processing
    pub heartbeat_interval: Duration,
    /// Long-poll wait for one message
    pub receive_wait: Duration,
    /// Pause after an empty receive
    pub idle_backoff: Duration,
    /// Pause after a queue error
    pub error_backoff: Duration,
    /// Upper bound on one transcode, must stay below the lease
    pub transcode_timeout: Duration,
    /// Work directory for temporary files
    pub work_dir: PathBuf,
    /// Reconciler sweep interval; zero sweeps once at boot only
    pub reconcile_interval: Duration,
    pub enable_reconciler: bool,
    /// Prometheus listener address; `None` disables the exporter
    pub metrics_addr: Option<SocketAddr>,
    /// Publish a notification after each completed job
    pub notify_enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            lease: Duration::from_secs(900), // 15 minutes
            heartbeat_interval: Duration::from_secs(120),
            receive_wait: Duration::from_secs(20),
            idle_backoff: Duration::from_millis(1000),
            error_backoff: Duration::from_millis(3000),
            transcode_timeout: Duration::from_secs(840),
            work_dir: PathBuf::from("/tmp/transq"),
            reconcile_interval: Duration::from_secs(300),
            enable_reconciler: true,
            metrics_addr: None,
            notify_enabled: false,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> WorkerResult<Self> {
        let defaults = Self::default();

        let metrics_addr = match std::env::var("METRICS_ADDR") {
            Ok(addr) if !addr.is_empty() => Some(addr.parse().map_err(|e| {
                WorkerError::config_error(format!("METRICS_ADDR {addr:?}: {e}"))
            })?),
            _ => None,
        };

        Ok(Self {
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.worker_id),
            lease: Duration::from_secs(env_or("WORKER_LEASE_SECS", defaults.lease.as_secs())),
            heartbeat_interval: Duration::from_secs(env_or(
                "WORKER_HEARTBEAT_SECS",
                defaults.heartbeat_interval.as_secs(),
            )),
            receive_wait: Duration::from_secs(env_or(
                "WORKER_RECEIVE_WAIT_SECS",
                defaults.receive_wait.as_secs(),
            )),
            idle_backoff: Duration::from_millis(env_or(
                "WORKER_IDLE_BACKOFF_MS",
                defaults.idle_backoff.as_millis() as u64,
            )),
            error_backoff: Duration::from_millis(env_or(
                "WORKER_ERROR_BACKOFF_MS",
                defaults.error_backoff.as_millis() as u64,
            )),
            transcode_timeout: Duration::from_secs(env_or(
                "WORKER_TRANSCODE_TIMEOUT_SECS",
                defaults.transcode_timeout.as_secs(),
            )),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            reconcile_interval: Duration::from_secs(env_or(
                "RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval.as_secs(),
            )),
            enable_reconciler: env_or("ENABLE_RECONCILER", defaults.enable_reconciler),
            metrics_addr,
            notify_enabled: env_or("NOTIFY_ENABLED", defaults.notify_enabled),
        })
    }

    /// Check the timing relations the lease protocol depends on.
    ///
    /// The heartbeat must fire before either the lock or the queue lease
    /// runs out, and a transcode must be cut off before its lock expires.
    pub fn validate(&self, visibility_timeout: Duration) -> WorkerResult<()> {
        if self.worker_id.is_empty() {
            return Err(WorkerError::config_error("WORKER_ID must not be empty"));
        }
        if self.receive_wait.is_zero() {
            return Err(WorkerError::config_error("receive wait must be positive"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(WorkerError::config_error("heartbeat interval must be positive"));
        }
        if self.heartbeat_interval >= self.lease {
            return Err(WorkerError::config_error(format!(
                "heartbeat interval {}s must be shorter than the lock lease {}s",
                self.heartbeat_interval.as_secs(),
                self.lease.as_secs()
            )));
        }
        if self.heartbeat_interval >= visibility_timeout {
            return Err(WorkerError::config_error(format!(
                "heartbeat interval {}s must be shorter than the queue visibility timeout {}s",
                self.heartbeat_interval.as_secs(),
                visibility_timeout.as_secs()
            )));
        }
        if self.transcode_timeout >= self.lease {
            return Err(WorkerError::config_error(format!(
                "transcode timeout {}s must be shorter than the lock lease {}s",
                self.transcode_timeout.as_secs(),
                self.lease.as_secs()
            )));
        }
        Ok(())
    }
}

fn default_worker_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &suffix[..8])
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VISIBILITY: Duration = Duration::from_secs(900);

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkerConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        config.validate(VISIBILITY).unwrap();
    }

    #[test]
    fn test_heartbeat_must_beat_both_leases() {
        let config = WorkerConfig {
            heartbeat_interval: Duration::from_secs(900),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(VISIBILITY),
            Err(WorkerError::ConfigError(_))
        ));

        let config = WorkerConfig {
            heartbeat_interval: Duration::from_secs(120),
            ..Default::default()
        };
        assert!(config.validate(Duration::from_secs(60)).is_err());
    }

    #[test]
    fn test_transcode_timeout_below_lease() {
        let config = WorkerConfig {
            transcode_timeout: Duration::from_secs(900),
            ..Default::default()
        };
        assert!(config.validate(VISIBILITY).is_err());
    }

    #[test]
    fn test_receive_wait_must_be_bounded() {
        let config = WorkerConfig {
            receive_wait: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(VISIBILITY),
            Err(WorkerError::ConfigError(_))
        ));

        let config = WorkerConfig {
            receive_wait: Duration::from_millis(1),
            ..Default::default()
        };
        config.validate(VISIBILITY).unwrap();
    }
}
