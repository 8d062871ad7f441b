//! Transcode worker binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use transq_media::{check_ffmpeg, FfmpegTranscoder};
use transq_models::SystemClock;
use transq_queue::{QueueConfig, RedisWorkQueue, WorkQueue};
use transq_registry::{RedisRegistry, RegistryConfig};
use transq_storage::{ObjectStorage, S3Storage};
use transq_worker::logging::init_tracing;
use transq_worker::metrics::{init_metrics, report_queue_depth};
use transq_worker::{shutdown, Reconciler, Services, TracingAuditSink, Worker, WorkerConfig};

/// How often queue depth gauges are refreshed.
const DEPTH_REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for rediss:// and HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting transq-worker");

    let config = WorkerConfig::from_env()?;
    let queue_config = QueueConfig::from_env();
    config.validate(queue_config.visibility_timeout)?;
    info!("Worker config: {:?}", config);

    if let Some(addr) = config.metrics_addr {
        init_metrics(addr)?;
        info!(%addr, "Metrics exporter listening");
    }

    check_ffmpeg().context("ffmpeg not found on PATH")?;

    let registry = Arc::new(
        RedisRegistry::new(RegistryConfig::from_env()).context("Failed to create job registry")?,
    );

    let queue = RedisWorkQueue::new(queue_config.clone(), &config.worker_id)
        .context("Failed to create work queue")?;
    queue.init().await.context("Failed to initialize work queue")?;
    let queue: Arc<dyn WorkQueue> = Arc::new(queue);

    let notify_queue: Option<Arc<dyn WorkQueue>> = if config.notify_enabled {
        let notify = RedisWorkQueue::new(queue_config.notify(), &config.worker_id)
            .context("Failed to create notify queue")?;
        notify.init().await.context("Failed to initialize notify queue")?;
        Some(Arc::new(notify) as Arc<dyn WorkQueue>)
    } else {
        None
    };

    let s3 = S3Storage::from_env()
        .await
        .context("Failed to create object storage client")?;
    s3.check_connectivity()
        .await
        .context("Object storage bucket is not reachable")?;
    let storage: Arc<dyn ObjectStorage> = Arc::new(s3);
    let transcoder = Arc::new(FfmpegTranscoder::new(
        storage.clone(),
        config.work_dir.clone(),
        config.transcode_timeout,
    ));

    let services = Services {
        registry,
        queue: queue.clone(),
        storage,
        transcoder,
        audit: Arc::new(TracingAuditSink),
        clock: Arc::new(SystemClock),
        notify_queue,
    };

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let mut background = Vec::new();

    if config.enable_reconciler {
        let reconciler = Reconciler::from_services(&services);
        let interval = config.reconcile_interval;
        let rx = shutdown_rx.clone();
        background.push(tokio::spawn(async move { reconciler.run(interval, rx).await }));
    }

    if config.metrics_addr.is_some() {
        background.push(tokio::spawn(report_queue_depth(
            queue,
            DEPTH_REPORT_INTERVAL,
            shutdown_rx.clone(),
        )));
    }

    tokio::spawn(shutdown::forward_signal(tokio::signal::ctrl_c(), shutdown_tx));

    Worker::new(config, services).run(shutdown_rx).await;

    for task in background {
        task.await.ok();
    }

    info!("Worker shutdown complete");
    Ok(())
}
