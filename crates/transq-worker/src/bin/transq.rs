//! transq CLI: submit and inspect transcode jobs.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use transq_models::{JobId, SystemClock};
use transq_queue::{QueueConfig, RedisWorkQueue};
use transq_registry::{JobRegistry, RedisRegistry, RegistryConfig};
use transq_storage::S3Storage;
use transq_worker::logging::init_tracing;
use transq_worker::{Producer, Reconciler, SubmitRequest, TracingAuditSink};

#[derive(Parser)]
#[command(name = "transq", about = "Submit and inspect transcode jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a job and enqueue it
    Submit {
        /// Owner identity
        #[arg(long)]
        owner: String,
        /// Object key of the source
        #[arg(long)]
        input: String,
        /// Object key of the result
        #[arg(long)]
        output: String,
        /// JSON parameters
        #[arg(long, default_value = "{}")]
        params: String,
        /// Use this job ID instead of generating one
        #[arg(long)]
        job_id: Option<String>,
    },
    /// Show one job
    Status {
        job_id: String,
    },
    /// List the jobs of an owner
    Jobs {
        #[arg(long)]
        owner: String,
    },
    /// Run one reconciler sweep
    Reconcile,
    /// Enqueue a QUEUED or FAILED job again
    Requeue {
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let registry = Arc::new(
        RedisRegistry::new(RegistryConfig::from_env()).context("Failed to create job registry")?,
    );

    match cli.command {
        Command::Submit {
            owner,
            input,
            output,
            params,
            job_id,
        } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("--params must be JSON")?;
            let producer = producer(registry).await?;
            let request = SubmitRequest::new(owner, input, output, params);
            let job_id = match job_id {
                Some(id) => producer.submit_with_id(JobId::from(id), request).await?,
                None => producer.submit(request).await?,
            };
            println!("{job_id}");
        }
        Command::Status { job_id } => {
            let job = registry
                .get(&JobId::from(job_id.as_str()))
                .await?
                .with_context(|| format!("job {job_id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::Jobs { owner } => {
            let jobs = registry.list_for_owner(&owner).await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        Command::Reconcile => {
            let storage = Arc::new(
                S3Storage::from_env()
                    .await
                    .context("Failed to create object storage client")?,
            );
            let reconciler = Reconciler::new(
                registry,
                storage,
                Arc::new(TracingAuditSink),
                Arc::new(SystemClock),
            );
            let report = reconciler.sweep().await?;
            println!(
                "scanned={} expired={} completed={} failed={} skipped={}",
                report.scanned, report.expired, report.completed, report.failed, report.skipped
            );
        }
        Command::Requeue { job_id } => {
            let producer = producer(registry).await?;
            let message_id = producer.enqueue_existing(&JobId::from(job_id)).await?;
            println!("{message_id}");
        }
    }

    Ok(())
}

async fn producer(registry: Arc<RedisRegistry>) -> anyhow::Result<Producer> {
    let queue = RedisWorkQueue::new(QueueConfig::from_env(), "transq-cli")
        .context("Failed to create work queue")?;
    queue.init().await.context("Failed to initialize work queue")?;
    Ok(Producer::new(
        registry,
        Arc::new(queue),
        Arc::new(TracingAuditSink),
        Arc::new(SystemClock),
    ))
}
