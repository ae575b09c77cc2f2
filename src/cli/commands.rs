//! CLI command definitions for docfarm.
//!
//! One binary, three roles: `coordinator` runs the orchestration engine,
//! `worker` runs a batch-processing runtime, `submit` uploads a task
//! list and waits for the completed report.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::warn;

use crate::client::SubmitClient;
use crate::config::FarmConfig;
use crate::coordinator::Coordinator;
use crate::gateway::redis::{connect_manager, RedisBlobGateway, RedisQueueGateway};
use crate::gateway::{BlobGateway, ComputeGateway, DockerComputeGateway, QueueGateway};
use crate::metrics;
use crate::worker::WorkerRuntime;

/// Elastic document-processing task farm.
#[derive(Parser)]
#[command(name = "docfarm")]
#[command(about = "Elastic document-processing task farm")]
#[command(version)]
#[command(
    long_about = "docfarm fans document-processing task lists out across an elastic pool of \
worker instances and returns one aggregated report per client.\n\nExample usage:\n  \
docfarm coordinator --redis-url redis://localhost:6379\n  \
docfarm worker\n  \
docfarm submit --input tasks.txt --output report.html --terminate"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the coordinator orchestration engine.
    #[command(alias = "coord")]
    Coordinator(CoordinatorArgs),

    /// Run a worker runtime processing dispatched batches.
    Worker(WorkerArgs),

    /// Submit a task list and wait for the completed report.
    Submit(SubmitArgs),
}

/// Arguments for `docfarm coordinator`.
#[derive(Parser, Debug)]
pub struct CoordinatorArgs {
    /// Redis connection URL backing queues and blobs.
    #[arg(long, env = "DOCFARM_REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Optional YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum number of tasks per dispatched batch.
    #[arg(long)]
    pub tasks_per_worker: Option<usize>,

    /// Hard cap on total instances.
    #[arg(long)]
    pub max_instances: Option<usize>,
}

/// Arguments for `docfarm worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Redis connection URL backing queues and blobs.
    #[arg(long, env = "DOCFARM_REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Optional YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Arguments for `docfarm submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Redis connection URL backing queues and blobs.
    #[arg(long, env = "DOCFARM_REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Optional YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Task list input file, one `<operation> <document-url>` per line.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output path for the rendered HTML report.
    #[arg(short, long)]
    pub output: PathBuf,

    /// Send the shutdown sentinel after the report arrives.
    #[arg(long)]
    pub terminate: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// Lets main.rs read CLI arguments (like log_level) before running
/// commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Coordinator(args) => run_coordinator_command(args).await,
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Submit(args) => run_submit_command(args).await,
    }
}

fn load_config(path: Option<&Path>, redis_url: &str) -> anyhow::Result<FarmConfig> {
    let mut config = match path {
        Some(path) => FarmConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => FarmConfig::from_env().context("loading configuration from environment")?,
    };
    config.redis_url = redis_url.to_string();
    Ok(config)
}

async fn redis_gateways(
    config: &FarmConfig,
) -> anyhow::Result<(Arc<dyn QueueGateway>, Arc<dyn BlobGateway>)> {
    let manager = connect_manager(&config.redis_url)
        .await
        .context("connecting to the queue backend")?;

    let queues = RedisQueueGateway::from_connection(manager.clone(), &config.namespace);
    let blob = RedisBlobGateway::from_connection(manager, &config.namespace);

    Ok((Arc::new(queues), Arc::new(blob)))
}

async fn run_coordinator_command(args: CoordinatorArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref(), &args.redis_url)?;
    if let Some(tasks) = args.tasks_per_worker {
        config.tasks_per_worker = tasks;
    }
    if let Some(max) = args.max_instances {
        config.max_instances = max;
    }

    if let Err(e) = metrics::init_metrics() {
        warn!(error = %e, "metrics initialization failed, continuing without");
    }

    let (queues, blob) = redis_gateways(&config).await?;
    let compute = DockerComputeGateway::new()
        .context("connecting to the compute backend")?
        .with_env(vec![
            format!("DOCFARM_REDIS_URL={}", config.redis_url),
            format!("DOCFARM_NAMESPACE={}", config.namespace),
        ]);

    let coordinator = Coordinator::new(config, queues, blob, Arc::new(compute)).await?;
    coordinator.run().await?;
    Ok(())
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref(), &args.redis_url)?;
    let (queues, blob) = redis_gateways(&config).await?;

    let runtime = WorkerRuntime::new(queues, blob, &config).await?;
    runtime.run().await?;
    Ok(())
}

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref(), &args.redis_url)?;
    let (queues, blob) = redis_gateways(&config).await?;
    let compute: Arc<dyn ComputeGateway> =
        Arc::new(DockerComputeGateway::new().context("connecting to the compute backend")?);

    let client = SubmitClient::new(queues, blob, compute, config);
    client
        .submit_file(&args.input, &args.output, args.terminate)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_coordinator_command() {
        let cli = Cli::try_parse_from([
            "docfarm",
            "coordinator",
            "--redis-url",
            "redis://farm:6379",
            "--tasks-per-worker",
            "3",
        ])
        .expect("valid args");

        match cli.command {
            Commands::Coordinator(args) => {
                assert_eq!(args.redis_url, "redis://farm:6379");
                assert_eq!(args.tasks_per_worker, Some(3));
                assert_eq!(args.max_instances, None);
            }
            _ => panic!("expected coordinator command"),
        }
    }

    #[test]
    fn test_cli_parses_submit_command() {
        let cli = Cli::try_parse_from([
            "docfarm",
            "submit",
            "--input",
            "tasks.txt",
            "--output",
            "report.html",
            "--terminate",
        ])
        .expect("valid args");

        match cli.command {
            Commands::Submit(args) => {
                assert_eq!(args.input, PathBuf::from("tasks.txt"));
                assert_eq!(args.output, PathBuf::from("report.html"));
                assert!(args.terminate);
            }
            _ => panic!("expected submit command"),
        }
    }

    #[test]
    fn test_cli_requires_submit_paths() {
        assert!(Cli::try_parse_from(["docfarm", "submit"]).is_err());
    }

    #[test]
    fn test_global_log_level() {
        let cli =
            Cli::try_parse_from(["docfarm", "worker", "--log-level", "debug"]).expect("valid");
        assert_eq!(cli.log_level, "debug");
    }
}
