//! Gristmill CLI entry point
//!
//! A thin composition layer: parse arguments, initialize logging, and
//! start the requested role. Masters serve the coordinator RPC surface,
//! workers poll it, and the `submit`/`status` commands are small clients
//! over the same protocol.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gristmill::config::Config;
use gristmill::consensus::LocalCluster;
use gristmill::master::Master;
use gristmill::rpc::protocol::SubmitJobRequest;
use gristmill::rpc::{CoordinatorApi, RoutingClient};
use gristmill::userfns::WordCount;
use gristmill::worker::WorkerRuntime;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gristmill", about = "Fault-tolerant MapReduce coordination")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Increase log verbosity
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a master node
    Master {
        /// Index of this master within RPC_ADDRESSES
        #[arg(long, default_value_t = 0)]
        index: usize,
    },
    /// Run a worker process
    Worker,
    /// Submit a job
    Submit {
        /// Input files, one map task each
        #[arg(long, required = true, value_delimiter = ',')]
        input: Vec<PathBuf>,
        /// Reducer count; chosen dynamically when omitted
        #[arg(long)]
        reducers: Option<u32>,
    },
    /// Show the current job's status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = Arc::new(Config::from_env().context("invalid configuration")?);

    match cli.command {
        Commands::Master { index } => run_master(config, index).await,
        Commands::Worker => run_worker(config).await,
        Commands::Submit { input, reducers } => run_submit(config, input, reducers).await,
        Commands::Status => run_status(config).await,
    }
}

async fn run_master(config: Arc<Config>, index: usize) -> Result<()> {
    let Some(addr) = config.rpc_addresses.get(index).cloned() else {
        bail!(
            "master index {} out of range; RPC_ADDRESSES has {} entries",
            index,
            config.rpc_addresses.len()
        );
    };
    // Single-replica log per process; a multi-master deployment points
    // RAFT_ADDRESSES at an external consensus cluster behind the same
    // ReplicatedLog seam.
    let (_cluster, node) = LocalCluster::single(addr.clone());
    let state = node.state();
    let master = Master::new(config, Arc::new(node), state);
    master.serve(&addr).await?;
    Ok(())
}

async fn run_worker(config: Arc<Config>) -> Result<()> {
    let client = Arc::new(RoutingClient::over_http(&config));
    let worker = WorkerRuntime::new(
        config,
        client,
        Arc::new(WordCount),
        Arc::new(WordCount),
    );
    info!("Starting worker {}", worker.id());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });
    worker.run(shutdown_rx).await?;
    Ok(())
}

async fn run_submit(
    config: Arc<Config>,
    input: Vec<PathBuf>,
    reducers: Option<u32>,
) -> Result<()> {
    let client = RoutingClient::over_http(&config);
    let accepted = client
        .submit_job(SubmitJobRequest {
            input_files: input,
            reduce_hint: reducers,
        })
        .await?;
    println!("{}", accepted.job_id);
    info!(
        "Job {} accepted with {} reducers",
        accepted.job_id, accepted.reduce_count
    );
    Ok(())
}

async fn run_status(config: Arc<Config>) -> Result<()> {
    let client = RoutingClient::over_http(&config);
    let status = client.job_status().await?;
    println!(
        "{} phase={} map={}/{} reduce={}/{} submitted={}",
        status.job_id,
        status.phase,
        status.map_completed,
        status.map_total,
        status.reduce_completed,
        status.reduce_total,
        status.submitted_at
    );
    Ok(())
}
