//! fleetqd: the fleetq daemon.
//!
//! Hosts the scheduler control loop over a local redb state store, and
//! offers one-shot admin commands against the same store.
//!
//! # Usage
//!
//! ```text
//! fleetqd --data-dir /var/lib/fleetq run --tick-interval 10
//! fleetqd cluster add east --ram-gb 64 --cpu-cores 32 --gpu-count 4
//! fleetqd submit --name trainer --image registry.local/trainer:3 \
//!     --cluster east --ram-gb 16 --cpu-cores 4 --priority 3
//! fleetqd queue
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use fleetq_scheduler::{Scheduler, SchedulerConfig};
use fleetq_state::StateStore;

mod admin;
mod daemon;

#[derive(Parser)]
#[command(name = "fleetqd", about = "fleetq deployment scheduler daemon", version)]
struct Cli {
    /// Data directory for persistent state.
    #[arg(long, global = true, default_value = "/var/lib/fleetq")]
    data_dir: PathBuf,

    /// Scheduler configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler loop until interrupted.
    Run {
        /// Override the configured tick interval, in seconds.
        #[arg(long)]
        tick_interval: Option<u64>,
    },
    /// Manage clusters.
    Cluster {
        #[command(subcommand)]
        action: ClusterAction,
    },
    /// Submit a deployment; it is queued until a pass admits it.
    Submit {
        #[arg(long)]
        name: String,
        #[arg(long)]
        image: String,
        #[arg(long)]
        cluster: String,
        #[arg(long)]
        ram_gb: f64,
        #[arg(long)]
        cpu_cores: f64,
        #[arg(long, default_value = "0")]
        gpu_count: u32,
        /// 1 (lowest) to 5 (highest). Defaults to the configured priority.
        #[arg(long)]
        priority: Option<u8>,
        /// Environment variable, KEY=VALUE. Repeatable.
        #[arg(long = "env", value_parser = admin::parse_env)]
        env: Vec<(String, String)>,
    },
    /// Cancel a deployment. Cancelling a finished deployment is a no-op.
    Cancel { id: String },
    /// Mark a running deployment as exited.
    Finish {
        id: String,
        /// Record the exit as a failure.
        #[arg(long)]
        failed: bool,
    },
    /// Delete a deployment record, releasing anything it holds.
    Delete { id: String },
    /// Show one deployment, or all of them.
    Show { id: Option<String> },
    /// Admit one deployment now, or run a full pass when no id is given.
    Schedule { id: Option<String> },
    /// Change a deployment's priority.
    Priority { id: String, priority: u8 },
    /// Show the queue, or one deployment's position in it.
    Queue { id: Option<String> },
    /// Recompute cluster counters from running deployments.
    Reconcile,
}

#[derive(Subcommand, Debug)]
enum ClusterAction {
    /// Register a cluster.
    Add {
        id: String,
        /// Display name (defaults to the id).
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        ram_gb: f64,
        #[arg(long)]
        cpu_cores: f64,
        #[arg(long, default_value = "0")]
        gpu_count: u32,
    },
    /// List clusters.
    List,
    /// Show a cluster's utilization.
    Status { id: String },
    /// Set a cluster to active, maintenance, or offline.
    SetStatus { id: String, status: String },
    /// Change a cluster's total capacity.
    Resize {
        id: String,
        #[arg(long)]
        ram_gb: f64,
        #[arg(long)]
        cpu_cores: f64,
        #[arg(long, default_value = "0")]
        gpu_count: u32,
    },
    /// Remove a cluster with no running deployments.
    Remove { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run { tick_interval } => {
            if let Some(secs) = tick_interval {
                config.tick_interval_secs = secs;
                config.validate()?;
            }
            daemon::run(cli.data_dir, config).await
        }
        command => {
            let scheduler = open_scheduler(&cli.data_dir, config)?;
            let output = admin::execute(&scheduler, command).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetqd=debug,fleetq=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SchedulerConfig> {
    match path {
        Some(path) => {
            let config = SchedulerConfig::from_file(path)?;
            info!(path = ?path, "configuration loaded");
            Ok(config)
        }
        None => Ok(SchedulerConfig::default()),
    }
}

/// Open the store under `data_dir` and rebuild scheduler state from it.
fn open_scheduler(data_dir: &Path, config: SchedulerConfig) -> anyhow::Result<Scheduler> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("fleetq.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(Scheduler::load(Arc::new(store), config)?)
}
