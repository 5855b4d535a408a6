use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mindcast_core::MessageBus;
use mindcast_core::config::Config;
use mindcast_gateway::GatewayState;
use mindcast_worker::{HttpTaskExecutor, TaskWorker};

mod logging;

#[derive(Parser)]
#[command(
    name = "mindcast",
    about = "Real-time fanout gateway between WebSocket clients and a task executor",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Gateway {
        /// Port to listen on (default: 8000)
        #[arg(long)]
        port: Option<u16>,

        /// Do not run the task worker in this process
        #[arg(long)]
        no_worker: bool,
    },

    /// Run the task worker as its own process against the shared bus
    Worker,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Config::config_dir);

    let config = Config::load(&config_path)?;

    logging::init(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Gateway { port, no_worker } => {
            let port = port.unwrap_or_else(|| config.gateway_port());
            tracing::info!(config = %config_path.display(), "Starting Mindcast gateway on port {port}");
            run_gateway(config, port, !no_worker).await?;
        }
        Commands::Worker => {
            tracing::info!(config = %config_path.display(), "Starting Mindcast task worker");
            run_worker(config).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
        },
    }

    Ok(())
}

async fn run_gateway(config: Config, port: u16, with_worker: bool) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let bus_url = config.bus_url();
    let bus = mindcast_core::bus::connect(bus_url.as_deref(), config.bus_capacity()).await?;
    let cancel = CancellationToken::new();

    let worker_task = if with_worker && config.worker().enabled {
        Some(spawn_worker(&config, bus.clone(), cancel.child_token()).await?)
    } else if bus_url.is_some() {
        tracing::info!("In-process worker disabled; expecting `mindcast worker` on the shared bus");
        None
    } else {
        tracing::warn!("Task worker disabled and no bus.url set; published tasks will go unanswered");
        None
    };

    tokio::spawn(shutdown_signal(cancel.clone()));

    let state = Arc::new(GatewayState::new(config, bus));
    let result = mindcast_gateway::start_gateway(state, port, cancel.clone()).await;

    cancel.cancel();
    if let Some(task) = worker_task {
        let _ = task.await;
    }
    result
}

async fn run_worker(config: Config) -> anyhow::Result<()> {
    let Some(bus_url) = config.bus_url() else {
        anyhow::bail!(
            "`mindcast worker` needs bus.url in the config; the in-process bus cannot reach a gateway"
        );
    };
    let bus = mindcast_core::bus::connect(Some(&bus_url), config.bus_capacity()).await?;
    let cancel = CancellationToken::new();

    let worker_task = spawn_worker(&config, bus, cancel.child_token()).await?;
    tokio::spawn(shutdown_signal(cancel));

    worker_task.await?;
    tracing::info!("Task worker stopped");
    Ok(())
}

/// Subscribe a [`TaskWorker`] to the task channel and run it until `cancel` fires.
async fn spawn_worker(
    config: &Config,
    bus: Arc<dyn MessageBus>,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let worker_config = config.worker();
    let executor = HttpTaskExecutor::new(
        worker_config.backend_url.clone(),
        Duration::from_secs(worker_config.timeout_secs),
    )?;
    let worker = TaskWorker::new(bus, Arc::new(executor), config.channels());
    let subscription = worker.subscribe().await?;
    tracing::info!(backend = %worker_config.backend_url, "Task worker enabled");
    Ok(worker.spawn(subscription, cancel))
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(%e, "Failed to install CTRL+C handler");
        return;
    }
    tracing::info!("Shutdown signal received");
    cancel.cancel();
}
