use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sdbackup::config::{AppConfig, DEFAULT_CONFIG_PATH};
use sdbackup::core::{DeviceWatcher, LogEntry, Orchestrator};
use sdbackup::logging::{self, LogConfig};
use sdbackup::rpc::{RpcClient, RpcServer};
use sdbackup::{adapters, context::AppContext};
use serde::Serialize;
use tracing::info;

#[derive(Parser)]
#[command(name = "sdbackup")]
#[command(about = "Automatic SD card backup daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to read
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Daemon RPC address (overrides config)
    #[arg(long, global = true)]
    rpc_bind: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch for cards and serve RPC requests
    Daemon(DaemonArgs),
    /// Show the daemon's backup status
    Status,
    /// Start a manual backup of SOURCE into TARGET
    Start { source: PathBuf, target: PathBuf },
    /// Cancel the running backup
    Cancel,
    /// Print the activity log
    Logs {
        /// Only entries with this sequence number or later
        #[arg(long, default_value_t = 0)]
        since: u64,

        /// Keep printing new entries as they are logged
        #[arg(long, short)]
        follow: bool,
    },
    /// Configuration helpers
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a config file with default values
    Init { path: Option<PathBuf> },
    /// Print the effective configuration
    Show,
}

#[derive(Args, Serialize)]
struct DaemonArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    mount_point_template: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    target_path_template: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    verbose: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    json_logs: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    simulation: bool,
}

#[derive(Serialize)]
struct Overrides<'a> {
    #[serde(flatten)]
    daemon: Option<&'a DaemonArgs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rpc_bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = Overrides {
        daemon: match &cli.command {
            Commands::Daemon(args) => Some(args),
            _ => None,
        },
        rpc_bind: cli.rpc_bind,
    };
    let config = logging::during_startup(|| AppConfig::new(&cli.config, Some(&overrides)))?;

    match cli.command {
        Commands::Daemon(_) => {
            logging::init(LogConfig {
                json: config.json_logs,
                verbose: config.verbose,
                file: config.log_path.clone(),
            })?;
            run_daemon(AppContext::new(config))
                .await
                .context("Failed to run daemon")?
        }
        Commands::Status => run_status(&config).await?,
        Commands::Start { source, target } => {
            let reply = client(&config).start_backup(&source, &target).await?;
            println!("{} (job {})", reply.message, reply.job_id);
        }
        Commands::Cancel => println!("{}", client(&config).cancel_backup().await?),
        Commands::Logs { since, follow: false } => {
            for entry in client(&config).logs(since).await? {
                print_entry(&entry);
            }
        }
        Commands::Logs { since, follow: true } => {
            let mut stream = client(&config).follow_logs(since).await?;
            while let Some(entry) = stream.next().await? {
                print_entry(&entry);
            }
        }
        Commands::Config(ConfigCommand::Init { path }) => {
            let path = path.unwrap_or(cli.config);
            AppConfig::default().write_to(&path)?;
            println!("Wrote default config to {}", path.display());
        }
        Commands::Config(ConfigCommand::Show) => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn print_entry(entry: &LogEntry) {
    println!(
        "{:>5} {} {}",
        entry.seq,
        entry.timestamp.format("%H:%M:%S"),
        entry.message
    );
}

fn client(config: &AppConfig) -> RpcClient {
    RpcClient::new(config.rpc_bind)
}

async fn run_daemon(ctx: AppContext) -> Result<()> {
    info!(
        mount_point_template = %ctx.config.mount_point_template,
        target_path_template = %ctx.config.target_path_template,
        simulation = ctx.config.simulation,
        ">> sdbackup daemon starting"
    );

    let server = RpcServer::bind(ctx.clone(), ctx.config.rpc_bind)
        .await
        .context("Failed to bind RPC server")?;

    let monitor = adapters::get_monitor(ctx.config.simulation);
    let watcher = DeviceWatcher::new(monitor, tokio::runtime::Handle::current());
    watcher.start(Arc::new(Orchestrator::new(ctx.clone())))?;

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }

    server.shutdown();
    watcher.stop();
    // Cancels any running job, automatic ones included.
    ctx.manual.shutdown().await;

    Ok(())
}

async fn run_status(config: &AppConfig) -> Result<()> {
    let status = client(config)
        .daemon_status()
        .await
        .context("Failed to reach daemon")?;

    println!("sdbackup {} (up {}s)", status.version, status.uptime_secs);
    println!("Status: {}", status.backup.message);
    if let Some(job) = status.job {
        println!("  {} -> {}", job.source.display(), job.target.display());
    }

    Ok(())
}
