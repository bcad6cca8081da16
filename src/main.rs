use std::path::PathBuf;

use clap::{Parser, Subcommand};
use showstart_monitor::config::Config;
use showstart_monitor::monitor::{MonitorError, MonitorService};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "showstart-monitor", version, about = "Showstart keyword monitor")]
struct Cli {
    /// TOML config file. Falls back to env-only config when missing.
    #[arg(short, long, default_value = "monitor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Poll until Ctrl+C (default).
    Run,
    /// Bootstrap if needed, check every keyword once, exit.
    Once,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config_found = cli.config.exists();
    let config = if config_found {
        Config::load(&cli.config)?
    } else {
        Config::from_env()?
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("showstart-monitor v{} starting", env!("CARGO_PKG_VERSION"));
    if !config_found {
        info!(path = %cli.config.display(), "no config file found, using env-only config");
    }
    if !config.has_credentials() {
        warn!("showstart sign/token not configured - requests will likely be rejected");
    }

    let service = MonitorService::from_config(&config)?;
    let cancel = CancellationToken::new();

    match cli.command.unwrap_or(Command::Run) {
        Command::Once => {
            let summary = service.run_once(&cancel).await?;
            info!(
                keywords = summary.keywords_checked,
                failed = summary.failed_queries,
                notified = summary.notified,
                "single check complete"
            );
        }
        Command::Run => {
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutting down...");
                    shutdown.cancel();
                }
            });

            match service.run(&cancel).await {
                Ok(()) | Err(MonitorError::Cancelled) => info!("monitor stopped"),
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}
