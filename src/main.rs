mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use devfleet::process::SPAWNED_BY_ENV;
use devfleet::{Error as FleetError, Parser as ConfigParser};
use std::path::{Path, PathBuf};

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            if let Some(fleet_error) = e.downcast_ref::<FleetError>() {
                eprintln!("Error: {}", fleet_error);
                if let Some(suggestion) = fleet_error.suggestion() {
                    eprintln!("\nHint: {}", suggestion);
                }
            } else {
                eprintln!("Error: {:#}", e);
            }
            std::process::exit(1);
        }
    }
}

async fn run() -> anyhow::Result<i32> {
    // A managed service invoking devfleet again would supervise itself.
    if let Ok(parent_service) = std::env::var(SPAWNED_BY_ENV) {
        eprintln!("Error: devfleet was started from inside service '{}'", parent_service);
        eprintln!();
        eprintln!("  Change that service's command to run the application directly.");
        return Ok(1);
    }

    let cli = Cli::parse();
    init_tracing();

    if let Commands::CheckConfig = cli.command {
        commands::run_check_config(cli.config)?;
        return Ok(0);
    }

    let parser = ConfigParser::new();
    let config_path = match cli.config {
        Some(path) => path,
        None => parser.find_config_file()?,
    };
    let config = parser.load_config(&config_path)?;
    let work_dir = resolve_work_dir(cli.workdir, &config_path)?;
    tracing::debug!(config = %config_path.display(), work_dir = %work_dir.display(), "Loaded services file");

    match cli.command {
        Commands::Up { verbose } => {
            commands::run_up(config, &work_dir, verbose).await?;
            Ok(0)
        }
        Commands::Health {
            stream,
            interval,
            json,
        } => commands::run_health(config, &work_dir, stream, interval, json).await,
        Commands::CheckConfig => Ok(0),
    }
}

/// Services run relative to the services file unless told otherwise.
fn resolve_work_dir(workdir: Option<PathBuf>, config_path: &Path) -> anyhow::Result<PathBuf> {
    if let Some(dir) = workdir {
        return Ok(dir);
    }
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent.to_path_buf()),
        _ => Ok(std::env::current_dir()?),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
