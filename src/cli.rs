use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "devfleet")]
#[command(about = "devfleet - run and watch a fleet of local development services")]
pub struct Cli {
    /// Services file (defaults to devfleet.yaml, searched upwards)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Project directory services run in (defaults to the services file's directory)
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start every service and supervise them until Ctrl-C
    Up {
        /// Print every registry change as it happens
        #[arg(long)]
        verbose: bool,
    },
    /// Start services, check their health and report
    Health {
        /// Keep checking and print changes until Ctrl-C
        #[arg(long)]
        stream: bool,

        /// Seconds between checks when streaming (minimum 1)
        #[arg(long, default_value_t = 5)]
        interval: u64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the services file
    CheckConfig,
}
