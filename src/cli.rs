use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "devfleet")]
#[command(about = "devfleet - Run a fleet of local development services")]
pub struct Cli {
    /// Config file path (defaults to devfleet.yaml, searched upwards)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Working directory
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start services in dependency order and supervise them until interrupted
    Up {
        /// Services to start, plus their dependencies (defaults to all)
        services: Vec<String>,
    },
    /// Stop every service recorded in the registry and clear it
    Down,
    /// Show registered services
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the startup order
    Order {
        /// Restrict to these services and their dependencies
        services: Vec<String>,
    },
    /// Validate the configuration file
    Validate,
    /// List crash reports
    Reports {
        /// Only reports for this service
        #[arg(long)]
        service: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
