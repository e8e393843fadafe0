mod cli;
mod commands;
mod output;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use devfleet::{Config, Error as FleetError, Parser as ConfigParser};
use output::CliOutput;
use std::path::{Path, PathBuf};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
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

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    let out = CliOutput;

    let search_dir = match &cli.workdir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let (config, config_path) = load_config(cli.config.as_deref(), &search_dir)?;

    // Relative paths in the config resolve against the config file unless
    // a working directory was given explicitly
    let work_dir = match cli.workdir {
        Some(dir) => dir,
        None => config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or(search_dir),
    };

    match cli.command {
        Commands::Up { services } => commands::run_up(config, work_dir, services, &out).await,
        Commands::Down => commands::run_down(config, work_dir, &out).await,
        Commands::Status { json } => commands::run_status(config, work_dir, json, &out).await,
        Commands::Order { services } => commands::run_order(&config, &services, &out),
        Commands::Validate => commands::run_validate(&config, &config_path, &out),
        Commands::Reports { service, json } => {
            commands::run_reports(&config, &work_dir, service, json, &out)
        }
    }
}

fn load_config(explicit: Option<&Path>, search_dir: &Path) -> anyhow::Result<(Config, PathBuf)> {
    let parser = ConfigParser::new();
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => ConfigParser::find_config_in_dir(search_dir)?,
    };
    let config = parser.load_config(&path)?;
    Ok((config, path))
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
