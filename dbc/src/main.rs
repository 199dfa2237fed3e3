//! Distributed Build Client - command line entry point.

#![forbid(unsafe_code)]

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(dbc_common::config::default_config_path);
    let loaded = dbc_common::config::load(config_path.as_deref())
        .context("failed to load configuration")?;

    init_logging(&cli, &loaded.config.general.log_level);
    debug!("Using config path {:?}", config_path);

    match cli.command {
        Commands::CriticalPath { ref trace } => cli::critical_path(trace, cli.json),
        Commands::Config => cli::show_config(&loaded, config_path.as_deref(), cli.json),
    }
}

fn init_logging(cli: &Cli, configured_level: &str) {
    let default_level = if cli.verbose { "debug" } else { configured_level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if cli.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}
