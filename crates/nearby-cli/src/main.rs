//! Nearby CLI - discover nearby peers over BLE and chat with them

use anyhow::Context;
use clap::Parser;
use tracing::info;

use nearby_cli::{cli::Cli, commands::CommandDispatcher, config::AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.verbose);

    // Load configuration, then apply command line overrides
    let mut config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.apply_overrides(&cli);
    config.validate().context("Invalid configuration")?;

    CommandDispatcher::execute(cli, config)
        .await
        .context("Command execution failed")?;

    info!("Nearby CLI exited successfully");
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    // Logs go to stderr so `nearby config` output stays clean
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
