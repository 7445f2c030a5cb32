//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Display name advertised to nearby peers (at most 8 bytes)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Use the low-power duty cycle
    #[arg(long)]
    pub low_power: bool,

    /// Bluetooth adapter index
    #[arg(long)]
    pub adapter: Option<usize>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Discover nearby peers and chat with them interactively
    Run,
    /// Scan for a while and print the visible peers
    Scan {
        /// Seconds to scan for
        #[arg(short, long, default_value_t = 10)]
        duration: u64,
    },
    /// Print the effective configuration as TOML
    Config,
}
