//! Nearby CLI library
//!
//! Configuration loading, command parsing and the terminal front end for the
//! `nearby` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod terminal;

pub use cli::{Cli, Commands};
pub use config::AppConfig;
pub use error::{CliError, Result};
