//! Command handlers for the Nearby CLI

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use nearby_ble::BleRadio;
use nearby_core::{Coordinate, EngineError, Radio};
use nearby_runtime::{DeliveryContext, Engine, EngineBuilder, EngineStats};

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::error::{CliError, Result};
use crate::terminal::{format_peer_table, resolve_peer, InputCommand, TerminalDelegate, HELP};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Run => Self::handle_run_command(config).await,
            Commands::Scan { duration } => {
                Self::handle_scan_command(config, Duration::from_secs(duration)).await
            }
            Commands::Config => Self::handle_config_command(&config),
        }
    }

    /// Interactive mode: print engine events and act on typed commands
    async fn handle_run_command(config: AppConfig) -> Result<()> {
        let delegate = Arc::new(TerminalDelegate::new());
        let context = DeliveryContext::Thread(config.cli.delivery_thread.clone());
        let mut engine = Self::engine_builder(&config, BleRadio::new(config.ble.clone()))
            .add_delegate(delegate, context)
            .build()?;

        match engine.start().await {
            Ok(()) => {}
            Err(EngineError::RadioUnavailable { reason }) => {
                warn!("Bluetooth unavailable: {}", reason);
                println!("Bluetooth is unavailable; enable it and type /restart");
            }
            Err(err) => return Err(err.into()),
        }

        let identity = engine.identity();
        println!(
            "Advertising as {} ({}). Type /help for commands.",
            identity.display_name(),
            identity.peer_id()
        );

        let result = Self::interactive_loop(&engine, &config.cli.prompt).await;
        engine.stop().await?;
        result
    }

    async fn interactive_loop(engine: &Engine, prompt: &str) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        loop {
            stdout.write_all(prompt.as_bytes()).await?;
            stdout.flush().await?;

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                println!();
                return Ok(());
            };

            let command = match InputCommand::parse(&line) {
                Ok(command) => command,
                Err(err) => {
                    println!("{}", err);
                    continue;
                }
            };
            if command == InputCommand::Quit {
                return Ok(());
            }
            // Failed commands are reported and the session continues
            if let Err(err) = Self::handle_input(engine, command).await {
                println!("{}", err);
            }
        }
    }

    async fn handle_input(engine: &Engine, command: InputCommand) -> Result<()> {
        match command {
            InputCommand::Empty | InputCommand::Quit => {}
            InputCommand::Help => println!("{}", HELP),
            InputCommand::Peers => println!("{}", format_peer_table(&engine.peers())),
            InputCommand::Send { peer, text } => {
                let peer_id = resolve_peer(&engine.peers(), &peer)?;
                engine.send_message(peer_id, text.into_bytes()).await?;
                debug!("Queued message for {}", peer_id);
            }
            InputCommand::Close { peer } => {
                let peer_id = resolve_peer(&engine.peers(), &peer)?;
                engine.close_session(peer_id).await?;
            }
            InputCommand::Stats => println!("{}", format_stats(&engine.stats().await?)),
            InputCommand::Rotate => {
                let token = engine.rotate_identity().await?;
                println!("Now advertising token {}", token);
            }
            InputCommand::Location(location) => {
                let coordinate = match location {
                    Some((lat, lon)) => Some(Coordinate::from_degrees(lat, lon).ok_or_else(|| {
                        CliError::InvalidCommand(format!("location out of range: {}, {}", lat, lon))
                    })?),
                    None => None,
                };
                engine.set_location(coordinate).await?;
            }
            InputCommand::Restart => {
                engine.restart_radio().await?;
                println!("Radio restarted");
            }
        }
        Ok(())
    }

    /// Scan for `duration` and print the peer table
    async fn handle_scan_command(config: AppConfig, duration: Duration) -> Result<()> {
        let mut engine = Self::engine_builder(&config, BleRadio::new(config.ble.clone()))
            .build_and_start()
            .await?;
        info!("Scanning for {:?}... Press Ctrl+C to stop early", duration);

        let mut peers = engine.watch_peers();
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = tokio::signal::ctrl_c() => break,
                changed = peers.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let visible = peers.borrow_and_update().len();
                    info!("{} peer(s) in range", visible);
                }
            }
        }

        println!("{}", format_peer_table(&engine.peers()));
        engine.stop().await?;
        Ok(())
    }

    /// Print the effective configuration
    fn handle_config_command(config: &AppConfig) -> Result<()> {
        print!("{}", config.to_toml()?);
        Ok(())
    }

    fn engine_builder(config: &AppConfig, radio: impl Radio + 'static) -> EngineBuilder {
        EngineBuilder::new(radio)
            .with_config(config.engine.clone())
            .with_display_name(config.identity.display_name.clone())
            .with_coordinate(config.coordinate())
    }
}

/// Multi-line summary of engine statistics
fn format_stats(stats: &EngineStats) -> String {
    format!(
        "identity:  {} ({})\n\
         radio:     {:?}\n\
         peers:     {} visible, {} active sessions\n\
         scanning:  {} windows, {} decoded, {} malformed\n\
         registry:  {} discovered, {} evicted, {} rotations linked\n\
         sessions:  {} established, {} handshake failures\n\
         messages:  {} sent, {} received, {} updates dropped",
        stats.local_identity.display_name(),
        stats.local_identity.token(),
        stats.radio_state,
        stats.visible_peers,
        stats.active_sessions,
        stats.scheduler.scan_windows,
        stats.scheduler.decoded,
        stats.scheduler.decode_failures,
        stats.registry.discovered,
        stats.registry.evicted,
        stats.registry.linked,
        stats.sessions.established,
        stats.sessions.handshake_failures,
        stats.sessions.messages_sent,
        stats.sessions.messages_received,
        stats.dropped_events,
    )
}
