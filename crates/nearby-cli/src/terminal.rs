//! Terminal front end
//!
//! A [`PeerDelegate`] that prints engine events, the peer table renderer and
//! the parser for interactive input lines.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;

use nearby_core::{
    EngineEvent, PeerDelegate, PeerId, PeerRecord, RadioState, SessionState, Timestamp,
};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Terminal Delegate
// ----------------------------------------------------------------------------

/// Prints engine events to stdout
///
/// Registered with a dedicated delivery thread, so printing never blocks the
/// engine worker.
#[derive(Debug, Default)]
pub struct TerminalDelegate {
    /// Display names of visible peers, for labelling messages
    names: Mutex<HashMap<PeerId, String>>,
}

impl TerminalDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    fn label(&self, peer_id: PeerId) -> String {
        let names = self.names.lock().unwrap_or_else(|p| p.into_inner());
        match names.get(&peer_id) {
            Some(name) => format!("{} ({})", name, short_id(peer_id)),
            None => short_id(peer_id),
        }
    }

    /// Line printed for an event; `None` for events too noisy to print
    pub fn render(&self, event: &EngineEvent) -> Option<String> {
        match event {
            EngineEvent::PeerDiscovered { peer, .. } => Some(format!(
                "+ {} {} at {:.0} dBm",
                display_name(peer),
                short_id(peer.peer_id),
                peer.signal
            )),
            EngineEvent::PeerUpdated { .. } => None,
            EngineEvent::PeerLost { peer_id, .. } => Some(format!("- {} left", self.label(*peer_id))),
            EngineEvent::SessionStateChanged { peer_id, state } => match state {
                SessionState::Active => Some(format!("* session with {} open", self.label(*peer_id))),
                SessionState::Closed => {
                    Some(format!("* session with {} closed", self.label(*peer_id)))
                }
                _ => None,
            },
            EngineEvent::MessageReceived(message) => Some(format!(
                "[{}] {}: {}",
                clock_time(message.timestamp),
                self.label(message.sender),
                String::from_utf8_lossy(&message.payload)
            )),
            EngineEvent::RadioStateChanged(state) => Some(format!("! radio {}", radio_state(*state))),
        }
    }
}

impl PeerDelegate for TerminalDelegate {
    fn on_peers_changed(&self, snapshot: &[PeerRecord]) {
        let mut names = self.names.lock().unwrap_or_else(|p| p.into_inner());
        names.clear();
        names.extend(
            snapshot
                .iter()
                .map(|peer| (peer.peer_id, peer.identity.display_name().to_string())),
        );
    }

    fn on_message_received(&self, _peer_id: PeerId, _payload: &[u8], _timestamp: Timestamp) {}

    fn on_event(&self, event: &EngineEvent) {
        // Lost peers are labelled before their name is forgotten
        if let Some(line) = self.render(event) {
            println!("{}", line);
        }
        match event {
            EngineEvent::PeerDiscovered { snapshot, .. }
            | EngineEvent::PeerUpdated { snapshot, .. }
            | EngineEvent::PeerLost { snapshot, .. } => self.on_peers_changed(snapshot),
            _ => {}
        }
    }
}

// ----------------------------------------------------------------------------
// Formatting
// ----------------------------------------------------------------------------

fn short_id(peer_id: PeerId) -> String {
    peer_id.to_string()[..8].to_string()
}

fn display_name(peer: &PeerRecord) -> &str {
    match peer.identity.display_name() {
        "" => "<unnamed>",
        name => name,
    }
}

fn radio_state(state: RadioState) -> &'static str {
    match state {
        RadioState::Running => "running",
        RadioState::Suspended => "suspended",
        RadioState::Unavailable => "unavailable (use /restart once Bluetooth is back)",
        RadioState::Stopped => "stopped",
    }
}

/// UTC wall-clock time of a millisecond timestamp
fn clock_time(timestamp: Timestamp) -> String {
    let secs = timestamp.as_millis() / 1_000 % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3_600, secs / 60 % 60, secs % 60)
}

/// Render the visible peers as a table, strongest signal first
pub fn format_peer_table(peers: &[PeerRecord]) -> String {
    if peers.is_empty() {
        return "No peers in range".to_string();
    }

    let mut table = format!(
        "{:<16}  {:<8}  {:>6}  {:<11}  {}\n",
        "PEER ID", "NAME", "DBM", "STATE", "LOCATION"
    );
    for peer in peers {
        let location = peer
            .identity
            .coordinate()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            table,
            "{:<16}  {:<8}  {:>6.1}  {:<11}  {}",
            peer.peer_id,
            display_name(peer),
            peer.signal,
            peer.session_state.to_string(),
            location
        );
    }
    table.pop();
    table
}

/// Find a visible peer by display name or peer id prefix
pub fn resolve_peer(peers: &[PeerRecord], query: &str) -> Result<PeerId> {
    let query = query.trim();
    if query.is_empty() {
        return Err(CliError::UnknownPeer("empty peer name".to_string()));
    }
    let by_name: Vec<_> = peers
        .iter()
        .filter(|p| p.identity.display_name() == query)
        .collect();
    let matches: Vec<&PeerRecord> = if by_name.is_empty() {
        let prefix = query.to_ascii_lowercase();
        peers
            .iter()
            .filter(|p| p.peer_id.to_string().starts_with(&prefix))
            .collect()
    } else {
        by_name
    };

    match matches.as_slice() {
        [peer] => Ok(peer.peer_id),
        [] => Err(CliError::UnknownPeer(query.to_string())),
        _ => Err(CliError::UnknownPeer(format!(
            "{} is ambiguous ({} matches); use more of the peer id",
            query,
            matches.len()
        ))),
    }
}

// ----------------------------------------------------------------------------
// Interactive Input
// ----------------------------------------------------------------------------

/// One line of interactive input
#[derive(Debug, Clone, PartialEq)]
pub enum InputCommand {
    Empty,
    Help,
    Peers,
    Send { peer: String, text: String },
    Close { peer: String },
    Stats,
    Rotate,
    /// `None` stops advertising a location
    Location(Option<(f64, f64)>),
    Restart,
    Quit,
}

pub const HELP: &str = "\
Commands:
  /peers                  list visible peers
  /send <peer> <text>     send a message (peer by name or id prefix)
  /close <peer>           close the session with a peer
  /stats                  show engine statistics
  /rotate                 rotate the advertised identity token
  /location <lat> <lon>   advertise a location (/location off to clear)
  /restart                restart the radio after Bluetooth comes back
  /quit                   stop and exit";

impl InputCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(InputCommand::Empty);
        }
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        let parsed = match command {
            "/help" | "/?" => InputCommand::Help,
            "/peers" | "/list" => InputCommand::Peers,
            "/send" | "/msg" => {
                let (peer, text) = rest
                    .split_once(char::is_whitespace)
                    .map(|(peer, text)| (peer, text.trim()))
                    .filter(|(_, text)| !text.is_empty())
                    .ok_or_else(|| CliError::InvalidCommand("usage: /send <peer> <text>".into()))?;
                InputCommand::Send {
                    peer: peer.to_string(),
                    text: text.to_string(),
                }
            }
            "/close" if !rest.is_empty() => InputCommand::Close {
                peer: rest.to_string(),
            },
            "/close" => return Err(CliError::InvalidCommand("usage: /close <peer>".into())),
            "/stats" => InputCommand::Stats,
            "/rotate" => InputCommand::Rotate,
            "/location" => InputCommand::Location(parse_location(rest)?),
            "/restart" => InputCommand::Restart,
            "/quit" | "/exit" => InputCommand::Quit,
            other => {
                return Err(CliError::InvalidCommand(format!(
                    "unknown command {:?}, try /help",
                    other
                )))
            }
        };
        Ok(parsed)
    }
}

fn parse_location(args: &str) -> Result<Option<(f64, f64)>> {
    if args == "off" {
        return Ok(None);
    }
    let usage = || CliError::InvalidCommand("usage: /location <lat> <lon> | off".into());
    let mut parts = args.split_whitespace();
    let (Some(lat), Some(lon), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(usage());
    };
    let lat = lat.parse().map_err(|_| usage())?;
    let lon = lon.parse().map_err(|_| usage())?;
    Ok(Some((lat, lon)))
}
