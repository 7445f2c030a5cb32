//! Session manager
//!
//! Bookkeeping for per-peer sessions, owned by the engine worker. The manager
//! decides which registry records get promoted, spawns the session tasks and
//! applies their progress reports. Registry state follows session state, never
//! the other way round: an evicted record takes its session with it.

use std::collections::HashMap;
use std::sync::Arc;

use nearby_core::{
    Connector, EngineError, IdentityToken, Message, PeerId, SessionConfig, SessionError,
    SessionState, Timestamp, Transport,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::registry::PeerRegistry;
use crate::tasks::{
    run_initiator, run_responder, CloseReason, InboundGrant, SessionCommand, SessionLink,
    SessionProgress, SessionReport, TaskContext,
};

/// Whether the local node dials `remote`. Exactly one side of every pair
/// initiates, so two nodes never connect to each other at the same time.
pub fn initiates(local: &IdentityToken, remote: &IdentityToken) -> bool {
    local.peer_id() < remote.peer_id()
}

// ----------------------------------------------------------------------------
// Session Entries
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug)]
struct SessionEntry {
    generation: u64,
    state: SessionState,
    direction: Direction,
    commands: mpsc::Sender<SessionCommand>,
}

/// Something the worker has to tell delegates about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    StateChanged {
        peer_id: PeerId,
        state: SessionState,
    },
    MessageReceived(Message),
}

/// Session counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub promoted: u64,
    pub accepted: u64,
    pub established: u64,
    pub handshake_failures: u64,
    pub closed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

// ----------------------------------------------------------------------------
// Session Manager
// ----------------------------------------------------------------------------

pub struct SessionManager {
    config: SessionConfig,
    context: TaskContext,
    shutdown: watch::Sender<bool>,
    sessions: HashMap<PeerId, SessionEntry>,
    /// Peers that may not be promoted before the given time
    cooldowns: HashMap<PeerId, Timestamp>,
    tasks: Vec<JoinHandle<()>>,
    next_generation: u64,
    stats: SessionStats,
}

impl SessionManager {
    /// Create a manager and the receiver its session tasks report to
    pub fn new(config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<SessionReport>) {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let context = TaskContext::new(&config, reports_tx, shutdown_rx);

        let manager = Self {
            config,
            context,
            shutdown,
            sessions: HashMap::new(),
            cooldowns: HashMap::new(),
            tasks: Vec::new(),
            next_generation: 0,
            stats: SessionStats::default(),
        };
        (manager, reports_rx)
    }

    /// Promote every eligible `Discovered` record, strongest signal first
    pub fn promote_candidates(
        &mut self,
        registry: &mut PeerRegistry,
        local_token: IdentityToken,
        connector: &Arc<dyn Connector>,
        now: Timestamp,
    ) -> Vec<SessionOutcome> {
        self.cooldowns.retain(|_, until| *until > now);
        self.tasks.retain(|task| !task.is_finished());

        let threshold = self.config.promotion_rssi_threshold as f32;
        let mut outcomes = Vec::new();

        for record in registry.snapshot().iter() {
            if self.sessions.len() >= self.config.max_sessions {
                trace!("Session limit reached, deferring promotions");
                break;
            }
            if record.session_state != SessionState::Discovered
                || record.signal < threshold
                || self.sessions.contains_key(&record.peer_id)
                || self.cooldowns.contains_key(&record.peer_id)
                || !initiates(&local_token, &record.identity.token())
            {
                continue;
            }

            let peer_id = record.peer_id;
            let (generation, commands) = self.open(peer_id, SessionState::Connecting, Direction::Outbound);
            let link = SessionLink::new(self.context.clone(), peer_id, generation);
            self.tasks.push(tokio::spawn(run_initiator(
                link,
                commands,
                connector.clone(),
                record.device.clone(),
                record.identity.token(),
                local_token,
            )));

            registry.set_session_state(peer_id, SessionState::Connecting);
            self.stats.promoted += 1;
            info!(
                "Promoting peer {} ({}) at {:.1} dBm",
                peer_id,
                record.identity.display_name(),
                record.signal
            );
            outcomes.push(SessionOutcome::StateChanged {
                peer_id,
                state: SessionState::Connecting,
            });
        }
        outcomes
    }

    /// Drive an incoming transport with a responder task
    pub fn spawn_responder(&mut self, transport: Box<dyn Transport>) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks
            .push(tokio::spawn(run_responder(self.context.clone(), transport)));
    }

    /// Decide on an inbound `Hello` carrying `token`
    ///
    /// The token must belong to a visible record without a session, and the
    /// remote must be the side that initiates.
    pub fn accept_inbound(
        &mut self,
        token: IdentityToken,
        registry: &mut PeerRegistry,
        local_token: IdentityToken,
        now: Timestamp,
    ) -> Result<InboundGrant, SessionError> {
        let reject = |reason: &str| SessionError::Rejected {
            reason: reason.to_string(),
        };

        let peer_id = registry
            .resolve(&token)
            .ok_or_else(|| reject("unknown token"))?;
        if self.sessions.contains_key(&peer_id) {
            return Err(reject("session already exists"));
        }
        if !initiates(&token, &local_token) {
            return Err(reject("local node initiates with this peer"));
        }
        if self.sessions.len() >= self.config.max_sessions {
            return Err(reject("session limit reached"));
        }
        if self.cooldowns.get(&peer_id).is_some_and(|until| *until > now) {
            return Err(reject("peer in cooldown"));
        }

        let (generation, commands) = self.open(peer_id, SessionState::Handshaking, Direction::Inbound);
        registry.set_session_state(peer_id, SessionState::Handshaking);
        self.stats.accepted += 1;
        info!("Accepted inbound session from {}", peer_id);
        Ok(InboundGrant {
            peer_id,
            generation,
            local_token,
            commands,
        })
    }

    /// Apply a progress report. Reports from closed or replaced sessions are
    /// ignored.
    pub fn handle_progress(
        &mut self,
        peer_id: PeerId,
        generation: u64,
        progress: SessionProgress,
        registry: &mut PeerRegistry,
        now: Timestamp,
    ) -> Option<SessionOutcome> {
        let Some(entry) = self.sessions.get_mut(&peer_id) else {
            trace!("Ignoring report for closed session with {}", peer_id);
            return None;
        };
        if entry.generation != generation {
            trace!("Ignoring report from stale session with {}", peer_id);
            return None;
        }

        let state = match progress {
            SessionProgress::Connected => {
                entry.state = SessionState::Handshaking;
                SessionState::Handshaking
            }
            SessionProgress::Established => {
                entry.state = SessionState::Active;
                self.stats.established += 1;
                info!("Session with {} active ({:?})", peer_id, entry.direction);
                SessionState::Active
            }
            SessionProgress::ConnectFailed(err) => {
                warn!("Connecting to {} failed: {}", peer_id, err);
                self.fail(peer_id, now);
                SessionState::Discovered
            }
            SessionProgress::HandshakeFailed(err) => {
                warn!("Handshake with {} failed: {}", peer_id, err);
                self.fail(peer_id, now);
                SessionState::Discovered
            }
            SessionProgress::Message { payload, timestamp } => {
                if entry.state != SessionState::Active {
                    return None;
                }
                self.stats.messages_received += 1;
                return Some(SessionOutcome::MessageReceived(Message {
                    sender: peer_id,
                    payload,
                    timestamp,
                }));
            }
            SessionProgress::Closed(reason) => {
                self.sessions.remove(&peer_id);
                self.stats.closed += 1;
                debug!("Session with {} ended ({:?})", peer_id, reason);
                if reason == CloseReason::Error {
                    self.cooldowns.insert(peer_id, now.after(self.config.handshake_cooldown()));
                }
                SessionState::Closed
            }
        };

        registry.set_session_state(peer_id, state);
        Some(SessionOutcome::StateChanged { peer_id, state })
    }

    /// Queue a message on an active session. Never waits.
    pub fn send_message(
        &mut self,
        peer_id: PeerId,
        payload: Vec<u8>,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        let entry = self
            .sessions
            .get(&peer_id)
            .filter(|entry| entry.state == SessionState::Active)
            .ok_or(EngineError::PeerNotActive { peer_id })?;

        if payload.len() > self.config.max_payload_size {
            return Err(EngineError::PayloadTooLarge {
                size: payload.len(),
                max_size: self.config.max_payload_size,
            });
        }

        let command = SessionCommand::Send {
            payload,
            timestamp: now,
        };
        match entry.commands.try_send(command) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(EngineError::SendQueueFull { peer_id }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::PeerNotActive { peer_id }),
        }
    }

    /// Close a session on request. The peer is not promoted again until the
    /// cooldown elapses.
    pub fn close(
        &mut self,
        peer_id: PeerId,
        registry: &mut PeerRegistry,
        now: Timestamp,
    ) -> Option<SessionOutcome> {
        let entry = self.sessions.remove(&peer_id)?;
        let _ = entry.commands.try_send(SessionCommand::Close);
        self.cooldowns.insert(peer_id, now.after(self.config.handshake_cooldown()));
        self.stats.closed += 1;
        registry.set_session_state(peer_id, SessionState::Closed);
        Some(SessionOutcome::StateChanged {
            peer_id,
            state: SessionState::Closed,
        })
    }

    /// Tear down the session of a record the registry just evicted
    pub fn on_peer_evicted(&mut self, peer_id: PeerId) -> Option<SessionOutcome> {
        self.cooldowns.remove(&peer_id);
        let entry = self.sessions.remove(&peer_id)?;
        // A full queue still ends the task once the sender is dropped
        let _ = entry.commands.try_send(SessionCommand::Close);
        self.stats.closed += 1;
        debug!("Closing session with evicted peer {}", peer_id);
        Some(SessionOutcome::StateChanged {
            peer_id,
            state: SessionState::Closed,
        })
    }

    /// Signal every session to close and wait for the tasks, aborting any
    /// that outlive the close timeout
    pub async fn shutdown(&mut self, registry: &mut PeerRegistry) -> Vec<SessionOutcome> {
        self.shutdown.send_replace(true);

        let mut outcomes = Vec::with_capacity(self.sessions.len());
        let mut peers: Vec<PeerId> = self.sessions.drain().map(|(peer_id, _)| peer_id).collect();
        peers.sort();
        for peer_id in peers {
            registry.set_session_state(peer_id, SessionState::Closed);
            self.stats.closed += 1;
            outcomes.push(SessionOutcome::StateChanged {
                peer_id,
                state: SessionState::Closed,
            });
        }

        let deadline = Instant::now() + self.config.close_timeout();
        let mut aborted = 0;
        for mut task in self.tasks.drain(..) {
            if timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!("Aborted {} session task(s) after the close timeout", aborted);
        }
        outcomes
    }

    pub fn session_state(&self, peer_id: &PeerId) -> Option<SessionState> {
        self.sessions.get(peer_id).map(|entry| entry.state)
    }

    pub fn direction(&self, peer_id: &PeerId) -> Option<Direction> {
        self.sessions.get(peer_id).map(|entry| entry.direction)
    }

    /// Peers with a live session
    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.sessions.keys()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|entry| entry.state == SessionState::Active)
            .count()
    }

    pub fn in_cooldown(&self, peer_id: &PeerId, now: Timestamp) -> bool {
        self.cooldowns.get(peer_id).is_some_and(|until| *until > now)
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    fn open(
        &mut self,
        peer_id: PeerId,
        state: SessionState,
        direction: Direction,
    ) -> (u64, mpsc::Receiver<SessionCommand>) {
        self.next_generation += 1;
        let (commands_tx, commands_rx) = mpsc::channel(self.config.outbound_queue);
        self.sessions.insert(
            peer_id,
            SessionEntry {
                generation: self.next_generation,
                state,
                direction,
                commands: commands_tx,
            },
        );
        (self.next_generation, commands_rx)
    }

    fn fail(&mut self, peer_id: PeerId, now: Timestamp) {
        self.sessions.remove(&peer_id);
        self.stats.handshake_failures += 1;
        self.cooldowns
            .insert(peer_id, now.after(self.config.handshake_cooldown()));
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
