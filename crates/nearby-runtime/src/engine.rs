//! Engine worker
//!
//! One task owns the role scheduler (and through it the radio), the peer
//! registry and the session bookkeeping. Everything that mutates them arrives
//! here as a message: UI commands, radio events, session reports and timer
//! ticks. The worker never awaits a delegate or a transport.

use std::sync::Arc;

use nearby_core::{
    Connector, Coordinate, EngineConfig, EngineError, EngineEvent, IdentityToken, PeerId,
    PeerIdentity, PeerSnapshot, Radio, RadioError, RadioEvent, RadioState, SessionState,
    TimeSource, Timestamp,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use crate::dispatcher::EventSink;
use crate::managers::{SessionManager, SessionOutcome, SessionStats};
use crate::registry::{PeerRegistry, RegistryChange, RegistryStats};
use crate::scheduler::{RoleScheduler, RoleTransition, SchedulerStats};
use crate::tasks::SessionReport;

// ----------------------------------------------------------------------------
// Runtime Clock
// ----------------------------------------------------------------------------

/// Wall-clock timestamps that advance with the tokio clock
///
/// Timestamps start at the wall-clock time of creation and then follow
/// `tokio::time::Instant`, so paused-time tests are deterministic.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeClock {
    base: Timestamp,
    origin: Instant,
}

impl RuntimeClock {
    pub fn new() -> Self {
        Self {
            base: Timestamp::now(),
            origin: Instant::now(),
        }
    }

    /// Tokio instant corresponding to a timestamp from this clock
    pub fn instant_at(&self, at: Timestamp) -> Instant {
        self.origin + Duration::from_millis(at - self.base)
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for RuntimeClock {
    fn now(&self) -> Timestamp {
        self.base + self.origin.elapsed().as_millis() as u64
    }
}

// ----------------------------------------------------------------------------
// Commands and Statistics
// ----------------------------------------------------------------------------

/// Requests from the [`Engine`](crate::Engine) handle to the worker
pub(crate) enum EngineCommand {
    SendMessage {
        peer_id: PeerId,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    CloseSession {
        peer_id: PeerId,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
    RestartRadio {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SetLocation {
        coordinate: Option<Coordinate>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    RotateIdentity {
        reply: oneshot::Sender<Result<IdentityToken, EngineError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Point-in-time engine statistics
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    pub local_identity: PeerIdentity,
    pub radio_state: RadioState,
    pub visible_peers: usize,
    pub active_sessions: usize,
    pub scheduler: SchedulerStats,
    pub registry: RegistryStats,
    pub sessions: SessionStats,
    /// `PeerUpdated` events lost to delegate backpressure
    pub dropped_events: u64,
}

// ----------------------------------------------------------------------------
// Engine Worker
// ----------------------------------------------------------------------------

pub(crate) struct EngineWorker {
    config: EngineConfig,
    clock: RuntimeClock,
    identity: PeerIdentity,
    scheduler: RoleScheduler,
    registry: PeerRegistry,
    sessions: SessionManager,
    connector: Arc<dyn Connector>,
    sink: EventSink,
    snapshot: watch::Sender<PeerSnapshot>,
    commands: mpsc::Receiver<EngineCommand>,
    radio_events: Option<mpsc::Receiver<RadioEvent>>,
    reports: mpsc::UnboundedReceiver<SessionReport>,
    radio_state: RadioState,
    next_sweep: Timestamp,
    next_rotation: Option<Timestamp>,
}

impl EngineWorker {
    pub fn new(
        config: EngineConfig,
        radio: Box<dyn Radio>,
        identity: PeerIdentity,
        sink: EventSink,
        snapshot: watch::Sender<PeerSnapshot>,
        commands: mpsc::Receiver<EngineCommand>,
    ) -> Self {
        let clock = RuntimeClock::new();
        let mut scheduler = RoleScheduler::new(radio, config.scheduler.clone(), &identity);
        let radio_events = scheduler.take_events();
        let connector = scheduler.connector();
        let (sessions, reports) = SessionManager::new(config.session.clone());
        let now = clock.now();

        Self {
            registry: PeerRegistry::new(config.registry.clone()),
            next_sweep: now.after(config.registry.sweep_interval()),
            next_rotation: config.scheduler.identity_rotation().map(|every| now.after(every)),
            config,
            clock,
            identity,
            scheduler,
            sessions,
            connector,
            sink,
            snapshot,
            commands,
            radio_events,
            reports,
            radio_state: RadioState::Stopped,
        }
    }

    /// Start the duty cycle. A radio that cannot be acquired leaves the worker
    /// running in the unavailable state.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        let now = self.clock.now();
        info!(
            "Starting engine as {} ({})",
            self.identity.peer_id(),
            self.identity.display_name()
        );
        match self.scheduler.start(now).await {
            Ok(()) => {
                self.set_radio_state(RadioState::Running);
                Ok(())
            }
            Err(err) => {
                self.radio_unavailable(&err);
                Err(err.into())
            }
        }
    }

    /// Worker loop; returns after a `Stop` command or when the handle is dropped
    pub async fn run(mut self) {
        loop {
            let wake = self.clock.instant_at(self.next_wake());

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(EngineCommand::Stop { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("Engine handle dropped, shutting down");
                        self.shutdown().await;
                        return;
                    }
                },
                event = next_radio_event(&mut self.radio_events) => match event {
                    Some(event) => self.handle_radio_event(event).await,
                    None => {
                        warn!("Radio event stream ended");
                        self.radio_events = None;
                    }
                },
                Some(report) = self.reports.recv() => self.handle_report(report),
                _ = sleep_until(wake) => self.on_tick().await,
            }
        }
    }

    fn next_wake(&self) -> Timestamp {
        [self.scheduler.next_deadline(), self.next_rotation]
            .into_iter()
            .flatten()
            .fold(self.next_sweep, Timestamp::min)
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    async fn on_tick(&mut self) {
        let now = self.clock.now();

        if self.scheduler.next_deadline().is_some_and(|deadline| deadline <= now) {
            match self.scheduler.on_timer(now).await {
                Ok(RoleTransition::ScanEnded) => {
                    self.flush_changes();
                    self.promote(now);
                }
                Ok(_) => {}
                Err(err) => self.radio_unavailable(&err),
            }
        }

        if self.next_sweep <= now {
            self.sweep(now);
            self.next_sweep = now.after(self.config.registry.sweep_interval());
        }

        if self.next_rotation.is_some_and(|at| at <= now) {
            if let Err(err) = self.rotate_identity(now).await {
                warn!("Identity rotation failed: {}", err);
            }
        }
    }

    /// Evict expired peers. Discoveries and updates stay pending until the
    /// scan window ends, so one duty cycle yields at most one event per peer.
    fn sweep(&mut self, now: Timestamp) {
        let evicted = self.registry.sweep(now);
        if !evicted.is_empty() {
            let snapshot = self.registry.snapshot();
            for record in &evicted {
                if let Some(outcome) = self.sessions.on_peer_evicted(record.peer_id) {
                    self.emit_outcome(outcome);
                }
                info!(
                    "Lost peer {} ({})",
                    record.peer_id,
                    record.identity.display_name()
                );
                self.sink.emit(EngineEvent::PeerLost {
                    peer_id: record.peer_id,
                    snapshot: snapshot.clone(),
                });
            }
            self.publish();
        }
    }

    /// Turn pending registry changes into peer events
    fn flush_changes(&mut self) {
        let changes = self.registry.take_changes();
        if changes.is_empty() {
            return;
        }

        let snapshot = self.registry.snapshot();
        for change in changes {
            let Some(peer) = self.registry.get(&change.peer_id()).cloned() else {
                continue;
            };
            let event = match change {
                RegistryChange::Discovered(_) => {
                    info!(
                        "Discovered peer {} ({}) at {:.1} dBm",
                        peer.peer_id,
                        peer.identity.display_name(),
                        peer.signal
                    );
                    EngineEvent::PeerDiscovered {
                        peer,
                        snapshot: snapshot.clone(),
                    }
                }
                RegistryChange::Updated(_) => EngineEvent::PeerUpdated {
                    peer,
                    snapshot: snapshot.clone(),
                },
            };
            self.sink.emit(event);
        }
        self.snapshot.send_replace(snapshot);
    }

    fn promote(&mut self, now: Timestamp) {
        if !matches!(self.radio_state, RadioState::Running | RadioState::Suspended) {
            return;
        }
        let outcomes = self.sessions.promote_candidates(
            &mut self.registry,
            self.identity.token(),
            &self.connector,
            now,
        );
        if !outcomes.is_empty() {
            for outcome in outcomes {
                self.emit_outcome(outcome);
            }
            self.publish();
        }
    }

    async fn rotate_identity(&mut self, now: Timestamp) -> Result<IdentityToken, EngineError> {
        let token = IdentityToken::generate();
        self.identity = self.identity.rotated(token);
        self.next_rotation = self
            .config
            .scheduler
            .identity_rotation()
            .map(|every| now.after(every));
        info!("Rotated identity token to {}", token);

        if let Err(err) = self.scheduler.update_identity(&self.identity).await {
            self.radio_unavailable(&err);
            return Err(err.into());
        }
        Ok(token)
    }

    // ------------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: EngineCommand) {
        let now = self.clock.now();
        match command {
            EngineCommand::SendMessage {
                peer_id,
                payload,
                reply,
            } => {
                let result = self.sessions.send_message(peer_id, payload, now);
                if let Err(err) = &result {
                    debug!("Send to {} rejected: {}", peer_id, err);
                }
                let _ = reply.send(result);
            }
            EngineCommand::CloseSession { peer_id, reply } => {
                let result = match self.sessions.close(peer_id, &mut self.registry, now) {
                    Some(outcome) => {
                        self.emit_outcome(outcome);
                        self.publish();
                        Ok(())
                    }
                    None => Err(EngineError::PeerNotActive { peer_id }),
                };
                let _ = reply.send(result);
            }
            EngineCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            EngineCommand::RestartRadio { reply } => {
                info!("Restarting radio");
                let result = match self.scheduler.restart(now).await {
                    Ok(()) => {
                        self.set_radio_state(RadioState::Running);
                        Ok(())
                    }
                    Err(err) => {
                        self.radio_unavailable(&err);
                        Err(err.into())
                    }
                };
                let _ = reply.send(result);
            }
            EngineCommand::SetLocation { coordinate, reply } => {
                self.identity = self.identity.with_coordinate(coordinate);
                let result = match self.scheduler.update_identity(&self.identity).await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        self.radio_unavailable(&err);
                        Err(err.into())
                    }
                };
                let _ = reply.send(result);
            }
            EngineCommand::RotateIdentity { reply } => {
                let _ = reply.send(self.rotate_identity(now).await);
            }
            EngineCommand::Stop { reply } => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    async fn handle_radio_event(&mut self, event: RadioEvent) {
        let now = self.clock.now();
        match event {
            RadioEvent::Advertisement(raw) => {
                if let Some(sighting) = self.scheduler.decode(&raw, now) {
                    self.registry.observe(sighting);
                }
            }
            RadioEvent::Incoming(transport) => {
                debug!("Incoming connection");
                self.sessions.spawn_responder(transport);
            }
            RadioEvent::BackgroundRevoked => {
                info!("Background execution revoked, suspending discovery");
                match self.scheduler.suspend(now).await {
                    Ok(()) => self.set_radio_state(self.scheduler.state().radio_state()),
                    Err(err) => self.radio_unavailable(&err),
                }
            }
            RadioEvent::BackgroundRestored => {
                info!("Background execution restored, resuming discovery");
                match self.scheduler.resume(now).await {
                    Ok(()) => self.set_radio_state(self.scheduler.state().radio_state()),
                    Err(err) => self.radio_unavailable(&err),
                }
            }
            RadioEvent::PoweredOff => {
                self.scheduler.halt().await;
                self.radio_unavailable(&RadioError::Unavailable("adapter powered off".into()));
            }
            RadioEvent::PoweredOn => {
                info!("Bluetooth adapter powered on; restart the radio to resume");
            }
        }
    }

    fn handle_report(&mut self, report: SessionReport) {
        let now = self.clock.now();
        match report {
            SessionReport::Progress {
                peer_id,
                generation,
                progress,
            } => {
                if let Some(outcome) =
                    self.sessions
                        .handle_progress(peer_id, generation, progress, &mut self.registry, now)
                {
                    let state_changed = matches!(outcome, SessionOutcome::StateChanged { .. });
                    self.emit_outcome(outcome);
                    if state_changed {
                        self.publish();
                    }
                }
            }
            SessionReport::InboundHello { token, reply } => {
                let local_token = self.identity.token();
                let decision =
                    self.sessions
                        .accept_inbound(token, &mut self.registry, local_token, now);
                let accepted = decision.as_ref().ok().map(|grant| grant.peer_id);
                if let Some(peer_id) = accepted {
                    self.emit_outcome(SessionOutcome::StateChanged {
                        peer_id,
                        state: SessionState::Handshaking,
                    });
                }

                if reply.send(decision).is_err() {
                    // Responder went away between hello and decision
                    if let Some(peer_id) = accepted {
                        if let Some(outcome) = self.sessions.close(peer_id, &mut self.registry, now) {
                            self.emit_outcome(outcome);
                        }
                    }
                }
                if accepted.is_some() {
                    self.publish();
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Outputs
    // ------------------------------------------------------------------------

    fn emit_outcome(&self, outcome: SessionOutcome) {
        let event = match outcome {
            SessionOutcome::StateChanged { peer_id, state } => {
                EngineEvent::SessionStateChanged { peer_id, state }
            }
            SessionOutcome::MessageReceived(message) => EngineEvent::MessageReceived(message),
        };
        self.sink.emit(event);
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.registry.snapshot());
    }

    fn set_radio_state(&mut self, state: RadioState) {
        if self.radio_state != state {
            self.radio_state = state;
            self.sink.emit(EngineEvent::RadioStateChanged(state));
        }
    }

    fn radio_unavailable(&mut self, err: &RadioError) {
        warn!("Bluetooth unavailable: {}", err);
        self.set_radio_state(RadioState::Unavailable);
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            local_identity: self.identity.clone(),
            radio_state: self.radio_state,
            visible_peers: self.registry.len(),
            active_sessions: self.sessions.active_count(),
            scheduler: self.scheduler.stats().clone(),
            registry: self.registry.stats().clone(),
            sessions: self.sessions.stats().clone(),
            dropped_events: self.sink.dropped(),
        }
    }

    /// Close sessions, stop the radio and announce the stop
    async fn shutdown(&mut self) {
        info!("Stopping engine");
        let outcomes = self.sessions.shutdown(&mut self.registry).await;
        for outcome in outcomes {
            self.emit_outcome(outcome);
        }
        self.scheduler.stop().await;
        self.set_radio_state(RadioState::Stopped);
        self.publish();
        info!("Engine stopped");
    }
}

async fn next_radio_event(events: &mut Option<mpsc::Receiver<RadioEvent>>) -> Option<RadioEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
