//! Engine Builder API
//!
//! Provides a builder-style API for consumers (CLI, host applications, tests)
//! to inject the radio capability and register delegates, and the [`Engine`]
//! handle used to drive the running engine.

use std::sync::Arc;

use nearby_core::{
    Coordinate, EngineConfig, EngineError, IdentityToken, NearbyResult, PeerDelegate, PeerId,
    PeerIdentity, PeerSnapshot, Radio,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatcher::{DeliveryContext, EventDispatcher};
use crate::engine::{EngineCommand, EngineStats, EngineWorker};

/// Depth of the command queue between the handle and the worker
const COMMAND_QUEUE: usize = 64;

// ----------------------------------------------------------------------------
// Engine Builder
// ----------------------------------------------------------------------------

/// Builder for a Nearby engine
pub struct EngineBuilder {
    radio: Box<dyn Radio>,
    config: EngineConfig,
    display_name: String,
    coordinate: Option<Coordinate>,
    token: Option<IdentityToken>,
    delegates: Vec<(Arc<dyn PeerDelegate>, DeliveryContext)>,
}

impl EngineBuilder {
    /// Create a builder around the platform radio
    pub fn new(radio: impl Radio + 'static) -> Self {
        Self {
            radio: Box::new(radio),
            config: EngineConfig::default(),
            display_name: String::new(),
            coordinate: None,
            token: None,
            delegates: Vec::new(),
        }
    }

    /// Set the engine configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Name advertised to nearby peers (truncated to the payload limit)
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Coordinate advertised to nearby peers
    pub fn with_coordinate(mut self, coordinate: Option<Coordinate>) -> Self {
        self.coordinate = coordinate;
        self
    }

    /// Use a fixed identity token instead of a random one
    pub fn with_token(mut self, token: IdentityToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Register a delegate and the context its callbacks run on
    pub fn add_delegate(mut self, delegate: Arc<dyn PeerDelegate>, context: DeliveryContext) -> Self {
        self.delegates.push((delegate, context));
        self
    }

    /// Validate the configuration and build a stopped engine
    pub fn build(self) -> NearbyResult<Engine> {
        self.config.validate()?;

        let token = self.token.unwrap_or_else(IdentityToken::generate);
        let identity = PeerIdentity::new(token, &self.display_name, self.coordinate);
        let (snapshot_tx, snapshot_rx) = watch::channel(PeerSnapshot::from(Vec::new()));

        Ok(Engine {
            identity: identity.clone(),
            snapshot: snapshot_rx,
            state: EngineState::Ready(Box::new(Pending {
                config: self.config,
                radio: self.radio,
                identity,
                delegates: self.delegates,
                snapshot: snapshot_tx,
            })),
        })
    }

    /// Build and start in one go
    ///
    /// An unavailable radio is an error here; use [`Engine::start`] to keep an
    /// engine that waits for [`Engine::restart_radio`].
    pub async fn build_and_start(self) -> NearbyResult<Engine> {
        let mut engine = self.build()?;
        engine.start().await?;
        Ok(engine)
    }
}

// ----------------------------------------------------------------------------
// Engine Handle
// ----------------------------------------------------------------------------

struct Pending {
    config: EngineConfig,
    radio: Box<dyn Radio>,
    identity: PeerIdentity,
    delegates: Vec<(Arc<dyn PeerDelegate>, DeliveryContext)>,
    snapshot: watch::Sender<PeerSnapshot>,
}

struct Running {
    commands: mpsc::Sender<EngineCommand>,
    worker: JoinHandle<()>,
    dispatcher: EventDispatcher,
}

enum EngineState {
    Ready(Box<Pending>),
    Running(Running),
    Stopped,
}

/// Handle to a Nearby engine
///
/// An engine runs at most once: after [`Engine::stop`] it cannot be started
/// again.
pub struct Engine {
    identity: PeerIdentity,
    snapshot: watch::Receiver<PeerSnapshot>,
    state: EngineState,
}

impl Engine {
    /// Start delivery workers, the engine worker and the duty cycle
    ///
    /// When the radio cannot be acquired the engine still starts, reports
    /// `RadioState::Unavailable` to delegates and returns
    /// [`EngineError::RadioUnavailable`]; [`Engine::restart_radio`] retries.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        let pending = match std::mem::replace(&mut self.state, EngineState::Stopped) {
            EngineState::Ready(pending) => pending,
            running @ EngineState::Running(_) => {
                self.state = running;
                return Err(EngineError::AlreadyRunning);
            }
            EngineState::Stopped => return Err(EngineError::NotRunning),
        };
        let Pending {
            config,
            radio,
            identity,
            delegates,
            snapshot,
        } = *pending;

        let dispatcher = EventDispatcher::start(delegates, config.dispatch.queue_capacity)
            .map_err(|e| EngineError::DeliveryFailed(e.to_string()))?;
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);

        let mut worker = EngineWorker::new(config, radio, identity, dispatcher.sink(), snapshot, commands_rx);
        let started = worker.start().await;
        let worker = tokio::spawn(worker.run());

        self.state = EngineState::Running(Running {
            commands: commands_tx,
            worker,
            dispatcher,
        });
        started
    }

    /// Close all sessions, release the radio and drain pending delegate events
    pub async fn stop(&mut self) -> Result<(), EngineError> {
        let running = match std::mem::replace(&mut self.state, EngineState::Stopped) {
            EngineState::Running(running) => running,
            ready @ EngineState::Ready(_) => {
                self.state = ready;
                return Err(EngineError::NotRunning);
            }
            EngineState::Stopped => return Ok(()),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if running
            .commands
            .send(EngineCommand::Stop { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
        if let Err(err) = running.worker.await {
            warn!("Engine worker failed: {}", err);
        }
        running.dispatcher.shutdown().await;
        info!("Nearby engine stopped");
        Ok(())
    }

    /// Queue a message for an active session
    pub async fn send_message(&self, peer_id: PeerId, payload: impl Into<Vec<u8>>) -> Result<(), EngineError> {
        let payload = payload.into();
        self.request(|reply| EngineCommand::SendMessage {
            peer_id,
            payload,
            reply,
        })
        .await?
    }

    /// Close the session with a peer
    pub async fn close_session(&self, peer_id: PeerId) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::CloseSession { peer_id, reply })
            .await?
    }

    /// Latest published registry snapshot. Never blocks.
    pub fn peers(&self) -> PeerSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that is notified whenever a new snapshot is published
    pub fn watch_peers(&self) -> watch::Receiver<PeerSnapshot> {
        self.snapshot.clone()
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        self.request(|reply| EngineCommand::Stats { reply }).await
    }

    /// Restart the duty cycle after the radio became available again
    pub async fn restart_radio(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::RestartRadio { reply })
            .await?
    }

    /// Advertise a new coordinate, or none
    pub async fn set_location(&self, coordinate: Option<Coordinate>) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::SetLocation { coordinate, reply })
            .await?
    }

    /// Switch to a fresh identity token and return it
    pub async fn rotate_identity(&self) -> Result<IdentityToken, EngineError> {
        self.request(|reply| EngineCommand::RotateIdentity { reply })
            .await?
    }

    /// Identity the engine was built with
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn is_running(&self) -> bool {
        match &self.state {
            EngineState::Running(running) => !running.worker.is_finished(),
            _ => false,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, EngineError> {
        let EngineState::Running(running) = &self.state else {
            return Err(EngineError::NotRunning);
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        running
            .commands
            .send(command(reply_tx))
            .await
            .map_err(|_| EngineError::NotRunning)?;
        reply_rx.await.map_err(|_| EngineError::NotRunning)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_core::RadioState;
    use nearby_harness::{MockRadio, RecordingDelegate};

    #[tokio::test]
    async fn test_engine_lifecycle() {
        let (radio, controller) = MockRadio::new();
        let delegate = Arc::new(RecordingDelegate::new());
        let mut engine = EngineBuilder::new(radio)
            .with_config(EngineConfig::testing())
            .with_display_name("alice")
            .add_delegate(delegate.clone(), DeliveryContext::Runtime)
            .build()
            .unwrap();

        assert!(!engine.is_running());
        assert_eq!(engine.stats().await.unwrap_err(), EngineError::NotRunning);
        assert_eq!(engine.stop().await, Err(EngineError::NotRunning));

        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert!(controller.is_acquired());
        assert_eq!(engine.start().await, Err(EngineError::AlreadyRunning));

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.radio_state, RadioState::Running);
        assert_eq!(stats.local_identity.display_name(), "alice");

        engine.stop().await.unwrap();
        assert!(!engine.is_running());
        assert!(!controller.is_acquired());
        assert_eq!(engine.start().await, Err(EngineError::NotRunning));
        engine.stop().await.unwrap();

        assert_eq!(
            delegate.kinds(),
            vec!["radio_state_changed", "radio_state_changed"]
        );
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let (radio, _controller) = MockRadio::new();
        let mut config = EngineConfig::testing();
        config.dispatch.queue_capacity = 0;
        assert!(EngineBuilder::new(radio).with_config(config).build().is_err());
    }
}
