//! In-memory radio
//!
//! [`MockRadio`] is handed to the engine; the paired [`MockRadioController`]
//! stays with the test to inject advertisements and platform callbacks and to
//! inspect which radio operations the scheduler issued.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use nearby_core::protocol::encode;
use nearby_core::{
    Connector, DeviceHandle, PeerIdentity, Radio, RadioError, RadioEvent, RawAdvertisement,
    Transport, TransportError,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{transport_pair, RemotePeer};

// ----------------------------------------------------------------------------
// Recorded Operations
// ----------------------------------------------------------------------------

/// Radio operation issued by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioOp {
    Acquire,
    Release,
    StartAdvertising(Vec<u8>),
    StopAdvertising,
    StartScan,
    StopScan,
}

#[derive(Debug, Default)]
struct RadioState {
    ops: Vec<RadioOp>,
    advertising: Option<Vec<u8>>,
    scanning: bool,
    acquired: bool,
    unavailable: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Mock Radio
// ----------------------------------------------------------------------------

/// Radio capability backed by shared in-memory state
pub struct MockRadio {
    state: Arc<Mutex<RadioState>>,
    events: Option<mpsc::Receiver<RadioEvent>>,
    connector: Arc<MockConnector>,
}

impl MockRadio {
    /// Create a radio and the controller that drives it
    pub fn new() -> (Self, MockRadioController) {
        let state = Arc::new(Mutex::new(RadioState::default()));
        let (events_tx, events_rx) = mpsc::channel(256);
        let (connections_tx, connections_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(MockConnector {
            failures: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
            connections: connections_tx,
        });

        let radio = Self {
            state: state.clone(),
            events: Some(events_rx),
            connector: connector.clone(),
        };
        let controller = MockRadioController {
            state,
            events: events_tx,
            connector,
            connections: tokio::sync::Mutex::new(connections_rx),
        };
        (radio, controller)
    }

    fn record(&self, op: RadioOp) -> Result<MutexGuard<'_, RadioState>, RadioError> {
        let mut state = lock(&self.state);
        if state.unavailable {
            return Err(RadioError::Unavailable("mock radio powered off".into()));
        }
        state.ops.push(op);
        Ok(state)
    }
}

#[async_trait]
impl Radio for MockRadio {
    async fn acquire(&mut self) -> Result<(), RadioError> {
        let mut state = self.record(RadioOp::Acquire)?;
        state.acquired = true;
        Ok(())
    }

    async fn release(&mut self) {
        let mut state = lock(&self.state);
        state.ops.push(RadioOp::Release);
        state.acquired = false;
        state.advertising = None;
        state.scanning = false;
    }

    async fn start_advertising(&mut self, payload: &[u8]) -> Result<(), RadioError> {
        let mut state = self.record(RadioOp::StartAdvertising(payload.to_vec()))?;
        state.advertising = Some(payload.to_vec());
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<(), RadioError> {
        let mut state = self.record(RadioOp::StopAdvertising)?;
        state.advertising = None;
        Ok(())
    }

    async fn start_scan(&mut self) -> Result<(), RadioError> {
        let mut state = self.record(RadioOp::StartScan)?;
        state.scanning = true;
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), RadioError> {
        let mut state = self.record(RadioOp::StopScan)?;
        state.scanning = false;
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<RadioEvent>> {
        self.events.take()
    }

    fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }
}

// ----------------------------------------------------------------------------
// Mock Connector
// ----------------------------------------------------------------------------

/// Connector that creates in-memory links and hands the remote end to the test
pub struct MockConnector {
    failures: Mutex<HashMap<DeviceHandle, VecDeque<TransportError>>>,
    attempts: Mutex<Vec<DeviceHandle>>,
    connections: mpsc::UnboundedSender<(DeviceHandle, RemotePeer)>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, device: &DeviceHandle) -> Result<Box<dyn Transport>, TransportError> {
        lock(&self.attempts).push(device.clone());

        if let Some(error) = lock(&self.failures)
            .get_mut(device)
            .and_then(|queue| queue.pop_front())
        {
            debug!("Mock connect to {} failing: {}", device, error);
            return Err(error);
        }

        let (transport, remote) = transport_pair();
        self.connections
            .send((device.clone(), remote))
            .map_err(|_| TransportError::ConnectFailed("test dropped the controller".into()))?;
        Ok(Box::new(transport))
    }
}

// ----------------------------------------------------------------------------
// Controller
// ----------------------------------------------------------------------------

/// Test handle for a [`MockRadio`]
pub struct MockRadioController {
    state: Arc<Mutex<RadioState>>,
    events: mpsc::Sender<RadioEvent>,
    connector: Arc<MockConnector>,
    connections: tokio::sync::Mutex<mpsc::UnboundedReceiver<(DeviceHandle, RemotePeer)>>,
}

impl MockRadioController {
    /// Deliver an advertisement for `identity` as seen from `device`
    pub async fn advertise(&self, identity: &PeerIdentity, device: &DeviceHandle, rssi: i16) {
        self.advertise_raw(encode(identity).to_vec(), device, rssi).await;
    }

    /// Deliver arbitrary advertisement bytes
    pub async fn advertise_raw(&self, data: Vec<u8>, device: &DeviceHandle, rssi: i16) {
        let _ = self
            .events
            .send(RadioEvent::Advertisement(RawAdvertisement {
                device: device.clone(),
                data,
                rssi,
            }))
            .await;
    }

    /// Simulate a remote central connecting to us; returns its end of the link
    pub async fn incoming(&self) -> RemotePeer {
        let (transport, remote) = transport_pair();
        let _ = self
            .events
            .send(RadioEvent::Incoming(Box::new(transport)))
            .await;
        remote
    }

    pub async fn revoke_background(&self) {
        let _ = self.events.send(RadioEvent::BackgroundRevoked).await;
    }

    pub async fn restore_background(&self) {
        let _ = self.events.send(RadioEvent::BackgroundRestored).await;
    }

    /// Power the adapter off: every further operation fails as unavailable
    pub async fn power_off(&self) {
        lock(&self.state).unavailable = true;
        let _ = self.events.send(RadioEvent::PoweredOff).await;
    }

    pub async fn power_on(&self) {
        lock(&self.state).unavailable = false;
        let _ = self.events.send(RadioEvent::PoweredOn).await;
    }

    /// Make operations fail as unavailable without emitting an event
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    /// Queue a failure for the next connect attempt to `device`
    pub fn fail_next_connect(&self, device: &DeviceHandle, error: TransportError) {
        lock(&self.connector.failures)
            .entry(device.clone())
            .or_default()
            .push_back(error);
    }

    /// Wait for the engine's next successful outbound connection
    pub async fn next_connection(&self) -> Option<(DeviceHandle, RemotePeer)> {
        self.connections.lock().await.recv().await
    }

    /// Devices the engine attempted to connect to, in order
    pub fn connect_attempts(&self) -> Vec<DeviceHandle> {
        lock(&self.connector.attempts).clone()
    }

    pub fn ops(&self) -> Vec<RadioOp> {
        lock(&self.state).ops.clone()
    }

    pub fn clear_ops(&self) {
        lock(&self.state).ops.clear();
    }

    pub fn advertised_payload(&self) -> Option<Vec<u8>> {
        lock(&self.state).advertising.clone()
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scanning
    }

    pub fn is_acquired(&self) -> bool {
        lock(&self.state).acquired
    }
}
