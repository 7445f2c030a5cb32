//! Linux peripheral role using bluer (BlueZ)
//!
//! Serves a GATT application with the TX (write) and RX (notify)
//! characteristics. Each central writing to TX gets its own inbound link,
//! keyed by its device address; every link shares the RX notifications and
//! addresses its chunks with the peer token learned from the `Hello` frame.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle, Type};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicWrite, CharacteristicWriteMethod, Service,
};
use bluer::{AdapterEvent, AdapterProperty, Address};
use futures::stream::StreamExt;
use nearby_core::protocol::Frame;
use nearby_core::types::TOKEN_LEN;
use nearby_core::{IdentityToken, RadioEvent, Transport, TransportError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BleRadioConfig;
use crate::error::BleError;
use crate::protocol::{
    address_chunk, chunk_frame, FrameAssembler, NEARBY_RX_CHARACTERISTIC_UUID,
    NEARBY_SERVICE_UUID, NEARBY_TX_CHARACTERISTIC_UUID,
};

use super::BleAdvertiser;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Linux Implementation
// ----------------------------------------------------------------------------

pub struct LinuxAdvertiser {
    config: BleRadioConfig,
    session: Option<bluer::Session>,
    adapter: Option<bluer::Adapter>,
    application: Option<ApplicationHandle>,
    advertisement: Option<AdvertisementHandle>,
    monitor: Option<JoinHandle<()>>,
}

impl LinuxAdvertiser {
    pub fn new(config: BleRadioConfig) -> Self {
        Self {
            config,
            session: None,
            adapter: None,
            application: None,
            advertisement: None,
            monitor: None,
        }
    }

    async fn open_adapter(&self, session: &bluer::Session) -> Result<bluer::Adapter, BleError> {
        let names = session.adapter_names().await?;
        let name = names.get(self.config.adapter_index).ok_or_else(|| {
            BleError::AdapterNotAvailable(format!("No BlueZ adapter at index {}", self.config.adapter_index))
        })?;
        let adapter = session.adapter(name)?;
        if !adapter.is_powered().await? {
            return Err(BleError::AdapterNotAvailable(format!("{} is powered off", name)));
        }
        Ok(adapter)
    }

    /// Report adapter power changes to the engine
    async fn spawn_power_monitor(
        adapter: &bluer::Adapter,
        events: mpsc::Sender<RadioEvent>,
    ) -> Result<JoinHandle<()>, BleError> {
        let mut adapter_events = Box::pin(adapter.events().await?);
        Ok(tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event else {
                    continue;
                };
                info!("BlueZ adapter powered {}", if powered { "on" } else { "off" });
                let event = if powered {
                    RadioEvent::PoweredOn
                } else {
                    RadioEvent::PoweredOff
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        }))
    }
}

#[async_trait]
impl BleAdvertiser for LinuxAdvertiser {
    async fn open(&mut self, events: mpsc::Sender<RadioEvent>) -> Result<(), BleError> {
        if self.session.is_some() {
            return Ok(());
        }

        let session = bluer::Session::new()
            .await
            .map_err(|e| BleError::AdapterNotAvailable(format!("BlueZ session: {}", e)))?;
        let adapter = self.open_adapter(&session).await?;

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let links = Arc::new(InboundLinks {
            events: events.clone(),
            outgoing: outgoing_tx,
            links: Mutex::new(HashMap::new()),
            config: self.config.clone(),
        });
        let application = adapter
            .serve_gatt_application(gatt_application(links, outgoing_rx))
            .await?;
        let monitor = Self::spawn_power_monitor(&adapter, events).await?;

        info!("Linux BLE peripheral role ready on {}", adapter.name());
        self.session = Some(session);
        self.adapter = Some(adapter);
        self.application = Some(application);
        self.monitor = Some(monitor);
        Ok(())
    }

    async fn start_advertising(&mut self, payload: &[u8]) -> Result<(), BleError> {
        let adapter = self.adapter.as_ref().ok_or(BleError::NotAcquired)?;

        // A 16-bit service UUID keeps the service data inside a legacy advertisement
        let advertisement = Advertisement {
            advertisement_type: Type::Peripheral,
            service_data: [(NEARBY_SERVICE_UUID, payload.to_vec())].into_iter().collect(),
            discoverable: Some(true),
            ..Default::default()
        };

        // Replacing the handle withdraws the previous advertisement
        self.advertisement = None;
        let handle = adapter
            .advertise(advertisement)
            .await
            .map_err(|e| BleError::Advertising(e.to_string()))?;
        self.advertisement = Some(handle);
        debug!("Advertising {}", hex::encode(payload));
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<(), BleError> {
        if self.advertisement.take().is_some() {
            debug!("Stopped BLE advertising");
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.advertisement = None;
        self.application = None;
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        self.adapter = None;
        self.session = None;
        info!("Linux BLE peripheral role closed");
    }

    fn is_advertising(&self) -> bool {
        self.advertisement.is_some()
    }
}

// ----------------------------------------------------------------------------
// GATT Application
// ----------------------------------------------------------------------------

fn gatt_application(
    links: Arc<InboundLinks>,
    outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Application {
    let outgoing = Arc::new(tokio::sync::Mutex::new(outgoing));

    let tx = Characteristic {
        uuid: NEARBY_TX_CHARACTERISTIC_UUID,
        write: Some(CharacteristicWrite {
            write: true,
            write_without_response: true,
            method: CharacteristicWriteMethod::Fun(Box::new(move |value, request| {
                let links = links.clone();
                Box::pin(async move {
                    links.on_write(request.device_address, value).await;
                    Ok(())
                })
            })),
            ..Default::default()
        }),
        ..Default::default()
    };

    let rx = Characteristic {
        uuid: NEARBY_RX_CHARACTERISTIC_UUID,
        notify: Some(CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let outgoing = outgoing.clone();
                Box::pin(async move {
                    tokio::spawn(pump_notifications(notifier, outgoing));
                })
            })),
            ..Default::default()
        }),
        ..Default::default()
    };

    Application {
        services: vec![Service {
            uuid: NEARBY_SERVICE_UUID,
            primary: true,
            characteristics: vec![tx, rx],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Forward queued chunks to subscribed centrals until notifications stop
async fn pump_notifications(
    mut notifier: CharacteristicNotifier,
    outgoing: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
) {
    let mut outgoing = outgoing.lock().await;
    debug!("RX notifications started");
    loop {
        let chunk = tokio::select! {
            chunk = outgoing.recv() => chunk,
            _ = notifier.stopped() => None,
        };
        let Some(chunk) = chunk else {
            break;
        };
        if let Err(e) = notifier.notify(chunk).await {
            warn!("RX notification failed: {}", e);
            break;
        }
    }
    debug!("RX notifications stopped");
}

// ----------------------------------------------------------------------------
// Inbound Links
// ----------------------------------------------------------------------------

struct InboundLink {
    assembler: FrameAssembler,
    frames: mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>,
}

/// Inbound links keyed by the address of the writing central
struct InboundLinks {
    events: mpsc::Sender<RadioEvent>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    links: Mutex<HashMap<Address, InboundLink>>,
    config: BleRadioConfig,
}

impl InboundLinks {
    /// Feed a TX write into its link, opening the link on first contact
    async fn on_write(self: &Arc<Self>, address: Address, value: Vec<u8>) {
        let opened = {
            let mut links = lock(&self.links);
            let mut opened = None;
            let link = links.entry(address).or_insert_with(|| {
                let (frames_tx, frames_rx) = mpsc::unbounded_channel();
                opened = Some(PeripheralTransport {
                    address,
                    frames: frames_rx,
                    destination: None,
                    links: self.clone(),
                });
                InboundLink {
                    assembler: FrameAssembler::new(self.config.max_frame_size),
                    frames: frames_tx,
                }
            });

            match link.assembler.push(&value) {
                Ok(frames) => {
                    for frame in frames {
                        let _ = link.frames.send(Ok(frame));
                    }
                }
                Err(err) => {
                    debug!("Dropping stream from {}: {}", address, err);
                    let _ = link.frames.send(Err(err.into()));
                }
            }
            opened
        };

        if let Some(transport) = opened {
            info!("Inbound link from {}", address);
            if self
                .events
                .send(RadioEvent::Incoming(Box::new(transport)))
                .await
                .is_err()
            {
                self.remove(&address);
            }
        }
    }

    fn remove(&self, address: &Address) {
        if lock(&self.links).remove(address).is_some() {
            debug!("Inbound link from {} removed", address);
        }
    }

    fn notification_chunk_size(&self) -> usize {
        self.config.chunk_size.saturating_sub(TOKEN_LEN).max(1)
    }
}

/// Transport for a central connected to our peripheral role
struct PeripheralTransport {
    address: Address,
    frames: mpsc::UnboundedReceiver<Result<Vec<u8>, TransportError>>,
    /// Token of the remote initiator, learned from its `Hello`
    destination: Option<IdentityToken>,
    links: Arc<InboundLinks>,
}

#[async_trait]
impl Transport for PeripheralTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let destination = self
            .destination
            .ok_or_else(|| TransportError::SendFailed("remote token not known yet".into()))?;
        for chunk in chunk_frame(frame, self.links.notification_chunk_size())? {
            self.links
                .outgoing
                .send(address_chunk(&destination, &chunk))
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let Some(frame) = self.frames.recv().await.transpose()? else {
            return Ok(None);
        };
        if self.destination.is_none() {
            if let Ok(Frame::Hello { token, .. }) = Frame::from_bytes(&frame) {
                self.destination = Some(token);
            }
        }
        Ok(Some(frame))
    }

    async fn close(self: Box<Self>) {
        self.links.remove(&self.address);
    }
}
