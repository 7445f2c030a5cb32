//! Outbound GATT connections and their frame transport

use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use nearby_core::{Connector, DeviceHandle, IdentityToken, Transport, TransportError};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::BleRadioConfig;
use crate::discovery::find_peripheral;
use crate::error::BleError;
use crate::protocol::{
    chunk_frame, split_addressed, FrameAssembler, NEARBY_RX_CHARACTERISTIC_UUID,
    NEARBY_TX_CHARACTERISTIC_UUID,
};

// ----------------------------------------------------------------------------
// Connector
// ----------------------------------------------------------------------------

/// Opens GATT connections to peripherals seen while scanning
pub struct BleConnector {
    adapter: Arc<RwLock<Option<Adapter>>>,
    local_token: Arc<RwLock<Option<IdentityToken>>>,
    config: BleRadioConfig,
}

impl BleConnector {
    pub(crate) fn new(
        adapter: Arc<RwLock<Option<Adapter>>>,
        local_token: Arc<RwLock<Option<IdentityToken>>>,
        config: BleRadioConfig,
    ) -> Self {
        Self {
            adapter,
            local_token,
            config,
        }
    }
}

#[async_trait]
impl Connector for BleConnector {
    async fn connect(&self, device: &DeviceHandle) -> Result<Box<dyn Transport>, TransportError> {
        let adapter = self.adapter.read().await.clone().ok_or(BleError::NotAcquired)?;
        // Notifications are addressed to the token we advertised when connecting
        let own_token = (*self.local_token.read().await).ok_or(BleError::NotAcquired)?;
        let peripheral = find_peripheral(&adapter, device).await?;

        let opening = GattTransport::open(peripheral.clone(), own_token, &self.config);
        match timeout(self.config.connection_timeout(), opening).await {
            Ok(Ok(transport)) => {
                info!("Connected to {}", device);
                Ok(Box::new(transport))
            }
            Ok(Err(err)) => {
                let _ = peripheral.disconnect().await;
                Err(err.into())
            }
            Err(_) => {
                let _ = peripheral.disconnect().await;
                Err(BleError::ConnectionTimeout.into())
            }
        }
    }
}

// ----------------------------------------------------------------------------
// GATT Transport
// ----------------------------------------------------------------------------

/// Frame transport over the TX (write) and RX (notify) characteristics
pub struct GattTransport {
    peripheral: Peripheral,
    tx: Characteristic,
    rx: Characteristic,
    frames: mpsc::UnboundedReceiver<Result<Vec<u8>, TransportError>>,
    reader: JoinHandle<()>,
    chunk_size: usize,
}

impl GattTransport {
    async fn open(
        peripheral: Peripheral,
        own_token: IdentityToken,
        config: &BleRadioConfig,
    ) -> Result<Self, BleError> {
        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: uuid::Uuid| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or(BleError::CharacteristicNotFound(uuid))
        };
        let tx = find(NEARBY_TX_CHARACTERISTIC_UUID)?;
        let rx = find(NEARBY_RX_CHARACTERISTIC_UUID)?;

        let mut notifications = peripheral.notifications().await?;
        peripheral.subscribe(&rx).await?;

        let (frames_tx, frames) = mpsc::unbounded_channel();
        let mut assembler = FrameAssembler::new(config.max_frame_size);
        let reader = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != NEARBY_RX_CHARACTERISTIC_UUID {
                    continue;
                }
                let Some((destination, chunk)) = split_addressed(&notification.value) else {
                    continue;
                };
                if destination != own_token {
                    continue;
                }
                let completed = assembler.push(chunk).map_err(TransportError::from);
                let delivered = match completed {
                    Ok(frames) => frames.into_iter().all(|frame| frames_tx.send(Ok(frame)).is_ok()),
                    Err(err) => frames_tx.send(Err(err)).is_ok(),
                };
                if !delivered {
                    break;
                }
            }
            debug!("Notification reader ended");
        });

        Ok(Self {
            peripheral,
            tx,
            rx,
            frames,
            reader,
            chunk_size: config.chunk_size,
        })
    }
}

#[async_trait]
impl Transport for GattTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        for chunk in chunk_frame(frame, self.chunk_size)? {
            self.peripheral
                .write(&self.tx, &chunk, WriteType::WithoutResponse)
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.frames.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    async fn close(self: Box<Self>) {
        self.reader.abort();
        if let Err(e) = self.peripheral.unsubscribe(&self.rx).await {
            debug!("Unsubscribe failed: {}", e);
        }
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("Failed to disconnect peripheral: {}", e);
        }
    }
}
