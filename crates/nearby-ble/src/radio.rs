//! The BLE radio handed to the engine

use std::sync::Arc;

use async_trait::async_trait;
use btleplug::platform::Adapter;
use nearby_core::protocol::decode;
use nearby_core::{Connector, IdentityToken, Radio, RadioError, RadioEvent};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::advertising::{BleAdvertiser, PlatformAdvertiser};
use crate::config::BleRadioConfig;
use crate::connection::BleConnector;
use crate::discovery::{open_adapter, set_scanning, spawn_scanner};
use crate::error::BleError;

// ----------------------------------------------------------------------------
// BLE Radio
// ----------------------------------------------------------------------------

/// [`Radio`] backed by the host Bluetooth stack
///
/// Scanning and outbound connections use btleplug; the peripheral role
/// (advertising and inbound links) is platform specific.
pub struct BleRadio {
    config: BleRadioConfig,
    adapter: Arc<RwLock<Option<Adapter>>>,
    local_token: Arc<RwLock<Option<IdentityToken>>>,
    advertiser: PlatformAdvertiser,
    connector: Arc<BleConnector>,
    events_tx: mpsc::Sender<RadioEvent>,
    events_rx: Option<mpsc::Receiver<RadioEvent>>,
    scanner: Option<JoinHandle<()>>,
    scanning: bool,
}

impl BleRadio {
    pub fn new(config: BleRadioConfig) -> Self {
        let adapter = Arc::new(RwLock::new(None));
        let local_token = Arc::new(RwLock::new(None));
        let connector = Arc::new(BleConnector::new(
            adapter.clone(),
            local_token.clone(),
            config.clone(),
        ));
        let (events_tx, events_rx) = mpsc::channel(config.event_queue.max(1));

        Self {
            advertiser: PlatformAdvertiser::new(&config),
            config,
            adapter,
            local_token,
            connector,
            events_tx,
            events_rx: Some(events_rx),
            scanner: None,
            scanning: false,
        }
    }

    pub fn config(&self) -> &BleRadioConfig {
        &self.config
    }

    async fn adapter(&self) -> Result<Adapter, RadioError> {
        self.adapter
            .read()
            .await
            .clone()
            .ok_or_else(|| BleError::NotAcquired.into())
    }
}

impl Default for BleRadio {
    fn default() -> Self {
        Self::new(BleRadioConfig::default())
    }
}

#[async_trait]
impl Radio for BleRadio {
    async fn acquire(&mut self) -> Result<(), RadioError> {
        let adapter = open_adapter(&self.config).await?;
        let scanner = spawn_scanner(adapter.clone(), self.events_tx.clone()).await?;
        if let Err(err) = self.advertiser.open(self.events_tx.clone()).await {
            scanner.abort();
            return Err(err.into());
        }

        *self.adapter.write().await = Some(adapter);
        self.scanner = Some(scanner);
        info!("BLE radio acquired");
        Ok(())
    }

    async fn release(&mut self) {
        if self.scanning {
            if let Ok(adapter) = self.adapter().await {
                if let Err(err) = set_scanning(&adapter, false).await {
                    debug!("Stop scan during release failed: {}", err);
                }
            }
            self.scanning = false;
        }
        if let Some(scanner) = self.scanner.take() {
            scanner.abort();
        }
        self.advertiser.close().await;
        *self.adapter.write().await = None;
        info!("BLE radio released");
    }

    async fn start_advertising(&mut self, payload: &[u8]) -> Result<(), RadioError> {
        match decode(payload) {
            Ok(identity) => *self.local_token.write().await = Some(identity.token()),
            Err(err) => warn!("Advertising a payload that does not decode: {}", err),
        }
        self.advertiser.start_advertising(payload).await?;
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<(), RadioError> {
        self.advertiser.stop_advertising().await?;
        Ok(())
    }

    async fn start_scan(&mut self) -> Result<(), RadioError> {
        let adapter = self.adapter().await?;
        set_scanning(&adapter, true).await?;
        self.scanning = true;
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), RadioError> {
        let adapter = self.adapter().await?;
        set_scanning(&adapter, false).await?;
        self.scanning = false;
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<RadioEvent>> {
        self.events_rx.take()
    }

    fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unacquired_radio_rejects_scanning() {
        let mut radio = BleRadio::new(BleRadioConfig::new().with_chunk_size(100));
        assert_eq!(radio.config().chunk_size, 100);
        assert!(radio.take_events().is_some());
        assert!(radio.take_events().is_none());

        let err = radio.start_scan().await.unwrap_err();
        assert!(!err.is_fatal());
        radio.release().await;
    }
}
