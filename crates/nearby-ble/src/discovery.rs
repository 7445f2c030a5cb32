//! Adapter setup and advertisement scanning (central role)

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use nearby_core::{DeviceHandle, RadioEvent, RawAdvertisement};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BleRadioConfig;
use crate::error::BleError;
use crate::protocol::NEARBY_SERVICE_UUID;

// ----------------------------------------------------------------------------
// Adapter
// ----------------------------------------------------------------------------

/// Open the configured BLE adapter
pub(crate) async fn open_adapter(config: &BleRadioConfig) -> Result<Adapter, BleError> {
    let manager = Manager::new()
        .await
        .map_err(|e| BleError::AdapterNotAvailable(format!("Failed to create BLE manager: {}", e)))?;

    let adapters = manager
        .adapters()
        .await
        .map_err(|e| BleError::AdapterNotAvailable(format!("Failed to list BLE adapters: {}", e)))?;

    let adapter = adapters
        .into_iter()
        .nth(config.adapter_index)
        .ok_or_else(|| {
            BleError::AdapterNotAvailable(format!("No BLE adapter at index {}", config.adapter_index))
        })?;

    info!("BLE adapter {} initialized", config.adapter_index);
    Ok(adapter)
}

/// Engine-facing handle for a peripheral
pub(crate) fn device_handle(id: &PeripheralId) -> DeviceHandle {
    DeviceHandle::new(format!("{:?}", id))
}

/// Look up a peripheral previously seen while scanning
pub(crate) async fn find_peripheral(
    adapter: &Adapter,
    device: &DeviceHandle,
) -> Result<Peripheral, BleError> {
    adapter
        .peripherals()
        .await?
        .into_iter()
        .find(|peripheral| device_handle(&peripheral.id()) == *device)
        .ok_or_else(|| BleError::DeviceNotFound(device.to_string()))
}

// ----------------------------------------------------------------------------
// Scanning
// ----------------------------------------------------------------------------

/// Start or stop the adapter scan filtered on the Nearby service
pub(crate) async fn set_scanning(adapter: &Adapter, enabled: bool) -> Result<(), BleError> {
    if enabled {
        let filter = ScanFilter {
            services: vec![NEARBY_SERVICE_UUID],
        };
        adapter.start_scan(filter).await?;
        debug!("BLE scan started");
    } else {
        adapter.stop_scan().await?;
        debug!("BLE scan stopped");
    }
    Ok(())
}

/// Forward Nearby service data seen by the adapter as radio events
///
/// The task runs until the receiving side of `events` is dropped or the
/// adapter event stream ends.
pub(crate) async fn spawn_scanner(
    adapter: Adapter,
    events: mpsc::Sender<RadioEvent>,
) -> Result<JoinHandle<()>, BleError> {
    let mut central_events = adapter.events().await?;

    Ok(tokio::spawn(async move {
        while let Some(event) = central_events.next().await {
            let CentralEvent::ServiceDataAdvertisement { id, service_data } = event else {
                continue;
            };
            let Some(data) = service_data.get(&NEARBY_SERVICE_UUID) else {
                continue;
            };

            let Some(rssi) = signal_strength(&adapter, &id).await else {
                debug!("No RSSI for {:?}, skipping advertisement {}", id, hex::encode(data));
                continue;
            };

            let advertisement = RawAdvertisement {
                device: device_handle(&id),
                data: data.clone(),
                rssi,
            };
            if events.send(RadioEvent::Advertisement(advertisement)).await.is_err() {
                break;
            }
        }
        warn!("BLE scanner stopped");
    }))
}

async fn signal_strength(adapter: &Adapter, id: &PeripheralId) -> Option<i16> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    peripheral.properties().await.ok()??.rssi
}
