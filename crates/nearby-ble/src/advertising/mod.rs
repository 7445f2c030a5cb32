//! Cross-platform peripheral role: advertising and inbound GATT links

pub mod fallback;
#[cfg(target_os = "linux")]
pub mod linux;

use nearby_core::RadioEvent;
use tokio::sync::mpsc;

use crate::error::BleError;

// ----------------------------------------------------------------------------
// Cross-platform Advertising Trait
// ----------------------------------------------------------------------------

/// Peripheral role of the radio on one platform
#[async_trait::async_trait]
pub trait BleAdvertiser: Send {
    /// Prepare the peripheral role. Inbound links and adapter power changes
    /// are reported on `events`.
    async fn open(&mut self, events: mpsc::Sender<RadioEvent>) -> Result<(), BleError>;

    /// Start advertising `payload`, replacing any current advertisement
    async fn start_advertising(&mut self, payload: &[u8]) -> Result<(), BleError>;

    async fn stop_advertising(&mut self) -> Result<(), BleError>;

    /// Tear down the peripheral role and every inbound link
    async fn close(&mut self);

    fn is_advertising(&self) -> bool;
}

// ----------------------------------------------------------------------------
// Platform Detection
// ----------------------------------------------------------------------------

/// Platform-specific advertiser
pub enum PlatformAdvertiser {
    #[cfg(target_os = "linux")]
    Linux(linux::LinuxAdvertiser),
    #[allow(dead_code)]
    Fallback(fallback::FallbackAdvertiser),
}

impl PlatformAdvertiser {
    /// Create the appropriate advertiser for the current platform
    pub fn new(config: &crate::config::BleRadioConfig) -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::Linux(linux::LinuxAdvertiser::new(config.clone()))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = config;
            Self::Fallback(fallback::FallbackAdvertiser::new())
        }
    }
}

#[async_trait::async_trait]
impl BleAdvertiser for PlatformAdvertiser {
    async fn open(&mut self, events: mpsc::Sender<RadioEvent>) -> Result<(), BleError> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(advertiser) => advertiser.open(events).await,
            Self::Fallback(advertiser) => advertiser.open(events).await,
        }
    }

    async fn start_advertising(&mut self, payload: &[u8]) -> Result<(), BleError> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(advertiser) => advertiser.start_advertising(payload).await,
            Self::Fallback(advertiser) => advertiser.start_advertising(payload).await,
        }
    }

    async fn stop_advertising(&mut self) -> Result<(), BleError> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(advertiser) => advertiser.stop_advertising().await,
            Self::Fallback(advertiser) => advertiser.stop_advertising().await,
        }
    }

    async fn close(&mut self) {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(advertiser) => advertiser.close().await,
            Self::Fallback(advertiser) => advertiser.close().await,
        }
    }

    fn is_advertising(&self) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(advertiser) => advertiser.is_advertising(),
            Self::Fallback(advertiser) => advertiser.is_advertising(),
        }
    }
}
