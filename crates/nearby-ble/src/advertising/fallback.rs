//! Fallback for platforms without a peripheral role: scan-only

use nearby_core::RadioEvent;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::BleError;

use super::BleAdvertiser;

// ----------------------------------------------------------------------------
// Fallback Implementation
// ----------------------------------------------------------------------------

/// Accepts advertising requests without advertising; peers can still be
/// discovered and connected to, but this device stays invisible
#[derive(Default)]
pub struct FallbackAdvertiser {
    warned: bool,
}

impl FallbackAdvertiser {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl BleAdvertiser for FallbackAdvertiser {
    async fn open(&mut self, _events: mpsc::Sender<RadioEvent>) -> Result<(), BleError> {
        Ok(())
    }

    async fn start_advertising(&mut self, _payload: &[u8]) -> Result<(), BleError> {
        if !self.warned {
            warn!(
                "BLE advertising not supported on this platform. This device will not be \
                 discoverable; scanning and outbound sessions still work."
            );
            self.warned = true;
        }
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<(), BleError> {
        Ok(())
    }

    async fn close(&mut self) {}

    fn is_advertising(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fallback_never_advertises() {
        let (events, _rx) = mpsc::channel(1);
        let mut advertiser = FallbackAdvertiser::new();
        advertiser.open(events).await.unwrap();
        advertiser.start_advertising(&[1; 24]).await.unwrap();
        assert!(advertiser.warned);
        assert!(!advertiser.is_advertising());
        advertiser.stop_advertising().await.unwrap();
        advertiser.close().await;
    }
}
