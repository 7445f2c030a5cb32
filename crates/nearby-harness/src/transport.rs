//! In-memory transport pairs
//!
//! `transport_pair()` returns the engine-facing [`MockTransport`] and the
//! test-facing [`RemotePeer`] that plays the other device.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nearby_core::protocol::{Frame, Nonce};
use nearby_core::{IdentityToken, Transport, TransportError};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::debug;

// ----------------------------------------------------------------------------
// Mock Transport
// ----------------------------------------------------------------------------

/// Engine side of an in-memory link
pub struct MockTransport {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    close_count: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.outbound
            .send(frame.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.inbound.recv().await)
    }

    async fn close(self: Box<Self>) {
        let closes = self.close_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Mock transport closed ({} total)", closes);
    }
}

// ----------------------------------------------------------------------------
// Remote Peer
// ----------------------------------------------------------------------------

/// Test side of an in-memory link
pub struct RemotePeer {
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    close_count: Arc<AtomicUsize>,
}

impl RemotePeer {
    /// Send a frame to the engine
    pub fn send_frame(&self, frame: &Frame) -> bool {
        let Some(outbound) = &self.outbound else {
            return false;
        };
        match frame.to_bytes() {
            Ok(bytes) => outbound.send(bytes).is_ok(),
            Err(_) => false,
        }
    }

    /// Send raw bytes to the engine
    pub fn send_raw(&self, bytes: Vec<u8>) -> bool {
        self.outbound
            .as_ref()
            .map(|tx| tx.send(bytes).is_ok())
            .unwrap_or(false)
    }

    /// Next frame from the engine, `None` on close or after one second
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        let bytes = timeout(Duration::from_secs(1), self.inbound.recv())
            .await
            .ok()??;
        Frame::from_bytes(&bytes).ok()
    }

    /// Answer the engine's `Hello` as the owner of `token`. Returns the nonce
    /// and the initiator token on success.
    pub async fn accept_handshake(&mut self, token: IdentityToken) -> Option<(Nonce, IdentityToken)> {
        match self.recv_frame().await? {
            Frame::Hello {
                nonce,
                token: initiator,
                ..
            } => {
                self.send_frame(&Frame::echo_for(&nonce, token));
                Some((nonce, initiator))
            }
            _ => None,
        }
    }

    /// Open a handshake toward the engine as `token` and wait for its echo
    pub async fn initiate_handshake(&mut self, token: IdentityToken, nonce: Nonce) -> Option<Frame> {
        self.send_frame(&Frame::Hello {
            version: nearby_core::protocol::HANDSHAKE_VERSION,
            nonce,
            token,
        });
        self.recv_frame().await
    }

    /// Drop our sending half; the engine sees an orderly disconnect
    pub fn disconnect(&mut self) {
        self.outbound = None;
    }

    /// Number of times the engine closed its end
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

/// Create a connected pair of endpoints
pub fn transport_pair() -> (MockTransport, RemotePeer) {
    let (to_remote, from_engine) = mpsc::unbounded_channel();
    let (to_engine, from_remote) = mpsc::unbounded_channel();
    let close_count = Arc::new(AtomicUsize::new(0));

    (
        MockTransport {
            outbound: to_remote,
            inbound: from_remote,
            close_count: close_count.clone(),
        },
        RemotePeer {
            outbound: Some(to_engine),
            inbound: from_engine,
            close_count,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_exchanges_frames_and_counts_close() {
        let (transport, mut remote) = transport_pair();
        let mut transport: Box<dyn Transport> = Box::new(transport);

        transport.send(&Frame::Goodbye.to_bytes().unwrap()).await.unwrap();
        assert_eq!(remote.recv_frame().await, Some(Frame::Goodbye));

        remote.send_frame(&Frame::Goodbye);
        assert!(transport.recv().await.unwrap().is_some());

        remote.disconnect();
        assert_eq!(transport.recv().await.unwrap(), None);

        transport.close().await;
        assert_eq!(remote.close_count(), 1);
    }
}
