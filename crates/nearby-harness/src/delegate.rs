//! Delegate that records every event it receives

use std::sync::{Mutex, MutexGuard};

use nearby_core::{EngineEvent, PeerDelegate, PeerId, PeerRecord, SessionState, Timestamp};
use tokio::sync::Notify;
use tokio::time::{timeout, Duration};

/// A delivered event plus the thread it was delivered on
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: EngineEvent,
    pub thread: Option<String>,
}

/// Records deliveries so tests can assert on order and content
#[derive(Default)]
pub struct RecordingDelegate {
    deliveries: Mutex<Vec<Delivery>>,
    notify: Notify,
}

impl RecordingDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    fn deliveries(&self) -> MutexGuard<'_, Vec<Delivery>> {
        self.deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// All events in delivery order
    pub fn events(&self) -> Vec<EngineEvent> {
        self.deliveries().iter().map(|d| d.event.clone()).collect()
    }

    /// Thread names events were delivered on
    pub fn threads(&self) -> Vec<Option<String>> {
        self.deliveries().iter().map(|d| d.thread.clone()).collect()
    }

    /// Event kinds in delivery order
    pub fn kinds(&self) -> Vec<&'static str> {
        self.deliveries().iter().map(|d| d.event.kind()).collect()
    }

    /// Session states reported for `peer_id`, in order
    pub fn session_states(&self, peer_id: PeerId) -> Vec<SessionState> {
        self.deliveries()
            .iter()
            .filter_map(|d| match &d.event {
                EngineEvent::SessionStateChanged { peer_id: id, state } if *id == peer_id => {
                    Some(*state)
                }
                _ => None,
            })
            .collect()
    }

    /// Number of recorded events matching `predicate`
    pub fn count(&self, predicate: impl Fn(&EngineEvent) -> bool) -> usize {
        self.deliveries().iter().filter(|d| predicate(&d.event)).count()
    }

    pub fn clear(&self) {
        self.deliveries().clear();
    }

    /// Wait until an event matching `predicate` has been recorded
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&EngineEvent) -> bool,
        limit: Duration,
    ) -> Option<EngineEvent> {
        let search = async {
            loop {
                let notified = self.notify.notified();
                if let Some(found) = self
                    .deliveries()
                    .iter()
                    .find(|d| predicate(&d.event))
                    .map(|d| d.event.clone())
                {
                    return found;
                }
                notified.await;
            }
        };
        timeout(limit, search).await.ok()
    }
}

impl PeerDelegate for RecordingDelegate {
    fn on_peers_changed(&self, _snapshot: &[PeerRecord]) {}

    fn on_message_received(&self, _peer_id: PeerId, _payload: &[u8], _timestamp: Timestamp) {}

    fn on_event(&self, event: &EngineEvent) {
        let thread = std::thread::current().name().map(str::to_string);
        self.deliveries().push(Delivery {
            event: event.clone(),
            thread,
        });
        self.notify.notify_waiters();
    }
}
