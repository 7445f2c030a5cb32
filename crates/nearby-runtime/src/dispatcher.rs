//! Event dispatcher
//!
//! Fans engine events out to UI delegates. Every delegate target gets its own
//! ordered queue and its own delivery worker running on the execution context
//! the delegate asked for. Producers call [`EventSink::emit`], which only
//! takes a short lock and never awaits.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use nearby_core::{EngineEvent, PeerDelegate};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

// ----------------------------------------------------------------------------
// Delivery Context
// ----------------------------------------------------------------------------

/// Execution context a delegate expects its callbacks on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeliveryContext {
    /// A task on the engine's tokio runtime
    #[default]
    Runtime,
    /// A dedicated named OS thread, e.g. standing in for a UI main thread
    Thread(String),
}

// ----------------------------------------------------------------------------
// Dispatch Queue
// ----------------------------------------------------------------------------

/// What happened to an event offered to a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// A stale `PeerUpdated` for the same peer was dropped in its favour
    Superseded,
    /// The oldest queued `PeerUpdated` was evicted to make room
    EvictedOldest,
    /// Queue full of non-coalescible events; the `PeerUpdated` was dropped
    Dropped,
    /// The dispatcher is shutting down
    Closed,
}

/// Bounded FIFO with the coalescing policy for `PeerUpdated`
#[derive(Debug)]
pub struct DispatchQueue {
    events: VecDeque<EngineEvent>,
    capacity: usize,
    closed: bool,
    dropped: u64,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity,
            closed: false,
            dropped: 0,
        }
    }

    /// Offer an event. Only `PeerUpdated` is ever superseded, evicted or
    /// dropped; every other kind is enqueued even past capacity.
    pub fn push(&mut self, event: EngineEvent) -> Enqueued {
        if self.closed {
            return Enqueued::Closed;
        }

        if event.is_coalescible() {
            let peer_id = event.peer_id();
            if let Some(stale) = self
                .events
                .iter()
                .position(|queued| queued.is_coalescible() && queued.peer_id() == peer_id)
            {
                self.events.remove(stale);
                self.events.push_back(event);
                return Enqueued::Superseded;
            }
            if self.events.len() >= self.capacity {
                if self.evict_oldest_update() {
                    self.events.push_back(event);
                    return Enqueued::EvictedOldest;
                }
                self.dropped += 1;
                return Enqueued::Dropped;
            }
            self.events.push_back(event);
            return Enqueued::Queued;
        }

        let outcome = if self.events.len() >= self.capacity && self.evict_oldest_update() {
            Enqueued::EvictedOldest
        } else {
            Enqueued::Queued
        };
        self.events.push_back(event);
        outcome
    }

    fn evict_oldest_update(&mut self) -> bool {
        match self.events.iter().position(EngineEvent::is_coalescible) {
            Some(index) => {
                self.events.remove(index);
                self.dropped += 1;
                true
            }
            None => false,
        }
    }

    fn drain(&mut self) -> Vec<EngineEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// `PeerUpdated` events evicted or dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

// ----------------------------------------------------------------------------
// Delivery Targets
// ----------------------------------------------------------------------------

struct Target {
    queue: Mutex<DispatchQueue>,
    notify: Notify,
}

impl Target {
    fn queue(&self) -> MutexGuard<'_, DispatchQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum Worker {
    Task(JoinHandle<()>),
    Thread(std::thread::JoinHandle<()>),
}

/// Deliver queued events in order until the queue is closed and empty
async fn deliver(target: Arc<Target>, delegate: Arc<dyn PeerDelegate>) {
    loop {
        let (batch, closed) = {
            let mut queue = target.queue();
            (queue.drain(), queue.closed)
        };

        if batch.is_empty() {
            if closed {
                break;
            }
            target.notify.notified().await;
            continue;
        }

        for event in &batch {
            trace!("Delivering {}", event.kind());
            delegate.on_event(event);
        }
    }
}

// ----------------------------------------------------------------------------
// Event Sink
// ----------------------------------------------------------------------------

/// Cloneable producer handle
#[derive(Clone)]
pub struct EventSink {
    targets: Arc<[Arc<Target>]>,
}

impl EventSink {
    /// Enqueue an event for every delegate. Never blocks.
    pub fn emit(&self, event: EngineEvent) {
        trace!("Emitting {}", event.kind());
        for target in self.targets.iter() {
            let outcome = target.queue().push(event.clone());
            match outcome {
                Enqueued::Closed => {
                    debug!("Dropping {} emitted after shutdown", event.kind());
                }
                Enqueued::Dropped => {
                    debug!("Delegate queue full, dropped {}", event.kind());
                }
                _ => target.notify.notify_one(),
            }
        }
    }

    /// Number of `PeerUpdated` events lost to backpressure across targets
    pub fn dropped(&self) -> u64 {
        self.targets.iter().map(|target| target.queue().dropped()).sum()
    }
}

// ----------------------------------------------------------------------------
// Event Dispatcher
// ----------------------------------------------------------------------------

pub struct EventDispatcher {
    sink: EventSink,
    workers: Vec<Worker>,
}

impl EventDispatcher {
    /// Start one delivery worker per delegate. Must be called on a tokio runtime.
    pub fn start(
        delegates: Vec<(Arc<dyn PeerDelegate>, DeliveryContext)>,
        queue_capacity: usize,
    ) -> std::io::Result<Self> {
        let handle = Handle::current();
        let mut targets = Vec::with_capacity(delegates.len());
        let mut workers = Vec::with_capacity(delegates.len());

        for (delegate, context) in delegates {
            let target = Arc::new(Target {
                queue: Mutex::new(DispatchQueue::new(queue_capacity)),
                notify: Notify::new(),
            });
            let worker_target = target.clone();

            let worker = match context {
                DeliveryContext::Runtime => {
                    Worker::Task(handle.spawn(deliver(worker_target, delegate)))
                }
                DeliveryContext::Thread(name) => {
                    let handle = handle.clone();
                    let thread = std::thread::Builder::new()
                        .name(name)
                        .spawn(move || handle.block_on(deliver(worker_target, delegate)))?;
                    Worker::Thread(thread)
                }
            };
            targets.push(target);
            workers.push(worker);
        }

        debug!("Event dispatcher started with {} delegate(s)", workers.len());
        Ok(Self {
            sink: EventSink {
                targets: targets.into(),
            },
            workers,
        })
    }

    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    /// Close every queue so workers exit once they have drained it
    fn close(&self) {
        for target in self.sink.targets.iter() {
            target.queue().closed = true;
            target.notify.notify_one();
        }
    }

    /// Close every queue, deliver what is pending and join the workers
    pub async fn shutdown(mut self) {
        self.close();

        for worker in std::mem::take(&mut self.workers) {
            match worker {
                Worker::Task(task) => {
                    if let Err(err) = task.await {
                        warn!("Delegate delivery task failed: {}", err);
                    }
                }
                Worker::Thread(thread) => {
                    let joined = tokio::task::spawn_blocking(move || thread.join()).await;
                    if !matches!(joined, Ok(Ok(()))) {
                        warn!("Delegate delivery thread panicked");
                    }
                }
            }
        }
        debug!("Event dispatcher drained");
    }
}

impl Drop for EventDispatcher {
    /// Workers of a dispatcher dropped without `shutdown` drain and exit
    /// detached.
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            debug!("Event dispatcher dropped without shutdown");
        }
        self.close();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_core::{
        DeviceHandle, IdentityToken, Message, PeerId, PeerIdentity, PeerRecord, RadioState,
        SessionState, Timestamp,
    };
    use nearby_harness::RecordingDelegate;

    fn record(token: u8, signal: f32) -> PeerRecord {
        let identity = PeerIdentity::new(IdentityToken::new([token; 6]), "peer", None);
        PeerRecord {
            peer_id: identity.peer_id(),
            identity,
            device: DeviceHandle::new("dev"),
            first_seen: Timestamp::new(0),
            last_seen: Timestamp::new(0),
            signal,
            session_state: SessionState::Discovered,
        }
    }

    fn updated(token: u8, signal: f32) -> EngineEvent {
        let peer = record(token, signal);
        EngineEvent::PeerUpdated {
            snapshot: vec![peer.clone()].into(),
            peer,
        }
    }

    fn message(n: u8) -> EngineEvent {
        EngineEvent::MessageReceived(Message {
            sender: PeerId::new([n; 8]),
            payload: vec![n],
            timestamp: Timestamp::new(n as u64),
        })
    }

    #[test]
    fn test_queue_supersedes_stale_update() {
        let mut queue = DispatchQueue::new(8);
        assert_eq!(queue.push(updated(1, -60.0)), Enqueued::Queued);
        assert_eq!(queue.push(message(1)), Enqueued::Queued);
        assert_eq!(queue.push(updated(1, -50.0)), Enqueued::Superseded);

        let events = queue.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "message_received");
        match &events[1] {
            EngineEvent::PeerUpdated { peer, .. } => assert_eq!(peer.signal, -50.0),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_queue_evicts_only_peer_updates() {
        let mut queue = DispatchQueue::new(2);
        queue.push(updated(1, -60.0));
        queue.push(message(1));

        // Full: an update for another peer evicts the oldest update
        assert_eq!(queue.push(updated(2, -60.0)), Enqueued::EvictedOldest);
        assert_eq!(queue.len(), 2);

        // Full: a message evicts the remaining update
        assert_eq!(queue.push(message(2)), Enqueued::EvictedOldest);
        // Full of messages: updates are dropped, messages still go in
        assert_eq!(queue.push(updated(3, -60.0)), Enqueued::Dropped);
        assert_eq!(queue.push(message(3)), Enqueued::Queued);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 3);
        assert!(queue.drain().iter().all(|e| e.kind() == "message_received"));
    }

    #[tokio::test]
    async fn test_delivery_in_emission_order() {
        let delegate = Arc::new(RecordingDelegate::new());
        let target: Arc<dyn PeerDelegate> = delegate.clone();
        let dispatcher = EventDispatcher::start(vec![(target, DeliveryContext::Runtime)], 16).unwrap();
        let sink = dispatcher.sink();

        for n in 0..10 {
            sink.emit(message(n));
        }
        sink.emit(EngineEvent::RadioStateChanged(RadioState::Stopped));
        dispatcher.shutdown().await;

        let events = delegate.events();
        assert_eq!(events.len(), 11);
        for (n, event) in events.iter().take(10).enumerate() {
            assert_eq!(event.peer_id(), Some(PeerId::new([n as u8; 8])));
        }

        // Emitting after shutdown is a no-op
        sink.emit(message(42));
        assert_eq!(delegate.events().len(), 11);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_thread_context_delivery() {
        let ui = Arc::new(RecordingDelegate::new());
        let background = Arc::new(RecordingDelegate::new());
        let dispatcher = EventDispatcher::start(
            vec![
                (
                    ui.clone() as Arc<dyn PeerDelegate>,
                    DeliveryContext::Thread("ui-main".into()),
                ),
                (background.clone() as Arc<dyn PeerDelegate>, DeliveryContext::Runtime),
            ],
            16,
        )
        .unwrap();

        dispatcher.sink().emit(message(1));
        dispatcher.sink().emit(message(2));
        dispatcher.shutdown().await;

        assert_eq!(ui.events().len(), 2);
        assert_eq!(background.events().len(), 2);
        assert!(ui
            .threads()
            .iter()
            .all(|name| name.as_deref() == Some("ui-main")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_dispatcher_releases_workers() {
        let ui = Arc::new(RecordingDelegate::new());
        let background = Arc::new(RecordingDelegate::new());
        let dispatcher = EventDispatcher::start(
            vec![
                (
                    ui.clone() as Arc<dyn PeerDelegate>,
                    DeliveryContext::Thread("ui-main".into()),
                ),
                (background.clone() as Arc<dyn PeerDelegate>, DeliveryContext::Runtime),
            ],
            16,
        )
        .unwrap();
        let sink = dispatcher.sink();
        sink.emit(message(1));
        drop(dispatcher);

        // Each worker holds its delegate until it exits
        let released = async {
            while Arc::strong_count(&ui) > 1 || Arc::strong_count(&background) > 1 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), released)
            .await
            .expect("delivery workers should exit after the dispatcher is dropped");
        assert_eq!(ui.events().len(), 1);
        assert_eq!(background.events().len(), 1);

        sink.emit(message(2));
        assert_eq!(ui.events().len(), 1);
    }
}
