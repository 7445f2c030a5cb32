//! Engine session integration tests
//!
//! Drives a full engine against the in-memory radio: discovery, promotion,
//! handshake, messaging and liveness eviction, all on paused time.

use std::sync::Arc;

use nearby_core::protocol::{decode, generate_nonce, verify_echo, Frame};
use nearby_core::{DeviceHandle, TransportError};
use nearby_harness::{MockRadio, MockRadioController, RecordingDelegate};
use nearby_runtime::{
    initiates, DeliveryContext, Engine, EngineBuilder, EngineConfig, EngineError, EngineEvent,
    IdentityToken, PeerId, PeerIdentity, SessionState, Timestamp,
};
use tokio::time::{sleep, timeout, Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

/// (initiator, responder) tokens under the election rule
fn ordered_tokens() -> (IdentityToken, IdentityToken) {
    let a = IdentityToken::new([1; 6]);
    let b = IdentityToken::new([2; 6]);
    if initiates(&a, &b) {
        (a, b)
    } else {
        (b, a)
    }
}

async fn start_engine(token: IdentityToken) -> (Engine, MockRadioController, Arc<RecordingDelegate>) {
    let (radio, controller) = MockRadio::new();
    let delegate = Arc::new(RecordingDelegate::new());
    let engine = EngineBuilder::new(radio)
        .with_config(EngineConfig::testing())
        .with_display_name("local")
        .with_token(token)
        .add_delegate(delegate.clone(), DeliveryContext::Runtime)
        .build_and_start()
        .await
        .expect("engine should start");
    (engine, controller, delegate)
}

fn session_is(peer_id: PeerId, state: SessionState) -> impl Fn(&EngineEvent) -> bool {
    move |event| {
        matches!(event, EngineEvent::SessionStateChanged { peer_id: id, state: s }
            if *id == peer_id && *s == state)
    }
}

fn discovered(peer_id: PeerId) -> impl Fn(&EngineEvent) -> bool {
    move |event| matches!(event, EngineEvent::PeerDiscovered { peer, .. } if peer.peer_id == peer_id)
}

fn updated(peer_id: PeerId) -> impl Fn(&EngineEvent) -> bool {
    move |event| matches!(event, EngineEvent::PeerUpdated { peer, .. } if peer.peer_id == peer_id)
}

fn lost(peer_id: PeerId) -> impl Fn(&EngineEvent) -> bool {
    move |event| matches!(event, EngineEvent::PeerLost { peer_id: id, .. } if *id == peer_id)
}

// ----------------------------------------------------------------------------
// Discovery to Eviction
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_discover_connect_message_and_evict() {
    let (local, remote_token) = ordered_tokens();
    let (mut engine, controller, delegate) = start_engine(local).await;

    let bob = PeerIdentity::new(remote_token, "bob", None);
    let device = DeviceHandle::new("bob-device");
    controller.advertise(&bob, &device, -50).await;

    let (connected, mut remote) = controller
        .next_connection()
        .await
        .expect("engine should connect to a strong peer");
    assert_eq!(connected, device);

    let (_, initiator) = remote
        .accept_handshake(remote_token)
        .await
        .expect("engine should send hello");
    assert_eq!(initiator, local);

    delegate
        .wait_for(session_is(bob.peer_id(), SessionState::Active), WAIT)
        .await
        .expect("session should become active");

    engine
        .send_message(bob.peer_id(), b"hi".to_vec())
        .await
        .expect("send should succeed on an active session");
    match remote.recv_frame().await {
        Some(Frame::Message { payload, .. }) => assert_eq!(payload, b"hi"),
        other => panic!("expected message frame, got {:?}", other),
    }

    remote.send_frame(&Frame::Message {
        timestamp: Timestamp::new(42),
        payload: b"hello back".to_vec(),
    });
    let received = delegate
        .wait_for(|e| matches!(e, EngineEvent::MessageReceived(_)), WAIT)
        .await
        .expect("message should be delivered");
    match received {
        EngineEvent::MessageReceived(message) => {
            assert_eq!(message.sender, bob.peer_id());
            assert_eq!(message.payload, b"hello back");
            assert_eq!(message.timestamp, Timestamp::new(42));
        }
        other => panic!("unexpected event {:?}", other),
    }

    // No further sightings: the peer ages out and takes its session with it
    delegate
        .wait_for(lost(bob.peer_id()), WAIT)
        .await
        .expect("peer should be evicted after the TTL");
    assert_eq!(remote.recv_frame().await, Some(Frame::Goodbye));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.close_count(), 1);

    assert_eq!(
        delegate.session_states(bob.peer_id()),
        vec![
            SessionState::Connecting,
            SessionState::Handshaking,
            SessionState::Active,
            SessionState::Closed,
        ]
    );
    assert_eq!(delegate.count(lost(bob.peer_id())), 1);
    assert!(engine.peers().is_empty());
    assert_eq!(
        engine.send_message(bob.peer_id(), b"late".to_vec()).await,
        Err(EngineError::PeerNotActive {
            peer_id: bob.peer_id()
        })
    );

    // Session closed before the peer was reported lost
    let kinds = delegate.kinds();
    let closed_at = kinds
        .iter()
        .rposition(|k| *k == "session_state_changed")
        .expect("session close reported");
    let lost_at = kinds.iter().position(|k| *k == "peer_lost").expect("peer lost reported");
    assert!(closed_at < lost_at);

    engine.stop().await.expect("stop should succeed");
    assert_eq!(remote.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sightings_in_one_cycle_coalesce() {
    let (local, remote_token) = ordered_tokens();
    let (mut engine, controller, delegate) = start_engine(local).await;

    // Too weak to promote, so only registry events are produced
    let carol = PeerIdentity::new(remote_token, "carol", None);
    let device = DeviceHandle::new("carol-device");
    controller.advertise(&carol, &device, -90).await;
    controller.advertise(&carol, &device, -92).await;

    delegate
        .wait_for(discovered(carol.peer_id()), WAIT)
        .await
        .expect("peer should be discovered");
    assert_eq!(delegate.count(updated(carol.peer_id())), 0);

    controller.advertise(&carol, &device, -88).await;
    controller.advertise(&carol, &device, -86).await;
    delegate
        .wait_for(updated(carol.peer_id()), WAIT)
        .await
        .expect("peer should be updated");

    sleep(Duration::from_millis(1_000)).await;
    assert_eq!(delegate.count(discovered(carol.peer_id())), 1);
    assert_eq!(delegate.count(updated(carol.peer_id())), 1);
    assert!(controller.connect_attempts().is_empty());

    let snapshot = engine.peers();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].session_state, SessionState::Discovered);
    assert!(snapshot[0].signal > -92.0 && snapshot[0].signal < -86.0);

    engine.stop().await.expect("stop should succeed");
}

#[tokio::test(start_paused = true)]
async fn test_sweep_between_sightings_does_not_split_updates() {
    // Windows of 400/100ms: scans run over [400,500), [900,1000), [1400,1500).
    // Sweeps at 470ms intervals land at 1410, inside the third scan.
    let (local, remote_token) = ordered_tokens();
    let origin = Instant::now();
    let (radio, controller) = MockRadio::new();
    let delegate = Arc::new(RecordingDelegate::new());
    let mut engine = EngineBuilder::new(radio)
        .with_config(EngineConfig::testing().with_sweep_interval(Duration::from_millis(470)))
        .with_display_name("local")
        .with_token(local)
        .add_delegate(delegate.clone(), DeliveryContext::Runtime)
        .build_and_start()
        .await
        .expect("engine should start");

    let carol = PeerIdentity::new(remote_token, "carol", None);
    let device = DeviceHandle::new("carol-device");
    controller.advertise(&carol, &device, -90).await;
    delegate
        .wait_for(discovered(carol.peer_id()), WAIT)
        .await
        .expect("peer should be discovered");

    tokio::time::sleep_until(origin + Duration::from_millis(1_405)).await;
    controller.advertise(&carol, &device, -88).await;
    tokio::time::sleep_until(origin + Duration::from_millis(1_450)).await;
    controller.advertise(&carol, &device, -86).await;

    tokio::time::sleep_until(origin + Duration::from_millis(1_900)).await;
    assert_eq!(delegate.count(discovered(carol.peer_id())), 1);
    assert_eq!(delegate.count(updated(carol.peer_id())), 1);
    assert_eq!(engine.peers().len(), 1);

    engine.stop().await.expect("stop should succeed");
}

#[tokio::test(start_paused = true)]
async fn test_handshake_failure_enforces_cooldown() {
    let (local, remote_token) = ordered_tokens();
    let (mut engine, controller, delegate) = start_engine(local).await;

    let dave = PeerIdentity::new(remote_token, "dave", None);
    let device = DeviceHandle::new("dave-device");
    controller.advertise(&dave, &device, -50).await;

    let (_, mut remote) = controller.next_connection().await.expect("first attempt");
    let nonce = match remote.recv_frame().await {
        Some(Frame::Hello { nonce, .. }) => nonce,
        other => panic!("expected hello, got {:?}", other),
    };
    // Echo signed for the wrong token
    remote.send_frame(&Frame::echo_for(&nonce, IdentityToken::new([9; 6])));

    delegate
        .wait_for(session_is(dave.peer_id(), SessionState::Discovered), WAIT)
        .await
        .expect("failed handshake should fall back to discovered");
    let failed_at = Instant::now();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.close_count(), 1);

    while failed_at.elapsed() < Duration::from_millis(1_500) {
        controller.advertise(&dave, &device, -50).await;
        sleep(Duration::from_millis(200)).await;
    }
    let connecting = |d: &RecordingDelegate| {
        d.session_states(dave.peer_id())
            .iter()
            .filter(|s| **s == SessionState::Connecting)
            .count()
    };
    assert_eq!(connecting(delegate.as_ref()), 1);
    assert_eq!(controller.connect_attempts().len(), 1);

    // Once the cooldown has passed the peer is promoted again
    let retry = async {
        while connecting(delegate.as_ref()) < 2 {
            controller.advertise(&dave, &device, -50).await;
            sleep(Duration::from_millis(200)).await;
        }
    };
    timeout(WAIT, retry).await.expect("peer should be retried after the cooldown");
    let (retried, _remote) = controller.next_connection().await.expect("second attempt");
    assert_eq!(retried, device);

    engine.stop().await.expect("stop should succeed");
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_returns_peer_to_discovered() {
    let (local, remote_token) = ordered_tokens();
    let (mut engine, controller, delegate) = start_engine(local).await;

    let erin = PeerIdentity::new(remote_token, "erin", None);
    let device = DeviceHandle::new("erin-device");
    controller.fail_next_connect(&device, TransportError::ConnectFailed("out of range".into()));
    controller.advertise(&erin, &device, -50).await;

    delegate
        .wait_for(session_is(erin.peer_id(), SessionState::Discovered), WAIT)
        .await
        .expect("failed connect should be reported");
    assert_eq!(
        delegate.session_states(erin.peer_id()),
        vec![SessionState::Connecting, SessionState::Discovered]
    );
    assert_eq!(controller.connect_attempts(), vec![device]);

    let stats = engine.stats().await.expect("stats");
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.visible_peers, 1);

    engine.stop().await.expect("stop should succeed");
}

// ----------------------------------------------------------------------------
// Inbound Sessions
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_inbound_session_from_initiating_peer() {
    let (remote_token, local) = ordered_tokens();
    let (mut engine, controller, delegate) = start_engine(local).await;

    let frank = PeerIdentity::new(remote_token, "frank", None);
    let device = DeviceHandle::new("frank-device");
    controller.advertise(&frank, &device, -50).await;
    delegate
        .wait_for(discovered(frank.peer_id()), WAIT)
        .await
        .expect("peer should be discovered");

    // We lose the election, so we wait for frank to connect
    sleep(Duration::from_millis(1_000)).await;
    assert!(controller.connect_attempts().is_empty());

    let mut remote = controller.incoming().await;
    let nonce = generate_nonce();
    let echo = remote
        .initiate_handshake(remote_token, nonce)
        .await
        .expect("engine should answer hello");
    assert!(verify_echo(&echo, &nonce, &local));

    delegate
        .wait_for(session_is(frank.peer_id(), SessionState::Active), WAIT)
        .await
        .expect("inbound session should become active");
    assert_eq!(
        delegate.session_states(frank.peer_id()),
        vec![SessionState::Handshaking, SessionState::Active]
    );

    engine
        .send_message(frank.peer_id(), "ping")
        .await
        .expect("send on inbound session");
    assert!(matches!(remote.recv_frame().await, Some(Frame::Message { .. })));

    remote.send_frame(&Frame::Goodbye);
    delegate
        .wait_for(session_is(frank.peer_id(), SessionState::Closed), WAIT)
        .await
        .expect("remote goodbye should close the session");

    engine.stop().await.expect("stop should succeed");
    assert_eq!(remote.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_from_unknown_token_is_rejected() {
    let (mut engine, controller, delegate) = start_engine(IdentityToken::new([5; 6])).await;

    let mut remote = controller.incoming().await;
    let answer = remote
        .initiate_handshake(IdentityToken::new([7; 6]), generate_nonce())
        .await;
    assert!(answer.is_none());
    sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.close_count(), 1);

    let stats = engine.stats().await.expect("stats");
    assert_eq!(stats.active_sessions, 0);
    assert!(!delegate
        .kinds()
        .contains(&"session_state_changed"));

    engine.stop().await.expect("stop should succeed");
}

// ----------------------------------------------------------------------------
// Registry Invariants
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_each_peer_is_lost_exactly_once() {
    let (mut engine, controller, delegate) = start_engine(IdentityToken::new([5; 6])).await;

    let peers: Vec<PeerIdentity> = (10u8..14)
        .map(|n| PeerIdentity::new(IdentityToken::new([n; 6]), &format!("peer-{}", n), None))
        .collect();
    for (i, peer) in peers.iter().enumerate() {
        let device = DeviceHandle::new(format!("device-{}", i));
        controller.advertise(peer, &device, -90).await;
    }

    for peer in &peers {
        delegate
            .wait_for(discovered(peer.peer_id()), WAIT)
            .await
            .expect("peer should be discovered");
    }
    assert_eq!(engine.peers().len(), peers.len());

    for peer in &peers {
        delegate
            .wait_for(lost(peer.peer_id()), WAIT)
            .await
            .expect("peer should be lost");
    }
    sleep(Duration::from_millis(2_000)).await;

    for peer in &peers {
        assert_eq!(delegate.count(discovered(peer.peer_id())), 1);
        assert_eq!(delegate.count(lost(peer.peer_id())), 1);
    }
    let stats = engine.stats().await.expect("stats");
    assert_eq!(stats.visible_peers, 0);
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.registry.evicted, peers.len() as u64);

    engine.stop().await.expect("stop should succeed");
}

#[tokio::test(start_paused = true)]
async fn test_own_and_malformed_advertisements_are_ignored() {
    let token = IdentityToken::new([5; 6]);
    let (mut engine, controller, delegate) = start_engine(token).await;

    let device = DeviceHandle::new("echo-device");
    controller.advertise(engine.identity(), &device, -40).await;
    controller.advertise_raw(vec![0xff; 5], &device, -40).await;
    sleep(Duration::from_millis(1_000)).await;

    assert!(engine.peers().is_empty());
    assert_eq!(delegate.count(|e| e.peer_id().is_some()), 0);
    let stats = engine.stats().await.expect("stats");
    assert_eq!(stats.scheduler.own_filtered, 1);
    assert_eq!(stats.scheduler.decode_failures, 1);

    engine.stop().await.expect("stop should succeed");
}

// ----------------------------------------------------------------------------
// Shutdown
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_stop_closes_sessions_and_drains_events() {
    let (local, remote_token) = ordered_tokens();
    let (mut engine, controller, delegate) = start_engine(local).await;

    let gina = PeerIdentity::new(remote_token, "gina", None);
    let device = DeviceHandle::new("gina-device");
    controller.advertise(&gina, &device, -50).await;

    let (_, mut remote) = controller.next_connection().await.expect("connection");
    remote.accept_handshake(remote_token).await.expect("hello");
    delegate
        .wait_for(session_is(gina.peer_id(), SessionState::Active), WAIT)
        .await
        .expect("session should become active");

    engine.stop().await.expect("stop should succeed");
    assert!(!engine.is_running());
    assert!(!controller.is_acquired());
    assert_eq!(remote.recv_frame().await, Some(Frame::Goodbye));
    assert_eq!(remote.close_count(), 1);

    // Everything emitted before stop returned has been delivered
    let states = delegate.session_states(gina.peer_id());
    assert_eq!(states.last(), Some(&SessionState::Closed));
    assert_eq!(delegate.kinds().last(), Some(&"radio_state_changed"));
    assert_eq!(
        engine.send_message(gina.peer_id(), "after stop").await,
        Err(EngineError::NotRunning)
    );
}

#[tokio::test(start_paused = true)]
async fn test_advertised_payload_identifies_local_peer() {
    let token = IdentityToken::new([5; 6]);
    let (mut engine, controller, _delegate) = start_engine(token).await;

    let payload = controller
        .advertised_payload()
        .expect("engine should advertise on start");
    let decoded = decode(&payload).expect("payload should decode");
    assert_eq!(decoded.token(), token);
    assert_eq!(decoded.display_name(), "local");

    engine.stop().await.expect("stop should succeed");
}
