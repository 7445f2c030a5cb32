//! Radio lifecycle integration tests
//!
//! Background suspension, adapter power changes, identity updates and the
//! delegate delivery contexts.

use std::sync::Arc;

use nearby_core::protocol::decode;
use nearby_core::{Coordinate, DeviceHandle};
use nearby_harness::{MockRadio, MockRadioController, RadioOp, RecordingDelegate};
use nearby_runtime::{
    DeliveryContext, Engine, EngineBuilder, EngineConfig, EngineError, EngineEvent, IdentityToken,
    PeerIdentity, RadioState,
};
use tokio::time::{sleep, timeout, Duration};

const WAIT: Duration = Duration::from_secs(10);

async fn start_engine() -> (Engine, MockRadioController, Arc<RecordingDelegate>) {
    let (radio, controller) = MockRadio::new();
    let delegate = Arc::new(RecordingDelegate::new());
    let engine = EngineBuilder::new(radio)
        .with_config(EngineConfig::testing())
        .with_display_name("local")
        .with_token(IdentityToken::new([5; 6]))
        .add_delegate(delegate.clone(), DeliveryContext::Runtime)
        .build_and_start()
        .await
        .expect("engine should start");
    (engine, controller, delegate)
}

fn radio_is(state: RadioState) -> impl Fn(&EngineEvent) -> bool {
    move |event| matches!(event, EngineEvent::RadioStateChanged(s) if *s == state)
}

/// Wait until the radio advertises a payload accepted by `accept`
async fn wait_for_payload(
    controller: &MockRadioController,
    accept: impl Fn(&PeerIdentity) -> bool,
) -> PeerIdentity {
    let search = async {
        loop {
            if let Some(identity) = controller
                .advertised_payload()
                .and_then(|payload| decode(&payload).ok())
                .filter(|identity| accept(identity))
            {
                return identity;
            }
            sleep(Duration::from_millis(50)).await;
        }
    };
    timeout(WAIT, search).await.expect("payload should be advertised")
}

// ----------------------------------------------------------------------------
// Background Suspension
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_background_revocation_suspends_and_resumes() {
    let (mut engine, controller, delegate) = start_engine().await;
    delegate
        .wait_for(radio_is(RadioState::Running), WAIT)
        .await
        .expect("engine should report running");

    controller.revoke_background().await;
    delegate
        .wait_for(radio_is(RadioState::Suspended), WAIT)
        .await
        .expect("engine should suspend");
    assert!(controller.advertised_payload().is_none());
    assert!(!controller.is_scanning());
    assert!(controller.is_acquired());

    // Nothing is started while suspended
    controller.clear_ops();
    sleep(Duration::from_millis(2_000)).await;
    assert!(controller.ops().is_empty());
    assert_eq!(engine.stats().await.expect("stats").radio_state, RadioState::Suspended);

    controller.restore_background().await;
    delegate
        .wait_for(|e| {
            matches!(e, EngineEvent::RadioStateChanged(RadioState::Running))
        }, WAIT)
        .await
        .expect("engine should resume");
    let identity = wait_for_payload(&controller, |_| true).await;
    assert_eq!(identity.token(), IdentityToken::new([5; 6]));
    assert!(matches!(controller.ops().first(), Some(RadioOp::StartAdvertising(_))));

    assert_eq!(
        delegate
            .count(|e| matches!(e, EngineEvent::RadioStateChanged(_))),
        3
    );
    engine.stop().await.expect("stop should succeed");
}

// ----------------------------------------------------------------------------
// Adapter Power
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_power_off_requires_restart() {
    let (mut engine, controller, delegate) = start_engine().await;

    controller.power_off().await;
    delegate
        .wait_for(radio_is(RadioState::Unavailable), WAIT)
        .await
        .expect("engine should report the radio unavailable");
    assert!(!controller.is_scanning());
    assert!(controller.advertised_payload().is_none());
    assert!(engine.is_running());

    // Still off: the restart fails and the state is unchanged
    assert!(matches!(
        engine.restart_radio().await,
        Err(EngineError::RadioUnavailable { .. })
    ));

    // Powering on alone does not restart the duty cycle
    controller.power_on().await;
    sleep(Duration::from_millis(1_000)).await;
    assert_eq!(
        engine.stats().await.expect("stats").radio_state,
        RadioState::Unavailable
    );

    engine.restart_radio().await.expect("restart should succeed");
    assert_eq!(engine.stats().await.expect("stats").radio_state, RadioState::Running);
    wait_for_payload(&controller, |_| true).await;

    let states: Vec<RadioState> = delegate
        .events()
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::RadioStateChanged(state) => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![RadioState::Running, RadioState::Unavailable, RadioState::Running]
    );

    engine.stop().await.expect("stop should succeed");
}

#[tokio::test(start_paused = true)]
async fn test_start_with_unavailable_radio() {
    let (radio, controller) = MockRadio::new();
    controller.set_unavailable(true);
    let delegate = Arc::new(RecordingDelegate::new());
    let mut engine = EngineBuilder::new(radio)
        .with_config(EngineConfig::testing())
        .add_delegate(delegate.clone(), DeliveryContext::Runtime)
        .build()
        .expect("config is valid");

    assert!(matches!(
        engine.start().await,
        Err(EngineError::RadioUnavailable { .. })
    ));
    assert!(engine.is_running());
    delegate
        .wait_for(radio_is(RadioState::Unavailable), WAIT)
        .await
        .expect("delegate should hear about the missing radio");

    controller.set_unavailable(false);
    engine.restart_radio().await.expect("restart should succeed");
    assert!(controller.is_acquired());

    engine.stop().await.expect("stop should succeed");
    assert!(!controller.is_acquired());
}

#[tokio::test(start_paused = true)]
async fn test_failed_build_and_start_releases_delegates() {
    let (radio, controller) = MockRadio::new();
    controller.set_unavailable(true);
    let delegate = Arc::new(RecordingDelegate::new());
    let result = EngineBuilder::new(radio)
        .with_config(EngineConfig::testing())
        .add_delegate(delegate.clone(), DeliveryContext::Runtime)
        .build_and_start()
        .await;
    assert!(result.is_err());

    // The dropped engine closes its delivery queue and the worker lets go
    let released = async {
        while Arc::strong_count(&delegate) > 1 {
            sleep(Duration::from_millis(50)).await;
        }
    };
    timeout(WAIT, released)
        .await
        .expect("delivery worker should exit");
    assert_eq!(delegate.count(radio_is(RadioState::Unavailable)), 1);
}

// ----------------------------------------------------------------------------
// Identity Updates
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_rotate_identity_changes_advertisement() {
    let (mut engine, controller, _delegate) = start_engine().await;
    let original = engine.identity().token();

    let rotated = engine.rotate_identity().await.expect("rotation should succeed");
    assert_ne!(rotated, original);

    let advertised = wait_for_payload(&controller, |identity| identity.token() == rotated).await;
    assert_eq!(advertised.display_name(), "local");
    let stats = engine.stats().await.expect("stats");
    assert_eq!(stats.local_identity.token(), rotated);

    // Our previous token is still recognised as our own
    let device = DeviceHandle::new("reflection");
    let previous = PeerIdentity::new(original, "local", None);
    controller.advertise(&previous, &device, -40).await;
    sleep(Duration::from_millis(600)).await;
    assert!(engine.peers().is_empty());

    engine.stop().await.expect("stop should succeed");
}

#[tokio::test(start_paused = true)]
async fn test_set_location_updates_advertisement() {
    let (mut engine, controller, _delegate) = start_engine().await;
    let coordinate = Coordinate::from_degrees(52.52, 13.405).expect("valid coordinate");

    engine
        .set_location(Some(coordinate))
        .await
        .expect("location update should succeed");
    let advertised =
        wait_for_payload(&controller, |identity| identity.coordinate().is_some()).await;
    assert_eq!(advertised.coordinate(), Some(coordinate));

    engine.set_location(None).await.expect("clearing should succeed");
    wait_for_payload(&controller, |identity| identity.coordinate().is_none()).await;

    engine.stop().await.expect("stop should succeed");
}

// ----------------------------------------------------------------------------
// Delivery Contexts
// ----------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_thread_context_delivers_on_named_thread() {
    let (radio, controller) = MockRadio::new();
    let ui = Arc::new(RecordingDelegate::new());
    let background = Arc::new(RecordingDelegate::new());
    let mut engine = EngineBuilder::new(radio)
        .with_config(EngineConfig::testing())
        .with_token(IdentityToken::new([5; 6]))
        .add_delegate(ui.clone(), DeliveryContext::Thread("nearby-ui".into()))
        .add_delegate(background.clone(), DeliveryContext::Runtime)
        .build_and_start()
        .await
        .expect("engine should start");

    let peer = PeerIdentity::new(IdentityToken::new([8; 6]), "henry", None);
    controller
        .advertise(&peer, &DeviceHandle::new("henry-device"), -90)
        .await;

    let discovered = |e: &EngineEvent| matches!(e, EngineEvent::PeerDiscovered { .. });
    ui.wait_for(discovered, WAIT)
        .await
        .expect("ui delegate should see the peer");
    background
        .wait_for(discovered, WAIT)
        .await
        .expect("background delegate should see the peer");

    engine.stop().await.expect("stop should succeed");

    assert!(ui
        .threads()
        .iter()
        .all(|name| name.as_deref() == Some("nearby-ui")));
    assert!(background
        .threads()
        .iter()
        .all(|name| name.as_deref() != Some("nearby-ui")));
    assert_eq!(ui.kinds(), background.kinds());
}
