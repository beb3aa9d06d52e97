#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation
)]

use std::sync::Arc;

use crate::common::stubs::GameStub;
use crate::common::test_utils::{drain_events, mesh, synchronize_all, tick, Peer};
use resync_rollback::telemetry::{CollectingObserver, ViolationKind};
use resync_rollback::{
    DesyncDetection, DeviceId, DeviceState, Frame, LoopbackNetwork, SessionBuilder,
    SessionEvent, SessionState,
};
use serial_test::serial;

const B: DeviceId = DeviceId::new(1);

fn input(id: DeviceId, frame: Frame) -> Vec<u8> {
    vec![(frame.as_i32() % 7) as u8, id.as_u32() as u8]
}

/// Ticks until device 0 reports a desync and returns every event it raised.
fn run_until_desync(peers: &mut [Peer], max_ticks: usize) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    for _ in 0..max_ticks {
        tick(peers, &input);
        events.extend(peers[0].session.events());
        if events.iter().any(is_desync) {
            break;
        }
    }
    events
}

fn is_desync(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::DesyncDetected { .. })
}

#[test]
#[serial]
fn test_diverging_simulation_is_detected() -> Result<(), String> {
    let observer = Arc::new(CollectingObserver::new());
    let builder = SessionBuilder::new()
        .with_input_size(2)
        .with_desync_detection(DesyncDetection::On { interval: 10 })
        .with_violation_observer(observer.clone());
    let network = LoopbackNetwork::new();
    let mut peers = mesh(&network, &builder, 2);
    peers[1].game = GameStub::corrupting_at(15);
    synchronize_all(&mut peers)?;
    drain_events(&mut peers);

    let events = run_until_desync(&mut peers, 200);
    // local frame 30 is the first multiple of the interval whose checked frame is corrupt
    let Some(&SessionEvent::DesyncDetected {
        frame,
        local_checksum,
        remote_checksum,
        device_id,
    }) = events.iter().find(|e| is_desync(e))
    else {
        panic!("desync was not detected, events {:?}", events);
    };
    assert_eq!(frame, Frame::new(20));
    assert_eq!(device_id, B);
    assert_eq!(peers[0].game.checksums.get(&20), Some(&local_checksum));
    assert_eq!(peers[1].game.checksums.get(&20), Some(&remote_checksum));
    assert_ne!(local_checksum, remote_checksum);

    assert!(peers[0].session.is_desynced());
    assert_eq!(peers[0].session.state(), SessionState::Desynced);
    assert_eq!(
        peers[0].session.device_state(B),
        Some(DeviceState::Disconnected)
    );
    assert!(events.contains(&SessionEvent::Disconnected { device_id: B }));
    assert!(observer
        .violations()
        .iter()
        .any(|v| v.kind == ViolationKind::HealthCheck && v.frame == Some(Frame::new(20))));
    Ok(())
}

#[test]
#[serial]
fn test_identical_simulations_pass_health_checks() -> Result<(), String> {
    let builder = SessionBuilder::new()
        .with_input_size(2)
        .with_desync_detection(DesyncDetection::On { interval: 5 });
    let network = LoopbackNetwork::new();
    let mut peers = mesh(&network, &builder, 2);
    synchronize_all(&mut peers)?;

    assert!(!run_until_desync(&mut peers, 120).iter().any(is_desync));
    assert!(!peers[0].session.is_desynced());
    assert_eq!(peers[0].session.device_state(B), Some(DeviceState::Running));
    Ok(())
}

#[test]
#[serial]
fn test_disabled_detection_never_reports() -> Result<(), String> {
    let builder = SessionBuilder::new()
        .with_input_size(2)
        .with_desync_detection(DesyncDetection::Off);
    let network = LoopbackNetwork::new();
    let mut peers = mesh(&network, &builder, 2);
    peers[1].game = GameStub::corrupting_at(5);
    synchronize_all(&mut peers)?;

    assert!(!run_until_desync(&mut peers, 120).iter().any(is_desync));
    assert_eq!(peers[0].session.state(), SessionState::Running);
    Ok(())
}
