#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

use crate::common::stubs::GameStub;
use crate::common::test_utils::{
    assert_consistent, confirmed_frame, drain_events, mesh, synchronize_all, tick,
};
use resync_rollback::{
    DeviceConfig, DeviceId, DeviceState, Frame, LoopbackNetwork, ResyncError, SessionBuilder,
    SessionEvent, SessionState, MAX_ROLLBACK_FRAMES,
};
use serial_test::serial;

const A: DeviceId = DeviceId::new(0);
const B: DeviceId = DeviceId::new(1);

fn constant_input(id: DeviceId, _frame: Frame) -> Vec<u8> {
    vec![id.as_u32() as u8 + 1]
}

#[test]
#[serial]
fn test_devices_synchronize_with_progress_events() -> Result<(), String> {
    let network = LoopbackNetwork::new();
    let mut peers = mesh(&network, &SessionBuilder::new(), 2);
    assert_eq!(peers[0].session.state(), SessionState::Synchronizing);

    synchronize_all(&mut peers)?;

    let events = drain_events(&mut peers);
    let progress: Vec<_> = events[0]
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Synchronizing {
                device_id,
                count,
                total,
            } if *device_id == B => Some((*count, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(1, 5), (2, 5), (3, 5), (4, 5)]);
    assert!(events[0].contains(&SessionEvent::Synchronized { device_id: B }));
    assert!(events[1].contains(&SessionEvent::Synchronized { device_id: A }));
    assert_eq!(peers[1].session.device_state(A), Some(DeviceState::Running));
    Ok(())
}

#[test]
#[serial]
fn test_advance_before_handshake_is_rejected() {
    let network = LoopbackNetwork::new();
    let mut peers = mesh(&network, &SessionBuilder::new(), 2);
    let result = peers[0].session.advance_frame(&[1]);
    assert_eq!(result.unwrap_err(), ResyncError::NotSynchronized);
}

#[test]
#[serial]
fn test_first_misprediction_rolls_back_to_the_initial_frame() -> Result<(), String> {
    let network = LoopbackNetwork::new();
    let mut peers = mesh(&network, &SessionBuilder::new(), 2);
    synchronize_all(&mut peers)?;

    for _ in 0..40 {
        tick(&mut peers, &constant_input);
    }

    // zeros are predicted until the first real input arrives, after that the held input
    // is always right
    assert_eq!(peers[0].game.loads, vec![0]);
    assert_eq!(peers[1].game.loads, vec![0]);
    assert!(peers[0].session.average_rollback_frames() > 0.0);

    let confirmed = confirmed_frame(&peers);
    assert!(confirmed >= 30, "only {} frames confirmed", confirmed);
    assert_consistent(&peers, confirmed, &constant_input);
    Ok(())
}

#[test]
#[serial]
fn test_input_change_rolls_back_to_the_frame_before_it() -> Result<(), String> {
    let input = |id: DeviceId, frame: Frame| -> Vec<u8> {
        match id.as_u32() {
            0 => vec![1],
            _ if frame < 4 => vec![3],
            _ => vec![5],
        }
    };

    let network = LoopbackNetwork::new();
    let mut peers = mesh(&network, &SessionBuilder::new(), 2);
    synchronize_all(&mut peers)?;

    for _ in 0..30 {
        tick(&mut peers, &input);
    }

    assert_eq!(peers[0].game.loads, vec![0, 3]);
    assert_eq!(peers[1].game.loads, vec![0]);
    assert_eq!(peers[0].game.inputs.get(&4), Some(&vec![1, 5]));
    assert_consistent(&peers, confirmed_frame(&peers), &input);
    Ok(())
}

#[test]
#[serial]
fn test_three_devices_stay_deterministic() -> Result<(), String> {
    let input = |id: DeviceId, frame: Frame| -> Vec<u8> {
        let raw = id.as_u32() as i32;
        vec![((frame.as_i32() / (3 + raw)) % 4) as u8, raw as u8]
    };

    let builder = SessionBuilder::new()
        .with_input_size(2)
        .with_device_count(3)
        .with_total_player_count(3);
    let network = LoopbackNetwork::new();
    let mut peers = mesh(&network, &builder, 3);
    synchronize_all(&mut peers)?;
    drain_events(&mut peers);

    for _ in 0..120 {
        tick(&mut peers, &input);
    }

    let confirmed = confirmed_frame(&peers);
    assert!(confirmed >= 90, "only {} frames confirmed", confirmed);
    assert_consistent(&peers, confirmed, &input);

    for events in drain_events(&mut peers) {
        assert!(!events
            .iter()
            .any(|e| matches!(e, SessionEvent::DesyncDetected { .. })));
    }
    for peer in &peers {
        assert!(peer.session.rollback_frames() <= MAX_ROLLBACK_FRAMES as u32);
        assert_eq!(peer.session.state(), SessionState::Running);
    }
    Ok(())
}

#[test]
#[serial]
fn test_faster_device_waits_for_the_slower_one() -> Result<(), String> {
    let network = LoopbackNetwork::new();
    let mut peers = mesh(&network, &SessionBuilder::new(), 2);
    synchronize_all(&mut peers)?;
    drain_events(&mut peers);

    for _ in 0..60 {
        for peer in peers.iter_mut() {
            peer.session.poll();
        }
        // A tries to run at twice the speed of B
        peers[0].advance(&constant_input);
        peers[0].advance(&constant_input);
        peers[1].advance(&constant_input);

        let lead = peers[0].session.frame() - peers[1].session.frame();
        assert!(lead <= MAX_ROLLBACK_FRAMES, "A leads by {} frames", lead);
    }

    let events = drain_events(&mut peers);
    assert!(events[0]
        .iter()
        .any(|e| matches!(e, SessionEvent::WaitRecommendation { skip_frames } if *skip_frames >= 1)));
    assert_consistent(&peers, confirmed_frame(&peers), &constant_input);
    Ok(())
}

#[test]
#[serial]
fn test_frame_delay_postpones_local_input() -> Result<(), String> {
    let network = LoopbackNetwork::new();
    let builder = SessionBuilder::new();
    let mut a = builder.clone().start_p2p_session(network.endpoint(A)).unwrap();
    let mut b = builder.start_p2p_session(network.endpoint(B)).unwrap();
    a.set_local_device(A, 1, 2).unwrap();
    a.add_remote_device(B, 1, B).unwrap();
    b.set_local_device(B, 1, 0).unwrap();
    b.add_remote_device(A, 1, A).unwrap();

    let mut peers = vec![
        crate::common::Peer::new(A, a),
        crate::common::Peer::new(B, b),
    ];
    synchronize_all(&mut peers)?;

    for _ in 0..20 {
        tick(&mut peers, &constant_input);
    }

    // the first two frames of A carry the blank pre-filled input
    let game: &GameStub = &peers[1].game;
    assert_eq!(game.inputs.get(&1), Some(&vec![0, 2]));
    assert_eq!(game.inputs.get(&2), Some(&vec![0, 2]));
    assert_eq!(game.inputs.get(&3), Some(&vec![1, 2]));
    Ok(())
}

#[test]
#[serial]
fn test_silent_device_is_disconnected() -> Result<(), String> {
    let builder = SessionBuilder::new().with_device_config(DeviceConfig {
        connection_test_limit: 20,
        ..DeviceConfig::default()
    });
    let network = LoopbackNetwork::new();
    let mut peers = mesh(&network, &builder, 2);
    synchronize_all(&mut peers)?;

    for _ in 0..10 {
        tick(&mut peers, &constant_input);
    }
    drain_events(&mut peers);

    network.isolate(B);
    for _ in 0..40 {
        peers[0].session.poll();
        peers[0].advance(&constant_input);
    }

    let events: Vec<_> = peers[0].session.events().collect();
    assert!(events.contains(&SessionEvent::Disconnected { device_id: B }));
    assert_eq!(
        peers[0].session.device_state(B),
        Some(DeviceState::Disconnected)
    );
    // disconnected devices no longer block the handshake state
    assert!(peers[0].session.is_running());
    Ok(())
}

#[test]
#[serial]
fn test_explicit_disconnect_silences_the_other_side() -> Result<(), String> {
    let builder = SessionBuilder::new().with_device_config(DeviceConfig {
        connection_test_limit: 20,
        ..DeviceConfig::default()
    });
    let network = LoopbackNetwork::new();
    let mut peers = mesh(&network, &builder, 2);
    synchronize_all(&mut peers)?;
    for _ in 0..5 {
        tick(&mut peers, &constant_input);
    }
    drain_events(&mut peers);

    peers[0].session.disconnect_device(B).unwrap();
    assert!(peers[0]
        .session
        .events()
        .any(|e| e == SessionEvent::Disconnected { device_id: B }));

    for _ in 0..40 {
        for peer in peers.iter_mut() {
            peer.session.poll();
        }
    }
    assert_eq!(
        peers[1].session.device_state(A),
        Some(DeviceState::Disconnected)
    );
    assert!(peers[1]
        .session
        .events()
        .any(|e| e == SessionEvent::Disconnected { device_id: A }));
    Ok(())
}
