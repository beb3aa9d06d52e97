#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation
)]

use std::thread;
use std::time::Instant;

use crate::common::stubs::{SpectatorStub, StateStub};
use crate::common::test_utils::{combined_input, mesh, Peer, POLL_INTERVAL, SYNC_TIMEOUT};
use resync_rollback::checksum::compute_checksum;
use resync_rollback::network::codec;
use resync_rollback::{
    DeviceId, DeviceState, Frame, LoopbackNetwork, LoopbackTransport, ReplayFile, SessionBuilder,
    SessionEvent, SpectatorSession,
};
use serial_test::serial;

const HOST: DeviceId = DeviceId::new(0);
const SPECTATOR: DeviceId = DeviceId::new(7);

fn input(id: DeviceId, frame: Frame) -> Vec<u8> {
    vec![((frame.as_i32() / 5 + id.as_u32() as i32) % 3) as u8]
}

/// Two players on devices 0 and 1, device 0 also serving a spectator.
fn setup(
    network: &LoopbackNetwork,
    buffer: usize,
) -> (Vec<Peer>, SpectatorSession<LoopbackTransport>) {
    let builder = SessionBuilder::new().with_initial_frame_buffer(buffer);
    let mut peers = mesh(network, &builder, 2);

    let mut spectator = builder
        .start_spectator_session(network.endpoint(SPECTATOR))
        .unwrap();
    spectator.set_local_device(SPECTATOR).unwrap();
    spectator.add_remote_device(HOST, 2, HOST).unwrap();
    peers[0]
        .session
        .add_spectator_device(SPECTATOR, SPECTATOR)
        .unwrap();
    (peers, spectator)
}

#[track_caller]
fn synchronize(peers: &mut [Peer], spectator: &mut SpectatorSession<LoopbackTransport>) {
    let start = Instant::now();
    while !(spectator.is_running() && peers.iter().all(|p| p.session.is_running())) {
        assert!(
            start.elapsed() < SYNC_TIMEOUT,
            "spectator did not synchronize, host state {:?}, spectator state {:?}",
            peers[0].session.state(),
            spectator.state()
        );
        for peer in peers.iter_mut() {
            peer.session.poll();
        }
        spectator.poll();
        thread::sleep(POLL_INTERVAL);
    }
}

#[test]
#[serial]
fn test_spectator_follows_the_host() {
    let network = LoopbackNetwork::new();
    let (mut peers, mut spectator) = setup(&network, 4);
    synchronize(&mut peers, &mut spectator);
    assert!(spectator
        .events()
        .any(|e| e == SessionEvent::Synchronized { device_id: HOST }));

    let mut game = SpectatorStub::default();
    for _ in 0..80 {
        for peer in peers.iter_mut() {
            peer.session.poll();
        }
        spectator.poll();
        for peer in peers.iter_mut() {
            peer.advance(&input);
        }
        game.handle_actions(spectator.advance_frame().unwrap());
    }

    let played = spectator.frame().as_i32();
    assert!(played >= 50, "spectator only played {} frames", played);
    for frame in 1..=played {
        assert_eq!(
            game.checksums.get(&frame),
            peers[0].game.checksums.get(&frame),
            "spectator diverged at frame {}",
            frame
        );
    }
}

#[test]
#[serial]
fn test_spectator_records_a_replay() {
    let network = LoopbackNetwork::new();
    let (mut peers, mut spectator) = setup(&network, 30);
    synchronize(&mut peers, &mut spectator);
    let initial = codec::encode(&StateStub::default()).unwrap();
    spectator.set_initial_state(initial.clone());

    for _ in 0..60 {
        for peer in peers.iter_mut() {
            peer.session.poll();
        }
        spectator.poll();
        for peer in peers.iter_mut() {
            peer.advance(&input);
        }
    }

    let replay = spectator.replay().unwrap();
    assert!(replay.num_frames >= 40, "only {} frames recorded", replay.num_frames);
    assert_eq!(replay.input_size, 2);

    let path = std::env::temp_dir().join(format!(
        "resync-spectator-{}.{}",
        std::process::id(),
        resync_rollback::sessions::replay::REPLAY_FILE_EXTENSION
    ));
    spectator.save_replay(&path).unwrap();
    let loaded = ReplayFile::load_from(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(loaded, replay);

    let ids = [HOST, DeviceId::new(1)];
    let mut state = StateStub::default();
    for (index, frame_input) in loaded.decoded_inputs().unwrap().iter().enumerate() {
        let frame = index as i32 + 1;
        assert_eq!(frame_input, &combined_input(&ids, Frame::new(frame), &input));
        state.advance(frame_input);
        assert_eq!(
            Some(&compute_checksum(&state).unwrap()),
            peers[0].game.checksums.get(&frame),
            "replay diverged at frame {}",
            frame
        );
    }
    assert_eq!(loaded.decoded_initial_state().unwrap(), initial);
}

#[test]
#[serial]
fn test_spectator_does_not_take_a_player_slot() {
    let network = LoopbackNetwork::new();
    let (mut peers, mut spectator) = setup(&network, 0);
    // both player slots are taken, the spectator was still accepted
    assert!(peers[0]
        .session
        .add_remote_device(DeviceId::new(3), 1, DeviceId::new(3))
        .is_err());
    synchronize(&mut peers, &mut spectator);
    assert_eq!(spectator.host_state(), Some(DeviceState::Running));
    assert_eq!(
        peers[0].session.device_state(SPECTATOR),
        Some(DeviceState::Running)
    );
}
