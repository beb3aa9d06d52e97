#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation
)]

use crate::common::test_utils::{
    assert_consistent, confirmed_frame, mesh, synchronize_all, tick,
};
use resync_rollback::{DeviceId, DeviceState, Frame, LoopbackNetwork, SessionBuilder};
use serial_test::serial;

const A: DeviceId = DeviceId::new(0);
const B: DeviceId = DeviceId::new(1);

fn input(id: DeviceId, frame: Frame) -> Vec<u8> {
    vec![((frame.as_i32() / 4 + id.as_u32() as i32 * 3) % 5) as u8]
}

#[test]
#[serial]
fn test_sessions_converge_under_loss_and_latency() -> Result<(), String> {
    let network = LoopbackNetwork::new();
    let mut peers = mesh(&network, &SessionBuilder::new(), 2);
    synchronize_all(&mut peers)?;

    network.set_drop_rate(25, 0x5eed);
    network.set_latency_polls(2);
    for _ in 0..300 {
        tick(&mut peers, &input);
    }
    assert!(network.messages_dropped() > 0);

    // unacknowledged input is resent on every frame, so a clean stretch catches up
    network.set_drop_rate(0, 0);
    network.set_latency_polls(0);
    for _ in 0..40 {
        tick(&mut peers, &input);
    }

    let confirmed = confirmed_frame(&peers);
    assert!(confirmed >= 100, "only {} frames confirmed", confirmed);
    assert_consistent(&peers, confirmed, &input);
    for peer in &peers {
        let other = if peer.id == A { B } else { A };
        assert_eq!(peer.session.device_state(other), Some(DeviceState::Running));
    }
    Ok(())
}

#[test]
#[serial]
fn test_one_way_outage_stalls_and_recovers() -> Result<(), String> {
    let network = LoopbackNetwork::new();
    let mut peers = mesh(&network, &SessionBuilder::new(), 2);
    synchronize_all(&mut peers)?;
    for _ in 0..10 {
        tick(&mut peers, &input);
    }

    network.cut_link(B, A);
    for _ in 0..30 {
        tick(&mut peers, &input);
    }
    let stalled_at = peers[0].session.frame();
    assert!(stalled_at - peers[0].session.remote_frame() <= 7);

    network.restore_link(B, A);
    for _ in 0..30 {
        tick(&mut peers, &input);
    }
    assert!(peers[0].session.frame() > stalled_at);
    assert_consistent(&peers, confirmed_frame(&peers), &input);
    Ok(())
}
