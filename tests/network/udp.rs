#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation
)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::thread;

use crate::common::test_utils::{
    assert_consistent, confirmed_frame, synchronize_all, tick, Peer, POLL_INTERVAL,
};
use resync_rollback::{DeviceId, Frame, SessionBuilder, UdpTransport};
use serial_test::serial;

const A: DeviceId = DeviceId::new(0);
const B: DeviceId = DeviceId::new(1);

fn localhost() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

fn input(id: DeviceId, frame: Frame) -> Vec<u8> {
    vec![(frame.as_i32() / 3 % 4) as u8, id.as_u32() as u8]
}

#[test]
#[serial]
fn test_udp_sessions_synchronize_and_advance() -> Result<(), String> {
    let transport_a = UdpTransport::bind(localhost()).unwrap();
    let transport_b = UdpTransport::bind(localhost()).unwrap();
    let addr_a = transport_a.local_addr().unwrap();
    let addr_b = transport_b.local_addr().unwrap();

    let builder = SessionBuilder::new().with_input_size(2);
    let mut a = builder.clone().start_p2p_session(transport_a).unwrap();
    let mut b = builder.start_p2p_session(transport_b).unwrap();
    a.set_local_device(A, 1, 0).unwrap();
    b.set_local_device(B, 1, 0).unwrap();
    a.add_remote_device(B, 1, addr_b).unwrap();
    b.add_remote_device(A, 1, addr_a).unwrap();

    let mut peers = vec![Peer::new(A, a), Peer::new(B, b)];
    synchronize_all(&mut peers)?;

    for _ in 0..60 {
        tick(&mut peers, &input);
        thread::sleep(POLL_INTERVAL);
    }

    let confirmed = confirmed_frame(&peers);
    assert!(confirmed >= 30, "only {} frames confirmed", confirmed);
    assert_consistent(&peers, confirmed, &input);
    assert!(peers[0].session.device_rtt(B).is_some());
    Ok(())
}
