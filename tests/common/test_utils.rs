//! Session wiring and synchronization helpers shared by the integration tests.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    dead_code
)]

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use resync_rollback::{
    DeviceId, Frame, LoopbackNetwork, LoopbackTransport, Peer2PeerSession, SessionBuilder,
    SessionEvent, Transport,
};

use super::stubs::GameStub;

/// Maximum number of poll rounds before a handshake is considered failed.
pub const MAX_SYNC_ITERATIONS: usize = 2_000;

/// Handshake retries are timed, so synchronization is bounded by wall time as well.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between poll rounds while synchronizing.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// One device of a test session together with the game it drives.
pub struct Peer<T: Transport = LoopbackTransport> {
    pub id: DeviceId,
    pub session: Peer2PeerSession<T>,
    pub game: GameStub,
}

impl<T: Transport> Peer<T> {
    pub fn new(id: DeviceId, session: Peer2PeerSession<T>) -> Self {
        Self {
            id,
            session,
            game: GameStub::new(),
        }
    }

    /// Advances one frame with the input `input` produces for the next frame.
    pub fn advance(&mut self, input: &impl Fn(DeviceId, Frame) -> Vec<u8>) {
        let frame = self.session.frame() + 1;
        let actions = self
            .session
            .advance_frame(&input(self.id, frame))
            .expect("advance_frame failed");
        self.game.handle_actions(actions);
    }
}

/// Routes library logs to the test output. Only the first call installs the subscriber.
pub fn init_tracing() {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .finish();
    // other tests in the same binary may have installed it already
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Builds `count` single-player devices with ids `0..count` that all know each other.
pub fn mesh(network: &LoopbackNetwork, builder: &SessionBuilder, count: u32) -> Vec<Peer> {
    init_tracing();
    let mut peers: Vec<Peer> = (0..count)
        .map(|raw| {
            let id = DeviceId::new(raw);
            let mut session = builder
                .clone()
                .start_p2p_session(network.endpoint(id))
                .unwrap();
            session.set_local_device(id, 1, 0).unwrap();
            Peer::new(id, session)
        })
        .collect();

    for peer in &mut peers {
        for raw in (0..count).filter(|raw| *raw != peer.id.as_u32()) {
            let remote = DeviceId::new(raw);
            peer.session.add_remote_device(remote, 1, remote).unwrap();
        }
    }
    peers
}

/// Polls every session until all of them run and returns the number of poll rounds.
#[track_caller]
pub fn synchronize_all<T: Transport>(peers: &mut [Peer<T>]) -> Result<usize, String> {
    let start = Instant::now();
    let mut iterations = 0;
    while peers.iter().any(|p| !p.session.is_running()) {
        if iterations >= MAX_SYNC_ITERATIONS || start.elapsed() > SYNC_TIMEOUT {
            let states: Vec<_> = peers.iter().map(|p| p.session.state()).collect();
            return Err(format!(
                "synchronization timed out after {} iterations ({:?}), states {:?}",
                iterations,
                start.elapsed(),
                states
            ));
        }
        for peer in peers.iter_mut() {
            peer.session.poll();
        }
        iterations += 1;
        thread::sleep(POLL_INTERVAL);
    }
    Ok(iterations)
}

/// Polls every session, then advances every session by one frame.
pub fn tick<T: Transport>(peers: &mut [Peer<T>], input: &impl Fn(DeviceId, Frame) -> Vec<u8>) {
    for peer in peers.iter_mut() {
        peer.session.poll();
    }
    for peer in peers.iter_mut() {
        peer.advance(input);
    }
}

/// Polls every session `iterations` times with a pause after each round.
pub fn poll_with_sleep<T: Transport>(peers: &mut [Peer<T>], iterations: usize) {
    for _ in 0..iterations {
        for peer in peers.iter_mut() {
            peer.session.poll();
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Drains the events of every session.
pub fn drain_events<T: Transport>(peers: &mut [Peer<T>]) -> Vec<Vec<SessionEvent>> {
    peers
        .iter_mut()
        .map(|p| p.session.events().collect())
        .collect()
}

/// The combined input of `frame`: every device's input, ordered by device id.
pub fn combined_input(
    ids: &[DeviceId],
    frame: Frame,
    input: &impl Fn(DeviceId, Frame) -> Vec<u8>,
) -> Vec<u8> {
    let mut ordered = ids.to_vec();
    ordered.sort();
    ordered.iter().flat_map(|id| input(*id, frame)).collect()
}

/// Lowest sync frame across all peers.
pub fn confirmed_frame<T: Transport>(peers: &[Peer<T>]) -> i32 {
    peers
        .iter()
        .map(|p| p.session.sync_frame().as_i32())
        .min()
        .unwrap_or(0)
}

/// Asserts that every peer simulated frames `1..=up_to` with the true combined input and
/// ended up in the state a fresh replay of those inputs produces.
#[track_caller]
pub fn assert_consistent<T: Transport>(
    peers: &[Peer<T>],
    up_to: i32,
    input: &impl Fn(DeviceId, Frame) -> Vec<u8>,
) {
    let ids: Vec<_> = peers.iter().map(|p| p.id).collect();
    let expected: BTreeMap<i32, Vec<u8>> = (1..=up_to)
        .map(|f| (f, combined_input(&ids, Frame::new(f), input)))
        .collect();
    let reference = GameStub::reference_checksums(&expected);

    for peer in peers {
        for frame in 1..=up_to {
            assert_eq!(
                peer.game.inputs.get(&frame),
                expected.get(&frame),
                "device {} simulated frame {} with the wrong input",
                peer.id,
                frame
            );
            assert_eq!(
                peer.game.checksums.get(&frame),
                reference.get(&frame),
                "device {} diverged at frame {}",
                peer.id,
                frame
            );
        }
    }
}
