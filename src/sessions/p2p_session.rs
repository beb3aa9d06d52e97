use std::collections::vec_deque::Drain;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};
use web_time::Instant;

use crate::network::device::{Device, DeviceEvent};
use crate::network::messages::input_frame_count;
use crate::report_violation_to;
use crate::sessions::config::SessionConfig;
use crate::sync_layer::SyncLayer;
use crate::telemetry::{
    report_to_observer, InvariantChecker, InvariantViolation, Violation, ViolationKind,
    ViolationObserver, ViolationSeverity,
};
use crate::{
    Action, DesyncDetection, DeviceId, DeviceState, DeviceType, Frame, ResyncError,
    SessionEvent, SessionState, Transport, HEALTH_CHECK_FRAMES_BEHIND, INPUT_QUEUE_LENGTH,
};

/// Maximum number of events to queue before the oldest are dropped.
const MAX_EVENT_QUEUE_SIZE: usize = 256;

/// A [`Peer2PeerSession`] connects the local device to its remote devices and spectators,
/// exchanges inputs with them and tells the host when to save, load and advance its
/// simulation.
///
/// Call [`poll`](Self::poll) once per tick, then
/// [`advance_frame`](Self::advance_frame) once [`is_running`](Self::is_running) holds.
pub struct Peer2PeerSession<T: Transport> {
    config: SessionConfig,
    transport: T,
    sync: SyncLayer,
    /// Endpoints of every remote device and spectator.
    devices: BTreeMap<DeviceId, Device>,
    local_id: Option<DeviceId>,
    local_player_count: usize,
    desynced: bool,
    /// The soonest frame on which another [`SessionEvent::WaitRecommendation`] may be sent.
    next_wait_recommendation: Frame,
    last_health_check_frame: Frame,
    event_queue: VecDeque<SessionEvent>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Transport> std::fmt::Debug for Peer2PeerSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer2PeerSession")
            .field("config", &self.config)
            .field("local_id", &self.local_id)
            .field("devices", &self.devices)
            .field("sync", &self.sync)
            .field("desynced", &self.desynced)
            .field("pending_events", &self.event_queue.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Peer2PeerSession<T> {
    /// Creates an empty session. Use [`SessionBuilder`](crate::SessionBuilder), which
    /// validates `config` first.
    pub(crate) fn new(
        config: SessionConfig,
        transport: T,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        Self {
            sync: SyncLayer::new(
                config.input_size,
                config.time_sync,
                violation_observer.clone(),
            ),
            config,
            transport,
            devices: BTreeMap::new(),
            local_id: None,
            local_player_count: 0,
            desynced: false,
            next_wait_recommendation: Frame::INITIAL,
            last_health_check_frame: Frame::NULL,
            event_queue: VecDeque::new(),
            violation_observer,
        }
    }

    /// Registers the local device. Must be called before any other device is added.
    ///
    /// `frame_delay` postpones every local input by that many frames, which trades input
    /// latency for fewer rollbacks.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if the local device is already set or the player
    ///   count or delay is out of bounds.
    ///
    /// [`InvalidRequest`]: ResyncError::InvalidRequest
    pub fn set_local_device(
        &mut self,
        id: DeviceId,
        player_count: usize,
        frame_delay: usize,
    ) -> Result<(), ResyncError> {
        if self.local_id.is_some() {
            return Err(ResyncError::InvalidRequest {
                info: "the local device is already set".to_owned(),
            });
        }
        if player_count == 0 || player_count > self.config.total_player_count {
            return Err(ResyncError::InvalidRequest {
                info: format!(
                    "the local device cannot host {} of {} players",
                    player_count, self.config.total_player_count
                ),
            });
        }
        if frame_delay >= INPUT_QUEUE_LENGTH {
            return Err(ResyncError::InvalidRequest {
                info: format!(
                    "frame delay {} must be below {}",
                    frame_delay, INPUT_QUEUE_LENGTH
                ),
            });
        }

        self.sync
            .add_device(id, DeviceType::Local, player_count, frame_delay)?;
        self.local_id = Some(id);
        self.local_player_count = player_count;
        debug!(device = %id, players = player_count, frame_delay, "local device set");
        Ok(())
    }

    fn require_local(&self) -> Result<DeviceId, ResyncError> {
        self.local_id.ok_or_else(|| ResyncError::InvalidRequest {
            info: "set_local_device must be called first".to_owned(),
        })
    }

    /// Registers a remote device hosting `player_count` players, reachable at `address`,
    /// and starts the handshake with it.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if the local device is not set yet, the id is taken,
    ///   or the session would exceed its device or player count.
    ///
    /// [`InvalidRequest`]: ResyncError::InvalidRequest
    pub fn add_remote_device(
        &mut self,
        id: DeviceId,
        player_count: usize,
        address: T::Address,
    ) -> Result<(), ResyncError> {
        let local_id = self.require_local()?;
        let player_devices = self
            .sync
            .devices()
            .filter(|d| d.kind != DeviceType::Spectator)
            .count();
        if player_devices >= self.config.device_count {
            return Err(ResyncError::InvalidRequest {
                info: format!(
                    "the session already holds {} devices",
                    self.config.device_count
                ),
            });
        }
        let players = self.sync.total_player_count() + player_count;
        if player_count == 0 || players > self.config.total_player_count {
            return Err(ResyncError::InvalidRequest {
                info: format!(
                    "device {} with {} players exceeds the {} players of the session",
                    id, player_count, self.config.total_player_count
                ),
            });
        }

        self.sync
            .add_device(id, DeviceType::Remote, player_count, 0)?;
        let device = Device::new(
            local_id,
            self.local_player_count as u32,
            id,
            DeviceType::Remote,
            player_count as u32,
            self.config.device,
            self.violation_observer.clone(),
        );
        self.attach(id, device, address);
        Ok(())
    }

    /// Registers a spectator reachable at `address`. Spectators receive the confirmed
    /// combined input of every player and never contribute input.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if the local device is not set yet or the id is taken.
    ///
    /// [`InvalidRequest`]: ResyncError::InvalidRequest
    pub fn add_spectator_device(
        &mut self,
        id: DeviceId,
        address: T::Address,
    ) -> Result<(), ResyncError> {
        let local_id = self.require_local()?;
        self.sync.add_device(id, DeviceType::Spectator, 0, 0)?;
        // the spectator's stream carries every player of the session
        let device = Device::new(
            local_id,
            self.config.total_player_count as u32,
            id,
            DeviceType::Spectator,
            0,
            self.config.device,
            self.violation_observer.clone(),
        );
        self.attach(id, device, address);
        Ok(())
    }

    fn attach(&mut self, id: DeviceId, mut device: Device, address: T::Address) {
        debug!(device = %id, kind = ?device.kind(), ?address, "device added");
        self.transport.add_remote(id, address);
        device.start_syncing(Instant::now());
        device.send_all_messages(&mut self.transport);
        self.devices.insert(id, device);
    }

    /// Receives and handles every pending message, runs handshake, liveness and ping
    /// timers, compares due health checks and sends everything queued.
    ///
    /// Never blocks. Call it once per tick, also while the session is synchronizing.
    pub fn poll(&mut self) {
        let now = Instant::now();
        for (from, message) in self.transport.receive_from() {
            match self.devices.get_mut(&from) {
                Some(device) => device.handle_message(&message, now),
                None => trace!(device = %from, "message from unregistered device dropped"),
            }
        }

        let mut pending = Vec::new();
        for (id, device) in &mut self.devices {
            pending.extend(device.poll(now).map(|event| (*id, event)));
        }
        for (id, event) in pending {
            self.handle_device_event(id, event);
        }

        self.compare_health_checks(now);

        for device in self.devices.values_mut() {
            device.send_all_messages(&mut self.transport);
        }
    }

    fn handle_device_event(&mut self, id: DeviceId, event: DeviceEvent) {
        match event {
            DeviceEvent::Synchronizing { total, count } => {
                self.push_event(SessionEvent::Synchronizing {
                    device_id: id,
                    total,
                    count,
                });
            }
            DeviceEvent::Synchronized => {
                self.sync.set_device_state(id, DeviceState::Running);
                self.push_event(SessionEvent::Synchronized { device_id: id });
            }
            DeviceEvent::Input {
                start_frame,
                end_frame,
                frame_advantage,
                input_bytes,
            } => self.on_remote_input(id, start_frame, end_frame, frame_advantage, &input_bytes),
            DeviceEvent::InputAck { frame } => self.sync.acknowledge(id, frame),
            DeviceEvent::Disconnected => {
                self.sync.set_device_state(id, DeviceState::Disconnected);
                self.push_event(SessionEvent::Disconnected { device_id: id });
            }
        }
    }

    fn on_remote_input(
        &mut self,
        id: DeviceId,
        start_frame: Frame,
        end_frame: Frame,
        frame_advantage: i32,
        input_bytes: &[u8],
    ) {
        let Some(record) = self.sync.device(id) else {
            return;
        };
        if record.kind != DeviceType::Remote {
            trace!(device = %id, "input from a spectator ignored");
            return;
        }
        let frame_size = self.config.input_size * record.player_count;
        let expected_len = input_frame_count(start_frame, end_frame)
            .and_then(|count| count.checked_mul(frame_size));
        if expected_len != Some(input_bytes.len()) {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::DeviceProtocol,
                "device {} sent {} bytes for frames {}..={}, expected {} per frame",
                id,
                input_bytes.len(),
                start_frame,
                end_frame,
                frame_size
            );
            return;
        }

        // offsets stay below the validated count, so every frame lies in start..=end
        for (offset, chunk) in input_bytes.chunks_exact(frame_size).enumerate() {
            let frame = start_frame + offset as i32;
            self.sync
                .add_remote_input(id, frame, frame_advantage, chunk);
        }

        // re-acknowledge even when everything was a duplicate, the last ack may have been lost
        let received = self.sync.device(id).map_or(Frame::NULL, |d| d.remote_frame);
        if received >= Frame::new(1) {
            if let Some(device) = self.devices.get_mut(&id) {
                device.send_input_ack(received);
            }
        }
    }

    fn compare_health_checks(&mut self, now: Instant) {
        let sync_frame = self.sync.sync_frame();
        let mut mismatches = Vec::new();
        for (id, device) in &mut self.devices {
            for (frame, remote_checksum) in device.take_health_due(sync_frame) {
                let Some(local_checksum) = self.sync.confirmed_checksum(frame) else {
                    trace!(device = %id, frame = %frame, "health check for unknown frame skipped");
                    continue;
                };
                if local_checksum != remote_checksum {
                    mismatches.push((*id, frame, local_checksum, remote_checksum));
                    break;
                }
            }
        }

        for (device_id, frame, local_checksum, remote_checksum) in mismatches {
            let violation = Violation::new(
                ViolationSeverity::Error,
                ViolationKind::HealthCheck,
                format!(
                    "device {} reported checksum {:#010x}, ours is {:#010x}",
                    device_id, remote_checksum, local_checksum
                ),
                concat!(file!(), ":", line!()),
            )
            .with_frame(frame);
            report_to_observer(self.violation_observer.as_ref(), &violation);
            self.desynced = true;
            self.push_event(SessionEvent::DesyncDetected {
                frame,
                local_checksum,
                remote_checksum,
                device_id,
            });
            self.drop_device(device_id, now);
        }
    }

    fn drop_device(&mut self, id: DeviceId, now: Instant) {
        let Some(device) = self.devices.get_mut(&id) else {
            return;
        };
        device.disconnect();
        let events: Vec<_> = device.poll(now).collect();
        for event in events {
            self.handle_device_event(id, event);
        }
    }

    /// Advances the session by one frame with `local_input`, the input of every local
    /// player back to back.
    ///
    /// The returned actions must be executed in order before the next call. If the local
    /// simulation is too far ahead, no new frame is admitted: the actions then only hold
    /// a pending rollback (if any) and a [`SessionEvent::WaitRecommendation`] is queued.
    ///
    /// # Errors
    /// - Returns [`NotSynchronized`] while some device is still synchronizing.
    /// - Returns [`InvalidRequest`] if `local_input` does not hold `input_size` bytes per
    ///   local player.
    ///
    /// [`NotSynchronized`]: ResyncError::NotSynchronized
    /// [`InvalidRequest`]: ResyncError::InvalidRequest
    pub fn advance_frame(&mut self, local_input: &[u8]) -> Result<Vec<Action>, ResyncError> {
        if !self.is_running() {
            return Err(ResyncError::NotSynchronized);
        }
        let expected = self.config.input_size * self.local_player_count;
        if local_input.len() != expected {
            return Err(ResyncError::InvalidRequest {
                info: format!(
                    "expected {} bytes of local input, got {}",
                    expected,
                    local_input.len()
                ),
            });
        }

        let step = self.sync.advance_sync(local_input)?;
        if step.admitted {
            self.send_health_check();
        } else {
            self.check_wait_recommendation();
        }

        for (id, range) in self.sync.drain_outbox() {
            if let Some(device) = self.devices.get_mut(&id) {
                device.send_input(&range);
            }
        }

        crate::debug_check_invariants!(self);
        Ok(step.actions)
    }

    fn check_wait_recommendation(&mut self) {
        let frame = self.sync.local_frame();
        if frame < self.next_wait_recommendation {
            return;
        }
        self.next_wait_recommendation = frame + self.config.wait_recommendation_interval as i32;
        let difference = self.sync.time_sync().frame_advantage_difference;
        let skip_frames = difference.max(1) as u32;
        debug!(frame = %frame, skip_frames, "recommending to wait");
        self.push_event(SessionEvent::WaitRecommendation { skip_frames });
    }

    fn send_health_check(&mut self) {
        let DesyncDetection::On { interval } = self.config.desync_detection else {
            return;
        };
        let local_frame = self.sync.local_frame();
        if local_frame.as_i32() % interval as i32 != 0 {
            return;
        }
        let frame = local_frame - HEALTH_CHECK_FRAMES_BEHIND;
        if frame < Frame::new(1) || frame <= self.last_health_check_frame {
            return;
        }
        let Some(checksum) = self.sync.confirmed_checksum(frame) else {
            trace!(frame = %frame, "no confirmed checksum to report");
            return;
        };
        self.last_health_check_frame = frame;
        trace!(frame = %frame, checksum, "sending health check");
        for device in self
            .devices
            .values_mut()
            .filter(|d| d.kind() == DeviceType::Remote)
        {
            device.send_health_check(frame, checksum);
        }
    }

    fn push_event(&mut self, event: SessionEvent) {
        if self.event_queue.len() >= MAX_EVENT_QUEUE_SIZE {
            self.event_queue.pop_front();
        }
        self.event_queue.push_back(event);
    }

    /// Returns all events that happened since last queried for events. If the number of
    /// stored events exceeds `MAX_EVENT_QUEUE_SIZE`, the oldest events are discarded.
    pub fn events(&mut self) -> Drain<'_, SessionEvent> {
        self.event_queue.drain(..)
    }

    /// Disconnects a remote device or spectator.
    ///
    /// # Errors
    /// - Returns [`UnknownDevice`] if `id` was never added.
    /// - Returns [`InvalidRequest`] for the local device or an already disconnected one.
    ///
    /// [`UnknownDevice`]: ResyncError::UnknownDevice
    /// [`InvalidRequest`]: ResyncError::InvalidRequest
    pub fn disconnect_device(&mut self, id: DeviceId) -> Result<(), ResyncError> {
        if Some(id) == self.local_id {
            return Err(ResyncError::InvalidRequest {
                info: "the local device cannot be disconnected".to_owned(),
            });
        }
        let state = self
            .devices
            .get(&id)
            .map(Device::state)
            .ok_or(ResyncError::UnknownDevice { device_id: id })?;
        if state == DeviceState::Disconnected {
            return Err(ResyncError::InvalidRequest {
                info: format!("device {} is already disconnected", id),
            });
        }
        self.drop_device(id, Instant::now());
        Ok(())
    }

    /// `true` once the local device is set and no device is still synchronizing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.local_id.is_some()
            && self
                .devices
                .values()
                .all(|d| d.state() != DeviceState::Syncing)
    }

    /// The coarse session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.desynced {
            SessionState::Desynced
        } else if self.is_running() {
            SessionState::Running
        } else {
            SessionState::Synchronizing
        }
    }

    /// `true` once a health check failed.
    #[must_use]
    pub fn is_desynced(&self) -> bool {
        self.desynced
    }

    /// Highest frame the local simulation reached.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.sync.local_frame()
    }

    /// Highest frame with confirmed input from every device.
    #[must_use]
    pub fn sync_frame(&self) -> Frame {
        self.sync.sync_frame()
    }

    /// Slowest frame received from the remote devices.
    #[must_use]
    pub fn remote_frame(&self) -> Frame {
        self.sync.remote_frame()
    }

    /// How many frames the local simulation is ahead of the slowest remote device.
    #[must_use]
    pub fn frame_advantage(&self) -> i32 {
        self.sync.time_sync().local_frame_advantage
    }

    /// Largest frame advantage a remote device reported.
    #[must_use]
    pub fn remote_frame_advantage(&self) -> i32 {
        self.sync.time_sync().remote_frame_advantage
    }

    /// `frame_advantage() - remote_frame_advantage()`.
    #[must_use]
    pub fn frame_advantage_difference(&self) -> i32 {
        self.sync.time_sync().frame_advantage_difference
    }

    /// Frames resimulated by the most recent rollback.
    #[must_use]
    pub fn rollback_frames(&self) -> u32 {
        self.sync.rollback_frames()
    }

    /// Average length of all rollbacks so far.
    #[must_use]
    pub fn average_rollback_frames(&self) -> f64 {
        self.sync.average_rollback_frames()
    }

    /// Connection state of any registered device, the local one included.
    #[must_use]
    pub fn device_state(&self, id: DeviceId) -> Option<DeviceState> {
        match self.devices.get(&id) {
            Some(device) => Some(device.state()),
            None => self.sync.device(id).map(|d| d.state),
        }
    }

    /// Last measured round trip to a remote device or spectator, in milliseconds.
    #[must_use]
    pub fn device_rtt(&self, id: DeviceId) -> Option<u64> {
        self.devices.get(&id).and_then(Device::rtt_ms)
    }

    /// The session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The transport, for adapters that expose diagnostics.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The violation observer, if one was set.
    #[must_use]
    pub fn violation_observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.violation_observer.as_ref()
    }
}

impl<T: Transport> InvariantChecker for Peer2PeerSession<T> {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for device in self.devices.values() {
            let Some(record) = self.sync.device(device.peer_id()) else {
                return Err(InvariantViolation::new(
                    "Peer2PeerSession",
                    "endpoint without a sync record",
                )
                .with_details(format!("device={}", device.peer_id())));
            };
            // the sync record only ever lags the endpoint by one poll
            if device.state() == DeviceState::Syncing && record.state == DeviceState::Running {
                return Err(InvariantViolation::new(
                    "Peer2PeerSession",
                    "sync record running ahead of its endpoint",
                )
                .with_details(format!("device={}", device.peer_id())));
            }
        }
        self.sync.check_invariants()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::{Message, MessageBody};
    use crate::{LoopbackNetwork, LoopbackTransport, SessionBuilder};

    const A: DeviceId = DeviceId::new(0);
    const B: DeviceId = DeviceId::new(1);

    fn session(network: &LoopbackNetwork, id: DeviceId) -> Peer2PeerSession<LoopbackTransport> {
        SessionBuilder::new()
            .with_input_size(1)
            .start_p2p_session(network.endpoint(id))
            .unwrap()
    }

    fn pair() -> (
        Peer2PeerSession<LoopbackTransport>,
        Peer2PeerSession<LoopbackTransport>,
    ) {
        let network = LoopbackNetwork::new();
        let mut a = session(&network, A);
        let mut b = session(&network, B);
        a.set_local_device(A, 1, 0).unwrap();
        a.add_remote_device(B, 1, B).unwrap();
        b.set_local_device(B, 1, 0).unwrap();
        b.add_remote_device(A, 1, A).unwrap();
        (a, b)
    }

    /// The first request of whichever side registers first is lost, so this waits for
    /// at least one handshake retry.
    fn synchronize(
        a: &mut Peer2PeerSession<LoopbackTransport>,
        b: &mut Peer2PeerSession<LoopbackTransport>,
    ) {
        let start = Instant::now();
        while start.elapsed() < std::time::Duration::from_secs(5) {
            a.poll();
            b.poll();
            if a.is_running() && b.is_running() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        panic!("sessions did not synchronize");
    }

    /// `a` with B registered as its remote, where B is a bare endpoint driven by the test.
    fn with_raw_peer(
        network: &LoopbackNetwork,
        observer: &Arc<crate::telemetry::CollectingObserver>,
    ) -> (Peer2PeerSession<LoopbackTransport>, LoopbackTransport) {
        let mut raw = network.endpoint(B);
        raw.add_remote(A, A);
        let mut a = SessionBuilder::new()
            .with_input_size(1)
            .with_violation_observer(observer.clone())
            .start_p2p_session(network.endpoint(A))
            .unwrap();
        a.set_local_device(A, 1, 0).unwrap();
        a.add_remote_device(B, 1, B).unwrap();

        let start = Instant::now();
        while !a.is_running() {
            assert!(
                start.elapsed() < std::time::Duration::from_secs(5),
                "raw peer handshake did not finish"
            );
            for (_, message) in raw.receive_from() {
                if let MessageBody::SyncRequest { nonce, .. } = message.body {
                    send_raw(
                        &mut raw,
                        MessageBody::SyncConfirm {
                            device_id: B,
                            player_count: 1,
                            echoed_nonce: nonce,
                        },
                    );
                }
            }
            a.poll();
        }
        (a, raw)
    }

    fn send_raw(raw: &mut LoopbackTransport, body: MessageBody) {
        raw.send_to(A, &Message { sequence: 0, body });
    }

    fn raw_input(start: i32, end: i32, input_bytes: Vec<u8>) -> MessageBody {
        MessageBody::Input {
            start_frame: Frame::new(start),
            end_frame: Frame::new(end),
            frame_advantage: 0,
            input_bytes,
        }
    }

    #[test]
    fn malformed_input_ranges_are_dropped() {
        let network = LoopbackNetwork::new();
        let observer = Arc::new(crate::telemetry::CollectingObserver::new());
        let (mut a, mut raw) = with_raw_peer(&network, &observer);

        send_raw(&mut raw, raw_input(0, i32::MAX, vec![1]));
        send_raw(&mut raw, raw_input(i32::MIN, i32::MAX, vec![1]));
        send_raw(&mut raw, raw_input(-5, 1, vec![1; 7]));
        send_raw(&mut raw, raw_input(4, 2, Vec::new()));
        send_raw(&mut raw, raw_input(i32::MAX, i32::MAX, vec![1]));
        a.poll();
        assert!(observer.has_violation(ViolationKind::DeviceProtocol));
        assert_eq!(a.sync.device(B).unwrap().remote_frame, Frame::INITIAL);

        // well-formed input still gets through afterwards
        send_raw(&mut raw, raw_input(1, 2, vec![3, 4]));
        a.poll();
        assert_eq!(a.sync.device(B).unwrap().remote_frame, Frame::new(2));
        assert_eq!(a.device_state(B), Some(DeviceState::Running));
    }

    #[test]
    fn ack_for_unsent_frames_is_ignored() {
        let network = LoopbackNetwork::new();
        let observer = Arc::new(crate::telemetry::CollectingObserver::new());
        let (mut a, mut raw) = with_raw_peer(&network, &observer);

        send_raw(&mut raw, MessageBody::InputAck { frame: Frame::new(i32::MAX) });
        send_raw(&mut raw, MessageBody::InputAck { frame: Frame::new(1000) });
        a.poll();
        assert!(observer.has_violation(ViolationKind::DeviceProtocol));

        a.advance_frame(&[5]).unwrap();
        a.advance_frame(&[6]).unwrap();
        a.poll();
        let starts: Vec<_> = raw
            .receive_from()
            .into_iter()
            .filter_map(|(_, m)| match m.body {
                MessageBody::Input { start_frame, end_frame, .. } => Some((start_frame, end_frame)),
                _ => None,
            })
            .collect();
        assert!(starts.contains(&(Frame::new(1), Frame::new(2))), "{:?}", starts);
    }

    #[test]
    fn remote_before_local_is_rejected() {
        let network = LoopbackNetwork::new();
        let mut a = session(&network, A);
        let result = a.add_remote_device(B, 1, B);
        assert!(matches!(result, Err(ResyncError::InvalidRequest { .. })));
    }

    #[test]
    fn local_device_is_set_once() {
        let network = LoopbackNetwork::new();
        let mut a = session(&network, A);
        a.set_local_device(A, 1, 0).unwrap();
        assert!(a.set_local_device(A, 1, 0).is_err());
    }

    #[test]
    fn local_bounds_are_checked() {
        let network = LoopbackNetwork::new();
        let mut a = session(&network, A);
        assert!(a.set_local_device(A, 0, 0).is_err());
        assert!(a.set_local_device(A, 3, 0).is_err());
        assert!(a.set_local_device(A, 1, INPUT_QUEUE_LENGTH).is_err());
        a.set_local_device(A, 2, 4).unwrap();
    }

    #[test]
    fn player_and_device_counts_are_enforced() {
        let network = LoopbackNetwork::new();
        let mut a = session(&network, A);
        a.set_local_device(A, 1, 0).unwrap();
        assert!(a.add_remote_device(B, 2, B).is_err());
        a.add_remote_device(B, 1, B).unwrap();
        assert!(a.add_remote_device(DeviceId::new(2), 1, DeviceId::new(2)).is_err());
        assert!(a.add_remote_device(B, 1, B).is_err());
    }

    #[test]
    fn starts_synchronizing() {
        let (a, _b) = pair();
        assert!(!a.is_running());
        assert_eq!(a.state(), SessionState::Synchronizing);
        assert_eq!(a.device_state(B), Some(DeviceState::Syncing));
        assert_eq!(a.device_state(A), Some(DeviceState::Running));
        assert_eq!(a.device_state(DeviceId::new(9)), None);
    }

    #[test]
    fn advance_before_sync_fails() {
        let (mut a, _b) = pair();
        assert_eq!(a.advance_frame(&[0]).unwrap_err(), ResyncError::NotSynchronized);
    }

    #[test]
    fn handshake_emits_events() {
        let (mut a, mut b) = pair();
        synchronize(&mut a, &mut b);
        let events: Vec<_> = a.events().collect();
        assert!(events.contains(&SessionEvent::Synchronized { device_id: B }));
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Synchronizing { device_id, .. } if *device_id == B)));
        assert_eq!(a.state(), SessionState::Running);
    }

    #[test]
    fn wrong_input_size_is_rejected() {
        let (mut a, mut b) = pair();
        synchronize(&mut a, &mut b);
        assert!(matches!(
            a.advance_frame(&[1, 2]),
            Err(ResyncError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn first_advance_saves_the_initial_frame() {
        let (mut a, mut b) = pair();
        synchronize(&mut a, &mut b);
        let actions = a.advance_frame(&[7]).unwrap();
        let frames: Vec<_> = actions.iter().map(|a| (a.frame().as_i32(), kind(a))).collect();
        assert_eq!(frames, vec![(0, "save"), (1, "advance"), (1, "save")]);
        match &actions[1] {
            Action::Advance { inputs, .. } => assert_eq!(inputs, &vec![7, 0]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn stalls_without_remote_input_and_recommends_waiting() {
        let (mut a, mut b) = pair();
        synchronize(&mut a, &mut b);
        a.events().for_each(drop);
        for _ in 0..20 {
            let actions = a.advance_frame(&[1]).unwrap();
            for action in actions {
                if let Action::Save { frame, cell } = action {
                    cell.save(frame, vec![frame.as_i32() as u8], 1);
                }
            }
        }
        assert_eq!(a.frame(), Frame::new(6));
        let waits = a
            .events()
            .filter(|e| matches!(e, SessionEvent::WaitRecommendation { .. }))
            .count();
        assert_eq!(waits, 1);
    }

    #[test]
    fn disconnecting_devices() {
        let (mut a, mut b) = pair();
        synchronize(&mut a, &mut b);
        assert!(a.disconnect_device(A).is_err());
        assert!(matches!(
            a.disconnect_device(DeviceId::new(9)),
            Err(ResyncError::UnknownDevice { .. })
        ));
        a.disconnect_device(B).unwrap();
        assert_eq!(a.device_state(B), Some(DeviceState::Disconnected));
        assert!(a.disconnect_device(B).is_err());
        assert!(a
            .events()
            .any(|e| e == SessionEvent::Disconnected { device_id: B }));
    }

    fn kind(action: &Action) -> &'static str {
        match action {
            Action::Load { .. } => "load",
            Action::Save { .. } => "save",
            Action::Advance { .. } => "advance",
        }
    }
}
