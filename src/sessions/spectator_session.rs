use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace};
use web_time::Instant;

use crate::network::device::{Device, DeviceEvent};
use crate::network::messages::input_frame_count;
use crate::report_violation_to;
use crate::sessions::broadcast_stream::BroadcastStream;
use crate::sessions::config::SessionConfig;
use crate::sessions::replay::ReplayFile;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    Action, DeviceId, DeviceState, DeviceType, Frame, ResyncError, SessionEvent, SessionState,
    Transport,
};

/// Maximum number of events to queue before the oldest are dropped.
const MAX_EVENT_QUEUE_SIZE: usize = 64;

struct Broadcast {
    device: Device,
    stream: BroadcastStream,
}

/// [`SpectatorSession`] follows a host without contributing input.
///
/// The host (a [`Peer2PeerSession`](crate::Peer2PeerSession) that added this device with
/// `add_spectator_device`) broadcasts its confirmed combined input. Frames are buffered
/// in a [`BroadcastStream`] and handed out one per [`advance_frame`](Self::advance_frame)
/// once enough are queued. Spectators never roll back.
pub struct SpectatorSession<T: Transport> {
    config: SessionConfig,
    transport: T,
    local_id: Option<DeviceId>,
    broadcast: Option<Broadcast>,
    initial_state: Vec<u8>,
    event_queue: VecDeque<SessionEvent>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Transport> std::fmt::Debug for SpectatorSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectatorSession")
            .field("local_id", &self.local_id)
            .field("broadcast", &self.broadcast.as_ref().map(|b| &b.device))
            .field("frames_behind", &self.frames_behind())
            .field("pending_events", &self.event_queue.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> SpectatorSession<T> {
    pub(crate) fn new(
        config: SessionConfig,
        transport: T,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        Self {
            config,
            transport,
            local_id: None,
            broadcast: None,
            initial_state: Vec::new(),
            event_queue: VecDeque::new(),
            violation_observer,
        }
    }

    /// Sets the id this spectator uses towards the host.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if the id is already set.
    ///
    /// [`InvalidRequest`]: ResyncError::InvalidRequest
    pub fn set_local_device(&mut self, id: DeviceId) -> Result<(), ResyncError> {
        if self.local_id.is_some() {
            return Err(ResyncError::InvalidRequest {
                info: "the local device is already set".to_owned(),
            });
        }
        self.local_id = Some(id);
        Ok(())
    }

    /// Registers the broadcasting host, whose stream carries `player_count` players, and
    /// starts the handshake with it.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if the local device is not set, a host was already
    ///   added, or `player_count` is zero.
    ///
    /// [`InvalidRequest`]: ResyncError::InvalidRequest
    pub fn add_remote_device(
        &mut self,
        id: DeviceId,
        player_count: usize,
        address: T::Address,
    ) -> Result<(), ResyncError> {
        let local_id = self.local_id.ok_or_else(|| ResyncError::InvalidRequest {
            info: "set_local_device must be called first".to_owned(),
        })?;
        if self.broadcast.is_some() {
            return Err(ResyncError::InvalidRequest {
                info: "a spectator follows exactly one broadcast device".to_owned(),
            });
        }
        if player_count == 0 {
            return Err(ResyncError::InvalidRequest {
                info: "the broadcast device must carry at least one player".to_owned(),
            });
        }

        let mut device = Device::new(
            local_id,
            0,
            id,
            DeviceType::Remote,
            player_count as u32,
            self.config.device,
            self.violation_observer.clone(),
        );
        self.transport.add_remote(id, address);
        device.start_syncing(Instant::now());
        device.send_all_messages(&mut self.transport);
        debug!(device = %id, players = player_count, "broadcast device added");

        self.broadcast = Some(Broadcast {
            device,
            stream: BroadcastStream::new(
                self.config.initial_frame_buffer,
                self.config.input_size * player_count,
            ),
        });
        Ok(())
    }

    /// Snapshot stored in replays as the state the recording starts from.
    pub fn set_initial_state(&mut self, state: impl Into<Vec<u8>>) {
        self.initial_state = state.into();
    }

    /// Receives pending messages from the broadcast device, runs its timers and sends
    /// acknowledgements. Messages from any other device are dropped.
    pub fn poll(&mut self) {
        let Some(broadcast) = self.broadcast.as_mut() else {
            return;
        };
        let now = Instant::now();
        let host = broadcast.device.peer_id();
        for (from, message) in self.transport.receive_from() {
            if from != host {
                trace!(device = %from, "spectator ignores messages from other devices");
                continue;
            }
            broadcast.device.handle_message(&message, now);
        }

        let events: Vec<_> = broadcast.device.poll(now).collect();
        for event in events {
            match event {
                DeviceEvent::Synchronizing { total, count } => push_event(
                    &mut self.event_queue,
                    SessionEvent::Synchronizing {
                        device_id: host,
                        total,
                        count,
                    },
                ),
                DeviceEvent::Synchronized => push_event(
                    &mut self.event_queue,
                    SessionEvent::Synchronized { device_id: host },
                ),
                DeviceEvent::Input {
                    start_frame,
                    end_frame,
                    input_bytes,
                    ..
                } => {
                    let frame_size = broadcast.stream.frame_size();
                    let expected_len = input_frame_count(start_frame, end_frame)
                        .and_then(|count| count.checked_mul(frame_size));
                    if frame_size == 0 || expected_len != Some(input_bytes.len()) {
                        report_violation_to!(
                            self.violation_observer,
                            ViolationSeverity::Warning,
                            ViolationKind::DeviceProtocol,
                            "broadcast of frames {}..={} has {} bytes, expected {} per frame",
                            start_frame,
                            end_frame,
                            input_bytes.len(),
                            frame_size
                        );
                        continue;
                    }
                    for (offset, chunk) in input_bytes.chunks_exact(frame_size).enumerate() {
                        broadcast
                            .stream
                            .add_frame(start_frame + offset as i32, chunk);
                    }
                    // one cumulative ack covers every frame accepted so far
                    let available = broadcast.stream.available_frame();
                    if available >= Frame::new(1) {
                        broadcast.device.send_input_ack(available);
                    }
                }
                DeviceEvent::InputAck { .. } => {}
                DeviceEvent::Disconnected => push_event(
                    &mut self.event_queue,
                    SessionEvent::Disconnected { device_id: host },
                ),
            }
        }

        broadcast.device.send_all_messages(&mut self.transport);
    }

    /// Hands out the next buffered frame, if the buffer allows it.
    ///
    /// Returns at most one [`Action::Advance`]. An empty list means the spectator should
    /// wait for more input.
    ///
    /// # Errors
    /// - Returns [`NotSynchronized`] until the handshake with the host completed.
    ///
    /// [`NotSynchronized`]: ResyncError::NotSynchronized
    pub fn advance_frame(&mut self) -> Result<Vec<Action>, ResyncError> {
        if !self.is_running() {
            return Err(ResyncError::NotSynchronized);
        }
        let Some(broadcast) = self.broadcast.as_mut() else {
            return Err(ResyncError::NotSynchronized);
        };
        Ok(broadcast
            .stream
            .next_frame()
            .map(|(frame, inputs)| Action::Advance { frame, inputs })
            .into_iter()
            .collect())
    }

    /// `true` once the handshake with the host completed. Stays `true` after the host
    /// disconnected, so buffered frames can still be replayed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.broadcast
            .as_ref()
            .is_some_and(|b| b.device.state() != DeviceState::Syncing)
    }

    /// The coarse session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.is_running() {
            SessionState::Running
        } else {
            SessionState::Synchronizing
        }
    }

    /// Connection state of the host.
    #[must_use]
    pub fn host_state(&self) -> Option<DeviceState> {
        self.broadcast.as_ref().map(|b| b.device.state())
    }

    /// Frames received but not yet handed out.
    #[must_use]
    pub fn frames_behind(&self) -> usize {
        self.broadcast
            .as_ref()
            .map_or(0, |b| b.stream.frames_behind())
    }

    /// Last frame handed out, [`Frame::INITIAL`] before the first one.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.broadcast
            .as_ref()
            .map_or(Frame::INITIAL, |b| b.stream.current_frame() - 1)
    }

    /// Every frame received so far as a replay.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] before the host was added.
    ///
    /// [`InvalidRequest`]: ResyncError::InvalidRequest
    pub fn replay(&self) -> Result<ReplayFile, ResyncError> {
        let broadcast = self
            .broadcast
            .as_ref()
            .ok_or_else(|| ResyncError::InvalidRequest {
                info: "no broadcast device to record".to_owned(),
            })?;
        let stream = &broadcast.stream;
        Ok(ReplayFile::new(
            stream.frame_size() as u32,
            stream.available_frame().as_i32(),
            &self.initial_state,
            stream.recorded(),
        ))
    }

    /// Writes [`replay`](Self::replay) to `path`.
    pub fn save_replay(&self, path: impl AsRef<Path>) -> Result<(), ResyncError> {
        self.replay()?.save_to(path)
    }

    /// Returns all events that happened since last queried for events.
    pub fn events(&mut self) -> Drain<'_, SessionEvent> {
        self.event_queue.drain(..)
    }

    /// The violation observer, if one was set.
    #[must_use]
    pub fn violation_observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.violation_observer.as_ref()
    }
}

fn push_event(queue: &mut VecDeque<SessionEvent>, event: SessionEvent) {
    if queue.len() >= MAX_EVENT_QUEUE_SIZE {
        queue.pop_front();
    }
    queue.push_back(event);
}
