//! Connection endpoint for one remote or spectator device.
//!
//! A [`Device`] performs the handshake, tracks liveness, answers pings, stores received
//! health checks and owns the outbound message queue towards its peer. Frame related
//! bookkeeping lives in [`SyncLayer`](crate::sync_layer::SyncLayer); the session forwards the
//! [`DeviceEvent`]s produced here.

pub mod state;

use std::collections::vec_deque::Drain;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, trace};
use web_time::{Duration, Instant};

use crate::network::messages::{Message, MessageBody};
use crate::report_violation_to;
use crate::rng::Pcg32;
use crate::sessions::config::DeviceConfig;
use crate::sync_layer::OutgoingInput;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{DeviceId, Frame, Transport};

use state::{transition, DeviceLimits, DeviceSignal, DeviceState, DeviceType, StateTimers};

/// Subtracted from every measured round trip to account for poll granularity.
pub const PING_ERROR_MARGIN_MS: u64 = 16;

/// Outstanding handshake nonces remembered per device.
const MAX_PENDING_NONCES: usize = 16;

/// Received health checks kept until they can be compared.
const HEALTH_HISTORY_LENGTH: usize = 32;

/// Handshake requests after which slow synchronization is reported.
const SYNC_RETRY_WARNING_THRESHOLD: u32 = 10;

/// What a device reports to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A handshake round trip completed.
    Synchronizing {
        /// Round trips required.
        total: u32,
        /// Round trips completed.
        count: u32,
    },
    /// The handshake completed.
    Synchronized,
    /// The peer sent a range of input frames.
    Input {
        /// First frame in the range.
        start_frame: Frame,
        /// Last frame in the range, inclusive.
        end_frame: Frame,
        /// Frame advantage reported by the peer.
        frame_advantage: i32,
        /// The frames back to back.
        input_bytes: Vec<u8>,
    },
    /// The peer holds our input up to `frame`.
    InputAck {
        /// Newest frame acknowledged.
        frame: Frame,
    },
    /// The device is gone.
    Disconnected,
}

/// Protocol endpoint for a single peer.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing and fuzzing.
/// It is not part of the stable public API.
pub struct Device {
    peer_id: DeviceId,
    kind: DeviceType,
    expected_player_count: u32,
    local_id: DeviceId,
    advertised_player_count: u32,

    state: DeviceState,
    timers: StateTimers,
    limits: DeviceLimits,
    config: DeviceConfig,

    rng: Pcg32,
    pending_nonces: BTreeSet<u32>,
    sync_requests_sent: u32,
    sync_retry_warning_sent: bool,
    last_sync_sent: Option<Instant>,
    last_ping_sent: Option<Instant>,
    received_since_poll: bool,
    epoch: Instant,
    rtt_ms: Option<u64>,

    health: VecDeque<(Frame, u32)>,
    outbound: VecDeque<Message>,
    next_sequence: u32,
    events: VecDeque<DeviceEvent>,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("peer_id", &self.peer_id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("timers", &self.timers)
            .field("rtt_ms", &self.rtt_ms)
            .field("outbound", &self.outbound.len())
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Creates the endpoint for `peer_id`.
    ///
    /// `expected_player_count` is what the peer must advertise in its handshake;
    /// `advertised_player_count` is what we advertise to it.
    #[must_use]
    pub fn new(
        local_id: DeviceId,
        advertised_player_count: u32,
        peer_id: DeviceId,
        kind: DeviceType,
        expected_player_count: u32,
        config: DeviceConfig,
        observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        let limits = DeviceLimits {
            sync_round_trips: config.sync_round_trips,
            connection_test_limit: config.connection_test_limit,
        };
        Self {
            peer_id,
            kind,
            expected_player_count,
            local_id,
            advertised_player_count,
            state: DeviceState::Syncing,
            timers: StateTimers::new(limits),
            limits,
            config,
            rng: Pcg32::from_entropy(),
            pending_nonces: BTreeSet::new(),
            sync_requests_sent: 0,
            sync_retry_warning_sent: false,
            last_sync_sent: None,
            last_ping_sent: None,
            received_since_poll: false,
            epoch: Instant::now(),
            rtt_ms: None,
            health: VecDeque::with_capacity(HEALTH_HISTORY_LENGTH),
            outbound: VecDeque::new(),
            next_sequence: 0,
            events: VecDeque::new(),
            observer,
        }
    }

    /// Id of the peer.
    #[must_use]
    pub fn peer_id(&self) -> DeviceId {
        self.peer_id
    }

    /// Remote or Spectator.
    #[must_use]
    pub fn kind(&self) -> DeviceType {
        self.kind
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Current timers.
    #[must_use]
    pub fn timers(&self) -> StateTimers {
        self.timers
    }

    /// Last measured round trip in milliseconds.
    #[must_use]
    pub fn rtt_ms(&self) -> Option<u64> {
        self.rtt_ms
    }

    /// Messages waiting to be flushed.
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.outbound.len()
    }

    fn apply(&mut self, signal: DeviceSignal) {
        let previous = self.state;
        (self.state, self.timers) = transition(self.state, self.timers, signal, self.limits);
        if previous != self.state {
            debug!(device = %self.peer_id, from = %previous, to = %self.state, ?signal, "device state changed");
            if self.state == DeviceState::Disconnected {
                info!(device = %self.peer_id, "device disconnected");
                self.outbound.clear();
                self.events.push_back(DeviceEvent::Disconnected);
            }
        }
    }

    /// Sends the first handshake request.
    pub fn start_syncing(&mut self, now: Instant) {
        if self.state == DeviceState::Syncing && self.sync_requests_sent == 0 {
            self.send_sync_request(now);
        }
    }

    /// Drops the device for good.
    pub fn disconnect(&mut self) {
        self.apply(DeviceSignal::Disconnect);
    }

    fn send_sync_request(&mut self, now: Instant) {
        self.sync_requests_sent += 1;
        self.last_sync_sent = Some(now);

        if !self.sync_retry_warning_sent && self.sync_requests_sent > SYNC_RETRY_WARNING_THRESHOLD {
            self.sync_retry_warning_sent = true;
            report_violation_to!(
                self.observer,
                ViolationSeverity::Warning,
                ViolationKind::DeviceProtocol,
                "{} handshake requests sent to device {} without completing",
                self.sync_requests_sent,
                self.peer_id
            );
        }

        let nonce = self.rng.next_u32();
        if self.pending_nonces.len() >= MAX_PENDING_NONCES {
            self.pending_nonces.pop_first();
        }
        self.pending_nonces.insert(nonce);
        self.queue_message(MessageBody::SyncRequest {
            device_id: self.local_id,
            player_count: self.advertised_player_count,
            nonce,
        });
    }

    /// Queues a range of our input.
    pub fn send_input(&mut self, input: &OutgoingInput) {
        if self.state == DeviceState::Disconnected {
            return;
        }
        self.queue_message(MessageBody::Input {
            start_frame: input.start_frame,
            end_frame: input.end_frame,
            frame_advantage: input.frame_advantage,
            input_bytes: input.input_bytes.clone(),
        });
    }

    /// Queues an acknowledgement of the peer's input up to `frame`.
    pub fn send_input_ack(&mut self, frame: Frame) {
        if self.state == DeviceState::Disconnected {
            return;
        }
        self.queue_message(MessageBody::InputAck { frame });
    }

    /// Queues our checksum of a confirmed frame.
    pub fn send_health_check(&mut self, frame: Frame, checksum: u32) {
        if self.state != DeviceState::Running {
            return;
        }
        self.queue_message(MessageBody::HealthCheck { frame, checksum });
    }

    fn queue_message(&mut self, body: MessageBody) {
        trace!(device = %self.peer_id, kind = body.kind(), "queuing message");
        let message = Message {
            sequence: self.next_sequence,
            body,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.outbound.push_back(message);
    }

    /// Takes every queued message in FIFO order.
    pub fn take_outbound(&mut self) -> Vec<Message> {
        self.outbound.drain(..).collect()
    }

    /// Flushes the outbound queue through `transport`. A disconnected device drops it.
    pub fn send_all_messages<T: Transport>(&mut self, transport: &mut T) {
        if self.state == DeviceState::Disconnected {
            self.outbound.clear();
            return;
        }
        if self.outbound.is_empty() {
            return;
        }
        trace!(device = %self.peer_id, count = self.outbound.len(), "flushing messages");
        for message in self.outbound.drain(..) {
            transport.send_to(self.peer_id, &message);
        }
    }

    /// Health checks received for frames up to `sync_frame`, oldest first.
    pub fn take_health_due(&mut self, sync_frame: Frame) -> Vec<(Frame, u32)> {
        let mut due = Vec::new();
        self.health.retain(|&(frame, checksum)| {
            if frame <= sync_frame {
                due.push((frame, checksum));
                false
            } else {
                true
            }
        });
        due
    }

    /// Health checks received and not yet compared.
    #[must_use]
    pub fn health(&self) -> impl Iterator<Item = &(Frame, u32)> {
        self.health.iter()
    }

    fn elapsed_ms(&self, now: Instant) -> u64 {
        now.duration_since(self.epoch).as_millis() as u64
    }

    /// Processes a message from the peer.
    pub fn handle_message(&mut self, message: &Message, now: Instant) {
        if self.state == DeviceState::Disconnected {
            trace!(device = %self.peer_id, "ignoring message for disconnected device");
            return;
        }
        trace!(device = %self.peer_id, sequence = message.sequence, body = ?message.body, "received");
        self.received_since_poll = true;
        self.apply(DeviceSignal::MessageReceived);

        match &message.body {
            MessageBody::SyncRequest {
                device_id,
                player_count,
                nonce,
            } => {
                if self.verify_identity(*device_id, *player_count) {
                    self.queue_message(MessageBody::SyncConfirm {
                        device_id: self.local_id,
                        player_count: self.advertised_player_count,
                        echoed_nonce: *nonce,
                    });
                }
            }
            MessageBody::SyncConfirm {
                device_id,
                player_count,
                echoed_nonce,
            } => {
                if self.verify_identity(*device_id, *player_count) {
                    self.on_sync_confirm(*echoed_nonce, now);
                }
            }
            MessageBody::Input {
                start_frame,
                end_frame,
                frame_advantage,
                input_bytes,
            } => self.events.push_back(DeviceEvent::Input {
                start_frame: *start_frame,
                end_frame: *end_frame,
                frame_advantage: *frame_advantage,
                input_bytes: input_bytes.clone(),
            }),
            MessageBody::InputAck { frame } => {
                self.events.push_back(DeviceEvent::InputAck { frame: *frame });
            }
            MessageBody::HealthCheck { frame, checksum } => {
                if self.health.len() == HEALTH_HISTORY_LENGTH {
                    self.health.pop_front();
                }
                self.health.push_back((*frame, *checksum));
            }
            MessageBody::Ping { time, returning } => {
                if *returning {
                    let rtt = self
                        .elapsed_ms(now)
                        .saturating_sub(*time)
                        .saturating_sub(PING_ERROR_MARGIN_MS);
                    self.rtt_ms = Some(rtt);
                } else {
                    self.queue_message(MessageBody::Ping {
                        time: *time,
                        returning: true,
                    });
                }
            }
        }
    }

    fn verify_identity(&self, device_id: DeviceId, player_count: u32) -> bool {
        if device_id == self.peer_id && player_count == self.expected_player_count {
            return true;
        }
        report_violation_to!(
            self.observer,
            ViolationSeverity::Warning,
            ViolationKind::DeviceProtocol,
            "handshake from {} with {} players does not match registered device {} with {} players",
            device_id,
            player_count,
            self.peer_id,
            self.expected_player_count
        );
        false
    }

    fn on_sync_confirm(&mut self, nonce: u32, now: Instant) {
        if self.state != DeviceState::Syncing {
            return;
        }
        if !self.pending_nonces.remove(&nonce) {
            trace!(device = %self.peer_id, nonce, "unknown handshake nonce");
            return;
        }
        self.apply(DeviceSignal::SyncConfirmed);
        let total = self.limits.sync_round_trips;
        if self.state == DeviceState::Running {
            info!(device = %self.peer_id, requests = self.sync_requests_sent, "device synchronized");
            self.pending_nonces.clear();
            self.events.push_back(DeviceEvent::Synchronized);
        } else {
            self.events.push_back(DeviceEvent::Synchronizing {
                total,
                count: total - self.timers.sync_round_trips_remaining,
            });
            self.send_sync_request(now);
        }
    }

    /// Runs timers and returns the events accumulated since the last poll.
    pub fn poll(&mut self, now: Instant) -> Drain<'_, DeviceEvent> {
        if self.state != DeviceState::Disconnected {
            if !self.received_since_poll {
                self.apply(DeviceSignal::SilentPoll);
            }
            self.received_since_poll = false;
        }

        match self.state {
            DeviceState::Syncing => {
                let interval = if self.sync_requests_sent <= 1 {
                    self.config.sync_first_retry_interval
                } else {
                    self.config.sync_retry_interval
                };
                if elapsed_at_least(self.last_sync_sent, now, interval) {
                    self.send_sync_request(now);
                }
            }
            DeviceState::Running => {
                if elapsed_at_least(self.last_ping_sent, now, self.config.ping_interval) {
                    self.last_ping_sent = Some(now);
                    let time = self.elapsed_ms(now);
                    self.queue_message(MessageBody::Ping {
                        time,
                        returning: false,
                    });
                }
            }
            DeviceState::Disconnected => {}
        }
        self.events.drain(..)
    }
}

fn elapsed_at_least(since: Option<Instant>, now: Instant, interval: Duration) -> bool {
    since.is_none_or(|t| now.duration_since(t) >= interval)
}
