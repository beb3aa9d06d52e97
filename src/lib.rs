//! # Resync Rollback
//!
//! Resync Rollback is a poll-driven rollback networking engine for deterministic,
//! lock-step simulations. Every participating *device* hosts one or more players
//! and contributes a fixed number of input bytes per player and frame. Inputs that
//! have not arrived yet are predicted by holding the last known input; when the real
//! input disagrees with the prediction the session rewinds to the last correct frame
//! and resimulates.
//!
//! Instead of callbacks, [`Peer2PeerSession::advance_frame`] returns an ordered list of
//! [`Action`]s that the host executes against its own simulation:
//!
//! ```ignore
//! let mut session = SessionBuilder::new()
//!     .with_input_size(2)
//!     .with_device_count(2)
//!     .with_total_player_count(2)
//!     .start_p2p_session(UdpTransport::bind_to_port(7000)?)?;
//! session.set_local_device(DeviceId::new(0), 1, 0)?;
//! session.add_remote_device(DeviceId::new(1), 1, "127.0.0.1:7001".parse()?)?;
//!
//! loop {
//!     session.poll();
//!     if !session.is_running() {
//!         continue;
//!     }
//!     for action in session.advance_frame(&read_local_input())? {
//!         match action {
//!             Action::Save { frame, cell } => cell.save(frame, game.to_bytes(), game.checksum()),
//!             Action::Load { cell, .. } => game = Game::from_bytes(&cell.load()?.buffer),
//!             Action::Advance { inputs, .. } => game.step(&inputs),
//!         }
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::fmt::Debug;

pub use error::ResyncError;
pub use game_input::GameInput;
pub use network::device::state::{DeviceState, DeviceType};
pub use network::loopback::{LoopbackNetwork, LoopbackTransport};
pub use network::messages::{Message, MessageBody};
pub use network::udp_transport::UdpTransport;
pub use sessions::broadcast_stream::BroadcastStream;
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{DeviceConfig, SessionConfig};
pub use sessions::p2p_session::Peer2PeerSession;
pub use sessions::replay::ReplayFile;
pub use sessions::spectator_session::SpectatorSession;
pub use sync_layer::{SavedState, StateCell};
pub use time_sync::TimeSyncConfig;

pub mod checksum;
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod game_input;
#[doc(hidden)]
pub mod input_queue;
pub mod prelude;
/// Run-length encoding used for replay artifacts.
pub mod rle;
/// PCG32 random source used for handshake nonces.
pub mod rng;
#[doc(hidden)]
pub mod sync_layer;
pub mod telemetry;
#[doc(hidden)]
pub mod time_sync;
#[doc(hidden)]
pub mod sessions {
    pub mod broadcast_stream;
    pub mod builder;
    pub mod config;
    pub mod p2p_session;
    pub mod replay;
    pub mod spectator_session;
}
#[doc(hidden)]
pub mod network {
    /// Binary wire codec for [`Message`](crate::Message).
    pub mod codec;
    pub mod device;
    pub mod loopback;
    pub mod messages;
    pub mod udp_transport;
}

/// Internal components exposed for property tests and integration tests.
///
/// Nothing in here is covered by semver guarantees.
#[doc(hidden)]
pub mod __internal {
    pub use crate::input_queue::InputQueue;
    pub use crate::network::device::state::{transition, DeviceLimits, DeviceSignal, StateTimers};
    pub use crate::network::device::Device;
    pub use crate::sync_layer::{StateStorage, SyncLayer};
    pub use crate::time_sync::{RemoteCursor, TimeSync};
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// The first frame of every session. A snapshot of this frame is the initial rollback floor.
pub const INITIAL_FRAME: i32 = 0;

/// Number of confirmed (and predicted) input slots per device.
pub const INPUT_QUEUE_LENGTH: usize = 128;

/// How many frames the local simulation may run ahead of the slowest remote device.
pub const MAX_ROLLBACK_FRAMES: i32 = 7;

/// Largest tolerated difference between the local and the remote frame advantage.
pub const FRAME_ADVANTAGE_LIMIT: i32 = 5;

/// Extra snapshot slots kept beyond [`MAX_ROLLBACK_FRAMES`].
pub const STATE_STORAGE_MARGIN: usize = 2;

/// Health checks report a frame this many frames behind the current local frame.
pub const HEALTH_CHECK_FRAMES_BEHIND: i32 = 10;

/// Bounds on the bytes each player contributes per frame.
pub const MIN_INPUT_SIZE: usize = 1;
/// See [`MIN_INPUT_SIZE`].
pub const MAX_INPUT_SIZE: usize = 32;
/// Bounds on the number of devices taking part in one session.
pub const MIN_DEVICE_COUNT: usize = 2;
/// See [`MIN_DEVICE_COUNT`].
pub const MAX_DEVICE_COUNT: usize = 4;
/// Bounds on the total number of players across all devices.
pub const MIN_TOTAL_PLAYER_COUNT: usize = 2;
/// See [`MIN_TOTAL_PLAYER_COUNT`].
pub const MAX_TOTAL_PLAYER_COUNT: usize = 16;

/// A frame is a single step of simulation.
///
/// Frames start at [`INITIAL_FRAME`] and only ever grow. [`Frame::NULL`] marks
/// the absence of a frame, for example an empty input slot.
///
/// ```
/// use resync_rollback::Frame;
///
/// let frame = Frame::new(3);
/// assert!(frame.is_valid());
/// assert!(Frame::NULL.is_null());
/// assert_eq!((frame + 1).as_i32(), 4);
/// assert_eq!(frame - Frame::new(1), 2);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame, equal to [`NULL_FRAME`].
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// The first frame of a session.
    pub const INITIAL: Frame = Frame(INITIAL_FRAME);

    /// Wraps a raw frame number without validating it.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the raw frame number.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` for [`Frame::NULL`].
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` for any non-negative frame.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Maps the frame onto a ring of `len` slots.
    ///
    /// Only meaningful for valid frames; callers check [`Frame::is_valid`] first.
    #[inline]
    #[must_use]
    pub const fn slot(self, len: usize) -> usize {
        self.0.rem_euclid(len as i32) as usize
    }

    /// Adds `rhs`, or returns `None` if the result does not fit.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: i32) -> Option<Frame> {
        match self.0.checked_add(rhs) {
            Some(frame) => Some(Frame(frame)),
            None => None,
        }
    }

    /// Subtracts `rhs`, or returns `None` if the result does not fit.
    #[inline]
    #[must_use]
    pub const fn checked_sub(self, rhs: i32) -> Option<Frame> {
        match self.0.checked_sub(rhs) {
            Some(frame) => Some(Frame(frame)),
            None => None,
        }
    }

    /// Returns `Some(self)` for valid frames and `None` otherwise.
    #[inline]
    #[must_use]
    pub const fn to_option(self) -> Option<Frame> {
        if self.is_valid() {
            Some(self)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Frame(self.0 - rhs)
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// Identifies one device (network participant) of a session.
///
/// Device ids must be identical on every peer: device `1` is the same machine
/// for everybody. Combined inputs are laid out in ascending id order.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Wraps a raw device id.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        DeviceId(id)
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the id as an index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for DeviceId {
    #[inline]
    fn from(value: u32) -> Self {
        DeviceId(value)
    }
}

// #############
// #   ENUMS   #
// #############

/// Whether and how often running devices exchange state checksums.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DesyncDetection {
    /// Send a health check every `interval` frames.
    On {
        /// Frames between two health checks.
        interval: u32,
    },
    /// Never send health checks. Received ones are still compared.
    Off,
}

impl Default for DesyncDetection {
    fn default() -> Self {
        DesyncDetection::On { interval: 30 }
    }
}

/// Coarse state of a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// At least one device is still performing the handshake.
    Synchronizing,
    /// Every device finished the handshake (or dropped out).
    Running,
    /// A health check failed. The session keeps running but its peers disagree.
    Desynced,
}

/// Notifications produced while polling and advancing a session.
///
/// Drain them with `events()` after every tick.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionEvent {
    /// A handshake round trip with the device completed.
    Synchronizing {
        /// The device being synchronized.
        device_id: DeviceId,
        /// Round trips required in total.
        total: u32,
        /// Round trips completed so far.
        count: u32,
    },
    /// The handshake with the device completed; it is now running.
    Synchronized {
        /// The device that finished synchronizing.
        device_id: DeviceId,
    },
    /// The local simulation is too far ahead and should idle for a few frames.
    WaitRecommendation {
        /// Suggested number of frames to skip.
        skip_frames: u32,
    },
    /// A health check reported a different checksum for a confirmed frame.
    DesyncDetected {
        /// The compared frame.
        frame: Frame,
        /// Our checksum for `frame`.
        local_checksum: u32,
        /// The checksum the device reported.
        remote_checksum: u32,
        /// The reporting device. It has been disconnected.
        device_id: DeviceId,
    },
    /// The device stopped responding or was disconnected on purpose.
    Disconnected {
        /// The disconnected device.
        device_id: DeviceId,
    },
}

/// One step the host must perform against its simulation.
///
/// Actions of a single `advance_frame` call must be executed in order before the
/// next call.
#[derive(Debug, Clone)]
pub enum Action {
    /// Restore the simulation from the snapshot held in `cell`.
    Load {
        /// The frame to restore.
        frame: Frame,
        /// The storage slot holding the snapshot of `frame`.
        cell: StateCell,
    },
    /// Snapshot the simulation into `cell` (see [`StateCell::save`]).
    Save {
        /// The frame the simulation just reached.
        frame: Frame,
        /// The storage slot to write.
        cell: StateCell,
    },
    /// Step the simulation forward by exactly one frame using `inputs`.
    Advance {
        /// The frame being simulated.
        frame: Frame,
        /// The combined inputs of every player, ordered by device id.
        inputs: Vec<u8>,
    },
}

impl Action {
    /// The frame this action refers to.
    #[must_use]
    pub fn frame(&self) -> Frame {
        match self {
            Action::Load { frame, .. } | Action::Save { frame, .. } | Action::Advance { frame, .. } => {
                *frame
            }
        }
    }
}

// #############
// #  TRAITS   #
// #############

/// The transport adapter that moves messages between devices.
///
/// Implementations must never block: [`Transport::receive_from`] drains whatever has
/// arrived since the previous call. The engine does not care whether the adapter
/// sits on UDP, a reliable overlay, or an in-process channel.
#[cfg(feature = "sync-send")]
pub trait Transport: Send + Sync {
    /// How a remote device is reached, for example a socket address.
    type Address: Clone + Debug + Send + Sync;

    /// Registers how to reach `device_id`.
    fn add_remote(&mut self, device_id: DeviceId, address: Self::Address);

    /// Sends `message` to `device_id` and returns the number of bytes written.
    fn send_to(&mut self, device_id: DeviceId, message: &Message) -> usize;

    /// Returns every message received since the last call.
    fn receive_from(&mut self) -> Vec<(DeviceId, Message)>;
}

/// The transport adapter that moves messages between devices.
///
/// Implementations must never block: [`Transport::receive_from`] drains whatever has
/// arrived since the previous call. The engine does not care whether the adapter
/// sits on UDP, a reliable overlay, or an in-process channel.
#[cfg(not(feature = "sync-send"))]
pub trait Transport {
    /// How a remote device is reached, for example a socket address.
    type Address: Clone + Debug;

    /// Registers how to reach `device_id`.
    fn add_remote(&mut self, device_id: DeviceId, address: Self::Address);

    /// Sends `message` to `device_id` and returns the number of bytes written.
    fn send_to(&mut self, device_id: DeviceId, message: &Message) -> usize;

    /// Returns every message received since the last call.
    fn receive_from(&mut self) -> Vec<(DeviceId, Message)>;
}

// ###################
// # UNIT TESTS      #
// ###################
