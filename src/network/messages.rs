//! Wire messages exchanged between devices.

use serde::{Deserialize, Serialize};

use crate::{DeviceId, Frame};

/// A message exchanged between two devices.
///
/// The sequence number increases per sender and is advisory; nothing in the engine
/// depends on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Per-sender message counter.
    pub sequence: u32,
    /// The payload.
    pub body: MessageBody,
}

/// Every message the engine sends or understands.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Handshake request. `device_id` and `player_count` describe the sender.
    SyncRequest {
        /// Id of the sending device.
        device_id: DeviceId,
        /// Players carried by the sender's input stream.
        player_count: u32,
        /// Random value the receiver has to echo.
        nonce: u32,
    },
    /// Handshake answer echoing the nonce of a [`MessageBody::SyncRequest`].
    SyncConfirm {
        /// Id of the sending device.
        device_id: DeviceId,
        /// Players carried by the sender's input stream.
        player_count: u32,
        /// The nonce being answered.
        echoed_nonce: u32,
    },
    /// A contiguous range of input frames.
    ///
    /// `input_bytes` holds `end_frame - start_frame + 1` frames back to back.
    Input {
        /// First frame in the range.
        start_frame: Frame,
        /// Last frame in the range, inclusive.
        end_frame: Frame,
        /// How far the sender was ahead of its slowest remote.
        frame_advantage: i32,
        /// The input payload.
        input_bytes: Vec<u8>,
    },
    /// The receiver holds all input up to `frame`.
    InputAck {
        /// Newest frame received.
        frame: Frame,
    },
    /// Checksum of a confirmed frame of the sender.
    HealthCheck {
        /// The reported frame.
        frame: Frame,
        /// The sender's checksum for `frame`.
        checksum: u32,
    },
    /// Round-trip measurement. Answered by echoing `time` with `returning` set.
    Ping {
        /// Sender clock in milliseconds.
        time: u64,
        /// `true` for the echo.
        returning: bool,
    },
}

impl MessageBody {
    /// Short name used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncRequest { .. } => "sync_request",
            Self::SyncConfirm { .. } => "sync_confirm",
            Self::Input { .. } => "input",
            Self::InputAck { .. } => "input_ack",
            Self::HealthCheck { .. } => "health_check",
            Self::Ping { .. } => "ping",
        }
    }
}

/// Number of frames in the inclusive input range `start..=end`.
///
/// Both ends arrive from the network. Ranges that are empty, start before frame 0 or
/// overflow the frame counter yield `None`.
#[must_use]
pub fn input_frame_count(start: Frame, end: Frame) -> Option<usize> {
    if !start.is_valid() || end < start {
        return None;
    }
    let last_offset = end.as_i32().checked_sub(start.as_i32())?;
    let count = last_offset.checked_add(1)?;
    usize::try_from(count).ok()
}

impl std::fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SyncRequest {
                device_id,
                player_count,
                nonce,
            } => f
                .debug_struct("SyncRequest")
                .field("device_id", device_id)
                .field("player_count", player_count)
                .field("nonce", nonce)
                .finish(),
            Self::SyncConfirm {
                device_id,
                player_count,
                echoed_nonce,
            } => f
                .debug_struct("SyncConfirm")
                .field("device_id", device_id)
                .field("player_count", player_count)
                .field("echoed_nonce", echoed_nonce)
                .finish(),
            Self::Input {
                start_frame,
                end_frame,
                frame_advantage,
                input_bytes,
            } => f
                .debug_struct("Input")
                .field("start_frame", start_frame)
                .field("end_frame", end_frame)
                .field("frame_advantage", frame_advantage)
                .field("input_bytes", &BytesDebug(input_bytes))
                .finish(),
            Self::InputAck { frame } => f.debug_struct("InputAck").field("frame", frame).finish(),
            Self::HealthCheck { frame, checksum } => f
                .debug_struct("HealthCheck")
                .field("frame", frame)
                .field("checksum", &format_args!("{:#010x}", checksum))
                .finish(),
            Self::Ping { time, returning } => f
                .debug_struct("Ping")
                .field("time", time)
                .field("returning", returning)
                .finish(),
        }
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
