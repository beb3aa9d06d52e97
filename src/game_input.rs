use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Frame, ResyncError};

/// Input bytes are stored inline up to this many bytes (e.g. 2 players at 8 bytes each).
type InputBytes = SmallVec<[u8; 16]>;

/// One frame of input for one or more players.
///
/// Each player contributes exactly `input_size` bytes; player `i` owns the byte range
/// `i * input_size .. (i + 1) * input_size`. The payload length is always
/// `input_size * player_count`, no matter which constructor or mutator was used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInput {
    frame: Frame,
    input_size: usize,
    player_count: usize,
    bytes: InputBytes,
}

impl GameInput {
    /// Creates a zeroed input for `frame`.
    #[must_use]
    pub fn new(frame: Frame, input_size: usize, player_count: usize) -> Self {
        Self {
            frame,
            input_size,
            player_count,
            bytes: smallvec::smallvec![0; input_size * player_count],
        }
    }

    /// Creates a zeroed input stamped [`Frame::NULL`].
    #[must_use]
    pub fn blank(input_size: usize, player_count: usize) -> Self {
        Self::new(Frame::NULL, input_size, player_count)
    }

    /// Creates an input holding a copy of `bytes`.
    ///
    /// Fails with [`ResyncError::InvalidRequest`] if `bytes` does not hold exactly
    /// `input_size * player_count` bytes.
    pub fn from_bytes(
        frame: Frame,
        input_size: usize,
        player_count: usize,
        bytes: &[u8],
    ) -> Result<Self, ResyncError> {
        let expected = input_size * player_count;
        if bytes.len() != expected {
            return Err(ResyncError::InvalidRequest {
                info: format!(
                    "expected {} input bytes ({} players x {} bytes), got {}",
                    expected,
                    player_count,
                    input_size,
                    bytes.len()
                ),
            });
        }
        Ok(Self {
            frame,
            input_size,
            player_count,
            bytes: InputBytes::from_slice(bytes),
        })
    }

    /// The frame this input belongs to, or [`Frame::NULL`].
    #[inline]
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.frame
    }

    #[inline]
    pub(crate) fn set_frame(&mut self, frame: Frame) {
        self.frame = frame;
    }

    /// Bytes per player.
    #[inline]
    #[must_use]
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Number of players contributing to this input.
    #[inline]
    #[must_use]
    pub fn player_count(&self) -> usize {
        self.player_count
    }

    /// The complete payload.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The bytes of player `index`, if it exists.
    #[must_use]
    pub fn player_bytes(&self, index: usize) -> Option<&[u8]> {
        if index >= self.player_count {
            return None;
        }
        let start = index * self.input_size;
        self.bytes.get(start..start + self.input_size)
    }

    /// Compares payloads only, ignoring the frame stamp.
    #[must_use]
    pub fn payload_eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }

    /// Copies the payload of `other` into this input. The frame stamp is left untouched.
    ///
    /// Inputs of a different shape leave `self` unchanged and return `false`.
    pub(crate) fn copy_payload_from(&mut self, other: &Self) -> bool {
        if self.bytes.len() != other.bytes.len() {
            return false;
        }
        self.bytes.copy_from_slice(&other.bytes);
        true
    }

    /// Overwrites the payload from a slice of the right length.
    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) -> bool {
        if self.bytes.len() != bytes.len() {
            return false;
        }
        self.bytes.copy_from_slice(bytes);
        true
    }

    /// Zeroes the payload and stamps the input [`Frame::NULL`].
    pub(crate) fn clear(&mut self) {
        self.frame = Frame::NULL;
        self.bytes.iter_mut().for_each(|b| *b = 0);
    }
}
