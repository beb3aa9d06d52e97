//! Jitter buffer for spectators.
//!
//! A spectator receives the combined confirmed input of the host in order. The stream
//! accepts only the next frame it is missing, and releases frames for replay only while
//! at least `initial_frame_buffer` accepted frames are still queued behind the one being
//! released. That cushion absorbs delivery hiccups without stalling the replay.

use crate::Frame;

/// Ordered buffer of combined input frames.
///
/// Frame numbers start at 1. Every accepted frame is retained so the complete stream can
/// be written out as a replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastStream {
    initial_frame_buffer: usize,
    frame_size: usize,
    current: Frame,
    available: Frame,
    frames: Vec<u8>,
}

impl BroadcastStream {
    /// Creates an empty stream of frames of `frame_size` bytes each.
    #[must_use]
    pub fn new(initial_frame_buffer: usize, frame_size: usize) -> Self {
        Self {
            initial_frame_buffer,
            frame_size,
            current: Frame::new(1),
            available: Frame::INITIAL,
            frames: Vec::new(),
        }
    }

    /// Bytes per frame.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Next frame [`Self::next_frame`] will release.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current
    }

    /// Newest accepted frame, `Frame::INITIAL` before the first one.
    #[must_use]
    pub fn available_frame(&self) -> Frame {
        self.available
    }

    /// Accepted frames not yet released.
    #[must_use]
    pub fn frames_behind(&self) -> usize {
        (self.available - self.current + 1).max(0) as usize
    }

    /// Appends `frame` if it is exactly the next missing frame and has the right size.
    pub fn add_frame(&mut self, frame: Frame, bytes: &[u8]) -> bool {
        if frame != self.available + 1 || bytes.len() != self.frame_size {
            return false;
        }
        self.frames.extend_from_slice(bytes);
        self.available = frame;
        true
    }

    /// Releases the next frame if enough frames are buffered behind it.
    pub fn next_frame(&mut self) -> Option<(Frame, Vec<u8>)> {
        if self.available - self.current < self.initial_frame_buffer as i32 {
            return None;
        }
        let frame = self.current;
        let bytes = self.frame(frame)?.to_vec();
        self.current += 1;
        Some((frame, bytes))
    }

    /// The bytes of an accepted frame.
    #[must_use]
    pub fn frame(&self, frame: Frame) -> Option<&[u8]> {
        if frame < Frame::new(1) || frame > self.available {
            return None;
        }
        let start = (frame.as_i32() as usize - 1) * self.frame_size;
        self.frames.get(start..start + self.frame_size)
    }

    /// Every accepted frame back to back, starting at frame 1.
    #[must_use]
    pub fn recorded(&self) -> &[u8] {
        &self.frames
    }
}
