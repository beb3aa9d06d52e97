use crate::game_input::GameInput;
use crate::telemetry::{InvariantChecker, InvariantViolation};
use crate::{Frame, ResyncError, INPUT_QUEUE_LENGTH};

/// What happened to an input range entry handed to [`InputQueue::add_remote_input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteInputOutcome {
    /// The frame extended the queue by one.
    Stored,
    /// The frame was already present and has been overwritten with the same frame.
    Duplicate,
    /// The frame would leave a hole after the last added frame; it was dropped.
    Gap {
        /// The next frame the queue would have accepted.
        expected: Frame,
    },
    /// The frame has fallen out of the window; it was dropped.
    Stale,
    /// The payload has the wrong length; it was dropped.
    Malformed,
}

/// Confirmed and predicted inputs of one device.
///
/// Two parallel rings of [`INPUT_QUEUE_LENGTH`] slots indexed by `frame % INPUT_QUEUE_LENGTH`:
/// the confirmed ring holds real inputs (stamped with their frame, or [`Frame::NULL`] while
/// only a prediction is known), the predicted ring holds the last prediction made for each
/// frame so it can be compared once the real input arrives.
///
/// Predictions hold the previous slot's payload, which is the cheapest predictor for
/// discrete controls and bounds a misprediction to one wrong input.
#[derive(Debug, Clone)]
pub struct InputQueue {
    confirmed: Vec<GameInput>,
    predicted: Vec<GameInput>,
    input_size: usize,
    player_count: usize,
    frame_delay: usize,
    /// Last frame handed to `add_input` (before delay) or `add_remote_input`.
    last_user_frame: Frame,
    /// Highest stamp written into the confirmed ring.
    last_added_frame: Frame,
}

impl InputQueue {
    /// Creates a queue for a device hosting `player_count` players.
    ///
    /// With `frame_delay > 0` frames `1..=frame_delay` are pre-filled with zeroed confirmed
    /// input, since local input added at frame `f` lands at `f + frame_delay`.
    #[must_use]
    pub fn new(input_size: usize, player_count: usize, frame_delay: usize) -> Self {
        let frame_delay = frame_delay.min(INPUT_QUEUE_LENGTH - 1);
        let blank = GameInput::blank(input_size, player_count);
        let mut queue = Self {
            confirmed: vec![blank.clone(); INPUT_QUEUE_LENGTH],
            predicted: vec![blank; INPUT_QUEUE_LENGTH],
            input_size,
            player_count,
            frame_delay,
            last_user_frame: Frame::INITIAL,
            last_added_frame: Frame::INITIAL,
        };
        for frame in 1..=frame_delay as i32 {
            let frame = Frame::new(frame);
            queue.confirmed[frame.slot(INPUT_QUEUE_LENGTH)].set_frame(frame);
            queue.last_added_frame = frame;
        }
        queue
    }

    /// Frames of delay applied to inputs added with [`InputQueue::add_input`].
    #[must_use]
    pub fn frame_delay(&self) -> usize {
        self.frame_delay
    }

    /// Players covered by this queue.
    #[must_use]
    pub fn player_count(&self) -> usize {
        self.player_count
    }

    /// Highest frame holding confirmed input.
    #[must_use]
    pub fn last_added_frame(&self) -> Frame {
        self.last_added_frame
    }

    /// Adds local input for `frame`. It is stored at `frame + frame_delay`.
    ///
    /// Returns the frame the input was stored at. Input must arrive strictly in order;
    /// anything else is a caller defect and returns [`ResyncError::InvalidFrame`].
    pub fn add_input(&mut self, frame: Frame, bytes: &[u8]) -> Result<Frame, ResyncError> {
        if frame != self.last_user_frame + 1 {
            return Err(ResyncError::InvalidFrame {
                frame,
                reason: format!(
                    "local input must be added in order, expected frame {}",
                    self.last_user_frame + 1
                ),
            });
        }
        let stamped = frame + self.frame_delay as i32;
        let input = GameInput::from_bytes(stamped, self.input_size, self.player_count, bytes)?;
        self.confirmed[stamped.slot(INPUT_QUEUE_LENGTH)] = input;
        self.last_user_frame = frame;
        self.last_added_frame = stamped;
        Ok(stamped)
    }

    /// Adds input received from the network for `frame`. No delay is applied.
    ///
    /// Re-delivered frames overwrite their slot. Gaps and frames that fell out of the
    /// window are dropped; the returned outcome tells the caller what happened.
    pub fn add_remote_input(&mut self, frame: Frame, bytes: &[u8]) -> RemoteInputOutcome {
        if bytes.len() != self.input_size * self.player_count {
            return RemoteInputOutcome::Malformed;
        }
        if frame > self.last_added_frame + 1 {
            return RemoteInputOutcome::Gap {
                expected: self.last_added_frame + 1,
            };
        }
        if !frame.is_valid() || self.last_added_frame - frame >= INPUT_QUEUE_LENGTH as i32 {
            return RemoteInputOutcome::Stale;
        }

        let slot = &mut self.confirmed[frame.slot(INPUT_QUEUE_LENGTH)];
        slot.write_bytes(bytes);
        slot.set_frame(frame);

        if frame == self.last_added_frame + 1 {
            self.last_added_frame = frame;
            self.last_user_frame = frame;
            RemoteInputOutcome::Stored
        } else {
            RemoteInputOutcome::Duplicate
        }
    }

    /// Returns the confirmed input of `frame`, if present.
    #[must_use]
    pub fn confirmed_input(&self, frame: Frame) -> Option<&GameInput> {
        if !frame.is_valid() {
            return None;
        }
        let input = &self.confirmed[frame.slot(INPUT_QUEUE_LENGTH)];
        (input.frame() == frame).then_some(input)
    }

    /// Returns the input for `frame`.
    ///
    /// Confirmed input is returned as is. Otherwise, with `predict`, the previous slot's
    /// payload is held: the confirmed slot receives it stamped [`Frame::NULL`] and the
    /// predicted ring records it stamped `frame`. Without `predict`, a missing frame
    /// yields a zeroed input stamped [`Frame::NULL`].
    pub fn get_input(&mut self, frame: Frame, predict: bool) -> GameInput {
        if !frame.is_valid() {
            return GameInput::blank(self.input_size, self.player_count);
        }
        let slot = frame.slot(INPUT_QUEUE_LENGTH);
        if self.confirmed[slot].frame() == frame {
            return self.confirmed[slot].clone();
        }
        if !predict {
            return GameInput::blank(self.input_size, self.player_count);
        }

        let previous = (slot + INPUT_QUEUE_LENGTH - 1) % INPUT_QUEUE_LENGTH;
        let held = self.confirmed[previous].clone();
        let current = &mut self.confirmed[slot];
        current.copy_payload_from(&held);
        current.set_frame(Frame::NULL);

        let prediction = &mut self.predicted[slot];
        prediction.copy_payload_from(&held);
        prediction.set_frame(frame);

        let mut result = held;
        result.set_frame(Frame::NULL);
        result
    }

    /// The prediction recorded for `frame`, if it has not been reset.
    #[must_use]
    pub fn predicted_input(&self, frame: Frame) -> Option<&GameInput> {
        if !frame.is_valid() {
            return None;
        }
        let prediction = &self.predicted[frame.slot(INPUT_QUEUE_LENGTH)];
        (prediction.frame() == frame).then_some(prediction)
    }

    /// Forgets the prediction recorded for `frame`.
    pub fn reset_prediction(&mut self, frame: Frame) {
        if !frame.is_valid() {
            return;
        }
        let prediction = &mut self.predicted[frame.slot(INPUT_QUEUE_LENGTH)];
        if prediction.frame() == frame {
            prediction.set_frame(Frame::NULL);
        }
    }
}

impl InvariantChecker for InputQueue {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.confirmed.len() != INPUT_QUEUE_LENGTH || self.predicted.len() != INPUT_QUEUE_LENGTH {
            return Err(InvariantViolation::new("InputQueue", "ring size changed")
                .with_details(format!(
                    "confirmed={}, predicted={}",
                    self.confirmed.len(),
                    self.predicted.len()
                )));
        }

        let expected_len = self.input_size * self.player_count;
        for (slot, input) in self.confirmed.iter().chain(self.predicted.iter()).enumerate() {
            if input.bytes().len() != expected_len {
                return Err(InvariantViolation::new("InputQueue", "input has wrong payload length")
                    .with_details(format!(
                        "slot={}, len={}, expected={}",
                        slot % INPUT_QUEUE_LENGTH,
                        input.bytes().len(),
                        expected_len
                    )));
            }
        }

        // a stamped slot must sit at its own index
        for (slot, input) in self.confirmed.iter().enumerate() {
            if input.frame().is_valid() && input.frame().slot(INPUT_QUEUE_LENGTH) != slot {
                return Err(InvariantViolation::new("InputQueue", "input stored in foreign slot")
                    .with_details(format!("slot={}, frame={}", slot, input.frame())));
            }
        }

        if self.last_added_frame < self.last_user_frame {
            return Err(InvariantViolation::new(
                "InputQueue",
                "last added frame behind last user frame",
            )
            .with_details(format!(
                "last_added={}, last_user={}",
                self.last_added_frame, self.last_user_frame
            )));
        }

        Ok(())
    }
}

// #########
// # TESTS #
// #########
