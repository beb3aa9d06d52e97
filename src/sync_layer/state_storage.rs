//! Ring of saved snapshots indexed by `frame % capacity`.

use crate::sync_layer::{SavedState, StateCell};
use crate::telemetry::{InvariantChecker, InvariantViolation};
use crate::{Frame, ResyncError};

/// Fixed ring of [`StateCell`]s.
///
/// Only the most recent `capacity` frames can be retained. Loading a frame whose slot
/// has been reused, or that was never saved, is a defect and returns an error.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing and fuzzing.
/// It is not part of the stable public API.
#[derive(Debug, Clone)]
pub struct StateStorage {
    cells: Vec<StateCell>,
}

impl StateStorage {
    /// Creates a ring with `capacity` slots (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            cells: (0..capacity).map(|_| StateCell::default()).collect(),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// The shared slot `frame` is saved into.
    pub fn cell(&self, frame: Frame) -> Result<StateCell, ResyncError> {
        if !frame.is_valid() {
            return Err(ResyncError::InvalidFrame {
                frame,
                reason: "frame must be non-negative".to_owned(),
            });
        }
        Ok(self.cells[frame.slot(self.cells.len())].clone())
    }

    /// Copies `buffer` into the slot of `frame`, overwriting the previous occupant.
    pub fn save_frame(&mut self, frame: Frame, buffer: &[u8], checksum: u32) -> Result<(), ResyncError> {
        let cell = self.cell(frame)?;
        cell.save(frame, buffer, checksum);
        Ok(())
    }

    /// Returns the snapshot of `frame`.
    pub fn load_frame(&self, frame: Frame) -> Result<SavedState, ResyncError> {
        let cell = self.cell(frame)?;
        let saved = cell.load().map_err(|_| ResyncError::InvalidFrame {
            frame,
            reason: "frame was never saved".to_owned(),
        })?;
        if saved.frame != frame {
            return Err(ResyncError::InvalidFrame {
                frame,
                reason: format!(
                    "slot holds frame {} instead; only the last {} frames are retained",
                    saved.frame,
                    self.cells.len()
                ),
            });
        }
        Ok(saved)
    }

    /// Checksum saved for `frame`. `None` if the frame is not retained or its checksum is
    /// unknown (`0`).
    #[must_use]
    pub fn checksum(&self, frame: Frame) -> Option<u32> {
        let cell = self.cell(frame).ok()?;
        if cell.frame() != frame {
            return None;
        }
        match cell.checksum() {
            0 => None,
            checksum => Some(checksum),
        }
    }

    /// Compares the checksum of `frame` with `other`.
    ///
    /// Returns `None` unless both checksums are known; unknown checksums never count as
    /// a mismatch.
    #[must_use]
    pub fn compare_checksum(&self, frame: Frame, other: u32) -> Option<bool> {
        if other == 0 {
            return None;
        }
        self.checksum(frame).map(|local| local == other)
    }
}

impl InvariantChecker for StateStorage {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let capacity = self.cells.len();
        for (slot, cell) in self.cells.iter().enumerate() {
            let frame = cell.frame();
            if frame.is_valid() && frame.slot(capacity) != slot {
                return Err(InvariantViolation::new("StateStorage", "snapshot in foreign slot")
                    .with_details(format!("slot={}, frame={}", slot, frame)));
            }
        }
        Ok(())
    }
}
