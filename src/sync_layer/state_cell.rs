//! Snapshot slots handed to the host in [`Action::Load`] and [`Action::Save`].
//!
//! [`Action::Load`]: crate::Action::Load
//! [`Action::Save`]: crate::Action::Save

use std::sync::Arc;

use parking_lot::Mutex;

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{Frame, ResyncError};

/// One saved simulation snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedState {
    /// The frame the snapshot was taken at, or [`Frame::NULL`] for an empty slot.
    pub frame: Frame,
    /// Opaque simulation state.
    pub buffer: Vec<u8>,
    /// Checksum of the state; `0` means unknown.
    pub checksum: u32,
}

impl Default for SavedState {
    fn default() -> Self {
        Self {
            frame: Frame::NULL,
            buffer: Vec::new(),
            checksum: 0,
        }
    }
}

/// A shared slot of the snapshot ring.
///
/// Clones share the same slot, so the host may hold on to a cell received in an action
/// while the session keeps using it.
///
/// ```
/// use resync_rollback::{Frame, StateCell};
///
/// let cell = StateCell::default();
/// assert!(cell.save(Frame::new(4), vec![1, 2, 3], 0xBEEF));
/// let saved = cell.load().unwrap();
/// assert_eq!(saved.frame, Frame::new(4));
/// assert_eq!(saved.buffer, vec![1, 2, 3]);
/// assert_eq!(cell.checksum(), 0xBEEF);
/// ```
#[derive(Debug, Clone, Default)]
pub struct StateCell(Arc<Mutex<SavedState>>);

impl StateCell {
    /// Stores a snapshot of `frame` in the slot, replacing whatever was there.
    ///
    /// Returns `false` for [`Frame::NULL`], which is a caller error.
    pub fn save(&self, frame: Frame, buffer: impl Into<Vec<u8>>, checksum: u32) -> bool {
        if frame.is_null() {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::StateStorage,
                "attempted to save a snapshot with a null frame"
            );
            return false;
        }
        let mut state = self.0.lock();
        state.frame = frame;
        state.buffer = buffer.into();
        state.checksum = checksum;
        true
    }

    /// Returns a copy of the stored snapshot.
    ///
    /// Fails with [`ResyncError::InvalidFrame`] if nothing was saved yet.
    pub fn load(&self) -> Result<SavedState, ResyncError> {
        let state = self.0.lock();
        if state.frame.is_null() {
            return Err(ResyncError::InvalidFrame {
                frame: Frame::NULL,
                reason: "no snapshot was saved into this cell".to_owned(),
            });
        }
        Ok(state.clone())
    }

    /// Runs `f` on the stored buffer without copying it.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.0.lock().buffer)
    }

    /// The frame of the stored snapshot.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.0.lock().frame
    }

    /// The checksum of the stored snapshot; `0` means unknown.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        self.0.lock().checksum
    }

    /// `true` if both handles refer to the same slot.
    #[must_use]
    pub fn same_slot(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
