//! Replay artifacts recorded by spectators.
//!
//! A replay holds the combined input of every recorded frame plus an optional snapshot
//! of the simulation the recording starts from. Both are stored run-length encoded,
//! since input streams are dominated by long runs of identical bytes.
//!
//! ```
//! use resync_rollback::ReplayFile;
//!
//! let inputs = [0u8, 0, 0, 0, 1, 1];
//! let replay = ReplayFile::new(2, 3, &[], &inputs);
//! let bytes = replay.to_bytes()?;
//! let restored = ReplayFile::from_bytes(&bytes)?;
//! assert_eq!(restored.decoded_inputs()?, vec![vec![0, 0], vec![0, 0], vec![1, 1]]);
//! # Ok::<(), resync_rollback::ResyncError>(())
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::network::codec;
use crate::{rle, ResyncError};

/// File extension used by [`ReplayFile::save_to`] callers that want a default name.
pub const REPLAY_FILE_EXTENSION: &str = "rsreplay";

/// A recorded input stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFile {
    /// Bytes of combined input per frame.
    pub input_size: u32,
    /// Recorded frames.
    pub num_frames: i32,
    /// Run-length encoded snapshot the recording starts from. Empty if none was given.
    pub initial_state: Vec<u8>,
    /// Run-length encoded inputs, frame after frame.
    pub input_frames: Vec<u8>,
}

impl ReplayFile {
    /// Builds a replay of `num_frames` frames of `input_size` bytes each.
    #[must_use]
    pub fn new(input_size: u32, num_frames: i32, initial_state: &[u8], inputs: &[u8]) -> Self {
        Self {
            input_size,
            num_frames,
            initial_state: rle::encode(initial_state),
            input_frames: rle::encode(inputs),
        }
    }

    /// The snapshot the recording starts from.
    pub fn decoded_initial_state(&self) -> Result<Vec<u8>, ResyncError> {
        Ok(rle::decode(&self.initial_state)?)
    }

    /// The inputs split into frames.
    ///
    /// Fails if the decoded length disagrees with `num_frames * input_size`.
    pub fn decoded_inputs(&self) -> Result<Vec<Vec<u8>>, ResyncError> {
        let bytes = rle::decode(&self.input_frames)?;
        let frames = usize::try_from(self.num_frames).map_err(|_| ResyncError::ReplayError {
            context: format!("negative frame count {}", self.num_frames),
        })?;
        let size = self.input_size as usize;
        if frames == 0 {
            return if bytes.is_empty() {
                Ok(Vec::new())
            } else {
                Err(ResyncError::ReplayError {
                    context: format!("{} input bytes recorded for zero frames", bytes.len()),
                })
            };
        }
        if size == 0 || bytes.len() != frames * size {
            return Err(ResyncError::ReplayError {
                context: format!(
                    "{} input bytes do not split into {} frames of {} bytes",
                    bytes.len(),
                    frames,
                    size
                ),
            });
        }
        Ok(bytes.chunks_exact(size).map(<[u8]>::to_vec).collect())
    }

    /// Encodes the replay with the wire codec.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ResyncError> {
        Ok(codec::encode(self)?)
    }

    /// Decodes a replay. Trailing bytes are an error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ResyncError> {
        let (replay, read): (Self, usize) = codec::decode(bytes)?;
        if read != bytes.len() {
            return Err(ResyncError::ReplayError {
                context: format!("{} trailing bytes after replay", bytes.len() - read),
            });
        }
        Ok(replay)
    }

    /// Writes the replay to `path`, replacing any existing file.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ResyncError> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes).map_err(|e| ResyncError::ReplayError {
            context: format!("writing {}: {}", path.display(), e),
        })?;
        tracing::debug!(path = %path.display(), frames = self.num_frames, "replay saved");
        Ok(())
    }

    /// Reads a replay written by [`Self::save_to`].
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ResyncError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| ResyncError::ReplayError {
            context: format!("reading {}: {}", path.display(), e),
        })?;
        Self::from_bytes(&bytes)
    }

    /// Human readable export of the replay.
    #[cfg(feature = "json")]
    pub fn to_json(&self) -> Result<String, ResyncError> {
        serde_json::to_string(self).map_err(|e| ResyncError::SerializationError {
            context: e.to_string(),
        })
    }
}
