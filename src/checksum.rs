//! Deterministic checksums for saved snapshots.
//!
//! Devices exchange the checksum of confirmed frames to detect desyncs, so the value
//! must be identical on every peer for identical state. Serialization goes through the
//! fixed-int bincode configuration of [`codec`](crate::network::codec) and hashing is
//! FNV-1a, which has no random seed.
//!
//! A checksum of `0` means "unknown" everywhere in this crate. The helpers here never
//! return `0` for real data.
//!
//! ```
//! use resync_rollback::checksum::compute_checksum;
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct GameState {
//!     frame: u32,
//!     positions: [i32; 2],
//! }
//!
//! let state = GameState { frame: 100, positions: [4, -7] };
//! let checksum = compute_checksum(&state).expect("serialization should succeed");
//! assert_ne!(checksum, 0);
//! assert_eq!(checksum, compute_checksum(&state).unwrap());
//! ```
//!
//! Inside the save handler:
//!
//! ```ignore
//! Action::Save { frame, cell } => {
//!     let bytes = bincode::serde::encode_to_vec(&game_state, config)?;
//!     cell.save(frame, bytes.clone(), checksum_bytes(&bytes));
//! }
//! ```

use serde::Serialize;

use crate::network::codec::{encode, CodecError};

const FNV_OFFSET_BASIS_32: u32 = 0x811c_9dc5;
const FNV_PRIME_32: u32 = 0x0100_0193;
const FNV_OFFSET_BASIS_64: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME_64: u64 = 0x0000_0100_0000_01b3;

/// 32-bit FNV-1a of `bytes`.
#[inline]
#[must_use]
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS_32, |hash, &byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME_32)
    })
}

/// 64-bit FNV-1a of `bytes`.
#[inline]
#[must_use]
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS_64, |hash, &byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME_64)
    })
}

/// Snapshot checksum of raw bytes. Never `0`.
#[inline]
#[must_use]
pub fn checksum_bytes(bytes: &[u8]) -> u32 {
    non_zero(fnv1a_32(bytes))
}

/// Serializes `state` and returns its checksum. Never `0`.
pub fn compute_checksum<T: Serialize>(state: &T) -> Result<u32, ChecksumError> {
    let bytes = encode(state)?;
    Ok(checksum_bytes(&bytes))
}

// 0 is reserved for "unknown"
#[inline]
fn non_zero(checksum: u32) -> u32 {
    if checksum == 0 {
        1
    } else {
        checksum
    }
}

/// Checksum computation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumError {
    /// The state could not be serialized.
    SerializationFailed(String),
}

impl From<CodecError> for ChecksumError {
    fn from(err: CodecError) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

impl std::fmt::Display for ChecksumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationFailed(msg) => write!(f, "checksum failed: {msg}"),
        }
    }
}

impl std::error::Error for ChecksumError {}

impl From<ChecksumError> for crate::ResyncError {
    fn from(err: ChecksumError) -> Self {
        Self::SerializationError {
            context: err.to_string(),
        }
    }
}
