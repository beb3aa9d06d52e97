//! Byte-oriented run-length encoding for replay artifacts.
//!
//! Recorded input is dominated by long runs of identical bytes (idle players, held
//! buttons), and snapshots tend to contain runs of zeros. The encoding is a sequence of
//! segments, each starting with an LEB128 varint header:
//!
//! - **Run**: `varint(length << 1 | 1)` followed by the repeated byte.
//! - **Literal**: `varint(length << 1)` followed by `length` raw bytes.
//!
//! ```
//! use resync_rollback::rle::{decode, encode};
//!
//! let data = vec![0, 0, 0, 0, 0, 0, 7, 1, 2, 3, 9, 9, 9, 9];
//! let encoded = encode(&data);
//! assert!(encoded.len() < data.len());
//! assert_eq!(decode(&encoded).unwrap(), data);
//! ```

use std::fmt;

use crate::ResyncError;

/// Shortest run worth a run segment. Shorter repeats stay inside literals.
const MIN_RUN: usize = 3;

/// Refuses to decode more than this many bytes from a single buffer.
pub const MAX_DECODED_LEN: usize = 64 * 1024 * 1024;

mod varint {
    /// Appends `value` as LEB128.
    pub fn push(mut value: u64, out: &mut Vec<u8>) {
        while value >= 0x80 {
            out.push((value as u8) | 0x80);
            value >>= 7;
        }
        out.push(value as u8);
    }

    /// Reads a varint at `offset`. Returns the value and the bytes consumed, or `None`
    /// if the buffer ends mid-varint or the value does not fit in 64 bits.
    pub fn read(buf: &[u8], offset: usize) -> Option<(u64, usize)> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        for (i, &byte) in buf.get(offset..)?.iter().enumerate() {
            if shift >= 64 {
                return None;
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Some((value, i + 1));
            }
            shift += 7;
        }
        None
    }
}

/// Malformed RLE data.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RleError {
    /// A segment header or its payload runs past the end of the buffer.
    Truncated {
        /// Where the broken segment starts.
        offset: usize,
    },
    /// The decoded output would exceed [`MAX_DECODED_LEN`].
    TooLong {
        /// Decoded length reached before giving up.
        length: usize,
    },
}

impl fmt::Display for RleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { offset } => {
                write!(f, "RLE segment at offset {offset} is truncated")
            }
            Self::TooLong { length } => write!(
                f,
                "RLE data decodes to more than {MAX_DECODED_LEN} bytes ({length} so far)"
            ),
        }
    }
}

impl std::error::Error for RleError {}

impl From<RleError> for ResyncError {
    fn from(err: RleError) -> Self {
        Self::SerializationError {
            context: err.to_string(),
        }
    }
}

/// Run-length encodes `buf`.
pub fn encode(buf: impl AsRef<[u8]>) -> Vec<u8> {
    let buf = buf.as_ref();
    let mut out = Vec::with_capacity(buf.len() / 2 + 2);
    let mut literal_start = 0;
    let mut i = 0;

    while let Some(&byte) = buf.get(i) {
        let run = buf[i..].iter().take_while(|&&b| b == byte).count();
        if run >= MIN_RUN {
            write_literal(&mut out, &buf[literal_start..i]);
            varint::push(((run as u64) << 1) | 1, &mut out);
            out.push(byte);
            i += run;
            literal_start = i;
        } else {
            i += run;
        }
    }
    write_literal(&mut out, &buf[literal_start..]);
    out
}

fn write_literal(out: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    varint::push((bytes.len() as u64) << 1, out);
    out.extend_from_slice(bytes);
}

/// Decodes data produced by [`encode`].
pub fn decode(buf: impl AsRef<[u8]>) -> Result<Vec<u8>, RleError> {
    let buf = buf.as_ref();
    let mut out = Vec::with_capacity(buf.len() * 2);
    let mut offset = 0;

    while offset < buf.len() {
        let segment_start = offset;
        let (header, consumed) = varint::read(buf, offset).ok_or(RleError::Truncated {
            offset: segment_start,
        })?;
        offset += consumed;

        let len = usize::try_from(header >> 1).map_err(|_| RleError::TooLong {
            length: out.len(),
        })?;
        if out.len().saturating_add(len) > MAX_DECODED_LEN {
            return Err(RleError::TooLong { length: out.len() });
        }

        if header & 1 == 1 {
            let &byte = buf.get(offset).ok_or(RleError::Truncated {
                offset: segment_start,
            })?;
            out.resize(out.len() + len, byte);
            offset += 1;
        } else {
            let end = offset.checked_add(len).ok_or(RleError::Truncated {
                offset: segment_start,
            })?;
            let literal = buf.get(offset..end).ok_or(RleError::Truncated {
                offset: segment_start,
            })?;
            out.extend_from_slice(literal);
            offset = end;
        }
    }

    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        assert!(encode([]).is_empty());
        assert_eq!(decode([]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_long_run_is_compact() {
        let data = vec![0u8; 1000];
        let encoded = encode(&data);
        // 2-byte varint header plus the repeated byte
        assert_eq!(encoded.len(), 3);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_short_repeats_stay_literal() {
        let data = [5u8, 5, 6, 6, 7];
        let encoded = encode(data);
        assert_eq!(encoded, vec![10, 5, 5, 6, 6, 7]);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_mixed_segments() {
        let data = [1u8, 2, 9, 9, 9, 9, 3];
        let encoded = encode(data);
        assert_eq!(encoded, vec![4, 1, 2, 9, 9, 2, 3]);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_truncated_segments_are_rejected() {
        // literal of 4 bytes with only 2 present
        assert_eq!(decode([8, 1, 2]), Err(RleError::Truncated { offset: 0 }));
        // run header without its byte
        assert_eq!(decode([7]), Err(RleError::Truncated { offset: 0 }));
        // varint continuation bit on the last byte
        assert_eq!(decode([2, 1, 0x80]), Err(RleError::Truncated { offset: 2 }));
    }

    #[test]
    fn test_oversized_run_is_rejected() {
        let mut bytes = Vec::new();
        varint::push(((MAX_DECODED_LEN as u64 + 1) << 1) | 1, &mut bytes);
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(RleError::TooLong { .. })));
    }

    #[test]
    fn test_error_converts_to_serialization_error() {
        let err: ResyncError = RleError::Truncated { offset: 4 }.into();
        assert!(matches!(err, ResyncError::SerializationError { .. }));
    }
}
