//! Every message goes through one bincode configuration, so encodings are identical on
//! every peer:
//!
//! ```
//! use resync_rollback::network::codec::{decode_message, encode_message};
//! use resync_rollback::{DeviceId, Message, MessageBody};
//!
//! let message = Message {
//!     sequence: 7,
//!     body: MessageBody::SyncRequest { device_id: DeviceId::new(1), player_count: 2, nonce: 99 },
//! };
//! let bytes = encode_message(&message).unwrap();
//! assert_eq!(decode_message(&bytes).unwrap(), message);
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use crate::{Message, ResyncError};

// fixed-size integers keep message sizes independent of the values they carry
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// What the codec was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a [`Message`].
    EncodeMessage,
    /// Decoding a [`Message`].
    DecodeMessage,
    /// Encoding into a caller-provided buffer.
    EncodeIntoBuffer,
    /// Encoding any other value.
    Encode,
    /// Decoding any other value.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeMessage => write!(f, "encoding message"),
            Self::DecodeMessage => write!(f, "decoding message"),
            Self::EncodeIntoBuffer => write!(f, "encoding into buffer"),
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Encoding or decoding failure.
///
/// bincode errors only expose a message, so that message is carried as a string.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// Encoding failed.
    EncodeError {
        /// The bincode error message.
        message: String,
        /// The operation that failed.
        operation: CodecOperation,
    },
    /// Decoding failed.
    DecodeError {
        /// The bincode error message.
        message: String,
        /// The operation that failed.
        operation: CodecOperation,
    },
    /// The buffer cannot hold the encoded value.
    BufferTooSmall {
        /// Size of the provided buffer.
        provided: usize,
    },
    /// Bytes were left over after decoding a message.
    TrailingBytes {
        /// Number of unread bytes.
        remaining: usize,
    },
}

impl CodecError {
    fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            }
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            }
            Self::BufferTooSmall { provided } => {
                write!(f, "buffer too small: only {provided} bytes provided")
            }
            Self::TrailingBytes { remaining } => {
                write!(f, "{remaining} trailing bytes after message")
            }
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for ResyncError {
    fn from(err: CodecError) -> Self {
        Self::SerializationError {
            context: err.to_string(),
        }
    }
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes any serializable value.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Decodes a value and reports how many bytes were consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Encodes a [`Message`] into a new buffer.
pub fn encode_message(message: &Message) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(message, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::EncodeMessage))
}

/// Encodes a [`Message`] into `buffer` and returns the number of bytes written.
pub fn encode_message_into(message: &Message, buffer: &mut [u8]) -> CodecResult<usize> {
    bincode::serde::encode_into_slice(message, buffer, config()).map_err(|e| {
        let msg = e.to_string();
        if msg.contains("UnexpectedEnd") || msg.contains("not enough") {
            CodecError::BufferTooSmall {
                provided: buffer.len(),
            }
        } else {
            CodecError::encode(msg, CodecOperation::EncodeIntoBuffer)
        }
    })
}

/// Decodes one complete [`Message`]. Trailing bytes are an error.
pub fn decode_message(bytes: &[u8]) -> CodecResult<Message> {
    let (message, read) = bincode::serde::decode_from_slice::<Message, _>(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::DecodeMessage))?;
    if read != bytes.len() {
        return Err(CodecError::TrailingBytes {
            remaining: bytes.len() - read,
        });
    }
    Ok(message)
}
