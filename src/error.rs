use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{DeviceId, Frame};

/// All errors this library can return.
///
/// Errors describe caller defects (wrong parameters, calls in the wrong order) or I/O
/// failures of the bundled adapters. Network conditions such as packet loss, latency or
/// desyncs are not errors; they surface as device states and [`SessionEvent`]s.
///
/// [`SessionEvent`]: crate::SessionEvent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResyncError {
    /// The local simulation is too far ahead of the remote devices to accept more input.
    PredictionThreshold,
    /// An invalid request, usually wrong parameters or calls made in the wrong order.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// The session is still synchronizing with at least one device.
    NotSynchronized,
    /// A frame outside the permitted range was used.
    InvalidFrame {
        /// The offending frame.
        frame: Frame,
        /// Why the frame was rejected.
        reason: String,
    },
    /// The device id is not registered with the session.
    UnknownDevice {
        /// The unknown id.
        device_id: DeviceId,
    },
    /// Encoding or decoding of data failed.
    SerializationError {
        /// What failed to serialize or deserialize.
        context: String,
    },
    /// A socket operation of a bundled transport failed.
    SocketError {
        /// The underlying failure.
        context: String,
    },
    /// Reading or writing a replay artifact failed.
    ReplayError {
        /// The underlying failure.
        context: String,
    },
}

impl Display for ResyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResyncError::PredictionThreshold => {
                write!(
                    f,
                    "Prediction threshold is reached, cannot proceed without catching up."
                )
            }
            ResyncError::InvalidRequest { info } => write!(f, "Invalid Request: {}", info),
            ResyncError::NotSynchronized => {
                write!(f, "The session is not yet synchronized with all devices.")
            }
            ResyncError::InvalidFrame { frame, reason } => {
                write!(f, "Invalid frame {}: {}", frame, reason)
            }
            ResyncError::UnknownDevice { device_id } => {
                write!(f, "Device {} is not part of this session", device_id)
            }
            ResyncError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            }
            ResyncError::SocketError { context } => write!(f, "Socket error: {}", context),
            ResyncError::ReplayError { context } => write!(f, "Replay error: {}", context),
        }
    }
}

impl Error for ResyncError {}

impl From<std::io::Error> for ResyncError {
    fn from(err: std::io::Error) -> Self {
        ResyncError::SocketError {
            context: err.to_string(),
        }
    }
}
