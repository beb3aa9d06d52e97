//! Re-exports of the types a host needs to drive a session.
//!
//! ```rust
//! use resync_rollback::prelude::*;
//!
//! fn run<T: Transport>(session: &mut Peer2PeerSession<T>, input: &[u8]) -> Result<(), ResyncError> {
//!     session.poll();
//!     if !session.is_running() {
//!         return Ok(());
//!     }
//!     for action in session.advance_frame(input)? {
//!         match action {
//!             Action::Load { cell, .. } => {
//!                 let _state = cell.load()?.buffer;
//!             }
//!             Action::Save { frame, cell } => {
//!                 cell.save(frame, vec![0u8; 4], checksum_bytes(&[0u8; 4]));
//!             }
//!             Action::Advance { .. } => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub use crate::checksum::{checksum_bytes, compute_checksum};
pub use crate::error::ResyncError;
pub use crate::network::device::state::{DeviceState, DeviceType};
pub use crate::network::loopback::{LoopbackNetwork, LoopbackTransport};
pub use crate::network::udp_transport::UdpTransport;
pub use crate::sessions::builder::SessionBuilder;
pub use crate::sessions::config::{DeviceConfig, SessionConfig};
pub use crate::sessions::p2p_session::Peer2PeerSession;
pub use crate::sessions::replay::ReplayFile;
pub use crate::sessions::spectator_session::SpectatorSession;
pub use crate::sync_layer::{SavedState, StateCell};
pub use crate::time_sync::TimeSyncConfig;
pub use crate::{
    Action, DesyncDetection, DeviceId, Frame, SessionEvent, SessionState, Transport,
    NULL_FRAME,
};
