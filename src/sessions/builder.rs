use std::sync::Arc;

use crate::sessions::config::{DeviceConfig, SessionConfig};
use crate::telemetry::ViolationObserver;
use crate::time_sync::TimeSyncConfig;
use crate::{DesyncDetection, Peer2PeerSession, ResyncError, SpectatorSession, Transport};

/// The [`SessionBuilder`] builds every session type.
///
/// Set the sizes and tuning values, then consume the builder with
/// [`start_p2p_session`](Self::start_p2p_session) or
/// [`start_spectator_session`](Self::start_spectator_session). Bounds are checked when the
/// session starts.
///
/// ```
/// use resync_rollback::{DeviceId, LoopbackNetwork, SessionBuilder};
///
/// let network = LoopbackNetwork::new();
/// let mut session = SessionBuilder::new()
///     .with_input_size(2)
///     .with_device_count(2)
///     .with_total_player_count(2)
///     .start_p2p_session(network.endpoint(DeviceId::new(0)))?;
/// session.set_local_device(DeviceId::new(0), 1, 0)?;
/// session.add_remote_device(DeviceId::new(1), 1, DeviceId::new(1))?;
/// assert!(!session.is_running());
/// # Ok::<(), resync_rollback::ResyncError>(())
/// ```
#[must_use = "SessionBuilder must be consumed by calling a start_*_session method"]
#[derive(Clone, Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            config,
            violation_observer,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("config", config)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl SessionBuilder {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of input each player contributes per frame. Default is 1.
    pub fn with_input_size(mut self, input_size: usize) -> Self {
        self.config.input_size = input_size;
        self
    }

    /// Player-hosting devices in the session, the local one included. Default is 2.
    pub fn with_device_count(mut self, device_count: usize) -> Self {
        self.config.device_count = device_count;
        self
    }

    /// Players across all devices. Default is 2.
    pub fn with_total_player_count(mut self, total_player_count: usize) -> Self {
        self.config.total_player_count = total_player_count;
        self
    }

    /// Rollback window and admission limit.
    pub fn with_time_sync_config(mut self, time_sync: TimeSyncConfig) -> Self {
        self.config.time_sync = time_sync;
        self
    }

    /// Handshake, liveness and ping timing.
    pub fn with_device_config(mut self, device: DeviceConfig) -> Self {
        self.config.device = device;
        self
    }

    /// Sets how often running devices exchange checksums of confirmed frames.
    /// A mismatch raises [`SessionEvent::DesyncDetected`](crate::SessionEvent::DesyncDetected).
    pub fn with_desync_detection(mut self, desync_detection: DesyncDetection) -> Self {
        self.config.desync_detection = desync_detection;
        self
    }

    /// Frames a spectator queues before it starts replaying. Default is 30.
    pub fn with_initial_frame_buffer(mut self, frames: usize) -> Self {
        self.config.initial_frame_buffer = frames;
        self
    }

    /// Minimum frames between two wait recommendations. Default is 60.
    pub fn with_wait_recommendation_interval(mut self, frames: u32) -> Self {
        self.config.wait_recommendation_interval = frames;
        self
    }

    /// Sets a custom observer for protocol and invariant violations.
    ///
    /// Without one, violations are logged through `tracing`.
    ///
    /// ```
    /// use resync_rollback::{SessionBuilder, telemetry::CollectingObserver};
    /// use std::sync::Arc;
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let _builder = SessionBuilder::new().with_violation_observer(observer.clone());
    /// assert!(observer.is_empty());
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// The configuration assembled so far.
    pub fn config(&self) -> SessionConfig {
        self.config
    }

    /// Consumes the builder to construct a [`Peer2PeerSession`] on `transport`.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if any size or tuning value is out of bounds.
    ///
    /// [`InvalidRequest`]: ResyncError::InvalidRequest
    pub fn start_p2p_session<T: Transport>(
        self,
        transport: T,
    ) -> Result<Peer2PeerSession<T>, ResyncError> {
        self.config.validate()?;
        Ok(Peer2PeerSession::new(
            self.config,
            transport,
            self.violation_observer,
        ))
    }

    /// Consumes the builder to construct a [`SpectatorSession`] on `transport`.
    ///
    /// The spectator follows the host's combined input of `total_player_count` players.
    ///
    /// # Errors
    /// - Returns [`InvalidRequest`] if any size or tuning value is out of bounds.
    ///
    /// [`InvalidRequest`]: ResyncError::InvalidRequest
    pub fn start_spectator_session<T: Transport>(
        self,
        transport: T,
    ) -> Result<SpectatorSession<T>, ResyncError> {
        self.config.validate()?;
        Ok(SpectatorSession::new(
            self.config,
            transport,
            self.violation_observer,
        ))
    }
}
