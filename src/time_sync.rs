use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{Frame, FRAME_ADVANTAGE_LIMIT, MAX_ROLLBACK_FRAMES};

/// Configuration of frame admission.
///
/// # Example
///
/// ```
/// use resync_rollback::TimeSyncConfig;
///
/// // tolerate a longer rollback window on lossy links
/// let config = TimeSyncConfig {
///     max_rollback_frames: 8,
///     ..TimeSyncConfig::default()
/// };
/// assert_eq!(config.frame_advantage_limit, 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncConfig {
    /// The local simulation may run at most `max_rollback_frames - 1` frames ahead of the
    /// slowest remote device. Also sizes the snapshot ring.
    ///
    /// Default: [`MAX_ROLLBACK_FRAMES`] (7)
    pub max_rollback_frames: i32,
    /// Largest tolerated difference between the local frame advantage and the largest
    /// advantage a remote device reports.
    ///
    /// Default: [`FRAME_ADVANTAGE_LIMIT`] (5)
    pub frame_advantage_limit: i32,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            max_rollback_frames: MAX_ROLLBACK_FRAMES,
            frame_advantage_limit: FRAME_ADVANTAGE_LIMIT,
        }
    }
}

impl TimeSyncConfig {
    /// Creates a new `TimeSyncConfig` with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration preset for LAN play.
    ///
    /// Latency is low, so a tighter advantage limit keeps peers closer together.
    #[must_use]
    pub fn lan() -> Self {
        Self {
            max_rollback_frames: MAX_ROLLBACK_FRAMES,
            frame_advantage_limit: 2,
        }
    }

    /// Configuration preset for high latency links.
    ///
    /// Allows one more frame of rollback before the local side has to wait.
    #[must_use]
    pub fn high_latency() -> Self {
        Self {
            max_rollback_frames: MAX_ROLLBACK_FRAMES + 1,
            frame_advantage_limit: FRAME_ADVANTAGE_LIMIT,
        }
    }
}

/// What [`TimeSync::is_time_synced`] needs to know about one Remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCursor {
    /// Newest frame received from the device.
    pub remote_frame: Frame,
    /// Frame advantage the device reported with that frame.
    pub remote_frame_advantage: i32,
}

/// Frame cursors and the admission rule.
///
/// Pure bookkeeping: no history is kept, every decision is made from the current cursors.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing and fuzzing.
/// It is not part of the stable public API.
#[derive(Debug, Clone)]
pub struct TimeSync {
    /// Highest frame for which every device's input is known to be correct.
    pub sync_frame: Frame,
    /// Highest frame the local simulation has advanced to.
    pub local_frame: Frame,
    /// Slowest remote frame seen by the last admission check.
    pub remote_frame: Frame,
    /// `local_frame - remote_frame` at the last admission check.
    pub local_frame_advantage: i32,
    /// Largest advantage reported by a remote at the last admission check.
    pub remote_frame_advantage: i32,
    /// `local_frame_advantage - remote_frame_advantage` at the last admission check.
    pub frame_advantage_difference: i32,
    config: TimeSyncConfig,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::with_config(TimeSyncConfig::default())
    }
}

impl TimeSync {
    /// Creates a new TimeSync with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new TimeSync with the given configuration.
    #[must_use]
    pub fn with_config(config: TimeSyncConfig) -> Self {
        if config.max_rollback_frames < 1 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "max_rollback_frames must be at least 1, got {}",
                config.max_rollback_frames
            );
        }
        Self {
            sync_frame: Frame::INITIAL,
            local_frame: Frame::INITIAL,
            remote_frame: Frame::INITIAL,
            local_frame_advantage: 0,
            remote_frame_advantage: 0,
            frame_advantage_difference: 0,
            config,
        }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> TimeSyncConfig {
        self.config
    }

    /// Decides whether the local simulation may advance one more frame.
    ///
    /// `remotes` describes every Remote device. The slowest remote frame and the largest
    /// reported advantage are folded into the cursors before the rule
    /// `local_advantage < max_rollback_frames && difference <= frame_advantage_limit`
    /// is applied. Without remotes the local side is never held back.
    pub fn is_time_synced(&mut self, remotes: &[RemoteCursor]) -> bool {
        let Some(remote_frame) = remotes.iter().map(|r| r.remote_frame).min() else {
            self.remote_frame = self.local_frame;
            self.local_frame_advantage = 0;
            self.remote_frame_advantage = 0;
            self.frame_advantage_difference = 0;
            return true;
        };
        // a remote that reports being behind never lowers the bar below zero
        let remote_frame_advantage = remotes
            .iter()
            .map(|r| r.remote_frame_advantage)
            .fold(0, i32::max);

        self.remote_frame = remote_frame;
        self.remote_frame_advantage = remote_frame_advantage;
        self.local_frame_advantage = self.local_frame.as_i32().saturating_sub(remote_frame.as_i32());
        self.frame_advantage_difference = self
            .local_frame_advantage
            .saturating_sub(remote_frame_advantage);

        self.local_frame_advantage < self.config.max_rollback_frames
            && self.frame_advantage_difference <= self.config.frame_advantage_limit
    }

    /// Refreshes `remote_frame` from `remotes` without evaluating admission.
    pub fn update_remote_frame(&mut self, remotes: &[RemoteCursor]) {
        if let Some(remote_frame) = remotes.iter().map(|r| r.remote_frame).min() {
            self.remote_frame = remote_frame;
        }
    }

    /// `true` if some already simulated frame after `sync_frame` has new remote truth.
    #[must_use]
    pub fn should_rollback(&self) -> bool {
        self.local_frame > self.sync_frame && self.remote_frame > self.sync_frame
    }
}

// #########
// # TESTS #
// #########
