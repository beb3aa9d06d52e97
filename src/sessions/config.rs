//! Configuration types for sessions.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `DeviceConfig` | Handshake, liveness and ping timing per device | `lan()`, `high_latency()` |
//! | `TimeSyncConfig` | Rollback window and admission limit | `lan()`, `high_latency()` |
//! | `SessionConfig` | Everything above plus session sizes, assembled by the builder | |
//!
//! ```
//! use resync_rollback::{DeviceConfig, SessionBuilder, TimeSyncConfig};
//!
//! let builder = SessionBuilder::new()
//!     .with_device_config(DeviceConfig::lan())
//!     .with_time_sync_config(TimeSyncConfig::lan());
//! ```

use web_time::Duration;

use crate::time_sync::TimeSyncConfig;
use crate::{
    DesyncDetection, ResyncError, MAX_DEVICE_COUNT, MAX_INPUT_SIZE, MAX_TOTAL_PLAYER_COUNT,
    MIN_DEVICE_COUNT, MIN_INPUT_SIZE, MIN_TOTAL_PLAYER_COUNT,
};

/// Timing of the per-device connection protocol.
///
/// Use `..DeviceConfig::default()` when constructing instances so new fields do not
/// break your code.
///
/// ```
/// use resync_rollback::DeviceConfig;
/// use web_time::Duration;
///
/// let patient = DeviceConfig {
///     connection_test_limit: 1800,
///     ping_interval: Duration::from_millis(250),
///     ..DeviceConfig::default()
/// };
/// assert_eq!(patient.sync_round_trips, 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "DeviceConfig has no effect unless passed to SessionBuilder::with_device_config()"]
pub struct DeviceConfig {
    /// Confirmed handshake round trips required before a device runs.
    ///
    /// Default: 5
    pub sync_round_trips: u32,

    /// Wait before the first handshake retry.
    ///
    /// Default: 200ms
    pub sync_first_retry_interval: Duration,

    /// Wait between later handshake retries.
    ///
    /// Default: 1000ms
    pub sync_retry_interval: Duration,

    /// Consecutive polls without any message after which a running device is
    /// disconnected.
    ///
    /// Default: 600
    pub connection_test_limit: u32,

    /// Time between pings of a running device. Pings double as keep-alive.
    ///
    /// Default: 500ms
    pub ping_interval: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sync_round_trips: 5,
            sync_first_retry_interval: Duration::from_millis(200),
            sync_retry_interval: Duration::from_millis(1000),
            connection_test_limit: 600,
            ping_interval: Duration::from_millis(500),
        }
    }
}

impl DeviceConfig {
    /// Creates a new `DeviceConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for local networks: fewer round trips and faster retries.
    pub fn lan() -> Self {
        Self {
            sync_round_trips: 3,
            sync_first_retry_interval: Duration::from_millis(100),
            sync_retry_interval: Duration::from_millis(250),
            connection_test_limit: 300,
            ping_interval: Duration::from_millis(250),
        }
    }

    /// Preset for 100-200ms round trips. Retries wait longer and silence is tolerated
    /// for twice as many polls.
    pub fn high_latency() -> Self {
        Self {
            sync_round_trips: 5,
            sync_first_retry_interval: Duration::from_millis(400),
            sync_retry_interval: Duration::from_millis(1500),
            connection_test_limit: 1200,
            ping_interval: Duration::from_millis(1000),
        }
    }

    /// Rejects values the protocol cannot work with.
    pub fn validate(&self) -> Result<(), ResyncError> {
        if self.sync_round_trips == 0 {
            return Err(ResyncError::InvalidRequest {
                info: "sync_round_trips must be at least 1".to_owned(),
            });
        }
        if self.connection_test_limit == 0 {
            return Err(ResyncError::InvalidRequest {
                info: "connection_test_limit must be at least 1".to_owned(),
            });
        }
        Ok(())
    }
}

/// Everything a session is built from. Assembled by
/// [`SessionBuilder`](crate::SessionBuilder).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct SessionConfig {
    /// Bytes of input per player and frame.
    pub input_size: usize,
    /// Player-hosting devices in the session, the local one included.
    pub device_count: usize,
    /// Players across all devices.
    pub total_player_count: usize,
    /// Rollback window and admission limit.
    pub time_sync: TimeSyncConfig,
    /// Connection protocol timing.
    pub device: DeviceConfig,
    /// Health check cadence.
    pub desync_detection: DesyncDetection,
    /// Frames a spectator buffers before it starts replaying.
    pub initial_frame_buffer: usize,
    /// Minimum frames between two `WaitRecommendation` events.
    pub wait_recommendation_interval: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_size: 1,
            device_count: 2,
            total_player_count: 2,
            time_sync: TimeSyncConfig::default(),
            device: DeviceConfig::default(),
            desync_detection: DesyncDetection::default(),
            initial_frame_buffer: 30,
            wait_recommendation_interval: 60,
        }
    }
}

impl SessionConfig {
    /// Creates a new `SessionConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks every bound. Violations are caller defects.
    pub fn validate(&self) -> Result<(), ResyncError> {
        check_range("input size", self.input_size, MIN_INPUT_SIZE, MAX_INPUT_SIZE)?;
        check_range(
            "device count",
            self.device_count,
            MIN_DEVICE_COUNT,
            MAX_DEVICE_COUNT,
        )?;
        check_range(
            "total player count",
            self.total_player_count,
            MIN_TOTAL_PLAYER_COUNT,
            MAX_TOTAL_PLAYER_COUNT,
        )?;
        if self.total_player_count < self.device_count {
            return Err(ResyncError::InvalidRequest {
                info: format!(
                    "{} players cannot fill {} devices",
                    self.total_player_count, self.device_count
                ),
            });
        }
        if self.time_sync.max_rollback_frames < 1 {
            return Err(ResyncError::InvalidRequest {
                info: "max_rollback_frames must be at least 1".to_owned(),
            });
        }
        if let DesyncDetection::On { interval: 0 } = self.desync_detection {
            return Err(ResyncError::InvalidRequest {
                info: "desync detection interval must be at least 1".to_owned(),
            });
        }
        self.device.validate()
    }
}

fn check_range(what: &str, value: usize, min: usize, max: usize) -> Result<(), ResyncError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ResyncError::InvalidRequest {
            info: format!("{what} must be between {min} and {max}, got {value}"),
        })
    }
}
