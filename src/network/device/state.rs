//! Connection state machine of a device.
//!
//! ```text
//!   ┌─────────┐  last SyncConfirm   ┌─────────┐  silent polls ≥ limit  ┌──────────────┐
//!   │ Syncing │ ──────────────────► │ Running │ ─────────────────────► │ Disconnected │
//!   └─────────┘                     └─────────┘  or Disconnect         └──────────────┘
//!        │                                                                    ▲
//!        └──────────────────────────── Disconnect ───────────────────────────┘
//! ```
//!
//! [`transition`] is a pure function of the current state, the timers, one signal and the
//! limits. Disconnected is terminal.

use serde::{Deserialize, Serialize};

/// Role of a device in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceType {
    /// The device running this session.
    Local,
    /// A device hosting remote players.
    Remote,
    /// A device watching the session without players.
    Spectator,
}

/// Connection state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// Handshake in progress.
    Syncing,
    /// Handshake complete, input flows.
    Running,
    /// Gone for good.
    Disconnected,
}

impl DeviceState {
    /// Name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Syncing => "syncing",
            Self::Running => "running",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds the state machine works against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Handshake round trips required before Running.
    pub sync_round_trips: u32,
    /// Consecutive silent polls after which a Running device is disconnected.
    pub connection_test_limit: u32,
}

/// Counters carried between transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateTimers {
    /// Handshake round trips still missing.
    pub sync_round_trips_remaining: u32,
    /// Polls since the last message from the device.
    pub silent_polls: u32,
}

impl StateTimers {
    /// Fresh timers for a device about to start its handshake.
    #[must_use]
    pub const fn new(limits: DeviceLimits) -> Self {
        Self {
            sync_round_trips_remaining: limits.sync_round_trips,
            silent_polls: 0,
        }
    }
}

/// Input to [`transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSignal {
    /// A SyncConfirm matched one of our outstanding nonces.
    SyncConfirmed,
    /// Any message arrived from the device.
    MessageReceived,
    /// A poll went by without any message from the device.
    SilentPoll,
    /// The host or the session dropped the device.
    Disconnect,
}

/// Next state and timers after `signal`.
#[must_use]
pub fn transition(
    state: DeviceState,
    timers: StateTimers,
    signal: DeviceSignal,
    limits: DeviceLimits,
) -> (DeviceState, StateTimers) {
    match (state, signal) {
        (DeviceState::Disconnected, _) => (state, timers),
        (_, DeviceSignal::Disconnect) => (DeviceState::Disconnected, timers),
        (_, DeviceSignal::MessageReceived) => (
            state,
            StateTimers {
                silent_polls: 0,
                ..timers
            },
        ),
        (DeviceState::Syncing, DeviceSignal::SyncConfirmed) => {
            let remaining = timers.sync_round_trips_remaining.saturating_sub(1);
            let timers = StateTimers {
                sync_round_trips_remaining: remaining,
                ..timers
            };
            if remaining == 0 {
                (DeviceState::Running, timers)
            } else {
                (DeviceState::Syncing, timers)
            }
        }
        // late confirms after the handshake are harmless
        (DeviceState::Running, DeviceSignal::SyncConfirmed) => (state, timers),
        (DeviceState::Syncing, DeviceSignal::SilentPoll) => (state, timers),
        (DeviceState::Running, DeviceSignal::SilentPoll) => {
            let silent_polls = timers.silent_polls.saturating_add(1);
            let timers = StateTimers {
                silent_polls,
                ..timers
            };
            if silent_polls >= limits.connection_test_limit {
                (DeviceState::Disconnected, timers)
            } else {
                (DeviceState::Running, timers)
            }
        }
    }
}
