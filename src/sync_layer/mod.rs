//! # Sync Layer
//!
//! The rollback core. [`SyncLayer`] owns one [`InputQueue`] per player-hosting device, the
//! snapshot ring ([`StateStorage`]) and the frame cursors ([`TimeSync`]), and turns each
//! call of [`SyncLayer::advance_sync`] into the ordered list of [`Action`]s the host executes.
//!
//! ## One tick
//!
//! 1. On the very first tick, `Save(0)` establishes the rollback floor.
//! 2. The sync frame moves forward over every frame whose predictions turned out right.
//!    The first frame with a wrong prediction stops it one frame short.
//! 3. If simulated frames beyond the sync frame have new remote truth, the host is told
//!    to `Load` the sync frame and `Advance`/`Save` every frame up to the local frame again.
//! 4. If the admission rule allows it, the local frame advances with the new local input.
//! 5. Input ranges for every remote device (and confirmed ranges for spectators) are
//!    queued for the session to send.
//!
//! Device records held here are authoritative for everything frame related. The session
//! only reports what the network delivered through [`SyncLayer::add_remote_input`],
//! [`SyncLayer::acknowledge`] and [`SyncLayer::set_device_state`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::input_queue::{InputQueue, RemoteInputOutcome};
use crate::network::device::state::{DeviceState, DeviceType};
use crate::report_violation_to;
use crate::telemetry::{
    InvariantChecker, InvariantViolation, ViolationKind, ViolationObserver, ViolationSeverity,
};
use crate::time_sync::{RemoteCursor, TimeSync, TimeSyncConfig};
use crate::{Action, DeviceId, Frame, ResyncError, INPUT_QUEUE_LENGTH, STATE_STORAGE_MARGIN};

pub use state_cell::{SavedState, StateCell};
pub use state_storage::StateStorage;

mod state_cell;
mod state_storage;

/// Number of confirmed frame checksums kept for health checks.
const CHECKSUM_HISTORY_LENGTH: usize = 64;

/// Bound on the frame advantage a remote may claim. Nothing further apart than the input
/// window can be in play at once.
const MAX_REPORTED_ADVANTAGE: i32 = INPUT_QUEUE_LENGTH as i32;

/// Frame related record of one device.
#[derive(Debug, Clone)]
pub struct SyncDevice {
    /// Device id.
    pub id: DeviceId,
    /// Local, Remote or Spectator.
    pub kind: DeviceType,
    /// Players hosted by the device.
    pub player_count: usize,
    /// Connection state as last reported by the session.
    pub state: DeviceState,
    /// Newest frame of input received from the device.
    pub remote_frame: Frame,
    /// Frame advantage the device reported with `remote_frame`.
    pub remote_frame_advantage: i32,
    /// Newest frame of our input the device acknowledged.
    pub last_acked_input_frame: Frame,
    queue: Option<InputQueue>,
}

impl SyncDevice {
    /// The device's input queue. Spectators have none.
    #[must_use]
    pub fn queue(&self) -> Option<&InputQueue> {
        self.queue.as_ref()
    }
}

/// An input range waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingInput {
    /// First frame of the range.
    pub start_frame: Frame,
    /// Last frame of the range, inclusive.
    pub end_frame: Frame,
    /// Local frame advantage at the time the range was assembled.
    pub frame_advantage: i32,
    /// `end_frame - start_frame + 1` frames of input, back to back.
    pub input_bytes: Vec<u8>,
}

/// Result of one [`SyncLayer::advance_sync`] call.
#[derive(Debug, Clone)]
pub struct SyncStep {
    /// Actions for the host, in execution order.
    pub actions: Vec<Action>,
    /// `false` if admission refused to advance the local frame.
    pub admitted: bool,
}

/// The rollback and resimulation algorithm.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing and fuzzing.
/// It is not part of the stable public API.
///
/// The layer is not `Clone`: the snapshot slots it hands out are shared with the host,
/// so a copy would alias the same ring.
///
/// ```compile_fail
/// fn assert_clone<T: Clone>() {}
/// assert_clone::<resync_rollback::__internal::SyncLayer>();
/// ```
pub struct SyncLayer {
    input_size: usize,
    devices: BTreeMap<DeviceId, SyncDevice>,
    local_id: Option<DeviceId>,
    time_sync: TimeSync,
    storage: StateStorage,
    initial_saved: bool,
    outbox: Vec<(DeviceId, OutgoingInput)>,
    checksum_history: VecDeque<(Frame, u32)>,
    last_rollback_frames: u32,
    rollback_frames_total: u64,
    rollback_count: u64,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for SyncLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncLayer")
            .field("input_size", &self.input_size)
            .field("devices", &self.devices)
            .field("local_id", &self.local_id)
            .field("time_sync", &self.time_sync)
            .field("storage_capacity", &self.storage.capacity())
            .field("pending_outputs", &self.outbox.len())
            .finish_non_exhaustive()
    }
}

impl SyncLayer {
    /// Creates an empty sync layer. The snapshot ring holds
    /// `max_rollback_frames + STATE_STORAGE_MARGIN` frames.
    #[must_use]
    pub fn new(
        input_size: usize,
        config: TimeSyncConfig,
        observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        let capacity = config.max_rollback_frames.max(1) as usize + STATE_STORAGE_MARGIN;
        Self {
            input_size,
            devices: BTreeMap::new(),
            local_id: None,
            time_sync: TimeSync::with_config(config),
            storage: StateStorage::new(capacity),
            initial_saved: false,
            outbox: Vec::new(),
            checksum_history: VecDeque::with_capacity(CHECKSUM_HISTORY_LENGTH),
            last_rollback_frames: 0,
            rollback_frames_total: 0,
            rollback_count: 0,
            observer,
        }
    }

    /// Registers a device.
    ///
    /// Local devices start Running, everything else starts Syncing. `frame_delay` only
    /// applies to the local device.
    pub fn add_device(
        &mut self,
        id: DeviceId,
        kind: DeviceType,
        player_count: usize,
        frame_delay: usize,
    ) -> Result<(), ResyncError> {
        if self.devices.contains_key(&id) {
            return Err(ResyncError::InvalidRequest {
                info: format!("device {} is already registered", id),
            });
        }
        if kind == DeviceType::Local && self.local_id.is_some() {
            return Err(ResyncError::InvalidRequest {
                info: "a session has exactly one local device".to_owned(),
            });
        }

        let (queue, state) = match kind {
            DeviceType::Local => (
                Some(InputQueue::new(self.input_size, player_count, frame_delay)),
                DeviceState::Running,
            ),
            DeviceType::Remote => (
                Some(InputQueue::new(self.input_size, player_count, 0)),
                DeviceState::Syncing,
            ),
            DeviceType::Spectator => (None, DeviceState::Syncing),
        };
        if kind == DeviceType::Local {
            self.local_id = Some(id);
        }
        self.devices.insert(
            id,
            SyncDevice {
                id,
                kind,
                player_count,
                state,
                remote_frame: Frame::INITIAL,
                remote_frame_advantage: 0,
                last_acked_input_frame: Frame::INITIAL,
                queue,
            },
        );
        Ok(())
    }

    /// The local device, once registered.
    #[must_use]
    pub fn local_device(&self) -> Option<DeviceId> {
        self.local_id
    }

    /// Frame record of `id`.
    #[must_use]
    pub fn device(&self, id: DeviceId) -> Option<&SyncDevice> {
        self.devices.get(&id)
    }

    /// All device records in id order.
    pub fn devices(&self) -> impl Iterator<Item = &SyncDevice> {
        self.devices.values()
    }

    /// Total players across all devices.
    #[must_use]
    pub fn total_player_count(&self) -> usize {
        self.devices.values().map(|d| d.player_count).sum()
    }

    /// Records the connection state the session observed for `id`.
    pub fn set_device_state(&mut self, id: DeviceId, state: DeviceState) {
        if let Some(device) = self.devices.get_mut(&id) {
            device.state = state;
        }
    }

    /// The frame cursors.
    #[must_use]
    pub fn time_sync(&self) -> &TimeSync {
        &self.time_sync
    }

    /// Highest frame the local simulation reached.
    #[must_use]
    pub fn local_frame(&self) -> Frame {
        self.time_sync.local_frame
    }

    /// Highest frame with correct input from every device.
    #[must_use]
    pub fn sync_frame(&self) -> Frame {
        self.time_sync.sync_frame
    }

    /// Slowest frame received from the remote devices.
    #[must_use]
    pub fn remote_frame(&self) -> Frame {
        self.time_sync.remote_frame
    }

    /// The snapshot ring.
    #[must_use]
    pub fn storage(&self) -> &StateStorage {
        &self.storage
    }

    /// Frames resimulated by the most recent rollback.
    #[must_use]
    pub fn rollback_frames(&self) -> u32 {
        self.last_rollback_frames
    }

    /// Average length of all rollbacks so far, `0.0` without any.
    #[must_use]
    pub fn average_rollback_frames(&self) -> f64 {
        if self.rollback_count == 0 {
            return 0.0;
        }
        self.rollback_frames_total as f64 / self.rollback_count as f64
    }

    /// Checksum of a confirmed frame, if it is still in the history and known.
    #[must_use]
    pub fn confirmed_checksum(&self, frame: Frame) -> Option<u32> {
        self.checksum_history
            .iter()
            .find(|(f, _)| *f == frame)
            .map(|(_, checksum)| *checksum)
    }

    fn remote_cursors(&self) -> Vec<RemoteCursor> {
        self.devices
            .values()
            .filter(|d| d.kind == DeviceType::Remote)
            .map(|d| RemoteCursor {
                remote_frame: d.remote_frame,
                remote_frame_advantage: d.remote_frame_advantage,
            })
            .collect()
    }

    /// Moves `sync_frame` over every frame whose predictions proved right.
    ///
    /// The scan covers `sync_frame + 1 ..= min(local_frame, remote_frame)`. At the first
    /// frame where a recorded prediction differs from the confirmed payload, `sync_frame`
    /// stops one frame short and the mismatched frame's predictions are dropped, since
    /// the frame is about to be resimulated. Matching predictions are dropped as well.
    pub fn update_sync_frame(&mut self) {
        let previous_sync = self.time_sync.sync_frame;
        let last = self.time_sync.local_frame.min(self.time_sync.remote_frame);
        let mut new_sync = last.max(previous_sync);

        let mut frame = previous_sync + 1;
        'scan: while frame <= last {
            let mut mismatch = false;
            for device in self.devices.values_mut() {
                let Some(queue) = device.queue.as_mut() else {
                    continue;
                };
                let Some(prediction) = queue.predicted_input(frame) else {
                    continue;
                };
                let Some(confirmed) = queue.confirmed_input(frame) else {
                    continue;
                };
                if !prediction.payload_eq(confirmed) {
                    mismatch = true;
                }
                queue.reset_prediction(frame);
            }
            if mismatch {
                new_sync = frame - 1;
                tracing::debug!(frame = %frame, "prediction mismatch");
                break 'scan;
            }
            frame += 1;
        }

        self.time_sync.sync_frame = new_sync;
        self.record_confirmed_checksums(previous_sync, new_sync);
    }

    fn record_confirmed_checksums(&mut self, from: Frame, to: Frame) {
        let mut frame = from + 1;
        while frame <= to {
            if let Some(checksum) = self.storage.checksum(frame) {
                if self.checksum_history.len() == CHECKSUM_HISTORY_LENGTH {
                    self.checksum_history.pop_front();
                }
                self.checksum_history.push_back((frame, checksum));
            }
            frame += 1;
        }
    }

    /// The combined input of `frame`: every device's input in id order, predicted where
    /// nothing was confirmed yet.
    pub fn combined_input(&mut self, frame: Frame) -> Vec<u8> {
        let mut combined = Vec::with_capacity(self.input_size * self.total_player_count());
        for device in self.devices.values_mut() {
            let Some(queue) = device.queue.as_mut() else {
                continue;
            };
            let input = queue.get_input(frame, true);
            if input.frame() == frame {
                // confirmed input replaces whatever was predicted earlier
                queue.reset_prediction(frame);
            }
            combined.extend_from_slice(input.bytes());
        }
        combined
    }

    /// Runs one tick of the rollback algorithm. See the module documentation for the
    /// order of the produced actions.
    ///
    /// `local_input` must hold `input_size` bytes per local player.
    pub fn advance_sync(&mut self, local_input: &[u8]) -> Result<SyncStep, ResyncError> {
        let local_id = self.local_id.ok_or_else(|| ResyncError::InvalidRequest {
            info: "the local device must be set before advancing".to_owned(),
        })?;
        let local_players = self.devices.get(&local_id).map_or(0, |d| d.player_count);
        if local_input.len() != self.input_size * local_players {
            return Err(ResyncError::InvalidRequest {
                info: format!(
                    "expected {} bytes of local input, got {}",
                    self.input_size * local_players,
                    local_input.len()
                ),
            });
        }

        let mut actions = Vec::new();

        if self.time_sync.local_frame == Frame::INITIAL && !self.initial_saved {
            actions.push(Action::Save {
                frame: Frame::INITIAL,
                cell: self.storage.cell(Frame::INITIAL)?,
            });
            self.initial_saved = true;
        }

        let cursors = self.remote_cursors();
        self.time_sync.update_remote_frame(&cursors);
        self.update_sync_frame();

        if self.time_sync.should_rollback() {
            self.rollback(&mut actions)?;
        }

        let admitted = self.time_sync.is_time_synced(&cursors);
        if admitted {
            self.time_sync.local_frame += 1;
            let frame = self.time_sync.local_frame;
            if let Some(queue) = self
                .devices
                .get_mut(&local_id)
                .and_then(|d| d.queue.as_mut())
            {
                queue.add_input(frame, local_input)?;
            }
            let inputs = self.combined_input(frame);
            actions.push(Action::Advance { frame, inputs });
            actions.push(Action::Save {
                frame,
                cell: self.storage.cell(frame)?,
            });
        } else {
            tracing::trace!(
                local_frame = %self.time_sync.local_frame,
                remote_frame = %self.time_sync.remote_frame,
                difference = self.time_sync.frame_advantage_difference,
                "admission refused"
            );
        }

        self.queue_outgoing_inputs(local_id);

        crate::debug_check_invariants!(self);
        Ok(SyncStep { actions, admitted })
    }

    fn rollback(&mut self, actions: &mut Vec<Action>) -> Result<(), ResyncError> {
        let sync_frame = self.time_sync.sync_frame;
        let local_frame = self.time_sync.local_frame;
        let count = local_frame - sync_frame;
        tracing::debug!(from = %local_frame, to = %sync_frame, count, "rolling back");

        actions.push(Action::Load {
            frame: sync_frame,
            cell: self.storage.cell(sync_frame)?,
        });
        let mut frame = sync_frame + 1;
        while frame <= local_frame {
            let inputs = self.combined_input(frame);
            actions.push(Action::Advance { frame, inputs });
            actions.push(Action::Save {
                frame,
                cell: self.storage.cell(frame)?,
            });
            frame += 1;
        }

        self.last_rollback_frames = count as u32;
        self.rollback_frames_total += count as u64;
        self.rollback_count += 1;
        Ok(())
    }

    fn queue_outgoing_inputs(&mut self, local_id: DeviceId) {
        let frame_advantage = self.time_sync.local_frame_advantage;
        let sync_frame = self.time_sync.sync_frame;
        let Some(local_queue) = self.devices.get(&local_id).and_then(|d| d.queue.as_ref()) else {
            return;
        };
        let newest_local = local_queue.last_added_frame();

        let mut outgoing = Vec::new();
        for device in self.devices.values() {
            if device.state == DeviceState::Disconnected {
                continue;
            }
            match device.kind {
                DeviceType::Local => {}
                DeviceType::Remote => {
                    let start = window_start(device.last_acked_input_frame, newest_local);
                    if let Some(range) = local_range(local_queue, start, newest_local, frame_advantage) {
                        outgoing.push((device.id, range));
                    }
                }
                DeviceType::Spectator => {
                    let start = window_start(device.last_acked_input_frame, sync_frame);
                    if let Some(range) = self.confirmed_range(start, sync_frame) {
                        outgoing.push((device.id, range));
                    }
                }
            }
        }
        self.outbox.extend(outgoing);
    }

    /// Combined confirmed input of `from ..= min(to, sync_frame)`.
    ///
    /// Stops early at the first frame some device has no confirmed input for. `None` if
    /// not even `from` is available.
    #[must_use]
    pub fn confirmed_range(&self, from: Frame, to: Frame) -> Option<OutgoingInput> {
        let end = to.min(self.time_sync.sync_frame);
        let mut input_bytes = Vec::new();
        let mut last = Frame::NULL;
        let mut frame = from.max(Frame::new(1));
        'frames: while frame <= end {
            let mark = input_bytes.len();
            for queue in self.devices.values().filter_map(|d| d.queue.as_ref()) {
                let Some(input) = queue.confirmed_input(frame) else {
                    input_bytes.truncate(mark);
                    break 'frames;
                };
                input_bytes.extend_from_slice(input.bytes());
            }
            last = frame;
            frame += 1;
        }
        if last.is_null() {
            return None;
        }
        Some(OutgoingInput {
            start_frame: from.max(Frame::new(1)),
            end_frame: last,
            frame_advantage: 0,
            input_bytes,
        })
    }

    /// Takes every input range assembled since the last call.
    pub fn drain_outbox(&mut self) -> Vec<(DeviceId, OutgoingInput)> {
        std::mem::take(&mut self.outbox)
    }

    /// Feeds input of `frame` received from `id`.
    ///
    /// Returns the frame to acknowledge if `frame` is newer than anything received from
    /// the device so far. Gaps, stale frames and malformed payloads are reported and
    /// dropped.
    pub fn add_remote_input(
        &mut self,
        id: DeviceId,
        frame: Frame,
        frame_advantage: i32,
        bytes: &[u8],
    ) -> Option<Frame> {
        let observer = self.observer.clone();
        let device = self.devices.get_mut(&id)?;
        let queue = device.queue.as_mut()?;
        match queue.add_remote_input(frame, bytes) {
            RemoteInputOutcome::Stored | RemoteInputOutcome::Duplicate => {
                if frame > device.remote_frame {
                    device.remote_frame = frame;
                    device.remote_frame_advantage =
                        frame_advantage.clamp(-MAX_REPORTED_ADVANTAGE, MAX_REPORTED_ADVANTAGE);
                    tracing::trace!(device = %id, frame = %frame, frame_advantage, "remote input");
                    return Some(frame);
                }
                None
            }
            RemoteInputOutcome::Gap { expected } => {
                report_violation_to!(
                    observer,
                    ViolationSeverity::Warning,
                    ViolationKind::InputQueue,
                    "input from device {} for frame {} skips frame {}",
                    id,
                    frame,
                    expected
                );
                None
            }
            RemoteInputOutcome::Stale => {
                tracing::trace!(device = %id, frame = %frame, "stale remote input dropped");
                None
            }
            RemoteInputOutcome::Malformed => {
                report_violation_to!(
                    observer,
                    ViolationSeverity::Warning,
                    ViolationKind::InputQueue,
                    "input from device {} for frame {} has {} bytes",
                    id,
                    frame,
                    bytes.len()
                );
                None
            }
        }
    }

    /// Records that `id` received our input up to `frame`.
    ///
    /// Acks for frames that were never sent to the device are reported and ignored: a remote
    /// can only have received local input that exists, and a spectator only confirmed frames.
    pub fn acknowledge(&mut self, id: DeviceId, frame: Frame) {
        let Some(kind) = self.devices.get(&id).map(|d| d.kind) else {
            return;
        };
        let newest_sent = self.newest_sendable_frame(kind);
        if frame > newest_sent {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Warning,
                ViolationKind::DeviceProtocol,
                "device {} acknowledged frame {}, newest frame sent is {}",
                id,
                frame,
                newest_sent
            );
            return;
        }
        if let Some(device) = self.devices.get_mut(&id) {
            if frame > device.last_acked_input_frame {
                device.last_acked_input_frame = frame;
            }
        }
    }

    fn newest_sendable_frame(&self, kind: DeviceType) -> Frame {
        match kind {
            DeviceType::Spectator => self.time_sync.sync_frame,
            DeviceType::Remote | DeviceType::Local => self
                .local_id
                .and_then(|local| self.devices.get(&local))
                .and_then(|d| d.queue.as_ref())
                .map_or(Frame::NULL, InputQueue::last_added_frame),
        }
    }
}

/// First frame of an outgoing range: right after the last ack, but never older than the
/// input queue retains.
fn window_start(last_acked: Frame, newest: Frame) -> Frame {
    let oldest_retained = newest
        .checked_sub(INPUT_QUEUE_LENGTH as i32 - 1)
        .unwrap_or(Frame::INITIAL);
    let after_ack = last_acked.checked_add(1).unwrap_or(last_acked);
    after_ack.max(oldest_retained).max(Frame::new(1))
}

fn local_range(
    queue: &InputQueue,
    start: Frame,
    end: Frame,
    frame_advantage: i32,
) -> Option<OutgoingInput> {
    let mut input_bytes = Vec::new();
    let mut last = Frame::NULL;
    let mut frame = start;
    while frame <= end {
        let Some(input) = queue.confirmed_input(frame) else {
            break;
        };
        input_bytes.extend_from_slice(input.bytes());
        last = frame;
        frame += 1;
    }
    if last.is_null() {
        return None;
    }
    Some(OutgoingInput {
        start_frame: start,
        end_frame: last,
        frame_advantage,
        input_bytes,
    })
}

impl InvariantChecker for SyncLayer {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let ts = &self.time_sync;
        if ts.sync_frame > ts.local_frame {
            return Err(InvariantViolation::new("SyncLayer", "sync frame ahead of local frame")
                .with_details(format!("sync={}, local={}", ts.sync_frame, ts.local_frame)));
        }
        let window = ts.local_frame - ts.sync_frame;
        if window as usize >= self.storage.capacity() {
            return Err(InvariantViolation::new(
                "SyncLayer",
                "rollback window exceeds snapshot capacity",
            )
            .with_details(format!("window={}, capacity={}", window, self.storage.capacity())));
        }
        for queue in self.devices.values().filter_map(|d| d.queue.as_ref()) {
            queue.check_invariants()?;
        }
        self.storage.check_invariants()
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod sync_layer_tests {
    use super::*;

    const A: DeviceId = DeviceId::new(0);
    const B: DeviceId = DeviceId::new(1);

    fn two_device_sync() -> SyncLayer {
        let mut sync = SyncLayer::new(2, TimeSyncConfig::default(), None);
        sync.add_device(A, DeviceType::Local, 1, 0).unwrap();
        sync.add_device(B, DeviceType::Remote, 1, 0).unwrap();
        sync.set_device_state(B, DeviceState::Running);
        sync
    }

    /// Executes save actions the way a host would, with the frame number as state.
    fn run(actions: &[Action]) {
        for action in actions {
            if let Action::Save { frame, cell } = action {
                let state = frame.as_i32().to_le_bytes();
                cell.save(*frame, state.to_vec(), frame.as_i32() as u32 + 100);
            }
        }
    }

    fn kinds(actions: &[Action]) -> Vec<(char, i32)> {
        actions
            .iter()
            .map(|a| match a {
                Action::Load { frame, .. } => ('L', frame.as_i32()),
                Action::Save { frame, .. } => ('S', frame.as_i32()),
                Action::Advance { frame, .. } => ('A', frame.as_i32()),
            })
            .collect()
    }

    #[test]
    fn test_first_tick_saves_initial_frame() {
        let mut sync = two_device_sync();
        let step = sync.advance_sync(&[1, 2]).unwrap();
        assert!(step.admitted);
        assert_eq!(kinds(&step.actions), vec![('S', 0), ('A', 1), ('S', 1)]);
        match &step.actions[1] {
            Action::Advance { inputs, .. } => assert_eq!(inputs, &vec![1, 2, 0, 0]),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_wrong_local_input_size_is_rejected() {
        let mut sync = two_device_sync();
        assert!(matches!(
            sync.advance_sync(&[1]),
            Err(ResyncError::InvalidRequest { .. })
        ));
        assert_eq!(sync.local_frame(), Frame::INITIAL);
    }

    #[test]
    fn test_mispredicted_remote_input_rolls_back() {
        let mut sync = two_device_sync();
        run(&sync.advance_sync(&[1, 2]).unwrap().actions);
        assert_eq!(sync.add_remote_input(B, Frame::new(1), 0, &[7, 8]), Some(Frame::new(1)));

        let step = sync.advance_sync(&[1, 2]).unwrap();
        assert_eq!(
            kinds(&step.actions),
            vec![('L', 0), ('A', 1), ('S', 1), ('A', 2), ('S', 2)]
        );
        match &step.actions[1] {
            Action::Advance { inputs, .. } => assert_eq!(inputs, &vec![1, 2, 7, 8]),
            other => panic!("unexpected action {:?}", other),
        }
        assert_eq!(sync.rollback_frames(), 1);
    }

    #[test]
    fn test_correct_prediction_does_not_roll_back() {
        let mut sync = two_device_sync();
        run(&sync.advance_sync(&[1, 2]).unwrap().actions);
        // zeroes are exactly what was predicted
        sync.add_remote_input(B, Frame::new(1), 0, &[0, 0]);
        let step = sync.advance_sync(&[1, 2]).unwrap();
        assert_eq!(kinds(&step.actions), vec![('A', 2), ('S', 2)]);
        assert_eq!(sync.sync_frame(), Frame::new(1));
        assert_eq!(sync.average_rollback_frames(), 0.0);
    }

    #[test]
    fn test_admission_stops_at_max_rollback_frames() {
        let mut sync = two_device_sync();
        let mut admitted = 0;
        for _ in 0..20 {
            let step = sync.advance_sync(&[0, 0]).unwrap();
            run(&step.actions);
            if step.admitted {
                admitted += 1;
            }
        }
        // the advantage difference limit (5) bites before the rollback window (7)
        assert_eq!(admitted, 6);
        assert_eq!(sync.local_frame(), Frame::new(6));
        assert!(sync.check_invariants().is_ok());
    }

    #[test]
    fn test_outbox_covers_unacked_frames() {
        let mut sync = two_device_sync();
        run(&sync.advance_sync(&[1, 1]).unwrap().actions);
        run(&sync.advance_sync(&[2, 2]).unwrap().actions);
        let outbox = sync.drain_outbox();
        let (device, last) = outbox.last().unwrap();
        assert_eq!(*device, B);
        assert_eq!(last.start_frame, Frame::new(1));
        assert_eq!(last.end_frame, Frame::new(2));
        assert_eq!(last.input_bytes, vec![1, 1, 2, 2]);

        sync.acknowledge(B, Frame::new(2));
        run(&sync.advance_sync(&[3, 3]).unwrap().actions);
        let outbox = sync.drain_outbox();
        assert_eq!(outbox[0].1.start_frame, Frame::new(3));
        assert_eq!(outbox[0].1.input_bytes, vec![3, 3]);
        assert!(sync.drain_outbox().is_empty());
    }

    #[test]
    fn test_ack_beyond_sent_input_is_ignored() {
        let observer = Arc::new(crate::telemetry::CollectingObserver::new());
        let mut sync = SyncLayer::new(2, TimeSyncConfig::default(), Some(observer.clone()));
        sync.add_device(A, DeviceType::Local, 1, 0).unwrap();
        sync.add_device(B, DeviceType::Remote, 1, 0).unwrap();
        sync.set_device_state(B, DeviceState::Running);
        run(&sync.advance_sync(&[1, 1]).unwrap().actions);
        run(&sync.advance_sync(&[2, 2]).unwrap().actions);
        sync.drain_outbox();

        sync.acknowledge(B, Frame::new(1000));
        sync.acknowledge(B, Frame::new(i32::MAX));
        assert!(observer.has_violation(ViolationKind::DeviceProtocol));
        assert_eq!(sync.device(B).unwrap().last_acked_input_frame, Frame::INITIAL);

        // the remote keeps receiving everything it has not acknowledged
        run(&sync.advance_sync(&[3, 3]).unwrap().actions);
        let outbox = sync.drain_outbox();
        assert_eq!(outbox[0].0, B);
        assert_eq!(outbox[0].1.start_frame, Frame::new(1));
        assert_eq!(outbox[0].1.end_frame, Frame::new(3));
    }

    #[test]
    fn test_spectator_ack_beyond_sync_frame_is_ignored() {
        let spectator = DeviceId::new(9);
        let mut sync = two_device_sync();
        sync.add_device(spectator, DeviceType::Spectator, 0, 0).unwrap();
        run(&sync.advance_sync(&[1, 1]).unwrap().actions);
        sync.acknowledge(spectator, Frame::new(1));
        assert_eq!(
            sync.device(spectator).unwrap().last_acked_input_frame,
            Frame::INITIAL
        );
    }

    #[test]
    fn test_reported_frame_advantage_is_bounded() {
        let mut sync = two_device_sync();
        assert_eq!(
            sync.add_remote_input(B, Frame::new(1), i32::MIN, &[0, 0]),
            Some(Frame::new(1))
        );
        assert_eq!(
            sync.device(B).unwrap().remote_frame_advantage,
            -MAX_REPORTED_ADVANTAGE
        );
        sync.add_remote_input(B, Frame::new(2), i32::MAX, &[0, 0]);
        assert_eq!(
            sync.device(B).unwrap().remote_frame_advantage,
            MAX_REPORTED_ADVANTAGE
        );
        assert!(sync.advance_sync(&[0, 0]).unwrap().admitted);
    }

    #[test]
    fn test_frame_delay_sends_prefilled_frames() {
        let mut sync = SyncLayer::new(1, TimeSyncConfig::default(), None);
        sync.add_device(A, DeviceType::Local, 1, 2).unwrap();
        sync.add_device(B, DeviceType::Remote, 1, 0).unwrap();
        run(&sync.advance_sync(&[5]).unwrap().actions);
        let outbox = sync.drain_outbox();
        assert_eq!(outbox[0].1.start_frame, Frame::new(1));
        assert_eq!(outbox[0].1.end_frame, Frame::new(3));
        assert_eq!(outbox[0].1.input_bytes, vec![0, 0, 5]);
    }

    #[test]
    fn test_remote_gap_is_ignored() {
        let observer = Arc::new(crate::telemetry::CollectingObserver::new());
        let mut sync = SyncLayer::new(2, TimeSyncConfig::default(), Some(observer.clone()));
        sync.add_device(A, DeviceType::Local, 1, 0).unwrap();
        sync.add_device(B, DeviceType::Remote, 1, 0).unwrap();
        assert_eq!(sync.add_remote_input(B, Frame::new(3), 0, &[1, 1]), None);
        assert!(observer.has_violation(ViolationKind::InputQueue));
        assert_eq!(sync.device(B).unwrap().remote_frame, Frame::INITIAL);
    }

    #[test]
    fn test_duplicate_remote_input_is_not_acked_twice() {
        let mut sync = two_device_sync();
        assert_eq!(sync.add_remote_input(B, Frame::new(1), 0, &[1, 1]), Some(Frame::new(1)));
        assert_eq!(sync.add_remote_input(B, Frame::new(1), 0, &[1, 1]), None);
    }

    #[test]
    fn test_confirmed_checksums_are_recorded() {
        let mut sync = two_device_sync();
        for f in 1..=4 {
            run(&sync.advance_sync(&[0, 0]).unwrap().actions);
            sync.add_remote_input(B, Frame::new(f), 0, &[0, 0]);
        }
        run(&sync.advance_sync(&[0, 0]).unwrap().actions);
        assert_eq!(sync.sync_frame(), Frame::new(4));
        assert_eq!(sync.confirmed_checksum(Frame::new(3)), Some(103));
        assert_eq!(sync.confirmed_checksum(Frame::new(5)), None);
    }

    #[test]
    fn test_spectators_receive_confirmed_ranges() {
        let spectator = DeviceId::new(9);
        let mut sync = two_device_sync();
        sync.add_device(spectator, DeviceType::Spectator, 0, 0).unwrap();
        sync.set_device_state(spectator, DeviceState::Running);
        run(&sync.advance_sync(&[1, 1]).unwrap().actions);
        sync.add_remote_input(B, Frame::new(1), 0, &[2, 2]);
        // the misprediction holds the sync frame back for one tick
        run(&sync.advance_sync(&[3, 3]).unwrap().actions);
        assert!(sync.drain_outbox().iter().all(|(id, _)| *id != spectator));
        run(&sync.advance_sync(&[4, 4]).unwrap().actions);

        let outbox = sync.drain_outbox();
        let (_, range) = outbox.iter().find(|(id, _)| *id == spectator).unwrap();
        assert_eq!(range.start_frame, Frame::new(1));
        assert_eq!(range.end_frame, Frame::new(1));
        assert_eq!(range.input_bytes, vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_registration_rules() {
        let mut sync = two_device_sync();
        assert!(sync.add_device(A, DeviceType::Remote, 1, 0).is_err());
        assert!(sync.add_device(DeviceId::new(5), DeviceType::Local, 1, 0).is_err());
        assert_eq!(sync.total_player_count(), 2);
        assert_eq!(sync.local_device(), Some(A));
    }
}
