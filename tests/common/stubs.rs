//! Game stub that executes session actions against a tiny deterministic simulation.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    dead_code
)]

use std::collections::BTreeMap;

use resync_rollback::checksum::compute_checksum;
use resync_rollback::network::codec;
use resync_rollback::{Action, Frame};
use serde::{Deserialize, Serialize};

/// The simulated state: a frame counter and a value that folds in every input byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateStub {
    pub frame: i32,
    pub value: u32,
}

impl StateStub {
    pub fn advance(&mut self, inputs: &[u8]) {
        for (i, byte) in inputs.iter().enumerate() {
            self.value = self
                .value
                .wrapping_mul(31)
                .wrapping_add(u32::from(*byte) ^ (i as u32 * 7));
        }
        self.frame += 1;
    }
}

/// Executes [`Action`]s and records what it saw.
#[derive(Debug, Default)]
pub struct GameStub {
    pub gs: StateStub,
    /// Checksum of the last snapshot saved for each frame.
    pub checksums: BTreeMap<i32, u32>,
    /// Inputs of the last simulation of each frame.
    pub inputs: BTreeMap<i32, Vec<u8>>,
    /// Every frame that was loaded, in order.
    pub loads: Vec<i32>,
    /// Flips bits of the state whenever this frame is simulated.
    corrupt_at: Option<i32>,
}

impl GameStub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stub whose simulation diverges from everyone else's at `frame`.
    pub fn corrupting_at(frame: i32) -> Self {
        Self {
            corrupt_at: Some(frame),
            ..Self::default()
        }
    }

    pub fn handle_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Load { frame, cell } => self.load(frame, &cell),
                Action::Save { frame, cell } => self.save(frame, &cell),
                Action::Advance { frame, inputs } => self.advance(frame, inputs),
            }
        }
    }

    fn load(&mut self, frame: Frame, cell: &resync_rollback::StateCell) {
        let saved = cell.load().expect("load of an empty cell");
        assert_eq!(saved.frame, frame, "cell holds the wrong frame");
        let (gs, _): (StateStub, usize) = codec::decode(&saved.buffer).unwrap();
        assert_eq!(gs.frame, frame.as_i32());
        self.gs = gs;
        self.loads.push(frame.as_i32());
    }

    fn save(&mut self, frame: Frame, cell: &resync_rollback::StateCell) {
        assert_eq!(self.gs.frame, frame.as_i32(), "saving the wrong frame");
        let checksum = compute_checksum(&self.gs).unwrap();
        self.checksums.insert(frame.as_i32(), checksum);
        cell.save(frame, codec::encode(&self.gs).unwrap(), checksum);
    }

    fn advance(&mut self, frame: Frame, inputs: Vec<u8>) {
        assert_eq!(frame.as_i32(), self.gs.frame + 1, "frames must advance in order");
        self.gs.advance(&inputs);
        if self.corrupt_at == Some(frame.as_i32()) {
            self.gs.value ^= 0xdead_beef;
        }
        self.inputs.insert(frame.as_i32(), inputs);
    }

    /// Replays `inputs` from a fresh state and returns the checksum after every frame.
    pub fn reference_checksums(inputs: &BTreeMap<i32, Vec<u8>>) -> BTreeMap<i32, u32> {
        let mut gs = StateStub::default();
        let mut checksums = BTreeMap::new();
        for (frame, input) in inputs {
            assert_eq!(*frame, gs.frame + 1, "reference inputs must be contiguous");
            gs.advance(input);
            checksums.insert(*frame, compute_checksum(&gs).unwrap());
        }
        checksums
    }
}

/// Plays the frames a spectator releases.
#[derive(Debug, Default)]
pub struct SpectatorStub {
    pub gs: StateStub,
    pub checksums: BTreeMap<i32, u32>,
}

impl SpectatorStub {
    pub fn handle_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Advance { frame, inputs } => {
                    assert_eq!(frame.as_i32(), self.gs.frame + 1);
                    self.gs.advance(&inputs);
                    self.checksums
                        .insert(frame.as_i32(), compute_checksum(&self.gs).unwrap());
                }
                other => panic!("spectators only advance, got {:?}", other),
            }
        }
    }
}
