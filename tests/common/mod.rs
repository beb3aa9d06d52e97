//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: a deterministic byte-input game that executes session actions
//! - `test_utils`: session wiring over the loopback network and synchronization helpers
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::stubs::GameStub;
//! use common::{mesh, synchronize_all};
//! ```

pub mod stubs;
pub mod test_utils;

// These are public utilities for integration tests - allow unused until tests adopt them.
#[allow(unused_imports)]
pub use test_utils::{
    drain_events, init_tracing, mesh, poll_with_sleep, synchronize_all, tick, Peer, MAX_SYNC_ITERATIONS,
    POLL_INTERVAL, SYNC_TIMEOUT,
};
