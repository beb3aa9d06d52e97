//! ```
//! use resync_rollback::rng::Pcg32;
//!
//! let mut a = Pcg32::seed_from_u64(12345);
//! let mut b = Pcg32::seed_from_u64(12345);
//! assert_eq!(a.next_u32(), b.next_u32());
//! assert!(a.gen_range(10..20) >= 10);
//! ```

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::checksum::fnv1a_64;

/// PCG-XSH-RR with 64 bits of state and 32 bits of output.
///
/// Not cryptographically secure. Handshake nonces only need to differ between rounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

const PCG_DEFAULT_STREAM: u64 = 1_442_695_040_888_963_407;
const PCG_MULTIPLIER: u64 = 6_364_136_223_846_793_005;

/// Distinguishes generators seeded within the same clock tick.
static ENTROPY_COUNTER: AtomicU64 = AtomicU64::new(0);

impl Pcg32 {
    /// Creates a generator on `stream` starting from `state`.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Deterministic generator for `seed`.
    #[must_use]
    pub const fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_STREAM)
    }

    /// Generator seeded from the wall clock, the thread and a process-wide counter.
    #[must_use]
    pub fn from_entropy() -> Self {
        let nanos = web_time::SystemTime::now()
            .duration_since(web_time::UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        let counter = ENTROPY_COUNTER.fetch_add(1, Ordering::Relaxed);
        let thread = format!("{:?}", std::thread::current().id());
        let seed = fnv1a_64(thread.as_bytes())
            ^ nanos.rotate_left(17)
            ^ counter.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self::seed_from_u64(seed)
    }

    /// Next 32-bit value.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform value in `range`, without modulo bias. An empty range yields its start.
    pub fn gen_range(&mut self, range: Range<u32>) -> u32 {
        let span = range.end.wrapping_sub(range.start);
        if range.end <= range.start {
            return range.start;
        }
        // reject the incomplete top bucket
        let zone = u32::MAX - (u32::MAX % span);
        loop {
            let value = self.next_u32();
            if value < zone {
                return range.start + value % span;
            }
        }
    }
}
