//! Deterministic pseudo-random number generation.
//!
//! Replicas must make identical "random" choices (random message dispatch,
//! leader election), so randomness comes from a fixed, fully specified
//! generator rather than an OS or library source whose stream could vary
//! across versions or platforms.
//!
//! The generator is the classic 48-bit linear congruential generator:
//!
//! ```text
//! state' = (state * 0x5DEECE66D + 0xB) mod 2^48
//! next(bits) = high `bits` bits of state'
//! ```
//!
//! Seeding scrambles the seed with the multiplier:
//! `state = (seed ^ 0x5DEECE66D) mod 2^48`. Bounded selection uses the
//! power-of-two fast path and otherwise rejection-samples `next(31)` so the
//! distribution is exactly uniform.

use serde::{Deserialize, Serialize};

const MULTIPLIER: u64 = 0x5_DEEC_E66D;
const INCREMENT: u64 = 0xB;
const STATE_MASK: u64 = (1 << 48) - 1;

/// Seed of the per-instance group random used for random message dispatch.
pub const GROUP_RANDOM_SEED: i64 = 141_650_939;

/// A deterministic 48-bit LCG with identical bit-level output on every
/// replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRandom {
    state: u64,
}

impl DeterministicRandom {
    /// Create a generator from a seed.
    pub fn new(seed: i64) -> Self {
        DeterministicRandom {
            state: (seed as u64 ^ MULTIPLIER) & STATE_MASK,
        }
    }

    fn next(&mut self, bits: u32) -> i32 {
        self.state = self
            .state
            .wrapping_mul(MULTIPLIER)
            .wrapping_add(INCREMENT)
            & STATE_MASK;
        (self.state >> (48 - bits)) as i32
    }

    /// Next pseudo-random `i32` over the full range.
    pub fn next_i32(&mut self) -> i32 {
        self.next(32)
    }

    /// Uniform index in `0..bound`.
    ///
    /// `bound` must be non-zero and fit in an `i32`; callers index into
    /// non-empty in-memory lists.
    pub fn next_index(&mut self, bound: usize) -> usize {
        debug_assert!(bound > 0 && bound <= i32::MAX as usize);
        let bound = bound as i32;

        // Power-of-two bounds take the high bits directly.
        if bound & bound.wrapping_neg() == bound {
            return ((bound as i64 * self.next(31) as i64) >> 31) as usize;
        }

        // Rejection loop: discard draws from the biased tail of the
        // 31-bit range so every index is exactly equally likely.
        loop {
            let bits = self.next(31);
            let val = bits % bound;
            if bits.wrapping_sub(val).wrapping_add(bound - 1) >= 0 {
                return val as usize;
            }
        }
    }
}
