//! Replicated data structures on a deterministic consensus substrate.
//!
//! The consensus engine is a black box that delivers `Commit` records in
//! total order; everything here is the deterministic state layered on top:
//!
//! - [`map`]: a replicated key/value store with per-entry TTL, ephemeral
//!   vs persistent entries, and compaction filters.
//! - [`group`]: a replicated membership registry with deterministic
//!   leader election and per-member message queues.
//! - [`rsm`]: the shared contracts: the commit envelope and retention
//!   rules, sessions and event delivery, the operation taxonomy, and the
//!   deterministic RNG.
//! - [`codec`]: the stable binary operation codec.
//! - [`substrate`]: a deterministic in-memory driver and the snapshot
//!   file format.
//!
//! Consistency comes from determinism plus total order, not locking: every
//! replica that applies the same commit prefix holds byte-identical
//! observable state.

pub mod codec;
pub mod group;
pub mod map;
pub mod rsm;
pub mod substrate;

pub use group::{GroupConfig, GroupStateMachine};
pub use map::TtlMapStateMachine;
pub use rsm::{Commit, ReplicatedStateMachine, StateMachineError};
pub use substrate::MemorySubstrate;
