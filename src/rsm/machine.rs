//! The replicated state-machine contract.
//!
//! # Laws
//!
//! 1. `apply()` MUST be deterministic: same (state, commit) → same
//!    (state', events, result).
//! 2. Callbacks are sequential, in commit total order, run to completion.
//! 3. `filter()` MUST be a pure function of current state and the
//!    compaction context.
//! 4. `restore(snapshot(state))` MUST reproduce the observable state.
//! 5. No system time, no ambient randomness, no I/O inside callbacks.

use super::commit::{ApplyContext, Commit};
use super::error::StateMachineError;
use super::session::{SessionHandle, SessionTable};

/// Which class of compaction is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionKind {
    /// Incremental pass; tombstones are always preserved.
    Minor,
    /// Full pass up to the compaction index; tombstones the compaction has
    /// caught up with become releasable.
    Major,
}

/// Context handed to `filter` for each retained commit.
#[derive(Clone, Copy, Debug)]
pub struct Compaction {
    index: u64,
    kind: CompactionKind,
}

impl Compaction {
    pub fn new(index: u64, kind: CompactionKind) -> Self {
        Compaction { index, kind }
    }

    /// Highest log index this compaction covers.
    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }

    #[inline]
    pub fn kind(&self) -> CompactionKind {
        self.kind
    }
}

/// A versioned byte stream produced by `snapshot` and consumed by
/// `restore`.
#[derive(Clone, Debug)]
pub struct SnapshotStream {
    /// Schema version of the snapshot payload.
    pub schema_version: u32,
    /// The serialized state bytes.
    pub data: Vec<u8>,
}

/// A deterministic state machine driven by the consensus substrate.
///
/// State is mutated only through these callbacks; there is no external
/// mutator. The substrate delivers session transitions and commits in one
/// total order, and consults `filter` during compaction for every commit
/// that is still retained.
pub trait ReplicatedStateMachine {
    /// The operation type this machine applies.
    type Operation;

    /// The result type returned to the submitting client.
    type Output;

    /// A client session was registered.
    fn on_register(&mut self, session: &SessionHandle, ctx: &ApplyContext);

    /// A client session timed out.
    fn on_expire(&mut self, session: &SessionHandle, ctx: &ApplyContext);

    /// A client session was closed explicitly.
    fn on_close(&mut self, session: &SessionHandle, ctx: &ApplyContext);

    /// Apply a committed operation.
    ///
    /// Validation happens before any mutation: an `Err` leaves state
    /// untouched. The machine decides the commit's retention here: it
    /// either holds the commit (retained) or calls `release`.
    fn apply(
        &mut self,
        commit: Commit<Self::Operation>,
        ctx: &ApplyContext,
    ) -> Result<Self::Output, StateMachineError>;

    /// Whether a retained commit's bytes must survive this compaction.
    fn filter(&self, commit: &Commit<Self::Operation>, compaction: &Compaction) -> bool;

    /// Serialize the observable state, canonically ordered.
    fn snapshot(&self) -> SnapshotStream;

    /// Rebuild state from a snapshot, resolving session ids against the
    /// substrate's live session table.
    fn restore(
        &mut self,
        stream: SnapshotStream,
        sessions: &SessionTable,
    ) -> Result<(), StateMachineError>;

    /// Tear the resource down, releasing every retained commit.
    fn delete(&mut self);

    /// Digest of the canonical snapshot encoding; equal fingerprints mean
    /// equal observable state.
    fn fingerprint(&self) -> [u8; 32] {
        *blake3::hash(&self.snapshot().data).as_bytes()
    }
}
