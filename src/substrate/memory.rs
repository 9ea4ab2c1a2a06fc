//! Deterministic in-memory substrate driver.
//!
//! Stands in for the consensus engine: delivers session transitions and
//! commits to one state machine in a single total order, tracks which
//! commits are still retained, runs compaction against the machine's
//! filter predicate, and holds the receiving end of every session's event
//! channel. Time is a logical clock the caller advances; nothing here
//! reads the system clock.

use crossbeam_channel::Receiver;
use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::rsm::{
    ApplyContext, Commit, Compaction, CompactionKind, Event, ReplicatedStateMachine,
    SessionHandle, SessionState, SessionTable, SnapshotStream, StateMachineError,
};

/// Outcome of a compaction pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompactionReport {
    /// Records still retained after the pass.
    pub kept: usize,
    /// Records whose bytes were reclaimed.
    pub dropped: usize,
}

/// A single-machine substrate with an in-memory log.
pub struct MemorySubstrate<M: ReplicatedStateMachine> {
    machine: M,
    sessions: SessionTable,
    receivers: BTreeMap<u64, Receiver<Event>>,
    /// Commit records not yet reclaimed by compaction.
    log: Vec<Commit<M::Operation>>,
    next_index: u64,
    next_session_id: u64,
    time_ms: i64,
}

impl<M: ReplicatedStateMachine> MemorySubstrate<M> {
    pub fn new(machine: M) -> Self {
        MemorySubstrate {
            machine,
            sessions: SessionTable::new(),
            receivers: BTreeMap::new(),
            log: Vec::new(),
            next_index: 1,
            next_session_id: 1,
            time_ms: 0,
        }
    }

    /// The hosted state machine.
    pub fn machine(&self) -> &M {
        &self.machine
    }

    /// The live session table.
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// The substrate's logical clock.
    pub fn time_ms(&self) -> i64 {
        self.time_ms
    }

    /// Advance the logical clock. The clock never moves backwards.
    pub fn advance_clock(&mut self, to_ms: i64) {
        if to_ms > self.time_ms {
            self.time_ms = to_ms;
        }
    }

    fn next_ctx(&mut self) -> ApplyContext {
        let index = self.next_index;
        self.next_index += 1;
        ApplyContext::new(index, self.time_ms)
    }

    /// Open a session and register it with the machine. The transition
    /// occupies a log position of its own.
    pub fn open_session(&mut self) -> u64 {
        let id = self.next_session_id;
        self.next_session_id += 1;
        let (handle, receiver) = SessionHandle::new(id);
        self.sessions.insert(id, handle.clone());
        self.receivers.insert(id, receiver);
        let ctx = self.next_ctx();
        self.machine.on_register(&handle, &ctx);
        debug!(session = id, "session opened");
        id
    }

    /// Time the session out. Its events stop; the machine observes the
    /// expiry on the total order.
    pub fn expire_session(&mut self, id: u64) {
        if let Some(handle) = self.sessions.remove(&id) {
            handle.set_state(SessionState::Expired);
            let ctx = self.next_ctx();
            self.machine.on_expire(&handle, &ctx);
            debug!(session = id, "session expired");
        }
    }

    /// Close the session explicitly.
    pub fn close_session(&mut self, id: u64) {
        if let Some(handle) = self.sessions.remove(&id) {
            handle.set_state(SessionState::Closed);
            let ctx = self.next_ctx();
            self.machine.on_close(&handle, &ctx);
            debug!(session = id, "session closed");
        }
    }

    /// Deliver an operation as the next commit in the total order.
    pub fn commit(
        &mut self,
        session_id: u64,
        operation: M::Operation,
    ) -> Result<M::Output, StateMachineError> {
        let session = self.sessions.get(&session_id).cloned().ok_or_else(|| {
            StateMachineError::InvalidArgument(format!("unknown session: {}", session_id))
        })?;

        let index = self.next_index;
        self.next_index += 1;
        let commit = Commit::new(index, self.time_ms, session, operation);
        self.log.push(commit.clone());

        trace!(index, "applying commit");
        let ctx = ApplyContext::new(index, self.time_ms);
        self.machine.apply(commit, &ctx)
    }

    /// Run a compaction over everything applied so far.
    pub fn compact(&mut self, kind: CompactionKind) -> CompactionReport {
        let through = self.next_index.saturating_sub(1);
        self.compact_through(kind, through)
    }

    /// Run a compaction covering log positions up to `through`.
    ///
    /// Released records are reclaimed unconditionally; retained records
    /// survive iff the machine's filter keeps them.
    pub fn compact_through(&mut self, kind: CompactionKind, through: u64) -> CompactionReport {
        let compaction = Compaction::new(through, kind);
        let mut kept = 0;
        let mut dropped = 0;

        let Self { machine, log, .. } = self;
        log.retain(|commit| {
            if commit.index() > through {
                kept += 1;
                return true;
            }
            if commit.is_released() {
                dropped += 1;
                return false;
            }
            if machine.filter(commit, &compaction) {
                kept += 1;
                true
            } else {
                dropped += 1;
                false
            }
        });

        debug!(kept, dropped, ?kind, "compaction finished");
        CompactionReport { kept, dropped }
    }

    /// Indices of the records still held by the log.
    pub fn retained_indices(&self) -> Vec<u64> {
        self.log.iter().map(Commit::index).collect()
    }

    /// Drain the events published to a session so far, in publication
    /// order.
    pub fn drain_events(&mut self, session_id: u64) -> Vec<Event> {
        self.receivers
            .get(&session_id)
            .map(|receiver| receiver.try_iter().collect())
            .unwrap_or_default()
    }

    /// Tear the hosted resource down, releasing every retained commit.
    pub fn delete(&mut self) {
        self.machine.delete();
    }

    /// Snapshot the machine's observable state.
    pub fn snapshot(&self) -> SnapshotStream {
        self.machine.snapshot()
    }

    /// Restore the machine from a snapshot, resolving sessions against the
    /// live table. The in-memory log is reset: a snapshot supersedes it.
    pub fn restore(&mut self, stream: SnapshotStream) -> Result<(), StateMachineError> {
        let Self {
            machine, sessions, ..
        } = self;
        machine.restore(stream, sessions)?;
        self.log.clear();
        Ok(())
    }

    /// Digest of the machine's observable state.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.machine.fingerprint()
    }
}
