//! The commit envelope and retention contract.
//!
//! The consensus substrate delivers every operation as a `Commit`: the
//! operation plus its log index, its consensus-agreed timestamp, and the
//! submitting session. A commit is immutable after delivery.
//!
//! Retention: the substrate keeps a commit's log bytes until the commit is
//! *released*. Release is explicit and idempotent; a state machine that
//! stops holding a commit without releasing it leaves the bytes retained,
//! and the machine's filter predicate then decides their fate at the next
//! compaction.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::session::SessionHandle;

/// Context for a single state-machine callback.
///
/// All values are derived from the committed log, never from the system
/// clock, so identical replay produces identical results.
#[derive(Clone, Copy, Debug)]
pub struct ApplyContext {
    index: u64,
    time_ms: i64,
}

impl ApplyContext {
    /// Create a context for the callback at `index` with the substrate's
    /// logical clock at `time_ms`.
    pub fn new(index: u64, time_ms: i64) -> Self {
        ApplyContext { index, time_ms }
    }

    /// The log position this callback occupies in the total order.
    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The substrate's monotonic logical clock, in milliseconds.
    #[inline]
    pub fn time_ms(&self) -> i64 {
        self.time_ms
    }
}

struct CommitRecord<O> {
    index: u64,
    timestamp_ms: i64,
    session: SessionHandle,
    operation: O,
    released: Cell<bool>,
}

/// A shared handle onto a committed operation.
///
/// Clones share the same underlying record; releasing through any clone
/// releases them all. State machines hold clones for as long as the commit
/// is semantically live (a map entry, a member's join record, a queued
/// message) and release exactly when the source semantics say to.
pub struct Commit<O> {
    record: Rc<CommitRecord<O>>,
}

impl<O> Commit<O> {
    /// Wrap an operation delivered by the substrate.
    pub fn new(index: u64, timestamp_ms: i64, session: SessionHandle, operation: O) -> Self {
        Commit {
            record: Rc::new(CommitRecord {
                index,
                timestamp_ms,
                session,
                operation,
                released: Cell::new(false),
            }),
        }
    }

    /// The commit's log index. Strictly monotonic across all commits.
    #[inline]
    pub fn index(&self) -> u64 {
        self.record.index
    }

    /// The consensus-agreed timestamp, in milliseconds.
    #[inline]
    pub fn timestamp_ms(&self) -> i64 {
        self.record.timestamp_ms
    }

    /// The session that submitted the operation.
    #[inline]
    pub fn session(&self) -> &SessionHandle {
        &self.record.session
    }

    /// The committed operation.
    #[inline]
    pub fn operation(&self) -> &O {
        &self.record.operation
    }

    /// Release the commit: its log bytes are no longer semantically live
    /// and future compactions may drop them. Idempotent.
    pub fn release(&self) {
        self.record.released.set(true);
    }

    /// Whether the commit has been released.
    pub fn is_released(&self) -> bool {
        self.record.released.get()
    }
}

impl<O: Clone> Commit<O> {
    /// Snapshot form of this commit's metadata and operation.
    pub fn to_data(&self) -> CommitData<O> {
        CommitData {
            index: self.record.index,
            timestamp_ms: self.record.timestamp_ms,
            session_id: self.record.session.id(),
            operation: self.record.operation.clone(),
        }
    }

    /// Rebuild a retained commit from its snapshot form.
    pub fn from_data(data: CommitData<O>, session: SessionHandle) -> Self {
        Commit::new(data.index, data.timestamp_ms, session, data.operation)
    }
}

impl<O> Clone for Commit<O> {
    fn clone(&self) -> Self {
        Commit {
            record: Rc::clone(&self.record),
        }
    }
}

impl<O: fmt::Debug> fmt::Debug for Commit<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commit")
            .field("index", &self.record.index)
            .field("timestamp_ms", &self.record.timestamp_ms)
            .field("session", &self.record.session.id())
            .field("operation", &self.record.operation)
            .field("released", &self.record.released.get())
            .finish()
    }
}

/// Serializable mirror of a retained commit, used by snapshots.
///
/// The session is captured by id; restore resolves it against the live
/// session table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitData<O> {
    pub index: u64,
    pub timestamp_ms: i64,
    pub session_id: u64,
    pub operation: O,
}
