//! Client sessions and event delivery.
//!
//! Every operation is submitted on behalf of a session. Session lifecycle
//! transitions (open, expire, close) arrive as state-machine callbacks on
//! the commit total order. Sessions are also the event sink: state machines
//! publish named events to a session, and publication is silently skipped
//! unless the session is Active.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::StateMachineError;

/// Lifecycle state of a client session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// The session holds a live client connection; events are delivered.
    Active,
    /// The session timed out. Events are dropped.
    Expired,
    /// The client closed the session explicitly. Events are dropped.
    Closed,
}

/// An event published to a session.
///
/// The payload is the bincode encoding of the event's typed payload; the
/// substrate forwards it to the client verbatim.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Stable event name (`join`, `leave`, `term`, `elect`, `resign`,
    /// `message`, `ack`, `fail`).
    pub name: &'static str,
    /// Encoded event payload.
    pub payload: Vec<u8>,
}

impl Event {
    /// Decode the payload into its typed form.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StateMachineError> {
        bincode::deserialize(&self.payload).map_err(Into::into)
    }
}

struct SessionInner {
    id: u64,
    state: Cell<SessionState>,
    events: Sender<Event>,
}

/// Shared handle onto a session.
///
/// Cheap to clone; all clones observe the same lifecycle state. The state
/// machine side only ever publishes through the handle; the receiving end
/// of the event channel stays with the substrate.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Rc<SessionInner>,
}

impl SessionHandle {
    /// Create a new Active session and the receiver that drains its events.
    pub fn new(id: u64) -> (Self, Receiver<Event>) {
        let (events, receiver) = unbounded();
        let handle = SessionHandle {
            inner: Rc::new(SessionInner {
                id,
                state: Cell::new(SessionState::Active),
                events,
            }),
        };
        (handle, receiver)
    }

    /// Create a detached handle for a session that no longer exists.
    ///
    /// Used when restoring a snapshot whose entries reference sessions that
    /// are gone: the handle reports Expired, so ephemeral state bound to it
    /// is inactive and lazily evictable, and publication is a no-op.
    pub fn detached(id: u64) -> Self {
        let (events, _receiver) = unbounded();
        SessionHandle {
            inner: Rc::new(SessionInner {
                id,
                state: Cell::new(SessionState::Expired),
                events,
            }),
        }
    }

    /// The session id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    /// Whether events published to this session are delivered.
    pub fn is_active(&self) -> bool {
        self.inner.state.get() == SessionState::Active
    }

    /// Transition the session's lifecycle state.
    pub fn set_state(&self, state: SessionState) {
        self.inner.state.set(state);
    }

    /// Publish a named event to the session.
    ///
    /// A no-op unless the session is Active. Payload serialization failure
    /// is fatal (all payload types are crate-owned serde types).
    pub fn publish<T: Serialize + ?Sized>(&self, name: &'static str, payload: &T) {
        if !self.is_active() {
            return;
        }
        let payload =
            bincode::serialize(payload).expect("event payload serialization is infallible");
        // The receiver may have been dropped by the substrate; the event is
        // then discarded, matching an unreachable client.
        let _ = self.inner.events.send(Event { name, payload });
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for SessionHandle {}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

/// Table of live sessions keyed by id, as maintained by the substrate.
///
/// Ordered so that iteration (snapshots, restores) is deterministic.
pub type SessionTable = BTreeMap<u64, SessionHandle>;

/// Resolve a session id against the substrate's table.
///
/// Ids that no longer resolve (the session died before the snapshot was
/// restored) produce a detached Expired handle.
pub fn resolve_session(table: &SessionTable, id: u64) -> SessionHandle {
    table
        .get(&id)
        .cloned()
        .unwrap_or_else(|| SessionHandle::detached(id))
}
