//! Core contracts shared by the replicated state machines: the commit
//! envelope and retention rules, client sessions and event delivery, the
//! operation taxonomy, deterministic randomness, and the state-machine
//! trait itself.

pub mod commit;
pub mod error;
pub mod machine;
pub mod operation;
pub mod random;
pub mod session;

pub use commit::{ApplyContext, Commit, CommitData};
pub use error::StateMachineError;
pub use machine::{Compaction, CompactionKind, ReplicatedStateMachine, SnapshotStream};
pub use operation::{ConsistencyLevel, Mode};
pub use random::{DeterministicRandom, GROUP_RANDOM_SEED};
pub use session::{resolve_session, Event, SessionHandle, SessionState, SessionTable};
