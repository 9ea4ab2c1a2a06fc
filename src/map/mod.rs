//! The replicated TTL map: operations and state machine.

pub mod ops;
pub mod state_machine;

pub use ops::{MapOperation, MapOutput, TtlRequest};
pub use state_machine::TtlMapStateMachine;
