use std::fmt;

/// Errors surfaced by state-machine handlers.
///
/// Handlers validate before mutating state, so an error never leaves a
/// state machine half-mutated. `Serialization` failures are fatal to the
/// substrate; the other kinds are returned to the submitting client.
#[derive(Debug)]
pub enum StateMachineError {
    /// The operation is malformed for the current state
    /// (e.g. recreating an ephemeral member).
    InvalidArgument(String),

    /// Codec failure while encoding or decoding an operation, event
    /// payload, or snapshot stream.
    Serialization(String),

    /// An operation type id that no state machine recognizes.
    UnknownOperation(u16),
}

impl fmt::Display for StateMachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateMachineError::InvalidArgument(msg) => {
                write!(f, "Invalid argument: {}", msg)
            }
            StateMachineError::Serialization(msg) => {
                write!(f, "Serialization error: {}", msg)
            }
            StateMachineError::UnknownOperation(id) => {
                write!(f, "Unknown operation type id: {}", id)
            }
        }
    }
}

impl std::error::Error for StateMachineError {}

impl From<bincode::Error> for StateMachineError {
    fn from(e: bincode::Error) -> Self {
        StateMachineError::Serialization(e.to_string())
    }
}
