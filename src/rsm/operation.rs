//! Shared operation taxonomy: consistency levels and persistence modes.

use serde::{Deserialize, Serialize};

/// Consistency level carried by queries.
///
/// Commands are always linearized via the log and carry no level. The
/// ordering is part of the wire format: each level encodes as its ordinal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    Serializable,
    Causal,
    Bounded,
    LinearizableLease,
    Linearizable,
}

impl Default for ConsistencyLevel {
    fn default() -> Self {
        ConsistencyLevel::LinearizableLease
    }
}

impl ConsistencyLevel {
    /// Wire ordinal of this level.
    pub fn ordinal(self) -> u8 {
        match self {
            ConsistencyLevel::Serializable => 0,
            ConsistencyLevel::Causal => 1,
            ConsistencyLevel::Bounded => 2,
            ConsistencyLevel::LinearizableLease => 3,
            ConsistencyLevel::Linearizable => 4,
        }
    }

    /// Decode a wire ordinal.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(ConsistencyLevel::Serializable),
            1 => Some(ConsistencyLevel::Causal),
            2 => Some(ConsistencyLevel::Bounded),
            3 => Some(ConsistencyLevel::LinearizableLease),
            4 => Some(ConsistencyLevel::Linearizable),
            _ => None,
        }
    }
}

/// Entity lifetime policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Survives the creating session.
    Persistent,
    /// Bound to the lifetime of the creating session.
    Ephemeral,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Persistent
    }
}

impl Mode {
    /// Wire ordinal of this mode.
    pub fn ordinal(self) -> u8 {
        match self {
            Mode::Persistent => 0,
            Mode::Ephemeral => 1,
        }
    }

    /// Decode a wire ordinal.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(Mode::Persistent),
            1 => Some(Mode::Ephemeral),
            _ => None,
        }
    }
}
