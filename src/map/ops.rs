//! TTL map operations.
//!
//! Commands mutate the map and are linearized via the log; queries are
//! read-only and carry a consistency level. Every operation has a stable
//! numeric type id used by the wire codec.

use serde::{Deserialize, Serialize};

use crate::rsm::{ConsistencyLevel, Mode};

/// Stable operation type ids.
pub mod ids {
    pub const CONTAINS_KEY: u16 = 440;
    pub const PUT: u16 = 441;
    pub const PUT_IF_ABSENT: u16 = 442;
    pub const GET: u16 = 443;
    pub const GET_OR_DEFAULT: u16 = 444;
    pub const REMOVE: u16 = 445;
    pub const IS_EMPTY: u16 = 446;
    pub const SIZE: u16 = 447;
    pub const CLEAR: u16 = 448;
}

/// Payload shared by the TTL-bearing commands (`Put`, `PutIfAbsent`).
///
/// `ttl_ms == 0` means the entry never expires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlRequest {
    pub key: String,
    pub value: Vec<u8>,
    pub mode: Mode,
    pub ttl_ms: i64,
}

impl TtlRequest {
    /// A persistent, non-expiring entry.
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        TtlRequest {
            key: key.into(),
            value: value.into(),
            mode: Mode::Persistent,
            ttl_ms: 0,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }
}

/// The map's operation set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapOperation {
    ContainsKey {
        key: String,
        consistency: ConsistencyLevel,
    },
    Put(TtlRequest),
    PutIfAbsent(TtlRequest),
    Get {
        key: String,
        consistency: ConsistencyLevel,
    },
    GetOrDefault {
        key: String,
        default: Vec<u8>,
        consistency: ConsistencyLevel,
    },
    Remove {
        key: String,
        /// When present, compare-and-remove by byte equality.
        value: Option<Vec<u8>>,
    },
    IsEmpty {
        consistency: ConsistencyLevel,
    },
    Size {
        consistency: ConsistencyLevel,
    },
    Clear,
}

impl MapOperation {
    /// The operation's stable type id.
    pub fn type_id(&self) -> u16 {
        match self {
            MapOperation::ContainsKey { .. } => ids::CONTAINS_KEY,
            MapOperation::Put(_) => ids::PUT,
            MapOperation::PutIfAbsent(_) => ids::PUT_IF_ABSENT,
            MapOperation::Get { .. } => ids::GET,
            MapOperation::GetOrDefault { .. } => ids::GET_OR_DEFAULT,
            MapOperation::Remove { .. } => ids::REMOVE,
            MapOperation::IsEmpty { .. } => ids::IS_EMPTY,
            MapOperation::Size { .. } => ids::SIZE,
            MapOperation::Clear => ids::CLEAR,
        }
    }

    /// Whether the operation is read-only.
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            MapOperation::ContainsKey { .. }
                | MapOperation::Get { .. }
                | MapOperation::GetOrDefault { .. }
                | MapOperation::IsEmpty { .. }
                | MapOperation::Size { .. }
        )
    }
}

/// Results returned by map operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapOutput {
    /// A value (or its absence): `Put`, `PutIfAbsent`, `Get`,
    /// `GetOrDefault`, unconditional `Remove`.
    Value(Option<Vec<u8>>),
    /// `ContainsKey`, compare-and-remove, `IsEmpty`.
    Bool(bool),
    /// `Size`.
    Size(usize),
    /// `Clear`.
    Unit,
}
