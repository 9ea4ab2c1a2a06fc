//! The consensus substrate boundary: a deterministic in-memory driver for
//! the state machines, and the on-disk snapshot file format.

pub mod memory;
pub mod snapshot;


pub use memory::{CompactionReport, MemorySubstrate};
pub use snapshot::{
    read_snapshot, write_snapshot, SnapshotError, SNAPSHOT_FORMAT_VERSION, SNAPSHOT_HEADER_SIZE,
    SNAPSHOT_MAGIC,
};
