//! On-disk snapshot files.
//!
//! # Layout (28-byte header + state payload)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     magic ("RSMS")
//! 4       2     format version
//! 6       2     reserved (must be zero)
//! 8       4     schema_version (state machine snapshot schema)
//! 12      8     state_len
//! 20      4     state_crc32c
//! 24      4     header_crc32c (CRC32C of bytes 0..24)
//! 28      var   state payload
//! ```

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::rsm::SnapshotStream;

/// Snapshot file magic bytes: "RSMS".
pub const SNAPSHOT_MAGIC: [u8; 4] = [0x52, 0x53, 0x4D, 0x53];

/// Current snapshot file format version.
pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;

/// Snapshot file header size in bytes.
pub const SNAPSHOT_HEADER_SIZE: usize = 28;

/// Snapshot file errors.
#[derive(Debug)]
pub enum SnapshotError {
    /// The file does not start with the snapshot magic.
    BadMagic,

    /// The file carries a format version this build cannot read.
    UnsupportedVersion(u16),

    /// Header or state checksum mismatch.
    ChecksumMismatch { expected: u32, found: u32 },

    /// The file ends before the declared state length.
    Truncated { expected: usize, got: usize },

    /// IO error while reading or writing.
    IoError(io::Error),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::BadMagic => write!(f, "Bad snapshot magic"),
            SnapshotError::UnsupportedVersion(version) => {
                write!(f, "Unsupported snapshot format version: {}", version)
            }
            SnapshotError::ChecksumMismatch { expected, found } => {
                write!(
                    f,
                    "Snapshot checksum mismatch: expected {:08x}, found {:08x}",
                    expected, found
                )
            }
            SnapshotError::Truncated { expected, got } => {
                write!(
                    f,
                    "Truncated snapshot: expected {} state bytes, got {}",
                    expected, got
                )
            }
            SnapshotError::IoError(e) => write!(f, "Snapshot IO error: {}", e),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<io::Error> for SnapshotError {
    fn from(e: io::Error) -> Self {
        SnapshotError::IoError(e)
    }
}

fn encode_header(stream: &SnapshotStream) -> [u8; SNAPSHOT_HEADER_SIZE] {
    let mut header = [0u8; SNAPSHOT_HEADER_SIZE];
    header[0..4].copy_from_slice(&SNAPSHOT_MAGIC);
    header[4..6].copy_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
    // Bytes 6..8 reserved.
    header[8..12].copy_from_slice(&stream.schema_version.to_le_bytes());
    header[12..20].copy_from_slice(&(stream.data.len() as u64).to_le_bytes());
    header[20..24].copy_from_slice(&crc32c::crc32c(&stream.data).to_le_bytes());
    let header_crc = crc32c::crc32c(&header[0..24]);
    header[24..28].copy_from_slice(&header_crc.to_le_bytes());
    header
}

/// Write a snapshot stream to `path`.
pub fn write_snapshot(path: &Path, stream: &SnapshotStream) -> Result<(), SnapshotError> {
    let mut file = File::create(path)?;
    file.write_all(&encode_header(stream))?;
    file.write_all(&stream.data)?;
    file.sync_all()?;
    Ok(())
}

/// Read and verify a snapshot stream from `path`.
pub fn read_snapshot(path: &Path) -> Result<SnapshotStream, SnapshotError> {
    let mut file = File::open(path)?;
    let mut header = [0u8; SNAPSHOT_HEADER_SIZE];
    file.read_exact(&mut header).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            SnapshotError::Truncated {
                expected: SNAPSHOT_HEADER_SIZE,
                got: 0,
            }
        } else {
            SnapshotError::IoError(e)
        }
    })?;

    if header[0..4] != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != SNAPSHOT_FORMAT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }

    let expected_header_crc = u32::from_le_bytes([header[24], header[25], header[26], header[27]]);
    let found_header_crc = crc32c::crc32c(&header[0..24]);
    if expected_header_crc != found_header_crc {
        return Err(SnapshotError::ChecksumMismatch {
            expected: expected_header_crc,
            found: found_header_crc,
        });
    }

    let schema_version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    let state_len = u64::from_le_bytes([
        header[12], header[13], header[14], header[15], header[16], header[17], header[18],
        header[19],
    ]) as usize;
    let expected_state_crc = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);

    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    if data.len() < state_len {
        return Err(SnapshotError::Truncated {
            expected: state_len,
            got: data.len(),
        });
    }
    data.truncate(state_len);

    let found_state_crc = crc32c::crc32c(&data);
    if expected_state_crc != found_state_crc {
        return Err(SnapshotError::ChecksumMismatch {
            expected: expected_state_crc,
            found: found_state_crc,
        });
    }

    Ok(SnapshotStream {
        schema_version,
        data,
    })
}
