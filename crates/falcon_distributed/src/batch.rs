//! On-disk format of a queued batch.
//!
//! ```text
//! [magic:4 "FDQB"][format_version:4][len:4][crc32:4][bincode(BatchPayload):len]
//! ```
//!
//! All integers are little-endian. A file whose checksum or payload does not
//! verify is never sent; the sender moves it to `broken/`.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use falcon_common::datum::OwnedRow;
use falcon_common::error::QueueError;
use falcon_common::types::{BatchId, TableRef};

pub const BATCH_FORMAT_VERSION: u32 = 1;

/// Magic bytes at the start of every batch file.
pub const BATCH_MAGIC: &[u8; 4] = b"FDQB";

/// magic (4) + version (4) + len (4) + crc32 (4).
pub const BATCH_HEADER_SIZE: usize = 16;

/// Metadata stored with every batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchHeader {
    /// Table on the remote shard that receives the rows.
    pub destination: TableRef,
    /// Wall-clock creation time, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    pub row_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPayload {
    pub header: BatchHeader,
    pub rows: Vec<OwnedRow>,
}

impl BatchPayload {
    pub fn new(destination: TableRef, rows: Vec<OwnedRow>) -> Self {
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            header: BatchHeader {
                destination,
                created_at_ms,
                row_count: rows.len() as u64,
            },
            rows,
        }
    }
}

/// A batch read back from its queue directory.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub header: BatchHeader,
    pub rows: Vec<OwnedRow>,
    /// Size of the file on disk.
    pub size_bytes: u64,
}

pub fn encode_batch(payload: &BatchPayload) -> Result<Vec<u8>, QueueError> {
    let data =
        bincode::serialize(payload).map_err(|e| QueueError::Serialization(e.to_string()))?;
    let len = u32::try_from(data.len()).map_err(|_| {
        QueueError::Serialization(format!("batch of {} bytes exceeds 4 GiB", data.len()))
    })?;
    let checksum = crc32fast::hash(&data);

    let mut out = Vec::with_capacity(BATCH_HEADER_SIZE + data.len());
    out.extend_from_slice(BATCH_MAGIC);
    out.extend_from_slice(&BATCH_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(&data);
    Ok(out)
}

/// Decode a batch file. The error string describes what failed verification;
/// the caller attaches the path.
pub fn decode_batch(data: &[u8]) -> Result<BatchPayload, String> {
    if data.len() < BATCH_HEADER_SIZE {
        return Err(format!("truncated header ({} bytes)", data.len()));
    }
    if &data[0..4] != BATCH_MAGIC.as_slice() {
        return Err("bad magic".into());
    }
    let version = read_u32(data, 4);
    if version != BATCH_FORMAT_VERSION {
        return Err(format!("unsupported format version {}", version));
    }
    let len = read_u32(data, 8) as usize;
    let checksum = read_u32(data, 12);

    let body = &data[BATCH_HEADER_SIZE..];
    if body.len() != len {
        return Err(format!("length mismatch: header says {}, file has {}", len, body.len()));
    }
    let actual = crc32fast::hash(body);
    if actual != checksum {
        return Err(format!("checksum mismatch: expected {:08x}, got {:08x}", checksum, actual));
    }

    let payload: BatchPayload =
        bincode::deserialize(body).map_err(|e| format!("payload decode failed: {}", e))?;
    if payload.header.row_count != payload.rows.len() as u64 {
        return Err(format!(
            "row count mismatch: header says {}, payload has {}",
            payload.header.row_count,
            payload.rows.len()
        ));
    }
    Ok(payload)
}

fn read_u32(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}
