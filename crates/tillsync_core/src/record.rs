//! Record log framing.
//!
//! Every committed write is one frame:
//!
//! ```text
//! | magic "TSLR" (4) | payload_len u32 LE (4) | sha256(payload)[..4] (4) | CBOR payload |
//! ```
//!
//! Replay is all-or-nothing: any frame that fails to parse makes the log
//! unusable and the caller gets `CoreError::Corrupted`.

use crate::error::{CoreError, CoreResult};
use crate::Document;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Frame magic.
pub const FRAME_MAGIC: [u8; 4] = *b"TSLR";

/// Bytes before the payload.
pub const FRAME_HEADER_LEN: usize = 12;

/// One persisted write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Collection name.
    pub collection: String,
    /// Primary key.
    pub id: String,
    /// Schema version the document was written under.
    pub schema_version: u32,
    /// Whether the write still has to be pushed.
    pub pending: bool,
    /// The record was removed from the local store.
    pub deleted: bool,
    /// Document body. Empty when `deleted`.
    pub document: Document,
}

impl LogRecord {
    /// Creates an upsert record.
    pub fn put(
        collection: impl Into<String>,
        id: impl Into<String>,
        schema_version: u32,
        pending: bool,
        document: Document,
    ) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            schema_version,
            pending,
            deleted: false,
            document,
        }
    }

    /// Creates a removal record.
    pub fn remove(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            schema_version: 0,
            pending: false,
            deleted: true,
            document: Document::new(),
        }
    }
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Encodes a record as one frame.
pub fn encode_frame(record: &LogRecord) -> CoreResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::ser::into_writer(record, &mut payload)
        .map_err(|e| CoreError::Codec(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::Codec(format!("record too large: {} bytes", payload.len())))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&checksum(&payload));
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes every frame in `bytes`.
///
/// Returns each record with the offset of its frame.
pub fn decode_frames(bytes: &[u8]) -> CoreResult<Vec<(u64, LogRecord)>> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let offset = pos as u64;
        let header = bytes
            .get(pos..pos + FRAME_HEADER_LEN)
            .ok_or_else(|| CoreError::corrupted(offset, "truncated frame header"))?;
        if header[0..4] != FRAME_MAGIC {
            return Err(CoreError::corrupted(offset, "bad frame magic"));
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let expected = [header[8], header[9], header[10], header[11]];

        let start = pos + FRAME_HEADER_LEN;
        let payload = bytes
            .get(start..start + len)
            .ok_or_else(|| CoreError::corrupted(offset, "truncated frame payload"))?;
        if checksum(payload) != expected {
            return Err(CoreError::corrupted(offset, "checksum mismatch"));
        }
        let record: LogRecord = ciborium::de::from_reader(payload)
            .map_err(|e| CoreError::corrupted(offset, format!("undecodable payload: {e}")))?;

        records.push((offset, record));
        pos = start + len;
    }

    Ok(records)
}
