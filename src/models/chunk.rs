//! Represents one fixed-size fragment of an object.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata for a stored chunk. The payload is kept on disk, addressed by
/// `(object_id, sequence_number)`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Owning object. Chunks are removed together with it.
    pub object_id: Uuid,

    /// 0-based position; contiguous with no gaps.
    pub sequence_number: i64,

    /// Payload length in bytes.
    pub size: i64,

    /// Hex MD5 of the payload, checked again on every read.
    pub chunk_hash: String,
}
