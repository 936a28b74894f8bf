//! Represents a chunked binary (a source video or a derived audio file).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// The namespace an object lives in.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a stored object.
///
/// Only `Complete` objects are readable. `Writing` objects left behind by a
/// crashed writer stay that way until the janitor reaps them.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ObjectStatus {
    Writing,
    Complete,
    Corrupt,
}

/// Metadata for a single stored binary. The payload itself lives in chunks.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectRecord {
    /// Internal identifier; never shown to clients.
    pub object_id: Uuid,

    pub media_kind: MediaKind,

    /// Declared MIME type, if the writer supplied one.
    pub content_type: Option<String>,

    /// Byte length. Only final once `status` is `Complete`.
    pub total_size: i64,

    /// Number of chunks written so far; doubles as the next expected sequence
    /// number while the object is `Writing`.
    pub chunk_count: i64,

    /// Hex MD5 over the full payload, set on finalize.
    pub content_hash: Option<String>,

    pub status: ObjectStatus,

    pub created_at: DateTime<Utc>,

    /// Last chunk write or status change. The janitor ages orphans by this.
    pub updated_at: DateTime<Utc>,
}

impl ObjectRecord {
    pub fn is_complete(&self) -> bool {
        self.status == ObjectStatus::Complete
    }
}
