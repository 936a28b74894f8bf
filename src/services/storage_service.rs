//! src/services/storage_service.rs
//!
//! StorageService: the chunked object store. Payloads are split into
//! fixed-size chunks written to local disk beneath
//! `base_path/{media_kind}/{shard}/{shard}/{object_id}/{sequence}`; object and
//! chunk metadata live in SQLite. Nothing here ever holds more than one chunk
//! of a payload in memory.

use crate::models::{
    chunk::ChunkRecord,
    object::{MediaKind, ObjectRecord, ObjectStatus},
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, TryStreamExt, pin_mut, stream::BoxStream};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    future::Future,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// GridFS-compatible default chunk size (255 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;
pub const DEFAULT_IO_RETRIES: u32 = 3;
/// Upper bound accepted for the retry budget.
pub const MAX_IO_RETRIES: u32 = 10;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Backoff before retry number `attempt + 1`: doubles from
/// `RETRY_BASE_DELAY`, capped at `MAX_RETRY_DELAY`.
fn retry_delay(attempt: u32) -> Duration {
    RETRY_BASE_DELAY
        .saturating_mul(1u32 << attempt.min(16))
        .min(MAX_RETRY_DELAY)
}

const OBJECT_COLUMNS: &str = "object_id, media_kind, content_type, total_size, chunk_count, \
                              content_hash, status, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    NotFound(Uuid),
    #[error("object `{0}` is still being written")]
    NotReady(Uuid),
    #[error("object `{0}` is corrupted")]
    Corrupted(Uuid),
    #[error("object `{0}` is not accepting writes")]
    NotWritable(Uuid),
    #[error("object `{object_id}` expected chunk {expected}, got {got}")]
    InvalidSequence {
        object_id: Uuid,
        expected: i64,
        got: i64,
    },
    #[error("chunk of {size} bytes is outside 1..={max}")]
    InvalidChunkSize { size: usize, max: usize },
    #[error("object `{object_id}` hash mismatch: expected {expected}, computed {actual}")]
    IntegrityMismatch {
        object_id: Uuid,
        expected: String,
        actual: String,
    },
    #[error("input stream failed: {0}")]
    Source(#[source] io::Error),
    #[error("storage write failed after {attempts} attempts: {source}")]
    WriteFailed {
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Infrastructure hiccups worth retrying locally: disk I/O failures and a
    /// busy or locked SQLite database.
    fn is_transient(&self) -> bool {
        match self {
            StorageError::Io(err) => err.kind() != ErrorKind::NotFound,
            StorageError::Sqlx(err) => is_transient_sqlx(err),
            _ => false,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Lazy, finite sequence of payload blocks in chunk order.
pub type ObjectStream = BoxStream<'static, StorageResult<Bytes>>;

/// Chunked object store over SQLite metadata and on-disk chunk payloads.
///
/// Writers drive `begin_write` → `write_chunk`* → `finalize_write`; readers
/// only ever see objects whose status is `complete`.
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where chunk payloads are stored.
    pub base_path: PathBuf,

    chunk_size: usize,
    io_retries: u32,
}

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the root directory for chunk payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            io_retries: DEFAULT_IO_RETRIES,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_io_retries(mut self, io_retries: u32) -> Self {
        self.io_retries = io_retries;
        self
    }

    /// Root folder of a media kind namespace.
    fn namespace_root(&self, kind: MediaKind) -> PathBuf {
        self.base_path.join(kind.as_str())
    }

    /// Two-level shard directories derived from MD5(object_id), keeping the
    /// number of entries per directory small.
    fn object_shards(object_id: Uuid) -> (String, String) {
        let digest = md5::compute(object_id.as_bytes());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_dir(&self, kind: MediaKind, object_id: Uuid) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(object_id);
        let mut path = self.namespace_root(kind);
        path.push(shard_a);
        path.push(shard_b);
        path.push(object_id.to_string());
        path
    }

    fn chunk_path(&self, kind: MediaKind, object_id: Uuid, sequence_number: i64) -> PathBuf {
        self.object_dir(kind, object_id)
            .join(format!("{:08}", sequence_number))
    }

    /// Fetch object metadata regardless of status.
    pub async fn get_object(&self, object_id: Uuid) -> StorageResult<ObjectRecord> {
        sqlx::query_as::<_, ObjectRecord>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE object_id = ?"
        ))
        .bind(object_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(StorageError::NotFound(object_id))
    }

    /// Fetch the chunk metadata of an object in sequence order.
    pub async fn list_chunks(&self, object_id: Uuid) -> StorageResult<Vec<ChunkRecord>> {
        let chunks = sqlx::query_as::<_, ChunkRecord>(
            "SELECT object_id, sequence_number, size, chunk_hash
             FROM chunks WHERE object_id = ? ORDER BY sequence_number ASC",
        )
        .bind(object_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(chunks)
    }

    /// Allocate a new object in `writing` state and return its id.
    pub async fn begin_write(
        &self,
        kind: MediaKind,
        content_type: Option<&str>,
    ) -> StorageResult<Uuid> {
        let object_id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO objects (object_id, media_kind, content_type, total_size, chunk_count,
                                  content_hash, status, created_at, updated_at)
             VALUES (?, ?, ?, 0, 0, NULL, ?, ?, ?)",
        )
        .bind(object_id)
        .bind(kind)
        .bind(content_type)
        .bind(ObjectStatus::Writing)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;

        debug!(%object_id, media_kind = %kind, "began object write");
        Ok(object_id)
    }

    /// Append chunk `sequence_number` to an object that is being written.
    ///
    /// Writes must be strictly sequential: anything other than the next
    /// expected sequence number fails with `InvalidSequence`. Transient disk
    /// and database errors are retried `io_retries` times before surfacing as
    /// `WriteFailed`.
    pub async fn write_chunk(
        &self,
        object_id: Uuid,
        sequence_number: i64,
        payload: Bytes,
    ) -> StorageResult<()> {
        if payload.is_empty() || payload.len() > self.chunk_size {
            return Err(StorageError::InvalidChunkSize {
                size: payload.len(),
                max: self.chunk_size,
            });
        }

        let object = self.get_object(object_id).await?;
        if object.status != ObjectStatus::Writing {
            return Err(StorageError::NotWritable(object_id));
        }
        if sequence_number != object.chunk_count {
            return Err(StorageError::InvalidSequence {
                object_id,
                expected: object.chunk_count,
                got: sequence_number,
            });
        }

        let path = self.chunk_path(object.media_kind, object_id, sequence_number);
        let chunk_hash = format!("{:x}", md5::compute(&payload));

        self.with_retries("write chunk payload", || write_file_durably(&path, &payload))
            .await
            .map_err(|err| self.write_failed(err))?;

        let committed = self
            .with_retries("record chunk", || {
                self.record_chunk(object_id, sequence_number, payload.len() as i64, &chunk_hash)
            })
            .await
            .map_err(|err| self.write_failed(err))?;

        if !committed {
            // Lost a race with another writer or a status change; the payload
            // file stays unreferenced and is removed with the object.
            let current = self.get_object(object_id).await?;
            if current.status != ObjectStatus::Writing {
                return Err(StorageError::NotWritable(object_id));
            }
            return Err(StorageError::InvalidSequence {
                object_id,
                expected: current.chunk_count,
                got: sequence_number,
            });
        }

        Ok(())
    }

    /// Insert the chunk row and advance the object's counters in one
    /// transaction, guarded on the expected chunk count.
    async fn record_chunk(
        &self,
        object_id: Uuid,
        sequence_number: i64,
        size: i64,
        chunk_hash: &str,
    ) -> StorageResult<bool> {
        let mut tx = self.db.begin().await?;

        let advanced = sqlx::query(
            "UPDATE objects
             SET chunk_count = chunk_count + 1, total_size = total_size + ?, updated_at = ?
             WHERE object_id = ? AND status = ? AND chunk_count = ?",
        )
        .bind(size)
        .bind(Utc::now())
        .bind(object_id)
        .bind(ObjectStatus::Writing)
        .bind(sequence_number)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if advanced == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO chunks (object_id, sequence_number, size, chunk_hash)
             VALUES (?, ?, ?, ?)",
        )
        .bind(object_id)
        .bind(sequence_number)
        .bind(size)
        .bind(chunk_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Seal an object.
    ///
    /// Re-reads every chunk in order, checking contiguity and chunk hashes
    /// while feeding the payload hash, so a write can be finalized by a
    /// process other than the one that wrote it. If `expected_hash` is given
    /// it must match (case-insensitive hex MD5); otherwise the computed hash
    /// is trusted. Any mismatch marks the object `corrupt`.
    pub async fn finalize_write(
        &self,
        object_id: Uuid,
        expected_hash: Option<&str>,
    ) -> StorageResult<ObjectRecord> {
        let object = self.writable(object_id).await?;

        let chunks = self.list_chunks(object_id).await?;
        let mut digest = Context::new();
        let mut total_size: i64 = 0;
        for (index, chunk) in chunks.iter().enumerate() {
            if chunk.sequence_number != index as i64 {
                self.mark_corrupt(object_id).await?;
                return Err(StorageError::Corrupted(object_id));
            }
            let payload = match self.read_chunk_payload(&object, chunk).await {
                Ok(payload) => payload,
                Err(StorageError::Corrupted(_)) => {
                    self.mark_corrupt(object_id).await?;
                    return Err(StorageError::Corrupted(object_id));
                }
                Err(err) => return Err(err),
            };
            total_size += payload.len() as i64;
            digest.consume(&payload);
        }

        let actual = format!("{:x}", digest.compute());
        self.seal(object_id, expected_hash, actual, total_size, chunks.len() as i64)
            .await
    }

    /// Seal an object whose payload hash was computed while it was written.
    ///
    /// Only the recorded counters are checked against what the writer saw;
    /// no chunk is read back.
    async fn finalize_streamed(
        &self,
        object_id: Uuid,
        expected_hash: Option<&str>,
        digest: Context,
        total_size: i64,
        chunk_count: i64,
    ) -> StorageResult<ObjectRecord> {
        let object = self.writable(object_id).await?;
        if object.chunk_count != chunk_count || object.total_size != total_size {
            warn!(
                %object_id,
                recorded_chunks = object.chunk_count,
                written_chunks = chunk_count,
                "recorded chunks disagree with the written stream"
            );
            self.mark_corrupt(object_id).await?;
            return Err(StorageError::Corrupted(object_id));
        }

        let actual = format!("{:x}", digest.compute());
        self.seal(object_id, expected_hash, actual, total_size, chunk_count)
            .await
    }

    async fn writable(&self, object_id: Uuid) -> StorageResult<ObjectRecord> {
        let object = self.get_object(object_id).await?;
        match object.status {
            ObjectStatus::Writing => Ok(object),
            ObjectStatus::Corrupt => Err(StorageError::Corrupted(object_id)),
            ObjectStatus::Complete => Err(StorageError::NotWritable(object_id)),
        }
    }

    async fn seal(
        &self,
        object_id: Uuid,
        expected_hash: Option<&str>,
        actual: String,
        total_size: i64,
        chunk_count: i64,
    ) -> StorageResult<ObjectRecord> {
        if let Some(expected) = expected_hash {
            if !expected.trim().eq_ignore_ascii_case(&actual) {
                self.mark_corrupt(object_id).await?;
                warn!(%object_id, expected, actual = %actual, "object failed integrity check");
                return Err(StorageError::IntegrityMismatch {
                    object_id,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let sealed = sqlx::query_as::<_, ObjectRecord>(&format!(
            "UPDATE objects
             SET status = ?, content_hash = ?, total_size = ?, chunk_count = ?, updated_at = ?
             WHERE object_id = ? AND status = ?
             RETURNING {OBJECT_COLUMNS}"
        ))
        .bind(ObjectStatus::Complete)
        .bind(&actual)
        .bind(total_size)
        .bind(chunk_count)
        .bind(Utc::now())
        .bind(object_id)
        .bind(ObjectStatus::Writing)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(StorageError::NotWritable(object_id))?;

        debug!(
            %object_id,
            media_kind = %sealed.media_kind,
            total_size,
            chunk_count,
            "finalized object"
        );
        Ok(sealed)
    }

    /// Flag an object as unreadable. Corrupt objects are never served.
    pub async fn mark_corrupt(&self, object_id: Uuid) -> StorageResult<()> {
        sqlx::query("UPDATE objects SET status = ?, updated_at = ? WHERE object_id = ?")
            .bind(ObjectStatus::Corrupt)
            .bind(Utc::now())
            .bind(object_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Stream a complete object chunk by chunk.
    ///
    /// Each call starts again from chunk 0. Chunks are fetched lazily as the
    /// stream is polled, and each one is checked against its recorded hash;
    /// a mismatch or missing chunk ends the stream with `Corrupted`.
    pub async fn read_stream(&self, object_id: Uuid) -> StorageResult<ObjectStream> {
        let object = self.get_object(object_id).await?;
        match object.status {
            ObjectStatus::Complete => {}
            ObjectStatus::Writing => return Err(StorageError::NotReady(object_id)),
            ObjectStatus::Corrupt => return Err(StorageError::Corrupted(object_id)),
        }

        let service = self.clone();
        let stream = futures::stream::try_unfold(0_i64, move |sequence_number| {
            let service = service.clone();
            let object = object.clone();
            async move {
                if sequence_number >= object.chunk_count {
                    return Ok::<_, StorageError>(None);
                }
                let payload = service.read_chunk(&object, sequence_number).await?;
                Ok(Some((payload, sequence_number + 1)))
            }
        });

        Ok(stream.boxed())
    }

    async fn read_chunk(&self, object: &ObjectRecord, sequence_number: i64) -> StorageResult<Bytes> {
        let object_id = object.object_id;
        let chunk = self
            .with_retries("load chunk metadata", || async move {
                let chunk = sqlx::query_as::<_, ChunkRecord>(
                    "SELECT object_id, sequence_number, size, chunk_hash
                     FROM chunks WHERE object_id = ? AND sequence_number = ?",
                )
                .bind(object_id)
                .bind(sequence_number)
                .fetch_optional(&*self.db)
                .await?;
                Ok::<_, StorageError>(chunk)
            })
            .await?
            .ok_or(StorageError::Corrupted(object_id))?;

        self.read_chunk_payload(object, &chunk).await
    }

    /// Load one chunk payload from disk and verify its size and hash.
    async fn read_chunk_payload(
        &self,
        object: &ObjectRecord,
        chunk: &ChunkRecord,
    ) -> StorageResult<Bytes> {
        let path = self.chunk_path(object.media_kind, object.object_id, chunk.sequence_number);
        let path = path.as_path();
        let payload = self
            .with_retries("read chunk payload", || async move {
                Ok::<_, StorageError>(fs::read(path).await?)
            })
            .await
            .map_err(|err| match err {
                StorageError::Io(io_err) if io_err.kind() == ErrorKind::NotFound => {
                    StorageError::Corrupted(object.object_id)
                }
                other => other,
            })?;

        if payload.len() as i64 != chunk.size
            || format!("{:x}", md5::compute(&payload)) != chunk.chunk_hash
        {
            warn!(
                object_id = %object.object_id,
                sequence_number = chunk.sequence_number,
                "chunk failed integrity check"
            );
            return Err(StorageError::Corrupted(object.object_id));
        }

        Ok(Bytes::from(payload))
    }

    /// Remove an object, its chunk rows, and its payload files.
    ///
    /// Idempotent: deleting a missing object returns `Ok(false)`.
    pub async fn delete(&self, object_id: Uuid) -> StorageResult<bool> {
        let object = match self.get_object(object_id).await {
            Ok(object) => object,
            Err(StorageError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };

        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE object_id = ?")
            .bind(object_id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM objects WHERE object_id = ?")
            .bind(object_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        let dir = self.object_dir(object.media_kind, object_id);
        match fs::remove_dir_all(&dir).await {
            Ok(_) => debug!("removed object directory {}", dir.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("object directory {} already missing", dir.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = dir.parent() {
            let root = self.namespace_root(object.media_kind);
            self.prune_empty_dirs(parent, &root).await;
        }

        Ok(removed > 0)
    }

    /// Buffer an arbitrary byte stream into `chunk_size` blocks and write
    /// them as a new object, then finalize it.
    ///
    /// The partially written object is deleted on any failure, including a
    /// failing input stream (surfaced as `Source`).
    pub async fn write_stream<S>(
        &self,
        kind: MediaKind,
        content_type: Option<&str>,
        stream: S,
        expected_hash: Option<&str>,
    ) -> StorageResult<ObjectRecord>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let object_id = self.begin_write(kind, content_type).await?;
        let result = self
            .pump_stream(object_id, stream, expected_hash)
            .await;

        match result {
            Ok(object) => Ok(object),
            Err(err) => {
                // The janitor only reaps `writing` objects, so a corrupt one
                // has to go here.
                if let Err(cleanup) = self.delete(object_id).await {
                    warn!(%object_id, error = %cleanup, "failed to remove partial object");
                }
                Err(err)
            }
        }
    }

    async fn pump_stream<S>(
        &self,
        object_id: Uuid,
        stream: S,
        expected_hash: Option<&str>,
    ) -> StorageResult<ObjectRecord>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let mut buffer = BytesMut::with_capacity(self.chunk_size);
        let mut sequence_number: i64 = 0;
        let mut digest = Context::new();
        let mut total_size: i64 = 0;

        let stream = stream.map_err(StorageError::Source);
        pin_mut!(stream);
        while let Some(mut block) = stream.try_next().await? {
            while !block.is_empty() {
                let room = self.chunk_size - buffer.len();
                let take = room.min(block.len());
                buffer.extend_from_slice(&block.split_to(take));
                if buffer.len() == self.chunk_size {
                    let chunk = buffer.split().freeze();
                    digest.consume(&chunk);
                    total_size += chunk.len() as i64;
                    self.write_chunk(object_id, sequence_number, chunk).await?;
                    sequence_number += 1;
                }
            }
        }
        if !buffer.is_empty() {
            let chunk = buffer.freeze();
            digest.consume(&chunk);
            total_size += chunk.len() as i64;
            self.write_chunk(object_id, sequence_number, chunk).await?;
            sequence_number += 1;
        }

        self.finalize_streamed(object_id, expected_hash, digest, total_size, sequence_number)
            .await
    }

    /// Delete objects still `writing` whose last activity is older than
    /// `older_than`. Returns how many were removed.
    pub async fn reap_orphans(&self, older_than: DateTime<Utc>) -> StorageResult<u64> {
        let candidates: Vec<(Uuid, DateTime<Utc>)> =
            sqlx::query_as("SELECT object_id, updated_at FROM objects WHERE status = ?")
                .bind(ObjectStatus::Writing)
                .fetch_all(&*self.db)
                .await?;

        let mut reaped = 0;
        for (object_id, updated_at) in candidates {
            if updated_at >= older_than {
                continue;
            }
            if self.delete(object_id).await? {
                debug!(%object_id, %updated_at, "reaped orphaned object");
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Run `op` until it succeeds, fails permanently, or exhausts the retry
    /// budget.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.io_retries => {
                    let delay = retry_delay(attempt);
                    attempt += 1;
                    warn!(
                        operation = what,
                        attempt,
                        error = %err,
                        "transient storage error, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn write_failed(&self, err: StorageError) -> StorageError {
        if err.is_transient() {
            StorageError::WriteFailed {
                attempts: self.io_retries + 1,
                source: Box::new(err),
            }
        } else {
            err
        }
    }

    /// Recursively remove empty directories up to the namespace root.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Write `payload` to a temp file beside `path`, fsync it, and rename it into
/// place. A leftover file from an earlier crashed attempt is replaced.
async fn write_file_durably(path: &Path, payload: &[u8]) -> StorageResult<()> {
    let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
        StorageError::Io(io::Error::new(
            ErrorKind::Other,
            "chunk path missing parent directory",
        ))
    })?;
    fs::create_dir_all(&parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

    let written = async {
        let mut file = File::create(&tmp_path).await?;
        file.write_all(payload).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, path).await
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(StorageError::Io(err));
    }
    Ok(())
}

/// SQLite reports contention as SQLITE_BUSY (5) or SQLITE_LOCKED (6).
fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            matches!(db_err.code().as_deref(), Some("5") | Some("6"))
                || db_err.message().to_ascii_lowercase().contains("locked")
        }
        _ => false,
    }
}
