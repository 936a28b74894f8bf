//! src/services/ingest_service.rs
//!
//! IngestService accepts a video upload, stores it as a `video` object and
//! queues a conversion job for it.

use crate::{
    models::object::{MediaKind, ObjectRecord},
    services::{
        identity::Uploader,
        ledger_service::{LedgerError, LedgerService},
        notifier::{Notifier, NotifyStage},
        storage_service::{StorageError, StorageService},
    },
};
use bytes::Bytes;
use futures::Stream;
use std::{io, sync::Arc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("uploader `{0}` is not entitled to submit conversions")]
    Forbidden(String),
    #[error("content type `{0}` is not a video type")]
    InvalidContentType(String),
    #[error("upload stream failed: {0}")]
    UploadAborted(#[source] io::Error),
    #[error("uploaded payload does not match the supplied checksum")]
    IntegrityMismatch,
    #[error("storing the video failed: {0}")]
    StorageWriteFailed(#[source] StorageError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<StorageError> for IngestError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Source(source) => IngestError::UploadAborted(source),
            StorageError::IntegrityMismatch { .. } => IngestError::IntegrityMismatch,
            other => IngestError::StorageWriteFailed(other),
        }
    }
}

/// Normalize a declared content type and accept it only if it is `video/*`.
///
/// Parameters (`; codecs=...`) are dropped and the result is lowercased.
pub fn video_content_type(declared: &str) -> Result<String, IngestError> {
    let essence = declared
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match essence.split_once('/') {
        Some(("video", subtype)) if !subtype.is_empty() && !subtype.contains('/') => Ok(essence),
        _ => Err(IngestError::InvalidContentType(declared.to_string())),
    }
}

#[derive(Clone)]
pub struct IngestService {
    storage: StorageService,
    ledger: LedgerService,
    notifier: Arc<dyn Notifier>,
    notify_stage: NotifyStage,
}

impl IngestService {
    pub fn new(
        storage: StorageService,
        ledger: LedgerService,
        notifier: Arc<dyn Notifier>,
        notify_stage: NotifyStage,
    ) -> Self {
        Self {
            storage,
            ledger,
            notifier,
            notify_stage,
        }
    }

    /// Check entitlement and content type, then stream `payload` into a new
    /// `video` object.
    ///
    /// Nothing is queued yet; pair with [`enqueue`](Self::enqueue), or call
    /// [`submit`](Self::submit) to do both.
    pub async fn store_upload<S>(
        &self,
        uploader: &Uploader,
        declared_content_type: &str,
        payload: S,
        expected_hash: Option<&str>,
    ) -> Result<ObjectRecord, IngestError>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        if !uploader.entitled {
            return Err(IngestError::Forbidden(uploader.name.clone()));
        }
        let content_type = video_content_type(declared_content_type)?;

        let object = self
            .storage
            .write_stream(MediaKind::Video, Some(&content_type), payload, expected_hash)
            .await?;

        info!(
            uploader = %uploader.name,
            object_id = %object.object_id,
            size = object.total_size,
            chunks = object.chunk_count,
            "stored uploaded video"
        );
        Ok(object)
    }

    /// Queue a conversion job for a stored video and return its FID.
    ///
    /// If the job cannot be recorded the video is deleted so no unreachable
    /// object is left behind.
    pub async fn enqueue(&self, object: &ObjectRecord, uploader: &Uploader) -> Result<Uuid, IngestError> {
        let job_id = match self.ledger.create_job(object.object_id, &uploader.name).await {
            Ok(job_id) => job_id,
            Err(err) => {
                self.discard(object.object_id).await;
                return Err(err.into());
            }
        };

        if self.notify_stage == NotifyStage::Submitted {
            if let Err(err) = self.notifier.notify(&uploader.name, job_id).await {
                warn!(fid = %job_id, error = %err, "notification failed");
            }
        }
        Ok(job_id)
    }

    /// Store the upload and queue its conversion in one call.
    pub async fn submit<S>(
        &self,
        uploader: &Uploader,
        declared_content_type: &str,
        payload: S,
        expected_hash: Option<&str>,
    ) -> Result<Uuid, IngestError>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let object = self
            .store_upload(uploader, declared_content_type, payload, expected_hash)
            .await?;
        self.enqueue(&object, uploader).await
    }

    /// Drop a stored video that will never be queued.
    pub async fn discard(&self, object_id: Uuid) {
        if let Err(err) = self.storage.delete(object_id).await {
            warn!(%object_id, error = %err, "failed to remove unqueued video");
        }
    }
}
