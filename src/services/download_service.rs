//! src/services/download_service.rs
//!
//! DownloadService resolves a FID to its finished audio object and streams
//! it back. Only the FID, job state and coarse failure class ever leave this
//! module; object ids stay internal.

use crate::{
    models::job::{FailureClass, JobRecord, JobState},
    services::{
        ledger_service::{LedgerError, LedgerService},
        storage_service::{ObjectStream, StorageError, StorageService},
    },
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no such conversion")]
    NotFound,
    #[error("conversion is still {0}")]
    NotReady(JobState),
    #[error("conversion failed")]
    Failed(Option<FailureClass>),
    #[error("audio is currently unavailable: {0}")]
    Unavailable(#[source] StorageError),
    #[error(transparent)]
    Ledger(LedgerError),
}

impl From<LedgerError> for DownloadError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(_) => DownloadError::NotFound,
            other => DownloadError::Ledger(other),
        }
    }
}

/// A finished conversion ready to be streamed.
pub struct AudioDownload {
    pub fid: Uuid,
    pub size: i64,
    pub content_hash: Option<String>,
    pub content_type: String,
    pub stream: ObjectStream,
}

/// Client-facing view of a job.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobStatusView {
    pub fid: Uuid,
    pub state: JobState,
    pub attempts: i64,
    pub error: Option<FailureClass>,
}

impl From<&JobRecord> for JobStatusView {
    fn from(job: &JobRecord) -> Self {
        Self {
            fid: job.job_id,
            state: job.state,
            attempts: job.attempt_count,
            error: job.failure_class(),
        }
    }
}

#[derive(Clone)]
pub struct DownloadService {
    storage: StorageService,
    ledger: LedgerService,
}

impl DownloadService {
    pub fn new(storage: StorageService, ledger: LedgerService) -> Self {
        Self { storage, ledger }
    }

    /// Resolve `fid` and open its audio for streaming.
    ///
    /// A FID that does not parse is reported exactly like an unknown one.
    pub async fn fetch(&self, fid: &str) -> Result<AudioDownload, DownloadError> {
        let job = self.lookup(fid).await?;

        let result_object_id = match (job.state, job.result_object_id) {
            (JobState::Succeeded, Some(object_id)) => object_id,
            (JobState::Failed, _) => return Err(DownloadError::Failed(job.failure_class())),
            (JobState::Succeeded, None) => {
                error!(fid = %job.job_id, "succeeded job has no result object");
                return Err(DownloadError::Unavailable(StorageError::NotFound(job.job_id)));
            }
            (state, _) => return Err(DownloadError::NotReady(state)),
        };

        let object = self
            .storage
            .get_object(result_object_id)
            .await
            .map_err(DownloadError::Unavailable)?;
        let stream = self
            .storage
            .read_stream(result_object_id)
            .await
            .map_err(|err| {
                error!(fid = %job.job_id, error = %err, "result object unreadable");
                DownloadError::Unavailable(err)
            })?;

        debug!(fid = %job.job_id, size = object.total_size, "serving audio");
        Ok(AudioDownload {
            fid: job.job_id,
            size: object.total_size,
            content_hash: object.content_hash,
            content_type: object
                .content_type
                .unwrap_or_else(|| "audio/mpeg".to_string()),
            stream,
        })
    }

    /// Report the state of a conversion without touching its payload.
    pub async fn status(&self, fid: &str) -> Result<JobStatusView, DownloadError> {
        let job = self.lookup(fid).await?;
        Ok(JobStatusView::from(&job))
    }

    async fn lookup(&self, fid: &str) -> Result<JobRecord, DownloadError> {
        let job_id = Uuid::parse_str(fid.trim()).map_err(|_| DownloadError::NotFound)?;
        Ok(self.ledger.get_job(job_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, models::object::MediaKind};
    use bytes::Bytes;
    use futures::{TryStreamExt, stream};
    use std::{io, sync::Arc};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, DownloadService, StorageService, LedgerService) {
        let temp = TempDir::new().unwrap();
        let pool = db::connect_path(&temp.path().join("meta.db"), 4)
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        let pool = Arc::new(pool);
        let storage = StorageService::new(pool.clone(), temp.path().join("chunks")).with_chunk_size(8);
        let ledger = LedgerService::new(pool).with_max_attempts(1);
        let download = DownloadService::new(storage.clone(), ledger.clone());
        (temp, download, storage, ledger)
    }

    async fn store(storage: &StorageService, kind: MediaKind, data: &'static [u8]) -> Uuid {
        storage
            .write_stream(
                kind,
                Some("audio/mpeg"),
                stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(data))]),
                None,
            )
            .await
            .unwrap()
            .object_id
    }

    #[tokio::test]
    async fn test_unknown_and_garbled_fids_are_not_found() {
        let (_temp, download, _storage, _ledger) = setup().await;
        for fid in [Uuid::new_v4().to_string(), "not-a-fid".to_string(), String::new()] {
            assert!(matches!(
                download.fetch(&fid).await,
                Err(DownloadError::NotFound)
            ));
            assert!(matches!(
                download.status(&fid).await,
                Err(DownloadError::NotFound)
            ));
        }
    }

    #[tokio::test]
    async fn test_fetch_follows_job_state() {
        let (_temp, download, storage, ledger) = setup().await;
        let video = store(&storage, MediaKind::Video, b"video bytes").await;
        let fid = ledger.create_job(video, "alice").await.unwrap();
        let fid_text = fid.to_string();

        assert!(matches!(
            download.fetch(&fid_text).await,
            Err(DownloadError::NotReady(JobState::Queued))
        ));

        ledger.claim_next_job("w1").await.unwrap().unwrap();
        assert!(matches!(
            download.fetch(&fid_text).await,
            Err(DownloadError::NotReady(JobState::Running))
        ));

        let audio = store(&storage, MediaKind::Audio, b"the converted audio track").await;
        ledger.complete_job(fid, audio).await.unwrap();

        let found = download.fetch(&fid_text).await.unwrap();
        assert_eq!(found.fid, fid);
        assert_eq!(found.size, 25);
        assert_eq!(found.content_type, "audio/mpeg");
        let body: Vec<Bytes> = found.stream.try_collect().await.unwrap();
        assert_eq!(body.concat(), b"the converted audio track");

        let view = download.status(&fid_text).await.unwrap();
        assert_eq!(view.state, JobState::Succeeded);
        assert_eq!(view.attempts, 1);
        assert_eq!(view.error, None);
    }

    #[tokio::test]
    async fn test_failed_job_reports_only_the_failure_class() {
        let (_temp, download, storage, ledger) = setup().await;
        let video = store(&storage, MediaKind::Video, b"video").await;
        let fid = ledger.create_job(video, "alice").await.unwrap();
        ledger.claim_next_job("w1").await.unwrap().unwrap();
        ledger
            .fail_job(fid, FailureClass::TranscodeFailed)
            .await
            .unwrap();

        match download.fetch(&fid.to_string()).await {
            Err(DownloadError::Failed(class)) => {
                assert_eq!(class, Some(FailureClass::TranscodeFailed))
            }
            other => panic!("expected Failed, got {:?}", other.err()),
        }
        let view = download.status(&fid.to_string()).await.unwrap();
        assert_eq!(view.state, JobState::Failed);
        assert_eq!(view.error, Some(FailureClass::TranscodeFailed));
    }
}
