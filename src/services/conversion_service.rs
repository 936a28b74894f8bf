//! src/services/conversion_service.rs
//!
//! ConversionService runs one worker step: claim a job, stream its video through
//! the transcoder into a new audio object, and record the outcome in the
//! ledger. A heartbeat keeps the lease alive while the conversion runs.

use crate::{
    models::{
        job::{FailureClass, JobRecord, JobState},
        object::{MediaKind, ObjectRecord},
    },
    services::{
        ledger_service::{LedgerError, LedgerService},
        notifier::Notifier,
        storage_service::{StorageError, StorageService},
        transcoder::{ByteStream, TranscodeError, Transcoder},
    },
};
use futures::{StreamExt, TryStreamExt};
use std::{error::Error as StdError, io, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lower bound on the heartbeat period for very short leases.
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Why a single conversion attempt failed.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("source video unreadable: {0}")]
    Source(#[source] StorageError),
    #[error("transcoding failed: {0}")]
    Transcode(#[source] TranscodeError),
    #[error("storing audio failed: {0}")]
    Store(#[source] StorageError),
    #[error("lease lost")]
    LeaseLost,
}

impl ConversionError {
    /// The storage error raised while reading the source, if this attempt
    /// failed on the source side. Source errors travel through the transcoder
    /// and the audio writer wrapped in `io::Error`.
    fn source_error(&self) -> Option<&StorageError> {
        match self {
            ConversionError::Source(err) => Some(err),
            ConversionError::Transcode(TranscodeError::Input(err))
            | ConversionError::Store(StorageError::Source(err)) => wrapped(err),
            _ => None,
        }
    }

    /// Coarse class recorded in the ledger.
    pub fn class(&self) -> FailureClass {
        if let Some(err) = self.source_error() {
            return match err {
                StorageError::Corrupted(_) | StorageError::IntegrityMismatch { .. } => {
                    FailureClass::IntegrityFailed
                }
                _ => FailureClass::SourceUnavailable,
            };
        }
        match self {
            ConversionError::Source(_) | ConversionError::Transcode(TranscodeError::Input(_)) => {
                FailureClass::SourceUnavailable
            }
            ConversionError::Transcode(_) | ConversionError::Store(StorageError::Source(_)) => {
                FailureClass::TranscodeFailed
            }
            ConversionError::Store(
                StorageError::Corrupted(_) | StorageError::IntegrityMismatch { .. },
            ) => FailureClass::IntegrityFailed,
            ConversionError::Store(_) => FailureClass::StorageFailed,
            ConversionError::LeaseLost => FailureClass::LeaseExpired,
        }
    }
}

fn wrapped<E: StdError + 'static>(err: &io::Error) -> Option<&E> {
    err.get_ref().and_then(|inner| inner.downcast_ref::<E>())
}

/// What one call to [`ConversionService::process_next`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing was queued.
    Idle,
    Succeeded(Uuid),
    /// The attempt failed and the job went back to `queued`.
    Retrying(Uuid),
    /// The attempt failed and the job is terminally `failed`.
    Failed(Uuid),
    /// The lease was lost mid-attempt; the ledger no longer belongs to us.
    Abandoned(Uuid),
}

#[derive(Clone)]
pub struct ConversionService {
    storage: StorageService,
    ledger: LedgerService,
    transcoder: Arc<dyn Transcoder>,
    notifier: Arc<dyn Notifier>,
    notify_on_completion: bool,
}

impl ConversionService {
    pub fn new(
        storage: StorageService,
        ledger: LedgerService,
        transcoder: Arc<dyn Transcoder>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            storage,
            ledger,
            transcoder,
            notifier,
            notify_on_completion: true,
        }
    }

    /// Whether this service sends the ready notification after success.
    pub fn with_completion_notice(mut self, enabled: bool) -> Self {
        self.notify_on_completion = enabled;
        self
    }

    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }

    pub fn storage(&self) -> &StorageService {
        &self.storage
    }

    /// Claim one queued job and run it to an outcome.
    ///
    /// Only ledger failures are returned as errors; conversion failures are
    /// recorded on the job.
    pub async fn process_next(&self, worker_id: &str) -> Result<Outcome, LedgerError> {
        let Some(job) = self.ledger.claim_next_job(worker_id).await? else {
            return Ok(Outcome::Idle);
        };
        let job_id = job.job_id;
        info!(fid = %job_id, worker_id, attempt = job.attempt_count, "conversion started");

        let attempt = tokio::select! {
            result = self.convert(&job) => result,
            lost = self.heartbeat(job_id, worker_id) => Err(lost),
        };

        match attempt {
            Ok(audio) => self.finish(&job, worker_id, audio).await,
            Err(ConversionError::LeaseLost) => {
                warn!(fid = %job_id, worker_id, "lease lost, abandoning attempt");
                Ok(Outcome::Abandoned(job_id))
            }
            Err(err) => self.record_failure(&job, worker_id, err).await,
        }
    }

    async fn convert(&self, job: &JobRecord) -> Result<ObjectRecord, ConversionError> {
        let source = self
            .storage
            .read_stream(job.source_object_id)
            .await
            .map_err(ConversionError::Source)?;
        let input: ByteStream = source
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
            .boxed();

        let output = self
            .transcoder
            .transcode(input)
            .await
            .map_err(ConversionError::Transcode)?;

        self.storage
            .write_stream(
                MediaKind::Audio,
                Some(self.transcoder.output_content_type()),
                output,
                None,
            )
            .await
            .map_err(ConversionError::Store)
    }

    /// Renew the lease every third of its duration. Resolves only once the
    /// lease is gone.
    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> ConversionError {
        let period = (self.ledger.lease_duration() / 3).max(MIN_HEARTBEAT);
        loop {
            tokio::time::sleep(period).await;
            match self.ledger.renew_lease(job_id, worker_id).await {
                Ok(deadline) => debug!(fid = %job_id, %deadline, "lease renewed"),
                Err(LedgerError::LeaseLost { .. } | LedgerError::NotFound(_)) => {
                    return ConversionError::LeaseLost;
                }
                Err(err) => warn!(fid = %job_id, error = %err, "lease renewal failed"),
            }
        }
    }

    async fn finish(
        &self,
        job: &JobRecord,
        worker_id: &str,
        audio: ObjectRecord,
    ) -> Result<Outcome, LedgerError> {
        let job_id = job.job_id;
        if let Err(err) = self
            .ledger
            .complete_leased_job(job_id, worker_id, audio.object_id)
            .await
        {
            // The job will be retried or is owned by someone else; this audio
            // would never be reachable.
            if let Err(cleanup) = self.storage.delete(audio.object_id).await {
                warn!(object_id = %audio.object_id, error = %cleanup, "failed to remove orphaned audio");
            }
            return match err {
                // Reclaimed between heartbeats shows up as a transition out
                // of a state this worker no longer owns.
                LedgerError::LeaseLost { .. } | LedgerError::InvalidTransition { .. } => {
                    warn!(fid = %job_id, worker_id, error = %err, "lease lost before completion");
                    Ok(Outcome::Abandoned(job_id))
                }
                other => Err(other),
            };
        }

        info!(fid = %job_id, size = audio.total_size, "conversion succeeded");
        if self.notify_on_completion {
            if let Err(err) = self.notifier.notify(&job.recipient, job_id).await {
                warn!(fid = %job_id, error = %err, "notification failed");
            }
        }
        Ok(Outcome::Succeeded(job_id))
    }

    async fn record_failure(
        &self,
        job: &JobRecord,
        worker_id: &str,
        err: ConversionError,
    ) -> Result<Outcome, LedgerError> {
        let job_id = job.job_id;
        let class = err.class();
        error!(fid = %job_id, worker_id, class = %class, error = %err, "conversion attempt failed");

        if let Some(StorageError::Corrupted(object_id)) = err.source_error() {
            if let Err(mark) = self.storage.mark_corrupt(*object_id).await {
                warn!(%object_id, error = %mark, "failed to flag corrupt source");
            }
        }

        // A corrupt source stays corrupt; retrying cannot help.
        let recorded = if class == FailureClass::IntegrityFailed {
            self.ledger
                .fail_leased_job_permanently(job_id, worker_id, class)
                .await
        } else {
            self.ledger.fail_leased_job(job_id, worker_id, class).await
        };

        match recorded {
            Ok(updated) if updated.state == JobState::Failed => Ok(Outcome::Failed(job_id)),
            Ok(_) => Ok(Outcome::Retrying(job_id)),
            Err(err @ (LedgerError::LeaseLost { .. } | LedgerError::InvalidTransition { .. })) => {
                warn!(fid = %job_id, worker_id, error = %err, "lease lost before recording failure");
                Ok(Outcome::Abandoned(job_id))
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, models::object::ObjectStatus};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use sqlx::SqlitePool;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Uppercases every byte; stands in for a real codec.
    struct UppercaseTranscoder;

    #[async_trait]
    impl Transcoder for UppercaseTranscoder {
        async fn transcode(&self, input: ByteStream) -> Result<ByteStream, TranscodeError> {
            Ok(input
                .map_ok(|block| Bytes::from(block.to_ascii_uppercase()))
                .boxed())
        }
    }

    struct BrokenTranscoder;

    #[async_trait]
    impl Transcoder for BrokenTranscoder {
        async fn transcode(&self, _input: ByteStream) -> Result<ByteStream, TranscodeError> {
            Ok(stream::iter(vec![
                Ok(Bytes::from_static(b"partial")),
                Err(io::Error::new(io::ErrorKind::Other, "codec crashed")),
            ])
            .boxed())
        }
    }

    /// Hands the lease to another worker, then stalls.
    struct StalledTranscoder {
        db: Arc<SqlitePool>,
    }

    #[async_trait]
    impl Transcoder for StalledTranscoder {
        async fn transcode(&self, _input: ByteStream) -> Result<ByteStream, TranscodeError> {
            sqlx::query("UPDATE jobs SET lease_owner = 'thief'")
                .execute(&*self.db)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(stream::empty().boxed())
        }
    }

    /// Lets the reaper reclaim the lease, then passes the input through
    /// before any heartbeat could notice.
    struct ReclaimedTranscoder {
        ledger: LedgerService,
    }

    #[async_trait]
    impl Transcoder for ReclaimedTranscoder {
        async fn transcode(&self, input: ByteStream) -> Result<ByteStream, TranscodeError> {
            let later = chrono::Utc::now() + chrono::Duration::seconds(60);
            self.ledger.reclaim_expired(later).await.unwrap();
            Ok(input)
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, Uuid)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, recipient: &str, job_id: Uuid) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((recipient.to_string(), job_id));
            Ok(())
        }
    }

    struct Fixture {
        _temp: TempDir,
        db: Arc<SqlitePool>,
        storage: StorageService,
        ledger: LedgerService,
        notifier: Arc<RecordingNotifier>,
    }

    impl Fixture {
        async fn new(max_attempts: i64) -> Self {
            let temp = TempDir::new().unwrap();
            let pool = db::connect_path(&temp.path().join("meta.db"), 4)
                .await
                .unwrap();
            db::run_migrations(&pool).await.unwrap();
            let db = Arc::new(pool);
            let storage = StorageService::new(db.clone(), temp.path().join("chunks")).with_chunk_size(4);
            let ledger = LedgerService::new(db.clone())
                .with_max_attempts(max_attempts)
                .with_lease_duration(Duration::from_millis(90));
            Self {
                _temp: temp,
                db,
                storage,
                ledger,
                notifier: Arc::new(RecordingNotifier::default()),
            }
        }

        fn service(&self, transcoder: Arc<dyn Transcoder>) -> ConversionService {
            ConversionService::new(
                self.storage.clone(),
                self.ledger.clone(),
                transcoder,
                self.notifier.clone(),
            )
        }

        async fn queue(&self, payload: &'static [u8]) -> Uuid {
            let video = self
                .storage
                .write_stream(
                    MediaKind::Video,
                    Some("video/mp4"),
                    stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(payload))]),
                    None,
                )
                .await
                .unwrap();
            self.ledger
                .create_job(video.object_id, "alice")
                .await
                .unwrap()
        }

        async fn audio_objects(&self) -> i64 {
            sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE media_kind = 'audio'")
                .fetch_one(&*self.db)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_idle_when_nothing_is_queued() {
        let fx = Fixture::new(3).await;
        let service = fx.service(Arc::new(UppercaseTranscoder));
        assert_eq!(service.process_next("w1").await.unwrap(), Outcome::Idle);
    }

    #[tokio::test]
    async fn test_successful_conversion_stores_audio_and_notifies() {
        let fx = Fixture::new(3).await;
        let fid = fx.queue(b"some video frames").await;
        let service = fx.service(Arc::new(UppercaseTranscoder));

        assert_eq!(
            service.process_next("w1").await.unwrap(),
            Outcome::Succeeded(fid)
        );

        let job = fx.ledger.get_job(fid).await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.lease_owner, None);
        let audio_id = job.result_object_id.unwrap();
        let audio = fx.storage.get_object(audio_id).await.unwrap();
        assert_eq!(audio.media_kind, MediaKind::Audio);
        assert_eq!(audio.content_type.as_deref(), Some("audio/mpeg"));

        let body: Vec<Bytes> = fx
            .storage
            .read_stream(audio_id)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(body.concat(), b"SOME VIDEO FRAMES");

        let sent = fx.notifier.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("alice".to_string(), fid)]);
    }

    #[tokio::test]
    async fn test_completion_notice_can_be_disabled() {
        let fx = Fixture::new(3).await;
        fx.queue(b"video").await;
        let service = fx
            .service(Arc::new(UppercaseTranscoder))
            .with_completion_notice(false);

        assert!(matches!(
            service.process_next("w1").await.unwrap(),
            Outcome::Succeeded(_)
        ));
        assert!(fx.notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_transcoder_retries_then_fails_terminally() {
        let fx = Fixture::new(2).await;
        let fid = fx.queue(b"video").await;
        let service = fx.service(Arc::new(BrokenTranscoder));

        assert_eq!(
            service.process_next("w1").await.unwrap(),
            Outcome::Retrying(fid)
        );
        assert_eq!(
            service.process_next("w2").await.unwrap(),
            Outcome::Failed(fid)
        );
        assert_eq!(service.process_next("w3").await.unwrap(), Outcome::Idle);

        let job = fx.ledger.get_job(fid).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempt_count, 2);
        assert_eq!(job.failure_class(), Some(FailureClass::TranscodeFailed));
        // Partial audio from both attempts was cleaned up.
        assert_eq!(fx.audio_objects().await, 0);
        assert!(fx.notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_source_is_classified() {
        let fx = Fixture::new(1).await;
        let fid = fx.queue(b"video").await;
        let job = fx.ledger.get_job(fid).await.unwrap();
        fx.storage.delete(job.source_object_id).await.unwrap();

        let service = fx.service(Arc::new(UppercaseTranscoder));
        assert_eq!(
            service.process_next("w1").await.unwrap(),
            Outcome::Failed(fid)
        );
        let job = fx.ledger.get_job(fid).await.unwrap();
        assert_eq!(job.failure_class(), Some(FailureClass::SourceUnavailable));
    }

    #[tokio::test]
    async fn test_corrupt_source_fails_with_integrity_class() {
        let fx = Fixture::new(3).await;
        let fid = fx.queue(b"abcdefgh").await;
        let job = fx.ledger.get_job(fid).await.unwrap();

        // Make the second chunk fail its integrity check.
        sqlx::query("UPDATE chunks SET chunk_hash = 'ffffffffffffffffffffffffffffffff' WHERE sequence_number = 1")
            .execute(&*fx.db)
            .await
            .unwrap();

        let service = fx.service(Arc::new(UppercaseTranscoder));
        assert_eq!(
            service.process_next("w1").await.unwrap(),
            Outcome::Failed(fid)
        );
        let failed = fx.ledger.get_job(fid).await.unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.failure_class(), Some(FailureClass::IntegrityFailed));
        assert_eq!(service.process_next("w2").await.unwrap(), Outcome::Idle);

        let source = fx.storage.get_object(job.source_object_id).await.unwrap();
        assert_eq!(source.status, ObjectStatus::Corrupt);
        assert_eq!(fx.audio_objects().await, 0);
    }

    #[tokio::test]
    async fn test_lost_lease_abandons_attempt_without_touching_job() {
        let fx = Fixture::new(3).await;
        let fid = fx.queue(b"video").await;
        let service = fx.service(Arc::new(StalledTranscoder { db: fx.db.clone() }));

        let outcome = tokio::time::timeout(Duration::from_secs(5), service.process_next("w1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Outcome::Abandoned(fid));

        let job = fx.ledger.get_job(fid).await.unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.lease_owner.as_deref(), Some("thief"));
    }

    #[tokio::test]
    async fn test_reclaimed_job_is_abandoned_on_completion() {
        let fx = Fixture::new(3).await;
        let fid = fx.queue(b"video").await;
        // Long enough that no heartbeat fires during the attempt.
        let ledger = fx.ledger.clone().with_lease_duration(Duration::from_secs(30));
        let service = ConversionService::new(
            fx.storage.clone(),
            ledger.clone(),
            Arc::new(ReclaimedTranscoder { ledger }),
            fx.notifier.clone(),
        );

        assert_eq!(
            service.process_next("w1").await.unwrap(),
            Outcome::Abandoned(fid)
        );

        let job = fx.ledger.get_job(fid).await.unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.failure_class(), Some(FailureClass::LeaseExpired));
        assert_eq!(fx.audio_objects().await, 0);
        assert!(fx.notifier.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_wrapped_source_errors_keep_their_class() {
        let object_id = Uuid::new_v4();
        let via_transcoder = ConversionError::Transcode(TranscodeError::Input(io::Error::new(
            io::ErrorKind::Other,
            StorageError::Corrupted(object_id),
        )));
        assert_eq!(via_transcoder.class(), FailureClass::IntegrityFailed);

        let via_writer = ConversionError::Store(StorageError::Source(io::Error::new(
            io::ErrorKind::Other,
            StorageError::NotFound(object_id),
        )));
        assert_eq!(via_writer.class(), FailureClass::SourceUnavailable);

        let codec = ConversionError::Store(StorageError::Source(io::Error::new(
            io::ErrorKind::Other,
            "ffmpeg exited",
        )));
        assert_eq!(codec.class(), FailureClass::TranscodeFailed);
        assert_eq!(ConversionError::LeaseLost.class(), FailureClass::LeaseExpired);
    }
}
