//! src/services/ledger_service.rs
//!
//! LedgerService: durable record of conversion jobs. Every state change is a
//! single guarded `UPDATE ... RETURNING` statement, so SQLite's write lock is
//! the only serialization point between workers.

use crate::models::job::{FailureClass, JobRecord, JobState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

const JOB_COLUMNS: &str = "job_id, source_object_id, result_object_id, recipient, state, \
                           attempt_count, last_error, lease_owner, lease_expires_at, \
                           created_at, updated_at";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("job `{0}` not found")]
    NotFound(Uuid),
    #[error("job `{job_id}` cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },
    #[error("job `{job_id}` is no longer leased to `{worker_id}`")]
    LeaseLost { job_id: Uuid, worker_id: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Number of jobs per state.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct LedgerStats {
    pub queued: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

/// Job ledger backed by the `jobs` table.
#[derive(Clone)]
pub struct LedgerService {
    pub db: Arc<SqlitePool>,
    max_attempts: i64,
    lease_duration: Duration,
}

impl LedgerService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self {
            db,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lease_duration: DEFAULT_LEASE_DURATION,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    fn lease_deadline_from(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis() + self.lease_duration.as_millis() as i64
    }

    /// Record a new `queued` job for `source_object_id` and return its FID.
    pub async fn create_job(&self, source_object_id: Uuid, recipient: &str) -> LedgerResult<Uuid> {
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO jobs (job_id, source_object_id, result_object_id, recipient, state,
                               attempt_count, last_error, lease_owner, lease_expires_at,
                               created_at, updated_at)
             VALUES (?, ?, NULL, ?, ?, 0, NULL, NULL, NULL, ?, ?)",
        )
        .bind(job_id)
        .bind(source_object_id)
        .bind(recipient)
        .bind(JobState::Queued)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;

        info!(%job_id, "job queued");
        Ok(job_id)
    }

    /// Fetch a job by FID.
    pub async fn get_job(&self, job_id: Uuid) -> LedgerResult<JobRecord> {
        sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?"
        ))
        .bind(job_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(LedgerError::NotFound(job_id))
    }

    /// Atomically claim one `queued` job for `worker_id`.
    ///
    /// The job moves to `running`, its attempt count is incremented and a
    /// lease of `lease_duration` is granted. Selection and update happen in a
    /// single statement, so two workers can never claim the same job. Jobs
    /// idle the longest are preferred, but no ordering is promised.
    pub async fn claim_next_job(&self, worker_id: &str) -> LedgerResult<Option<JobRecord>> {
        let now = Utc::now();
        let claimed = sqlx::query_as::<_, JobRecord>(&format!(
            "UPDATE jobs
             SET state = ?, attempt_count = attempt_count + 1, lease_owner = ?,
                 lease_expires_at = ?, updated_at = ?
             WHERE job_id = (
                 SELECT job_id FROM jobs WHERE state = ? ORDER BY updated_at ASC LIMIT 1
             ) AND state = ?
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(JobState::Running)
        .bind(worker_id)
        .bind(self.lease_deadline_from(now))
        .bind(now)
        .bind(JobState::Queued)
        .bind(JobState::Queued)
        .fetch_optional(&*self.db)
        .await?;

        if let Some(job) = &claimed {
            debug!(
                job_id = %job.job_id,
                worker_id,
                attempt = job.attempt_count,
                "job claimed"
            );
        }
        Ok(claimed)
    }

    /// Extend the lease `worker_id` holds on a running job.
    ///
    /// Fails with `LeaseLost` once the job was reclaimed or finished, which
    /// tells the worker to abandon its attempt.
    pub async fn renew_lease(&self, job_id: Uuid, worker_id: &str) -> LedgerResult<DateTime<Utc>> {
        let now = Utc::now();
        let deadline = self.lease_deadline_from(now);
        let renewed = sqlx::query(
            "UPDATE jobs SET lease_expires_at = ?, updated_at = ?
             WHERE job_id = ? AND state = ? AND lease_owner = ?",
        )
        .bind(deadline)
        .bind(now)
        .bind(job_id)
        .bind(JobState::Running)
        .bind(worker_id)
        .execute(&*self.db)
        .await?
        .rows_affected();

        if renewed == 0 {
            self.get_job(job_id).await?;
            return Err(LedgerError::LeaseLost {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }

        Ok(now + chrono::Duration::milliseconds(self.lease_duration.as_millis() as i64))
    }

    /// `running -> succeeded`. Any other starting state is an
    /// `InvalidTransition` and leaves the job untouched.
    pub async fn complete_job(&self, job_id: Uuid, result_object_id: Uuid) -> LedgerResult<JobRecord> {
        self.complete(job_id, None, result_object_id).await
    }

    /// Like [`complete_job`](Self::complete_job), but only while `worker_id`
    /// still holds the lease.
    pub async fn complete_leased_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result_object_id: Uuid,
    ) -> LedgerResult<JobRecord> {
        self.complete(job_id, Some(worker_id), result_object_id).await
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: Option<&str>,
        result_object_id: Uuid,
    ) -> LedgerResult<JobRecord> {
        let completed = sqlx::query_as::<_, JobRecord>(&format!(
            "UPDATE jobs
             SET state = ?, result_object_id = ?, last_error = NULL, lease_owner = NULL,
                 lease_expires_at = NULL, updated_at = ?
             WHERE job_id = ? AND state = ? AND (? IS NULL OR lease_owner = ?)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(JobState::Succeeded)
        .bind(result_object_id)
        .bind(Utc::now())
        .bind(job_id)
        .bind(JobState::Running)
        .bind(worker_id)
        .bind(worker_id)
        .fetch_optional(&*self.db)
        .await?;

        match completed {
            Some(job) => {
                info!(%job_id, attempts = job.attempt_count, "job succeeded");
                Ok(job)
            }
            None => Err(self.rejected(job_id, worker_id, JobState::Succeeded).await),
        }
    }

    /// Record a failed attempt: `running -> queued` while attempts remain,
    /// otherwise `running -> failed`, which is terminal.
    pub async fn fail_job(&self, job_id: Uuid, error: FailureClass) -> LedgerResult<JobRecord> {
        self.fail(job_id, None, error, true).await
    }

    /// Like [`fail_job`](Self::fail_job), but only while `worker_id` still
    /// holds the lease.
    pub async fn fail_leased_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: FailureClass,
    ) -> LedgerResult<JobRecord> {
        self.fail(job_id, Some(worker_id), error, true).await
    }

    /// `running -> failed` regardless of remaining attempts, while
    /// `worker_id` still holds the lease. For failures no retry can fix.
    pub async fn fail_leased_job_permanently(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: FailureClass,
    ) -> LedgerResult<JobRecord> {
        self.fail(job_id, Some(worker_id), error, false).await
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: Option<&str>,
        error: FailureClass,
        retryable: bool,
    ) -> LedgerResult<JobRecord> {
        let failed = sqlx::query_as::<_, JobRecord>(&format!(
            "UPDATE jobs
             SET state = CASE WHEN ? AND attempt_count < ? THEN ? ELSE ? END,
                 last_error = ?, lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
             WHERE job_id = ? AND state = ? AND (? IS NULL OR lease_owner = ?)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(retryable)
        .bind(self.max_attempts)
        .bind(JobState::Queued)
        .bind(JobState::Failed)
        .bind(error.as_str())
        .bind(Utc::now())
        .bind(job_id)
        .bind(JobState::Running)
        .bind(worker_id)
        .bind(worker_id)
        .fetch_optional(&*self.db)
        .await?;

        match failed {
            Some(job) => {
                if job.state == JobState::Failed {
                    warn!(%job_id, attempts = job.attempt_count, error = %error, "job failed permanently");
                } else {
                    info!(%job_id, attempts = job.attempt_count, error = %error, "job re-queued");
                }
                Ok(job)
            }
            None => Err(self.rejected(job_id, worker_id, JobState::Failed).await),
        }
    }

    /// Explain why a guarded transition matched no row.
    async fn rejected(&self, job_id: Uuid, worker_id: Option<&str>, to: JobState) -> LedgerError {
        match self.get_job(job_id).await {
            Ok(job) if job.state == JobState::Running => match worker_id {
                Some(worker_id) => LedgerError::LeaseLost {
                    job_id,
                    worker_id: worker_id.to_string(),
                },
                None => LedgerError::InvalidTransition {
                    job_id,
                    from: job.state,
                    to,
                },
            },
            Ok(job) => LedgerError::InvalidTransition {
                job_id,
                from: job.state,
                to,
            },
            Err(err) => err,
        }
    }

    /// Send every running job whose lease ran out before `now` down the
    /// failure path with `lease_expired`.
    ///
    /// One statement selects and transitions the jobs, so each expiry is
    /// reclaimed exactly once even with several reapers.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> LedgerResult<Vec<JobRecord>> {
        let reclaimed = sqlx::query_as::<_, JobRecord>(&format!(
            "UPDATE jobs
             SET state = CASE WHEN attempt_count < ? THEN ? ELSE ? END,
                 last_error = ?, lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
             WHERE state = ? AND lease_expires_at < ?
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(self.max_attempts)
        .bind(JobState::Queued)
        .bind(JobState::Failed)
        .bind(FailureClass::LeaseExpired.as_str())
        .bind(Utc::now())
        .bind(JobState::Running)
        .bind(now.timestamp_millis())
        .fetch_all(&*self.db)
        .await?;

        for job in &reclaimed {
            warn!(
                job_id = %job.job_id,
                attempts = job.attempt_count,
                state = %job.state,
                "reclaimed job with expired lease"
            );
        }
        Ok(reclaimed)
    }

    /// Count jobs per state.
    pub async fn stats(&self) -> LedgerResult<LedgerStats> {
        let rows: Vec<(JobState, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&*self.db)
                .await?;

        let mut stats = LedgerStats::default();
        for (state, count) in rows {
            match state {
                JobState::Queued => stats.queued = count,
                JobState::Running => stats.running = count,
                JobState::Succeeded => stats.succeeded = count,
                JobState::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, LedgerService) {
        let temp = TempDir::new().unwrap();
        let pool = db::connect_path(&temp.path().join("ledger.db"), 8)
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        (temp, LedgerService::new(Arc::new(pool)))
    }

    #[tokio::test]
    async fn test_claim_empty_ledger() {
        let (_temp, ledger) = setup().await;
        assert!(ledger.claim_next_job("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_marks_running_and_counts_attempt() {
        let (_temp, ledger) = setup().await;
        let source = Uuid::new_v4();
        let job_id = ledger.create_job(source, "alice@example.com").await.unwrap();

        let job = ledger.claim_next_job("w1").await.unwrap().unwrap();
        assert_eq!(job.job_id, job_id);
        assert_eq!(job.source_object_id, source);
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.lease_owner.as_deref(), Some("w1"));
        assert!(job.lease_deadline().unwrap() > Utc::now());

        assert!(ledger.claim_next_job("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let (_temp, ledger) = setup().await;
        ledger.create_job(Uuid::new_v4(), "bob").await.unwrap();

        let mut handles = Vec::new();
        for n in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.claim_next_job(&format!("w{n}")).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_complete_requires_running() {
        let (_temp, ledger) = setup().await;
        let job_id = ledger.create_job(Uuid::new_v4(), "carol").await.unwrap();
        let before = ledger.get_job(job_id).await.unwrap();

        let err = ledger.complete_job(job_id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidTransition { from: JobState::Queued, to: JobState::Succeeded, .. }
        ));

        let after = ledger.get_job(job_id).await.unwrap();
        assert_eq!(after.state, JobState::Queued);
        assert_eq!(after.result_object_id, None);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn test_duplicate_completion_rejected() {
        let (_temp, ledger) = setup().await;
        let job_id = ledger.create_job(Uuid::new_v4(), "dave").await.unwrap();
        ledger.claim_next_job("w1").await.unwrap().unwrap();

        let result = Uuid::new_v4();
        let done = ledger.complete_job(job_id, result).await.unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        assert_eq!(done.result_object_id, Some(result));
        assert_eq!(done.lease_owner, None);

        let err = ledger.complete_job(job_id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidTransition { from: JobState::Succeeded, .. }
        ));
        let err = ledger
            .fail_job(job_id, FailureClass::TranscodeFailed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        assert_eq!(
            ledger.get_job(job_id).await.unwrap().result_object_id,
            Some(result)
        );
    }

    #[tokio::test]
    async fn test_unknown_job_not_found() {
        let (_temp, ledger) = setup().await;
        let missing = Uuid::new_v4();
        assert!(matches!(ledger.get_job(missing).await, Err(LedgerError::NotFound(_))));
        assert!(matches!(
            ledger.complete_job(missing, Uuid::new_v4()).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failures_exhaust_attempts() {
        let (_temp, ledger) = setup().await;
        let ledger = ledger.with_max_attempts(3);
        let job_id = ledger.create_job(Uuid::new_v4(), "erin").await.unwrap();

        for attempt in 1..=3 {
            let job = ledger.claim_next_job("w1").await.unwrap().unwrap();
            assert_eq!(job.attempt_count, attempt);
            let failed = ledger
                .fail_job(job_id, FailureClass::TranscodeFailed)
                .await
                .unwrap();
            if attempt < 3 {
                assert_eq!(failed.state, JobState::Queued);
            } else {
                assert_eq!(failed.state, JobState::Failed);
            }
            assert_eq!(failed.failure_class(), Some(FailureClass::TranscodeFailed));
        }

        assert!(ledger.claim_next_job("w1").await.unwrap().is_none());
        let job = ledger.get_job(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempt_count, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_remaining_attempts() {
        let (_temp, ledger) = setup().await;
        let ledger = ledger.with_max_attempts(3);
        let job_id = ledger.create_job(Uuid::new_v4(), "iris").await.unwrap();
        ledger.claim_next_job("w1").await.unwrap().unwrap();

        assert!(matches!(
            ledger
                .fail_leased_job_permanently(job_id, "w2", FailureClass::IntegrityFailed)
                .await,
            Err(LedgerError::LeaseLost { .. })
        ));

        let failed = ledger
            .fail_leased_job_permanently(job_id, "w1", FailureClass::IntegrityFailed)
            .await
            .unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.failure_class(), Some(FailureClass::IntegrityFailed));
        assert_eq!(failed.lease_owner, None);
        assert!(ledger.claim_next_job("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_reclaimed_once_after_expiry() {
        let (_temp, ledger) = setup().await;
        let ledger = ledger.with_lease_duration(Duration::from_secs(30));
        let job_id = ledger.create_job(Uuid::new_v4(), "frank").await.unwrap();
        ledger.claim_next_job("w1").await.unwrap().unwrap();

        // Fresh lease: nothing to reclaim.
        assert!(ledger.reclaim_expired(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(31);
        let reclaimed = ledger.reclaim_expired(later).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].job_id, job_id);
        assert_eq!(reclaimed[0].state, JobState::Queued);
        assert_eq!(reclaimed[0].failure_class(), Some(FailureClass::LeaseExpired));

        // Same expiry is never reclaimed twice.
        assert!(ledger.reclaim_expired(later).await.unwrap().is_empty());

        // The stale worker can no longer renew or finish.
        assert!(matches!(
            ledger.renew_lease(job_id, "w1").await,
            Err(LedgerError::LeaseLost { .. })
        ));
        assert!(matches!(
            ledger.complete_leased_job(job_id, "w1", Uuid::new_v4()).await,
            Err(LedgerError::InvalidTransition { from: JobState::Queued, .. })
        ));
    }

    #[tokio::test]
    async fn test_renewal_keeps_lease_fresh() {
        let (_temp, ledger) = setup().await;
        let ledger = ledger.with_lease_duration(Duration::from_secs(30));
        let job_id = ledger.create_job(Uuid::new_v4(), "gina").await.unwrap();
        let claimed = ledger.claim_next_job("w1").await.unwrap().unwrap();

        let deadline = ledger.renew_lease(job_id, "w1").await.unwrap();
        assert!(deadline >= claimed.lease_deadline().unwrap());
        assert!(ledger.reclaim_expired(Utc::now()).await.unwrap().is_empty());

        assert!(matches!(
            ledger.renew_lease(job_id, "intruder").await,
            Err(LedgerError::LeaseLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_leased_transitions_reject_other_workers() {
        let (_temp, ledger) = setup().await;
        let job_id = ledger.create_job(Uuid::new_v4(), "hank").await.unwrap();
        ledger.claim_next_job("w1").await.unwrap().unwrap();

        assert!(matches!(
            ledger
                .fail_leased_job(job_id, "w2", FailureClass::StorageFailed)
                .await,
            Err(LedgerError::LeaseLost { .. })
        ));
        let job = ledger.get_job(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Running);

        let done = ledger
            .complete_leased_job(job_id, "w1", Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(done.state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_stats_counts_states() {
        let (_temp, ledger) = setup().await;
        ledger.create_job(Uuid::new_v4(), "a").await.unwrap();
        ledger.create_job(Uuid::new_v4(), "b").await.unwrap();
        let claimed = ledger.claim_next_job("w1").await.unwrap().unwrap();
        ledger.complete_job(claimed.job_id, Uuid::new_v4()).await.unwrap();

        let stats = ledger.stats().await.unwrap();
        assert_eq!(
            stats,
            LedgerStats {
                queued: 1,
                running: 0,
                succeeded: 1,
                failed: 0,
            }
        );
    }
}
