//! Represents a conversion job tracked by the ledger.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Job lifecycle: `Queued -> Running -> {Succeeded | Failed}`, with
/// `Running -> Queued` for retries. `Succeeded` is terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse reason a conversion attempt failed.
///
/// This is all the ledger records and all a client ever sees; detailed
/// diagnostics stay in the logs.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    SourceUnavailable,
    TranscodeFailed,
    StorageFailed,
    IntegrityFailed,
    LeaseExpired,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::SourceUnavailable => "source_unavailable",
            FailureClass::TranscodeFailed => "transcode_failed",
            FailureClass::StorageFailed => "storage_failed",
            FailureClass::IntegrityFailed => "integrity_failed",
            FailureClass::LeaseExpired => "lease_expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "source_unavailable" => Some(FailureClass::SourceUnavailable),
            "transcode_failed" => Some(FailureClass::TranscodeFailed),
            "storage_failed" => Some(FailureClass::StorageFailed),
            "integrity_failed" => Some(FailureClass::IntegrityFailed),
            "lease_expired" => Some(FailureClass::LeaseExpired),
            _ => None,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conversion job. `job_id` is the FID handed to the client.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct JobRecord {
    pub job_id: Uuid,

    /// Video object being converted. Internal; never shown to clients.
    pub source_object_id: Uuid,

    /// Audio object produced. Set iff `state` is `Succeeded`.
    pub result_object_id: Option<Uuid>,

    /// Uploader to notify once the FID is ready.
    pub recipient: String,

    pub state: JobState,

    /// Number of times the job has been claimed.
    pub attempt_count: i64,

    /// Coarse failure class of the last failed attempt.
    pub last_error: Option<String>,

    /// Worker currently holding the lease, while `Running`.
    pub lease_owner: Option<String>,

    /// Lease deadline in unix milliseconds, while `Running`.
    pub lease_expires_at: Option<i64>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn lease_deadline(&self) -> Option<DateTime<Utc>> {
        self.lease_expires_at
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    pub fn failure_class(&self) -> Option<FailureClass> {
        self.last_error.as_deref().and_then(FailureClass::parse)
    }
}
