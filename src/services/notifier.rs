//! Delivery of "your audio is ready" messages.

use async_trait::async_trait;
use clap::ValueEnum;
use tracing::info;
use uuid::Uuid;

/// Which component sends the notification for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum NotifyStage {
    /// The ingest gateway, right after the job is queued.
    Submitted,
    /// The worker, once the job has succeeded.
    #[default]
    Completed,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Tell `recipient` that `job_id` can be fetched.
    async fn notify(&self, recipient: &str, job_id: Uuid) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipient: &str, job_id: Uuid) -> anyhow::Result<()> {
        info!(%recipient, fid = %job_id, "audio ready for download");
        Ok(())
    }
}
