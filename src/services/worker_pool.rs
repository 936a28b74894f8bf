//! Background tasks: the conversion worker pool and the maintenance loop
//! that reclaims expired leases and reaps orphaned objects.
//!
//! Shutdown: [`WorkerPool::shutdown`] cancels every task and waits for them.
//! A conversion interrupted this way keeps its lease until it expires, then
//! the job is reclaimed like any crashed attempt.

use crate::services::{
    conversion_service::{ConversionService, Outcome},
    ledger_service::LedgerService,
    storage_service::StorageService,
};
use chrono::Utc;
use std::time::Duration;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent conversion workers.
    pub workers: usize,
    /// Idle delay before polling the ledger again.
    pub poll_interval: Duration,
    /// Period of the lease reaper and orphan janitor. Zero disables them.
    pub maintenance_interval: Duration,
    /// `writing` objects untouched for this long are deleted.
    pub orphan_age: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(500),
            maintenance_interval: Duration::from_secs(30),
            orphan_age: Duration::from_secs(3600),
        }
    }
}

/// Handle to the running background tasks.
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.workers` conversion workers plus the maintenance loop.
    pub fn spawn(service: ConversionService, config: WorkerPoolConfig) -> Self {
        let cancel = CancellationToken::new();
        let instance = Uuid::new_v4().simple().to_string();
        let mut handles = Vec::with_capacity(config.workers + 1);

        for index in 0..config.workers {
            let worker_id = format!("worker-{}-{}", &instance[..8], index);
            handles.push(tokio::spawn(run_worker(
                service.clone(),
                worker_id,
                config.poll_interval,
                cancel.clone(),
            )));
        }

        if !config.maintenance_interval.is_zero() {
            handles.push(tokio::spawn(run_maintenance(
                service.ledger().clone(),
                service.storage().clone(),
                config.maintenance_interval,
                config.orphan_age,
                cancel.clone(),
            )));
        }

        info!(
            workers = config.workers,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            maintenance_interval_secs = config.maintenance_interval.as_secs(),
            "conversion worker pool started"
        );
        Self { cancel, handles }
    }

    /// Stop all tasks and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "pool task panicked");
            }
        }
        info!("conversion worker pool stopped");
    }
}

async fn run_worker(
    service: ConversionService,
    worker_id: String,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    debug!(%worker_id, "worker started");
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = service.process_next(&worker_id) => outcome,
        };

        match outcome {
            Ok(Outcome::Idle) => {}
            // More work may be waiting; look again right away.
            Ok(_) => continue,
            Err(err) => error!(%worker_id, error = %err, "failed to claim or record job"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    debug!(%worker_id, "worker stopped");
}

/// One maintenance pass: reclaim expired leases, then delete `writing`
/// objects older than `orphan_age`.
pub async fn run_maintenance_once(
    ledger: &LedgerService,
    storage: &StorageService,
    orphan_age: Duration,
) {
    match ledger.reclaim_expired(Utc::now()).await {
        Ok(reclaimed) if !reclaimed.is_empty() => {
            info!(count = reclaimed.len(), "reclaimed expired leases")
        }
        Ok(_) => {}
        Err(err) => error!(error = %err, "lease reaper failed"),
    }

    let cutoff = match chrono::Duration::from_std(orphan_age) {
        Ok(age) => Utc::now() - age,
        Err(err) => {
            error!(error = %err, "orphan age out of range");
            return;
        }
    };
    match storage.reap_orphans(cutoff).await {
        Ok(0) => {}
        Ok(reaped) => info!(count = reaped, "reaped orphaned objects"),
        Err(err) => error!(error = %err, "orphan janitor failed"),
    }
}

async fn run_maintenance(
    ledger: LedgerService,
    storage: StorageService,
    period: Duration,
    orphan_age: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => run_maintenance_once(&ledger, &storage, orphan_age).await,
        }
    }
}
