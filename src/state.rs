//! Shared state handed to every HTTP handler.

use crate::services::{
    download_service::DownloadService,
    identity::IdentityDirectory,
    ingest_service::IngestService,
    ledger_service::LedgerService,
    notifier::{Notifier, NotifyStage},
    storage_service::StorageService,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub ledger: LedgerService,
    pub ingest: IngestService,
    pub download: DownloadService,
    pub identity: Arc<dyn IdentityDirectory>,
}

impl AppState {
    /// Build both gateways over the same store and ledger.
    pub fn new(
        storage: StorageService,
        ledger: LedgerService,
        identity: Arc<dyn IdentityDirectory>,
        notifier: Arc<dyn Notifier>,
        notify_stage: NotifyStage,
    ) -> Self {
        let ingest = IngestService::new(storage.clone(), ledger.clone(), notifier, notify_stage);
        let download = DownloadService::new(storage.clone(), ledger.clone());
        Self {
            storage,
            ledger,
            ingest,
            download,
            identity,
        }
    }
}
