pub mod conversion_service;
pub mod download_service;
pub mod identity;
pub mod ingest_service;
pub mod ledger_service;
pub mod notifier;
pub mod storage_service;
pub mod transcoder;
pub mod worker_pool;
