use anyhow::{Context, Result};
use axum::Router;
use media_converter::{
    config::AppConfig,
    db,
    routes::routes::routes,
    services::{
        conversion_service::ConversionService,
        identity::{IdentityDirectory, OpenDirectory, StaticDirectory},
        ledger_service::LedgerService,
        notifier::{LogNotifier, Notifier, NotifyStage},
        storage_service::StorageService,
        transcoder::FfmpegTranscoder,
        worker_pool::WorkerPool,
    },
    state::AppState,
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting media-converter with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let pool_size = (cfg.workers as u32 + 4).max(5);
    let db = Arc::new(db::connect(db_url, pool_size).await?);

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    if !db::schema_present(&db).await? {
        anyhow::bail!("database schema missing; run once with --migrate");
    }

    // --- Initialize core services ---
    let storage = StorageService::new(db.clone(), cfg.storage_dir.clone())
        .with_chunk_size(cfg.chunk_size)
        .with_io_retries(cfg.io_retries);
    let ledger = LedgerService::new(db.clone())
        .with_max_attempts(cfg.max_attempts)
        .with_lease_duration(cfg.lease_duration());

    let identity: Arc<dyn IdentityDirectory> = if cfg.upload_tokens.is_empty() {
        tracing::warn!("No upload tokens configured; uploads are open to anyone");
        Arc::new(OpenDirectory)
    } else {
        let directory = StaticDirectory::from_entries(&cfg.upload_tokens)
            .context("parsing upload tokens")?;
        tracing::info!("Loaded {} upload tokens", directory.len());
        Arc::new(directory)
    };
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    // --- Start conversion workers ---
    let pool = if cfg.workers > 0 {
        let spool_dir = Path::new(&cfg.storage_dir).join("spool");
        fs::create_dir_all(&spool_dir)?;
        let transcoder = FfmpegTranscoder::new(cfg.ffmpeg_path.clone()).with_scratch_dir(spool_dir);
        let conversion = ConversionService::new(
            storage.clone(),
            ledger.clone(),
            Arc::new(transcoder),
            notifier.clone(),
        )
        .with_completion_notice(cfg.notify_stage == NotifyStage::Completed);
        Some(WorkerPool::spawn(conversion, cfg.pool_config()))
    } else {
        tracing::info!("No conversion workers configured; serving gateways only");
        None
    };

    // --- Build router ---
    let state = AppState::new(storage, ledger, identity, notifier, cfg.notify_stage);
    let app: Router = routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
