use crate::services::{
    notifier::NotifyStage,
    storage_service::{DEFAULT_CHUNK_SIZE, DEFAULT_IO_RETRIES, MAX_IO_RETRIES},
    worker_pool::WorkerPoolConfig,
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, fmt::Display, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub chunk_size: usize,
    pub io_retries: u32,
    pub workers: usize,
    pub max_attempts: i64,
    pub lease_secs: u64,
    pub poll_interval_ms: u64,
    pub maintenance_interval_secs: u64,
    pub orphan_age_secs: u64,
    pub ffmpeg_path: String,
    pub notify_stage: NotifyStage,
    /// `token=recipient` entries. Empty means uploads are open.
    pub upload_tokens: Vec<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Video to audio conversion service")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_CONVERTER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_CONVERTER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where chunk payloads are stored (overrides MEDIA_CONVERTER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides MEDIA_CONVERTER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Chunk size in bytes (overrides MEDIA_CONVERTER_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Local retries for transient storage errors (overrides MEDIA_CONVERTER_IO_RETRIES)
    #[arg(long)]
    pub io_retries: Option<u32>,

    /// Conversion workers; 0 runs gateways only (overrides MEDIA_CONVERTER_WORKERS)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Attempts before a job fails terminally (overrides MEDIA_CONVERTER_MAX_ATTEMPTS)
    #[arg(long)]
    pub max_attempts: Option<i64>,

    /// Lease duration in seconds (overrides MEDIA_CONVERTER_LEASE_SECS)
    #[arg(long)]
    pub lease_secs: Option<u64>,

    /// Idle worker poll interval in ms (overrides MEDIA_CONVERTER_POLL_INTERVAL_MS)
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Lease reaper / orphan janitor period in seconds (overrides MEDIA_CONVERTER_MAINTENANCE_INTERVAL_SECS)
    #[arg(long)]
    pub maintenance_interval_secs: Option<u64>,

    /// Age after which unfinished objects are reaped (overrides MEDIA_CONVERTER_ORPHAN_AGE_SECS)
    #[arg(long)]
    pub orphan_age_secs: Option<u64>,

    /// ffmpeg binary (overrides MEDIA_CONVERTER_FFMPEG_PATH)
    #[arg(long)]
    pub ffmpeg_path: Option<String>,

    /// Who sends the ready notification (overrides MEDIA_CONVERTER_NOTIFY_STAGE)
    #[arg(long, value_enum)]
    pub notify_stage: Option<NotifyStage>,

    /// Upload token as `token=recipient`; repeatable (overrides MEDIA_CONVERTER_UPLOAD_TOKENS, comma separated)
    #[arg(long = "upload-token")]
    pub upload_tokens: Vec<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `name` from the environment, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::from_args(Args::parse())
    }

    /// Merge already parsed CLI args over the environment.
    pub fn from_args(args: Args) -> Result<(Self, bool)> {
        // --- Environment fallback ---
        let env_host = env_or("MEDIA_CONVERTER_HOST", "0.0.0.0".to_string())?;
        let env_port = env_or("MEDIA_CONVERTER_PORT", 3000u16)?;
        let env_storage = env_or("MEDIA_CONVERTER_STORAGE_DIR", "./data/chunks".to_string())?;
        let env_db = env_or(
            "MEDIA_CONVERTER_DATABASE_URL",
            "sqlite://./data/meta/media_converter.db".to_string(),
        )?;
        let env_chunk_size = env_or("MEDIA_CONVERTER_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        let env_io_retries = env_or("MEDIA_CONVERTER_IO_RETRIES", DEFAULT_IO_RETRIES)?;
        let env_workers = env_or("MEDIA_CONVERTER_WORKERS", 2usize)?;
        let env_max_attempts = env_or("MEDIA_CONVERTER_MAX_ATTEMPTS", 3i64)?;
        let env_lease = env_or("MEDIA_CONVERTER_LEASE_SECS", 60u64)?;
        let env_poll = env_or("MEDIA_CONVERTER_POLL_INTERVAL_MS", 500u64)?;
        let env_maintenance = env_or("MEDIA_CONVERTER_MAINTENANCE_INTERVAL_SECS", 30u64)?;
        let env_orphan_age = env_or("MEDIA_CONVERTER_ORPHAN_AGE_SECS", 3600u64)?;
        let env_ffmpeg = env_or("MEDIA_CONVERTER_FFMPEG_PATH", "ffmpeg".to_string())?;
        let env_notify_stage = match env::var("MEDIA_CONVERTER_NOTIFY_STAGE") {
            Ok(value) => <NotifyStage as ValueEnum>::from_str(value.trim(), true)
                .map_err(|err| anyhow::anyhow!(err))
                .with_context(|| {
                    format!("parsing MEDIA_CONVERTER_NOTIFY_STAGE value `{}`", value)
                })?,
            Err(_) => NotifyStage::default(),
        };
        let env_tokens = env::var("MEDIA_CONVERTER_UPLOAD_TOKENS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            chunk_size: args.chunk_size.unwrap_or(env_chunk_size),
            io_retries: args.io_retries.unwrap_or(env_io_retries),
            workers: args.workers.unwrap_or(env_workers),
            max_attempts: args.max_attempts.unwrap_or(env_max_attempts),
            lease_secs: args.lease_secs.unwrap_or(env_lease),
            poll_interval_ms: args.poll_interval_ms.unwrap_or(env_poll),
            maintenance_interval_secs: args
                .maintenance_interval_secs
                .unwrap_or(env_maintenance),
            orphan_age_secs: args.orphan_age_secs.unwrap_or(env_orphan_age),
            ffmpeg_path: args.ffmpeg_path.unwrap_or(env_ffmpeg),
            notify_stage: args.notify_stage.unwrap_or(env_notify_stage),
            upload_tokens: if args.upload_tokens.is_empty() {
                env_tokens
            } else {
                args.upload_tokens
            },
        };

        if cfg.chunk_size == 0 {
            anyhow::bail!("chunk size must be positive");
        }
        if cfg.lease_secs == 0 {
            anyhow::bail!("lease duration must be positive");
        }
        if cfg.io_retries > MAX_IO_RETRIES {
            anyhow::bail!("io retries must be at most {}", MAX_IO_RETRIES);
        }

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            maintenance_interval: Duration::from_secs(self.maintenance_interval_secs),
            orphan_age: Duration::from_secs(self.orphan_age_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_args_override_defaults() {
        let args = Args::try_parse_from([
            "media-converter",
            "--port",
            "8081",
            "--workers",
            "4",
            "--notify-stage",
            "submitted",
            "--upload-token",
            "abc=alice",
            "--upload-token",
            "def=bob",
            "--migrate",
        ])
        .unwrap();

        let (cfg, migrate) = AppConfig::from_args(args).unwrap();
        assert!(migrate);
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.notify_stage, NotifyStage::Submitted);
        assert_eq!(cfg.upload_tokens, vec!["abc=alice", "def=bob"]);
        assert_eq!(cfg.pool_config().workers, 4);
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        let args = Args {
            chunk_size: Some(0),
            ..Args::default()
        };
        assert!(AppConfig::from_args(args).is_err());
    }

    #[test]
    fn test_io_retries_are_bounded() {
        let args = Args {
            io_retries: Some(MAX_IO_RETRIES + 1),
            ..Args::default()
        };
        assert!(AppConfig::from_args(args).is_err());

        let args = Args {
            io_retries: Some(MAX_IO_RETRIES),
            ..Args::default()
        };
        let (cfg, _) = AppConfig::from_args(args).unwrap();
        assert_eq!(cfg.io_retries, MAX_IO_RETRIES);
    }
}
