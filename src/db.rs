//! SQLite connection setup and the embedded schema.

use anyhow::{Context, Result};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use std::{path::Path, str::FromStr, time::Duration};

const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Open a pool for `database_url`, creating the file if needed.
///
/// WAL mode plus a busy timeout lets concurrent writers (workers claiming
/// jobs, gateways writing chunks) queue inside SQLite instead of failing.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url `{}`", database_url))?;
    open(options, max_connections).await
}

/// Same as [`connect`] for a plain file path.
pub async fn connect_path(path: &Path, max_connections: u32) -> Result<SqlitePool> {
    open(SqliteConnectOptions::new().filename(path), max_connections).await
}

async fn open(options: SqliteConnectOptions, max_connections: u32) -> Result<SqlitePool> {
    let options = options
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .context("opening SQLite pool")?;
    Ok(pool)
}

/// Create the object namespaces and the job ledger if they do not exist.
///
/// Every statement is `IF NOT EXISTS`, so this is safe to run repeatedly.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt)
            .execute(db)
            .await
            .with_context(|| format!("executing migration statement: {}", stmt))?;
    }

    Ok(())
}

/// Check that the schema created by [`run_migrations`] is present.
pub async fn schema_present(db: &SqlitePool) -> Result<bool> {
    let tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master
         WHERE type = 'table' AND name IN ('objects', 'chunks', 'jobs')",
    )
    .fetch_one(db)
    .await?;
    Ok(tables == 3)
}
