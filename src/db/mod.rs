//! Relational metadata: blob ledger, experiment registry and snapshot rows.
//!
//! Functions take a `&SqlitePool` or, where they must join a caller's
//! transaction, a `&mut SqliteConnection`.

pub mod experiments;
pub mod ledger;
pub mod snapshots;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::SnapshotError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS blobs (
    hash            TEXT PRIMARY KEY NOT NULL,
    size            INTEGER NOT NULL CHECK (size >= 0),
    reference_count INTEGER NOT NULL DEFAULT 0 CHECK (reference_count >= 0),
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS experiments (
    id         TEXT PRIMARY KEY NOT NULL,
    name       TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshots (
    id            TEXT PRIMARY KEY NOT NULL,
    experiment_id TEXT NOT NULL REFERENCES experiments (id),
    manifest      TEXT NOT NULL,
    file_count    INTEGER NOT NULL,
    total_size    INTEGER NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_experiment
    ON snapshots (experiment_id, created_at);
"#;

/// Opens the ledger database and creates any missing tables.
pub async fn connect(
    database_url: &str,
    max_connections: u32,
) -> Result<SqlitePool, SnapshotError> {
    let opts = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(opts)
        .await?;

    migrate(&pool).await?;
    info!("Ledger database ready at {}", database_url);
    Ok(pool)
}

/// Creates the schema if absent. Safe to run on every startup.
pub async fn migrate(pool: &SqlitePool) -> Result<(), SnapshotError> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

/// Splits bind lists to stay under SQLite's host parameter limit.
pub(crate) const BIND_CHUNK: usize = 500;

#[cfg(test)]
pub(crate) async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
    let pool = connect(&url, 4).await.unwrap();
    (dir, pool)
}
