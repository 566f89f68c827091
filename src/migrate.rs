//! Database lifecycle: open the collector store and migrate its schema.
//!
//! [`open`] is the single entry point every caller uses — it prepares the
//! SQLite file for concurrent collector writers (WAL journal, enforced
//! foreign keys, a busy timeout sized for overlapping indexing batches)
//! and brings the schema up to date before handing out the pool. All
//! migrations are idempotent `CREATE … IF NOT EXISTS` statements, so
//! `kc init` and a cold server start share the same path.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Writers from several indexing tasks share this pool.
const MAX_CONNECTIONS: u32 = 8;
/// How long a batch write waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (creating if missing) and migrate the collector database.
pub async fn open(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Cursor store: per-source sync pointers
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cursors (
            source TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-document content hashes
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS doc_hashes (
            source TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            hash TEXT NOT NULL,
            PRIMARY KEY (source, doc_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-source job status
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_status (
            source TEXT PRIMARY KEY,
            data TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Advisory TTL locks
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS locks (
            source TEXT PRIMARY KEY,
            token TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Persisted per-source filter settings and enabled flags
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_settings (
            source TEXT PRIMARY KEY,
            settings TEXT,
            enabled INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Analytics: bounded run history
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS indexing_runs (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            started_at TEXT NOT NULL,
            status TEXT NOT NULL,
            data TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Analytics: aggregate per-source stats
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_stats (
            source TEXT PRIMARY KEY,
            data TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Analytics: per-day counters with expiry
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS daily_stats (
            source TEXT NOT NULL,
            date TEXT NOT NULL,
            runs INTEGER NOT NULL DEFAULT 0,
            documents INTEGER NOT NULL DEFAULT 0,
            errors INTEGER NOT NULL DEFAULT 0,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (source, date)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vector store: one row per stored chunk
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            content_hash TEXT NOT NULL,
            embedding BLOB,
            parent_doc_id TEXT,
            chunk_index INTEGER,
            created_at_ts INTEGER,
            updated_at_ts INTEGER,
            PRIMARY KEY (collection, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_source_started ON indexing_runs(source, started_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_parent ON chunks(collection, parent_doc_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_created_ts ON chunks(collection, created_at_ts)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_hashes_source ON doc_hashes(source)")
        .execute(pool)
        .await?;

    Ok(())
}
