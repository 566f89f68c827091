//! Persistent cursor, hash, lock, and job-status store.
//!
//! Backed by the shared SQLite pool. The indexing engine is the sole writer
//! of cursors, hashes, locks, and statuses; everything else reads.
//!
//! Locks are advisory TTL locks: they prevent overlapping runs for a source
//! when no workflow runtime is enforcing single-run semantics.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{Cursor, IndexStatus, Source};

#[derive(Clone)]
pub struct CursorStore {
    pool: SqlitePool,
}

impl CursorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ============ Cursors ============

    pub async fn get_cursor(&self, source: Source) -> Result<Option<Cursor>> {
        let row: Option<String> = sqlx::query_scalar("SELECT data FROM cursors WHERE source = ?")
            .bind(source.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn save_cursor(&self, source: Source, cursor: &Cursor) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO cursors (source, data, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at
            "#,
        )
        .bind(source.as_str())
        .bind(serde_json::to_string(cursor)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_cursor(&self, source: Source) -> Result<()> {
        sqlx::query("DELETE FROM cursors WHERE source = ?")
            .bind(source.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ============ Status ============

    pub async fn get_status(&self, source: Source) -> Result<IndexStatus> {
        let row: Option<String> =
            sqlx::query_scalar("SELECT data FROM index_status WHERE source = ?")
                .bind(source.as_str())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(IndexStatus::idle(source)),
        }
    }

    pub async fn save_status(&self, status: &IndexStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO index_status (source, data) VALUES (?, ?)
            ON CONFLICT(source) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(status.source.as_str())
        .bind(serde_json::to_string(status)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn all_status(&self, sources: &[Source]) -> Result<Vec<IndexStatus>> {
        let mut out = Vec::with_capacity(sources.len());
        for &source in sources {
            out.push(self.get_status(source).await?);
        }
        Ok(out)
    }

    pub async fn reset_status(&self, source: Source) -> Result<()> {
        sqlx::query("DELETE FROM index_status WHERE source = ?")
            .bind(source.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ============ Locks ============

    /// Try to take the per-source lock. Returns `true` on success; at most
    /// one holder exists within the TTL window.
    pub async fn acquire_lock(&self, source: Source, ttl: Duration) -> Result<bool> {
        let now = chrono::Utc::now().timestamp_millis();
        let expires = now + ttl.as_millis() as i64;
        let token = Uuid::new_v4().to_string();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM locks WHERE source = ? AND expires_at <= ?")
            .bind(source.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO locks (source, token, expires_at) VALUES (?, ?, ?)",
        )
        .bind(source.as_str())
        .bind(&token)
        .bind(expires)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn release_lock(&self, source: Source) -> Result<()> {
        sqlx::query("DELETE FROM locks WHERE source = ?")
            .bind(source.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ============ Document hashes ============

    /// Fetch stored hashes for `ids`, preserving input order.
    pub async fn bulk_get_hashes(
        &self,
        source: Source,
        ids: &[String],
    ) -> Result<Vec<Option<String>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut found: HashMap<String, String> = HashMap::with_capacity(ids.len());
        // SQLite caps bound parameters; chunk the IN list.
        for batch in ids.chunks(500) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT doc_id, hash FROM doc_hashes WHERE source = ? AND doc_id IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql).bind(source.as_str());
            for id in batch {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                found.insert(row.get("doc_id"), row.get("hash"));
            }
        }

        Ok(ids.iter().map(|id| found.get(id).cloned()).collect())
    }

    /// Store hashes for many documents atomically.
    pub async fn bulk_set_hashes(&self, source: Source, hashes: &[(String, String)]) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for (doc_id, hash) in hashes {
            sqlx::query(
                r#"
                INSERT INTO doc_hashes (source, doc_id, hash) VALUES (?, ?, ?)
                ON CONFLICT(source, doc_id) DO UPDATE SET hash = excluded.hash
                "#,
            )
            .bind(source.as_str())
            .bind(doc_id)
            .bind(hash)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Remove the hash for `id` and for any of its chunk ids.
    pub async fn remove_hashes(&self, source: Source, id: &str) -> Result<()> {
        let chunk_pattern = format!("{}\\_chunk\\_%", id.replace('\\', "\\\\"));
        sqlx::query(
            r#"
            DELETE FROM doc_hashes
            WHERE source = ? AND (doc_id = ? OR doc_id LIKE ? ESCAPE '\')
            "#,
        )
        .bind(source.as_str())
        .bind(id)
        .bind(&chunk_pattern)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============ Persisted settings ============

    pub async fn get_settings(&self, source: Source) -> Result<Option<serde_json::Value>> {
        let row: Option<Option<String>> =
            sqlx::query_scalar("SELECT settings FROM source_settings WHERE source = ?")
                .bind(source.as_str())
                .fetch_optional(&self.pool)
                .await?;

        match row.flatten() {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn save_settings(&self, source: Source, settings: &serde_json::Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source_settings (source, settings, enabled) VALUES (?, ?, 1)
            ON CONFLICT(source) DO UPDATE SET settings = excluded.settings
            "#,
        )
        .bind(source.as_str())
        .bind(serde_json::to_string(settings)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_enabled(&self, source: Source) -> Result<bool> {
        let row: Option<i64> =
            sqlx::query_scalar("SELECT enabled FROM source_settings WHERE source = ?")
                .bind(source.as_str())
                .fetch_optional(&self.pool)
                .await?;
        // Sources are enabled until explicitly disabled.
        Ok(row.map(|v| v != 0).unwrap_or(true))
    }

    pub async fn set_enabled(&self, source: Source, enabled: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source_settings (source, settings, enabled) VALUES (?, NULL, ?)
            ON CONFLICT(source) DO UPDATE SET enabled = excluded.enabled
            "#,
        )
        .bind(source.as_str())
        .bind(enabled as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobState;

    async fn test_store() -> (tempfile::TempDir, CursorStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::migrate::open(&tmp.path().join("kc.sqlite")).await.unwrap();
        (tmp, CursorStore::new(pool))
    }

    #[tokio::test]
    async fn cursor_round_trip() {
        let (_tmp, store) = test_store().await;

        assert!(store.get_cursor(Source::Jira).await.unwrap().is_none());

        let mut cursor = Cursor::default();
        cursor.last_sync = Some("2024-06-01T00:00:00Z".to_string());
        cursor.sync_token = Some("p2".to_string());
        cursor
            .metadata
            .insert("configKey".to_string(), "jira:all".to_string());

        store.save_cursor(Source::Jira, &cursor).await.unwrap();
        let loaded = store.get_cursor(Source::Jira).await.unwrap().unwrap();
        assert_eq!(loaded.last_sync.as_deref(), Some("2024-06-01T00:00:00Z"));
        assert_eq!(loaded.sync_token.as_deref(), Some("p2"));
        assert_eq!(loaded.config_key(), Some("jira:all"));

        store.reset_cursor(Source::Jira).await.unwrap();
        assert!(store.get_cursor(Source::Jira).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_defaults_to_idle() {
        let (_tmp, store) = test_store().await;
        let status = store.get_status(Source::Slack).await.unwrap();
        assert_eq!(status.status, JobState::Idle);
        assert_eq!(status.documents_indexed, 0);
    }

    #[tokio::test]
    async fn lock_is_exclusive() {
        let (_tmp, store) = test_store().await;
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lock(Source::Gmail, ttl).await.unwrap());
        assert!(!store.acquire_lock(Source::Gmail, ttl).await.unwrap());

        store.release_lock(Source::Gmail).await.unwrap();
        assert!(store.acquire_lock(Source::Gmail, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_is_reacquirable() {
        let (_tmp, store) = test_store().await;
        assert!(store
            .acquire_lock(Source::Drive, Duration::from_millis(0))
            .await
            .unwrap());
        // TTL of zero is already expired.
        assert!(store
            .acquire_lock(Source::Drive, Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn bulk_hashes_preserve_order() {
        let (_tmp, store) = test_store().await;

        store
            .bulk_set_hashes(
                Source::Jira,
                &[
                    ("a".to_string(), "h1".to_string()),
                    ("c".to_string(), "h3".to_string()),
                ],
            )
            .await
            .unwrap();

        let hashes = store
            .bulk_get_hashes(
                Source::Jira,
                &["a".to_string(), "b".to_string(), "c".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(
            hashes,
            vec![Some("h1".to_string()), None, Some("h3".to_string())]
        );
    }

    #[tokio::test]
    async fn remove_hashes_covers_chunk_ids() {
        let (_tmp, store) = test_store().await;

        store
            .bulk_set_hashes(
                Source::Drive,
                &[
                    ("doc1".to_string(), "h".to_string()),
                    ("doc1_chunk_0".to_string(), "h0".to_string()),
                    ("doc1_chunk_1".to_string(), "h1".to_string()),
                    ("doc2".to_string(), "x".to_string()),
                ],
            )
            .await
            .unwrap();

        store.remove_hashes(Source::Drive, "doc1").await.unwrap();

        let hashes = store
            .bulk_get_hashes(
                Source::Drive,
                &[
                    "doc1".to_string(),
                    "doc1_chunk_0".to_string(),
                    "doc1_chunk_1".to_string(),
                    "doc2".to_string(),
                ],
            )
            .await
            .unwrap();
        assert_eq!(hashes, vec![None, None, None, Some("x".to_string())]);
    }

    #[tokio::test]
    async fn enabled_flag_defaults_true() {
        let (_tmp, store) = test_store().await;
        assert!(store.is_enabled(Source::Github).await.unwrap());
        store.set_enabled(Source::Github, false).await.unwrap();
        assert!(!store.is_enabled(Source::Github).await.unwrap());
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let (_tmp, store) = test_store().await;
        let settings = serde_json::json!({ "projectKeys": ["ENG", "OPS"] });
        store.save_settings(Source::Jira, &settings).await.unwrap();
        assert_eq!(
            store.get_settings(Source::Jira).await.unwrap(),
            Some(settings)
        );
    }
}
