//! Content-addressed chunk store with embeddings.
//!
//! One collection per source (`collector_{source}`), one row per stored
//! chunk. The stored content is a context header plus the chunk text — the
//! same string that gets embedded and substring-matched by keyword search.
//! The raw chunk's SHA-256 (`_contentHash`) decides whether an upsert needs
//! re-embedding: unchanged chunks take a metadata-only update path that
//! issues zero embedding calls.
//!
//! Timestamp metadata (`createdAt`/`updatedAt`) is mirrored into numeric
//! `…Ts` fields (milliseconds since epoch) so date ranges can filter.
//!
//! Vector queries are a brute-force cosine scan over the collection, the
//! same trade-off the rest of the pipeline makes: correct and simple, with
//! ANN indexing left as a future swap-in.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::chunker::{self, ChunkOptions};
use crate::config::EmbeddingConfig;
use crate::embedding;
use crate::models::{parse_timestamp_ms, Document, MetaValue, Metadata, Source};

/// Display copy of a chunk is capped at this many characters.
const ORIGINAL_CONTENT_MAX: usize = 8000;
/// Row batch size for prefetch and writes.
const BATCH_SIZE: usize = 100;

/// A chunk as stored in (and read back from) a collection.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: String,
    pub collection: String,
    /// Context header + chunk text; the embedded/matched string.
    pub content: String,
    pub metadata: Metadata,
    pub embedding: Option<Vec<f32>>,
}

impl StoredChunk {
    pub fn parent_doc_id(&self) -> Option<&str> {
        self.metadata.get("parentDocId").and_then(|v| v.as_str())
    }
}

/// Counters returned by [`VectorStore::upsert_documents`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    /// Chunks embedded and fully rewritten.
    pub embedded: usize,
    /// Chunks whose hash matched: metadata refreshed, embedding untouched.
    pub metadata_only: usize,
}

#[derive(Clone)]
pub struct VectorStore {
    pool: SqlitePool,
    embedding: EmbeddingConfig,
}

struct PreparedChunk {
    id: String,
    content: String,
    metadata: Metadata,
    content_hash: String,
}

impl VectorStore {
    pub fn new(pool: SqlitePool, embedding: EmbeddingConfig) -> Self {
        Self { pool, embedding }
    }

    // ============ Upsert pipeline ============

    /// Upsert a batch of documents into the source's collection.
    ///
    /// Unchanged chunks (by `_contentHash`) get a metadata-only update and
    /// are never re-embedded.
    pub async fn upsert_documents(
        &self,
        source: Source,
        documents: &[Document],
    ) -> Result<UpsertStats> {
        let collection = source.collection();

        let mut prepared: Vec<PreparedChunk> = Vec::new();
        for doc in documents {
            let chunks = prepare_document(doc);
            self.cleanup_excess_chunks(&collection, &doc.id, chunks.len())
                .await?;
            prepared.extend(chunks);
        }
        if prepared.is_empty() {
            return Ok(UpsertStats::default());
        }

        // Prefetch current hashes to split embed-upsert from metadata-only.
        let ids: Vec<String> = prepared.iter().map(|c| c.id.clone()).collect();
        let existing = self.fetch_hashes(&collection, &ids).await?;

        let mut upsert_items: Vec<&PreparedChunk> = Vec::new();
        let mut update_items: Vec<&PreparedChunk> = Vec::new();
        for chunk in &prepared {
            match existing.get(&chunk.id) {
                Some(hash) if *hash == chunk.content_hash => update_items.push(chunk),
                _ => upsert_items.push(chunk),
            }
        }

        // One embedding pass covers every changed chunk.
        let texts: Vec<String> = upsert_items.iter().map(|c| c.content.clone()).collect();
        let vectors = embedding::embed_texts(&self.embedding, &texts).await?;

        let mut tx = self.pool.begin().await?;
        for (chunk, vector) in upsert_items.iter().zip(vectors.iter()) {
            let (created_ts, updated_ts) = timestamp_columns(&chunk.metadata);
            sqlx::query(
                r#"
                INSERT INTO chunks
                    (collection, id, content, metadata_json, content_hash, embedding,
                     parent_doc_id, chunk_index, created_at_ts, updated_at_ts)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    content = excluded.content,
                    metadata_json = excluded.metadata_json,
                    content_hash = excluded.content_hash,
                    embedding = excluded.embedding,
                    parent_doc_id = excluded.parent_doc_id,
                    chunk_index = excluded.chunk_index,
                    created_at_ts = excluded.created_at_ts,
                    updated_at_ts = excluded.updated_at_ts
                "#,
            )
            .bind(&collection)
            .bind(&chunk.id)
            .bind(&chunk.content)
            .bind(serde_json::to_string(&chunk.metadata)?)
            .bind(&chunk.content_hash)
            .bind(embedding::vec_to_blob(vector))
            .bind(chunk.metadata.get("parentDocId").and_then(|v| v.as_str()))
            .bind(
                chunk
                    .metadata
                    .get("chunkIndex")
                    .and_then(|v| v.as_f64())
                    .map(|n| n as i64),
            )
            .bind(created_ts)
            .bind(updated_ts)
            .execute(&mut *tx)
            .await?;
        }

        for chunk in &update_items {
            let (created_ts, updated_ts) = timestamp_columns(&chunk.metadata);
            sqlx::query(
                r#"
                UPDATE chunks SET metadata_json = ?, created_at_ts = ?, updated_at_ts = ?
                WHERE collection = ? AND id = ?
                "#,
            )
            .bind(serde_json::to_string(&chunk.metadata)?)
            .bind(created_ts)
            .bind(updated_ts)
            .bind(&collection)
            .bind(&chunk.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(UpsertStats {
            embedded: upsert_items.len(),
            metadata_only: update_items.len(),
        })
    }

    /// Drop chunk rows beyond the document's current chunk count, so a
    /// re-chunked document leaves no tail behind.
    async fn cleanup_excess_chunks(
        &self,
        collection: &str,
        doc_id: &str,
        total: usize,
    ) -> Result<()> {
        if total > 1 {
            sqlx::query(
                "DELETE FROM chunks WHERE collection = ? AND parent_doc_id = ? AND chunk_index >= ?",
            )
            .bind(collection)
            .bind(doc_id)
            .bind(total as i64)
            .execute(&self.pool)
            .await?;
            // A document that grew from a single row into chunked form.
            sqlx::query("DELETE FROM chunks WHERE collection = ? AND id = ? AND parent_doc_id IS NULL")
                .bind(collection)
                .bind(doc_id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("DELETE FROM chunks WHERE collection = ? AND parent_doc_id = ?")
                .bind(collection)
                .bind(doc_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn fetch_hashes(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<HashMap<String, String>> {
        let mut out = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(BATCH_SIZE) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT id, content_hash FROM chunks WHERE collection = ? AND id IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql).bind(collection);
            for id in batch {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                out.insert(row.get("id"), row.get("content_hash"));
            }
        }
        Ok(out)
    }

    // ============ Reads ============

    /// All chunks of a collection, optionally with embeddings attached.
    pub async fn scan(&self, source: Source, with_embeddings: bool) -> Result<Vec<StoredChunk>> {
        let rows = sqlx::query(
            "SELECT id, collection, content, metadata_json, embedding FROM chunks WHERE collection = ?",
        )
        .bind(source.collection())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row_to_chunk(row, with_embeddings))
            .collect()
    }

    /// Locate a chunk by id across all collections.
    pub async fn find_chunk(&self, id: &str) -> Result<Option<StoredChunk>> {
        let row = sqlx::query(
            "SELECT id, collection, content, metadata_json, embedding FROM chunks WHERE id = ? LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(|r| row_to_chunk(r, false)).transpose()
    }

    /// All chunks sharing `parentDocId` in one collection, by chunk index.
    pub async fn chunks_by_parent(
        &self,
        collection: &str,
        parent_doc_id: &str,
    ) -> Result<Vec<StoredChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, collection, content, metadata_json, embedding FROM chunks
            WHERE collection = ? AND parent_doc_id = ?
            ORDER BY chunk_index ASC
            "#,
        )
        .bind(collection)
        .bind(parent_doc_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| row_to_chunk(row, false)).collect()
    }

    // ============ Delete ============

    /// Delete a document: its top-level id plus every chunk that points at
    /// it via `parentDocId`.
    pub async fn delete_document(&self, source: Source, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks WHERE collection = ? AND (id = ? OR parent_doc_id = ?)")
            .bind(source.collection())
            .bind(id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ============ Migration ============

    /// Backfill numeric timestamp mirrors for rows that predate them.
    /// Metadata-only; embeddings are untouched. Returns the migrated count.
    pub async fn migrate_timestamps(&self, source: Source) -> Result<usize> {
        let collection = source.collection();
        let rows = sqlx::query(
            "SELECT id, metadata_json FROM chunks WHERE collection = ? AND created_at_ts IS NULL",
        )
        .bind(&collection)
        .fetch_all(&self.pool)
        .await?;

        let mut migrated = 0usize;
        for row in rows {
            let id: String = row.get("id");
            let mut metadata: Metadata = serde_json::from_str(row.get("metadata_json"))?;
            let created_ts = metadata
                .get("createdAt")
                .and_then(|v| v.as_str())
                .and_then(parse_timestamp_ms);
            let Some(created_ts) = created_ts else {
                continue;
            };
            let updated_ts = metadata
                .get("updatedAt")
                .and_then(|v| v.as_str())
                .and_then(parse_timestamp_ms);

            metadata.insert("createdAtTs".to_string(), MetaValue::Num(created_ts as f64));
            if let Some(updated_ts) = updated_ts {
                metadata.insert("updatedAtTs".to_string(), MetaValue::Num(updated_ts as f64));
            }

            sqlx::query(
                "UPDATE chunks SET metadata_json = ?, created_at_ts = ?, updated_at_ts = ? WHERE collection = ? AND id = ?",
            )
            .bind(serde_json::to_string(&metadata)?)
            .bind(created_ts)
            .bind(updated_ts)
            .bind(&collection)
            .bind(&id)
            .execute(&self.pool)
            .await?;
            migrated += 1;
        }
        Ok(migrated)
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow, with_embeddings: bool) -> Result<StoredChunk> {
    let metadata: Metadata = serde_json::from_str(row.get("metadata_json"))?;
    let embedding = if with_embeddings {
        row.get::<Option<Vec<u8>>, _>("embedding")
            .map(|blob| embedding::blob_to_vec(&blob))
    } else {
        None
    };
    Ok(StoredChunk {
        id: row.get("id"),
        collection: row.get("collection"),
        content: row.get("content"),
        metadata,
        embedding,
    })
}

// ============ Document preparation ============

/// Split content for storage: small documents stay whole, larger ones go
/// through the sentence-accumulating text chunker.
fn chunk_content(content: &str) -> Vec<String> {
    chunker::chunk_text(content, &ChunkOptions::default())
}

fn prepare_document(doc: &Document) -> Vec<PreparedChunk> {
    let content = sanitize_text(&doc.content);

    let chunks: Vec<String> = match &doc.pre_chunked {
        Some(pre) if pre.len() > 1 => pre.iter().map(|c| sanitize_text(c)).collect(),
        _ => chunk_content(&content),
    };

    let header = context_header(doc);
    let total = chunks.len();

    chunks
        .into_iter()
        .enumerate()
        .map(|(index, raw_chunk)| {
            let id = if total == 1 {
                doc.id.clone()
            } else {
                format!("{}_chunk_{}", doc.id, index)
            };

            let mut metadata = doc.metadata.clone();
            metadata.insert(
                "_originalContent".to_string(),
                MetaValue::Str(truncate_chars(&raw_chunk, ORIGINAL_CONTENT_MAX)),
            );
            let content_hash = sha256_hex(&raw_chunk);
            metadata.insert(
                "_contentHash".to_string(),
                MetaValue::Str(content_hash.clone()),
            );
            if total > 1 {
                metadata.insert("chunkIndex".to_string(), MetaValue::Num(index as f64));
                metadata.insert("totalChunks".to_string(), MetaValue::Num(total as f64));
                metadata.insert("parentDocId".to_string(), MetaValue::Str(doc.id.clone()));
            }
            for (field, ts_field) in [("createdAt", "createdAtTs"), ("updatedAt", "updatedAtTs")] {
                if let Some(ms) = metadata
                    .get(field)
                    .and_then(|v| v.as_str())
                    .and_then(parse_timestamp_ms)
                {
                    metadata.insert(ts_field.to_string(), MetaValue::Num(ms as f64));
                }
            }

            PreparedChunk {
                id,
                content: format!("{}\n\n{}", header, raw_chunk),
                metadata,
                content_hash,
            }
        })
        .collect()
}

/// Short structured prefix describing the document, prepended to every
/// chunk before embedding and keyword matching.
fn context_header(doc: &Document) -> String {
    let mut parts = Vec::new();

    let doc_type = doc
        .metadata
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("document");
    parts.push(format!("[{} {}]", doc.source, doc_type));

    if let Some(title) = doc.title() {
        parts.push(title.to_string());
    }

    for key in source_header_fields(doc.source) {
        if let Some(value) = doc.metadata.get(*key).and_then(|v| v.as_str()) {
            parts.push(format!("{}: {}", key, value));
        }
    }

    if let Some(date) = doc
        .metadata
        .get("updatedAt")
        .or_else(|| doc.metadata.get("start"))
        .and_then(|v| v.as_str())
        .and_then(parse_timestamp_ms)
        .and_then(chrono::DateTime::from_timestamp_millis)
    {
        parts.push(date.format("%Y-%m-%d").to_string());
    }

    parts.join(" | ")
}

fn source_header_fields(source: Source) -> &'static [&'static str] {
    match source {
        Source::Jira => &["project", "status", "priority"],
        Source::Slack => &["channel"],
        Source::Gmail => &["from"],
        Source::Drive => &["owner", "mimeType"],
        Source::Confluence => &["space"],
        Source::Calendar => &["organizer", "start"],
        Source::Github => &["repo", "path"],
    }
}

/// Drop characters that can't survive JSON round trips: stray control
/// bytes and the U+FFFE/U+FFFF noncharacters. Lone UTF-16 surrogates
/// cannot occur in a Rust `String`, so no surrogate filtering is needed.
fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .filter(|c| !matches!(*c as u32, 0xFFFE | 0xFFFF))
        .collect()
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn timestamp_columns(metadata: &Metadata) -> (Option<i64>, Option<i64>) {
    let created = metadata
        .get("createdAtTs")
        .and_then(|v| v.as_f64())
        .map(|n| n as i64);
    let updated = metadata
        .get("updatedAtTs")
        .and_then(|v| v.as_f64())
        .map(|n| n as i64);
    (created, updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (tempfile::TempDir, VectorStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::migrate::open(&tmp.path().join("kc.sqlite")).await.unwrap();
        (tmp, VectorStore::new(pool, EmbeddingConfig::default()))
    }

    fn doc(id: &str, content: &str) -> Document {
        let mut metadata = Metadata::new();
        metadata.insert("id".to_string(), id.into());
        metadata.insert("source".to_string(), "jira".into());
        metadata.insert("title".to_string(), "A ticket".into());
        metadata.insert("updatedAt".to_string(), "2024-06-01T00:00:00Z".into());
        Document {
            id: id.to_string(),
            source: Source::Jira,
            content: content.to_string(),
            metadata,
            pre_chunked: None,
        }
    }

    #[tokio::test]
    async fn upsert_then_unchanged_is_metadata_only() {
        let (_tmp, store) = test_store().await;
        let d = doc("jira_A", "Small ticket body.");

        let first = store.upsert_documents(Source::Jira, &[d.clone()]).await.unwrap();
        assert_eq!(first.embedded, 1);
        assert_eq!(first.metadata_only, 0);

        let second = store.upsert_documents(Source::Jira, &[d]).await.unwrap();
        assert_eq!(second.embedded, 0);
        assert_eq!(second.metadata_only, 1);
    }

    #[tokio::test]
    async fn changed_content_is_re_embedded() {
        let (_tmp, store) = test_store().await;
        store
            .upsert_documents(Source::Jira, &[doc("jira_A", "v1")])
            .await
            .unwrap();
        let stats = store
            .upsert_documents(Source::Jira, &[doc("jira_A", "v2")])
            .await
            .unwrap();
        assert_eq!(stats.embedded, 1);
    }

    #[tokio::test]
    async fn multi_chunk_documents_get_chunk_ids() {
        let (_tmp, store) = test_store().await;
        let body = "A sentence about sync engines. ".repeat(200);
        let d = doc("jira_BIG", &body);

        store.upsert_documents(Source::Jira, &[d]).await.unwrap();
        let chunks = store
            .chunks_by_parent("collector_jira", "jira_BIG")
            .await
            .unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].id, "jira_BIG_chunk_0");
        assert_eq!(chunks[0].parent_doc_id(), Some("jira_BIG"));
        let total = chunks[0].metadata["totalChunks"].as_f64().unwrap() as usize;
        assert_eq!(total, chunks.len());
    }

    #[tokio::test]
    async fn pre_chunked_overrides_chunker() {
        let (_tmp, store) = test_store().await;
        let mut d = doc("drive_X", "ignored");
        d.source = Source::Drive;
        d.pre_chunked = Some(vec!["part one".to_string(), "part two".to_string()]);

        store.upsert_documents(Source::Drive, &[d]).await.unwrap();
        let chunks = store
            .chunks_by_parent("collector_drive", "drive_X")
            .await
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.ends_with("part one"));
    }

    #[tokio::test]
    async fn content_carries_context_header() {
        let (_tmp, store) = test_store().await;
        store
            .upsert_documents(Source::Jira, &[doc("jira_A", "Body text.")])
            .await
            .unwrap();
        let chunk = store.find_chunk("jira_A").await.unwrap().unwrap();
        assert!(chunk.content.starts_with("[jira "));
        assert!(chunk.content.contains("A ticket"));
        assert!(chunk.content.ends_with("Body text."));
        assert_eq!(
            chunk.metadata["_originalContent"].as_str(),
            Some("Body text.")
        );
    }

    #[tokio::test]
    async fn timestamps_are_mirrored() {
        let (_tmp, store) = test_store().await;
        store
            .upsert_documents(Source::Jira, &[doc("jira_A", "Body.")])
            .await
            .unwrap();
        let chunk = store.find_chunk("jira_A").await.unwrap().unwrap();
        assert_eq!(
            chunk.metadata["updatedAtTs"].as_f64(),
            Some(1_717_200_000_000.0)
        );
    }

    #[tokio::test]
    async fn delete_document_cascades_to_chunks() {
        let (_tmp, store) = test_store().await;
        let body = "A sentence about deletion semantics. ".repeat(200);
        store
            .upsert_documents(Source::Jira, &[doc("jira_DEL", &body)])
            .await
            .unwrap();
        assert!(!store
            .chunks_by_parent("collector_jira", "jira_DEL")
            .await
            .unwrap()
            .is_empty());

        store.delete_document(Source::Jira, "jira_DEL").await.unwrap();
        assert!(store
            .chunks_by_parent("collector_jira", "jira_DEL")
            .await
            .unwrap()
            .is_empty());
        assert!(store.find_chunk("jira_DEL").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn migrate_timestamps_backfills() {
        let (_tmp, store) = test_store().await;
        // Simulate a legacy row without numeric mirrors.
        let metadata = serde_json::json!({
            "id": "jira_OLD",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-02-01T00:00:00Z"
        });
        sqlx::query(
            "INSERT INTO chunks (collection, id, content, metadata_json, content_hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind("collector_jira")
        .bind("jira_OLD")
        .bind("old content")
        .bind(metadata.to_string())
        .bind("deadbeef")
        .execute(&store.pool)
        .await
        .unwrap();

        let migrated = store.migrate_timestamps(Source::Jira).await.unwrap();
        assert_eq!(migrated, 1);
        let chunk = store.find_chunk("jira_OLD").await.unwrap().unwrap();
        assert!(chunk.metadata.contains_key("createdAtTs"));
        assert!(chunk.metadata.contains_key("updatedAtTs"));
    }

    #[test]
    fn sanitize_strips_control_chars() {
        assert_eq!(sanitize_text("a\u{0}b\u{7}c\nd"), "abc\nd");
    }

    #[test]
    fn original_content_is_truncated() {
        let long = "x".repeat(10_000);
        let d = {
            let mut d = doc("jira_L", &long);
            d.pre_chunked = None;
            d
        };
        let prepared = prepare_document(&d);
        for chunk in prepared {
            let original = chunk.metadata["_originalContent"].as_str().unwrap();
            assert!(original.chars().count() <= ORIGINAL_CONTENT_MAX);
        }
    }
}
