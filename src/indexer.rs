//! Indexing engine: batch orchestration over connectors.
//!
//! One [`IndexingEngine::run_batch`] call performs exactly one connector
//! fetch plus downstream processing: settings merge, config-change
//! detection, relevance enrichment, hash diffing, vector-store persistence
//! with retries, cursor advancement, and status bookkeeping. The caller —
//! the workflow runner, or [`IndexingEngine::run_source`] in loop mode —
//! invokes it until `has_more` turns false.
//!
//! Hash updates and vector upserts complete together per batch: a failed
//! persist leaves hashes untouched so the next run retries the same
//! documents.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::analytics::{AnalyticsStore, RunCompletion};
use crate::connector::{Connector, ConnectorResult, FetchRequest, GmailSettings};
use crate::cursor_store::CursorStore;
use crate::models::{
    document_hash, now_iso, Cursor, Document, IndexStatus, JobState, RunState, Source,
};
use crate::raw_store::RawStore;
use crate::relevance::{add_relevance_weights, Identity};
use crate::vector_store::VectorStore;

/// Persist retries per batch (linear backoff 1s, 2s).
const PERSIST_ATTEMPTS: u32 = 3;
/// Consecutive batch failures before a source's run aborts.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;
/// Advisory lock TTL for loop mode.
const LOCK_TTL: Duration = Duration::from_secs(600);
/// Pause after every batch.
const BATCH_PAUSE: Duration = Duration::from_millis(500);
/// Extra pause after this many accumulated documents.
const BACKPRESSURE_EVERY_DOCS: usize = 500;
const BACKPRESSURE_PAUSE: Duration = Duration::from_secs(2);

/// Outcome of one batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOutcome {
    pub documents_processed: usize,
    pub documents_new: usize,
    pub documents_updated: usize,
    pub documents_skipped: usize,
    pub has_more: bool,
}

/// Outcome of a full loop-mode run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub batches: usize,
    pub documents_processed: usize,
    pub documents_new: usize,
    pub documents_updated: usize,
    pub documents_skipped: usize,
}

#[derive(Clone)]
pub struct IndexingEngine {
    cursor_store: CursorStore,
    analytics: AnalyticsStore,
    vector_store: VectorStore,
    identity: Identity,
    raw_store: Option<RawStore>,
}

impl IndexingEngine {
    pub fn new(
        cursor_store: CursorStore,
        analytics: AnalyticsStore,
        vector_store: VectorStore,
        identity: Identity,
        raw_store: Option<RawStore>,
    ) -> Self {
        Self {
            cursor_store,
            analytics,
            vector_store,
            identity,
            raw_store,
        }
    }

    pub fn cursor_store(&self) -> &CursorStore {
        &self.cursor_store
    }

    pub fn analytics(&self) -> &AnalyticsStore {
        &self.analytics
    }

    /// Execute one connector batch with full downstream processing.
    pub async fn run_batch(
        &self,
        connector: &dyn Connector,
        request: &FetchRequest,
    ) -> Result<BatchOutcome> {
        let source = connector.source();

        // Unconfigured sources skip silently rather than failing the run.
        if !connector.is_configured() {
            info!(source = %source, "connector not configured, skipping");
            return Ok(BatchOutcome::default());
        }

        // Persisted settings fill gaps; the incoming request wins.
        let persisted = self.load_persisted_request(source).await?;
        let mut request = merge_requests(request.clone(), persisted);

        // A changed filter fingerprint forces a full reindex and discards
        // the old cursor, stale watermark included.
        let key = config_key(source, &request);
        let mut cursor = self.cursor_store.get_cursor(source).await?;
        let stored_key_changed = cursor
            .as_ref()
            .and_then(|c| c.config_key())
            .map(|stored| stored != key)
            .unwrap_or(false);
        if stored_key_changed {
            info!(source = %source, "filter config changed, forcing full reindex");
            request.full_reindex = true;
            cursor = None;
        }

        let effective_cursor = if request.full_reindex {
            None
        } else {
            cursor.clone()
        };
        let result = connector.fetch(effective_cursor.as_ref(), &request).await?;

        let documents = add_relevance_weights(source, &result.documents, &self.identity);

        // Hash diff: compute the new/updated/skipped split, and drop
        // unchanged documents unless this is a full reindex.
        let ids: Vec<String> = documents.iter().map(|d| d.id.clone()).collect();
        let stored_hashes = self.cursor_store.bulk_get_hashes(source, &ids).await?;

        let mut changed: Vec<Document> = Vec::new();
        let mut new_hashes: Vec<(String, String)> = Vec::new();
        let mut outcome = BatchOutcome {
            has_more: result.has_more,
            ..Default::default()
        };
        for (doc, stored) in documents.into_iter().zip(stored_hashes.iter()) {
            let hash = document_hash(&doc.content, &doc.metadata);
            match stored {
                None => outcome.documents_new += 1,
                Some(stored) if *stored != hash => outcome.documents_updated += 1,
                Some(_) => {
                    outcome.documents_skipped += 1;
                    if !request.full_reindex {
                        continue;
                    }
                }
            }
            new_hashes.push((doc.id.clone(), hash));
            changed.push(doc);
        }
        outcome.documents_processed = changed.len();

        if !changed.is_empty() {
            if let Some(raw) = &self.raw_store {
                raw.save_batch(source, &changed);
            }
            self.persist_with_retry(source, &changed).await?;
            self.cursor_store.bulk_set_hashes(source, &new_hashes).await?;
        }

        // Advance the cursor only after a fully persisted batch.
        let advanced = advance_cursor(cursor, &result, key);
        self.cursor_store.save_cursor(source, &advanced).await?;

        let mut status = self.cursor_store.get_status(source).await?;
        status.documents_indexed += outcome.documents_processed as i64;
        status.last_sync = advanced.last_sync.clone();
        self.cursor_store.save_status(&status).await?;

        tokio::time::sleep(BATCH_PAUSE).await;
        Ok(outcome)
    }

    /// Loop mode: drive `run_batch` until the source is drained.
    ///
    /// Takes the advisory per-source lock, tracks consecutive failures
    /// with exponential backoff (clearing a possibly-stale `sync_token` on
    /// the penultimate attempt), and records the run in analytics.
    /// Cancellation is honored at batch boundaries.
    pub async fn run_source(
        &self,
        connector: &dyn Connector,
        request: &FetchRequest,
        cancel: &AtomicBool,
        workflow_id: Option<String>,
    ) -> Result<RunSummary> {
        let source = connector.source();

        if !self.cursor_store.acquire_lock(source, LOCK_TTL).await? {
            anyhow::bail!("indexing already running for source '{}'", source);
        }

        let run_id = self.analytics.record_run_start(source).await?;
        let started = std::time::Instant::now();

        let mut status = self.cursor_store.get_status(source).await?;
        status.status = JobState::Running;
        status.workflow_id = workflow_id.clone();
        self.cursor_store.save_status(&status).await?;

        let result = self.drive_batches(connector, request, cancel).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match &result {
            Ok(summary) => {
                let cancelled = cancel.load(Ordering::Relaxed);
                self.finish_status(
                    source,
                    if cancelled {
                        JobState::Idle
                    } else {
                        JobState::Completed
                    },
                    None,
                )
                .await?;
                self.analytics
                    .record_run_complete(
                        source,
                        RunCompletion {
                            run_id,
                            status: RunState::Completed,
                            documents_processed: summary.documents_processed as i64,
                            documents_new: summary.documents_new as i64,
                            documents_updated: summary.documents_updated as i64,
                            documents_skipped: summary.documents_skipped as i64,
                            error: None,
                            duration_ms: Some(duration_ms),
                        },
                    )
                    .await?;
            }
            Err(e) => {
                self.finish_status(source, JobState::Error, Some(e.to_string()))
                    .await?;
                self.analytics
                    .record_run_complete(
                        source,
                        RunCompletion {
                            run_id,
                            status: RunState::Error,
                            documents_processed: 0,
                            documents_new: 0,
                            documents_updated: 0,
                            documents_skipped: 0,
                            error: Some(e.to_string()),
                            duration_ms: Some(duration_ms),
                        },
                    )
                    .await?;
            }
        }

        self.cursor_store.release_lock(source).await?;
        result
    }

    async fn drive_batches(
        &self,
        connector: &dyn Connector,
        request: &FetchRequest,
        cancel: &AtomicBool,
    ) -> Result<RunSummary> {
        let source = connector.source();
        let mut summary = RunSummary::default();
        let mut consecutive_errors: u32 = 0;
        let mut since_backpressure = 0usize;
        let mut request = request.clone();

        loop {
            if cancel.load(Ordering::Relaxed) {
                info!(source = %source, "run cancelled at batch boundary");
                break;
            }

            match self.run_batch(connector, &request).await {
                Ok(outcome) => {
                    consecutive_errors = 0;
                    summary.batches += 1;
                    summary.documents_processed += outcome.documents_processed;
                    summary.documents_new += outcome.documents_new;
                    summary.documents_updated += outcome.documents_updated;
                    summary.documents_skipped += outcome.documents_skipped;

                    since_backpressure += outcome.documents_processed;
                    if since_backpressure >= BACKPRESSURE_EVERY_DOCS {
                        since_backpressure = 0;
                        tokio::time::sleep(BACKPRESSURE_PAUSE).await;
                    }

                    // The first batch may have been forced full; later
                    // batches continue from the cursor.
                    request.full_reindex = false;

                    if !outcome.has_more {
                        break;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(source = %source, attempt = consecutive_errors, error = %e, "batch failed");
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        return Err(e);
                    }
                    // Penultimate attempt: a stale pagination token is the
                    // usual culprit, so drop it before the final try.
                    if consecutive_errors == MAX_CONSECUTIVE_ERRORS - 1 {
                        if let Some(mut cursor) = self.cursor_store.get_cursor(source).await? {
                            if cursor.sync_token.take().is_some() {
                                warn!(source = %source, "clearing sync token before final retry");
                                self.cursor_store.save_cursor(source, &cursor).await?;
                            }
                        }
                    }
                    tokio::time::sleep(Duration::from_secs(1u64 << consecutive_errors)).await;
                }
            }
        }

        Ok(summary)
    }

    async fn finish_status(
        &self,
        source: Source,
        state: JobState,
        error: Option<String>,
    ) -> Result<()> {
        let mut status = self.cursor_store.get_status(source).await?;
        status.status = state;
        status.workflow_id = None;
        if let Some(error) = error {
            status.last_error = Some(error);
            status.last_error_at = Some(now_iso());
        }
        self.cursor_store.save_status(&status).await
    }

    async fn persist_with_retry(&self, source: Source, documents: &[Document]) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..PERSIST_ATTEMPTS {
            if attempt > 0 {
                // Linear backoff: 1s, 2s.
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
            match self.vector_store.upsert_documents(source, documents).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(source = %source, attempt = attempt + 1, error = %e, "vector upsert failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("at least one attempt ran"))
    }

    async fn load_persisted_request(&self, source: Source) -> Result<FetchRequest> {
        match self.cursor_store.get_settings(source).await? {
            Some(value) => Ok(serde_json::from_value(value).unwrap_or_default()),
            None => Ok(FetchRequest::default()),
        }
    }

    /// Delete one document: vector-store rows plus stored hashes.
    ///
    /// A vector-store failure is logged but hash removal still proceeds,
    /// so a later run can repopulate the document.
    pub async fn delete_document(&self, source: Source, id: &str) -> Result<()> {
        if let Err(e) = self.vector_store.delete_document(source, id).await {
            warn!(source = %source, doc = id, error = %e, "vector delete failed");
        }
        self.cursor_store.remove_hashes(source, id).await
    }

    /// Stale-status sweep: a status still marked running whose workflow no
    /// longer exists is reset to idle and its lock released.
    pub async fn reset_stale_status(
        &self,
        source: Source,
        workflow_exists: impl Fn(&str) -> bool,
    ) -> Result<IndexStatus> {
        let mut status = self.cursor_store.get_status(source).await?;
        if status.status == JobState::Running {
            let alive = status
                .workflow_id
                .as_deref()
                .map(&workflow_exists)
                .unwrap_or(false);
            if !alive {
                warn!(source = %source, "stale running status, resetting to idle");
                status.status = JobState::Idle;
                status.workflow_id = None;
                self.cursor_store.save_status(&status).await?;
                self.cursor_store.release_lock(source).await?;
            }
        }
        Ok(status)
    }
}

// ============ Settings merge ============

/// Merge persisted settings under an incoming request, request-wins.
///
/// Gmail settings merge per subfield.
pub fn merge_requests(incoming: FetchRequest, persisted: FetchRequest) -> FetchRequest {
    FetchRequest {
        full_reindex: incoming.full_reindex,
        project_keys: incoming.project_keys.or(persisted.project_keys),
        channel_ids: incoming.channel_ids.or(persisted.channel_ids),
        folder_ids: incoming.folder_ids.or(persisted.folder_ids),
        calendar_ids: incoming.calendar_ids.or(persisted.calendar_ids),
        space_keys: incoming.space_keys.or(persisted.space_keys),
        repos: incoming.repos.or(persisted.repos),
        index_files: incoming.index_files.or(persisted.index_files),
        gmail_settings: match (incoming.gmail_settings, persisted.gmail_settings) {
            (Some(a), Some(b)) => Some(GmailSettings {
                domains: a.domains.or(b.domains),
                senders: a.senders.or(b.senders),
                labels: a.labels.or(b.labels),
            }),
            (a, b) => a.or(b),
        },
    }
}

// ============ Config fingerprint ============

/// Canonical serialization of the filter-carrying subset of a request.
///
/// Arrays are sorted and comma-joined; gmail settings serialize as sorted
/// JSON under short keys. Any change invalidates incremental sync.
pub fn config_key(source: Source, request: &FetchRequest) -> String {
    let mut parts: Vec<String> = Vec::new();

    let mut push_list = |name: &str, values: &Option<Vec<String>>| {
        if let Some(values) = values {
            let mut sorted = values.clone();
            sorted.sort();
            parts.push(format!("{}={}", name, sorted.join(",")));
        }
    };
    push_list("calendarIds", &request.calendar_ids);
    push_list("channelIds", &request.channel_ids);
    push_list("folderIds", &request.folder_ids);
    push_list("projectKeys", &request.project_keys);
    push_list("repos", &request.repos);
    push_list("spaceKeys", &request.space_keys);

    if let Some(index_files) = request.index_files {
        parts.push(format!("indexFiles={}", index_files));
    }
    if let Some(gmail) = &request.gmail_settings {
        let sorted = |v: &Option<Vec<String>>| {
            let mut v = v.clone().unwrap_or_default();
            v.sort();
            v
        };
        let encoded = serde_json::json!({
            "d": sorted(&gmail.domains),
            "l": sorted(&gmail.labels),
            "s": sorted(&gmail.senders),
        });
        parts.push(format!("gmail={}", encoded));
    }

    format!("{}:{}", source, parts.join(";"))
}

// ============ Cursor advancement ============

/// Compose the post-batch cursor.
///
/// A clean batch (no continuation token) advances `lastSync` to the
/// batch's watermark. A mid-paging batch keeps the prior watermark so a
/// crash between pages never skips documents.
pub fn advance_cursor(
    prior: Option<Cursor>,
    result: &ConnectorResult,
    config_key: String,
) -> Cursor {
    let prior_last_sync = prior.as_ref().and_then(|c| c.last_sync.clone());
    let mut metadata = prior.map(|c| c.metadata).unwrap_or_default();
    for (k, v) in &result.new_cursor.metadata {
        metadata.insert(k.clone(), v.clone());
    }
    metadata.insert("configKey".to_string(), config_key);

    match &result.new_cursor.sync_token {
        None => Cursor {
            last_sync: Some(
                result
                    .batch_last_sync
                    .clone()
                    .or(prior_last_sync)
                    .unwrap_or_else(now_iso),
            ),
            sync_token: None,
            metadata,
        },
        Some(token) => Cursor {
            last_sync: Some(
                prior_last_sync
                    .or_else(|| result.batch_last_sync.clone())
                    .unwrap_or_else(now_iso),
            ),
            sync_token: Some(token.clone()),
            metadata,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::CursorUpdate;

    fn result(token: Option<&str>, batch_last_sync: Option<&str>) -> ConnectorResult {
        ConnectorResult {
            documents: Vec::new(),
            new_cursor: CursorUpdate {
                sync_token: token.map(|t| t.to_string()),
                metadata: Default::default(),
            },
            has_more: token.is_some(),
            batch_last_sync: batch_last_sync.map(|s| s.to_string()),
        }
    }

    #[test]
    fn clean_batch_advances_watermark() {
        let cursor = advance_cursor(None, &result(None, Some("2024-06-15")), "k".to_string());
        assert_eq!(cursor.last_sync.as_deref(), Some("2024-06-15"));
        assert!(cursor.sync_token.is_none());
        assert_eq!(cursor.config_key(), Some("k"));
    }

    #[test]
    fn mid_page_preserves_prior_watermark() {
        let prior = advance_cursor(None, &result(None, Some("2024-06-10")), "k".to_string());
        let mid = advance_cursor(
            Some(prior),
            &result(Some("p2"), Some("2024-06-12")),
            "k".to_string(),
        );
        assert_eq!(mid.last_sync.as_deref(), Some("2024-06-10"));
        assert_eq!(mid.sync_token.as_deref(), Some("p2"));
    }

    #[test]
    fn mid_page_without_prior_seeds_from_batch() {
        let cursor = advance_cursor(None, &result(Some("p2"), Some("2024-06-10")), "k".to_string());
        assert_eq!(cursor.last_sync.as_deref(), Some("2024-06-10"));
        assert_eq!(cursor.sync_token.as_deref(), Some("p2"));
    }

    #[test]
    fn empty_clean_batch_uses_now() {
        let cursor = advance_cursor(None, &result(None, None), "k".to_string());
        assert!(cursor.last_sync.is_some());
    }

    #[test]
    fn merge_is_request_wins() {
        let incoming = FetchRequest {
            project_keys: Some(vec!["ENG".to_string()]),
            ..Default::default()
        };
        let persisted = FetchRequest {
            project_keys: Some(vec!["OPS".to_string()]),
            repos: Some(vec!["acme/platform".to_string()]),
            ..Default::default()
        };
        let merged = merge_requests(incoming, persisted);
        assert_eq!(merged.project_keys, Some(vec!["ENG".to_string()]));
        assert_eq!(merged.repos, Some(vec!["acme/platform".to_string()]));
    }

    #[test]
    fn gmail_merge_is_per_subfield() {
        let incoming = FetchRequest {
            gmail_settings: Some(GmailSettings {
                domains: Some(vec!["acme.com".to_string()]),
                senders: None,
                labels: None,
            }),
            ..Default::default()
        };
        let persisted = FetchRequest {
            gmail_settings: Some(GmailSettings {
                domains: Some(vec!["old.com".to_string()]),
                senders: Some(vec!["ceo@acme.com".to_string()]),
                labels: None,
            }),
            ..Default::default()
        };
        let merged = merge_requests(incoming, persisted);
        let gmail = merged.gmail_settings.unwrap();
        assert_eq!(gmail.domains, Some(vec!["acme.com".to_string()]));
        assert_eq!(gmail.senders, Some(vec!["ceo@acme.com".to_string()]));
    }

    #[test]
    fn config_key_is_order_insensitive() {
        let a = FetchRequest {
            project_keys: Some(vec!["B".to_string(), "A".to_string()]),
            ..Default::default()
        };
        let b = FetchRequest {
            project_keys: Some(vec!["A".to_string(), "B".to_string()]),
            ..Default::default()
        };
        assert_eq!(config_key(Source::Jira, &a), config_key(Source::Jira, &b));
    }

    #[test]
    fn config_key_distinguishes_filters() {
        let a = FetchRequest {
            project_keys: Some(vec!["A".to_string()]),
            ..Default::default()
        };
        let b = FetchRequest::default();
        assert_ne!(config_key(Source::Jira, &a), config_key(Source::Jira, &b));
    }

    #[test]
    fn config_key_encodes_gmail_sorted() {
        let a = FetchRequest {
            gmail_settings: Some(GmailSettings {
                domains: Some(vec!["b.com".to_string(), "a.com".to_string()]),
                senders: None,
                labels: None,
            }),
            ..Default::default()
        };
        let key = config_key(Source::Gmail, &a);
        assert!(key.contains("\"d\":[\"a.com\",\"b.com\"]"), "{}", key);
    }
}
