//! Hybrid search over the per-source collections.
//!
//! Three retrieval modes share one pipeline:
//!
//! - **vector** — cosine similarity against chunk embeddings.
//! - **keyword** — substring containment of every query term, scored by
//!   coverage, dampened term frequency, and a length prior.
//! - **hybrid** — both legs at double depth, fused with Reciprocal Rank
//!   Fusion (`k = 60`) and normalized by the best possible fused score.
//!
//! After retrieval: chunks collapse to one result per parent document
//! (max score, with a small multi-chunk-match boost), then connector
//! relevance, title match, and per-source recency half-life boosts apply.
//! Scores always land in `[0, 1]` and the final order is total
//! (`score desc, id asc`).

use std::collections::BTreeMap;
use std::collections::HashMap;

use anyhow::Result;
use futures::future::try_join_all;
use serde::Deserialize;

use crate::config::EmbeddingConfig;
use crate::embedding;
use crate::models::{parse_timestamp_ms, MetaValue, SearchResult, Source};
use crate::relevance::days_since;
use crate::vector_store::{StoredChunk, VectorStore};

/// RRF rank constant.
const RRF_K: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    #[default]
    Vector,
    Keyword,
    Hybrid,
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    /// Sources to search; all seven when empty.
    pub sources: Vec<Source>,
    pub search_type: SearchType,
    pub limit: usize,
    pub offset: usize,
    /// Metadata equality filters, ANDed together.
    pub where_clause: BTreeMap<String, serde_json::Value>,
    /// Inclusive `createdAt` date bounds (`YYYY-MM-DD` or ISO 8601).
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: 20,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total: usize,
}

/// Compiled metadata filter applied to every candidate chunk.
struct WhereFilter {
    equals: Vec<(String, serde_json::Value)>,
    start_ms: Option<i64>,
    end_ms: Option<i64>,
}

impl WhereFilter {
    fn from_request(request: &SearchRequest) -> Self {
        const DAY_END_MS: i64 = 24 * 3600 * 1000 - 1;
        Self {
            equals: request
                .where_clause
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            start_ms: request.start_date.as_deref().and_then(parse_timestamp_ms),
            end_ms: request
                .end_date
                .as_deref()
                .and_then(parse_timestamp_ms)
                // The end date is inclusive through 23:59:59.999.
                .map(|ms| ms + DAY_END_MS),
        }
    }

    fn matches(&self, chunk: &StoredChunk) -> bool {
        for (key, expected) in &self.equals {
            let Some(actual) = chunk.metadata.get(key) else {
                return false;
            };
            if !meta_equals(actual, expected) {
                return false;
            }
        }
        if self.start_ms.is_some() || self.end_ms.is_some() {
            let Some(created) = chunk
                .metadata
                .get("createdAtTs")
                .and_then(|v| v.as_f64())
                .map(|n| n as i64)
            else {
                return false;
            };
            if let Some(start) = self.start_ms {
                if created < start {
                    return false;
                }
            }
            if let Some(end) = self.end_ms {
                if created > end {
                    return false;
                }
            }
        }
        true
    }
}

fn meta_equals(actual: &MetaValue, expected: &serde_json::Value) -> bool {
    match (actual, expected) {
        (MetaValue::Str(a), serde_json::Value::String(b)) => a == b,
        (MetaValue::Num(a), serde_json::Value::Number(b)) => {
            b.as_f64().map(|b| (a - b).abs() < f64::EPSILON).unwrap_or(false)
        }
        (MetaValue::Bool(a), serde_json::Value::Bool(b)) => a == b,
        _ => false,
    }
}

/// A scored chunk before dedup and boosts.
#[derive(Debug, Clone)]
struct Candidate {
    chunk: StoredChunk,
    source: Source,
    score: f64,
}

pub struct SearchEngine {
    store: VectorStore,
    embedding: EmbeddingConfig,
}

impl SearchEngine {
    pub fn new(store: VectorStore, embedding: EmbeddingConfig) -> Self {
        Self { store, embedding }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        if request.query.trim().is_empty() {
            return Ok(SearchResponse {
                results: Vec::new(),
                total: 0,
            });
        }

        let sources: Vec<Source> = if request.sources.is_empty() {
            Source::ALL.to_vec()
        } else {
            request.sources.clone()
        };
        let limit = if request.limit == 0 { 20 } else { request.limit };
        let fetch_limit = limit + request.offset;
        let filter = WhereFilter::from_request(request);

        // One query embedding, reused across every source collection.
        let query_vec = match request.search_type {
            SearchType::Vector | SearchType::Hybrid => {
                Some(embedding::embed_query(&self.embedding, &request.query).await?)
            }
            SearchType::Keyword => None,
        };
        let terms = query_terms(&request.query);

        let legs = sources.iter().map(|&source| {
            self.search_source(
                source,
                request.search_type,
                query_vec.as_deref(),
                &terms,
                fetch_limit,
                &filter,
            )
        });
        let mut candidates: Vec<Candidate> =
            try_join_all(legs).await?.into_iter().flatten().collect();

        candidates = dedup_chunks(candidates);

        for candidate in &mut candidates {
            apply_boosts(candidate, &request.query, &terms);
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });

        let total = candidates.len();
        let results = candidates
            .into_iter()
            .skip(request.offset)
            .take(limit)
            .map(|c| SearchResult {
                id: c.chunk.id,
                source: c.source,
                content: c.chunk.content,
                metadata: c.chunk.metadata,
                score: c.score,
            })
            .collect();

        Ok(SearchResponse { results, total })
    }

    async fn search_source(
        &self,
        source: Source,
        search_type: SearchType,
        query_vec: Option<&[f32]>,
        terms: &[String],
        fetch_limit: usize,
        filter: &WhereFilter,
    ) -> Result<Vec<Candidate>> {
        match search_type {
            SearchType::Vector => {
                self.vector_leg(source, query_vec.unwrap_or(&[]), fetch_limit, filter)
                    .await
            }
            SearchType::Keyword => self.keyword_leg(source, terms, fetch_limit, filter).await,
            SearchType::Hybrid => {
                let vector = self
                    .vector_leg(source, query_vec.unwrap_or(&[]), fetch_limit * 2, filter)
                    .await?;
                let keyword = self.keyword_leg(source, terms, fetch_limit * 2, filter).await?;
                Ok(fuse_rrf(vector, keyword))
            }
        }
    }

    async fn vector_leg(
        &self,
        source: Source,
        query_vec: &[f32],
        fetch_limit: usize,
        filter: &WhereFilter,
    ) -> Result<Vec<Candidate>> {
        let chunks = self.store.scan(source, true).await?;
        let mut candidates: Vec<Candidate> = chunks
            .into_iter()
            .filter(|c| filter.matches(c))
            .filter_map(|chunk| {
                let vector = chunk.embedding.as_deref()?;
                let similarity = embedding::cosine_similarity(query_vec, vector) as f64;
                // Cosine distance d = 1 - sim; score = max(0, 1 - d).
                let score = similarity.max(0.0);
                Some(Candidate {
                    chunk,
                    source,
                    score,
                })
            })
            .collect();

        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(fetch_limit);
        Ok(candidates)
    }

    async fn keyword_leg(
        &self,
        source: Source,
        terms: &[String],
        fetch_limit: usize,
        filter: &WhereFilter,
    ) -> Result<Vec<Candidate>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let chunks = self.store.scan(source, false).await?;
        let mut candidates: Vec<Candidate> = chunks
            .into_iter()
            .filter(|c| filter.matches(c))
            .filter_map(|chunk| {
                let score = keyword_score(&chunk.content, terms)?;
                Some(Candidate {
                    chunk,
                    source,
                    score,
                })
            })
            .collect();

        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(fetch_limit);
        Ok(candidates)
    }
}

/// Lowercase query terms longer than one character.
fn query_terms(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_string())
        .collect()
}

/// Keyword containment score; `None` when any term is missing (AND).
///
/// `0.6·coverage + 0.3·min(1, tfSum/matched/3) + 0.1·lengthNorm`, where
/// `tfSum = Σ (1 + ln(termCount))`. The length prior flattens to 1.0 for
/// documents under 2000 chars (the log term is undefined near zero).
fn keyword_score(content: &str, terms: &[String]) -> Option<f64> {
    let haystack = content.to_lowercase();
    let mut tf_sum = 0.0;
    let mut matched = 0usize;
    for term in terms {
        let count = haystack.matches(term.as_str()).count();
        if count == 0 {
            return None;
        }
        matched += 1;
        tf_sum += 1.0 + (count as f64).ln();
    }

    let coverage = matched as f64 / terms.len() as f64;
    let tf = (tf_sum / matched as f64 / 3.0).min(1.0);
    let doc_len = content.chars().count() as f64;
    let length_norm = if doc_len >= 2000.0 {
        1.0 / (1.0 + (doc_len / 2000.0).ln())
    } else {
        1.0
    };

    Some(0.6 * coverage + 0.3 * tf + 0.1 * length_norm)
}

/// Reciprocal Rank Fusion of the vector and keyword legs.
///
/// `rrf(d) = Σ 1/(k + rank_m(d))` over the legs that ranked `d`,
/// normalized by the maximum possible `2/(k + 1)`.
fn fuse_rrf(vector: Vec<Candidate>, keyword: Vec<Candidate>) -> Vec<Candidate> {
    let max_rrf = 2.0 / (RRF_K + 1.0);
    let mut fused: HashMap<String, Candidate> = HashMap::new();
    let mut scores: HashMap<String, f64> = HashMap::new();

    for leg in [vector, keyword] {
        for (rank, candidate) in leg.into_iter().enumerate() {
            let contribution = 1.0 / (RRF_K + (rank + 1) as f64);
            *scores.entry(candidate.chunk.id.clone()).or_insert(0.0) += contribution;
            fused.entry(candidate.chunk.id.clone()).or_insert(candidate);
        }
    }

    fused
        .into_iter()
        .map(|(id, mut candidate)| {
            candidate.score = (scores[&id] / max_rrf).min(1.0);
            candidate
        })
        .collect()
}

/// Collapse chunk hits to one result per parent document.
///
/// The surviving chunk keeps the max score, boosted slightly when several
/// sibling chunks matched. Results without `parentDocId` pass through.
fn dedup_chunks(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = Vec::new();
    let mut by_parent: HashMap<String, (Candidate, usize)> = HashMap::new();

    for candidate in candidates {
        match candidate.chunk.parent_doc_id().map(|p| p.to_string()) {
            None => out.push(candidate),
            Some(parent) => match by_parent.get_mut(&parent) {
                None => {
                    by_parent.insert(parent, (candidate, 1));
                }
                Some((best, count)) => {
                    *count += 1;
                    if candidate.score > best.score {
                        *best = candidate;
                    }
                }
            },
        }
    }

    for (_, (mut best, count)) in by_parent {
        if count > 1 {
            best.score *= 1.0 + (0.05 * (count as f64).ln()).min(0.15);
        }
        out.push(best);
    }
    out
}

/// Per-source recency half-lives, in days.
fn recency_half_life(source: Source) -> f64 {
    match source {
        Source::Slack => 7.0,
        Source::Gmail | Source::Calendar => 14.0,
        Source::Jira => 30.0,
        Source::Github => 60.0,
        Source::Confluence | Source::Drive => 90.0,
    }
}

/// Post-retrieval boosts: connector relevance blend, title match, recency
/// half-life, final clamp to `[0, 1]`.
fn apply_boosts(candidate: &mut Candidate, query: &str, terms: &[String]) {
    // Blend in the connector's relevance signal when present.
    if let Some(relevance) = candidate
        .chunk
        .metadata
        .get("relevance_score")
        .and_then(|v| v.as_f64())
    {
        candidate.score *= 0.85 + relevance * 0.35;
    }

    // Title match.
    let title = candidate
        .chunk
        .metadata
        .get("title")
        .or_else(|| candidate.chunk.metadata.get("subject"))
        .and_then(|v| v.as_str())
        .map(|t| t.to_lowercase());
    if let Some(title) = title {
        let query_lower = query.to_lowercase();
        if title.contains(query_lower.trim()) {
            candidate.score *= 1.3;
        } else if !terms.is_empty() {
            let covered = terms.iter().filter(|t| title.contains(t.as_str())).count();
            candidate.score *= 1.0 + 0.2 * (covered as f64 / terms.len() as f64);
        }
    }

    // Recency with per-source half-life.
    let updated = candidate
        .chunk
        .metadata
        .get("updatedAt")
        .or_else(|| candidate.chunk.metadata.get("start"))
        .or_else(|| candidate.chunk.metadata.get("createdAt"))
        .and_then(|v| v.as_str());
    let days = days_since(updated) as f64;
    let recency = 0.5f64.powf(days.max(0.0) / recency_half_life(candidate.source));
    candidate.score *= 1.0 + 0.08 * recency;

    candidate.score = candidate.score.clamp(0.0, 1.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Document, Metadata};

    async fn test_engine() -> (tempfile::TempDir, SearchEngine, VectorStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::migrate::open(&tmp.path().join("kc.sqlite")).await.unwrap();
        let store = VectorStore::new(pool, EmbeddingConfig::default());
        let engine = SearchEngine::new(store.clone(), EmbeddingConfig::default());
        (tmp, engine, store)
    }

    fn doc(source: Source, id: &str, title: &str, content: &str, updated: &str) -> Document {
        let mut metadata = Metadata::new();
        metadata.insert("id".to_string(), id.into());
        metadata.insert("source".to_string(), source.as_str().into());
        metadata.insert("title".to_string(), title.into());
        metadata.insert("createdAt".to_string(), updated.into());
        metadata.insert("updatedAt".to_string(), updated.into());
        Document {
            id: id.to_string(),
            source,
            content: content.to_string(),
            metadata,
            pre_chunked: None,
        }
    }

    fn request(query: &str, search_type: SearchType) -> SearchRequest {
        SearchRequest {
            search_type,
            ..SearchRequest::new(query)
        }
    }

    #[test]
    fn query_terms_drop_short_tokens() {
        assert_eq!(query_terms("a quarterly Review!"), vec!["quarterly", "review"]);
    }

    #[test]
    fn keyword_requires_all_terms() {
        let terms = query_terms("alpha beta");
        assert!(keyword_score("alpha only here", &terms).is_none());
        assert!(keyword_score("alpha and beta here", &terms).is_some());
    }

    #[test]
    fn keyword_score_in_range() {
        let terms = query_terms("alpha beta");
        let short = keyword_score("alpha beta", &terms).unwrap();
        let long = keyword_score(&"alpha beta filler ".repeat(500), &terms).unwrap();
        assert!((0.0..=1.0).contains(&short));
        assert!((0.0..=1.0).contains(&long));
        assert!(short >= long);
    }

    #[test]
    fn chunk_count_boost_is_logarithmic() {
        let make = |id: &str, score| {
            let mut metadata = Metadata::new();
            metadata.insert("parentDocId".to_string(), "drive_P".into());
            Candidate {
                chunk: StoredChunk {
                    id: id.to_string(),
                    collection: "collector_drive".to_string(),
                    content: String::new(),
                    metadata,
                    embedding: None,
                },
                source: Source::Drive,
                score,
            }
        };
        let out = dedup_chunks(vec![make("c0", 0.8), make("c1", 0.7), make("c2", 0.6)]);
        assert_eq!(out.len(), 1);
        // Max chunk score times 1 + min(0.15, 0.05·ln 3) ≈ ×1.055
        let expected = 0.8 * (1.0 + 0.05 * 3f64.ln());
        assert!((out[0].score - expected).abs() < 1e-9);
    }

    #[test]
    fn rrf_both_legs_rank_one_is_max() {
        let chunk = StoredChunk {
            id: "c1".to_string(),
            collection: "collector_jira".to_string(),
            content: String::new(),
            metadata: Metadata::new(),
            embedding: None,
        };
        let make = |score| Candidate {
            chunk: chunk.clone(),
            source: Source::Jira,
            score,
        };
        let fused = fuse_rrf(vec![make(0.9)], vec![make(0.8)]);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn search_returns_scores_in_unit_range() {
        let (_tmp, engine, store) = test_engine().await;
        store
            .upsert_documents(
                Source::Jira,
                &[
                    doc(Source::Jira, "jira_A", "Sync engine bug", "The cursor sync engine drops pages.", "2024-06-01T00:00:00Z"),
                    doc(Source::Jira, "jira_B", "Unrelated", "Totally different topic.", "2024-06-01T00:00:00Z"),
                ],
            )
            .await
            .unwrap();

        for search_type in [SearchType::Vector, SearchType::Keyword, SearchType::Hybrid] {
            let response = engine
                .search(&request("cursor sync engine", search_type))
                .await
                .unwrap();
            for result in &response.results {
                assert!(
                    (0.0..=1.0).contains(&result.score),
                    "{:?} score out of range: {}",
                    search_type,
                    result.score
                );
            }
        }
    }

    #[tokio::test]
    async fn keyword_search_finds_containing_doc() {
        let (_tmp, engine, store) = test_engine().await;
        store
            .upsert_documents(
                Source::Confluence,
                &[
                    doc(Source::Confluence, "confluence_1", "Deploy guide", "How to deploy the retrieval service.", "2024-06-01T00:00:00Z"),
                    doc(Source::Confluence, "confluence_2", "Lunch menu", "Sandwiches on Tuesday.", "2024-06-01T00:00:00Z"),
                ],
            )
            .await
            .unwrap();

        let response = engine
            .search(&request("deploy retrieval", SearchType::Keyword))
            .await
            .unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].id, "confluence_1");
    }

    #[tokio::test]
    async fn title_exact_match_outranks_body_mention() {
        let (_tmp, engine, store) = test_engine().await;
        let recent = crate::models::now_iso();
        store
            .upsert_documents(
                Source::Jira,
                &[doc(Source::Jira, "jira_X", "Quarterly Review", "Numbers for the quarterly review period.", &recent)],
            )
            .await
            .unwrap();
        store
            .upsert_documents(
                Source::Slack,
                &[doc(Source::Slack, "slack_Y", "Misc", "someone mentioned the quarterly review in passing six months back", "2024-01-01T00:00:00Z")],
            )
            .await
            .unwrap();

        let response = engine
            .search(&request("quarterly review", SearchType::Hybrid))
            .await
            .unwrap();
        assert!(response.results.len() >= 2);
        assert_eq!(response.results[0].id, "jira_X");
    }

    #[tokio::test]
    async fn multi_chunk_doc_dedupes_to_single_result() {
        let (_tmp, engine, store) = test_engine().await;
        let body = "The navigation subsystem exposes traversal. ".repeat(300);
        store
            .upsert_documents(
                Source::Drive,
                &[doc(Source::Drive, "drive_BIG", "Navigation design", &body, "2024-06-01T00:00:00Z")],
            )
            .await
            .unwrap();

        let response = engine
            .search(&request("navigation subsystem traversal", SearchType::Keyword))
            .await
            .unwrap();
        let parents: Vec<_> = response
            .results
            .iter()
            .filter(|r| {
                r.metadata
                    .get("parentDocId")
                    .and_then(|v| v.as_str())
                    .map(|p| p == "drive_BIG")
                    .unwrap_or(false)
            })
            .collect();
        assert_eq!(parents.len(), 1, "expected one result per parent doc");
    }

    #[tokio::test]
    async fn where_clause_filters_by_metadata() {
        let (_tmp, engine, store) = test_engine().await;
        let mut a = doc(Source::Jira, "jira_P1", "Ticket one", "shared keyword body", "2024-06-01T00:00:00Z");
        a.metadata.insert("project".to_string(), "ENG".into());
        let mut b = doc(Source::Jira, "jira_P2", "Ticket two", "shared keyword body", "2024-06-01T00:00:00Z");
        b.metadata.insert("project".to_string(), "OPS".into());
        store.upsert_documents(Source::Jira, &[a, b]).await.unwrap();

        let mut req = request("shared keyword", SearchType::Keyword);
        req.where_clause
            .insert("project".to_string(), serde_json::json!("ENG"));
        let response = engine.search(&req).await.unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].id, "jira_P1");
    }

    #[tokio::test]
    async fn date_range_filters_on_created_ts() {
        let (_tmp, engine, store) = test_engine().await;
        store
            .upsert_documents(
                Source::Jira,
                &[
                    doc(Source::Jira, "jira_OLD", "Old", "range filter target", "2023-01-15T00:00:00Z"),
                    doc(Source::Jira, "jira_NEW", "New", "range filter target", "2024-06-15T00:00:00Z"),
                ],
            )
            .await
            .unwrap();

        let mut req = request("range filter", SearchType::Keyword);
        req.start_date = Some("2024-01-01".to_string());
        req.end_date = Some("2024-12-31".to_string());
        let response = engine.search(&req).await.unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].id, "jira_NEW");
    }

    #[tokio::test]
    async fn offset_pagination() {
        let (_tmp, engine, store) = test_engine().await;
        let docs: Vec<Document> = (0..5)
            .map(|i| {
                doc(
                    Source::Jira,
                    &format!("jira_{}", i),
                    "Paging",
                    "pagination probe body",
                    "2024-06-01T00:00:00Z",
                )
            })
            .collect();
        store.upsert_documents(Source::Jira, &docs).await.unwrap();

        let mut req = request("pagination probe", SearchType::Keyword);
        req.limit = 2;
        let first = engine.search(&req).await.unwrap();
        assert_eq!(first.results.len(), 2);
        assert_eq!(first.total, 5);

        req.offset = 2;
        let second = engine.search(&req).await.unwrap();
        assert_eq!(second.results.len(), 2);
        assert_ne!(first.results[0].id, second.results[0].id);
    }

    #[tokio::test]
    async fn empty_query_returns_nothing() {
        let (_tmp, engine, _store) = test_engine().await;
        let response = engine.search(&request("   ", SearchType::Vector)).await.unwrap();
        assert!(response.results.is_empty());
        assert_eq!(response.total, 0);
    }
}
