//! Graph-like navigation across chunks, datapoints, and source contexts.
//!
//! Given a stored document (or chunk) id, exposes prev/next/siblings/
//! parent/children traversal at three scopes:
//!
//! - **chunk** — within one document's chunk sequence (`parentDocId` +
//!   `chunkIndex`).
//! - **datapoint** — within the source-native logical unit (a thread, a
//!   ticket's project, a folder), ordered by the source's timestamp field.
//! - **context** — within the broader container (channel, space, repo).
//!
//! `parent` and `children` are structural and scope-independent.

use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::models::{parse_timestamp_ms, Metadata, Source};
use crate::vector_store::{StoredChunk, VectorStore};

pub const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Prev,
    Next,
    Siblings,
    Parent,
    Children,
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prev" => Ok(Direction::Prev),
            "next" => Ok(Direction::Next),
            "siblings" => Ok(Direction::Siblings),
            "parent" => Ok(Direction::Parent),
            "children" => Ok(Direction::Children),
            other => anyhow::bail!("Unknown direction: '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    Chunk,
    Datapoint,
    Context,
}

impl FromStr for Scope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chunk" => Ok(Scope::Chunk),
            "datapoint" => Ok(Scope::Datapoint),
            "context" => Ok(Scope::Context),
            other => anyhow::bail!("Unknown scope: '{}'", other),
        }
    }
}

/// A document as surfaced by navigation (no score attached).
#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    pub id: String,
    pub source: Source,
    pub content: String,
    pub metadata: Metadata,
}

impl DocumentView {
    fn from_chunk(chunk: StoredChunk) -> Result<Self> {
        let source = chunk
            .collection
            .strip_prefix("collector_")
            .unwrap_or(&chunk.collection)
            .parse::<Source>()?;
        Ok(Self {
            id: chunk.id,
            source,
            content: chunk.content,
            metadata: chunk.metadata,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationInfo {
    pub has_prev: bool,
    pub has_next: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub context_type: String,
    pub total_siblings: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NavigateResponse {
    pub current: DocumentView,
    pub related: Vec<DocumentView>,
    pub navigation: NavigationInfo,
}

pub struct Navigator {
    store: VectorStore,
}

impl Navigator {
    pub fn new(store: VectorStore) -> Self {
        Self { store }
    }

    pub async fn navigate(
        &self,
        document_id: &str,
        direction: Direction,
        scope: Scope,
        limit: usize,
    ) -> Result<NavigateResponse> {
        let limit = if limit == 0 { DEFAULT_LIMIT } else { limit };

        let current_chunk = self
            .store
            .find_chunk(document_id)
            .await?
            .with_context(|| format!("document not found: {}", document_id))?;
        let current = DocumentView::from_chunk(current_chunk.clone())?;
        let source = current.source;

        let related_chunks = match direction {
            Direction::Parent => self.find_parent(&current_chunk, source).await?,
            Direction::Children => self.find_children(&current_chunk, source, limit).await?,
            Direction::Prev | Direction::Next | Direction::Siblings => match scope {
                Scope::Chunk => {
                    self.chunk_scope(&current_chunk, direction, limit).await?
                }
                Scope::Datapoint | Scope::Context => {
                    self.group_scope(&current_chunk, source, direction, scope, limit)
                        .await?
                }
            },
        };

        let navigation = self
            .navigation_info(&current_chunk, source, scope)
            .await?;

        let related = related_chunks
            .into_iter()
            .map(DocumentView::from_chunk)
            .collect::<Result<Vec<_>>>()?;

        Ok(NavigateResponse {
            current,
            related,
            navigation,
        })
    }

    // ============ Structural: parent / children ============

    async fn find_parent(
        &self,
        current: &StoredChunk,
        source: Source,
    ) -> Result<Vec<StoredChunk>> {
        // A chunk's parent is its document.
        if let Some(parent_doc) = current.parent_doc_id() {
            if let Some(chunk) = self.store.find_chunk(parent_doc).await? {
                return Ok(vec![chunk]);
            }
            // Multi-chunk documents have no top-level row; fall back to the
            // first chunk as the document's face.
            let collection = current.collection.clone();
            let chunks = self.store.chunks_by_parent(&collection, parent_doc).await?;
            return Ok(chunks.into_iter().take(1).collect());
        }

        let Some(parent_id) = resolved_parent_id(current, source) else {
            return Ok(Vec::new());
        };
        Ok(self.store.find_chunk(&parent_id).await?.into_iter().collect())
    }

    async fn find_children(
        &self,
        current: &StoredChunk,
        source: Source,
        limit: usize,
    ) -> Result<Vec<StoredChunk>> {
        let logical = logical_id(&current.id, source);
        let all = self.store.scan(source, false).await?;

        let mut children: Vec<StoredChunk> = all
            .into_iter()
            .filter(|c| {
                let by_parent_field = c
                    .metadata
                    .get("parentId")
                    .and_then(|v| v.as_str())
                    .map(|p| p == current.id || p == logical)
                    .unwrap_or(false);
                let by_chunk_link = c.parent_doc_id() == Some(current.id.as_str());
                by_parent_field || by_chunk_link
            })
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        children.truncate(limit);
        Ok(children)
    }

    // ============ Chunk scope ============

    async fn chunk_scope(
        &self,
        current: &StoredChunk,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<StoredChunk>> {
        let Some(parent) = current.parent_doc_id().map(|p| p.to_string()) else {
            return Ok(Vec::new());
        };
        let siblings = self
            .store
            .chunks_by_parent(&current.collection, &parent)
            .await?;

        match direction {
            Direction::Siblings => Ok(siblings),
            Direction::Prev | Direction::Next => {
                let index = chunk_index(current).unwrap_or(0);
                let wanted = if direction == Direction::Prev {
                    index.checked_sub(1)
                } else {
                    Some(index + 1)
                };
                Ok(siblings
                    .into_iter()
                    .filter(|c| chunk_index(c) == wanted)
                    .take(limit)
                    .collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    // ============ Datapoint / context scope ============

    async fn group_scope(
        &self,
        current: &StoredChunk,
        source: Source,
        direction: Direction,
        scope: Scope,
        limit: usize,
    ) -> Result<Vec<StoredChunk>> {
        let group = self.load_group(current, source, scope).await?;
        let position = group.iter().position(|c| c.id == current.id);

        Ok(match direction {
            Direction::Siblings => group
                .into_iter()
                .filter(|c| c.id != current.id)
                .take(limit)
                .collect(),
            Direction::Prev => {
                let end = position.unwrap_or(0);
                let start = end.saturating_sub(limit);
                group[start..end].to_vec()
            }
            Direction::Next => {
                let start = position.map(|p| p + 1).unwrap_or(group.len());
                group
                    .into_iter()
                    .skip(start)
                    .take(limit)
                    .collect()
            }
            _ => Vec::new(),
        })
    }

    /// Load the current document's group for a scope, sorted by the
    /// source's timestamp field then id.
    async fn load_group(
        &self,
        current: &StoredChunk,
        source: Source,
        scope: Scope,
    ) -> Result<Vec<StoredChunk>> {
        let key = match scope {
            Scope::Datapoint => datapoint_group_key(source, &current.metadata),
            _ => context_group_key(source, &current.metadata),
        };

        let all = self.store.scan(source, false).await?;
        let mut group: Vec<StoredChunk> = match key {
            GroupKey::All => all,
            GroupKey::Field(field, value) => all
                .into_iter()
                .filter(|c| {
                    c.metadata
                        .get(&field)
                        .and_then(|v| v.as_str())
                        .map(|v| v == value)
                        .unwrap_or(false)
                })
                .collect(),
            GroupKey::FolderOfPath(dir) => all
                .into_iter()
                .filter(|c| folder_of_path(&c.metadata).as_deref() == Some(dir.as_str()))
                .collect(),
            GroupKey::None => Vec::new(),
        };

        let ts_field = timestamp_field(source);
        group.sort_by(|a, b| {
            let ta = group_timestamp(a, ts_field);
            let tb = group_timestamp(b, ts_field);
            ta.cmp(&tb).then_with(|| a.id.cmp(&b.id))
        });
        Ok(group)
    }

    async fn navigation_info(
        &self,
        current: &StoredChunk,
        source: Source,
        scope: Scope,
    ) -> Result<NavigationInfo> {
        let (has_prev, has_next, total_siblings) = match scope {
            Scope::Chunk => match current.parent_doc_id() {
                Some(parent) => {
                    let siblings = self
                        .store
                        .chunks_by_parent(&current.collection, parent)
                        .await?;
                    let index = chunk_index(current).unwrap_or(0);
                    let total = total_chunks(current).unwrap_or(siblings.len());
                    (index > 0, index + 1 < total, siblings.len())
                }
                None => (false, false, 0),
            },
            Scope::Datapoint | Scope::Context => {
                let group = self.load_group(current, source, scope).await?;
                let position = group.iter().position(|c| c.id == current.id);
                let total = group.len().saturating_sub(1);
                match position {
                    Some(p) => (p > 0, p + 1 < group.len(), total),
                    None => (false, false, total),
                }
            }
        };

        Ok(NavigationInfo {
            has_prev,
            has_next,
            parent_id: resolved_parent_id(current, source)
                .or_else(|| current.parent_doc_id().map(|p| p.to_string())),
            context_type: context_type(source, &current.metadata).to_string(),
            total_siblings,
        })
    }
}

enum GroupKey {
    Field(String, String),
    /// Group by the directory of each document's `path` metadata.
    FolderOfPath(String),
    All,
    None,
}

fn meta_str<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(|v| v.as_str())
}

/// Directory portion of a document's `path` metadata ("" for root files).
fn folder_of_path(metadata: &Metadata) -> Option<String> {
    let path = meta_str(metadata, "path")?;
    Some(
        path.rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or_default(),
    )
}

/// Source-specific logical grouping at `scope = datapoint`.
fn datapoint_group_key(source: Source, metadata: &Metadata) -> GroupKey {
    let field_or = |primary: &str, fallback: &str| -> GroupKey {
        if let Some(v) = meta_str(metadata, primary) {
            GroupKey::Field(primary.to_string(), v.to_string())
        } else if let Some(v) = meta_str(metadata, fallback) {
            GroupKey::Field(fallback.to_string(), v.to_string())
        } else {
            GroupKey::None
        }
    };
    match source {
        Source::Slack => field_or("threadTs", "channelId"),
        Source::Gmail => field_or("threadId", "threadId"),
        Source::Jira => field_or("parentId", "project"),
        Source::Drive => match meta_str(metadata, "folderPath") {
            Some(v) => GroupKey::Field("folderPath".to_string(), v.to_string()),
            None => match folder_of_path(metadata) {
                Some(dir) => GroupKey::FolderOfPath(dir),
                None => GroupKey::None,
            },
        },
        Source::Confluence => field_or("parentId", "space"),
        Source::Calendar => GroupKey::All,
        Source::Github => field_or("parentId", "repo"),
    }
}

/// Broader grouping at `scope = context`.
fn context_group_key(source: Source, metadata: &Metadata) -> GroupKey {
    let field = |key: &str| -> GroupKey {
        match meta_str(metadata, key) {
            Some(v) => GroupKey::Field(key.to_string(), v.to_string()),
            None => GroupKey::None,
        }
    };
    match source {
        Source::Slack => field("channelId"),
        Source::Gmail => field("threadId"),
        Source::Jira => field("project"),
        Source::Drive => field("folderPath"),
        Source::Confluence => field("space"),
        Source::Calendar => field("calendarId"),
        Source::Github => field("repo"),
    }
}

/// The timestamp field that orders a source's datapoints.
fn timestamp_field(source: Source) -> &'static str {
    match source {
        Source::Slack => "timestamp",
        Source::Gmail => "createdAt",
        Source::Calendar => "start",
        _ => "updatedAt",
    }
}

fn group_timestamp(chunk: &StoredChunk, field: &str) -> i64 {
    meta_str(&chunk.metadata, field)
        .and_then(parse_timestamp_ms)
        .unwrap_or(0)
}

fn chunk_index(chunk: &StoredChunk) -> Option<usize> {
    chunk
        .metadata
        .get("chunkIndex")
        .and_then(|v| v.as_f64())
        .map(|n| n as usize)
}

fn total_chunks(chunk: &StoredChunk) -> Option<usize> {
    chunk
        .metadata
        .get("totalChunks")
        .and_then(|v| v.as_f64())
        .map(|n| n as usize)
}

/// Resolve a document's structural parent id per the source rule.
///
/// Confluence comments store the raw container id and need the document-id
/// prefix composed; everything else stores the parent id as-is.
fn resolved_parent_id(chunk: &StoredChunk, source: Source) -> Option<String> {
    let parent = meta_str(&chunk.metadata, "parentId")?;
    let is_comment =
        source == Source::Confluence && meta_str(&chunk.metadata, "type") == Some("comment");
    if is_comment {
        Some(format!("confluence_{}", parent))
    } else {
        Some(parent.to_string())
    }
}

/// The id children reference: the stored id with the source prefix
/// stripped, for sources that link by native ids.
fn logical_id(id: &str, source: Source) -> String {
    id.strip_prefix(&format!("{}_", source.as_str()))
        .unwrap_or(id)
        .to_string()
}

/// Source-specific label for the surrounding context.
fn context_type(source: Source, metadata: &Metadata) -> &'static str {
    match source {
        Source::Slack => {
            if metadata.contains_key("threadTs") {
                "thread"
            } else {
                "channel"
            }
        }
        Source::Gmail => "thread",
        Source::Jira => "project",
        Source::Drive => "folder",
        Source::Confluence => "space",
        Source::Calendar => "calendar",
        Source::Github => "repo",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::models::{Document, Metadata};

    async fn test_navigator() -> (tempfile::TempDir, Navigator, VectorStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::migrate::open(&tmp.path().join("kc.sqlite")).await.unwrap();
        let store = VectorStore::new(pool, EmbeddingConfig::default());
        (tmp, Navigator::new(store.clone()), store)
    }

    fn doc(source: Source, id: &str, fields: &[(&str, &str)], content: &str) -> Document {
        let mut metadata = Metadata::new();
        metadata.insert("id".to_string(), id.into());
        metadata.insert("source".to_string(), source.as_str().into());
        for (k, v) in fields {
            metadata.insert(k.to_string(), (*v).into());
        }
        Document {
            id: id.to_string(),
            source,
            content: content.to_string(),
            metadata,
            pre_chunked: None,
        }
    }

    #[tokio::test]
    async fn missing_document_is_an_error() {
        let (_tmp, nav, _store) = test_navigator().await;
        let err = nav
            .navigate("nope", Direction::Next, Scope::Chunk, 10)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn chunk_prev_next_and_siblings() {
        let (_tmp, nav, store) = test_navigator().await;
        let body = "A long sentence about chunk traversal order. ".repeat(200);
        store
            .upsert_documents(Source::Drive, &[doc(Source::Drive, "drive_DOC", &[], &body)])
            .await
            .unwrap();

        let siblings = nav
            .navigate("drive_DOC_chunk_1", Direction::Siblings, Scope::Chunk, 50)
            .await
            .unwrap();
        let sibling_count = siblings.related.len();
        assert!(sibling_count > 1);
        // Exactly the set sharing parentDocId.
        for item in &siblings.related {
            assert_eq!(
                item.metadata.get("parentDocId").and_then(|v| v.as_str()),
                Some("drive_DOC")
            );
        }
        assert_eq!(siblings.navigation.total_siblings, sibling_count);

        let prev = nav
            .navigate("drive_DOC_chunk_1", Direction::Prev, Scope::Chunk, 10)
            .await
            .unwrap();
        assert_eq!(prev.related.len(), 1);
        assert_eq!(prev.related[0].id, "drive_DOC_chunk_0");
        assert!(prev.navigation.has_prev);
        assert!(prev.navigation.has_next);

        let next = nav
            .navigate("drive_DOC_chunk_0", Direction::Next, Scope::Chunk, 10)
            .await
            .unwrap();
        assert_eq!(next.related.len(), 1);
        assert_eq!(next.related[0].id, "drive_DOC_chunk_1");
        assert!(!next.navigation.has_prev);
    }

    #[tokio::test]
    async fn slack_datapoint_is_thread_ordered_by_timestamp() {
        let (_tmp, nav, store) = test_navigator().await;
        let docs: Vec<Document> = (0..3)
            .map(|i| {
                doc(
                    Source::Slack,
                    &format!("slack_C1_{}", i),
                    &[
                        ("channelId", "C1"),
                        ("threadTs", "111.0"),
                        ("timestamp", &format!("2024-06-01T00:0{}:00Z", i)),
                    ],
                    &format!("message {}", i),
                )
            })
            .collect();
        store.upsert_documents(Source::Slack, &docs).await.unwrap();

        let response = nav
            .navigate("slack_C1_1", Direction::Next, Scope::Datapoint, 10)
            .await
            .unwrap();
        assert_eq!(response.related.len(), 1);
        assert_eq!(response.related[0].id, "slack_C1_2");
        assert_eq!(response.navigation.context_type, "thread");
        assert!(response.navigation.has_prev);
        assert!(response.navigation.has_next);
        assert_eq!(response.navigation.total_siblings, 2);
    }

    #[tokio::test]
    async fn drive_datapoint_groups_by_folder_path() {
        let (_tmp, nav, store) = test_navigator().await;
        store
            .upsert_documents(
                Source::Drive,
                &[
                    doc(Source::Drive, "drive_A", &[("folderPath", "/Eng/Runbooks"), ("updatedAt", "2024-06-01T00:00:00Z")], "a"),
                    doc(Source::Drive, "drive_B", &[("folderPath", "/Eng/Runbooks"), ("updatedAt", "2024-06-02T00:00:00Z")], "b"),
                    doc(Source::Drive, "drive_C", &[("folderPath", "/Sales"), ("updatedAt", "2024-06-03T00:00:00Z")], "c"),
                ],
            )
            .await
            .unwrap();

        let response = nav
            .navigate("drive_A", Direction::Siblings, Scope::Datapoint, 10)
            .await
            .unwrap();
        assert_eq!(response.related.len(), 1);
        assert_eq!(response.related[0].id, "drive_B");
        assert_eq!(response.navigation.context_type, "folder");
    }

    #[tokio::test]
    async fn drive_falls_back_to_folder_of_path() {
        let (_tmp, nav, store) = test_navigator().await;
        store
            .upsert_documents(
                Source::Drive,
                &[
                    doc(Source::Drive, "drive_X", &[("path", "reports/q1.md"), ("updatedAt", "2024-06-01T00:00:00Z")], "x"),
                    doc(Source::Drive, "drive_Y", &[("path", "reports/q2.md"), ("updatedAt", "2024-06-02T00:00:00Z")], "y"),
                    doc(Source::Drive, "drive_Z", &[("path", "notes/z.md"), ("updatedAt", "2024-06-03T00:00:00Z")], "z"),
                ],
            )
            .await
            .unwrap();

        let response = nav
            .navigate("drive_X", Direction::Siblings, Scope::Datapoint, 10)
            .await
            .unwrap();
        assert_eq!(response.related.len(), 1);
        assert_eq!(response.related[0].id, "drive_Y");
    }

    #[tokio::test]
    async fn jira_context_groups_by_project() {
        let (_tmp, nav, store) = test_navigator().await;
        store
            .upsert_documents(
                Source::Jira,
                &[
                    doc(Source::Jira, "jira_E1", &[("project", "ENG"), ("updatedAt", "2024-06-01T00:00:00Z")], "one"),
                    doc(Source::Jira, "jira_E2", &[("project", "ENG"), ("updatedAt", "2024-06-02T00:00:00Z")], "two"),
                    doc(Source::Jira, "jira_O1", &[("project", "OPS"), ("updatedAt", "2024-06-03T00:00:00Z")], "other"),
                ],
            )
            .await
            .unwrap();

        let response = nav
            .navigate("jira_E1", Direction::Siblings, Scope::Context, 10)
            .await
            .unwrap();
        assert_eq!(response.related.len(), 1);
        assert_eq!(response.related[0].id, "jira_E2");
        assert_eq!(response.navigation.context_type, "project");
    }

    #[tokio::test]
    async fn parent_and_children_are_structural() {
        let (_tmp, nav, store) = test_navigator().await;
        store
            .upsert_documents(
                Source::Github,
                &[
                    doc(Source::Github, "github_repo_acme_platform", &[("repo", "acme/platform"), ("type", "repository")], "repo doc"),
                    doc(
                        Source::Github,
                        "github_pr_acme_platform_1",
                        &[("repo", "acme/platform"), ("type", "pull_request"), ("parentId", "github_repo_acme_platform")],
                        "pr doc",
                    ),
                ],
            )
            .await
            .unwrap();

        let parent = nav
            .navigate("github_pr_acme_platform_1", Direction::Parent, Scope::Datapoint, 10)
            .await
            .unwrap();
        assert_eq!(parent.related.len(), 1);
        assert_eq!(parent.related[0].id, "github_repo_acme_platform");

        let children = nav
            .navigate("github_repo_acme_platform", Direction::Children, Scope::Chunk, 10)
            .await
            .unwrap();
        assert_eq!(children.related.len(), 1);
        assert_eq!(children.related[0].id, "github_pr_acme_platform_1");
    }

    #[tokio::test]
    async fn confluence_comment_parent_is_composed() {
        let (_tmp, nav, store) = test_navigator().await;
        store
            .upsert_documents(
                Source::Confluence,
                &[
                    doc(Source::Confluence, "confluence_100", &[("type", "page"), ("space", "ENG")], "the page"),
                    doc(
                        Source::Confluence,
                        "confluence_777",
                        &[("type", "comment"), ("space", "ENG"), ("parentId", "100")],
                        "a comment",
                    ),
                ],
            )
            .await
            .unwrap();

        let response = nav
            .navigate("confluence_777", Direction::Parent, Scope::Datapoint, 10)
            .await
            .unwrap();
        assert_eq!(response.related.len(), 1);
        assert_eq!(response.related[0].id, "confluence_100");
        assert_eq!(
            response.navigation.parent_id.as_deref(),
            Some("confluence_100")
        );
    }
}
