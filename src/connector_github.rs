//! GitHub connector.
//!
//! A three-phase state machine per sync cycle, stored in `sync_token`:
//!
//! 1. **repos** — list the account's repositories (or the requested set).
//! 2. **prs** — page each repo's pull requests, newest-updated first,
//!    stopping at the incremental watermark.
//! 3. **files** — walk each repo's file tree, filtered by the skip lists,
//!    and fetch file contents in small concurrent batches. Only runs when
//!    `indexFiles` is set.
//!
//! File ids include the blob sha, so a changed file gets a new id and a
//! rename mints a fresh document; deletions are not observed.
//!
//! Credentials: `GITHUB_TOKEN`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use futures::future::join_all;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{Config, GithubConfig};
use crate::connector::{
    http_client, is_stale_token_error, is_stale_token_status, without_sync_token, Connector,
    ConnectorResult, CursorUpdate, FetchRequest, StaleTokenError,
};
use crate::file_processor::{process_file, FileInput};
use crate::models::{Cursor, Document, MetaValue, Metadata, Source};

const API: &str = "https://api.github.com";
const PAGE_SIZE: usize = 50;
/// Files fetched per cursor batch.
const FILES_PER_BATCH: usize = 50;
/// Concurrent content downloads within a batch.
const FILE_FETCH_CONCURRENCY: usize = 5;
/// Pause between concurrent download groups.
const FILE_FETCH_DELAY_MS: u64 = 200;
/// Files larger than this are skipped.
const MAX_FILE_SIZE: u64 = 512 * 1024;

const SKIP_DIRECTORIES: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    "out",
    "vendor",
    "target",
    "__pycache__",
    ".next",
    ".idea",
    "coverage",
];

const SKIP_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "mp4", "mp3", "wav", "pdf", "zip", "gz",
    "tar", "7z", "jar", "exe", "dll", "so", "dylib", "woff", "woff2", "ttf", "eot", "bin",
    "class", "o", "a",
];

const SKIP_FILENAMES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.lock",
    "Gemfile.lock",
    "poetry.lock",
    "composer.lock",
    ".DS_Store",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    path: String,
    sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "phase")]
enum Phase {
    Repos {
        page: usize,
        #[serde(default)]
        repos: Vec<String>,
    },
    Prs {
        repos: Vec<String>,
        repo_index: usize,
        page: usize,
    },
    Files {
        repos: Vec<String>,
        repo_index: usize,
        #[serde(default)]
        queue: Vec<FileEntry>,
        offset: usize,
    },
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Repos {
            page: 1,
            repos: Vec::new(),
        }
    }
}

pub struct GithubConnector {
    config: Option<GithubConfig>,
    token: Option<String>,
}

impl GithubConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.connectors.github.clone(),
            token: std::env::var("GITHUB_TOKEN").ok(),
        }
    }

    async fn get_json(
        &self,
        client: &reqwest::Client,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value> {
        let token = self.token.as_deref().context("GITHUB_TOKEN not set")?;
        let response = client
            .get(url)
            .bearer_auth(token)
            .header("User-Agent", "knowledge-collector")
            .header("Accept", "application/vnd.github+json")
            .query(query)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        if status >= 400 {
            if is_stale_token_status(status, &body) {
                return Err(anyhow::Error::new(StaleTokenError(format!(
                    "github rejected request ({})",
                    status
                ))));
            }
            anyhow::bail!("GitHub API error ({}): {}", status, body);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn fetch_page(
        &self,
        cursor: Option<&Cursor>,
        request: &FetchRequest,
    ) -> Result<ConnectorResult> {
        let config = self.config.as_ref().context("github is not configured")?;
        let client = http_client()?;

        let state: Phase = cursor
            .and_then(|c| c.sync_token.as_deref())
            .and_then(|t| serde_json::from_str(t).ok())
            .unwrap_or_default();

        let index_files = request.index_files.unwrap_or(config.index_files);

        match state {
            Phase::Repos { page, mut repos } => {
                // An explicit repo filter skips the listing phase entirely.
                if let Some(requested) = &request.repos {
                    if !requested.is_empty() {
                        let next = Phase::Prs {
                            repos: requested.clone(),
                            repo_index: 0,
                            page: 1,
                        };
                        return Ok(phase_result(Vec::new(), next, true, None));
                    }
                }

                let listing = self
                    .get_json(
                        &client,
                        &format!("{}/user/repos", API),
                        &[
                            ("per_page", PAGE_SIZE.to_string()),
                            ("page", page.to_string()),
                            ("sort", "updated".to_string()),
                        ],
                    )
                    .await?;

                let items = listing.as_array().cloned().unwrap_or_default();
                let mut documents = Vec::new();
                for repo in &items {
                    if let Some(full_name) = repo.get("full_name").and_then(|n| n.as_str()) {
                        repos.push(full_name.to_string());
                    }
                    if let Some(doc) = repo_to_document(repo) {
                        documents.push(doc);
                    }
                }

                let batch_last_sync = max_updated(&documents);
                let next = if items.len() == PAGE_SIZE {
                    Phase::Repos {
                        page: page + 1,
                        repos,
                    }
                } else {
                    Phase::Prs {
                        repos,
                        repo_index: 0,
                        page: 1,
                    }
                };
                Ok(phase_result(documents, next, true, batch_last_sync))
            }
            Phase::Prs {
                repos,
                repo_index,
                page,
            } => {
                let Some(repo) = repos.get(repo_index).cloned() else {
                    return Ok(ConnectorResult::default());
                };

                let listing = self
                    .get_json(
                        &client,
                        &format!("{}/repos/{}/pulls", API, repo),
                        &[
                            ("state", "all".to_string()),
                            ("sort", "updated".to_string()),
                            ("direction", "desc".to_string()),
                            ("per_page", PAGE_SIZE.to_string()),
                            ("page", page.to_string()),
                        ],
                    )
                    .await?;

                let items = listing.as_array().cloned().unwrap_or_default();
                let last_sync = cursor.and_then(|c| c.last_sync.as_deref());

                let mut documents = Vec::new();
                let mut reached_watermark = false;
                for pr in &items {
                    let updated = pr.get("updated_at").and_then(|u| u.as_str());
                    if let (Some(updated), Some(watermark)) = (updated, last_sync) {
                        if updated <= watermark {
                            reached_watermark = true;
                            break;
                        }
                    }
                    if let Some(doc) = pr_to_document(pr, &repo) {
                        documents.push(doc);
                    }
                }

                let batch_last_sync = max_updated(&documents);
                let repo_done = reached_watermark || items.len() < PAGE_SIZE;
                let next = if !repo_done {
                    Phase::Prs {
                        repos,
                        repo_index,
                        page: page + 1,
                    }
                } else if repo_index + 1 < repos.len() {
                    Phase::Prs {
                        repos,
                        repo_index: repo_index + 1,
                        page: 1,
                    }
                } else if index_files {
                    Phase::Files {
                        repos,
                        repo_index: 0,
                        queue: Vec::new(),
                        offset: 0,
                    }
                } else {
                    return Ok(phase_result(documents, Phase::default(), false, batch_last_sync));
                };
                Ok(phase_result(documents, next, true, batch_last_sync))
            }
            Phase::Files {
                repos,
                repo_index,
                mut queue,
                offset,
            } => {
                let Some(repo) = repos.get(repo_index).cloned() else {
                    return Ok(ConnectorResult::default());
                };

                if queue.is_empty() && offset == 0 {
                    queue = self.list_tree(&client, &repo).await?;
                }

                let offset = offset.min(queue.len());
                let end = (offset + FILES_PER_BATCH).min(queue.len());
                let batch = &queue[offset..end];
                let documents = self.fetch_files(&client, &repo, batch).await;

                let repo_done = end >= queue.len();
                let next = if !repo_done {
                    Phase::Files {
                        repos,
                        repo_index,
                        queue,
                        offset: end,
                    }
                } else if repo_index + 1 < repos.len() {
                    Phase::Files {
                        repos,
                        repo_index: repo_index + 1,
                        queue: Vec::new(),
                        offset: 0,
                    }
                } else {
                    return Ok(phase_result(documents, Phase::default(), false, None));
                };
                Ok(phase_result(documents, next, true, None))
            }
        }
    }

    /// Full recursive tree listing for a repo, filtered to indexable files.
    async fn list_tree(&self, client: &reqwest::Client, repo: &str) -> Result<Vec<FileEntry>> {
        let tree = self
            .get_json(
                client,
                &format!("{}/repos/{}/git/trees/HEAD", API, repo),
                &[("recursive", "1".to_string())],
            )
            .await?;

        let minified = minified_globs();
        let mut entries = Vec::new();
        for node in tree
            .get("tree")
            .and_then(|t| t.as_array())
            .into_iter()
            .flatten()
        {
            if node.get("type").and_then(|t| t.as_str()) != Some("blob") {
                continue;
            }
            let Some(path) = node.get("path").and_then(|p| p.as_str()) else {
                continue;
            };
            let size = node.get("size").and_then(|s| s.as_u64()).unwrap_or(0);
            if !should_index_path(path, size, &minified) {
                continue;
            }
            let Some(sha) = node.get("sha").and_then(|s| s.as_str()) else {
                continue;
            };
            entries.push(FileEntry {
                path: path.to_string(),
                sha: sha.to_string(),
            });
        }
        Ok(entries)
    }

    /// Fetch file contents in concurrency-limited groups with a pacing
    /// delay between groups.
    async fn fetch_files(
        &self,
        client: &reqwest::Client,
        repo: &str,
        batch: &[FileEntry],
    ) -> Vec<Document> {
        let mut documents = Vec::new();
        for (i, group) in batch.chunks(FILE_FETCH_CONCURRENCY).enumerate() {
            if i > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(FILE_FETCH_DELAY_MS)).await;
            }
            let fetches = group
                .iter()
                .map(|entry| self.fetch_one_file(client, repo, entry));
            for result in join_all(fetches).await {
                match result {
                    Ok(Some(doc)) => documents.push(doc),
                    Ok(None) => {}
                    Err(e) => warn!(repo, error = %e, "github: file fetch failed, skipping"),
                }
            }
        }
        documents
    }

    async fn fetch_one_file(
        &self,
        client: &reqwest::Client,
        repo: &str,
        entry: &FileEntry,
    ) -> Result<Option<Document>> {
        let json = self
            .get_json(
                client,
                &format!("{}/repos/{}/contents/{}", API, repo, entry.path),
                &[],
            )
            .await?;

        let Some(encoded) = json.get("content").and_then(|c| c.as_str()) else {
            return Ok(None);
        };
        let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(cleaned) else {
            return Ok(None);
        };
        let Ok(text) = String::from_utf8(bytes) else {
            return Ok(None);
        };

        let Some(processed) = process_file(FileInput::Text(&text), &entry.path, None) else {
            return Ok(None);
        };

        Ok(Some(file_to_document(repo, entry, processed)))
    }
}

#[async_trait]
impl Connector for GithubConnector {
    fn source(&self) -> Source {
        Source::Github
    }

    fn is_configured(&self) -> bool {
        self.config.is_some() && self.token.is_some()
    }

    async fn fetch(
        &self,
        cursor: Option<&Cursor>,
        request: &FetchRequest,
    ) -> Result<ConnectorResult> {
        match self.fetch_page(cursor, request).await {
            Err(e) if is_stale_token_error(&e) && cursor.is_some() => {
                warn!(error = %e, "github: retrying without sync token");
                let stripped = without_sync_token(cursor);
                self.fetch_page(stripped.as_ref(), request).await
            }
            other => other,
        }
    }

    async fn discover(&self) -> Result<Vec<crate::connector::DiscoveryItem>> {
        let client = http_client()?;
        let listing = self
            .get_json(
                &client,
                &format!("{}/user/repos", API),
                &[
                    ("per_page", "100".to_string()),
                    ("sort", "updated".to_string()),
                ],
            )
            .await?;
        Ok(listing
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|repo| {
                let full_name = repo.get("full_name")?.as_str()?;
                Some(crate::connector::DiscoveryItem {
                    id: full_name.to_string(),
                    name: full_name.to_string(),
                })
            })
            .collect())
    }
}

fn phase_result(
    documents: Vec<Document>,
    next: Phase,
    has_more: bool,
    batch_last_sync: Option<String>,
) -> ConnectorResult {
    let sync_token =
        has_more.then(|| serde_json::to_string(&next).expect("phase state serializes"));
    ConnectorResult {
        documents,
        new_cursor: CursorUpdate {
            sync_token,
            metadata: Default::default(),
        },
        has_more,
        batch_last_sync,
    }
}

fn max_updated(documents: &[Document]) -> Option<String> {
    documents
        .iter()
        .filter_map(|d| d.metadata.get("updatedAt").and_then(|v| v.as_str()))
        .max()
        .map(|s| s.to_string())
}

fn minified_globs() -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in ["**/*.min.js", "**/*.min.css", "*.min.js", "*.min.css"] {
        builder.add(Glob::new(pattern).expect("static glob compiles"));
    }
    builder.build().expect("static globset builds")
}

/// File-tree filter: skip vendored directories, binary extensions, lock
/// files, minified bundles, and anything over the size cap.
fn should_index_path(path: &str, size: u64, minified: &GlobSet) -> bool {
    if size > MAX_FILE_SIZE {
        return false;
    }
    if path
        .split('/')
        .any(|segment| SKIP_DIRECTORIES.contains(&segment))
    {
        return false;
    }
    let file_name = path.rsplit('/').next().unwrap_or(path);
    if SKIP_FILENAMES.contains(&file_name) {
        return false;
    }
    if let Some(ext) = file_name.rsplit('.').next() {
        if SKIP_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            return false;
        }
    }
    if minified.is_match(path) {
        return false;
    }
    true
}

fn repo_to_document(repo: &serde_json::Value) -> Option<Document> {
    let full_name = repo.get("full_name")?.as_str()?;
    let description = repo
        .get("description")
        .and_then(|d| d.as_str())
        .unwrap_or("");

    let id = format!("github_repo_{}", full_name.replace('/', "_"));
    let mut metadata = Metadata::new();
    metadata.insert("id".to_string(), id.as_str().into());
    metadata.insert("source".to_string(), "github".into());
    metadata.insert("type".to_string(), "repository".into());
    metadata.insert("title".to_string(), full_name.into());
    metadata.insert("repo".to_string(), full_name.into());
    if let Some(language) = repo.get("language").and_then(|l| l.as_str()) {
        metadata.insert("language".to_string(), language.into());
    }
    if let Some(owner) = repo.pointer("/owner/login").and_then(|o| o.as_str()) {
        metadata.insert("author".to_string(), owner.into());
    }
    if let Some(created) = repo.get("created_at").and_then(|c| c.as_str()) {
        metadata.insert("createdAt".to_string(), created.into());
    }
    if let Some(updated) = repo.get("updated_at").and_then(|u| u.as_str()) {
        metadata.insert("updatedAt".to_string(), updated.into());
    }

    Some(Document {
        id,
        source: Source::Github,
        content: format!("# {}\n\n{}", full_name, description),
        metadata,
        pre_chunked: None,
    })
}

fn pr_to_document(pr: &serde_json::Value, repo: &str) -> Option<Document> {
    let number = pr.get("number")?.as_u64()?;
    let title = pr.get("title").and_then(|t| t.as_str()).unwrap_or("");
    let body = pr.get("body").and_then(|b| b.as_str()).unwrap_or("");

    let id = format!("github_pr_{}_{}", repo.replace('/', "_"), number);
    let mut metadata = Metadata::new();
    metadata.insert("id".to_string(), id.as_str().into());
    metadata.insert("source".to_string(), "github".into());
    metadata.insert("type".to_string(), "pull_request".into());
    metadata.insert(
        "title".to_string(),
        format!("{}#{}: {}", repo, number, title).into(),
    );
    metadata.insert("repo".to_string(), repo.into());
    metadata.insert("number".to_string(), (number as i64).into());
    metadata.insert(
        "parentId".to_string(),
        format!("github_repo_{}", repo.replace('/', "_")).into(),
    );
    if let Some(author) = pr.pointer("/user/login").and_then(|u| u.as_str()) {
        metadata.insert("author".to_string(), author.into());
    }
    let assignees: Vec<String> = pr
        .get("assignees")
        .and_then(|a| a.as_array())
        .into_iter()
        .flatten()
        .filter_map(|a| a.get("login").and_then(|l| l.as_str()))
        .map(|l| l.to_string())
        .collect();
    if !assignees.is_empty() {
        metadata.insert(
            "assignees".to_string(),
            MetaValue::List(assignees.iter().map(|a| a.as_str().into()).collect()),
        );
    }
    if let Some(state) = pr.get("state").and_then(|s| s.as_str()) {
        metadata.insert("state".to_string(), state.into());
    }
    if let Some(created) = pr.get("created_at").and_then(|c| c.as_str()) {
        metadata.insert("createdAt".to_string(), created.into());
    }
    if let Some(updated) = pr.get("updated_at").and_then(|u| u.as_str()) {
        metadata.insert("updatedAt".to_string(), updated.into());
    }

    Some(Document {
        id,
        source: Source::Github,
        content: format!("# {}\n\n{}", title, body),
        metadata,
        pre_chunked: None,
    })
}

fn file_to_document(
    repo: &str,
    entry: &FileEntry,
    processed: crate::file_processor::ProcessedFile,
) -> Document {
    let sha_prefix = &entry.sha[..entry.sha.len().min(8)];
    let id = format!(
        "github_file_{}_{}_{}",
        repo.replace('/', "_"),
        entry.path.replace('/', "_"),
        sha_prefix
    );

    let file_name = entry.path.rsplit('/').next().unwrap_or(&entry.path);
    let mut metadata = Metadata::new();
    metadata.insert("id".to_string(), id.as_str().into());
    metadata.insert("source".to_string(), "github".into());
    metadata.insert("type".to_string(), "file".into());
    metadata.insert("title".to_string(), file_name.into());
    metadata.insert("repo".to_string(), repo.into());
    metadata.insert("path".to_string(), entry.path.as_str().into());
    metadata.insert("fileSha".to_string(), entry.sha.as_str().into());
    metadata.insert(
        "parentId".to_string(),
        format!("github_repo_{}", repo.replace('/', "_")).into(),
    );
    if let Some(language) = &processed.language {
        metadata.insert("language".to_string(), language.as_str().into());
    }

    Document {
        id,
        source: Source::Github,
        content: processed.content,
        metadata,
        pre_chunked: processed.chunks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_rules() {
        let minified = minified_globs();
        assert!(should_index_path("src/main.rs", 100, &minified));
        assert!(!should_index_path("node_modules/pkg/index.js", 100, &minified));
        assert!(!should_index_path("assets/logo.png", 100, &minified));
        assert!(!should_index_path("Cargo.lock", 100, &minified));
        assert!(!should_index_path("dist/app.min.js", 100, &minified));
        assert!(!should_index_path("vendor/lib.js", 100, &minified));
        assert!(!should_index_path("big/file.rs", MAX_FILE_SIZE + 1, &minified));
    }

    #[test]
    fn pr_normalization() {
        let pr = serde_json::json!({
            "number": 17,
            "title": "Add cursor checkpointing",
            "body": "Persists sync state between runs.",
            "state": "open",
            "user": { "login": "octocat" },
            "assignees": [{ "login": "hubot" }],
            "created_at": "2024-06-01T00:00:00Z",
            "updated_at": "2024-06-02T00:00:00Z"
        });
        let doc = pr_to_document(&pr, "acme/platform").unwrap();
        assert_eq!(doc.id, "github_pr_acme_platform_17");
        assert_eq!(doc.metadata["author"].as_str(), Some("octocat"));
        assert_eq!(doc.metadata["repo"].as_str(), Some("acme/platform"));
        assert_eq!(
            doc.metadata["parentId"].as_str(),
            Some("github_repo_acme_platform")
        );
    }

    #[test]
    fn file_id_includes_sha() {
        let entry = FileEntry {
            path: "src/lib.rs".to_string(),
            sha: "abcdef0123456789".to_string(),
        };
        let processed = crate::file_processor::ProcessedFile {
            content: "fn lib() {}".to_string(),
            chunks: None,
            language: Some("rust".to_string()),
        };
        let doc = file_to_document("acme/platform", &entry, processed);
        assert_eq!(doc.id, "github_file_acme_platform_src_lib.rs_abcdef01");
        assert_eq!(doc.metadata["fileSha"].as_str(), Some("abcdef0123456789"));
    }

    #[test]
    fn phase_state_round_trip() {
        let state = Phase::Prs {
            repos: vec!["acme/platform".to_string()],
            repo_index: 0,
            page: 2,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"phase\":\"prs\""));
        let parsed: Phase = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, Phase::Prs { page: 2, .. }));
    }
}
