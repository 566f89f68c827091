//! Google Drive connector.
//!
//! One flat listing filtered by `modifiedTime > lastSync`, paged with
//! Drive's page tokens. When folder filters are set, subfolders are
//! resolved recursively up front (cached per parent) and the resolved set
//! rides in `sync_token` so later pages see the same scope.
//!
//! An invalid page token clears the token and keeps `lastSync`, so the sync
//! restarts the listing without losing the incremental window.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::connector::{
    http_client, is_stale_token_error, without_sync_token, Connector, ConnectorResult,
    CursorUpdate, FetchRequest, StaleTokenError,
};
use crate::file_processor::{process_file, FileInput};
use crate::google_auth::GoogleCredentials;
use crate::models::{Cursor, Document, MetaValue, Metadata, Source};

const API: &str = "https://www.googleapis.com/drive/v3";
const PAGE_SIZE: usize = 50;
const FILE_FIELDS: &str =
    "nextPageToken, files(id, name, mimeType, modifiedTime, createdTime, owners, parents, webViewLink)";
/// Cap on folder-chain walks when composing `folderPath`.
const MAX_FOLDER_DEPTH: usize = 20;

/// One resolved folder: display name plus its immediate parent.
#[derive(Debug, Clone)]
struct FolderNode {
    name: String,
    parent: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PageState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    page_token: Option<String>,
    /// Folder scope resolved from the request, including subfolders.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    folder_ids: Vec<String>,
}

pub struct DriveConnector {
    user_email: Option<String>,
}

impl DriveConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            user_email: config
                .connectors
                .google
                .as_ref()
                .map(|g| g.user_email.clone()),
        }
    }

    async fn list_files(
        &self,
        client: &reqwest::Client,
        token: &str,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<serde_json::Value> {
        let mut params = vec![
            ("q", query.to_string()),
            ("pageSize", PAGE_SIZE.to_string()),
            ("fields", FILE_FIELDS.to_string()),
        ];
        if let Some(pt) = page_token {
            params.push(("pageToken", pt.to_string()));
        }

        let response = client
            .get(format!("{}/files", API))
            .bearer_auth(token)
            .query(&params)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        if status >= 400 {
            // A 400 with a page token present means the token went stale.
            if status == 400 && page_token.is_some() {
                return Err(anyhow::Error::new(StaleTokenError(format!(
                    "drive rejected pageToken ({})",
                    status
                ))));
            }
            anyhow::bail!("Drive list failed ({}): {}", status, body);
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Expand the requested folders to include all nested subfolders.
    ///
    /// Child listings are cached per parent so shared subtrees are only
    /// fetched once.
    async fn resolve_folders(
        &self,
        client: &reqwest::Client,
        token: &str,
        roots: &[String],
    ) -> Result<Vec<String>> {
        let mut resolved: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: Vec<String> = roots.to_vec();
        let mut children_cache: HashMap<String, Vec<String>> = HashMap::new();

        while let Some(folder) = queue.pop() {
            if !seen.insert(folder.clone()) {
                continue;
            }
            resolved.push(folder.clone());

            let children = match children_cache.get(&folder) {
                Some(cached) => cached.clone(),
                None => {
                    let query = format!(
                        "'{}' in parents and mimeType = 'application/vnd.google-apps.folder' and trashed = false",
                        folder
                    );
                    let listing = self.list_files(client, token, &query, None).await?;
                    let ids: Vec<String> = listing
                        .get("files")
                        .and_then(|f| f.as_array())
                        .into_iter()
                        .flatten()
                        .filter_map(|f| f.get("id").and_then(|i| i.as_str()))
                        .map(|i| i.to_string())
                        .collect();
                    children_cache.insert(folder.clone(), ids.clone());
                    ids
                }
            };
            queue.extend(children);
        }

        resolved.sort();
        Ok(resolved)
    }

    /// Look up one folder's name and immediate parent, cached per id for
    /// the life of a fetch.
    async fn folder_node(
        &self,
        client: &reqwest::Client,
        token: &str,
        id: &str,
        cache: &mut HashMap<String, Option<FolderNode>>,
    ) -> Option<FolderNode> {
        if let Some(cached) = cache.get(id) {
            return cached.clone();
        }

        let node = async {
            let response = client
                .get(format!("{}/files/{}", API, id))
                .bearer_auth(token)
                .query(&[("fields", "id, name, parents")])
                .send()
                .await
                .ok()?;
            if !response.status().is_success() {
                return None;
            }
            let json: serde_json::Value = response.json().await.ok()?;
            Some(FolderNode {
                name: json.get("name")?.as_str()?.to_string(),
                parent: json
                    .get("parents")
                    .and_then(|p| p.as_array())
                    .and_then(|p| p.first())
                    .and_then(|p| p.as_str())
                    .map(|p| p.to_string()),
            })
        }
        .await;

        cache.insert(id.to_string(), node.clone());
        node
    }

    /// Join the folder chain above `folder_id` into a `/Team/Docs`-style
    /// path. Best effort: an unreadable ancestor truncates the path there.
    async fn folder_path(
        &self,
        client: &reqwest::Client,
        token: &str,
        folder_id: &str,
        cache: &mut HashMap<String, Option<FolderNode>>,
    ) -> Option<String> {
        let mut segments = Vec::new();
        let mut current = Some(folder_id.to_string());
        while let Some(id) = current {
            if segments.len() >= MAX_FOLDER_DEPTH {
                break;
            }
            let Some(node) = self.folder_node(client, token, &id, cache).await else {
                break;
            };
            segments.push(node.name);
            current = node.parent;
        }
        if segments.is_empty() {
            return None;
        }
        segments.reverse();
        Some(format!("/{}", segments.join("/")))
    }

    /// Download and convert one file; returns `None` for skipped formats.
    async fn fetch_content(
        &self,
        client: &reqwest::Client,
        token: &str,
        file: &serde_json::Value,
    ) -> Result<Option<(String, Option<Vec<String>>, Option<String>)>> {
        let id = file.get("id").and_then(|i| i.as_str()).unwrap_or_default();
        let name = file.get("name").and_then(|n| n.as_str()).unwrap_or(id);
        let mime = file
            .get("mimeType")
            .and_then(|m| m.as_str())
            .unwrap_or("application/octet-stream");

        let processed = if let Some(export_mime) = export_mime_for(mime) {
            let response = client
                .get(format!("{}/files/{}/export", API, id))
                .bearer_auth(token)
                .query(&[("mimeType", export_mime)])
                .send()
                .await?;
            if !response.status().is_success() {
                warn!(file = name, status = %response.status(), "drive export failed, skipping");
                return Ok(None);
            }
            let text = response.text().await?;
            process_file(FileInput::Text(&text), name, Some(export_mime))
        } else if mime.starts_with("application/vnd.google-apps.") {
            // Folders, shortcuts, forms: nothing to index.
            return Ok(None);
        } else {
            let response = client
                .get(format!("{}/files/{}", API, id))
                .bearer_auth(token)
                .query(&[("alt", "media")])
                .send()
                .await?;
            if !response.status().is_success() {
                warn!(file = name, status = %response.status(), "drive download failed, skipping");
                return Ok(None);
            }
            let bytes = response.bytes().await?;
            process_file(FileInput::Bytes(&bytes), name, Some(mime))
        };

        Ok(processed.map(|p| (p.content, p.chunks, p.language)))
    }

    async fn fetch_page(
        &self,
        cursor: Option<&Cursor>,
        request: &FetchRequest,
    ) -> Result<ConnectorResult> {
        let creds = GoogleCredentials::from_env()?;
        let client = http_client()?;
        let token = creds.access_token(&client).await?;

        let mut state: PageState = cursor
            .and_then(|c| c.sync_token.as_deref())
            .and_then(|t| serde_json::from_str(t).ok())
            .unwrap_or_default();

        if state.folder_ids.is_empty() {
            if let Some(roots) = &request.folder_ids {
                if !roots.is_empty() {
                    state.folder_ids = self.resolve_folders(&client, &token, roots).await?;
                }
            }
        }

        let query = build_query(
            cursor.and_then(|c| c.last_sync.as_deref()),
            &state.folder_ids,
        );
        let listing = self
            .list_files(&client, &token, &query, state.page_token.as_deref())
            .await?;

        let files = listing
            .get("files")
            .and_then(|f| f.as_array())
            .cloned()
            .unwrap_or_default();

        let mut documents = Vec::new();
        let mut batch_last_sync: Option<String> = None;
        let mut folder_cache: HashMap<String, Option<FolderNode>> = HashMap::new();
        for file in &files {
            let Some((content, chunks, language)) =
                self.fetch_content(&client, &token, file).await?
            else {
                continue;
            };
            let folder_path = match first_parent(file) {
                Some(parent) => {
                    self.folder_path(&client, &token, parent, &mut folder_cache)
                        .await
                }
                None => None,
            };
            if let Some(doc) = file_to_document(file, content, chunks, language, folder_path) {
                if let Some(updated) = doc.metadata.get("updatedAt").and_then(|v| v.as_str()) {
                    if batch_last_sync.as_deref().map(|b| updated > b).unwrap_or(true) {
                        batch_last_sync = Some(updated.to_string());
                    }
                }
                documents.push(doc);
            }
        }

        let next_page = listing
            .get("nextPageToken")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string());
        let has_more = next_page.is_some();
        state.page_token = next_page;
        let sync_token = has_more.then(|| serde_json::to_string(&state).expect("state serializes"));

        Ok(ConnectorResult {
            documents,
            new_cursor: CursorUpdate {
                sync_token,
                metadata: Default::default(),
            },
            has_more,
            batch_last_sync,
        })
    }
}

#[async_trait]
impl Connector for DriveConnector {
    fn source(&self) -> Source {
        Source::Drive
    }

    fn is_configured(&self) -> bool {
        self.user_email.is_some() && GoogleCredentials::configured()
    }

    async fn fetch(
        &self,
        cursor: Option<&Cursor>,
        request: &FetchRequest,
    ) -> Result<ConnectorResult> {
        match self.fetch_page(cursor, request).await {
            Err(e) if is_stale_token_error(&e) && cursor.is_some() => {
                warn!(error = %e, "drive: clearing page token and retrying");
                let stripped = without_sync_token(cursor);
                self.fetch_page(stripped.as_ref(), request).await
            }
            other => other,
        }
    }

    async fn discover(&self) -> Result<Vec<crate::connector::DiscoveryItem>> {
        let creds = GoogleCredentials::from_env()?;
        let client = http_client()?;
        let token = creds.access_token(&client).await?;
        let listing = self
            .list_files(
                &client,
                &token,
                "mimeType = 'application/vnd.google-apps.folder' and trashed = false",
                None,
            )
            .await?;
        Ok(listing
            .get("files")
            .and_then(|f| f.as_array())
            .into_iter()
            .flatten()
            .filter_map(|folder| {
                Some(crate::connector::DiscoveryItem {
                    id: folder.get("id")?.as_str()?.to_string(),
                    name: folder
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect())
    }
}

/// Export MIME type for Google-native formats.
fn export_mime_for(mime: &str) -> Option<&'static str> {
    match mime {
        "application/vnd.google-apps.document" => Some("text/plain"),
        "application/vnd.google-apps.presentation" => Some("text/plain"),
        "application/vnd.google-apps.spreadsheet" => Some("text/csv"),
        _ => None,
    }
}

fn build_query(last_sync: Option<&str>, folder_ids: &[String]) -> String {
    let mut query = "trashed = false".to_string();
    if let Some(last_sync) = last_sync {
        query.push_str(&format!(" and modifiedTime > '{}'", last_sync));
    }
    if !folder_ids.is_empty() {
        let parents = folder_ids
            .iter()
            .map(|id| format!("'{}' in parents", id))
            .collect::<Vec<_>>()
            .join(" or ");
        query.push_str(&format!(" and ({})", parents));
    }
    query
}

fn first_parent(file: &serde_json::Value) -> Option<&str> {
    file.get("parents")
        .and_then(|p| p.as_array())
        .and_then(|p| p.first())
        .and_then(|p| p.as_str())
}

fn file_to_document(
    file: &serde_json::Value,
    content: String,
    chunks: Option<Vec<String>>,
    language: Option<String>,
    folder_path: Option<String>,
) -> Option<Document> {
    let file_id = file.get("id")?.as_str()?;
    let name = file.get("name").and_then(|n| n.as_str()).unwrap_or(file_id);

    let id = format!("drive_{}", file_id);
    let mut metadata = Metadata::new();
    metadata.insert("id".to_string(), id.as_str().into());
    metadata.insert("source".to_string(), "drive".into());
    metadata.insert("type".to_string(), "file".into());
    metadata.insert("title".to_string(), name.into());
    if let Some(mime) = file.get("mimeType").and_then(|m| m.as_str()) {
        metadata.insert("mimeType".to_string(), mime.into());
    }
    if let Some(owners) = file.get("owners").and_then(|o| o.as_array()) {
        let emails: Vec<String> = owners
            .iter()
            .filter_map(|o| o.get("emailAddress").and_then(|e| e.as_str()))
            .map(|e| e.to_string())
            .collect();
        if let Some(first) = emails.first() {
            metadata.insert("owner".to_string(), first.as_str().into());
        }
        if !emails.is_empty() {
            metadata.insert(
                "owners".to_string(),
                MetaValue::List(emails.iter().map(|e| e.as_str().into()).collect()),
            );
        }
    }
    if let Some(parent) = first_parent(file) {
        metadata.insert("folderId".to_string(), parent.into());
    }
    if let Some(folder_path) = folder_path {
        metadata.insert("folderPath".to_string(), folder_path.into());
    }
    if let Some(link) = file.get("webViewLink").and_then(|l| l.as_str()) {
        metadata.insert("url".to_string(), link.into());
    }
    if let Some(created) = file.get("createdTime").and_then(|c| c.as_str()) {
        metadata.insert("createdAt".to_string(), created.into());
    }
    if let Some(modified) = file.get("modifiedTime").and_then(|m| m.as_str()) {
        metadata.insert("updatedAt".to_string(), modified.into());
    }
    if let Some(language) = language {
        metadata.insert("language".to_string(), language.into());
    }

    Some(Document {
        id,
        source: Source::Drive,
        content,
        metadata,
        pre_chunked: chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_incremental_with_folders() {
        let query = build_query(
            Some("2024-06-01T00:00:00Z"),
            &["f1".to_string(), "f2".to_string()],
        );
        assert_eq!(
            query,
            "trashed = false and modifiedTime > '2024-06-01T00:00:00Z' and ('f1' in parents or 'f2' in parents)"
        );
    }

    #[test]
    fn query_full() {
        assert_eq!(build_query(None, &[]), "trashed = false");
    }

    #[test]
    fn file_normalization() {
        let file = serde_json::json!({
            "id": "abc123",
            "name": "Runbook.md",
            "mimeType": "text/markdown",
            "modifiedTime": "2024-06-02T10:00:00.000Z",
            "createdTime": "2024-01-01T00:00:00.000Z",
            "owners": [{ "emailAddress": "me@acme.com" }],
            "parents": ["folder9"]
        });
        let doc = file_to_document(
            &file,
            "# Runbook".to_string(),
            None,
            None,
            Some("/Engineering/Runbooks".to_string()),
        )
        .unwrap();
        assert_eq!(doc.id, "drive_abc123");
        assert_eq!(doc.metadata["owner"].as_str(), Some("me@acme.com"));
        assert_eq!(doc.metadata["folderId"].as_str(), Some("folder9"));
        assert_eq!(
            doc.metadata["folderPath"].as_str(),
            Some("/Engineering/Runbooks")
        );
        assert_eq!(
            doc.metadata["updatedAt"].as_str(),
            Some("2024-06-02T10:00:00.000Z")
        );
    }

    #[test]
    fn missing_folder_path_is_left_unset() {
        let file = serde_json::json!({ "id": "xyz", "name": "loose.txt" });
        let doc = file_to_document(&file, "text".to_string(), None, None, None).unwrap();
        assert!(!doc.metadata.contains_key("folderPath"));
    }

    #[test]
    fn export_mime_mapping() {
        assert_eq!(
            export_mime_for("application/vnd.google-apps.document"),
            Some("text/plain")
        );
        assert_eq!(
            export_mime_for("application/vnd.google-apps.spreadsheet"),
            Some("text/csv")
        );
        assert_eq!(export_mime_for("application/pdf"), None);
    }
}
