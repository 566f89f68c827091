//! Confluence connector.
//!
//! Pages CQL search results with offset paging. Confluence offsets can
//! drift while content changes underneath, so the ids seen during the
//! current sync session ride in `sync_token`; a page made up entirely of
//! already-seen ids means the offset is looping and the sync stops cleanly.
//!
//! Credentials: `CONFLUENCE_API_TOKEN` (basic auth with the configured
//! account email).

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{Config, ConfluenceConfig};
use crate::connector::{
    http_client, is_stale_token_error, is_stale_token_status, without_sync_token, Connector,
    ConnectorResult, CursorUpdate, FetchRequest, StaleTokenError,
};
use crate::extract;
use crate::models::{Cursor, Document, MetaValue, Metadata, Source};

const PAGE_SIZE: usize = 25;
const EXPAND: &str = "body.storage,version,space,ancestors,metadata.labels,history";

#[derive(Debug, Default, Serialize, Deserialize)]
struct PageState {
    start: usize,
    /// Ids already returned in this sync session, for cycle detection.
    #[serde(default)]
    seen: BTreeSet<String>,
}

pub struct ConfluenceConnector {
    config: Option<ConfluenceConfig>,
    token: Option<String>,
}

impl ConfluenceConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.connectors.confluence.clone(),
            token: std::env::var("CONFLUENCE_API_TOKEN").ok(),
        }
    }

    async fn fetch_page(
        &self,
        cursor: Option<&Cursor>,
        request: &FetchRequest,
    ) -> Result<ConnectorResult> {
        let config = self.config.as_ref().context("confluence is not configured")?;
        let token = self
            .token
            .as_deref()
            .context("CONFLUENCE_API_TOKEN not set")?;
        let client = http_client()?;

        let mut state: PageState = cursor
            .and_then(|c| c.sync_token.as_deref())
            .and_then(|t| serde_json::from_str(t).ok())
            .unwrap_or_default();

        let cql = build_cql(
            cursor.and_then(|c| c.last_sync.as_deref()),
            request.space_keys.as_deref(),
        );

        let url = format!(
            "{}/wiki/rest/api/content/search",
            config.base_url.trim_end_matches('/')
        );
        let response = client
            .get(&url)
            .basic_auth(&config.username, Some(token))
            .query(&[
                ("cql", cql),
                ("start", state.start.to_string()),
                ("limit", PAGE_SIZE.to_string()),
                ("expand", EXPAND.to_string()),
            ])
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        if status >= 400 {
            if is_stale_token_status(status, &body) {
                return Err(anyhow::Error::new(StaleTokenError(format!(
                    "confluence rejected start={}: {}",
                    state.start, status
                ))));
            }
            anyhow::bail!("Confluence search failed ({}): {}", status, body);
        }

        let json: serde_json::Value = serde_json::from_str(&body)?;
        let results = json
            .get("results")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();

        let page_ids: Vec<String> = results
            .iter()
            .filter_map(|r| r.get("id").map(json_id))
            .collect();

        // Cycle detection: a page of nothing but repeats means the offset
        // is no longer making progress.
        if !page_ids.is_empty() && page_ids.iter().all(|id| state.seen.contains(id)) {
            warn!(start = state.start, "confluence: pagination cycle detected, stopping");
            return Ok(ConnectorResult {
                documents: Vec::new(),
                new_cursor: CursorUpdate::default(),
                has_more: false,
                batch_last_sync: None,
            });
        }

        let mut documents = Vec::new();
        let mut batch_last_sync: Option<String> = None;
        for result in &results {
            let id = json_id(result.get("id").unwrap_or(&serde_json::Value::Null));
            if state.seen.contains(&id) {
                continue;
            }
            state.seen.insert(id);
            if let Some(doc) = content_to_document(result) {
                if let Some(updated) = doc.metadata.get("updatedAt").and_then(|v| v.as_str()) {
                    if batch_last_sync.as_deref().map(|b| updated > b).unwrap_or(true) {
                        batch_last_sync = Some(updated.to_string());
                    }
                }
                documents.push(doc);
            }
        }

        let fetched = state.start + results.len();
        let has_more = !results.is_empty()
            && json
                .get("totalSize")
                .and_then(|t| t.as_u64())
                .map(|t| fetched < t as usize)
                .unwrap_or(results.len() == PAGE_SIZE);

        state.start = fetched;
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
impl Connector for ConfluenceConnector {
    fn source(&self) -> Source {
        Source::Confluence
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
                warn!(error = %e, "confluence: retrying without sync token");
                let stripped = without_sync_token(cursor);
                self.fetch_page(stripped.as_ref(), request).await
            }
            other => other,
        }
    }

    async fn discover(&self) -> Result<Vec<crate::connector::DiscoveryItem>> {
        let config = self.config.as_ref().context("confluence is not configured")?;
        let token = self
            .token
            .as_deref()
            .context("CONFLUENCE_API_TOKEN not set")?;
        let client = http_client()?;
        let url = format!(
            "{}/wiki/rest/api/space",
            config.base_url.trim_end_matches('/')
        );
        let json: serde_json::Value = client
            .get(&url)
            .basic_auth(&config.username, Some(token))
            .query(&[("limit", "100")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(json
            .get("results")
            .and_then(|r| r.as_array())
            .into_iter()
            .flatten()
            .filter_map(|space| {
                Some(crate::connector::DiscoveryItem {
                    id: space.get("key")?.as_str()?.to_string(),
                    name: space
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect())
    }
}

fn json_id(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn build_cql(last_sync: Option<&str>, space_keys: Option<&[String]>) -> String {
    let mut clauses = vec!["type in (page, blogpost, comment)".to_string()];
    if let Some(last_sync) = last_sync {
        let stamp = last_sync.replace('T', " ");
        let stamp = stamp.get(..16).unwrap_or(&stamp);
        clauses.push(format!("lastModified >= \"{}\"", stamp));
    }
    if let Some(keys) = space_keys {
        if !keys.is_empty() {
            clauses.push(format!("space in ({})", keys.join(", ")));
        }
    }
    format!("{} order by lastModified asc", clauses.join(" and "))
}

fn content_to_document(content: &serde_json::Value) -> Option<Document> {
    let content_id = json_id(content.get("id")?);
    let title = content.get("title").and_then(|t| t.as_str()).unwrap_or("");
    let content_type = content
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("page");

    let storage = content
        .pointer("/body/storage/value")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let body = extract::html_to_markdown(storage).unwrap_or_else(|_| storage.to_string());

    let id = format!("confluence_{}", content_id);
    let mut metadata = Metadata::new();
    metadata.insert("id".to_string(), id.as_str().into());
    metadata.insert("source".to_string(), "confluence".into());
    metadata.insert("type".to_string(), content_type.into());
    if !title.is_empty() {
        metadata.insert("title".to_string(), title.into());
    }
    if let Some(space) = content
        .pointer("/space/key")
        .and_then(|k| k.as_str())
    {
        metadata.insert("space".to_string(), space.into());
    }

    let ancestors: Vec<String> = content
        .get("ancestors")
        .and_then(|a| a.as_array())
        .into_iter()
        .flatten()
        .filter_map(|a| a.get("id").map(json_id))
        .collect();
    if !ancestors.is_empty() {
        metadata.insert(
            "ancestors".to_string(),
            MetaValue::List(ancestors.iter().map(|a| a.as_str().into()).collect()),
        );
        let direct_parent = ancestors.last().expect("non-empty");
        // Comments keep the raw container id; pages point at the parent
        // page's document id.
        let parent_id = if content_type == "comment" {
            direct_parent.clone()
        } else {
            format!("confluence_{}", direct_parent)
        };
        metadata.insert("parentId".to_string(), parent_id.into());
    }

    let labels: Vec<String> = content
        .pointer("/metadata/labels/results")
        .and_then(|l| l.as_array())
        .into_iter()
        .flatten()
        .filter_map(|l| l.get("name").and_then(|n| n.as_str()))
        .map(|n| n.to_string())
        .collect();
    if !labels.is_empty() {
        metadata.insert(
            "labels".to_string(),
            MetaValue::List(labels.iter().map(|l| l.as_str().into()).collect()),
        );
    }

    if let Some(created) = content
        .pointer("/history/createdDate")
        .and_then(|c| c.as_str())
    {
        metadata.insert("createdAt".to_string(), created.into());
    }
    if let Some(updated) = content.pointer("/version/when").and_then(|w| w.as_str()) {
        metadata.insert("updatedAt".to_string(), updated.into());
    }

    let text = if title.is_empty() {
        body
    } else {
        format!("# {}\n\n{}", title, body)
    };

    Some(Document {
        id,
        source: Source::Confluence,
        content: text,
        metadata,
        pre_chunked: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cql_incremental_with_spaces() {
        let cql = build_cql(Some("2024-06-01T08:00:00Z"), Some(&["ENG".to_string()]));
        assert_eq!(
            cql,
            "type in (page, blogpost, comment) and lastModified >= \"2024-06-01 08:00\" and space in (ENG) order by lastModified asc"
        );
    }

    #[test]
    fn page_normalization() {
        let content = serde_json::json!({
            "id": "98304",
            "type": "page",
            "title": "Team Charter",
            "space": { "key": "ENG" },
            "ancestors": [ { "id": "100" }, { "id": "200" } ],
            "body": { "storage": { "value": "<p>We build the sync engine.</p>" } },
            "version": { "when": "2024-06-03T09:00:00.000Z" },
            "history": { "createdDate": "2024-01-10T00:00:00.000Z" },
            "metadata": { "labels": { "results": [ { "name": "charter" } ] } }
        });
        let doc = content_to_document(&content).unwrap();
        assert_eq!(doc.id, "confluence_98304");
        assert_eq!(doc.metadata["space"].as_str(), Some("ENG"));
        assert_eq!(doc.metadata["parentId"].as_str(), Some("confluence_200"));
        assert_eq!(doc.metadata["ancestors"].as_list().unwrap().len(), 2);
        assert_eq!(doc.metadata["labels"].as_list().unwrap().len(), 1);
        assert!(doc.content.contains("We build the sync engine."));
    }

    #[test]
    fn comment_parent_stays_raw() {
        let content = serde_json::json!({
            "id": "777",
            "type": "comment",
            "title": "Re: Team Charter",
            "ancestors": [ { "id": "98304" } ],
            "body": { "storage": { "value": "<p>+1</p>" } }
        });
        let doc = content_to_document(&content).unwrap();
        assert_eq!(doc.metadata["parentId"].as_str(), Some("98304"));
    }
}
