//! Jira connector.
//!
//! Pages through issue search results with offset-based paging, ordered by
//! update time so the engine's high-watermark stays meaningful. The page
//! offset lives in `sync_token` as connector-private JSON.
//!
//! Credentials: `JIRA_API_TOKEN` (API token paired with the configured
//! account email, basic auth).

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{Config, JiraConfig};
use crate::connector::{
    http_client, is_stale_token_error, is_stale_token_status, without_sync_token, Connector,
    ConnectorResult, CursorUpdate, FetchRequest, StaleTokenError,
};
use crate::models::{Cursor, Document, Metadata, Source};

const PAGE_SIZE: usize = 50;

/// Offset-paging state carried in `sync_token`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PageState {
    start_at: usize,
}

pub struct JiraConnector {
    config: Option<JiraConfig>,
    token: Option<String>,
}

impl JiraConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.connectors.jira.clone(),
            token: std::env::var("JIRA_API_TOKEN").ok(),
        }
    }

    fn credentials(&self) -> Result<(&JiraConfig, &str)> {
        let config = self.config.as_ref().context("jira is not configured")?;
        let token = self.token.as_deref().context("JIRA_API_TOKEN not set")?;
        Ok((config, token))
    }

    async fn fetch_page(
        &self,
        cursor: Option<&Cursor>,
        request: &FetchRequest,
    ) -> Result<ConnectorResult> {
        let (config, token) = self.credentials()?;
        let client = http_client()?;

        let state: PageState = cursor
            .and_then(|c| c.sync_token.as_deref())
            .and_then(|t| serde_json::from_str(t).ok())
            .unwrap_or_default();

        let jql = build_jql(
            cursor.and_then(|c| c.last_sync.as_deref()),
            request.project_keys.as_deref(),
        );

        let url = format!("{}/rest/api/2/search", config.base_url.trim_end_matches('/'));
        let response = client
            .get(&url)
            .basic_auth(&config.username, Some(token))
            .query(&[
                ("jql", jql),
                ("startAt", state.start_at.to_string()),
                ("maxResults", PAGE_SIZE.to_string()),
                ("fields", "summary,description,status,priority,assignee,reporter,project,labels,created,updated".to_string()),
            ])
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        if status >= 400 {
            if is_stale_token_status(status, &body) {
                return Err(anyhow::Error::new(StaleTokenError(format!(
                    "jira rejected startAt={}: {}",
                    state.start_at, status
                ))));
            }
            anyhow::bail!("Jira search failed ({}): {}", status, body);
        }

        let json: serde_json::Value = serde_json::from_str(&body)?;
        let total = json.get("total").and_then(|t| t.as_u64()).unwrap_or(0) as usize;
        let issues = json
            .get("issues")
            .and_then(|i| i.as_array())
            .cloned()
            .unwrap_or_default();

        let mut documents = Vec::with_capacity(issues.len());
        let mut batch_last_sync: Option<String> = None;
        for issue in &issues {
            if let Some(doc) = issue_to_document(issue) {
                if let Some(updated) = doc.metadata.get("updatedAt").and_then(|v| v.as_str()) {
                    if batch_last_sync.as_deref().map(|b| updated > b).unwrap_or(true) {
                        batch_last_sync = Some(updated.to_string());
                    }
                }
                documents.push(doc);
            }
        }

        let next_start = state.start_at + issues.len();
        let has_more = next_start < total && !issues.is_empty();
        let sync_token = has_more.then(|| {
            serde_json::to_string(&PageState {
                start_at: next_start,
            })
            .expect("page state serializes")
        });

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
impl Connector for JiraConnector {
    fn source(&self) -> Source {
        Source::Jira
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
                warn!(error = %e, "jira: retrying without sync token");
                let stripped = without_sync_token(cursor);
                self.fetch_page(stripped.as_ref(), request).await
            }
            other => other,
        }
    }

    async fn discover(&self) -> Result<Vec<crate::connector::DiscoveryItem>> {
        let (config, token) = self.credentials()?;
        let client = http_client()?;
        let url = format!("{}/rest/api/2/project", config.base_url.trim_end_matches('/'));
        let projects: serde_json::Value = client
            .get(&url)
            .basic_auth(&config.username, Some(token))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(projects
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|p| {
                Some(crate::connector::DiscoveryItem {
                    id: p.get("key")?.as_str()?.to_string(),
                    name: p
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect())
    }
}

/// Build the incremental JQL query, ordered by update time ascending.
fn build_jql(last_sync: Option<&str>, project_keys: Option<&[String]>) -> String {
    let mut clauses = Vec::new();
    if let Some(last_sync) = last_sync {
        // Jira accepts "yyyy-MM-dd HH:mm" in JQL.
        let stamp = last_sync.replace('T', " ");
        let stamp = stamp.get(..16).unwrap_or(&stamp);
        clauses.push(format!("updated >= \"{}\"", stamp));
    }
    if let Some(keys) = project_keys {
        if !keys.is_empty() {
            clauses.push(format!("project in ({})", keys.join(", ")));
        }
    }
    let mut jql = clauses.join(" AND ");
    if !jql.is_empty() {
        jql.push(' ');
    }
    jql.push_str("ORDER BY updated ASC");
    jql
}

/// Normalize one Jira issue into a [`Document`].
fn issue_to_document(issue: &serde_json::Value) -> Option<Document> {
    let key = issue.get("key")?.as_str()?;
    let fields = issue.get("fields")?;
    let summary = fields.get("summary").and_then(|s| s.as_str()).unwrap_or("");
    let description = fields
        .get("description")
        .and_then(|d| d.as_str())
        .unwrap_or("");

    let id = format!("jira_{}", key);
    let mut metadata = Metadata::new();
    metadata.insert("id".to_string(), id.as_str().into());
    metadata.insert("source".to_string(), "jira".into());
    metadata.insert("type".to_string(), "issue".into());
    metadata.insert("title".to_string(), format!("{}: {}", key, summary).into());
    metadata.insert("key".to_string(), key.into());

    if let Some(project) = fields
        .get("project")
        .and_then(|p| p.get("key"))
        .and_then(|k| k.as_str())
    {
        metadata.insert("project".to_string(), project.into());
    }
    if let Some(status) = fields
        .get("status")
        .and_then(|s| s.get("name"))
        .and_then(|n| n.as_str())
    {
        metadata.insert("status".to_string(), status.into());
    }
    if let Some(priority) = fields
        .get("priority")
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str())
    {
        metadata.insert("priority".to_string(), priority.into());
    }
    if let Some(assignee) = fields
        .get("assignee")
        .and_then(|a| a.get("emailAddress").or_else(|| a.get("name")))
        .and_then(|n| n.as_str())
    {
        metadata.insert("assignee".to_string(), assignee.into());
    }
    if let Some(reporter) = fields
        .get("reporter")
        .and_then(|r| r.get("emailAddress").or_else(|| r.get("name")))
        .and_then(|n| n.as_str())
    {
        metadata.insert("reporter".to_string(), reporter.into());
    }
    if let Some(labels) = fields.get("labels").and_then(|l| l.as_array()) {
        let labels: Vec<crate::models::MetaValue> = labels
            .iter()
            .filter_map(|l| l.as_str())
            .map(|l| l.into())
            .collect();
        if !labels.is_empty() {
            metadata.insert("labels".to_string(), crate::models::MetaValue::List(labels));
        }
    }
    if let Some(created) = fields.get("created").and_then(|c| c.as_str()) {
        metadata.insert("createdAt".to_string(), created.into());
    }
    if let Some(updated) = fields.get("updated").and_then(|u| u.as_str()) {
        metadata.insert("updatedAt".to_string(), updated.into());
    }

    let content = if description.is_empty() {
        format!("# {}\n\n{}", key, summary)
    } else {
        format!("# {}: {}\n\n{}", key, summary, description)
    };

    Some(Document {
        id,
        source: Source::Jira,
        content,
        metadata,
        pre_chunked: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jql_full_reindex() {
        assert_eq!(build_jql(None, None), "ORDER BY updated ASC");
    }

    #[test]
    fn jql_incremental_with_projects() {
        let jql = build_jql(
            Some("2024-06-01T12:30:00.000Z"),
            Some(&["ENG".to_string(), "OPS".to_string()]),
        );
        assert_eq!(
            jql,
            "updated >= \"2024-06-01 12:30\" AND project in (ENG, OPS) ORDER BY updated ASC"
        );
    }

    #[test]
    fn issue_normalization() {
        let issue = serde_json::json!({
            "key": "ENG-42",
            "fields": {
                "summary": "Fix the flaky sync",
                "description": "It fails on page two.",
                "project": { "key": "ENG" },
                "status": { "name": "In Progress" },
                "priority": { "name": "High" },
                "assignee": { "emailAddress": "dev@acme.com" },
                "created": "2024-05-01T00:00:00.000+0000",
                "updated": "2024-06-01T00:00:00.000+0000"
            }
        });
        let doc = issue_to_document(&issue).unwrap();
        assert_eq!(doc.id, "jira_ENG-42");
        assert_eq!(doc.metadata["id"].as_str(), Some("jira_ENG-42"));
        assert_eq!(doc.metadata["project"].as_str(), Some("ENG"));
        assert_eq!(doc.metadata["priority"].as_str(), Some("High"));
        assert!(doc.content.contains("Fix the flaky sync"));
        assert!(doc.content.contains("It fails on page two."));
    }
}
