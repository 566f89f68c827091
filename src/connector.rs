//! The connector contract: one uniform fetch interface per source.
//!
//! A connector turns one page of an external backend into normalized
//! [`Document`]s plus an advisory cursor update. The indexing engine owns
//! cursor composition and persistence; connectors only report what they saw.
//!
//! Requirements every connector satisfies:
//!
//! - **Determinism** — same cursor + same backend state ⇒ same documents.
//! - **Idempotency** — `Document.id` is stable for the same logical object.
//! - **Resumability** — offset/page state is embedded in `sync_token`
//!   (connector-private JSON; opaque to the engine).
//! - **Stale-token recovery** — a rejected saved token is dropped and the
//!   call retried once without it.
//! - **`batch_last_sync`** — the max updated time observed in the batch, so
//!   the engine can advance the high-watermark only when safe.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::models::{Cursor, Document, Source};

/// Default per-request HTTP timeout for connector backends.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-source filters carried by an index request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchRequest {
    pub full_reindex: bool,
    pub project_keys: Option<Vec<String>>,
    pub channel_ids: Option<Vec<String>>,
    pub folder_ids: Option<Vec<String>>,
    pub calendar_ids: Option<Vec<String>>,
    pub space_keys: Option<Vec<String>>,
    pub repos: Option<Vec<String>>,
    pub index_files: Option<bool>,
    pub gmail_settings: Option<GmailSettings>,
}

/// Gmail-specific filter settings; merged per-subfield.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GmailSettings {
    pub domains: Option<Vec<String>>,
    pub senders: Option<Vec<String>>,
    pub labels: Option<Vec<String>>,
}

/// Advisory cursor produced by a fetch; the engine composes the final cursor.
#[derive(Debug, Clone, Default)]
pub struct CursorUpdate {
    pub sync_token: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// One batch of fetched documents.
#[derive(Debug, Clone, Default)]
pub struct ConnectorResult {
    pub documents: Vec<Document>,
    pub new_cursor: CursorUpdate,
    pub has_more: bool,
    /// Max `updatedAt` (or event `start`) observed in this batch.
    pub batch_last_sync: Option<String>,
}

/// A listable a-priori resource: a project, channel, folder, space,
/// calendar, label, or repo.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryItem {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn source(&self) -> Source;

    /// Whether the required credentials and config are present.
    fn is_configured(&self) -> bool;

    /// Fetch one batch. `cursor` is `None` on a full reindex.
    async fn fetch(&self, cursor: Option<&Cursor>, request: &FetchRequest)
        -> Result<ConnectorResult>;

    /// List the source's filterable resources for the discovery endpoints.
    async fn discover(&self) -> Result<Vec<DiscoveryItem>> {
        Ok(Vec::new())
    }
}

/// Error marker for rejected pagination/sync tokens.
///
/// Connectors wrap token-rejection responses in this type; the engine and
/// the shared retry helper recognize it by downcast.
#[derive(Debug)]
pub struct StaleTokenError(pub String);

impl std::fmt::Display for StaleTokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stale sync token: {}", self.0)
    }
}

impl std::error::Error for StaleTokenError {}

/// Classify an HTTP response as a stale-token rejection.
///
/// 404/410 on a saved token always count; a 400 counts when the backend
/// names the token in its error body.
pub fn is_stale_token_status(status: u16, body: &str) -> bool {
    if status == 404 || status == 410 {
        return true;
    }
    if status == 400 {
        let body = body.to_ascii_lowercase();
        return body.contains("pagetoken")
            || body.contains("page token")
            || body.contains("sync token")
            || body.contains("invalid token")
            || body.contains("starthistoryid");
    }
    false
}

pub fn is_stale_token_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<StaleTokenError>().is_some()
}

/// A copy of `cursor` with its `sync_token` dropped, for the one retry a
/// connector makes after a token rejection.
pub fn without_sync_token(cursor: Option<&Cursor>) -> Option<Cursor> {
    cursor.map(|c| {
        let mut c = c.clone();
        c.sync_token = None;
        c
    })
}

/// Compose a Gmail search query from filter settings.
///
/// Within a group values are joined with `OR`; groups are joined with
/// spaces (Gmail's implicit AND).
pub fn gmail_query(settings: &GmailSettings) -> String {
    let mut groups = Vec::new();

    if let Some(domains) = &settings.domains {
        let terms: Vec<String> = domains
            .iter()
            .filter(|d| !d.is_empty())
            .map(|d| format!("from:*@{}", d))
            .collect();
        if !terms.is_empty() {
            groups.push(group(terms));
        }
    }
    if let Some(senders) = &settings.senders {
        let terms: Vec<String> = senders
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| format!("from:{}", s))
            .collect();
        if !terms.is_empty() {
            groups.push(group(terms));
        }
    }
    if let Some(labels) = &settings.labels {
        let terms: Vec<String> = labels
            .iter()
            .filter(|l| !l.is_empty())
            .map(|l| format!("label:{}", l))
            .collect();
        if !terms.is_empty() {
            groups.push(group(terms));
        }
    }

    groups.join(" ")
}

fn group(terms: Vec<String>) -> String {
    if terms.len() == 1 {
        terms.into_iter().next().unwrap()
    } else {
        format!("({})", terms.join(" OR "))
    }
}

/// Shared HTTP client with the connector default timeout.
pub fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?)
}

/// Registry of all connectors, built from the application config.
pub struct ConnectorRegistry {
    connectors: Vec<Box<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// Build the registry with all seven built-in connectors.
    pub fn from_config(config: &Config) -> Self {
        use crate::connector_calendar::CalendarConnector;
        use crate::connector_confluence::ConfluenceConnector;
        use crate::connector_drive::DriveConnector;
        use crate::connector_github::GithubConnector;
        use crate::connector_gmail::GmailConnector;
        use crate::connector_jira::JiraConnector;
        use crate::connector_slack::SlackConnector;

        let mut registry = Self::new();
        registry.register(Box::new(JiraConnector::new(config)));
        registry.register(Box::new(SlackConnector::new(config)));
        registry.register(Box::new(GmailConnector::new(config)));
        registry.register(Box::new(DriveConnector::new(config)));
        registry.register(Box::new(ConfluenceConnector::new(config)));
        registry.register(Box::new(CalendarConnector::new(config)));
        registry.register(Box::new(GithubConnector::new(config)));
        registry
    }

    pub fn register(&mut self, connector: Box<dyn Connector>) {
        self.connectors.push(connector);
    }

    pub fn find(&self, source: Source) -> Option<&dyn Connector> {
        self.connectors
            .iter()
            .find(|c| c.source() == source)
            .map(|c| c.as_ref())
    }

    pub fn connectors(&self) -> &[Box<dyn Connector>] {
        &self.connectors
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gmail_query_composition() {
        let settings = GmailSettings {
            domains: Some(vec!["acme.com".to_string(), "corp.io".to_string()]),
            senders: Some(vec!["ceo@acme.com".to_string()]),
            labels: Some(vec!["inbox".to_string(), "important".to_string()]),
        };
        assert_eq!(
            gmail_query(&settings),
            "(from:*@acme.com OR from:*@corp.io) from:ceo@acme.com (label:inbox OR label:important)"
        );
    }

    #[test]
    fn gmail_query_empty() {
        assert_eq!(gmail_query(&GmailSettings::default()), "");
    }

    #[test]
    fn stale_token_classification() {
        assert!(is_stale_token_status(404, ""));
        assert!(is_stale_token_status(410, "gone"));
        assert!(is_stale_token_status(400, "Invalid pageToken supplied"));
        assert!(!is_stale_token_status(400, "missing field"));
        assert!(!is_stale_token_status(500, "pageToken"));
    }

    #[test]
    fn stale_token_downcast() {
        let err = anyhow::Error::new(StaleTokenError("410".to_string()));
        assert!(is_stale_token_error(&err));
        assert!(!is_stale_token_error(&anyhow::anyhow!("other")));
    }

    #[test]
    fn without_sync_token_preserves_last_sync() {
        let mut cursor = Cursor::default();
        cursor.last_sync = Some("2024-06-01T00:00:00Z".to_string());
        cursor.sync_token = Some("p9".to_string());
        let stripped = without_sync_token(Some(&cursor)).unwrap();
        assert!(stripped.sync_token.is_none());
        assert_eq!(stripped.last_sync.as_deref(), Some("2024-06-01T00:00:00Z"));
    }
}
