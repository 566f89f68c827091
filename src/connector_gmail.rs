//! Gmail connector.
//!
//! Runs a two-mode state machine stored in `sync_token`:
//!
//! - **list** — first sync walks `messages.list` page by page; the account's
//!   current `historyId` is recorded up front so nothing added during the
//!   walk is missed.
//! - **history** — once the listing is exhausted the token flips to history
//!   mode and later syncs read `history.list` deltas from the recorded id.
//!
//! An expired history id comes back as 404; the stale-token retry drops the
//! token, which lands back in list mode.
//!
//! Search filters are composed from the gmail settings
//! (`domains → from:*@domain`, `senders → from:`, `labels → label:`).

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::connector::{
    gmail_query, http_client, is_stale_token_error, is_stale_token_status, without_sync_token,
    Connector, ConnectorResult, CursorUpdate, FetchRequest, StaleTokenError,
};
use crate::extract;
use crate::google_auth::GoogleCredentials;
use crate::models::{Cursor, Document, MetaValue, Metadata, Source};

const API: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const LIST_PAGE_SIZE: usize = 25;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
enum SyncMode {
    List {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        history_id: Option<String>,
    },
    History {
        history_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_token: Option<String>,
    },
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::List {
            page_token: None,
            history_id: None,
        }
    }
}

pub struct GmailConnector {
    user_email: Option<String>,
}

impl GmailConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            user_email: config
                .connectors
                .google
                .as_ref()
                .map(|g| g.user_email.clone()),
        }
    }

    async fn get_json(
        &self,
        client: &reqwest::Client,
        token: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value> {
        let response = client
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        if status >= 400 {
            if is_stale_token_status(status, &body) {
                return Err(anyhow::Error::new(StaleTokenError(format!(
                    "gmail rejected request ({})",
                    status
                ))));
            }
            anyhow::bail!("Gmail API error ({}): {}", status, body);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn fetch_message(
        &self,
        client: &reqwest::Client,
        token: &str,
        id: &str,
    ) -> Result<Option<Document>> {
        let json = self
            .get_json(
                client,
                token,
                &format!("{}/messages/{}", API, id),
                &[("format", "full".to_string())],
            )
            .await?;
        Ok(message_to_document(&json))
    }

    async fn fetch_page(
        &self,
        cursor: Option<&Cursor>,
        request: &FetchRequest,
    ) -> Result<ConnectorResult> {
        let creds = GoogleCredentials::from_env()?;
        let client = http_client()?;
        let token = creds.access_token(&client).await?;

        let state: SyncMode = cursor
            .and_then(|c| c.sync_token.as_deref())
            .and_then(|t| serde_json::from_str(t).ok())
            .unwrap_or_default();

        match state {
            SyncMode::List {
                page_token,
                history_id,
            } => {
                // Record the account's current history position before the
                // walk so the later history mode starts from here.
                let history_id = match history_id {
                    Some(h) => h,
                    None => {
                        let profile = self
                            .get_json(&client, &token, &format!("{}/profile", API), &[])
                            .await?;
                        profile
                            .get("historyId")
                            .map(json_value_to_string)
                            .unwrap_or_default()
                    }
                };

                let mut query = vec![("maxResults", LIST_PAGE_SIZE.to_string())];
                let q = request
                    .gmail_settings
                    .as_ref()
                    .map(gmail_query)
                    .unwrap_or_default();
                if !q.is_empty() {
                    query.push(("q", q));
                }
                if let Some(pt) = &page_token {
                    query.push(("pageToken", pt.clone()));
                }

                let listing = self
                    .get_json(&client, &token, &format!("{}/messages", API), &query)
                    .await?;

                let ids: Vec<String> = listing
                    .get("messages")
                    .and_then(|m| m.as_array())
                    .into_iter()
                    .flatten()
                    .filter_map(|m| m.get("id").and_then(|i| i.as_str()))
                    .map(|i| i.to_string())
                    .collect();

                let mut documents = Vec::with_capacity(ids.len());
                for id in &ids {
                    if let Some(doc) = self.fetch_message(&client, &token, id).await? {
                        documents.push(doc);
                    }
                }

                let next_page = listing
                    .get("nextPageToken")
                    .and_then(|t| t.as_str())
                    .map(|t| t.to_string());
                let has_more = next_page.is_some();

                let next_state = match next_page {
                    Some(pt) => SyncMode::List {
                        page_token: Some(pt),
                        history_id: Some(history_id),
                    },
                    // Listing exhausted: flip to history mode.
                    None => SyncMode::History {
                        history_id,
                        page_token: None,
                    },
                };

                Ok(batch_result(documents, next_state, has_more))
            }
            SyncMode::History {
                history_id,
                page_token,
            } => {
                let mut query = vec![
                    ("startHistoryId", history_id.clone()),
                    ("historyTypes", "messageAdded".to_string()),
                    ("maxResults", "100".to_string()),
                ];
                if let Some(pt) = &page_token {
                    query.push(("pageToken", pt.clone()));
                }

                let delta = self
                    .get_json(&client, &token, &format!("{}/history", API), &query)
                    .await?;

                let mut ids = Vec::new();
                for entry in delta
                    .get("history")
                    .and_then(|h| h.as_array())
                    .into_iter()
                    .flatten()
                {
                    for added in entry
                        .get("messagesAdded")
                        .and_then(|m| m.as_array())
                        .into_iter()
                        .flatten()
                    {
                        if let Some(id) = added.pointer("/message/id").and_then(|i| i.as_str()) {
                            ids.push(id.to_string());
                        }
                    }
                }

                let mut documents = Vec::with_capacity(ids.len());
                for id in &ids {
                    if let Some(doc) = self.fetch_message(&client, &token, id).await? {
                        documents.push(doc);
                    }
                }

                let advanced_id = delta
                    .get("historyId")
                    .map(json_value_to_string)
                    .unwrap_or(history_id);
                let next_page = delta
                    .get("nextPageToken")
                    .and_then(|t| t.as_str())
                    .map(|t| t.to_string());
                let has_more = next_page.is_some();

                let next_state = SyncMode::History {
                    history_id: advanced_id,
                    page_token: next_page,
                };

                Ok(batch_result(documents, next_state, has_more))
            }
        }
    }
}

#[async_trait]
impl Connector for GmailConnector {
    fn source(&self) -> Source {
        Source::Gmail
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
                // Expired history id: drop the token and restart in list mode.
                warn!(error = %e, "gmail: falling back to list mode");
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
        let json = self
            .get_json(&client, &token, &format!("{}/labels", API), &[])
            .await?;
        Ok(json
            .get("labels")
            .and_then(|l| l.as_array())
            .into_iter()
            .flatten()
            .filter_map(|label| {
                Some(crate::connector::DiscoveryItem {
                    id: label.get("id")?.as_str()?.to_string(),
                    name: label
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect())
    }
}

fn batch_result(documents: Vec<Document>, state: SyncMode, has_more: bool) -> ConnectorResult {
    let batch_last_sync = documents
        .iter()
        .filter_map(|d| d.metadata.get("updatedAt").and_then(|v| v.as_str()))
        .max()
        .map(|s| s.to_string());
    ConnectorResult {
        documents,
        new_cursor: CursorUpdate {
            sync_token: Some(serde_json::to_string(&state).expect("state serializes")),
            metadata: Default::default(),
        },
        has_more,
        batch_last_sync,
    }
}

/// Gmail returns `historyId` sometimes as a string, sometimes as a number.
fn json_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Normalize one Gmail message into a [`Document`].
fn message_to_document(message: &serde_json::Value) -> Option<Document> {
    let message_id = message.get("id")?.as_str()?;
    let payload = message.get("payload")?;

    let mut subject = String::new();
    let mut from = String::new();
    let mut to = Vec::new();
    let mut cc = Vec::new();
    for header in payload
        .get("headers")
        .and_then(|h| h.as_array())
        .into_iter()
        .flatten()
    {
        let name = header.get("name").and_then(|n| n.as_str()).unwrap_or("");
        let value = header.get("value").and_then(|v| v.as_str()).unwrap_or("");
        match name.to_ascii_lowercase().as_str() {
            "subject" => subject = value.to_string(),
            "from" => from = value.to_string(),
            "to" => to = split_addresses(value),
            "cc" => cc = split_addresses(value),
            _ => {}
        }
    }

    let body = extract_body(payload).unwrap_or_default();
    if body.trim().is_empty() && subject.is_empty() {
        return None;
    }

    let id = format!("gmail_{}", message_id);
    let mut metadata = Metadata::new();
    metadata.insert("id".to_string(), id.as_str().into());
    metadata.insert("source".to_string(), "gmail".into());
    metadata.insert("type".to_string(), "email".into());
    if !subject.is_empty() {
        metadata.insert("title".to_string(), subject.as_str().into());
        metadata.insert("subject".to_string(), subject.as_str().into());
    }
    if !from.is_empty() {
        metadata.insert("from".to_string(), from.as_str().into());
    }
    if !to.is_empty() {
        metadata.insert(
            "to".to_string(),
            MetaValue::List(to.iter().map(|t| t.as_str().into()).collect()),
        );
    }
    if !cc.is_empty() {
        metadata.insert(
            "cc".to_string(),
            MetaValue::List(cc.iter().map(|t| t.as_str().into()).collect()),
        );
    }
    if let Some(thread_id) = message.get("threadId").and_then(|t| t.as_str()) {
        metadata.insert("threadId".to_string(), thread_id.into());
    }
    if let Some(labels) = message.get("labelIds").and_then(|l| l.as_array()) {
        let labels: Vec<MetaValue> = labels
            .iter()
            .filter_map(|l| l.as_str())
            .map(|l| l.into())
            .collect();
        if !labels.is_empty() {
            metadata.insert("labels".to_string(), MetaValue::List(labels));
        }
    }
    if let Some(internal) = message
        .get("internalDate")
        .map(json_value_to_string)
        .and_then(|s| s.parse::<i64>().ok())
    {
        if let Some(dt) = chrono::DateTime::from_timestamp_millis(internal) {
            let iso = dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
            metadata.insert("createdAt".to_string(), iso.as_str().into());
            metadata.insert("updatedAt".to_string(), iso.into());
        }
    }

    let content = if subject.is_empty() {
        body
    } else {
        format!("# {}\n\n{}", subject, body)
    };

    Some(Document {
        id,
        source: Source::Gmail,
        content,
        metadata,
        pre_chunked: None,
    })
}

fn split_addresses(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect()
}

/// Pull a readable body out of a message payload: prefer `text/plain`,
/// fall back to converted `text/html`.
fn extract_body(payload: &serde_json::Value) -> Option<String> {
    if let Some(text) = find_part(payload, "text/plain") {
        return Some(text);
    }
    find_part(payload, "text/html")
        .and_then(|html| extract::html_to_markdown(&html).ok())
}

fn find_part(part: &serde_json::Value, mime: &str) -> Option<String> {
    let mime_type = part.get("mimeType").and_then(|m| m.as_str()).unwrap_or("");
    if mime_type == mime {
        if let Some(data) = part.pointer("/body/data").and_then(|d| d.as_str()) {
            return decode_base64url(data);
        }
    }
    for child in part
        .get("parts")
        .and_then(|p| p.as_array())
        .into_iter()
        .flatten()
    {
        if let Some(found) = find_part(child, mime) {
            return Some(found);
        }
    }
    None
}

fn decode_base64url(data: &str) -> Option<String> {
    let engines = [
        base64::engine::general_purpose::URL_SAFE_NO_PAD,
        base64::engine::general_purpose::URL_SAFE,
        base64::engine::general_purpose::STANDARD,
    ];
    for engine in engines {
        if let Ok(bytes) = engine.decode(data) {
            return Some(String::from_utf8_lossy(&bytes).into_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(text: &str) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(text)
    }

    #[test]
    fn message_normalization() {
        let message = serde_json::json!({
            "id": "18f001",
            "threadId": "18f000",
            "labelIds": ["INBOX", "IMPORTANT"],
            "internalDate": "1717200000000",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    { "name": "Subject", "value": "Quarterly Review" },
                    { "name": "From", "value": "ceo@acme.com" },
                    { "name": "To", "value": "a@acme.com, b@acme.com" }
                ],
                "parts": [
                    { "mimeType": "text/plain", "body": { "data": b64("See attached numbers.") } }
                ]
            }
        });
        let doc = message_to_document(&message).unwrap();
        assert_eq!(doc.id, "gmail_18f001");
        assert_eq!(doc.metadata["subject"].as_str(), Some("Quarterly Review"));
        assert_eq!(doc.metadata["threadId"].as_str(), Some("18f000"));
        assert_eq!(doc.metadata["to"].as_list().unwrap().len(), 2);
        assert!(doc.content.contains("See attached numbers."));
        assert!(doc.metadata["updatedAt"]
            .as_str()
            .unwrap()
            .starts_with("2024-06-01"));
    }

    #[test]
    fn html_body_fallback() {
        let message = serde_json::json!({
            "id": "18f002",
            "payload": {
                "mimeType": "text/html",
                "headers": [{ "name": "Subject", "value": "Note" }],
                "body": { "data": b64("<html><body><p>Rich text</p></body></html>") }
            }
        });
        let doc = message_to_document(&message).unwrap();
        assert!(doc.content.contains("Rich text"));
    }

    #[test]
    fn sync_mode_round_trip() {
        let state = SyncMode::History {
            history_id: "12345".to_string(),
            page_token: None,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"mode\":\"history\""));
        let parsed: SyncMode = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, SyncMode::History { history_id, .. } if history_id == "12345"));
    }

    #[test]
    fn default_mode_is_list() {
        assert!(matches!(SyncMode::default(), SyncMode::List { .. }));
    }
}
