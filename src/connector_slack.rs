//! Slack connector.
//!
//! Walks the channel list once per sync cycle, then pages through each
//! channel's history with Slack's cursor paging. The resolved channel list
//! and the position inside it ride along in `sync_token`, so a resumed sync
//! continues exactly where it stopped.
//!
//! Credentials: `SLACK_BOT_TOKEN` (bot token with `channels:history`,
//! `groups:history`, `im:history`, `mpim:history` scopes).

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{Config, SlackConfig};
use crate::connector::{
    http_client, is_stale_token_error, without_sync_token, Connector, ConnectorResult,
    CursorUpdate, FetchRequest, StaleTokenError,
};
use crate::models::{parse_timestamp_ms, Cursor, Document, Metadata, Source};

const HISTORY_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChannelRef {
    id: String,
    name: String,
    kind: String,
}

/// Paging state carried in `sync_token`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PageState {
    channels: Vec<ChannelRef>,
    channel_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
}

pub struct SlackConnector {
    config: Option<SlackConfig>,
    token: Option<String>,
}

impl SlackConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.connectors.slack.clone(),
            token: std::env::var("SLACK_BOT_TOKEN").ok(),
        }
    }

    fn token(&self) -> Result<&str> {
        self.token.as_deref().context("SLACK_BOT_TOKEN not set")
    }

    /// Call a Slack Web API method and unwrap the `ok` envelope.
    async fn call(
        &self,
        client: &reqwest::Client,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value> {
        let url = format!("https://slack.com/api/{}", method);
        let response = client
            .get(&url)
            .bearer_auth(self.token()?)
            .query(params)
            .send()
            .await?;
        let json: serde_json::Value = response.json().await?;

        if !json.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
            let error = json
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown_error");
            if error == "invalid_cursor" {
                return Err(anyhow::Error::new(StaleTokenError(format!(
                    "slack {}: {}",
                    method, error
                ))));
            }
            anyhow::bail!("Slack {} failed: {}", method, error);
        }
        Ok(json)
    }

    async fn list_channels(
        &self,
        client: &reqwest::Client,
        filter: Option<&[String]>,
    ) -> Result<Vec<ChannelRef>> {
        let include_archived = self
            .config
            .as_ref()
            .map(|c| c.include_archived)
            .unwrap_or(false);

        let mut channels = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut params = vec![
                (
                    "types",
                    "public_channel,private_channel,mpim,im".to_string(),
                ),
                ("limit", "200".to_string()),
                ("exclude_archived", (!include_archived).to_string()),
            ];
            if let Some(c) = &cursor {
                params.push(("cursor", c.clone()));
            }
            let json = self.call(client, "conversations.list", &params).await?;

            for channel in json
                .get("channels")
                .and_then(|c| c.as_array())
                .into_iter()
                .flatten()
            {
                let Some(id) = channel.get("id").and_then(|i| i.as_str()) else {
                    continue;
                };
                if let Some(wanted) = filter {
                    if !wanted.iter().any(|w| w == id) {
                        continue;
                    }
                }
                let kind = if channel.get("is_im").and_then(|v| v.as_bool()).unwrap_or(false) {
                    "dm"
                } else if channel.get("is_mpim").and_then(|v| v.as_bool()).unwrap_or(false) {
                    "mpim"
                } else if channel
                    .get("is_private")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                {
                    "private"
                } else {
                    "public"
                };
                channels.push(ChannelRef {
                    id: id.to_string(),
                    name: channel
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or(id)
                        .to_string(),
                    kind: kind.to_string(),
                });
            }

            cursor = json
                .pointer("/response_metadata/next_cursor")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(|c| c.to_string());
            if cursor.is_none() {
                break;
            }
        }
        Ok(channels)
    }

    async fn fetch_page(
        &self,
        cursor: Option<&Cursor>,
        request: &FetchRequest,
    ) -> Result<ConnectorResult> {
        let client = http_client()?;

        let mut state: PageState = cursor
            .and_then(|c| c.sync_token.as_deref())
            .and_then(|t| serde_json::from_str(t).ok())
            .unwrap_or_default();

        if state.channels.is_empty() {
            state.channels = self
                .list_channels(&client, request.channel_ids.as_deref())
                .await?;
            state.channel_index = 0;
            state.cursor = None;
        }

        let Some(channel) = state.channels.get(state.channel_index).cloned() else {
            return Ok(ConnectorResult::default());
        };

        let mut params = vec![
            ("channel", channel.id.clone()),
            ("limit", HISTORY_PAGE_SIZE.to_string()),
        ];
        if let Some(last_sync) = cursor.and_then(|c| c.last_sync.as_deref()) {
            if let Some(ms) = parse_timestamp_ms(last_sync) {
                params.push(("oldest", format!("{:.6}", ms as f64 / 1000.0)));
            }
        }
        if let Some(c) = &state.cursor {
            params.push(("cursor", c.clone()));
        }

        let json = self.call(&client, "conversations.history", &params).await?;

        let mut documents = Vec::new();
        let mut batch_last_sync: Option<String> = None;
        for message in json
            .get("messages")
            .and_then(|m| m.as_array())
            .into_iter()
            .flatten()
        {
            if let Some(doc) = message_to_document(message, &channel) {
                if let Some(ts) = doc.metadata.get("timestamp").and_then(|v| v.as_str()) {
                    if batch_last_sync.as_deref().map(|b| ts > b).unwrap_or(true) {
                        batch_last_sync = Some(ts.to_string());
                    }
                }
                documents.push(doc);
            }
        }

        let next_cursor = json
            .pointer("/response_metadata/next_cursor")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .map(|c| c.to_string());

        match next_cursor {
            Some(c) => state.cursor = Some(c),
            None => {
                state.channel_index += 1;
                state.cursor = None;
            }
        }

        let has_more = state.channel_index < state.channels.len();
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
impl Connector for SlackConnector {
    fn source(&self) -> Source {
        Source::Slack
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
                warn!(error = %e, "slack: retrying without sync token");
                let stripped = without_sync_token(cursor);
                self.fetch_page(stripped.as_ref(), request).await
            }
            other => other,
        }
    }

    async fn discover(&self) -> Result<Vec<crate::connector::DiscoveryItem>> {
        let client = http_client()?;
        let channels = self.list_channels(&client, None).await?;
        Ok(channels
            .into_iter()
            .map(|c| crate::connector::DiscoveryItem {
                id: c.id,
                name: c.name,
            })
            .collect())
    }
}

/// Normalize a Slack message into a [`Document`].
fn message_to_document(message: &serde_json::Value, channel: &ChannelRef) -> Option<Document> {
    // Skip joins/leaves and other service subtypes.
    if message.get("subtype").is_some() {
        return None;
    }
    let ts = message.get("ts")?.as_str()?;
    let text = message.get("text")?.as_str()?;
    if text.trim().is_empty() {
        return None;
    }

    let id = format!("slack_{}_{}", channel.id, ts.replace('.', "_"));
    let mut metadata = Metadata::new();
    metadata.insert("id".to_string(), id.as_str().into());
    metadata.insert("source".to_string(), "slack".into());
    metadata.insert("type".to_string(), "message".into());
    metadata.insert("title".to_string(), format!("#{}", channel.name).into());
    metadata.insert("channel".to_string(), channel.name.as_str().into());
    metadata.insert("channelId".to_string(), channel.id.as_str().into());
    metadata.insert("channelType".to_string(), channel.kind.as_str().into());
    if let Some(user) = message.get("user").and_then(|u| u.as_str()) {
        metadata.insert("user".to_string(), user.into());
    }
    if let Some(thread_ts) = message.get("thread_ts").and_then(|t| t.as_str()) {
        metadata.insert("threadTs".to_string(), thread_ts.into());
    }
    if let Some(iso) = slack_ts_to_iso(ts) {
        metadata.insert("timestamp".to_string(), iso.as_str().into());
        metadata.insert("createdAt".to_string(), iso.as_str().into());
        metadata.insert("updatedAt".to_string(), iso.into());
    }

    Some(Document {
        id,
        source: Source::Slack,
        content: text.to_string(),
        metadata,
        pre_chunked: None,
    })
}

/// Convert a Slack `ts` ("1717200000.000100") to ISO 8601.
fn slack_ts_to_iso(ts: &str) -> Option<String> {
    let seconds: f64 = ts.parse().ok()?;
    let dt = chrono::DateTime::from_timestamp_millis((seconds * 1000.0) as i64)?;
    Some(dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> ChannelRef {
        ChannelRef {
            id: "C1234".to_string(),
            name: "eng".to_string(),
            kind: "public".to_string(),
        }
    }

    #[test]
    fn message_normalization() {
        let message = serde_json::json!({
            "ts": "1717200000.000100",
            "text": "deploy is done <@U99>",
            "user": "U42",
            "thread_ts": "1717199000.000100"
        });
        let doc = message_to_document(&message, &channel()).unwrap();
        assert_eq!(doc.id, "slack_C1234_1717200000_000100");
        assert_eq!(doc.metadata["channelId"].as_str(), Some("C1234"));
        assert_eq!(doc.metadata["channelType"].as_str(), Some("public"));
        assert_eq!(doc.metadata["threadTs"].as_str(), Some("1717199000.000100"));
        assert!(doc.metadata.contains_key("timestamp"));
    }

    #[test]
    fn service_messages_are_skipped() {
        let message = serde_json::json!({
            "ts": "1717200000.000100",
            "text": "user joined",
            "subtype": "channel_join"
        });
        assert!(message_to_document(&message, &channel()).is_none());
    }

    #[test]
    fn ts_conversion() {
        let iso = slack_ts_to_iso("1717200000.000000").unwrap();
        assert!(iso.starts_with("2024-06-01T00:00:00"));
    }
}
