//! Google Calendar connector.
//!
//! Pages events one calendar at a time; the position
//! (`calendarIndex`, `pageToken`) is kept in `sync_token` and mirrored into
//! the cursor metadata. A 410 on the sync window falls back to a full
//! listing via the stale-token retry.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::connector::{
    http_client, is_stale_token_error, is_stale_token_status, without_sync_token, Connector,
    ConnectorResult, CursorUpdate, FetchRequest, StaleTokenError,
};
use crate::google_auth::GoogleCredentials;
use crate::models::{Cursor, Document, MetaValue, Metadata, Source};

const API: &str = "https://www.googleapis.com/calendar/v3";
const PAGE_SIZE: usize = 50;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PageState {
    calendars: Vec<String>,
    calendar_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    page_token: Option<String>,
}

pub struct CalendarConnector {
    user_email: Option<String>,
}

impl CalendarConnector {
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
                    "calendar rejected sync window ({})",
                    status
                ))));
            }
            anyhow::bail!("Calendar API error ({}): {}", status, body);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn list_calendars(
        &self,
        client: &reqwest::Client,
        token: &str,
    ) -> Result<Vec<String>> {
        let json = self
            .get_json(
                client,
                token,
                &format!("{}/users/me/calendarList", API),
                &[("maxResults", "100".to_string())],
            )
            .await?;
        Ok(json
            .get("items")
            .and_then(|i| i.as_array())
            .into_iter()
            .flatten()
            .filter_map(|c| c.get("id").and_then(|i| i.as_str()))
            .map(|i| i.to_string())
            .collect())
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

        if state.calendars.is_empty() {
            state.calendars = match &request.calendar_ids {
                Some(ids) if !ids.is_empty() => ids.clone(),
                _ => self.list_calendars(&client, &token).await?,
            };
            state.calendar_index = 0;
            state.page_token = None;
        }

        let Some(calendar_id) = state.calendars.get(state.calendar_index).cloned() else {
            return Ok(ConnectorResult::default());
        };

        let mut query = vec![
            ("maxResults", PAGE_SIZE.to_string()),
            ("singleEvents", "true".to_string()),
        ];
        if let Some(last_sync) = cursor.and_then(|c| c.last_sync.as_deref()) {
            query.push(("updatedMin", last_sync.to_string()));
        }
        if let Some(pt) = &state.page_token {
            query.push(("pageToken", pt.clone()));
        }

        let url = format!("{}/calendars/{}/events", API, calendar_id);
        let listing = self.get_json(&client, &token, &url, &query).await?;

        let mut documents = Vec::new();
        let mut batch_last_sync: Option<String> = None;
        for event in listing
            .get("items")
            .and_then(|i| i.as_array())
            .into_iter()
            .flatten()
        {
            if let Some(doc) = event_to_document(event, &calendar_id) {
                // Events advance the watermark by their start time.
                if let Some(start) = doc.metadata.get("start").and_then(|v| v.as_str()) {
                    if batch_last_sync.as_deref().map(|b| start > b).unwrap_or(true) {
                        batch_last_sync = Some(start.to_string());
                    }
                }
                documents.push(doc);
            }
        }

        let next_page = listing
            .get("nextPageToken")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string());

        match next_page {
            Some(pt) => state.page_token = Some(pt),
            None => {
                state.calendar_index += 1;
                state.page_token = None;
            }
        }

        let has_more = state.calendar_index < state.calendars.len();
        let sync_token = has_more.then(|| serde_json::to_string(&state).expect("state serializes"));

        // Mirror the position into cursor metadata for observability.
        let mut metadata = std::collections::BTreeMap::new();
        if has_more {
            metadata.insert(
                "calendarIndex".to_string(),
                state.calendar_index.to_string(),
            );
            if let Some(pt) = &state.page_token {
                metadata.insert("pageToken".to_string(), pt.clone());
            }
        }

        Ok(ConnectorResult {
            documents,
            new_cursor: CursorUpdate {
                sync_token,
                metadata,
            },
            has_more,
            batch_last_sync,
        })
    }
}

#[async_trait]
impl Connector for CalendarConnector {
    fn source(&self) -> Source {
        Source::Calendar
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
                warn!(error = %e, "calendar: retrying without sync token");
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
            .get_json(
                &client,
                &token,
                &format!("{}/users/me/calendarList", API),
                &[("maxResults", "100".to_string())],
            )
            .await?;
        Ok(json
            .get("items")
            .and_then(|i| i.as_array())
            .into_iter()
            .flatten()
            .filter_map(|calendar| {
                Some(crate::connector::DiscoveryItem {
                    id: calendar.get("id")?.as_str()?.to_string(),
                    name: calendar
                        .get("summary")
                        .and_then(|s| s.as_str())
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect())
    }
}

fn event_to_document(event: &serde_json::Value, calendar_id: &str) -> Option<Document> {
    let event_id = event.get("id")?.as_str()?;
    if event.get("status").and_then(|s| s.as_str()) == Some("cancelled") {
        return None;
    }
    let summary = event.get("summary").and_then(|s| s.as_str()).unwrap_or("");
    let description = event
        .get("description")
        .and_then(|d| d.as_str())
        .unwrap_or("");

    let id = format!("calendar_{}", event_id);
    let mut metadata = Metadata::new();
    metadata.insert("id".to_string(), id.as_str().into());
    metadata.insert("source".to_string(), "calendar".into());
    metadata.insert("type".to_string(), "event".into());
    metadata.insert("calendarId".to_string(), calendar_id.into());
    if !summary.is_empty() {
        metadata.insert("title".to_string(), summary.into());
    }

    let start = event
        .pointer("/start/dateTime")
        .or_else(|| event.pointer("/start/date"))
        .and_then(|s| s.as_str());
    if let Some(start) = start {
        metadata.insert("start".to_string(), start.into());
    }
    if let Some(end) = event
        .pointer("/end/dateTime")
        .or_else(|| event.pointer("/end/date"))
        .and_then(|e| e.as_str())
    {
        metadata.insert("end".to_string(), end.into());
    }
    if let Some(organizer) = event
        .pointer("/organizer/email")
        .and_then(|o| o.as_str())
    {
        metadata.insert("organizer".to_string(), organizer.into());
    }
    let attendees: Vec<String> = event
        .get("attendees")
        .and_then(|a| a.as_array())
        .into_iter()
        .flatten()
        .filter_map(|a| a.get("email").and_then(|e| e.as_str()))
        .map(|e| e.to_string())
        .collect();
    if !attendees.is_empty() {
        metadata.insert(
            "attendees".to_string(),
            MetaValue::List(attendees.iter().map(|a| a.as_str().into()).collect()),
        );
    }
    if let Some(location) = event.get("location").and_then(|l| l.as_str()) {
        metadata.insert("location".to_string(), location.into());
    }
    if let Some(created) = event.get("created").and_then(|c| c.as_str()) {
        metadata.insert("createdAt".to_string(), created.into());
    }
    if let Some(updated) = event.get("updated").and_then(|u| u.as_str()) {
        metadata.insert("updatedAt".to_string(), updated.into());
    }

    let mut content = String::new();
    if !summary.is_empty() {
        content.push_str(&format!("# {}\n\n", summary));
    }
    if let Some(start) = start {
        content.push_str(&format!("When: {}\n", start));
    }
    if !attendees.is_empty() {
        content.push_str(&format!("Attendees: {}\n", attendees.join(", ")));
    }
    if !description.is_empty() {
        content.push('\n');
        content.push_str(description);
    }
    if content.trim().is_empty() {
        return None;
    }

    Some(Document {
        id,
        source: Source::Calendar,
        content,
        metadata,
        pre_chunked: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_normalization() {
        let event = serde_json::json!({
            "id": "evt1",
            "summary": "Sprint Planning",
            "description": "Plan the next two weeks.",
            "start": { "dateTime": "2024-06-10T09:00:00Z" },
            "end": { "dateTime": "2024-06-10T10:00:00Z" },
            "organizer": { "email": "pm@acme.com" },
            "attendees": [
                { "email": "a@acme.com" },
                { "email": "b@acme.com" }
            ],
            "created": "2024-06-01T00:00:00Z",
            "updated": "2024-06-05T00:00:00Z"
        });
        let doc = event_to_document(&event, "primary").unwrap();
        assert_eq!(doc.id, "calendar_evt1");
        assert_eq!(doc.metadata["organizer"].as_str(), Some("pm@acme.com"));
        assert_eq!(doc.metadata["attendees"].as_list().unwrap().len(), 2);
        assert_eq!(doc.metadata["start"].as_str(), Some("2024-06-10T09:00:00Z"));
        assert!(doc.content.contains("Plan the next two weeks."));
    }

    #[test]
    fn cancelled_events_are_skipped() {
        let event = serde_json::json!({
            "id": "evt2",
            "status": "cancelled",
            "summary": "Old meeting"
        });
        assert!(event_to_document(&event, "primary").is_none());
    }
}
