//! Core data model for the knowledge collector.
//!
//! These types flow through the whole pipeline: connectors produce
//! [`Document`]s, the indexing engine tracks [`Cursor`]s and [`IndexStatus`],
//! the analytics store records [`IndexingRun`]s, and the search engine
//! returns [`SearchResult`]s.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The seven supported data sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Jira,
    Slack,
    Gmail,
    Drive,
    Confluence,
    Calendar,
    Github,
}

impl Source {
    pub const ALL: [Source; 7] = [
        Source::Jira,
        Source::Slack,
        Source::Gmail,
        Source::Drive,
        Source::Confluence,
        Source::Calendar,
        Source::Github,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Jira => "jira",
            Source::Slack => "slack",
            Source::Gmail => "gmail",
            Source::Drive => "drive",
            Source::Confluence => "confluence",
            Source::Calendar => "calendar",
            Source::Github => "github",
        }
    }

    /// Collection name in the vector store.
    pub fn collection(&self) -> String {
        format!("collector_{}", self.as_str())
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jira" => Ok(Source::Jira),
            "slack" => Ok(Source::Slack),
            "gmail" => Ok(Source::Gmail),
            "drive" => Ok(Source::Drive),
            "confluence" => Ok(Source::Confluence),
            "calendar" => Ok(Source::Calendar),
            "github" => Ok(Source::Github),
            other => anyhow::bail!("Unknown source: '{}'", other),
        }
    }
}

/// A dynamically-typed metadata value.
///
/// Documents carry open-ended metadata; this mirrors the JSON value space
/// connectors produce (strings, numbers, booleans, arrays).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<MetaValue>),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MetaValue]> {
        match self {
            MetaValue::List(l) => Some(l),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Str(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Str(s)
    }
}

impl From<f64> for MetaValue {
    fn from(n: f64) -> Self {
        MetaValue::Num(n)
    }
}

impl From<i64> for MetaValue {
    fn from(n: i64) -> Self {
        MetaValue::Num(n as f64)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

/// Open-ended document metadata.
///
/// A `BTreeMap` keeps serialization key-sorted, which makes the canonical
/// JSON (and therefore [`document_hash`]) independent of insertion order.
pub type Metadata = BTreeMap<String, MetaValue>;

/// Normalized unit produced by connectors and consumed by the indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Stable id, globally unique within a source.
    pub id: String,
    pub source: Source,
    /// Markdown-ish text rendered by the connector.
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Connector-supplied chunks; override the store's chunker when len > 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_chunked: Option<Vec<String>>,
}

impl Document {
    pub fn title(&self) -> Option<&str> {
        self.metadata
            .get("title")
            .or_else(|| self.metadata.get("subject"))
            .and_then(|v| v.as_str())
    }
}

/// Content hash over `{content, metadata}`.
///
/// Metadata keys are canonicalized by the `BTreeMap` ordering, so two
/// documents with the same fields hash identically regardless of how their
/// metadata was assembled.
pub fn document_hash(content: &str, metadata: &Metadata) -> String {
    let canonical = serde_json::json!({
        "content": content,
        "metadata": metadata,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Per-source durable sync pointer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// High-watermark timestamp through which the source has been scanned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<String>,
    /// Opaque continuation token; present means mid-paging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<String>,
    /// Connector-private pagination state plus the config fingerprint.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Cursor {
    pub fn config_key(&self) -> Option<&str> {
        self.metadata.get("configKey").map(|s| s.as_str())
    }
}

/// Job state for a source's indexing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Error => "error",
        }
    }
}

/// Current indexing status of a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatus {
    pub source: Source,
    pub status: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<String>,
    #[serde(default)]
    pub documents_indexed: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
}

impl IndexStatus {
    pub fn idle(source: Source) -> Self {
        Self {
            source,
            status: JobState::Idle,
            last_sync: None,
            documents_indexed: 0,
            last_error: None,
            last_error_at: None,
            workflow_id: None,
        }
    }
}

/// Terminal state of an indexing run (analytics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
    Error,
}

/// One recorded indexing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexingRun {
    pub id: String,
    pub source: Source,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub status: RunState,
    #[serde(default)]
    pub documents_processed: i64,
    #[serde(default)]
    pub documents_new: i64,
    #[serde(default)]
    pub documents_updated: i64,
    #[serde(default)]
    pub documents_skipped: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// Aggregate run statistics for one source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    pub total_runs: i64,
    pub successful_runs: i64,
    pub failed_runs: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<String>,
    pub avg_duration_ms: f64,
    pub total_documents_processed: i64,
}

/// One day's counters for a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub date: String,
    pub runs: i64,
    pub documents: i64,
    pub errors: i64,
}

/// A ranked search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub source: Source,
    pub content: String,
    pub metadata: Metadata,
    pub score: f64,
}

/// Current time as an ISO 8601 string.
pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parse a timestamp string to milliseconds since epoch.
///
/// Accepts RFC 3339, naive datetimes, and bare dates — the shapes
/// connectors actually emit for `createdAt`/`updatedAt`.
pub fn parse_timestamp_ms(value: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(d) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let mut meta = Metadata::new();
        meta.insert("title".to_string(), "Hello".into());
        meta.insert("count".to_string(), 3.0.into());
        assert_eq!(document_hash("body", &meta), document_hash("body", &meta));
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let mut a = Metadata::new();
        a.insert("alpha".to_string(), "1".into());
        a.insert("beta".to_string(), "2".into());

        let mut b = Metadata::new();
        b.insert("beta".to_string(), "2".into());
        b.insert("alpha".to_string(), "1".into());

        assert_eq!(document_hash("x", &a), document_hash("x", &b));
    }

    #[test]
    fn hash_changes_with_content() {
        let meta = Metadata::new();
        assert_ne!(document_hash("a", &meta), document_hash("b", &meta));
    }

    #[test]
    fn source_round_trip() {
        for s in Source::ALL {
            assert_eq!(s.as_str().parse::<Source>().unwrap(), s);
        }
    }

    #[test]
    fn parse_timestamp_formats() {
        assert_eq!(
            parse_timestamp_ms("2024-01-01T00:00:00Z"),
            Some(1_704_067_200_000)
        );
        assert_eq!(parse_timestamp_ms("2024-01-01"), Some(1_704_067_200_000));
        assert!(parse_timestamp_ms("not a date").is_none());
    }
}
