//! Per-source relevance enrichment.
//!
//! Attaches numeric relevance features to each document's metadata and
//! computes a `relevance_score` in `[0, 1]`. The transform is pure: input
//! documents are never mutated, and incoming metadata fields are never
//! overwritten — derived fields are only added where absent.

use std::collections::HashMap;

use chrono::Utc;

use crate::config::Config;
use crate::models::{Document, MetaValue, Metadata, Source};

/// Sentinel for missing dates: far enough in the past to earn no bonus.
const MISSING_DATE_DAYS: i64 = 999;

const FREE_MAIL_DOMAINS: &[&str] = &[
    "gmail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "aol.com",
];

/// The configured identity used for ownership and assignment checks.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub github_username: Option<String>,
    pub jira_username: Option<String>,
    pub google_user_email: Option<String>,
    pub company_domains: Vec<String>,
}

impl Identity {
    pub fn from_config(config: &Config) -> Self {
        Self {
            github_username: config
                .connectors
                .github
                .as_ref()
                .map(|g| g.username.clone()),
            jira_username: config.connectors.jira.as_ref().map(|j| j.username.clone()),
            google_user_email: config
                .connectors
                .google
                .as_ref()
                .map(|g| g.user_email.clone()),
            company_domains: config.app.company_domains(),
        }
    }

    /// Case-insensitive check whether `value` names the configured user.
    ///
    /// Google-backed sources fall back to the Jira username when no Google
    /// identity is configured.
    pub fn is_current_user(&self, source: Source, value: &str) -> bool {
        let expected = match source {
            Source::Github => self.github_username.as_deref(),
            Source::Jira => self.jira_username.as_deref(),
            Source::Gmail | Source::Drive | Source::Calendar => self
                .google_user_email
                .as_deref()
                .or(self.jira_username.as_deref()),
            _ => None,
        };
        match expected {
            Some(expected) => expected.eq_ignore_ascii_case(value.trim()),
            None => false,
        }
    }

    /// Whether a `From` address belongs to an internal domain.
    ///
    /// With `company_domains` configured this is a membership test;
    /// otherwise any non-free-mail domain counts as internal.
    pub fn is_internal(&self, from: &str) -> bool {
        let Some(domain) = extract_domain(from) else {
            return false;
        };
        if !self.company_domains.is_empty() {
            return self.company_domains.iter().any(|d| d == &domain);
        }
        !FREE_MAIL_DOMAINS.contains(&domain.as_str())
    }
}

/// Enrich a batch with relevance features and scores.
///
/// Returns new documents; the input slice is left untouched.
pub fn add_relevance_weights(
    source: Source,
    documents: &[Document],
    identity: &Identity,
) -> Vec<Document> {
    // Gmail thread depth can fall back to counting thread members within
    // this batch.
    let thread_counts: HashMap<&str, i64> = if source == Source::Gmail {
        let mut counts = HashMap::new();
        for doc in documents {
            if let Some(thread_id) = doc.metadata.get("threadId").and_then(|v| v.as_str()) {
                *counts.entry(thread_id).or_insert(0) += 1;
            }
        }
        counts
    } else {
        HashMap::new()
    };

    documents
        .iter()
        .map(|doc| {
            let mut enriched = doc.clone();
            let score = match source {
                Source::Gmail => score_gmail(&mut enriched, identity, &thread_counts),
                Source::Slack => score_slack(&mut enriched),
                Source::Jira => score_jira(&mut enriched, identity),
                Source::Drive => score_drive(&mut enriched, identity),
                Source::Confluence => score_confluence(&mut enriched),
                Source::Calendar => score_calendar(&mut enriched, identity),
                Source::Github => score_github(&mut enriched, identity),
            };
            set_if_absent(
                &mut enriched.metadata,
                "relevance_score",
                MetaValue::Num(score.min(1.0)),
            );
            enriched
        })
        .collect()
}

fn score_gmail(
    doc: &mut Document,
    identity: &Identity,
    thread_counts: &HashMap<&str, i64>,
) -> f64 {
    let mut score = 0.5;

    let from = doc
        .metadata
        .get("from")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let internal = identity.is_internal(from);
    if internal {
        score += 0.2;
    }
    set_if_absent(&mut doc.metadata, "is_internal", MetaValue::Bool(internal));

    let recipient_count = list_len(&doc.metadata, "to") + list_len(&doc.metadata, "cc");
    if recipient_count <= 3 {
        score += 0.15;
    }
    set_if_absent(
        &mut doc.metadata,
        "recipient_count",
        MetaValue::Num(recipient_count as f64),
    );

    // Prefer an incoming count; otherwise fall back to thread members seen
    // in this batch. Neither ⇒ the field stays unset.
    let thread_depth = doc
        .metadata
        .get("threadMessageCount")
        .and_then(|v| v.as_f64())
        .map(|n| n as i64)
        .or_else(|| {
            doc.metadata
                .get("threadId")
                .and_then(|v| v.as_str())
                .and_then(|t| thread_counts.get(t).copied())
        });
    if let Some(depth) = thread_depth {
        if depth > 1 {
            score += 0.1;
        }
        set_if_absent(
            &mut doc.metadata,
            "thread_depth",
            MetaValue::Num(depth as f64),
        );
    }

    score
}

fn score_slack(doc: &mut Document) -> f64 {
    let mut score = 0.5;

    let channel = doc
        .metadata
        .get("channel")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let channel_type = doc
        .metadata
        .get("channelType")
        .and_then(|v| v.as_str())
        .map(|t| t.to_string())
        .unwrap_or_else(|| {
            if channel.starts_with("DM") {
                "dm".to_string()
            } else {
                "public".to_string()
            }
        });
    score += match channel_type.as_str() {
        "dm" => 0.3,
        "mpim" => 0.2,
        "private" => 0.15,
        _ => 0.0,
    };
    set_if_absent(
        &mut doc.metadata,
        "channel_type",
        MetaValue::Str(channel_type),
    );

    let has_mention = doc.content.contains("<@");
    if has_mention {
        score += 0.1;
    }
    set_if_absent(&mut doc.metadata, "has_mention", MetaValue::Bool(has_mention));

    let in_thread = doc.metadata.contains_key("threadTs");
    if in_thread {
        score += 0.05;
    }
    set_if_absent(
        &mut doc.metadata,
        "is_thread_participant",
        MetaValue::Bool(in_thread),
    );

    score
}

fn score_jira(doc: &mut Document, identity: &Identity) -> f64 {
    let mut score = 0.3;

    let assignee = doc
        .metadata
        .get("assignee")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let assigned_to_me = identity.is_current_user(Source::Jira, assignee);
    if assigned_to_me {
        score += 0.3;
    }
    set_if_absent(
        &mut doc.metadata,
        "is_assigned_to_me",
        MetaValue::Bool(assigned_to_me),
    );

    let weight = priority_weight(
        doc.metadata
            .get("priority")
            .and_then(|v| v.as_str())
            .unwrap_or(""),
    );
    score += weight * 0.06;
    set_if_absent(&mut doc.metadata, "priority_weight", MetaValue::Num(weight));

    let days = days_since_field(&doc.metadata, "updatedAt");
    score += recency_bonus(days, 0.15, 0.05);
    set_if_absent(
        &mut doc.metadata,
        "days_since_update",
        MetaValue::Num(days as f64),
    );

    score
}

fn score_drive(doc: &mut Document, identity: &Identity) -> f64 {
    let mut score = 0.4;

    let owner = doc
        .metadata
        .get("owner")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let is_owner = identity.is_current_user(Source::Drive, owner);
    if is_owner {
        score += 0.2;
    }
    set_if_absent(&mut doc.metadata, "is_owner", MetaValue::Bool(is_owner));

    let days = days_since_field(&doc.metadata, "updatedAt");
    score += recency_bonus(days, 0.2, 0.1);
    set_if_absent(
        &mut doc.metadata,
        "days_since_update",
        MetaValue::Num(days as f64),
    );

    score
}

fn score_confluence(doc: &mut Document) -> f64 {
    let mut score = 0.4;

    let label_count = list_len(&doc.metadata, "labels");
    if label_count > 0 {
        score += 0.15;
    }
    set_if_absent(
        &mut doc.metadata,
        "label_count",
        MetaValue::Num(label_count as f64),
    );

    let depth = list_len(&doc.metadata, "ancestors");
    if depth <= 2 {
        score += 0.1;
    }
    set_if_absent(
        &mut doc.metadata,
        "hierarchy_depth",
        MetaValue::Num(depth as f64),
    );

    let days = days_since_field(&doc.metadata, "updatedAt");
    score += recency_bonus(days, 0.2, 0.1);
    set_if_absent(
        &mut doc.metadata,
        "days_since_update",
        MetaValue::Num(days as f64),
    );

    score
}

fn score_calendar(doc: &mut Document, identity: &Identity) -> f64 {
    let mut score = 0.5;

    let organizer = doc
        .metadata
        .get("organizer")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let is_organizer = identity.is_current_user(Source::Calendar, organizer);
    if is_organizer {
        score += 0.2;
    }
    set_if_absent(
        &mut doc.metadata,
        "is_organizer",
        MetaValue::Bool(is_organizer),
    );

    let attendee_count = list_len(&doc.metadata, "attendees");
    if attendee_count <= 5 {
        score += 0.1;
    }
    set_if_absent(
        &mut doc.metadata,
        "attendee_count",
        MetaValue::Num(attendee_count as f64),
    );

    // Upcoming events: strong bonus inside 24h, weaker inside a week.
    if let Some(start_ms) = doc
        .metadata
        .get("start")
        .and_then(|v| v.as_str())
        .and_then(crate::models::parse_timestamp_ms)
    {
        let hours_until = (start_ms - Utc::now().timestamp_millis()) as f64 / 3_600_000.0;
        if (0.0..24.0).contains(&hours_until) {
            score += 0.2;
        } else if (0.0..168.0).contains(&hours_until) {
            score += 0.1;
        }
        set_if_absent(
            &mut doc.metadata,
            "hours_until_start",
            MetaValue::Num(hours_until.floor()),
        );
    }

    score
}

fn score_github(doc: &mut Document, identity: &Identity) -> f64 {
    let mut score = 0.4;

    let author = doc
        .metadata
        .get("author")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let is_author = identity.is_current_user(Source::Github, author);
    if is_author {
        score += 0.2;
    }
    set_if_absent(&mut doc.metadata, "is_author", MetaValue::Bool(is_author));

    let assigned_to_me = doc
        .metadata
        .get("assignees")
        .and_then(|v| v.as_list())
        .map(|assignees| {
            assignees
                .iter()
                .filter_map(|a| a.as_str())
                .any(|a| identity.is_current_user(Source::Github, a))
        })
        .unwrap_or(false);
    if assigned_to_me {
        score += 0.2;
    }
    set_if_absent(
        &mut doc.metadata,
        "is_assigned_to_me",
        MetaValue::Bool(assigned_to_me),
    );

    let days = days_since_field(&doc.metadata, "updatedAt");
    score += recency_bonus(days, 0.15, 0.05);
    set_if_absent(
        &mut doc.metadata,
        "days_since_update",
        MetaValue::Num(days as f64),
    );

    score
}

// ============ Supporting definitions ============

/// Jira-style priority names mapped to weights.
pub fn priority_weight(priority: &str) -> f64 {
    match priority {
        "Critical" | "Blocker" | "Highest" => 5.0,
        "High" => 4.0,
        "Medium" => 3.0,
        "Low" => 2.0,
        _ => 1.0,
    }
}

/// Whole days since `date`; missing or unparseable dates read as ancient.
pub fn days_since(date: Option<&str>) -> i64 {
    let Some(ms) = date.and_then(crate::models::parse_timestamp_ms) else {
        return MISSING_DATE_DAYS;
    };
    let delta_ms = Utc::now().timestamp_millis() - ms;
    (delta_ms as f64 / 86_400_000.0).floor() as i64
}

fn days_since_field(metadata: &Metadata, field: &str) -> i64 {
    days_since(metadata.get(field).and_then(|v| v.as_str()))
}

fn recency_bonus(days: i64, within_week: f64, within_month: f64) -> f64 {
    if days < 7 {
        within_week
    } else if days < 30 {
        within_month
    } else {
        0.0
    }
}

fn list_len(metadata: &Metadata, field: &str) -> usize {
    metadata
        .get(field)
        .and_then(|v| v.as_list())
        .map(|l| l.len())
        .unwrap_or(0)
}

fn set_if_absent(metadata: &mut Metadata, key: &str, value: MetaValue) {
    metadata.entry(key.to_string()).or_insert(value);
}

fn extract_domain(address: &str) -> Option<String> {
    let tail = address.rsplit('@').next()?;
    let domain: String = tail
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '.' || *c == '-')
        .collect::<String>()
        .to_lowercase();
    if domain.is_empty() || !domain.contains('.') {
        return None;
    }
    Some(domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            github_username: Some("octocat".to_string()),
            jira_username: Some("me@acme.com".to_string()),
            google_user_email: Some("me@acme.com".to_string()),
            company_domains: vec!["acme.com".to_string()],
        }
    }

    fn doc(source: Source, fields: &[(&str, MetaValue)]) -> Document {
        let mut metadata = Metadata::new();
        for (k, v) in fields {
            metadata.insert(k.to_string(), v.clone());
        }
        Document {
            id: "d1".to_string(),
            source,
            content: "hello".to_string(),
            metadata,
            pre_chunked: None,
        }
    }

    fn score_of(doc: &Document) -> f64 {
        doc.metadata["relevance_score"].as_f64().unwrap()
    }

    #[test]
    fn input_is_not_mutated() {
        let original = doc(
            Source::Gmail,
            &[("from", "boss@acme.com".into()), ("threadId", "t1".into())],
        );
        let before = original.clone();
        let _ = add_relevance_weights(Source::Gmail, &[original.clone()], &identity());
        assert_eq!(original.metadata, before.metadata);
        assert_eq!(original.content, before.content);
    }

    #[test]
    fn gmail_internal_small_audience() {
        let d = doc(
            Source::Gmail,
            &[
                ("from", "boss@acme.com".into()),
                (
                    "to",
                    MetaValue::List(vec!["me@acme.com".into(), "you@acme.com".into()]),
                ),
            ],
        );
        let enriched = add_relevance_weights(Source::Gmail, &[d], &identity());
        // 0.5 base + 0.2 internal + 0.15 small audience
        assert!((score_of(&enriched[0]) - 0.85).abs() < 1e-9);
        assert_eq!(enriched[0].metadata["is_internal"].as_bool(), Some(true));
        assert_eq!(enriched[0].metadata["recipient_count"].as_f64(), Some(2.0));
    }

    #[test]
    fn gmail_thread_depth_counted_in_batch() {
        let a = doc(Source::Gmail, &[("from", "x@other.dev".into()), ("threadId", "t1".into())]);
        let b = doc(Source::Gmail, &[("from", "y@other.dev".into()), ("threadId", "t1".into())]);
        let enriched = add_relevance_weights(Source::Gmail, &[a, b], &identity());
        assert_eq!(enriched[0].metadata["thread_depth"].as_f64(), Some(2.0));
        // thread depth > 1 earns the bonus on top of internal (other.dev is
        // not a company domain here, so no internal bonus)
        assert!((score_of(&enriched[0]) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn gmail_no_thread_info_leaves_field_unset() {
        let d = doc(Source::Gmail, &[("from", "x@other.dev".into())]);
        let enriched = add_relevance_weights(Source::Gmail, &[d], &identity());
        assert!(!enriched[0].metadata.contains_key("thread_depth"));
    }

    #[test]
    fn jira_assigned_high_priority_recent() {
        let d = doc(
            Source::Jira,
            &[
                ("assignee", "ME@acme.com".into()),
                ("priority", "High".into()),
                ("updatedAt", crate::models::now_iso().as_str().into()),
            ],
        );
        let enriched = add_relevance_weights(Source::Jira, &[d], &identity());
        // 0.3 + 0.3 assigned + 4*0.06 priority + 0.15 recent = 0.99
        assert!((score_of(&enriched[0]) - 0.99).abs() < 1e-9);
        assert_eq!(enriched[0].metadata["priority_weight"].as_f64(), Some(4.0));
        assert_eq!(enriched[0].metadata["days_since_update"].as_f64(), Some(0.0));
    }

    #[test]
    fn missing_dates_read_as_ancient() {
        let d = doc(Source::Jira, &[]);
        let enriched = add_relevance_weights(Source::Jira, &[d], &identity());
        assert_eq!(
            enriched[0].metadata["days_since_update"].as_f64(),
            Some(999.0)
        );
    }

    #[test]
    fn slack_dm_with_mention() {
        let mut d = doc(
            Source::Slack,
            &[("channel", "DM with pat".into()), ("threadTs", "1".into())],
        );
        d.content = "ping <@U42>".to_string();
        let enriched = add_relevance_weights(Source::Slack, &[d], &identity());
        // 0.5 + 0.3 dm + 0.1 mention + 0.05 thread = 0.95
        assert!((score_of(&enriched[0]) - 0.95).abs() < 1e-9);
        assert_eq!(
            enriched[0].metadata["channel_type"].as_str(),
            Some("dm")
        );
    }

    #[test]
    fn slack_explicit_channel_type_wins() {
        let d = doc(Source::Slack, &[("channelType", "mpim".into())]);
        let enriched = add_relevance_weights(Source::Slack, &[d], &identity());
        assert!((score_of(&enriched[0]) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn score_is_clamped() {
        let d = doc(
            Source::Jira,
            &[
                ("assignee", "me@acme.com".into()),
                ("priority", "Blocker".into()),
                ("updatedAt", crate::models::now_iso().as_str().into()),
            ],
        );
        let enriched = add_relevance_weights(Source::Jira, &[d], &identity());
        // 0.3 + 0.3 + 0.3 + 0.15 = 1.05 → clamped
        assert!((score_of(&enriched[0]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn existing_fields_are_not_overwritten() {
        let d = doc(
            Source::Gmail,
            &[
                ("from", "boss@acme.com".into()),
                ("is_internal", MetaValue::Bool(false)),
            ],
        );
        let enriched = add_relevance_weights(Source::Gmail, &[d], &identity());
        // The caller's value survives even though the address is internal.
        assert_eq!(enriched[0].metadata["is_internal"].as_bool(), Some(false));
    }

    #[test]
    fn internal_fallback_heuristic() {
        let no_domains = Identity::default();
        assert!(no_domains.is_internal("dev@some-startup.io"));
        assert!(!no_domains.is_internal("friend@gmail.com"));
        assert!(!no_domains.is_internal("not-an-address"));
    }

    #[test]
    fn internal_with_configured_domains() {
        let id = identity();
        assert!(id.is_internal("Boss <boss@acme.com>"));
        assert!(!id.is_internal("x@some-startup.io"));
    }

    #[test]
    fn priority_weights() {
        assert_eq!(priority_weight("Blocker"), 5.0);
        assert_eq!(priority_weight("High"), 4.0);
        assert_eq!(priority_weight("Medium"), 3.0);
        assert_eq!(priority_weight("Low"), 2.0);
        assert_eq!(priority_weight("Lowest"), 1.0);
        assert_eq!(priority_weight(""), 1.0);
    }

    #[test]
    fn calendar_upcoming_event() {
        let soon = (Utc::now() + chrono::Duration::hours(3))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();
        let d = doc(
            Source::Calendar,
            &[
                ("organizer", "me@acme.com".into()),
                ("start", soon.as_str().into()),
                (
                    "attendees",
                    MetaValue::List(vec!["a@acme.com".into(), "b@acme.com".into()]),
                ),
            ],
        );
        let enriched = add_relevance_weights(Source::Calendar, &[d], &identity());
        // 0.5 + 0.2 organizer + 0.1 small + 0.2 within 24h = 1.0
        assert!((score_of(&enriched[0]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn github_author_and_assignee() {
        let d = doc(
            Source::Github,
            &[
                ("author", "Octocat".into()),
                ("assignees", MetaValue::List(vec!["octocat".into()])),
                ("updatedAt", crate::models::now_iso().as_str().into()),
            ],
        );
        let enriched = add_relevance_weights(Source::Github, &[d], &identity());
        // 0.4 + 0.2 + 0.2 + 0.15 = 0.95
        assert!((score_of(&enriched[0]) - 0.95).abs() < 1e-9);
    }

    #[test]
    fn confluence_labels_and_depth() {
        let d = doc(
            Source::Confluence,
            &[
                ("labels", MetaValue::List(vec!["charter".into()])),
                ("ancestors", MetaValue::List(vec!["1".into(), "2".into()])),
            ],
        );
        let enriched = add_relevance_weights(Source::Confluence, &[d], &identity());
        // 0.4 + 0.15 labels + 0.1 shallow = 0.65 (no recency)
        assert!((score_of(&enriched[0]) - 0.65).abs() < 1e-9);
        assert_eq!(enriched[0].metadata["hierarchy_depth"].as_f64(), Some(2.0));
    }
}
