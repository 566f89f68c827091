//! Configuration parsing and validation.
//!
//! The collector is configured via a TOML file (default: `config/kc.toml`)
//! plus environment variables for credentials. The TOML file defines the
//! database path, server bind address, application settings (API key,
//! company domains), embedding provider tuning, and per-source connector
//! sections.
//!
//! # Credentials
//!
//! Secrets never live in the config file:
//!
//! | Source | Environment variables |
//! |--------|----------------------|
//! | jira | `JIRA_API_TOKEN` |
//! | confluence | `CONFLUENCE_API_TOKEN` |
//! | slack | `SLACK_BOT_TOKEN` |
//! | gmail / drive / calendar | `GOOGLE_CLIENT_ID`, `GOOGLE_CLIENT_SECRET`, `GOOGLE_REFRESH_TOKEN` |
//! | github | `GITHUB_TOKEN` |
//! | embedding | `OPENAI_API_KEY` |

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    /// If set, the HTTP guard rejects requests lacking a matching
    /// `x-api-key` header. Falls back to the `APP_API_KEY` env var.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Comma-separated list of domains considered internal.
    #[serde(default)]
    pub company_domains: Option<String>,
    /// Directory for best-effort raw document dumps. Disabled when unset.
    #[serde(default)]
    pub raw_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("APP_API_KEY").ok())
            .filter(|k| !k.is_empty())
    }

    pub fn company_domains(&self) -> Vec<String> {
        self.company_domains
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"` (hosted) or `"default"` (deterministic local fallback).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "default".to_string()
}
fn default_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    pub jira: Option<JiraConfig>,
    pub confluence: Option<ConfluenceConfig>,
    pub slack: Option<SlackConfig>,
    pub google: Option<GoogleConfig>,
    pub github: Option<GithubConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JiraConfig {
    /// Site base URL, e.g. `https://acme.atlassian.net`.
    pub base_url: String,
    /// Account email used for basic auth and "assigned to me" checks.
    pub username: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConfluenceConfig {
    pub base_url: String,
    pub username: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    /// Include archived channels when listing conversations.
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GoogleConfig {
    /// The authenticated user's email; drives ownership and identity checks
    /// for gmail, drive, and calendar.
    pub user_email: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GithubConfig {
    pub username: String,
    /// Whether the file-indexing phase runs by default.
    #[serde(default)]
    pub index_files: bool,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "default" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be default or openai.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn company_domains_parse() {
        let app = AppConfig {
            api_key: None,
            company_domains: Some("Acme.com, corp.example.org ,".to_string()),
            raw_dir: None,
        };
        assert_eq!(app.company_domains(), vec!["acme.com", "corp.example.org"]);
    }

    #[test]
    fn company_domains_empty() {
        let app = AppConfig::default();
        assert!(app.company_domains().is_empty());
    }
}
