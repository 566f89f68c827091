//! OAuth credentials shared by the Google-backed connectors.
//!
//! Gmail, Drive, and Calendar all authenticate with the same refresh-token
//! grant. Credentials are read from environment variables:
//!
//! - `GOOGLE_CLIENT_ID`
//! - `GOOGLE_CLIENT_SECRET`
//! - `GOOGLE_REFRESH_TOKEN`

use anyhow::{Context, Result};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Google OAuth credentials loaded from the environment.
#[derive(Clone)]
pub struct GoogleCredentials {
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

impl GoogleCredentials {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            client_id: std::env::var("GOOGLE_CLIENT_ID")
                .context("GOOGLE_CLIENT_ID environment variable not set")?,
            client_secret: std::env::var("GOOGLE_CLIENT_SECRET")
                .context("GOOGLE_CLIENT_SECRET environment variable not set")?,
            refresh_token: std::env::var("GOOGLE_REFRESH_TOKEN")
                .context("GOOGLE_REFRESH_TOKEN environment variable not set")?,
        })
    }

    pub fn configured() -> bool {
        ["GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_SECRET", "GOOGLE_REFRESH_TOKEN"]
            .iter()
            .all(|var| std::env::var(var).is_ok())
    }

    /// Exchange the refresh token for a short-lived access token.
    pub async fn access_token(&self, client: &reqwest::Client) -> Result<String> {
        let response = client
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Google token refresh failed ({}): {}", status, body);
        }

        let json: serde_json::Value = response.json().await?;
        json.get("access_token")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string())
            .ok_or_else(|| anyhow::anyhow!("Google token response missing access_token"))
    }
}
