//! Authenticated HTTP client for the WeConnect REST API
//!
//! Wraps reqwest::Client with bearer token injection. Responses may be bare
//! objects or wrapped in a `{"data": ...}` envelope.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::ProfileLookup;
use crate::config::Config;
use crate::models::{Conversation, UserProfile};

pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl ApiClient {
    pub fn new(base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Build from stored config. Fails when the token is missing or expired.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.api_base()?, config.valid_token()?))
    }

    /// GET `path` relative to the API base.
    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base, path);
        tracing::debug!("GET {}", url);

        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        check_response(resp, &url).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body: serde_json::Value = self
            .get(path)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to read {} response", path))?;
        serde_json::from_value(unwrap_envelope(body))
            .with_context(|| format!("Failed to parse {} response", path))
    }

    pub async fn me(&self) -> Result<UserProfile> {
        self.get_json("/api/users/me").await
    }

    pub async fn user_profile(&self, user_id: &str) -> Result<UserProfile> {
        self.get_json(&format!("/api/users/{}", user_id)).await
    }

    pub async fn conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.get_json(&format!("/api/conversations/{}", conversation_id))
            .await
    }
}

#[async_trait]
impl ProfileLookup for ApiClient {
    async fn user_profile(&self, user_id: &str) -> Result<UserProfile> {
        ApiClient::user_profile(self, user_id).await
    }
}

fn unwrap_envelope(body: serde_json::Value) -> serde_json::Value {
    match body {
        serde_json::Value::Object(mut map) if map.get("data").map_or(false, |d| d.is_object()) => {
            map.remove("data").unwrap_or_default()
        }
        other => other,
    }
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        bail!(
            "401 Unauthorized for {}. Token may be invalid -- run 'weconnect-call login'.",
            url
        );
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(resp)
}
