//! Token storage and management

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Stored access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: String,
    pub expires_at: Option<u64>,
}

impl StoredToken {
    /// Take the expiry from the token's `exp` claim when it is a JWT.
    pub fn from_jwt(token: String) -> Self {
        let expires_at = jwt_claims(&token).and_then(|c| c.get("exp")?.as_u64());
        Self { token, expires_at }
    }

    /// `sub`/`id`/`userId` claim, if present.
    pub fn subject(&self) -> Option<String> {
        let claims = jwt_claims(&self.token)?;
        ["sub", "id", "userId", "_id"]
            .iter()
            .find_map(|k| claims.get(*k)?.as_str().map(String::from))
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            // Consider expired if less than 5 minutes remaining
            Some(exp) => now_secs() + 300 >= exp,
            None => false,
        }
    }
}

fn jwt_claims(token: &str) -> Option<serde_json::Value> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Token store trait for different storage backends
pub trait TokenStore {
    fn get_auth_token(&self) -> Option<StoredToken>;
    fn set_auth_token(&mut self, token: StoredToken);
    fn clear_tokens(&mut self);
}
