//! Authentication for the WeConnect server
//!
//! WeConnect issues bearer tokens on its own login page; this module only
//! stores one, checks its expiry and reports status.

pub mod tokens;

use anyhow::{bail, Result};

use crate::api::client::ApiClient;
use crate::config::Config;
pub use tokens::{StoredToken, TokenStore};

/// Store a token for `server`, verifying it against `GET /api/users/me`.
pub async fn login(server: &str, token: &str, user_id: Option<String>) -> Result<()> {
    let server = server.trim_end_matches('/');
    if token.trim().is_empty() {
        bail!("Token must not be empty");
    }
    let stored = StoredToken::from_jwt(token.trim().to_string());
    if stored.is_expired() {
        bail!("Token is already expired");
    }

    let mut config = Config::load()?;
    config.server_url = Some(server.to_string());
    config.set_auth_token(stored.clone());

    let client = ApiClient::new(config.api_base()?, stored.token.clone());
    let user_id = match user_id.or_else(|| stored.subject()) {
        Some(id) => id,
        None => {
            tracing::info!("Resolving user id from server...");
            client.me().await?.id
        }
    };
    config.user_id = Some(user_id.clone());
    config.save()?;

    println!("Login successful.");
    println!("User id: {}", user_id);
    Ok(())
}

pub async fn logout() -> Result<()> {
    let mut config = Config::load()?;
    config.clear_tokens();
    config.save()?;
    println!("Logged out.");
    Ok(())
}

/// Display current auth status
pub async fn status() -> Result<()> {
    let config = Config::load()?;

    println!(
        "Server:      {}",
        config.server_url.as_deref().unwrap_or("(none)")
    );
    println!(
        "User id:     {}",
        config.user_id.as_deref().unwrap_or("(none)")
    );

    match config.get_auth_token() {
        Some(token) if !token.is_expired() => {
            println!("Auth token:  valid");
            if let Some(exp) = token.expires_at {
                println!("  expires_at: {}", exp);
            }
        }
        Some(_) => {
            println!("Auth token:  expired");
        }
        None => {
            println!("Auth token:  none");
            println!("\nRun 'weconnect-call login' to authenticate.");
        }
    }

    Ok(())
}
