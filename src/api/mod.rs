//! REST collaborators of the call core

pub mod client;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::UserProfile;

/// Resolves user ids to display profiles.
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn user_profile(&self, user_id: &str) -> Result<UserProfile>;
}

/// Show our own profile (verifies the stored token works).
pub async fn whoami() -> Result<()> {
    let client = client::ApiClient::from_config(&crate::config::Config::load()?)?;
    let me = client.me().await?;

    println!();
    println!("Name:   {}", me.name);
    println!("Avatar: {}", me.avatar.as_deref().unwrap_or("(none)"));
    println!("ID:     {}", me.id);

    Ok(())
}
