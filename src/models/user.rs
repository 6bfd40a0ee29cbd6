//! User-related models

use serde::{Deserialize, Serialize};

/// Public profile of a user, as shown for an incoming call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(alias = "username", alias = "displayName")]
    pub name: String,
    #[serde(default, alias = "avatarUrl")]
    pub avatar: Option<String>,
}

impl UserProfile {
    /// Stand-in until the real profile is resolved.
    pub fn placeholder(user_id: &str) -> Self {
        Self {
            id: user_id.to_string(),
            name: user_id.to_string(),
            avatar: None,
        }
    }
}
