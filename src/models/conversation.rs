//! Conversation models

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(alias = "_id", alias = "userId")]
    pub id: String,
    #[serde(default, alias = "username")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, alias = "members")]
    pub participants: Vec<Participant>,
    #[serde(default, alias = "isGroupChat")]
    pub is_group: bool,
}

impl Conversation {
    /// The participant who is not `me`. `None` for group conversations.
    pub fn other_participant(&self, me: &str) -> Option<&Participant> {
        if self.is_group {
            return None;
        }
        self.participants.iter().find(|p| p.id != me)
    }
}
