//! Data models for WeConnect entities

mod conversation;
mod user;

pub use conversation::*;
pub use user::*;
