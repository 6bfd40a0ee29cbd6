//! Call core: session state, WebRTC negotiation and media acquisition.
//!
//! Layering, leaf to root: `media` owns capture devices, `peer`/`sdp_peer`
//! model one peer connection (with `stun` checks and a `dtls` identity),
//! `engine` drives offer/answer/candidate exchange for the single active
//! connection, and `controller` turns user intents and inbound signals into
//! phase transitions.

pub mod controller;
pub mod dtls;
pub mod engine;
pub mod error;
pub mod ice;
pub mod media;
pub mod messages;
pub mod peer;
pub mod runner;
pub mod sdp;
pub mod sdp_peer;
pub mod stun;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use controller::{CallSettings, VideoFallback};
pub use engine::EngineSettings;
pub use sdp_peer::PeerSettings;

/// Kind of a track, and of a call as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// Track kinds a call of this kind captures locally.
    pub fn track_kinds(&self) -> &'static [MediaKind] {
        match self {
            MediaKind::Audio => &[MediaKind::Audio],
            MediaKind::Video => &[MediaKind::Audio, MediaKind::Video],
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Call lifecycle phase.
///
/// Caller: `Idle → Inviting → Connecting → Active`.
/// Callee: `Idle → Ringing → Accepted → Active`.
/// Any phase returns to `Idle` through a published `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Inviting,
    Ringing,
    Accepted,
    Connecting,
    Active,
    Ended,
}

impl CallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPhase::Idle => "idle",
            CallPhase::Inviting => "inviting",
            CallPhase::Ringing => "ringing",
            CallPhase::Accepted => "accepted",
            CallPhase::Connecting => "connecting",
            CallPhase::Active => "active",
            CallPhase::Ended => "ended",
        }
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single active call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    pub conversation_id: String,
    pub peer_user_id: String,
    pub role: CallRole,
    /// Switches to `Video` when the camera is turned on mid-call.
    pub media: MediaKind,
    pub phase: CallPhase,
    /// Bumped on every session change; async continuations compare it
    /// before applying their result.
    pub generation: u64,
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(
        conversation_id: &str,
        peer_user_id: &str,
        role: CallRole,
        media: MediaKind,
        phase: CallPhase,
        generation: u64,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            peer_user_id: peer_user_id.to_string(),
            role,
            media,
            phase,
            generation,
            started_at: Utc::now(),
        }
    }
}
