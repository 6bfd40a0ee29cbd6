//! Error taxonomy for the call core.

use super::peer::SignalingState;
use super::MediaKind;
use crate::signaling::TransportError;

/// Capture device could not be opened. Recoverable; may trigger the
/// video-to-audio fallback.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AcquireError {
    #[error("no {0} device available")]
    NoDevice(MediaKind),
    #[error("permission denied for {0} device")]
    PermissionDenied(MediaKind),
    #[error("{kind} device failed: {reason}")]
    Device { kind: MediaKind, reason: String },
}

impl AcquireError {
    pub fn kind(&self) -> MediaKind {
        match self {
            AcquireError::NoDevice(k) | AcquireError::PermissionDenied(k) => *k,
            AcquireError::Device { kind, .. } => *kind,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer connection is closed")]
    Closed,
    #[error("cannot {op} in signaling state {state:?}")]
    InvalidState {
        op: &'static str,
        state: SignalingState,
    },
    #[error("invalid session description: {0}")]
    InvalidSdp(String),
    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),
    #[error("remote description is not set")]
    NoRemoteDescription,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("OS random source failed: {0}")]
    Random(getrandom::Error),
    #[error("DTLS certificate: {0}")]
    Certificate(String),
}

impl From<getrandom::Error> for PeerError {
    fn from(e: getrandom::Error) -> Self {
        PeerError::Random(e)
    }
}

/// Failure inside one negotiation step.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("an offer is already outstanding")]
    OfferInFlight,
    #[error("connection was torn down while negotiating")]
    Stale,
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("signal not sent: {0}")]
    Transport(#[from] TransportError),
}

/// What the controller reports back to its caller.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("a call is already in progress")]
    Busy,
    #[error("conversation id is required")]
    NoConversation,
    #[error("no peer user to call")]
    NoTarget,
    #[error("no incoming call is ringing")]
    NotRinging,
    #[error("no active call")]
    NoActiveCall,
    #[error("call was cancelled")]
    Cancelled,
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("signal not sent: {0}")]
    Transport(#[from] TransportError),
}
