//! Peer connection seam.
//!
//! The negotiation engine drives any implementation of `PeerConnection`
//! through the JSEP offer/answer state machine. Asynchronous happenings
//! (gathered candidates, remote tracks, connectivity) arrive as `PeerEvent`s
//! on the channel returned by `PeerFactory::create`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::PeerError;
use super::media::MediaTrack;
use super::messages::{CandidateInit, SessionDescription};
use super::MediaKind;

/// JSEP signaling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Aggregate ICE/transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A gathered local candidate to trickle to the remote side.
    LocalCandidate(CandidateInit),
    GatheringComplete,
    /// The remote side started sending a track.
    RemoteTrack(MediaTrack),
    ConnectionState(ConnectionState),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    fn has_remote_description(&self) -> bool;

    /// Current local description, including candidates gathered so far.
    fn local_description(&self) -> Option<SessionDescription>;

    /// Kinds that currently have a sender.
    fn sender_kinds(&self) -> Vec<MediaKind>;

    /// Add a sender for `track`. Takes effect in the next offer/answer.
    fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError>;

    /// Swap the track of the existing sender of the same kind, without
    /// renegotiation. Returns false when there is no such sender.
    fn replace_track(&self, track: &MediaTrack) -> Result<bool, PeerError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Requires a remote description. An empty candidate marks end of
    /// candidates.
    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError>;

    /// Resolves once local candidate gathering has finished.
    async fn gathering_complete(&self);

    fn close(&self);
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// Creates peer connections for the engine.
pub trait PeerFactory: Send + Sync {
    fn create(&self) -> Result<(Arc<dyn PeerConnection>, PeerEvents), PeerError>;
}
