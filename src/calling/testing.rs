//! Fakes shared by the calling tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use super::error::{AcquireError, PeerError};
use super::media::{MediaDevices, MediaTrack};
use super::messages::{CandidateInit, SdpType, SessionDescription};
use super::peer::{ConnectionState, PeerConnection, PeerEvent, PeerEvents, PeerFactory, SignalingState};
use super::MediaKind;
use crate::api::ProfileLookup;
use crate::models::UserProfile;

/// A host candidate line that parses.
pub fn candidate(n: u16) -> CandidateInit {
    CandidateInit {
        candidate: format!(
            "candidate:{} 1 udp 2122260223 192.0.2.{} {} typ host",
            n,
            n % 250 + 1,
            50000 + n
        ),
        sdp_mid: Some("0".into()),
        sdp_m_line_index: Some(0),
    }
}

// ---- devices ----

#[derive(Default)]
pub struct FakeDevices {
    missing: Vec<MediaKind>,
    opened: Mutex<Vec<MediaTrack>>,
    gate: Option<Arc<Notify>>,
    started: Arc<Notify>,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opening `kind` fails with `NoDevice`.
    pub fn without(mut self, kind: MediaKind) -> Self {
        self.missing.push(kind);
        self
    }

    /// Every open waits until the returned gate is notified.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(gate.clone());
        (self, gate)
    }

    /// Notified when an open starts.
    pub fn started(&self) -> Arc<Notify> {
        self.started.clone()
    }

    pub fn opened(&self) -> Vec<MediaTrack> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open(&self, kind: MediaKind) -> Result<MediaTrack, AcquireError> {
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.missing.contains(&kind) {
            return Err(AcquireError::NoDevice(kind));
        }
        let label = match kind {
            MediaKind::Audio => "Fake microphone",
            MediaKind::Video => "Fake camera",
        };
        let track = MediaTrack::new(kind, label);
        self.opened.lock().unwrap().push(track.clone());
        Ok(track)
    }
}

// ---- peer connection ----

/// Holds an async step until released.
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Resolves once a step is waiting at the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

/// How peers made by a [`RecordingFactory`] misbehave.
#[derive(Clone, Default)]
struct Behavior {
    refuse_tracks: bool,
    describe_gate: Option<Arc<Gate>>,
    gathering_gate: Option<Arc<Gate>>,
}

struct RecordingState {
    signaling: SignalingState,
    connection: ConnectionState,
    remote: Option<SessionDescription>,
    local: Option<SessionDescription>,
    senders: Vec<MediaKind>,
    candidates: Vec<String>,
}

/// Peer connection that follows the JSEP state machine and records calls.
pub struct RecordingPeer {
    calls: Mutex<Vec<String>>,
    state: Mutex<RecordingState>,
    events: mpsc::UnboundedSender<PeerEvent>,
    behavior: Behavior,
}

impl RecordingPeer {
    fn new(behavior: Behavior) -> (Self, PeerEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Self {
            calls: Mutex::new(Vec::new()),
            state: Mutex::new(RecordingState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                remote: None,
                local: None,
                senders: Vec::new(),
                candidates: Vec::new(),
            }),
            events: tx,
            behavior,
        };
        (peer, rx)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().unwrap().candidates.clone()
    }

    /// Deliver a peer event. Local candidates also land in the local
    /// description, as gathering would put them there.
    pub fn push_event(&self, event: PeerEvent) {
        match &event {
            PeerEvent::ConnectionState(s) => self.state.lock().unwrap().connection = *s,
            PeerEvent::LocalCandidate(c) => {
                if let Some(local) = self.state.lock().unwrap().local.as_mut() {
                    local.sdp.push_str(&format!("a={}\r\n", c.candidate));
                }
            }
            _ => {}
        }
        let _ = self.events.send(event);
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn describe(&self, kind: SdpType) -> SessionDescription {
        let senders = self.state.lock().unwrap().senders.clone();
        let mut sdp = String::from("v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
        for k in senders {
            sdp.push_str(&format!("m={} 9 RTP/SAVPF 0\r\n", k.as_str()));
        }
        SessionDescription { kind, sdp }
    }
}

fn label(kind: SdpType) -> &'static str {
    match kind {
        SdpType::Offer => "offer",
        SdpType::Answer => "answer",
    }
}

#[async_trait]
impl PeerConnection for RecordingPeer {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().unwrap().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().unwrap().connection
    }

    fn has_remote_description(&self) -> bool {
        self.state.lock().unwrap().remote.is_some()
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    fn sender_kinds(&self) -> Vec<MediaKind> {
        self.state.lock().unwrap().senders.clone()
    }

    fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        self.record(format!("add_track:{}", track.kind()));
        if self.behavior.refuse_tracks {
            return Err(PeerError::Closed);
        }
        self.state.lock().unwrap().senders.push(track.kind());
        Ok(())
    }

    fn replace_track(&self, track: &MediaTrack) -> Result<bool, PeerError> {
        self.record(format!("replace_track:{}", track.kind()));
        Ok(self.state.lock().unwrap().senders.contains(&track.kind()))
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.record("create_offer");
        if let Some(gate) = &self.behavior.describe_gate {
            gate.pass().await;
        }
        Ok(self.describe(SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.record("create_answer");
        if let Some(gate) = &self.behavior.describe_gate {
            gate.pass().await;
        }
        let state = self.signaling_state();
        if state != SignalingState::HaveRemoteOffer {
            return Err(PeerError::InvalidState {
                op: "create answer",
                state,
            });
        }
        Ok(self.describe(SdpType::Answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.record(format!("set_local:{}", label(desc.kind)));
        let mut state = self.state.lock().unwrap();
        state.signaling = match (desc.kind, state.signaling) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (_, s) => {
                return Err(PeerError::InvalidState {
                    op: "set local description",
                    state: s,
                })
            }
        };
        state.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.record(format!("set_remote:{}", label(desc.kind)));
        let mut state = self.state.lock().unwrap();
        state.signaling = match (desc.kind, state.signaling) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                SignalingState::HaveRemoteOffer
            }
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (_, s) => {
                return Err(PeerError::InvalidState {
                    op: "set remote description",
                    state: s,
                })
            }
        };
        state.remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
        self.record("add_ice_candidate");
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        state.candidates.push(candidate.candidate);
        Ok(())
    }

    async fn gathering_complete(&self) {
        if let Some(gate) = &self.behavior.gathering_gate {
            gate.pass().await;
        }
    }

    fn close(&self) {
        self.record("close");
        let mut state = self.state.lock().unwrap();
        state.signaling = SignalingState::Closed;
        state.connection = ConnectionState::Closed;
    }
}

#[derive(Default)]
pub struct RecordingFactory {
    peers: Mutex<Vec<Arc<RecordingPeer>>>,
    behavior: Behavior,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// `add_track` fails on every peer.
    pub fn refusing_tracks(mut self) -> Self {
        self.behavior.refuse_tracks = true;
        self
    }

    /// `create_offer` and `create_answer` wait at the returned gate.
    pub fn gated_descriptions(mut self) -> (Self, Arc<Gate>) {
        let gate = Gate::new();
        self.behavior.describe_gate = Some(gate.clone());
        (self, gate)
    }

    /// `gathering_complete` waits at the returned gate.
    pub fn gated_gathering(mut self) -> (Self, Arc<Gate>) {
        let gate = Gate::new();
        self.behavior.gathering_gate = Some(gate.clone());
        (self, gate)
    }

    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn peer(&self, index: usize) -> Arc<RecordingPeer> {
        self.peers.lock().unwrap()[index].clone()
    }
}

impl PeerFactory for RecordingFactory {
    fn create(&self) -> Result<(Arc<dyn PeerConnection>, PeerEvents), PeerError> {
        let (peer, events) = RecordingPeer::new(self.behavior.clone());
        let peer = Arc::new(peer);
        self.peers.lock().unwrap().push(peer.clone());
        Ok((peer, events))
    }
}

// ---- profiles ----

/// Profile lookup backed by a map. Unknown ids fail.
#[derive(Default)]
pub struct StaticProfiles {
    profiles: HashMap<String, UserProfile>,
    delay: Duration,
}

impl StaticProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &str, name: &str) -> Self {
        self.profiles.insert(
            id.to_string(),
            UserProfile {
                id: id.to_string(),
                name: name.to_string(),
                avatar: None,
            },
        );
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ProfileLookup for StaticProfiles {
    async fn user_profile(&self, user_id: &str) -> anyhow::Result<UserProfile> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.profiles
            .get(user_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("user {} not found", user_id))
    }
}
