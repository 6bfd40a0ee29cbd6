//! Negotiation engine: owns the single active peer connection.
//!
//! Ordering rules enforced here:
//! - local tracks are attached before any offer/answer is generated;
//! - remote candidates wait in a queue until the remote description is set,
//!   then apply in arrival order;
//! - at most one offer is outstanding per connection.
//!
//! Every connection gets an epoch. Async steps capture it before suspending
//! and drop their result if a teardown happened meanwhile.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use super::error::{NegotiationError, PeerError};
use super::media::{MediaStream, MediaTrack};
use super::messages::{CandidateInit, CandidatePayload, DescriptionPayload, Outbound, SessionDescription};
use super::peer::{ConnectionState, PeerConnection, PeerEvent, PeerEvents, PeerFactory, SignalingState};
use crate::signaling::router::{Listener, Listeners};
use crate::signaling::{ListenerId, SignalTransport};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Wait for ICE gathering and send candidates inside the description
    /// instead of trickling them.
    pub wait_for_gathering: bool,
    /// Upper bound for that wait.
    pub gather_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            wait_for_gathering: false,
            gather_timeout: Duration::from_secs(2),
        }
    }
}

/// Published to engine subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The remote stream gained a track (`Some`) or went away (`None`).
    RemoteStream(Option<MediaStream>),
    ConnectionState(ConnectionState),
}

/// Result of applying a remote answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Applied,
    /// No offer was outstanding; nothing changed.
    Ignored,
}

struct ActiveConnection {
    pc: Arc<dyn PeerConnection>,
    conversation_id: String,
    peer_user_id: String,
    epoch: u64,
    offer_in_flight: bool,
    pump: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct EngineState {
    conn: Option<ActiveConnection>,
    epoch: u64,
    /// Remote candidates tagged with their conversation.
    pending: VecDeque<(String, CandidateInit)>,
    /// Reference only; never stopped here.
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
}

struct EngineInner {
    transport: Arc<dyn SignalTransport>,
    factory: Arc<dyn PeerFactory>,
    settings: EngineSettings,
    state: Mutex<EngineState>,
    listeners: Listeners<EngineEvent>,
}

/// Handle to the engine. Clones share the same connection.
#[derive(Clone)]
pub struct NegotiationEngine {
    inner: Arc<EngineInner>,
}

impl NegotiationEngine {
    pub fn new(
        transport: Arc<dyn SignalTransport>,
        factory: Arc<dyn PeerFactory>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                transport,
                factory,
                settings,
                state: Mutex::new(EngineState::default()),
                listeners: Listeners::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, listener: Listener<EngineEvent>) -> ListenerId {
        self.inner.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }

    pub fn has_connection(&self) -> bool {
        self.lock().conn.is_some()
    }

    pub fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.lock().conn.as_ref().map(|c| c.pc.clone())
    }

    pub fn signaling_state(&self) -> Option<SignalingState> {
        self.connection().map(|pc| pc.signaling_state())
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.connection().map(|pc| pc.connection_state())
    }

    pub fn pending_candidates(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.lock().local_stream.clone()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.lock().remote_stream.clone()
    }

    /// Create the peer connection for a conversation, or return the
    /// existing one.
    ///
    /// Reuse leaves the pending queue alone. A genuine creation drops queued
    /// candidates of other conversations, starts the event pump and applies
    /// the stored local stream.
    pub fn create_connection(
        &self,
        conversation_id: &str,
        peer_user_id: &str,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        self.ensure_connection(conversation_id, peer_user_id)
            .map(|(pc, _)| pc)
    }

    fn ensure_connection(
        &self,
        conversation_id: &str,
        peer_user_id: &str,
    ) -> Result<(Arc<dyn PeerConnection>, u64), NegotiationError> {
        let mut state = self.lock();
        if let Some(conn) = &state.conn {
            if conn.conversation_id != conversation_id {
                tracing::warn!(
                    "Reusing connection of conversation {} for {}",
                    conn.conversation_id,
                    conversation_id
                );
            }
            return Ok((conn.pc.clone(), conn.epoch));
        }

        let (pc, events) = self.inner.factory.create()?;
        state.epoch += 1;
        let epoch = state.epoch;

        let before = state.pending.len();
        state.pending.retain(|(conv, _)| conv == conversation_id);
        if state.pending.len() != before {
            tracing::debug!(
                "Dropped {} stale queued candidate(s)",
                before - state.pending.len()
            );
        }

        if let Some(stream) = &state.local_stream {
            apply_tracks(pc.as_ref(), stream.tracks())?;
        }

        let pump = tokio::spawn(pump_events(Arc::downgrade(&self.inner), events, epoch));
        state.conn = Some(ActiveConnection {
            pc: pc.clone(),
            conversation_id: conversation_id.to_string(),
            peer_user_id: peer_user_id.to_string(),
            epoch,
            offer_in_flight: false,
            pump,
        });
        tracing::info!(
            "Created peer connection for conversation {} (epoch {})",
            conversation_id,
            epoch
        );
        Ok((pc, epoch))
    }

    /// Make `stream` the local stream.
    ///
    /// With a connection, each track replaces the sender of its kind or is
    /// added as a new sender. Without one, the stream is kept and applied on
    /// creation.
    pub fn attach_local_stream(&self, stream: &MediaStream) -> Result<(), NegotiationError> {
        let mut state = self.lock();
        state.local_stream = Some(stream.clone());
        if let Some(conn) = &state.conn {
            apply_tracks(conn.pc.as_ref(), stream.tracks())?;
        }
        Ok(())
    }

    /// Create an offer and send it to `peer_user_id`.
    ///
    /// Rejected with `OfferInFlight` while another offer is outstanding.
    pub async fn create_and_send_offer(
        &self,
        conversation_id: &str,
        peer_user_id: &str,
    ) -> Result<(), NegotiationError> {
        let (pc, epoch) = self.ensure_connection(conversation_id, peer_user_id)?;
        {
            let mut state = self.lock();
            let local = state.local_stream.clone();
            let conn = match state.conn.as_mut() {
                Some(c) if c.epoch == epoch => c,
                _ => return Err(NegotiationError::Stale),
            };
            if conn.offer_in_flight || pc.signaling_state() == SignalingState::HaveLocalOffer {
                tracing::warn!("Offer already outstanding for {}", conversation_id);
                return Err(NegotiationError::OfferInFlight);
            }
            if let Some(stream) = &local {
                apply_tracks(pc.as_ref(), stream.tracks())?;
            }
            conn.offer_in_flight = true;
        }

        let result = self.offer_steps(&pc, epoch, conversation_id, peer_user_id).await;

        let mut state = self.lock();
        if let Some(conn) = state.conn.as_mut().filter(|c| c.epoch == epoch) {
            conn.offer_in_flight = false;
        }
        result
    }

    async fn offer_steps(
        &self,
        pc: &Arc<dyn PeerConnection>,
        epoch: u64,
        conversation_id: &str,
        peer_user_id: &str,
    ) -> Result<(), NegotiationError> {
        let offer = self.after_step(epoch, pc.create_offer().await)?;
        self.after_step(epoch, pc.set_local_description(offer.clone()).await)?;
        let offer = self.gathered_description(pc, offer).await;
        self.check_epoch(epoch)?;

        Outbound::Offer {
            conversation_id: conversation_id.to_string(),
            to_user_id: peer_user_id.to_string(),
            sdp: offer,
        }
        .send(self.inner.transport.as_ref())?;
        tracing::info!("Sent offer to {}", peer_user_id);
        Ok(())
    }

    /// Answer a remote offer, creating the connection if needed.
    pub async fn handle_remote_offer(&self, msg: DescriptionPayload) -> Result<(), NegotiationError> {
        let (pc, epoch) = self.ensure_connection(&msg.conversation_id, &msg.from_user_id)?;
        if let Some(stream) = self.local_stream() {
            apply_tracks(pc.as_ref(), stream.tracks())?;
        }

        self.after_step(epoch, pc.set_remote_description(msg.sdp).await)?;
        self.drain_pending(&pc, epoch).await;

        let answer = self.after_step(epoch, pc.create_answer().await)?;
        self.after_step(epoch, pc.set_local_description(answer.clone()).await)?;
        let answer = self.gathered_description(&pc, answer).await;
        self.check_epoch(epoch)?;

        Outbound::Answer {
            conversation_id: msg.conversation_id.clone(),
            to_user_id: msg.from_user_id.clone(),
            sdp: answer,
        }
        .send(self.inner.transport.as_ref())?;
        tracing::info!("Sent answer to {}", msg.from_user_id);
        Ok(())
    }

    /// Apply a remote answer. Only meaningful while our offer is outstanding;
    /// anything else is ignored with a log.
    pub async fn handle_remote_answer(
        &self,
        msg: DescriptionPayload,
    ) -> Result<AnswerOutcome, NegotiationError> {
        let (pc, epoch) = {
            let state = self.lock();
            match &state.conn {
                Some(c) if c.conversation_id == msg.conversation_id => (c.pc.clone(), c.epoch),
                _ => {
                    tracing::info!(
                        "Ignoring answer for {}: no matching connection",
                        msg.conversation_id
                    );
                    return Ok(AnswerOutcome::Ignored);
                }
            }
        };

        let signaling = pc.signaling_state();
        if signaling != SignalingState::HaveLocalOffer {
            tracing::info!("Ignoring answer in signaling state {:?}", signaling);
            return Ok(AnswerOutcome::Ignored);
        }

        self.after_step(epoch, pc.set_remote_description(msg.sdp).await)?;
        self.drain_pending(&pc, epoch).await;
        tracing::info!("Applied answer from {}", msg.from_user_id);
        Ok(AnswerOutcome::Applied)
    }

    /// Queue a remote candidate, applying the queue right away when the
    /// remote description is already set.
    pub async fn handle_remote_candidate(&self, msg: CandidatePayload) {
        let ready = {
            let mut state = self.lock();
            let ready = match &state.conn {
                Some(c) if c.conversation_id != msg.conversation_id => {
                    tracing::debug!(
                        "Dropping candidate for {}: active connection is {}",
                        msg.conversation_id,
                        c.conversation_id
                    );
                    return;
                }
                Some(c) if c.pc.has_remote_description() => Some((c.pc.clone(), c.epoch)),
                _ => None,
            };
            state
                .pending
                .push_back((msg.conversation_id.clone(), msg.candidate));
            ready
        };

        match ready {
            Some((pc, epoch)) => self.drain_pending(&pc, epoch).await,
            None => tracing::debug!(
                "Queued remote candidate ({} pending)",
                self.pending_candidates()
            ),
        }
    }

    /// Apply queued candidates in arrival order.
    async fn drain_pending(&self, pc: &Arc<dyn PeerConnection>, epoch: u64) {
        loop {
            let next = {
                let mut state = self.lock();
                match &state.conn {
                    Some(c) if c.epoch == epoch => {}
                    _ => return,
                }
                state.pending.pop_front()
            };
            let Some((_, candidate)) = next else { return };
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply remote candidate: {}", e);
            }
        }
    }

    /// Close the connection and forget the streams. Safe to call any time.
    ///
    /// Local tracks are not stopped; media acquisition owns them.
    pub fn teardown(&self) {
        let (conn, remote) = {
            let mut state = self.lock();
            state.epoch += 1;
            state.pending.clear();
            state.local_stream = None;
            (state.conn.take(), state.remote_stream.take())
        };

        if let Some(conn) = conn {
            conn.pump.abort();
            conn.pc.close();
            tracing::info!(
                "Closed peer connection for conversation {}",
                conn.conversation_id
            );
        }
        if let Some(remote) = remote {
            for t in remote.tracks() {
                t.stop();
            }
            self.inner.listeners.publish(&EngineEvent::RemoteStream(None));
        }
    }

    fn check_epoch(&self, epoch: u64) -> Result<(), NegotiationError> {
        let state = self.lock();
        match &state.conn {
            Some(c) if c.epoch == epoch => Ok(()),
            _ => Err(NegotiationError::Stale),
        }
    }

    /// Result of a peer step. A teardown while the step ran turns any outcome
    /// into `Stale`.
    fn after_step<T>(&self, epoch: u64, result: Result<T, PeerError>) -> Result<T, NegotiationError> {
        self.check_epoch(epoch)?;
        Ok(result?)
    }

    /// In non-trickle mode, wait (bounded) for gathering and return the
    /// description with candidates included.
    async fn gathered_description(
        &self,
        pc: &Arc<dyn PeerConnection>,
        desc: SessionDescription,
    ) -> SessionDescription {
        if !self.inner.settings.wait_for_gathering {
            return desc;
        }
        if tokio::time::timeout(self.inner.settings.gather_timeout, pc.gathering_complete())
            .await
            .is_err()
        {
            tracing::warn!(
                "ICE gathering did not finish within {:?}; sending what we have",
                self.inner.settings.gather_timeout
            );
        }
        pc.local_description().unwrap_or(desc)
    }
}

/// Replace the sender of each track's kind, or add a sender.
fn apply_tracks(pc: &dyn PeerConnection, tracks: &[MediaTrack]) -> Result<(), NegotiationError> {
    for track in tracks {
        if pc.sender_kinds().contains(&track.kind()) {
            pc.replace_track(track)?;
        } else {
            pc.add_track(track)?;
        }
    }
    Ok(())
}

/// Forward peer events for one connection epoch.
async fn pump_events(engine: Weak<EngineInner>, mut events: PeerEvents, epoch: u64) {
    while let Some(event) = events.recv().await {
        let Some(inner) = engine.upgrade() else { return };
        let publish = {
            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            let Some(conn) = state.conn.as_ref().filter(|c| c.epoch == epoch) else {
                return;
            };
            match event {
                PeerEvent::LocalCandidate(candidate) => {
                    if inner.settings.wait_for_gathering || candidate.is_end_of_candidates() {
                        None
                    } else {
                        let msg = Outbound::Candidate {
                            conversation_id: conn.conversation_id.clone(),
                            to_user_id: conn.peer_user_id.clone(),
                            candidate,
                        };
                        if let Err(e) = msg.send(inner.transport.as_ref()) {
                            tracing::warn!("Local candidate not sent: {}", e);
                        }
                        None
                    }
                }
                PeerEvent::GatheringComplete => {
                    tracing::debug!("ICE gathering complete");
                    None
                }
                PeerEvent::RemoteTrack(track) => {
                    tracing::info!("Remote {} track {}", track.kind(), track.id());
                    let stream = match state.remote_stream.take() {
                        Some(mut s) => {
                            s.add_track(track);
                            s
                        }
                        None => MediaStream::new(vec![track]),
                    };
                    state.remote_stream = Some(stream.clone());
                    Some(EngineEvent::RemoteStream(Some(stream)))
                }
                PeerEvent::ConnectionState(s) => {
                    tracing::info!("Peer connection state: {:?}", s);
                    Some(EngineEvent::ConnectionState(s))
                }
            }
        };
        if let Some(ev) = publish {
            inner.listeners.publish(&ev);
        }
    }
}
