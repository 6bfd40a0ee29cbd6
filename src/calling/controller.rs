//! Call session controller.
//!
//! Turns user intents (invite, accept, reject, end, mute, camera) into engine
//! calls and signaling emissions, and inbound signals into phase changes.
//! At most one call exists per controller.
//!
//! Inbound signals and engine events are funneled through one channel and
//! handled in order by a dispatch task started with [`CallController::attach`].

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::engine::{EngineEvent, NegotiationEngine};
use super::error::{AcquireError, CallError, NegotiationError};
use super::media::{MediaAcquisition, MediaStream};
use super::messages::{Inbound, Outbound, PeerAction, RingPayload};
use super::peer::ConnectionState;
use super::{CallPhase, CallRole, CallSession, MediaKind};
use crate::api::ProfileLookup;
use crate::models::UserProfile;
use crate::signaling::router::{Listener, Listeners};
use crate::signaling::{ListenerId, SignalTransport};

/// What to do when the camera cannot be opened for a video call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoFallback {
    /// Tell the user, then continue audio-only.
    #[default]
    #[serde(rename = "audio")]
    AudioOnly,
    /// Fail the call.
    #[serde(rename = "fail")]
    Fail,
}

#[derive(Debug, Clone)]
pub struct CallSettings {
    /// Bound on `Inviting` and `Ringing`, media acquisition included.
    pub ring_timeout: Duration,
    /// Bound on reaching a connected peer, counted from the accept.
    pub connect_timeout: Duration,
    pub video_fallback: VideoFallback,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(30),
            video_fallback: VideoFallback::AudioOnly,
        }
    }
}

/// Who to call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTarget {
    pub conversation_id: String,
    pub peer_user_id: String,
}

impl CallTarget {
    pub fn new(conversation_id: impl Into<String>, peer_user_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            peer_user_id: peer_user_id.into(),
        }
    }
}

/// User-visible notices.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Camera unavailable; the call continues audio-only.
    VideoFallback,
    MediaUnavailable(String),
    SignalNotSent(String),
    Rejected,
    RemoteEnded,
    /// A ring arrived while busy and was declined automatically.
    BusyRejected {
        conversation_id: String,
        from_user_id: String,
    },
    Timeout,
    ConnectionFailed,
    NegotiationFailed(String),
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    /// `session` is `None` once idle.
    PhaseChanged {
        phase: CallPhase,
        session: Option<CallSession>,
    },
    /// Published immediately with a placeholder caller profile.
    IncomingCall {
        session: CallSession,
        caller: UserProfile,
    },
    /// The real caller profile, once resolved.
    CallerProfile(UserProfile),
    RemoteMedia(Option<MediaStream>),
    Notice(Notice),
}

enum Input {
    Signal(Inbound),
    Engine(EngineEvent),
}

#[derive(Clone, Copy, Debug)]
enum Deadline {
    Ring,
    Connect,
}

struct Attachment {
    handlers: Vec<(&'static str, ListenerId)>,
    engine_listener: ListenerId,
    dispatch: JoinHandle<()>,
}

#[derive(Default)]
struct ControllerState {
    session: Option<CallSession>,
    generation: u64,
    local_stream: Option<MediaStream>,
    /// The peer has heard of this call (ring received or invite sent).
    signaled: bool,
    connected: bool,
    timer: Option<JoinHandle<()>>,
    attachment: Option<Attachment>,
}

struct ControllerInner {
    transport: Arc<dyn SignalTransport>,
    engine: NegotiationEngine,
    media: Arc<MediaAcquisition>,
    profiles: Arc<dyn ProfileLookup>,
    settings: CallSettings,
    state: Mutex<ControllerState>,
    listeners: Listeners<CallEvent>,
}

#[derive(Clone)]
pub struct CallController {
    inner: Arc<ControllerInner>,
}

impl CallController {
    pub fn new(
        transport: Arc<dyn SignalTransport>,
        engine: NegotiationEngine,
        media: Arc<MediaAcquisition>,
        profiles: Arc<dyn ProfileLookup>,
        settings: CallSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                transport,
                engine,
                media,
                profiles,
                settings,
                state: Mutex::new(ControllerState::default()),
                listeners: Listeners::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: CallEvent) {
        self.inner.listeners.publish(&event);
    }

    fn notice(&self, notice: Notice) {
        tracing::info!("Call notice: {:?}", notice);
        self.publish(CallEvent::Notice(notice));
    }

    pub fn subscribe(&self, listener: Listener<CallEvent>) -> ListenerId {
        self.inner.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }

    #[cfg(test)]
    pub fn engine(&self) -> &NegotiationEngine {
        &self.inner.engine
    }

    pub fn session(&self) -> Option<CallSession> {
        self.lock().session.clone()
    }

    pub fn phase(&self) -> CallPhase {
        self.lock()
            .session
            .as_ref()
            .map_or(CallPhase::Idle, |s| s.phase)
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.lock().local_stream.clone()
    }

    // ---- wiring ----

    /// Subscribe to inbound call signals and engine events. Idempotent.
    pub fn attach(&self) {
        let mut state = self.lock();
        if state.attachment.is_some() {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel::<Input>();
        let mut handlers = Vec::with_capacity(Inbound::EVENTS.len());
        for event in Inbound::EVENTS {
            let tx = tx.clone();
            let id = self.inner.transport.on(
                event,
                Arc::new(move |payload: &serde_json::Value| match Inbound::parse(event, payload) {
                    Ok(msg) => {
                        let _ = tx.send(Input::Signal(msg));
                    }
                    Err(e) => tracing::warn!("Dropping inbound {}: {}", event, e),
                }),
            );
            handlers.push((event, id));
        }

        let engine_listener = self.inner.engine.subscribe(Arc::new(move |ev: &EngineEvent| {
            let _ = tx.send(Input::Engine(ev.clone()));
        }));

        let dispatch = tokio::spawn(dispatch_inputs(Arc::downgrade(&self.inner), rx));
        state.attachment = Some(Attachment {
            handlers,
            engine_listener,
            dispatch,
        });
        tracing::debug!("Call controller attached");
    }

    /// Undo [`attach`](Self::attach).
    pub fn detach(&self) {
        let Some(attachment) = self.lock().attachment.take() else {
            return;
        };
        for (event, id) in attachment.handlers {
            self.inner.transport.off(event, id);
        }
        self.inner.engine.unsubscribe(attachment.engine_listener);
        attachment.dispatch.abort();
        tracing::debug!("Call controller detached");
    }

    async fn handle_input(&self, input: Input) {
        match input {
            Input::Signal(msg) => self.handle_signal(msg).await,
            Input::Engine(ev) => self.handle_engine_event(ev),
        }
    }

    // ---- outgoing ----

    /// Invite the other side of a conversation.
    pub async fn start_outgoing_call(
        &self,
        target: CallTarget,
        media: MediaKind,
    ) -> Result<(), CallError> {
        if target.conversation_id.trim().is_empty() {
            return Err(CallError::NoConversation);
        }
        if target.peer_user_id.trim().is_empty() {
            return Err(CallError::NoTarget);
        }

        let (generation, session) = {
            let mut state = self.lock();
            if state.session.is_some() {
                return Err(CallError::Busy);
            }
            state.generation += 1;
            let session = CallSession::new(
                &target.conversation_id,
                &target.peer_user_id,
                CallRole::Caller,
                media,
                CallPhase::Inviting,
                state.generation,
            );
            state.session = Some(session.clone());
            (state.generation, session)
        };
        tracing::info!(
            "Calling {} in {} ({})",
            target.peer_user_id,
            target.conversation_id,
            media
        );
        self.publish_phase(Some(session));
        self.arm_timer(generation, Deadline::Ring, self.inner.settings.ring_timeout);

        let (stream, media) = self.acquire_media(generation, media).await?;
        self.install_stream(generation, stream, media)?;

        {
            let mut state = self.lock();
            if state.generation != generation {
                return Err(CallError::Cancelled);
            }
            state.signaled = true;
        }
        let invite = Outbound::Invite {
            conversation_id: target.conversation_id.clone(),
            media,
        };
        if let Err(e) = invite.send(self.inner.transport.as_ref()) {
            self.reset(generation, Some(Notice::SignalNotSent(e.to_string())));
            return Err(e.into());
        }
        Ok(())
    }

    /// Withdraw an outgoing call. Idempotent.
    pub fn cancel_outgoing_call(&self) {
        self.hang_up(false, None);
    }

    // ---- incoming ----

    /// A `call:ring` arrived.
    ///
    /// While another call exists the ring is declined automatically.
    pub fn handle_incoming_ring(&self, ring: RingPayload) {
        let (generation, session) = {
            let mut state = self.lock();
            if let Some(current) = &state.session {
                let same_conversation = current.conversation_id == ring.conversation_id;
                if same_conversation && current.peer_user_id == ring.from_user_id {
                    tracing::debug!("Duplicate ring for {}", ring.conversation_id);
                    return;
                }
                drop(state);
                tracing::info!(
                    "Busy; declining call from {} in {}",
                    ring.from_user_id,
                    ring.conversation_id
                );
                // A reject keyed by our own conversation would end our call
                // on the other side.
                if same_conversation {
                    tracing::debug!("Not rejecting ring in the active conversation");
                } else {
                    self.send_reject(&ring.conversation_id);
                }
                self.notice(Notice::BusyRejected {
                    conversation_id: ring.conversation_id,
                    from_user_id: ring.from_user_id,
                });
                return;
            }
            state.generation += 1;
            state.signaled = true;
            let session = CallSession::new(
                &ring.conversation_id,
                &ring.from_user_id,
                CallRole::Callee,
                ring.media,
                CallPhase::Ringing,
                state.generation,
            );
            state.session = Some(session.clone());
            (state.generation, session)
        };
        tracing::info!(
            "Incoming {} call from {} in {}",
            ring.media,
            ring.from_user_id,
            ring.conversation_id
        );

        self.publish_phase(Some(session.clone()));
        self.publish(CallEvent::IncomingCall {
            session,
            caller: UserProfile::placeholder(&ring.from_user_id),
        });
        self.arm_timer(generation, Deadline::Ring, self.inner.settings.ring_timeout);

        let weak = Arc::downgrade(&self.inner);
        let profiles = self.inner.profiles.clone();
        let user_id = ring.from_user_id;
        tokio::spawn(async move {
            let result = profiles.user_profile(&user_id).await;
            let Some(inner) = weak.upgrade() else { return };
            let ctl = CallController { inner };
            match result {
                Ok(profile) if ctl.is_current(generation) => {
                    ctl.publish(CallEvent::CallerProfile(profile));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Caller profile lookup for {} failed: {:#}", user_id, e),
            }
        });
    }

    /// Answer the ringing call.
    pub async fn accept_incoming_call(&self) -> Result<(), CallError> {
        let (generation, media, conversation_id, peer_user_id) = {
            let mut state = self.lock();
            let generation = state.generation;
            let session = match state.session.as_mut() {
                Some(s) if s.phase == CallPhase::Ringing => s,
                _ => return Err(CallError::NotRinging),
            };
            session.phase = CallPhase::Accepted;
            (
                generation,
                session.media,
                session.conversation_id.clone(),
                session.peer_user_id.clone(),
            )
        };
        self.publish_phase(self.session());
        // Replaces the ring deadline; acquisition counts against it.
        self.arm_timer(generation, Deadline::Connect, self.inner.settings.connect_timeout);

        let prepared = match self.acquire_media(generation, media).await {
            Ok((stream, media)) => {
                self.prepare_answer(generation, &conversation_id, &peer_user_id, stream, media)
            }
            Err(e) => Err(e),
        };
        if let Err(e) = prepared {
            if !matches!(e, CallError::Cancelled) {
                // The caller would otherwise wait for its ring timeout.
                self.send_reject(&conversation_id);
            }
            return Err(e);
        }

        if let Err(e) = (Outbound::Accept {
            conversation_id: conversation_id.clone(),
        })
        .send(self.inner.transport.as_ref())
        {
            self.reset(generation, Some(Notice::SignalNotSent(e.to_string())));
            return Err(e.into());
        }

        self.set_phase(generation, CallPhase::Active);
        tracing::info!("Accepted call in {}", conversation_id);
        Ok(())
    }

    /// Decline the ringing call. Idempotent.
    pub fn reject_incoming_call(&self) {
        self.hang_up(true, None);
    }

    /// Hang up. Idempotent; a no-op when idle.
    pub fn end_active_call(&self) {
        self.hang_up(false, None);
    }

    // ---- in-call controls ----

    /// Flip every local audio track. Returns true when now muted.
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        let stream = self.local_stream().ok_or(CallError::NoActiveCall)?;
        let mut tracks = stream.tracks_of(MediaKind::Audio).peekable();
        let Some(first) = tracks.peek() else {
            return Err(CallError::NoActiveCall);
        };
        let enable = !first.is_enabled();
        for t in tracks {
            t.set_enabled(enable);
        }
        tracing::info!("Microphone {}", if enable { "unmuted" } else { "muted" });
        Ok(!enable)
    }

    /// Flip the camera. Without a video track, a camera is opened and its
    /// track added to the existing connection without renegotiating.
    /// Returns true when the camera is now on.
    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        let (generation, stream) = {
            let state = self.lock();
            if state.session.is_none() {
                return Err(CallError::NoActiveCall);
            }
            (state.generation, state.local_stream.clone())
        };

        if let Some(stream) = &stream {
            let video: Vec<_> = stream.tracks_of(MediaKind::Video).collect();
            if let Some(first) = video.first() {
                let enable = !first.is_enabled();
                for t in &video {
                    t.set_enabled(enable);
                }
                tracing::info!("Camera {}", if enable { "on" } else { "off" });
                return Ok(enable);
            }
        }

        let camera = match self.inner.media.acquire_tracks(&[MediaKind::Video]).await {
            Ok(s) => s,
            Err(e) => {
                self.notice(Notice::MediaUnavailable(e.to_string()));
                return Err(e.into());
            }
        };

        let merged = {
            let mut state = self.lock();
            if state.generation != generation || state.session.is_none() {
                drop(state);
                self.inner.media.release(&camera);
                return Err(CallError::Cancelled);
            }
            let merged = match &state.local_stream {
                Some(s) => s.with_tracks(camera.tracks()),
                None => camera.clone(),
            };
            state.local_stream = Some(merged.clone());
            if let Some(session) = state.session.as_mut() {
                session.media = MediaKind::Video;
            }
            merged
        };
        self.inner.engine.attach_local_stream(&merged)?;
        tracing::info!("Camera on");
        Ok(true)
    }

    // ---- inbound ----

    async fn handle_signal(&self, msg: Inbound) {
        match msg {
            Inbound::Ring(ring) => self.handle_incoming_ring(ring),
            Inbound::Accepted(action) => self.on_accepted(action).await,
            Inbound::Rejected(action) => {
                if let Some(generation) = self.matching(&action.conversation_id) {
                    tracing::info!("Call rejected by {:?}", action.user_id);
                    self.reset(generation, Some(Notice::Rejected));
                }
            }
            Inbound::Ended(action) => {
                if let Some(generation) = self.matching(&action.conversation_id) {
                    tracing::info!("Call ended by {:?}", action.user_id);
                    self.reset(generation, Some(Notice::RemoteEnded));
                }
            }
            Inbound::Offer(offer) => {
                let Some(generation) = self.matching(&offer.conversation_id) else {
                    tracing::info!("Ignoring offer for {}: no such call", offer.conversation_id);
                    return;
                };
                let result = self.inner.engine.handle_remote_offer(offer).await;
                self.check_negotiation(generation, result.map(|_| ()));
            }
            Inbound::Answer(answer) => {
                let Some(generation) = self.matching(&answer.conversation_id) else {
                    tracing::info!("Ignoring answer for {}: no such call", answer.conversation_id);
                    return;
                };
                let result = self.inner.engine.handle_remote_answer(answer).await;
                self.check_negotiation(generation, result.map(|_| ()));
            }
            Inbound::Candidate(candidate) => {
                if self.matching(&candidate.conversation_id).is_some() {
                    self.inner.engine.handle_remote_candidate(candidate).await;
                } else {
                    tracing::debug!(
                        "Dropping candidate for {}: no such call",
                        candidate.conversation_id
                    );
                }
            }
        }
    }

    async fn on_accepted(&self, action: PeerAction) {
        let (generation, conversation_id, peer_user_id) = {
            let mut state = self.lock();
            let generation = state.generation;
            let session = match state.session.as_mut() {
                Some(s)
                    if s.conversation_id == action.conversation_id
                        && s.role == CallRole::Caller
                        && s.phase == CallPhase::Inviting =>
                {
                    s
                }
                _ => {
                    tracing::debug!("Ignoring call:accepted for {}", action.conversation_id);
                    return;
                }
            };
            session.phase = CallPhase::Connecting;
            let info = (
                generation,
                session.conversation_id.clone(),
                session.peer_user_id.clone(),
            );
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            info
        };
        tracing::info!("Call accepted by {:?}", action.user_id);
        self.publish_phase(self.session());
        self.arm_timer(generation, Deadline::Connect, self.inner.settings.connect_timeout);

        let result = self
            .inner
            .engine
            .create_and_send_offer(&conversation_id, &peer_user_id)
            .await;
        self.check_negotiation(generation, result);
    }

    fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::RemoteStream(stream) => {
                if self.lock().session.is_some() || stream.is_none() {
                    self.publish(CallEvent::RemoteMedia(stream));
                }
            }
            EngineEvent::ConnectionState(ConnectionState::Connected) => {
                let generation = {
                    let mut state = self.lock();
                    if state.connected || state.session.is_none() {
                        return;
                    }
                    state.connected = true;
                    if let Some(timer) = state.timer.take() {
                        timer.abort();
                    }
                    state.generation
                };
                tracing::info!("Peer connected");
                self.set_phase(generation, CallPhase::Active);
            }
            EngineEvent::ConnectionState(ConnectionState::Failed) => {
                let generation = self.lock().generation;
                self.fail(generation, Notice::ConnectionFailed);
            }
            EngineEvent::ConnectionState(_) => {}
        }
    }

    fn check_negotiation(&self, generation: u64, result: Result<(), NegotiationError>) {
        match result {
            Ok(()) => {}
            Err(NegotiationError::Stale) => {
                tracing::debug!("Negotiation step outlived its connection");
            }
            Err(NegotiationError::OfferInFlight) => {
                tracing::debug!("Offer already in flight");
            }
            Err(e) => {
                tracing::warn!("Negotiation failed: {}", e);
                if self.is_current(generation) {
                    self.fail(generation, Notice::NegotiationFailed(e.to_string()));
                }
            }
        }
    }

    // ---- internals ----

    /// Acquire media for `kind`, applying the video fallback policy.
    ///
    /// On failure the session is reset. A result arriving after the session
    /// changed is released and reported as `Cancelled`.
    async fn acquire_media(
        &self,
        generation: u64,
        kind: MediaKind,
    ) -> Result<(MediaStream, MediaKind), CallError> {
        let result = match self.inner.media.acquire(kind).await {
            Ok(stream) => Ok((stream, kind)),
            Err(e) if self.falls_back(kind, &e) && self.is_current(generation) => {
                tracing::warn!("Camera unavailable ({}); continuing audio-only", e);
                self.notice(Notice::VideoFallback);
                self.inner
                    .media
                    .acquire(MediaKind::Audio)
                    .await
                    .map(|s| (s, MediaKind::Audio))
            }
            Err(e) => Err(e),
        };

        match result {
            Ok((stream, kind)) if self.is_current(generation) => Ok((stream, kind)),
            Ok((stream, _)) => {
                tracing::info!("Call went away during media acquisition; releasing");
                self.inner.media.release(&stream);
                Err(CallError::Cancelled)
            }
            Err(_) if !self.is_current(generation) => Err(CallError::Cancelled),
            Err(e) => {
                self.reset(generation, Some(Notice::MediaUnavailable(e.to_string())));
                Err(e.into())
            }
        }
    }

    fn falls_back(&self, kind: MediaKind, error: &AcquireError) -> bool {
        kind == MediaKind::Video
            && error.kind() == MediaKind::Video
            && self.inner.settings.video_fallback == VideoFallback::AudioOnly
    }

    /// Create the connection the caller's offer will land on and attach the
    /// local stream to it.
    fn prepare_answer(
        &self,
        generation: u64,
        conversation_id: &str,
        peer_user_id: &str,
        stream: MediaStream,
        media: MediaKind,
    ) -> Result<(), CallError> {
        if let Err(e) = self.inner.engine.create_connection(conversation_id, peer_user_id) {
            self.inner.media.release(&stream);
            self.reset(generation, Some(Notice::NegotiationFailed(e.to_string())));
            return Err(e.into());
        }
        self.install_stream(generation, stream, media)
    }

    /// Store the acquired stream on the session and hand it to the engine.
    fn install_stream(
        &self,
        generation: u64,
        stream: MediaStream,
        media: MediaKind,
    ) -> Result<(), CallError> {
        {
            let mut state = self.lock();
            if state.generation != generation {
                drop(state);
                self.inner.media.release(&stream);
                return Err(CallError::Cancelled);
            }
            state.local_stream = Some(stream.clone());
            if let Some(session) = state.session.as_mut() {
                session.media = media;
            }
        }
        if let Err(e) = self.inner.engine.attach_local_stream(&stream) {
            self.reset(generation, Some(Notice::NegotiationFailed(e.to_string())));
            return Err(e.into());
        }
        Ok(())
    }

    fn send_reject(&self, conversation_id: &str) {
        let reject = Outbound::Reject {
            conversation_id: conversation_id.to_string(),
        };
        if let Err(e) = reject.send(self.inner.transport.as_ref()) {
            tracing::warn!("Reject not sent: {}", e);
        }
    }

    /// Emit the closing signal for the current call, if any, and reset.
    ///
    /// With `reject`, a call we never accepted is declined instead of ended.
    /// Nothing is emitted for an invite that was never sent.
    fn hang_up(&self, reject: bool, notice: Option<Notice>) {
        let (generation, conversation_id, phase, signaled) = {
            let state = self.lock();
            match &state.session {
                Some(s) => (
                    state.generation,
                    s.conversation_id.clone(),
                    s.phase,
                    state.signaled,
                ),
                None => return,
            }
        };
        if signaled {
            let msg = if reject && matches!(phase, CallPhase::Ringing | CallPhase::Accepted) {
                Outbound::Reject { conversation_id }
            } else {
                Outbound::End { conversation_id }
            };
            if let Err(e) = msg.send(self.inner.transport.as_ref()) {
                tracing::warn!("{} not sent: {}", msg.event(), e);
            }
        }
        self.reset(generation, notice);
    }

    fn fail(&self, generation: u64, notice: Notice) {
        if self.is_current(generation) {
            self.hang_up(false, Some(notice));
        }
    }

    /// Tear everything down and return to idle. Only acts on `generation`.
    fn reset(&self, generation: u64, notice: Option<Notice>) {
        let (session, stream, timer) = {
            let mut state = self.lock();
            if state.generation != generation || state.session.is_none() {
                return;
            }
            state.generation += 1;
            state.signaled = false;
            state.connected = false;
            (
                state.session.take(),
                state.local_stream.take(),
                state.timer.take(),
            )
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        self.inner.engine.teardown();
        if let Some(stream) = &stream {
            self.inner.media.release(stream);
        }

        if let Some(mut session) = session {
            tracing::info!("Call in {} ended", session.conversation_id);
            session.phase = CallPhase::Ended;
            self.publish_phase(Some(session));
        }
        if let Some(notice) = notice {
            self.notice(notice);
        }
        self.publish_phase(None);
    }

    fn set_phase(&self, generation: u64, phase: CallPhase) {
        let session = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            match state.session.as_mut() {
                Some(s) if s.phase != phase => {
                    s.phase = phase;
                    s.clone()
                }
                _ => return,
            }
        };
        self.publish_phase(Some(session));
    }

    fn publish_phase(&self, session: Option<CallSession>) {
        let phase = session.as_ref().map_or(CallPhase::Idle, |s| s.phase);
        tracing::debug!("Call phase: {}", phase);
        self.publish(CallEvent::PhaseChanged { phase, session });
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.lock();
        state.generation == generation && state.session.is_some()
    }

    /// Generation of the current call if it belongs to `conversation_id`.
    fn matching(&self, conversation_id: &str) -> Option<u64> {
        let state = self.lock();
        state
            .session
            .as_ref()
            .filter(|s| s.conversation_id == conversation_id)
            .map(|_| state.generation)
    }

    fn arm_timer(&self, generation: u64, deadline: Deadline, after: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                CallController { inner }.expire(generation, deadline);
            }
        });

        let mut state = self.lock();
        if state.generation != generation {
            handle.abort();
            return;
        }
        if let Some(old) = state.timer.replace(handle) {
            old.abort();
        }
    }

    fn expire(&self, generation: u64, deadline: Deadline) {
        let expired = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            // Detach our own handle so reset does not abort this task.
            state.timer = None;
            match (deadline, state.session.as_ref().map(|s| s.phase)) {
                (Deadline::Ring, Some(CallPhase::Inviting | CallPhase::Ringing)) => true,
                (Deadline::Connect, Some(_)) => !state.connected,
                _ => false,
            }
        };
        if expired {
            tracing::warn!("Call timed out ({:?})", deadline);
            self.hang_up(true, Some(Notice::Timeout));
        }
    }
}

async fn dispatch_inputs(controller: Weak<ControllerInner>, mut rx: mpsc::UnboundedReceiver<Input>) {
    while let Some(input) = rx.recv().await {
        let Some(inner) = controller.upgrade() else { return };
        CallController { inner }.handle_input(input).await;
    }
}
