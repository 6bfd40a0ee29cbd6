//! Signaling-level peer connection.
//!
//! `SdpPeer` implements the JSEP state machine with real SDP: one media
//! section per sender, all bundled onto a single UDP transport, DTLS
//! fingerprints from a per-connection certificate (SDES keys only when the
//! remote side offers them), and host candidates gathered in the background
//! and trickled as `PeerEvent::LocalCandidate`.
//!
//! It does not carry media. A background agent answers the remote side's STUN
//! connectivity checks and runs its own; the connection is reported
//! `Connected` only after one of those checks succeeds with a response
//! signed by the remote ICE password.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use super::dtls::DtlsIdentity;
use super::error::PeerError;
use super::ice::{self, CandidateType, IceCandidate, IceCredentials};
use super::media::MediaTrack;
use super::messages::{CandidateInit, SdpType, SessionDescription};
use super::peer::{
    ConnectionState, PeerConnection, PeerEvent, PeerEvents, PeerFactory, SignalingState,
};
use super::sdp::{self, Codec, Direction, Keying, MediaSection, Sdp, Setup};
use super::stun::{self, BindingRequest, Class, TransactionId};
use super::MediaKind;

/// Pace of connectivity checks while no pair has succeeded.
const CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Outstanding check transactions remembered for matching responses.
const MAX_PENDING_CHECKS: usize = 64;

const MAX_PEER_REFLEXIVE: usize = 8;

#[derive(Debug, Clone)]
pub struct PeerSettings {
    /// Address to bind and advertise. `None` picks the default route's
    /// interface.
    pub host_ip: Option<IpAddr>,
    /// How long connectivity checks may run before the connection fails.
    pub ice_timeout: Duration,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            host_ip: None,
            ice_timeout: Duration::from_secs(15),
        }
    }
}

pub struct SdpPeerFactory {
    settings: PeerSettings,
}

impl SdpPeerFactory {
    pub fn new(settings: PeerSettings) -> Self {
        Self { settings }
    }
}

impl PeerFactory for SdpPeerFactory {
    fn create(&self) -> Result<(Arc<dyn PeerConnection>, PeerEvents), PeerError> {
        let (peer, events) = SdpPeer::new(self.settings.clone())?;
        Ok((Arc::new(peer), events))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gathering {
    New,
    Gathering,
    Complete,
}

/// One negotiated m-section.
struct Transceiver {
    mid: String,
    kind: Option<MediaKind>,
    sender: Option<MediaTrack>,
    rejected: bool,
    remote_track: Option<MediaTrack>,
}

/// Connectivity-check bookkeeping.
#[derive(Default)]
struct IceState {
    local_candidates: Vec<IceCandidate>,
    gathered: bool,
    remote_creds: Option<IceCredentials>,
    remote_candidates: Vec<IceCandidate>,
    /// Sources of verified checks that no remote candidate announced.
    peer_reflexive: Vec<SocketAddr>,
    /// The offerer controls; fixed by the first negotiation.
    controlling: Option<bool>,
    pending: VecDeque<(TransactionId, SocketAddr)>,
    selected: Option<SocketAddr>,
    timer_armed: bool,
}

struct State {
    signaling: SignalingState,
    connection: ConnectionState,
    creds: Option<IceCredentials>,
    origin: Option<(u64, u64)>,
    /// Tracks added since the last negotiation, not yet in a section.
    unbound: Vec<MediaTrack>,
    transceivers: Vec<Transceiver>,
    /// Local address of the socket every accepted section is bundled onto.
    /// The agent task owns the socket itself.
    transport: Option<SocketAddr>,
    local: Option<(SdpType, Sdp)>,
    remote: Option<Sdp>,
    ice: IceState,
}

impl State {
    /// Index and mid of the section trickled candidates are tagged with.
    fn bundle_tag(&self) -> Option<(usize, String)> {
        self.transceivers
            .iter()
            .enumerate()
            .find(|(_, t)| !t.rejected)
            .map(|(i, t)| (i, t.mid.clone()))
    }

    /// Addresses worth checking, best first, restricted to the local
    /// socket's address family.
    fn check_targets(&self, local: SocketAddr) -> Vec<SocketAddr> {
        let mut targets: Vec<SocketAddr> = Vec::new();
        let found = ice::rank_remote_candidates(&self.ice.remote_candidates)
            .into_iter()
            .chain(self.ice.peer_reflexive.iter().copied());
        for addr in found {
            if addr.is_ipv4() == local.is_ipv4() && !targets.contains(&addr) {
                targets.push(addr);
            }
        }
        targets
    }
}

struct Inner {
    settings: PeerSettings,
    address: IpAddr,
    stream_id: String,
    identity: DtlsIdentity,
    tie_breaker: u64,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<PeerEvent>,
    gathering: watch::Sender<Gathering>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self, tracks: Vec<MediaTrack>, change: Option<ConnectionState>) {
        for t in tracks {
            self.emit(PeerEvent::RemoteTrack(t));
        }
        if let Some(s) = change {
            self.emit(PeerEvent::ConnectionState(s));
        }
    }

    /// Re-evaluate connectivity. Returns a state change to publish.
    fn update_connectivity(self: &Arc<Self>, state: &mut State) -> Option<ConnectionState> {
        if state.signaling != SignalingState::Stable
            || state.local.is_none()
            || state.remote.is_none()
        {
            return None;
        }
        match state.connection {
            ConnectionState::New | ConnectionState::Connecting => {}
            _ => return None,
        }

        if let Some(addr) = state.ice.selected {
            tracing::info!("ICE: connected via {}", addr);
            state.connection = ConnectionState::Connected;
            return Some(ConnectionState::Connected);
        }

        if !state.ice.timer_armed {
            state.ice.timer_armed = true;
            self.arm_ice_timer();
        }
        if state.connection == ConnectionState::New {
            state.connection = ConnectionState::Connecting;
            return Some(ConnectionState::Connecting);
        }
        None
    }

    fn arm_ice_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let timeout = self.settings.ice_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            let failed = {
                let mut state = inner.lock();
                if state.connection == ConnectionState::Connecting {
                    state.connection = ConnectionState::Failed;
                    true
                } else {
                    false
                }
            };
            if failed {
                tracing::warn!("ICE: no connectivity check succeeded within {:?}", timeout);
                inner.emit(PeerEvent::ConnectionState(ConnectionState::Failed));
            }
        });
    }

    /// Binding requests due this round. `None` once the connection is closed.
    fn due_checks(&self, local: SocketAddr) -> Option<Vec<(SocketAddr, Vec<u8>)>> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.signaling == SignalingState::Closed {
            return None;
        }
        if state.signaling != SignalingState::Stable
            || state.connection != ConnectionState::Connecting
            || state.ice.selected.is_some()
        {
            return Some(Vec::new());
        }
        let (Some(local_creds), Some(remote_creds)) = (&state.creds, &state.ice.remote_creds)
        else {
            return Some(Vec::new());
        };

        let username = format!("{}:{}", remote_creds.ufrag, local_creds.ufrag);
        let request = BindingRequest {
            username: &username,
            priority: ice::compute_priority(CandidateType::PeerReflexive, 65535, 1),
            controlling: state.ice.controlling.unwrap_or(false),
            tie_breaker: self.tie_breaker,
        };
        let key = remote_creds.pwd.clone();

        let mut checks = Vec::new();
        for target in state.check_targets(local) {
            let tid = match stun::transaction_id() {
                Ok(tid) => tid,
                Err(e) => {
                    tracing::warn!("ICE: no transaction id for check: {}", e);
                    break;
                }
            };
            checks.push((target, stun::binding_request(&tid, &request, key.as_bytes())));
            state.ice.pending.push_back((tid, target));
            if state.ice.pending.len() > MAX_PENDING_CHECKS {
                state.ice.pending.pop_front();
            }
        }
        Some(checks)
    }

    /// Handle one datagram from the transport. Returns a reply to send back.
    fn on_datagram(self: &Arc<Self>, data: &[u8], from: SocketAddr) -> Option<Vec<u8>> {
        let message = stun::Message::parse(data)?;
        match message.class() {
            Class::Request => self.answer_check(&message, from),
            Class::Success => {
                self.on_check_success(&message, from);
                None
            }
            Class::Other => None,
        }
    }

    fn answer_check(&self, message: &stun::Message<'_>, from: SocketAddr) -> Option<Vec<u8>> {
        let mut state = self.lock();
        let local = state.creds.clone()?;
        let username = message.username().unwrap_or_default();
        let addressed_to_us = username
            .split_once(':')
            .map_or(false, |(ours, _)| ours == local.ufrag);
        if !addressed_to_us || !message.verify_integrity(local.pwd.as_bytes()) {
            tracing::debug!("ICE: ignoring unauthenticated check from {}", from);
            return None;
        }

        let announced = state
            .ice
            .remote_candidates
            .iter()
            .any(|c| c.socket_addr() == Some(from));
        if !announced
            && !state.ice.peer_reflexive.contains(&from)
            && state.ice.peer_reflexive.len() < MAX_PEER_REFLEXIVE
        {
            tracing::debug!("ICE: learned peer-reflexive address {}", from);
            state.ice.peer_reflexive.push(from);
        }
        Some(stun::binding_success(
            &message.transaction_id(),
            from,
            local.pwd.as_bytes(),
        ))
    }

    fn on_check_success(self: &Arc<Self>, message: &stun::Message<'_>, from: SocketAddr) {
        let change = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let tid = message.transaction_id();
            let Some(pos) = state.ice.pending.iter().position(|(t, _)| *t == tid) else {
                return;
            };
            let Some((_, target)) = state.ice.pending.remove(pos) else {
                return;
            };
            let verified = state
                .ice
                .remote_creds
                .as_ref()
                .map_or(false, |c| message.verify_integrity(c.pwd.as_bytes()));
            if target != from || !verified {
                tracing::debug!("ICE: discarding unverified response from {}", from);
                return;
            }
            if state.ice.selected.is_none() {
                tracing::debug!(
                    "ICE: check to {} succeeded (mapped {:?})",
                    from,
                    message.mapped_address()
                );
                state.ice.selected = Some(from);
            }
            self.update_connectivity(state)
        };
        self.publish(Vec::new(), change);
    }
}

/// Connectivity agent for one peer connection: answers checks, sends its
/// own, and exits once the connection closes or is dropped.
async fn run_agent(weak: Weak<Inner>, socket: Arc<UdpSocket>, local: SocketAddr) {
    let mut ticker = tokio::time::interval(CHECK_INTERVAL);
    let mut buf = vec![0u8; 1500];
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let checks = match weak.upgrade().and_then(|inner| inner.due_checks(local)) {
                    Some(checks) => checks,
                    None => break,
                };
                for (target, request) in checks {
                    if let Err(e) = socket.send_to(&request, target).await {
                        tracing::debug!("ICE: check to {} not sent: {}", target, e);
                    }
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::debug!("ICE: receive failed: {}", e);
                        continue;
                    }
                };
                let Some(inner) = weak.upgrade() else { break };
                let reply = inner.on_datagram(&buf[..len], from);
                drop(inner);
                if let Some(reply) = reply {
                    if let Err(e) = socket.send_to(&reply, from).await {
                        tracing::debug!("ICE: response to {} not sent: {}", from, e);
                    }
                }
            }
        }
    }
    tracing::debug!("ICE agent on {} stopped", local);
}

pub struct SdpPeer {
    inner: Arc<Inner>,
}

impl SdpPeer {
    pub fn new(settings: PeerSettings) -> Result<(Self, PeerEvents), PeerError> {
        let (events, rx) = mpsc::unbounded_channel();
        let (gathering, _) = watch::channel(Gathering::New);
        let address = settings.host_ip.unwrap_or_else(ice::local_ip);
        let peer = Self {
            inner: Arc::new(Inner {
                settings,
                address,
                stream_id: uuid::Uuid::new_v4().to_string(),
                identity: DtlsIdentity::generate()?,
                tie_breaker: u64::from_be_bytes(ice::rand_bytes()?),
                state: Mutex::new(State {
                    signaling: SignalingState::Stable,
                    connection: ConnectionState::New,
                    creds: None,
                    origin: None,
                    unbound: Vec::new(),
                    transceivers: Vec::new(),
                    transport: None,
                    local: None,
                    remote: None,
                    ice: IceState::default(),
                }),
                events,
                gathering,
            }),
        };
        Ok((peer, rx))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock()
    }

    /// Port of the bundled transport, binding it and starting the agent on
    /// first use.
    fn ensure_transport(&self, state: &mut State) -> Result<u16, PeerError> {
        if let Some(addr) = state.transport {
            return Ok(addr.port());
        }
        let ip = self
            .inner
            .settings
            .host_ip
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let std_socket = std::net::UdpSocket::bind(SocketAddr::new(ip, 0))?;
        std_socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let addr = socket.local_addr()?;
        tracing::debug!("Bound media transport on {}", addr);

        tokio::spawn(run_agent(Arc::downgrade(&self.inner), socket, addr));
        state.transport = Some(addr);
        Ok(addr.port())
    }

    fn msid(&self, track: &MediaTrack) -> String {
        format!("{} {}", self.inner.stream_id, track.id())
    }

    /// Fresh Sdp carrying this session's origin line.
    fn session(&self, state: &mut State) -> Result<Sdp, PeerError> {
        let mut sdp = Sdp::new(self.inner.address)?;
        if let Some((id, version)) = state.origin {
            sdp.session_id = id;
            sdp.version = version + 1;
        }
        state.origin = Some((sdp.session_id, sdp.version));
        Ok(sdp)
    }

    fn credentials(state: &mut State) -> Result<IceCredentials, PeerError> {
        if let Some(c) = &state.creds {
            return Ok(c.clone());
        }
        let creds = IceCredentials::generate()?;
        state.creds = Some(creds.clone());
        Ok(creds)
    }

    fn dtls(&self, setup: Setup) -> Keying {
        Keying::Dtls {
            fingerprint: self.inner.identity.fingerprint().to_string(),
            setup,
        }
    }

    fn local_section(
        &self,
        t: &Transceiver,
        port: u16,
        direction: Direction,
        creds: &IceCredentials,
        codecs: Vec<Codec>,
        keying: Keying,
    ) -> Result<MediaSection, PeerError> {
        let kind = t.kind.unwrap_or(MediaKind::Audio);
        let mut section =
            MediaSection::local(kind, &t.mid, port, direction, creds.clone(), codecs, keying)?;
        section.msid = t.sender.as_ref().map(|s| self.msid(s));
        Ok(section)
    }

    fn parse(desc: &SessionDescription) -> Result<Sdp, PeerError> {
        let parsed =
            sdp::parse(&desc.sdp).map_err(|e| PeerError::InvalidSdp(format!("{:#}", e)))?;
        if let Some(m) = parsed
            .media
            .iter()
            .find(|m| !m.is_rejected() && m.uses_dtls() && m.fingerprint.is_none())
        {
            return Err(PeerError::InvalidSdp(format!(
                "{} section {} has no DTLS fingerprint",
                m.media,
                m.mid.as_deref().unwrap_or("?")
            )));
        }
        Ok(parsed)
    }

    /// Gather host candidates for the transport, once.
    fn start_gathering(&self, state: &mut State) {
        let target = match (state.transport, state.ice.gathered) {
            (Some(addr), false) => state.bundle_tag().map(|tag| (tag, addr)),
            _ => None,
        };
        let Some(((index, mid), addr)) = target else {
            if *self.inner.gathering.borrow() != Gathering::Gathering {
                self.inner.gathering.send_replace(Gathering::Complete);
            }
            return;
        };

        state.ice.gathered = true;
        self.inner.gathering.send_replace(Gathering::Gathering);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let Some(inner) = weak.upgrade() else { return };
            let candidates = ice::gather_host_candidates(addr);
            {
                let mut state = inner.lock();
                if state.signaling == SignalingState::Closed {
                    return;
                }
                state.ice.local_candidates.extend(candidates.iter().cloned());
            }
            for c in candidates {
                tracing::debug!("Gathered local candidate {}", c.to_sdp_line());
                inner.emit(PeerEvent::LocalCandidate(CandidateInit {
                    candidate: c.to_sdp_line(),
                    sdp_mid: Some(mid.clone()),
                    sdp_m_line_index: Some(index as u16),
                }));
            }
            inner.gathering.send_replace(Gathering::Complete);
            inner.emit(PeerEvent::GatheringComplete);
        });
    }

    /// Emit remote tracks for sections both sides accepted and the remote
    /// side sends on. Runs whenever negotiation returns to stable.
    fn announce_remote_tracks(&self, state: &mut State) -> Vec<MediaTrack> {
        let Some(remote) = state.remote.as_ref() else {
            return Vec::new();
        };
        let mut added = Vec::new();
        for (i, t) in state.transceivers.iter_mut().enumerate() {
            let Some(section) = remote.media.get(i) else { continue };
            let (Some(kind), false, false) = (t.kind, t.rejected, section.is_rejected()) else {
                continue;
            };
            if section.direction.sends() && t.remote_track.is_none() {
                let track = MediaTrack::new(kind, &format!("remote {}", kind));
                t.remote_track = Some(track.clone());
                added.push(track);
            }
        }
        added
    }

    fn settle(&self, state: &mut State, next: SignalingState) -> (Vec<MediaTrack>, Option<ConnectionState>) {
        if next == SignalingState::Stable {
            (
                self.announce_remote_tracks(state),
                self.inner.update_connectivity(state),
            )
        } else {
            (Vec::new(), None)
        }
    }
}

#[async_trait]
impl PeerConnection for SdpPeer {
    fn signaling_state(&self) -> SignalingState {
        self.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.lock().connection
    }

    fn has_remote_description(&self) -> bool {
        self.lock().remote.is_some()
    }

    fn local_description(&self) -> Option<SessionDescription> {
        let state = self.lock();
        let (kind, sdp) = state.local.as_ref()?;
        let mut sdp = sdp.clone();
        let complete = *self.inner.gathering.borrow() == Gathering::Complete;
        for section in sdp.media.iter_mut().filter(|m| !m.is_rejected()) {
            section.candidates = state.ice.local_candidates.clone();
            section.end_of_candidates = complete && state.ice.gathered;
        }
        Some(SessionDescription {
            kind: *kind,
            sdp: sdp.to_string(),
        })
    }

    fn sender_kinds(&self) -> Vec<MediaKind> {
        let state = self.lock();
        state
            .transceivers
            .iter()
            .filter_map(|t| t.sender.as_ref().map(|s| s.kind()))
            .chain(state.unbound.iter().map(|t| t.kind()))
            .collect()
    }

    fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let mut state = self.lock();
        if state.signaling == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        let known = state
            .transceivers
            .iter()
            .filter_map(|t| t.sender.as_ref())
            .chain(state.unbound.iter())
            .any(|s| s.same_track(track));
        if known {
            return Ok(());
        }

        // Reuse a receive-only section of the same kind.
        if let Some(t) = state
            .transceivers
            .iter_mut()
            .find(|t| !t.rejected && t.sender.is_none() && t.kind == Some(track.kind()))
        {
            tracing::debug!("Sender {} bound to section {}", track.id(), t.mid);
            t.sender = Some(track.clone());
            return Ok(());
        }
        state.unbound.push(track.clone());
        Ok(())
    }

    fn replace_track(&self, track: &MediaTrack) -> Result<bool, PeerError> {
        let mut state = self.lock();
        if state.signaling == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        let kind = track.kind();
        if let Some(slot) = state
            .transceivers
            .iter_mut()
            .filter_map(|t| t.sender.as_mut())
            .find(|s| s.kind() == kind)
        {
            *slot = track.clone();
            return Ok(true);
        }
        if let Some(slot) = state.unbound.iter_mut().find(|s| s.kind() == kind) {
            *slot = track.clone();
            return Ok(true);
        }
        Ok(false)
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.signaling {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {}
            other => {
                return Err(PeerError::InvalidState {
                    op: "create offer",
                    state: other,
                })
            }
        }

        for track in std::mem::take(&mut state.unbound) {
            let mid = state.transceivers.len().to_string();
            state.transceivers.push(Transceiver {
                mid,
                kind: Some(track.kind()),
                sender: Some(track),
                rejected: false,
                remote_track: None,
            });
        }

        let port = if state.bundle_tag().is_some() {
            self.ensure_transport(state)?
        } else {
            0
        };
        let creds = Self::credentials(state)?;
        let mut sdp = self.session(state)?;
        for t in &state.transceivers {
            let section = match (t.rejected, t.kind) {
                (false, Some(kind)) => {
                    let direction = if t.sender.is_some() {
                        Direction::SendRecv
                    } else {
                        Direction::RecvOnly
                    };
                    sdp.bundle.push(t.mid.clone());
                    self.local_section(
                        t,
                        port,
                        direction,
                        &creds,
                        Codec::defaults(kind),
                        self.dtls(Setup::ActPass),
                    )?
                }
                (_, kind) => MediaSection::inactive(
                    kind.map_or("audio", |k| k.as_str()),
                    &t.mid,
                ),
            };
            sdp.media.push(section);
        }

        tracing::debug!("Created offer with {} section(s)", sdp.media.len());
        Ok(SessionDescription::offer(sdp.to_string()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(PeerError::InvalidState {
                op: "create answer",
                state: state.signaling,
            });
        }
        let remote = state.remote.clone().ok_or(PeerError::NoRemoteDescription)?;
        let creds = Self::credentials(state)?;
        let mut sdp = self.session(state)?;

        for (i, offered) in remote.media.iter().enumerate() {
            if state.transceivers.len() <= i {
                let mid = offered.mid.clone().unwrap_or_else(|| i.to_string());
                state.transceivers.push(Transceiver {
                    mid,
                    kind: offered.kind(),
                    sender: None,
                    rejected: false,
                    remote_track: None,
                });
            }

            // Bind a pending local track of the offered kind.
            let t = &mut state.transceivers[i];
            if t.sender.is_none() {
                if let Some(kind) = t.kind {
                    if let Some(pos) = state.unbound.iter().position(|s| s.kind() == kind) {
                        t.sender = Some(state.unbound.remove(pos));
                    }
                }
            }

            let codecs = t.kind.map(|k| offered.common_codecs(k)).unwrap_or_default();
            let accept = !offered.is_rejected()
                && t.kind.is_some()
                && t.sender.is_some()
                && !codecs.is_empty();

            if !accept {
                if !t.rejected {
                    tracing::info!(
                        "Rejecting offered {} section {} (no local track)",
                        offered.media,
                        t.mid
                    );
                }
                t.rejected = true;
                sdp.media.push(MediaSection::rejected(offered));
                continue;
            }
            t.rejected = false;

            let port = self.ensure_transport(state)?;
            let t = &state.transceivers[i];
            let direction = offered.direction.answer(t.sender.is_some());
            let keying = if offered.uses_dtls() {
                self.dtls(offered.setup.unwrap_or(Setup::ActPass).answer())
            } else {
                Keying::Sdes
            };
            let mut section = self.local_section(t, port, direction, &creds, codecs, keying)?;
            section.protocol = offered.protocol.clone();
            if remote.bundle.contains(&t.mid) {
                sdp.bundle.push(t.mid.clone());
            }
            sdp.media.push(section);
        }

        if !state.unbound.is_empty() {
            tracing::debug!(
                "{} local track(s) not offered by the remote side",
                state.unbound.len()
            );
        }
        Ok(SessionDescription::answer(sdp.to_string()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let parsed = Self::parse(&desc)?;
        let mut guard = self.lock();
        let state = &mut *guard;
        let next = match (desc.kind, state.signaling) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (_, other) => {
                return Err(PeerError::InvalidState {
                    op: "set local description",
                    state: other,
                })
            }
        };
        if parsed.media.len() != state.transceivers.len() {
            return Err(PeerError::InvalidSdp(format!(
                "description has {} section(s), expected {}",
                parsed.media.len(),
                state.transceivers.len()
            )));
        }

        if desc.kind == SdpType::Offer {
            state.ice.controlling.get_or_insert(true);
        }
        state.local = Some((desc.kind, parsed));
        state.signaling = next;
        self.start_gathering(state);

        let (tracks, change) = self.settle(state, next);
        drop(guard);
        self.inner.publish(tracks, change);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let parsed = Self::parse(&desc)?;
        let mut guard = self.lock();
        let state = &mut *guard;
        let next = match (desc.kind, state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (_, other) => {
                return Err(PeerError::InvalidState {
                    op: "set remote description",
                    state: other,
                })
            }
        };

        if desc.kind == SdpType::Answer {
            if parsed.media.len() < state.transceivers.len() {
                return Err(PeerError::InvalidSdp(format!(
                    "answer has {} section(s), offer had {}",
                    parsed.media.len(),
                    state.transceivers.len()
                )));
            }
            for (t, section) in state.transceivers.iter_mut().zip(parsed.media.iter()) {
                if section.is_rejected() && !t.rejected {
                    tracing::info!("Remote rejected {} section {}", section.media, t.mid);
                    t.rejected = true;
                }
            }
        } else {
            state.ice.controlling.get_or_insert(false);
        }

        let accepted = parsed.media.iter().filter(|m| !m.is_rejected());
        if let Some(creds) = accepted.clone().find_map(|m| m.ice.clone()) {
            state.ice.remote_creds = Some(creds);
        }
        for section in accepted {
            state
                .ice
                .remote_candidates
                .extend(section.candidates.iter().cloned());
        }
        state.remote = Some(parsed);
        state.signaling = next;

        let (tracks, change) = self.settle(state, next);
        drop(guard);
        self.inner.publish(tracks, change);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.signaling == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        let Some(remote) = state.remote.as_ref() else {
            return Err(PeerError::NoRemoteDescription);
        };
        if candidate.is_end_of_candidates() {
            tracing::debug!("Remote end of candidates");
            return Ok(());
        }

        let parsed = ice::parse_candidate(&candidate.candidate)
            .map_err(|e| PeerError::InvalidCandidate(format!("{:#}", e)))?;
        let index = remote
            .section_index(candidate.sdp_mid.as_deref(), candidate.sdp_m_line_index)
            .ok_or_else(|| {
                PeerError::InvalidCandidate(format!(
                    "no media section for mid {:?} / index {:?}",
                    candidate.sdp_mid, candidate.sdp_m_line_index
                ))
            })?;
        let rejected = remote.media[index].is_rejected()
            || state.transceivers.get(index).map_or(false, |t| t.rejected);
        if rejected {
            tracing::debug!("Ignoring candidate for rejected section {}", index);
            return Ok(());
        }

        tracing::debug!("Applied remote candidate {}", parsed.to_sdp_line());
        state.ice.remote_candidates.push(parsed);
        Ok(())
    }

    async fn gathering_complete(&self) {
        let mut rx = self.inner.gathering.subscribe();
        let _ = rx.wait_for(|g| *g == Gathering::Complete).await;
    }

    fn close(&self) {
        let remote_tracks = {
            let mut state = self.lock();
            if state.signaling == SignalingState::Closed {
                return;
            }
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
            state.unbound.clear();
            state.transport = None;
            state
                .transceivers
                .drain(..)
                .filter_map(|t| t.remote_track)
                .collect::<Vec<_>>()
        };
        for t in remote_tracks {
            t.stop();
        }
        self.inner.gathering.send_replace(Gathering::Complete);
        self.inner
            .emit(PeerEvent::ConnectionState(ConnectionState::Closed));
        tracing::debug!("Peer connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROWSER_OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
a=fingerprint:sha-256 0F:74:31:25:CB:A2:13:EC:28:6F:6D:2C:61:FF:5D:C2:BC:B9:DB:3D:98:14:8D:1A:BB:EA:33:0C:A4:60:A8:8E\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=ice-ufrag:brws\r\n\
a=ice-pwd:browserpasswordbrowserpw\r\n\
a=setup:actpass\r\n\
a=sendrecv\r\n\
a=rtcp-mux\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=candidate:1 1 udp 2122260223 4b1f3c.local 50000 typ host generation 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=ice-ufrag:brws\r\n\
a=ice-pwd:browserpasswordbrowserpw\r\n\
a=setup:actpass\r\n\
a=sendrecv\r\n\
a=rtcp-mux\r\n\
a=rtpmap:96 VP8/90000\r\n";

    fn settings() -> PeerSettings {
        PeerSettings {
            host_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ice_timeout: Duration::from_millis(200),
        }
    }

    fn peer() -> (SdpPeer, PeerEvents) {
        SdpPeer::new(settings()).unwrap()
    }

    async fn collect_candidates(events: &mut PeerEvents) -> Vec<CandidateInit> {
        let mut out = Vec::new();
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("gathering did not finish")
                .expect("event channel closed");
            match ev {
                PeerEvent::LocalCandidate(c) => out.push(c),
                PeerEvent::GatheringComplete => return out,
                _ => {}
            }
        }
    }

    /// Drain events until the connection reaches `wanted`, collecting
    /// remote track kinds seen on the way.
    async fn wait_for_state(events: &mut PeerEvents, wanted: ConnectionState) -> Vec<MediaKind> {
        let mut remote_kinds = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), async {
            while let Some(ev) = events.recv().await {
                match ev {
                    PeerEvent::RemoteTrack(t) => remote_kinds.push(t.kind()),
                    PeerEvent::ConnectionState(s) if s == wanted => return,
                    _ => {}
                }
            }
            panic!("event channel closed");
        })
        .await
        .unwrap_or_else(|_| panic!("connection never reached {:?}", wanted));
        remote_kinds
    }

    async fn answer_to(offer: &str, kinds: &[MediaKind]) -> Result<Sdp, PeerError> {
        let (pc, _events) = peer();
        for kind in kinds {
            pc.add_track(&MediaTrack::new(*kind, "local")).unwrap();
        }
        pc.set_remote_description(SessionDescription::offer(offer))
            .await?;
        let answer = pc.create_answer().await?;
        Ok(sdp::parse(&answer.sdp).unwrap())
    }

    #[tokio::test]
    async fn test_offer_bundles_sections_with_dtls() {
        let (pc, _events) = peer();
        pc.add_track(&MediaTrack::new(MediaKind::Audio, "mic")).unwrap();
        pc.add_track(&MediaTrack::new(MediaKind::Video, "cam")).unwrap();

        let offer = pc.create_offer().await.unwrap();
        let sdp = sdp::parse(&offer.sdp).unwrap();
        let kinds: Vec<_> = sdp.media.iter().filter_map(|m| m.kind()).collect();
        assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video]);
        assert_eq!(sdp.bundle, vec!["0", "1"]);
        assert!(sdp.media.iter().all(|m| m.direction == Direction::SendRecv));
        assert!(sdp.media.iter().all(|m| m.uses_dtls() && m.crypto.is_empty()));
        assert!(sdp.media.iter().all(|m| m.setup == Some(Setup::ActPass)));
        assert_eq!(sdp.media[0].fingerprint, sdp.media[1].fingerprint);
        assert_ne!(sdp.media[0].port, 0);
        assert_eq!(sdp.media[0].port, sdp.media[1].port);
        assert_eq!(sdp.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_answer_to_browser_offer() {
        let answer = answer_to(BROWSER_OFFER, &[MediaKind::Audio]).await.unwrap();
        let text = answer.to_string();
        assert!(text.contains(" UDP/TLS/RTP/SAVPF 111 0\r\n"));
        assert!(text.contains("a=fingerprint:sha-256 "));
        assert!(text.contains("a=setup:active\r\n"));
        assert!(text.contains("a=group:BUNDLE 0\r\n"));
        assert!(!text.contains("a=crypto:"));
        assert!(answer.media[1].is_rejected());
    }

    #[tokio::test]
    async fn test_answer_mirrors_sdes_offer() {
        let sdes = BROWSER_OFFER
            .replace("UDP/TLS/RTP/SAVPF", "RTP/SAVPF")
            .replace("a=group:BUNDLE 0 1\r\n", "");
        let answer = answer_to(&sdes, &[MediaKind::Audio, MediaKind::Video])
            .await
            .unwrap();
        for m in &answer.media {
            assert_eq!(m.protocol, "RTP/SAVPF");
            assert_eq!(m.crypto.len(), 1);
            assert!(m.fingerprint.is_none());
        }
        assert!(answer.bundle.is_empty());
    }

    #[tokio::test]
    async fn test_dtls_offer_without_fingerprint_is_invalid() {
        let unkeyed: String = BROWSER_OFFER
            .lines()
            .filter(|l| !l.starts_with("a=fingerprint"))
            .map(|l| format!("{}\r\n", l))
            .collect();
        assert!(matches!(
            answer_to(&unkeyed, &[MediaKind::Audio]).await,
            Err(PeerError::InvalidSdp(_))
        ));
    }

    #[tokio::test]
    async fn test_negotiation_connects_only_through_checks() {
        let (a, mut a_events) = peer();
        let (b, mut b_events) = peer();
        a.add_track(&MediaTrack::new(MediaKind::Audio, "a-mic")).unwrap();
        a.add_track(&MediaTrack::new(MediaKind::Video, "a-cam")).unwrap();
        b.add_track(&MediaTrack::new(MediaKind::Audio, "b-mic")).unwrap();
        b.add_track(&MediaTrack::new(MediaKind::Video, "b-cam")).unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);
        let a_candidates = collect_candidates(&mut a_events).await;
        assert_eq!(a_candidates.len(), 1);
        assert_eq!(a_candidates[0].sdp_mid.as_deref(), Some("0"));

        b.set_remote_description(offer).await.unwrap();
        assert_eq!(b.signaling_state(), SignalingState::HaveRemoteOffer);
        for c in &a_candidates {
            b.add_ice_candidate(c.clone()).await.unwrap();
        }
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        assert_eq!(b.signaling_state(), SignalingState::Stable);
        // Candidates alone do not make a connection
        assert_eq!(b.connection_state(), ConnectionState::Connecting);

        a.set_remote_description(answer).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);
        for c in collect_candidates(&mut b_events).await {
            a.add_ice_candidate(c).await.unwrap();
        }

        let remote_kinds = wait_for_state(&mut a_events, ConnectionState::Connected).await;
        assert_eq!(remote_kinds, vec![MediaKind::Audio, MediaKind::Video]);
        wait_for_state(&mut b_events, ConnectionState::Connected).await;
        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_answer_rejects_sections_without_local_track() {
        let (a, mut a_events) = peer();
        let (b, _b_events) = peer();
        a.add_track(&MediaTrack::new(MediaKind::Audio, "mic")).unwrap();
        a.add_track(&MediaTrack::new(MediaKind::Video, "cam")).unwrap();
        b.add_track(&MediaTrack::new(MediaKind::Audio, "mic")).unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();

        let parsed = sdp::parse(&answer.sdp).unwrap();
        assert_eq!(parsed.media.len(), 2);
        assert!(!parsed.media[0].is_rejected());
        assert!(parsed.media[1].is_rejected());
        assert_eq!(parsed.media[1].direction, Direction::Inactive);
        assert_eq!(parsed.bundle, vec!["0"]);

        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let mut remote_kinds = Vec::new();
        while let Ok(ev) = a_events.try_recv() {
            if let PeerEvent::RemoteTrack(t) = ev {
                remote_kinds.push(t.kind());
            }
        }
        assert_eq!(remote_kinds, vec![MediaKind::Audio]);
    }

    #[tokio::test]
    async fn test_only_authenticated_checks_are_answered() {
        let (pc, _events) = peer();
        pc.add_track(&MediaTrack::new(MediaKind::Audio, "mic")).unwrap();
        let offer = pc.create_offer().await.unwrap();
        pc.set_local_description(offer.clone()).await.unwrap();
        let offered = sdp::parse(&offer.sdp).unwrap();
        let creds = offered.media[0].ice.clone().unwrap();
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), offered.media[0].port);

        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let username = format!("{}:rmte", creds.ufrag);
        let check = BindingRequest {
            username: &username,
            priority: 1,
            controlling: false,
            tie_breaker: 7,
        };
        let mut buf = [0u8; 512];

        let forged = stun::binding_request(&[1; 12], &check, b"not-the-password");
        remote.send_to(&forged, target).await.unwrap();
        let silent =
            tokio::time::timeout(Duration::from_millis(200), remote.recv_from(&mut buf)).await;
        assert!(silent.is_err());

        let genuine = stun::binding_request(&[2; 12], &check, creds.pwd.as_bytes());
        remote.send_to(&genuine, target).await.unwrap();
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
            .await
            .expect("no response to a valid check")
            .unwrap();
        let response = stun::Message::parse(&buf[..len]).unwrap();
        assert_eq!(response.class(), Class::Success);
        assert_eq!(response.transaction_id(), [2; 12]);
        assert_eq!(response.mapped_address(), Some(remote.local_addr().unwrap()));
        assert!(response.verify_integrity(creds.pwd.as_bytes()));
    }

    #[tokio::test]
    async fn test_signaling_order_violations() {
        let (pc, _events) = peer();
        let cand = CandidateInit {
            candidate: "candidate:1 1 UDP 2130706431 127.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        assert!(matches!(
            pc.add_ice_candidate(cand).await,
            Err(PeerError::NoRemoteDescription)
        ));
        assert!(matches!(
            pc.create_answer().await,
            Err(PeerError::InvalidState { .. })
        ));
        let bogus = SessionDescription::answer("v=0\r\n");
        assert!(matches!(
            pc.set_remote_description(bogus).await,
            Err(PeerError::InvalidState { .. })
        ));
        assert!(matches!(
            pc.set_remote_description(SessionDescription::offer("nonsense")).await,
            Err(PeerError::InvalidSdp(_))
        ));
        assert_eq!(pc.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_unreachable_candidate_fails_connection() {
        let (a, _a_events) = peer();
        let (b, mut b_events) = peer();
        a.add_track(&MediaTrack::new(MediaKind::Audio, "mic")).unwrap();
        b.add_track(&MediaTrack::new(MediaKind::Audio, "mic")).unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        // Nothing listens here, so every check goes unanswered.
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();
        b.add_ice_candidate(CandidateInit {
            candidate: format!("candidate:9 1 UDP 2130706431 127.0.0.1 {} typ host", port),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        })
        .await
        .unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer).await.unwrap();
        assert_eq!(b.connection_state(), ConnectionState::Connecting);

        wait_for_state(&mut b_events, ConnectionState::Failed).await;
        assert_eq!(b.connection_state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_local_description_includes_gathered_candidates() {
        let (pc, mut events) = peer();
        pc.add_track(&MediaTrack::new(MediaKind::Audio, "mic")).unwrap();
        pc.add_track(&MediaTrack::new(MediaKind::Video, "cam")).unwrap();
        let offer = pc.create_offer().await.unwrap();
        pc.set_local_description(offer).await.unwrap();
        pc.gathering_complete().await;
        collect_candidates(&mut events).await;

        let desc = pc.local_description().unwrap();
        let parsed = sdp::parse(&desc.sdp).unwrap();
        for m in &parsed.media {
            assert_eq!(m.candidates.len(), 1);
            assert!(m.end_of_candidates);
        }
    }

    #[tokio::test]
    async fn test_replace_track_keeps_sender() {
        let (pc, _events) = peer();
        let first = MediaTrack::new(MediaKind::Video, "cam1");
        pc.add_track(&first).unwrap();
        let second = MediaTrack::new(MediaKind::Video, "cam2");
        assert!(pc.replace_track(&second).unwrap());
        assert!(!pc.replace_track(&MediaTrack::new(MediaKind::Audio, "mic")).unwrap());
        assert_eq!(pc.sender_kinds(), vec![MediaKind::Video]);

        pc.close();
        assert_eq!(pc.signaling_state(), SignalingState::Closed);
        assert!(matches!(pc.add_track(&first), Err(PeerError::Closed)));
        pc.close();
    }
}
