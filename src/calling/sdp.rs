//! SDP model: parse offers/answers and render local descriptions.
//!
//! Sections are matched between offer and answer by position, as RFC 3264
//! requires. Local descriptions key media with DTLS (`a=fingerprint` and
//! `a=setup`) unless answering an SDES offer, and bundle every live section
//! onto one transport.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use anyhow::{bail, Context, Result};
use base64::Engine;

use super::ice::{self, IceCandidate, IceCredentials};
use super::MediaKind;

pub const DTLS_PROTOCOL: &str = "UDP/TLS/RTP/SAVPF";
pub const SDES_PROTOCOL: &str = "RTP/SAVPF";

/// DTLS role negotiation (RFC 5763).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setup {
    Active,
    Passive,
    ActPass,
}

impl Setup {
    fn as_attr(&self) -> &'static str {
        match self {
            Setup::Active => "active",
            Setup::Passive => "passive",
            Setup::ActPass => "actpass",
        }
    }

    fn from_attr(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Setup::Active),
            "passive" => Some(Setup::Passive),
            "actpass" => Some(Setup::ActPass),
            _ => None,
        }
    }

    /// Role an answerer takes when the offer carries `self`.
    pub fn answer(&self) -> Setup {
        match self {
            Setup::ActPass | Setup::Passive => Setup::Active,
            Setup::Active => Setup::Passive,
        }
    }
}

/// How a local section keys its media.
#[derive(Debug, Clone)]
pub enum Keying {
    Dtls { fingerprint: String, setup: Setup },
    Sdes,
}

/// Media direction attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn as_attr(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    fn from_attr(s: &str) -> Option<Self> {
        match s {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    pub fn sends(&self) -> bool {
        matches!(self, Direction::SendRecv | Direction::SendOnly)
    }

    pub fn receives(&self) -> bool {
        matches!(self, Direction::SendRecv | Direction::RecvOnly)
    }

    /// Direction of an answer that has a local track (`sending`) to a
    /// section offered with `self`.
    pub fn answer(&self, sending: bool) -> Direction {
        match (self.receives() && sending, self.sends()) {
            (true, true) => Direction::SendRecv,
            (true, false) => Direction::SendOnly,
            (false, true) => Direction::RecvOnly,
            (false, false) => Direction::Inactive,
        }
    }
}

/// `a=rtpmap` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Codec {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
}

impl Codec {
    fn new(payload_type: u8, name: &str, clock_rate: u32, channels: Option<u8>) -> Self {
        Self {
            payload_type,
            name: name.to_string(),
            clock_rate,
            channels,
        }
    }

    /// Codecs we offer for a kind, in preference order.
    pub fn defaults(kind: MediaKind) -> Vec<Codec> {
        match kind {
            MediaKind::Audio => vec![
                Codec::new(111, "opus", 48000, Some(2)),
                Codec::new(0, "PCMU", 8000, None),
            ],
            MediaKind::Video => vec![Codec::new(96, "VP8", 90000, None)],
        }
    }

    fn parse_rtpmap(value: &str) -> Result<Self> {
        let (pt, rest) = value
            .split_once(' ')
            .with_context(|| format!("bad rtpmap: {}", value))?;
        let mut enc = rest.trim().split('/');
        let name = enc.next().unwrap_or_default().to_string();
        let clock_rate = enc
            .next()
            .context("rtpmap without clock rate")?
            .parse()
            .context("bad clock rate")?;
        let channels = enc.next().and_then(|c| c.parse().ok());
        Ok(Self {
            payload_type: pt.parse().context("bad payload type")?,
            name,
            clock_rate,
            channels,
        })
    }
}

/// One `m=` section.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSection {
    /// Media type token (`audio`, `video`, or anything else a peer offers).
    pub media: String,
    /// 0 marks a rejected section.
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub mid: Option<String>,
    pub direction: Direction,
    pub codecs: Vec<Codec>,
    pub ice: Option<IceCredentials>,
    /// `fingerprint:` value, inherited from the session level when absent.
    pub fingerprint: Option<String>,
    pub setup: Option<Setup>,
    /// `crypto:` attribute values.
    pub crypto: Vec<String>,
    pub candidates: Vec<IceCandidate>,
    pub end_of_candidates: bool,
    /// `msid:` value, `<stream-id> <track-id>`.
    pub msid: Option<String>,
    pub rtcp_mux: bool,
}

impl MediaSection {
    /// A section we send or receive on. SDES keying draws a fresh key.
    pub fn local(
        kind: MediaKind,
        mid: &str,
        port: u16,
        direction: Direction,
        ice: IceCredentials,
        codecs: Vec<Codec>,
        keying: Keying,
    ) -> Result<Self, getrandom::Error> {
        let (protocol, fingerprint, setup, crypto) = match keying {
            Keying::Dtls { fingerprint, setup } => {
                (DTLS_PROTOCOL, Some(fingerprint), Some(setup), Vec::new())
            }
            Keying::Sdes => (SDES_PROTOCOL, None, None, vec![crypto_attribute()?]),
        };
        Ok(Self {
            media: kind.as_str().to_string(),
            port,
            protocol: protocol.to_string(),
            formats: codecs.iter().map(|c| c.payload_type.to_string()).collect(),
            mid: Some(mid.to_string()),
            direction,
            codecs,
            ice: Some(ice),
            fingerprint,
            setup,
            crypto,
            candidates: Vec::new(),
            end_of_candidates: false,
            msid: None,
            rtcp_mux: true,
        })
    }

    /// A rejected answer to `offered`: port 0, inactive, no transport.
    pub fn rejected(offered: &MediaSection) -> Self {
        Self {
            protocol: offered.protocol.clone(),
            formats: offered.formats.iter().take(1).cloned().collect(),
            mid: offered.mid.clone(),
            ..Self::inactive(&offered.media, "")
        }
    }

    /// A disabled section (port 0) keeping its place in the m-line order.
    pub fn inactive(media: &str, mid: &str) -> Self {
        Self {
            media: media.to_string(),
            port: 0,
            protocol: DTLS_PROTOCOL.to_string(),
            formats: vec!["0".to_string()],
            mid: Some(mid.to_string()),
            direction: Direction::Inactive,
            codecs: Vec::new(),
            ice: None,
            fingerprint: None,
            setup: None,
            crypto: Vec::new(),
            candidates: Vec::new(),
            end_of_candidates: false,
            msid: None,
            rtcp_mux: false,
        }
    }

    pub fn kind(&self) -> Option<MediaKind> {
        match self.media.as_str() {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.port == 0
    }

    pub fn uses_dtls(&self) -> bool {
        self.protocol.to_ascii_uppercase().contains("TLS")
    }

    /// Our codecs that the offer also lists, using the offer's payload types.
    pub fn common_codecs(&self, kind: MediaKind) -> Vec<Codec> {
        Codec::defaults(kind)
            .into_iter()
            .filter_map(|ours| {
                self.codecs
                    .iter()
                    .find(|theirs| {
                        theirs.name.eq_ignore_ascii_case(&ours.name)
                            && theirs.clock_rate == ours.clock_rate
                    })
                    .cloned()
            })
            .collect()
    }
}

/// A parsed or locally built session description.
#[derive(Debug, Clone, PartialEq)]
pub struct Sdp {
    pub session_id: u64,
    pub version: u64,
    pub address: IpAddr,
    /// mids of the `a=group:BUNDLE` group, empty when nothing is bundled.
    pub bundle: Vec<String>,
    pub media: Vec<MediaSection>,
}

impl Sdp {
    pub fn new(address: IpAddr) -> Result<Self, getrandom::Error> {
        // Session ids stay below 2^62 so they fit a signed 64-bit integer.
        let id = u64::from_be_bytes(ice::rand_bytes()?) >> 2;
        Ok(Self {
            session_id: id,
            version: 1,
            address,
            bundle: Vec::new(),
            media: Vec::new(),
        })
    }

    /// Section index for a candidate's `sdpMid` / `sdpMLineIndex`.
    pub fn section_index(&self, mid: Option<&str>, m_line_index: Option<u16>) -> Option<usize> {
        if let Some(mid) = mid {
            if let Some(i) = self.media.iter().position(|m| m.mid.as_deref() == Some(mid)) {
                return Some(i);
            }
        }
        m_line_index
            .map(|i| i as usize)
            .filter(|i| *i < self.media.len())
    }
}

/// Parse an SDP document.
pub fn parse(text: &str) -> Result<Sdp> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    if lines.next() != Some("v=0") {
        bail!("SDP must start with v=0");
    }

    let mut session_id = 0u64;
    let mut version = 0u64;
    let mut address: Option<IpAddr> = None;
    let mut session_ice_ufrag: Option<String> = None;
    let mut session_ice_pwd: Option<String> = None;
    let mut session_fingerprint: Option<String> = None;
    let mut session_setup: Option<Setup> = None;
    let mut bundle: Vec<String> = Vec::new();
    let mut media: Vec<MediaSection> = Vec::new();
    // ufrag/pwd seen inside the current section
    let mut section_creds: (Option<String>, Option<String>) = (None, None);

    let finish_creds = |section: &mut MediaSection,
                        creds: &mut (Option<String>, Option<String>),
                        ufrag: &Option<String>,
                        pwd: &Option<String>| {
        let u = creds.0.take().or_else(|| ufrag.clone());
        let p = creds.1.take().or_else(|| pwd.clone());
        if let (Some(ufrag), Some(pwd)) = (u, p) {
            section.ice = Some(IceCredentials { ufrag, pwd });
        }
    };

    for line in lines {
        let Some((key, value)) = line.split_once('=') else {
            bail!("malformed SDP line: {}", line);
        };

        match key {
            "o" => {
                let parts: Vec<&str> = value.split_whitespace().collect();
                if parts.len() < 6 {
                    bail!("malformed origin: {}", line);
                }
                session_id = parts[1].parse().context("bad session id")?;
                version = parts[2].parse().context("bad session version")?;
                if address.is_none() {
                    address = parts[5].parse().ok();
                }
            }
            "c" => {
                if let Some(ip) = value.split_whitespace().nth(2).and_then(|a| a.parse().ok()) {
                    if media.is_empty() || address.is_none() {
                        address = Some(ip);
                    }
                }
            }
            "m" => {
                if let Some(prev) = media.last_mut() {
                    finish_creds(prev, &mut section_creds, &session_ice_ufrag, &session_ice_pwd);
                }
                let parts: Vec<&str> = value.split_whitespace().collect();
                if parts.len() < 3 {
                    bail!("malformed media line: {}", line);
                }
                let port: u16 = parts[1]
                    .split('/')
                    .next()
                    .unwrap_or_default()
                    .parse()
                    .with_context(|| format!("bad media port: {}", line))?;
                media.push(MediaSection {
                    media: parts[0].to_string(),
                    port,
                    protocol: parts[2].to_string(),
                    formats: parts[3..].iter().map(|s| s.to_string()).collect(),
                    mid: None,
                    direction: Direction::SendRecv,
                    codecs: Vec::new(),
                    ice: None,
                    fingerprint: session_fingerprint.clone(),
                    setup: session_setup,
                    crypto: Vec::new(),
                    candidates: Vec::new(),
                    end_of_candidates: false,
                    msid: None,
                    rtcp_mux: false,
                });
            }
            "a" => {
                let (name, attr) = match value.split_once(':') {
                    Some((n, v)) => (n, v),
                    None => (value, ""),
                };
                let Some(section) = media.last_mut() else {
                    match name {
                        "ice-ufrag" => session_ice_ufrag = Some(attr.to_string()),
                        "ice-pwd" => session_ice_pwd = Some(attr.to_string()),
                        "fingerprint" => session_fingerprint = Some(attr.to_string()),
                        "setup" => session_setup = Setup::from_attr(attr),
                        "group" => {
                            let mut tokens = attr.split_whitespace();
                            if tokens.next() == Some("BUNDLE") {
                                bundle = tokens.map(str::to_string).collect();
                            }
                        }
                        _ => {}
                    }
                    continue;
                };
                match name {
                    "mid" => section.mid = Some(attr.to_string()),
                    "ice-ufrag" => section_creds.0 = Some(attr.to_string()),
                    "ice-pwd" => section_creds.1 = Some(attr.to_string()),
                    "rtpmap" => section.codecs.push(Codec::parse_rtpmap(attr)?),
                    "crypto" => section.crypto.push(attr.to_string()),
                    "fingerprint" => section.fingerprint = Some(attr.to_string()),
                    "setup" => section.setup = Setup::from_attr(attr),
                    "candidate" => section.candidates.push(ice::parse_candidate(value)?),
                    "end-of-candidates" => section.end_of_candidates = true,
                    "msid" => section.msid = Some(attr.to_string()),
                    "rtcp-mux" => section.rtcp_mux = true,
                    other => {
                        if let Some(d) = Direction::from_attr(other) {
                            section.direction = d;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(last) = media.last_mut() {
        finish_creds(last, &mut section_creds, &session_ice_ufrag, &session_ice_pwd);
    }

    Ok(Sdp {
        session_id,
        version,
        address: address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        bundle,
        media,
    })
}

impl fmt::Display for Sdp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip_ver = if self.address.is_ipv6() { "IP6" } else { "IP4" };
        write!(f, "v=0\r\n")?;
        write!(
            f,
            "o=- {} {} IN {} {}\r\n",
            self.session_id, self.version, ip_ver, self.address
        )?;
        write!(f, "s=-\r\n")?;
        write!(f, "t=0 0\r\n")?;
        if !self.bundle.is_empty() {
            write!(f, "a=group:BUNDLE {}\r\n", self.bundle.join(" "))?;
        }

        for m in &self.media {
            write!(
                f,
                "m={} {} {} {}\r\n",
                m.media,
                m.port,
                m.protocol,
                m.formats.join(" ")
            )?;
            write!(f, "c=IN {} {}\r\n", ip_ver, self.address)?;
            if let Some(mid) = &m.mid {
                write!(f, "a=mid:{}\r\n", mid)?;
            }
            if let Some(ice) = &m.ice {
                write!(f, "a=ice-ufrag:{}\r\n", ice.ufrag)?;
                write!(f, "a=ice-pwd:{}\r\n", ice.pwd)?;
            }
            if let Some(fp) = &m.fingerprint {
                write!(f, "a=fingerprint:{}\r\n", fp)?;
            }
            if let Some(setup) = &m.setup {
                write!(f, "a=setup:{}\r\n", setup.as_attr())?;
            }
            for c in &m.candidates {
                write!(f, "a={}\r\n", c.to_sdp_line())?;
            }
            if m.end_of_candidates {
                write!(f, "a=end-of-candidates\r\n")?;
            }
            for c in &m.crypto {
                write!(f, "a=crypto:{}\r\n", c)?;
            }
            if m.rtcp_mux {
                write!(f, "a=rtcp-mux\r\n")?;
            }
            write!(f, "a={}\r\n", m.direction.as_attr())?;
            if let Some(msid) = &m.msid {
                write!(f, "a=msid:{}\r\n", msid)?;
            }
            for c in &m.codecs {
                match c.channels {
                    Some(ch) => write!(
                        f,
                        "a=rtpmap:{} {}/{}/{}\r\n",
                        c.payload_type, c.name, c.clock_rate, ch
                    )?,
                    None => write!(
                        f,
                        "a=rtpmap:{} {}/{}\r\n",
                        c.payload_type, c.name, c.clock_rate
                    )?,
                }
            }
        }
        Ok(())
    }
}

/// `crypto:` value with a random 30-byte AES_CM_128 master key+salt.
fn crypto_attribute() -> Result<String, getrandom::Error> {
    let key: [u8; 30] = ice::rand_bytes()?;
    Ok(format!(
        "1 AES_CM_128_HMAC_SHA1_80 inline:{}",
        base64::engine::general_purpose::STANDARD.encode(key)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROWSER_OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
a=ice-ufrag:sess\r\n\
a=ice-pwd:sessionpasswordsessionpass\r\n\
a=fingerprint:sha-256 0F:74:31:25:CB:A2:13:EC:28:6F:6D:2C:61:FF:5D:C2:BC:B9:DB:3D:98:14:8D:1A:BB:EA:33:0C:A4:60:A8:8E\r\n\
a=setup:actpass\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=msid:stream-a track-a\r\n\
a=rtcp-mux\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=candidate:1 1 udp 2122260223 192.168.1.10 50000 typ host generation 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 98 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=setup:active\r\n\
a=ice-ufrag:vid0\r\n\
a=ice-pwd:videopasswordvideopasswd\r\n\
a=recvonly\r\n\
a=rtpmap:98 VP9/90000\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=end-of-candidates\r\n";

    #[test]
    fn test_parse_browser_offer() {
        let sdp = parse(BROWSER_OFFER).unwrap();
        assert_eq!(sdp.session_id, 4611731400430051336);
        assert_eq!(sdp.version, 2);
        assert_eq!(sdp.media.len(), 2);

        let audio = &sdp.media[0];
        assert_eq!(audio.kind(), Some(MediaKind::Audio));
        assert_eq!(audio.mid.as_deref(), Some("0"));
        assert_eq!(audio.direction, Direction::SendRecv);
        assert_eq!(audio.codecs.len(), 2);
        assert_eq!(audio.codecs[0].channels, Some(2));
        assert_eq!(audio.candidates.len(), 1);
        assert!(audio.rtcp_mux);
        // Session-level credentials are inherited
        assert_eq!(audio.ice.as_ref().unwrap().ufrag, "sess");

        let video = &sdp.media[1];
        assert_eq!(video.direction, Direction::RecvOnly);
        assert_eq!(video.ice.as_ref().unwrap().ufrag, "vid0");
        assert!(video.end_of_candidates);

        assert_eq!(sdp.bundle, vec!["0", "1"]);
        assert!(audio.uses_dtls());
        assert!(audio.fingerprint.as_deref().unwrap().starts_with("sha-256 0F:74"));
        assert_eq!(audio.setup, Some(Setup::ActPass));
        // Section attributes override the session defaults
        assert_eq!(video.setup, Some(Setup::Active));
        assert_eq!(video.fingerprint, audio.fingerprint);
    }

    #[test]
    fn test_common_codecs_use_offered_payload_types() {
        let sdp = parse(BROWSER_OFFER).unwrap();
        let video = sdp.media[1].common_codecs(MediaKind::Video);
        assert_eq!(video.len(), 1);
        assert_eq!(video[0].name, "VP8");
        assert_eq!(video[0].payload_type, 96);

        let audio = sdp.media[0].common_codecs(MediaKind::Audio);
        assert_eq!(audio.len(), 2);
    }

    #[test]
    fn test_render_and_reparse() {
        let creds = IceCredentials::generate().unwrap();
        let mut sdp = Sdp::new("10.0.0.5".parse().unwrap()).unwrap();
        let mut audio = MediaSection::local(
            MediaKind::Audio,
            "0",
            40000,
            Direction::SendRecv,
            creds.clone(),
            Codec::defaults(MediaKind::Audio),
            Keying::Sdes,
        )
        .unwrap();
        audio.msid = Some("s1 t1".into());
        audio.candidates = ice::gather_host_candidates("10.0.0.5:40000".parse().unwrap());
        sdp.media.push(audio);
        let offered_video = MediaSection::local(
            MediaKind::Video,
            "1",
            40002,
            Direction::SendRecv,
            creds,
            Codec::defaults(MediaKind::Video),
            Keying::Sdes,
        )
        .unwrap();
        sdp.media.push(MediaSection::rejected(&offered_video));

        let text = sdp.to_string();
        assert!(text.contains("m=audio 40000 RTP/SAVPF 111 0\r\n"));
        assert!(text.contains("m=video 0 RTP/SAVPF 96\r\n"));
        assert!(text.contains("a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:"));
        assert!(text.contains("a=rtpmap:111 opus/48000/2\r\n"));

        let back = parse(&text).unwrap();
        assert_eq!(back.media.len(), 2);
        assert_eq!(back.media[0].candidates.len(), 1);
        assert!(back.media[1].is_rejected());
        assert!(!back.media[0].uses_dtls());
        assert!(back.bundle.is_empty());
        assert_eq!(back.section_index(Some("1"), None), Some(1));
        assert_eq!(back.section_index(None, Some(0)), Some(0));
        assert_eq!(back.section_index(Some("x"), Some(7)), None);
    }

    #[test]
    fn test_render_dtls_bundle() {
        let creds = IceCredentials::generate().unwrap();
        let mut sdp = Sdp::new("10.0.0.5".parse().unwrap()).unwrap();
        for (kind, mid) in [(MediaKind::Audio, "0"), (MediaKind::Video, "1")] {
            let keying = Keying::Dtls {
                fingerprint: "sha-256 AA:BB".into(),
                setup: Setup::ActPass,
            };
            sdp.media.push(
                MediaSection::local(kind, mid, 40000, Direction::SendRecv, creds.clone(), Codec::defaults(kind), keying)
                    .unwrap(),
            );
        }
        sdp.bundle = vec!["0".into(), "1".into()];

        let text = sdp.to_string();
        assert!(text.contains("t=0 0\r\na=group:BUNDLE 0 1\r\n"));
        assert!(text.contains("m=video 40000 UDP/TLS/RTP/SAVPF 96\r\n"));
        assert!(text.contains("a=fingerprint:sha-256 AA:BB\r\n"));
        assert!(text.contains("a=setup:actpass\r\n"));
        assert!(!text.contains("a=crypto:"));

        let back = parse(&text).unwrap();
        assert_eq!(back.bundle, sdp.bundle);
        assert!(back.media.iter().all(|m| m.setup == Some(Setup::ActPass)));
    }

    #[test]
    fn test_setup_answer() {
        assert_eq!(Setup::ActPass.answer(), Setup::Active);
        assert_eq!(Setup::Active.answer(), Setup::Passive);
        assert_eq!(Setup::Passive.answer(), Setup::Active);
    }

    #[test]
    fn test_parse_rejects_non_sdp() {
        assert!(parse("").is_err());
        assert!(parse("hello").is_err());
        assert!(parse("v=0\r\nm=audio\r\n").is_err());
        assert!(parse("v=0\r\nm=audio x RTP/AVP 0\r\n").is_err());
    }

    #[test]
    fn test_answer_direction() {
        assert_eq!(Direction::SendRecv.answer(true), Direction::SendRecv);
        assert_eq!(Direction::SendRecv.answer(false), Direction::RecvOnly);
        assert_eq!(Direction::RecvOnly.answer(true), Direction::SendOnly);
        assert_eq!(Direction::SendOnly.answer(false), Direction::RecvOnly);
        assert_eq!(Direction::Inactive.answer(true), Direction::Inactive);
    }
}
