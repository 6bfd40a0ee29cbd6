//! ICE candidate handling: parsing, formatting, priorities and host gathering.
//!
//! Covers the candidate lines exchanged during signaling (RFC 8445, RFC 8839).
//! The checks themselves are STUN transactions (`stun.rs`) run by the peer
//! connection's agent.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{bail, Context, Result};

/// ICE candidate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

/// ICE transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    TcpActive,
    TcpPassive,
    TcpSo,
}

/// A parsed `candidate:` attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u8,
    pub transport: Transport,
    pub priority: u32,
    /// IP literal, or an mDNS `.local` name from browsers.
    pub address: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    /// For srflx/prflx/relay: the related address.
    pub raddr: Option<String>,
    pub rport: Option<u16>,
}

impl IceCandidate {
    /// Format as a `candidate:` attribute value (without the `a=` prefix).
    pub fn to_sdp_line(&self) -> String {
        let (transport_str, tcptype) = match self.transport {
            Transport::Udp => ("UDP", None),
            Transport::TcpActive => ("TCP", Some("active")),
            Transport::TcpPassive => ("TCP", Some("passive")),
            Transport::TcpSo => ("TCP", Some("so")),
        };
        let type_str = match self.candidate_type {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        };
        let mut line = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            transport_str,
            self.priority,
            self.address,
            self.port,
            type_str
        );
        if let (Some(ref ra), Some(rp)) = (&self.raddr, self.rport) {
            line.push_str(&format!(" raddr {} rport {}", ra, rp));
        }
        if let Some(t) = tcptype {
            line.push_str(&format!(" tcptype {}", t));
        }
        line
    }

    /// Socket address, when the address is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

/// ICE credentials (ufrag + pwd).
#[derive(Debug, Clone, PartialEq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn generate() -> Result<Self, getrandom::Error> {
        Ok(Self {
            ufrag: generate_ice_ufrag()?,
            pwd: generate_ice_pwd()?,
        })
    }
}

/// Parse a candidate attribute into an IceCandidate.
///
/// Accepts `a=candidate:...`, `candidate:...` and trailing extension
/// attributes such as `generation 0 ufrag x network-cost 10`.
pub fn parse_candidate(line: &str) -> Result<IceCandidate> {
    let line = line.trim();
    let content = if let Some(rest) = line.strip_prefix("a=candidate:") {
        rest
    } else if let Some(rest) = line.strip_prefix("candidate:") {
        rest
    } else {
        bail!("not a candidate line: {}", line);
    };

    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 8 {
        bail!("candidate line too short: {}", line);
    }

    let foundation = parts[0].to_string();
    let component: u8 = parts[1].parse().context("bad component")?;
    let transport_name = parts[2].to_uppercase();
    let priority: u32 = parts[3].parse().context("bad priority")?;
    let address = parts[4].to_string();
    let port: u16 = parts[5].parse().context("bad port")?;

    if parts[6] != "typ" {
        bail!("expected 'typ' keyword at position 6, got: {}", parts[6]);
    }

    let candidate_type = match parts[7] {
        "host" => CandidateType::Host,
        "srflx" => CandidateType::ServerReflexive,
        "prflx" => CandidateType::PeerReflexive,
        "relay" => CandidateType::Relay,
        other => bail!("unknown candidate type: {}", other),
    };

    let mut raddr = None;
    let mut rport = None;
    let mut tcptype = None;
    let mut i = 8;
    while i < parts.len() {
        match parts[i] {
            "raddr" if i + 1 < parts.len() => {
                raddr = Some(parts[i + 1].to_string());
                i += 2;
            }
            "rport" if i + 1 < parts.len() => {
                rport = Some(parts[i + 1].parse().context("bad rport")?);
                i += 2;
            }
            "tcptype" if i + 1 < parts.len() => {
                tcptype = Some(parts[i + 1]);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let transport = match (transport_name.as_str(), tcptype) {
        ("UDP", _) => Transport::Udp,
        ("TCP", Some("passive")) | ("TCP-PASS", _) => Transport::TcpPassive,
        ("TCP", Some("so")) => Transport::TcpSo,
        ("TCP", _) | ("TCP-ACT", _) => Transport::TcpActive,
        (other, _) => bail!("unsupported transport: {}", other),
    };

    Ok(IceCandidate {
        foundation,
        component,
        transport,
        priority,
        address,
        port,
        candidate_type,
        raddr,
        rport,
    })
}

/// Addresses of the UDP RTP candidates that can be checked directly,
/// highest priority first.
pub fn rank_remote_candidates(candidates: &[IceCandidate]) -> Vec<SocketAddr> {
    let mut udp_rtp: Vec<&IceCandidate> = candidates
        .iter()
        .filter(|c| c.transport == Transport::Udp && c.component == 1)
        .collect();

    udp_rtp.sort_by(|a, b| b.priority.cmp(&a.priority));

    udp_rtp.into_iter().filter_map(|c| c.socket_addr()).collect()
}

/// Host candidates for a bound socket.
///
/// A socket bound to the unspecified address advertises the default outbound
/// interface, falling back to loopback when there is no route.
pub fn gather_host_candidates(local_addr: SocketAddr) -> Vec<IceCandidate> {
    let ip = if local_addr.ip().is_unspecified() {
        local_ip()
    } else {
        local_addr.ip()
    };

    vec![IceCandidate {
        foundation: "1".into(),
        component: 1,
        transport: Transport::Udp,
        priority: compute_priority(CandidateType::Host, 65535, 1),
        address: ip.to_string(),
        port: local_addr.port(),
        candidate_type: CandidateType::Host,
        raddr: None,
        rport: None,
    }]
}

/// Best-effort local IP: the interface the OS would route public traffic
/// through. No packet is sent.
pub fn local_ip() -> IpAddr {
    if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:80").is_ok() {
            if let Ok(addr) = socket.local_addr() {
                return addr.ip();
            }
        }
    }
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Compute ICE candidate priority per RFC 8445 section 5.1.2.1.
pub fn compute_priority(ctype: CandidateType, local_preference: u16, component: u8) -> u32 {
    let type_preference: u32 = match ctype {
        CandidateType::Host => 126,
        CandidateType::PeerReflexive => 110,
        CandidateType::ServerReflexive => 100,
        CandidateType::Relay => 0,
    };
    (type_preference << 24) | ((local_preference as u32) << 8) | (256 - component as u32)
}

/// Random 4-character ICE ufrag.
pub fn generate_ice_ufrag() -> Result<String, getrandom::Error> {
    let bytes: [u8; 2] = rand_bytes()?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Random 24-character ICE password.
///
/// Hex only: ice-chars also allow `+` and `/`, which some parsers reject.
pub fn generate_ice_pwd() -> Result<String, getrandom::Error> {
    let bytes: [u8; 12] = rand_bytes()?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Cryptographically secure random bytes from the OS.
pub fn rand_bytes<const N: usize>() -> Result<[u8; N], getrandom::Error> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_candidate() {
        let line = "a=candidate:1 1 UDP 2130706431 10.0.0.1 21730 typ host";
        let c = parse_candidate(line).unwrap();
        assert_eq!(c.foundation, "1");
        assert_eq!(c.component, 1);
        assert_eq!(c.transport, Transport::Udp);
        assert_eq!(c.priority, 2130706431);
        assert_eq!(c.address, "10.0.0.1");
        assert_eq!(c.port, 21730);
        assert_eq!(c.candidate_type, CandidateType::Host);
        assert!(c.raddr.is_none());
    }

    #[test]
    fn test_parse_browser_candidate() {
        let line = "candidate:842163049 1 udp 1677729535 203.0.113.7 54321 typ srflx \
                    raddr 0.0.0.0 rport 0 generation 0 ufrag Xy7a network-cost 999";
        let c = parse_candidate(line).unwrap();
        assert_eq!(c.candidate_type, CandidateType::ServerReflexive);
        assert_eq!(c.transport, Transport::Udp);
        assert_eq!(c.raddr.as_deref(), Some("0.0.0.0"));
        assert_eq!(c.rport, Some(0));
    }

    #[test]
    fn test_parse_tcp_and_mdns_candidate() {
        let line = "candidate:3 1 tcp 1518280447 4b1f3c.local 9 typ host tcptype active";
        let c = parse_candidate(line).unwrap();
        assert_eq!(c.transport, Transport::TcpActive);
        assert!(c.socket_addr().is_none());
        assert_eq!(
            c.to_sdp_line(),
            "candidate:3 1 TCP 1518280447 4b1f3c.local 9 typ host tcptype active"
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_candidate("").is_err());
        assert!(parse_candidate("candidate:1 1 UDP 1 10.0.0.1").is_err());
        assert!(parse_candidate("candidate:1 1 SCTP 1 10.0.0.1 5000 typ host").is_err());
        assert!(parse_candidate("candidate:1 1 UDP 1 10.0.0.1 5000 type host").is_err());
        assert!(parse_candidate("a=mid:0").is_err());
    }

    #[test]
    fn test_to_sdp_line_parses_back() {
        let c = IceCandidate {
            foundation: "2".into(),
            component: 1,
            transport: Transport::Udp,
            priority: compute_priority(CandidateType::ServerReflexive, 65535, 1),
            address: "198.51.100.4".into(),
            port: 3478,
            candidate_type: CandidateType::ServerReflexive,
            raddr: Some("10.0.0.2".into()),
            rport: Some(50000),
        };
        assert_eq!(parse_candidate(&c.to_sdp_line()).unwrap(), c);
    }

    #[test]
    fn test_rank_remote_candidates() {
        let candidates = vec![
            parse_candidate("candidate:3 1 UDP 184548351 52.114.0.1 27882 typ relay raddr 10.0.0.1 rport 11632").unwrap(),
            parse_candidate("candidate:1 1 UDP 2130706431 10.0.0.1 21730 typ host").unwrap(),
            parse_candidate("candidate:1 2 UDP 2130706430 10.0.0.1 21731 typ host").unwrap(),
            parse_candidate("candidate:2 1 UDP 2130706000 4b1f3c.local 9 typ host").unwrap(),
        ];

        let ranked: Vec<String> = rank_remote_candidates(&candidates)
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(ranked, vec!["10.0.0.1:21730", "52.114.0.1:27882"]);
    }

    #[test]
    fn test_host_priority() {
        assert_eq!(
            compute_priority(CandidateType::Host, 65535, 1),
            (126 << 24) | (65535 << 8) | 255
        );
    }

    #[test]
    fn test_gather_on_bound_address() {
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let c = gather_host_candidates(addr);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].address, "127.0.0.1");
        assert_eq!(c[0].port, 40000);
    }

    #[test]
    fn test_credentials_shape() {
        let creds = IceCredentials::generate().unwrap();
        assert_eq!(creds.ufrag.len(), 4);
        assert_eq!(creds.pwd.len(), 24);
        assert!(creds.pwd.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
