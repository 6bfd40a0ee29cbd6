//! DTLS identity advertised in session descriptions.
//!
//! Browsers refuse a `UDP/TLS/RTP/SAVPF` section without `a=fingerprint`, so
//! every peer carries a self-signed certificate and publishes its SHA-256
//! fingerprint (RFC 8122).

use sha2::{Digest, Sha256};

use super::error::PeerError;

const CERT_SUBJECT: &str = "weconnect-call";

#[derive(Debug, Clone)]
pub struct DtlsIdentity {
    fingerprint: String,
}

impl DtlsIdentity {
    pub fn generate() -> Result<Self, PeerError> {
        let cert = rcgen::generate_simple_self_signed(vec![CERT_SUBJECT.to_string()])
            .map_err(|e| PeerError::Certificate(e.to_string()))?;
        let der = cert
            .serialize_der()
            .map_err(|e| PeerError::Certificate(e.to_string()))?;
        Ok(Self {
            fingerprint: fingerprint_of(&der),
        })
    }

    /// `a=fingerprint` value: `sha-256 AB:CD:...`.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

pub fn fingerprint_of(der: &[u8]) -> String {
    let hex: Vec<String> = Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect();
    format!("sha-256 {}", hex.join(":"))
}
