//! STUN Binding messages for ICE connectivity checks (RFC 5389, RFC 8445).
//!
//! Only what a checking agent needs: Binding requests carrying USERNAME,
//! PRIORITY and the role attributes, Binding success responses with an
//! XOR-MAPPED-ADDRESS, and MESSAGE-INTEGRITY / FINGERPRINT on both.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::ice::rand_bytes;

type HmacSha1 = Hmac<Sha1>;

const MAGIC_COOKIE: u32 = 0x2112A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_PRIORITY: u16 = 0x0024;
const ATTR_USE_CANDIDATE: u16 = 0x0025;
const ATTR_FINGERPRINT: u16 = 0x8028;
const ATTR_ICE_CONTROLLED: u16 = 0x8029;
const ATTR_ICE_CONTROLLING: u16 = 0x802A;

const HEADER_SIZE: usize = 20;
const INTEGRITY_ATTR_SIZE: usize = 24;
const FINGERPRINT_ATTR_SIZE: usize = 8;

const FINGERPRINT_XOR: u32 = 0x5354554e;

pub type TransactionId = [u8; 12];

/// CRC-32 lookup table (IEEE polynomial 0xEDB88320, reflected).
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFFFFFFu32;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[idx];
    }
    crc ^ 0xFFFFFFFF
}

pub fn transaction_id() -> Result<TransactionId, getrandom::Error> {
    rand_bytes()
}

/// What goes into a connectivity check besides the transaction id.
#[derive(Debug, Clone)]
pub struct BindingRequest<'a> {
    /// `{remote_ufrag}:{local_ufrag}`.
    pub username: &'a str,
    pub priority: u32,
    pub controlling: bool,
    pub tie_breaker: u64,
}

/// Build a Binding request signed with `key` (the remote ICE password).
///
/// The controlling side nominates every pair it checks (aggressive
/// nomination), so its requests carry USE-CANDIDATE.
pub fn binding_request(tid: &TransactionId, request: &BindingRequest<'_>, key: &[u8]) -> Vec<u8> {
    let mut buf = header(BINDING_REQUEST, tid);
    append_attr(&mut buf, ATTR_USERNAME, request.username.as_bytes());
    append_attr(&mut buf, ATTR_PRIORITY, &request.priority.to_be_bytes());
    if request.controlling {
        append_attr(&mut buf, ATTR_ICE_CONTROLLING, &request.tie_breaker.to_be_bytes());
        append_attr(&mut buf, ATTR_USE_CANDIDATE, &[]);
    } else {
        append_attr(&mut buf, ATTR_ICE_CONTROLLED, &request.tie_breaker.to_be_bytes());
    }
    seal(buf, key)
}

/// Build a Binding success response reporting `mapped` back to the sender,
/// signed with `key` (our own ICE password).
pub fn binding_success(tid: &TransactionId, mapped: SocketAddr, key: &[u8]) -> Vec<u8> {
    let mut buf = header(BINDING_RESPONSE, tid);
    append_attr(&mut buf, ATTR_XOR_MAPPED_ADDRESS, &encode_xor_mapped_address(mapped, tid));
    seal(buf, key)
}

fn header(message_type: u16, tid: &TransactionId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(&message_type.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(tid);
    buf
}

/// Append MESSAGE-INTEGRITY then FINGERPRINT. The header length must already
/// count each attribute when it is computed.
fn seal(mut buf: Vec<u8>, key: &[u8]) -> Vec<u8> {
    let len = buf.len() - HEADER_SIZE + INTEGRITY_ATTR_SIZE;
    set_length(&mut buf, len);
    let digest = integrity(&buf, key);
    append_attr(&mut buf, ATTR_MESSAGE_INTEGRITY, &digest);

    let len = buf.len() - HEADER_SIZE + FINGERPRINT_ATTR_SIZE;
    set_length(&mut buf, len);
    let fingerprint = crc32(&buf) ^ FINGERPRINT_XOR;
    append_attr(&mut buf, ATTR_FINGERPRINT, &fingerprint.to_be_bytes());
    buf
}

fn integrity(data: &[u8], key: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    // HMAC accepts keys of any length.
    if let Ok(mut mac) = HmacSha1::new_from_slice(key) {
        mac.update(data);
        out.copy_from_slice(&mac.finalize().into_bytes());
    }
    out
}

fn set_length(buf: &mut [u8], len: usize) {
    buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
}

fn append_attr(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    buf.extend_from_slice(&attr_type.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
    let pad = (4 - (value.len() % 4)) % 4;
    buf.extend(std::iter::repeat(0).take(pad));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Request,
    Success,
    Other,
}

/// A received STUN message, borrowed from the datagram.
#[derive(Debug)]
pub struct Message<'a> {
    data: &'a [u8],
}

impl<'a> Message<'a> {
    /// Accepts well-formed STUN only. A FINGERPRINT that does not match
    /// rejects the datagram, so media that happens to look like a STUN
    /// header is not mistaken for a check.
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE || data[0] & 0xC0 != 0 {
            return None;
        }
        if u32::from_be_bytes([data[4], data[5], data[6], data[7]]) != MAGIC_COOKIE {
            return None;
        }
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if len % 4 != 0 || HEADER_SIZE + len != data.len() {
            return None;
        }
        let message = Self { data };
        if let Some((pos, value)) = message.attribute(ATTR_FINGERPRINT) {
            let expected = crc32(&data[..pos]) ^ FINGERPRINT_XOR;
            if value != expected.to_be_bytes() {
                return None;
            }
        }
        Some(message)
    }

    pub fn class(&self) -> Class {
        match u16::from_be_bytes([self.data[0], self.data[1]]) {
            BINDING_REQUEST => Class::Request,
            BINDING_RESPONSE => Class::Success,
            _ => Class::Other,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        let mut tid = [0u8; 12];
        tid.copy_from_slice(&self.data[8..HEADER_SIZE]);
        tid
    }

    pub fn username(&self) -> Option<&'a str> {
        self.attribute(ATTR_USERNAME)
            .and_then(|(_, value)| std::str::from_utf8(value).ok())
    }

    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.attribute(ATTR_XOR_MAPPED_ADDRESS)
            .and_then(|(_, value)| decode_xor_mapped_address(value, &self.transaction_id()))
    }

    /// Check MESSAGE-INTEGRITY against `key`. A message without one fails.
    pub fn verify_integrity(&self, key: &[u8]) -> bool {
        let Some((pos, received)) = self.attribute(ATTR_MESSAGE_INTEGRITY) else {
            return false;
        };
        if received.len() != 20 {
            return false;
        }
        let mut signed = self.data[..pos].to_vec();
        set_length(&mut signed, pos - HEADER_SIZE + INTEGRITY_ATTR_SIZE);
        match HmacSha1::new_from_slice(key) {
            Ok(mut mac) => {
                mac.update(&signed);
                mac.verify_slice(received).is_ok()
            }
            Err(_) => false,
        }
    }

    /// First attribute of `wanted` type: its offset and value.
    fn attribute(&self, wanted: u16) -> Option<(usize, &'a [u8])> {
        let data = self.data;
        let mut pos = HEADER_SIZE;
        while pos + 4 <= data.len() {
            let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            let start = pos + 4;
            let end = start + attr_len;
            if end > data.len() {
                return None;
            }
            if attr_type == wanted {
                return Some((pos, &data[start..end]));
            }
            pos = start + ((attr_len + 3) & !3);
        }
        None
    }
}

fn encode_xor_mapped_address(addr: SocketAddr, tid: &TransactionId) -> Vec<u8> {
    let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let mut value = vec![0];
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(0x01);
            value.extend_from_slice(&xport.to_be_bytes());
            let cookie = MAGIC_COOKIE.to_be_bytes();
            value.extend(ip.octets().iter().zip(cookie).map(|(b, k)| b ^ k));
        }
        IpAddr::V6(ip) => {
            value.push(0x02);
            value.extend_from_slice(&xport.to_be_bytes());
            let key = ipv6_xor_key(tid);
            value.extend(ip.octets().iter().zip(key).map(|(b, k)| b ^ k));
        }
    }
    value
}

fn decode_xor_mapped_address(value: &[u8], tid: &TransactionId) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    match value[1] {
        0x01 if value.len() >= 8 => {
            let c = MAGIC_COOKIE.to_be_bytes();
            let ip = Ipv4Addr::new(
                value[4] ^ c[0],
                value[5] ^ c[1],
                value[6] ^ c[2],
                value[7] ^ c[3],
            );
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x02 if value.len() >= 20 => {
            let key = ipv6_xor_key(tid);
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ key[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn ipv6_xor_key(tid: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(tid);
    key
}
