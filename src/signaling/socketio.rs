//! Socket.IO v5 over Engine.IO v4 text framing.
//!
//! Frame layout (text WebSocket messages):
//! - `0{json}`: Engine.IO OPEN with `sid`, `pingInterval`, `pingTimeout`
//! - `2` / `3`: Engine.IO PING / PONG (server pings, client pongs)
//! - `40{auth}`: Socket.IO CONNECT on the default namespace
//! - `42[ID]["event",payload]`: Socket.IO EVENT, optional ack id
//! - `43ID[...]`: Socket.IO ACK
//! - `44{json}`: Socket.IO CONNECT_ERROR
//!
//! Only the default namespace `/` is used.

use serde::Deserialize;

/// Engine.IO handshake parameters from the OPEN packet.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Connect(Option<serde_json::Value>),
    Disconnect,
    Event {
        name: String,
        data: serde_json::Value,
        ack_id: Option<u64>,
    },
    Ack {
        id: u64,
        data: serde_json::Value,
    },
    ConnectError(serde_json::Value),
    /// Engine.IO NOOP / UPGRADE and anything else we do not act on.
    Other(String),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,
    #[error("bad {what} in frame {frame:?}")]
    Malformed { what: &'static str, frame: String },
}

pub const PONG: &str = "3";

fn malformed(what: &'static str, frame: &str) -> CodecError {
    CodecError::Malformed {
        what,
        frame: frame.chars().take(120).collect(),
    }
}

/// Decode one text frame.
pub fn decode(frame: &str) -> Result<Packet, CodecError> {
    let mut chars = frame.chars();
    let eio = chars.next().ok_or(CodecError::Empty)?;
    let rest = &frame[eio.len_utf8()..];

    match eio {
        '0' => serde_json::from_str(rest)
            .map(Packet::Open)
            .map_err(|_| malformed("open payload", frame)),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => decode_socketio(rest, frame),
        _ => Ok(Packet::Other(frame.to_string())),
    }
}

fn decode_socketio(body: &str, frame: &str) -> Result<Packet, CodecError> {
    let kind = body.chars().next().ok_or_else(|| malformed("socket.io type", frame))?;
    let rest = strip_namespace(&body[kind.len_utf8()..]);

    match kind {
        '0' => {
            if rest.is_empty() {
                Ok(Packet::Connect(None))
            } else {
                serde_json::from_str(rest)
                    .map(|v| Packet::Connect(Some(v)))
                    .map_err(|_| malformed("connect payload", frame))
            }
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let (ack_id, json) = split_ack_id(rest);
            let arr: Vec<serde_json::Value> =
                serde_json::from_str(json).map_err(|_| malformed("event array", frame))?;
            let mut items = arr.into_iter();
            let name = match items.next() {
                Some(serde_json::Value::String(s)) => s,
                _ => return Err(malformed("event name", frame)),
            };
            let data = items.next().unwrap_or(serde_json::Value::Null);
            Ok(Packet::Event { name, data, ack_id })
        }
        '3' => {
            let (ack_id, json) = split_ack_id(rest);
            let id = ack_id.ok_or_else(|| malformed("ack id", frame))?;
            let arr: Vec<serde_json::Value> =
                serde_json::from_str(json).map_err(|_| malformed("ack array", frame))?;
            let data = arr.into_iter().next().unwrap_or(serde_json::Value::Null);
            Ok(Packet::Ack { id, data })
        }
        '4' => {
            let v = serde_json::from_str(rest).unwrap_or(serde_json::Value::String(rest.into()));
            Ok(Packet::ConnectError(v))
        }
        _ => Ok(Packet::Other(frame.to_string())),
    }
}

/// Drop a `/nsp,` prefix if present.
fn strip_namespace(s: &str) -> &str {
    if s.starts_with('/') {
        match s.find(',') {
            Some(pos) => &s[pos + 1..],
            None => "",
        }
    } else {
        s
    }
}

fn split_ack_id(s: &str) -> (Option<u64>, &str) {
    let digits = s.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return (None, s);
    }
    (s[..digits].parse().ok(), &s[digits..])
}

/// `40{auth}`: connect to the default namespace.
pub fn encode_connect(auth: Option<&serde_json::Value>) -> String {
    match auth {
        Some(v) => format!("40{}", v),
        None => "40".to_string(),
    }
}

/// `42["event",payload]`.
pub fn encode_event(name: &str, data: &serde_json::Value) -> Result<String, serde_json::Error> {
    let body = serde_json::to_string(&serde_json::json!([name, data]))?;
    Ok(format!("42{}", body))
}
