//! Typed signaling messages.
//!
//! Inbound payloads are parsed and validated once, where they leave the
//! transport; everything past this point works with these types.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ice;
use super::MediaKind;
use crate::signaling::{SignalTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// `{type, sdp}` as exchanged by WebRTC peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// `{candidate, sdpMid, sdpMLineIndex}` as exchanged by WebRTC peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

impl CandidateInit {
    /// The empty candidate signals end of candidates.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RingPayload {
    pub conversation_id: String,
    pub from_user_id: String,
    #[serde(default = "default_media")]
    pub media: MediaKind,
}

fn default_media() -> MediaKind {
    MediaKind::Audio
}

/// `call:accepted` / `call:rejected` / `call:ended`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAction {
    pub conversation_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptionPayload {
    pub conversation_id: String,
    pub from_user_id: String,
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub conversation_id: String,
    pub from_user_id: String,
    pub candidate: CandidateInit,
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("unknown signaling event {0}")]
    UnknownEvent(String),
    #[error("malformed {event} payload: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {event} payload: {reason}")]
    Invalid { event: String, reason: String },
}

/// Events the server sends to us.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ring(RingPayload),
    Accepted(PeerAction),
    Rejected(PeerAction),
    Ended(PeerAction),
    Offer(DescriptionPayload),
    Answer(DescriptionPayload),
    Candidate(CandidatePayload),
}

impl Inbound {
    pub const EVENTS: [&'static str; 7] = [
        "call:ring",
        "call:accepted",
        "call:rejected",
        "call:ended",
        "webrtc:offer",
        "webrtc:answer",
        "webrtc:candidate",
    ];

    /// Parse and validate one inbound event.
    pub fn parse(event: &str, payload: &Value) -> Result<Self, SignalError> {
        fn de<T: serde::de::DeserializeOwned>(event: &str, payload: &Value) -> Result<T, SignalError> {
            T::deserialize(payload).map_err(|source| SignalError::Payload {
                event: event.to_string(),
                source,
            })
        }

        let msg = match event {
            "call:ring" => Inbound::Ring(de(event, payload)?),
            "call:accepted" => Inbound::Accepted(de(event, payload)?),
            "call:rejected" => Inbound::Rejected(de(event, payload)?),
            "call:ended" => Inbound::Ended(de(event, payload)?),
            "webrtc:offer" => Inbound::Offer(de(event, payload)?),
            "webrtc:answer" => Inbound::Answer(de(event, payload)?),
            "webrtc:candidate" => Inbound::Candidate(de(event, payload)?),
            other => return Err(SignalError::UnknownEvent(other.to_string())),
        };
        msg.validate(event)?;
        Ok(msg)
    }

    fn validate(&self, event: &str) -> Result<(), SignalError> {
        let invalid = |reason: String| SignalError::Invalid {
            event: event.to_string(),
            reason,
        };

        if self.conversation_id().is_empty() {
            return Err(invalid("empty conversationId".into()));
        }
        match self {
            Inbound::Ring(p) if p.from_user_id.is_empty() => {
                Err(invalid("empty fromUserId".into()))
            }
            Inbound::Offer(p) | Inbound::Answer(p) => {
                let expected = if matches!(self, Inbound::Offer(_)) {
                    SdpType::Offer
                } else {
                    SdpType::Answer
                };
                if p.sdp.kind != expected {
                    return Err(invalid(format!("description type is {:?}", p.sdp.kind)));
                }
                if p.from_user_id.is_empty() {
                    return Err(invalid("empty fromUserId".into()));
                }
                if !p.sdp.sdp.trim_start().starts_with("v=0") {
                    return Err(invalid("sdp is not a session description".into()));
                }
                Ok(())
            }
            Inbound::Candidate(p) => {
                if p.from_user_id.is_empty() {
                    return Err(invalid("empty fromUserId".into()));
                }
                if p.candidate.is_end_of_candidates() {
                    return Ok(());
                }
                ice::parse_candidate(&p.candidate.candidate)
                    .map(|_| ())
                    .map_err(|e| invalid(format!("{:#}", e)))
            }
            _ => Ok(()),
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            Inbound::Ring(p) => &p.conversation_id,
            Inbound::Accepted(p) | Inbound::Rejected(p) | Inbound::Ended(p) => &p.conversation_id,
            Inbound::Offer(p) | Inbound::Answer(p) => &p.conversation_id,
            Inbound::Candidate(p) => &p.conversation_id,
        }
    }
}

/// Events we send to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Invite {
        conversation_id: String,
        media: MediaKind,
    },
    Accept {
        conversation_id: String,
    },
    Reject {
        conversation_id: String,
    },
    End {
        conversation_id: String,
    },
    Offer {
        conversation_id: String,
        to_user_id: String,
        sdp: SessionDescription,
    },
    Answer {
        conversation_id: String,
        to_user_id: String,
        sdp: SessionDescription,
    },
    Candidate {
        conversation_id: String,
        to_user_id: String,
        candidate: CandidateInit,
    },
}

impl Outbound {
    pub fn event(&self) -> &'static str {
        match self {
            Outbound::Invite { .. } => "call:invite",
            Outbound::Accept { .. } => "call:accept",
            Outbound::Reject { .. } => "call:reject",
            Outbound::End { .. } => "call:end",
            Outbound::Offer { .. } => "webrtc:offer",
            Outbound::Answer { .. } => "webrtc:answer",
            Outbound::Candidate { .. } => "webrtc:candidate",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Outbound::Invite {
                conversation_id,
                media,
            } => json!({"conversationId": conversation_id, "media": media}),
            Outbound::Accept { conversation_id }
            | Outbound::Reject { conversation_id }
            | Outbound::End { conversation_id } => json!({"conversationId": conversation_id}),
            Outbound::Offer {
                conversation_id,
                to_user_id,
                sdp,
            }
            | Outbound::Answer {
                conversation_id,
                to_user_id,
                sdp,
            } => json!({"conversationId": conversation_id, "toUserId": to_user_id, "sdp": sdp}),
            Outbound::Candidate {
                conversation_id,
                to_user_id,
                candidate,
            } => json!({
                "conversationId": conversation_id,
                "toUserId": to_user_id,
                "candidate": candidate,
            }),
        }
    }

    /// Emit on `transport`. At most once; a failure means the peer never
    /// saw it.
    pub fn send(&self, transport: &dyn SignalTransport) -> Result<(), TransportError> {
        transport.emit(self.event(), self.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ring() {
        let msg = Inbound::parse(
            "call:ring",
            &json!({"conversationId": "c1", "fromUserId": "u2", "media": "video"}),
        )
        .unwrap();
        assert_eq!(
            msg,
            Inbound::Ring(RingPayload {
                conversation_id: "c1".into(),
                from_user_id: "u2".into(),
                media: MediaKind::Video,
            })
        );
    }

    #[test]
    fn test_ring_media_defaults_to_audio() {
        match Inbound::parse("call:ring", &json!({"conversationId": "c1", "fromUserId": "u2"}))
            .unwrap()
        {
            Inbound::Ring(p) => assert_eq!(p.media, MediaKind::Audio),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_candidate_payload() {
        let msg = Inbound::parse(
            "webrtc:candidate",
            &json!({
                "conversationId": "c1",
                "fromUserId": "u2",
                "candidate": {
                    "candidate": "candidate:1 1 udp 2122260223 192.168.1.10 50000 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                }
            }),
        )
        .unwrap();
        match msg {
            Inbound::Candidate(p) => {
                assert_eq!(p.candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(p.candidate.sdp_m_line_index, Some(0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_end_of_candidates_is_valid() {
        let msg = Inbound::parse(
            "webrtc:candidate",
            &json!({"conversationId": "c1", "fromUserId": "u2", "candidate": {"candidate": ""}}),
        )
        .unwrap();
        match msg {
            Inbound::Candidate(p) => assert!(p.candidate.is_end_of_candidates()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        assert!(matches!(
            Inbound::parse("call:ring", &json!({"conversationId": "c1"})),
            Err(SignalError::Payload { .. })
        ));
        assert!(matches!(
            Inbound::parse("call:ended", &json!({"conversationId": ""})),
            Err(SignalError::Invalid { .. })
        ));
        assert!(matches!(
            Inbound::parse(
                "webrtc:offer",
                &json!({"conversationId": "c1", "fromUserId": "u2", "sdp": {"type": "answer", "sdp": "v=0"}})
            ),
            Err(SignalError::Invalid { .. })
        ));
        assert!(matches!(
            Inbound::parse(
                "webrtc:answer",
                &json!({"conversationId": "c1", "fromUserId": "u2", "sdp": {"type": "answer", "sdp": "hello"}})
            ),
            Err(SignalError::Invalid { .. })
        ));
        assert!(matches!(
            Inbound::parse(
                "webrtc:candidate",
                &json!({"conversationId": "c1", "fromUserId": "u2", "candidate": {"candidate": "bogus"}})
            ),
            Err(SignalError::Invalid { .. })
        ));
        assert!(matches!(
            Inbound::parse("call:nope", &json!({})),
            Err(SignalError::UnknownEvent(_))
        ));
    }

    #[test]
    fn test_outbound_wire_shape() {
        let offer = Outbound::Offer {
            conversation_id: "c1".into(),
            to_user_id: "u2".into(),
            sdp: SessionDescription::offer("v=0\r\n"),
        };
        assert_eq!(offer.event(), "webrtc:offer");
        assert_eq!(
            offer.payload(),
            json!({"conversationId": "c1", "toUserId": "u2", "sdp": {"type": "offer", "sdp": "v=0\r\n"}})
        );

        let cand = Outbound::Candidate {
            conversation_id: "c1".into(),
            to_user_id: "u2".into(),
            candidate: CandidateInit {
                candidate: "candidate:1 1 UDP 1 10.0.0.1 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            },
        };
        assert_eq!(cand.payload()["candidate"]["sdpMLineIndex"], 0);

        let invite = Outbound::Invite {
            conversation_id: "c1".into(),
            media: MediaKind::Video,
        };
        assert_eq!(invite.payload(), json!({"conversationId": "c1", "media": "video"}));
    }
}
