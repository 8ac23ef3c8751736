//! JSON envelope for the browser-facing WebSocket surface at
//! `/v1/broadcast/signal`. Message shape: `{event, id?, data}`, where `id`
//! is an opaque client-supplied correlation string echoed back in replies
//! and `data` is event-specific.

use crate::meta::TrackSource;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WsEvent {
    VideoOffer,
    VideoAnswer,
    NewIceCandidate,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope {
    pub event: WsEvent,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetaPayload {
    pub id: String,
    pub track_source: TrackSource,
}

/// `video-offer` / `video-answer` data: a `SessionDescription`, with the SDP
/// body itself a nested `{type, sdp}` JSON object (not double-encoded —
/// only ICE candidates carry the double-encoding quirk, see
/// [`IceCandidatePayload`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpPayload {
    pub meta: MetaPayload,
    pub sdp: serde_json::Value,
}

/// `new-ice-candidate` data. `candidate` is a **JSON-encoded string**
/// holding the `RTCIceCandidateInit` object (`{candidate, sdpMid,
/// sdpMLineIndex}`) — double-encoded on purpose so this wire shape matches
/// what existing non-Rust subscribers already parse (`JSON.parse` twice).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub meta: MetaPayload,
    pub candidate: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ErrReadMessage,
    ErrUnmarshalJson,
    ErrIncorrectMetadata,
    ErrMetadataNotMatched,
    ErrFailedToCreateSubscriber,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub meta: Option<MetaPayload>,
    pub code: ErrorCode,
    pub message: String,
}

impl WsEnvelope {
    pub fn video_answer(id: Option<String>, payload: &SdpPayload) -> Self {
        Self {
            event: WsEvent::VideoAnswer,
            id,
            data: serde_json::to_value(payload).expect("SdpPayload always serializes"),
        }
    }

    pub fn new_ice_candidate(id: Option<String>, payload: &IceCandidatePayload) -> Self {
        Self {
            event: WsEvent::NewIceCandidate,
            id,
            data: serde_json::to_value(payload).expect("IceCandidatePayload always serializes"),
        }
    }

    pub fn error(id: Option<String>, payload: &ErrorPayload) -> Self {
        Self {
            event: WsEvent::Error,
            id,
            data: serde_json::to_value(payload).expect("ErrorPayload always serializes"),
        }
    }

    pub fn parse_sdp_payload(&self) -> serde_json::Result<SdpPayload> {
        serde_json::from_value(self.data.clone())
    }

    pub fn parse_ice_candidate_payload(&self) -> serde_json::Result<IceCandidatePayload> {
        serde_json::from_value(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_offer_envelope_round_trips() {
        let payload = SdpPayload {
            meta: MetaPayload {
                id: "edge-1".to_string(),
                track_source: TrackSource::Drone,
            },
            sdp: serde_json::json!({"type": "offer", "sdp": "v=0\r\n..."}),
        };
        let envelope = WsEnvelope {
            event: WsEvent::VideoOffer,
            id: Some("corr-1".to_string()),
            data: serde_json::to_value(&payload).unwrap(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""event":"video-offer""#));
        let parsed: WsEnvelope = serde_json::from_str(&json).unwrap();
        let parsed_payload = parsed.parse_sdp_payload().unwrap();
        assert_eq!(parsed_payload.meta.id, "edge-1");
    }

    #[test]
    fn ice_candidate_payload_is_double_encoded() {
        let inner = serde_json::json!({
            "candidate": "candidate:1 1 UDP 2130706431 10.0.0.1 50000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        });
        let payload = IceCandidatePayload {
            meta: MetaPayload {
                id: "edge-1".to_string(),
                track_source: TrackSource::Monitor,
            },
            candidate: inner.to_string(),
        };
        let envelope = WsEnvelope::new_ice_candidate(None, &payload);
        let json = serde_json::to_string(&envelope).unwrap();
        // `candidate` must serialize as a JSON *string*, not a nested object.
        assert!(json.contains(r#""candidate":"{"#));
        let parsed: WsEnvelope = serde_json::from_str(&json).unwrap();
        let parsed_payload = parsed.parse_ice_candidate_payload().unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&parsed_payload.candidate).unwrap();
        assert_eq!(reparsed["sdpMid"], "0");
    }

    #[test]
    fn error_envelope_without_meta() {
        let payload = ErrorPayload {
            meta: None,
            code: ErrorCode::ErrIncorrectMetadata,
            message: "meta.id must not be empty".to_string(),
        };
        let envelope = WsEnvelope::error(Some("corr-2".to_string()), &payload);
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""code":"err_incorrect_metadata""#));
        assert!(!json.contains("\"meta\""));
    }

    #[test]
    fn unknown_event_is_rejected() {
        let json = r#"{"event":"bogus","data":{}}"#;
        assert!(serde_json::from_str::<WsEnvelope>(json).is_err());
    }
}
