//! Binary signalling envelope carried over the pub/sub bus.
//!
//! Three message shapes, all protobuf-tag-compatible TLV: field 1 and field
//! 2 only, length-delimited strings/nested-messages, varint integers.
//! `SessionDescription{1:meta, 2:sdp}`, `IceCandidate{1:meta, 2:candidate}`,
//! `Meta{1:id, 2:track_source}`. The `sdp`/`candidate` payloads are
//! themselves JSON strings so any standards-compliant WebRTC stack can
//! re-parse them independent of this crate.

use crate::meta::{Meta, TrackSource};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("truncated varint")]
    TruncatedVarint,
    #[error("varint overflows u64")]
    VarintOverflow,
    #[error("truncated length-delimited field")]
    TruncatedField,
    #[error("field {0} is not valid utf-8")]
    InvalidUtf8(u32),
    #[error("unsupported wire type {0} for field {1}")]
    UnsupportedWireType(u8, u32),
}

const WIRE_VARINT: u8 = 0;
const WIRE_LEN_DELIMITED: u8 = 2;

fn write_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, EnvelopeError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos).ok_or(EnvelopeError::TruncatedVarint)?;
        *pos += 1;
        if shift >= 64 {
            return Err(EnvelopeError::VarintOverflow);
        }
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(result)
}

fn write_tag(buf: &mut Vec<u8>, field: u32, wire_type: u8) {
    write_varint(buf, ((field as u64) << 3) | (wire_type as u64));
}

fn read_tag(buf: &[u8], pos: &mut usize) -> Result<(u32, u8), EnvelopeError> {
    let tag = read_varint(buf, pos)?;
    Ok(((tag >> 3) as u32, (tag & 0x7) as u8))
}

fn write_bytes_field(buf: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    write_tag(buf, field, WIRE_LEN_DELIMITED);
    write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn read_len_delimited<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8], EnvelopeError> {
    let len = read_varint(buf, pos)? as usize;
    let end = pos.checked_add(len).ok_or(EnvelopeError::TruncatedField)?;
    let slice = buf.get(*pos..end).ok_or(EnvelopeError::TruncatedField)?;
    *pos = end;
    Ok(slice)
}

/// Skip a field this decoder doesn't recognise, honouring its wire type.
fn skip_field(buf: &[u8], pos: &mut usize, wire_type: u8, field: u32) -> Result<(), EnvelopeError> {
    match wire_type {
        WIRE_VARINT => {
            read_varint(buf, pos)?;
        }
        WIRE_LEN_DELIMITED => {
            read_len_delimited(buf, pos)?;
        }
        other => return Err(EnvelopeError::UnsupportedWireType(other, field)),
    }
    Ok(())
}

fn encode_meta(meta: &Meta) -> Vec<u8> {
    let mut buf = Vec::with_capacity(meta.id.len() + 4);
    write_bytes_field(&mut buf, 1, meta.id.as_bytes());
    write_tag(&mut buf, 2, WIRE_VARINT);
    write_varint(&mut buf, meta.track_source.wire());
    buf
}

fn decode_meta(bytes: &[u8]) -> Result<Meta, EnvelopeError> {
    let mut id = String::new();
    let mut track_source = TrackSource::Unknown;
    let mut pos = 0;
    while pos < bytes.len() {
        let (field, wire_type) = read_tag(bytes, &mut pos)?;
        match (field, wire_type) {
            (1, WIRE_LEN_DELIMITED) => {
                let slice = read_len_delimited(bytes, &mut pos)?;
                id = std::str::from_utf8(slice)
                    .map_err(|_| EnvelopeError::InvalidUtf8(1))?
                    .to_string();
            }
            (2, WIRE_VARINT) => {
                track_source = TrackSource::from_wire(read_varint(bytes, &mut pos)?);
            }
            (f, wt) => skip_field(bytes, &mut pos, wt, f)?,
        }
    }
    Ok(Meta { id, track_source })
}

/// `{"type": "offer"|"answer", "sdp": "..."}` — the SDP payload as
/// transmitted inside the `sdp` wire field. Kept as an opaque string here;
/// the WebRTC stack owns the real `RTCSessionDescription` type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub meta: Option<Meta>,
    /// JSON-encoded `{type, sdp}`.
    pub sdp_json: String,
}

impl SessionDescription {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(meta) = &self.meta {
            write_bytes_field(&mut buf, 1, &encode_meta(meta));
        }
        write_bytes_field(&mut buf, 2, self.sdp_json.as_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut meta = None;
        let mut sdp_json = String::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let (field, wire_type) = read_tag(bytes, &mut pos)?;
            match (field, wire_type) {
                (1, WIRE_LEN_DELIMITED) => {
                    let slice = read_len_delimited(bytes, &mut pos)?;
                    meta = Some(decode_meta(slice)?);
                }
                (2, WIRE_LEN_DELIMITED) => {
                    let slice = read_len_delimited(bytes, &mut pos)?;
                    sdp_json = std::str::from_utf8(slice)
                        .map_err(|_| EnvelopeError::InvalidUtf8(2))?
                        .to_string();
                }
                (f, wt) => skip_field(bytes, &mut pos, wt, f)?,
            }
        }
        Ok(Self { meta, sdp_json })
    }
}

/// `candidate` carries the full `RTCIceCandidateInit` JSON
/// (`{candidate, sdpMid, sdpMLineIndex}`), itself JSON-encoded into this
/// string field — deliberately double-encoded so the wire shape matches
/// what downstream, non-Rust receivers already expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub meta: Option<Meta>,
    pub candidate_json: String,
}

impl IceCandidate {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(meta) = &self.meta {
            write_bytes_field(&mut buf, 1, &encode_meta(meta));
        }
        write_bytes_field(&mut buf, 2, self.candidate_json.as_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut meta = None;
        let mut candidate_json = String::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let (field, wire_type) = read_tag(bytes, &mut pos)?;
            match (field, wire_type) {
                (1, WIRE_LEN_DELIMITED) => {
                    let slice = read_len_delimited(bytes, &mut pos)?;
                    meta = Some(decode_meta(slice)?);
                }
                (2, WIRE_LEN_DELIMITED) => {
                    let slice = read_len_delimited(bytes, &mut pos)?;
                    candidate_json = std::str::from_utf8(slice)
                        .map_err(|_| EnvelopeError::InvalidUtf8(2))?
                        .to_string();
                }
                (f, wt) => skip_field(bytes, &mut pos, wt, f)?,
            }
        }
        Ok(Self {
            meta,
            candidate_json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> Meta {
        Meta::new("edge-7", TrackSource::Drone)
    }

    #[test]
    fn session_description_round_trip_with_meta() {
        let original = SessionDescription {
            meta: Some(sample_meta()),
            sdp_json: r#"{"type":"offer","sdp":"v=0\r\n..."}"#.to_string(),
        };
        let decoded = SessionDescription::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn session_description_round_trip_without_meta() {
        let original = SessionDescription {
            meta: None,
            sdp_json: r#"{"type":"answer","sdp":"v=0\r\n..."}"#.to_string(),
        };
        let decoded = SessionDescription::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
        assert!(decoded.meta.is_none());
    }

    #[test]
    fn ice_candidate_round_trip() {
        let original = IceCandidate {
            meta: Some(sample_meta()),
            candidate_json: r#"{"candidate":"candidate:1 1 UDP 2130706431 10.0.0.1 50000 typ host","sdpMid":"0","sdpMLineIndex":0}"#.to_string(),
        };
        let decoded = IceCandidate::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn meta_field_order_is_tolerant() {
        // Hand-build an envelope with field 2 before field 1.
        let mut buf = Vec::new();
        write_tag(&mut buf, 2, WIRE_LEN_DELIMITED);
        write_varint(&mut buf, 5);
        buf.extend_from_slice(b"hello");
        write_bytes_field(&mut buf, 1, &encode_meta(&sample_meta()));
        let decoded = SessionDescription::decode(&buf).unwrap();
        assert_eq!(decoded.sdp_json, "hello");
        assert_eq!(decoded.meta, Some(sample_meta()));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut buf = Vec::new();
        write_tag(&mut buf, 2, WIRE_LEN_DELIMITED);
        write_varint(&mut buf, 10); // claims 10 bytes, supplies none
        assert!(SessionDescription::decode(&buf).is_err());
    }

    #[test]
    fn unknown_field_is_skipped() {
        let mut buf = Vec::new();
        write_tag(&mut buf, 5, WIRE_VARINT);
        write_varint(&mut buf, 42);
        write_bytes_field(&mut buf, 2, b"{}");
        let decoded = SessionDescription::decode(&buf).unwrap();
        assert_eq!(decoded.sdp_json, "{}");
    }

    #[test]
    fn track_source_varint_matches_reference_wire_values() {
        let meta = Meta::new("x", TrackSource::Monitor);
        let encoded = encode_meta(&meta);
        // field 2, wire type 0 (varint) => tag byte 0x10, value 2
        assert!(encoded.ends_with(&[0x10, 0x02]));
    }
}
