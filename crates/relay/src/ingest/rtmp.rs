//! RTMP ingest. No RTMP crate exists in this dependency family, so the
//! chunk stream, handshake and AMF0 command handling below are hand-rolled
//! against the RTMP spec, mirroring the shape (not the code) of the
//! reference server's `go-rtmp`-based handler: a minimal handshake, enough
//! chunk-stream reassembly to recover whole messages, and just the AMF0
//! command sequence (`connect` / `createStream` / `publish`) a standard
//! encoder needs acknowledged before it starts pushing video.
//!
//! The actual FLV video-tag parsing (sequence header vs. NALU, SPS/PPS
//! extraction, keyframe prepending) is pure and unit tested independently
//! of the socket plumbing.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Error)]
pub enum RtmpError {
    #[error("handshake failed: {0}")]
    Handshake(#[source] io::Error),
    #[error("truncated chunk header")]
    TruncatedChunk,
    #[error("truncated video tag body")]
    TruncatedVideoTag,
    #[error("unsupported AVC packet type {0}")]
    UnsupportedAvcPacketType(u8),
    #[error("malformed AVCDecoderConfigurationRecord")]
    MalformedAvcc,
    #[error("empty publishing name")]
    EmptyPublishingName,
    #[error(transparent)]
    Io(#[from] io::Error),
}

const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
const SPS_NAL_TYPE: u8 = 0x07;
const PPS_NAL_TYPE: u8 = 0x08;

/// Incremental H264-over-RTMP-video-tag extractor. Holds the most recently
/// seen SPS/PPS so a keyframe tag that omits them (because the encoder only
/// sent them once, in the AVC sequence header) can still be completed into
/// a self-contained Annex-B access unit.
#[derive(Default)]
pub struct RtmpH264Extractor {
    sps: Vec<u8>,
    pps: Vec<u8>,
}

/// One decoded access unit ready to hand to a `TrackLocalStaticSample`.
pub struct AccessUnit {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

impl RtmpH264Extractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// `payload` is the body of an RTMP video message: frame/codec byte,
    /// AVCPacketType byte, 3-byte composition time, then either an
    /// AVCDecoderConfigurationRecord (sequence header) or a run of
    /// 4-byte-length-prefixed NAL units.
    pub fn process_video_tag(&mut self, payload: &[u8]) -> Result<Option<AccessUnit>, RtmpError> {
        if payload.len() < 5 {
            return Err(RtmpError::TruncatedVideoTag);
        }
        let frame_type = (payload[0] >> 4) & 0x0F;
        let is_keyframe = frame_type == 1;
        let avc_packet_type = payload[1];
        let body = &payload[5..];

        match avc_packet_type {
            0 => {
                self.parse_avc_decoder_configuration_record(body)?;
                Ok(None)
            }
            1 => {
                let (out, has_sps_pps) = self.nalus_to_annex_b(body)?;
                let complete = if is_keyframe && !has_sps_pps {
                    let mut prefixed = Vec::with_capacity(self.sps.len() + self.pps.len() + out.len());
                    prefixed.extend_from_slice(&self.sps);
                    prefixed.extend_from_slice(&self.pps);
                    prefixed.extend_from_slice(&out);
                    prefixed
                } else {
                    out
                };
                Ok(Some(AccessUnit {
                    data: complete,
                    is_keyframe,
                }))
            }
            other => Err(RtmpError::UnsupportedAvcPacketType(other)),
        }
    }

    fn parse_avc_decoder_configuration_record(&mut self, record: &[u8]) -> Result<(), RtmpError> {
        if record.len() < 6 {
            return Err(RtmpError::MalformedAvcc);
        }
        let sps_count = record[5] & 0x1F;
        let mut offset = 6usize;
        self.sps.clear();
        for _ in 0..sps_count {
            let sps_len = read_u16_be(record, offset)? as usize;
            offset += 2;
            let nal = record.get(offset..offset + sps_len).ok_or(RtmpError::MalformedAvcc)?;
            if nal.first().map(|b| b & 0x1F) != Some(SPS_NAL_TYPE) {
                return Err(RtmpError::MalformedAvcc);
            }
            self.sps.extend_from_slice(&ANNEX_B_START_CODE);
            self.sps.extend_from_slice(nal);
            offset += sps_len;
        }
        let pps_count = *record.get(offset).ok_or(RtmpError::MalformedAvcc)?;
        offset += 1;
        self.pps.clear();
        for _ in 0..pps_count {
            let pps_len = read_u16_be(record, offset)? as usize;
            offset += 2;
            let nal = record.get(offset..offset + pps_len).ok_or(RtmpError::MalformedAvcc)?;
            if nal.first().map(|b| b & 0x1F) != Some(PPS_NAL_TYPE) {
                return Err(RtmpError::MalformedAvcc);
            }
            self.pps.extend_from_slice(&ANNEX_B_START_CODE);
            self.pps.extend_from_slice(nal);
            offset += pps_len;
        }
        Ok(())
    }

    /// Converts a run of 4-byte-length-prefixed NAL units into Annex-B,
    /// reporting whether an SPS or PPS NAL was present in this tag itself.
    fn nalus_to_annex_b(&self, data: &[u8]) -> Result<(Vec<u8>, bool), RtmpError> {
        let mut out = Vec::with_capacity(data.len() + 16);
        let mut has_sps_pps = false;
        let mut offset = 0;
        while offset + 4 <= data.len() {
            let len = read_u32_be(data, offset)? as usize;
            offset += 4;
            let nal = data.get(offset..offset + len).ok_or(RtmpError::TruncatedVideoTag)?;
            let nal_type = nal.first().map(|b| b & 0x1F).unwrap_or(0);
            if nal_type == SPS_NAL_TYPE || nal_type == PPS_NAL_TYPE {
                has_sps_pps = true;
            }
            out.extend_from_slice(&ANNEX_B_START_CODE);
            out.extend_from_slice(nal);
            offset += len;
        }
        Ok((out, has_sps_pps))
    }
}

fn read_u16_be(data: &[u8], offset: usize) -> Result<u16, RtmpError> {
    let bytes = data.get(offset..offset + 2).ok_or(RtmpError::MalformedAvcc)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32_be(data: &[u8], offset: usize) -> Result<u32, RtmpError> {
    let bytes = data.get(offset..offset + 4).ok_or(RtmpError::TruncatedVideoTag)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Plain (unencrypted) RTMP handshake: C0+C1 in, S0+S1+S2 out, C2 in. No
/// digest validation — every encoder this relay talks to is expected to be
/// a trusted internal publisher, not a public-internet client.
async fn handshake(stream: &mut TcpStream) -> Result<(), RtmpError> {
    let mut c0c1 = [0u8; 1537];
    stream
        .read_exact(&mut c0c1)
        .await
        .map_err(RtmpError::Handshake)?;

    let mut s0s1s2 = vec![0u8; 1 + 1536 + 1536];
    s0s1s2[0] = 3;
    s0s1s2[1..1537].copy_from_slice(&c0c1[1..1537]);
    s0s1s2[1537..].copy_from_slice(&c0c1[1..1537]);
    stream
        .write_all(&s0s1s2)
        .await
        .map_err(RtmpError::Handshake)?;

    let mut c2 = [0u8; 1536];
    stream
        .read_exact(&mut c2)
        .await
        .map_err(RtmpError::Handshake)?;
    Ok(())
}

/// One reassembled chunk-stream message: (message type id, payload).
struct ChunkMessage {
    type_id: u8,
    payload: Vec<u8>,
}

/// Minimal chunk stream reader: tracks the default chunk size and, per
/// chunk stream id, the last-seen message header (for type 3 continuation
/// chunks) and an in-progress payload buffer.
struct ChunkReader {
    chunk_size: usize,
    partial: std::collections::HashMap<u32, (u8, usize, Vec<u8>)>,
    last_length: std::collections::HashMap<u32, usize>,
    last_type: std::collections::HashMap<u32, u8>,
}

impl ChunkReader {
    fn new() -> Self {
        Self {
            chunk_size: 128,
            partial: std::collections::HashMap::new(),
            last_length: std::collections::HashMap::new(),
            last_type: std::collections::HashMap::new(),
        }
    }

    async fn read_message(&mut self, stream: &mut TcpStream) -> Result<ChunkMessage, RtmpError> {
        loop {
            let basic = stream.read_u8().await?;
            let fmt = (basic & 0xC0) >> 6;
            let csid = match basic & 0x3F {
                0 => 64 + stream.read_u8().await? as u32,
                1 => {
                    let lo = stream.read_u8().await? as u32;
                    let hi = stream.read_u8().await? as u32;
                    64 + lo + hi * 256
                }
                other => other as u32,
            };

            let (message_length, type_id) = match fmt {
                0 => {
                    let mut hdr = [0u8; 11];
                    stream.read_exact(&mut hdr).await?;
                    let length = u32::from_be_bytes([0, hdr[3], hdr[4], hdr[5]]) as usize;
                    let type_id = hdr[6];
                    (length, type_id)
                }
                1 => {
                    let mut hdr = [0u8; 7];
                    stream.read_exact(&mut hdr).await?;
                    let length = u32::from_be_bytes([0, hdr[0], hdr[1], hdr[2]]) as usize;
                    let type_id = hdr[3];
                    (length, type_id)
                }
                2 => {
                    let mut hdr = [0u8; 3];
                    stream.read_exact(&mut hdr).await?;
                    let type_id = *self.last_type.get(&csid).unwrap_or(&0);
                    let length = *self.last_length.get(&csid).unwrap_or(&0);
                    (length, type_id)
                }
                _ => {
                    let type_id = *self.last_type.get(&csid).unwrap_or(&0);
                    let length = *self.last_length.get(&csid).unwrap_or(&0);
                    (length, type_id)
                }
            };
            self.last_length.insert(csid, message_length);
            self.last_type.insert(csid, type_id);

            let entry = self
                .partial
                .entry(csid)
                .or_insert_with(|| (type_id, message_length, Vec::with_capacity(message_length)));
            if entry.2.is_empty() {
                entry.0 = type_id;
                entry.1 = message_length;
            }
            let remaining = entry.1 - entry.2.len();
            let to_read = remaining.min(self.chunk_size);
            let mut buf = vec![0u8; to_read];
            stream.read_exact(&mut buf).await?;
            entry.2.extend_from_slice(&buf);

            if entry.2.len() >= entry.1 {
                let (type_id, _len, payload) = self.partial.remove(&csid).unwrap();
                if type_id == 1 && payload.len() >= 4 {
                    self.chunk_size = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                        as usize;
                    continue;
                }
                return Ok(ChunkMessage { type_id, payload });
            }
        }
    }
}

/// Minimal AMF0 encoder covering just what a `_result`/`onStatus` reply needs.
mod amf0 {
    pub fn number(n: f64) -> Vec<u8> {
        let mut out = vec![0x00];
        out.extend_from_slice(&n.to_be_bytes());
        out
    }

    pub fn string(s: &str) -> Vec<u8> {
        let mut out = vec![0x02];
        out.extend_from_slice(&(s.len() as u16).to_be_bytes());
        out.extend_from_slice(s.as_bytes());
        out
    }

    pub fn null() -> Vec<u8> {
        vec![0x05]
    }

    /// Reads the first AMF0 string value found in `data`, used only to pull
    /// the command name out of a `connect`/`createStream`/`publish` packet.
    pub fn first_string(data: &[u8]) -> Option<String> {
        let mut i = 0;
        while i < data.len() {
            match data[i] {
                0x02 => {
                    let len = u16::from_be_bytes([*data.get(i + 1)?, *data.get(i + 2)?]) as usize;
                    let start = i + 3;
                    let bytes = data.get(start..start + len)?;
                    return std::str::from_utf8(bytes).ok().map(|s| s.to_string());
                }
                0x00 => i += 9,
                0x01 => i += 2,
                0x05 | 0x06 => i += 1,
                _ => return None,
            }
        }
        None
    }

    /// Skips one AMF0 value at `i`, returning the index just past it.
    /// Covers the same subset of the type marker space as `first_string`.
    fn skip_value(data: &[u8], i: usize) -> Option<usize> {
        match *data.get(i)? {
            0x00 => Some(i + 9),
            0x01 => Some(i + 2),
            0x02 => {
                let len = u16::from_be_bytes([*data.get(i + 1)?, *data.get(i + 2)?]) as usize;
                Some(i + 3 + len)
            }
            0x05 | 0x06 => Some(i + 1),
            _ => None,
        }
    }

    /// Recovers the publishing-name argument of a `publish` command: skips
    /// past the command name, transaction id and command object, then reads
    /// the first string value after them.
    pub fn publish_name(data: &[u8]) -> Option<String> {
        let i = skip_value(data, 0)?;
        let i = skip_value(data, i)?;
        let i = skip_value(data, i)?;
        first_string(&data[i..])
    }
}

fn command_message(name: &str, transaction_id: f64, extra: &[u8]) -> Vec<u8> {
    let mut out = amf0::string(name);
    out.extend_from_slice(&amf0::number(transaction_id));
    out.extend_from_slice(&amf0::null());
    out.extend_from_slice(extra);
    out
}

fn write_chunk(csid: u8, type_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00 | (csid & 0x3F)];
    let len = payload.len() as u32;
    out.extend_from_slice(&[0, 0, 0]); // timestamp
    out.extend_from_slice(&len.to_be_bytes()[1..]);
    out.push(type_id);
    out.extend_from_slice(&[0, 0, 0, 0]); // stream id
    out.extend_from_slice(payload);
    out
}

const MSG_TYPE_COMMAND_AMF0: u8 = 20;
const MSG_TYPE_VIDEO: u8 = 9;

async fn handle_connection(
    mut stream: TcpStream,
    track: std::sync::Arc<TrackLocalStaticSample>,
    cancel: CancellationToken,
) -> Result<(), RtmpError> {
    handshake(&mut stream).await?;
    let mut reader = ChunkReader::new();
    let mut extractor = RtmpH264Extractor::new();

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = reader.read_message(&mut stream) => result?,
        };

        match message.type_id {
            MSG_TYPE_COMMAND_AMF0 => {
                if let Some(command) = amf0::first_string(&message.payload) {
                    debug!(command, "rtmp command received");
                    match command.as_str() {
                        "connect" => {
                            let reply = command_message("_result", 1.0, &amf0::string("status"));
                            stream
                                .write_all(&write_chunk(3, MSG_TYPE_COMMAND_AMF0, &reply))
                                .await?;
                        }
                        "createStream" => {
                            let reply = command_message("_result", 1.0, &amf0::number(1.0));
                            stream
                                .write_all(&write_chunk(3, MSG_TYPE_COMMAND_AMF0, &reply))
                                .await?;
                        }
                        "publish" => {
                            let publishing_name = amf0::publish_name(&message.payload).unwrap_or_default();
                            if publishing_name.is_empty() {
                                return Err(RtmpError::EmptyPublishingName);
                            }
                            info!(publishing_name, "rtmp client publishing");
                            let reply = command_message("onStatus", 0.0, &amf0::string("NetStream.Publish.Start"));
                            stream
                                .write_all(&write_chunk(3, MSG_TYPE_COMMAND_AMF0, &reply))
                                .await?;
                        }
                        _ => {}
                    }
                }
            }
            MSG_TYPE_VIDEO => match extractor.process_video_tag(&message.payload) {
                Ok(Some(unit)) => {
                    let sample = Sample {
                        data: unit.data.into(),
                        duration: std::time::Duration::from_secs(1) / 30,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        if e.to_string().contains("closed") {
                            return Ok(());
                        }
                        warn!("failed to write rtmp sample to track: {e:#}");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("rtmp video tag parse error: {e:#}"),
            },
            _ => {}
        }
    }
}

/// Listens for RTMP publishers on `address`, feeding decoded H264 access
/// units into `track` for as long as `cancel` is not triggered. Returns
/// when the listener itself fails to bind; per-connection errors are
/// logged and the listener keeps accepting.
pub async fn run(
    address: &str,
    track: std::sync::Arc<TrackLocalStaticSample>,
    cancel: CancellationToken,
) -> Result<(), RtmpError> {
    let listener = TcpListener::bind(address).await?;
    info!(address, "rtmp ingest listening");
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        debug!(%peer, "rtmp client connected");
        let track = track.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, track, cancel).await {
                warn!("rtmp connection ended: {e:#}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal_with_start_code(nal_type: u8, rest: &[u8]) -> Vec<u8> {
        let mut v = vec![nal_type];
        v.extend_from_slice(rest);
        v
    }

    fn avcc_record(sps: &[u8], pps: &[u8]) -> Vec<u8> {
        let mut record = vec![1, 0x64, 0x00, 0x1f, 0xff, 0xe1];
        record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        record.extend_from_slice(sps);
        record.push(1);
        record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        record.extend_from_slice(pps);
        record
    }

    fn video_tag(frame_type: u8, avc_packet_type: u8, body: &[u8]) -> Vec<u8> {
        let mut tag = vec![(frame_type << 4) | 7, avc_packet_type, 0, 0, 0];
        tag.extend_from_slice(body);
        tag
    }

    #[test]
    fn sequence_header_populates_sps_pps() {
        let sps = nal_with_start_code(SPS_NAL_TYPE, &[0x4d, 0x40, 0x28]);
        let pps = nal_with_start_code(PPS_NAL_TYPE, &[0xee, 0x3c, 0x80]);
        let mut extractor = RtmpH264Extractor::new();
        let tag = video_tag(1, 0, &avcc_record(&sps, &pps));
        let result = extractor.process_video_tag(&tag).unwrap();
        assert!(result.is_none());
        assert!(!extractor.sps.is_empty());
        assert!(!extractor.pps.is_empty());
    }

    #[test]
    fn keyframe_nalu_without_sps_pps_gets_them_prepended() {
        let sps = nal_with_start_code(SPS_NAL_TYPE, &[0x4d, 0x40, 0x28]);
        let pps = nal_with_start_code(PPS_NAL_TYPE, &[0xee, 0x3c, 0x80]);
        let mut extractor = RtmpH264Extractor::new();
        extractor
            .process_video_tag(&video_tag(1, 0, &avcc_record(&sps, &pps)))
            .unwrap();

        let idr = nal_with_start_code(0x05, &[0x88, 0x80, 0x40]);
        let mut nalu_body = (idr.len() as u32).to_be_bytes().to_vec();
        nalu_body.extend_from_slice(&idr);
        let unit = extractor
            .process_video_tag(&video_tag(1, 1, &nalu_body))
            .unwrap()
            .unwrap();

        assert!(unit.is_keyframe);
        assert!(unit.data.starts_with(&ANNEX_B_START_CODE));
        // sps, then pps, then idr, each prefixed with a start code
        assert!(unit.data.windows(idr.len()).any(|w| w == idr.as_slice()));
    }

    #[test]
    fn nalu_tag_carrying_its_own_sps_pps_is_not_doubled_up() {
        let mut extractor = RtmpH264Extractor::new();
        let sps = nal_with_start_code(SPS_NAL_TYPE, &[0x4d]);
        let mut body = (sps.len() as u32).to_be_bytes().to_vec();
        body.extend_from_slice(&sps);
        let unit = extractor
            .process_video_tag(&video_tag(1, 1, &body))
            .unwrap()
            .unwrap();
        assert_eq!(
            unit.data,
            [ANNEX_B_START_CODE.as_slice(), sps.as_slice()].concat()
        );
    }

    #[test]
    fn inter_frame_is_not_marked_keyframe() {
        let mut extractor = RtmpH264Extractor::new();
        let slice = nal_with_start_code(0x01, &[0x9a]);
        let mut body = (slice.len() as u32).to_be_bytes().to_vec();
        body.extend_from_slice(&slice);
        let unit = extractor
            .process_video_tag(&video_tag(2, 1, &body))
            .unwrap()
            .unwrap();
        assert!(!unit.is_keyframe);
    }

    #[test]
    fn truncated_tag_is_rejected() {
        let mut extractor = RtmpH264Extractor::new();
        assert!(matches!(
            extractor.process_video_tag(&[1, 2, 3]),
            Err(RtmpError::TruncatedVideoTag)
        ));
    }

    #[test]
    fn unsupported_packet_type_is_rejected() {
        let mut extractor = RtmpH264Extractor::new();
        assert!(matches!(
            extractor.process_video_tag(&video_tag(1, 9, &[])),
            Err(RtmpError::UnsupportedAvcPacketType(9))
        ));
    }

    #[test]
    fn amf0_first_string_skips_leading_number() {
        let mut data = amf0::number(1.0);
        data.extend_from_slice(&amf0::string("connect"));
        assert_eq!(amf0::first_string(&data), Some("connect".to_string()));
    }
}
