//! RTSP ingest via `retina`. Pulls the stream's first video channel,
//! converts each frame to Annex-B, and prepends the channel's SPS/PPS onto
//! every keyframe the way the reference implementation does, since a
//! WebRTC decoder has no out-of-band parameter-set channel to fall back on.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use retina::client::{Demuxed, Session, SessionOptions, SetupOptions};
use retina::codec::{CodecItem, ParametersRef};
use retina::StreamContext;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Connects to `url`, demuxes the first H264 video stream, and writes
/// Annex-B samples to `track` until `cancel` fires or the connection drops.
/// Callers retry on error (the publisher engine redials on a backoff), so a
/// dropped connection is not itself treated as fatal here.
pub async fn run(
    url: &str,
    track: Arc<TrackLocalStaticSample>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!(url, "dialing rtsp server");
    let creds = None;
    let mut session = Session::describe(
        url.parse()?,
        SessionOptions::default()
            .creds(creds)
            .user_agent("edgecast-relay".to_string()),
    )
    .await?;

    let video_index = session
        .streams()
        .iter()
        .position(|s| s.media() == "video" && s.encoding_name() == "h264")
        .ok_or_else(|| anyhow::anyhow!("rtsp stream has no h264 video channel"))?;

    session
        .setup(video_index, SetupOptions::default())
        .await?;
    let mut demuxed: Demuxed = session.play(retina::client::PlayOptions::default()).await?.demuxed()?;

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = demuxed.next() => match next {
                Some(result) => result?,
                None => return Ok(()),
            },
        };

        let CodecItem::VideoFrame(frame) = item else {
            continue;
        };

        let mut data = Vec::with_capacity(frame.data().len() + 32);
        if frame.is_random_access_point() {
            if let Some(ParametersRef::Video(params)) = frame.stream_parameters() {
                if let Some(extra) = params.extra_data_annex_b() {
                    data.extend_from_slice(&extra);
                }
            }
        }
        annex_b_from_length_prefixed(frame.data(), &mut data);

        let sample = Sample {
            data: data.into(),
            duration: frame.timestamp().elapsed().unwrap_or(Duration::from_millis(33)),
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            if e.to_string().contains("closed") {
                return Ok(());
            }
            warn!("failed to write rtsp sample to track: {e:#}");
        }
    }
}

/// `retina` hands back AVC access units with 4-byte big-endian length
/// prefixes (the RTSP/AVC wire format); WebRTC wants Annex-B start codes.
fn annex_b_from_length_prefixed(data: &[u8], out: &mut Vec<u8>) {
    let mut offset = 0;
    while offset + 4 <= data.len() {
        let len = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        offset += 4;
        if offset + len > data.len() {
            break;
        }
        out.extend_from_slice(&ANNEX_B_START_CODE);
        out.extend_from_slice(&data[offset..offset + len]);
        offset += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_single_length_prefixed_nal() {
        let nal = [0x65, 0x88, 0x80, 0x40];
        let mut input = (nal.len() as u32).to_be_bytes().to_vec();
        input.extend_from_slice(&nal);
        let mut out = Vec::new();
        annex_b_from_length_prefixed(&input, &mut out);
        assert_eq!(out, [ANNEX_B_START_CODE.as_slice(), nal.as_slice()].concat());
    }

    #[test]
    fn converts_multiple_nals_in_sequence() {
        let nal1 = [0x67, 0x4d];
        let nal2 = [0x68, 0xee];
        let mut input = (nal1.len() as u32).to_be_bytes().to_vec();
        input.extend_from_slice(&nal1);
        input.extend_from_slice(&(nal2.len() as u32).to_be_bytes());
        input.extend_from_slice(&nal2);

        let mut out = Vec::new();
        annex_b_from_length_prefixed(&input, &mut out);
        let mut expected = Vec::new();
        expected.extend_from_slice(&ANNEX_B_START_CODE);
        expected.extend_from_slice(&nal1);
        expected.extend_from_slice(&ANNEX_B_START_CODE);
        expected.extend_from_slice(&nal2);
        assert_eq!(out, expected);
    }

    #[test]
    fn truncated_length_prefix_stops_cleanly() {
        let mut out = Vec::new();
        annex_b_from_length_prefixed(&[0, 0, 0, 10, 1, 2], &mut out);
        assert!(out.is_empty());
    }
}
