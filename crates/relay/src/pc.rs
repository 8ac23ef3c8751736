//! Peer-connection orchestration shared by all three PC roles (cloud
//! publisher, cloud subscriber, edge publisher): trickle-ICE buffering and
//! idempotent teardown. None of this ever waits on a gathering-complete
//! promise — candidates are always trickled.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use edgecast_protocol::IceConfig;
use webrtc::api::API;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

/// A `webrtc-rs` API instance registered for H264-only negotiation. Every
/// PC role (cloud publisher, cloud subscriber, edge publisher) shares this
/// construction rather than pulling in the default codec set, since this
/// relay only ever carries one codec end to end.
pub fn build_api() -> anyhow::Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                    .to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 102,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn ice_servers(config: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !config.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.stun_urls.clone(),
            ..Default::default()
        });
    }
    if let Some(turn_url) = &config.turn_url {
        servers.push(RTCIceServer {
            urls: vec![turn_url.clone()],
            username: config.turn_username.clone().unwrap_or_default(),
            credential: config.turn_credential.clone().unwrap_or_default(),
            ..Default::default()
        });
    }
    servers
}

/// Creates a new PC against `api` configured with this relay's ICE servers.
pub async fn new_peer_connection(
    api: &API,
    ice: &IceConfig,
) -> anyhow::Result<RTCPeerConnection> {
    let config = RTCConfiguration {
        ice_servers: ice_servers(ice),
        ..Default::default()
    };
    api.new_peer_connection(config)
        .await
        .context("failed to create peer connection")
}

/// Buffers local ICE candidates gathered before the remote description is
/// set, then flushes them in gather order exactly once right after. The
/// buffer's own lock is never held across an await point — callers do the
/// actual network send after reading the return value.
pub struct PendingCandidates {
    buffer: Mutex<Vec<String>>,
    remote_set: AtomicBool,
}

impl Default for PendingCandidates {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCandidates {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            remote_set: AtomicBool::new(false),
        }
    }

    /// Call from the `on_ice_candidate` callback. Returns `Some(candidate)`
    /// when the remote description is already set (send immediately), or
    /// `None` when it buffered the candidate for later flushing. The
    /// end-of-candidates sentinel (`None` from the WebRTC stack) must never
    /// reach this method — filter it out at the callback site.
    pub fn offer(&self, candidate_json: String) -> Option<String> {
        if self.remote_set.load(Ordering::Acquire) {
            Some(candidate_json)
        } else {
            self.buffer.lock().unwrap().push(candidate_json);
            None
        }
    }

    /// Call immediately after `set_remote_description` succeeds. Returns
    /// the buffered candidates in gather order; subsequent `offer` calls
    /// return `Some` immediately instead of buffering.
    pub fn flush(&self) -> Vec<String> {
        let drained = std::mem::take(&mut *self.buffer.lock().unwrap());
        self.remote_set.store(true, Ordering::Release);
        drained
    }
}

/// Idempotent teardown: stop every RTP sender, remove every track, then
/// close the PC. Errors from stop/remove are propagated to the caller,
/// which per the error-handling policy logs and moves on rather than
/// treating it as fatal to the engine.
pub async fn close_peer_connection(pc: &RTCPeerConnection) -> anyhow::Result<()> {
    if pc.connection_state() == RTCPeerConnectionState::Closed {
        return Ok(());
    }

    let senders = pc.get_senders().await;
    for sender in &senders {
        sender.stop().await.context("failed to stop rtp sender")?;
    }
    for sender in &senders {
        pc.remove_track(sender)
            .await
            .context("failed to remove track")?;
    }
    pc.close().await.context("failed to close peer connection")?;
    Ok(())
}

/// Background task emitting RTCP PLI for `media_ssrc` on an interval, so a
/// newly-attached subscriber never waits longer than one interval for a
/// keyframe. Exits when writing RTCP fails (PC closed).
pub fn spawn_pli_sender(
    pc: std::sync::Arc<RTCPeerConnection>,
    media_ssrc: u32,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let pli = rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            };
            if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
                tracing::debug!("stopping PLI sender, write_rtcp failed: {e:#}");
                return;
            }
        }
    })
}

/// Drains RTCP on a sender so NACK/REMB interceptors actually run. Exits on
/// EOF/closed-pipe (PC closed).
pub fn spawn_rtcp_reader(sender: std::sync::Arc<RTCRtpSender>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        loop {
            if sender.read(&mut buf).await.is_err() {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_buffer_before_remote_set() {
        let pending = PendingCandidates::new();
        assert_eq!(pending.offer("a".to_string()), None);
        assert_eq!(pending.offer("b".to_string()), None);
        assert_eq!(pending.flush(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn candidates_send_immediately_after_remote_set() {
        let pending = PendingCandidates::new();
        pending.offer("a".to_string());
        assert_eq!(pending.flush(), vec!["a".to_string()]);
        assert_eq!(pending.offer("b".to_string()), Some("b".to_string()));
    }

    #[test]
    fn flush_is_idempotent_and_empties_the_buffer() {
        let pending = PendingCandidates::new();
        pending.offer("a".to_string());
        assert_eq!(pending.flush(), vec!["a".to_string()]);
        assert_eq!(pending.flush(), Vec::<String>::new());
    }
}
