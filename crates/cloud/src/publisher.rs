//! Cloud publisher engine: for each `SessionDescription` received on the
//! shared offer topic, creates a fresh `LocalTrack` + PC, relays inbound RTP
//! from the edge into it, and registers the track in the `SessionTable`
//! once the PC reaches `Connected`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use edgecast_protocol::{IceCandidate, Meta, RelayConfig, SessionDescription};
use edgecast_relay::pc::{PendingCandidates, close_peer_connection, spawn_pli_sender};
use edgecast_relay::{Bus, SessionTable, new_local_track};
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

const INBOUND_RTP_BUFFER_SIZE: usize = 1400;

pub async fn run(
    config: Arc<RelayConfig>,
    bus: Arc<Bus>,
    api: Arc<API>,
    sessions: Arc<SessionTable>,
) -> anyhow::Result<()> {
    let mut offer_rx = bus
        .subscribe(config.topics.offer_topic(), config.bus.qos)
        .await?;
    info!("cloud publisher listening on offer topic");

    while let Some(msg) = offer_rx.recv().await {
        let config = config.clone();
        let bus = bus.clone();
        let api = api.clone();
        let sessions = sessions.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_offer(config, bus, api, sessions, msg.payload).await {
                warn!("cloud publisher session failed: {e:#}");
            }
        });
    }
    Ok(())
}

async fn handle_offer(
    config: Arc<RelayConfig>,
    bus: Arc<Bus>,
    api: Arc<API>,
    sessions: Arc<SessionTable>,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    let offer_envelope = SessionDescription::decode(&payload).context("failed to decode offer")?;
    let meta = offer_envelope
        .meta
        .clone()
        .context("offer missing meta")?;
    let remote_sdp: RTCSessionDescription = serde_json::from_str(&offer_envelope.sdp_json)
        .context("failed to parse offer sdp json")?;

    let local_track = new_local_track();
    let pc = Arc::new(edgecast_relay::pc::new_peer_connection(&api, &config.ice).await?);
    pc.add_transceiver_from_kind(RTPCodecType::Video, None)
        .await
        .context("failed to add recvonly transceiver")?;

    let pending = Arc::new(PendingCandidates::new());
    let mut candidate_rx = bus
        .subscribe(&config.topics.candidate_send_topic(&meta), config.bus.qos)
        .await?;

    {
        let pending = pending.clone();
        let bus_topic = config.topics.candidate_recv_topic(&meta);
        let meta_for_cb = meta.clone();
        let qos = config.bus.qos;
        let bus_handle = bus.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let pending = pending.clone();
            let bus_handle = bus_handle.clone();
            let topic = bus_topic.clone();
            let meta = meta_for_cb.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let Ok(init) = candidate.to_json() else {
                    return;
                };
                let Ok(candidate_json) = serde_json::to_string(&init) else {
                    return;
                };
                if let Some(ready) = pending.offer(candidate_json) {
                    publish_candidate(&bus_handle, &topic, qos, &meta, ready).await;
                }
            })
        }));
    }

    {
        let local_track = local_track.clone();
        let pc_weak = Arc::downgrade(&pc);
        pc.on_track(Box::new(move |remote_track, _receiver, _transceiver| {
            let local_track = local_track.clone();
            let pc_weak = pc_weak.clone();
            Box::pin(async move {
                let media_ssrc = remote_track.ssrc();
                if let Some(pc) = pc_weak.upgrade() {
                    spawn_pli_sender(pc, media_ssrc, Duration::from_secs(3));
                }
                let mut buf = vec![0u8; INBOUND_RTP_BUFFER_SIZE];
                loop {
                    let (n, _) = match remote_track.read(&mut buf).await {
                        Ok(v) => v,
                        Err(e) => {
                            debug!("remote track read ended: {e:#}");
                            return;
                        }
                    };
                    if let Err(e) = local_track.write(&buf[..n]).await
                        && !e.to_string().contains("closed pipe")
                    {
                        warn!("failed to write to local track: {e:#}");
                    }
                }
            })
        }));
    }

    {
        let sessions = sessions.clone();
        let local_track = local_track.clone();
        let meta = meta.clone();
        let pc_weak = Arc::downgrade(&pc);
        pc.on_ice_connection_state_change(Box::new(move |state| {
            debug!(?state, "cloud publisher pc ice state changed");
            if state == RTCIceConnectionState::Connected {
                sessions.register(meta.session_key(), local_track.clone());
            }
            if state == RTCIceConnectionState::Failed
                && let Some(pc) = pc_weak.upgrade()
            {
                tokio::spawn(async move {
                    if let Err(e) = close_peer_connection(&pc).await {
                        warn!("failed to close publisher peer connection: {e:#}");
                    }
                });
            }
            Box::pin(async {})
        }));
    }

    pc.set_remote_description(remote_sdp)
        .await
        .context("failed to set remote description")?;
    let answer = pc
        .create_answer(None)
        .await
        .context("failed to create answer")?;
    pc.set_local_description(answer.clone())
        .await
        .context("failed to set local description")?;

    for candidate_json in pending.flush() {
        publish_candidate(
            &bus,
            &config.topics.candidate_recv_topic(&meta),
            config.bus.qos,
            &meta,
            candidate_json,
        )
        .await;
    }

    let sdp_json = serde_json::to_string(&answer).context("failed to serialize answer")?;
    let envelope = SessionDescription {
        meta: Some(meta.clone()),
        sdp_json,
    };
    bus.publish(
        &config.topics.answer_topic(&meta),
        config.bus.qos,
        config.bus.retained_answer,
        envelope.encode(),
    )
    .await
    .context("failed to publish answer")?;

    while let Some(msg) = candidate_rx.recv().await {
        if let Ok(ice) = IceCandidate::decode(&msg.payload) {
            let init: RTCIceCandidateInit = match serde_json::from_str(&ice.candidate_json) {
                Ok(init) => init,
                Err(e) => {
                    warn!("failed to parse inbound ice candidate: {e:#}");
                    continue;
                }
            };
            if let Err(e) = pc.add_ice_candidate(init).await {
                warn!("failed to add inbound ice candidate: {e:#}");
            }
        }
    }
    Ok(())
}

async fn publish_candidate(bus: &Bus, topic: &str, qos: u8, meta: &Meta, candidate_json: String) {
    let envelope = IceCandidate {
        meta: Some(meta.clone()),
        candidate_json,
    };
    if let Err(e) = bus.publish(topic, qos, false, envelope.encode()).await {
        warn!("failed to publish ice candidate: {e:#}");
    }
}
