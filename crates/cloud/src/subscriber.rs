//! Cloud subscriber engine: the browser-facing WebSocket surface at
//! `/v1/broadcast/signal`. One connection negotiates exactly one PC against
//! a single `LocalTrack` already registered by the publisher engine.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use edgecast_protocol::ws::{
    ErrorCode, ErrorPayload, IceCandidatePayload, MetaPayload, SdpPayload, WsEnvelope, WsEvent,
};
use edgecast_protocol::{Meta, RelayConfig, TrackSource};
use edgecast_relay::hook::encode_hook_payload;
use edgecast_relay::pc::{PendingCandidates, close_peer_connection, spawn_rtcp_reader};
use edgecast_relay::{Bus, SessionTable};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;

/// How long the subscriber's own answer-generation sequence (`create_answer`
/// + `set_local_description`) is allowed to run before the offer is failed
/// with `ErrFailedToCreateSubscriber` instead of hanging the connection.
const ANSWER_TIMEOUT: Duration = Duration::from_secs(3);

const OUTBOUND_CANDIDATE_BUFFER: usize = 8;

pub async fn handle(
    mut socket: WebSocket,
    config: Arc<RelayConfig>,
    bus: Arc<Bus>,
    sessions: Arc<SessionTable>,
) {
    let Some(first) = next_text_message(&mut socket).await else {
        return;
    };
    let envelope: WsEnvelope = match serde_json::from_str(&first) {
        Ok(e) => e,
        Err(e) => {
            send_error(&mut socket, None, None, ErrorCode::ErrUnmarshalJson, &e.to_string()).await;
            return;
        }
    };
    if envelope.event != WsEvent::VideoOffer {
        send_error(
            &mut socket,
            envelope.id.clone(),
            None,
            ErrorCode::ErrIncorrectMetadata,
            "first message must be video-offer",
        )
        .await;
        return;
    }
    let sdp_payload = match envelope.parse_sdp_payload() {
        Ok(p) => p,
        Err(e) => {
            send_error(
                &mut socket,
                envelope.id.clone(),
                None,
                ErrorCode::ErrUnmarshalJson,
                &e.to_string(),
            )
            .await;
            return;
        }
    };

    if let Err(e) = run_session(
        &mut socket,
        &config,
        &bus,
        &sessions,
        envelope.id.clone(),
        sdp_payload,
    )
    .await
    {
        warn!("cloud subscriber session failed: {e:#}");
    }
}

async fn run_session(
    socket: &mut WebSocket,
    config: &RelayConfig,
    bus: &Bus,
    sessions: &SessionTable,
    corr_id: Option<String>,
    sdp_payload: SdpPayload,
) -> anyhow::Result<()> {
    let meta = Meta::new(
        sdp_payload.meta.id.clone(),
        sdp_payload.meta.track_source,
    );
    if !meta.is_valid() {
        send_error(
            socket,
            corr_id,
            Some(&meta),
            ErrorCode::ErrIncorrectMetadata,
            "meta.id must not be empty",
        )
        .await;
        return Ok(());
    }

    let Some(local_track) = sessions.lookup(&meta.session_key()) else {
        send_error(
            socket,
            corr_id,
            Some(&meta),
            ErrorCode::ErrMetadataNotMatched,
            "no live publisher for this meta",
        )
        .await;
        return Ok(());
    };

    let remote_sdp: RTCSessionDescription = match serde_json::from_value(sdp_payload.sdp) {
        Ok(sdp) => sdp,
        Err(e) => {
            send_error(
                socket,
                corr_id,
                Some(&meta),
                ErrorCode::ErrUnmarshalJson,
                &e.to_string(),
            )
            .await;
            return Ok(());
        }
    };

    let api = edgecast_relay::pc::build_api()?;
    let pc = Arc::new(edgecast_relay::pc::new_peer_connection(&api, &config.ice).await?);
    let sender = pc
        .add_track(local_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
        .await?;
    spawn_rtcp_reader(sender);

    let pending = Arc::new(PendingCandidates::new());
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_CANDIDATE_BUFFER);

    {
        let pending = pending.clone();
        let outbound_tx = outbound_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let pending = pending.clone();
            let outbound_tx = outbound_tx.clone();
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
                    let _ = outbound_tx.send(ready).await;
                }
            })
        }));
    }

    let (hook_tx, mut hook_rx) = mpsc::channel::<()>(1);
    {
        let meta = meta.clone();
        let pc_weak = Arc::downgrade(&pc);
        pc.on_ice_connection_state_change(Box::new(move |state| {
            debug!(?state, stream = %meta.session_key(), "cloud subscriber pc ice state changed");
            if state == RTCIceConnectionState::Connected
                && meta.track_source == TrackSource::Drone
            {
                let _ = hook_tx.try_send(());
            }
            if state == RTCIceConnectionState::Failed
                && let Some(pc) = pc_weak.upgrade()
            {
                tokio::spawn(async move {
                    if let Err(e) = close_peer_connection(&pc).await {
                        warn!("failed to close subscriber peer connection: {e:#}");
                    }
                });
            }
            Box::pin(async {})
        }));
    }

    pc.set_remote_description(remote_sdp).await?;

    let answer = match timeout(ANSWER_TIMEOUT, create_answer(&pc)).await {
        Ok(Ok(answer)) => answer,
        Ok(Err(e)) => {
            send_error(
                socket,
                corr_id,
                Some(&meta),
                ErrorCode::ErrFailedToCreateSubscriber,
                &e.to_string(),
            )
            .await;
            return Ok(());
        }
        Err(_) => {
            send_error(
                socket,
                corr_id,
                Some(&meta),
                ErrorCode::ErrFailedToCreateSubscriber,
                "timed out creating answer",
            )
            .await;
            return Ok(());
        }
    };

    for candidate_json in pending.flush() {
        let _ = outbound_tx.send(candidate_json).await;
    }

    let answer_payload = SdpPayload {
        meta: sdp_payload.meta.clone(),
        sdp: serde_json::to_value(&answer)?,
    };
    let reply = WsEnvelope::video_answer(corr_id.clone(), &answer_payload);
    send_envelope(socket, &reply).await?;

    let meta_payload = sdp_payload.meta;
    loop {
        tokio::select! {
            Some(candidate_json) = outbound_rx.recv() => {
                let payload = IceCandidatePayload { meta: meta_payload.clone(), candidate: candidate_json };
                let envelope = WsEnvelope::new_ice_candidate(None, &payload);
                if send_envelope(socket, &envelope).await.is_err() {
                    break;
                }
            }
            _ = hook_rx.recv() => {
                let topic = config.topics.hook_topic(&meta);
                if let Err(e) = bus.publish(&topic, config.bus.qos, false, encode_hook_payload(RTCIceConnectionState::Connected)).await {
                    warn!("failed to publish subscriber hook: {e:#}");
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_incoming_candidate(&pc, &text).await {
                            warn!("failed to apply inbound ice candidate: {e:#}");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("subscriber websocket error: {e:#}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = close_peer_connection(&pc).await;
    Ok(())
}

async fn create_answer(
    pc: &webrtc::peer_connection::RTCPeerConnection,
) -> anyhow::Result<RTCSessionDescription> {
    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer.clone()).await?;
    Ok(answer)
}

async fn handle_incoming_candidate(
    pc: &webrtc::peer_connection::RTCPeerConnection,
    text: &str,
) -> anyhow::Result<()> {
    let envelope: WsEnvelope = serde_json::from_str(text)?;
    if envelope.event != WsEvent::NewIceCandidate {
        return Ok(());
    }
    let payload = envelope.parse_ice_candidate_payload()?;
    let init: RTCIceCandidateInit = serde_json::from_str(&payload.candidate)?;
    pc.add_ice_candidate(init).await?;
    Ok(())
}

async fn next_text_message(socket: &mut WebSocket) -> Option<String> {
    loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

async fn send_envelope(socket: &mut WebSocket, envelope: &WsEnvelope) -> anyhow::Result<()> {
    let json = serde_json::to_string(envelope)?;
    socket.send(Message::Text(json.into())).await?;
    Ok(())
}

async fn send_error(
    socket: &mut WebSocket,
    corr_id: Option<String>,
    meta: Option<&Meta>,
    code: ErrorCode,
    message: &str,
) {
    let payload = ErrorPayload {
        meta: meta.map(|m| MetaPayload {
            id: m.id.clone(),
            track_source: m.track_source,
        }),
        code,
        message: message.to_string(),
    };
    let envelope = WsEnvelope::error(corr_id, &payload);
    let _ = send_envelope(socket, &envelope).await;
}
