//! Edge publisher engine: one `Stream` per `(machine_id, track_source)`,
//! each running its own signalling session against the cloud relay and its
//! own ingest adapter, activated on demand by subscriber presence hooks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use edgecast_protocol::{IceCandidate, Meta, RelayConfig, SessionDescription};
use edgecast_relay::hook::{self, HookTransition};
use edgecast_relay::{Bus, PendingCandidates, SubscriberCount};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Which ingest adapter a stream runs. Mirrors the two (or three, counting
/// the recovered RTMP option) media sources the reference edge supports.
#[derive(Clone)]
pub enum IngestSpec {
    Rtp { listen: String },
    Rtsp { url: String },
    Rtmp { listen: String },
}

#[derive(Clone)]
pub struct StreamSpec {
    pub meta: Meta,
    pub ingest: IngestSpec,
}

/// Runs one stream forever, applying the burst-retry policy across
/// signalling attempts. This is the task body for a `tokio::spawn` and
/// never returns on its own.
pub async fn run_stream(config: Arc<RelayConfig>, bus: Arc<Bus>, spec: StreamSpec) {
    let burst = Arc::new(AtomicU32::new(0));
    loop {
        let attempt = burst.fetch_add(1, Ordering::AcqRel);
        if attempt >= config.retry.max_burst_retries {
            info!(
                stream = %spec.meta.session_key(),
                "burst retry cap reached, backing off"
            );
            tokio::time::sleep(Duration::from_secs(
                config.retry.burst_retries_group_interval_secs,
            ))
            .await;
            burst.store(0, Ordering::Release);
        }

        match run_once(&config, &bus, &spec, &burst).await {
            Ok(()) => {
                info!(stream = %spec.meta.session_key(), "session ended cleanly");
                wait_for_bus_reconnect(&bus, &spec).await;
            }
            Err(e) => warn!(stream = %spec.meta.session_key(), "session failed: {e:#}"),
        }
    }
}

/// A clean `Closed` transition only restarts signalling once the bus itself
/// reports connected again — retrying while the bus is down would just burn
/// through the burst-retry budget on guaranteed offer-publish failures.
async fn wait_for_bus_reconnect(bus: &Bus, spec: &StreamSpec) {
    while !bus.is_connected() {
        debug!(stream = %spec.meta.session_key(), "waiting for bus reconnect before retrying");
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn run_once(
    config: &RelayConfig,
    bus: &Arc<Bus>,
    spec: &StreamSpec,
    burst: &Arc<AtomicU32>,
) -> anyhow::Result<()> {
    let api = edgecast_relay::pc::build_api()?;
    let pc = Arc::new(edgecast_relay::pc::new_peer_connection(&api, &config.ice).await?);

    let (rtp_track, sample_track): (
        Option<Arc<TrackLocalStaticRTP>>,
        Option<Arc<TrackLocalStaticSample>>,
    ) = match &spec.ingest {
        IngestSpec::Rtp { .. } => (Some(edgecast_relay::new_local_track()), None),
        IngestSpec::Rtsp { .. } | IngestSpec::Rtmp { .. } => {
            (None, Some(edgecast_relay::new_local_sample_track()))
        }
    };

    let sender = if let Some(track) = &rtp_track {
        pc.add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("failed to add rtp track")?
    } else {
        pc.add_track(sample_track.clone().unwrap() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("failed to add sample track")?
    };
    edgecast_relay::pc::spawn_rtcp_reader(sender);

    let pending = Arc::new(PendingCandidates::new());
    let subscriber_count = Arc::new(SubscriberCount::new());

    let mut candidate_rx = bus
        .subscribe(
            &config.topics.candidate_recv_topic(&spec.meta),
            config.bus.qos,
        )
        .await?;
    let mut answer_rx = bus
        .subscribe(&config.topics.answer_topic(&spec.meta), config.bus.qos)
        .await?;
    let mut hook_rx = bus
        .subscribe(&config.topics.hook_topic(&spec.meta), config.bus.qos)
        .await?;

    {
        let pending = pending.clone();
        let bus = bus.clone();
        let topic = config.topics.candidate_send_topic(&spec.meta);
        let meta = spec.meta.clone();
        let qos = config.bus.qos;
        pc.on_ice_candidate(Box::new(move |candidate| {
            let pending = pending.clone();
            let bus = bus.clone();
            let topic = topic.clone();
            let meta = meta.clone();
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
                    send_candidate(&bus, &topic, qos, &meta, ready).await;
                }
            })
        }));
    }

    {
        let burst = burst.clone();
        let subscriber_count = subscriber_count.clone();
        let pc_weak = Arc::downgrade(&pc);
        pc.on_ice_connection_state_change(Box::new(move |state| {
            debug!(?state, "edge pc ice state changed");
            if state == RTCIceConnectionState::Connected {
                burst.store(0, Ordering::Release);
                subscriber_count.reset();
            }
            if state == RTCIceConnectionState::Failed
                && let Some(pc) = pc_weak.upgrade()
            {
                tokio::spawn(async move {
                    if let Err(e) = edgecast_relay::pc::close_peer_connection(&pc).await {
                        warn!("failed to close peer connection: {e:#}");
                    }
                });
            }
            Box::pin(async {})
        }));
    }

    let offer = pc.create_offer(None).await.context("create_offer failed")?;
    pc.set_local_description(offer.clone())
        .await
        .context("set_local_description failed")?;

    let sdp_json = serde_json::to_string(&offer).context("failed to serialize offer")?;
    let envelope = SessionDescription {
        meta: Some(spec.meta.clone()),
        sdp_json,
    };
    bus.publish(
        config.topics.offer_topic(),
        config.bus.qos,
        false,
        envelope.encode(),
    )
    .await
    .context("failed to publish offer")?;

    let answer_timeout = Duration::from_secs(config.retry.answer_timeout_secs);
    let answer_bytes = tokio::time::timeout(answer_timeout, answer_rx.recv())
        .await
        .context("timed out waiting for answer")?
        .context("answer channel closed")?;
    let answer_envelope =
        SessionDescription::decode(&answer_bytes.payload).context("failed to decode answer")?;
    let remote_sdp: RTCSessionDescription = serde_json::from_str(&answer_envelope.sdp_json)
        .context("failed to parse answer sdp json")?;
    pc.set_remote_description(remote_sdp)
        .await
        .context("set_remote_description failed")?;

    let send_topic = config.topics.candidate_send_topic(&spec.meta);
    for candidate_json in pending.flush() {
        send_candidate(bus, &send_topic, config.bus.qos, &spec.meta, candidate_json).await;
    }

    let cancel_root = CancellationToken::new();
    let mut ingest_scope: Option<CancellationToken> = None;
    let mut ingest_task: Option<tokio::task::JoinHandle<()>> = None;

    let result = loop {
        tokio::select! {
            Some(msg) = candidate_rx.recv() => {
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
            Some(msg) = hook_rx.recv() => {
                let Some(state) = hook::decode_hook_payload(&msg.payload) else {
                    continue;
                };
                match hook::classify(state) {
                    HookTransition::SubscriberConnected => {
                        if subscriber_count.increment() {
                            let scope = cancel_root.child_token();
                            ingest_task = Some(spawn_ingest(spec.clone(), rtp_track.clone(), sample_track.clone(), scope.clone()));
                            ingest_scope = Some(scope);
                        }
                    }
                    HookTransition::SubscriberDisconnected => {
                        if subscriber_count.decrement()
                            && let Some(scope) = ingest_scope.take()
                        {
                            scope.cancel();
                            if let Some(task) = ingest_task.take() {
                                let _ = task.await;
                            }
                        }
                    }
                    HookTransition::Ignore => {}
                }
            }
            outcome = watch_pc(&pc) => {
                break outcome;
            }
        }
    };

    cancel_root.cancel();
    if let Some(task) = ingest_task.take() {
        let _ = task.await;
    }
    let _ = bus.unsubscribe(&config.topics.candidate_recv_topic(&spec.meta)).await;
    let _ = bus.unsubscribe(&config.topics.answer_topic(&spec.meta)).await;
    let _ = bus.unsubscribe(&config.topics.hook_topic(&spec.meta)).await;
    result
}

/// Resolves once the PC leaves the live-session states, either cleanly
/// (`Closed`) or with an error (`Failed`) that should drive a reconnect.
async fn watch_pc(pc: &RTCPeerConnection) -> anyhow::Result<()> {
    loop {
        let state = pc.connection_state();
        if state == RTCPeerConnectionState::Closed {
            return Ok(());
        }
        if state == RTCPeerConnectionState::Failed {
            anyhow::bail!("peer connection failed");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

fn spawn_ingest(
    spec: StreamSpec,
    rtp_track: Option<Arc<TrackLocalStaticRTP>>,
    sample_track: Option<Arc<TrackLocalStaticSample>>,
    scope: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let result = match spec.ingest {
            IngestSpec::Rtp { listen } => {
                edgecast_relay::ingest::rtp::run(&listen, rtp_track.unwrap(), scope).await
            }
            IngestSpec::Rtsp { url } => {
                edgecast_relay::ingest::rtsp::run(&url, sample_track.unwrap(), scope).await
            }
            IngestSpec::Rtmp { listen } => {
                edgecast_relay::ingest::rtmp::run(&listen, sample_track.unwrap(), scope)
                    .await
                    .map_err(anyhow::Error::from)
            }
        };
        if let Err(e) = result {
            warn!(stream = %spec.meta.session_key(), "ingest adapter ended: {e:#}");
        }
    })
}

async fn send_candidate(bus: &Bus, topic: &str, qos: u8, meta: &Meta, candidate_json: String) {
    let envelope = IceCandidate {
        meta: Some(meta.clone()),
        candidate_json,
    };
    if let Err(e) = bus.publish(topic, qos, false, envelope.encode()).await {
        warn!("failed to publish ice candidate: {e:#}");
    }
}
