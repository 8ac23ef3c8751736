//! Raw RTP ingest: a UDP socket that forwards every received datagram
//! straight onto a `TrackLocalStaticRTP`, unchanged. Used when the drone's
//! own encoder already emits WebRTC-compatible RTP and no repacketization
//! is needed.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// UDP MTU-sized receive buffer, matching the reference listener.
const RECV_BUFFER_SIZE: usize = 1600;

/// Binds `address` and forwards datagrams to `track` until `cancel` fires
/// or the socket read fails. A read error ends the adapter; the caller is
/// responsible for restarting it (e.g. on the next subscriber attach).
pub async fn run(
    address: &str,
    track: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(address).await?;
    info!(address, "rtp ingest listening");
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        let (len, _peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buf) => received?,
        };
        if let Err(e) = track.write(&buf[..len]).await {
            warn!("failed to write rtp packet to track: {e:#}");
        }
    }
}
