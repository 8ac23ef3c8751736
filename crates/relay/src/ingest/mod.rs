//! Ingest adapters bring media from a drone/encoder into a `TrackLocal`.
//! Each one runs under its own [`tokio_util::sync::CancellationToken`] scope
//! so the edge publisher engine can start/stop it on the `SubscriberCount`
//! 0->1 / 1->0 edges without tearing down the rest of the process.

pub mod rtmp;
pub mod rtp;
pub mod rtsp;
