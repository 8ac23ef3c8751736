//! The cloud relay's process-lifetime `SessionKey -> LocalTrack` map.
//! Written only by the cloud publisher engine; read by the cloud
//! subscriber engine. Re-registration under the same key replaces the
//! entry; a subscriber that already cloned the old `Arc` keeps it alive and
//! working until its own PC closes.

use std::collections::HashMap;
use std::sync::Arc;

use edgecast_protocol::SessionKey;
use parking_lot::RwLock;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Creates the shared H264 track a cloud publisher engine writes into and
/// every attached subscriber PC reads from. `track_id`/`stream_id` are
/// random per registration so re-registering the same `SessionKey` never
/// reuses a stale negotiated track identity.
pub fn new_local_track() -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability {
            mime_type: webrtc::api::media_engine::MIME_TYPE_H264.to_string(),
            ..Default::default()
        },
        format!("video-{}", uuid::Uuid::new_v4()),
        format!("stream-{}", uuid::Uuid::new_v4()),
    ))
}

/// Same as [`new_local_track`] but backed by a `TrackLocalStaticSample`, for
/// edge ingest adapters (RTSP/RTMP) that hand over whole access units with a
/// duration rather than raw RTP packets.
pub fn new_local_sample_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability {
            mime_type: webrtc::api::media_engine::MIME_TYPE_H264.to_string(),
            ..Default::default()
        },
        format!("video-{}", uuid::Uuid::new_v4()),
        format!("stream-{}", uuid::Uuid::new_v4()),
    ))
}

#[derive(Default)]
pub struct SessionTable {
    inner: RwLock<HashMap<SessionKey, Arc<TrackLocalStaticRTP>>>,
}

impl SessionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Atomically replaces any existing entry for `key`. Subscribers that
    /// already hold the previous `Arc` keep it; new lookups see the new one.
    pub fn register(&self, key: SessionKey, track: Arc<TrackLocalStaticRTP>) {
        self.inner.write().insert(key, track);
    }

    pub fn lookup(&self, key: &SessionKey) -> Option<Arc<TrackLocalStaticRTP>> {
        self.inner.read().get(key).cloned()
    }

    /// Remove the entry for `key` only if it still points at `track` —
    /// avoids a stale publisher teardown clobbering a newer registration
    /// that raced it.
    pub fn remove_if_current(&self, key: &SessionKey, track: &Arc<TrackLocalStaticRTP>) {
        let mut guard = self.inner.write();
        if let Some(current) = guard.get(key)
            && Arc::ptr_eq(current, track)
        {
            guard.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgecast_protocol::TrackSource;

    #[test]
    fn register_then_lookup() {
        let table = SessionTable::new();
        let key = SessionKey::new("edge-1", TrackSource::Drone);
        let track = new_local_track();
        table.register(key.clone(), track.clone());
        let found = table.lookup(&key).unwrap();
        assert!(Arc::ptr_eq(&found, &track));
    }

    #[test]
    fn lookup_of_unknown_key_is_none() {
        let table = SessionTable::new();
        let key = SessionKey::new("unknown", TrackSource::Drone);
        assert!(table.lookup(&key).is_none());
    }

    #[test]
    fn re_registration_replaces_entry_but_old_arc_survives() {
        let table = SessionTable::new();
        let key = SessionKey::new("edge-1", TrackSource::Drone);
        let old_track = new_local_track();
        table.register(key.clone(), old_track.clone());
        let held_by_subscriber = table.lookup(&key).unwrap();

        let new_track = new_local_track();
        table.register(key.clone(), new_track.clone());

        let found = table.lookup(&key).unwrap();
        assert!(Arc::ptr_eq(&found, &new_track));
        // The subscriber's earlier clone is untouched and still usable.
        assert!(Arc::ptr_eq(&held_by_subscriber, &old_track));
        assert_eq!(Arc::strong_count(&old_track), 2);
    }

    #[test]
    fn remove_if_current_is_a_noop_when_superseded() {
        let table = SessionTable::new();
        let key = SessionKey::new("edge-1", TrackSource::Drone);
        let old_track = new_local_track();
        table.register(key.clone(), old_track.clone());
        let new_track = new_local_track();
        table.register(key.clone(), new_track.clone());

        table.remove_if_current(&key, &old_track);
        let found = table.lookup(&key).unwrap();
        assert!(Arc::ptr_eq(&found, &new_track));
    }

    #[test]
    fn remove_if_current_removes_matching_entry() {
        let table = SessionTable::new();
        let key = SessionKey::new("edge-1", TrackSource::Drone);
        let track = new_local_track();
        table.register(key.clone(), track.clone());
        table.remove_if_current(&key, &track);
        assert!(table.lookup(&key).is_none());
    }
}
