use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies which local source on the edge device a track came from.
///
/// Wire representation is a protobuf-style varint: `Unknown = 0`,
/// `Drone = 1`, `Monitor = 2`. Never reorder these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TrackSource {
    Unknown = 0,
    Drone = 1,
    Monitor = 2,
}

impl TrackSource {
    pub fn from_wire(v: u64) -> Self {
        match v {
            1 => TrackSource::Drone,
            2 => TrackSource::Monitor,
            _ => TrackSource::Unknown,
        }
    }

    pub fn wire(self) -> u64 {
        self as u64
    }
}

impl fmt::Display for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrackSource::Unknown => "unknown",
            TrackSource::Drone => "drone",
            TrackSource::Monitor => "monitor",
        };
        f.write_str(s)
    }
}

/// Identity of one stream: an edge device's id paired with the local source
/// the track came from. Created once from edge config and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Meta {
    pub id: String,
    pub track_source: TrackSource,
}

impl Meta {
    pub fn new(id: impl Into<String>, track_source: TrackSource) -> Self {
        Self {
            id: id.into(),
            track_source,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.id.is_empty()
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey {
            id: self.id.clone(),
            track_source: self.track_source,
        }
    }
}

/// Stable handle joining an edge's sending track with the cloud relay's
/// shared local track and the subscribers attached to it. Derived from
/// `Meta` (`id` and `track_source`), never constructed independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub id: String,
    pub track_source: TrackSource,
}

impl SessionKey {
    pub fn new(id: impl Into<String>, track_source: TrackSource) -> Self {
        Self {
            id: id.into(),
            track_source,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.track_source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_source_wire_round_trip() {
        for ts in [TrackSource::Unknown, TrackSource::Drone, TrackSource::Monitor] {
            assert_eq!(TrackSource::from_wire(ts.wire()), ts);
        }
    }

    #[test]
    fn unknown_wire_value_maps_to_unknown() {
        assert_eq!(TrackSource::from_wire(99), TrackSource::Unknown);
    }

    #[test]
    fn meta_validity() {
        assert!(!Meta::new("", TrackSource::Drone).is_valid());
        assert!(Meta::new("edge-1", TrackSource::Drone).is_valid());
    }

    #[test]
    fn session_key_derived_from_meta() {
        let meta = Meta::new("edge-1", TrackSource::Monitor);
        let key = meta.session_key();
        assert_eq!(key, SessionKey::new("edge-1", TrackSource::Monitor));
    }
}
