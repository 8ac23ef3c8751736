//! Bus topic layout. The offer topic is shared by every edge device; every
//! other topic is scoped to one stream by `<id>/<track_source_int>`.

use crate::meta::Meta;
use serde::{Deserialize, Serialize};

fn default_offer() -> String {
    "/edge/livestream/signal/offer".to_string()
}
fn default_answer() -> String {
    "/edge/livestream/signal/answer".to_string()
}
fn default_candidate_send() -> String {
    "/edge/livestream/signal/candidate/send".to_string()
}
fn default_candidate_recv() -> String {
    "/edge/livestream/signal/candidate/recv".to_string()
}
fn default_hook() -> String {
    "/edge/livestream/hook".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicPrefixes {
    #[serde(default = "default_offer")]
    pub offer: String,
    #[serde(default = "default_answer")]
    pub answer: String,
    #[serde(default = "default_candidate_send")]
    pub candidate_send: String,
    #[serde(default = "default_candidate_recv")]
    pub candidate_recv: String,
    #[serde(default = "default_hook")]
    pub hook: String,
}

impl Default for TopicPrefixes {
    fn default() -> Self {
        Self {
            offer: default_offer(),
            answer: default_answer(),
            candidate_send: default_candidate_send(),
            candidate_recv: default_candidate_recv(),
            hook: default_hook(),
        }
    }
}

fn per_stream(prefix: &str, meta: &Meta) -> String {
    format!("{prefix}/{}/{}", meta.id, meta.track_source.wire())
}

impl TopicPrefixes {
    /// Topic every edge publishes its offer to and the cloud subscribes to
    /// once, for all streams.
    pub fn offer_topic(&self) -> &str {
        &self.offer
    }

    pub fn answer_topic(&self, meta: &Meta) -> String {
        per_stream(&self.answer, meta)
    }

    pub fn candidate_send_topic(&self, meta: &Meta) -> String {
        per_stream(&self.candidate_send, meta)
    }

    pub fn candidate_recv_topic(&self, meta: &Meta) -> String {
        per_stream(&self.candidate_recv, meta)
    }

    pub fn hook_topic(&self, meta: &Meta) -> String {
        per_stream(&self.hook, meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::TrackSource;

    #[test]
    fn defaults_match_reference_layout() {
        let topics = TopicPrefixes::default();
        assert_eq!(topics.offer_topic(), "/edge/livestream/signal/offer");
        let meta = Meta::new("E1", TrackSource::Drone);
        assert_eq!(
            topics.answer_topic(&meta),
            "/edge/livestream/signal/answer/E1/1"
        );
        assert_eq!(
            topics.hook_topic(&meta),
            "/edge/livestream/hook/E1/1"
        );
    }

    #[test]
    fn monitor_track_source_uses_wire_value_two() {
        let topics = TopicPrefixes::default();
        let meta = Meta::new("E2", TrackSource::Monitor);
        assert!(topics.candidate_send_topic(&meta).ends_with("/E2/2"));
    }

    #[test]
    fn empty_toml_deserializes_to_defaults() {
        let topics: TopicPrefixes = toml::from_str("").unwrap();
        assert_eq!(topics, TopicPrefixes::default());
    }
}
