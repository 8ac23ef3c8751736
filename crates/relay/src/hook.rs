//! Hook payload encoding: the integer ICE connection state ordinal from the
//! cloud subscriber engine's perspective, the more expressive of the two
//! documented-acceptable disciplines (the other being a bare subscriber
//! count). Sent as an ASCII decimal string payload on the hook topic.

use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

fn ordinal(state: RTCIceConnectionState) -> u8 {
    match state {
        RTCIceConnectionState::Unspecified => 0,
        RTCIceConnectionState::New => 1,
        RTCIceConnectionState::Checking => 2,
        RTCIceConnectionState::Connected => 3,
        RTCIceConnectionState::Completed => 4,
        RTCIceConnectionState::Failed => 5,
        RTCIceConnectionState::Disconnected => 6,
        RTCIceConnectionState::Closed => 7,
    }
}

fn from_ordinal(n: u8) -> RTCIceConnectionState {
    match n {
        1 => RTCIceConnectionState::New,
        2 => RTCIceConnectionState::Checking,
        3 => RTCIceConnectionState::Connected,
        4 => RTCIceConnectionState::Completed,
        5 => RTCIceConnectionState::Failed,
        6 => RTCIceConnectionState::Disconnected,
        7 => RTCIceConnectionState::Closed,
        _ => RTCIceConnectionState::Unspecified,
    }
}

pub fn encode_hook_payload(state: RTCIceConnectionState) -> Vec<u8> {
    ordinal(state).to_string().into_bytes()
}

pub fn decode_hook_payload(payload: &[u8]) -> Option<RTCIceConnectionState> {
    let text = std::str::from_utf8(payload).ok()?;
    let n: u8 = text.trim().parse().ok()?;
    Some(from_ordinal(n))
}

/// Whether a decoded hook state should be treated as the edge's
/// `SubscriberCount::increment`/`decrement` trigger. Any state other than
/// `Connected`/`Disconnected` is not a presence transition and is ignored.
pub enum HookTransition {
    SubscriberConnected,
    SubscriberDisconnected,
    Ignore,
}

pub fn classify(state: RTCIceConnectionState) -> HookTransition {
    match state {
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            HookTransition::SubscriberConnected
        }
        RTCIceConnectionState::Disconnected
        | RTCIceConnectionState::Failed
        | RTCIceConnectionState::Closed => HookTransition::SubscriberDisconnected,
        _ => HookTransition::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_state() {
        for state in [
            RTCIceConnectionState::Unspecified,
            RTCIceConnectionState::New,
            RTCIceConnectionState::Checking,
            RTCIceConnectionState::Connected,
            RTCIceConnectionState::Completed,
            RTCIceConnectionState::Failed,
            RTCIceConnectionState::Disconnected,
            RTCIceConnectionState::Closed,
        ] {
            let payload = encode_hook_payload(state);
            assert_eq!(decode_hook_payload(&payload), Some(state));
        }
    }

    #[test]
    fn malformed_payload_decodes_to_none() {
        assert_eq!(decode_hook_payload(b"not-a-number"), None);
    }

    #[test]
    fn connected_classifies_as_subscriber_connected() {
        assert!(matches!(
            classify(RTCIceConnectionState::Connected),
            HookTransition::SubscriberConnected
        ));
    }

    #[test]
    fn disconnected_classifies_as_subscriber_disconnected() {
        assert!(matches!(
            classify(RTCIceConnectionState::Disconnected),
            HookTransition::SubscriberDisconnected
        ));
    }

    #[test]
    fn checking_is_ignored() {
        assert!(matches!(
            classify(RTCIceConnectionState::Checking),
            HookTransition::Ignore
        ));
    }
}
