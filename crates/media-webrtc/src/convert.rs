use groupcall_core::config::IceServer;
use groupcall_core::{ConnectionState, IceCandidate, SdpKind, SessionDescription};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub(crate) fn ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

pub(crate) fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, webrtc::Error> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
}

/// Only offers and answers travel over the relay.
pub(crate) fn from_rtc_description(
    description: &RTCSessionDescription,
) -> Option<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Some(SessionDescription::offer(description.sdp.clone())),
        RTCSdpType::Answer => Some(SessionDescription::answer(description.sdp.clone())),
        _ => None,
    }
}

pub(crate) fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        id: init.sdp_mid.unwrap_or_default(),
        label: init.sdp_mline_index.unwrap_or(0),
        candidate: init.candidate,
    }
}

pub(crate) fn candidate_to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: Some(candidate.id),
        sdp_mline_index: Some(candidate.label),
        username_fragment: None,
    }
}

pub(crate) fn connection_state(state: RTCIceConnectionState) -> Option<ConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(ConnectionState::New),
        RTCIceConnectionState::Checking => Some(ConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(ConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(ConnectionState::Completed),
        RTCIceConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(ConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_keep_mid_and_index() {
        let init = candidate_to_init(IceCandidate {
            id: "0".into(),
            label: 1,
            candidate: "candidate:1 1 udp 2130706431 192.168.1.4 50000 typ host".into(),
        });
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(1));

        let back = candidate_from_init(init);
        assert_eq!(back.id, "0");
        assert_eq!(back.label, 1);
    }

    #[test]
    fn missing_mid_defaults_to_empty() {
        let candidate = candidate_from_init(RTCIceCandidateInit {
            candidate: "candidate:2 1 udp 1 10.0.0.2 9 typ host".into(),
            ..Default::default()
        });
        assert_eq!(candidate.id, "");
        assert_eq!(candidate.label, 0);
    }

    #[test]
    fn only_offer_and_answer_are_forwarded() {
        let mut description = RTCSessionDescription::default();
        description.sdp = "v=0\r\n".into();
        description.sdp_type = RTCSdpType::Answer;
        assert_eq!(
            from_rtc_description(&description),
            Some(SessionDescription::answer("v=0\r\n"))
        );

        description.sdp_type = RTCSdpType::Pranswer;
        assert_eq!(from_rtc_description(&description), None);
    }

    #[test]
    fn ice_states_map_one_to_one() {
        assert_eq!(
            connection_state(RTCIceConnectionState::Disconnected),
            Some(ConnectionState::Disconnected)
        );
        assert_eq!(connection_state(RTCIceConnectionState::Unspecified), None);
    }

    #[test]
    fn ice_server_credentials_are_carried() {
        let servers = ice_servers(&[IceServer {
            urls: vec!["turn:turn.example.org".into()],
            username: Some("u".into()),
            credential: Some("p".into()),
        }]);
        assert_eq!(servers[0].urls, vec!["turn:turn.example.org".to_string()]);
        assert_eq!(servers[0].username, "u");
        assert_eq!(servers[0].credential, "p");
    }
}
