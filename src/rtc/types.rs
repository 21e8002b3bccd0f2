//! Identifiers, signal payloads and configuration for the RTC layer.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_LENGTH: usize = 21;

/// Opaque identity of a signaling participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// A fresh random id, long enough that collisions are not a concern.
    pub fn fresh() -> Self {
        PeerId(random_token(ID_LENGTH))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        PeerId(id)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId(id.to_owned())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn random_token(length: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// One unit of negotiation state exchanged between two peers.
///
/// At most one field is set. An empty signal is valid and ignored by the
/// receiver, which makes it usable as a bare announcement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Signal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<RTCSessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<RTCIceCandidateInit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<bool>,
}

impl Signal {
    pub fn description(description: RTCSessionDescription) -> Self {
        Signal {
            description: Some(description),
            ..Default::default()
        }
    }

    pub fn candidate(candidate: RTCIceCandidateInit) -> Self {
        Signal {
            candidate: Some(candidate),
            ..Default::default()
        }
    }

    pub fn shutdown() -> Self {
        Signal {
            shutdown: Some(true),
            ..Default::default()
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown == Some(true)
    }
}

/// A [`Signal`] stamped with its origin and optional destination, as it
/// travels over a signaling channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressableSignal {
    pub from: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    #[serde(flatten)]
    pub signal: Signal,
}

/// ICE server entry, mirroring the browser-style configuration shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        IceServer {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Configuration for building peer connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        RtcConfig {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun.cloudflare.com:3478"),
            ],
        }
    }
}

impl RtcConfig {
    /// No ICE servers at all. Only host candidates are gathered, which is
    /// enough for same-machine tests.
    pub fn host_only() -> Self {
        RtcConfig {
            ice_servers: Vec::new(),
        }
    }

    pub(crate) fn to_rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

    fn fake_offer() -> RTCSessionDescription {
        let mut description = RTCSessionDescription::default();
        description.sdp_type = RTCSdpType::Offer;
        description.sdp = "v=0 test".to_owned();
        description
    }

    #[test]
    fn description_signal_wire_format() {
        let signal = Signal::description(fake_offer());
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(
            value,
            json!({"description": {"type": "offer", "sdp": "v=0 test"}})
        );
    }

    #[test]
    fn shutdown_signal_wire_format() {
        let encoded = serde_json::to_string(&Signal::shutdown()).unwrap();
        assert_eq!(encoded, r#"{"shutdown":true}"#);
    }

    #[test]
    fn addressing_flattens_around_the_signal() {
        let message = AddressableSignal {
            from: PeerId::from("alice"),
            to: Some(PeerId::from("bob")),
            signal: Signal::shutdown(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value, json!({"from": "alice", "to": "bob", "shutdown": true}));
    }

    #[test]
    fn unaddressed_signal_omits_the_destination() {
        let message = AddressableSignal {
            from: PeerId::from("alice"),
            to: None,
            signal: Signal::default(),
        };
        let encoded = serde_json::to_string(&message).unwrap();
        assert_eq!(encoded, r#"{"from":"alice"}"#);
    }

    #[test]
    fn empty_signal_decodes_from_bare_addressing() {
        let message: AddressableSignal = serde_json::from_str(r#"{"from":"alice"}"#).unwrap();
        assert_eq!(message.from, PeerId::from("alice"));
        assert!(message.to.is_none());
        assert!(message.signal.description.is_none());
        assert!(message.signal.candidate.is_none());
        assert!(!message.signal.is_shutdown());
    }

    #[test]
    fn config_maps_onto_the_engine_ice_servers() {
        let engine = RtcConfig::default().to_rtc_configuration();
        assert_eq!(engine.ice_servers.len(), 2);
        assert_eq!(
            engine.ice_servers[0].urls,
            vec!["stun:stun.l.google.com:19302".to_owned()]
        );
        assert!(engine.ice_servers[0].username.is_empty());
        assert!(RtcConfig::host_only()
            .to_rtc_configuration()
            .ice_servers
            .is_empty());
    }

    #[test]
    fn fresh_ids_are_distinct() {
        assert_ne!(PeerId::fresh(), PeerId::fresh());
        assert_eq!(PeerId::fresh().as_str().len(), ID_LENGTH);
    }
}
