//! Network configuration and its canonical JSON encoding
//!
//! The canonical field names (`IceServers`, `SignalingUrl`, ...) are part of
//! the external contract: a host runtime hands configurations across the
//! registry boundary in this form and verifies round-trip equality.

use serde::{Deserialize, Serialize};

use super::error::NetworkError;

/// One ICE/relay server entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Configuration for one network instance, immutable after construction.
///
/// Equality is structural and order-preserving over the server list. A live
/// signaling transport is never part of the configuration; injection of a
/// shared relay happens through `PeerLinkNetwork::with_signaling`, so the
/// snapshot returned by `PollingNetwork::config` never aliases transport
/// state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(rename = "IceServers")]
    pub ice_servers: Vec<IceServer>,
    /// Rendezvous endpoint; `None` means direct-only operation with no relay
    #[serde(rename = "SignalingUrl")]
    pub signaling_url: Option<String>,
    /// Many-to-many address sharing instead of strict 1:1 rendezvous
    #[serde(rename = "IsConference")]
    pub is_conference: bool,
    /// How many times direct-path negotiation may be re-attempted per
    /// connection before giving up
    #[serde(rename = "MaxIceRestart")]
    pub max_ice_restart: u32,
    /// Keep the signaling sub-connection open after a direct path succeeds
    #[serde(rename = "KeepSignalingAlive")]
    pub keep_signaling_alive: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            signaling_url: None,
            is_conference: false,
            max_ice_restart: 2,
            keep_signaling_alive: true,
        }
    }
}

impl NetworkConfig {
    /// Serialize to the canonical JSON form. Field order is the struct
    /// order, so serializing the same value twice is byte-identical.
    pub fn to_json(&self) -> String {
        // Serialization of this plain data type cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse the canonical JSON form. Missing optional fields take their
    /// defaults; malformed input is a synchronous construction failure.
    pub fn from_json(json: &str) -> Result<Self, NetworkError> {
        serde_json::from_str(json).map_err(|e| NetworkError::InvalidConfig(e.to_string()))
    }

    /// First `stun:` entry in the server list, stripped of its scheme
    pub(crate) fn stun_server(&self) -> Option<String> {
        self.ice_servers
            .iter()
            .flat_map(|s| s.urls.iter())
            .find_map(|url| url.strip_prefix("stun:").map(|rest| rest.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> NetworkConfig {
        NetworkConfig {
            ice_servers: vec![
                IceServer::new("stun:stun.example.org:3478"),
                IceServer {
                    urls: vec!["turn:turn.example.org:5349".to_string()],
                    username: Some("user".to_string()),
                    credential: Some("secret".to_string()),
                },
            ],
            signaling_url: Some("ws://127.0.0.1:9000".to_string()),
            is_conference: true,
            max_ice_restart: 3,
            keep_signaling_alive: false,
        }
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let config = sample_config();
        let json = config.to_json();
        let parsed = NetworkConfig::from_json(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_round_trip_is_byte_stable() {
        let first = sample_config().to_json();
        let second = NetworkConfig::from_json(&first).unwrap().to_json();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_optional_fields_take_defaults() {
        let parsed = NetworkConfig::from_json("{}").unwrap();
        assert_eq!(parsed, NetworkConfig::default());

        let parsed =
            NetworkConfig::from_json(r#"{"SignalingUrl":"ws://host:1"}"#).unwrap();
        assert_eq!(parsed.signaling_url.as_deref(), Some("ws://host:1"));
        assert!(parsed.ice_servers.is_empty());
    }

    #[test]
    fn test_malformed_json_fails() {
        assert!(NetworkConfig::from_json("not json").is_err());
        assert!(NetworkConfig::from_json(r#"{"MaxIceRestart":"three"}"#).is_err());
    }

    #[test]
    fn test_server_list_order_matters_for_equality() {
        let mut a = sample_config();
        let mut b = sample_config();
        b.ice_servers.reverse();
        assert_ne!(a, b);
        a.ice_servers.reverse();
        assert_eq!(a, b);
    }

    #[test]
    fn test_stun_server_selection() {
        let config = sample_config();
        assert_eq!(
            config.stun_server().as_deref(),
            Some("stun.example.org:3478")
        );
        assert!(NetworkConfig::default().stun_server().is_none());
    }
}
