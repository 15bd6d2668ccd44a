//! Wire messages for the rendezvous protocol and the peer handshake
//!
//! `SignalMessage` travels as JSON text frames on the WebSocket control
//! connection between a network instance and the signaling endpoint.
//! `HandshakeMessage` is opaque to the endpoint: it is bincode-encoded and
//! carried inside `SignalMessage::Payload` between two peer-link instances.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::network::error::NetworkError;

/// Messages exchanged with the signaling endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SignalMessage {
    // Client -> Server
    /// Register as a listener at `address`. `shared` asks to join (or
    /// found) a shared listener set.
    Listen { address: String, shared: bool },
    /// Release one listener registration
    Unlisten { address: String },
    /// Open a link to a listener at `address`. `token` correlates the
    /// reply; `fanout` links to every current listener instead of one.
    Dial {
        address: String,
        token: u64,
        fanout: bool,
    },
    /// Close one link
    Hangup { link: u64 },

    // Server -> Client
    ListenOk { address: String },
    ListenFailed { address: String, reason: String },
    Unlistened { address: String },
    DialOk { token: u64, link: u64 },
    DialFailed { token: u64, reason: String },
    /// A dialer was matched to this listener (or, during fanout, an extra
    /// listener was matched to the dialer)
    Incoming { link: u64, address: String },
    Closed { link: u64 },
    Error { message: String },

    // Both directions
    /// Application or handshake bytes for one link, routed verbatim to the
    /// link's other endpoint
    Payload {
        link: u64,
        reliable: bool,
        data: Vec<u8>,
    },
}

impl SignalMessage {
    pub fn to_json(&self) -> Result<String, NetworkError> {
        serde_json::to_string(self).map_err(|e| NetworkError::SignalingError(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, NetworkError> {
        serde_json::from_str(json).map_err(|e| NetworkError::SignalingError(e.to_string()))
    }
}

/// Peer-to-peer control messages carried as opaque relay payloads
///
/// The handshake is symmetric: both endpoints send `Hello` as soon as their
/// signaling sub-connection opens. The XOR of the two tokens names the
/// candidate-probing session on the wire, and the endpoint with the larger
/// token is the controlling side for restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandshakeMessage {
    /// Candidate set of one endpoint. `restart` counts renegotiations for
    /// the same logical connection, starting at 0.
    Hello {
        token: u64,
        candidates: Vec<SocketAddr>,
        restart: u32,
    },
    /// Application traffic relayed while (or instead of) a direct path
    App { reliable: bool, data: Vec<u8> },
    /// Orderly close of the logical connection
    Bye,
}

impl HandshakeMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        // Plain data, cannot fail to encode
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        bincode::deserialize(data).ok()
    }
}
