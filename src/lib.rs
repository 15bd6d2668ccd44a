//! switchboard - polling-based peer networking with relay fallback
//!
//! The crate exposes a small, uniform contract for event-driven networking
//! without callbacks: every operation returns immediately, and every outcome
//! (server lifecycle, connection lifecycle, inbound data) arrives as an
//! ordered event that the caller polls for. Two transports implement the
//! contract, a pure relay over a WebSocket signaling endpoint and a
//! peer-link transport that negotiates direct UDP paths through that
//! endpoint.
//!
//! # Architecture
//!
//! - `network` - the polling contract, both transports, configuration, the
//!   event queue and the signaling endpoint implementation
//! - `protocol` - wire formats: signaling messages (JSON), the peer
//!   handshake (bincode) and direct-path datagram framing
//! - `registry` - an id-keyed arena for driving instances across an
//!   embedding boundary that cannot hold Rust types

pub mod network;
pub mod protocol;
pub mod registry;

pub use network::{
    ConnectionId, EventKind, IceServer, NetworkConfig, NetworkError, NetworkEvent, NetworkStatus,
    PeerLinkNetwork, PollingNetwork, RelayNetwork, SignalingServer,
};
pub use registry::NetworkRegistry;
