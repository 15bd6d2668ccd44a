//! Polling-based network abstraction
//!
//! Two interchangeable transports implement [`PollingNetwork`]:
//! [`RelayNetwork`] keeps all traffic on the WebSocket signaling link, while
//! [`PeerLinkNetwork`] uses that link only to negotiate a direct UDP path
//! between peers. Callers drive either one the same way: issue non-blocking
//! operations, then poll the instance's event queue for outcomes.

pub mod config;
pub mod error;
pub mod event;
pub mod interface;
pub mod peer;
pub mod relay;
pub mod signaling;
pub mod stun;
pub mod transport;

pub use config::{IceServer, NetworkConfig};
pub use error::NetworkError;
pub use event::{ConnectionId, EventKind, EventQueue, NetworkEvent, NetworkStatus};
pub use interface::PollingNetwork;
pub use peer::PeerLinkNetwork;
pub use relay::RelayNetwork;
pub use signaling::SignalingServer;
