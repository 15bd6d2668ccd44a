//! The common polling-based network contract
//!
//! Both transports implement this one trait so call sites (and tests) run
//! unmodified against either. Every method returns immediately; outcomes
//! surface exclusively as events on the instance's queue, and operating on
//! an unknown or stale id is a safe no-op rather than a fault.

use super::config::NetworkConfig;
use super::event::{ConnectionId, NetworkEvent, NetworkStatus};

pub trait PollingNetwork: Send + Sync {
    /// Begin listening for inbound connections at `address`, or at an
    /// auto-chosen address when `None`. Completion is signaled by
    /// `ServerInitialized` (carrying the bound address) or
    /// `ServerInitFailed`.
    fn start_server(&self, address: Option<&str>);

    /// Stop accepting inbound connections; existing connections are
    /// unaffected. Completion is signaled by `ServerClosed`.
    fn stop_server(&self);

    /// Begin an outbound connection attempt and return its id immediately.
    /// Success enqueues `NewConnection` for that id, failure
    /// `ConnectionFailed`.
    fn connect(&self, address: &str) -> ConnectionId;

    /// Close one connection; `Disconnected` is enqueued once teardown
    /// completes. Unknown ids are ignored.
    fn disconnect(&self, id: ConnectionId);

    /// Queue `data` for transmission on the given channel class. Unknown
    /// ids are ignored.
    fn send(&self, id: ConnectionId, data: &[u8], reliable: bool);

    /// Remove and return the oldest unread event, or `None` if the queue
    /// is empty. Never blocks.
    fn dequeue(&self) -> Option<NetworkEvent>;

    /// Current outbound-buffer occupancy for one channel class of one
    /// connection; `0` for unknown ids.
    fn buffered_amount(&self, id: ConnectionId, reliable: bool) -> usize;

    /// Coarse instance status
    fn status(&self) -> NetworkStatus;

    /// Configuration snapshot this instance was built from. Never aliases
    /// live transport state.
    fn config(&self) -> &NetworkConfig;

    /// Request teardown of every live connection and release of the
    /// underlying transport resources. Terminal events are enqueued before
    /// the instance goes quiet; polling afterwards is optional.
    fn shutdown(&self);
}
