//! Connection identifiers, network events and the per-instance event queue
//!
//! Every asynchronous outcome of a network instance is expressed as a
//! [`NetworkEvent`] appended to that instance's [`EventQueue`]. Callers
//! observe outcomes exclusively by polling [`EventQueue::dequeue`].

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Identifier for one logical connection within a network instance.
///
/// Ids are allocated from a per-instance monotone counter starting at 1 and
/// are never recycled during the instance's lifetime, so a stale id can race
/// with teardown without ever aliasing a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// Sentinel meaning "no connection"
    pub const INVALID: ConnectionId = ConnectionId(0);

    /// Check whether this id refers to an actual connection
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.0)
        } else {
            write!(f, "#invalid")
        }
    }
}

/// Coarse status of a network instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum NetworkStatus {
    /// No active role and nothing pending
    #[default]
    NotConnected = 0,
    /// A server start or outbound connection is in flight
    Connecting = 1,
    /// At least one active role: serving, or an open connection
    Connected = 2,
}

impl NetworkStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::NotConnected,
        }
    }
}

/// What happened, for one [`NetworkEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A server start completed; the event's address is the bound address
    ServerInitialized,
    /// A server start failed (unreachable endpoint, address taken, ...)
    ServerInitFailed,
    /// The listener was closed by `stop_server`
    ServerClosed,
    /// A connection opened (inbound or outbound)
    NewConnection,
    /// An outbound connection attempt failed
    ConnectionFailed,
    /// An open connection closed
    Disconnected,
    /// Data arrived on the reliable channel
    ReliableMessageReceived,
    /// Data arrived on the unreliable channel
    UnreliableMessageReceived,
}

/// Immutable record of one state transition or data arrival
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEvent {
    pub kind: EventKind,
    pub connection: ConnectionId,
    /// Address payload (bound address for `ServerInitialized`, target for
    /// failure events where one is known)
    pub address: Option<String>,
    /// Data payload for message events
    pub data: Option<Vec<u8>>,
}

impl NetworkEvent {
    pub fn new(kind: EventKind, connection: ConnectionId) -> Self {
        Self {
            kind,
            connection,
            address: None,
            data: None,
        }
    }

    pub fn with_address(kind: EventKind, connection: ConnectionId, address: String) -> Self {
        Self {
            kind,
            connection,
            address: Some(address),
            data: None,
        }
    }

    pub fn message(connection: ConnectionId, data: Vec<u8>, reliable: bool) -> Self {
        let kind = if reliable {
            EventKind::ReliableMessageReceived
        } else {
            EventKind::UnreliableMessageReceived
        };
        Self {
            kind,
            connection,
            address: None,
            data: Some(data),
        }
    }
}

/// Ordered, per-instance FIFO buffer of events
///
/// Enqueue never blocks and never drops; dequeue never blocks and returns
/// `None` when empty. The queue is the single synchronization point between
/// an instance's driver task and the polling caller.
#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<VecDeque<NetworkEvent>>,
    notify: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    pub fn enqueue(&self, event: NetworkEvent) {
        self.inner.lock().push_back(event);
        self.notify.notify_one();
    }

    /// Remove and return the oldest unread event, or `None` if empty
    pub fn dequeue(&self) -> Option<NetworkEvent> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Wait until the queue is non-empty. Internal driver use only; the
    /// public contract stays polling-based.
    pub(crate) async fn wait_nonempty(&self) {
        loop {
            if !self.is_empty() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_id_sentinel() {
        assert!(!ConnectionId::INVALID.is_valid());
        assert!(ConnectionId(1).is_valid());
        assert_eq!(ConnectionId::INVALID, ConnectionId(0));
    }

    #[test]
    fn test_queue_fifo_order() {
        let queue = EventQueue::new();
        for i in 1..=5 {
            queue.enqueue(NetworkEvent::new(EventKind::NewConnection, ConnectionId(i)));
        }

        for i in 1..=5 {
            let event = queue.dequeue().expect("event missing");
            assert_eq!(event.connection, ConnectionId(i));
        }
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_queue_empty_dequeue() {
        let queue = EventQueue::new();
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_message_event_kind_by_channel() {
        let reliable = NetworkEvent::message(ConnectionId(1), vec![1, 2], true);
        let unreliable = NetworkEvent::message(ConnectionId(1), vec![1, 2], false);
        assert_eq!(reliable.kind, EventKind::ReliableMessageReceived);
        assert_eq!(unreliable.kind, EventKind::UnreliableMessageReceived);
        assert_eq!(reliable.data.as_deref(), Some(&[1u8, 2][..]));
    }

    #[test]
    fn test_wait_nonempty_returns_once_filled() {
        let queue = EventQueue::new();
        queue.enqueue(NetworkEvent::new(EventKind::ServerClosed, ConnectionId::INVALID));
        tokio_test::block_on(queue.wait_nonempty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_status_from_u8() {
        assert_eq!(NetworkStatus::from_u8(0), NetworkStatus::NotConnected);
        assert_eq!(NetworkStatus::from_u8(1), NetworkStatus::Connecting);
        assert_eq!(NetworkStatus::from_u8(2), NetworkStatus::Connected);
        assert_eq!(NetworkStatus::from_u8(99), NetworkStatus::NotConnected);
    }
}
