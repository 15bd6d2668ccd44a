//! Rendezvous signaling endpoint
//!
//! Tracks address -> set-of-listeners, matches dialers to listeners and
//! routes opaque payload frames between the two endpoints of every link.
//! Instances talk to it over WebSocket using [`SignalMessage`] frames.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::protocol::SignalMessage;

use super::error::NetworkError;

/// Listener registrations for one address
struct AddressEntry {
    shared: bool,
    listeners: Vec<u64>,
    next_pick: usize,
    /// Exclusive listeners currently matched to a dialer; a 1:1 listen
    /// takes one dialer at a time
    engaged: Vec<u64>,
}

/// Address -> listener-set bookkeeping, separated out so the rendezvous
/// rules are testable without any socket in play
#[derive(Default)]
pub(crate) struct AddressBook {
    entries: HashMap<String, AddressEntry>,
}

impl AddressBook {
    /// Register `client` as a listener. A second registration succeeds only
    /// when both the existing set and the new request allow sharing.
    pub(crate) fn listen(&mut self, address: &str, client: u64, shared: bool) -> bool {
        match self.entries.get_mut(address) {
            Some(entry) => {
                if entry.shared && shared {
                    entry.listeners.push(client);
                    true
                } else {
                    false
                }
            }
            None => {
                self.entries.insert(
                    address.to_string(),
                    AddressEntry {
                        shared,
                        listeners: vec![client],
                        next_pick: 0,
                        engaged: Vec::new(),
                    },
                );
                true
            }
        }
    }

    /// Drop one registration; returns whether it existed
    pub(crate) fn unlisten(&mut self, address: &str, client: u64) -> bool {
        let Some(entry) = self.entries.get_mut(address) else {
            return false;
        };
        let before = entry.listeners.len();
        entry.listeners.retain(|&c| c != client);
        entry.engaged.retain(|&c| c != client);
        let removed = entry.listeners.len() != before;
        if entry.listeners.is_empty() {
            self.entries.remove(address);
        }
        removed
    }

    /// Drop every registration a disconnecting client held
    pub(crate) fn remove_client(&mut self, client: u64) {
        self.entries.retain(|_, entry| {
            entry.listeners.retain(|&c| c != client);
            entry.engaged.retain(|&c| c != client);
            !entry.listeners.is_empty()
        });
    }

    /// Pick one available listener round-robin, never matching the dialer
    /// to itself. A picked exclusive listener is engaged until released.
    pub(crate) fn pick(&mut self, address: &str, dialer: u64) -> Option<u64> {
        let entry = self.entries.get_mut(address)?;
        let candidates: Vec<u64> = entry
            .listeners
            .iter()
            .copied()
            .filter(|&c| c != dialer && !entry.engaged.contains(&c))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let picked = candidates[entry.next_pick % candidates.len()];
        entry.next_pick = entry.next_pick.wrapping_add(1);
        if !entry.shared {
            entry.engaged.push(picked);
        }
        Some(picked)
    }

    /// All available listeners except the dialer, for conference fanout
    pub(crate) fn all(&self, address: &str, dialer: u64) -> Vec<u64> {
        self.entries
            .get(address)
            .map(|entry| {
                entry
                    .listeners
                    .iter()
                    .copied()
                    .filter(|&c| c != dialer && !entry.engaged.contains(&c))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Free an exclusive listener once its link is gone
    pub(crate) fn release(&mut self, address: &str, listener: u64) {
        if let Some(entry) = self.entries.get_mut(address) {
            entry.engaged.retain(|&c| c != listener);
        }
    }
}

/// One matched dialer/listener pair; `b` is always the listener side
struct Link {
    a: u64,
    b: u64,
    address: String,
}

struct ServerState {
    addresses: RwLock<AddressBook>,
    links: RwLock<HashMap<u64, Link>>,
    clients: RwLock<HashMap<u64, mpsc::UnboundedSender<SignalMessage>>>,
    next_client: AtomicU64,
    next_link: AtomicU64,
}

impl ServerState {
    async fn send(&self, client: u64, msg: SignalMessage) {
        if let Some(tx) = self.clients.read().await.get(&client) {
            let _ = tx.send(msg);
        }
    }
}

/// Rendezvous signaling server
pub struct SignalingServer {
    state: Arc<ServerState>,
}

impl SignalingServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ServerState {
                addresses: RwLock::new(AddressBook::default()),
                links: RwLock::new(HashMap::new()),
                clients: RwLock::new(HashMap::new()),
                next_client: AtomicU64::new(1),
                next_link: AtomicU64::new(1),
            }),
        }
    }

    /// Bind and serve in a background task, returning the bound address.
    /// Used by tests and embedded deployments.
    pub async fn spawn(&self, addr: &str) -> Result<SocketAddr, NetworkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Bind failed: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::SignalingError(format!("Bind failed: {}", e)))?;

        info!("Signaling server listening on {}", local_addr);

        let state = self.state.clone();
        tokio::spawn(async move {
            accept_loop(listener, state).await;
        });

        Ok(local_addr)
    }

    /// Bind and serve forever on the current task
    pub async fn run(&self, addr: &str) -> Result<(), NetworkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Bind failed: {}", e)))?;

        info!("Signaling server listening on {}", addr);
        accept_loop(listener, self.state.clone()).await;
        Ok(())
    }

    /// Serve one already-accepted stream (plain TCP or TLS)
    pub async fn serve_stream<S>(&self, stream: S) -> Result<(), NetworkError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        handle_client(stream, self.state.clone()).await
    }
}

impl Default for SignalingServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!("New signaling connection from {}", peer_addr);
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, state).await {
                        warn!("Connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("Accept error: {}", e);
            }
        }
    }
}

/// Handle one WebSocket client until it disconnects
async fn handle_client<S>(stream: S, state: Arc<ServerState>) -> Result<(), NetworkError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| NetworkError::SignalingError(format!("WebSocket accept failed: {}", e)))?;
    let (mut write, mut read) = ws_stream.split();

    let client_id = state.next_client.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.clients.write().await.insert(client_id, tx);

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match SignalMessage::from_json(&text) {
                            Ok(msg) => process_message(client_id, msg, &state).await,
                            Err(e) => warn!("Invalid message from client {}: {}", client_id, e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error for client {}: {}", client_id, e);
                        break;
                    }
                    _ => {}
                }
            }

            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        let json = msg.to_json()?;
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    disconnect_client(client_id, &state).await;
    Ok(())
}

/// Apply one client message to the rendezvous state. All outbound traffic
/// goes through per-client channels, so replies and routed frames keep
/// their relative order.
async fn process_message(client_id: u64, msg: SignalMessage, state: &Arc<ServerState>) {
    match msg {
        SignalMessage::Listen { address, shared } => {
            let accepted = state
                .addresses
                .write()
                .await
                .listen(&address, client_id, shared);

            if accepted {
                info!("Client {} listening on '{}' (shared={})", client_id, address, shared);
                state.send(client_id, SignalMessage::ListenOk { address }).await;
            } else {
                debug!("Client {} denied listen on '{}'", client_id, address);
                state
                    .send(
                        client_id,
                        SignalMessage::ListenFailed {
                            address,
                            reason: "address in use".to_string(),
                        },
                    )
                    .await;
            }
        }

        SignalMessage::Unlisten { address } => {
            state.addresses.write().await.unlisten(&address, client_id);
            state.send(client_id, SignalMessage::Unlistened { address }).await;
        }

        SignalMessage::Dial {
            address,
            token,
            fanout,
        } => {
            let targets: Vec<u64> = if fanout {
                state.addresses.read().await.all(&address, client_id)
            } else {
                state
                    .addresses
                    .write()
                    .await
                    .pick(&address, client_id)
                    .into_iter()
                    .collect()
            };

            if targets.is_empty() {
                state
                    .send(
                        client_id,
                        SignalMessage::DialFailed {
                            token,
                            reason: "no listener".to_string(),
                        },
                    )
                    .await;
                return;
            }

            for (index, listener) in targets.into_iter().enumerate() {
                let link = state.next_link.fetch_add(1, Ordering::Relaxed);
                state.links.write().await.insert(
                    link,
                    Link {
                        a: client_id,
                        b: listener,
                        address: address.clone(),
                    },
                );

                debug!(
                    "Link {} formed: client {} -> listener {} ('{}')",
                    link, client_id, listener, address
                );

                state
                    .send(
                        listener,
                        SignalMessage::Incoming {
                            link,
                            address: address.clone(),
                        },
                    )
                    .await;

                if index == 0 {
                    state.send(client_id, SignalMessage::DialOk { token, link }).await;
                } else {
                    // Fanout extras surface as inbound links on the dialer
                    state
                        .send(
                            client_id,
                            SignalMessage::Incoming {
                                link,
                                address: address.clone(),
                            },
                        )
                        .await;
                }
            }
        }

        SignalMessage::Payload {
            link,
            reliable,
            data,
        } => {
            let target = {
                let links = state.links.read().await;
                links.get(&link).map(|l| if l.a == client_id { l.b } else { l.a })
            };
            // Unknown links race with teardown; drop silently
            if let Some(target) = target {
                state
                    .send(target, SignalMessage::Payload { link, reliable, data })
                    .await;
            }
        }

        SignalMessage::Hangup { link } => {
            if let Some(removed) = state.links.write().await.remove(&link) {
                state
                    .addresses
                    .write()
                    .await
                    .release(&removed.address, removed.b);
                // Both endpoints observe the close, the initiator included
                state.send(removed.a, SignalMessage::Closed { link }).await;
                state.send(removed.b, SignalMessage::Closed { link }).await;
            }
        }

        // Server -> client messages are ignored if received
        _ => {}
    }
}

/// Release everything a disconnecting client held: listens, links, slot
async fn disconnect_client(client_id: u64, state: &Arc<ServerState>) {
    state.clients.write().await.remove(&client_id);
    state.addresses.write().await.remove_client(client_id);

    let orphaned: Vec<(u64, u64, String, u64)> = {
        let mut links = state.links.write().await;
        let ids: Vec<u64> = links
            .iter()
            .filter(|(_, l)| l.a == client_id || l.b == client_id)
            .map(|(&id, _)| id)
            .collect();
        ids.into_iter()
            .filter_map(|id| {
                links.remove(&id).map(|l| {
                    let other = if l.a == client_id { l.b } else { l.a };
                    (id, other, l.address, l.b)
                })
            })
            .collect()
    };

    for (link, other, address, listener) in orphaned {
        state.addresses.write().await.release(&address, listener);
        state.send(other, SignalMessage::Closed { link }).await;
    }

    debug!("Client {} cleaned up", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_listen_always_succeeds() {
        let mut book = AddressBook::default();
        assert!(book.listen("a", 1, false));
        assert!(book.listen("b", 2, true));
    }

    #[test]
    fn test_exclusive_address_rejects_second_listener() {
        let mut book = AddressBook::default();
        assert!(book.listen("a", 1, false));
        assert!(!book.listen("a", 2, false));
        assert!(!book.listen("a", 2, true));
    }

    #[test]
    fn test_shared_address_joins_listener_set() {
        let mut book = AddressBook::default();
        assert!(book.listen("a", 1, true));
        assert!(book.listen("a", 2, true));
        // A non-sharing request never joins a shared set
        assert!(!book.listen("a", 3, false));
        assert_eq!(book.all("a", 99).len(), 2);
    }

    #[test]
    fn test_address_freed_after_last_unlisten() {
        let mut book = AddressBook::default();
        assert!(book.listen("a", 1, false));
        assert!(book.unlisten("a", 1));
        assert!(!book.unlisten("a", 1));
        // Freed address accepts a fresh exclusive listen
        assert!(book.listen("a", 2, false));
    }

    #[test]
    fn test_pick_round_robin_and_self_exclusion() {
        let mut book = AddressBook::default();
        book.listen("a", 1, true);
        book.listen("a", 2, true);

        let first = book.pick("a", 99).unwrap();
        let second = book.pick("a", 99).unwrap();
        assert_ne!(first, second);

        // A dialer never matches itself
        assert_eq!(book.pick("a", 1), Some(2));
        assert!(book.pick("missing", 1).is_none());
    }

    #[test]
    fn test_exclusive_listener_matched_once() {
        let mut book = AddressBook::default();
        book.listen("a", 1, false);

        assert_eq!(book.pick("a", 2), Some(1));
        // The listener is engaged; further dials find nobody
        assert!(book.pick("a", 3).is_none());
        assert!(book.all("a", 3).is_empty());

        // Its link going away frees it for the next dialer
        book.release("a", 1);
        assert_eq!(book.pick("a", 3), Some(1));
    }

    #[test]
    fn test_shared_listeners_match_repeatedly() {
        let mut book = AddressBook::default();
        book.listen("a", 1, true);

        assert_eq!(book.pick("a", 2), Some(1));
        assert_eq!(book.pick("a", 3), Some(1));
    }

    #[test]
    fn test_remove_client_releases_all_registrations() {
        let mut book = AddressBook::default();
        book.listen("a", 1, true);
        book.listen("a", 2, true);
        book.listen("b", 1, false);

        book.remove_client(1);
        assert_eq!(book.all("a", 99), vec![2]);
        assert!(book.pick("b", 99).is_none());
    }
}
