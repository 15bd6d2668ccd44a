//! Relay network: the polling contract over a signaling-server connection
//!
//! All traffic, control and data alike, rides one WebSocket control
//! connection to the configured signaling endpoint. The public methods post
//! commands to a driver task; the driver owns the socket and serializes
//! every observable effect into the event queue, which keeps per-connection
//! event order causal without caller-side locking.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::SignalMessage;

use super::config::NetworkConfig;
use super::error::NetworkError;
use super::event::{ConnectionId, EventKind, EventQueue, NetworkEvent, NetworkStatus};
use super::interface::PollingNetwork;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound-buffer occupancy for one connection, split by channel class
#[derive(Default)]
pub(crate) struct ChannelBuffers {
    reliable: AtomicUsize,
    unreliable: AtomicUsize,
}

impl ChannelBuffers {
    pub(crate) fn add(&self, reliable: bool, amount: usize) {
        self.counter(reliable).fetch_add(amount, Ordering::Relaxed);
    }

    pub(crate) fn sub(&self, reliable: bool, amount: usize) {
        let counter = self.counter(reliable);
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(amount);
            match counter.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn get(&self, reliable: bool) -> usize {
        self.counter(reliable).load(Ordering::Relaxed)
    }

    fn counter(&self, reliable: bool) -> &AtomicUsize {
        if reliable {
            &self.reliable
        } else {
            &self.unreliable
        }
    }
}

/// State shared between the public handle and the driver task
pub(crate) struct InstanceShared {
    status: AtomicU8,
    next_id: AtomicU32,
    buffers: RwLock<HashMap<ConnectionId, Arc<ChannelBuffers>>>,
}

impl InstanceShared {
    pub(crate) fn new() -> Self {
        Self {
            status: AtomicU8::new(NetworkStatus::NotConnected as u8),
            next_id: AtomicU32::new(1),
            buffers: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn alloc_id(&self) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.buffers
            .write()
            .insert(id, Arc::new(ChannelBuffers::default()));
        id
    }

    pub(crate) fn drop_id(&self, id: ConnectionId) {
        self.buffers.write().remove(&id);
    }

    pub(crate) fn buffers(&self, id: ConnectionId) -> Option<Arc<ChannelBuffers>> {
        self.buffers.read().get(&id).cloned()
    }

    pub(crate) fn buffered_amount(&self, id: ConnectionId, reliable: bool) -> usize {
        self.buffers
            .read()
            .get(&id)
            .map(|b| b.get(reliable))
            .unwrap_or(0)
    }

    pub(crate) fn status(&self) -> NetworkStatus {
        NetworkStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn set_status(&self, status: NetworkStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Move `NotConnected -> Connecting` when an operation starts
    pub(crate) fn mark_connecting(&self) {
        let _ = self.status.compare_exchange(
            NetworkStatus::NotConnected as u8,
            NetworkStatus::Connecting as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

enum RelayCommand {
    StartServer(Option<String>),
    StopServer,
    Dial { address: String, id: ConnectionId },
    Disconnect(ConnectionId),
    Send {
        id: ConnectionId,
        data: Vec<u8>,
        reliable: bool,
    },
    Shutdown,
}

/// Network implementation carried entirely by the signaling relay
pub struct RelayNetwork {
    config: NetworkConfig,
    events: Arc<EventQueue>,
    shared: Arc<InstanceShared>,
    cmd_tx: mpsc::UnboundedSender<RelayCommand>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RelayNetwork {
    /// Create an instance. The control connection to the signaling endpoint
    /// is established lazily by the first operation that needs it.
    pub fn new(config: NetworkConfig) -> Self {
        let events = Arc::new(EventQueue::new());
        let shared = Arc::new(InstanceShared::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let driver = RelayDriver::new(config.clone(), events.clone(), shared.clone());
        let handle = tokio::spawn(driver.run(cmd_rx));

        Self {
            config,
            events,
            shared,
            cmd_tx,
            driver: Mutex::new(Some(handle)),
        }
    }

    /// The instance's event queue, for drivers that consume relay events
    /// internally (the peer-link network)
    pub(crate) fn events(&self) -> Arc<EventQueue> {
        self.events.clone()
    }

    fn command(&self, cmd: RelayCommand) {
        // A closed channel means the driver already shut down; commands
        // after shutdown are defined as no-ops
        let _ = self.cmd_tx.send(cmd);
    }
}

impl PollingNetwork for RelayNetwork {
    fn start_server(&self, address: Option<&str>) {
        self.shared.mark_connecting();
        self.command(RelayCommand::StartServer(address.map(|a| a.to_string())));
    }

    fn stop_server(&self) {
        self.command(RelayCommand::StopServer);
    }

    fn connect(&self, address: &str) -> ConnectionId {
        let id = self.shared.alloc_id();
        self.shared.mark_connecting();
        self.command(RelayCommand::Dial {
            address: address.to_string(),
            id,
        });
        id
    }

    fn disconnect(&self, id: ConnectionId) {
        if id.is_valid() {
            self.command(RelayCommand::Disconnect(id));
        }
    }

    fn send(&self, id: ConnectionId, data: &[u8], reliable: bool) {
        let Some(buffers) = self.shared.buffers(id) else {
            return; // unknown id: safe no-op
        };
        buffers.add(reliable, data.len());
        self.command(RelayCommand::Send {
            id,
            data: data.to_vec(),
            reliable,
        });
    }

    fn dequeue(&self) -> Option<NetworkEvent> {
        self.events.dequeue()
    }

    fn buffered_amount(&self, id: ConnectionId, reliable: bool) -> usize {
        self.shared.buffered_amount(id, reliable)
    }

    fn status(&self) -> NetworkStatus {
        self.shared.status()
    }

    fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn shutdown(&self) {
        self.command(RelayCommand::Shutdown);
    }
}

impl Drop for RelayNetwork {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(RelayCommand::Shutdown);
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

/// Generate a short rendezvous address when the caller lets the
/// implementation choose one
fn generate_address() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ListenState {
    Pending,
    Active,
}

struct RelayDriver {
    config: NetworkConfig,
    events: Arc<EventQueue>,
    shared: Arc<InstanceShared>,
    ws: Option<WsStream>,
    listens: HashMap<String, ListenState>,
    stopping: HashSet<String>,
    pending_dials: HashMap<u64, (ConnectionId, String)>,
    link_to_conn: HashMap<u64, ConnectionId>,
    conn_to_link: HashMap<ConnectionId, u64>,
}

impl RelayDriver {
    fn new(config: NetworkConfig, events: Arc<EventQueue>, shared: Arc<InstanceShared>) -> Self {
        Self {
            config,
            events,
            shared,
            ws: None,
            listens: HashMap::new(),
            stopping: HashSet::new(),
            pending_dials: HashMap::new(),
            link_to_conn: HashMap::new(),
            conn_to_link: HashMap::new(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<RelayCommand>) {
        loop {
            let step = tokio::select! {
                cmd = cmd_rx.recv() => Step::Command(cmd),
                msg = Self::ws_next(&mut self.ws) => Step::Socket(msg),
            };

            match step {
                Step::Command(None) | Step::Command(Some(RelayCommand::Shutdown)) => {
                    self.shutdown().await;
                    break;
                }
                Step::Command(Some(cmd)) => self.handle_command(cmd).await,
                Step::Socket(Some(Ok(Message::Text(text)))) => {
                    match SignalMessage::from_json(&text) {
                        Ok(msg) => self.handle_signal(msg),
                        Err(e) => warn!("Invalid signaling message: {}", e),
                    }
                }
                Step::Socket(Some(Ok(Message::Close(_)))) | Step::Socket(None) => {
                    self.endpoint_lost();
                }
                Step::Socket(Some(Err(e))) => {
                    warn!("Signaling socket error: {}", e);
                    self.endpoint_lost();
                }
                Step::Socket(Some(Ok(_))) => {}
            }
        }
    }

    /// Await the next frame, pending forever while no socket exists so
    /// commands remain the only wake-up source
    async fn ws_next(
        ws: &mut Option<WsStream>,
    ) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
        match ws.as_mut() {
            Some(stream) => stream.next().await,
            None => std::future::pending().await,
        }
    }

    async fn handle_command(&mut self, cmd: RelayCommand) {
        match cmd {
            RelayCommand::StartServer(address) => {
                let address = address.unwrap_or_else(generate_address);
                if let Err(e) = self.ensure_ws().await {
                    debug!("Server start on '{}' failed: {}", address, e);
                    self.events.enqueue(NetworkEvent::with_address(
                        EventKind::ServerInitFailed,
                        ConnectionId::INVALID,
                        address,
                    ));
                    self.recalc_status();
                    return;
                }
                self.listens.insert(address.clone(), ListenState::Pending);
                self.send_signal(SignalMessage::Listen {
                    address,
                    shared: self.config.is_conference,
                })
                .await;
            }

            RelayCommand::StopServer => {
                let addresses: Vec<String> = self.listens.keys().cloned().collect();
                if self.ws.is_none() {
                    for address in addresses {
                        self.listens.remove(&address);
                        self.events.enqueue(NetworkEvent::with_address(
                            EventKind::ServerClosed,
                            ConnectionId::INVALID,
                            address,
                        ));
                    }
                    self.recalc_status();
                    return;
                }
                for address in addresses {
                    self.stopping.insert(address.clone());
                    self.send_signal(SignalMessage::Unlisten { address }).await;
                }
            }

            RelayCommand::Dial { address, id } => {
                if let Err(e) = self.ensure_ws().await {
                    debug!("Dial to '{}' failed: {}", address, e);
                    self.fail_connection(id, &address);
                    return;
                }
                let token = id.0 as u64;
                self.pending_dials.insert(token, (id, address.clone()));
                self.send_signal(SignalMessage::Dial {
                    address,
                    token,
                    fanout: self.config.is_conference,
                })
                .await;
            }

            RelayCommand::Disconnect(id) => {
                // Known and established only; stale ids are a no-op
                let link = self.conn_to_link.get(&id).copied();
                if let Some(link) = link {
                    self.send_signal(SignalMessage::Hangup { link }).await;
                }
            }

            RelayCommand::Send { id, data, reliable } => {
                let amount = data.len();
                let link = self.conn_to_link.get(&id).copied();
                if let Some(link) = link {
                    self.send_signal(SignalMessage::Payload {
                        link,
                        reliable,
                        data,
                    })
                    .await;
                }
                // The frame left the outbound buffer whether or not a link
                // was still there to carry it
                if let Some(buffers) = self.shared.buffers(id) {
                    buffers.sub(reliable, amount);
                }
            }

            RelayCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn handle_signal(&mut self, msg: SignalMessage) {
        match msg {
            SignalMessage::ListenOk { address } => {
                if self.listens.contains_key(&address) {
                    self.listens.insert(address.clone(), ListenState::Active);
                    info!("Serving at '{}'", address);
                    self.events.enqueue(NetworkEvent::with_address(
                        EventKind::ServerInitialized,
                        ConnectionId::INVALID,
                        address,
                    ));
                    self.recalc_status();
                }
            }

            SignalMessage::ListenFailed { address, reason } => {
                if self.listens.remove(&address).is_some() {
                    debug!("Server start on '{}' rejected: {}", address, reason);
                    self.events.enqueue(NetworkEvent::with_address(
                        EventKind::ServerInitFailed,
                        ConnectionId::INVALID,
                        address,
                    ));
                    self.recalc_status();
                }
            }

            SignalMessage::Unlistened { address } => {
                self.stopping.remove(&address);
                if self.listens.remove(&address).is_some() {
                    self.events.enqueue(NetworkEvent::with_address(
                        EventKind::ServerClosed,
                        ConnectionId::INVALID,
                        address,
                    ));
                    self.recalc_status();
                }
            }

            SignalMessage::DialOk { token, link } => {
                if let Some((id, address)) = self.pending_dials.remove(&token) {
                    debug!("Connection {} established over link {}", id, link);
                    self.link_to_conn.insert(link, id);
                    self.conn_to_link.insert(id, link);
                    self.events.enqueue(NetworkEvent::with_address(
                        EventKind::NewConnection,
                        id,
                        address,
                    ));
                    self.recalc_status();
                }
            }

            SignalMessage::DialFailed { token, reason } => {
                if let Some((id, address)) = self.pending_dials.remove(&token) {
                    debug!("Connection {} to '{}' failed: {}", id, address, reason);
                    self.fail_connection(id, &address);
                }
            }

            SignalMessage::Incoming { link, address } => {
                let id = self.shared.alloc_id();
                debug!("Inbound connection {} on '{}' (link {})", id, address, link);
                self.link_to_conn.insert(link, id);
                self.conn_to_link.insert(id, link);
                self.events.enqueue(NetworkEvent::with_address(
                    EventKind::NewConnection,
                    id,
                    address,
                ));
                self.recalc_status();
            }

            SignalMessage::Payload {
                link,
                reliable,
                data,
            } => {
                if let Some(&id) = self.link_to_conn.get(&link) {
                    self.events.enqueue(NetworkEvent::message(id, data, reliable));
                }
            }

            SignalMessage::Closed { link } => {
                if let Some(id) = self.link_to_conn.remove(&link) {
                    self.conn_to_link.remove(&id);
                    self.shared.drop_id(id);
                    self.events
                        .enqueue(NetworkEvent::new(EventKind::Disconnected, id));
                    self.recalc_status();
                }
            }

            SignalMessage::Error { message } => {
                warn!("Signaling endpoint error: {}", message);
            }

            // Client -> server messages never arrive here
            _ => {}
        }
    }

    async fn ensure_ws(&mut self) -> Result<(), NetworkError> {
        if self.ws.is_some() {
            return Ok(());
        }
        let url = self
            .config
            .signaling_url
            .clone()
            .ok_or_else(|| NetworkError::InvalidConfig("no signaling url".to_string()))?;
        let (stream, _) = connect_async(&url)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Connect failed: {}", e)))?;
        debug!("Connected to signaling endpoint {}", url);
        self.ws = Some(stream);
        Ok(())
    }

    async fn send_signal(&mut self, msg: SignalMessage) {
        let Some(ws) = self.ws.as_mut() else {
            return;
        };
        let json = match msg.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode signaling message: {}", e);
                return;
            }
        };
        if ws.send(Message::Text(json)).await.is_err() {
            self.endpoint_lost();
        }
    }

    fn fail_connection(&mut self, id: ConnectionId, address: &str) {
        self.shared.drop_id(id);
        self.events.enqueue(NetworkEvent::with_address(
            EventKind::ConnectionFailed,
            id,
            address.to_string(),
        ));
        self.recalc_status();
    }

    /// The control connection is gone: every role it carried ends now
    fn endpoint_lost(&mut self) {
        warn!("Signaling endpoint connection lost");
        self.ws = None;

        for (id, _) in std::mem::take(&mut self.conn_to_link) {
            self.shared.drop_id(id);
            self.events
                .enqueue(NetworkEvent::new(EventKind::Disconnected, id));
        }
        self.link_to_conn.clear();

        for (id, address) in std::mem::take(&mut self.pending_dials).into_values() {
            self.shared.drop_id(id);
            self.events.enqueue(NetworkEvent::with_address(
                EventKind::ConnectionFailed,
                id,
                address,
            ));
        }

        for (address, state) in std::mem::take(&mut self.listens) {
            let kind = match state {
                ListenState::Pending => EventKind::ServerInitFailed,
                ListenState::Active => EventKind::ServerClosed,
            };
            self.events.enqueue(NetworkEvent::with_address(
                kind,
                ConnectionId::INVALID,
                address,
            ));
        }
        self.stopping.clear();

        self.recalc_status();
    }

    async fn shutdown(&mut self) {
        let links: Vec<u64> = self.link_to_conn.keys().copied().collect();
        for link in links {
            self.send_signal(SignalMessage::Hangup { link }).await;
        }
        for (id, _) in std::mem::take(&mut self.conn_to_link) {
            self.shared.drop_id(id);
            self.events
                .enqueue(NetworkEvent::new(EventKind::Disconnected, id));
        }
        for (address, state) in std::mem::take(&mut self.listens) {
            if state == ListenState::Active {
                self.events.enqueue(NetworkEvent::with_address(
                    EventKind::ServerClosed,
                    ConnectionId::INVALID,
                    address,
                ));
            }
        }
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
        }
        self.shared.set_status(NetworkStatus::NotConnected);
        info!("Relay network shut down");
    }

    fn recalc_status(&self) {
        let active = !self.conn_to_link.is_empty()
            || self.listens.values().any(|s| *s == ListenState::Active);
        let pending = !self.pending_dials.is_empty()
            || self.listens.values().any(|s| *s == ListenState::Pending);

        let status = if active {
            NetworkStatus::Connected
        } else if pending {
            NetworkStatus::Connecting
        } else {
            NetworkStatus::NotConnected
        };
        self.shared.set_status(status);
    }
}

enum Step {
    Command(Option<RelayCommand>),
    Socket(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_address_length() {
        let address = generate_address();
        assert_eq!(address.len(), 8);
        assert_ne!(address, generate_address());
    }

    #[test]
    fn test_channel_buffers_accounting() {
        let buffers = ChannelBuffers::default();
        buffers.add(true, 10);
        buffers.add(false, 3);
        assert_eq!(buffers.get(true), 10);
        assert_eq!(buffers.get(false), 3);

        buffers.sub(true, 4);
        assert_eq!(buffers.get(true), 6);

        // Underflow clamps to zero
        buffers.sub(false, 100);
        assert_eq!(buffers.get(false), 0);
    }

    #[tokio::test]
    async fn test_unknown_id_is_safe() {
        let network = RelayNetwork::new(NetworkConfig::default());
        let stale = ConnectionId(42);

        network.disconnect(stale);
        network.send(stale, b"data", true);
        assert_eq!(network.buffered_amount(stale, true), 0);
        assert_eq!(network.buffered_amount(stale, false), 0);
        assert_eq!(network.status(), NetworkStatus::NotConnected);
    }

    #[tokio::test]
    async fn test_connect_without_signaling_url_fails() {
        let network = RelayNetwork::new(NetworkConfig::default());
        let id = network.connect("nowhere");
        assert!(id.is_valid());

        // Failure surfaces as an event, never as a fault
        let event = loop {
            if let Some(event) = network.dequeue() {
                break event;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert_eq!(event.kind, EventKind::ConnectionFailed);
        assert_eq!(event.connection, id);
        assert_eq!(network.status(), NetworkStatus::NotConnected);
    }
}
