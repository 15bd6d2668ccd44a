//! Peer-link network: direct transport negotiated over relay signaling
//!
//! Implements the same polling contract as [`RelayNetwork`], but uses the
//! relay purely to exchange handshake metadata. Once candidate probing
//! succeeds, application traffic moves to a direct UDP path; when it cannot,
//! the connection either falls back to relaying through the signaling link
//! (when the configuration keeps it alive) or fails.
//!
//! The handshake is a state machine driven by discrete control messages and
//! a coarse timer tick; every outward effect is a queued event, so per-id
//! event order stays causal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{HandshakeMessage, Packet, MAX_PAYLOAD_SIZE};

use super::config::NetworkConfig;
use super::error::NetworkError;
use super::event::{ConnectionId, EventKind, EventQueue, NetworkEvent, NetworkStatus};
use super::interface::PollingNetwork;
use super::relay::{InstanceShared, RelayNetwork};
use super::stun;
use super::transport::UdpTransport;

/// Driver timer granularity; probes are re-sent at this cadence
const TICK: Duration = Duration::from_millis(250);
/// How long one negotiation round may take before the restart policy runs
const NEGOTIATION_WINDOW: Duration = Duration::from_secs(3);
/// Keep-alive cadence on an established direct path
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
/// Silence on a direct path longer than this counts as path loss
const DIRECT_TIMEOUT: Duration = Duration::from_secs(5);
/// STUN transaction budget during candidate gathering
const STUN_TIMEOUT_MS: u64 = 1500;

enum PeerCommand {
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

/// Lifecycle of one logical peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    /// Outbound: waiting for the signaling sub-connection to open
    AwaitingSignal,
    /// Signaling is up, own hello sent, peer's candidates not yet known
    AwaitingHello,
    /// Candidate pairs are being probed
    Probing,
    /// Direct path confirmed; data rides UDP
    Direct,
    /// Negotiation exhausted; data rides the signaling link
    Relayed,
}

struct PeerConn {
    /// Relay-side id of the signaling sub-connection, INVALID once dropped
    signal: ConnectionId,
    address: String,
    my_token: u64,
    pair_token: Option<u64>,
    /// The endpoint with the larger hello token drives restarts
    controlling: bool,
    state: PeerState,
    /// Whether `NewConnection` has been enqueued for this id
    announced: bool,
    sent_restart: u32,
    restarts: u32,
    remote_candidates: Vec<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    deadline: Instant,
    last_heard: Instant,
    last_keepalive: Instant,
}

impl PeerConn {
    fn new(signal: ConnectionId, address: String, state: PeerState) -> Self {
        let now = Instant::now();
        Self {
            signal,
            address,
            my_token: rand::random(),
            pair_token: None,
            controlling: false,
            state,
            announced: false,
            sent_restart: 0,
            restarts: 0,
            remote_candidates: Vec::new(),
            remote_addr: None,
            deadline: now + NEGOTIATION_WINDOW,
            last_heard: now,
            last_keepalive: now,
        }
    }
}

/// Network implementation with direct peer links and signaling fallback
pub struct PeerLinkNetwork {
    config: NetworkConfig,
    events: Arc<EventQueue>,
    shared: Arc<InstanceShared>,
    cmd_tx: mpsc::UnboundedSender<PeerCommand>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PeerLinkNetwork {
    /// Create an instance owning its signaling relay, built from the same
    /// configuration
    pub fn new(config: NetworkConfig) -> Self {
        let relay = Arc::new(RelayNetwork::new(config.clone()));
        Self::build(config, relay, true)
    }

    /// Create an instance borrowing an externally supplied relay for
    /// signaling. The relay's events are consumed by this instance's
    /// driver, so co-owners must coordinate their use of it.
    pub fn with_signaling(config: NetworkConfig, relay: Arc<RelayNetwork>) -> Self {
        Self::build(config, relay, false)
    }

    fn build(config: NetworkConfig, relay: Arc<RelayNetwork>, owns_relay: bool) -> Self {
        let events = Arc::new(EventQueue::new());
        let shared = Arc::new(InstanceShared::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let driver = PeerDriver::new(
            config.clone(),
            events.clone(),
            shared.clone(),
            relay,
            owns_relay,
        );
        let handle = tokio::spawn(driver.run(cmd_rx));

        Self {
            config,
            events,
            shared,
            cmd_tx,
            driver: Mutex::new(Some(handle)),
        }
    }

    fn command(&self, cmd: PeerCommand) {
        let _ = self.cmd_tx.send(cmd);
    }
}

impl PollingNetwork for PeerLinkNetwork {
    fn start_server(&self, address: Option<&str>) {
        self.shared.mark_connecting();
        self.command(PeerCommand::StartServer(address.map(|a| a.to_string())));
    }

    fn stop_server(&self) {
        self.command(PeerCommand::StopServer);
    }

    fn connect(&self, address: &str) -> ConnectionId {
        let id = self.shared.alloc_id();
        self.shared.mark_connecting();
        self.command(PeerCommand::Dial {
            address: address.to_string(),
            id,
        });
        id
    }

    fn disconnect(&self, id: ConnectionId) {
        if id.is_valid() {
            self.command(PeerCommand::Disconnect(id));
        }
    }

    fn send(&self, id: ConnectionId, data: &[u8], reliable: bool) {
        let Some(buffers) = self.shared.buffers(id) else {
            return;
        };
        buffers.add(reliable, data.len());
        self.command(PeerCommand::Send {
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
        self.command(PeerCommand::Shutdown);
    }
}

impl Drop for PeerLinkNetwork {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(PeerCommand::Shutdown);
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

enum Step {
    Command(Option<PeerCommand>),
    Relay,
    Packet(Option<(Packet, SocketAddr)>),
    Tick,
}

struct PeerDriver {
    config: NetworkConfig,
    events: Arc<EventQueue>,
    shared: Arc<InstanceShared>,
    relay: Arc<RelayNetwork>,
    relay_events: Arc<EventQueue>,
    owns_relay: bool,
    udp: Option<Arc<UdpTransport>>,
    udp_rx: Option<mpsc::Receiver<(Packet, SocketAddr)>>,
    udp_task: Option<tokio::task::JoinHandle<()>>,
    reflexive: Option<SocketAddr>,
    conns: HashMap<ConnectionId, PeerConn>,
    by_signal: HashMap<ConnectionId, ConnectionId>,
    by_token: HashMap<u64, ConnectionId>,
    listens_active: usize,
    server_pending: usize,
    next_seq: u32,
}

impl PeerDriver {
    fn new(
        config: NetworkConfig,
        events: Arc<EventQueue>,
        shared: Arc<InstanceShared>,
        relay: Arc<RelayNetwork>,
        owns_relay: bool,
    ) -> Self {
        let relay_events = relay.events();
        Self {
            config,
            events,
            shared,
            relay,
            relay_events,
            owns_relay,
            udp: None,
            udp_rx: None,
            udp_task: None,
            reflexive: None,
            conns: HashMap::new(),
            by_signal: HashMap::new(),
            by_token: HashMap::new(),
            listens_active: 0,
            server_pending: 0,
            next_seq: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<PeerCommand>) {
        let mut tick = tokio::time::interval(TICK);

        loop {
            let relay_events = self.relay_events.clone();
            let step = tokio::select! {
                cmd = cmd_rx.recv() => Step::Command(cmd),
                _ = relay_events.wait_nonempty() => Step::Relay,
                pkt = Self::udp_next(&mut self.udp_rx) => Step::Packet(pkt),
                _ = tick.tick() => Step::Tick,
            };

            match step {
                Step::Command(None) | Step::Command(Some(PeerCommand::Shutdown)) => {
                    self.shutdown().await;
                    break;
                }
                Step::Command(Some(cmd)) => self.handle_command(cmd).await,
                Step::Relay => {
                    while let Some(event) = self.relay_events.dequeue() {
                        self.handle_relay_event(event).await;
                    }
                }
                Step::Packet(Some((packet, from))) => self.handle_packet(packet, from).await,
                Step::Packet(None) => {
                    // Receive loop ended; stop polling the dead channel
                    self.udp_rx = None;
                }
                Step::Tick => self.handle_tick().await,
            }
        }
    }

    async fn udp_next(
        rx: &mut Option<mpsc::Receiver<(Packet, SocketAddr)>>,
    ) -> Option<(Packet, SocketAddr)> {
        match rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn handle_command(&mut self, cmd: PeerCommand) {
        match cmd {
            PeerCommand::StartServer(address) => {
                self.server_pending += 1;
                self.relay.start_server(address.as_deref());
            }

            PeerCommand::StopServer => {
                self.relay.stop_server();
            }

            PeerCommand::Dial { address, id } => {
                let signal = self.relay.connect(&address);
                debug!(
                    "Connection {} dialing '{}' (signal {})",
                    id, address, signal
                );
                let conn = PeerConn::new(signal, address, PeerState::AwaitingSignal);
                self.by_signal.insert(signal, id);
                self.conns.insert(id, conn);
                self.recalc_status();
            }

            PeerCommand::Disconnect(id) => {
                let Some(conn) = self.conns.get(&id) else {
                    return; // unknown id: safe no-op
                };
                if !conn.announced {
                    return; // the attempt will still resolve via events
                }
                self.close_remote(id).await;
                self.teardown(id, EventKind::Disconnected);
            }

            PeerCommand::Send { id, data, reliable } => {
                let amount = data.len();
                self.forward_data(id, data, reliable).await;
                if let Some(buffers) = self.shared.buffers(id) {
                    buffers.sub(reliable, amount);
                }
            }

            PeerCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    /// Route queued application data over the path the connection is on
    async fn forward_data(&mut self, id: ConnectionId, data: Vec<u8>, reliable: bool) {
        let Some(conn) = self.conns.get(&id) else {
            return;
        };
        match conn.state {
            PeerState::Direct => {
                // One datagram cannot carry more; larger messages ride the
                // signaling link while it is still open
                if data.len() > MAX_PAYLOAD_SIZE {
                    let signal = conn.signal;
                    if signal.is_valid() {
                        let msg = HandshakeMessage::App { reliable, data };
                        self.relay.send(signal, &msg.to_bytes(), reliable);
                    } else {
                        warn!(
                            "Dropping {}-byte send on connection {}: exceeds datagram capacity",
                            data.len(),
                            id
                        );
                    }
                    return;
                }
                let (Some(udp), Some(remote)) = (self.udp.clone(), conn.remote_addr) else {
                    return;
                };
                let token = conn.pair_token.unwrap_or_default();
                let seq = self.alloc_seq();
                let packet = Packet::data(seq, token, reliable, data);
                if let Err(e) = udp.send_to(&packet, remote).await {
                    warn!("Direct send to {} failed: {}", remote, e);
                }
            }
            PeerState::Relayed => {
                let msg = HandshakeMessage::App { reliable, data };
                self.relay.send(conn.signal, &msg.to_bytes(), reliable);
            }
            // Not usable before NewConnection; drop
            _ => {}
        }
    }

    async fn handle_relay_event(&mut self, event: NetworkEvent) {
        match event.kind {
            EventKind::ServerInitialized => {
                self.server_pending = self.server_pending.saturating_sub(1);
                self.listens_active += 1;
                self.events.enqueue(event);
                self.recalc_status();
            }
            EventKind::ServerInitFailed => {
                self.server_pending = self.server_pending.saturating_sub(1);
                self.events.enqueue(event);
                self.recalc_status();
            }
            EventKind::ServerClosed => {
                // A stop can land before the listen ever became active
                if self.listens_active > 0 {
                    self.listens_active -= 1;
                } else {
                    self.server_pending = self.server_pending.saturating_sub(1);
                }
                self.events.enqueue(event);
                self.recalc_status();
            }

            EventKind::NewConnection => {
                let signal = event.connection;
                let known = self.by_signal.get(&signal).copied();
                if let Some(id) = known {
                    // Outbound signaling sub-connection is up
                    if let Some(conn) = self.conns.get_mut(&id) {
                        conn.state = PeerState::AwaitingHello;
                        conn.deadline = Instant::now() + NEGOTIATION_WINDOW;
                    }
                    self.send_hello(id).await;
                } else {
                    // Inbound link matched by the rendezvous layer
                    let id = self.shared.alloc_id();
                    let address = event.address.clone().unwrap_or_default();
                    debug!(
                        "Inbound peer connection {} on '{}' (signal {})",
                        id, address, signal
                    );
                    let conn = PeerConn::new(signal, address, PeerState::AwaitingHello);
                    self.by_signal.insert(signal, id);
                    self.conns.insert(id, conn);
                    self.send_hello(id).await;
                    self.recalc_status();
                }
            }

            EventKind::ConnectionFailed => {
                if let Some(id) = self.by_signal.remove(&event.connection) {
                    debug!("Signaling dial for connection {} failed", id);
                    self.teardown(id, EventKind::ConnectionFailed);
                }
            }

            EventKind::Disconnected => {
                let Some(id) = self.by_signal.remove(&event.connection) else {
                    return; // already detached on purpose
                };
                let Some(conn) = self.conns.get_mut(&id) else {
                    return;
                };
                conn.signal = ConnectionId::INVALID;
                match conn.state {
                    // A live direct path survives signaling loss; it just
                    // cannot renegotiate anymore
                    PeerState::Direct => {}
                    // A peer that does not keep signaling alive hangs up as
                    // soon as its side confirms; probing may still succeed
                    // within the window
                    PeerState::Probing => {}
                    _ => {
                        let kind = if conn.announced {
                            EventKind::Disconnected
                        } else {
                            EventKind::ConnectionFailed
                        };
                        self.teardown(id, kind);
                    }
                }
            }

            EventKind::ReliableMessageReceived | EventKind::UnreliableMessageReceived => {
                let signal = event.connection;
                let Some(&id) = self.by_signal.get(&signal) else {
                    return;
                };
                let Some(data) = event.data else {
                    return;
                };
                match HandshakeMessage::from_bytes(&data) {
                    Some(HandshakeMessage::Hello {
                        token,
                        candidates,
                        restart,
                    }) => self.handle_hello(id, token, candidates, restart).await,
                    Some(HandshakeMessage::App { reliable, data }) => {
                        let announced = self.conns.get(&id).map(|c| c.announced).unwrap_or(false);
                        if announced {
                            self.events.enqueue(NetworkEvent::message(id, data, reliable));
                        }
                    }
                    Some(HandshakeMessage::Bye) => {
                        let kind = if self.conns.get(&id).map(|c| c.announced).unwrap_or(false) {
                            EventKind::Disconnected
                        } else {
                            EventKind::ConnectionFailed
                        };
                        self.relay_hangup(id);
                        self.teardown(id, kind);
                    }
                    None => warn!("Undecodable handshake payload on signal {}", signal),
                }
            }
        }
    }

    async fn handle_hello(
        &mut self,
        id: ConnectionId,
        token: u64,
        candidates: Vec<SocketAddr>,
        restart: u32,
    ) {
        let mut reply = false;
        {
            let Some(conn) = self.conns.get_mut(&id) else {
                return;
            };
            conn.remote_candidates = candidates;

            if conn.pair_token.is_none() {
                let pair = conn.my_token ^ token;
                conn.pair_token = Some(pair);
                conn.controlling = conn.my_token > token;
                self.by_token.insert(pair, id);
            }

            match conn.state {
                PeerState::AwaitingHello => {
                    conn.state = PeerState::Probing;
                    conn.deadline = Instant::now() + NEGOTIATION_WINDOW;
                }
                PeerState::Probing => {
                    conn.deadline = Instant::now() + NEGOTIATION_WINDOW;
                }
                // Controlling peer asked for a renegotiation
                PeerState::Direct | PeerState::Relayed if restart > conn.sent_restart => {
                    conn.state = PeerState::Probing;
                    conn.deadline = Instant::now() + NEGOTIATION_WINDOW;
                }
                _ => {}
            }

            if restart > conn.sent_restart {
                conn.sent_restart = restart;
                reply = true;
            }
        }

        if reply {
            self.send_hello(id).await;
        }
        self.probe(id).await;
    }

    async fn handle_packet(&mut self, packet: Packet, from: SocketAddr) {
        use crate::protocol::PacketType;

        let Some(&id) = self.by_token.get(&packet.token) else {
            return; // stale or foreign session
        };

        match packet.packet_type {
            PacketType::Probe => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.last_heard = Instant::now();
                }
                let seq = self.alloc_seq();
                if let Some(udp) = self.udp.clone() {
                    let ack = Packet::probe_ack(seq, packet.token);
                    if let Err(e) = udp.send_to(&ack, from).await {
                        warn!("Probe ack to {} failed: {}", from, e);
                    }
                }
            }

            PacketType::ProbeAck => {
                self.confirm_direct(id, from).await;
            }

            PacketType::Data => {
                // Data proves the path as well as an ack does
                self.confirm_direct(id, from).await;
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.last_heard = Instant::now();
                    if conn.announced {
                        self.events.enqueue(NetworkEvent::message(
                            id,
                            packet.payload,
                            packet.flags.reliable,
                        ));
                    }
                }
            }

            PacketType::KeepAlive => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.last_heard = Instant::now();
                }
            }

            PacketType::Close => {
                let kind = if self.conns.get(&id).map(|c| c.announced).unwrap_or(false) {
                    EventKind::Disconnected
                } else {
                    EventKind::ConnectionFailed
                };
                self.relay_hangup(id);
                self.teardown(id, kind);
            }
        }
    }

    /// A candidate pair worked: pin the remote address and announce the
    /// connection if this is the first confirmation
    async fn confirm_direct(&mut self, id: ConnectionId, remote: SocketAddr) {
        let mut announce = false;
        let mut drop_signal = ConnectionId::INVALID;
        {
            let Some(conn) = self.conns.get_mut(&id) else {
                return;
            };
            conn.last_heard = Instant::now();
            if conn.state != PeerState::Probing {
                return;
            }
            info!("Connection {} direct path confirmed via {}", id, remote);
            conn.state = PeerState::Direct;
            conn.remote_addr = Some(remote);
            if !conn.announced {
                conn.announced = true;
                announce = true;
            }
            if !self.config.keep_signaling_alive && conn.signal.is_valid() {
                drop_signal = conn.signal;
                conn.signal = ConnectionId::INVALID;
            }
        }

        if announce {
            let address = self
                .conns
                .get(&id)
                .map(|c| c.address.clone())
                .unwrap_or_default();
            self.events.enqueue(NetworkEvent::with_address(
                EventKind::NewConnection,
                id,
                address,
            ));
        }
        if drop_signal.is_valid() {
            // Free the private signaling sub-connection
            self.by_signal.remove(&drop_signal);
            self.relay.disconnect(drop_signal);
        }
        self.recalc_status();
    }

    async fn handle_tick(&mut self) {
        let now = Instant::now();
        let ids: Vec<ConnectionId> = self.conns.keys().copied().collect();

        for id in ids {
            let Some(conn) = self.conns.get(&id) else {
                continue;
            };
            let state = conn.state;
            let deadline = conn.deadline;
            let last_heard = conn.last_heard;
            let last_keepalive = conn.last_keepalive;

            match state {
                PeerState::AwaitingSignal => {
                    // The relay reports dial failures itself; nothing to time
                }
                PeerState::AwaitingHello | PeerState::Probing => {
                    if now >= deadline {
                        self.negotiation_expired(id).await;
                    } else if state == PeerState::Probing {
                        self.probe(id).await;
                    }
                }
                PeerState::Direct => {
                    if now.duration_since(last_heard) > DIRECT_TIMEOUT {
                        self.direct_path_lost(id).await;
                    } else if now.duration_since(last_keepalive) >= KEEPALIVE_INTERVAL {
                        self.send_keepalive(id).await;
                    }
                }
                PeerState::Relayed => {}
            }
        }
    }

    /// One negotiation round ran out: restart, fall back, or give up
    async fn negotiation_expired(&mut self, id: ConnectionId) {
        enum Outcome {
            Restart,
            Wait,
            Fallback,
            Fail(EventKind),
        }

        let outcome = {
            let Some(conn) = self.conns.get_mut(&id) else {
                return;
            };
            if conn.restarts < self.config.max_ice_restart && conn.signal.is_valid() {
                conn.restarts += 1;
                conn.deadline = Instant::now() + NEGOTIATION_WINDOW;
                // Only the controlling side re-offers; the other extends
                // its window and waits for the fresh hello
                if conn.controlling || conn.pair_token.is_none() {
                    conn.sent_restart = conn.restarts;
                    Outcome::Restart
                } else {
                    Outcome::Wait
                }
            } else if self.config.keep_signaling_alive
                && conn.signal.is_valid()
                && conn.pair_token.is_some()
            {
                info!("Connection {} falling back to relayed transport", id);
                conn.state = PeerState::Relayed;
                let announce = !conn.announced;
                conn.announced = true;
                if announce {
                    Outcome::Fallback
                } else {
                    return;
                }
            } else {
                let kind = if conn.announced {
                    EventKind::Disconnected
                } else {
                    EventKind::ConnectionFailed
                };
                Outcome::Fail(kind)
            }
        };

        match outcome {
            Outcome::Restart => {
                debug!("Connection {} restarting negotiation", id);
                self.send_hello(id).await;
                self.probe(id).await;
            }
            Outcome::Wait => {}
            Outcome::Fallback => {
                let address = self
                    .conns
                    .get(&id)
                    .map(|c| c.address.clone())
                    .unwrap_or_default();
                self.events.enqueue(NetworkEvent::with_address(
                    EventKind::NewConnection,
                    id,
                    address,
                ));
                self.recalc_status();
            }
            Outcome::Fail(kind) => {
                debug!("Connection {} negotiation gave up", id);
                self.relay_hangup(id);
                self.teardown(id, kind);
            }
        }
    }

    /// Keep-alives stopped arriving on an established direct path
    async fn direct_path_lost(&mut self, id: ConnectionId) {
        let can_restart = {
            let Some(conn) = self.conns.get_mut(&id) else {
                return;
            };
            if conn.restarts < self.config.max_ice_restart && conn.signal.is_valid() {
                warn!("Connection {} direct path lost, renegotiating", id);
                conn.restarts += 1;
                conn.state = PeerState::Probing;
                conn.remote_addr = None;
                conn.deadline = Instant::now() + NEGOTIATION_WINDOW;
                if conn.controlling {
                    conn.sent_restart = conn.restarts;
                }
                conn.controlling
            } else {
                warn!("Connection {} direct path lost", id);
                self.relay_hangup(id);
                self.teardown(id, EventKind::Disconnected);
                return;
            }
        };

        if can_restart {
            self.send_hello(id).await;
            self.probe(id).await;
        }
    }

    /// Send our hello (candidates + token) over the signaling link
    async fn send_hello(&mut self, id: ConnectionId) {
        if let Err(e) = self.ensure_udp().await {
            warn!("Candidate gathering failed: {}", e);
            self.relay_hangup(id);
            self.teardown(id, EventKind::ConnectionFailed);
            return;
        }
        let candidates = self.candidates();

        let Some(conn) = self.conns.get(&id) else {
            return;
        };
        if !conn.signal.is_valid() {
            return;
        }
        let msg = HandshakeMessage::Hello {
            token: conn.my_token,
            candidates,
            restart: conn.sent_restart,
        };
        self.relay.send(conn.signal, &msg.to_bytes(), true);
    }

    /// Probe every known remote candidate for one connection
    async fn probe(&mut self, id: ConnectionId) {
        let Some(conn) = self.conns.get(&id) else {
            return;
        };
        if conn.state != PeerState::Probing {
            return;
        }
        let Some(token) = conn.pair_token else {
            return;
        };
        let targets = conn.remote_candidates.clone();
        let Some(udp) = self.udp.clone() else {
            return;
        };

        for target in targets {
            let seq = self.alloc_seq();
            let packet = Packet::probe(seq, token);
            if let Err(e) = udp.send_to(&packet, target).await {
                debug!("Probe to {} failed: {}", target, e);
            }
        }
    }

    async fn send_keepalive(&mut self, id: ConnectionId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        let (Some(remote), Some(token)) = (conn.remote_addr, conn.pair_token) else {
            return;
        };
        conn.last_keepalive = Instant::now();
        let seq = self.alloc_seq();
        if let Some(udp) = self.udp.clone() {
            let packet = Packet::keep_alive(seq, token);
            if let Err(e) = udp.send_to(&packet, remote).await {
                warn!("Keep-alive to {} failed: {}", remote, e);
            }
        }
    }

    /// Best-effort close notification over whichever paths still exist
    async fn close_remote(&mut self, id: ConnectionId) {
        let Some(conn) = self.conns.get(&id) else {
            return;
        };
        let direct = conn.remote_addr.zip(conn.pair_token);
        let signal = conn.signal;

        if let Some((remote, token)) = direct {
            if let Some(udp) = self.udp.clone() {
                let seq = self.alloc_seq();
                let _ = udp.send_to(&Packet::close(seq, token), remote).await;
            }
        }
        if signal.is_valid() {
            self.relay
                .send(signal, &HandshakeMessage::Bye.to_bytes(), true);
        }
        self.relay_hangup(id);
    }

    /// Release the signaling sub-connection of one peer connection
    fn relay_hangup(&mut self, id: ConnectionId) {
        if let Some(conn) = self.conns.get_mut(&id) {
            if conn.signal.is_valid() {
                let signal = conn.signal;
                conn.signal = ConnectionId::INVALID;
                self.by_signal.remove(&signal);
                self.relay.disconnect(signal);
            }
        }
    }

    /// Remove one connection and enqueue its terminal event
    fn teardown(&mut self, id: ConnectionId, kind: EventKind) {
        let Some(conn) = self.conns.remove(&id) else {
            return;
        };
        if conn.signal.is_valid() {
            self.by_signal.remove(&conn.signal);
        }
        if let Some(token) = conn.pair_token {
            self.by_token.remove(&token);
        }
        self.shared.drop_id(id);

        let event = match kind {
            EventKind::ConnectionFailed => {
                NetworkEvent::with_address(kind, id, conn.address.clone())
            }
            _ => NetworkEvent::new(kind, id),
        };
        self.events.enqueue(event);
        self.recalc_status();
    }

    async fn ensure_udp(&mut self) -> Result<(), NetworkError> {
        if self.udp.is_some() {
            return Ok(());
        }

        let transport = Arc::new(UdpTransport::bind("0.0.0.0:0").await?);

        // Reflexive discovery runs before the receive loop takes over the
        // socket; failure just narrows the candidate set
        if let Some(server) = self.config.stun_server() {
            match stun::discover_mapped_address(transport.socket(), &server, STUN_TIMEOUT_MS).await
            {
                Ok(addr) => self.reflexive = Some(addr),
                Err(e) => warn!("STUN discovery via {} failed: {}", server, e),
            }
        }

        let (rx, task) = transport.clone().start_receive_loop();
        self.udp = Some(transport);
        self.udp_rx = Some(rx);
        self.udp_task = Some(task);
        Ok(())
    }

    /// Candidate addresses for the local end: loopback, local interface,
    /// and the STUN-discovered reflexive address when one exists
    fn candidates(&self) -> Vec<SocketAddr> {
        let mut out = Vec::new();
        let Some(udp) = self.udp.as_ref() else {
            return out;
        };
        let port = udp.local_addr().port();

        out.push(SocketAddr::new([127, 0, 0, 1].into(), port));
        if let Ok(ip) = local_ip_address::local_ip() {
            let addr = SocketAddr::new(ip, port);
            if !out.contains(&addr) {
                out.push(addr);
            }
        }
        if let Some(reflexive) = self.reflexive {
            if !out.contains(&reflexive) {
                out.push(reflexive);
            }
        }
        out
    }

    fn alloc_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    async fn shutdown(&mut self) {
        let ids: Vec<ConnectionId> = self.conns.keys().copied().collect();
        for id in ids {
            let announced = self.conns.get(&id).map(|c| c.announced).unwrap_or(false);
            self.close_remote(id).await;
            if announced {
                self.teardown(id, EventKind::Disconnected);
            } else {
                // Quietly drop attempts that never became observable
                if let Some(conn) = self.conns.remove(&id) {
                    if let Some(token) = conn.pair_token {
                        self.by_token.remove(&token);
                    }
                    self.shared.drop_id(id);
                }
            }
        }

        if let Some(task) = self.udp_task.take() {
            task.abort();
        }
        self.udp = None;
        self.udp_rx = None;

        if self.owns_relay {
            self.relay.shutdown();
        }
        self.shared.set_status(NetworkStatus::NotConnected);
        info!("Peer-link network shut down");
    }

    fn recalc_status(&self) {
        let active = self.listens_active > 0 || self.conns.values().any(|c| c.announced);
        let pending = self.server_pending > 0 || self.conns.values().any(|c| !c.announced);

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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_id_is_safe() {
        let network = PeerLinkNetwork::new(NetworkConfig::default());
        let stale = ConnectionId(7);

        network.disconnect(stale);
        network.send(stale, b"data", false);
        assert_eq!(network.buffered_amount(stale, true), 0);
        assert_eq!(network.buffered_amount(stale, false), 0);
    }

    #[tokio::test]
    async fn test_config_snapshot_is_clean() {
        let config = NetworkConfig {
            signaling_url: Some("ws://127.0.0.1:1".to_string()),
            ..NetworkConfig::default()
        };
        let network = PeerLinkNetwork::new(config.clone());
        assert_eq!(network.config(), &config);
    }

    #[test]
    fn test_pair_token_symmetry() {
        // Both sides derive the same session token and opposite roles
        let a: u64 = 7;
        let b: u64 = 12;
        assert_eq!(a ^ b, b ^ a);
        assert!((a > b) != (b > a));
    }

    fn driver(config: NetworkConfig) -> PeerDriver {
        let relay = Arc::new(RelayNetwork::new(config.clone()));
        PeerDriver::new(
            config,
            Arc::new(EventQueue::new()),
            Arc::new(InstanceShared::new()),
            relay,
            true,
        )
    }

    /// Insert a connection mid-handshake, as if hellos were already
    /// exchanged over a live signaling sub-connection
    fn seed_conn(driver: &mut PeerDriver, state: PeerState, controlling: bool) -> ConnectionId {
        let id = driver.shared.alloc_id();
        let mut conn = PeerConn::new(ConnectionId(1), "room".to_string(), state);
        conn.pair_token = Some(42);
        conn.controlling = controlling;
        driver.by_signal.insert(ConnectionId(1), id);
        driver.by_token.insert(42, id);
        driver.conns.insert(id, conn);
        id
    }

    #[tokio::test]
    async fn test_restart_budget_then_relay_fallback() {
        let config = NetworkConfig {
            max_ice_restart: 2,
            keep_signaling_alive: true,
            ..NetworkConfig::default()
        };
        let mut driver = driver(config);
        let id = seed_conn(&mut driver, PeerState::Probing, true);

        // Each expiry within the budget restarts the round without any
        // outward event
        driver.negotiation_expired(id).await;
        driver.negotiation_expired(id).await;
        let conn = driver.conns.get(&id).unwrap();
        assert_eq!(conn.state, PeerState::Probing);
        assert_eq!(conn.restarts, 2);
        assert!(driver.events.dequeue().is_none());

        // Budget spent: the still-open signaling link becomes the transport
        driver.negotiation_expired(id).await;
        assert_eq!(driver.conns.get(&id).unwrap().state, PeerState::Relayed);
        let event = driver.events.dequeue().expect("fallback must announce");
        assert_eq!(event.kind, EventKind::NewConnection);
        assert_eq!(event.connection, id);
        assert_eq!(driver.shared.status(), NetworkStatus::Connected);
    }

    #[tokio::test]
    async fn test_restart_exhaustion_without_fallback_fails_once() {
        let config = NetworkConfig {
            max_ice_restart: 0,
            keep_signaling_alive: false,
            ..NetworkConfig::default()
        };
        let mut driver = driver(config);
        let id = seed_conn(&mut driver, PeerState::Probing, true);

        driver.negotiation_expired(id).await;

        let event = driver.events.dequeue().expect("terminal event missing");
        assert_eq!(event.kind, EventKind::ConnectionFailed);
        assert_eq!(event.connection, id);
        assert_eq!(event.address.as_deref(), Some("room"));
        assert!(driver.events.dequeue().is_none());
        assert!(driver.conns.is_empty());
        assert_eq!(driver.shared.status(), NetworkStatus::NotConnected);
    }

    #[tokio::test]
    async fn test_direct_path_loss_renegotiates_within_budget() {
        let config = NetworkConfig {
            max_ice_restart: 1,
            ..NetworkConfig::default()
        };
        let mut driver = driver(config);
        let id = seed_conn(&mut driver, PeerState::Direct, true);
        {
            let conn = driver.conns.get_mut(&id).unwrap();
            conn.announced = true;
            conn.remote_addr = Some("127.0.0.1:9".parse().unwrap());
        }

        // First loss renegotiates over the signaling link
        driver.direct_path_lost(id).await;
        let conn = driver.conns.get(&id).unwrap();
        assert_eq!(conn.state, PeerState::Probing);
        assert_eq!(conn.restarts, 1);
        assert!(conn.remote_addr.is_none());
        assert!(driver.events.dequeue().is_none());

        // Second loss exhausts the budget and closes the connection
        driver.direct_path_lost(id).await;
        let event = driver.events.dequeue().expect("terminal event missing");
        assert_eq!(event.kind, EventKind::Disconnected);
        assert_eq!(event.connection, id);
        assert!(driver.conns.is_empty());
    }

    #[tokio::test]
    async fn test_non_controlling_side_waits_on_expiry() {
        let mut driver = driver(NetworkConfig::default());
        let id = seed_conn(&mut driver, PeerState::Probing, false);

        // The other endpoint drives restarts; this side only extends its
        // window and counts the round against the budget
        driver.negotiation_expired(id).await;
        let conn = driver.conns.get(&id).unwrap();
        assert_eq!(conn.state, PeerState::Probing);
        assert_eq!(conn.restarts, 1);
        assert_eq!(conn.sent_restart, 0);
        assert!(driver.events.dequeue().is_none());
    }
}
