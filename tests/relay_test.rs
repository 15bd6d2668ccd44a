//! End-to-end tests for the relay transport against a live signaling
//! endpoint
//!
//! Every test spins up its own endpoint on an ephemeral port; instances
//! interact only through the polling contract, never through internals.

use std::time::Duration;

use switchboard::{
    ConnectionId, EventKind, NetworkConfig, NetworkEvent, NetworkStatus, PollingNetwork,
    RelayNetwork, SignalingServer,
};

/// Spawn a signaling endpoint and return its WebSocket URL
async fn spawn_endpoint() -> String {
    let server = SignalingServer::new();
    let addr = server
        .spawn("127.0.0.1:0")
        .await
        .expect("endpoint bind failed");
    format!("ws://{}", addr)
}

fn config(url: &str) -> NetworkConfig {
    NetworkConfig {
        signaling_url: Some(url.to_string()),
        ..NetworkConfig::default()
    }
}

/// Poll one instance until an event of the given kind arrives, discarding
/// interleaved events of other kinds
async fn wait_for(network: &dyn PollingNetwork, kind: EventKind) -> NetworkEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(event) = network.dequeue() {
                if event.kind == kind {
                    return event;
                }
                continue;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}", kind))
}

/// Test: starting a server yields ServerInitialized carrying the address
#[tokio::test]
async fn test_server_initialized() {
    let url = spawn_endpoint().await;
    let server = RelayNetwork::new(config(&url));

    server.start_server(Some("lobby"));
    let event = wait_for(&server, EventKind::ServerInitialized).await;

    assert_eq!(event.connection, ConnectionId::INVALID);
    assert_eq!(event.address.as_deref(), Some("lobby"));
    assert_eq!(server.status(), NetworkStatus::Connected);
}

/// Test: starting a server with no address gets an auto-chosen one
#[tokio::test]
async fn test_server_auto_address() {
    let url = spawn_endpoint().await;
    let server = RelayNetwork::new(config(&url));

    server.start_server(None);
    let event = wait_for(&server, EventKind::ServerInitialized).await;

    let address = event.address.expect("auto address missing");
    assert!(!address.is_empty(), "auto-chosen address must be non-empty");
}

/// Test: connecting a client to a listening server yields exactly one
/// NewConnection on each side, with the client's id equal to the one
/// returned by connect
#[tokio::test]
async fn test_connect_pairs_both_sides() {
    let url = spawn_endpoint().await;
    let server = RelayNetwork::new(config(&url));
    let client = RelayNetwork::new(config(&url));

    server.start_server(Some("pair-room"));
    wait_for(&server, EventKind::ServerInitialized).await;

    let id = client.connect("pair-room");
    assert!(id.is_valid(), "connect must return a real id");

    let client_event = wait_for(&client, EventKind::NewConnection).await;
    assert_eq!(client_event.connection, id);

    let server_event = wait_for(&server, EventKind::NewConnection).await;
    assert!(server_event.connection.is_valid());

    assert!(client.dequeue().is_none(), "no extra client events expected");
    assert_eq!(client.status(), NetworkStatus::Connected);
}

/// Test: data sent on either channel class arrives at the other side as
/// the matching message event
#[tokio::test]
async fn test_messages_flow_both_directions() {
    let url = spawn_endpoint().await;
    let server = RelayNetwork::new(config(&url));
    let client = RelayNetwork::new(config(&url));

    server.start_server(Some("chat"));
    wait_for(&server, EventKind::ServerInitialized).await;

    let client_id = client.connect("chat");
    wait_for(&client, EventKind::NewConnection).await;
    let server_id = wait_for(&server, EventKind::NewConnection).await.connection;

    client.send(client_id, b"hello from client", true);
    let event = wait_for(&server, EventKind::ReliableMessageReceived).await;
    assert_eq!(event.connection, server_id);
    assert_eq!(event.data.as_deref(), Some(&b"hello from client"[..]));

    server.send(server_id, b"hello back", false);
    let event = wait_for(&client, EventKind::UnreliableMessageReceived).await;
    assert_eq!(event.connection, client_id);
    assert_eq!(event.data.as_deref(), Some(&b"hello back"[..]));
}

/// Test: a freshly established idle connection has zero buffered bytes on
/// both channel classes
#[tokio::test]
async fn test_buffered_amount_idle_is_zero() {
    let url = spawn_endpoint().await;
    let server = RelayNetwork::new(config(&url));
    let client = RelayNetwork::new(config(&url));

    server.start_server(Some("idle"));
    wait_for(&server, EventKind::ServerInitialized).await;

    let id = client.connect("idle");
    wait_for(&client, EventKind::NewConnection).await;

    assert_eq!(client.buffered_amount(id, true), 0);
    assert_eq!(client.buffered_amount(id, false), 0);
}

/// Test: disconnecting one side surfaces Disconnected on both, the client
/// returns to NotConnected and the still-listening server stays Connected
#[tokio::test]
async fn test_disconnect_observed_by_both_sides() {
    let url = spawn_endpoint().await;
    let server = RelayNetwork::new(config(&url));
    let client = RelayNetwork::new(config(&url));

    server.start_server(Some("farewell"));
    wait_for(&server, EventKind::ServerInitialized).await;

    let client_id = client.connect("farewell");
    wait_for(&client, EventKind::NewConnection).await;
    let server_id = wait_for(&server, EventKind::NewConnection).await.connection;

    client.disconnect(client_id);

    let event = wait_for(&client, EventKind::Disconnected).await;
    assert_eq!(event.connection, client_id);
    let event = wait_for(&server, EventKind::Disconnected).await;
    assert_eq!(event.connection, server_id);

    assert_eq!(client.status(), NetworkStatus::NotConnected);
    assert_eq!(server.status(), NetworkStatus::Connected);
}

/// Test: connecting to an address nobody listens on fails with exactly one
/// ConnectionFailed and the instance returns to NotConnected
#[tokio::test]
async fn test_connect_to_unlistened_address_fails() {
    let url = spawn_endpoint().await;
    let client = RelayNetwork::new(config(&url));

    let id = client.connect("nobody-home");
    let event = wait_for(&client, EventKind::ConnectionFailed).await;

    assert_eq!(event.connection, id);
    assert!(client.dequeue().is_none());
    assert_eq!(client.status(), NetworkStatus::NotConnected);
}

/// Test: an unreachable signaling endpoint turns a server start into
/// ServerInitFailed rather than a fault
#[tokio::test]
async fn test_unreachable_endpoint_fails_server_start() {
    let network = RelayNetwork::new(config("ws://127.0.0.1:1"));

    network.start_server(Some("void"));
    wait_for(&network, EventKind::ServerInitFailed).await;
    assert_eq!(network.status(), NetworkStatus::NotConnected);
}

/// Test: stop then restart on the same address is idempotent and a new
/// client can still connect
#[tokio::test]
async fn test_stop_and_restart_server() {
    let url = spawn_endpoint().await;
    let server = RelayNetwork::new(config(&url));

    server.start_server(Some("revolving-door"));
    wait_for(&server, EventKind::ServerInitialized).await;

    server.stop_server();
    wait_for(&server, EventKind::ServerClosed).await;

    server.start_server(Some("revolving-door"));
    wait_for(&server, EventKind::ServerInitialized).await;

    let client = RelayNetwork::new(config(&url));
    let id = client.connect("revolving-door");
    let event = wait_for(&client, EventKind::NewConnection).await;
    assert_eq!(event.connection, id);
}

/// Test: two conference instances share one address, both get
/// ServerInitialized, and a plain client is matched to exactly one of them
#[tokio::test]
async fn test_shared_address_rendezvous() {
    let url = spawn_endpoint().await;
    let conference = NetworkConfig {
        is_conference: true,
        ..config(&url)
    };

    let first = RelayNetwork::new(conference.clone());
    let second = RelayNetwork::new(conference);

    first.start_server(Some("auditorium"));
    wait_for(&first, EventKind::ServerInitialized).await;
    second.start_server(Some("auditorium"));
    wait_for(&second, EventKind::ServerInitialized).await;

    let client = RelayNetwork::new(config(&url));
    let id = client.connect("auditorium");
    let event = wait_for(&client, EventKind::NewConnection).await;
    assert_eq!(event.connection, id);

    // Exactly one listener is matched to a non-conference dial
    tokio::time::sleep(Duration::from_millis(200)).await;
    let matched = [&first, &second]
        .iter()
        .filter_map(|n| n.dequeue())
        .filter(|e| e.kind == EventKind::NewConnection)
        .count();
    assert_eq!(matched, 1, "dial must pair with exactly one listener");
}

/// Test: a second non-shared listen on a taken address fails immediately
#[tokio::test]
async fn test_exclusive_address_conflict() {
    let url = spawn_endpoint().await;
    let first = RelayNetwork::new(config(&url));
    let second = RelayNetwork::new(config(&url));

    first.start_server(Some("exclusive"));
    wait_for(&first, EventKind::ServerInitialized).await;

    second.start_server(Some("exclusive"));
    wait_for(&second, EventKind::ServerInitFailed).await;
    assert_eq!(second.status(), NetworkStatus::NotConnected);
}

/// Test: operations on unknown or stale ids are safe no-ops
#[tokio::test]
async fn test_unknown_id_operations_are_noops() {
    let url = spawn_endpoint().await;
    let network = RelayNetwork::new(config(&url));
    let stale = ConnectionId(1234);

    network.disconnect(stale);
    network.send(stale, b"into the void", true);
    network.disconnect(ConnectionId::INVALID);

    assert_eq!(network.buffered_amount(stale, true), 0);
    assert_eq!(network.buffered_amount(stale, false), 0);
    assert!(network.dequeue().is_none());
}
