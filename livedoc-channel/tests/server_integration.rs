//! End-to-end tests over real WebSocket connections.
//!
//! These start a real server and connect real transports, verifying the
//! full pipeline including the registry migrating across rooms.

use std::sync::Arc;

use futures_util::StreamExt;
use livedoc_channel::client::{ChannelClient, ClientConfig};
use livedoc_channel::doc::DocHandle;
use livedoc_channel::protocol::{Frame, SyncOp};
use livedoc_channel::registry::{ChannelRegistry, ChannelState, RegistryConfig};
use livedoc_channel::server::{ChannelServer, ServerConfig};
use livedoc_channel::transport::{ChannelTransport, TransportEvent, TransportStatus};
use livedoc_channel::ws::WsTransport;
use serde_json::json;
use tokio::time::{timeout, Duration, Instant};
use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return its URL and a handle to it.
async fn start_test_server() -> (String, Arc<ChannelServer>) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
    };
    let server = Arc::new(ChannelServer::new(config));
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (format!("ws://127.0.0.1:{port}"), server)
}

fn insert_text(doc: &DocHandle, content: &str) {
    let mut txn = doc.doc().transact_mut();
    let text = txn.get_or_insert_text("content");
    let len = text.get_string(&txn).len() as u32;
    text.insert(&mut txn, len, content);
}

fn read_text(doc: &DocHandle) -> String {
    let txn = doc.doc().transact();
    txn.get_text("content")
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(4);
    while !check() {
        if Instant::now() > deadline {
            panic!("condition not reached within deadline");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_transport_reports_lifecycle_and_greeting() {
    let (url, _server) = start_test_server().await;

    let transport = WsTransport::new(&url);
    let mut events = transport.take_events().unwrap();
    transport.join("doc-1", json!({})).await.unwrap();

    let mut saw_connecting = false;
    let mut saw_connected = false;
    let greeting = loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        match event {
            TransportEvent::Status(TransportStatus::Connecting) => saw_connecting = true,
            TransportEvent::Status(TransportStatus::Connected) => saw_connected = true,
            TransportEvent::Status(TransportStatus::Disconnected) => {
                panic!("unexpected disconnect")
            }
            TransportEvent::Frame(bytes) => break bytes,
        }
    };
    assert!(saw_connecting);
    assert!(saw_connected);
    // The hub greets every member with its sync request
    assert!(matches!(
        Frame::decode(&greeting).unwrap(),
        Frame::Sync(SyncOp::Step1(_))
    ));

    transport.leave().await;
    let disconnected = loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(TransportEvent::Status(TransportStatus::Disconnected))) => break true,
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break false,
        }
    };
    assert!(disconnected, "leave should surface a disconnect");
}

#[tokio::test]
async fn test_ws_clients_converge() {
    let (url, _server) = start_test_server().await;

    let alice = ChannelClient::connect(
        Box::new(WsTransport::new(&url)),
        "doc-1",
        json!({}),
        ClientConfig::default(),
    )
    .await
    .unwrap();
    let bob = ChannelClient::connect(
        Box::new(WsTransport::new(&url)),
        "doc-1",
        json!({}),
        ClientConfig::default(),
    )
    .await
    .unwrap();

    wait_until(|| alice.is_synced() && bob.is_synced()).await;

    insert_text(alice.doc(), "over the wire");
    wait_until(|| read_text(bob.doc()) == "over the wire").await;

    alice.presence().set_local_state(json!({"cursor": 13}));
    let alice_id = alice.doc().client_id();
    wait_until(|| bob.presence().states().get(&alice_id) == Some(&json!({"cursor": 13}))).await;

    alice.destroy().await;
    bob.destroy().await;
}

#[tokio::test]
async fn test_server_side_kick_surfaces_as_disconnect() {
    let (url, server) = start_test_server().await;

    let client = ChannelClient::connect(
        Box::new(WsTransport::new(&url)),
        "doc-1",
        json!({}),
        ClientConfig::default(),
    )
    .await
    .unwrap();
    wait_until(|| client.is_synced()).await;
    insert_text(client.doc(), "kept across kicks");

    server.hub().disconnect_all("doc-1").await;
    wait_until(|| !client.is_joined()).await;

    // The document survives the kick
    assert_eq!(read_text(client.doc()), "kept across kicks");
    client.destroy().await;
}

#[tokio::test]
async fn test_registry_migrates_across_rooms_over_ws() {
    let (url, _server) = start_test_server().await;
    let registry = ChannelRegistry::new(RegistryConfig {
        drain_grace: Duration::from_millis(100),
        settle_timeout: Duration::from_millis(4000),
        ..RegistryConfig::default()
    });

    let first = registry
        .migrate(Box::new(WsTransport::new(&url)), "doc-1", json!({}))
        .await
        .unwrap();
    assert_eq!(first.state(), ChannelState::Active);
    insert_text(first.client().doc(), "room one");

    let second = registry
        .migrate(Box::new(WsTransport::new(&url)), "doc-2", json!({}))
        .await
        .unwrap();
    assert_eq!(second.state(), ChannelState::Active);
    // Fresh document per entry: room one's content does not leak across
    assert_eq!(read_text(second.client().doc()), "");

    wait_until(|| first.state() == ChannelState::Destroyed).await;
    assert_eq!(registry.current_entry().unwrap().id(), second.id());

    // The old room's state is still on the server for the next visitor
    let visitor = ChannelClient::connect(
        Box::new(WsTransport::new(&url)),
        "doc-1",
        json!({}),
        ClientConfig::default(),
    )
    .await
    .unwrap();
    wait_until(|| read_text(visitor.doc()) == "room one").await;

    visitor.destroy().await;
    registry.destroy().await;
}

#[tokio::test]
async fn test_connection_without_room_is_dropped() {
    let (url, _server) = start_test_server().await;

    // Handshake completes, then the server drops the pathless connection
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (_sink, mut stream) = ws_stream.split();
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match stream.next().await {
                None => break true,
                Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) => break true,
                Some(Ok(_)) => {}
                Some(Err(_)) => break true,
            }
        }
    })
    .await
    .expect("timed out waiting for the server to drop the connection");
    assert!(closed);
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let (url, server) = start_test_server().await;
    server.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = tokio_tungstenite::connect_async(format!("{url}/doc-1")).await;
    assert!(result.is_err(), "server should stop accepting after shutdown");
}
