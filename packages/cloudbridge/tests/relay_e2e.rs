mod common;

use std::time::Duration;

use cloudbridge::{
    Client, ClientConfig, ClientError, ConnectionError, LinkState, TransportError, TransportEvent,
};
use common::{MockRelay, WAIT};
use serde_json::json;

fn config_for(relay: &MockRelay) -> ClientConfig {
    ClientConfig::new("test-token")
        .relay_url(relay.url())
        .timeout(Duration::from_secs(5))
        .reconnect_delay(Duration::from_millis(100))
}

async fn wait_for(
    events: &mut tokio::sync::broadcast::Receiver<TransportEvent>,
    want: TransportEvent,
) {
    tokio::time::timeout(WAIT, async {
        loop {
            if events.recv().await.unwrap() == want {
                break;
            }
        }
    })
    .await
    .expect("transport event not observed");
}

// ── handshake ───────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_carries_bearer_token() {
    let mut relay = MockRelay::start().await;
    let client = Client::new(config_for(&relay)).unwrap();
    client.ensure_connected().await.unwrap();

    let session = relay.next_session().await;
    assert_eq!(session.authorization.as_deref(), Some("Bearer test-token"));
    assert_eq!(session.path, "/v1/connect");
    assert_eq!(client.transport().state(), LinkState::Connected);

    // Idempotent: no second relay connection.
    client.ensure_connected().await.unwrap();
    assert!(relay.try_next_session(Duration::from_millis(200)).await.is_none());
    client.close().await.unwrap();
}

#[tokio::test]
async fn rejected_handshake_fails_connect() {
    let relay = MockRelay::with_token("right-token").await;
    let client = Client::new(ClientConfig::new("wrong-token").relay_url(relay.url())).unwrap();

    match client.ensure_connected().await {
        Err(ClientError::Transport(e)) => assert!(e.is_handshake_failure(), "{e}"),
        other => panic!("expected handshake failure, got {other:?}"),
    }
    assert_eq!(client.transport().state(), LinkState::Disconnected);
    client.close().await.unwrap();
}

// ── outbound ────────────────────────────────────────────────────────────

#[tokio::test]
async fn write_emits_exact_envelope() {
    let mut relay = MockRelay::start().await;
    let client = Client::new(config_for(&relay)).unwrap();

    let conn = client.connect("peerB").await.unwrap();
    let mut session = relay.next_session().await;
    conn.write(b"ping").unwrap();

    assert_eq!(
        session.next_frame().await,
        json!({"type": "p2p", "peer_id": "peerB", "payload": "cGluZw=="})
    );
    assert_eq!(client.connections(), vec!["peerB".to_string()]);
    client.close().await.unwrap();
}

#[tokio::test]
async fn metrics_and_health_track_traffic() {
    let mut relay = MockRelay::start().await;
    let client = Client::new(config_for(&relay)).unwrap();

    let conn = client.connect("peerB").await.unwrap();
    let mut session = relay.next_session().await;
    conn.write(b"ping").unwrap();
    conn.write(b"!").unwrap();
    session.next_frame().await;
    session.next_frame().await;

    session.send_p2p("peerB", b"pong").await;
    let reply = tokio::time::timeout(WAIT, conn.read()).await.unwrap().unwrap();
    assert_eq!(reply, b"pong");

    let metrics = conn.metrics();
    assert_eq!(metrics.bytes_sent, 5);
    assert_eq!(metrics.bytes_received, 4);

    let health = client.health();
    assert_eq!(health.link, LinkState::Connected);
    assert_eq!(health.connected_peers, 1);

    client.close().await.unwrap();
    assert_eq!(client.health().link, LinkState::Disconnected);
    assert_eq!(client.health().connected_peers, 0);
}

#[tokio::test]
async fn connect_returns_same_connection_per_peer() {
    let relay = MockRelay::start().await;
    let client = Client::new(config_for(&relay)).unwrap();

    let first = client.connect("peerB").await.unwrap();
    let second = client.connect("peerB").await.unwrap();
    assert_eq!(first.id(), second.id());

    first.close();
    assert!(client.connections().is_empty());
    assert!(matches!(second.write(b"x"), Err(ConnectionError::Closed)));
    // The shared transport outlives the peer connection.
    assert!(client.transport().is_connected());
    client.close().await.unwrap();
}

// ── inbound ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn inbound_data_preserves_order() {
    let mut relay = MockRelay::start().await;
    let client = Client::new(config_for(&relay)).unwrap();
    client.ensure_connected().await.unwrap();
    let mut session = relay.next_session().await;

    for chunk in ["hello", "two", "three"] {
        session.send_p2p("peerA", chunk.as_bytes()).await;
    }

    let conn = tokio::time::timeout(WAIT, client.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn.peer_id(), "peerA");
    // A non-JSON first payload is data, not lost.
    assert_eq!(conn.read().await.unwrap(), b"hello");
    assert_eq!(conn.read().await.unwrap(), b"two");
    assert_eq!(conn.read().await.unwrap(), b"three");
    client.close().await.unwrap();
}

#[tokio::test]
async fn interleaved_peers_are_demultiplexed() {
    let mut relay = MockRelay::start().await;
    let client = Client::new(config_for(&relay)).unwrap();
    client.ensure_connected().await.unwrap();
    let mut session = relay.next_session().await;

    session.send_p2p("a", b"a1").await;
    session.send_p2p("b", b"b1").await;
    session.send_p2p("a", b"a2").await;
    session.send_p2p("b", b"b2").await;

    let first = tokio::time::timeout(WAIT, client.accept()).await.unwrap().unwrap();
    let second = tokio::time::timeout(WAIT, client.accept()).await.unwrap().unwrap();
    assert_eq!(first.peer_id(), "a");
    assert_eq!(second.peer_id(), "b");
    assert_eq!(first.read().await.unwrap(), b"a1");
    assert_eq!(first.read().await.unwrap(), b"a2");
    assert_eq!(second.read().await.unwrap(), b"b1");
    assert_eq!(second.read().await.unwrap(), b"b2");
    client.close().await.unwrap();
}

#[tokio::test]
async fn malformed_and_unknown_frames_are_skipped() {
    let mut relay = MockRelay::start().await;
    let client = Client::new(config_for(&relay)).unwrap();
    client.ensure_connected().await.unwrap();
    let mut session = relay.next_session().await;

    session.send_text("not json at all").await;
    session.send_text(r#"{"type":"presence","peer_id":"x"}"#).await;
    session
        .send_text(r#"{"type":"p2p","peer_id":"x","payload":"%%%"}"#)
        .await;
    session.send_p2p("peerA", b"still alive").await;

    let conn = tokio::time::timeout(WAIT, client.accept()).await.unwrap().unwrap();
    assert_eq!(conn.read().await.unwrap(), b"still alive");
    assert_eq!(client.connections(), vec!["peerA".to_string()]);
    assert!(client.transport().is_connected());
    client.close().await.unwrap();
}

#[tokio::test]
async fn tunnel_request_bridges_to_local_service() {
    let mut relay = MockRelay::start().await;
    let client = Client::new(config_for(&relay)).unwrap();
    client.ensure_connected().await.unwrap();
    let mut session = relay.next_session().await;
    let echo_port = common::spawn_echo_server().await;

    let request = format!(r#"{{"type":"tunnel","port":{echo_port}}}"#);
    session.send_p2p("peerT", request.as_bytes()).await;
    session.send_p2p("peerT", b"over the tunnel").await;

    let (peer, payload) = session.next_p2p().await;
    assert_eq!(peer, "peerT");
    assert_eq!(payload, b"over the tunnel");
    // Tunnel requests are not surfaced as accepted connections.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), client.accept())
            .await
            .is_err()
    );
    client.close().await.unwrap();
}

// ── peer to peer ────────────────────────────────────────────────────────

#[tokio::test]
async fn ping_pong_between_two_clients() {
    let mut relay = MockRelay::start().await;
    let alice = Client::new(config_for(&relay)).unwrap();
    let bob = Client::new(config_for(&relay)).unwrap();

    alice.ensure_connected().await.unwrap();
    let alice_session = relay.next_session().await;
    bob.ensure_connected().await.unwrap();
    let bob_session = relay.next_session().await;
    let _routing = common::pair(alice_session, "peerA", bob_session, "peerB");

    let to_bob = alice.connect("peerB").await.unwrap();
    to_bob.write(b"ping").unwrap();

    let from_alice = tokio::time::timeout(WAIT, bob.accept()).await.unwrap().unwrap();
    assert_eq!(from_alice.peer_id(), "peerA");
    assert_eq!(from_alice.read().await.unwrap(), b"ping");

    from_alice.write(b"pong").unwrap();
    let reply = tokio::time::timeout(WAIT, to_bob.read()).await.unwrap().unwrap();
    assert_eq!(reply, b"pong");

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

// ── reconnection ────────────────────────────────────────────────────────

#[tokio::test]
async fn reconnects_after_relay_drop() {
    let mut relay = MockRelay::start().await;
    let client = Client::new(config_for(&relay)).unwrap();
    let conn = client.connect("peerB").await.unwrap();
    let session = relay.next_session().await;
    let mut events = client.transport().subscribe();

    session.disconnect().await;
    wait_for(&mut events, TransportEvent::Close).await;

    let mut session = relay.next_session().await;
    wait_for(&mut events, TransportEvent::Open).await;
    assert_eq!(session.authorization.as_deref(), Some("Bearer test-token"));

    // The existing peer connection resumes on the new link.
    conn.write(b"after reconnect").unwrap();
    let (peer, payload) = session.next_p2p().await;
    assert_eq!(peer, "peerB");
    assert_eq!(payload, b"after reconnect");
    client.close().await.unwrap();
}

#[tokio::test]
async fn writes_fail_fast_during_outage() {
    let mut relay = MockRelay::start().await;
    let client = Client::new(config_for(&relay).reconnect_delay(Duration::from_secs(60))).unwrap();
    let conn = client.connect("peerB").await.unwrap();
    let session = relay.next_session().await;
    let mut events = client.transport().subscribe();

    session.disconnect().await;
    wait_for(&mut events, TransportEvent::Close).await;

    assert!(matches!(
        conn.write(b"lost"),
        Err(ConnectionError::Transport(TransportError::NotConnected))
    ));
    assert!(conn.is_open());
    assert!(client.transport().reconnect_pending());
    client.close().await.unwrap();
    assert!(!client.transport().reconnect_pending());
}

#[tokio::test]
async fn explicit_close_does_not_reconnect() {
    let mut relay = MockRelay::start().await;
    let client = Client::new(config_for(&relay)).unwrap();
    client.ensure_connected().await.unwrap();
    let _session = relay.next_session().await;
    let mut events = client.transport().subscribe();

    client.close().await.unwrap();
    wait_for(&mut events, TransportEvent::Close).await;
    assert_eq!(client.transport().state(), LinkState::Disconnected);
    assert!(relay.try_next_session(Duration::from_millis(500)).await.is_none());
    tokio::time::timeout(WAIT, client.serve()).await.unwrap();
}
