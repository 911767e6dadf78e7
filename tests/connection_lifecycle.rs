//! Connection Lifecycle Tests
//!
//! Tests for:
//! - Outbound queue flushed in FIFO order ahead of new sends
//! - Reconnect attempts counted and capped
//! - Connect timeout
//! - Heartbeat ping, pong swallowed
//! - Inbound frames dispatched in socket order
//!
//! All tests run on paused time; timers fire as soon as every task is idle.

mod common;

use std::time::Duration;

use common::{number_of, numbered, MockConnector, Plan, ServerEnd};
use storefront_realtime::realtime::{
    ConnectionConfig, ConnectionStatus, RealtimeContext, RealtimeError, TopicFilter,
};
use tokio::sync::mpsc;

fn context(connector: std::sync::Arc<MockConnector>) -> RealtimeContext {
    RealtimeContext::new(connector, "ws://test:3001")
}

// =============================================================================
// Queueing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_queued_messages_flush_before_new_sends() {
    let (connector, mut servers) = MockConnector::new(Plan::Accept);
    let ctx = context(connector.clone());
    let conn = ctx.connections();

    for n in 0..3 {
        assert!(!conn.send("main", numbered(n)));
    }
    assert_eq!(conn.queued_len("main"), 3);
    assert_eq!(conn.status("main"), Some(ConnectionStatus::Idle));

    assert!(conn.connect("main", ConnectionConfig::default()).await.unwrap());
    assert_eq!(conn.queued_len("main"), 0);
    assert!(conn.send("main", numbered(3)));

    let mut server = servers.recv().await.unwrap();
    for expected in 0..4 {
        assert_eq!(number_of(&server.next_message().await), expected);
    }
    assert_eq!(connector.urls(), vec!["ws://test:3001".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_queue_drops_oldest_past_capacity() {
    let (connector, mut servers) = MockConnector::new(Plan::Refuse);
    let ctx = context(connector.clone());
    let conn = ctx.connections();

    let config = ConnectionConfig::default()
        .with_max_queue_size(3)
        .with_reconnect(Duration::from_secs(5), 0);
    assert!(conn.connect("main", config.clone()).await.is_err());

    for n in 1..=5 {
        conn.send("main", numbered(n));
    }
    assert_eq!(conn.queued_len("main"), 3);
    assert_eq!(ctx.metrics().messages_dropped, 2);

    connector.push_plan(Plan::Accept);
    conn.connect("main", config).await.unwrap();

    let mut server = servers.recv().await.unwrap();
    for expected in 3..=5 {
        assert_eq!(number_of(&server.next_message().await), expected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_unsent_messages_survive_reconnect() {
    let (connector, mut servers) = MockConnector::new(Plan::Accept);
    let ctx = context(connector.clone());
    let conn = ctx.connections();

    conn.connect("main", ConnectionConfig::default()).await.unwrap();
    let first = servers.recv().await.unwrap();
    drop(first);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(conn.status("main"), Some(ConnectionStatus::Disconnected));

    assert!(!conn.send("main", numbered(1)));
    assert!(!conn.send("main", numbered(2)));

    // Past the 5 s reconnect interval
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(conn.is_connected("main"));
    assert!(conn.send("main", numbered(3)));

    let mut second = servers.recv().await.unwrap();
    for expected in 1..=3 {
        assert_eq!(number_of(&second.next_message().await), expected);
    }
    assert_eq!(conn.reconnect_attempts("main"), 0);
    assert_eq!(connector.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_messages_in_flight_when_write_fails_are_requeued() {
    let (connector, mut servers) = MockConnector::new(Plan::Accept);
    let ctx = context(connector.clone());
    let conn = ctx.connections();

    conn.connect("main", ConnectionConfig::default()).await.unwrap();

    // Server stops reading but keeps its side of the socket open
    let ServerEnd { outbound, inbound } = servers.recv().await.unwrap();
    drop(outbound);

    for n in 1..=3 {
        assert!(conn.send("main", numbered(n)));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(conn.status("main"), Some(ConnectionStatus::Disconnected));
    assert_eq!(conn.queued_len("main"), 3);
    assert!(!conn.send("main", numbered(4)));

    tokio::time::sleep(Duration::from_secs(5)).await;
    let mut second = servers.recv().await.unwrap();
    for expected in 1..=4 {
        assert_eq!(number_of(&second.next_message().await), expected);
    }
    drop(inbound);
}

// =============================================================================
// Reconnect
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnect_attempts_capped() {
    let (connector, mut servers) = MockConnector::new(Plan::Refuse);
    connector.push_plan(Plan::Accept);
    let ctx = context(connector.clone());
    let conn = ctx.connections();

    let config = ConnectionConfig::default().with_reconnect(Duration::from_secs(5), 2);
    conn.connect("main", config).await.unwrap();

    // Server goes away; every reconnect is refused
    drop(servers.recv().await.unwrap());
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(connector.calls(), 3);
    assert_eq!(conn.reconnect_attempts("main"), 2);
    assert_eq!(conn.status("main"), Some(ConnectionStatus::Disconnected));
    assert_eq!(ctx.metrics().reconnect_attempts, 2);
    assert!(matches!(
        conn.last_error("main"),
        Some(RealtimeError::Transport(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_connect_when_connected_is_noop() {
    let (connector, _servers) = MockConnector::new(Plan::Accept);
    let ctx = context(connector.clone());
    let conn = ctx.connections();

    assert!(conn.connect("main", ConnectionConfig::default()).await.unwrap());
    assert!(conn.connect("main", ConnectionConfig::default()).await.unwrap());
    assert_eq!(connector.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_reconnects_and_discards_queue() {
    let (connector, mut servers) = MockConnector::new(Plan::Accept);
    let ctx = context(connector.clone());
    let conn = ctx.connections();

    conn.connect("main", ConnectionConfig::default()).await.unwrap();
    let _server = servers.recv().await.unwrap();

    conn.disconnect("main");
    assert_eq!(conn.status("main"), None);
    assert!(!conn.is_connected("main"));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.calls(), 1);

    // Unknown keys are a no-op
    conn.disconnect("other");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_pending_connect() {
    let (connector, _servers) = MockConnector::new(Plan::Hang);
    let ctx = context(connector.clone());
    let conn = ctx.connections().clone();

    let pending = tokio::spawn({
        let conn = conn.clone();
        async move { conn.connect("main", ConnectionConfig::default()).await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(conn.status("main"), Some(ConnectionStatus::Connecting));
    conn.disconnect("main");

    // The attempt settles on its own and is discarded
    let result = pending.await.unwrap();
    assert!(result.is_err());
    assert_eq!(conn.status("main"), None);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.calls(), 1);
}

// =============================================================================
// Timeout
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    let (connector, _servers) = MockConnector::new(Plan::Hang);
    let ctx = context(connector.clone());
    let conn = ctx.connections();

    let config = ConnectionConfig::default()
        .with_connect_timeout(Duration::from_secs(10))
        .with_reconnect(Duration::from_secs(5), 0);

    let err = conn.connect("main", config).await.unwrap_err();
    assert!(matches!(err, RealtimeError::Timeout(d) if d == Duration::from_secs(10)));
    assert!(err.is_recoverable());
    assert_eq!(conn.status("main"), Some(ConnectionStatus::Disconnected));
}

// =============================================================================
// Heartbeat and inbound dispatch
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_heartbeat_ping_and_pong_swallowed() {
    let (connector, mut servers) = MockConnector::new(Plan::Accept);
    let ctx = context(connector);
    let conn = ctx.connections();

    let (tx, mut rx) = mpsc::unbounded_channel();
    ctx.dispatcher().subscribe(TopicFilter::All, move |event| {
        let _ = tx.send(event.event.clone());
    });

    conn.connect("main", ConnectionConfig::default()).await.unwrap();
    let mut server = servers.recv().await.unwrap();

    let ping = server.next_message().await;
    assert_eq!(ping.kind, "heartbeat");
    assert_eq!(ping.event, "ping");
    assert!(ping.data["timestamp"].is_i64());

    server.push(r#"{"type":"heartbeat","event":"pong"}"#);
    server.push_message(&numbered(7));

    assert_eq!(rx.recv().await.unwrap(), "order.created");
    assert_eq!(ctx.dispatcher().history(None, None).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_frames_dispatched_in_order() {
    let (connector, mut servers) = MockConnector::new(Plan::Accept);
    let ctx = context(connector);

    let (tx, mut rx) = mpsc::unbounded_channel();
    ctx.dispatcher().subscribe(TopicFilter::All, move |event| {
        let _ = tx.send(event.id.clone());
    });

    ctx.connections()
        .connect("main", ConnectionConfig::default())
        .await
        .unwrap();
    let server = servers.recv().await.unwrap();

    let sent: Vec<String> = (0..50)
        .map(|n| {
            let message = numbered(n);
            server.push_message(&message);
            message.id
        })
        .collect();

    // Malformed frames are dropped without disturbing the rest
    server.push("{not json");

    let mut received = Vec::new();
    for _ in 0..50 {
        received.push(rx.recv().await.unwrap());
    }
    assert_eq!(received, sent);
}

#[tokio::test(start_paused = true)]
async fn test_presence_updates_reach_the_wire() {
    let (connector, mut servers) = MockConnector::new(Plan::Accept);
    let ctx = context(connector);
    ctx.bind_publisher("main");

    ctx.connections()
        .connect("main", ConnectionConfig::default())
        .await
        .unwrap();
    let mut server = servers.recv().await.unwrap();

    ctx.presence().initialize("u1", "s1", None);

    let message = server.next_message().await;
    assert_eq!(message.kind, "user");
    assert_eq!(message.event, "user.online");
    assert_eq!(message.user_id.as_deref(), Some("u1"));
    assert_eq!(message.session_id.as_deref(), Some("s1"));
    assert_eq!(message.data["status"], "online");
}
