//! Coordinators on two instances sharing one store

use connector_gateway::common::{hash_token, Error, GatewayConfig, TokenTableVerifier};
use connector_gateway::coordinator::{
    CloseCode, Command, Connection, ConnectorInfo, Coordinator, Location, Outbound,
};
use connector_gateway::store::{keys, MemoryStore, SharedStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn coordinator(instance: &str, store: &Arc<MemoryStore>) -> Coordinator {
    let verifier = TokenTableVerifier::default();
    verifier.insert_token("c1", "secret");
    let config = GatewayConfig {
        instance_id: instance.to_string(),
        ..GatewayConfig::default()
    };
    let shared: Arc<dyn SharedStore> = store.clone();
    let coordinator = Coordinator::new(&config, Some(shared), Arc::new(verifier));
    coordinator.start();
    coordinator
}

fn socket() -> (Arc<Connection>, UnboundedReceiver<Outbound>) {
    Connection::new(hash_token("secret"), 0)
}

/// Register a socket and complete the `register` handshake
async fn connect(coordinator: &Coordinator) -> (Arc<Connection>, UnboundedReceiver<Outbound>) {
    let (conn, mut rx) = socket();
    assert!(coordinator
        .register_connection(ConnectorInfo::new("c1"), conn.clone())
        .await
        .unwrap());
    coordinator
        .handle_message("c1", conn.id(), r#"{"type":"register"}"#)
        .await
        .unwrap();
    match rx.recv().await {
        Some(Outbound::Frame(text)) => assert!(text.contains("registered")),
        other => panic!("expected registered ack, got {:?}", other),
    }
    (conn, rx)
}

async fn next_frame(rx: &mut UnboundedReceiver<Outbound>) -> Value {
    match rx.recv().await {
        Some(Outbound::Frame(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected frame, got {:?}", other),
    }
}

async fn next_close(rx: &mut UnboundedReceiver<Outbound>) -> CloseCode {
    loop {
        match rx.recv().await {
            Some(Outbound::Close(code)) => return code,
            Some(Outbound::Frame(_)) => continue,
            None => panic!("socket queue closed without a close frame"),
        }
    }
}

#[tokio::test]
async fn test_remote_dispatch_across_instances() {
    let store = Arc::new(MemoryStore::new());
    let a = coordinator("inst-a", &store);
    let b = coordinator("inst-b", &store);
    let (conn, mut rx) = connect(&b).await;

    let dispatch = {
        let a = a.clone();
        tokio::spawn(async move {
            a.dispatch_command("c1", Command::new("query", json!({"sql": "select 1"})))
                .await
        })
    };

    let command = next_frame(&mut rx).await;
    assert_eq!(command["type"], "command");
    assert_eq!(command["replyTo"], "inst-a");
    assert_eq!(command["payload"]["payload"]["sql"], "select 1");
    let correlation_id = command["correlationId"].as_str().unwrap().to_string();
    assert!(b.has_reply_route(&correlation_id));

    // The connector does not echo replyTo; the recorded route is used
    let result = json!({
        "type": "result",
        "correlationId": correlation_id,
        "payload": {"rows": [[1]]},
    });
    b.handle_message("c1", conn.id(), &result.to_string())
        .await
        .unwrap();

    let reply = dispatch.await.unwrap().unwrap();
    assert_eq!(reply, json!({"rows": [[1]]}));
    assert!(!b.has_reply_route(&correlation_id));

    let status = a.connector_status("c1").await.unwrap();
    assert_eq!(status.location, Location::Remote);
    assert_eq!(status.owner.as_deref(), Some("inst-b"));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_second_instance_rejected_with_conflict() {
    let store = Arc::new(MemoryStore::new());
    let a = coordinator("inst-a", &store);
    let b = coordinator("inst-b", &store);
    let (_conn, _rx) = connect(&a).await;

    let (conn, mut rx) = socket();
    assert!(!b
        .register_connection(ConnectorInfo::new("c1"), conn)
        .await
        .unwrap());
    assert_eq!(next_close(&mut rx).await, CloseCode::OwnershipConflict);
    assert!(!b.is_connected_locally("c1"));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ownership_loss_closes_sockets() {
    let store = Arc::new(MemoryStore::new());
    let a = coordinator("inst-a", &store);
    let (_first, mut first_rx) = connect(&a).await;
    let (_second, mut second_rx) = connect(&a).await;

    // Another instance overwrites the owner key behind our back
    store.set(&keys::owner("c1"), "inst-z:1", Some(Duration::from_secs(30)));

    assert_eq!(next_close(&mut first_rx).await, CloseCode::OwnershipLost);
    assert_eq!(next_close(&mut second_rx).await, CloseCode::OwnershipLost);
    assert!(!a.is_connected_locally("c1"));
    assert!(!a.ownership().is_locally_owned("c1"));
    assert!(!a.transport().unwrap().is_consuming("c1"));

    a.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_race_keeps_group() {
    let store = Arc::new(MemoryStore::new());
    let a = coordinator("inst-a", &store);
    let (old, _old_rx) = connect(&a).await;
    let (_new, _new_rx) = connect(&a).await;

    a.unregister_connection("c1", Some(old.id())).await.unwrap();
    assert!(a.is_connected_locally("c1"));
    assert_eq!(a.connection_count("c1"), 1);
    assert!(a.transport().unwrap().is_consuming("c1"));
    assert_eq!(
        store.get(&keys::status("c1")).await.unwrap().as_deref(),
        Some("online")
    );

    a.unregister_connection("c1", None).await.unwrap();
    assert!(!a.is_connected_locally("c1"));
    assert_eq!(store.get(&keys::owner("c1")).await.unwrap(), None);
    assert_eq!(
        store.get(&keys::status("c1")).await.unwrap().as_deref(),
        Some("offline")
    );

    a.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_to_offline_connector() {
    let store = Arc::new(MemoryStore::new());
    let a = coordinator("inst-a", &store);

    let err = a
        .dispatch_command("c1", Command::new("query", Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected(_)));
    assert_eq!(
        a.connector_status("c1").await.unwrap().location,
        Location::Offline
    );

    a.shutdown().await;
}

#[tokio::test]
async fn test_invalidation_is_shared_across_instances() {
    let store = Arc::new(MemoryStore::new());
    let a = coordinator("inst-a", &store);
    let b = coordinator("inst-b", &store);
    let (conn, mut rx) = connect(&b).await;

    assert_eq!(a.invalidate_credentials("c1").await.unwrap(), 1);
    b.handle_message("c1", conn.id(), r#"{"type":"heartbeat"}"#)
        .await
        .unwrap();
    assert_eq!(next_close(&mut rx).await, CloseCode::TokenInvalidated);
    assert!(!b.is_connected_locally("c1"));

    // A fresh connection picks up the new version
    let (fresh, _fresh_rx) = Connection::new(hash_token("secret"), b.token_version("c1").await.unwrap());
    assert!(b
        .register_connection(ConnectorInfo::new("c1"), fresh)
        .await
        .unwrap());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_releases_ownership() {
    let store = Arc::new(MemoryStore::new());
    let a = coordinator("inst-a", &store);
    let b = coordinator("inst-b", &store);
    let (_conn, mut rx) = connect(&a).await;

    a.shutdown().await;
    assert_eq!(next_close(&mut rx).await, CloseCode::ServerShutdown);
    assert_eq!(store.get(&keys::owner("c1")).await.unwrap(), None);

    // Another instance can take over right away
    let (_conn, _rx) = connect(&b).await;
    assert!(b.is_connected_locally("c1"));
    b.shutdown().await;
}
