//! Full offline → online cycle through the public engine API

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core::backend::ListenerSink;
use tether_core::testing::{mock_engine, wait_for};
use tether_core::{AppState, InitState, ReconnectTrigger};

#[tokio::test(start_paused = true)]
async fn test_offline_send_is_delivered_after_network_returns() {
    let mock = mock_engine();
    mock.engine.start();
    mock.engine.initialize().await.unwrap();

    let snapshots = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&snapshots);
    let sink: ListenerSink = Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    mock.engine.listen("chats/1/messages", sink).await.unwrap();
    let server = mock.factory.server().clone();
    assert_eq!(server.listeners_for("chats/1/messages"), 1);

    mock.go_offline();
    assert!(!mock.engine.connectivity().is_online());

    let mut deliveries = mock.engine.subscribe_deliveries();
    let item = mock
        .engine
        .queue_for_offline_send("chats/1/messages", json!({"text": "sent offline"}), None)
        .unwrap();
    assert!(item.is_queued);
    assert!(server.writes().is_empty());

    mock.go_online();

    let delivered = tokio::time::timeout(Duration::from_secs(10), deliveries.recv())
        .await
        .expect("delivery within the timeout")
        .unwrap();
    assert_eq!(delivered.id, item.id);
    assert!(!delivered.is_queued);
    assert_eq!(
        server.writes_for("chats/1/messages"),
        vec![json!({"text": "sent offline"})]
    );

    // The attempt is recorded once listeners have been moved over
    let controller = mock.engine.controller();
    assert!(
        wait_for(Duration::from_secs(5), || controller
            .history()
            .iter()
            .any(|r| r.reason == ReconnectTrigger::NetworkRestored && r.success))
        .await
    );
    assert_eq!(server.listeners_for("chats/1/messages"), 1);
    assert_eq!(mock.engine.registry().len(), 1);

    assert!(server.emit("chats/1/messages", json!({"text": "reply"})));
    assert_eq!(snapshots.load(Ordering::SeqCst), 1);

    assert_eq!(mock.engine.init_state(), InitState::Ready);
    assert!(mock.engine.outbox().is_empty());
    mock.engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_return_to_foreground_reconnects() {
    let mock = mock_engine();
    mock.engine.start();
    mock.engine.initialize().await.unwrap();
    let toggles_before = mock.client().network_toggles();

    mock.engine.on_app_state_change(AppState::Background);
    tokio::time::sleep(Duration::from_secs(1)).await;
    mock.engine.on_app_state_change(AppState::Active);

    let client = mock.client();
    assert!(wait_for(Duration::from_secs(5), || client.network_toggles() > toggles_before).await);
    assert!(
        wait_for(Duration::from_secs(5), || mock
            .engine
            .controller()
            .history()
            .iter()
            .any(|r| r.reason == ReconnectTrigger::Foreground))
        .await
    );
    mock.engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_manual_reconnect_and_diagnostics() {
    let mock = mock_engine();
    mock.engine.start();
    mock.engine.initialize().await.unwrap();

    assert!(mock.engine.manual_reconnect().await);

    let snapshot = mock.engine.diagnostics();
    assert_eq!(snapshot.reconnect.successes, 1);
    assert_eq!(snapshot.init_state, InitState::Ready);
    assert!(snapshot.connectivity.is_online());
    assert!(snapshot.summary().contains("ready"));
    mock.engine.stop();
    assert!(!mock.engine.is_running());
}
