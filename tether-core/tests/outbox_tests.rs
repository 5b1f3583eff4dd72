use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tether_core::backend::{FileStore, KeyValueStore};
use tether_core::testing::{mock_engine, testing_config, wait_for, MockBackendFactory};
use tether_core::{BackendError, EngineDeps, ResilienceEngine};

#[tokio::test(start_paused = true)]
async fn test_offline_writes_delivered_in_order_after_reconnect() {
    let mock = mock_engine();
    mock.engine.start();
    mock.engine.initialize().await.unwrap();
    mock.go_offline();

    for text in ["A", "B", "C"] {
        mock.clock.advance(Duration::from_millis(10));
        let item = mock
            .engine
            .queue_for_offline_send("chat/1", json!({ "text": text }), None)
            .unwrap();
        assert!(item.is_queued);
    }
    assert_eq!(mock.engine.outbox().len(), 3);
    assert!(mock.factory.server().writes().is_empty());

    mock.go_online();

    let server = mock.factory.server().clone();
    assert!(wait_for(Duration::from_secs(5), || server.writes_for("chat/1").len() == 3).await);
    assert_eq!(
        server.writes_for("chat/1"),
        vec![json!({"text": "A"}), json!({"text": "B"}), json!({"text": "C"})]
    );
    assert!(mock.engine.outbox().is_empty());
    mock.engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_failed_item_holds_back_later_writes_for_its_target() {
    let mock = mock_engine();
    mock.engine.initialize().await.unwrap();
    // Keep the engine offline so queueing does not drain on its own
    mock.engine.on_network_change(false, Some(false));

    let server = mock.factory.server().clone();
    server.add_target("chat/1");
    for (target, text) in [("chat/1", "A"), ("chat/1", "B"), ("chat/2", "X"), ("chat/1", "C")] {
        mock.clock.advance(Duration::from_millis(10));
        mock.engine
            .queue_for_offline_send(target, json!({ "text": text }), None)
            .unwrap();
    }
    mock.client()
        .fail_next_write("chat/1", BackendError::internal("aborted", "write contention"));

    let first = mock.engine.outbox().drain().await;
    assert_eq!(first.failed, 1);
    assert_eq!(first.remaining, 3);
    assert!(server.writes_for("chat/1").is_empty());
    assert_eq!(server.writes_for("chat/2"), vec![json!({"text": "X"})]);

    let second = mock.engine.outbox().drain().await;
    assert!(second.is_clean());
    assert_eq!(
        server.writes_for("chat/1"),
        vec![json!({"text": "A"}), json!({"text": "B"}), json!({"text": "C"})]
    );
}

#[tokio::test(start_paused = true)]
async fn test_online_send_delivers_immediately() {
    let mock = mock_engine();
    mock.engine.initialize().await.unwrap();
    let mut deliveries = mock.engine.subscribe_deliveries();

    let item = mock
        .engine
        .queue_for_offline_send("chat/9", json!({"text": "now"}), Some("k-1".into()))
        .unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(1), deliveries.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.id, item.id);
    assert!(!delivered.is_queued);
    assert_eq!(
        mock.factory.server().writes()[0].idempotency_key.as_deref(),
        Some("k-1")
    );
}

fn file_backed_engine(dir: &std::path::Path, factory: &MockBackendFactory) -> ResilienceEngine {
    let store = FileStore::open(dir).unwrap();
    let deps = EngineDeps::new(Arc::new(store) as Arc<dyn KeyValueStore>)
        .with_live_factory(Arc::new(factory.clone()));
    ResilienceEngine::new(testing_config(), deps).unwrap()
}

#[tokio::test]
async fn test_queued_writes_survive_process_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first_run = MockBackendFactory::default();
    let queued = {
        let engine = file_backed_engine(dir.path(), &first_run);
        engine.on_network_change(false, Some(false));
        let a = engine
            .queue_for_offline_send("chat/1", json!({"text": "A"}), None)
            .unwrap();
        let b = engine
            .queue_for_offline_send("chat/1", json!({"text": "B"}), None)
            .unwrap();
        vec![a.id, b.id]
    };
    assert!(first_run.server().writes().is_empty());

    let second_run = MockBackendFactory::default();
    let engine = file_backed_engine(dir.path(), &second_run);
    let restored: Vec<_> = engine.outbox().pending().iter().map(|i| i.id).collect();
    assert_eq!(restored, queued);

    engine.initialize().await.unwrap();
    let report = engine.outbox().drain().await;
    assert_eq!(report.delivered.len(), 2);
    assert_eq!(
        second_run.server().writes_for("chat/1"),
        vec![json!({"text": "A"}), json!({"text": "B"})]
    );

    // Nothing left on disk for a third run
    let third = file_backed_engine(dir.path(), &MockBackendFactory::default());
    assert!(third.outbox().is_empty());
}
