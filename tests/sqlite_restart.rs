use std::sync::Arc;
use std::time::Duration;

use order_events::{EventType, WebhookEvent};
use order_webhooks::outbound::webhook::{
    DeliveryState, DeliveryStore, Dispatcher, DispatcherConfig, SqliteDeliveryStore,
};
use serde_json::json;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(url: String) -> DispatcherConfig {
    DispatcherConfig {
        webhook_url: url,
        webhook_secret: "restart-secret".to_string(),
        enabled: true,
        max_attempts: 1,
        retry_delay: Duration::from_millis(1),
        timeout: Duration::from_secs(2),
        ..DispatcherConfig::default()
    }
}

#[tokio::test]
async fn test_retrying_delivery_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("deliveries.db");

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let delivery_id = {
        let store: Arc<dyn DeliveryStore> =
            Arc::new(SqliteDeliveryStore::open(&db_path).await.unwrap());
        let dispatcher = Dispatcher::new(config(server.uri()), store).unwrap();
        let record = dispatcher
            .dispatch(WebhookEvent::new(EventType::OrderCreated, json!({"orderId": "ord-5"})))
            .await;
        assert_eq!(record.status, DeliveryState::Retrying);
        record.id
    };

    server.reset().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(SqliteDeliveryStore::open(&db_path).await.unwrap());
    let stored = store.get(delivery_id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryState::Retrying);
    assert_eq!(stored.attempts.len(), 1);

    let dispatcher = Dispatcher::new(config(server.uri()), store.clone()).unwrap();
    assert_eq!(dispatcher.resume_in_flight().await, 1);

    let queue = dispatcher.queue_status().await.unwrap();
    assert_eq!(queue.items[0].id, delivery_id);
    assert_eq!(queue.items[0].attempts, 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = dispatcher.queue().unwrap().process_due().await;
    assert_eq!(report.delivered, 1);

    let done = store.get(delivery_id).await.unwrap().unwrap();
    assert_eq!(done.status, DeliveryState::Success);
    assert_eq!(done.attempts.len(), 2);
    assert_eq!(done.attempts[1].attempt_number, 2);
}

#[tokio::test]
async fn test_terminal_records_are_not_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("deliveries.db");

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    {
        let store: Arc<dyn DeliveryStore> =
            Arc::new(SqliteDeliveryStore::open(&db_path).await.unwrap());
        let dispatcher = Dispatcher::new(config(server.uri()), store).unwrap();
        dispatcher
            .dispatch(WebhookEvent::new(EventType::OrderCompleted, json!({})))
            .await;
    }

    let store: Arc<dyn DeliveryStore> =
        Arc::new(SqliteDeliveryStore::open(&db_path).await.unwrap());
    let dispatcher = Dispatcher::new(config(server.uri()), store).unwrap();

    assert_eq!(dispatcher.resume_in_flight().await, 0);
    assert_eq!(dispatcher.status().await.deliveries.success, 1);
}
