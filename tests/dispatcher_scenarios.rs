use std::sync::Arc;
use std::time::Duration;

use order_events::{EventType, WebhookEvent};
use order_webhooks::outbound::webhook::{
    DeliveryState, Dispatcher, DispatcherConfig, HmacSigner, extract_signature_headers,
};
use serde_json::json;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "scenario-secret";

fn dispatcher_for(server: &MockServer, max_attempts: u32) -> Arc<Dispatcher> {
    let config = DispatcherConfig {
        webhook_url: format!("{}/hook", server.uri()),
        webhook_secret: SECRET.to_string(),
        enabled: true,
        max_attempts,
        retry_delay: Duration::from_millis(1),
        max_retry_delay: Duration::from_millis(20),
        timeout: Duration::from_secs(2),
        ..DispatcherConfig::default()
    };
    Arc::new(Dispatcher::in_memory(config).unwrap())
}

fn order_event() -> WebhookEvent {
    WebhookEvent::new(
        EventType::OrderCreated,
        json!({"orderId": "ord-1", "orderNumber": "1001", "total": 42.5}),
    )
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&server, 5);
    let record = dispatcher.dispatch(order_event()).await;

    assert_eq!(record.status, DeliveryState::Success);
    assert_eq!(record.attempts.len(), 3);
    let numbers: Vec<u32> = record.attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(record.attempts[0].status_code, Some(503));
    assert_eq!(record.attempts[2].status_code, Some(200));
    assert!(record.completed_at.is_some());
    assert_eq!(dispatcher.queue_status().await.unwrap().size, 0);
}

#[tokio::test]
async fn test_every_attempt_sends_the_same_signed_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header_exists("X-Webhook-Signature"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&server, 3);
    let record = dispatcher.dispatch(order_event()).await;
    assert_eq!(record.status, DeliveryState::Success);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);

    let signer = HmacSigner::new(SECRET);
    for request in &requests {
        assert_eq!(request.body, requests[0].body);

        let headers = extract_signature_headers(&request.headers).unwrap();
        assert_eq!(headers.event, "order.created");
        assert_eq!(headers.version, "1.0");
        let body = std::str::from_utf8(&request.body).unwrap();
        signer
            .verify(body, &headers.signature, headers.timestamp, 300)
            .unwrap();
    }

    let sent: WebhookEvent = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(sent.event_id, record.event_id);
}

#[tokio::test]
async fn test_exhausted_retries_are_handed_to_the_queue() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&server, 2);
    let record = dispatcher.dispatch(order_event()).await;

    assert_eq!(record.status, DeliveryState::Retrying);
    assert_eq!(record.attempts.len(), 2);
    assert!(record.next_retry_at.is_some());
    assert!(record.last_error.is_some());

    let queue = dispatcher.queue_status().await.unwrap();
    assert_eq!(queue.size, 1);
    assert_eq!(queue.items[0].id, record.id);
    assert_eq!(queue.items[0].attempts, 2);

    let stored = dispatcher.get_delivery(record.id).await.unwrap();
    assert_eq!(stored.status, DeliveryState::Retrying);
}

#[tokio::test]
async fn test_permanent_error_is_not_queued() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&server, 5);
    let record = dispatcher.dispatch(order_event()).await;

    assert_eq!(record.status, DeliveryState::Failed);
    assert_eq!(record.attempts.len(), 1);
    assert_eq!(record.attempts[0].status_code, Some(404));
    assert!(record.last_error.as_deref().unwrap().contains("404"));
    assert_eq!(dispatcher.queue_status().await.unwrap().size, 0);
}

#[tokio::test]
async fn test_queue_completes_delivery_with_continuous_attempt_numbers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&server, 2);
    let record = dispatcher.dispatch(order_event()).await;
    assert_eq!(record.status, DeliveryState::Retrying);

    let queue = Arc::clone(dispatcher.queue().unwrap());

    // Third attempt fails and is rescheduled.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let report = queue.process_due().await;
    assert_eq!(report.rescheduled, 1);
    let stored = dispatcher.get_delivery(record.id).await.unwrap();
    assert_eq!(stored.status, DeliveryState::Retrying);
    assert_eq!(stored.attempts.len(), 3);

    // Fourth attempt succeeds.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let report = queue.process_due().await;
    assert_eq!(report.delivered, 1);
    assert!(queue.is_empty().await);

    let stored = dispatcher.get_delivery(record.id).await.unwrap();
    assert_eq!(stored.status, DeliveryState::Success);
    let numbers: Vec<u32> = stored.attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert!(stored.next_retry_at.is_none());
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn test_background_queue_gives_up_at_attempt_cap() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = DispatcherConfig {
        webhook_url: server.uri(),
        webhook_secret: SECRET.to_string(),
        enabled: true,
        max_attempts: 1,
        retry_delay: Duration::from_millis(1),
        queue_max_attempts: 3,
        queue_max_delay: Duration::from_millis(5),
        queue_poll_interval: Duration::from_millis(10),
        timeout: Duration::from_secs(2),
        ..DispatcherConfig::default()
    };
    let dispatcher = Arc::new(Dispatcher::in_memory(config).unwrap());
    dispatcher.start();

    let record = dispatcher.dispatch(order_event()).await;
    assert_eq!(record.status, DeliveryState::Retrying);

    let mut stored = dispatcher.get_delivery(record.id).await.unwrap();
    for _ in 0..100 {
        if stored.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        stored = dispatcher.get_delivery(record.id).await.unwrap();
    }

    // One immediate attempt, then scans at counters 1, 2 and 3.
    assert_eq!(stored.status, DeliveryState::Failed);
    assert_eq!(stored.attempts.len(), 4);
    assert_eq!(dispatcher.queue_status().await.unwrap().size, 0);
    dispatcher.shutdown();
}

#[tokio::test]
async fn test_queued_retry_signs_with_rotated_secret() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&server, 1);
    let record = dispatcher.dispatch(order_event()).await;
    assert_eq!(record.status, DeliveryState::Retrying);

    dispatcher.set_webhook_secret("rotated-secret").await;
    server.reset().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    let report = dispatcher.queue().unwrap().process_due().await;
    assert_eq!(report.delivered, 1);

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let headers = extract_signature_headers(&request.headers).unwrap();
    let body = std::str::from_utf8(&request.body).unwrap();
    HmacSigner::new("rotated-secret")
        .verify(body, &headers.signature, headers.timestamp, 300)
        .unwrap();
    assert!(
        HmacSigner::new(SECRET)
            .verify(body, &headers.signature, headers.timestamp, 300)
            .is_err()
    );
}
