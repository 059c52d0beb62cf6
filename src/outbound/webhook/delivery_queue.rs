use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hmac_signer::{HmacSigner, SigningContext};
use super::http_client::{DeliveryResponse, HttpClientError, WebhookHttpClient};
use super::retry_strategy::{RetryConfig, RetryOutcome, RetryableError, execute_with_retry};
use super::schemas::AttemptRecord;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How a queued delivery left the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryCompletion {
    Delivered,
    Failed(String),
}

/// Receives progress of queued deliveries.
#[async_trait]
pub trait DeliveryCallback: Send + Sync {
    async fn on_attempt(&self, delivery_id: Uuid, attempt: &AttemptRecord);

    async fn on_rescheduled(&self, _delivery_id: Uuid, _next_retry_at: OffsetDateTime) {}

    async fn on_complete(&self, delivery_id: Uuid, completion: &DeliveryCompletion);
}

/// A queued webhook delivery
#[derive(Debug, Clone)]
pub struct QueuedDelivery {
    pub id: Uuid,

    /// Webhook URL
    pub url: String,

    /// Serialized payload, sent unchanged on every attempt
    pub body: String,

    pub signing: SigningContext,

    pub config: RetryConfig,

    /// Attempts made so far
    pub attempts: u32,

    pub next_retry_at: OffsetDateTime,
}

impl QueuedDelivery {
    /// An entry that has already been attempted `attempts_made` times.
    /// Its next attempt is scheduled on the backoff curve after that count.
    pub fn continuing(
        id: Uuid,
        url: impl Into<String>,
        body: impl Into<String>,
        signing: SigningContext,
        config: RetryConfig,
        attempts_made: u32,
    ) -> Self {
        let attempts = attempts_made.max(1);
        Self {
            id,
            url: url.into(),
            body: body.into(),
            next_retry_at: schedule(&config, attempts),
            signing,
            config,
            attempts,
        }
    }
}

fn schedule(config: &RetryConfig, attempts: u32) -> OffsetDateTime {
    OffsetDateTime::now_utc() + config.retry_delay(attempts)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueItemStatus {
    pub id: Uuid,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub next_retry_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub size: usize,
    pub processing: bool,
    pub items: Vec<QueueItemStatus>,
}

/// Totals for one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub attempted: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub rescheduled: usize,
}

/// Resets the scan flag even if a scan unwinds.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Background scheduler for deliveries that exhausted their immediate retries
pub struct DeliveryQueue {
    /// Deliveries waiting for their next attempt
    pending: Arc<RwLock<VecDeque<QueuedDelivery>>>,

    processing: AtomicBool,

    http_client: Arc<WebhookHttpClient>,

    callback: Option<Arc<dyn DeliveryCallback>>,

    poll_interval: Duration,

    /// Due entries attempted concurrently within one scan
    scan_concurrency: usize,

    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryQueue {
    pub fn new(http_client: Arc<WebhookHttpClient>) -> Self {
        Self {
            pending: Arc::new(RwLock::new(VecDeque::new())),
            processing: AtomicBool::new(false),
            http_client,
            callback: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            scan_concurrency: 1,
            worker: Mutex::new(None),
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn DeliveryCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_scan_concurrency(mut self, scan_concurrency: usize) -> Self {
        self.scan_concurrency = scan_concurrency.max(1);
        self
    }

    /// Adds a delivery, or counts another attempt if `id` is already queued.
    pub async fn add(
        &self,
        id: Uuid,
        url: impl Into<String>,
        body: impl Into<String>,
        signing: SigningContext,
        config: RetryConfig,
    ) {
        let mut pending = self.pending.write().await;

        if let Some(existing) = pending.iter_mut().find(|d| d.id == id) {
            existing.attempts += 1;
            existing.next_retry_at = schedule(&config, existing.attempts);
            debug!(
                delivery_id = %id,
                attempts = existing.attempts,
                "Delivery already queued, rescheduled"
            );
            return;
        }

        let delivery = QueuedDelivery::continuing(id, url, body, signing, config, 1);
        debug!(
            delivery_id = %id,
            next_retry_at = %delivery.next_retry_at,
            "Enqueuing delivery"
        );
        pending.push_back(delivery);
    }

    /// Adds a delivery that was already attempted `attempts_made` times.
    pub async fn add_continuing(
        &self,
        id: Uuid,
        url: impl Into<String>,
        body: impl Into<String>,
        signing: SigningContext,
        config: RetryConfig,
        attempts_made: u32,
    ) {
        self.enqueue(QueuedDelivery::continuing(
            id,
            url,
            body,
            signing,
            config,
            attempts_made,
        ))
        .await;
    }

    /// Enqueue a delivery, replacing any entry with the same id
    pub async fn enqueue(&self, delivery: QueuedDelivery) {
        let mut pending = self.pending.write().await;
        debug!(
            delivery_id = %delivery.id,
            attempts = delivery.attempts,
            next_retry_at = %delivery.next_retry_at,
            "Enqueuing delivery"
        );
        pending.retain(|d| d.id != delivery.id);
        pending.push_back(delivery);
    }

    /// Swaps the signer of every waiting entry, e.g. after a secret
    /// rotation. An attempt already in flight keeps the signer it started with.
    pub async fn update_signer(&self, signer: &HmacSigner) {
        let mut pending = self.pending.write().await;
        for delivery in pending.iter_mut() {
            delivery.signing.signer = signer.clone();
        }
        debug!(count = pending.len(), "Queued deliveries re-keyed");
    }

    pub async fn remove(&self, id: Uuid) -> bool {
        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|d| d.id != id);
        pending.len() != before
    }

    /// Get queue size
    pub async fn size(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Check if queue is empty
    pub async fn is_empty(&self) -> bool {
        self.pending.read().await.is_empty()
    }

    pub async fn status(&self) -> QueueStatus {
        let pending = self.pending.read().await;
        QueueStatus {
            size: pending.len(),
            processing: self.processing.load(Ordering::Acquire),
            items: pending
                .iter()
                .map(|d| QueueItemStatus {
                    id: d.id,
                    attempts: d.attempts,
                    next_retry_at: d.next_retry_at,
                })
                .collect(),
        }
    }

    /// Clear all pending deliveries
    pub async fn clear(&self) {
        let mut pending = self.pending.write().await;
        info!(count = pending.len(), "Clearing delivery queue");
        pending.clear();
    }

    /// Runs one scan over due entries. Returns immediately with an empty
    /// report if another scan is in progress.
    pub async fn process_due(&self) -> ScanReport {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Queue scan already in progress, skipping");
            return ScanReport::default();
        }
        let _guard = ScanGuard(&self.processing);

        let now = OffsetDateTime::now_utc();
        let due: Vec<QueuedDelivery> = self
            .pending
            .read()
            .await
            .iter()
            .filter(|d| d.next_retry_at <= now)
            .cloned()
            .collect();

        if due.is_empty() {
            return ScanReport::default();
        }
        debug!(count = due.len(), "Processing due deliveries");

        let results: Vec<_> = futures::stream::iter(due)
            .map(|delivery| self.attempt(delivery))
            .buffer_unordered(self.scan_concurrency)
            .collect()
            .await;

        let mut report = ScanReport {
            attempted: results.len(),
            ..ScanReport::default()
        };
        for (delivery, outcome) in results {
            self.settle(delivery, outcome, &mut report).await;
        }
        report
    }

    async fn attempt(
        &self,
        delivery: QueuedDelivery,
    ) -> (QueuedDelivery, RetryOutcome<DeliveryResponse, HttpClientError>) {
        let config = delivery.config.single_attempt();
        let mut attempts = Vec::with_capacity(1);

        let outcome = {
            let client = self.http_client.as_ref();
            let entry = &delivery;
            execute_with_retry(
                move |_| client.deliver(&entry.url, &entry.body, &entry.signing),
                &config,
                |record| attempts.push(record.clone()),
            )
            .await
        };

        if let Some(callback) = &self.callback {
            for record in &attempts {
                callback.on_attempt(delivery.id, record).await;
            }
        }

        (delivery, outcome)
    }

    async fn settle(
        &self,
        delivery: QueuedDelivery,
        outcome: RetryOutcome<DeliveryResponse, HttpClientError>,
        report: &mut ScanReport,
    ) {
        let error = match outcome.result {
            Ok(response) => {
                self.remove(delivery.id).await;
                report.delivered += 1;
                info!(
                    delivery_id = %delivery.id,
                    attempts = delivery.attempts,
                    status = response.status_code,
                    "Queued delivery succeeded"
                );
                self.complete(delivery.id, DeliveryCompletion::Delivered).await;
                return;
            }
            Err(error) => error,
        };

        if !error.is_retryable() || delivery.attempts >= delivery.config.max_attempts {
            self.remove(delivery.id).await;
            report.dropped += 1;
            warn!(
                delivery_id = %delivery.id,
                attempts = delivery.attempts,
                error = %error,
                "Queued delivery permanently failed"
            );
            self.complete(delivery.id, DeliveryCompletion::Failed(error.to_string()))
                .await;
            return;
        }

        let next_retry_at = {
            let mut pending = self.pending.write().await;
            // The entry may have been removed while its attempt was in flight.
            let Some(entry) = pending.iter_mut().find(|d| d.id == delivery.id) else {
                return;
            };
            entry.attempts += 1;
            entry.next_retry_at = schedule(&entry.config, entry.attempts);
            debug!(
                delivery_id = %entry.id,
                attempts = entry.attempts,
                next_retry_at = %entry.next_retry_at,
                error = %error,
                "Queued delivery rescheduled"
            );
            entry.next_retry_at
        };
        report.rescheduled += 1;

        if let Some(callback) = &self.callback {
            callback.on_rescheduled(delivery.id, next_retry_at).await;
        }
    }

    async fn complete(&self, id: Uuid, completion: DeliveryCompletion) {
        if let Some(callback) = &self.callback {
            callback.on_complete(id, &completion).await;
        }
    }

    /// Starts the polling loop. Calling it again while running is a no-op.
    ///
    /// The loop holds only a weak reference and exits once the queue is
    /// dropped.
    pub fn start(self: &Arc<Self>) {
        let Ok(mut worker) = self.worker.lock() else {
            warn!("Queue worker lock poisoned, not starting");
            return;
        };
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let queue: Weak<Self> = Arc::downgrade(self);
        let poll_interval = self.poll_interval;
        info!(
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Starting delivery queue"
        );

        *worker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                queue.process_due().await;
            }
        }));
    }

    pub fn stop(&self) {
        let Ok(mut worker) = self.worker.lock() else {
            return;
        };
        if let Some(handle) = worker.take() {
            handle.abort();
            info!("Delivery queue stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|worker| worker.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::webhook::hmac_signer::HmacSigner;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Recorder {
        attempts: Mutex<Vec<(Uuid, AttemptRecord)>>,
        completions: Mutex<Vec<(Uuid, DeliveryCompletion)>>,
        reschedules: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl DeliveryCallback for Recorder {
        async fn on_attempt(&self, delivery_id: Uuid, attempt: &AttemptRecord) {
            self.attempts.lock().unwrap().push((delivery_id, attempt.clone()));
        }

        async fn on_rescheduled(&self, delivery_id: Uuid, _next_retry_at: OffsetDateTime) {
            self.reschedules.lock().unwrap().push(delivery_id);
        }

        async fn on_complete(&self, delivery_id: Uuid, completion: &DeliveryCompletion) {
            self.completions
                .lock()
                .unwrap()
                .push((delivery_id, completion.clone()));
        }
    }

    fn signing() -> SigningContext {
        SigningContext::new(HmacSigner::new("queue-secret"), "order.created", "1.0")
    }

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(max_attempts, Duration::from_millis(1)).with_jitter(false)
    }

    fn queue_with(recorder: &Arc<Recorder>) -> DeliveryQueue {
        let client = Arc::new(WebhookHttpClient::with_timeout(Duration::from_secs(2)).unwrap());
        DeliveryQueue::new(client).with_callback(recorder.clone())
    }

    async fn wait_until_due() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_add_and_readd_counts_attempts() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue_with(&recorder);
        let id = Uuid::new_v4();

        queue
            .add(id, "http://localhost/hook", "{}", signing(), RetryConfig::default())
            .await;
        queue
            .add(id, "http://localhost/hook", "{}", signing(), RetryConfig::default())
            .await;

        let status = queue.status().await;
        assert_eq!(status.size, 1);
        assert_eq!(status.items[0].attempts, 2);
        assert!(!status.processing);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue_with(&recorder);
        let first = Uuid::new_v4();

        queue.add(first, "http://a", "{}", signing(), fast(3)).await;
        queue
            .add(Uuid::new_v4(), "http://b", "{}", signing(), fast(3))
            .await;

        assert!(queue.remove(first).await);
        assert!(!queue.remove(first).await);
        assert_eq!(queue.size().await, 1);

        queue.clear().await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_entries_not_yet_due_are_skipped() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue_with(&recorder);
        queue
            .add(Uuid::new_v4(), "http://localhost:1/hook", "{}", signing(), RetryConfig::default())
            .await;

        let report = queue.process_due().await;
        assert_eq!(report, ScanReport::default());
        assert_eq!(queue.size().await, 1);
    }

    #[tokio::test]
    async fn test_success_removes_entry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let recorder = Arc::new(Recorder::default());
        let queue = queue_with(&recorder);
        let id = Uuid::new_v4();
        queue.add(id, server.uri(), "{}", signing(), fast(5)).await;
        wait_until_due().await;

        let report = queue.process_due().await;

        assert_eq!(report.delivered, 1);
        assert!(queue.is_empty().await);
        assert_eq!(
            recorder.completions.lock().unwrap().as_slice(),
            &[(id, DeliveryCompletion::Delivered)]
        );
        assert_eq!(recorder.attempts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_converges_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let recorder = Arc::new(Recorder::default());
        let queue = queue_with(&recorder);
        let id = Uuid::new_v4();
        queue.add(id, server.uri(), r#"{"n":1}"#, signing(), fast(3)).await;

        let mut scans = 0;
        while !queue.is_empty().await && scans < 10 {
            wait_until_due().await;
            if queue.process_due().await.attempted > 0 {
                scans += 1;
            }
        }

        assert_eq!(scans, 3);
        assert!(queue.is_empty().await);
        assert_eq!(recorder.reschedules.lock().unwrap().len(), 2);
        let completions = recorder.completions.lock().unwrap();
        assert!(matches!(&completions[..], [(done, DeliveryCompletion::Failed(_))] if *done == id));

        let requests = server.received_requests().await.unwrap_or_default();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.body == br#"{"n":1}"#));
    }

    #[tokio::test]
    async fn test_continuing_entry_counts_prior_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let recorder = Arc::new(Recorder::default());
        let queue = queue_with(&recorder);
        queue
            .add_continuing(Uuid::new_v4(), server.uri(), "{}", signing(), fast(3), 2)
            .await;
        assert_eq!(queue.status().await.items[0].attempts, 2);

        wait_until_due().await;
        let first = queue.process_due().await;
        assert_eq!(first.rescheduled, 1);
        assert_eq!(queue.status().await.items[0].attempts, 3);

        wait_until_due().await;
        let second = queue.process_due().await;
        assert_eq!(second.dropped, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_permanent_error_drops_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let recorder = Arc::new(Recorder::default());
        let queue = queue_with(&recorder);
        queue.add(Uuid::new_v4(), server.uri(), "{}", signing(), fast(10)).await;
        wait_until_due().await;

        let report = queue.process_due().await;

        assert_eq!(report.dropped, 1);
        assert!(queue.is_empty().await);
        let attempts = recorder.attempts.lock().unwrap();
        assert_eq!(attempts[0].1.status_code, Some(410));
    }

    #[tokio::test]
    async fn test_concurrent_scan_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .mount(&server)
            .await;

        let recorder = Arc::new(Recorder::default());
        let queue = Arc::new(queue_with(&recorder));
        queue
            .add(Uuid::new_v4(), server.uri(), "{}", signing(), fast(3))
            .await;
        wait_until_due().await;

        let background = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.process_due().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(queue.status().await.processing);
        assert_eq!(queue.process_due().await, ScanReport::default());

        let report = background.await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(!queue.status().await.processing);
    }

    #[tokio::test]
    async fn test_background_loop_delivers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let recorder = Arc::new(Recorder::default());
        let queue = Arc::new(queue_with(&recorder).with_poll_interval(Duration::from_millis(10)));
        queue.add(Uuid::new_v4(), server.uri(), "{}", signing(), fast(3)).await;

        queue.start();
        assert!(queue.is_running());

        for _ in 0..100 {
            if queue.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        queue.stop();

        assert!(queue.is_empty().await);
        assert!(!queue.is_running());
    }
}
