//! Delivery orchestration.
//!
//! [`Dispatcher::dispatch`] takes an event through the delivery state machine:
//!
//! ```text
//! disabled             -> pending (no attempt)
//! no webhook url       -> failed
//! delivered            -> success
//! retryable exhaustion -> retrying -> handed to the DeliveryQueue
//! permanent error      -> failed
//! ```
//!
//! The dispatcher writes the `retrying` record before the queue sees the
//! delivery, so from then on only the queue callback mutates it.

use async_trait::async_trait;
use order_events::{
    DriverAssignedData, EventBus, EventError, EventListener, EventMetadata, EventType,
    KdsEventData, OrderCreatedData, OrderStatusChangedData, SubscriptionId, WebhookEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::delivery_queue::{
    DEFAULT_POLL_INTERVAL, DeliveryCallback, DeliveryCompletion, DeliveryQueue, QueueStatus,
    QueuedDelivery,
};
use super::hmac_signer::{
    DEFAULT_TIMESTAMP_TOLERANCE_SECS, HmacSigner, SignatureAlgorithm, SignatureEncoding,
    SigningContext,
};
use super::http_client::{DEFAULT_TIMEOUT, HttpClientError, WebhookHttpClient};
use super::retry_strategy::{RetryConfig, RetryableError, execute_with_retry};
use super::schemas::{AttemptRecord, DeliveryFilter, DeliveryRecord, DeliveryStats};
use super::store::{DeliveryStore, InMemoryDeliveryStore};

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("Initialisation failed: {0}")]
    Initialisation(#[from] HttpClientError),
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub webhook_url: String,
    pub webhook_secret: String,
    pub enabled: bool,

    /// Immediate attempts before handing over to the queue
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub timeout: Duration,

    pub queue_enabled: bool,
    /// Attempt count at which a failing queued delivery is dropped. Queued
    /// entries start counting from the immediate attempts already made.
    pub queue_max_attempts: u32,
    pub queue_max_delay: Duration,
    pub queue_poll_interval: Duration,
    pub queue_scan_concurrency: usize,

    pub signature_algorithm: SignatureAlgorithm,
    pub signature_encoding: SignatureEncoding,
    pub signature_tolerance_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            webhook_secret: String::new(),
            enabled: false,
            max_attempts: 5,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            timeout: DEFAULT_TIMEOUT,
            queue_enabled: true,
            queue_max_attempts: 10,
            queue_max_delay: Duration::from_secs(3600),
            queue_poll_interval: DEFAULT_POLL_INTERVAL,
            queue_scan_concurrency: 1,
            signature_algorithm: SignatureAlgorithm::default(),
            signature_encoding: SignatureEncoding::default(),
            signature_tolerance_secs: DEFAULT_TIMESTAMP_TOLERANCE_SECS,
        }
    }
}

impl DispatcherConfig {
    pub fn immediate_retry(&self) -> RetryConfig {
        RetryConfig::new(self.max_attempts, self.retry_delay).with_max_delay(self.max_retry_delay)
    }

    /// Queued attempts continue the immediate curve with a longer cap.
    pub fn queue_retry(&self) -> RetryConfig {
        RetryConfig::new(self.queue_max_attempts, self.retry_delay)
            .with_max_delay(self.queue_max_delay)
    }
}

/// Settings that can change while the service runs.
#[derive(Debug, Clone)]
struct RuntimeSettings {
    enabled: bool,
    webhook_url: String,
    webhook_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherStatus {
    pub enabled: bool,
    pub webhook_url: String,
    pub queue_size: usize,
    pub deliveries: DeliveryStats,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    settings: RwLock<RuntimeSettings>,
    store: Arc<dyn DeliveryStore>,
    http_client: Arc<WebhookHttpClient>,
    queue: Option<Arc<DeliveryQueue>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn DeliveryStore>,
    ) -> Result<Self, DispatcherError> {
        let http_client = Arc::new(WebhookHttpClient::with_timeout(config.timeout)?);

        let queue = config.queue_enabled.then(|| {
            Arc::new(
                DeliveryQueue::new(Arc::clone(&http_client))
                    .with_callback(Arc::new(StoreCallback {
                        store: Arc::clone(&store),
                    }))
                    .with_poll_interval(config.queue_poll_interval)
                    .with_scan_concurrency(config.queue_scan_concurrency),
            )
        });

        let settings = RwLock::new(RuntimeSettings {
            enabled: config.enabled,
            webhook_url: config.webhook_url.clone(),
            webhook_secret: config.webhook_secret.clone(),
        });

        Ok(Self {
            config,
            settings,
            store,
            http_client,
            queue,
        })
    }

    pub fn in_memory(config: DispatcherConfig) -> Result<Self, DispatcherError> {
        Self::new(config, Arc::new(InMemoryDeliveryStore::new()))
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn queue(&self) -> Option<&Arc<DeliveryQueue>> {
        self.queue.as_ref()
    }

    /// Starts the queue's polling loop.
    pub fn start(&self) {
        if let Some(queue) = &self.queue {
            queue.start();
        }
    }

    pub fn shutdown(&self) {
        if let Some(queue) = &self.queue {
            queue.stop();
        }
    }

    /// Subscribes this dispatcher to every event type on `bus`.
    pub async fn attach(self: &Arc<Self>, bus: &EventBus) -> Vec<SubscriptionId> {
        let listener = Arc::new(DispatchListener {
            dispatcher: Arc::clone(self),
        });
        let ids = bus.subscribe_all(listener).await;
        info!(event_types = ids.len(), "Webhook dispatcher attached to event bus");
        ids
    }

    /// Signer for the current secret and signature settings.
    pub async fn signer(&self) -> HmacSigner {
        let secret = self.settings.read().await.webhook_secret.clone();
        self.signer_for(secret)
    }

    /// Whether a non-empty secret is configured.
    pub async fn has_webhook_secret(&self) -> bool {
        !self.settings.read().await.webhook_secret.is_empty()
    }

    fn signer_for(&self, secret: String) -> HmacSigner {
        HmacSigner::new(secret)
            .with_algorithm(self.config.signature_algorithm)
            .with_encoding(self.config.signature_encoding)
    }

    /// Delivers `event`, returning its record in the state it reached.
    pub async fn dispatch(&self, event: WebhookEvent) -> DeliveryRecord {
        let settings = self.settings.read().await.clone();
        let mut record = DeliveryRecord::new(event, settings.webhook_url.clone());

        if !settings.enabled {
            info!(
                delivery_id = %record.id,
                event_type = %record.event_type,
                "Webhooks disabled, delivery left pending"
            );
            self.persist(&record).await;
            return record;
        }

        if settings.webhook_url.is_empty() {
            error!(
                delivery_id = %record.id,
                event_type = %record.event_type,
                "No webhook URL configured"
            );
            record.mark_failed("No webhook URL configured");
            self.persist(&record).await;
            return record;
        }

        self.persist(&record).await;

        let body = match record.payload.to_json() {
            Ok(body) => body,
            Err(e) => {
                error!(delivery_id = %record.id, error = %e, "Failed to serialize payload");
                record.mark_failed(e.to_string());
                self.persist(&record).await;
                return record;
            }
        };

        let signing = SigningContext::new(
            self.signer_for(settings.webhook_secret),
            record.event_type.as_str(),
            record.payload.webhook_version.clone(),
        );
        let retry = self.config.immediate_retry();
        let url = settings.webhook_url;

        debug!(
            delivery_id = %record.id,
            event_id = %record.event_id,
            event_type = %record.event_type,
            url = %url,
            "Dispatching webhook"
        );

        let mut attempts = Vec::new();
        let outcome = {
            let client = self.http_client.as_ref();
            let (url, body, signing) = (&url, &body, &signing);
            execute_with_retry(
                move |_| client.deliver(url, body, signing),
                &retry,
                |attempt| attempts.push(attempt.clone()),
            )
            .await
        };
        for attempt in attempts {
            record.record_attempt(attempt);
        }

        match outcome.result {
            Ok(response) => {
                record.mark_success();
                info!(
                    delivery_id = %record.id,
                    event_type = %record.event_type,
                    attempts = outcome.attempts,
                    status = response.status_code,
                    "Webhook delivered"
                );
                self.persist(&record).await;
            }
            Err(error) => match self.queue.as_ref().filter(|_| error.is_retryable()) {
                Some(queue) => {
                    let entry = QueuedDelivery::continuing(
                        record.id,
                        url,
                        body,
                        signing,
                        self.config.queue_retry(),
                        outcome.attempts,
                    );
                    record.mark_retrying(entry.next_retry_at);
                    warn!(
                        delivery_id = %record.id,
                        attempts = outcome.attempts,
                        next_retry_at = %entry.next_retry_at,
                        error = %error,
                        "Immediate delivery failed, queued for retry"
                    );
                    self.persist(&record).await;
                    queue.enqueue(entry).await;
                }
                None => {
                    record.mark_failed(error.to_string());
                    warn!(
                        delivery_id = %record.id,
                        attempts = outcome.attempts,
                        error = %error,
                        "Webhook delivery failed"
                    );
                    self.persist(&record).await;
                }
            },
        }

        record
    }

    async fn persist(&self, record: &DeliveryRecord) {
        if let Err(e) = self.store.save(record).await {
            error!(delivery_id = %record.id, error = %e, "Failed to persist delivery record");
        }
    }

    pub async fn dispatch_custom(
        &self,
        event_type: EventType,
        data: Value,
        metadata: Option<Map<String, Value>>,
    ) -> DeliveryRecord {
        let mut event = WebhookEvent::new(event_type, data);
        if let Some(supplied) = metadata {
            event.metadata = EventMetadata::new().merge(supplied);
        }
        self.dispatch(event).await
    }

    pub async fn dispatch_order_created(
        &self,
        data: &OrderCreatedData,
    ) -> Result<DeliveryRecord, EventError> {
        let event = WebhookEvent::order_created(data)?;
        Ok(self.dispatch(event).await)
    }

    /// `Ok(None)` when the new status has no lifecycle event.
    pub async fn dispatch_order_status_changed(
        &self,
        data: &OrderStatusChangedData,
    ) -> Result<Option<DeliveryRecord>, EventError> {
        match WebhookEvent::order_status_changed(data)? {
            Some(event) => Ok(Some(self.dispatch(event).await)),
            None => {
                warn!(
                    order_id = %data.order_id,
                    status = %data.new_status,
                    "No webhook event for order status"
                );
                Ok(None)
            }
        }
    }

    pub async fn dispatch_driver_assigned(
        &self,
        data: &DriverAssignedData,
    ) -> Result<DeliveryRecord, EventError> {
        let event = WebhookEvent::driver_assigned(data)?;
        Ok(self.dispatch(event).await)
    }

    pub async fn dispatch_kds_event(
        &self,
        data: &KdsEventData,
    ) -> Result<DeliveryRecord, EventError> {
        let event = WebhookEvent::kds(data)?;
        Ok(self.dispatch(event).await)
    }

    pub async fn get_delivery(&self, id: Uuid) -> Option<DeliveryRecord> {
        match self.store.get(id).await {
            Ok(record) => record,
            Err(e) => {
                error!(delivery_id = %id, error = %e, "Failed to load delivery record");
                None
            }
        }
    }

    pub async fn get_deliveries(&self, filter: &DeliveryFilter) -> Vec<DeliveryRecord> {
        self.store.list(filter).await.unwrap_or_else(|e| {
            error!(error = %e, "Failed to list delivery records");
            Vec::new()
        })
    }

    pub async fn status(&self) -> DispatcherStatus {
        let settings = self.settings.read().await.clone();
        let queue_size = match &self.queue {
            Some(queue) => queue.size().await,
            None => 0,
        };
        let deliveries = self.store.stats().await.unwrap_or_else(|e| {
            error!(error = %e, "Failed to compute delivery stats");
            DeliveryStats::default()
        });

        DispatcherStatus {
            enabled: settings.enabled,
            webhook_url: settings.webhook_url,
            queue_size,
            deliveries,
        }
    }

    pub async fn queue_status(&self) -> Option<QueueStatus> {
        match &self.queue {
            Some(queue) => Some(queue.status().await),
            None => None,
        }
    }

    /// Drops every stored record. Queued deliveries keep running.
    pub async fn clear_history(&self) {
        if let Err(e) = self.store.clear().await {
            error!(error = %e, "Failed to clear delivery history");
        } else {
            info!("Delivery history cleared");
        }
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.settings.write().await.enabled = enabled;
        info!(enabled, "Webhook dispatch toggled");
    }

    pub async fn set_webhook_url(&self, url: impl Into<String>) {
        let url = url.into();
        info!(url = %url, "Webhook URL updated");
        self.settings.write().await.webhook_url = url;
    }

    /// Replaces the secret for new deliveries and for those already queued.
    pub async fn set_webhook_secret(&self, secret: impl Into<String>) {
        let secret = secret.into();
        let signer = self.signer_for(secret.clone());
        self.settings.write().await.webhook_secret = secret;
        if let Some(queue) = &self.queue {
            queue.update_signer(&signer).await;
        }
        info!("Webhook secret updated");
    }

    /// Puts stored `retrying` records back on the queue after a restart.
    /// Returns how many were queued.
    pub async fn resume_in_flight(&self) -> usize {
        let Some(queue) = &self.queue else {
            return 0;
        };
        let records = match self.store.in_flight().await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to load in-flight deliveries");
                return 0;
            }
        };

        let secret = self.settings.read().await.webhook_secret.clone();
        let mut resumed = 0;
        for record in records {
            let body = match record.payload.to_json() {
                Ok(body) => body,
                Err(e) => {
                    error!(delivery_id = %record.id, error = %e, "Cannot resume delivery");
                    continue;
                }
            };
            let signing = SigningContext::new(
                self.signer_for(secret.clone()),
                record.event_type.as_str(),
                record.payload.webhook_version.clone(),
            );
            let attempts_made = record.attempts.len() as u32;
            queue
                .add_continuing(
                    record.id,
                    record.webhook_url,
                    body,
                    signing,
                    self.config.queue_retry(),
                    attempts_made,
                )
                .await;
            resumed += 1;
        }

        if resumed > 0 {
            info!(count = resumed, "Resumed in-flight deliveries");
        }
        resumed
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Forwards every bus event into the dispatcher.
struct DispatchListener {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl EventListener for DispatchListener {
    async fn on_event(&self, event: &WebhookEvent) -> Result<(), EventError> {
        self.dispatcher.dispatch(event.clone()).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "WebhookDispatcher"
    }
}

/// Applies queue progress to stored delivery records.
struct StoreCallback {
    store: Arc<dyn DeliveryStore>,
}

impl StoreCallback {
    async fn update(&self, delivery_id: Uuid, apply: impl FnOnce(&mut DeliveryRecord) + Send) {
        let mut record = match self.store.get(delivery_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(delivery_id = %delivery_id, "Queued delivery has no record");
                return;
            }
            Err(e) => {
                error!(delivery_id = %delivery_id, error = %e, "Failed to load delivery record");
                return;
            }
        };
        apply(&mut record);
        if let Err(e) = self.store.save(&record).await {
            error!(delivery_id = %delivery_id, error = %e, "Failed to persist delivery record");
        }
    }
}

#[async_trait]
impl DeliveryCallback for StoreCallback {
    async fn on_attempt(&self, delivery_id: Uuid, attempt: &AttemptRecord) {
        let attempt = attempt.clone();
        self.update(delivery_id, move |record| record.record_attempt(attempt))
            .await;
    }

    async fn on_rescheduled(&self, delivery_id: Uuid, next_retry_at: OffsetDateTime) {
        self.update(delivery_id, move |record| record.mark_retrying(next_retry_at))
            .await;
    }

    async fn on_complete(&self, delivery_id: Uuid, completion: &DeliveryCompletion) {
        let completion = completion.clone();
        self.update(delivery_id, move |record| match completion {
            DeliveryCompletion::Delivered => record.mark_success(),
            DeliveryCompletion::Failed(error) => record.mark_failed(error),
        })
        .await;
    }
}
