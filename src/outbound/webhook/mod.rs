// Outbound webhook delivery
//
// Leaf components:
//   hmac_signer, retry_strategy, http_client, schemas
//
// Delivery pipeline:
//   dispatcher     – signs, attempts and records each event, hands retryable
//                    failures to the queue
//   delivery_queue – background retries on the backoff curve
//   store / sqlite_store – delivery record persistence

pub mod delivery_queue;
pub mod dispatcher;
pub mod hmac_signer;
pub mod http_client;
pub mod retry_strategy;
pub mod schemas;
pub mod sqlite_store;
pub mod store;

// Re-export commonly used types
pub use delivery_queue::{
    DeliveryCallback, DeliveryCompletion, DeliveryQueue, QueueStatus, QueuedDelivery, ScanReport,
};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherError, DispatcherStatus};
pub use hmac_signer::{
    HmacSigner, SignatureAlgorithm, SignatureEncoding, SignatureError, SigningContext,
    WebhookHeaders, extract_signature_headers,
};
pub use http_client::{DeliveryResponse, HttpClientError, NetworkErrorKind, WebhookHttpClient};
pub use retry_strategy::{
    RetryConfig, RetryOutcome, RetryableError, execute_with_retry, is_retryable_status,
};
pub use schemas::{
    AttemptOutcome, AttemptRecord, CallbackAction, CallbackRequest, DeliveryFilter,
    DeliveryRecord, DeliveryState, DeliveryStats, WebhookResponse,
};
pub use sqlite_store::SqliteDeliveryStore;
pub use store::{DeliveryStore, InMemoryDeliveryStore, StoreError};
