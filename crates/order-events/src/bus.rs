use futures::FutureExt;
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::events::{
    DriverAssignedData, EventType, KdsEventData, OrderCreatedData, OrderStatusChangedData,
    WebhookEvent,
};
use crate::traits::{EventError, EventListener};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Registry = HashMap<EventType, Vec<(SubscriptionId, Arc<dyn EventListener>)>>;

/// In-process publish/subscribe registry keyed by event type.
pub struct EventBus {
    listeners: Arc<RwLock<Registry>>,
    history: Arc<RwLock<VecDeque<WebhookEvent>>>,
    history_capacity: usize,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(history_capacity: usize) -> Self {
        Self {
            listeners: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(VecDeque::with_capacity(history_capacity))),
            history_capacity,
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn subscribe(
        &self,
        event_type: EventType,
        listener: Arc<dyn EventListener>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(event_type = %event_type, listener = listener.name(), "Listener subscribed");
        self.listeners
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push((id, listener));
        id
    }

    /// Registers the listener for every event type.
    pub async fn subscribe_all(&self, listener: Arc<dyn EventListener>) -> Vec<SubscriptionId> {
        let mut ids = Vec::with_capacity(EventType::ALL.len());
        for event_type in EventType::ALL {
            ids.push(self.subscribe(event_type, Arc::clone(&listener)).await);
        }
        ids
    }

    pub async fn unsubscribe(&self, event_type: EventType, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().await;
        let Some(entries) = listeners.get_mut(&event_type) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(&event_type);
        }
        removed
    }

    /// Records the event and runs every listener registered for its type to
    /// completion. A failing or panicking listener is logged and does not
    /// affect the others. Returns the number of listeners invoked.
    pub async fn publish(&self, event: WebhookEvent) -> usize {
        self.record(&event).await;

        let listeners: Vec<Arc<dyn EventListener>> = self
            .listeners
            .read()
            .await
            .get(&event.event_type)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        if listeners.is_empty() {
            debug!(event_type = %event.event_type, "No listeners for event");
            return 0;
        }

        let event = &event;
        let runs = listeners.iter().map(|listener| async move {
            match AssertUnwindSafe(listener.on_event(event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    listener = listener.name(),
                    event_type = %event.event_type,
                    event_id = %event.event_id,
                    error = %e,
                    "Event listener failed"
                ),
                Err(_) => error!(
                    listener = listener.name(),
                    event_type = %event.event_type,
                    event_id = %event.event_id,
                    "Event listener panicked"
                ),
            }
        });
        join_all(runs).await;

        listeners.len()
    }

    async fn record(&self, event: &WebhookEvent) {
        if self.history_capacity == 0 {
            return;
        }
        let mut history = self.history.write().await;
        while history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
    }

    /// Most recent events, optionally restricted to one type, oldest first.
    pub async fn history(
        &self,
        event_type: Option<EventType>,
        limit: Option<usize>,
    ) -> Vec<WebhookEvent> {
        let history = self.history.read().await;
        let matching: Vec<&WebhookEvent> = history
            .iter()
            .filter(|e| event_type.is_none_or(|t| e.event_type == t))
            .collect();
        let skip = limit.map_or(0, |limit| matching.len().saturating_sub(limit));
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub async fn clear_history(&self) {
        self.history.write().await.clear();
    }

    pub async fn listener_count(&self, event_type: EventType) -> usize {
        self.listeners
            .read()
            .await
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    pub async fn registered_event_types(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = self.listeners.read().await.keys().copied().collect();
        types.sort();
        types
    }

    pub async fn emit_order_created(
        &self,
        data: &OrderCreatedData,
    ) -> Result<WebhookEvent, EventError> {
        let event = WebhookEvent::order_created(data)?;
        self.publish(event.clone()).await;
        Ok(event)
    }

    /// Publishes nothing when the new status has no lifecycle event.
    pub async fn emit_order_status_changed(
        &self,
        data: &OrderStatusChangedData,
    ) -> Result<Option<WebhookEvent>, EventError> {
        let Some(event) = WebhookEvent::order_status_changed(data)? else {
            debug!(status = %data.new_status, "Status has no lifecycle event");
            return Ok(None);
        };
        self.publish(event.clone()).await;
        Ok(Some(event))
    }

    pub async fn emit_driver_assigned(
        &self,
        data: &DriverAssignedData,
    ) -> Result<WebhookEvent, EventError> {
        let event = WebhookEvent::driver_assigned(data)?;
        self.publish(event.clone()).await;
        Ok(event)
    }

    pub async fn emit_kds_event(&self, data: &KdsEventData) -> Result<WebhookEvent, EventError> {
        let event = WebhookEvent::kds(data)?;
        self.publish(event.clone()).await;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::listener_fn;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventListener for Counting {
        async fn on_event(&self, _event: &WebhookEvent) -> Result<(), EventError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "Counting"
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventListener for Panicking {
        async fn on_event(&self, _event: &WebhookEvent) -> Result<(), EventError> {
            panic!("listener blew up");
        }
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn publish_reaches_only_matching_listeners() {
        let bus = EventBus::new();
        let created = counting();
        let ready = counting();
        bus.subscribe(EventType::OrderCreated, created.clone()).await;
        bus.subscribe(EventType::OrderReady, ready.clone()).await;

        let invoked = bus
            .publish(WebhookEvent::new(EventType::OrderCreated, json!({})))
            .await;

        assert_eq!(invoked, 1);
        assert_eq!(created.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ready.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_and_panicking_listeners_do_not_stop_siblings() {
        let bus = EventBus::new();
        let survivor = counting();
        bus.subscribe(EventType::PaymentFailed, Arc::new(Panicking)).await;
        bus.subscribe(
            EventType::PaymentFailed,
            Arc::new(listener_fn("failing", |_event| async {
                Err::<(), _>(EventError::Listener("boom".into()))
            })),
        )
        .await;
        bus.subscribe(EventType::PaymentFailed, survivor.clone()).await;

        let invoked = bus
            .publish(WebhookEvent::new(EventType::PaymentFailed, json!({})))
            .await;

        assert_eq!(invoked, 3);
        assert_eq!(survivor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_listener() {
        let bus = EventBus::new();
        let listener = counting();
        let id = bus.subscribe(EventType::OrderReady, listener.clone()).await;

        assert!(bus.unsubscribe(EventType::OrderReady, id).await);
        assert!(!bus.unsubscribe(EventType::OrderReady, id).await);
        assert_eq!(bus.listener_count(EventType::OrderReady).await, 0);
        assert!(bus.registered_event_types().await.is_empty());

        bus.publish(WebhookEvent::new(EventType::OrderReady, json!({})))
            .await;
        assert_eq!(listener.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subscribe_all_covers_every_type() {
        let bus = EventBus::new();
        let ids = bus.subscribe_all(counting()).await;
        assert_eq!(ids.len(), EventType::ALL.len());
        assert_eq!(bus.registered_event_types().await.len(), EventType::ALL.len());
    }

    #[tokio::test]
    async fn history_is_bounded_and_oldest_first() {
        let bus = EventBus::with_history_capacity(3);
        for n in 0..5 {
            bus.publish(WebhookEvent::new(EventType::OrderCreated, json!({ "n": n })))
                .await;
        }

        let history = bus.history(None, None).await;
        let ns: Vec<i64> = history.iter().filter_map(|e| e.data["n"].as_i64()).collect();
        assert_eq!(ns, vec![2, 3, 4]);

        let last = bus.history(None, Some(1)).await;
        assert_eq!(last[0].data["n"], 4);
    }

    #[tokio::test]
    async fn history_filters_by_type() {
        let bus = EventBus::new();
        bus.publish(WebhookEvent::new(EventType::OrderCreated, json!({})))
            .await;
        bus.publish(WebhookEvent::new(EventType::OrderReady, json!({})))
            .await;
        bus.publish(WebhookEvent::new(EventType::OrderCreated, json!({})))
            .await;

        assert_eq!(bus.history(Some(EventType::OrderCreated), None).await.len(), 2);
        assert_eq!(bus.history(Some(EventType::OrderReady), Some(5)).await.len(), 1);

        bus.clear_history().await;
        assert!(bus.history(None, None).await.is_empty());
    }
}
