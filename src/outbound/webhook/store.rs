use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::schemas::{DeliveryFilter, DeliveryRecord, DeliveryState, DeliveryStats};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Failed to encode delivery record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistence for delivery records.
///
/// `save` is an upsert keyed by record id. `list` returns newest first.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn save(&self, record: &DeliveryRecord) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<DeliveryRecord>, StoreError>;

    async fn list(&self, filter: &DeliveryFilter) -> Result<Vec<DeliveryRecord>, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<DeliveryStats, StoreError> {
        let records = self.list(&DeliveryFilter::default()).await?;
        Ok(records.iter().collect())
    }

    /// Records still owed an attempt, used to refill the queue on startup.
    async fn in_flight(&self) -> Result<Vec<DeliveryRecord>, StoreError> {
        self.list(&DeliveryFilter::default().with_status(DeliveryState::Retrying))
            .await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDeliveryStore {
    records: RwLock<HashMap<Uuid, DeliveryRecord>>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn save(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeliveryRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list(&self, filter: &DeliveryFilter) -> Result<Vec<DeliveryRecord>, StoreError> {
        let records = self.records.read().await;
        let mut matching: Vec<DeliveryRecord> = records
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.records.write().await.clear();
        Ok(())
    }

    async fn stats(&self) -> Result<DeliveryStats, StoreError> {
        Ok(self.records.read().await.values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use order_events::{EventType, WebhookEvent};
    use serde_json::json;

    fn record(event_type: EventType) -> DeliveryRecord {
        DeliveryRecord::new(WebhookEvent::new(event_type, json!({})), "http://hooks.test")
    }

    #[tokio::test]
    async fn test_save_is_upsert() -> Result<(), StoreError> {
        let store = InMemoryDeliveryStore::new();
        let mut r = record(EventType::OrderCreated);
        store.save(&r).await?;
        r.mark_failed("HTTP 404");
        store.save(&r).await?;

        let stored = store.get(r.id).await?.unwrap();
        assert_eq!(stored.status, DeliveryState::Failed);
        assert_eq!(store.stats().await?.total, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_filters_newest_first() -> Result<(), StoreError> {
        let store = InMemoryDeliveryStore::new();
        let first = record(EventType::OrderCreated);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = record(EventType::OrderReady);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let third = record(EventType::OrderCreated);
        for r in [&first, &second, &third] {
            store.save(r).await?;
        }

        let all = store.list(&DeliveryFilter::default()).await?;
        let ids: Vec<Uuid> = all.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![third.id, second.id, first.id]);

        let created = store
            .list(&DeliveryFilter::default().with_event_type(EventType::OrderCreated))
            .await?;
        assert_eq!(created.len(), 2);

        let limited = store.list(&DeliveryFilter::default().with_limit(1)).await?;
        assert_eq!(limited[0].id, third.id);

        store.clear().await?;
        assert!(store.list(&DeliveryFilter::default()).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_in_flight_returns_retrying_only() -> Result<(), StoreError> {
        let store = InMemoryDeliveryStore::new();
        let mut retrying = record(EventType::PaymentReceived);
        retrying.mark_retrying(time::OffsetDateTime::now_utc());
        store.save(&retrying).await?;
        store.save(&record(EventType::PaymentReceived)).await?;

        let in_flight = store.in_flight().await?;
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].id, retrying.id);
        Ok(())
    }
}
