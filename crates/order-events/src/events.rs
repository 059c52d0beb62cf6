use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::traits::EventError;

/// Schema version stamped on every outbound payload.
pub const WEBHOOK_VERSION: &str = "1.0";

/// Default `metadata.source` tag.
pub const DEFAULT_SOURCE: &str = "order-webhooks";

/// Closed set of event kinds the service can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    // Order lifecycle
    #[serde(rename = "order.created")]
    OrderCreated,
    #[serde(rename = "order.confirmed")]
    OrderConfirmed,
    #[serde(rename = "order.preparing")]
    OrderPreparing,
    #[serde(rename = "order.ready")]
    OrderReady,
    #[serde(rename = "order.in_delivery")]
    OrderInDelivery,
    #[serde(rename = "order.completed")]
    OrderCompleted,
    #[serde(rename = "order.cancelled")]
    OrderCancelled,
    #[serde(rename = "order.reminder")]
    OrderReminder,

    // Payments
    #[serde(rename = "payment.received")]
    PaymentReceived,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.refunded")]
    PaymentRefunded,

    // Customers
    #[serde(rename = "customer.registered")]
    CustomerRegistered,
    #[serde(rename = "customer.updated")]
    CustomerUpdated,

    // Kitchen display
    #[serde(rename = "kds.acknowledged")]
    KdsAcknowledged,
    #[serde(rename = "kds.completed")]
    KdsCompleted,

    // Delivery drivers
    #[serde(rename = "delivery.driver_assigned")]
    DriverAssigned,
    #[serde(rename = "delivery.driver_departed")]
    DriverDeparted,
    #[serde(rename = "delivery.driver_arrived")]
    DriverArrived,

    // Database health
    #[serde(rename = "database.health_check")]
    DatabaseHealthCheck,
    #[serde(rename = "database.health_warning")]
    DatabaseHealthWarning,
    #[serde(rename = "database.health_critical")]
    DatabaseHealthCritical,

    // Scheduled jobs
    #[serde(rename = "scheduled.daily_summary")]
    DailySummary,
    #[serde(rename = "scheduled.weekly_report")]
    WeeklyReport,
    #[serde(rename = "scheduled.low_inventory")]
    LowInventory,
    #[serde(rename = "scheduled.timeslot_capacity")]
    TimeslotCapacity,

    // Marketing
    #[serde(rename = "marketing.abandoned_cart")]
    AbandonedCart,
    #[serde(rename = "marketing.loyalty_milestone")]
    LoyaltyMilestone,
    #[serde(rename = "marketing.birthday_reminder")]
    BirthdayReminder,
}

impl EventType {
    pub const ALL: [EventType; 28] = [
        EventType::OrderCreated,
        EventType::OrderConfirmed,
        EventType::OrderPreparing,
        EventType::OrderReady,
        EventType::OrderInDelivery,
        EventType::OrderCompleted,
        EventType::OrderCancelled,
        EventType::OrderReminder,
        EventType::PaymentReceived,
        EventType::PaymentFailed,
        EventType::PaymentRefunded,
        EventType::CustomerRegistered,
        EventType::CustomerUpdated,
        EventType::KdsAcknowledged,
        EventType::KdsCompleted,
        EventType::DriverAssigned,
        EventType::DriverDeparted,
        EventType::DriverArrived,
        EventType::DatabaseHealthCheck,
        EventType::DatabaseHealthWarning,
        EventType::DatabaseHealthCritical,
        EventType::DailySummary,
        EventType::WeeklyReport,
        EventType::LowInventory,
        EventType::TimeslotCapacity,
        EventType::AbandonedCart,
        EventType::LoyaltyMilestone,
        EventType::BirthdayReminder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "order.created",
            EventType::OrderConfirmed => "order.confirmed",
            EventType::OrderPreparing => "order.preparing",
            EventType::OrderReady => "order.ready",
            EventType::OrderInDelivery => "order.in_delivery",
            EventType::OrderCompleted => "order.completed",
            EventType::OrderCancelled => "order.cancelled",
            EventType::OrderReminder => "order.reminder",
            EventType::PaymentReceived => "payment.received",
            EventType::PaymentFailed => "payment.failed",
            EventType::PaymentRefunded => "payment.refunded",
            EventType::CustomerRegistered => "customer.registered",
            EventType::CustomerUpdated => "customer.updated",
            EventType::KdsAcknowledged => "kds.acknowledged",
            EventType::KdsCompleted => "kds.completed",
            EventType::DriverAssigned => "delivery.driver_assigned",
            EventType::DriverDeparted => "delivery.driver_departed",
            EventType::DriverArrived => "delivery.driver_arrived",
            EventType::DatabaseHealthCheck => "database.health_check",
            EventType::DatabaseHealthWarning => "database.health_warning",
            EventType::DatabaseHealthCritical => "database.health_critical",
            EventType::DailySummary => "scheduled.daily_summary",
            EventType::WeeklyReport => "scheduled.weekly_report",
            EventType::LowInventory => "scheduled.low_inventory",
            EventType::TimeslotCapacity => "scheduled.timeslot_capacity",
            EventType::AbandonedCart => "marketing.abandoned_cart",
            EventType::LoyaltyMilestone => "marketing.loyalty_milestone",
            EventType::BirthdayReminder => "marketing.birthday_reminder",
        }
    }

    /// The part before the dot, e.g. `order` for `order.created`.
    pub fn category(&self) -> &'static str {
        let name = self.as_str();
        name.split_once('.').map_or(name, |(category, _)| category)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|event_type| event_type.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

/// Maps an order status to the lifecycle event announcing it.
///
/// Only the statuses the storefront broadcasts have a counterpart; anything
/// else (including `pending`) yields `None`.
pub fn event_type_for_status(status: &str) -> Option<EventType> {
    match status {
        "confirmed" => Some(EventType::OrderConfirmed),
        "preparing" => Some(EventType::OrderPreparing),
        "ready" => Some(EventType::OrderReady),
        "in_delivery" => Some(EventType::OrderInDelivery),
        "completed" => Some(EventType::OrderCompleted),
        "cancelled" => Some(EventType::OrderCancelled),
        _ => None,
    }
}

/// Envelope metadata attached to every event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub source: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Free-form keys supplied by the producer.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            user_id: None,
            extra: Map::new(),
        }
    }
}

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Folds producer-supplied keys over the defaults. Well-known keys
    /// (`source`, `correlationId`, `userId`) replace the defaults when they
    /// hold a string, number or bool, which is stored as text. Other values
    /// under those keys are ignored. Everything else lands in `extra`.
    pub fn merge(mut self, supplied: Map<String, Value>) -> Self {
        for (key, value) in supplied {
            match key.as_str() {
                "source" => {
                    if let Some(source) = scalar_text(value) {
                        self.source = source;
                    }
                }
                "correlationId" => {
                    if let Some(id) = scalar_text(value) {
                        self.correlation_id = id;
                    }
                }
                "userId" => {
                    if let Some(user_id) = scalar_text(value) {
                        self.user_id = Some(user_id);
                    }
                }
                _ => {
                    self.extra.insert(key, value);
                }
            }
        }
        self
    }
}

fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn default_webhook_version() -> String {
    WEBHOOK_VERSION.to_string()
}

/// The payload delivered to the automation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default = "default_webhook_version")]
    pub webhook_version: String,
    pub metadata: EventMetadata,
    pub data: Value,
}

impl WebhookEvent {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp: OffsetDateTime::now_utc(),
            webhook_version: default_webhook_version(),
            metadata: EventMetadata::default(),
            data,
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.webhook_version = version.into();
        self
    }

    /// Serializes the envelope. Deliveries call this once and reuse the
    /// bytes for every attempt.
    pub fn to_json(&self) -> Result<String, EventError> {
        serde_json::to_string(self).map_err(|e| EventError::Serialization(e.to_string()))
    }

    pub fn order_created(data: &OrderCreatedData) -> Result<Self, EventError> {
        Ok(Self::new(EventType::OrderCreated, to_data(data)?))
    }

    /// Builds a status-change event, or `None` when the new status has no
    /// lifecycle event.
    pub fn order_status_changed(data: &OrderStatusChangedData) -> Result<Option<Self>, EventError> {
        let Some(event_type) = event_type_for_status(&data.new_status) else {
            return Ok(None);
        };
        Ok(Some(Self::new(event_type, to_data(data)?)))
    }

    pub fn driver_assigned(data: &DriverAssignedData) -> Result<Self, EventError> {
        Ok(Self::new(EventType::DriverAssigned, to_data(data)?))
    }

    pub fn kds(data: &KdsEventData) -> Result<Self, EventError> {
        Ok(Self::new(data.kds_status.event_type(), to_data(data)?))
    }
}

fn to_data<T: Serialize>(data: &T) -> Result<Value, EventError> {
    serde_json::to_value(data).map_err(|e| EventError::Serialization(e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAddress {
    pub street: String,
    pub city: String,
    pub postal_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_address: Option<DeliveryAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: String,
    pub product_name: String,
    pub quantity: u32,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customizations: Option<Value>,
    pub total_price: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Card,
    Cash,
    Online,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryType {
    Delivery,
    Pickup,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedData {
    pub order_id: String,
    pub order_number: String,
    pub customer: CustomerInfo,
    pub items: Vec<OrderItem>,
    pub subtotal: f64,
    pub delivery_fee: f64,
    pub total_amount: f64,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub delivery_type: DeliveryType,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub scheduled_for: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Reduced customer view carried on status changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCustomer {
    pub name: String,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusChangedData {
    pub order_id: String,
    pub order_number: String,
    pub previous_status: String,
    pub new_status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub status_changed_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_changed_by: Option<String>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub estimated_ready_time: Option<OffsetDateTime>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub estimated_delivery_time: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    pub customer: StatusCustomer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverInfo {
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_plate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverAssignedData {
    pub order_id: String,
    pub order_number: String,
    pub driver: DriverInfo,
    #[serde(with = "time::serde::rfc3339")]
    pub estimated_pickup_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub estimated_delivery_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub assigned_at: OffsetDateTime,
}

/// Kitchen display stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KdsStage {
    Acknowledged,
    Completed,
}

impl KdsStage {
    pub fn event_type(&self) -> EventType {
        match self {
            KdsStage::Acknowledged => EventType::KdsAcknowledged,
            KdsStage::Completed => EventType::KdsCompleted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KdsEventData {
    pub order_id: String,
    pub order_number: String,
    pub kds_status: KdsStage,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub acknowledged_at: Option<OffsetDateTime>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<OffsetDateTime>,
    /// Minutes spent in the kitchen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preparation_time: Option<u32>,
    pub items: Vec<OrderItem>,
}
