use order_events::{EventType, WebhookEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Response returned to signed callback requests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub acknowledged: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_id: Option<String>,
}

impl WebhookResponse {
    /// Create a simple acknowledgment response
    pub fn acknowledged() -> Self {
        Self {
            acknowledged: true,
            message: None,
            processing_id: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_processing_id(mut self, processing_id: impl Into<String>) -> Self {
        self.processing_id = Some(processing_id.into());
        self
    }
}

/// Actions the automation endpoint may request through a signed callback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallbackAction {
    UpdateOrderStatus,
    AssignDriver,
    UpdateKds,
    SendNotification,
    UpdateDeliveryStatus,
    CancelOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    pub action: CallbackAction,
    pub order_id: String,
    #[serde(default)]
    pub data: Value,
}

/// State of a webhook delivery
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,

    Success,

    Failed,

    Retrying,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Success => "success",
            DeliveryState::Failed => "failed",
            DeliveryState::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Success | DeliveryState::Failed)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryState::Pending),
            "success" => Ok(DeliveryState::Success),
            "failed" => Ok(DeliveryState::Failed),
            "retrying" => Ok(DeliveryState::Retrying),
            other => Err(format!("unknown delivery state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed,
    Timeout,
}

/// One HTTP attempt of a delivery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt_number: u32,

    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,

    pub outcome: AttemptOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tracking record for one event accepted for dispatch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub id: Uuid,

    pub event_id: Uuid,

    pub event_type: EventType,

    pub webhook_url: String,

    pub payload: WebhookEvent,

    pub status: DeliveryState,

    pub attempts: Vec<AttemptRecord>,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,

    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl DeliveryRecord {
    pub fn new(payload: WebhookEvent, webhook_url: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            event_id: payload.event_id,
            event_type: payload.event_type,
            webhook_url: webhook_url.into(),
            payload,
            status: DeliveryState::Pending,
            attempts: Vec::new(),
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Appends an attempt, numbering it after the attempts already recorded.
    pub fn record_attempt(&mut self, mut attempt: AttemptRecord) {
        attempt.attempt_number = self.attempts.len() as u32 + 1;
        if let Some(error) = &attempt.error {
            self.last_error = Some(error.clone());
        }
        self.attempts.push(attempt);
        self.touch();
    }

    pub fn mark_success(&mut self) {
        self.status = DeliveryState::Success;
        self.next_retry_at = None;
        self.completed_at = Some(OffsetDateTime::now_utc());
        self.touch();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = DeliveryState::Failed;
        self.last_error = Some(error.into());
        self.next_retry_at = None;
        self.completed_at = Some(OffsetDateTime::now_utc());
        self.touch();
    }

    pub fn mark_retrying(&mut self, next_retry_at: OffsetDateTime) {
        self.status = DeliveryState::Retrying;
        self.next_retry_at = Some(next_retry_at);
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }
}

/// Query over stored delivery records
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeliveryFilter {
    #[serde(default)]
    pub event_type: Option<EventType>,

    #[serde(default)]
    pub status: Option<DeliveryState>,

    #[serde(default)]
    pub limit: Option<usize>,
}

impl DeliveryFilter {
    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn with_status(mut self, status: DeliveryState) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &DeliveryRecord) -> bool {
        self.event_type.is_none_or(|t| t == record.event_type)
            && self.status.is_none_or(|s| s == record.status)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub pending: usize,
    pub retrying: usize,
}

impl DeliveryStats {
    pub fn count(&mut self, state: DeliveryState, n: usize) {
        self.total += n;
        match state {
            DeliveryState::Success => self.success += n,
            DeliveryState::Failed => self.failed += n,
            DeliveryState::Pending => self.pending += n,
            DeliveryState::Retrying => self.retrying += n,
        }
    }
}

impl<'a> FromIterator<&'a DeliveryRecord> for DeliveryStats {
    fn from_iter<I: IntoIterator<Item = &'a DeliveryRecord>>(iter: I) -> Self {
        let mut stats = DeliveryStats::default();
        for record in iter {
            stats.count(record.status, 1);
        }
        stats
    }
}
