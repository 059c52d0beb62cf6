use async_trait::async_trait;
use std::future::Future;
use thiserror::Error;

use crate::events::WebhookEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Listener error: {0}")]
    Listener(String),
}

/// Receives events published on the [`EventBus`](crate::EventBus).
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &WebhookEvent) -> Result<(), EventError>;

    fn name(&self) -> &str {
        "UnnamedListener"
    }
}

/// Adapts an async closure into an [`EventListener`].
pub struct FnListener<F> {
    name: String,
    f: F,
}

pub fn listener_fn<F, Fut>(name: impl Into<String>, f: F) -> FnListener<F>
where
    F: Fn(WebhookEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), EventError>> + Send,
{
    FnListener {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> EventListener for FnListener<F>
where
    F: Fn(WebhookEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), EventError>> + Send,
{
    async fn on_event(&self, event: &WebhookEvent) -> Result<(), EventError> {
        (self.f)(event.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
