use reqwest::{Client, Response, StatusCode};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use super::hmac_signer::{SigningContext, WebhookHeaders};
use super::retry_strategy::{AttemptResponse, RetryableError, is_retryable_status};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Limit response body size to 1MB
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Characters of a failed response body kept in the error.
const ERROR_BODY_PREVIEW: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionRefused,
    ConnectionReset,
    DnsFailure,
    HostUnreachable,
    Other,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkErrorKind::ConnectionRefused => "connection refused",
            NetworkErrorKind::ConnectionReset => "connection reset",
            NetworkErrorKind::DnsFailure => "dns failure",
            NetworkErrorKind::HostUnreachable => "host unreachable",
            NetworkErrorKind::Other => "connection failed",
        };
        f.write_str(name)
    }
}

/// Error type for HTTP client operations
#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network error ({kind}): {message}")]
    NetworkError {
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("Response error: status={status}, body={body}")]
    ResponseError { status: StatusCode, body: String },

    #[error("Failed to sign request: {0}")]
    SignatureError(String),
}

impl HttpClientError {
    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            HttpClientError::Timeout(timeout)
        } else if err.is_builder() {
            HttpClientError::InvalidUrl(err.to_string())
        } else if err.is_connect() {
            HttpClientError::NetworkError {
                kind: classify_network_error(&err),
                message: err.to_string(),
            }
        } else if io_error_kind(&err).is_some() {
            // Connection dropped after it was established.
            HttpClientError::NetworkError {
                kind: classify_network_error(&err),
                message: err.to_string(),
            }
        } else {
            HttpClientError::RequestFailed(err.to_string())
        }
    }
}

impl RetryableError for HttpClientError {
    fn is_retryable(&self) -> bool {
        match self {
            HttpClientError::Timeout(_) | HttpClientError::NetworkError { .. } => true,
            HttpClientError::ResponseError { status, .. } => is_retryable_status(status.as_u16()),
            HttpClientError::RequestFailed(_)
            | HttpClientError::InvalidUrl(_)
            | HttpClientError::SignatureError(_) => false,
        }
    }

    fn status_code(&self) -> Option<u16> {
        match self {
            HttpClientError::ResponseError { status, .. } => Some(status.as_u16()),
            _ => None,
        }
    }

    fn is_timeout(&self) -> bool {
        matches!(self, HttpClientError::Timeout(_))
    }
}

fn io_error_kind(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source = inner.source();
    }
    None
}

fn classify_network_error(err: &reqwest::Error) -> NetworkErrorKind {
    match io_error_kind(err) {
        Some(io::ErrorKind::ConnectionRefused) => return NetworkErrorKind::ConnectionRefused,
        Some(io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted) => {
            return NetworkErrorKind::ConnectionReset;
        }
        Some(io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable) => {
            return NetworkErrorKind::HostUnreachable;
        }
        _ => {}
    }

    // The resolver surfaces lookup failures as plain messages.
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(inner) = source {
        let message = inner.to_string().to_ascii_lowercase();
        if message.contains("dns") || message.contains("failed to lookup address") {
            return NetworkErrorKind::DnsFailure;
        }
        source = inner.source();
    }
    NetworkErrorKind::Other
}

/// Successful webhook response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub status_code: u16,
    pub response_time_ms: u64,
    pub body: String,
}

impl AttemptResponse for DeliveryResponse {
    fn status_code(&self) -> Option<u16> {
        Some(self.status_code)
    }
}

/// HTTP client wrapper for webhook delivery
#[derive(Debug, Clone)]
pub struct WebhookHttpClient {
    client: Client,
    timeout: Duration,
}

impl WebhookHttpClient {
    /// Create a new HTTP client with default timeout (30 seconds)
    pub fn new() -> Result<Self, HttpClientError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a new HTTP client with custom timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self, HttpClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("OrderWebhooks/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HttpClientError::RequestFailed(e.to_string()))?;

        Ok(Self { client, timeout })
    }

    /// Signs `payload` afresh and sends it.
    pub async fn deliver(
        &self,
        url: &str,
        payload: &str,
        signing: &SigningContext,
    ) -> Result<DeliveryResponse, HttpClientError> {
        let headers = signing
            .headers_for(payload)
            .map_err(|e| HttpClientError::SignatureError(e.to_string()))?;
        self.send_webhook(url, payload, &headers).await
    }

    /// Send a webhook POST request
    pub async fn send_webhook(
        &self,
        url: &str,
        payload: &str,
        headers: &WebhookHeaders,
    ) -> Result<DeliveryResponse, HttpClientError> {
        debug!(url = %url, event = %headers.event, "Sending webhook");

        let start = Instant::now();

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        for (name, value) in headers.pairs() {
            request = request.header(name, value);
        }

        let response = request
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "Webhook request failed");
                HttpClientError::from_reqwest(e, self.timeout)
            })?;

        let response_time_ms = start.elapsed().as_millis() as u64;
        let status = response.status();
        let status_code = status.as_u16();

        debug!(
            url = %url,
            status = %status_code,
            response_time_ms = %response_time_ms,
            "Webhook response received"
        );

        let body = self.read_response_body(response).await?;

        if !status.is_success() {
            return Err(HttpClientError::ResponseError {
                status,
                body: body.chars().take(ERROR_BODY_PREVIEW).collect(),
            });
        }

        Ok(DeliveryResponse {
            status_code,
            response_time_ms,
            body,
        })
    }

    /// Read response body with size limit
    async fn read_response_body(&self, response: Response) -> Result<String, HttpClientError> {
        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                HttpClientError::Timeout(self.timeout)
            } else {
                HttpClientError::RequestFailed(format!("Failed to read response body: {e}"))
            }
        })?;

        if bytes.len() > MAX_BODY_SIZE {
            warn!(
                size = bytes.len(),
                max_size = MAX_BODY_SIZE,
                "Response body too large, truncating"
            );
        }

        let body = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_BODY_SIZE)]).to_string();
        Ok(body)
    }

    /// Get configured timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
