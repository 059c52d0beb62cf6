use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const VERSION_HEADER: &str = "X-Webhook-Version";
pub const EVENT_HEADER: &str = "X-Webhook-Event";

/// Replay window applied when none is configured.
pub const DEFAULT_TIMESTAMP_TOLERANCE_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureEncoding {
    #[default]
    Hex,
    Base64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),
    #[error("Header {0} is not valid UTF-8")]
    InvalidHeader(&'static str),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("Timestamp outside tolerance: {difference}s (max: {tolerance}s)")]
    TimestampOutOfTolerance { difference: u64, tolerance: u64 },
    #[error("Invalid signature")]
    Mismatch,
    #[error("Invalid JSON payload: {0}")]
    InvalidPayload(String),
    #[error("System clock error: {0}")]
    Clock(String),
}

/// HMAC signer for webhook authentication.
#[derive(Clone)]
pub struct HmacSigner {
    secret: String,
    algorithm: SignatureAlgorithm,
    encoding: SignatureEncoding,
}

impl fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacSigner")
            .field("secret", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("encoding", &self.encoding)
            .finish()
    }
}

impl HmacSigner {
    /// New HMAC-SHA256 hex signer with the given secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            algorithm: SignatureAlgorithm::default(),
            encoding: SignatureEncoding::default(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: SignatureAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_encoding(mut self, encoding: SignatureEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    pub fn encoding(&self) -> SignatureEncoding {
        self.encoding
    }

    /// Sign a payload with current timestamp
    pub fn sign(&self, payload: &str) -> Result<(String, u64), SignatureError> {
        let timestamp = current_timestamp()?;
        let signature = self.sign_with_timestamp(payload, timestamp);
        Ok((signature, timestamp))
    }

    /// Sign a payload with a specific timestamp
    pub fn sign_with_timestamp(&self, payload: &str, timestamp: u64) -> String {
        let message = format!("{timestamp}.{payload}");
        let digest = self.digest(message.as_bytes());
        match self.encoding {
            SignatureEncoding::Hex => hex::encode(digest),
            SignatureEncoding::Base64 => BASE64.encode(digest),
        }
    }

    /// Verify a signature against the current clock
    pub fn verify(
        &self,
        payload: &str,
        signature: &str,
        timestamp: u64,
        tolerance_secs: u64,
    ) -> Result<(), SignatureError> {
        let now = current_timestamp()?;
        self.verify_at(payload, signature, timestamp, tolerance_secs, now)
    }

    /// Verify a signature as of `now`. Timestamps further than
    /// `tolerance_secs` from `now` in either direction are rejected before
    /// any comparison takes place.
    pub fn verify_at(
        &self,
        payload: &str,
        signature: &str,
        timestamp: u64,
        tolerance_secs: u64,
        now: u64,
    ) -> Result<(), SignatureError> {
        let difference = now.abs_diff(timestamp);
        if difference > tolerance_secs {
            return Err(SignatureError::TimestampOutOfTolerance {
                difference,
                tolerance: tolerance_secs,
            });
        }

        let expected = self.sign_with_timestamp(payload, timestamp);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(SignatureError::Mismatch);
        }

        Ok(())
    }

    /// Signs `payload` now and returns the four outbound headers.
    pub fn webhook_headers(
        &self,
        payload: &str,
        event_type: &str,
        version: &str,
    ) -> Result<WebhookHeaders, SignatureError> {
        let (signature, timestamp) = self.sign(payload)?;
        Ok(WebhookHeaders {
            signature,
            timestamp,
            version: version.to_string(),
            event: event_type.to_string(),
        })
    }

    /// Verifies an inbound signed request and parses its body.
    ///
    /// Header extraction fails closed, the signature is checked against the
    /// raw body, and only then is the body parsed as JSON.
    pub fn verify_request(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        tolerance_secs: u64,
    ) -> Result<serde_json::Value, SignatureError> {
        let signed = extract_signature_headers(headers)?;
        let payload = std::str::from_utf8(body)
            .map_err(|e| SignatureError::InvalidPayload(format!("body is not UTF-8: {e}")))?;

        self.verify(payload, &signed.signature, signed.timestamp, tolerance_secs)?;

        serde_json::from_str(payload).map_err(|e| SignatureError::InvalidPayload(e.to_string()))
    }

    fn digest(&self, message: &[u8]) -> Vec<u8> {
        match self.algorithm {
            SignatureAlgorithm::Sha256 => {
                let mut mac = match Hmac::<Sha256>::new_from_slice(self.secret.as_bytes()) {
                    Ok(mac) => mac,
                    Err(_) => unreachable!("HMAC accepts keys of any size"),
                };
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
            SignatureAlgorithm::Sha512 => {
                let mut mac = match Hmac::<Sha512>::new_from_slice(self.secret.as_bytes()) {
                    Ok(mac) => mac,
                    Err(_) => unreachable!("HMAC accepts keys of any size"),
                };
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

/// Signature headers for one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookHeaders {
    pub signature: String,
    pub timestamp: u64,
    pub version: String,
    pub event: String,
}

impl WebhookHeaders {
    pub fn pairs(&self) -> [(&'static str, String); 4] {
        [
            (SIGNATURE_HEADER, self.signature.clone()),
            (TIMESTAMP_HEADER, self.timestamp.to_string()),
            (VERSION_HEADER, self.version.clone()),
            (EVENT_HEADER, self.event.clone()),
        ]
    }
}

/// Everything needed to produce fresh headers for a stored body.
///
/// Queued retries re-sign on every attempt so the timestamp stays inside the
/// receiver's replay window.
#[derive(Debug, Clone)]
pub struct SigningContext {
    pub signer: HmacSigner,
    pub event_type: String,
    pub version: String,
}

impl SigningContext {
    pub fn new(
        signer: HmacSigner,
        event_type: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            signer,
            event_type: event_type.into(),
            version: version.into(),
        }
    }

    pub fn headers_for(&self, body: &str) -> Result<WebhookHeaders, SignatureError> {
        self.signer
            .webhook_headers(body, &self.event_type, &self.version)
    }
}

/// Reads the four signature headers from an inbound request.
pub fn extract_signature_headers(headers: &HeaderMap) -> Result<WebhookHeaders, SignatureError> {
    let timestamp = header_str(headers, TIMESTAMP_HEADER)?;
    let timestamp = timestamp
        .trim()
        .parse::<u64>()
        .map_err(|_| SignatureError::InvalidTimestamp(timestamp.to_string()))?;

    Ok(WebhookHeaders {
        signature: header_str(headers, SIGNATURE_HEADER)?.to_string(),
        timestamp,
        version: header_str(headers, VERSION_HEADER)?.to_string(),
        event: header_str(headers, EVENT_HEADER)?.to_string(),
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .ok_or(SignatureError::MissingHeader(name))?
        .to_str()
        .map_err(|_| SignatureError::InvalidHeader(name))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Get current Unix timestamp in seconds
pub fn current_timestamp() -> Result<u64, SignatureError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| SignatureError::Clock(e.to_string()))
}
