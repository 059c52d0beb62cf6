use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::warn;

use crate::server::responses::ApiError;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    resets_at: Instant,
}

/// Fixed-window request counter keyed by client address.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    clients: RwLock<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Counts a request from `client`. Returns `false` once the client has
    /// used up its window.
    pub async fn check(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut clients = self.clients.write().await;

        if let Some(window) = clients.get_mut(client) {
            if window.resets_at > now {
                if window.count >= self.limit {
                    return false;
                }
                window.count += 1;
                return true;
            }
        } else {
            // Only new clients grow the map, so expired windows go first.
            clients.retain(|_, window| window.resets_at > now);
        }

        clients.insert(
            client.to_string(),
            Window {
                count: 1,
                resets_at: now + self.window,
            },
        );
        self.limit > 0
    }

    pub async fn tracked_clients(&self) -> usize {
        self.clients.read().await.len()
    }
}

/// Address a request is attributed to: the first `X-Forwarded-For` entry,
/// then `X-Real-IP`, then the peer address.
fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match forwarded.or(real_ip) {
        Some(address) => address.to_string(),
        None => peer.map_or_else(|| "unknown".to_string(), |addr| addr.ip().to_string()),
    }
}

pub async fn limit_requests(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_key(request.headers(), peer);

    if !limiter.check(&client).await {
        warn!(client = %client, uri = %request.uri(), "Rate limit exceeded");
        return ApiError::TooManyRequests.into_response();
    }

    next.run(request).await
}
