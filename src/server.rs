mod handlers;
mod rate_limit;
mod responses;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::config::Config;
use crate::outbound::webhook::{
    DeliveryStore, Dispatcher, DispatcherConfig, InMemoryDeliveryStore, SqliteDeliveryStore,
};
use crate::server::handlers::{callback, deliveries, health::health_check};
use crate::server::rate_limit::{RateLimiter, limit_requests};
use axum::http::Method;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use color_eyre::eyre::{Context, Result};
use order_events::EventBus;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[derive(Clone)]
/// The global application state shared between all request handlers.
pub(crate) struct AppState {
    pub(crate) dispatcher: Arc<Dispatcher>,
}

pub struct Server {
    router: Router,
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    events: Arc<EventBus>,
}

impl Server {
    /// Creates the server with the store and dispatcher described by `config`.
    pub async fn new(config: &Config) -> Result<Self> {
        let store: Arc<dyn DeliveryStore> = match &config.webhook.database_url {
            Some(url) => Arc::new(
                SqliteDeliveryStore::connect(url)
                    .await
                    .wrap_err_with(|| format!("Failed to open delivery store at {url}"))?,
            ),
            None => Arc::new(InMemoryDeliveryStore::new()),
        };

        let dispatcher = Arc::new(
            Dispatcher::new(DispatcherConfig::from(&config.webhook), store)
                .wrap_err("Failed to create webhook dispatcher")?,
        );

        Self::with_dispatcher(config, dispatcher, Arc::new(EventBus::new())).await
    }

    /// Creates the server around an existing dispatcher and bus.
    ///
    /// The dispatcher is attached to the bus, its queue loop is started and
    /// any deliveries left `retrying` by a previous run are queued again.
    pub async fn with_dispatcher(
        config: &Config,
        dispatcher: Arc<Dispatcher>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        dispatcher.attach(&events).await;
        dispatcher.start();
        dispatcher.resume_in_flight().await;

        let trace_layer =
            TraceLayer::new_for_http().make_span_with(|request: &'_ axum::extract::Request<_>| {
                let uri = request.uri().to_string();
                tracing::info_span!("request", method = %request.method(), uri)
            });

        let cors_layer = CorsLayer::new()
            .allow_origin(Any)
            .allow_headers(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS]);

        let state = AppState {
            dispatcher: Arc::clone(&dispatcher),
        };

        let callback_limiter = Arc::new(RateLimiter::new(
            config.server.callback_rate_limit,
            Duration::from_secs(config.server.callback_rate_window_secs),
        ));

        let router = Router::new()
            .route("/health", get(health_check))
            .route(
                "/webhooks/callback",
                post(callback::receive_callback)
                    .layer(middleware::from_fn_with_state(callback_limiter, limit_requests)),
            )
            .route("/webhooks/status", get(deliveries::status))
            .route(
                "/webhooks/deliveries",
                get(deliveries::list_deliveries).delete(deliveries::clear_deliveries),
            )
            .route("/webhooks/deliveries/{id}", get(deliveries::get_delivery))
            .layer(cors_layer)
            .layer(trace_layer)
            .with_state(state);

        let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))
            .await
            .wrap_err_with(|| format!("Failed to bind to port {}", config.server.port))?;

        Ok(Self {
            router,
            listener,
            dispatcher,
            events,
        })
    }

    pub fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Bus producers publish order events on.
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    /// Runs the server until interrupted, then stops the delivery queue.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Server listening on {}", self.listener.local_addr()?);
        axum::serve(
            self.listener,
            self.router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;
        self.dispatcher.shutdown();
        tracing::info!("Server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
