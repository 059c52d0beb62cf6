#![allow(dead_code)]

use std::sync::Arc;

use order_events::EventBus;
use order_webhooks::{config::Config, outbound::webhook::Dispatcher, server::Server};

pub struct TestApp {
    pub address: String,
    pub dispatcher: Arc<Dispatcher>,
    pub events: Arc<EventBus>,
}

pub async fn spawn_server() -> String {
    spawn_app_with(|_| {}).await.address
}

/// Spawns the server on a random port after letting `configure` adjust the
/// loaded configuration.
pub async fn spawn_app_with(configure: impl FnOnce(&mut Config)) -> TestApp {
    let config = {
        let mut config = Config::load().unwrap();
        config.server.host = "localhost".to_string();
        config.server.port = 0;
        config.webhook.database_url = None;
        configure(&mut config);
        config
    };

    let server = Server::new(&config).await.unwrap();

    let port = server.port().unwrap();
    let dispatcher = server.dispatcher();
    let events = server.events();
    tokio::spawn(server.run());

    TestApp {
        address: format!("http://{}:{}", config.server.host, port),
        dispatcher,
        events,
    }
}

/// Webhook settings pointing at `url` with short delays.
pub fn fast_webhook(config: &mut Config, url: &str, secret: &str) {
    config.webhook.url = url.to_string();
    config.webhook.secret = secret.to_string();
    config.webhook.enabled = true;
    config.webhook.max_attempts = 2;
    config.webhook.retry_delay_ms = 1;
    config.webhook.max_retry_delay_ms = 10;
    config.webhook.timeout_ms = 2000;
    config.webhook.queue_poll_interval_ms = 20;
}
