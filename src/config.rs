use std::collections::HashMap;
use std::time::Duration;

use config::{Config as ConfigLib, ConfigBuilder, ConfigError, Environment, builder::DefaultState};
use serde::{Deserialize, Serialize};

use crate::outbound::webhook::{DispatcherConfig, SignatureAlgorithm, SignatureEncoding};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Callback requests allowed per client within one window
    pub callback_rate_limit: u32,
    pub callback_rate_window_secs: u64,
}

/// Outbound webhook settings, `APP_WEBHOOK__*` in the environment.
#[derive(Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: String,
    pub enabled: bool,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub timeout_ms: u64,
    pub queue_enabled: bool,
    pub queue_max_attempts: u32,
    pub queue_max_delay_ms: u64,
    pub queue_poll_interval_ms: u64,
    pub queue_scan_concurrency: usize,
    pub signature_algorithm: SignatureAlgorithm,
    pub signature_encoding: SignatureEncoding,
    pub signature_tolerance_secs: u64,
    /// SQLite URL for durable delivery records; in-memory when unset
    #[serde(default)]
    pub database_url: Option<String>,
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("url", &self.url)
            .field("secret", &"<redacted>")
            .field("enabled", &self.enabled)
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("timeout_ms", &self.timeout_ms)
            .field("queue_enabled", &self.queue_enabled)
            .field("queue_max_attempts", &self.queue_max_attempts)
            .field("queue_poll_interval_ms", &self.queue_poll_interval_ms)
            .field("database_url", &self.database_url)
            .finish_non_exhaustive()
    }
}

impl From<&WebhookConfig> for DispatcherConfig {
    fn from(config: &WebhookConfig) -> Self {
        DispatcherConfig {
            webhook_url: config.url.clone(),
            webhook_secret: config.secret.clone(),
            enabled: config.enabled,
            max_attempts: config.max_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_retry_delay: Duration::from_millis(config.max_retry_delay_ms),
            timeout: Duration::from_millis(config.timeout_ms),
            queue_enabled: config.queue_enabled,
            queue_max_attempts: config.queue_max_attempts,
            queue_max_delay: Duration::from_millis(config.queue_max_delay_ms),
            queue_poll_interval: Duration::from_millis(config.queue_poll_interval_ms),
            queue_scan_concurrency: config.queue_scan_concurrency,
            signature_algorithm: config.signature_algorithm,
            signature_encoding: config.signature_encoding,
            signature_tolerance_secs: config.signature_tolerance_secs,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    fn load_with_sources(env_vars: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = Self::set_defaults()?;
        // If env_vars is provided, we use it instead of system environment
        // This is to avoid systems variables pollution across tests
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // Should be in the format APP_SERVER__PORT or APP_WEBHOOK__URL
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder.build()?.try_deserialize()
    }

    /// Set default values for the configuration.
    /// This is used when no environment variables or config file are provided
    fn set_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        ConfigLib::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("server.callback_rate_limit", 100)?
            .set_default("server.callback_rate_window_secs", 60)?
            .set_default("webhook.url", "")?
            .set_default("webhook.secret", "")?
            .set_default("webhook.enabled", false)?
            .set_default("webhook.max_attempts", 5)?
            .set_default("webhook.retry_delay_ms", 1000)?
            .set_default("webhook.max_retry_delay_ms", 60_000)?
            .set_default("webhook.timeout_ms", 30_000)?
            .set_default("webhook.queue_enabled", true)?
            .set_default("webhook.queue_max_attempts", 10)?
            .set_default("webhook.queue_max_delay_ms", 3_600_000)?
            .set_default("webhook.queue_poll_interval_ms", 5000)?
            .set_default("webhook.queue_scan_concurrency", 1)?
            .set_default("webhook.signature_algorithm", "sha256")?
            .set_default("webhook.signature_encoding", "hex")?
            .set_default("webhook.signature_tolerance_secs", 300)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config =
            Config::load_with_sources(Some(HashMap::new())).expect("Failed to load config");

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.callback_rate_limit, 100);
        assert_eq!(config.server.callback_rate_window_secs, 60);
        assert!(!config.webhook.enabled);
        assert_eq!(config.webhook.max_attempts, 5);
        assert_eq!(config.webhook.retry_delay_ms, 1000);
        assert_eq!(config.webhook.timeout_ms, 30_000);
        assert!(config.webhook.queue_enabled);
        assert_eq!(config.webhook.queue_poll_interval_ms, 5000);
        assert_eq!(config.webhook.signature_algorithm, SignatureAlgorithm::Sha256);
        assert_eq!(config.webhook.signature_tolerance_secs, 300);
        assert!(config.webhook.database_url.is_none());
    }

    #[test]
    fn test_env_config() {
        let mut env_vars = HashMap::new();
        env_vars.insert("server.host".to_string(), "0.0.0.0".to_string());
        env_vars.insert("server.port".to_string(), "443".to_string());
        env_vars.insert("webhook.url".to_string(), "https://automation.test/hook".to_string());
        env_vars.insert("webhook.enabled".to_string(), "true".to_string());
        env_vars.insert("webhook.max_attempts".to_string(), "2".to_string());
        env_vars.insert("webhook.signature_algorithm".to_string(), "sha512".to_string());

        let config = Config::load_with_sources(Some(env_vars)).expect("Failed to load config");

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 443);
        assert_eq!(config.webhook.url, "https://automation.test/hook");
        assert!(config.webhook.enabled);
        assert_eq!(config.webhook.max_attempts, 2);
        assert_eq!(config.webhook.signature_algorithm, SignatureAlgorithm::Sha512);
    }

    #[test]
    fn test_partial_env_override() {
        let mut env_vars = HashMap::new();
        // We just override the host
        env_vars.insert("server.host".to_string(), "192.168.1.1".to_string());

        let config = Config::load_with_sources(Some(env_vars)).expect("Failed to load config");

        assert_eq!(config.server.host, "192.168.1.1");
        // The other values should use default
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.webhook.queue_max_attempts, 10);
    }

    #[test]
    fn test_dispatcher_config_conversion() {
        let mut env_vars = HashMap::new();
        env_vars.insert("webhook.secret".to_string(), "s3cret".to_string());
        env_vars.insert("webhook.retry_delay_ms".to_string(), "250".to_string());

        let config = Config::load_with_sources(Some(env_vars)).expect("Failed to load config");
        let dispatcher = DispatcherConfig::from(&config.webhook);

        assert_eq!(dispatcher.webhook_secret, "s3cret");
        assert_eq!(dispatcher.retry_delay, Duration::from_millis(250));
        assert_eq!(dispatcher.queue_poll_interval, Duration::from_secs(5));
        assert!(!format!("{:?}", config.webhook).contains("s3cret"));
    }
}
