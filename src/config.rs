use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{BillflowError, Result};
use crate::utils::{get_env_with_prefix, parse_env_with_prefix};

/// Main configuration for a billflow deployment
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub webhooks: WebhookConfig,
    pub ledger: LedgerConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum webhook/request body size in bytes (default: 1MB)
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

/// Shared secrets for inbound webhook verification.
///
/// Secrets are held as [`SecretString`] so `Debug` output never prints them.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Signing secret for the payment gateway (`stripe-signature` header).
    pub stripe_secret: SecretString,
    /// Signing secret for the ledger gateway (`x-ramp-signature` header).
    pub ramp_secret: SecretString,
    /// Maximum accepted age of a signed payment-gateway timestamp.
    pub tolerance_seconds: i64,
}

/// Ledger gateway API access (OAuth2 client credentials).
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub scope: String,
    pub timeout_seconds: u64,
}

/// Paginated sync tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Items requested per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Page fetch attempts before a resource sync fails.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Linear backoff unit; attempt `n` waits `n * base_delay_ms`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_size: default_max_body_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            stripe_secret: SecretString::from(String::new()),
            ramp_secret: SecretString::from(String::new()),
            tolerance_seconds: default_tolerance_seconds(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.ramp.com/developer/v1".to_string(),
            token_url: "https://api.ramp.com/developer/v1/token".to_string(),
            client_id: String::new(),
            client_secret: SecretString::from(String::new()),
            scope: "transactions:read bills:read reimbursements:read business:read".to_string(),
            timeout_seconds: 30,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_body_size() -> usize {
    1024 * 1024
}

fn default_tolerance_seconds() -> i64 {
    300
}

fn default_page_size() -> u32 {
    100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

impl ServerConfig {
    pub fn addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

impl SyncConfig {
    /// Load sync settings from `SYNC_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(page_size) = parse_env_with_prefix("SYNC_PAGE_SIZE") {
            config.page_size = page_size;
        }
        if let Some(attempts) = parse_env_with_prefix("SYNC_MAX_ATTEMPTS") {
            config.max_attempts = attempts;
        }
        if let Some(delay) = parse_env_with_prefix("SYNC_BASE_DELAY_MS") {
            config.base_delay_ms = delay;
        }
        config
    }
}

impl LedgerConfig {
    /// Load ledger API settings from `RAMP_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(url) = get_env_with_prefix("RAMP_BASE_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
            config.token_url = format!("{}/token", config.base_url);
        }
        if let Some(url) = get_env_with_prefix("RAMP_TOKEN_URL") {
            config.token_url = url;
        }
        if let Some(id) = get_env_with_prefix("RAMP_CLIENT_ID") {
            config.client_id = id;
        }
        if let Some(secret) = get_env_with_prefix("RAMP_CLIENT_SECRET") {
            config.client_secret = SecretString::from(secret);
        }
        if let Some(scope) = get_env_with_prefix("RAMP_SCOPE") {
            config.scope = scope;
        }
        if let Some(timeout) = parse_env_with_prefix("RAMP_TIMEOUT_SECONDS") {
            config.timeout_seconds = timeout;
        }
        config
    }
}

impl WebhookConfig {
    /// Load webhook secrets from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secret) = get_env_with_prefix("STRIPE_WEBHOOK_SECRET") {
            config.stripe_secret = SecretString::from(secret);
        }
        if let Some(secret) = get_env_with_prefix("RAMP_WEBHOOK_SECRET") {
            config.ramp_secret = SecretString::from(secret);
        }
        if let Some(tolerance) = parse_env_with_prefix("WEBHOOK_TOLERANCE_SECONDS") {
            config.tolerance_seconds = tolerance;
        }
        config
    }
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.server.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_stripe_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.webhooks.stripe_secret = SecretString::from(secret.into());
        self
    }

    pub fn with_ramp_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.webhooks.ramp_secret = SecretString::from(secret.into());
        self
    }

    pub fn with_ledger(mut self, ledger: LedgerConfig) -> Self {
        self.config.ledger = ledger;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    /// Load configuration from environment variables with BILLFLOW_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(host) = get_env_with_prefix("HOST") {
            self.config.server.host = host;
        }
        if let Some(port) = parse_env_with_prefix("PORT") {
            self.config.server.port = port;
        }
        if let Some(size) = parse_env_with_prefix("MAX_BODY_SIZE") {
            self.config.server.max_body_size = size;
        }
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        self.config.webhooks = WebhookConfig::from_env();
        self.config.ledger = LedgerConfig::from_env();
        self.config.sync = SyncConfig::from_env();

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an unparseable server address, an unknown
    /// log level, an empty webhook secret, a page size outside `1..=100`,
    /// or zero sync attempts.
    pub fn build(self) -> Result<Config> {
        let config = self.config;

        config.server.addr().map_err(|e| {
            BillflowError::invalid_input(format!(
                "Invalid server address {}:{} - {}",
                config.server.host, config.server.port, e
            ))
        })?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(BillflowError::invalid_input(format!(
                "Invalid log level: {}. Must be one of: {}",
                config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        if config.webhooks.stripe_secret.expose_secret().is_empty() {
            return Err(BillflowError::invalid_input(
                "STRIPE_WEBHOOK_SECRET must be set",
            ));
        }
        if config.webhooks.ramp_secret.expose_secret().is_empty() {
            return Err(BillflowError::invalid_input("RAMP_WEBHOOK_SECRET must be set"));
        }
        if config.webhooks.tolerance_seconds <= 0 {
            return Err(BillflowError::invalid_input(
                "Webhook tolerance must be greater than 0",
            ));
        }

        if !(1..=100).contains(&config.sync.page_size) {
            return Err(BillflowError::invalid_input(format!(
                "Sync page size must be between 1 and 100, got {}",
                config.sync.page_size
            )));
        }
        if config.sync.max_attempts == 0 {
            return Err(BillflowError::invalid_input(
                "Sync max attempts must be greater than 0",
            ));
        }

        Ok(config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_builder() -> ConfigBuilder {
        ConfigBuilder::new()
            .with_stripe_webhook_secret("whsec_test")
            .with_ramp_webhook_secret("ramp_test")
    }

    #[test]
    fn test_defaults() {
        let config = valid_builder().build().unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.sync.page_size, 100);
        assert_eq!(config.sync.max_attempts, 3);
        assert_eq!(config.webhooks.tolerance_seconds, 300);
    }

    #[test]
    fn test_missing_webhook_secret_rejected() {
        let err = ConfigBuilder::new().build().unwrap_err();
        assert!(matches!(err, BillflowError::InvalidInput(_)));
    }

    #[test]
    fn test_page_size_bounds() {
        let err = valid_builder()
            .with_sync(SyncConfig {
                page_size: 0,
                ..SyncConfig::default()
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("page size"));

        let err = valid_builder()
            .with_sync(SyncConfig {
                page_size: 101,
                ..SyncConfig::default()
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("page size"));
    }

    #[test]
    fn test_invalid_log_level() {
        let err = valid_builder().with_log_level("loud").build().unwrap_err();
        assert!(err.to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_secrets_not_in_debug_output() {
        let config = valid_builder().build().unwrap();
        let debug = format!("{:?}", config.webhooks);
        assert!(!debug.contains("whsec_test"));
    }
}
