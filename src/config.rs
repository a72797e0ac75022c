use std::collections::HashMap;

use async_trait::async_trait;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use validator::Validate;

use crate::gateway::{AccountProvider, GatewayError, DEFAULT_API_BASE};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_DB_MIN_CONNECTIONS: u32 = 2;
const DEFAULT_RECONCILE_GRACE_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Gateway account credentials for one application.
///
/// Deliberately not `Serialize`: the merchant key must never end up in a
/// response or log payload.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AccountConfig {
    #[validate(length(min = 1))]
    pub app_id: String,

    #[serde(default)]
    pub app_secret: String,

    #[validate(length(min = 1))]
    pub merchant_id: String,

    /// Shared signing secret for this merchant account.
    #[validate(length(min = 16))]
    pub merchant_key: String,

    #[serde(default = "default_true")]
    pub payment_enabled: bool,

    #[serde(default)]
    pub refund_enabled: bool,
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to create missing tables on startup
    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// Origin of the payment gateway API.
    #[serde(default = "default_gateway_api_base")]
    pub gateway_api_base: String,

    /// Public URL the gateway posts payment notifications to.
    pub notify_url: String,

    /// Interval for the pending-payment reconciliation sweep; the sweep
    /// task is not started when unset.
    #[serde(default)]
    pub reconcile_sweep_interval_secs: Option<u64>,

    /// Age a pending payment must reach before the sweep queries the
    /// gateway for it.
    #[serde(default = "default_reconcile_grace")]
    pub reconcile_grace_secs: u64,

    /// Gateway accounts keyed by application id.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl AppConfig {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn account_map(&self) -> HashMap<String, AccountConfig> {
        self.accounts
            .iter()
            .map(|account| (account.app_id.clone(), account.clone()))
            .collect()
    }
}

/// Load configuration from `config/default`, an environment-specific
/// overlay, and `APP__`-prefixed environment variables (highest
/// precedence).
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let environment = std::env::var("APP_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    let settings = Config::builder()
        .add_source(File::with_name(&format!("{CONFIG_DIR}/default")).required(false))
        .add_source(File::with_name(&format!("{CONFIG_DIR}/{environment}")).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let cfg: AppConfig = settings.try_deserialize()?;
    cfg.validate()
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    for account in &cfg.accounts {
        account.validate().map_err(|e| {
            ConfigError::Invalid(format!("gateway account {}: {}", account.app_id, e))
        })?;
    }
    Ok(cfg)
}

/// Account lookup backed by the static configuration. Injected into the
/// gateway client so tests can substitute fixed credentials.
#[derive(Clone)]
pub struct ConfigAccountProvider {
    accounts: HashMap<String, AccountConfig>,
}

impl ConfigAccountProvider {
    pub fn new(accounts: impl IntoIterator<Item = AccountConfig>) -> Self {
        Self {
            accounts: accounts
                .into_iter()
                .map(|account| (account.app_id.clone(), account))
                .collect(),
        }
    }
}

#[async_trait]
impl AccountProvider for ConfigAccountProvider {
    async fn account(&self, app_id: &str) -> Result<AccountConfig, GatewayError> {
        self.accounts
            .get(app_id)
            .cloned()
            .ok_or_else(|| GatewayError::Account(format!("unknown application id {app_id}")))
    }
}

pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_directive = format!("cardpay_api={level},tower_http=info");
    let filter_directive = std::env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let registry = tracing_subscriber::registry().with(EnvFilter::new(filter_directive));
    if json {
        let _ = registry.with(fmt::layer().json()).try_init();
    } else {
        let _ = registry.with(fmt::layer()).try_init();
    }
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_db_max_connections() -> u32 {
    DEFAULT_DB_MAX_CONNECTIONS
}

fn default_db_min_connections() -> u32 {
    DEFAULT_DB_MIN_CONNECTIONS
}

fn default_gateway_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_reconcile_grace() -> u64 {
    DEFAULT_RECONCILE_GRACE_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(app_id: &str) -> AccountConfig {
        AccountConfig {
            app_id: app_id.to_string(),
            app_secret: String::new(),
            merchant_id: "10000100".to_string(),
            merchant_key: "192006250b4c09247ec02edce69f6a2d".to_string(),
            payment_enabled: true,
            refund_enabled: false,
        }
    }

    #[tokio::test]
    async fn provider_resolves_known_accounts_only() {
        let provider = ConfigAccountProvider::new([account("wx1"), account("wx2")]);

        let found = provider.account("wx2").await.unwrap();
        assert_eq!(found.merchant_id, "10000100");

        let missing = provider.account("wx3").await;
        assert!(matches!(missing, Err(GatewayError::Account(_))));
    }

    #[test]
    fn short_merchant_keys_fail_validation() {
        let mut bad = account("wx1");
        bad.merchant_key = "short".to_string();
        assert!(bad.validate().is_err());
        assert!(account("wx1").validate().is_ok());
    }
}
