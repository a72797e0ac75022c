#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use cardpay_api::{
    config::{AccountConfig, AppConfig, ConfigAccountProvider},
    db, events,
    gateway::{sign, wire, GatewayClient},
    handlers::{self, AppServices},
    AppState,
};

pub const TEST_APP_ID: &str = "wx74862e0dfcf04954";
pub const TEST_MCH_ID: &str = "10000100";
pub const TEST_MERCHANT_KEY: &str = "192006250b4c09247ec02edce69f6a2d";
pub const TEST_NOTIFY_URL: &str = "https://shop.cardpay.example/api/v1/payments/notify";

pub fn test_account() -> AccountConfig {
    AccountConfig {
        app_id: TEST_APP_ID.to_string(),
        app_secret: "test-app-secret".to_string(),
        merchant_id: TEST_MCH_ID.to_string(),
        merchant_key: TEST_MERCHANT_KEY.to_string(),
        payment_enabled: true,
        refund_enabled: true,
    }
}

pub fn test_config(gateway_api_base: &str) -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        host: "127.0.0.1".to_string(),
        port: 18080,
        environment: "test".to_string(),
        log_level: "debug".to_string(),
        log_json: false,
        auto_migrate: true,
        db_max_connections: 1,
        db_min_connections: 1,
        gateway_api_base: gateway_api_base.to_string(),
        notify_url: TEST_NOTIFY_URL.to_string(),
        reconcile_sweep_interval_secs: None,
        reconcile_grace_secs: 0,
        accounts: vec![test_account()],
    }
}

/// Helper harness for spinning up an application state backed by an
/// in-memory SQLite database, with the gateway pointed at a test origin.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
}

impl TestApp {
    pub async fn new(gateway_api_base: &str) -> Self {
        let cfg = test_config(gateway_api_base);

        let db = db::establish_connection(&cfg).await.expect("test database");
        db::ensure_schema(&db).await.expect("test schema");
        let db = Arc::new(db);

        let (event_sender, event_rx) = events::channel(64);
        tokio::spawn(events::process_events(event_rx));

        let provider = Arc::new(ConfigAccountProvider::new(cfg.accounts.clone()));
        let gateway = Arc::new(GatewayClient::with_api_base(
            provider,
            cfg.gateway_api_base.clone(),
        ));
        let services = AppServices::new(
            db.clone(),
            event_sender.clone(),
            gateway,
            cfg.notify_url.clone(),
        );

        let state = AppState {
            db,
            config: cfg,
            event_sender,
            services,
        };
        let router = handlers::router(state.clone());
        Self { router, state }
    }

    /// Harness for tests that never reach the gateway.
    pub async fn without_gateway() -> Self {
        Self::new("http://127.0.0.1:9").await
    }
}

/// Build a signed XML envelope the way the gateway would.
pub fn signed_xml(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut params: sign::Params = entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let signature = sign::sign(&params, TEST_MERCHANT_KEY);
    params.insert("sign".to_string(), signature);
    wire::encode(&params).expect("encode signed envelope")
}

/// Same envelope with the signature computed before tampering with one
/// field, i.e. a stale signature.
pub fn tampered_xml(entries: &[(&str, &str)], field: &str, value: &str) -> Vec<u8> {
    let mut params: sign::Params = entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let signature = sign::sign(&params, TEST_MERCHANT_KEY);
    params.insert("sign".to_string(), signature);
    params.insert(field.to_string(), value.to_string());
    wire::encode(&params).expect("encode tampered envelope")
}
