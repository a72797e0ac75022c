use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use cardpay_api as api;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);

    // Init DB
    let db = api::db::establish_connection(&cfg)
        .await
        .context("failed to connect to database")?;
    if cfg.auto_migrate {
        api::db::ensure_schema(&db)
            .await
            .context("failed to ensure database schema")?;
    }
    let db = Arc::new(db);

    // Init events
    let (event_sender, event_rx) = api::events::channel(1024);
    tokio::spawn(api::events::process_events(event_rx));

    // Gateway client with config-backed account lookup
    let provider = Arc::new(api::config::ConfigAccountProvider::new(cfg.accounts.clone()));
    let gateway = Arc::new(api::gateway::GatewayClient::with_api_base(
        provider,
        cfg.gateway_api_base.clone(),
    ));

    let services = api::handlers::AppServices::new(
        db.clone(),
        event_sender.clone(),
        gateway,
        cfg.notify_url.clone(),
    );

    // Periodic recovery sweep for payments whose callback never arrived.
    if let Some(interval_secs) = cfg.reconcile_sweep_interval_secs {
        let reconciliation = services.reconciliation.clone();
        let grace = cfg.reconcile_grace_secs;
        info!(interval_secs, grace, "pending-payment sweep enabled");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = reconciliation.reconcile_pending(grace).await {
                    error!(error = %err, "pending-payment sweep failed");
                }
            }
        });
    }

    let state = api::AppState {
        db,
        config: cfg.clone(),
        event_sender,
        services,
    };

    let app = api::handlers::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(CorsLayer::permissive());

    let addr = cfg.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "cardpay-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install shutdown handler");
        return;
    }
    info!("shutdown signal received");
}
