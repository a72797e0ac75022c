pub mod notify;
pub mod orders;
pub mod payments;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Json, Router,
};

use crate::{
    db::DbPool,
    events::EventSender,
    gateway::GatewayClient,
    services::{
        orders::OrderService, payments::PaymentService, reconciliation::ReconciliationService,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub reconciliation: Arc<ReconciliationService>,
}

impl AppServices {
    pub fn new(
        db: Arc<DbPool>,
        event_sender: EventSender,
        gateway: Arc<GatewayClient>,
        notify_url: String,
    ) -> Self {
        let orders = Arc::new(OrderService::new(db.clone(), event_sender.clone()));
        let payments = Arc::new(PaymentService::new(db.clone(), event_sender.clone()));
        let reconciliation = Arc::new(ReconciliationService::new(
            db,
            orders.clone(),
            payments.clone(),
            gateway,
            event_sender,
            notify_url,
        ));
        Self {
            orders,
            payments,
            reconciliation,
        }
    }
}

/// Assemble the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/orders", post(orders::create_order))
        .route("/api/v1/orders/:order_number", get(orders::get_order))
        .route(
            "/api/v1/orders/:order_number/cancel",
            post(orders::cancel_order),
        )
        .route(
            "/api/v1/orders/:order_number/ship",
            post(orders::ship_order),
        )
        .route(
            "/api/v1/orders/:order_number/confirm-delivery",
            post(orders::confirm_delivery),
        )
        .route(
            "/api/v1/orders/:order_number/pay",
            post(payments::initiate_payment),
        )
        .route(
            "/api/v1/orders/:order_number/reconcile",
            post(payments::reconcile_order),
        )
        .route(
            "/api/v1/orders/:order_number/refund",
            post(payments::refund_order),
        )
        .route("/api/v1/payments/notify", post(notify::payment_notify))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
