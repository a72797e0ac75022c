//! Order state-machine tests: amount derivation, lifecycle transitions
//! and the guards that keep invalid transitions from mutating state.

mod common;

use cardpay_api::entities::order::OrderStatus;
use cardpay_api::errors::ServiceError;
use cardpay_api::services::orders::{CreateOrderRequest, OrderItemInput, ShipOrderRequest};
use common::TestApp;
use uuid::Uuid;

fn order_request(items: Vec<OrderItemInput>) -> CreateOrderRequest {
    CreateOrderRequest {
        customer_id: Uuid::new_v4(),
        items,
        shipping_fee: 0,
        discount_amount: 0,
        shipping_address: Some(serde_json::json!({
            "name": "Jo Chen",
            "line1": "12 Harbour Rd",
            "city": "Shenzhen",
        })),
        buyer_message: None,
    }
}

fn item(name: &str, unit_price: i64, quantity: i32) -> OrderItemInput {
    OrderItemInput {
        product_id: Uuid::new_v4(),
        product_name: name.to_string(),
        unit_price,
        quantity,
    }
}

#[tokio::test]
async fn create_order_derives_totals_from_items() {
    let app = TestApp::without_gateway().await;

    let order = app
        .state
        .services
        .orders
        .create_order(order_request(vec![
            item("Embossed card pack", 1999, 1),
            item("Card holder", 501, 2),
        ]))
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.subtotal, 3001);
    assert_eq!(order.total_amount, 3001);
    assert_eq!(order.paid_amount, 0);
    assert_eq!(order.items.len(), 2);
    assert_eq!(order.items[0].line_total, 1999);
    assert_eq!(order.items[1].line_total, 1002);
    assert!(order.order_number.starts_with("ORD-"));

    // Reloading returns the same view.
    let reloaded = app
        .state
        .services
        .orders
        .get_order(&order.order_number)
        .await
        .unwrap();
    assert_eq!(reloaded.total_amount, 3001);
    assert_eq!(reloaded.items.len(), 2);
}

#[tokio::test]
async fn orders_without_items_are_rejected() {
    let app = TestApp::without_gateway().await;

    let result = app
        .state
        .services
        .orders
        .create_order(order_request(vec![]))
        .await;
    assert!(matches!(result, Err(ServiceError::ValidationError(_))));
}

#[tokio::test]
async fn shipping_an_unpaid_order_is_rejected_and_leaves_it_unchanged() {
    let app = TestApp::without_gateway().await;
    let order = app
        .state
        .services
        .orders
        .create_order(order_request(vec![item("Card pack", 500, 1)]))
        .await
        .unwrap();

    let result = app
        .state
        .services
        .orders
        .ship(
            &order.order_number,
            ShipOrderRequest {
                carrier: "SF Express".to_string(),
                tracking_number: "SF123456789".to_string(),
            },
        )
        .await;
    assert!(matches!(
        result,
        Err(ServiceError::InvalidStateTransition { entity: "order", .. })
    ));

    let reloaded = app
        .state
        .services
        .orders
        .get_order(&order.order_number)
        .await
        .unwrap();
    assert_eq!(reloaded.status, OrderStatus::Pending);
    assert!(reloaded.carrier.is_none());
    assert!(reloaded.tracking_number.is_none());
}

#[tokio::test]
async fn paid_orders_ship_and_complete_with_a_tracking_log() {
    let app = TestApp::without_gateway().await;
    let order = app
        .state
        .services
        .orders
        .create_order(order_request(vec![item("Card pack", 500, 1)]))
        .await
        .unwrap();

    app.state
        .services
        .orders
        .mark_as_paid(&order.order_number, 500, "TX-1", Uuid::new_v4(), "wechat")
        .await
        .unwrap();

    app.state
        .services
        .orders
        .ship(
            &order.order_number,
            ShipOrderRequest {
                carrier: "SF Express".to_string(),
                tracking_number: "SF123456789".to_string(),
            },
        )
        .await
        .unwrap();

    let shipped = app
        .state
        .services
        .orders
        .get_order(&order.order_number)
        .await
        .unwrap();
    assert_eq!(shipped.status, OrderStatus::Shipped);
    assert_eq!(shipped.carrier.as_deref(), Some("SF Express"));

    app.state
        .services
        .orders
        .confirm_delivery(&order.order_number)
        .await
        .unwrap();

    let completed = app
        .state
        .services
        .orders
        .get_order(&order.order_number)
        .await
        .unwrap();
    assert_eq!(completed.status, OrderStatus::Completed);
    let log = completed.tracking_events.unwrap();
    let entries = log.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["event"], "shipped");
    assert_eq!(entries[1]["event"], "delivered");
}

#[tokio::test]
async fn mark_as_paid_is_idempotent_per_transaction_id() {
    let app = TestApp::without_gateway().await;
    let order = app
        .state
        .services
        .orders
        .create_order(order_request(vec![item("Card pack", 500, 2)]))
        .await
        .unwrap();
    let payment_id = Uuid::new_v4();

    app.state
        .services
        .orders
        .mark_as_paid(&order.order_number, 1000, "TX-7", payment_id, "wechat")
        .await
        .unwrap();

    // Re-applying the same settlement is a no-op success.
    let again = app
        .state
        .services
        .orders
        .mark_as_paid(&order.order_number, 1000, "TX-7", payment_id, "wechat")
        .await
        .unwrap();
    assert_eq!(again.paid_amount, 1000);
    assert_eq!(again.status, OrderStatus::Paid);

    // A different transaction against the settled order is a conflict.
    let conflict = app
        .state
        .services
        .orders
        .mark_as_paid(&order.order_number, 1000, "TX-8", payment_id, "wechat")
        .await;
    assert!(matches!(conflict, Err(ServiceError::Conflict(_))));
}

#[tokio::test]
async fn cancel_is_only_legal_while_pending() {
    let app = TestApp::without_gateway().await;
    let order = app
        .state
        .services
        .orders
        .create_order(order_request(vec![item("Card pack", 500, 1)]))
        .await
        .unwrap();

    app.state
        .services
        .orders
        .cancel(&order.order_number, Some("changed my mind".to_string()))
        .await
        .unwrap();

    let cancelled = app
        .state
        .services
        .orders
        .get_order(&order.order_number)
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("changed my mind"));

    // Terminal: cancelling again is an invalid transition.
    let again = app
        .state
        .services
        .orders
        .cancel(&order.order_number, None)
        .await;
    assert!(matches!(
        again,
        Err(ServiceError::InvalidStateTransition { .. })
    ));

    // And a cancelled order cannot be settled.
    let paid = app
        .state
        .services
        .orders
        .mark_as_paid(&order.order_number, 500, "TX-9", Uuid::new_v4(), "wechat")
        .await;
    assert!(matches!(
        paid,
        Err(ServiceError::InvalidStateTransition { .. })
    ));
}
