use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::DbPool,
    entities::order::{self, OrderStatus},
    entities::order_item,
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Request/response types for the order service

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct OrderItemInput {
    pub product_id: Uuid,
    #[validate(length(min = 1, max = 128))]
    pub product_name: String,
    /// Unit price in minor currency units.
    #[validate(range(min = 1))]
    pub unit_price: i64,
    #[validate(range(min = 1))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    #[validate(length(min = 1, message = "order requires at least one item"))]
    pub items: Vec<OrderItemInput>,
    #[serde(default)]
    pub shipping_fee: i64,
    #[serde(default)]
    pub discount_amount: i64,
    #[schema(value_type = Option<Object>)]
    pub shipping_address: Option<serde_json::Value>,
    pub buyer_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct ShipOrderRequest {
    #[validate(length(min = 1))]
    pub carrier: String,
    #[validate(length(min = 1))]
    pub tracking_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemResponse {
    pub product_id: Uuid,
    pub product_name: String,
    pub unit_price: i64,
    pub quantity: i32,
    pub line_total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub customer_id: Uuid,
    pub status: OrderStatus,
    pub subtotal: i64,
    pub shipping_fee: i64,
    pub discount_amount: i64,
    pub total_amount: i64,
    pub paid_amount: i64,
    pub payment_method: Option<String>,
    pub payment_id: Option<Uuid>,
    pub gateway_transaction_id: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub shipping_address: Option<serde_json::Value>,
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub tracking_events: Option<serde_json::Value>,
    pub buyer_message: Option<String>,
    pub seller_message: Option<String>,
    pub cancel_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub items: Vec<OrderItemResponse>,
}

impl OrderResponse {
    pub fn from_parts(model: order::Model, items: Vec<order_item::Model>) -> Self {
        Self {
            id: model.id,
            order_number: model.order_number,
            customer_id: model.customer_id,
            status: model.status,
            subtotal: model.subtotal,
            shipping_fee: model.shipping_fee,
            discount_amount: model.discount_amount,
            total_amount: model.total_amount,
            paid_amount: model.paid_amount,
            payment_method: model.payment_method,
            payment_id: model.payment_id,
            gateway_transaction_id: model.gateway_transaction_id,
            shipping_address: model.shipping_address,
            carrier: model.carrier,
            tracking_number: model.tracking_number,
            tracking_events: model.tracking_events,
            buyer_message: model.buyer_message,
            seller_message: model.seller_message,
            cancel_reason: model.cancel_reason,
            paid_at: model.paid_at,
            shipped_at: model.shipped_at,
            completed_at: model.completed_at,
            created_at: model.created_at,
            items: items
                .into_iter()
                .map(|item| OrderItemResponse {
                    product_id: item.product_id,
                    product_name: item.product_name,
                    unit_price: item.unit_price,
                    quantity: item.quantity,
                    line_total: item.line_total,
                })
                .collect(),
        }
    }
}

/// Deterministic amount breakdown for a set of line items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTotals {
    pub line_totals: Vec<i64>,
    pub subtotal: i64,
    pub total_amount: i64,
}

/// Recompute `subtotal` and `total_amount` from the line items. All
/// arithmetic is checked integer math on minor currency units; an
/// overflowing or negative result is a validation error, never a wrap.
pub fn compute_totals(
    items: &[OrderItemInput],
    shipping_fee: i64,
    discount_amount: i64,
) -> Result<OrderTotals, ServiceError> {
    if shipping_fee < 0 || discount_amount < 0 {
        return Err(ServiceError::ValidationError(
            "shipping fee and discount must not be negative".to_string(),
        ));
    }

    let mut line_totals = Vec::with_capacity(items.len());
    let mut subtotal: i64 = 0;
    for item in items {
        let line = item
            .unit_price
            .checked_mul(i64::from(item.quantity))
            .ok_or_else(amount_overflow)?;
        subtotal = subtotal.checked_add(line).ok_or_else(amount_overflow)?;
        line_totals.push(line);
    }

    let total_amount = subtotal
        .checked_add(shipping_fee)
        .and_then(|v| v.checked_sub(discount_amount))
        .ok_or_else(amount_overflow)?;
    if total_amount < 0 {
        return Err(ServiceError::ValidationError(
            "discount exceeds order value".to_string(),
        ));
    }

    Ok(OrderTotals {
        line_totals,
        subtotal,
        total_amount,
    })
}

fn amount_overflow() -> ServiceError {
    ServiceError::ValidationError("order amount overflows".to_string())
}

fn generate_order_number() -> String {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix: u32 = rand::thread_rng().gen_range(0..10_000);
    format!("ORD-{timestamp}-{suffix:04}")
}

fn append_tracking_event(
    existing: Option<serde_json::Value>,
    event: serde_json::Value,
) -> serde_json::Value {
    let mut log = match existing {
        Some(serde_json::Value::Array(entries)) => entries,
        _ => Vec::new(),
    };
    log.push(event);
    serde_json::Value::Array(log)
}

/// Service owning the order state machine.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DbPool>,
    event_sender: EventSender,
}

impl OrderService {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Creates a pending order with recomputed line and order totals.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        request.validate()?;
        for item in &request.items {
            item.validate()?;
        }
        let totals = compute_totals(&request.items, request.shipping_fee, request.discount_amount)?;

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order_number = generate_order_number();

        let txn = self.db.begin().await?;

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            customer_id: Set(request.customer_id),
            status: Set(OrderStatus::Pending),
            subtotal: Set(totals.subtotal),
            shipping_fee: Set(request.shipping_fee),
            discount_amount: Set(request.discount_amount),
            total_amount: Set(totals.total_amount),
            paid_amount: Set(0),
            payment_method: Set(None),
            payment_id: Set(None),
            gateway_transaction_id: Set(None),
            shipping_address: Set(request.shipping_address.clone()),
            carrier: Set(None),
            tracking_number: Set(None),
            tracking_events: Set(None),
            buyer_message: Set(request.buyer_message.clone()),
            seller_message: Set(None),
            cancel_reason: Set(None),
            paid_at: Set(None),
            shipped_at: Set(None),
            completed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(&txn)
        .await?;

        let mut items = Vec::with_capacity(request.items.len());
        for (item, line_total) in request.items.iter().zip(&totals.line_totals) {
            let inserted = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(item.product_id),
                product_name: Set(item.product_name.clone()),
                unit_price: Set(item.unit_price),
                quantity: Set(item.quantity),
                line_total: Set(*line_total),
            }
            .insert(&txn)
            .await?;
            items.push(inserted);
        }

        txn.commit().await?;

        info!(%order_number, total_amount = totals.total_amount, "order created");
        self.emit(Event::OrderCreated(order_id)).await;

        Ok(OrderResponse::from_parts(order, items))
    }

    pub async fn get_order(&self, order_number: &str) -> Result<OrderResponse, ServiceError> {
        let (order, items) = self.load_with_items(order_number).await?;
        Ok(OrderResponse::from_parts(order, items))
    }

    pub async fn find_model(&self, order_number: &str) -> Result<order::Model, ServiceError> {
        order::Entity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_number} not found")))
    }

    pub async fn load_with_items(
        &self,
        order_number: &str,
    ) -> Result<(order::Model, Vec<order_item::Model>), ServiceError> {
        let order = self.find_model(order_number).await?;
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .order_by_asc(order_item::Column::Id)
            .all(&*self.db)
            .await?;
        Ok((order, items))
    }

    /// Settle the order. Idempotent under the gateway transaction id:
    /// re-applying the same settlement is a no-op success, a different
    /// transaction against a settled order is a conflict.
    #[instrument(skip(self), fields(%order_number, %transaction_id))]
    pub async fn mark_as_paid(
        &self,
        order_number: &str,
        settled_amount: i64,
        transaction_id: &str,
        payment_id: Uuid,
        payment_method: &str,
    ) -> Result<order::Model, ServiceError> {
        let order = self.find_model(order_number).await?;

        if let Some(existing) = order.gateway_transaction_id.as_deref() {
            if existing == transaction_id {
                debug!("order already settled by this transaction");
                return Ok(order);
            }
        }
        if order.status == OrderStatus::Paid {
            return Err(ServiceError::Conflict(format!(
                "order {order_number} already settled by transaction {}",
                order.gateway_transaction_id.unwrap_or_default()
            )));
        }
        if !order.status.can_transition_to(OrderStatus::Paid) {
            return Err(ServiceError::invalid_transition(
                "order",
                order.status,
                OrderStatus::Paid,
            ));
        }

        let now = Utc::now();
        let updated = order::ActiveModel {
            id: Set(order.id),
            status: Set(OrderStatus::Paid),
            paid_amount: Set(settled_amount),
            payment_method: Set(Some(payment_method.to_string())),
            payment_id: Set(Some(payment_id)),
            gateway_transaction_id: Set(Some(transaction_id.to_string())),
            paid_at: Set(Some(now)),
            updated_at: Set(Some(now)),
            ..Default::default()
        }
        .update(&*self.db)
        .await?;

        info!(settled_amount, "order settled");
        self.emit(Event::OrderPaid {
            order_id: order.id,
            amount: settled_amount,
            transaction_id: transaction_id.to_string(),
        })
        .await;

        Ok(updated)
    }

    /// Cancel a pending order. Paid orders leave through the refund
    /// path instead.
    #[instrument(skip(self), fields(%order_number))]
    pub async fn cancel(
        &self,
        order_number: &str,
        reason: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let order = self.find_model(order_number).await?;
        if !order.status.can_transition_to(OrderStatus::Cancelled) {
            return Err(ServiceError::invalid_transition(
                "order",
                order.status,
                OrderStatus::Cancelled,
            ));
        }

        let updated = order::ActiveModel {
            id: Set(order.id),
            status: Set(OrderStatus::Cancelled),
            cancel_reason: Set(reason),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .update(&*self.db)
        .await?;

        info!("order cancelled");
        self.emit(Event::OrderCancelled(order.id)).await;
        Ok(updated)
    }

    #[instrument(skip(self, request), fields(%order_number))]
    pub async fn ship(
        &self,
        order_number: &str,
        request: ShipOrderRequest,
    ) -> Result<order::Model, ServiceError> {
        request.validate()?;
        let order = self.find_model(order_number).await?;
        if !order.status.can_transition_to(OrderStatus::Shipped) {
            return Err(ServiceError::invalid_transition(
                "order",
                order.status,
                OrderStatus::Shipped,
            ));
        }

        let now = Utc::now();
        let tracking = append_tracking_event(
            order.tracking_events.clone(),
            json!({
                "at": now.to_rfc3339(),
                "event": "shipped",
                "carrier": request.carrier,
                "tracking_number": request.tracking_number,
            }),
        );

        let updated = order::ActiveModel {
            id: Set(order.id),
            status: Set(OrderStatus::Shipped),
            carrier: Set(Some(request.carrier)),
            tracking_number: Set(Some(request.tracking_number)),
            tracking_events: Set(Some(tracking)),
            shipped_at: Set(Some(now)),
            updated_at: Set(Some(now)),
            ..Default::default()
        }
        .update(&*self.db)
        .await?;

        info!("order shipped");
        self.emit(Event::OrderShipped(order.id)).await;
        Ok(updated)
    }

    #[instrument(skip(self), fields(%order_number))]
    pub async fn confirm_delivery(&self, order_number: &str) -> Result<order::Model, ServiceError> {
        let order = self.find_model(order_number).await?;
        if !order.status.can_transition_to(OrderStatus::Completed) {
            return Err(ServiceError::invalid_transition(
                "order",
                order.status,
                OrderStatus::Completed,
            ));
        }

        let now = Utc::now();
        let tracking = append_tracking_event(
            order.tracking_events.clone(),
            json!({ "at": now.to_rfc3339(), "event": "delivered" }),
        );

        let updated = order::ActiveModel {
            id: Set(order.id),
            status: Set(OrderStatus::Completed),
            tracking_events: Set(Some(tracking)),
            completed_at: Set(Some(now)),
            updated_at: Set(Some(now)),
            ..Default::default()
        }
        .update(&*self.db)
        .await?;

        info!("order delivery confirmed");
        self.emit(Event::OrderCompleted(order.id)).await;
        Ok(updated)
    }

    /// Applied when the gateway reports the refund settled.
    #[instrument(skip(self), fields(%order_number))]
    pub async fn mark_refunded(&self, order_number: &str) -> Result<order::Model, ServiceError> {
        let order = self.find_model(order_number).await?;
        if order.status == OrderStatus::Refunded {
            return Ok(order);
        }
        if !order.status.can_transition_to(OrderStatus::Refunded) {
            return Err(ServiceError::invalid_transition(
                "order",
                order.status,
                OrderStatus::Refunded,
            ));
        }

        let updated = order::ActiveModel {
            id: Set(order.id),
            status: Set(OrderStatus::Refunded),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .update(&*self.db)
        .await?;

        info!("order refunded");
        self.emit(Event::OrderRefunded(order.id)).await;
        Ok(updated)
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.event_sender.send(event).await {
            warn!(error = %e, "failed to send event");
        }
    }
}
