use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::orders::{CreateOrderRequest, OrderResponse, ShipOrderRequest};
use crate::ApiResponse;

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct CancelOrderRequest {
    pub reason: Option<String>,
}

/// Create a new order
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = OrderResponse),
        (status = 400, description = "Invalid order", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderResponse>>), ServiceError> {
    let order = state.services.reconciliation.create_order(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(order))))
}

/// Fetch an order by its order number
#[utoipa::path(
    get,
    path = "/api/v1/orders/{order_number}",
    params(("order_number" = String, Path, description = "Merchant order number")),
    responses(
        (status = 200, description = "Order found", body = OrderResponse),
        (status = 404, description = "Unknown order", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state.services.orders.get_order(&order_number).await?;
    Ok(Json(ApiResponse::ok(order)))
}

/// Cancel a pending order (and its pending payment attempt, if any)
#[utoipa::path(
    post,
    path = "/api/v1/orders/{order_number}/cancel",
    params(("order_number" = String, Path, description = "Merchant order number")),
    request_body = CancelOrderRequest,
    responses(
        (status = 200, description = "Order cancelled", body = OrderResponse),
        (status = 409, description = "Order is not cancellable", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
    body: Option<Json<CancelOrderRequest>>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let reason = body.and_then(|Json(request)| request.reason);
    state
        .services
        .reconciliation
        .cancel_order(&order_number, reason)
        .await?;
    let order = state.services.orders.get_order(&order_number).await?;
    Ok(Json(ApiResponse::ok(order)))
}

/// Record shipment of a paid order
#[utoipa::path(
    post,
    path = "/api/v1/orders/{order_number}/ship",
    params(("order_number" = String, Path, description = "Merchant order number")),
    request_body = ShipOrderRequest,
    responses(
        (status = 200, description = "Order shipped", body = OrderResponse),
        (status = 409, description = "Order is not shippable", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn ship_order(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
    Json(request): Json<ShipOrderRequest>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    state.services.orders.ship(&order_number, request).await?;
    let order = state.services.orders.get_order(&order_number).await?;
    Ok(Json(ApiResponse::ok(order)))
}

/// Confirm delivery of a shipped order
#[utoipa::path(
    post,
    path = "/api/v1/orders/{order_number}/confirm-delivery",
    params(("order_number" = String, Path, description = "Merchant order number")),
    responses(
        (status = 200, description = "Delivery confirmed", body = OrderResponse),
        (status = 409, description = "Order is not shipped", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn confirm_delivery(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    state
        .services
        .reconciliation
        .confirm_delivery(&order_number)
        .await?;
    let order = state.services.orders.get_order(&order_number).await?;
    Ok(Json(ApiResponse::ok(order)))
}
