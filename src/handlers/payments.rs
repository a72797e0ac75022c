use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::entities::payment::PaymentStatus;
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::reconciliation::{
    InitiatePaymentRequest, InitiatePaymentResponse, RefundOrderRequest, RefundOrderResponse,
};
use crate::ApiResponse;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReconcileResponse {
    pub order_number: String,
    pub status: PaymentStatus,
}

/// Start a payment attempt for a pending order
#[utoipa::path(
    post,
    path = "/api/v1/orders/{order_number}/pay",
    params(("order_number" = String, Path, description = "Merchant order number")),
    request_body = InitiatePaymentRequest,
    responses(
        (status = 201, description = "Payment attempt registered with the gateway", body = InitiatePaymentResponse),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway rejected or unreachable", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn initiate_payment(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
    Json(request): Json<InitiatePaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<InitiatePaymentResponse>>), ServiceError> {
    let response = state
        .services
        .reconciliation
        .initiate_payment(&order_number, request)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(response))))
}

/// Manually reconcile an order's payment attempt against the gateway
#[utoipa::path(
    post,
    path = "/api/v1/orders/{order_number}/reconcile",
    params(("order_number" = String, Path, description = "Merchant order number")),
    responses(
        (status = 200, description = "Current payment status after reconciliation", body = ReconcileResponse),
        (status = 404, description = "Unknown order or no payment attempt", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn reconcile_order(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> Result<Json<ApiResponse<ReconcileResponse>>, ServiceError> {
    let status = state
        .services
        .reconciliation
        .query_and_reconcile(&order_number)
        .await?;
    Ok(Json(ApiResponse::ok(ReconcileResponse {
        order_number,
        status,
    })))
}

/// Refund (part of) a settled order
#[utoipa::path(
    post,
    path = "/api/v1/orders/{order_number}/refund",
    params(("order_number" = String, Path, description = "Merchant order number")),
    request_body = RefundOrderRequest,
    responses(
        (status = 200, description = "Refund accepted by the gateway", body = RefundOrderResponse),
        (status = 400, description = "Invalid refund amount", body = crate::errors::ErrorResponse),
        (status = 409, description = "Payment is not refundable", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn refund_order(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
    Json(request): Json<RefundOrderRequest>,
) -> Result<Json<ApiResponse<RefundOrderResponse>>, ServiceError> {
    let response = state
        .services
        .reconciliation
        .refund_order(&order_number, request)
        .await?;
    Ok(Json(ApiResponse::ok(response)))
}
