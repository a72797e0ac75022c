use axum::{
    body::Bytes,
    extract::State,
    http::header,
    response::IntoResponse,
};

use crate::handlers::AppState;

/// Asynchronous payment notification endpoint consumed by the gateway.
///
/// The body is a signed XML envelope; the response is always HTTP 200
/// with an XML acknowledgement; a failure acknowledgement (not an HTTP
/// error) is what triggers the gateway's redelivery. Verification and
/// state transitions happen inside the reconciliation service, which
/// never lets an error escape to this layer.
#[utoipa::path(
    post,
    path = "/api/v1/payments/notify",
    request_body = String,
    responses(
        (status = 200, description = "XML acknowledgement", body = String)
    ),
    tag = "Payments"
)]
pub async fn payment_notify(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let ack = state.services.reconciliation.handle_callback(&body).await;
    (
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        ack.to_xml(),
    )
}
