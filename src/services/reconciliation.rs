//! Orchestration of the payment lifecycle: initiating attempts against
//! the gateway, reconciling asynchronous callbacks, recovering missed
//! callbacks by querying, and driving refunds.
//!
//! This service is the only component that moves the Payment and Order
//! state machines together. Both transitions are idempotent keyed on
//! the gateway transaction id and are applied Payment-first in a fixed
//! order, so a crash between the two steps self-heals on the gateway's
//! redelivery or on a status query.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::DbPool,
    entities::order,
    entities::payment::{self, PaymentStatus, TradeType},
    errors::ServiceError,
    events::{Event, EventSender},
    gateway::{
        ClientPayParams, GatewayClient, RefundRequest as GatewayRefundRequest, UnifiedOrderRequest,
    },
    gateway::{sign::Params, wire},
    services::orders::OrderService,
    services::payments::{CreatePaymentAttempt, PaymentService, PaymentSettlement},
};

const PAYMENT_METHOD: &str = "wechat";
const SUCCESS: &str = "SUCCESS";
const FAIL: &str = "FAIL";

/// Request to start a payment attempt for an order.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct InitiatePaymentRequest {
    #[validate(length(min = 1))]
    pub app_id: String,
    pub trade_type: TradeType,
    /// Payer identifier; required by the in-app trade type.
    pub payer_id: Option<String>,
    #[validate(length(min = 1))]
    pub client_ip: String,
}

/// Everything the payer's client needs to complete the payment.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InitiatePaymentResponse {
    pub order_number: String,
    pub out_trade_no: String,
    pub trade_type: TradeType,
    pub total_fee: i64,
    pub prepay_id: Option<String>,
    pub code_url: Option<String>,
    pub client_params: Option<ClientPayParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct RefundOrderRequest {
    /// Amount to refund in minor currency units.
    #[validate(range(min = 1))]
    pub refund_fee: i64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RefundOrderResponse {
    pub order_number: String,
    pub out_trade_no: String,
    pub out_refund_no: String,
    pub refund_fee: i64,
    pub gateway_refund_id: String,
}

/// Acknowledgement returned to the gateway for a callback delivery. A
/// failure acknowledgement makes the gateway redeliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyAck {
    success: bool,
    message: String,
}

impl NotifyAck {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: "OK".to_string(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Render the acknowledgement in the gateway's expected wire shape.
    pub fn to_xml(&self) -> String {
        let mut params = Params::new();
        params.insert(
            "return_code".to_string(),
            if self.success { SUCCESS } else { FAIL }.to_string(),
        );
        params.insert("return_msg".to_string(), self.message.clone());
        wire::encode(&params)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_else(|| {
                "<xml><return_code><![CDATA[FAIL]]></return_code></xml>".to_string()
            })
    }
}

/// Outcome of a pending-payment sweep.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SweepSummary {
    pub examined: usize,
    pub reconciled: usize,
}

/// Service orchestrating orders, payments and the gateway client.
#[derive(Clone)]
pub struct ReconciliationService {
    db: Arc<DbPool>,
    orders: Arc<OrderService>,
    payments: Arc<PaymentService>,
    gateway: Arc<GatewayClient>,
    event_sender: EventSender,
    notify_url: String,
}

impl ReconciliationService {
    pub fn new(
        db: Arc<DbPool>,
        orders: Arc<OrderService>,
        payments: Arc<PaymentService>,
        gateway: Arc<GatewayClient>,
        event_sender: EventSender,
        notify_url: String,
    ) -> Self {
        Self {
            db,
            orders,
            payments,
            gateway,
            event_sender,
            notify_url,
        }
    }

    /// Create a pending order. Thin delegate kept here so callers deal
    /// with one entry point for the whole payment lifecycle.
    pub async fn create_order(
        &self,
        request: crate::services::orders::CreateOrderRequest,
    ) -> Result<crate::services::orders::OrderResponse, ServiceError> {
        self.orders.create_order(request).await
    }

    /// Start a payment attempt: allocate a merchant transaction token,
    /// create the pending payment row, register the unified order with
    /// the gateway and link the attempt to the order, atomically. A
    /// gateway failure leaves no dangling payment row.
    #[instrument(skip(self, request), fields(%order_number, app_id = %request.app_id))]
    pub async fn initiate_payment(
        &self,
        order_number: &str,
        request: InitiatePaymentRequest,
    ) -> Result<InitiatePaymentResponse, ServiceError> {
        request.validate()?;
        if request.trade_type == TradeType::Jsapi && request.payer_id.is_none() {
            return Err(ServiceError::ValidationError(
                "the in-app trade type requires a payer identifier".to_string(),
            ));
        }

        let (order, items) = self.orders.load_with_items(order_number).await?;
        if order.status != order::OrderStatus::Pending {
            return Err(ServiceError::InvalidOperation(format!(
                "payment can only be initiated for pending orders, order is {}",
                order.status
            )));
        }
        if let Some(payment_id) = order.payment_id {
            let existing = self.payments.get_by_id(payment_id).await?;
            if existing.status == PaymentStatus::Paid {
                return Err(ServiceError::InvalidOperation(format!(
                    "order {order_number} already carries a successful payment"
                )));
            }
            // Supersede an abandoned pending attempt; only one attempt
            // is active per order at a time.
            if existing.status == PaymentStatus::Pending {
                self.payments.cancel(&existing.out_trade_no).await?;
            }
        }

        let account = self.gateway.account_for(&request.app_id).await?;
        let out_trade_no = generate_trade_token();
        let body = order_body(&order, &items);

        let txn = self.db.begin().await?;

        let payment = self
            .payments
            .create(
                &txn,
                CreatePaymentAttempt {
                    out_trade_no: out_trade_no.clone(),
                    order_number: order.order_number.clone(),
                    app_id: request.app_id.clone(),
                    merchant_id: account.merchant_id.clone(),
                    total_fee: order.total_amount,
                    trade_type: request.trade_type,
                    payer_id: request.payer_id.clone(),
                    client_ip: request.client_ip.clone(),
                    notify_url: self.notify_url.clone(),
                },
            )
            .await?;

        let outcome = self
            .gateway
            .create_unified_order(
                &request.app_id,
                UnifiedOrderRequest {
                    body,
                    out_trade_no: out_trade_no.clone(),
                    total_fee: order.total_amount,
                    spbill_create_ip: request.client_ip.clone(),
                    notify_url: self.notify_url.clone(),
                    trade_type: request.trade_type,
                    openid: request.payer_id.clone(),
                    attach: Some(order.order_number.clone()),
                },
            )
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(gateway_err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, "failed to roll back payment initiation");
                }
                info!("payment initiation rejected by gateway, order left pending");
                return Err(gateway_err.into());
            }
        };

        let payment = self
            .payments
            .attach_gateway_identifiers(
                &txn,
                payment.id,
                outcome.prepay_id.clone(),
                outcome.code_url.clone(),
            )
            .await?;

        order::ActiveModel {
            id: Set(order.id),
            payment_id: Set(Some(payment.id)),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .update(&txn)
        .await?;

        txn.commit().await?;

        info!(%out_trade_no, total_fee = payment.total_fee, "payment initiated");
        self.emit(Event::PaymentInitiated {
            payment_id: payment.id,
            order_number: order.order_number.clone(),
        })
        .await;

        Ok(InitiatePaymentResponse {
            order_number: order.order_number,
            out_trade_no,
            trade_type: request.trade_type,
            total_fee: payment.total_fee,
            prepay_id: outcome.prepay_id,
            code_url: outcome.code_url,
            client_params: outcome.client_params,
        })
    }

    /// Reconcile an asynchronous payment notification.
    ///
    /// Always returns a well-formed acknowledgement; verification
    /// failures and unknown tokens take no state action. Redelivery of
    /// an already-applied notification is acknowledged without side
    /// effects.
    #[instrument(skip_all)]
    pub async fn handle_callback(&self, body: &[u8]) -> NotifyAck {
        let fields = match wire::decode(body) {
            Ok(fields) => fields,
            Err(err) => {
                warn!(error = %err, "rejecting undecodable callback");
                return NotifyAck::fail("invalid payload");
            }
        };

        if let Err(err) = self.gateway.verify_callback(&fields).await {
            warn!(error = %err, "rejecting callback that failed verification");
            return NotifyAck::fail("signature verification failed");
        }

        if fields.get("return_code").map(String::as_str) != Some(SUCCESS) {
            warn!("rejecting callback with failed return code");
            return NotifyAck::fail("unexpected return code");
        }

        let out_trade_no = match fields.get("out_trade_no").filter(|v| !v.is_empty()) {
            Some(token) => token.clone(),
            None => {
                warn!("rejecting callback without a transaction token");
                return NotifyAck::fail("missing out_trade_no");
            }
        };

        let payment = match self.payments.find_by_token(&out_trade_no).await {
            Ok(Some(payment)) => payment,
            Ok(None) => {
                // Nothing to reconcile; acknowledge failure rather than
                // erroring loudly.
                warn!(%out_trade_no, "callback references an unknown payment");
                return NotifyAck::fail("unknown transaction");
            }
            Err(err) => {
                error!(error = %err, %out_trade_no, "failed to load payment for callback");
                return NotifyAck::fail("temporary failure");
            }
        };

        let reported_success = fields.get("result_code").map(String::as_str) == Some(SUCCESS);

        // Idempotent short-circuit for duplicate deliveries: acknowledge
        // without side effects when the stored state already agrees with
        // the callback. A success report against a failed or cancelled
        // attempt is a real inconsistency and stays surfaced.
        match payment.status {
            PaymentStatus::Pending => {}
            PaymentStatus::Paid | PaymentStatus::Refunding | PaymentStatus::Refunded => {
                info!(%out_trade_no, status = %payment.status, "duplicate callback acknowledged without side effects");
                return NotifyAck::ok();
            }
            PaymentStatus::Failed | PaymentStatus::Cancelled => {
                if reported_success {
                    error!(
                        %out_trade_no,
                        status = %payment.status,
                        "gateway reports success for a closed attempt, manual reconciliation required"
                    );
                    return NotifyAck::fail("state mismatch");
                }
                info!(%out_trade_no, status = %payment.status, "duplicate callback acknowledged without side effects");
                return NotifyAck::ok();
            }
        }

        if reported_success {
            self.apply_success_callback(&payment, &fields).await
        } else {
            let err_code = fields
                .get("err_code")
                .cloned()
                .unwrap_or_else(|| "UNKNOWN".to_string());
            let err_des = fields.get("err_code_des").cloned();
            match self
                .payments
                .mark_failed(&payment.out_trade_no, &err_code, err_des)
                .await
            {
                Ok(_) => NotifyAck::ok(),
                Err(err) => {
                    error!(error = %err, %out_trade_no, "failed to record payment failure");
                    NotifyAck::fail("temporary failure")
                }
            }
        }
    }

    async fn apply_success_callback(&self, payment: &payment::Model, fields: &Params) -> NotifyAck {
        let out_trade_no = payment.out_trade_no.as_str();

        let total_fee: i64 = match fields.get("total_fee").and_then(|v| v.parse().ok()) {
            Some(fee) => fee,
            None => {
                warn!(%out_trade_no, "rejecting settlement callback without a total fee");
                return NotifyAck::fail("missing total_fee");
            }
        };
        // The settled amount must match what the attempt was created
        // with; a mismatch is reconciled manually, never applied.
        if total_fee != payment.total_fee {
            error!(
                %out_trade_no,
                expected = payment.total_fee,
                reported = total_fee,
                "settlement amount mismatch"
            );
            return NotifyAck::fail("amount mismatch");
        }

        let transaction_id = match fields.get("transaction_id").filter(|v| !v.is_empty()) {
            Some(id) => id.clone(),
            None => {
                warn!(%out_trade_no, "rejecting settlement callback without a transaction id");
                return NotifyAck::fail("missing transaction_id");
            }
        };

        let cash_fee = fields
            .get("cash_fee")
            .and_then(|v| v.parse().ok())
            .unwrap_or(total_fee);
        let settlement = PaymentSettlement {
            transaction_id: transaction_id.clone(),
            cash_fee,
            fee_type: fields.get("fee_type").cloned(),
            paid_at: fields.get("time_end").and_then(|v| parse_gateway_time(v)),
        };

        match self.apply_settlement(payment, settlement).await {
            Ok(()) => NotifyAck::ok(),
            Err(err) => {
                // Acknowledge failure so the gateway redelivers; both
                // transitions are idempotent, so the retry self-heals.
                error!(error = %err, %out_trade_no, "failed to apply settlement, awaiting redelivery");
                NotifyAck::fail("temporary failure")
            }
        }
    }

    /// Apply a settlement to the payment and then to the owning order,
    /// in that fixed order.
    async fn apply_settlement(
        &self,
        payment: &payment::Model,
        settlement: PaymentSettlement,
    ) -> Result<(), ServiceError> {
        let transaction_id = settlement.transaction_id.clone();
        let cash_fee = settlement.cash_fee;

        let updated = self
            .payments
            .mark_paid(&payment.out_trade_no, settlement)
            .await?;

        // The attachment carries the order number end-to-end; fall back
        // to it when the column is somehow empty.
        let order_number = if updated.order_number.is_empty() {
            updated.attach.clone().unwrap_or_default()
        } else {
            updated.order_number.clone()
        };

        self.orders
            .mark_as_paid(
                &order_number,
                cash_fee,
                &transaction_id,
                updated.id,
                PAYMENT_METHOD,
            )
            .await?;

        Ok(())
    }

    /// Recovery path for missed callbacks: ask the gateway for the
    /// attempt's state and apply the same reconciliation a callback
    /// would have.
    #[instrument(skip(self), fields(%order_number))]
    pub async fn query_and_reconcile(
        &self,
        order_number: &str,
    ) -> Result<PaymentStatus, ServiceError> {
        let order = self.orders.find_model(order_number).await?;
        let payment_id = order.payment_id.ok_or_else(|| {
            ServiceError::NotFound(format!("order {order_number} has no payment attempt"))
        })?;
        let payment = self.payments.get_by_id(payment_id).await?;

        if payment.status != PaymentStatus::Pending && payment.status != PaymentStatus::Refunding {
            return Ok(payment.status);
        }

        let outcome = self
            .gateway
            .query_status(&payment.app_id, &payment.out_trade_no)
            .await?;

        match (payment.status, outcome.status) {
            (PaymentStatus::Pending, PaymentStatus::Paid) => {
                let transaction_id = outcome.transaction_id.ok_or_else(|| {
                    ServiceError::InternalError(
                        "gateway reported success without a transaction id".to_string(),
                    )
                })?;
                let cash_fee = outcome
                    .cash_fee
                    .or(outcome.total_fee)
                    .unwrap_or(payment.total_fee);
                if outcome.total_fee.is_some_and(|fee| fee != payment.total_fee) {
                    return Err(ServiceError::Conflict(format!(
                        "gateway reports a different amount for payment {}",
                        payment.out_trade_no
                    )));
                }
                self.apply_settlement(
                    &payment,
                    PaymentSettlement {
                        transaction_id,
                        cash_fee,
                        fee_type: outcome.fee_type,
                        paid_at: outcome.time_end.as_deref().and_then(parse_gateway_time),
                    },
                )
                .await?;
                Ok(PaymentStatus::Paid)
            }
            (PaymentStatus::Pending, PaymentStatus::Failed) => {
                let description = outcome
                    .trade_state_desc
                    .unwrap_or_else(|| "reported by status query".to_string());
                self.payments
                    .mark_failed(&payment.out_trade_no, "PAYERROR", Some(description))
                    .await?;
                Ok(PaymentStatus::Failed)
            }
            (PaymentStatus::Pending, PaymentStatus::Cancelled) => {
                self.payments.cancel(&payment.out_trade_no).await?;
                Ok(PaymentStatus::Cancelled)
            }
            (PaymentStatus::Refunding, PaymentStatus::Refunded) => {
                self.payments.mark_refunded(&payment.out_trade_no).await?;
                self.orders.mark_refunded(order_number).await?;
                Ok(PaymentStatus::Refunded)
            }
            (current, reported) => {
                if current != reported {
                    info!(%current, %reported, "gateway state not applicable yet, leaving attempt unchanged");
                }
                Ok(current)
            }
        }
    }

    /// Refund a settled order. The amount is validated before any
    /// gateway call is made.
    #[instrument(skip(self, request), fields(%order_number, refund_fee = request.refund_fee))]
    pub async fn refund_order(
        &self,
        order_number: &str,
        request: RefundOrderRequest,
    ) -> Result<RefundOrderResponse, ServiceError> {
        request.validate()?;

        let order = self.orders.find_model(order_number).await?;
        let payment_id = order.payment_id.ok_or_else(|| {
            ServiceError::NotFound(format!("order {order_number} has no payment attempt"))
        })?;
        let payment = self.payments.get_by_id(payment_id).await?;

        if payment.status != PaymentStatus::Paid {
            return Err(ServiceError::invalid_transition(
                "payment",
                payment.status,
                PaymentStatus::Refunding,
            ));
        }
        if request.refund_fee > payment.total_fee {
            return Err(ServiceError::ValidationError(format!(
                "refund of {} exceeds the settled amount {}",
                request.refund_fee, payment.total_fee
            )));
        }

        let out_refund_no = generate_refund_token();
        let gateway_refund_id = self
            .gateway
            .refund(
                &payment.app_id,
                GatewayRefundRequest {
                    out_trade_no: payment.out_trade_no.clone(),
                    out_refund_no: out_refund_no.clone(),
                    total_fee: payment.total_fee,
                    refund_fee: request.refund_fee,
                    reason: request.reason.clone(),
                },
            )
            .await?;

        self.payments
            .initiate_refund(
                &payment.out_trade_no,
                out_refund_no.clone(),
                request.refund_fee,
                request.reason,
                gateway_refund_id.clone(),
            )
            .await?;

        Ok(RefundOrderResponse {
            order_number: order.order_number,
            out_trade_no: payment.out_trade_no,
            out_refund_no,
            refund_fee: request.refund_fee,
            gateway_refund_id,
        })
    }

    /// Cancel a pending order and its pending payment attempt as one
    /// logical operation.
    #[instrument(skip(self), fields(%order_number))]
    pub async fn cancel_order(
        &self,
        order_number: &str,
        reason: Option<String>,
    ) -> Result<(), ServiceError> {
        let order = self.orders.find_model(order_number).await?;
        self.orders.cancel(order_number, reason).await?;

        if let Some(payment_id) = order.payment_id {
            let payment = self.payments.get_by_id(payment_id).await?;
            if payment.status == PaymentStatus::Pending {
                self.payments.cancel(&payment.out_trade_no).await?;
            }
        }
        Ok(())
    }

    /// Thin wrapper enforcing the order-machine precondition.
    pub async fn confirm_delivery(&self, order_number: &str) -> Result<(), ServiceError> {
        self.orders.confirm_delivery(order_number).await?;
        Ok(())
    }

    /// Sweep payment attempts that stayed pending past the grace period
    /// and reconcile each against the gateway. Invoked periodically when
    /// configured, and available to operator tooling.
    #[instrument(skip(self))]
    pub async fn reconcile_pending(&self, grace_secs: u64) -> Result<SweepSummary, ServiceError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(grace_secs as i64);
        let stale = payment::Entity::find()
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .filter(payment::Column::CreatedAt.lt(cutoff))
            .all(&*self.db)
            .await?;

        let examined = stale.len();
        let mut reconciled = 0;
        for attempt in stale {
            match self.query_and_reconcile(&attempt.order_number).await {
                Ok(status) if status != PaymentStatus::Pending => reconciled += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        error = %err,
                        out_trade_no = %attempt.out_trade_no,
                        "sweep failed to reconcile attempt"
                    );
                }
            }
        }

        if examined > 0 {
            info!(examined, reconciled, "pending-payment sweep finished");
        }
        Ok(SweepSummary {
            examined,
            reconciled,
        })
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.event_sender.send(event).await {
            warn!(error = %e, "failed to send event");
        }
    }
}

/// Merchant transaction token: prefix + UTC second stamp + UUID-derived
/// suffix, 30 bytes. Fits the gateway's 32-byte ceiling and is unique by
/// construction (backed by the unique index on the column).
fn generate_trade_token() -> String {
    token_with_prefix("PT")
}

/// Merchant refund token; distinct prefix so it can never collide with
/// a trade token.
fn generate_refund_token() -> String {
    token_with_prefix("RT")
}

fn token_with_prefix(prefix: &str) -> String {
    let timestamp = Utc::now().format("%y%m%d%H%M%S");
    let unique = Uuid::new_v4().simple().to_string();
    format!("{prefix}{timestamp}{}", &unique[..16])
}

/// Product description shown in the payer's confirmation UI.
fn order_body(order: &order::Model, items: &[crate::entities::order_item::Model]) -> String {
    match items {
        [] => order.order_number.clone(),
        [only] => only.product_name.clone(),
        [first, rest @ ..] => format!("{} (+{} more)", first.product_name, rest.len()),
    }
}

/// Gateway timestamps are `yyyyMMddHHmmss` in the gateway's timezone;
/// stored as UTC.
fn parse_gateway_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_tokens_fit_the_gateway_ceiling_and_do_not_collide() {
        let a = generate_trade_token();
        let b = generate_trade_token();
        assert!(a.len() <= 32);
        assert_eq!(a.len(), 30);
        assert!(a.starts_with("PT"));
        assert_ne!(a, b);
    }

    #[test]
    fn refund_tokens_use_a_distinct_prefix() {
        let refund = generate_refund_token();
        assert!(refund.starts_with("RT"));
        assert_eq!(refund.len(), 30);
    }

    #[test]
    fn ack_renders_the_expected_wire_shape() {
        let ok = NotifyAck::ok().to_xml();
        assert!(ok.contains("<return_code><![CDATA[SUCCESS]]></return_code>"));
        assert!(ok.contains("<return_msg><![CDATA[OK]]></return_msg>"));

        let fail = NotifyAck::fail("signature verification failed").to_xml();
        assert!(fail.contains("<return_code><![CDATA[FAIL]]></return_code>"));
        assert!(fail.contains("signature verification failed"));
    }

    #[test]
    fn gateway_timestamps_parse_to_utc() {
        let parsed = parse_gateway_time("20260806143015").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-08-06T14:30:15+00:00");
        assert!(parse_gateway_time("not-a-time").is_none());
    }
}
