use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::DbPool,
    entities::payment::{self, PaymentStatus, TradeType},
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Inputs for a new payment attempt. The owning order number is also
/// written into the attachment field so callbacks can locate the order
/// without the direct reference.
#[derive(Debug, Clone)]
pub struct CreatePaymentAttempt {
    pub out_trade_no: String,
    pub order_number: String,
    pub app_id: String,
    pub merchant_id: String,
    pub total_fee: i64,
    pub trade_type: TradeType,
    pub payer_id: Option<String>,
    pub client_ip: String,
    pub notify_url: String,
}

/// Settlement details reported by the gateway for a payment attempt.
#[derive(Debug, Clone)]
pub struct PaymentSettlement {
    pub transaction_id: String,
    pub cash_fee: i64,
    pub fee_type: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Service owning the payment state machine.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DbPool>,
    event_sender: EventSender,
}

impl PaymentService {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Insert a pending payment attempt. Runs on the caller's connection
    /// so creation can join the payment-initiation transaction.
    pub async fn create<C: ConnectionTrait>(
        &self,
        conn: &C,
        attempt: CreatePaymentAttempt,
    ) -> Result<payment::Model, ServiceError> {
        if attempt.total_fee <= 0 {
            return Err(ServiceError::ValidationError(
                "payment amount must be positive".to_string(),
            ));
        }

        let now = Utc::now();
        let model = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            out_trade_no: Set(attempt.out_trade_no),
            order_number: Set(attempt.order_number.clone()),
            app_id: Set(attempt.app_id),
            merchant_id: Set(attempt.merchant_id),
            status: Set(PaymentStatus::Pending),
            total_fee: Set(attempt.total_fee),
            fee_type: Set(Some("CNY".to_string())),
            cash_fee: Set(None),
            trade_type: Set(attempt.trade_type),
            payer_id: Set(attempt.payer_id),
            client_ip: Set(attempt.client_ip),
            notify_url: Set(attempt.notify_url),
            attach: Set(Some(attempt.order_number)),
            prepay_id: Set(None),
            code_url: Set(None),
            gateway_transaction_id: Set(None),
            err_code: Set(None),
            err_code_des: Set(None),
            out_refund_no: Set(None),
            refund_fee: Set(None),
            refund_reason: Set(None),
            gateway_refund_id: Set(None),
            paid_at: Set(None),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        };

        Ok(model.insert(conn).await?)
    }

    /// Persist the identifiers the gateway issued for the attempt.
    pub async fn attach_gateway_identifiers<C: ConnectionTrait>(
        &self,
        conn: &C,
        payment_id: Uuid,
        prepay_id: Option<String>,
        code_url: Option<String>,
    ) -> Result<payment::Model, ServiceError> {
        let updated = payment::ActiveModel {
            id: Set(payment_id),
            prepay_id: Set(prepay_id),
            code_url: Set(code_url),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .update(conn)
        .await?;
        Ok(updated)
    }

    pub async fn find_by_token(
        &self,
        out_trade_no: &str,
    ) -> Result<Option<payment::Model>, ServiceError> {
        Ok(payment::Entity::find()
            .filter(payment::Column::OutTradeNo.eq(out_trade_no))
            .one(&*self.db)
            .await?)
    }

    pub async fn require_by_token(
        &self,
        out_trade_no: &str,
    ) -> Result<payment::Model, ServiceError> {
        self.find_by_token(out_trade_no).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("Payment {out_trade_no} not found"))
        })
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<payment::Model, ServiceError> {
        payment::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {id} not found")))
    }

    /// Settle the attempt. Idempotent under the gateway transaction id:
    /// re-applying the same settlement is a no-op success, a different
    /// transaction id against a settled attempt is a conflict.
    #[instrument(skip(self, settlement), fields(%out_trade_no, transaction_id = %settlement.transaction_id))]
    pub async fn mark_paid(
        &self,
        out_trade_no: &str,
        settlement: PaymentSettlement,
    ) -> Result<payment::Model, ServiceError> {
        let payment = self.require_by_token(out_trade_no).await?;

        if payment.status == PaymentStatus::Paid {
            if payment.gateway_transaction_id.as_deref()
                == Some(settlement.transaction_id.as_str())
            {
                debug!("payment already settled by this transaction");
                return Ok(payment);
            }
            return Err(ServiceError::Conflict(format!(
                "payment {out_trade_no} already settled by transaction {}",
                payment.gateway_transaction_id.unwrap_or_default()
            )));
        }
        if !payment.status.can_transition_to(PaymentStatus::Paid) {
            return Err(ServiceError::invalid_transition(
                "payment",
                payment.status,
                PaymentStatus::Paid,
            ));
        }

        let now = Utc::now();
        let fee_type = settlement.fee_type.or(payment.fee_type.clone());
        let updated = payment::ActiveModel {
            id: Set(payment.id),
            status: Set(PaymentStatus::Paid),
            cash_fee: Set(Some(settlement.cash_fee)),
            fee_type: Set(fee_type),
            gateway_transaction_id: Set(Some(settlement.transaction_id.clone())),
            paid_at: Set(Some(settlement.paid_at.unwrap_or(now))),
            updated_at: Set(Some(now)),
            ..Default::default()
        }
        .update(&*self.db)
        .await?;

        info!(cash_fee = settlement.cash_fee, "payment settled");
        self.emit(Event::PaymentSucceeded {
            payment_id: payment.id,
            transaction_id: settlement.transaction_id,
            cash_fee: settlement.cash_fee,
        })
        .await;

        Ok(updated)
    }

    /// Record a failed attempt. Only legal from pending.
    #[instrument(skip(self), fields(%out_trade_no, %err_code))]
    pub async fn mark_failed(
        &self,
        out_trade_no: &str,
        err_code: &str,
        err_code_des: Option<String>,
    ) -> Result<payment::Model, ServiceError> {
        let payment = self.require_by_token(out_trade_no).await?;
        if !payment.status.can_transition_to(PaymentStatus::Failed) {
            return Err(ServiceError::invalid_transition(
                "payment",
                payment.status,
                PaymentStatus::Failed,
            ));
        }

        let updated = payment::ActiveModel {
            id: Set(payment.id),
            status: Set(PaymentStatus::Failed),
            err_code: Set(Some(err_code.to_string())),
            err_code_des: Set(err_code_des),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .update(&*self.db)
        .await?;

        info!("payment failed");
        self.emit(Event::PaymentFailed {
            payment_id: payment.id,
            err_code: err_code.to_string(),
        })
        .await;

        Ok(updated)
    }

    /// Move a settled payment into the refund path. The amount must not
    /// exceed what was originally settled.
    #[instrument(skip(self, reason), fields(%out_trade_no, refund_fee))]
    pub async fn initiate_refund(
        &self,
        out_trade_no: &str,
        out_refund_no: String,
        refund_fee: i64,
        reason: Option<String>,
        gateway_refund_id: String,
    ) -> Result<payment::Model, ServiceError> {
        let payment = self.require_by_token(out_trade_no).await?;
        if !payment.status.can_transition_to(PaymentStatus::Refunding) {
            return Err(ServiceError::invalid_transition(
                "payment",
                payment.status,
                PaymentStatus::Refunding,
            ));
        }
        if refund_fee <= 0 || refund_fee > payment.total_fee {
            return Err(ServiceError::ValidationError(
                "refund amount exceeds the settled amount".to_string(),
            ));
        }

        let updated = payment::ActiveModel {
            id: Set(payment.id),
            status: Set(PaymentStatus::Refunding),
            out_refund_no: Set(Some(out_refund_no)),
            refund_fee: Set(Some(refund_fee)),
            refund_reason: Set(reason),
            gateway_refund_id: Set(Some(gateway_refund_id)),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .update(&*self.db)
        .await?;

        info!("refund initiated");
        self.emit(Event::RefundInitiated {
            payment_id: payment.id,
            refund_fee,
        })
        .await;

        Ok(updated)
    }

    /// Applied when the gateway reports the refund settled.
    #[instrument(skip(self), fields(%out_trade_no))]
    pub async fn mark_refunded(&self, out_trade_no: &str) -> Result<payment::Model, ServiceError> {
        let payment = self.require_by_token(out_trade_no).await?;
        if payment.status == PaymentStatus::Refunded {
            return Ok(payment);
        }
        if !payment.status.can_transition_to(PaymentStatus::Refunded) {
            return Err(ServiceError::invalid_transition(
                "payment",
                payment.status,
                PaymentStatus::Refunded,
            ));
        }

        let updated = payment::ActiveModel {
            id: Set(payment.id),
            status: Set(PaymentStatus::Refunded),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .update(&*self.db)
        .await?;

        info!("refund completed");
        self.emit(Event::RefundCompleted {
            payment_id: payment.id,
        })
        .await;

        Ok(updated)
    }

    /// Cancel a pending attempt, typically because the owning order was
    /// cancelled before payment completed.
    #[instrument(skip(self), fields(%out_trade_no))]
    pub async fn cancel(&self, out_trade_no: &str) -> Result<payment::Model, ServiceError> {
        let payment = self.require_by_token(out_trade_no).await?;
        if payment.status == PaymentStatus::Cancelled {
            return Ok(payment);
        }
        if !payment.status.can_transition_to(PaymentStatus::Cancelled) {
            return Err(ServiceError::invalid_transition(
                "payment",
                payment.status,
                PaymentStatus::Cancelled,
            ));
        }

        let updated = payment::ActiveModel {
            id: Set(payment.id),
            status: Set(PaymentStatus::Cancelled),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .update(&*self.db)
        .await?;

        info!("payment cancelled");
        self.emit(Event::PaymentCancelled(payment.id)).await;
        Ok(updated)
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.event_sender.send(event).await {
            warn!(error = %e, "failed to send event");
        }
    }
}
