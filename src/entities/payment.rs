use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Enum representing the possible statuses of a gateway payment attempt.
///
/// Every transition out of `Pending` is one-way, and `Paid` is the only
/// state from which the refund path is reachable.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "Pending")]
    Pending,
    #[sea_orm(string_value = "Paid")]
    Paid,
    #[sea_orm(string_value = "Failed")]
    Failed,
    #[sea_orm(string_value = "Refunding")]
    Refunding,
    #[sea_orm(string_value = "Refunded")]
    Refunded,
    #[sea_orm(string_value = "Cancelled")]
    Cancelled,
}

impl PaymentStatus {
    /// Allowed-transition table for the payment state machine.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Paid)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Paid, Refunding)
                | (Refunding, Refunded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentStatus::Failed | PaymentStatus::Refunded | PaymentStatus::Cancelled
        )
    }
}

/// Trade type requested from the gateway: in-app (JSAPI), QR (NATIVE) or
/// mobile web (MWEB). The wire strings are the gateway's vocabulary.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(8))")]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeType {
    #[sea_orm(string_value = "JSAPI")]
    #[strum(serialize = "JSAPI")]
    Jsapi,
    #[sea_orm(string_value = "NATIVE")]
    #[strum(serialize = "NATIVE")]
    Native,
    #[sea_orm(string_value = "MWEB")]
    #[strum(serialize = "MWEB")]
    Mweb,
}

impl TradeType {
    pub fn as_wire(self) -> &'static str {
        match self {
            TradeType::Jsapi => "JSAPI",
            TradeType::Native => "NATIVE",
            TradeType::Mweb => "MWEB",
        }
    }
}

/// The `payments` table: one row per gateway payment attempt.
///
/// `out_trade_no` is the merchant transaction token handed to the
/// gateway (unique, ≤ 32 bytes); `total_fee` is immutable after
/// creation; only status and gateway-assigned identifiers change.
/// `order_number` doubles as the `attach` payload so a callback can
/// locate the owning order without the direct reference.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Merchant transaction token.
    #[sea_orm(unique)]
    pub out_trade_no: String,

    /// Owning merchant order number, carried end-to-end in `attach`.
    pub order_number: String,

    pub app_id: String,
    pub merchant_id: String,
    pub status: PaymentStatus,

    /// Amount in minor currency units; immutable after creation.
    pub total_fee: i64,
    pub fee_type: Option<String>,

    /// Amount the gateway reported settled.
    pub cash_fee: Option<i64>,

    pub trade_type: TradeType,
    pub payer_id: Option<String>,
    pub client_ip: String,
    pub notify_url: String,
    pub attach: Option<String>,

    /// Gateway-issued identifiers.
    pub prepay_id: Option<String>,
    pub code_url: Option<String>,
    pub gateway_transaction_id: Option<String>,

    pub err_code: Option<String>,
    pub err_code_des: Option<String>,

    /// Refund tracking.
    pub out_refund_no: Option<String>,
    pub refund_fee: Option<i64>,
    pub refund_reason: Option<String>,
    pub gateway_refund_id: Option<String>,

    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::PaymentStatus::{self, *};

    #[test]
    fn pending_payments_settle_fail_or_cancel() {
        assert!(Pending.can_transition_to(Paid));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Refunding));
        assert!(!Pending.can_transition_to(Refunded));
    }

    #[test]
    fn only_paid_payments_reach_the_refund_path() {
        assert!(Paid.can_transition_to(Refunding));
        assert!(Refunding.can_transition_to(Refunded));
        for status in [Pending, Failed, Refunding, Refunded, Cancelled] {
            assert!(!status.can_transition_to(Refunding) || status == Paid);
        }
    }

    #[test]
    fn transitions_are_one_way() {
        for status in [Paid, Failed, Refunding, Refunded, Cancelled] {
            assert!(!PaymentStatus::can_transition_to(status, Pending));
        }
        assert!(!Refunded.can_transition_to(Paid));
        assert!(!Failed.can_transition_to(Paid));
    }
}
