use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Enum representing the possible statuses of an order.
///
/// `Cancelled`, `Refunded` and `Completed` are terminal. Paid orders
/// leave the machine through the refund path, never through `cancel`.
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
pub enum OrderStatus {
    #[sea_orm(string_value = "Pending")]
    Pending,
    #[sea_orm(string_value = "Paid")]
    Paid,
    #[sea_orm(string_value = "Shipped")]
    Shipped,
    #[sea_orm(string_value = "Completed")]
    Completed,
    #[sea_orm(string_value = "Cancelled")]
    Cancelled,
    #[sea_orm(string_value = "Refunded")]
    Refunded,
}

impl OrderStatus {
    /// Allowed-transition table for the order state machine.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Paid)
                | (Pending, Cancelled)
                | (Paid, Shipped)
                | (Paid, Refunded)
                | (Shipped, Completed)
                | (Shipped, Refunded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Cancelled | OrderStatus::Refunded | OrderStatus::Completed
        )
    }
}

/// The `orders` table.
///
/// All monetary columns are integer minor currency units. The amount
/// invariant `total_amount = subtotal + shipping_fee - discount_amount`
/// is recomputed from the line items by the order service; `paid_amount`
/// is written only by a successful payment transition and carries the
/// amount the gateway reported for that transaction.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Platform-issued, human-auditable order number.
    #[sea_orm(unique)]
    pub order_number: String,

    pub customer_id: Uuid,
    pub status: OrderStatus,

    pub subtotal: i64,
    pub shipping_fee: i64,
    pub discount_amount: i64,
    pub total_amount: i64,
    pub paid_amount: i64,

    pub payment_method: Option<String>,

    /// The active payment attempt, set once payment is initiated.
    pub payment_id: Option<Uuid>,

    /// Gateway transaction id of the settled payment; the idempotency
    /// key for `mark_as_paid`.
    pub gateway_transaction_id: Option<String>,

    pub shipping_address: Option<Json>,
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,

    /// Append-only log of logistics events.
    pub tracking_events: Option<Json>,

    pub buyer_message: Option<String>,
    pub seller_message: Option<String>,
    pub cancel_reason: Option<String>,

    pub paid_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::OrderStatus::{self, *};

    #[test]
    fn pending_orders_can_be_paid_or_cancelled() {
        assert!(Pending.can_transition_to(Paid));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Shipped));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Refunded));
    }

    #[test]
    fn paid_orders_ship_or_refund_but_never_cancel() {
        assert!(Paid.can_transition_to(Shipped));
        assert!(Paid.can_transition_to(Refunded));
        assert!(!Paid.can_transition_to(Cancelled));
        assert!(!Paid.can_transition_to(Pending));
    }

    #[test]
    fn shipped_orders_complete_or_refund() {
        assert!(Shipped.can_transition_to(Completed));
        assert!(Shipped.can_transition_to(Refunded));
        assert!(!Shipped.can_transition_to(Cancelled));
    }

    #[test]
    fn terminal_states_admit_no_transition() {
        for terminal in [Cancelled, Refunded, Completed] {
            assert!(terminal.is_terminal());
            for next in [Pending, Paid, Shipped, Completed, Cancelled, Refunded] {
                assert!(!OrderStatus::can_transition_to(terminal, next));
            }
        }
    }
}
