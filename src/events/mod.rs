use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Events emitted by the order and payment services. Consumers are
/// observers only; state transitions never depend on event delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order events
    OrderCreated(Uuid),
    OrderPaid {
        order_id: Uuid,
        amount: i64,
        transaction_id: String,
    },
    OrderCancelled(Uuid),
    OrderShipped(Uuid),
    OrderCompleted(Uuid),
    OrderRefunded(Uuid),

    // Payment events
    PaymentInitiated {
        payment_id: Uuid,
        order_number: String,
    },
    PaymentSucceeded {
        payment_id: Uuid,
        transaction_id: String,
        cash_fee: i64,
    },
    PaymentFailed {
        payment_id: Uuid,
        err_code: String,
    },
    PaymentCancelled(Uuid),
    RefundInitiated {
        payment_id: Uuid,
        refund_fee: i64,
    },
    RefundCompleted {
        payment_id: Uuid,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Build a connected sender/receiver pair.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Event processing loop: logs every transition for audit purposes.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderPaid {
                order_id,
                amount,
                transaction_id,
            } => {
                info!(%order_id, amount, %transaction_id, "order paid");
            }
            Event::PaymentSucceeded {
                payment_id,
                transaction_id,
                cash_fee,
            } => {
                info!(%payment_id, %transaction_id, cash_fee, "payment settled");
            }
            Event::PaymentFailed {
                payment_id,
                err_code,
            } => {
                info!(%payment_id, %err_code, "payment failed");
            }
            other => debug!(event = ?other, "event received"),
        }
    }

    info!("Event processing loop stopped");
}
