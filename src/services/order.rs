use crate::domain::payment_request::PaymentState;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// The one interface the reconciler has to the surrounding commerce
/// system: write a payment-status field and timestamp onto an order. The
/// order system owns everything else about the order.
#[async_trait]
pub trait OrderUpdater: Send + Sync {
    async fn update_payment_status(
        &self,
        order_reference: &str,
        state: PaymentState,
        occurred_at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Logs status updates instead of writing them anywhere; the deployment
/// wires the real order store in behind the same trait.
pub struct LoggingOrderUpdater;

#[async_trait]
impl OrderUpdater for LoggingOrderUpdater {
    async fn update_payment_status(
        &self,
        order_reference: &str,
        state: PaymentState,
        occurred_at: DateTime<Utc>,
    ) -> Result<()> {
        log::info!(
            "Order payment status update: order={}, state={:?}, at={}",
            order_reference,
            state,
            occurred_at
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderStatusUpdate {
    pub order_reference: String,
    pub state: PaymentState,
    pub occurred_at: DateTime<Utc>,
}

/// Captures every update it receives; lets tests assert an order was
/// notified exactly once.
pub struct RecordingOrderUpdater {
    updates: Mutex<Vec<OrderStatusUpdate>>,
}

impl RecordingOrderUpdater {
    pub fn new() -> Self {
        RecordingOrderUpdater {
            updates: Mutex::new(Vec::new()),
        }
    }

    pub async fn updates(&self) -> Vec<OrderStatusUpdate> {
        self.updates.lock().await.clone()
    }

    pub async fn updates_for(&self, order_reference: &str) -> Vec<OrderStatusUpdate> {
        self.updates
            .lock()
            .await
            .iter()
            .filter(|u| u.order_reference == order_reference)
            .cloned()
            .collect()
    }
}

impl Default for RecordingOrderUpdater {
    fn default() -> Self {
        RecordingOrderUpdater::new()
    }
}

#[async_trait]
impl OrderUpdater for RecordingOrderUpdater {
    async fn update_payment_status(
        &self,
        order_reference: &str,
        state: PaymentState,
        occurred_at: DateTime<Utc>,
    ) -> Result<()> {
        self.updates.lock().await.push(OrderStatusUpdate {
            order_reference: order_reference.to_string(),
            state,
            occurred_at,
        });
        Ok(())
    }
}
