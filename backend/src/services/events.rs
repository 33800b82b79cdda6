//! # Order Event Log
//!
//! Every state change of an order is appended to its event log. The
//! repository assigns `seq` atomically, so readers see `1, 2, 3, …`.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::db::{EventRepository, Id, OrderEvent};
use crate::errors::BrokerResult;

/// Event type names.
pub mod event_types {
    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_PENDING_REVIEW: &str = "order.pending_review";
    pub const ORDER_PAYMENT_SUBMITTED: &str = "order.payment_submitted";
    pub const ORDER_PAYMENT_REJECTED: &str = "order.payment_rejected";
    pub const ORDER_APPROVED: &str = "order.approved";
    pub const ORDER_REJECTED: &str = "order.rejected";
    pub const ORDER_CANCELED: &str = "order.canceled";
    pub const ORDER_PROVISIONING: &str = "order.provisioning";
    pub const ORDER_COMPLETED: &str = "order.completed";
    pub const ORDER_FAILED: &str = "order.failed";
    pub const ITEM_ACTIVE: &str = "order.item.active";
    pub const ITEM_FAILED: &str = "order.item.failed";
}

/// Appends to the per-order event log.
#[derive(Clone)]
pub struct EventPublisher {
    repo: Arc<dyn EventRepository>,
}

impl EventPublisher {
    pub fn new(repo: Arc<dyn EventRepository>) -> Self {
        Self { repo }
    }

    /// Append an event and return its sequence number.
    pub async fn publish(&self, order_id: Id, event_type: &str, data: Value) -> BrokerResult<i64> {
        let event = self.repo.append_event(order_id, event_type, data).await?;
        debug!("Order {} event #{} {}", order_id, event.seq, event_type);
        Ok(event.seq)
    }

    /// Append an event; failures are logged and dropped.
    pub async fn emit(&self, order_id: Id, event_type: &str, data: Value) {
        if let Err(e) = self.publish(order_id, event_type, data).await {
            warn!("Failed to record {} for order {}: {}", event_type, order_id, e);
        }
    }

    pub async fn history(&self, order_id: Id) -> BrokerResult<Vec<OrderEvent>> {
        Ok(self.repo.list_events(order_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_sequence_is_gapless_per_order() {
        let publisher = EventPublisher::new(Arc::new(MemoryStore::new()));
        assert_eq!(publisher.publish(1, event_types::ORDER_CREATED, json!({})).await.unwrap(), 1);
        assert_eq!(publisher.publish(2, event_types::ORDER_CREATED, json!({})).await.unwrap(), 1);
        publisher.emit(1, event_types::ORDER_APPROVED, json!({"status": "approved"})).await;
        assert_eq!(publisher.publish(1, event_types::ORDER_COMPLETED, json!({})).await.unwrap(), 3);

        let seqs: Vec<i64> = publisher.history(1).await.unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
