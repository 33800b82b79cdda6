//! # Order Status Aggregation
//!
//! The order status of a live order is derived from its items:
//!
//! | Items | Order |
//! |-------|-------|
//! | any `failed` | `failed` |
//! | all `active` | `active` |
//! | all `pending_review`, order `provisioning`, no instance yet | `pending_review` |
//! | anything else | `provisioning` |
//!
//! Canceled and rejected items are ignored. Only orders already in
//! `approved | provisioning | active | failed` are reconciled.

use serde_json::json;
use tracing::info;

use super::context::ServiceContext;
use super::events::event_types;
use super::notify::kinds;
use crate::db::{Id, Order, OrderItem, OrderStatus};
use crate::errors::BrokerResult;

/// Aggregate item statuses; `None` when no live item remains.
pub fn aggregate_status(items: &[OrderItem]) -> Option<OrderStatus> {
    let live: Vec<OrderStatus> = items
        .iter()
        .map(|i| i.status)
        .filter(|s| !matches!(s, OrderStatus::Canceled | OrderStatus::Rejected))
        .collect();
    if live.is_empty() {
        return None;
    }
    if live.contains(&OrderStatus::Failed) {
        return Some(OrderStatus::Failed);
    }
    if live.iter().all(|s| *s == OrderStatus::Active) {
        return Some(OrderStatus::Active);
    }
    if live.iter().all(|s| *s == OrderStatus::PendingReview) {
        return Some(OrderStatus::PendingReview);
    }
    Some(OrderStatus::Provisioning)
}

fn reconcilable(status: OrderStatus) -> bool {
    matches!(
        status,
        OrderStatus::Approved | OrderStatus::Provisioning | OrderStatus::Active | OrderStatus::Failed
    )
}

/// Recompute and persist the order status, returning the resulting status.
pub async fn reconcile_order(ctx: &ServiceContext, order_id: Id) -> BrokerResult<OrderStatus> {
    let mut order = ctx.repos.orders.get_order(order_id).await?;
    if !reconcilable(order.status) {
        return Ok(order.status);
    }
    let items = ctx.repos.orders.list_items(order_id).await?;
    let Some(next) = aggregate_status(&items) else {
        return Ok(order.status);
    };
    if next == order.status {
        return Ok(next);
    }
    if next == OrderStatus::PendingReview && !may_return_to_review(ctx, &order, &items).await? {
        return Ok(order.status);
    }

    info!("Order {} {} -> {}", order.order_no, order.status, next);
    order.status = next;
    ctx.repos.orders.save_order(&order).await?;
    let event = match next {
        OrderStatus::PendingReview => event_types::ORDER_PENDING_REVIEW,
        OrderStatus::Failed => event_types::ORDER_FAILED,
        _ => event_types::ORDER_COMPLETED,
    };
    ctx.events.emit(order.id, event, json!({ "status": next })).await;
    notify_outcome(ctx, &order).await;
    Ok(next)
}

/// Only a `provisioning` order whose items never produced an instance
/// may fall back to `pending_review`.
async fn may_return_to_review(ctx: &ServiceContext, order: &Order, items: &[OrderItem]) -> BrokerResult<bool> {
    if order.status != OrderStatus::Provisioning {
        return Ok(false);
    }
    for item in items {
        if ctx.repos.instances.find_instance_by_item(item.id).await?.is_some() {
            return Ok(false);
        }
    }
    Ok(true)
}

pub(crate) async fn notify_outcome(ctx: &ServiceContext, order: &Order) {
    match order.status {
        OrderStatus::Active => {
            ctx.notify(
                order.user_id,
                kinds::PROVISIONED,
                "VPS Provisioned",
                &format!("Order {} has been provisioned.", order.order_no),
            )
            .await
        }
        OrderStatus::Failed => {
            ctx.notify(
                order.user_id,
                kinds::PROVISION_FAILED,
                "Provision Failed",
                &format!("Order {} failed to provision.", order.order_no),
            )
            .await
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{EventRepository, InstanceRepository, ItemAction, OrderRepository};
    use crate::testing::TestBed;
    use crate::utils::SpecDoc;

    fn item(status: OrderStatus) -> OrderItem {
        OrderItem::draft(ItemAction::Create, status, 1000, SpecDoc::new())
    }

    #[test]
    fn test_aggregate_table() {
        use OrderStatus::*;
        assert_eq!(aggregate_status(&[item(Active), item(Active)]), Some(Active));
        assert_eq!(aggregate_status(&[item(Active), item(Failed)]), Some(Failed));
        assert_eq!(aggregate_status(&[item(Active), item(Provisioning)]), Some(Provisioning));
        assert_eq!(aggregate_status(&[item(Approved), item(PendingPayment)]), Some(Provisioning));
        assert_eq!(aggregate_status(&[item(PendingReview), item(PendingReview)]), Some(PendingReview));
        assert_eq!(aggregate_status(&[item(Active), item(Canceled)]), Some(Active));
        assert_eq!(aggregate_status(&[item(Rejected)]), None);
    }

    #[tokio::test]
    async fn test_reconcile_completes_and_notifies() {
        let bed = TestBed::new().await;
        let (order, items) = bed.seed_order(1, OrderStatus::Provisioning, &[OrderStatus::Active, OrderStatus::Active]).await;
        assert_eq!(items.len(), 2);

        assert_eq!(reconcile_order(&bed.ctx, order.id).await.unwrap(), OrderStatus::Active);
        let events = bed.store.list_events(order.id).await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.event_type, "order.completed");
        assert_eq!(last.data, json!({"status": "active"}));
        assert_eq!(bed.sink.kinds_for(1), vec!["provisioned".to_string()]);

        // unchanged status publishes nothing further
        reconcile_order(&bed.ctx, order.id).await.unwrap();
        assert_eq!(bed.store.list_events(order.id).await.unwrap().len(), events.len());
    }

    #[tokio::test]
    async fn test_orders_awaiting_payment_are_left_alone() {
        let bed = TestBed::new().await;
        let (order, _) = bed.seed_order(1, OrderStatus::PendingPayment, &[OrderStatus::Active]).await;
        assert_eq!(reconcile_order(&bed.ctx, order.id).await.unwrap(), OrderStatus::PendingPayment);
    }

    #[tokio::test]
    async fn test_review_fallback_only_without_instances() {
        let bed = TestBed::new().await;
        let (fresh, _) = bed.seed_order(1, OrderStatus::Provisioning, &[OrderStatus::PendingReview]).await;
        assert_eq!(reconcile_order(&bed.ctx, fresh.id).await.unwrap(), OrderStatus::PendingReview);
        let events = bed.store.list_events(fresh.id).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, "order.pending_review");

        // an instance already exists for the item
        let (built, items) = bed.seed_order(1, OrderStatus::Provisioning, &[OrderStatus::PendingReview]).await;
        let mut inst = bed.seed_instance(1, None).await;
        inst.order_item_id = items[0].id;
        bed.store.save_instance(&inst).await.unwrap();
        assert_eq!(reconcile_order(&bed.ctx, built.id).await.unwrap(), OrderStatus::Provisioning);
        assert_eq!(bed.store.get_order(built.id).await.unwrap().status, OrderStatus::Provisioning);

        // orders past provisioning stay where they are
        for status in [OrderStatus::Approved, OrderStatus::Active, OrderStatus::Failed] {
            let (order, _) = bed.seed_order(1, status, &[OrderStatus::PendingReview]).await;
            assert_eq!(reconcile_order(&bed.ctx, order.id).await.unwrap(), status);
            assert!(bed.store.list_events(order.id).await.unwrap().is_empty());
        }
    }
}
