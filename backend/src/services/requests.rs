//! # Instance Requests
//!
//! Orders that act on an existing instance.
//!
//! | Request | Prefix | Starts as | Total |
//! |---------|--------|-----------|-------|
//! | renew | `REN-` | `pending_payment` | `monthly × months` |
//! | emergency renew | `EMR-` | approved by the system | `0` |
//! | resize | `UPG-` | `pending_payment`, or approved when nothing is owed | `max(charge, 0)` |
//! | refund | `REF-` | `pending_review`, or approved when no review is required | `-refund` |
//! | admin delete | `DEL-` | approved by the admin | `0` |
//!
//! Each request refuses to open while an equivalent one is still open for
//! the same instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::context::ServiceContext;
use super::events::event_types;
use super::orders::{insert_order, OrderService, DEFAULT_CURRENCY};
use super::pricing::{self, ResizeInputs, ResizeQuote};
use super::realname::actions as realname_actions;
use crate::db::{CartSpec, Id, ItemAction, Order, OrderCreateExtras, OrderItem, OrderStatus, VpsInstance};
use crate::errors::{BrokerError, BrokerResult};
use crate::utils::SpecDoc;

const SYSTEM_ADMIN: Id = 0;

/// A capacity change request.
///
/// Without `spec` the current addons are kept, or cleared when
/// `reset_addons` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResizeRequest {
    #[serde(default)]
    pub spec: Option<CartSpec>,
    #[serde(default)]
    pub target_package_id: Id,
    #[serde(default)]
    pub reset_addons: bool,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct RequestService {
    ctx: ServiceContext,
    orders: OrderService,
}

impl RequestService {
    pub fn new(ctx: ServiceContext, orders: OrderService) -> Self {
        Self { ctx, orders }
    }

    async fn owned_instance(&self, user_id: Id, vps_id: Id) -> BrokerResult<VpsInstance> {
        let inst = self.ctx.repos.instances.get_instance(vps_id).await?;
        if inst.user_id != user_id {
            return Err(BrokerError::forbidden("instance belongs to another user"));
        }
        Ok(inst)
    }

    async fn ensure_none_open(&self, vps_id: Id, action: ItemAction) -> BrokerResult<()> {
        if !self.ctx.repos.orders.list_open_items_for_vps(vps_id, action).await?.is_empty() {
            return Err(BrokerError::conflict(format!("an open {} order exists for VPS {}", action, vps_id)));
        }
        Ok(())
    }

    /// Insert a single-item order against `inst` and publish its creation.
    async fn open_order(
        &self,
        prefix: &str,
        inst: &VpsInstance,
        user_id: Id,
        status: OrderStatus,
        total: i64,
        mut item: OrderItem,
        idempotency_key: Option<&str>,
    ) -> BrokerResult<Order> {
        item.package_id = inst.package_id;
        item.system_id = inst.system_id;
        item.goods_type_id = inst.goods_type_id;
        let mut order = Order::draft(user_id, String::new(), status, DEFAULT_CURRENCY);
        order.total_amount = total;
        order.idempotency_key = idempotency_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        if status == OrderStatus::PendingReview {
            order.pending_reason = Some(item.action.to_string());
        }
        let action = item.action;
        let (order, _) = insert_order(&self.ctx, prefix, order, vec![item], OrderCreateExtras::default()).await?;
        info!("🧾 {} order {} opened for VPS {} (total {})", action, order.order_no, inst.id, total);
        self.ctx
            .events
            .emit(order.id, event_types::ORDER_CREATED, json!({ "status": order.status, "total": order.total_amount }))
            .await;
        if let Some(reason) = order.pending_reason.as_deref() {
            self.ctx
                .events
                .emit(order.id, event_types::ORDER_PENDING_REVIEW, json!({ "reason": reason }))
                .await;
        }
        Ok(order)
    }

    // ============================================
    // RENEW
    // ============================================

    pub async fn create_renew_order(
        &self,
        user_id: Id,
        vps_id: Id,
        months: i32,
        idempotency_key: Option<&str>,
    ) -> BrokerResult<Order> {
        self.ctx.realname.require_action(user_id, realname_actions::RENEW_VPS).await?;
        if let Some(key) = idempotency_key.map(str::trim).filter(|k| !k.is_empty()) {
            if let Some(existing) = self.ctx.repos.orders.find_order_by_idempotency(user_id, key).await? {
                return Ok(existing);
            }
        }
        if months < 1 {
            return Err(BrokerError::invalid("months must be at least 1"));
        }
        let inst = self.owned_instance(user_id, vps_id).await?;
        self.ensure_none_open(vps_id, ItemAction::Renew).await?;

        let monthly = if inst.monthly_price > 0 {
            inst.monthly_price
        } else {
            self.ctx.repos.catalog.get_package(inst.package_id).await?.monthly_price
        };
        let amount = monthly * i64::from(months);
        let mut spec = SpecDoc::new();
        spec.set("vps_id", vps_id)
            .set("duration_months", months)
            .set("renew_days", i64::from(months) * 30);
        let status = if self.ctx.realname.needs_review(user_id, realname_actions::RENEW_VPS).await? {
            OrderStatus::PendingReview
        } else {
            OrderStatus::PendingPayment
        };
        let item = OrderItem::draft(ItemAction::Renew, status, amount, spec);
        self.open_order("REN-", &inst, user_id, status, amount, item, idempotency_key).await
    }

    /// Free short extension for an instance about to expire.
    ///
    /// Allowed only inside the pre-expiry window and outside the cooldown;
    /// the order is approved and executed immediately.
    pub async fn create_emergency_renew_order(&self, user_id: Id, vps_id: Id) -> BrokerResult<Order> {
        self.ctx.realname.require_action(user_id, realname_actions::RENEW_VPS).await?;
        let policy = self.ctx.settings.emergency_renew().await;
        if !policy.enabled {
            return Err(BrokerError::forbidden("emergency renew is disabled"));
        }
        let inst = self.owned_instance(user_id, vps_id).await?;
        let now = Utc::now();
        if !policy.in_window(inst.expire_at, now) {
            return Err(BrokerError::forbidden("outside the emergency renew window"));
        }
        if policy.in_cooldown(inst.last_emergency_renew_at, now) {
            return Err(BrokerError::forbidden("emergency renew is cooling down"));
        }
        self.ensure_none_open(vps_id, ItemAction::EmergencyRenew).await?;

        let mut spec = SpecDoc::new();
        spec.set("vps_id", vps_id).set("renew_days", policy.renew_days);
        let item = OrderItem::draft(ItemAction::EmergencyRenew, OrderStatus::PendingReview, 0, spec);
        let order = self
            .open_order("EMR-", &inst, user_id, OrderStatus::PendingReview, 0, item, None)
            .await?;
        self.orders.approve_order(SYSTEM_ADMIN, order.id).await
    }

    // ============================================
    // RESIZE
    // ============================================

    async fn prepare_resize(
        &self,
        user_id: Id,
        vps_id: Id,
        req: &ResizeRequest,
    ) -> BrokerResult<(VpsInstance, CartSpec, ResizeQuote)> {
        let policy = self.ctx.settings.resize_policy().await;
        if !policy.enabled {
            return Err(BrokerError::ResizeDisabled);
        }
        let inst = self.owned_instance(user_id, vps_id).await?;
        let now = Utc::now();
        if inst.expire_at.map(|at| at <= now).unwrap_or(false) {
            return Err(BrokerError::forbidden("instance has expired"));
        }

        let catalog = &self.ctx.repos.catalog;
        let capabilities = self.ctx.settings.package_capabilities().await;
        let current_package = catalog.get_package(inst.package_id).await?;
        let target_package = if req.target_package_id > 0 && req.target_package_id != inst.package_id {
            catalog.get_package(req.target_package_id).await?
        } else {
            current_package.clone()
        };
        if !capabilities.resize_allowed(current_package.id) || !capabilities.resize_allowed(target_package.id) {
            return Err(BrokerError::ResizeDisabled);
        }
        let plan = catalog.get_plan_group(current_package.plan_group_id).await?;

        let current_spec: CartSpec = serde_json::from_value(inst.spec.to_value()).unwrap_or_default();
        let target_spec = match (&req.spec, req.reset_addons) {
            (Some(spec), _) => spec.clone(),
            (None, true) => CartSpec::default(),
            (None, false) => current_spec.clone(),
        };
        let quote = pricing::quote_resize(ResizeInputs {
            instance: &inst,
            current_package: &current_package,
            target_package: &target_package,
            plan: &plan,
            current_spec: &current_spec,
            target_spec: &target_spec,
            policy: &policy,
            now,
        })?;
        Ok((inst, target_spec, quote))
    }

    pub async fn quote_resize(&self, user_id: Id, vps_id: Id, req: &ResizeRequest) -> BrokerResult<ResizeQuote> {
        let (_, _, quote) = self.prepare_resize(user_id, vps_id, req).await?;
        Ok(quote)
    }

    /// Open a resize order.
    ///
    /// When nothing is owed the order is approved at once and its task
    /// runs (or waits for `scheduled_at`).
    pub async fn create_resize_order(
        &self,
        user_id: Id,
        vps_id: Id,
        req: ResizeRequest,
    ) -> BrokerResult<(Order, ResizeQuote)> {
        self.ctx.realname.require_action(user_id, realname_actions::RESIZE_VPS).await?;
        if self.ctx.repos.resize_tasks.has_open_task(vps_id).await?
            || !self
                .ctx
                .repos
                .orders
                .list_open_items_for_vps(vps_id, ItemAction::Resize)
                .await?
                .is_empty()
        {
            return Err(BrokerError::ResizeInProgress);
        }
        let scheduled_at = req.scheduled_at.filter(|at| *at > Utc::now());
        if scheduled_at.is_some() && !self.ctx.settings.resize_policy().await.scheduled_enabled {
            return Err(BrokerError::forbidden("scheduled resize is disabled"));
        }

        let (inst, target_spec, quote) = self.prepare_resize(user_id, vps_id, &req).await?;
        let mut spec = quote.to_spec(vps_id, &target_spec);
        if let Some(at) = scheduled_at {
            spec.set_time("scheduled_at", at);
        }
        let total = quote.order_total();
        let status = if total > 0 {
            OrderStatus::PendingPayment
        } else {
            OrderStatus::PendingReview
        };
        let item = OrderItem::draft(ItemAction::Resize, status, total, spec);
        let order = self.open_order("UPG-", &inst, user_id, status, total, item, None).await?;
        let order = if total > 0 {
            order
        } else {
            self.orders.approve_order(SYSTEM_ADMIN, order.id).await?
        };
        Ok((order, quote))
    }

    // ============================================
    // REFUND & DELETE
    // ============================================

    /// Open a refund order for an instance; returns the order and the
    /// amount that will be credited.
    pub async fn create_refund_order(&self, user_id: Id, vps_id: Id, reason: &str) -> BrokerResult<(Order, i64)> {
        let inst = self.owned_instance(user_id, vps_id).await?;
        if !self.ctx.settings.package_capabilities().await.refund_allowed(inst.package_id) {
            return Err(BrokerError::forbidden("refunds are disabled for this package"));
        }
        self.ensure_none_open(vps_id, ItemAction::Refund).await?;

        let policy = self.ctx.settings.refund_policy().await;
        let basis = if inst.monthly_price > 0 {
            inst.monthly_price
        } else {
            match self.ctx.repos.orders.get_item(inst.order_item_id).await {
                Ok(item) => item.amount,
                Err(_) => 0,
            }
        };
        let amount = pricing::refund_amount(&inst, basis, &policy, Utc::now());
        if amount <= 0 {
            return Err(BrokerError::forbidden("no refund is available for this instance"));
        }

        let mut spec = SpecDoc::new();
        spec.set("vps_id", vps_id)
            .set("refund_amount", amount)
            .set("refund_to_wallet", true)
            .set("reason", reason)
            .set("delete_on_approve", true);
        let item = OrderItem::draft(ItemAction::Refund, OrderStatus::PendingReview, -amount, spec);
        let order = self
            .open_order("REF-", &inst, user_id, OrderStatus::PendingReview, -amount, item, None)
            .await?;
        let order = if policy.requires_approval {
            order
        } else {
            self.orders.approve_order(SYSTEM_ADMIN, order.id).await?
        };
        Ok((order, amount))
    }

    /// Delete an instance on the admin's behalf, refunding it when
    /// `refund_on_admin_delete` is set.
    pub async fn create_admin_delete_order(&self, admin_id: Id, vps_id: Id) -> BrokerResult<Order> {
        let inst = self.ctx.repos.instances.get_instance(vps_id).await?;
        self.ensure_none_open(vps_id, ItemAction::AdminDelete).await?;
        let mut spec = SpecDoc::new();
        spec.set("vps_id", vps_id);
        let item = OrderItem::draft(ItemAction::AdminDelete, OrderStatus::PendingReview, 0, spec);
        let order = self
            .open_order("DEL-", &inst, inst.user_id, OrderStatus::PendingReview, 0, item, None)
            .await?;
        self.orders.approve_order(admin_id, order.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InstanceRepository, OrderRepository, ResizeTask, ResizeTaskRepository, ResizeTaskStatus, SettingsRepository};
    use crate::testing::TestBed;
    use chrono::Duration;

    #[tokio::test]
    async fn test_renew_order_prices_monthly() {
        let bed = TestBed::new().await;
        let inst = bed.seed_instance(1, Some(Utc::now() + Duration::days(3))).await;
        let order = bed.services.requests.create_renew_order(1, inst.id, 2, None).await.unwrap();
        assert!(order.order_no.starts_with("REN-1-"));
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert_eq!(order.total_amount, 2 * inst.monthly_price);

        let err = bed.services.requests.create_renew_order(1, inst.id, 1, None).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        let err = bed.services.requests.create_renew_order(2, inst.id, 1, None).await.unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }

    #[tokio::test]
    async fn test_emergency_renew_inside_window() {
        let bed = TestBed::new().await;
        bed.store.upsert_setting("emergency_renew_window_days", "7").await.unwrap();
        bed.store.upsert_setting("emergency_renew_renew_days", "1").await.unwrap();
        bed.store.upsert_setting("emergency_renew_interval_hours", "24").await.unwrap();
        let expire = Utc::now() + Duration::hours(48);
        let inst = bed.seed_instance(1, Some(expire)).await;

        let order = bed.services.requests.create_emergency_renew_order(1, inst.id).await.unwrap();
        assert_eq!(order.total_amount, 0);
        assert!(order.order_no.starts_with("EMR-"));
        let items = bed.store.list_items(order.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action, ItemAction::EmergencyRenew);

        let renewed = bed.store.get_instance(inst.id).await.unwrap();
        assert_eq!(renewed.expire_at, Some(expire + Duration::days(1)));
        assert!(renewed.last_emergency_renew_at.is_some());

        // the cooldown now applies
        let err = bed.services.requests.create_emergency_renew_order(1, inst.id).await.unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }

    #[tokio::test]
    async fn test_emergency_renew_outside_window_forbidden() {
        let bed = TestBed::new().await;
        let inst = bed.seed_instance(1, Some(Utc::now() + Duration::days(30))).await;
        let err = bed.services.requests.create_emergency_renew_order(1, inst.id).await.unwrap_err();
        assert_eq!(err.kind(), "forbidden");
        assert_eq!(bed.mock.call_count("renew_host"), 0);
    }

    #[tokio::test]
    async fn test_refund_order_on_monthly_price() {
        let bed = TestBed::new().await;
        bed.store.upsert_setting("refund_full_days", "1").await.unwrap();
        let inst = bed.seed_instance(1, Some(Utc::now() + Duration::days(30))).await;

        let (order, amount) = bed.services.requests.create_refund_order(1, inst.id, "changed mind").await.unwrap();
        assert_eq!(amount, 3000);
        assert_eq!(order.total_amount, -3000);
        assert!(order.order_no.starts_with("REF-"));
        assert_eq!(order.status, OrderStatus::PendingReview);
        // nothing is paid out before approval
        assert_eq!(bed.ctx.wallet.balance(1).await.unwrap(), 0);

        bed.services.orders.approve_order(5, order.id).await.unwrap();
        assert_eq!(bed.ctx.wallet.balance(1).await.unwrap(), 3000);
        assert!(bed.store.get_instance(inst.id).await.is_err());
    }

    #[tokio::test]
    async fn test_refund_without_review_is_approved() {
        let bed = TestBed::new().await;
        bed.store.upsert_setting("refund_requires_approval", "false").await.unwrap();
        let inst = bed.seed_instance(1, Some(Utc::now() + Duration::days(30))).await;

        let (order, amount) = bed.services.requests.create_refund_order(1, inst.id, "").await.unwrap();
        assert_eq!(order.status, OrderStatus::Active);
        assert_eq!(bed.ctx.wallet.balance(1).await.unwrap(), amount);
    }

    #[tokio::test]
    async fn test_resize_in_progress_guard() {
        let bed = TestBed::new().await;
        let inst = bed.seed_instance(1, Some(Utc::now() + Duration::days(20))).await;
        let now = Utc::now();
        let mut task = bed
            .store
            .create_task(ResizeTask {
                id: 0,
                vps_id: inst.id,
                order_id: 0,
                order_item_id: 0,
                status: ResizeTaskStatus::Pending,
                last_error: None,
                scheduled_at: None,
                started_at: None,
                finished_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        let req = ResizeRequest {
            spec: Some(CartSpec {
                add_cores: 1,
                ..Default::default()
            }),
            ..Default::default()
        };

        let err = bed.services.requests.create_resize_order(1, inst.id, req.clone()).await.unwrap_err();
        assert_eq!(err, BrokerError::ResizeInProgress);

        task.status = ResizeTaskStatus::Done;
        bed.store.save_task(&task).await.unwrap();
        let (order, quote) = bed.services.requests.create_resize_order(1, inst.id, req).await.unwrap();
        assert!(order.order_no.starts_with("UPG-"));
        assert!(quote.charge_amount > 0);
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert_eq!(order.total_amount, quote.charge_amount);
    }

    #[tokio::test]
    async fn test_same_plan_resize_rejected() {
        let bed = TestBed::new().await;
        let inst = bed.seed_instance(1, Some(Utc::now() + Duration::days(20))).await;
        let err = bed
            .services
            .requests
            .quote_resize(1, inst.id, &ResizeRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::ResizeSamePlan);
    }

    #[tokio::test]
    async fn test_approved_resize_runs_task() {
        let bed = TestBed::new().await;
        let inst = bed.seed_instance(1, Some(Utc::now() + Duration::days(20))).await;
        let req = ResizeRequest {
            spec: Some(CartSpec {
                add_cores: 1,
                ..Default::default()
            }),
            ..Default::default()
        };
        let (order, _) = bed.services.requests.create_resize_order(1, inst.id, req).await.unwrap();
        let approved = bed.services.orders.approve_order(4, order.id).await.unwrap();

        assert_eq!(approved.status, OrderStatus::Active);
        assert_eq!(bed.store.get_instance(inst.id).await.unwrap().cpu, inst.cpu + 1);
        let items = bed.store.list_items(order.id).await.unwrap();
        let task = bed.store.find_task_by_item(items[0].id).await.unwrap().unwrap();
        assert_eq!(task.status, ResizeTaskStatus::Done);
        assert!(task.started_at.is_some() && task.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_admin_delete_runs_immediately() {
        let bed = TestBed::new().await;
        let inst = bed.seed_instance(1, Some(Utc::now() + Duration::days(20))).await;
        let order = bed.services.requests.create_admin_delete_order(9, inst.id).await.unwrap();
        assert!(order.order_no.starts_with("DEL-1-"));
        assert_eq!(order.approved_by, Some(9));
        assert!(bed.store.get_instance(inst.id).await.is_err());
        assert_eq!(bed.mock.deleted_hosts().len(), 1);
    }
}
