//! # Order Service
//!
//! Purchase orders, admin review and the approved-order flow.
//!
//! ```text
//! create ──► pending_payment ──payment approved──► approved ──► provisioning ──► active
//!    │              └──user cancel──► canceled                       └──► failed
//!    └──review trigger──► pending_review ──approve──► approved
//!                                └──reject──► rejected
//! ```
//!
//! Approval runs every item: `create` items go to the provisioning worker,
//! `resize` items become [`ResizeTask`]s, everything else executes inline
//! through the [`ActionExecutor`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::actions::ActionExecutor;
use super::context::ServiceContext;
use super::events::event_types;
use super::notify::kinds;
use super::pricing;
use super::provisioning::ProvisionWorker;
use super::realname::actions as realname_actions;
use super::reconcile::{notify_outcome, reconcile_order};
use super::wallet::refs;
use crate::db::{
    CartSpec, Coupon, CouponKind, CouponRedemption, DatabaseError, Id, ItemAction, Order, OrderCreateExtras,
    OrderItem, OrderStatus, PaymentStatus, RedemptionStatus, ResizeTask, ResizeTaskStatus,
};
use crate::errors::{BrokerError, BrokerResult};
use crate::utils::{format_cents, order_number, truncate_string, SpecDoc};

pub const DEFAULT_CURRENCY: &str = "CNY";
const DEFAULT_TASK_BATCH: i64 = 20;
const ORDER_NO_ATTEMPTS: i64 = 5;

fn one() -> i32 {
    1
}

/// One purchase line: a package, an image and optional addons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub package_id: Id,
    pub system_id: Id,
    #[serde(default)]
    pub spec: CartSpec,
    #[serde(default = "one")]
    pub qty: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderOptions {
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub coupon_code: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl OrderOptions {
    fn currency(&self) -> String {
        self.currency
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CURRENCY)
            .to_uppercase()
    }

    fn idempotency_key(&self) -> Option<String> {
        self.idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
    }
}

/// Insert an order, moving the number forward a second on collision.
///
/// A conflict that turns out to be a concurrent use of the same
/// idempotency key returns the order that won.
pub(crate) async fn insert_order(
    ctx: &ServiceContext,
    prefix: &str,
    mut order: Order,
    items: Vec<OrderItem>,
    extras: OrderCreateExtras,
) -> BrokerResult<(Order, Vec<OrderItem>)> {
    let now = order.created_at;
    let mut attempt = 0;
    loop {
        order.order_no = order_number(prefix, order.user_id, now + Duration::seconds(attempt));
        match ctx
            .repos
            .orders
            .create_order(order.clone(), items.clone(), extras.clone())
            .await
        {
            Ok(created) => return Ok(created),
            Err(DatabaseError::Conflict(what)) => {
                if let Some(key) = order.idempotency_key.as_deref() {
                    if let Some(existing) = ctx.repos.orders.find_order_by_idempotency(order.user_id, key).await? {
                        let items = ctx.repos.orders.list_items(existing.id).await?;
                        return Ok((existing, items));
                    }
                }
                attempt += 1;
                if attempt >= ORDER_NO_ATTEMPTS {
                    return Err(BrokerError::conflict(what));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[derive(Clone)]
pub struct OrderService {
    ctx: ServiceContext,
    actions: ActionExecutor,
    worker: ProvisionWorker,
}

impl OrderService {
    pub fn new(ctx: ServiceContext, worker: ProvisionWorker) -> Self {
        Self {
            actions: ActionExecutor::new(ctx.clone()),
            worker,
            ctx,
        }
    }

    pub fn actions(&self) -> &ActionExecutor {
        &self.actions
    }

    pub fn worker(&self) -> &ProvisionWorker {
        &self.worker
    }

    // ============================================
    // CREATION
    // ============================================

    /// Create a purchase order from the user's cart and clear the cart.
    pub async fn create_order_from_cart(&self, user_id: Id, opts: &OrderOptions) -> BrokerResult<Order> {
        let cart = self.ctx.repos.carts.list_cart(user_id).await?;
        let lines = cart
            .into_iter()
            .map(|c| OrderLine {
                package_id: c.package_id,
                system_id: c.system_id,
                spec: c.spec,
                qty: c.qty,
            })
            .collect();
        self.create_purchase(user_id, lines, opts, true).await
    }

    pub async fn create_order_from_items(
        &self,
        user_id: Id,
        lines: Vec<OrderLine>,
        opts: &OrderOptions,
    ) -> BrokerResult<Order> {
        self.create_purchase(user_id, lines, opts, false).await
    }

    async fn create_purchase(
        &self,
        user_id: Id,
        lines: Vec<OrderLine>,
        opts: &OrderOptions,
        consume_cart: bool,
    ) -> BrokerResult<Order> {
        self.ctx.realname.require_action(user_id, realname_actions::PURCHASE_VPS).await?;

        let idempotency_key = opts.idempotency_key();
        if let Some(key) = idempotency_key.as_deref() {
            if let Some(existing) = self.ctx.repos.orders.find_order_by_idempotency(user_id, key).await? {
                info!("Order {} reused for idempotency key {}", existing.order_no, key);
                return Ok(existing);
            }
        }
        if lines.is_empty() {
            return Err(BrokerError::invalid("order has no items"));
        }

        let mut items = Vec::new();
        for line in &lines {
            items.extend(self.price_line(line).await?);
        }
        let subtotal: i64 = items.iter().map(|i| i.amount).sum();

        let now = Utc::now();
        let coupon = match opts.coupon_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => Some(self.resolve_coupon(user_id, code, subtotal, now).await?),
            None => None,
        };
        let discount = coupon.as_ref().map(|(_, d)| *d).unwrap_or(0);
        let total = (subtotal - discount).max(0);

        let reasons = self
            .review_reasons(user_id, total, coupon.as_ref().map(|(c, _)| c))
            .await?;
        let status = if reasons.is_empty() {
            OrderStatus::PendingPayment
        } else {
            OrderStatus::PendingReview
        };
        for item in items.iter_mut() {
            item.status = status;
        }

        let mut order = Order::draft(user_id, String::new(), status, &opts.currency());
        order.total_amount = total;
        order.coupon_id = coupon.as_ref().map(|(c, _)| c.id);
        order.coupon_discount = discount;
        order.idempotency_key = idempotency_key;
        if !reasons.is_empty() {
            order.pending_reason = Some(reasons.join(","));
        }
        let extras = OrderCreateExtras {
            consume_cart_of: consume_cart.then_some(user_id),
            redemption: coupon.as_ref().map(|(c, _)| CouponRedemption {
                id: 0,
                coupon_id: c.id,
                order_id: 0,
                user_id,
                status: RedemptionStatus::Pending,
                created_at: now,
            }),
        };

        let (order, items) = insert_order(&self.ctx, "ORD-", order, items, extras).await?;
        info!(
            "🧾 Order {} created for user {}: {} items, total {} {}",
            order.order_no,
            user_id,
            items.len(),
            order.total_amount,
            order.currency
        );
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

        if order.status == OrderStatus::PendingPayment && order.total_amount == 0 {
            info!("Order {} is free, approving", order.order_no);
            return self.approve_order(0, order.id).await;
        }
        Ok(order)
    }

    /// Price one line, expanded into `qty` single items.
    async fn price_line(&self, line: &OrderLine) -> BrokerResult<Vec<OrderItem>> {
        if line.package_id <= 0 || line.system_id <= 0 {
            return Err(BrokerError::invalid("package_id and system_id are required"));
        }
        if line.qty < 1 {
            return Err(BrokerError::invalid("qty must be at least 1"));
        }
        let catalog = &self.ctx.repos.catalog;
        let package = catalog.get_package(line.package_id).await?;
        if !package.active {
            return Err(BrokerError::invalid(format!("package {} is not on sale", package.id)));
        }
        let plan = catalog.get_plan_group(package.plan_group_id).await?;
        catalog.get_system_image(line.system_id).await?;
        let cycle = if line.spec.billing_cycle_id > 0 {
            Some(catalog.get_billing_cycle(line.spec.billing_cycle_id).await?)
        } else {
            None
        };
        let price = pricing::price_item(&package, &plan, cycle.as_ref(), &line.spec)?;

        let mut spec = SpecDoc::from_value(serde_json::to_value(&line.spec).unwrap_or_default());
        spec.set("duration_months", price.months);
        let mut item = OrderItem::draft(ItemAction::Create, OrderStatus::PendingPayment, price.amount, spec);
        item.package_id = package.id;
        item.system_id = line.system_id;
        item.goods_type_id = package.goods_type_id;
        item.duration_months = price.months;
        Ok(vec![item; line.qty as usize])
    }

    /// Validate a coupon code and compute its discount on `subtotal`.
    async fn resolve_coupon(
        &self,
        user_id: Id,
        code: &str,
        subtotal: i64,
        now: DateTime<Utc>,
    ) -> BrokerResult<(Coupon, i64)> {
        let coupons = &self.ctx.repos.coupons;
        let coupon = coupons
            .find_coupon(code)
            .await?
            .filter(|c| c.active)
            .ok_or_else(|| BrokerError::forbidden(format!("coupon {} is not valid", code)))?;
        if coupon.starts_at.map(|at| now < at).unwrap_or(false) || coupon.ends_at.map(|at| now > at).unwrap_or(false) {
            return Err(BrokerError::forbidden(format!("coupon {} is not valid now", code)));
        }
        if coupon.min_order_amount > 0 && subtotal < coupon.min_order_amount {
            return Err(BrokerError::forbidden(format!("coupon {} needs a larger order", code)));
        }
        if coupon.max_uses > 0 && coupons.count_redemptions(coupon.id, None).await? >= coupon.max_uses {
            return Err(BrokerError::forbidden(format!("coupon {} is used up", code)));
        }
        if coupon.per_user_limit > 0
            && coupons.count_redemptions(coupon.id, Some(user_id)).await? >= coupon.per_user_limit
        {
            return Err(BrokerError::forbidden(format!("coupon {} already used", code)));
        }
        let discount = match coupon.kind {
            CouponKind::Fixed => coupon.value,
            CouponKind::Percent => pricing::round_cents(subtotal as f64 * coupon.value as f64 / 10_000.0),
        };
        Ok((coupon, discount.clamp(0, subtotal.max(0))))
    }

    async fn review_reasons(&self, user_id: Id, total: i64, coupon: Option<&Coupon>) -> BrokerResult<Vec<&'static str>> {
        let policy = self.ctx.settings.review().await;
        let mut reasons = Vec::new();
        if policy.amount_threshold > 0 && total >= policy.amount_threshold {
            reasons.push("amount_threshold");
        }
        if policy.user_ids.contains(&user_id) || self.ctx.repos.users.requires_manual_review(user_id).await? {
            reasons.push("manual_review_user");
        }
        if coupon.map(|c| c.new_user_only).unwrap_or(false)
            && self.ctx.repos.orders.count_user_orders(user_id).await? > 0
        {
            reasons.push("new_user_coupon");
        }
        if self.ctx.realname.needs_review(user_id, realname_actions::PURCHASE_VPS).await? {
            reasons.push("realname_unverified");
        }
        Ok(reasons)
    }

    // ============================================
    // USER CANCEL
    // ============================================

    pub async fn cancel_order(&self, user_id: Id, order_id: Id) -> BrokerResult<Order> {
        let repos = &self.ctx.repos;
        let mut order = repos.orders.get_order(order_id).await?;
        if order.user_id != user_id {
            return Err(BrokerError::forbidden("order belongs to another user"));
        }
        if order.status != OrderStatus::PendingPayment {
            return Err(BrokerError::conflict(format!("order is {}", order.status)));
        }
        for mut item in repos.orders.list_items(order_id).await? {
            if item.status == OrderStatus::PendingPayment {
                item.status = OrderStatus::Canceled;
                repos.orders.save_item(&item).await?;
            }
        }
        order.status = OrderStatus::Canceled;
        repos.orders.save_order(&order).await?;
        repos.coupons.set_redemption_status(order_id, RedemptionStatus::Canceled).await?;
        info!("Order {} canceled by user {}", order.order_no, user_id);
        self.ctx.events.emit(order_id, event_types::ORDER_CANCELED, json!({})).await;
        Ok(order)
    }

    // ============================================
    // ADMIN REVIEW
    // ============================================

    /// Approve an order and run it.
    ///
    /// Already approved or running orders are returned unchanged.
    pub async fn approve_order(&self, admin_id: Id, order_id: Id) -> BrokerResult<Order> {
        let repos = &self.ctx.repos;
        let mut order = repos.orders.get_order(order_id).await?;
        match order.status {
            OrderStatus::PendingReview | OrderStatus::PendingPayment | OrderStatus::Rejected => {}
            OrderStatus::Approved | OrderStatus::Provisioning | OrderStatus::Active => return Ok(order),
            other => return Err(BrokerError::conflict(format!("order is {}", other))),
        }
        let items = repos.orders.list_items(order_id).await?;
        for item in items.iter().filter(|i| i.action == ItemAction::Resize) {
            let vps_id = item.spec.vps_id().unwrap_or(0);
            if repos.resize_tasks.find_task_by_item(item.id).await?.is_none()
                && repos.resize_tasks.has_open_task(vps_id).await?
            {
                return Err(BrokerError::ResizeInProgress);
            }
        }

        let now = Utc::now();
        order.status = OrderStatus::Approved;
        order.approved_by = Some(admin_id);
        order.approved_at = Some(now);
        order.rejected_reason = None;
        repos.orders.save_order(&order).await?;

        let mut due_tasks = Vec::new();
        let mut has_runnable = false;
        for mut item in items {
            if matches!(item.status, OrderStatus::Canceled | OrderStatus::Active) {
                continue;
            }
            item.status = OrderStatus::Approved;
            repos.orders.save_item(&item).await?;
            if item.action != ItemAction::Resize {
                has_runnable = true;
                continue;
            }
            let task = match repos.resize_tasks.find_task_by_item(item.id).await? {
                Some(task) => task,
                None => {
                    repos
                        .resize_tasks
                        .create_task(ResizeTask {
                            id: 0,
                            vps_id: item.spec.vps_id().unwrap_or(0),
                            order_id,
                            order_item_id: item.id,
                            status: ResizeTaskStatus::Pending,
                            last_error: None,
                            scheduled_at: item.spec.get_time("scheduled_at"),
                            started_at: None,
                            finished_at: None,
                            created_at: now,
                            updated_at: now,
                        })
                        .await?
                }
            };
            self.actions.credit_resize_refund(&order, &item).await?;
            if task.status == ResizeTaskStatus::Pending && task.scheduled_at.map(|at| at <= now).unwrap_or(true) {
                due_tasks.push(task);
            }
        }

        for mut payment in repos.payments.list_payments(order_id).await? {
            if matches!(payment.status, PaymentStatus::PendingPayment | PaymentStatus::PendingReview) {
                payment.status = PaymentStatus::Approved;
                payment.reviewed_by = Some(admin_id);
                repos.payments.save_payment(&payment).await?;
            }
        }
        repos.coupons.set_redemption_status(order_id, RedemptionStatus::Used).await?;

        info!("✅ Order {} approved by admin {}", order.order_no, admin_id);
        self.ctx
            .audit(admin_id, "order.approve", "order", order_id, json!({ "order_no": order.order_no }))
            .await;
        self.ctx
            .events
            .emit(order_id, event_types::ORDER_APPROVED, json!({ "admin_id": admin_id }))
            .await;
        self.ctx
            .notify(
                order.user_id,
                kinds::ORDER_APPROVED,
                "Order Approved",
                &format!(
                    "Order {} ({}) has been approved.",
                    order.order_no,
                    format_cents(order.total_amount, &order.currency)
                ),
            )
            .await;

        for task in due_tasks {
            self.execute_resize_task(task).await?;
        }
        if has_runnable {
            return self.provision_order(order_id).await;
        }
        Ok(repos.orders.get_order(order_id).await?)
    }

    pub async fn reject_order(&self, admin_id: Id, order_id: Id, reason: &str) -> BrokerResult<Order> {
        let repos = &self.ctx.repos;
        let mut order = repos.orders.get_order(order_id).await?;
        if !matches!(order.status, OrderStatus::PendingReview | OrderStatus::PendingPayment) {
            return Err(BrokerError::conflict(format!("order is {}", order.status)));
        }
        for mut item in repos.orders.list_items(order_id).await? {
            if item.status != OrderStatus::Canceled {
                item.status = OrderStatus::Rejected;
                repos.orders.save_item(&item).await?;
            }
        }
        for mut payment in repos.payments.list_payments(order_id).await? {
            if payment.status != PaymentStatus::Rejected {
                payment.status = PaymentStatus::Rejected;
                payment.reviewed_by = Some(admin_id);
                payment.review_reason = Some(reason.to_string());
                repos.payments.save_payment(&payment).await?;
            }
        }
        if order.total_amount > 0
            && self
                .ctx
                .wallet
                .has_movement(order.user_id, refs::ORDER_PAYMENT, order_id)
                .await?
        {
            self.ctx
                .wallet
                .credit(
                    order.user_id,
                    order.total_amount,
                    refs::ORDER_PAYMENT_REVERSAL,
                    order_id,
                    &format!("order {} rejected", order.order_no),
                )
                .await?;
        }

        order.status = OrderStatus::Rejected;
        order.rejected_reason = Some(reason.to_string());
        repos.orders.save_order(&order).await?;
        repos.coupons.set_redemption_status(order_id, RedemptionStatus::Rejected).await?;

        info!("⛔ Order {} rejected by admin {}: {}", order.order_no, admin_id, reason);
        self.ctx
            .audit(admin_id, "order.reject", "order", order_id, json!({ "reason": reason }))
            .await;
        self.ctx
            .events
            .emit(order_id, event_types::ORDER_REJECTED, json!({ "reason": reason }))
            .await;
        self.ctx
            .notify(
                order.user_id,
                kinds::ORDER_REJECTED,
                "Order Rejected",
                &format!("Order {} was rejected: {}", order.order_no, truncate_string(reason, 200)),
            )
            .await;
        Ok(order)
    }

    /// Re-run failed items of an order.
    pub async fn retry_provision(&self, admin_id: Id, order_id: Id) -> BrokerResult<Order> {
        let order = self.ctx.repos.orders.get_order(order_id).await?;
        if !matches!(order.status, OrderStatus::Failed | OrderStatus::Provisioning | OrderStatus::Approved) {
            return Err(BrokerError::conflict(format!("order is {}", order.status)));
        }
        self.ctx
            .audit(admin_id, "order.retry_provision", "order", order_id, json!({}))
            .await;
        self.provision_order(order_id).await
    }

    // ============================================
    // PROVISIONING
    // ============================================

    /// Start every runnable item of an approved order.
    ///
    /// Create items are handed to the worker; other actions run inline.
    /// Resize items are left to their tasks.
    pub async fn provision_order(&self, order_id: Id) -> BrokerResult<Order> {
        let repos = &self.ctx.repos;
        let mut order = repos.orders.get_order(order_id).await?;
        if !matches!(order.status, OrderStatus::Approved | OrderStatus::Provisioning | OrderStatus::Failed) {
            return Err(BrokerError::conflict(format!("order is {}", order.status)));
        }
        order.status = OrderStatus::Provisioning;
        repos.orders.save_order(&order).await?;
        self.ctx.events.emit(order_id, event_types::ORDER_PROVISIONING, json!({})).await;

        let (mut failed, mut pending) = (false, false);
        for mut item in repos.orders.list_items(order_id).await? {
            if matches!(item.status, OrderStatus::Active | OrderStatus::Rejected | OrderStatus::Canceled) {
                continue;
            }
            if item.action == ItemAction::Resize {
                match item.status {
                    OrderStatus::Failed => failed = true,
                    _ => pending = true,
                }
                continue;
            }

            item.status = OrderStatus::Provisioning;
            repos.orders.save_item(&item).await?;
            let result = match item.action {
                ItemAction::Create => self.worker.start_create_item(&order, &mut item).await,
                _ => self.actions.execute(&order, &item).await,
            };
            match result {
                Ok(()) if item.action == ItemAction::Create => pending = true,
                Ok(()) => {
                    item.status = OrderStatus::Active;
                    repos.orders.save_item(&item).await?;
                    self.ctx
                        .events
                        .emit(order_id, event_types::ITEM_ACTIVE, json!({ "item_id": item.id }))
                        .await;
                }
                Err(e) => {
                    warn!("Order {} item {} ({}) failed: {}", order.order_no, item.id, item.action, e);
                    failed = true;
                    item.status = OrderStatus::Failed;
                    repos.orders.save_item(&item).await?;
                    self.ctx
                        .events
                        .emit(
                            order_id,
                            event_types::ITEM_FAILED,
                            json!({ "item_id": item.id, "reason": e.to_string() }),
                        )
                        .await;
                }
            }
        }

        let mut order = repos.orders.get_order(order_id).await?;
        order.status = if failed {
            OrderStatus::Failed
        } else if pending {
            OrderStatus::Provisioning
        } else {
            OrderStatus::Active
        };
        repos.orders.save_order(&order).await?;
        let event = if failed {
            event_types::ORDER_FAILED
        } else {
            event_types::ORDER_COMPLETED
        };
        self.ctx.events.emit(order_id, event, json!({ "status": order.status })).await;
        notify_outcome(&self.ctx, &order).await;
        Ok(order)
    }

    /// Activate items whose instance already reports a ready status and
    /// recompute stuck orders. Returns how many orders changed status.
    pub async fn reconcile_provisioning_orders(&self, limit: i64) -> BrokerResult<usize> {
        let repos = &self.ctx.repos;
        let limit = if limit <= 0 { DEFAULT_TASK_BATCH } else { limit };
        let mut changed = 0;
        for order in repos.orders.list_orders_by_status(OrderStatus::Provisioning, limit).await? {
            for mut item in repos.orders.list_items(order.id).await? {
                if item.action != ItemAction::Create || item.status != OrderStatus::Provisioning {
                    continue;
                }
                let Some(inst) = repos.instances.find_instance_by_item(item.id).await? else {
                    continue;
                };
                if inst.status.is_ready() {
                    item.status = OrderStatus::Active;
                    item.automation_instance_id = Some(inst.automation_instance_id.clone());
                    repos.orders.save_item(&item).await?;
                    self.ctx
                        .events
                        .emit(order.id, event_types::ITEM_ACTIVE, json!({ "item_id": item.id }))
                        .await;
                }
            }
            if reconcile_order(&self.ctx, order.id).await? != order.status {
                changed += 1;
            }
        }
        Ok(changed)
    }

    // ============================================
    // RESIZE TASKS
    // ============================================

    /// Run due resize tasks; returns how many ran.
    pub async fn process_resize_tasks(&self, limit: i64) -> BrokerResult<usize> {
        let limit = if limit <= 0 { DEFAULT_TASK_BATCH } else { limit };
        let tasks = self.ctx.repos.resize_tasks.list_due_tasks(Utc::now(), limit).await?;
        let count = tasks.len();
        for task in tasks {
            let id = task.id;
            if let Err(e) = self.execute_resize_task(task).await {
                warn!("Resize task {} failed to run: {}", id, e);
            }
        }
        Ok(count)
    }

    /// Apply one resize task. Remote failures mark the task and item
    /// failed and leave the instance as it was.
    pub async fn execute_resize_task(&self, mut task: ResizeTask) -> BrokerResult<ResizeTask> {
        let repos = &self.ctx.repos;
        task.status = ResizeTaskStatus::Running;
        task.started_at = Some(Utc::now());
        repos.resize_tasks.save_task(&task).await?;

        let order = repos.orders.get_order(task.order_id).await?;
        let mut item = repos.orders.get_item(task.order_item_id).await?;
        item.status = OrderStatus::Provisioning;
        repos.orders.save_item(&item).await?;

        match self.actions.resize(&order, &item).await {
            Ok(()) => {
                item.status = OrderStatus::Active;
                task.status = ResizeTaskStatus::Done;
                task.last_error = None;
                self.ctx
                    .events
                    .emit(order.id, event_types::ITEM_ACTIVE, json!({ "item_id": item.id }))
                    .await;
            }
            Err(e) => {
                warn!("Resize task {} for VPS {} failed: {}", task.id, task.vps_id, e);
                item.status = OrderStatus::Failed;
                task.status = ResizeTaskStatus::Failed;
                task.last_error = Some(e.to_string());
                self.ctx
                    .events
                    .emit(
                        order.id,
                        event_types::ITEM_FAILED,
                        json!({ "item_id": item.id, "reason": e.to_string() }),
                    )
                    .await;
            }
        }
        repos.orders.save_item(&item).await?;
        task.finished_at = Some(Utc::now());
        repos.resize_tasks.save_task(&task).await?;
        reconcile_order(&self.ctx, order.id).await?;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        BillingCycle, CartRepository, CouponRepository, EventRepository, OrderRepository, SettingsRepository,
    };
    use crate::testing::TestBed;

    fn line(bed: &TestBed, qty: i32) -> OrderLine {
        OrderLine {
            package_id: bed.package.id,
            system_id: bed.image.id,
            spec: CartSpec::default(),
            qty,
        }
    }

    #[tokio::test]
    async fn test_cart_order_prices_expands_and_clears_cart() {
        let bed = TestBed::new().await;
        bed.add_to_cart(1, 2).await;

        let order = bed.services.orders.create_order_from_cart(1, &OrderOptions::default()).await.unwrap();
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert_eq!(order.total_amount, 2 * bed.package.monthly_price);
        assert_eq!(order.currency, "CNY");
        assert!(order.order_no.starts_with("ORD-1-"));
        let items = bed.store.list_items(order.id).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.qty == 1 && i.action == ItemAction::Create));
        assert!(bed.store.list_cart(1).await.unwrap().is_empty());

        let events = bed.store.list_events(order.id).await.unwrap();
        assert_eq!(events[0].event_type, "order.created");
        assert_eq!(events[0].data, json!({"status": "pending_payment", "total": 2 * bed.package.monthly_price}));
    }

    #[tokio::test]
    async fn test_billing_cycle_sets_price_and_duration() {
        let bed = TestBed::new().await;
        let cycle = bed.store.insert_billing_cycle(BillingCycle {
            id: 0,
            months: 3,
            multiplier_bp: 27_000,
            min_qty: 1,
            max_qty: 4,
            active: true,
        });
        let mut quarterly = line(&bed, 1);
        quarterly.spec.billing_cycle_id = cycle.id;
        quarterly.spec.cycle_qty = 1;

        let order = bed
            .services
            .orders
            .create_order_from_items(1, vec![quarterly], &OrderOptions::default())
            .await
            .unwrap();
        assert_eq!(order.total_amount, bed.package.monthly_price * 27 / 10);
        let item = bed.store.list_items(order.id).await.unwrap().remove(0);
        assert_eq!(item.duration_months, 3);
    }

    #[tokio::test]
    async fn test_idempotent_creation_returns_same_order() {
        let bed = TestBed::new().await;
        let opts = OrderOptions {
            idempotency_key: Some("k-1".into()),
            ..Default::default()
        };
        let first = bed.services.orders.create_order_from_items(1, vec![line(&bed, 1)], &opts).await.unwrap();
        let second = bed.services.orders.create_order_from_items(1, vec![line(&bed, 3)], &opts).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(bed.store.list_items(first.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_second_orders_get_distinct_numbers() {
        let bed = TestBed::new().await;
        let a = bed.services.orders.create_order_from_items(1, vec![line(&bed, 1)], &OrderOptions::default()).await.unwrap();
        let b = bed.services.orders.create_order_from_items(1, vec![line(&bed, 1)], &OrderOptions::default()).await.unwrap();
        assert_ne!(a.order_no, b.order_no);
    }

    #[tokio::test]
    async fn test_empty_and_invalid_lines_rejected() {
        let bed = TestBed::new().await;
        let err = bed.services.orders.create_order_from_cart(1, &OrderOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");

        let mut bad = line(&bed, 1);
        bad.spec.add_cores = -1;
        let err = bed.services.orders.create_order_from_items(1, vec![bad], &OrderOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn test_amount_threshold_sends_order_to_review() {
        let bed = TestBed::new().await;
        bed.store.upsert_setting("order_review_amount_threshold", "500").await.unwrap();
        let order = bed.services.orders.create_order_from_items(1, vec![line(&bed, 1)], &OrderOptions::default()).await.unwrap();

        assert_eq!(order.status, OrderStatus::PendingReview);
        assert_eq!(order.pending_reason.as_deref(), Some("amount_threshold"));
        let items = bed.store.list_items(order.id).await.unwrap();
        assert!(items.iter().all(|i| i.status == OrderStatus::PendingReview));
        let events = bed.store.list_events(order.id).await.unwrap();
        assert_eq!(events[1].event_type, "order.pending_review");
    }

    #[tokio::test]
    async fn test_coupon_discount_is_capped_and_limits_apply() {
        let bed = TestBed::new().await;
        bed.store.insert_coupon(Coupon {
            id: 0,
            code: "BIG".into(),
            kind: CouponKind::Fixed,
            value: 5_000,
            min_order_amount: 0,
            max_uses: 1,
            per_user_limit: 0,
            new_user_only: false,
            active: true,
            starts_at: None,
            ends_at: None,
        });
        let opts = OrderOptions {
            coupon_code: Some("BIG".into()),
            ..Default::default()
        };
        let order = bed.services.orders.create_order_from_items(1, vec![line(&bed, 1)], &opts).await.unwrap();
        assert_eq!(order.coupon_discount, bed.package.monthly_price);
        assert_eq!(order.total_amount, 0);
        // free orders are approved straight away
        assert_ne!(order.status, OrderStatus::PendingPayment);
        assert_eq!(bed.store.count_redemptions(order.coupon_id.unwrap(), None).await.unwrap(), 1);
        assert_eq!(bed.store.redemptions_for(order.id)[0].user_id, 1);

        let err = bed.services.orders.create_order_from_items(2, vec![line(&bed, 1)], &opts).await.unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }

    #[tokio::test]
    async fn test_cancel_requires_owner_and_pending_payment() {
        let bed = TestBed::new().await;
        let order = bed.services.orders.create_order_from_items(1, vec![line(&bed, 1)], &OrderOptions::default()).await.unwrap();

        let err = bed.services.orders.cancel_order(2, order.id).await.unwrap_err();
        assert_eq!(err.kind(), "forbidden");
        let canceled = bed.services.orders.cancel_order(1, order.id).await.unwrap();
        assert_eq!(canceled.status, OrderStatus::Canceled);
        assert!(bed.store.list_items(order.id).await.unwrap().iter().all(|i| i.status == OrderStatus::Canceled));
        let err = bed.services.orders.cancel_order(1, order.id).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn test_reject_reverses_wallet_payment() {
        let bed = TestBed::new().await;
        bed.ctx.wallet.credit(1, 5_000, "topup", 1, "seed").await.unwrap();
        bed.store.upsert_setting("order_review_amount_threshold", "1").await.unwrap();
        let order = bed.services.orders.create_order_from_items(1, vec![line(&bed, 1)], &OrderOptions::default()).await.unwrap();
        bed.ctx
            .wallet
            .debit(1, order.total_amount, refs::ORDER_PAYMENT, order.id, "pay")
            .await
            .unwrap();

        let rejected = bed.services.orders.reject_order(9, order.id, "fraud").await.unwrap();
        assert_eq!(rejected.status, OrderStatus::Rejected);
        assert_eq!(rejected.rejected_reason.as_deref(), Some("fraud"));
        assert_eq!(bed.ctx.wallet.balance(1).await.unwrap(), 5_000);
        assert!(bed.store.list_items(order.id).await.unwrap().iter().all(|i| i.status == OrderStatus::Rejected));
        assert_eq!(bed.sink.kinds_for(1), vec![kinds::ORDER_REJECTED.to_string()]);
    }

    #[tokio::test]
    async fn test_approve_runs_inline_actions_and_completes() {
        let bed = TestBed::new().await;
        let inst = bed.seed_instance(1, Some(Utc::now() + Duration::days(5))).await;
        let mut spec = SpecDoc::new();
        spec.set("vps_id", inst.id).set("duration_months", 1);
        let (order, _) = bed.seed_order_with(1, OrderStatus::PendingReview, ItemAction::Renew, spec).await;

        let approved = bed.services.orders.approve_order(7, order.id).await.unwrap();
        assert_eq!(approved.status, OrderStatus::Active);
        assert_eq!(approved.approved_by, Some(7));
        let types: Vec<String> = bed
            .store
            .list_events(order.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert!(types.contains(&"order.approved".to_string()));
        assert!(types.contains(&"order.item.active".to_string()));
        assert_eq!(types.last().map(String::as_str), Some("order.completed"));
    }

    #[tokio::test]
    async fn test_failed_inline_action_fails_order() {
        let bed = TestBed::new().await;
        let inst = bed.seed_instance(1, Some(Utc::now() + Duration::days(5))).await;
        bed.mock.fail_with("renew_host", crate::automation::AutomationError::Upstream("down".into()));
        let mut spec = SpecDoc::new();
        spec.set("vps_id", inst.id);
        let (order, items) = bed.seed_order_with(1, OrderStatus::PendingReview, ItemAction::Renew, spec).await;

        let approved = bed.services.orders.approve_order(7, order.id).await.unwrap();
        assert_eq!(approved.status, OrderStatus::Failed);
        assert_eq!(bed.store.get_item(items[0].id).await.unwrap().status, OrderStatus::Failed);
        assert_eq!(bed.sink.kinds_for(1).last().map(String::as_str), Some(kinds::PROVISION_FAILED));
        let events = bed.store.list_events(order.id).await.unwrap();
        assert_eq!(events.last().map(|e| e.event_type.as_str()), Some("order.failed"));
    }
}
