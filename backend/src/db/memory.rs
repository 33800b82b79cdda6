//! # In-Memory Store
//!
//! A single-process implementation of every repository contract, selected
//! with `STORAGE_BACKEND=memory` and used by the test suites.
//!
//! All state lives behind one mutex so each trait call is atomic, which
//! gives the same guarantees the Postgres store gets from transactions:
//!
//! - `append_event` assigns `seq = max + 1` under the lock
//! - wallet adjustments check and apply the balance in one step
//! - order creation inserts items, clears the cart and records the coupon
//!   redemption together
//!
//! The lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::models::*;
use super::repos::*;
use super::DatabaseError;

#[derive(Default)]
struct State {
    next_id: Id,
    orders: Vec<Order>,
    items: Vec<OrderItem>,
    payments: Vec<OrderPayment>,
    events: Vec<OrderEvent>,
    instances: Vec<VpsInstance>,
    jobs: Vec<ProvisionJob>,
    resize_tasks: Vec<ResizeTask>,
    automation_logs: Vec<AutomationLog>,
    balances: HashMap<Id, i64>,
    wallet_txs: Vec<WalletTransaction>,
    settings: Vec<Setting>,
    goods_types: Vec<GoodsType>,
    packages: Vec<Package>,
    plan_groups: Vec<PlanGroup>,
    billing_cycles: Vec<BillingCycle>,
    system_images: Vec<SystemImage>,
    cart: Vec<CartItem>,
    coupons: Vec<Coupon>,
    redemptions: Vec<CouponRedemption>,
    manual_review: HashMap<Id, bool>,
    realname_verified: HashMap<Id, bool>,
    task_runs: Vec<ScheduledTaskRun>,
    audit: Vec<AuditLog>,
    sync_logs: Vec<DateTime<Utc>>,
}

impl State {
    fn id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }
}

/// Mutex-guarded store implementing every repository trait.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn not_found(what: &str, id: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::NotFound(format!("{} {}", what, id))
}

fn is_open(status: ItemStatus) -> bool {
    matches!(
        status,
        OrderStatus::PendingPayment
            | OrderStatus::PendingReview
            | OrderStatus::Approved
            | OrderStatus::Provisioning
    )
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test must not wedge every later call.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ============================================
    // SEEDING (catalog and collaborators)
    // ============================================

    pub fn insert_goods_type(&self, mut goods_type: GoodsType) -> GoodsType {
        let mut state = self.lock();
        if goods_type.id <= 0 {
            goods_type.id = state.id();
        }
        state.goods_types.push(goods_type.clone());
        goods_type
    }

    pub fn insert_package(&self, mut package: Package) -> Package {
        let mut state = self.lock();
        if package.id <= 0 {
            package.id = state.id();
        }
        state.packages.push(package.clone());
        package
    }

    pub fn insert_plan_group(&self, mut group: PlanGroup) -> PlanGroup {
        let mut state = self.lock();
        if group.id <= 0 {
            group.id = state.id();
        }
        state.plan_groups.push(group.clone());
        group
    }

    pub fn insert_billing_cycle(&self, mut cycle: BillingCycle) -> BillingCycle {
        let mut state = self.lock();
        if cycle.id <= 0 {
            cycle.id = state.id();
        }
        state.billing_cycles.push(cycle.clone());
        cycle
    }

    pub fn insert_system_image(&self, mut image: SystemImage) -> SystemImage {
        let mut state = self.lock();
        if image.id <= 0 {
            image.id = state.id();
        }
        state.system_images.push(image.clone());
        image
    }

    pub fn add_cart_item(&self, mut item: CartItem) -> CartItem {
        let mut state = self.lock();
        if item.id <= 0 {
            item.id = state.id();
        }
        state.cart.push(item.clone());
        item
    }

    pub fn insert_coupon(&self, mut coupon: Coupon) -> Coupon {
        let mut state = self.lock();
        if coupon.id <= 0 {
            coupon.id = state.id();
        }
        state.coupons.push(coupon.clone());
        coupon
    }

    pub fn set_user_flags(&self, user_id: Id, manual_review: bool, realname_verified: bool) {
        let mut state = self.lock();
        state.manual_review.insert(user_id, manual_review);
        state.realname_verified.insert(user_id, realname_verified);
    }

    pub fn record_sync_log(&self, at: DateTime<Utc>) {
        self.lock().sync_logs.push(at);
    }

    /// Redemptions attached to an order, for inspection.
    pub fn redemptions_for(&self, order_id: Id) -> Vec<CouponRedemption> {
        self.lock()
            .redemptions
            .iter()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect()
    }

    pub fn audit_entries(&self) -> Vec<AuditLog> {
        self.lock().audit.clone()
    }
}

// ============================================
// ORDERS
// ============================================

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn create_order(
        &self,
        mut order: Order,
        items: Vec<OrderItem>,
        extras: OrderCreateExtras,
    ) -> DbResult<(Order, Vec<OrderItem>)> {
        let mut state = self.lock();

        if state.orders.iter().any(|o| o.order_no == order.order_no) {
            return Err(DatabaseError::Conflict(format!("order_no {}", order.order_no)));
        }
        if let Some(key) = order.idempotency_key.as_deref() {
            if state
                .orders
                .iter()
                .any(|o| o.user_id == order.user_id && o.idempotency_key.as_deref() == Some(key))
            {
                return Err(DatabaseError::Conflict(format!("idempotency key {}", key)));
            }
        }

        order.id = state.id();
        let mut created = Vec::with_capacity(items.len());
        for mut item in items {
            item.id = state.id();
            item.order_id = order.id;
            created.push(item);
        }

        if let Some(user_id) = extras.consume_cart_of {
            state.cart.retain(|c| c.user_id != user_id);
        }
        if let Some(mut redemption) = extras.redemption {
            redemption.id = state.id();
            redemption.order_id = order.id;
            state.redemptions.push(redemption);
        }

        state.orders.push(order.clone());
        state.items.extend(created.iter().cloned());
        debug!("Created order {} with {} items", order.id, created.len());
        Ok((order, created))
    }

    async fn get_order(&self, id: Id) -> DbResult<Order> {
        self.lock()
            .orders
            .iter()
            .find(|o| o.id == id)
            .cloned()
            .ok_or_else(|| not_found("order", id))
    }

    async fn find_order_by_idempotency(&self, user_id: Id, key: &str) -> DbResult<Option<Order>> {
        Ok(self
            .lock()
            .orders
            .iter()
            .find(|o| o.user_id == user_id && o.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn save_order(&self, order: &Order) -> DbResult<()> {
        let mut state = self.lock();
        let slot = state
            .orders
            .iter_mut()
            .find(|o| o.id == order.id)
            .ok_or_else(|| not_found("order", order.id))?;
        *slot = order.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn list_orders_by_status(&self, status: OrderStatus, limit: i64) -> DbResult<Vec<Order>> {
        Ok(self
            .lock()
            .orders
            .iter()
            .filter(|o| o.status == status)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_user_orders(&self, user_id: Id) -> DbResult<i64> {
        Ok(self
            .lock()
            .orders
            .iter()
            .filter(|o| {
                o.user_id == user_id
                    && !matches!(o.status, OrderStatus::Canceled | OrderStatus::Rejected)
            })
            .count() as i64)
    }

    async fn list_items(&self, order_id: Id) -> DbResult<Vec<OrderItem>> {
        Ok(self
            .lock()
            .items
            .iter()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn get_item(&self, id: Id) -> DbResult<OrderItem> {
        self.lock()
            .items
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| not_found("order item", id))
    }

    async fn save_item(&self, item: &OrderItem) -> DbResult<()> {
        let mut state = self.lock();
        let slot = state
            .items
            .iter_mut()
            .find(|i| i.id == item.id)
            .ok_or_else(|| not_found("order item", item.id))?;
        *slot = item.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn list_open_items_for_vps(&self, vps_id: Id, action: ItemAction) -> DbResult<Vec<OrderItem>> {
        Ok(self
            .lock()
            .items
            .iter()
            .filter(|i| i.action == action && i.spec.vps_id() == Some(vps_id) && is_open(i.status))
            .cloned()
            .collect())
    }
}

// ============================================
// PAYMENTS & EVENTS
// ============================================

#[async_trait]
impl PaymentRepository for MemoryStore {
    async fn create_payment(&self, mut payment: OrderPayment) -> DbResult<OrderPayment> {
        let mut state = self.lock();
        if !payment.trade_no.is_empty() && state.payments.iter().any(|p| p.trade_no == payment.trade_no) {
            return Err(DatabaseError::Conflict(format!("trade_no {}", payment.trade_no)));
        }
        if let Some(key) = payment.idempotency_key.as_deref() {
            if state
                .payments
                .iter()
                .any(|p| p.order_id == payment.order_id && p.idempotency_key.as_deref() == Some(key))
            {
                return Err(DatabaseError::Conflict(format!("payment idempotency key {}", key)));
            }
        }
        payment.id = state.id();
        state.payments.push(payment.clone());
        Ok(payment)
    }

    async fn get_payment(&self, id: Id) -> DbResult<OrderPayment> {
        self.lock()
            .payments
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| not_found("payment", id))
    }

    async fn find_payment_by_idempotency(&self, order_id: Id, key: &str) -> DbResult<Option<OrderPayment>> {
        Ok(self
            .lock()
            .payments
            .iter()
            .find(|p| p.order_id == order_id && p.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn find_payment_by_trade_no(&self, trade_no: &str) -> DbResult<Option<OrderPayment>> {
        Ok(self
            .lock()
            .payments
            .iter()
            .find(|p| p.trade_no == trade_no)
            .cloned())
    }

    async fn list_payments(&self, order_id: Id) -> DbResult<Vec<OrderPayment>> {
        Ok(self
            .lock()
            .payments
            .iter()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn save_payment(&self, payment: &OrderPayment) -> DbResult<()> {
        let mut state = self.lock();
        let slot = state
            .payments
            .iter_mut()
            .find(|p| p.id == payment.id)
            .ok_or_else(|| not_found("payment", payment.id))?;
        *slot = payment.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl EventRepository for MemoryStore {
    async fn append_event(&self, order_id: Id, event_type: &str, data: serde_json::Value) -> DbResult<OrderEvent> {
        let mut state = self.lock();
        let last = state
            .events
            .iter()
            .filter(|e| e.order_id == order_id)
            .max_by_key(|e| e.seq)
            .map(|e| (e.seq, e.created_at));

        let mut created_at = Utc::now();
        if let Some((_, prev)) = last {
            if created_at <= prev {
                created_at = prev + Duration::microseconds(1);
            }
        }

        let event = OrderEvent {
            id: state.id(),
            order_id,
            seq: last.map(|(seq, _)| seq + 1).unwrap_or(1),
            event_type: event_type.to_string(),
            data,
            created_at,
        };
        state.events.push(event.clone());
        Ok(event)
    }

    async fn list_events(&self, order_id: Id) -> DbResult<Vec<OrderEvent>> {
        let mut events: Vec<OrderEvent> = self
            .lock()
            .events
            .iter()
            .filter(|e| e.order_id == order_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }
}

// ============================================
// INSTANCES, JOBS & RESIZE TASKS
// ============================================

#[async_trait]
impl InstanceRepository for MemoryStore {
    async fn create_instance(&self, mut instance: VpsInstance) -> DbResult<VpsInstance> {
        let mut state = self.lock();
        if instance.id <= 0 {
            instance.id = state.id();
        }
        state.instances.push(instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, id: Id) -> DbResult<VpsInstance> {
        self.lock()
            .instances
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| not_found("vps instance", id))
    }

    async fn find_instance_by_item(&self, order_item_id: Id) -> DbResult<Option<VpsInstance>> {
        Ok(self
            .lock()
            .instances
            .iter()
            .find(|i| i.order_item_id == order_item_id)
            .cloned())
    }

    async fn save_instance(&self, instance: &VpsInstance) -> DbResult<()> {
        let mut state = self.lock();
        let slot = state
            .instances
            .iter_mut()
            .find(|i| i.id == instance.id)
            .ok_or_else(|| not_found("vps instance", instance.id))?;
        *slot = instance.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_instance(&self, id: Id) -> DbResult<()> {
        let mut state = self.lock();
        let before = state.instances.len();
        state.instances.retain(|i| i.id != id);
        if state.instances.len() == before {
            return Err(not_found("vps instance", id));
        }
        Ok(())
    }

    async fn list_expiring(&self, before: DateTime<Utc>) -> DbResult<Vec<VpsInstance>> {
        Ok(self
            .lock()
            .instances
            .iter()
            .filter(|i| i.expire_at.map(|at| at <= before).unwrap_or(false))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ProvisionJobRepository for MemoryStore {
    async fn upsert_job(&self, mut job: ProvisionJob) -> DbResult<ProvisionJob> {
        let mut state = self.lock();
        if let Some(existing) = state
            .jobs
            .iter_mut()
            .find(|j| j.order_item_id == job.order_item_id)
        {
            job.id = existing.id;
            job.created_at = existing.created_at;
            *existing = job.clone();
            return Ok(job);
        }
        job.id = state.id();
        state.jobs.push(job.clone());
        Ok(job)
    }

    async fn list_due_jobs(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<ProvisionJob>> {
        let mut due: Vec<ProvisionJob> = self
            .lock()
            .jobs
            .iter()
            .filter(|j| j.status != JobStatus::Done && j.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|j| j.id);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn save_job(&self, job: &ProvisionJob) -> DbResult<()> {
        let mut state = self.lock();
        let slot = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job.id)
            .ok_or_else(|| not_found("provision job", job.id))?;
        *slot = job.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn find_job_by_item(&self, order_item_id: Id) -> DbResult<Option<ProvisionJob>> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .find(|j| j.order_item_id == order_item_id)
            .cloned())
    }
}

#[async_trait]
impl ResizeTaskRepository for MemoryStore {
    async fn create_task(&self, mut task: ResizeTask) -> DbResult<ResizeTask> {
        let mut state = self.lock();
        task.id = state.id();
        state.resize_tasks.push(task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: Id) -> DbResult<ResizeTask> {
        self.lock()
            .resize_tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| not_found("resize task", id))
    }

    async fn has_open_task(&self, vps_id: Id) -> DbResult<bool> {
        Ok(self.lock().resize_tasks.iter().any(|t| {
            t.vps_id == vps_id
                && matches!(t.status, ResizeTaskStatus::Pending | ResizeTaskStatus::Running)
        }))
    }

    async fn list_due_tasks(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<ResizeTask>> {
        let mut due: Vec<ResizeTask> = self
            .lock()
            .resize_tasks
            .iter()
            .filter(|t| {
                t.status == ResizeTaskStatus::Pending
                    && t.scheduled_at.map(|at| at <= now).unwrap_or(true)
            })
            .cloned()
            .collect();
        due.sort_by_key(|t| t.id);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn find_task_by_item(&self, order_item_id: Id) -> DbResult<Option<ResizeTask>> {
        Ok(self
            .lock()
            .resize_tasks
            .iter()
            .find(|t| t.order_item_id == order_item_id)
            .cloned())
    }

    async fn save_task(&self, task: &ResizeTask) -> DbResult<()> {
        let mut state = self.lock();
        let slot = state
            .resize_tasks
            .iter_mut()
            .find(|t| t.id == task.id)
            .ok_or_else(|| not_found("resize task", task.id))?;
        *slot = task.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl AutomationLogRepository for MemoryStore {
    async fn create_log(&self, mut log: AutomationLog) -> DbResult<()> {
        let mut state = self.lock();
        log.id = state.id();
        state.automation_logs.push(log);
        Ok(())
    }

    async fn purge_logs_before(&self, before: DateTime<Utc>) -> DbResult<u64> {
        let mut state = self.lock();
        let len = state.automation_logs.len();
        state.automation_logs.retain(|l| l.created_at >= before);
        Ok((len - state.automation_logs.len()) as u64)
    }

    async fn list_logs(&self, order_id: Option<Id>, limit: i64) -> DbResult<Vec<AutomationLog>> {
        Ok(self
            .lock()
            .automation_logs
            .iter()
            .rev()
            .filter(|l| order_id.map(|id| l.order_id == id).unwrap_or(true))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

// ============================================
// WALLET
// ============================================

#[async_trait]
impl WalletRepository for MemoryStore {
    async fn adjust(&self, movement: WalletMovement) -> DbResult<WalletAdjustment> {
        let mut state = self.lock();
        let balance = state.balances.get(&movement.user_id).copied().unwrap_or(0);

        let seen = state.wallet_txs.iter().any(|t| {
            t.user_id == movement.user_id
                && t.ref_type == movement.ref_type
                && t.ref_id == movement.ref_id
        });
        if seen {
            return Ok(WalletAdjustment { applied: false, balance });
        }

        let next = balance + movement.amount;
        if next < 0 {
            return Err(DatabaseError::InsufficientBalance {
                available: balance,
                requested: -movement.amount,
            });
        }

        let tx = WalletTransaction {
            id: state.id(),
            user_id: movement.user_id,
            amount: movement.amount,
            tx_type: movement.tx_type,
            ref_type: movement.ref_type,
            ref_id: movement.ref_id,
            note: movement.note,
            created_at: Utc::now(),
        };
        state.wallet_txs.push(tx);
        state.balances.insert(movement.user_id, next);
        Ok(WalletAdjustment { applied: true, balance: next })
    }

    async fn get_balance(&self, user_id: Id) -> DbResult<i64> {
        Ok(self.lock().balances.get(&user_id).copied().unwrap_or(0))
    }

    async fn has_transaction(&self, user_id: Id, ref_type: &str, ref_id: Id) -> DbResult<bool> {
        Ok(self
            .lock()
            .wallet_txs
            .iter()
            .any(|t| t.user_id == user_id && t.ref_type == ref_type && t.ref_id == ref_id))
    }

    async fn list_transactions(&self, user_id: Id) -> DbResult<Vec<WalletTransaction>> {
        Ok(self
            .lock()
            .wallet_txs
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }
}

// ============================================
// SETTINGS, CATALOG & COLLABORATORS
// ============================================

#[async_trait]
impl SettingsRepository for MemoryStore {
    async fn get_setting(&self, key: &str) -> DbResult<Option<String>> {
        Ok(self
            .lock()
            .settings
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.value.clone()))
    }

    async fn upsert_setting(&self, key: &str, value: &str) -> DbResult<()> {
        let mut state = self.lock();
        let now = Utc::now();
        match state.settings.iter_mut().find(|s| s.key == key) {
            Some(slot) => {
                slot.value = value.to_string();
                slot.updated_at = now;
            }
            None => state.settings.push(Setting {
                key: key.to_string(),
                value: value.to_string(),
                updated_at: now,
            }),
        }
        Ok(())
    }

    async fn list_settings(&self) -> DbResult<Vec<Setting>> {
        let mut settings = self.lock().settings.clone();
        settings.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(settings)
    }
}

#[async_trait]
impl CatalogRepository for MemoryStore {
    async fn get_goods_type(&self, id: Id) -> DbResult<GoodsType> {
        self.lock()
            .goods_types
            .iter()
            .find(|g| g.id == id)
            .cloned()
            .ok_or_else(|| not_found("goods type", id))
    }

    async fn list_goods_types(&self) -> DbResult<Vec<GoodsType>> {
        let mut all = self.lock().goods_types.clone();
        all.sort_by_key(|g| (g.sort_order, g.id));
        Ok(all)
    }

    async fn get_package(&self, id: Id) -> DbResult<Package> {
        self.lock()
            .packages
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| not_found("package", id))
    }

    async fn get_plan_group(&self, id: Id) -> DbResult<PlanGroup> {
        self.lock()
            .plan_groups
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| not_found("plan group", id))
    }

    async fn get_billing_cycle(&self, id: Id) -> DbResult<BillingCycle> {
        self.lock()
            .billing_cycles
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| not_found("billing cycle", id))
    }

    async fn get_system_image(&self, id: Id) -> DbResult<SystemImage> {
        self.lock()
            .system_images
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| not_found("system image", id))
    }
}

#[async_trait]
impl CartRepository for MemoryStore {
    async fn list_cart(&self, user_id: Id) -> DbResult<Vec<CartItem>> {
        Ok(self
            .lock()
            .cart
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CouponRepository for MemoryStore {
    async fn find_coupon(&self, code: &str) -> DbResult<Option<Coupon>> {
        Ok(self
            .lock()
            .coupons
            .iter()
            .find(|c| c.code.eq_ignore_ascii_case(code.trim()))
            .cloned())
    }

    async fn count_redemptions(&self, coupon_id: Id, user_id: Option<Id>) -> DbResult<i64> {
        Ok(self
            .lock()
            .redemptions
            .iter()
            .filter(|r| {
                r.coupon_id == coupon_id
                    && user_id.map(|u| r.user_id == u).unwrap_or(true)
                    && !matches!(r.status, RedemptionStatus::Rejected | RedemptionStatus::Canceled)
            })
            .count() as i64)
    }

    async fn set_redemption_status(&self, order_id: Id, status: RedemptionStatus) -> DbResult<()> {
        for r in self.lock().redemptions.iter_mut().filter(|r| r.order_id == order_id) {
            r.status = status;
        }
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn requires_manual_review(&self, user_id: Id) -> DbResult<bool> {
        Ok(self.lock().manual_review.get(&user_id).copied().unwrap_or(false))
    }

    async fn is_realname_verified(&self, user_id: Id) -> DbResult<bool> {
        Ok(self.lock().realname_verified.get(&user_id).copied().unwrap_or(false))
    }
}

#[async_trait]
impl TaskRunRepository for MemoryStore {
    async fn create_run(&self, mut run: ScheduledTaskRun) -> DbResult<ScheduledTaskRun> {
        let mut state = self.lock();
        run.id = state.id();
        state.task_runs.push(run.clone());
        Ok(run)
    }

    async fn save_run(&self, run: &ScheduledTaskRun) -> DbResult<()> {
        let mut state = self.lock();
        let slot = state
            .task_runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or_else(|| not_found("task run", run.id))?;
        *slot = run.clone();
        Ok(())
    }

    async fn list_runs(&self, task_key: &str, limit: i64) -> DbResult<Vec<ScheduledTaskRun>> {
        Ok(self
            .lock()
            .task_runs
            .iter()
            .rev()
            .filter(|r| r.task_key == task_key)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn purge_runs_before(&self, before: DateTime<Utc>) -> DbResult<u64> {
        let mut state = self.lock();
        let len = state.task_runs.len();
        state.task_runs.retain(|r| r.started_at >= before);
        Ok((len - state.task_runs.len()) as u64)
    }
}

#[async_trait]
impl AuditRepository for MemoryStore {
    async fn record_audit(&self, mut entry: AuditLog) -> DbResult<()> {
        let mut state = self.lock();
        entry.id = state.id();
        state.audit.push(entry);
        Ok(())
    }

    async fn purge_audit_before(&self, before: DateTime<Utc>) -> DbResult<u64> {
        let mut state = self.lock();
        let len = state.audit.len();
        state.audit.retain(|a| a.created_at >= before);
        Ok((len - state.audit.len()) as u64)
    }

    async fn purge_sync_logs_before(&self, before: DateTime<Utc>) -> DbResult<u64> {
        let mut state = self.lock();
        let len = state.sync_logs.len();
        state.sync_logs.retain(|at| *at >= before);
        Ok((len - state.sync_logs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn movement(user_id: Id, amount: i64, ref_id: Id) -> WalletMovement {
        WalletMovement {
            user_id,
            amount,
            tx_type: "test".into(),
            ref_type: "test_ref".into(),
            ref_id,
            note: String::new(),
        }
    }

    #[tokio::test]
    async fn test_event_seq_is_dense_per_order() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store.append_event(1, "a", json!({ "i": i })).await.unwrap();
        }
        store.append_event(2, "b", json!({})).await.unwrap();

        let events = store.list_events(1).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(events.windows(2).all(|w| w[0].created_at < w[1].created_at));
        assert_eq!(store.list_events(2).await.unwrap()[0].seq, 1);
    }

    #[tokio::test]
    async fn test_wallet_refuses_overdraft_and_dedupes_refs() {
        let store = MemoryStore::new();
        store.adjust(movement(5, 1000, 1)).await.unwrap();

        let err = store.adjust(movement(5, -1500, 2)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::InsufficientBalance { available: 1000, requested: 1500 }));

        let again = store.adjust(movement(5, 1000, 1)).await.unwrap();
        assert!(!again.applied);
        assert_eq!(store.get_balance(5).await.unwrap(), 1000);

        let total: i64 = store.list_transactions(5).await.unwrap().iter().map(|t| t.amount).sum();
        assert_eq!(total, 1000);
    }

    #[tokio::test]
    async fn test_duplicate_trade_no_conflicts() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let payment = OrderPayment {
            id: 0,
            order_id: 1,
            user_id: 1,
            method: "approval".into(),
            amount: 100,
            currency: "CNY".into(),
            trade_no: "TN-1".into(),
            note: None,
            screenshot_url: None,
            status: PaymentStatus::PendingReview,
            idempotency_key: None,
            reviewed_by: None,
            review_reason: None,
            created_at: now,
            updated_at: now,
        };
        store.create_payment(payment.clone()).await.unwrap();
        let err = store
            .create_payment(OrderPayment { order_id: 2, ..payment })
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));
    }
}
