//! # Repository Contracts
//!
//! The broker talks to storage only through these traits. Two stores
//! implement them:
//!
//! | Store | Use |
//! |-------|-----|
//! | [`PgStore`](super::queries::PgStore) | PostgreSQL via deadpool |
//! | [`MemoryStore`](super::memory::MemoryStore) | single-process runs and tests |
//!
//! Lookups that must find a row return `DatabaseError::NotFound`; lookups
//! that may legitimately miss return `Option`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::*;
use super::DatabaseError;

pub type DbResult<T> = Result<T, DatabaseError>;

/// Extra writes performed in the same transaction as order creation.
#[derive(Debug, Clone, Default)]
pub struct OrderCreateExtras {
    /// Clear this user's cart on commit.
    pub consume_cart_of: Option<Id>,
    /// Coupon redemption to insert (its `order_id` is filled in).
    pub redemption: Option<CouponRedemption>,
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Insert an order with its items atomically.
    async fn create_order(
        &self,
        order: Order,
        items: Vec<OrderItem>,
        extras: OrderCreateExtras,
    ) -> DbResult<(Order, Vec<OrderItem>)>;
    async fn get_order(&self, id: Id) -> DbResult<Order>;
    async fn find_order_by_idempotency(&self, user_id: Id, key: &str) -> DbResult<Option<Order>>;
    /// Persist status and review fields of an order.
    async fn save_order(&self, order: &Order) -> DbResult<()>;
    async fn list_orders_by_status(&self, status: OrderStatus, limit: i64) -> DbResult<Vec<Order>>;
    /// Orders of a user that were not canceled or rejected.
    async fn count_user_orders(&self, user_id: Id) -> DbResult<i64>;
    async fn list_items(&self, order_id: Id) -> DbResult<Vec<OrderItem>>;
    async fn get_item(&self, id: Id) -> DbResult<OrderItem>;
    /// Persist status, automation id and spec of an item.
    async fn save_item(&self, item: &OrderItem) -> DbResult<()>;
    /// Items targeting `vps_id` with `action` whose status is still open
    /// (pending_payment, pending_review, approved, provisioning).
    async fn list_open_items_for_vps(&self, vps_id: Id, action: ItemAction) -> DbResult<Vec<OrderItem>>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Insert a payment; a duplicate trade_no yields `Conflict`.
    async fn create_payment(&self, payment: OrderPayment) -> DbResult<OrderPayment>;
    async fn get_payment(&self, id: Id) -> DbResult<OrderPayment>;
    async fn find_payment_by_idempotency(&self, order_id: Id, key: &str) -> DbResult<Option<OrderPayment>>;
    async fn find_payment_by_trade_no(&self, trade_no: &str) -> DbResult<Option<OrderPayment>>;
    async fn list_payments(&self, order_id: Id) -> DbResult<Vec<OrderPayment>>;
    async fn save_payment(&self, payment: &OrderPayment) -> DbResult<()>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Append an event, assigning the next `seq` atomically.
    async fn append_event(&self, order_id: Id, event_type: &str, data: serde_json::Value) -> DbResult<OrderEvent>;
    async fn list_events(&self, order_id: Id) -> DbResult<Vec<OrderEvent>>;
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn create_instance(&self, instance: VpsInstance) -> DbResult<VpsInstance>;
    async fn get_instance(&self, id: Id) -> DbResult<VpsInstance>;
    async fn find_instance_by_item(&self, order_item_id: Id) -> DbResult<Option<VpsInstance>>;
    async fn save_instance(&self, instance: &VpsInstance) -> DbResult<()>;
    async fn delete_instance(&self, id: Id) -> DbResult<()>;
    /// Instances whose `expire_at ≤ before`.
    async fn list_expiring(&self, before: DateTime<Utc>) -> DbResult<Vec<VpsInstance>>;
}

#[async_trait]
pub trait ProvisionJobRepository: Send + Sync {
    /// Insert or replace the job keyed by `order_item_id`.
    async fn upsert_job(&self, job: ProvisionJob) -> DbResult<ProvisionJob>;
    /// Jobs due at `now` in `pending | retry | running`, ordered by id.
    async fn list_due_jobs(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<ProvisionJob>>;
    async fn save_job(&self, job: &ProvisionJob) -> DbResult<()>;
    async fn find_job_by_item(&self, order_item_id: Id) -> DbResult<Option<ProvisionJob>>;
}

#[async_trait]
pub trait ResizeTaskRepository: Send + Sync {
    async fn create_task(&self, task: ResizeTask) -> DbResult<ResizeTask>;
    async fn get_task(&self, id: Id) -> DbResult<ResizeTask>;
    /// True when a `pending | running` task exists for the instance.
    async fn has_open_task(&self, vps_id: Id) -> DbResult<bool>;
    /// Pending tasks with `scheduled_at ≤ now` or unscheduled, by id.
    async fn list_due_tasks(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<ResizeTask>>;
    async fn find_task_by_item(&self, order_item_id: Id) -> DbResult<Option<ResizeTask>>;
    async fn save_task(&self, task: &ResizeTask) -> DbResult<()>;
}

#[async_trait]
pub trait AutomationLogRepository: Send + Sync {
    async fn create_log(&self, log: AutomationLog) -> DbResult<()>;
    /// Delete rows created before `before`, returning the count.
    async fn purge_logs_before(&self, before: DateTime<Utc>) -> DbResult<u64>;
    async fn list_logs(&self, order_id: Option<Id>, limit: i64) -> DbResult<Vec<AutomationLog>>;
}

#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// Apply a movement under a row lock.
    ///
    /// Fails with `InsufficientBalance` when the balance would go negative;
    /// a reference applied before is a no-op (`applied = false`).
    async fn adjust(&self, movement: WalletMovement) -> DbResult<WalletAdjustment>;
    async fn get_balance(&self, user_id: Id) -> DbResult<i64>;
    async fn has_transaction(&self, user_id: Id, ref_type: &str, ref_id: Id) -> DbResult<bool>;
    async fn list_transactions(&self, user_id: Id) -> DbResult<Vec<WalletTransaction>>;
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get_setting(&self, key: &str) -> DbResult<Option<String>>;
    async fn upsert_setting(&self, key: &str, value: &str) -> DbResult<()>;
    async fn list_settings(&self) -> DbResult<Vec<Setting>>;
}

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn get_goods_type(&self, id: Id) -> DbResult<GoodsType>;
    async fn list_goods_types(&self) -> DbResult<Vec<GoodsType>>;
    async fn get_package(&self, id: Id) -> DbResult<Package>;
    async fn get_plan_group(&self, id: Id) -> DbResult<PlanGroup>;
    async fn get_billing_cycle(&self, id: Id) -> DbResult<BillingCycle>;
    async fn get_system_image(&self, id: Id) -> DbResult<SystemImage>;
}

#[async_trait]
pub trait CartRepository: Send + Sync {
    async fn list_cart(&self, user_id: Id) -> DbResult<Vec<CartItem>>;
}

#[async_trait]
pub trait CouponRepository: Send + Sync {
    async fn find_coupon(&self, code: &str) -> DbResult<Option<Coupon>>;
    /// Non-rejected redemptions of a coupon, optionally for one user.
    async fn count_redemptions(&self, coupon_id: Id, user_id: Option<Id>) -> DbResult<i64>;
    async fn set_redemption_status(&self, order_id: Id, status: RedemptionStatus) -> DbResult<()>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn requires_manual_review(&self, user_id: Id) -> DbResult<bool>;
    async fn is_realname_verified(&self, user_id: Id) -> DbResult<bool>;
}

#[async_trait]
pub trait TaskRunRepository: Send + Sync {
    async fn create_run(&self, run: ScheduledTaskRun) -> DbResult<ScheduledTaskRun>;
    async fn save_run(&self, run: &ScheduledTaskRun) -> DbResult<()>;
    async fn list_runs(&self, task_key: &str, limit: i64) -> DbResult<Vec<ScheduledTaskRun>>;
    async fn purge_runs_before(&self, before: DateTime<Utc>) -> DbResult<u64>;
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn record_audit(&self, entry: AuditLog) -> DbResult<()>;
    async fn purge_audit_before(&self, before: DateTime<Utc>) -> DbResult<u64>;
    async fn purge_sync_logs_before(&self, before: DateTime<Utc>) -> DbResult<u64>;
}

/// Every repository the broker consumes, bundled for injection.
#[derive(Clone)]
pub struct Repositories {
    pub orders: Arc<dyn OrderRepository>,
    pub payments: Arc<dyn PaymentRepository>,
    pub events: Arc<dyn EventRepository>,
    pub instances: Arc<dyn InstanceRepository>,
    pub jobs: Arc<dyn ProvisionJobRepository>,
    pub resize_tasks: Arc<dyn ResizeTaskRepository>,
    pub automation_logs: Arc<dyn AutomationLogRepository>,
    pub wallets: Arc<dyn WalletRepository>,
    pub settings: Arc<dyn SettingsRepository>,
    pub catalog: Arc<dyn CatalogRepository>,
    pub carts: Arc<dyn CartRepository>,
    pub coupons: Arc<dyn CouponRepository>,
    pub users: Arc<dyn UserDirectory>,
    pub task_runs: Arc<dyn TaskRunRepository>,
    pub audit: Arc<dyn AuditRepository>,
}

impl Repositories {
    /// Bundle a single store implementing every contract.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: OrderRepository
            + PaymentRepository
            + EventRepository
            + InstanceRepository
            + ProvisionJobRepository
            + ResizeTaskRepository
            + AutomationLogRepository
            + WalletRepository
            + SettingsRepository
            + CatalogRepository
            + CartRepository
            + CouponRepository
            + UserDirectory
            + TaskRunRepository
            + AuditRepository
            + 'static,
    {
        Self {
            orders: store.clone(),
            payments: store.clone(),
            events: store.clone(),
            instances: store.clone(),
            jobs: store.clone(),
            resize_tasks: store.clone(),
            automation_logs: store.clone(),
            wallets: store.clone(),
            settings: store.clone(),
            catalog: store.clone(),
            carts: store.clone(),
            coupons: store.clone(),
            users: store.clone(),
            task_runs: store.clone(),
            audit: store,
        }
    }
}
