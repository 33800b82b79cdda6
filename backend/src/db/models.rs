//! # Database Models
//!
//! This module defines the data structures that map to database tables.
//! Each struct represents a row in a table. Money is always `i64` cents.
//!
//! ## Table Overview
//!
//! | Table | Description |
//! |-------|-------------|
//! | `orders` / `order_items` | Customer intents and their per-target lines |
//! | `order_payments` | Payment records attached to orders |
//! | `order_events` | Per-order append-only event log |
//! | `vps_instances` | Materialized remote hosts |
//! | `provision_jobs` | One polling job per `create` item |
//! | `resize_tasks` | Serialized capacity changes per instance |
//! | `automation_logs` | Sanitized RPC traces |
//! | `wallets` / `wallet_transactions` | Balances and their ledger |
//! | `settings` | JSON-encoded policy knobs |
//! | `scheduled_task_runs` / `audit_logs` | Observability |
//!
//! ## Relationship Diagram
//!
//! ```text
//! ┌─────────────┐       ┌──────────────────┐       ┌────────────────┐
//! │   orders    │──────<│   order_items    │──────<│ provision_jobs │
//! │             │       │                  │   1:1 │                │
//! │ id (PK)     │       │ order_id (FK)    │       └────────────────┘
//! │ status      │       │ action, status   │
//! └─────────────┘       └──────────────────┘
//!    │      │                    │
//!    │      └────<order_events   ▼
//!    └──────<order_payments  ┌──────────────┐      ┌──────────────┐
//!                            │ vps_instances│─────<│ resize_tasks │
//!                            └──────────────┘      └──────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::SpecDoc;

/// Row identifier type used by every table.
pub type Id = i64;

/// Declares a string-backed status enum with `as_str` / `parse`.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $( $variant:ident => $text:literal ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                match raw.trim() {
                    $( $text => Some($name::$variant), )+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// Order and order-item status.
    ///
    /// ```text
    /// pending_payment ──► approved ──► provisioning ──► active
    ///        │                              └──► failed
    ///        └──► canceled
    /// pending_review ──► approved | rejected
    /// ```
    pub enum OrderStatus {
        PendingReview => "pending_review",
        PendingPayment => "pending_payment",
        Approved => "approved",
        Provisioning => "provisioning",
        Active => "active",
        Canceled => "canceled",
        Rejected => "rejected",
        Failed => "failed",
    }
}

/// Items share the order status vocabulary.
pub type ItemStatus = OrderStatus;

string_enum! {
    /// What an order item does to its target.
    pub enum ItemAction {
        Create => "create",
        Renew => "renew",
        Resize => "resize",
        Refund => "refund",
        EmergencyRenew => "emergency_renew",
        AdminDelete => "admin_delete",
    }
}

string_enum! {
    /// Where the order came from.
    pub enum OrderSource {
        UserUi => "user_ui",
        UserApikey => "user_apikey",
    }
}

string_enum! {
    pub enum PaymentStatus {
        PendingPayment => "pending_payment",
        PendingReview => "pending_review",
        Approved => "approved",
        Rejected => "rejected",
    }
}

string_enum! {
    pub enum JobStatus {
        Pending => "pending",
        Running => "running",
        Retry => "retry",
        Done => "done",
    }
}

string_enum! {
    pub enum ResizeTaskStatus {
        Pending => "pending",
        Running => "running",
        Done => "done",
        Failed => "failed",
    }
}

string_enum! {
    /// Local instance status, derived from the remote automation state.
    pub enum InstanceStatus {
        Provisioning => "provisioning",
        Running => "running",
        Stopped => "stopped",
        Reinstalling => "reinstalling",
        ReinstallFailed => "reinstall_failed",
        Locked => "locked",
        ExpiredLocked => "expired_locked",
        Failed => "failed",
        Unknown => "unknown",
    }
}

impl InstanceStatus {
    /// Map the remote integer state to a local status.
    ///
    /// | state | status |
    /// |-------|--------|
    /// | 0, 1, 13 | provisioning |
    /// | 2 | running |
    /// | 3 | stopped |
    /// | 4 | reinstalling |
    /// | 5 | reinstall_failed |
    /// | 10 | locked |
    /// | other | unknown |
    pub fn from_automation_state(state: i32) -> Self {
        match state {
            0 | 1 | 13 => InstanceStatus::Provisioning,
            2 => InstanceStatus::Running,
            3 => InstanceStatus::Stopped,
            4 => InstanceStatus::Reinstalling,
            5 => InstanceStatus::ReinstallFailed,
            10 => InstanceStatus::Locked,
            _ => InstanceStatus::Unknown,
        }
    }

    /// Statuses a finished provisioning run can land in.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Running | InstanceStatus::Stopped | InstanceStatus::Locked
        )
    }
}

string_enum! {
    pub enum AdminStatus {
        Normal => "normal",
        Locked => "locked",
    }
}

string_enum! {
    pub enum RedemptionStatus {
        Pending => "pending",
        Used => "used",
        Canceled => "canceled",
        Rejected => "rejected",
    }
}

string_enum! {
    pub enum CouponKind {
        Fixed => "fixed",
        Percent => "percent",
    }
}

// ============================================
// ORDERS
// ============================================

/// A customer intent with a durable lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Id,
    pub user_id: Id,
    /// Unique human-facing number, e.g. `ORD-7-1714521600`.
    pub order_no: String,
    pub source: OrderSource,
    pub status: OrderStatus,
    /// `≥ 0` for purchases, `≤ 0` for refunds.
    pub total_amount: i64,
    pub currency: String,
    pub coupon_id: Option<Id>,
    pub coupon_discount: i64,
    /// Unique per user when present.
    pub idempotency_key: Option<String>,
    pub pending_reason: Option<String>,
    pub approved_by: Option<Id>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// A fresh order ready for insertion (id assigned by the store).
    pub fn draft(user_id: Id, order_no: String, status: OrderStatus, currency: &str) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id,
            order_no,
            source: OrderSource::UserUi,
            status,
            total_amount: 0,
            currency: currency.to_string(),
            coupon_id: None,
            coupon_discount: 0,
            idempotency_key: None,
            pending_reason: None,
            approved_by: None,
            approved_at: None,
            rejected_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One line of an order: one action against one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Id,
    pub order_id: Id,
    pub package_id: Id,
    pub system_id: Id,
    pub spec: SpecDoc,
    pub qty: i32,
    pub amount: i64,
    pub status: ItemStatus,
    pub goods_type_id: Id,
    /// Stringified remote host id once the host exists.
    pub automation_instance_id: Option<String>,
    pub action: ItemAction,
    pub duration_months: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderItem {
    pub fn draft(action: ItemAction, status: ItemStatus, amount: i64, spec: SpecDoc) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            order_id: 0,
            package_id: 0,
            system_id: 0,
            duration_months: spec.duration_months(),
            spec,
            qty: 1,
            amount,
            status,
            goods_type_id: 0,
            automation_instance_id: None,
            action,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A payment attached to an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayment {
    pub id: Id,
    pub order_id: Id,
    pub user_id: Id,
    pub method: String,
    pub amount: i64,
    pub currency: String,
    /// Globally unique; synthetic `pending-<order>-<nanos>` when omitted.
    pub trade_no: String,
    pub note: Option<String>,
    pub screenshot_url: Option<String>,
    pub status: PaymentStatus,
    pub idempotency_key: Option<String>,
    pub reviewed_by: Option<Id>,
    pub review_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only event, `seq` strictly increasing per order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub id: Id,
    pub order_id: Id,
    pub seq: i64,
    pub event_type: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

// ============================================
// INSTANCES & JOBS
// ============================================

/// Access credentials reported by the automation backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub panel_password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vnc_password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os_password: String,
}

impl AccessInfo {
    /// Later non-empty values win.
    pub fn merge(&mut self, newer: &AccessInfo) {
        let take = |slot: &mut String, value: &String| {
            if !value.trim().is_empty() {
                *slot = value.clone();
            }
        };
        take(&mut self.remote_ip, &newer.remote_ip);
        take(&mut self.panel_password, &newer.panel_password);
        take(&mut self.vnc_password, &newer.vnc_password);
        take(&mut self.os_password, &newer.os_password);
    }
}

/// A materialized remote host under customer ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpsInstance {
    pub id: Id,
    pub user_id: Id,
    pub order_item_id: Id,
    pub automation_instance_id: String,
    pub goods_type_id: Id,
    pub name: String,
    // package snapshot
    pub package_id: Id,
    pub package_name: String,
    pub cpu: i32,
    pub memory_gb: i32,
    pub disk_gb: i32,
    pub bandwidth_mbps: i32,
    pub port_num: i32,
    pub monthly_price: i64,
    pub spec: SpecDoc,
    pub system_id: Id,
    pub status: InstanceStatus,
    pub automation_state: i32,
    pub admin_status: AdminStatus,
    pub expire_at: Option<DateTime<Utc>>,
    pub panel_url_cache: Option<String>,
    pub access_info: AccessInfo,
    pub last_emergency_renew_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable polling record for one `create` item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionJob {
    pub id: Id,
    pub order_id: Id,
    /// Unique: exactly one job per order item.
    pub order_item_id: Id,
    pub host_id: i64,
    pub host_name: String,
    pub status: JobStatus,
    pub attempts: i32,
    pub next_run_at: DateTime<Utc>,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Serialized capacity change for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeTask {
    pub id: Id,
    pub vps_id: Id,
    pub order_id: Id,
    pub order_item_id: Id,
    pub status: ResizeTaskStatus,
    pub last_error: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Sanitized RPC trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationLog {
    pub id: Id,
    pub order_id: Id,
    pub order_item_id: Id,
    pub action: String,
    pub request_json: Value,
    pub response_json: Value,
    pub success: bool,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

// ============================================
// WALLET
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Id,
    pub user_id: Id,
    /// Signed: credits positive, debits negative.
    pub amount: i64,
    pub tx_type: String,
    pub ref_type: String,
    pub ref_id: Id,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

/// A requested balance movement. `(user_id, ref_type, ref_id)` is idempotent.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletMovement {
    pub user_id: Id,
    pub amount: i64,
    pub tx_type: String,
    pub ref_type: String,
    pub ref_id: Id,
    pub note: String,
}

/// Outcome of applying a [`WalletMovement`].
#[derive(Debug, Clone, PartialEq)]
pub struct WalletAdjustment {
    /// False when the reference was already applied.
    pub applied: bool,
    pub balance: i64,
}

// ============================================
// SETTINGS, CATALOG & COLLABORATORS
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    /// JSON-encoded value.
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Catalog row binding a product line to an automation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodsType {
    pub id: Id,
    pub name: String,
    pub sort_order: i32,
    pub automation_category: String,
    pub automation_plugin_id: String,
    pub automation_instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub id: Id,
    pub name: String,
    pub goods_type_id: Id,
    pub plan_group_id: Id,
    pub cpu: i32,
    pub memory_gb: i32,
    pub disk_gb: i32,
    pub bandwidth_mbps: i32,
    pub port_num: i32,
    pub monthly_price: i64,
    pub active: bool,
}

/// Allowed addon range. `min = -1` disables the addon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AddonRange {
    pub min: i32,
    pub max: i32,
    pub step: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanGroup {
    pub id: Id,
    pub line_id: i64,
    pub add_core: AddonRange,
    pub add_mem: AddonRange,
    pub add_disk: AddonRange,
    pub add_bw: AddonRange,
    pub unit_core: i64,
    pub unit_mem: i64,
    pub unit_disk: i64,
    pub unit_bw: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingCycle {
    pub id: Id,
    pub months: i32,
    /// Price multiplier in basis points (10000 = 1.0).
    pub multiplier_bp: i64,
    pub min_qty: i32,
    pub max_qty: i32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemImage {
    pub id: Id,
    pub name: String,
    pub image_code: String,
}

/// Customer-chosen options on a cart line or order input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CartSpec {
    #[serde(default)]
    pub add_cores: i32,
    #[serde(default)]
    pub add_mem_gb: i32,
    #[serde(default)]
    pub add_disk_gb: i32,
    #[serde(default)]
    pub add_bw_mbps: i32,
    #[serde(default)]
    pub billing_cycle_id: Id,
    #[serde(default)]
    pub cycle_qty: i32,
    #[serde(default)]
    pub duration_months: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub id: Id,
    pub user_id: Id,
    pub package_id: Id,
    pub system_id: Id,
    pub spec: CartSpec,
    pub qty: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: Id,
    pub code: String,
    pub kind: CouponKind,
    /// Cents for `fixed`, basis points for `percent`.
    pub value: i64,
    pub min_order_amount: i64,
    /// Zero means unlimited.
    pub max_uses: i64,
    pub per_user_limit: i64,
    pub new_user_only: bool,
    pub active: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponRedemption {
    pub id: Id,
    pub coupon_id: Id,
    pub order_id: Id,
    pub user_id: Id,
    pub status: RedemptionStatus,
    pub created_at: DateTime<Utc>,
}

/// One execution of a scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTaskRun {
    pub id: Id,
    pub task_key: String,
    /// `running`, `success` or `failed`.
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_sec: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Id,
    pub actor_id: Id,
    pub action: String,
    pub target_type: String,
    pub target_id: Id,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_automation_state_mapping() {
        for state in [0, 1, 13] {
            assert_eq!(InstanceStatus::from_automation_state(state), InstanceStatus::Provisioning);
        }
        assert_eq!(InstanceStatus::from_automation_state(2), InstanceStatus::Running);
        assert_eq!(InstanceStatus::from_automation_state(3), InstanceStatus::Stopped);
        assert_eq!(InstanceStatus::from_automation_state(4), InstanceStatus::Reinstalling);
        assert_eq!(InstanceStatus::from_automation_state(5), InstanceStatus::ReinstallFailed);
        assert_eq!(InstanceStatus::from_automation_state(10), InstanceStatus::Locked);
        assert_eq!(InstanceStatus::from_automation_state(11), InstanceStatus::Unknown);
    }

    #[test]
    fn test_status_text_round_trips_through_parse() {
        assert_eq!(OrderStatus::parse("pending_review"), Some(OrderStatus::PendingReview));
        assert_eq!(ItemAction::parse("emergency_renew"), Some(ItemAction::EmergencyRenew));
        assert_eq!(OrderStatus::parse("bogus"), None);
        assert_eq!(
            serde_json::to_value(OrderStatus::PendingPayment).unwrap(),
            serde_json::json!("pending_payment")
        );
    }

    #[test]
    fn test_access_info_merge_keeps_old_when_new_is_empty() {
        let mut current = AccessInfo {
            remote_ip: "10.0.0.1".into(),
            panel_password: "old-panel".into(),
            vnc_password: "old-vnc".into(),
            os_password: "old-os".into(),
        };
        current.merge(&AccessInfo {
            remote_ip: "".into(),
            panel_password: "new-panel".into(),
            vnc_password: " ".into(),
            os_password: "new-os".into(),
        });
        assert_eq!(current.remote_ip, "10.0.0.1");
        assert_eq!(current.panel_password, "new-panel");
        assert_eq!(current.vnc_password, "old-vnc");
        assert_eq!(current.os_password, "new-os");
    }
}
