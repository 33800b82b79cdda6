//! # Non-Provision Actions
//!
//! Executes order items that act on an existing instance once their order
//! is approved.
//!
//! | Action | Remote calls | Local effect |
//! |--------|--------------|--------------|
//! | `renew` | `renew_host`, `unlock_host` if locked | `expire_at` extended, period reset |
//! | `emergency_renew` | same, gated by window and cooldown | also stamps `last_emergency_renew_at` |
//! | `resize` | `elastic_update`, `get_host_info` | capacity and price snapshot updated |
//! | `refund` | `delete_host` | wallet credited, instance removed |
//! | `admin_delete` | `delete_host` | optional pro-rated refund, instance removed |

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use super::context::ServiceContext;
use super::pricing;
use super::wallet::refs;
use crate::automation::ElasticUpdateRequest;
use crate::db::{
    AdminStatus, CartSpec, InstanceStatus, ItemAction, Order, OrderItem, VpsInstance,
};
use crate::errors::{BrokerError, BrokerResult};
use crate::utils::{add_months, parse_host_id};

const DEFAULT_RENEW_DAYS: i64 = 30;

/// How far a renewal moves the expiry.
#[derive(Debug, Clone, Copy)]
enum RenewTerm {
    Months(i32),
    Days(i64),
}

impl RenewTerm {
    fn apply(self, base: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            RenewTerm::Months(months) => add_months(base, months),
            RenewTerm::Days(days) => base + Duration::days(days),
        }
    }
}

#[derive(Clone)]
pub struct ActionExecutor {
    ctx: ServiceContext,
}

impl ActionExecutor {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Run one non-create item.
    pub async fn execute(&self, order: &Order, item: &OrderItem) -> BrokerResult<()> {
        match item.action {
            ItemAction::Renew => self.renew(order, item).await,
            ItemAction::EmergencyRenew => self.emergency_renew(order, item).await,
            ItemAction::Resize => self.resize(order, item).await,
            ItemAction::Refund => self.refund(order, item).await,
            ItemAction::AdminDelete => self.admin_delete(order, item).await,
            ItemAction::Create => Err(BrokerError::invalid("create items are provisioned by the worker")),
        }
    }

    async fn target_instance(&self, item: &OrderItem) -> BrokerResult<(VpsInstance, i64)> {
        let vps_id = item
            .spec
            .vps_id()
            .ok_or_else(|| BrokerError::invalid("vps_id required"))?;
        let inst = self.ctx.repos.instances.get_instance(vps_id).await?;
        let host_id = parse_host_id(&inst.automation_instance_id);
        if host_id <= 0 {
            return Err(BrokerError::invalid(format!("instance {} has no remote host", inst.id)));
        }
        Ok((inst, host_id))
    }

    /// Renew on the remote, unlock if needed, then move `expire_at`.
    async fn extend(
        &self,
        order: &Order,
        item: &OrderItem,
        inst: &mut VpsInstance,
        host_id: i64,
        term: RenewTerm,
        now: DateTime<Utc>,
    ) -> BrokerResult<()> {
        let base = match inst.expire_at {
            Some(expire_at) if expire_at > now => expire_at,
            _ => now,
        };
        let next = term.apply(base);
        let client = self.ctx.client(inst.goods_type_id).await?;
        let actx = self.ctx.automation(order.id, item.id);

        client.renew_host(&actx, host_id, next).await?;
        if inst.admin_status != AdminStatus::Normal || inst.status == InstanceStatus::ExpiredLocked {
            client.unlock_host(&actx, host_id).await?;
            inst.admin_status = AdminStatus::Normal;
            if inst.status == InstanceStatus::ExpiredLocked || inst.status == InstanceStatus::Locked {
                inst.status = InstanceStatus::Running;
            }
        }
        inst.expire_at = Some(next);
        inst.spec.set_current_period(now, next);
        info!("🔁 VPS {} renewed by {:?} until {}", inst.id, term, next);
        Ok(())
    }

    pub async fn renew(&self, order: &Order, item: &OrderItem) -> BrokerResult<()> {
        let (mut inst, host_id) = self.target_instance(item).await?;
        let months = item.spec.get_i64("duration_months").unwrap_or(0);
        let term = if months > 0 {
            RenewTerm::Months(i32::try_from(months).unwrap_or(i32::MAX))
        } else {
            RenewTerm::Days(
                item.spec
                    .get_i64("renew_days")
                    .filter(|d| *d > 0)
                    .unwrap_or(DEFAULT_RENEW_DAYS),
            )
        };
        self.extend(order, item, &mut inst, host_id, term, Utc::now()).await?;
        self.ctx.repos.instances.save_instance(&inst).await?;
        Ok(())
    }

    pub async fn emergency_renew(&self, order: &Order, item: &OrderItem) -> BrokerResult<()> {
        let policy = self.ctx.settings.emergency_renew().await;
        if !policy.enabled {
            return Err(BrokerError::forbidden("emergency renew is disabled"));
        }
        let (mut inst, host_id) = self.target_instance(item).await?;
        let now = Utc::now();
        if !policy.in_window(inst.expire_at, now) {
            return Err(BrokerError::forbidden("outside the emergency renew window"));
        }
        if policy.in_cooldown(inst.last_emergency_renew_at, now) {
            return Err(BrokerError::forbidden("emergency renew is cooling down"));
        }
        let days = item
            .spec
            .get_i64("renew_days")
            .filter(|d| *d > 0)
            .unwrap_or(policy.renew_days);
        self.extend(order, item, &mut inst, host_id, RenewTerm::Days(days), now).await?;
        inst.last_emergency_renew_at = Some(now);
        self.ctx.repos.instances.save_instance(&inst).await?;
        Ok(())
    }

    /// Apply a priced resize to the remote host and the local snapshot.
    ///
    /// The instance is only written after `elastic_update` succeeded.
    pub async fn resize(&self, order: &Order, item: &OrderItem) -> BrokerResult<()> {
        let (mut inst, host_id) = self.target_instance(item).await?;
        let target = |key: &str| item.spec.get_i64(key).unwrap_or(0) as i32;
        let (cpu, mem, disk, bw) = (
            target("target_cpu"),
            target("target_mem_gb"),
            target("target_disk_gb"),
            target("target_bw_mbps"),
        );
        if disk > 0 && disk < inst.disk_gb {
            return Err(BrokerError::invalid("disk cannot shrink"));
        }

        let package_id = match item.spec.get_i64("target_package_id") {
            Some(id) if id > 0 => id,
            _ => inst.package_id,
        };
        let package = self.ctx.repos.catalog.get_package(package_id).await?;
        if inst.goods_type_id > 0 && package.goods_type_id != inst.goods_type_id {
            return Err(BrokerError::invalid("target package belongs to another goods type"));
        }
        let plan = self.ctx.repos.catalog.get_plan_group(package.plan_group_id).await?;
        let addons: CartSpec = item
            .spec
            .get("spec")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let positive = |v: i32| if v > 0 { Some(v) } else { None };
        let port_num = positive(package.port_num);
        let client = self.ctx.client(inst.goods_type_id).await?;
        let actx = self.ctx.automation(order.id, item.id);
        client
            .elastic_update(
                &actx,
                &ElasticUpdateRequest {
                    host_id,
                    cpu: positive(cpu),
                    memory_gb: positive(mem),
                    disk_gb: positive(disk),
                    bandwidth_mbps: positive(bw),
                    port_num,
                },
            )
            .await?;

        inst.package_id = package.id;
        inst.package_name = package.name.clone();
        inst.cpu = positive(cpu).unwrap_or(inst.cpu);
        inst.memory_gb = positive(mem).unwrap_or(inst.memory_gb);
        inst.disk_gb = positive(disk).unwrap_or(inst.disk_gb);
        inst.bandwidth_mbps = positive(bw).unwrap_or(inst.bandwidth_mbps);
        inst.port_num = port_num.unwrap_or(inst.port_num);
        inst.monthly_price = package.monthly_price + pricing::addon_price(&plan, &addons);
        inst.spec
            .set("add_cores", addons.add_cores)
            .set("add_mem_gb", addons.add_mem_gb)
            .set("add_disk_gb", addons.add_disk_gb)
            .set("add_bw_mbps", addons.add_bw_mbps);

        match client.get_host_info(&actx, host_id).await {
            Ok(info) => {
                if info.state > 0 {
                    inst.status = InstanceStatus::from_automation_state(info.state);
                    inst.automation_state = info.state;
                }
                inst.access_info.merge(&access_from(&info));
            }
            Err(e) => warn!("Host {} refresh after resize failed: {}", host_id, e),
        }
        self.ctx.repos.instances.save_instance(&inst).await?;
        info!("📐 VPS {} resized to {}c/{}G/{}G/{}M", inst.id, inst.cpu, inst.memory_gb, inst.disk_gb, inst.bandwidth_mbps);
        Ok(())
    }

    /// Credit a downgrade refund when the resize order is approved.
    ///
    /// Idempotent per order: the wallet ignores a second credit for the
    /// same reference.
    pub async fn credit_resize_refund(&self, order: &Order, item: &OrderItem) -> BrokerResult<i64> {
        let refund = item.spec.get_i64("refund_amount").unwrap_or_else(|| {
            let charge = item.spec.get_i64("charge_amount").unwrap_or(0);
            (-charge).max(0)
        });
        if refund <= 0 || !item.spec.get_bool("refund_to_wallet").unwrap_or(true) {
            return Ok(0);
        }
        self.ctx
            .wallet
            .credit(order.user_id, refund, refs::RESIZE_REFUND, order.id, &format!("resize refund {}", order.order_no))
            .await?;
        Ok(refund)
    }

    pub async fn refund(&self, order: &Order, item: &OrderItem) -> BrokerResult<()> {
        let vps_id = item.spec.vps_id().unwrap_or(0);
        let amount = item.spec.get_i64("refund_amount").unwrap_or(0);
        if vps_id <= 0 || amount <= 0 {
            return Err(BrokerError::invalid("refund needs vps_id and a positive amount"));
        }
        let inst = self.ctx.repos.instances.get_instance(vps_id).await?;

        if item.spec.get_bool("refund_to_wallet").unwrap_or(true) {
            self.ctx
                .wallet
                .credit(order.user_id, amount, refs::VPS_REFUND, order.id, &format!("refund {}", order.order_no))
                .await?;
        }
        self.ctx
            .audit(0, "vps.refund", "vps", vps_id, json!({ "order_id": order.id, "amount": amount }))
            .await;

        if item.spec.get_bool("delete_on_approve").unwrap_or(true) {
            self.delete_everywhere(order, item, &inst).await?;
        }
        Ok(())
    }

    pub async fn admin_delete(&self, order: &Order, item: &OrderItem) -> BrokerResult<()> {
        let vps_id = item
            .spec
            .vps_id()
            .ok_or_else(|| BrokerError::invalid("vps_id required"))?;
        let inst = self.ctx.repos.instances.get_instance(vps_id).await?;
        let refunded = self.refund_on_admin_delete(&inst).await?;
        self.delete_everywhere(order, item, &inst).await?;
        self.ctx
            .audit(
                order.approved_by.unwrap_or(0),
                "vps.admin_delete",
                "vps",
                vps_id,
                json!({ "order_id": order.id, "refund": refunded }),
            )
            .await;
        Ok(())
    }

    /// Pro-rated refund owed when an admin deletes an instance, credited
    /// when `refund_on_admin_delete` is set. Returns the credited amount.
    pub async fn refund_on_admin_delete(&self, inst: &VpsInstance) -> BrokerResult<i64> {
        let policy = self.ctx.settings.refund_policy().await;
        if !policy.on_admin_delete {
            return Ok(0);
        }
        let basis = if inst.monthly_price > 0 {
            inst.monthly_price
        } else {
            match self.ctx.repos.orders.get_item(inst.order_item_id).await {
                Ok(item) => item.amount,
                Err(_) => 0,
            }
        };
        let amount = pricing::refund_amount(inst, basis, &policy, Utc::now());
        if amount > 0 {
            self.ctx
                .wallet
                .credit(inst.user_id, amount, refs::ADMIN_DELETE_REFUND, inst.id, &format!("admin delete vps {}", inst.id))
                .await?;
        }
        Ok(amount)
    }

    async fn delete_everywhere(&self, order: &Order, item: &OrderItem, inst: &VpsInstance) -> BrokerResult<()> {
        let host_id = parse_host_id(&inst.automation_instance_id);
        if host_id > 0 {
            let client = self.ctx.client(inst.goods_type_id).await?;
            client
                .delete_host(&self.ctx.automation(order.id, item.id), host_id)
                .await?;
        }
        self.ctx.repos.instances.delete_instance(inst.id).await?;
        info!("🗑️ VPS {} deleted (host {})", inst.id, host_id);
        Ok(())
    }
}

/// Access credentials carried by a host info answer.
pub(crate) fn access_from(info: &crate::automation::HostInfo) -> crate::db::AccessInfo {
    crate::db::AccessInfo {
        remote_ip: info.remote_ip.clone(),
        panel_password: info.panel_password.clone(),
        vnc_password: info.vnc_password.clone(),
        os_password: info.os_password.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::AutomationError;
    use crate::db::{InstanceRepository, SettingsRepository};
    use crate::testing::TestBed;
    use crate::utils::SpecDoc;

    fn spec(pairs: &[(&str, serde_json::Value)]) -> SpecDoc {
        let mut doc = SpecDoc::new();
        for (k, v) in pairs {
            doc.set(k, v.clone());
        }
        doc
    }

    #[tokio::test]
    async fn test_renew_extends_from_current_expiry_and_unlocks() {
        let bed = TestBed::new().await;
        let expire = Utc::now() + Duration::days(3);
        let mut inst = bed.seed_instance(1, Some(expire)).await;
        inst.admin_status = AdminStatus::Locked;
        inst.status = InstanceStatus::ExpiredLocked;
        bed.store.save_instance(&inst).await.unwrap();

        let (order, item) = bed
            .seed_action_order(1, ItemAction::Renew, spec(&[("vps_id", json!(inst.id)), ("duration_months", json!(1))]))
            .await;
        bed.services.orders.actions().execute(&order, &item).await.unwrap();

        let renewed = bed.store.get_instance(inst.id).await.unwrap();
        assert_eq!(renewed.expire_at, Some(add_months(expire, 1)));
        assert_eq!(renewed.admin_status, AdminStatus::Normal);
        assert_eq!(renewed.status, InstanceStatus::Running);
        assert_eq!(bed.mock.call_count("renew_host"), 1);
        assert_eq!(bed.mock.call_count("unlock_host"), 1);
    }

    #[tokio::test]
    async fn test_failed_remote_renew_leaves_instance_untouched() {
        let bed = TestBed::new().await;
        let expire = Utc::now() + Duration::days(3);
        let inst = bed.seed_instance(1, Some(expire)).await;
        bed.mock.fail_with("renew_host", AutomationError::Upstream("quota".into()));
        let (order, item) = bed
            .seed_action_order(1, ItemAction::Renew, spec(&[("vps_id", json!(inst.id))]))
            .await;

        let err = bed.services.orders.actions().execute(&order, &item).await.unwrap_err();
        assert_eq!(err, BrokerError::Upstream("quota".into()));
        assert_eq!(bed.store.get_instance(inst.id).await.unwrap().expire_at, Some(expire));
    }

    #[tokio::test]
    async fn test_emergency_renew_respects_cooldown() {
        let bed = TestBed::new().await;
        bed.store.upsert_setting("emergency_renew_interval_hours", "24").await.unwrap();
        let mut inst = bed.seed_instance(1, Some(Utc::now() + Duration::hours(48))).await;
        inst.last_emergency_renew_at = Some(Utc::now() - Duration::hours(2));
        bed.store.save_instance(&inst).await.unwrap();

        let (order, item) = bed
            .seed_action_order(1, ItemAction::EmergencyRenew, spec(&[("vps_id", json!(inst.id))]))
            .await;
        let err = bed.services.orders.actions().execute(&order, &item).await.unwrap_err();
        assert_eq!(err.kind(), "forbidden");
        assert_eq!(bed.mock.call_count("renew_host"), 0);
    }

    #[tokio::test]
    async fn test_resize_updates_snapshot() {
        let bed = TestBed::new().await;
        let inst = bed.seed_instance(1, Some(Utc::now() + Duration::days(20))).await;
        let payload = spec(&[
            ("vps_id", json!(inst.id)),
            ("spec", json!({"add_cores": 2})),
            ("target_cpu", json!(inst.cpu + 2)),
            ("target_mem_gb", json!(inst.memory_gb)),
            ("target_disk_gb", json!(inst.disk_gb)),
            ("target_bw_mbps", json!(inst.bandwidth_mbps)),
        ]);
        let (order, item) = bed.seed_action_order(1, ItemAction::Resize, payload).await;
        bed.services.orders.actions().execute(&order, &item).await.unwrap();

        let resized = bed.store.get_instance(inst.id).await.unwrap();
        assert_eq!(resized.cpu, inst.cpu + 2);
        assert_eq!(resized.monthly_price, bed.package.monthly_price + 2 * bed.plan.unit_core);
        assert_eq!(resized.spec.get_i64("add_cores"), Some(2));
        let updates = bed.mock.elastic_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].cpu, Some(inst.cpu + 2));
    }

    #[tokio::test]
    async fn test_resize_rejects_disk_shrink_before_remote_call() {
        let bed = TestBed::new().await;
        let inst = bed.seed_instance(1, Some(Utc::now() + Duration::days(20))).await;
        let (order, item) = bed
            .seed_action_order(
                1,
                ItemAction::Resize,
                spec(&[("vps_id", json!(inst.id)), ("target_disk_gb", json!(inst.disk_gb - 10))]),
            )
            .await;
        let err = bed.services.orders.actions().execute(&order, &item).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(bed.mock.elastic_updates().is_empty());
    }

    #[tokio::test]
    async fn test_refund_credits_once_and_deletes() {
        let bed = TestBed::new().await;
        let inst = bed.seed_instance(1, Some(Utc::now() + Duration::days(20))).await;
        let (order, item) = bed
            .seed_action_order(
                1,
                ItemAction::Refund,
                spec(&[("vps_id", json!(inst.id)), ("refund_amount", json!(2500))]),
            )
            .await;
        bed.services.orders.actions().execute(&order, &item).await.unwrap();

        assert_eq!(bed.ctx.wallet.balance(1).await.unwrap(), 2500);
        assert!(bed.store.get_instance(inst.id).await.is_err());
        assert_eq!(bed.mock.deleted_hosts(), vec![parse_host_id(&inst.automation_instance_id)]);
        assert_eq!(bed.store.audit_entries().len(), 1);
    }

    #[tokio::test]
    async fn test_admin_delete_refunds_when_enabled() {
        let bed = TestBed::new().await;
        bed.store.upsert_setting("refund_on_admin_delete", "true").await.unwrap();
        let inst = bed.seed_instance(1, Some(Utc::now() + Duration::days(30))).await;
        let (order, item) = bed
            .seed_action_order(1, ItemAction::AdminDelete, spec(&[("vps_id", json!(inst.id))]))
            .await;
        bed.services.orders.actions().execute(&order, &item).await.unwrap();

        assert_eq!(bed.ctx.wallet.balance(1).await.unwrap(), inst.monthly_price);
        assert!(bed.store.get_instance(inst.id).await.is_err());
    }
}
