//! # Instance Lifecycle
//!
//! Housekeeping over expired instances and old log rows. Each operation is
//! one pass; the [`Scheduler`](super::scheduler::Scheduler) decides when
//! passes run.
//!
//! | Pass | Selects | Effect |
//! |------|---------|--------|
//! | lock | `expire_at < now`, not locked | `lock_host`, then `expired_locked` + admin `locked` |
//! | delete | `expire_at < now - auto_delete_days` | `delete_host`, row removed, audited |
//! | emergency window | inside the window, not cooling down | user notified |
//! | retention | rows older than their retention | purged |

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use super::context::ServiceContext;
use super::notify::kinds;
use crate::automation::AutomationContext;
use crate::db::{AdminStatus, InstanceStatus, VpsInstance};
use crate::errors::BrokerResult;
use crate::utils::parse_host_id;

#[derive(Clone)]
pub struct LifecycleService {
    ctx: ServiceContext,
}

impl LifecycleService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    fn automation(&self) -> AutomationContext {
        AutomationContext::new(self.ctx.cancel.clone())
    }

    /// Lock every expired instance that is not locked yet.
    pub async fn auto_lock_expired(&self, now: DateTime<Utc>) -> BrokerResult<usize> {
        let mut locked = 0;
        for mut inst in self.ctx.repos.instances.list_expiring(now).await? {
            if !is_expired(&inst, now)
                || matches!(inst.status, InstanceStatus::Locked | InstanceStatus::ExpiredLocked)
                || inst.admin_status == AdminStatus::Locked
            {
                continue;
            }
            let host_id = parse_host_id(&inst.automation_instance_id);
            if host_id > 0 {
                let client = match self.ctx.client(inst.goods_type_id).await {
                    Ok(client) => client,
                    Err(e) => {
                        warn!("No automation client for VPS {}: {}", inst.id, e);
                        continue;
                    }
                };
                if let Err(e) = client.lock_host(&self.automation(), host_id).await {
                    warn!("Failed to lock expired VPS {} (host {}): {}", inst.id, host_id, e);
                    continue;
                }
            }
            inst.status = InstanceStatus::ExpiredLocked;
            inst.admin_status = AdminStatus::Locked;
            self.ctx.repos.instances.save_instance(&inst).await?;
            info!("🔒 VPS {} locked after expiring at {:?}", inst.id, inst.expire_at);
            self.ctx
                .notify(
                    inst.user_id,
                    kinds::VPS_EXPIRED,
                    "VPS Expired",
                    &format!("VPS {} has expired and was locked. Renew it to unlock.", inst.name),
                )
                .await;
            locked += 1;
        }
        Ok(locked)
    }

    /// Delete instances expired for longer than `auto_delete_days`.
    pub async fn auto_delete_expired(&self, now: DateTime<Utc>) -> BrokerResult<usize> {
        let policy = self.ctx.settings.auto_delete().await;
        if !policy.enabled {
            return Ok(0);
        }
        let cutoff = now - Duration::days(policy.days);
        let mut deleted = 0;
        for inst in self.ctx.repos.instances.list_expiring(cutoff).await? {
            if !is_expired(&inst, cutoff) {
                continue;
            }
            let host_id = parse_host_id(&inst.automation_instance_id);
            if host_id > 0 {
                let result = match self.ctx.client(inst.goods_type_id).await {
                    Ok(client) => client.delete_host(&self.automation(), host_id).await.map_err(Into::into),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!("Failed to delete expired VPS {} (host {}): {}", inst.id, host_id, e);
                    continue;
                }
            }
            self.ctx.repos.instances.delete_instance(inst.id).await?;
            info!("🗑️ Expired VPS {} deleted (host {})", inst.id, host_id);
            self.ctx
                .audit(
                    0,
                    "vps.auto_delete",
                    "vps",
                    inst.id,
                    json!({ "host_id": host_id, "expire_at": inst.expire_at }),
                )
                .await;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Tell owners of instances inside the emergency renew window.
    pub async fn notify_emergency_window(&self, now: DateTime<Utc>) -> BrokerResult<usize> {
        let policy = self.ctx.settings.emergency_renew().await;
        if !policy.enabled {
            return Ok(0);
        }
        let horizon = now + Duration::days(policy.window_days.max(0));
        let mut notified = 0;
        for inst in self.ctx.repos.instances.list_expiring(horizon).await? {
            if !policy.in_window(inst.expire_at, now) || policy.in_cooldown(inst.last_emergency_renew_at, now) {
                continue;
            }
            self.ctx
                .notify(
                    inst.user_id,
                    kinds::EMERGENCY_RENEW_AVAILABLE,
                    "VPS Expiring Soon",
                    &format!(
                        "VPS {} expires soon. A free {}-day emergency renewal is available.",
                        inst.name, policy.renew_days
                    ),
                )
                .await;
            notified += 1;
        }
        Ok(notified)
    }

    /// Purge rows past their retention; returns the number removed.
    pub async fn purge_expired_logs(&self, now: DateTime<Utc>) -> BrokerResult<u64> {
        let retention = self.ctx.settings.retention().await;
        let repos = &self.ctx.repos;
        let before = |days: i64| now - Duration::days(days);
        let mut purged = 0;
        if retention.automation_log_days > 0 {
            purged += repos.automation_logs.purge_logs_before(before(retention.automation_log_days)).await?;
        }
        if retention.task_run_days > 0 {
            purged += repos.task_runs.purge_runs_before(before(retention.task_run_days)).await?;
        }
        if retention.audit_log_days > 0 {
            purged += repos.audit.purge_audit_before(before(retention.audit_log_days)).await?;
        }
        if retention.integration_sync_log_days > 0 {
            purged += repos
                .audit
                .purge_sync_logs_before(before(retention.integration_sync_log_days))
                .await?;
        }
        if purged > 0 {
            info!("🧹 Purged {} expired log rows", purged);
        }
        Ok(purged)
    }
}

fn is_expired(inst: &VpsInstance, at: DateTime<Utc>) -> bool {
    inst.expire_at.map(|e| e < at).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::AutomationError;
    use crate::db::{InstanceRepository, SettingsRepository};
    use crate::testing::TestBed;

    #[tokio::test]
    async fn test_lock_expired_instances_once() {
        let bed = TestBed::new().await;
        let expired = bed.seed_instance(1, Some(Utc::now() - Duration::hours(1))).await;
        let live = bed.seed_instance(1, Some(Utc::now() + Duration::days(3))).await;

        assert_eq!(bed.services.lifecycle.auto_lock_expired(Utc::now()).await.unwrap(), 1);
        let locked = bed.store.get_instance(expired.id).await.unwrap();
        assert_eq!(locked.status, InstanceStatus::ExpiredLocked);
        assert_eq!(locked.admin_status, AdminStatus::Locked);
        assert_eq!(bed.store.get_instance(live.id).await.unwrap().status, live.status);
        assert_eq!(bed.sink.kinds_for(1), vec![kinds::VPS_EXPIRED.to_string()]);

        assert_eq!(bed.services.lifecycle.auto_lock_expired(Utc::now()).await.unwrap(), 0);
        assert_eq!(bed.mock.call_count("lock_host"), 1);
        assert_eq!(bed.mock.locked_hosts(), vec![parse_host_id(&expired.automation_instance_id)]);
    }

    #[tokio::test]
    async fn test_failed_remote_lock_leaves_instance() {
        let bed = TestBed::new().await;
        let expired = bed.seed_instance(1, Some(Utc::now() - Duration::hours(1))).await;
        bed.mock.fail_with("lock_host", AutomationError::Transport("reset".into()));

        assert_eq!(bed.services.lifecycle.auto_lock_expired(Utc::now()).await.unwrap(), 0);
        assert_eq!(bed.store.get_instance(expired.id).await.unwrap().admin_status, AdminStatus::Normal);
    }

    #[tokio::test]
    async fn test_auto_delete_respects_grace_days() {
        let bed = TestBed::new().await;
        bed.store.upsert_setting("auto_delete_enabled", "true").await.unwrap();
        bed.store.upsert_setting("auto_delete_days", "7").await.unwrap();
        let old = bed.seed_instance(1, Some(Utc::now() - Duration::days(10))).await;
        let recent = bed.seed_instance(1, Some(Utc::now() - Duration::days(2))).await;

        assert_eq!(bed.services.lifecycle.auto_delete_expired(Utc::now()).await.unwrap(), 1);
        assert!(bed.store.get_instance(old.id).await.is_err());
        assert!(bed.store.get_instance(recent.id).await.is_ok());
        assert_eq!(bed.store.audit_entries()[0].action, "vps.auto_delete");
    }

    #[tokio::test]
    async fn test_auto_delete_disabled_by_default() {
        let bed = TestBed::new().await;
        bed.seed_instance(1, Some(Utc::now() - Duration::days(100))).await;
        assert_eq!(bed.services.lifecycle.auto_delete_expired(Utc::now()).await.unwrap(), 0);
        assert!(bed.mock.deleted_hosts().is_empty());
    }

    #[tokio::test]
    async fn test_emergency_window_notifications() {
        let bed = TestBed::new().await;
        bed.seed_instance(1, Some(Utc::now() + Duration::days(2))).await;
        bed.seed_instance(2, Some(Utc::now() + Duration::days(40))).await;

        assert_eq!(bed.services.lifecycle.notify_emergency_window(Utc::now()).await.unwrap(), 1);
        assert_eq!(bed.sink.kinds_for(1), vec![kinds::EMERGENCY_RENEW_AVAILABLE.to_string()]);
        assert!(bed.sink.kinds_for(2).is_empty());
    }

    #[tokio::test]
    async fn test_retention_purges_old_rows() {
        let bed = TestBed::new().await;
        bed.store.upsert_setting("audit_log_retention_days", "30").await.unwrap();
        bed.ctx.audit(1, "old", "vps", 1, json!({})).await;
        bed.store.record_sync_log(Utc::now() - Duration::days(90));

        // nothing is old enough for the audit rule, the sync log has no rule
        assert_eq!(bed.services.lifecycle.purge_expired_logs(Utc::now()).await.unwrap(), 0);
        assert_eq!(
            bed.services
                .lifecycle
                .purge_expired_logs(Utc::now() + Duration::days(31))
                .await
                .unwrap(),
            1
        );
    }
}
