//! # Provisioning Worker
//!
//! Create items are not finished inline. Dispatch calls `create_host`,
//! records a provisioning instance and a [`ProvisionJob`]; the worker then
//! polls the remote host until it reaches a terminal state.
//!
//! ```text
//! pending ──picked──► running ──ready (2, 3, 10)──────► done  (item active)
//!    ▲                   │ ──failed (5, 11)───────────► done  (item failed)
//!    │                   │ ──watchdog exceeded─────────► done("timeout")
//!    │                   └─ state 0 / other / error ──► retry
//!    └──────────────── retry delay (5s, 10s, 15s) ◄──────┘
//! ```
//!
//! Ticks are serialized: a tick that starts while another is running
//! returns immediately. Inside a tick, up to `provision_watchdog_max_jobs`
//! jobs run concurrently.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::actions::access_from;
use super::context::ServiceContext;
use super::events::event_types;
use super::pricing;
use super::reconcile::reconcile_order;
use crate::automation::{CreateHostRequest, HostInfo};
use crate::db::{
    AccessInfo, AdminStatus, CartSpec, DatabaseError, InstanceStatus, JobStatus, Order, OrderItem, OrderStatus,
    ProvisionJob, VpsInstance,
};
use crate::errors::{BrokerError, BrokerResult};
use crate::utils::{add_months, host_name_for, random_password};

const DEFAULT_BATCH: i64 = 20;
const DEFAULT_PORT_NUM: i32 = 30;

/// Delay before the next attempt of a retried job.
pub fn retry_delay(attempts: i32) -> Duration {
    match attempts {
        a if a <= 6 => Duration::seconds(5),
        a if a <= 12 => Duration::seconds(10),
        _ => Duration::seconds(15),
    }
}

fn is_ready_state(state: i32) -> bool {
    matches!(state, 2 | 3 | 10)
}

fn is_failed_state(state: i32) -> bool {
    matches!(state, 5 | 11)
}

/// What to do with a job after one step.
#[derive(Debug, Clone, PartialEq)]
enum JobOutcome {
    Retry(String),
    Done(String),
}

#[derive(Clone)]
pub struct ProvisionWorker {
    ctx: ServiceContext,
    tick_lock: Arc<Mutex<()>>,
}

impl ProvisionWorker {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            tick_lock: Arc::new(Mutex::new(())),
        }
    }

    // ============================================
    // DISPATCH
    // ============================================

    /// Ask the backend for a host and queue the job that watches it.
    ///
    /// On success the item is `provisioning` and carries the host id.
    pub async fn start_create_item(&self, order: &Order, item: &mut OrderItem) -> BrokerResult<()> {
        let catalog = &self.ctx.repos.catalog;
        let package = catalog.get_package(item.package_id).await?;
        let goods_type_id = if item.goods_type_id > 0 {
            item.goods_type_id
        } else {
            package.goods_type_id
        };
        let client = self.ctx.client(goods_type_id).await?;
        let plan = catalog.get_plan_group(package.plan_group_id).await?;
        let image = catalog.get_system_image(item.system_id).await?;
        let addons = addons_of(item);

        let now = Utc::now();
        let host_name = host_name_for(order.user_id, now);
        let sys_password = random_password(10);
        let vnc_password = random_password(8);
        let expire_at = add_months(now, item.duration_months);
        let request = CreateHostRequest {
            line_id: plan.line_id,
            os: image.name.clone(),
            cpu: package.cpu + addons.add_cores,
            memory_gb: package.memory_gb + addons.add_mem_gb,
            disk_gb: package.disk_gb + addons.add_disk_gb,
            bandwidth_mbps: package.bandwidth_mbps + addons.add_bw_mbps,
            expire_at,
            host_name: host_name.clone(),
            sys_password: sys_password.clone(),
            vnc_password: vnc_password.clone(),
            port_num: if package.port_num > 0 { package.port_num } else { DEFAULT_PORT_NUM },
            snapshots: 0,
            backups: 0,
        };

        let actx = self.ctx.automation(order.id, item.id);
        let created = client.create_host(&actx, &request).await?;
        let host_id = if created.host_id > 0 {
            created.host_id
        } else {
            client
                .list_host_simple(&actx, &host_name)
                .await?
                .into_iter()
                .find(|h| h.host_name == host_name)
                .map(|h| h.id)
                .unwrap_or(0)
        };
        if host_id <= 0 {
            return Err(BrokerError::Upstream("host id not found".to_string()));
        }
        info!("🖥️ Host {} ({}) requested for order {} item {}", host_id, host_name, order.order_no, item.id);

        let access = AccessInfo {
            os_password: sys_password,
            panel_password: vnc_password.clone(),
            vnc_password,
            ..AccessInfo::default()
        };
        match self.ctx.repos.instances.find_instance_by_item(item.id).await? {
            Some(mut inst) => {
                inst.automation_instance_id = host_id.to_string();
                inst.name = host_name.clone();
                inst.status = InstanceStatus::Provisioning;
                inst.automation_state = 0;
                if inst.expire_at.is_none() {
                    inst.expire_at = Some(expire_at);
                }
                inst.access_info.merge(&access);
                self.ctx.repos.instances.save_instance(&inst).await?;
            }
            None => {
                let mut inst = snapshot_instance(order, item, &package, &plan, &addons, now);
                inst.automation_instance_id = host_id.to_string();
                inst.name = host_name.clone();
                inst.goods_type_id = goods_type_id;
                inst.expire_at = Some(expire_at);
                inst.spec.set_current_period(now, expire_at);
                inst.access_info = access;
                self.ctx.repos.instances.create_instance(inst).await?;
            }
        }

        item.status = OrderStatus::Provisioning;
        item.automation_instance_id = Some(host_id.to_string());
        self.ctx.repos.orders.save_item(item).await?;

        let mut job = self
            .ctx
            .repos
            .jobs
            .upsert_job(ProvisionJob {
                id: 0,
                order_id: order.id,
                order_item_id: item.id,
                host_id,
                host_name,
                status: JobStatus::Pending,
                attempts: 0,
                next_run_at: now,
                last_error: String::new(),
                created_at: now,
                updated_at: now,
            })
            .await?;
        // A re-dispatched item restarts the watchdog clock.
        if job.created_at != now {
            job.created_at = now;
            self.ctx.repos.jobs.save_job(&job).await?;
        }
        Ok(())
    }

    // ============================================
    // WORKER
    // ============================================

    /// Run one tick over the due jobs; returns how many were handled.
    ///
    /// `limit ≤ 0` means the default batch; the batch and the concurrency
    /// are both capped by `provision_watchdog_max_jobs`.
    pub async fn process_provision_jobs(&self, limit: i64) -> BrokerResult<usize> {
        let Ok(_tick) = self.tick_lock.try_lock() else {
            debug!("Provision tick already running, skipping");
            return Ok(0);
        };
        let watchdog = self.ctx.settings.provision_watchdog().await;
        let limit = if limit <= 0 { DEFAULT_BATCH } else { limit }.min(watchdog.max_jobs as i64);

        let jobs = self.ctx.repos.jobs.list_due_jobs(Utc::now(), limit).await?;
        if jobs.is_empty() {
            return Ok(0);
        }
        debug!("Processing {} provision jobs", jobs.len());
        let count = jobs.len();
        stream::iter(jobs)
            .map(|job| self.handle_job(job, watchdog.max_minutes))
            .buffer_unordered(watchdog.max_jobs.max(1))
            .collect::<Vec<()>>()
            .await;
        Ok(count)
    }

    async fn handle_job(&self, mut job: ProvisionJob, max_minutes: i64) {
        let now = Utc::now();
        job.attempts += 1;
        job.status = JobStatus::Running;
        job.last_error.clear();
        job.next_run_at = now + Duration::seconds(5);
        if let Err(e) = self.ctx.repos.jobs.save_job(&job).await {
            error!("Failed to claim provision job {}: {}", job.id, e);
            return;
        }

        let outcome = match self.step(&job, max_minutes, now).await {
            Ok(outcome) => outcome,
            Err(e) => JobOutcome::Retry(e.to_string()),
        };
        match outcome {
            JobOutcome::Retry(reason) => {
                debug!("Provision job {} retry: {}", job.id, reason);
                job.status = JobStatus::Retry;
                job.next_run_at = Utc::now() + retry_delay(job.attempts);
                job.last_error = reason;
            }
            JobOutcome::Done(reason) => {
                info!("Provision job {} done {}", job.id, reason);
                job.status = JobStatus::Done;
                job.next_run_at = Utc::now() + Duration::days(365);
                job.last_error = reason;
            }
        }
        if let Err(e) = self.ctx.repos.jobs.save_job(&job).await {
            error!("Failed to save provision job {}: {}", job.id, e);
        }
    }

    async fn step(&self, job: &ProvisionJob, max_minutes: i64, now: DateTime<Utc>) -> BrokerResult<JobOutcome> {
        let repos = &self.ctx.repos;
        let order = match repos.orders.get_order(job.order_id).await {
            Ok(order) => order,
            Err(DatabaseError::NotFound(_)) => return Ok(JobOutcome::Done("order not found".into())),
            Err(e) => return Err(e.into()),
        };
        let mut item = match repos.orders.get_item(job.order_item_id).await {
            Ok(item) => item,
            Err(DatabaseError::NotFound(_)) => return Ok(JobOutcome::Done("order item not found".into())),
            Err(e) => return Err(e.into()),
        };

        if max_minutes > 0 && now - job.created_at > Duration::minutes(max_minutes) {
            warn!("⏱️ Provision job {} exceeded {} minutes", job.id, max_minutes);
            self.fail_item(&order, &mut item, "timeout").await?;
            return Ok(JobOutcome::Done("timeout".into()));
        }
        if matches!(order.status, OrderStatus::Canceled | OrderStatus::Rejected) {
            return Ok(JobOutcome::Done("order stopped".into()));
        }

        let client = self.ctx.client(item.goods_type_id).await?;
        let actx = self.ctx.automation(order.id, item.id);
        let info = match client.get_host_info(&actx, job.host_id).await {
            Ok(info) => info,
            Err(e) => return Ok(JobOutcome::Retry(e.to_string())),
        };

        if info.state == 0 {
            if let Some(mut inst) = repos.instances.find_instance_by_item(item.id).await? {
                inst.status = InstanceStatus::Provisioning;
                inst.automation_state = 0;
                repos.instances.save_instance(&inst).await?;
            }
            return Ok(JobOutcome::Retry("provisioning".into()));
        }
        if is_failed_state(info.state) {
            if let Some(mut inst) = repos.instances.find_instance_by_item(item.id).await? {
                inst.status = if info.state == 11 {
                    InstanceStatus::Failed
                } else {
                    InstanceStatus::from_automation_state(info.state)
                };
                inst.automation_state = info.state;
                repos.instances.save_instance(&inst).await?;
            }
            let reason = format!("state={}", info.state);
            self.fail_item(&order, &mut item, &reason).await?;
            return Ok(JobOutcome::Done(reason));
        }
        if is_ready_state(info.state) {
            return match self.complete(&order, &mut item, job, &info, now).await {
                Ok(()) => Ok(JobOutcome::Done(String::new())),
                Err(e) => Ok(JobOutcome::Retry(e.to_string())),
            };
        }
        Ok(JobOutcome::Retry(format!("state={}", info.state)))
    }

    async fn fail_item(&self, order: &Order, item: &mut OrderItem, reason: &str) -> BrokerResult<()> {
        item.status = OrderStatus::Failed;
        self.ctx.repos.orders.save_item(item).await?;
        self.ctx
            .events
            .emit(order.id, event_types::ITEM_FAILED, json!({ "item_id": item.id, "reason": reason }))
            .await;
        reconcile_order(&self.ctx, order.id).await?;
        Ok(())
    }

    /// Materialize the instance for a ready host and activate the item.
    async fn complete(
        &self,
        order: &Order,
        item: &mut OrderItem,
        job: &ProvisionJob,
        info: &HostInfo,
        now: DateTime<Utc>,
    ) -> BrokerResult<()> {
        let repos = &self.ctx.repos;
        let expire_at = info
            .expire_at
            .unwrap_or_else(|| add_months(now, item.duration_months));
        let name = if info.host_name.trim().is_empty() {
            job.host_name.clone()
        } else {
            info.host_name.clone()
        };
        let status = InstanceStatus::from_automation_state(info.state);

        match repos.instances.find_instance_by_item(item.id).await? {
            Some(mut inst) => {
                inst.access_info.merge(&access_from(info));
                inst.automation_instance_id = job.host_id.to_string();
                inst.name = name;
                inst.status = status;
                inst.automation_state = info.state;
                inst.expire_at = Some(expire_at);
                if inst.spec.current_period().1.is_none() {
                    inst.spec.set_current_period(now, expire_at);
                }
                repos.instances.save_instance(&inst).await?;
            }
            None => {
                let package = repos.catalog.get_package(item.package_id).await?;
                let plan = repos.catalog.get_plan_group(package.plan_group_id).await?;
                let mut inst = snapshot_instance(order, item, &package, &plan, &addons_of(item), now);
                inst.automation_instance_id = job.host_id.to_string();
                inst.name = name;
                inst.status = status;
                inst.automation_state = info.state;
                inst.expire_at = Some(expire_at);
                inst.access_info = access_from(info);
                inst.spec.set_current_period(now, expire_at);
                repos.instances.create_instance(inst).await?;
            }
        }

        item.status = OrderStatus::Active;
        item.automation_instance_id = Some(job.host_id.to_string());
        repos.orders.save_item(item).await?;
        info!("✅ Order {} item {} active on host {}", order.order_no, item.id, job.host_id);
        self.ctx
            .events
            .emit(order.id, event_types::ITEM_ACTIVE, json!({ "item_id": item.id }))
            .await;
        reconcile_order(&self.ctx, order.id).await?;
        Ok(())
    }

    /// Poll due jobs every `tick` until `shutdown` fires.
    pub async fn run(self, tick: StdDuration, shutdown: CancellationToken) {
        info!("🛠️ Provision worker started (tick {:?})", tick);
        let mut ticker = interval(tick);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.process_provision_jobs(DEFAULT_BATCH).await {
                error!("Provision tick failed: {}", e);
            }
        }
        info!("Provision worker stopped");
    }
}

/// Addons chosen on the item, empty when the spec document carries none.
fn addons_of(item: &OrderItem) -> CartSpec {
    serde_json::from_value(item.spec.to_value()).unwrap_or_default()
}

/// Instance row snapshotting the package and addons at current prices.
fn snapshot_instance(
    order: &Order,
    item: &OrderItem,
    package: &crate::db::Package,
    plan: &crate::db::PlanGroup,
    addons: &CartSpec,
    now: DateTime<Utc>,
) -> VpsInstance {
    VpsInstance {
        id: 0,
        user_id: order.user_id,
        order_item_id: item.id,
        automation_instance_id: String::new(),
        goods_type_id: package.goods_type_id,
        name: String::new(),
        package_id: package.id,
        package_name: package.name.clone(),
        cpu: package.cpu + addons.add_cores,
        memory_gb: package.memory_gb + addons.add_mem_gb,
        disk_gb: package.disk_gb + addons.add_disk_gb,
        bandwidth_mbps: package.bandwidth_mbps + addons.add_bw_mbps,
        port_num: if package.port_num > 0 { package.port_num } else { DEFAULT_PORT_NUM },
        monthly_price: package.monthly_price + pricing::addon_price(plan, addons),
        spec: item.spec.clone(),
        system_id: item.system_id,
        status: InstanceStatus::Provisioning,
        automation_state: 0,
        admin_status: AdminStatus::Normal,
        expire_at: None,
        panel_url_cache: None,
        access_info: AccessInfo::default(),
        last_emergency_renew_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::AutomationError;
    use crate::db::{InstanceRepository, OrderRepository, ProvisionJobRepository};
    use crate::testing::TestBed;

    #[test]
    fn test_retry_delay_steps() {
        assert_eq!(retry_delay(1), Duration::seconds(5));
        assert_eq!(retry_delay(6), Duration::seconds(5));
        assert_eq!(retry_delay(7), Duration::seconds(10));
        assert_eq!(retry_delay(12), Duration::seconds(10));
        assert_eq!(retry_delay(13), Duration::seconds(15));
    }

    async fn dispatched(bed: &TestBed) -> (Order, OrderItem, ProvisionJob) {
        let (order, items) = bed.seed_order(1, OrderStatus::Provisioning, &[OrderStatus::Approved]).await;
        let mut item = items[0].clone();
        bed.services.worker.start_create_item(&order, &mut item).await.unwrap();
        let job = bed.store.find_job_by_item(item.id).await.unwrap().unwrap();
        (order, item, job)
    }

    #[tokio::test]
    async fn test_dispatch_creates_provisioning_instance_and_job() {
        let bed = TestBed::new().await;
        let (_, item, job) = dispatched(&bed).await;

        assert_eq!(item.status, OrderStatus::Provisioning);
        assert_eq!(item.automation_instance_id, Some(job.host_id.to_string()));
        assert_eq!(job.status, JobStatus::Pending);
        let inst = bed.store.find_instance_by_item(item.id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Provisioning);
        assert!(!inst.access_info.os_password.is_empty());

        let created = bed.mock.created_hosts();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].line_id, bed.plan.line_id);
        assert_eq!(created[0].os, bed.image.name);
    }

    #[tokio::test]
    async fn test_redispatch_stores_new_host_credentials() {
        let bed = TestBed::new().await;
        let (order, mut item, first_job) = dispatched(&bed).await;
        let before = bed.store.find_instance_by_item(item.id).await.unwrap().unwrap();

        bed.services.worker.start_create_item(&order, &mut item).await.unwrap();
        let created = bed.mock.created_hosts();
        assert_eq!(created.len(), 2);
        let sent = &created[1];
        assert_ne!(sent.sys_password, created[0].sys_password);

        let inst = bed.store.find_instance_by_item(item.id).await.unwrap().unwrap();
        assert_eq!(inst.id, before.id);
        assert_eq!(inst.access_info.os_password, sent.sys_password);
        assert_eq!(inst.access_info.vnc_password, sent.vnc_password);
        let job = bed.store.find_job_by_item(item.id).await.unwrap().unwrap();
        assert_ne!(job.host_id, first_job.host_id);
        assert_eq!(inst.automation_instance_id, job.host_id.to_string());
    }

    #[tokio::test]
    async fn test_failed_remote_state_fails_item() {
        let bed = TestBed::new().await;
        let (order, item, job) = dispatched(&bed).await;
        bed.mock.set_state(job.host_id, 11);

        assert_eq!(bed.services.worker.process_provision_jobs(0).await.unwrap(), 1);
        let job = bed.store.find_job_by_item(item.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.last_error, "state=11");
        assert_eq!(bed.store.get_item(item.id).await.unwrap().status, OrderStatus::Failed);
        assert_eq!(bed.store.get_order(order.id).await.unwrap().status, OrderStatus::Failed);
        let inst = bed.store.find_instance_by_item(item.id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn test_transport_error_schedules_retry() {
        let bed = TestBed::new().await;
        let (_, item, _) = dispatched(&bed).await;
        bed.mock.fail_with("get_host_info", AutomationError::Transport("timeout".into()));

        bed.services.worker.process_provision_jobs(0).await.unwrap();
        let job = bed.store.find_job_by_item(item.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Retry);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.contains("timeout"));
        assert!(job.next_run_at > Utc::now());
        // not due yet
        assert_eq!(bed.services.worker.process_provision_jobs(0).await.unwrap(), 0);

        bed.mock.clear_failure("get_host_info");
        bed.mock.set_default_state(2);
        bed.expedite_job(item.id).await;
        assert_eq!(bed.services.worker.process_provision_jobs(0).await.unwrap(), 1);
        let job = bed.store.find_job_by_item(item.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(bed.store.get_item(item.id).await.unwrap().status, OrderStatus::Active);
    }

    #[tokio::test]
    async fn test_stopped_order_finishes_job() {
        let bed = TestBed::new().await;
        let (mut order, item, _) = dispatched(&bed).await;
        order.status = OrderStatus::Canceled;
        bed.store.save_order(&order).await.unwrap();

        bed.services.worker.process_provision_jobs(0).await.unwrap();
        let job = bed.store.find_job_by_item(item.id).await.unwrap().unwrap();
        assert_eq!((job.status, job.last_error.as_str()), (JobStatus::Done, "order stopped"));
        assert_eq!(bed.mock.call_count("get_host_info"), 0);
    }
}
