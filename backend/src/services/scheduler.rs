//! # Lifecycle Scheduler
//!
//! Runs the periodic tasks of the broker. Each task has a schedule stored
//! in settings under `task.<key>`; missing schedules fall back to the
//! table below.
//!
//! | Key | Strategy | Default |
//! |-----|----------|---------|
//! | `order_provision_watchdog` | interval | 5s |
//! | `resize_task_runner` | interval | 30s |
//! | `order_reconciler` | interval | 300s |
//! | `vps_expire_lock` | interval | 300s |
//! | `vps_expire_cleanup` | daily | 03:00 |
//! | `emergency_renew_window` | daily | 09:00 |
//! | `log_retention` | daily | 04:00 |
//!
//! ```text
//!   tick ──► due? ──► try per-key lock ──► ScheduledTaskRun(running)
//!                         │ busy                    │
//!                         ▼                         ▼
//!                        skip             success | failed + message
//! ```
//!
//! Daily times are UTC. A task's last run is read back from the run table,
//! so schedules survive restarts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::ServiceContext;
use super::lifecycle::LifecycleService;
use super::orders::OrderService;
use super::provisioning::ProvisionWorker;
use crate::config::settings::{TaskConfig, TaskStrategy};
use crate::db::ScheduledTaskRun;
use crate::errors::{BrokerError, BrokerResult};

pub mod task_keys {
    pub const ORDER_PROVISION_WATCHDOG: &str = "order_provision_watchdog";
    pub const RESIZE_TASK_RUNNER: &str = "resize_task_runner";
    pub const ORDER_RECONCILER: &str = "order_reconciler";
    pub const VPS_EXPIRE_LOCK: &str = "vps_expire_lock";
    pub const VPS_EXPIRE_CLEANUP: &str = "vps_expire_cleanup";
    pub const EMERGENCY_RENEW_WINDOW: &str = "emergency_renew_window";
    pub const LOG_RETENTION: &str = "log_retention";
}

const FALLBACK_INTERVAL_SEC: i64 = 60;

/// A task the scheduler knows how to run.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub key: &'static str,
    pub name: &'static str,
    pub default: TaskConfig,
}

fn every(key: &'static str, name: &'static str, secs: i64) -> TaskDefinition {
    TaskDefinition {
        key,
        name,
        default: TaskConfig {
            enabled: true,
            strategy: TaskStrategy::Interval,
            interval_sec: secs,
            daily_at: String::new(),
        },
    }
}

fn daily(key: &'static str, name: &'static str, at: &str) -> TaskDefinition {
    TaskDefinition {
        key,
        name,
        default: TaskConfig {
            enabled: true,
            strategy: TaskStrategy::Daily,
            interval_sec: 0,
            daily_at: at.to_string(),
        },
    }
}

pub fn default_tasks() -> Vec<TaskDefinition> {
    use task_keys::*;
    vec![
        every(ORDER_PROVISION_WATCHDOG, "Provision watchdog", 5),
        every(RESIZE_TASK_RUNNER, "Resize task runner", 30),
        every(ORDER_RECONCILER, "Order reconciler", 300),
        every(VPS_EXPIRE_LOCK, "Lock expired VPS", 300),
        daily(VPS_EXPIRE_CLEANUP, "Delete expired VPS", "03:00"),
        daily(EMERGENCY_RENEW_WINDOW, "Emergency renew reminders", "09:00"),
        daily(LOG_RETENTION, "Log retention", "04:00"),
    ]
}

/// Parse `HH:MM`.
pub fn parse_daily_at(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

fn normalized(mut cfg: TaskConfig) -> TaskConfig {
    if cfg.strategy == TaskStrategy::Interval && cfg.interval_sec <= 0 {
        cfg.interval_sec = FALLBACK_INTERVAL_SEC;
    }
    cfg
}

/// Today's daily slot, `None` when `daily_at` does not parse.
fn daily_slot(cfg: &TaskConfig, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let at = parse_daily_at(&cfg.daily_at)?;
    Some(now.date_naive().and_time(at).and_utc())
}

/// Whether a task with `cfg`, last started at `last`, should run at `now`.
pub fn is_due(cfg: &TaskConfig, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    if !cfg.enabled {
        return false;
    }
    match cfg.strategy {
        TaskStrategy::Interval => {
            let every = Duration::seconds(cfg.interval_sec.max(1));
            last.map(|l| now - l >= every).unwrap_or(true)
        }
        TaskStrategy::Daily => match daily_slot(cfg, now) {
            Some(slot) => now >= slot && last.map(|l| l < slot).unwrap_or(true),
            None => false,
        },
    }
}

/// When the task will next become due.
pub fn next_run(cfg: &TaskConfig, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !cfg.enabled {
        return None;
    }
    match cfg.strategy {
        TaskStrategy::Interval => Some(
            last.map(|l| l + Duration::seconds(cfg.interval_sec.max(1)))
                .unwrap_or(now),
        ),
        TaskStrategy::Daily => {
            let slot = daily_slot(cfg, now)?;
            if is_due(cfg, last, now) {
                Some(now)
            } else if now < slot {
                Some(slot)
            } else {
                Some(slot + Duration::days(1))
            }
        }
    }
}

/// Task state as shown to admins.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub key: String,
    pub name: String,
    pub enabled: bool,
    pub strategy: TaskStrategy,
    pub interval_sec: i64,
    pub daily_at: String,
    pub last_run: Option<ScheduledTaskRun>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Partial schedule change.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub strategy: Option<TaskStrategy>,
    #[serde(default)]
    pub interval_sec: Option<i64>,
    #[serde(default)]
    pub daily_at: Option<String>,
}

/// Runs scheduled tasks, never two runs of the same task at once.
///
/// ## Usage
///
/// ```rust,ignore
/// let scheduler = services.scheduler.clone();
/// tokio::spawn(scheduler.run(Duration::from_secs(1), shutdown.clone()));
/// ```
#[derive(Clone)]
pub struct Scheduler {
    ctx: ServiceContext,
    orders: OrderService,
    worker: ProvisionWorker,
    lifecycle: LifecycleService,
    tasks: Arc<Vec<TaskDefinition>>,
    locks: Arc<HashMap<&'static str, Arc<Mutex<()>>>>,
}

impl Scheduler {
    pub fn new(ctx: ServiceContext, orders: OrderService, worker: ProvisionWorker, lifecycle: LifecycleService) -> Self {
        let tasks = default_tasks();
        let locks = tasks
            .iter()
            .map(|t| (t.key, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            ctx,
            orders,
            worker,
            lifecycle,
            tasks: Arc::new(tasks),
            locks: Arc::new(locks),
        }
    }

    fn definition(&self, key: &str) -> BrokerResult<&TaskDefinition> {
        self.tasks
            .iter()
            .find(|t| t.key == key)
            .ok_or_else(|| BrokerError::not_found(format!("task {}", key)))
    }

    /// Effective schedule of a task.
    pub async fn config(&self, key: &str) -> BrokerResult<TaskConfig> {
        let def = self.definition(key)?;
        let cfg = self.ctx.settings.task_config(key).await.unwrap_or_else(|| def.default.clone());
        Ok(normalized(cfg))
    }

    async fn last_run(&self, key: &str) -> BrokerResult<Option<ScheduledTaskRun>> {
        Ok(self.ctx.repos.task_runs.list_runs(key, 1).await?.into_iter().next())
    }

    pub async fn list_tasks(&self) -> BrokerResult<Vec<TaskView>> {
        let now = Utc::now();
        let mut views = Vec::with_capacity(self.tasks.len());
        for def in self.tasks.iter() {
            let cfg = self.config(def.key).await?;
            let last_run = self.last_run(def.key).await?;
            views.push(TaskView {
                key: def.key.to_string(),
                name: def.name.to_string(),
                enabled: cfg.enabled,
                strategy: cfg.strategy,
                interval_sec: cfg.interval_sec,
                daily_at: cfg.daily_at.clone(),
                next_run_at: next_run(&cfg, last_run.as_ref().map(|r| r.started_at), now),
                last_run,
            });
        }
        Ok(views)
    }

    /// Change a task's schedule.
    pub async fn update_task(&self, key: &str, update: TaskUpdate) -> BrokerResult<TaskView> {
        let mut cfg = self.config(key).await?;
        if let Some(enabled) = update.enabled {
            cfg.enabled = enabled;
        }
        if let Some(strategy) = update.strategy {
            cfg.strategy = strategy;
        }
        if let Some(secs) = update.interval_sec {
            cfg.interval_sec = secs;
        }
        if let Some(at) = update.daily_at {
            cfg.daily_at = at.trim().to_string();
        }
        match cfg.strategy {
            TaskStrategy::Interval if cfg.interval_sec <= 0 => {
                return Err(BrokerError::invalid("interval_sec must be positive"));
            }
            TaskStrategy::Daily if parse_daily_at(&cfg.daily_at).is_none() => {
                return Err(BrokerError::invalid("daily_at must be HH:MM"));
            }
            _ => {}
        }
        self.ctx.settings.save_task_config(key, &cfg).await?;
        info!("⏰ Task {} rescheduled: {:?}", key, cfg);
        self.list_tasks()
            .await?
            .into_iter()
            .find(|v| v.key == key)
            .ok_or_else(|| BrokerError::not_found(format!("task {}", key)))
    }

    /// Run a task now, recording the run.
    ///
    /// Fails with `conflict` while another run of the same task is active.
    pub async fn run_task(&self, key: &str) -> BrokerResult<ScheduledTaskRun> {
        let def_key = self.definition(key)?.key;
        let lock = self
            .locks
            .get(def_key)
            .cloned()
            .ok_or_else(|| BrokerError::not_found(format!("task {}", key)))?;
        let Ok(_guard) = lock.try_lock() else {
            return Err(BrokerError::conflict(format!("task {} is already running", key)));
        };

        let started_at = Utc::now();
        let mut run = self
            .ctx
            .repos
            .task_runs
            .create_run(ScheduledTaskRun {
                id: 0,
                task_key: def_key.to_string(),
                status: "running".to_string(),
                started_at,
                finished_at: None,
                duration_sec: 0,
                message: String::new(),
            })
            .await?;

        let result = self.execute(def_key).await;
        let finished_at = Utc::now();
        run.finished_at = Some(finished_at);
        run.duration_sec = (finished_at - started_at).num_seconds();
        match result {
            Ok(message) => {
                debug!("Task {} finished: {}", def_key, message);
                run.status = "success".to_string();
                run.message = message;
            }
            Err(e) => {
                error!("Task {} failed: {}", def_key, e);
                run.status = "failed".to_string();
                run.message = e.to_string();
            }
        }
        self.ctx.repos.task_runs.save_run(&run).await?;
        Ok(run)
    }

    async fn execute(&self, key: &str) -> BrokerResult<String> {
        use task_keys::*;
        let now = Utc::now();
        let message = match key {
            ORDER_PROVISION_WATCHDOG => format!("{} jobs", self.worker.process_provision_jobs(0).await?),
            RESIZE_TASK_RUNNER => format!("{} resize tasks", self.orders.process_resize_tasks(0).await?),
            ORDER_RECONCILER => format!("{} orders changed", self.orders.reconcile_provisioning_orders(0).await?),
            VPS_EXPIRE_LOCK => format!("{} locked", self.lifecycle.auto_lock_expired(now).await?),
            VPS_EXPIRE_CLEANUP => format!("{} deleted", self.lifecycle.auto_delete_expired(now).await?),
            EMERGENCY_RENEW_WINDOW => format!("{} notified", self.lifecycle.notify_emergency_window(now).await?),
            LOG_RETENTION => format!("{} purged", self.lifecycle.purge_expired_logs(now).await?),
            other => return Err(BrokerError::not_found(format!("task {}", other))),
        };
        Ok(message)
    }

    /// Keys of the tasks due at `now`.
    pub async fn due_tasks(&self, now: DateTime<Utc>) -> BrokerResult<Vec<&'static str>> {
        let mut due = Vec::new();
        for def in self.tasks.iter() {
            let cfg = self.config(def.key).await?;
            let last = self.last_run(def.key).await?.map(|r| r.started_at);
            if is_due(&cfg, last, now) {
                due.push(def.key);
            }
        }
        Ok(due)
    }

    /// Check schedules every `tick` until `shutdown` fires. Due tasks run
    /// on their own tasks so a slow one does not hold up the others.
    pub async fn run(self, tick: StdDuration, shutdown: CancellationToken) {
        info!("⏰ Scheduler started with {} tasks", self.tasks.len());
        let mut ticker = interval(tick);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let due = match self.due_tasks(Utc::now()).await {
                Ok(due) => due,
                Err(e) => {
                    warn!("Scheduler tick failed: {}", e);
                    continue;
                }
            };
            for key in due {
                let scheduler = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = scheduler.run_task(key).await {
                        debug!("Task {} skipped: {}", key, e);
                    }
                });
            }
        }
        info!("Scheduler stopped");
    }
}
