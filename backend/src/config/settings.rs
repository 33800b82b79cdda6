//! # Policy Settings
//!
//! Typed access to the operator-editable knobs kept in the settings
//! store. Values are JSON-encoded strings, but older rows often hold bare
//! text (`true`, `7`, `idcard_cn`), so every parser accepts both.
//!
//! ## Policies
//!
//! | Policy | Keys | Defaults |
//! |--------|------|----------|
//! | [`AutomationSettings`] | `automation_*` | env fallback, enabled, 12s |
//! | [`LogSettings`] | `debug_enabled`, `automation_log_retention_days` | off, keep |
//! | [`EmergencyRenewPolicy`] | `emergency_renew_*` | on, 7d window, 1d, 720h |
//! | [`RefundPolicy`] | `refund_*` | full 1d, prorate 7d, none after 30d |
//! | [`ResizePolicy`] | `resize_*` | remaining, nearest |
//! | [`ProvisionWatchdog`] | `provision_watchdog_*` | 8 jobs, 20 min |
//!
//! Readers never fail: a missing or malformed value falls back to the
//! default, and a storage error is logged and treated as missing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::db::{Id, SettingsRepository};

// ============================================
// RAW VALUE PARSING
// ============================================

/// Unwrap a JSON-encoded string (`"abc"`) or return the trimmed raw text.
fn unquote(raw: &str) -> String {
    let trimmed = raw.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::String(s)) => s.trim().to_string(),
        _ => trimmed.to_string(),
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match unquote(raw).to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

pub fn parse_int(raw: &str) -> Option<i64> {
    unquote(raw).parse::<i64>().ok()
}

/// Parse a decimal money string (`"1"`, `"0.5"`, `"12.34"`) into cents.
///
/// More than two fractional digits are rounded half away from zero.
pub fn parse_cents(raw: &str) -> Option<i64> {
    let text = unquote(raw);
    if text.is_empty() {
        return None;
    }
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.as_str()),
    };
    let (whole, frac) = match digits.split_once('.') {
        Some((w, f)) => (w, f),
        None => (digits, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut frac_digits: Vec<i64> = frac.chars().filter_map(|c| c.to_digit(10)).map(i64::from).collect();
    frac_digits.resize(3, 0);
    let mut cents = frac_digits[0] * 10 + frac_digits[1];
    if frac_digits[2] >= 5 {
        cents += 1;
    }
    let total = whole.checked_mul(100)?.checked_add(cents)?;
    Some(if negative { -total } else { total })
}

/// Parse a JSON list of strings; a bare comma-separated string also works.
fn parse_string_list(raw: &str) -> Option<Vec<String>> {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(Value::Array(items)) => Some(
            items
                .into_iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect(),
        ),
        _ => {
            let text = unquote(raw);
            if text.is_empty() {
                return None;
            }
            Some(
                text.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            )
        }
    }
}

// ============================================
// POLICY TYPES
// ============================================

/// Connection knobs for the HTTP upstream client.
#[derive(Debug, Clone, PartialEq)]
pub struct AutomationSettings {
    pub base_url: String,
    pub api_key: String,
    pub enabled: bool,
    pub timeout_sec: u64,
    pub retry: u32,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogSettings {
    /// When false, successful RPCs are not written to the log sink.
    pub debug_enabled: bool,
    /// Zero keeps rows forever.
    pub retention_days: i64,
}

/// Gate for the zero-priced emergency renewal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmergencyRenewPolicy {
    pub enabled: bool,
    pub window_days: i64,
    pub renew_days: i64,
    pub interval_hours: i64,
}

impl Default for EmergencyRenewPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            window_days: 7,
            renew_days: 1,
            interval_hours: 720,
        }
    }
}

impl EmergencyRenewPolicy {
    fn normalized(mut self) -> Self {
        if self.window_days < 0 {
            self.window_days = 0;
        }
        if self.renew_days <= 0 {
            self.renew_days = 1;
        }
        if self.interval_hours <= 0 {
            self.interval_hours = 24;
        }
        self
    }

    /// True when `now` falls inside the pre-expiry window of `expire_at`.
    pub fn in_window(&self, expire_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(expire_at) = expire_at else {
            return false;
        };
        if now > expire_at {
            return false;
        }
        if self.window_days <= 0 {
            return true;
        }
        now >= expire_at - Duration::days(self.window_days)
    }

    /// True while the previous emergency renewal is still cooling down.
    pub fn in_cooldown(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last {
            Some(last) => now - last < Duration::hours(self.interval_hours),
            None => false,
        }
    }
}

/// One point of the refund curve: at `percent` elapsed, refund `ratio`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RefundCurvePoint {
    pub percent: f64,
    pub ratio: f64,
}

#[derive(Deserialize)]
struct RawCurvePoint {
    percent: Option<f64>,
    hours: Option<f64>,
    #[serde(default)]
    ratio: f64,
}

/// Parse `refund_curve_json`. `hours` is read as a percent when `percent`
/// is absent. Returns `None` for invalid or empty input.
pub fn parse_refund_curve(raw: &str) -> Option<Vec<RefundCurvePoint>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed: Vec<RawCurvePoint> = match serde_json::from_str(raw) {
        Ok(points) => points,
        Err(_) => serde_json::from_str::<String>(raw)
            .ok()
            .and_then(|inner| serde_json::from_str(&inner).ok())?,
    };
    let points: Vec<RefundCurvePoint> = parsed
        .into_iter()
        .filter_map(|p| {
            p.percent.or(p.hours).map(|percent| RefundCurvePoint {
                percent,
                ratio: p.ratio,
            })
        })
        .collect();
    let normalized = crate::services::pricing::normalize_curve(points);
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Refund thresholds plus the optional curve.
#[derive(Debug, Clone, PartialEq)]
pub struct RefundPolicy {
    pub full_hours: i64,
    pub full_days: i64,
    pub prorate_hours: i64,
    pub prorate_days: i64,
    pub no_refund_hours: i64,
    pub no_refund_days: i64,
    pub curve: Option<Vec<RefundCurvePoint>>,
    pub requires_approval: bool,
    pub on_admin_delete: bool,
}

impl Default for RefundPolicy {
    fn default() -> Self {
        Self {
            full_hours: 0,
            full_days: 1,
            prorate_hours: 0,
            prorate_days: 7,
            no_refund_hours: 0,
            no_refund_days: 30,
            curve: None,
            requires_approval: true,
            on_admin_delete: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizePriceMode {
    /// Prorate the monthly delta over the remaining period.
    Remaining,
    /// Charge the full monthly delta.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rounding {
    Nearest,
    Floor,
    Ceil,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResizePolicy {
    pub enabled: bool,
    pub scheduled_enabled: bool,
    pub price_mode: ResizePriceMode,
    pub rounding: Rounding,
    pub min_charge: i64,
    pub min_refund: i64,
    pub refund_to_wallet: bool,
    /// Stored and exposed but not applied to quotes.
    pub refund_ratio: f64,
}

impl Default for ResizePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            scheduled_enabled: true,
            price_mode: ResizePriceMode::Remaining,
            rounding: Rounding::Nearest,
            min_charge: 0,
            min_refund: 0,
            refund_to_wallet: true,
            refund_ratio: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProvisionWatchdog {
    pub max_jobs: usize,
    pub max_minutes: i64,
}

impl Default for ProvisionWatchdog {
    fn default() -> Self {
        Self {
            max_jobs: 8,
            max_minutes: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AutoDeletePolicy {
    pub enabled: bool,
    pub days: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RealNamePolicy {
    pub enabled: bool,
    pub provider: String,
    pub block_actions: HashSet<String>,
}

impl RealNamePolicy {
    pub fn blocks(&self, action: &str) -> bool {
        self.block_actions.iter().any(|a| a.eq_ignore_ascii_case(action.trim()))
    }
}

/// Auto-review triggers that do not depend on the order's contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReviewPolicy {
    /// Orders at or above this total go to review. Zero disables.
    pub amount_threshold: i64,
    pub user_ids: HashSet<Id>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RetentionPolicy {
    pub automation_log_days: i64,
    pub task_run_days: i64,
    pub audit_log_days: i64,
    pub integration_sync_log_days: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
struct PackageCapability {
    #[serde(default, alias = "resize_enabled")]
    resize: Option<bool>,
    #[serde(default, alias = "refund_enabled")]
    refund: Option<bool>,
}

/// Per-package feature switches from `package_capabilities_json`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageCapabilities {
    by_package: HashMap<Id, PackageCapability>,
}

impl PackageCapabilities {
    pub fn parse(raw: &str) -> Self {
        let parsed: HashMap<String, PackageCapability> =
            serde_json::from_str(raw.trim()).unwrap_or_default();
        let by_package = parsed
            .into_iter()
            .filter_map(|(k, v)| k.trim().parse::<Id>().ok().map(|id| (id, v)))
            .collect();
        Self { by_package }
    }

    pub fn resize_allowed(&self, package_id: Id) -> bool {
        self.by_package
            .get(&package_id)
            .and_then(|c| c.resize)
            .unwrap_or(true)
    }

    pub fn refund_allowed(&self, package_id: Id) -> bool {
        self.by_package
            .get(&package_id)
            .and_then(|c| c.refund)
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStrategy {
    Interval,
    Daily,
}

/// Schedule of one lifecycle task, stored under `task.<key>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub enabled: bool,
    pub strategy: TaskStrategy,
    #[serde(default)]
    pub interval_sec: i64,
    #[serde(default)]
    pub daily_at: String,
}

// ============================================
// READER
// ============================================

/// Typed view over the settings store.
///
/// ## Usage
///
/// ```rust,ignore
/// let settings = SettingsReader::new(repos.settings.clone());
/// let policy = settings.refund_policy().await;
/// ```
#[derive(Clone)]
pub struct SettingsReader {
    repo: Arc<dyn SettingsRepository>,
    /// Fallback upstream from the process environment.
    env_base_url: String,
    env_api_key: String,
}

impl SettingsReader {
    pub fn new(repo: Arc<dyn SettingsRepository>) -> Self {
        Self {
            repo,
            env_base_url: String::new(),
            env_api_key: String::new(),
        }
    }

    /// Use these upstream credentials when the store has none.
    pub fn with_env_fallback(mut self, base_url: &str, api_key: &str) -> Self {
        self.env_base_url = base_url.to_string();
        self.env_api_key = api_key.to_string();
        self
    }

    /// Raw stored value, `None` when missing, blank or unreadable.
    pub async fn raw(&self, key: &str) -> Option<String> {
        match self.repo.get_setting(key).await {
            Ok(Some(value)) if !value.trim().is_empty() => Some(value),
            Ok(_) => None,
            Err(e) => {
                warn!("Failed to read setting {}: {}", key, e);
                None
            }
        }
    }

    pub async fn string(&self, key: &str) -> Option<String> {
        self.raw(key).await.map(|v| unquote(&v)).filter(|v| !v.is_empty())
    }

    pub async fn bool(&self, key: &str) -> Option<bool> {
        self.raw(key).await.and_then(|v| parse_bool(&v))
    }

    pub async fn int(&self, key: &str) -> Option<i64> {
        self.raw(key).await.and_then(|v| parse_int(&v))
    }

    pub async fn cents(&self, key: &str) -> Option<i64> {
        self.raw(key).await.and_then(|v| parse_cents(&v))
    }

    pub async fn automation(&self) -> AutomationSettings {
        AutomationSettings {
            base_url: self
                .string("automation_base_url")
                .await
                .unwrap_or_else(|| self.env_base_url.clone()),
            api_key: self
                .string("automation_api_key")
                .await
                .unwrap_or_else(|| self.env_api_key.clone()),
            enabled: self.bool("automation_enabled").await.unwrap_or(true),
            timeout_sec: self
                .int("automation_timeout_sec")
                .await
                .filter(|v| *v > 0)
                .map(|v| v as u64)
                .unwrap_or(12),
            retry: self
                .int("automation_retry")
                .await
                .filter(|v| *v > 0)
                .map(|v| v.min(10) as u32)
                .unwrap_or(0),
            dry_run: self.bool("automation_dry_run").await.unwrap_or(false),
        }
    }

    pub async fn logging(&self) -> LogSettings {
        LogSettings {
            debug_enabled: self.bool("debug_enabled").await.unwrap_or(false),
            retention_days: self
                .int("automation_log_retention_days")
                .await
                .filter(|v| *v > 0)
                .unwrap_or(0),
        }
    }

    pub async fn emergency_renew(&self) -> EmergencyRenewPolicy {
        let defaults = EmergencyRenewPolicy::default();
        let renew_days = match self.int("emergency_renew_days").await {
            Some(v) => v,
            None => self
                .int("emergency_renew_renew_days")
                .await
                .unwrap_or(defaults.renew_days),
        };
        EmergencyRenewPolicy {
            enabled: self
                .bool("emergency_renew_enabled")
                .await
                .unwrap_or(defaults.enabled),
            window_days: self
                .int("emergency_renew_window_days")
                .await
                .unwrap_or(defaults.window_days),
            renew_days,
            interval_hours: self
                .int("emergency_renew_interval_hours")
                .await
                .unwrap_or(defaults.interval_hours),
        }
        .normalized()
    }

    pub async fn refund_policy(&self) -> RefundPolicy {
        let d = RefundPolicy::default();
        RefundPolicy {
            full_hours: self.int("refund_full_hours").await.unwrap_or(d.full_hours),
            full_days: self.int("refund_full_days").await.unwrap_or(d.full_days),
            prorate_hours: self.int("refund_prorate_hours").await.unwrap_or(d.prorate_hours),
            prorate_days: self.int("refund_prorate_days").await.unwrap_or(d.prorate_days),
            no_refund_hours: self.int("refund_no_refund_hours").await.unwrap_or(d.no_refund_hours),
            no_refund_days: self.int("refund_no_refund_days").await.unwrap_or(d.no_refund_days),
            curve: self
                .raw("refund_curve_json")
                .await
                .and_then(|raw| parse_refund_curve(&raw)),
            requires_approval: self
                .bool("refund_requires_approval")
                .await
                .unwrap_or(d.requires_approval),
            on_admin_delete: self
                .bool("refund_on_admin_delete")
                .await
                .unwrap_or(d.on_admin_delete),
        }
    }

    pub async fn resize_policy(&self) -> ResizePolicy {
        let d = ResizePolicy::default();
        let price_mode = match self.string("resize_price_mode").await.as_deref() {
            Some("full") => ResizePriceMode::Full,
            _ => ResizePriceMode::Remaining,
        };
        let rounding = match self.string("resize_rounding").await.as_deref() {
            Some("floor") => Rounding::Floor,
            Some("ceil") => Rounding::Ceil,
            _ => Rounding::Nearest,
        };
        ResizePolicy {
            enabled: self.bool("resize_enabled").await.unwrap_or(d.enabled),
            scheduled_enabled: self
                .bool("resize_scheduled_enabled")
                .await
                .unwrap_or(d.scheduled_enabled),
            price_mode,
            rounding,
            min_charge: self.cents("resize_min_charge").await.unwrap_or(0).max(0),
            min_refund: self.cents("resize_min_refund").await.unwrap_or(0).max(0),
            refund_to_wallet: self
                .bool("resize_refund_to_wallet")
                .await
                .unwrap_or(d.refund_to_wallet),
            refund_ratio: self
                .string("resize_refund_ratio")
                .await
                .and_then(|v| v.parse::<f64>().ok())
                .map(|v| v.clamp(0.0, 1.0))
                .unwrap_or(d.refund_ratio),
        }
    }

    pub async fn provision_watchdog(&self) -> ProvisionWatchdog {
        let d = ProvisionWatchdog::default();
        ProvisionWatchdog {
            max_jobs: self
                .int("provision_watchdog_max_jobs")
                .await
                .filter(|v| *v > 0)
                .map(|v| v as usize)
                .unwrap_or(d.max_jobs),
            max_minutes: self
                .int("provision_watchdog_max_minutes")
                .await
                .filter(|v| *v > 0)
                .unwrap_or(d.max_minutes),
        }
    }

    pub async fn auto_delete(&self) -> AutoDeletePolicy {
        AutoDeletePolicy {
            enabled: self.bool("auto_delete_enabled").await.unwrap_or(false),
            days: self.int("auto_delete_days").await.unwrap_or(0).max(0),
        }
    }

    pub async fn realname(&self) -> RealNamePolicy {
        RealNamePolicy {
            enabled: self.bool("realname_enabled").await.unwrap_or(false),
            provider: self.string("realname_provider").await.unwrap_or_default(),
            block_actions: self
                .raw("realname_block_actions")
                .await
                .and_then(|raw| parse_string_list(&raw))
                .unwrap_or_default()
                .into_iter()
                .collect(),
        }
    }

    pub async fn review(&self) -> ReviewPolicy {
        ReviewPolicy {
            amount_threshold: self
                .int("order_review_amount_threshold")
                .await
                .unwrap_or(0)
                .max(0),
            user_ids: self
                .raw("order_review_user_ids")
                .await
                .and_then(|raw| parse_string_list(&raw))
                .unwrap_or_default()
                .iter()
                .filter_map(|s| s.parse::<Id>().ok())
                .collect(),
        }
    }

    pub async fn retention(&self) -> RetentionPolicy {
        let days = |v: Option<i64>| v.filter(|d| *d > 0).unwrap_or(0);
        RetentionPolicy {
            automation_log_days: days(self.int("automation_log_retention_days").await),
            task_run_days: days(self.int("task_run_retention_days").await),
            audit_log_days: days(self.int("audit_log_retention_days").await),
            integration_sync_log_days: days(self.int("integration_sync_log_retention_days").await),
        }
    }

    pub async fn package_capabilities(&self) -> PackageCapabilities {
        self.raw("package_capabilities_json")
            .await
            .map(|raw| PackageCapabilities::parse(&raw))
            .unwrap_or_default()
    }

    /// Stored schedule for a task, `None` when absent or malformed.
    pub async fn task_config(&self, key: &str) -> Option<TaskConfig> {
        let raw = self.raw(&format!("task.{}", key)).await?;
        match serde_json::from_str(&raw) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                warn!("Ignoring malformed schedule for task {}: {}", key, e);
                None
            }
        }
    }

    pub async fn save_task_config(&self, key: &str, cfg: &TaskConfig) -> Result<(), crate::db::DatabaseError> {
        let raw = serde_json::to_string(cfg)
            .map_err(|e| crate::db::DatabaseError::Decode(e.to_string()))?;
        self.repo.upsert_setting(&format!("task.{}", key), &raw).await
    }
}
