//! # Automation Module
//!
//! The uniform contract over remote host backends, plus everything that
//! routes calls to a backend and records what happened.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     AUTOMATION LAYER                             │
//! │                                                                  │
//! │   goods_type_id ──► ClientResolver (resolver.rs)                 │
//! │                          │                                       │
//! │                          ▼                                       │
//! │                 LoggingClient (logging.rs)  ──► automation_logs  │
//! │                          │                                       │
//! │            ┌─────────────┴─────────────┐                         │
//! │            ▼                           ▼                         │
//! │   HttpAutomationClient         PluginClient                      │
//! │   (http.rs, code = 1 ok)       (plugin.rs, code = 0 ok)          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every call carries an [`AutomationContext`]: the order/item the call
//! is made for (so log rows are attributed correctly) and a cancellation
//! token that aborts the in-flight request.

pub mod http;
pub mod logging;
pub mod plugin;
pub mod resolver;
pub mod trace;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use http::HttpAutomationClient;
pub use logging::LoggingClient;
pub use plugin::PluginClient;
pub use resolver::{ClientResolver, GoodsTypeResolver};

/// Errors raised by automation clients.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AutomationError {
    /// The backend does not implement this operation.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The backend answered with a business failure.
    #[error("Automation error: {0}")]
    Upstream(String),

    /// The request never produced a usable response.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The response could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The goods type is not bound to an automation backend.
    #[error("Invalid automation binding: {0}")]
    InvalidBinding(String),

    #[error("Automation call cancelled")]
    Cancelled,

    #[error("Automation is disabled")]
    Disabled,
}

impl AutomationError {
    /// The inner message without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            AutomationError::NotSupported(m)
            | AutomationError::Upstream(m)
            | AutomationError::Transport(m)
            | AutomationError::Decode(m)
            | AutomationError::InvalidBinding(m) => m.clone(),
            AutomationError::Cancelled => "cancelled".to_string(),
            AutomationError::Disabled => "automation disabled".to_string(),
        }
    }

    /// Same kind, different message.
    pub fn with_message(&self, message: String) -> Self {
        match self {
            AutomationError::NotSupported(_) => AutomationError::NotSupported(message),
            AutomationError::Upstream(_) => AutomationError::Upstream(message),
            AutomationError::Transport(_) => AutomationError::Transport(message),
            AutomationError::Decode(_) => AutomationError::Decode(message),
            AutomationError::InvalidBinding(_) => AutomationError::InvalidBinding(message),
            other => other.clone(),
        }
    }
}

pub type AutomationResult<T> = Result<T, AutomationError>;

// ============================================
// CALL CONTEXT
// ============================================

/// The order/item an RPC is made for. Zero means "not order-scoped".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutomationLogContext {
    pub order_id: i64,
    pub order_item_id: i64,
}

/// Per-call context threaded through every client method.
#[derive(Debug, Clone, Default)]
pub struct AutomationContext {
    pub log: AutomationLogContext,
    pub cancel: CancellationToken,
}

impl AutomationContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            log: AutomationLogContext::default(),
            cancel,
        }
    }

    /// Attribute subsequent calls to an order item.
    pub fn for_item(&self, order_id: i64, order_item_id: i64) -> Self {
        Self {
            log: AutomationLogContext {
                order_id,
                order_item_id,
            },
            cancel: self.cancel.clone(),
        }
    }

    /// Race `fut` against cancellation.
    pub async fn run<T, F>(&self, fut: F) -> AutomationResult<T>
    where
        F: std::future::Future<Output = AutomationResult<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AutomationError::Cancelled),
            out = fut => out,
        }
    }
}

// ============================================
// REQUEST / RESPONSE TYPES
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateHostRequest {
    pub line_id: i64,
    pub os: String,
    pub cpu: i32,
    pub memory_gb: i32,
    pub disk_gb: i32,
    pub bandwidth_mbps: i32,
    pub expire_at: DateTime<Utc>,
    pub host_name: String,
    pub sys_password: String,
    pub vnc_password: String,
    pub port_num: i32,
    pub snapshots: i32,
    pub backups: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateHostResult {
    pub host_id: i64,
    /// Backend payload as returned, for diagnostics.
    pub raw: Value,
}

/// Remote view of a host. `state = 0` means still being created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostInfo {
    pub host_id: i64,
    pub host_name: String,
    pub state: i32,
    pub cpu: i32,
    pub memory_gb: i32,
    pub disk_gb: i32,
    pub bandwidth_mbps: i32,
    pub panel_password: String,
    pub vnc_password: String,
    pub os_password: String,
    pub remote_ip: String,
    pub expire_at: Option<DateTime<Utc>>,
}

impl HostInfo {
    pub fn creating(host_id: i64) -> Self {
        Self {
            host_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSimple {
    pub id: i64,
    pub host_name: String,
    pub ip: String,
}

/// Capacity change; `None` leaves a dimension untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticUpdateRequest {
    pub host_id: i64,
    pub cpu: Option<i32>,
    pub memory_gb: Option<i32>,
    pub disk_gb: Option<i32>,
    pub bandwidth_mbps: Option<i32>,
    pub port_num: Option<i32>,
}

/// Schema-loose record returned by list endpoints (snapshots, backups,
/// firewall rules, port mappings).
pub type RemoteRecord = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallRuleCreate {
    pub host_id: i64,
    pub direction: String,
    pub protocol: String,
    pub method: String,
    pub port: String,
    pub ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortMappingCreate {
    pub host_id: i64,
    pub name: String,
    pub sport: String,
    pub dport: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Area {
    pub id: i64,
    pub name: String,
    pub state: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Image {
    pub id: i64,
    pub name: String,
    pub image_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Line {
    pub id: i64,
    pub name: String,
    pub area_id: i64,
    pub state: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub cpu: i32,
    pub memory_gb: i32,
    pub disk_gb: i32,
    pub bandwidth_mbps: i32,
    /// Cents.
    pub price: i64,
    pub port_num: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Monitor {
    pub cpu_pct: i32,
    pub mem_pct: i32,
    pub storage_pct: i32,
    pub bytes_in: i64,
    pub bytes_out: i64,
}

/// Extract `(bytes_in, bytes_out)` from a monitor `network_stats` value.
///
/// Accepts the legacy object `{BytesSentPersec, BytesReceivedPersec}` or a
/// time series `[[t, in, out], ...]`, in which case the last sample wins.
pub fn parse_network_stats(raw: &Value) -> (i64, i64) {
    let as_i64 = |v: &Value| match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Value::String(s) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(0),
        _ => 0,
    };
    match raw {
        Value::Object(map) => {
            let sent = map.get("BytesSentPersec").map(as_i64).unwrap_or(0);
            let received = map.get("BytesReceivedPersec").map(as_i64).unwrap_or(0);
            (received, sent)
        }
        Value::Array(series) => match series.last() {
            Some(Value::Array(sample)) if sample.len() >= 3 => (as_i64(&sample[1]), as_i64(&sample[2])),
            _ => (0, 0),
        },
        Value::String(s) => serde_json::from_str::<Value>(s)
            .map(|inner| match inner {
                Value::String(_) => (0, 0),
                other => parse_network_stats(&other),
            })
            .unwrap_or((0, 0)),
        _ => (0, 0),
    }
}

// ============================================
// CLIENT CONTRACT
// ============================================

/// Operations every automation backend offers.
///
/// Implementations must report a host that is still being created as
/// `HostInfo { state: 0, .. }`, never as an error, and must surface an
/// "unimplemented" answer as [`AutomationError::NotSupported`].
#[async_trait]
pub trait AutomationClient: Send + Sync {
    async fn create_host(&self, ctx: &AutomationContext, req: &CreateHostRequest) -> AutomationResult<CreateHostResult>;
    async fn get_host_info(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<HostInfo>;
    async fn list_host_simple(&self, ctx: &AutomationContext, search_tag: &str) -> AutomationResult<Vec<HostSimple>>;
    async fn elastic_update(&self, ctx: &AutomationContext, req: &ElasticUpdateRequest) -> AutomationResult<()>;
    async fn renew_host(&self, ctx: &AutomationContext, host_id: i64, next_due_at: DateTime<Utc>) -> AutomationResult<()>;
    async fn lock_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()>;
    async fn unlock_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()>;
    async fn delete_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()>;
    async fn start_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()>;
    async fn shutdown_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()>;
    async fn reboot_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()>;
    async fn reset_os(&self, ctx: &AutomationContext, host_id: i64, template_id: i64, password: &str) -> AutomationResult<()>;
    async fn reset_os_password(&self, ctx: &AutomationContext, host_id: i64, password: &str) -> AutomationResult<()>;

    async fn list_snapshots(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>>;
    async fn create_snapshot(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()>;
    async fn delete_snapshot(&self, ctx: &AutomationContext, host_id: i64, snapshot_id: i64) -> AutomationResult<()>;
    async fn restore_snapshot(&self, ctx: &AutomationContext, host_id: i64, snapshot_id: i64) -> AutomationResult<()>;
    async fn list_backups(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>>;
    async fn create_backup(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()>;
    async fn delete_backup(&self, ctx: &AutomationContext, host_id: i64, backup_id: i64) -> AutomationResult<()>;
    async fn restore_backup(&self, ctx: &AutomationContext, host_id: i64, backup_id: i64) -> AutomationResult<()>;

    async fn list_firewall_rules(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>>;
    async fn add_firewall_rule(&self, ctx: &AutomationContext, req: &FirewallRuleCreate) -> AutomationResult<()>;
    async fn delete_firewall_rule(&self, ctx: &AutomationContext, host_id: i64, rule_id: i64) -> AutomationResult<()>;
    async fn list_port_mappings(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>>;
    async fn add_port_mapping(&self, ctx: &AutomationContext, req: &PortMappingCreate) -> AutomationResult<()>;
    async fn delete_port_mapping(&self, ctx: &AutomationContext, host_id: i64, mapping_id: i64) -> AutomationResult<()>;
    async fn find_port_candidates(&self, ctx: &AutomationContext, host_id: i64, keywords: &str) -> AutomationResult<Vec<i64>>;

    async fn get_panel_url(&self, ctx: &AutomationContext, host_name: &str, panel_password: &str) -> AutomationResult<String>;
    async fn get_vnc_url(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<String>;

    async fn list_areas(&self, ctx: &AutomationContext) -> AutomationResult<Vec<Area>>;
    async fn list_images(&self, ctx: &AutomationContext, line_id: i64) -> AutomationResult<Vec<Image>>;
    async fn list_lines(&self, ctx: &AutomationContext) -> AutomationResult<Vec<Line>>;
    async fn list_products(&self, ctx: &AutomationContext, line_id: i64) -> AutomationResult<Vec<Product>>;
    async fn get_monitor(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Monitor>;
}

/// Read an integer that may arrive as a number or a numeric string.
pub(crate) fn value_i64(v: Option<&Value>) -> i64 {
    match v {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

pub(crate) fn value_str(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}
