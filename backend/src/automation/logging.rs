//! # RPC Logging Decorator
//!
//! [`LoggingClient`] wraps any [`AutomationClient`] and writes one
//! `automation_logs` row per call:
//!
//! ```text
//! caller ──► LoggingClient ──► inner client
//!                 │
//!                 ├── success + debug off  ──► (nothing)
//!                 ├── success + debug on   ──► RPC envelope
//!                 └── error                ──► RPC envelope, or the
//!                                              decoded http_trace with
//!                                              x-plugin-* headers merged
//! ```
//!
//! The settings and log repositories are injected at construction. Writes
//! are bounded by [`LOG_WRITE_TIMEOUT`] and never fail the call.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use super::trace::{extract_trace, has_trace, sanitize, strip_trace};
use super::*;
use crate::config::settings::SettingsReader;
use crate::db::{AutomationLog, AutomationLogRepository};

/// Upper bound on time spent persisting one log row.
pub const LOG_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Identity of the backend behind a client, recorded with every row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcTarget {
    pub plugin_id: String,
    pub instance_id: String,
    /// `http` for the HTTP upstream, `grpc` for plugin processes.
    pub transport: String,
}

impl RpcTarget {
    pub fn plugin(plugin_id: &str, instance_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            instance_id: instance_id.to_string(),
            transport: "grpc".to_string(),
        }
    }

    pub fn http_upstream() -> Self {
        Self {
            plugin_id: "http".to_string(),
            instance_id: "default".to_string(),
            transport: "http".to_string(),
        }
    }

    fn url(&self, action: &str) -> String {
        format!(
            "{}://automation/{}/{}/{}",
            self.transport,
            or_dash(&self.plugin_id),
            or_dash(&self.instance_id),
            if action.trim().is_empty() { "unknown" } else { action }
        )
    }

    fn headers(&self, action: &str) -> Map<String, Value> {
        let mut headers = Map::new();
        headers.insert("x-transport".into(), json!(self.transport));
        headers.insert("x-plugin-category".into(), json!("automation"));
        headers.insert("x-plugin-id".into(), json!(or_dash(&self.plugin_id)));
        headers.insert("x-plugin-instance-id".into(), json!(or_dash(&self.instance_id)));
        headers.insert("x-rpc-action".into(), json!(action));
        headers
    }
}

fn or_dash(s: &str) -> &str {
    if s.trim().is_empty() {
        "-"
    } else {
        s.trim()
    }
}

/// Build the log row for one finished call.
pub fn build_log(
    target: &RpcTarget,
    log: AutomationLogContext,
    action: &str,
    request: &Value,
    outcome: Result<&Value, &AutomationError>,
    duration_ms: i64,
    now: DateTime<Utc>,
) -> AutomationLog {
    let mut action = action.to_string();
    let mut request_json = json!({
        "method": "RPC",
        "url": target.url(&action),
        "headers": target.headers(&action),
        "body": sanitize(request),
    });
    let (response_json, success, message) = match outcome {
        Ok(body) => {
            let body = sanitize(body);
            (
                json!({
                    "status": 200,
                    "headers": {},
                    "body": body,
                    "format": "json",
                    "body_json": body,
                    "duration_ms": duration_ms,
                }),
                true,
                "ok".to_string(),
            )
        }
        Err(err) => {
            let text = err.message();
            let mut response = json!({
                "status": 500,
                "headers": {},
                "body": strip_trace(&text),
                "format": "text",
                "duration_ms": duration_ms,
            });
            let mut message = strip_trace(&text);
            if let Some(trace) = extract_trace(&text) {
                request_json = merge_request_meta(trace.request, target, &action);
                if !trace.response.is_null() {
                    response = trace.response;
                }
                if !trace.action.trim().is_empty() {
                    action = trace.action;
                }
                if !trace.message.trim().is_empty() {
                    message = trace.message;
                }
            }
            (response, false, message)
        }
    };
    AutomationLog {
        id: 0,
        order_id: log.order_id,
        order_item_id: log.order_item_id,
        action,
        request_json,
        response_json,
        success,
        message,
        created_at: now,
    }
}

/// Keep the relayed HTTP request but stamp it with the RPC metadata.
fn merge_request_meta(request: Value, target: &RpcTarget, action: &str) -> Value {
    let mut map = match request {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if map.get("method").and_then(Value::as_str).map(str::trim).unwrap_or("").is_empty() {
        map.insert("method".into(), json!("RPC"));
    }
    if map.get("url").and_then(Value::as_str).map(str::trim).unwrap_or("").is_empty() {
        map.insert("url".into(), json!(target.url(action)));
    }
    let mut headers = match map.remove("headers") {
        Some(Value::Object(h)) => h,
        _ => Map::new(),
    };
    for (k, v) in target.headers(action) {
        headers.insert(k, v);
    }
    map.insert("headers".into(), Value::Object(headers));
    Value::Object(map)
}

/// Decorator that records every call of the wrapped client.
#[derive(Clone)]
pub struct LoggingClient {
    inner: Arc<dyn AutomationClient>,
    target: RpcTarget,
    settings: SettingsReader,
    logs: Arc<dyn AutomationLogRepository>,
}

impl LoggingClient {
    pub fn new(
        inner: Arc<dyn AutomationClient>,
        target: RpcTarget,
        settings: SettingsReader,
        logs: Arc<dyn AutomationLogRepository>,
    ) -> Self {
        Self {
            inner,
            target,
            settings,
            logs,
        }
    }

    async fn call<T, F>(&self, ctx: &AutomationContext, action: &str, request: Value, fut: F) -> AutomationResult<T>
    where
        T: Serialize + Send,
        F: Future<Output = AutomationResult<T>> + Send,
    {
        let started = Instant::now();
        let out = fut.await;
        let duration_ms = started.elapsed().as_millis() as i64;
        let outcome: Result<Value, AutomationError> = match &out {
            Ok(value) => Ok(serde_json::to_value(value).unwrap_or(Value::Null)),
            Err(err) => Err(err.clone()),
        };
        self.record(ctx, action, &request, outcome.as_ref(), duration_ms).await;
        out.map_err(|err| {
            let text = err.message();
            if has_trace(&text) {
                err.with_message(strip_trace(&text))
            } else {
                err
            }
        })
    }

    async fn record(
        &self,
        ctx: &AutomationContext,
        action: &str,
        request: &Value,
        outcome: Result<&Value, &AutomationError>,
        duration_ms: i64,
    ) {
        let cfg = self.settings.logging().await;
        if !cfg.debug_enabled && outcome.is_ok() {
            return;
        }
        let now = Utc::now();
        let entry = build_log(&self.target, ctx.log, action, request, outcome, duration_ms, now);
        let write = async {
            if cfg.retention_days > 0 {
                self.logs
                    .purge_logs_before(now - chrono::Duration::days(cfg.retention_days))
                    .await?;
            }
            self.logs.create_log(entry).await
        };
        match tokio::time::timeout(LOG_WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to write automation log for {}: {}", action, e),
            Err(_) => warn!("Timed out writing automation log for {}", action),
        }
    }
}

#[async_trait]
impl AutomationClient for LoggingClient {
    async fn create_host(&self, ctx: &AutomationContext, req: &CreateHostRequest) -> AutomationResult<CreateHostResult> {
        let request = serde_json::to_value(req).unwrap_or(Value::Null);
        self.call(ctx, "automation.CreateInstance", request, self.inner.create_host(ctx, req))
            .await
    }

    async fn get_host_info(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<HostInfo> {
        self.call(
            ctx,
            "automation.GetInstance",
            json!({ "host_id": host_id }),
            self.inner.get_host_info(ctx, host_id),
        )
        .await
    }

    async fn list_host_simple(&self, ctx: &AutomationContext, search_tag: &str) -> AutomationResult<Vec<HostSimple>> {
        self.call(
            ctx,
            "automation.ListInstancesSimple",
            json!({ "search_tag": search_tag }),
            self.inner.list_host_simple(ctx, search_tag),
        )
        .await
    }

    async fn elastic_update(&self, ctx: &AutomationContext, req: &ElasticUpdateRequest) -> AutomationResult<()> {
        let request = serde_json::to_value(req).unwrap_or(Value::Null);
        self.call(ctx, "automation.ElasticUpdate", request, self.inner.elastic_update(ctx, req))
            .await
    }

    async fn renew_host(&self, ctx: &AutomationContext, host_id: i64, next_due_at: DateTime<Utc>) -> AutomationResult<()> {
        self.call(
            ctx,
            "automation.Renew",
            json!({ "host_id": host_id, "next_due_at": next_due_at }),
            self.inner.renew_host(ctx, host_id, next_due_at),
        )
        .await
    }

    async fn lock_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.call(ctx, "automation.Lock", json!({ "host_id": host_id }), self.inner.lock_host(ctx, host_id))
            .await
    }

    async fn unlock_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.call(ctx, "automation.Unlock", json!({ "host_id": host_id }), self.inner.unlock_host(ctx, host_id))
            .await
    }

    async fn delete_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.call(ctx, "automation.Destroy", json!({ "host_id": host_id }), self.inner.delete_host(ctx, host_id))
            .await
    }

    async fn start_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.call(ctx, "automation.Start", json!({ "host_id": host_id }), self.inner.start_host(ctx, host_id))
            .await
    }

    async fn shutdown_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.call(
            ctx,
            "automation.Shutdown",
            json!({ "host_id": host_id }),
            self.inner.shutdown_host(ctx, host_id),
        )
        .await
    }

    async fn reboot_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.call(ctx, "automation.Reboot", json!({ "host_id": host_id }), self.inner.reboot_host(ctx, host_id))
            .await
    }

    async fn reset_os(&self, ctx: &AutomationContext, host_id: i64, template_id: i64, password: &str) -> AutomationResult<()> {
        self.call(
            ctx,
            "automation.Rebuild",
            json!({ "host_id": host_id, "template_id": template_id, "password": "***" }),
            self.inner.reset_os(ctx, host_id, template_id, password),
        )
        .await
    }

    async fn reset_os_password(&self, ctx: &AutomationContext, host_id: i64, password: &str) -> AutomationResult<()> {
        self.call(
            ctx,
            "automation.ResetPassword",
            json!({ "host_id": host_id, "password": "***" }),
            self.inner.reset_os_password(ctx, host_id, password),
        )
        .await
    }

    async fn list_snapshots(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        self.call(
            ctx,
            "automation.ListSnapshots",
            json!({ "host_id": host_id }),
            self.inner.list_snapshots(ctx, host_id),
        )
        .await
    }

    async fn create_snapshot(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.call(
            ctx,
            "automation.CreateSnapshot",
            json!({ "host_id": host_id }),
            self.inner.create_snapshot(ctx, host_id),
        )
        .await
    }

    async fn delete_snapshot(&self, ctx: &AutomationContext, host_id: i64, snapshot_id: i64) -> AutomationResult<()> {
        self.call(
            ctx,
            "automation.DeleteSnapshot",
            json!({ "host_id": host_id, "snapshot_id": snapshot_id }),
            self.inner.delete_snapshot(ctx, host_id, snapshot_id),
        )
        .await
    }

    async fn restore_snapshot(&self, ctx: &AutomationContext, host_id: i64, snapshot_id: i64) -> AutomationResult<()> {
        self.call(
            ctx,
            "automation.RestoreSnapshot",
            json!({ "host_id": host_id, "snapshot_id": snapshot_id }),
            self.inner.restore_snapshot(ctx, host_id, snapshot_id),
        )
        .await
    }

    async fn list_backups(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        self.call(
            ctx,
            "automation.ListBackups",
            json!({ "host_id": host_id }),
            self.inner.list_backups(ctx, host_id),
        )
        .await
    }

    async fn create_backup(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.call(
            ctx,
            "automation.CreateBackup",
            json!({ "host_id": host_id }),
            self.inner.create_backup(ctx, host_id),
        )
        .await
    }

    async fn delete_backup(&self, ctx: &AutomationContext, host_id: i64, backup_id: i64) -> AutomationResult<()> {
        self.call(
            ctx,
            "automation.DeleteBackup",
            json!({ "host_id": host_id, "backup_id": backup_id }),
            self.inner.delete_backup(ctx, host_id, backup_id),
        )
        .await
    }

    async fn restore_backup(&self, ctx: &AutomationContext, host_id: i64, backup_id: i64) -> AutomationResult<()> {
        self.call(
            ctx,
            "automation.RestoreBackup",
            json!({ "host_id": host_id, "backup_id": backup_id }),
            self.inner.restore_backup(ctx, host_id, backup_id),
        )
        .await
    }

    async fn list_firewall_rules(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        self.call(
            ctx,
            "automation.ListFirewallRules",
            json!({ "host_id": host_id }),
            self.inner.list_firewall_rules(ctx, host_id),
        )
        .await
    }

    async fn add_firewall_rule(&self, ctx: &AutomationContext, req: &FirewallRuleCreate) -> AutomationResult<()> {
        let request = serde_json::to_value(req).unwrap_or(Value::Null);
        self.call(ctx, "automation.AddFirewallRule", request, self.inner.add_firewall_rule(ctx, req))
            .await
    }

    async fn delete_firewall_rule(&self, ctx: &AutomationContext, host_id: i64, rule_id: i64) -> AutomationResult<()> {
        self.call(
            ctx,
            "automation.DeleteFirewallRule",
            json!({ "host_id": host_id, "rule_id": rule_id }),
            self.inner.delete_firewall_rule(ctx, host_id, rule_id),
        )
        .await
    }

    async fn list_port_mappings(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        self.call(
            ctx,
            "automation.ListPortMappings",
            json!({ "host_id": host_id }),
            self.inner.list_port_mappings(ctx, host_id),
        )
        .await
    }

    async fn add_port_mapping(&self, ctx: &AutomationContext, req: &PortMappingCreate) -> AutomationResult<()> {
        let request = serde_json::to_value(req).unwrap_or(Value::Null);
        self.call(ctx, "automation.AddPortMapping", request, self.inner.add_port_mapping(ctx, req))
            .await
    }

    async fn delete_port_mapping(&self, ctx: &AutomationContext, host_id: i64, mapping_id: i64) -> AutomationResult<()> {
        self.call(
            ctx,
            "automation.DeletePortMapping",
            json!({ "host_id": host_id, "mapping_id": mapping_id }),
            self.inner.delete_port_mapping(ctx, host_id, mapping_id),
        )
        .await
    }

    async fn find_port_candidates(&self, ctx: &AutomationContext, host_id: i64, keywords: &str) -> AutomationResult<Vec<i64>> {
        self.call(
            ctx,
            "automation.FindPortCandidates",
            json!({ "host_id": host_id, "keywords": keywords }),
            self.inner.find_port_candidates(ctx, host_id, keywords),
        )
        .await
    }

    async fn get_panel_url(&self, ctx: &AutomationContext, host_name: &str, panel_password: &str) -> AutomationResult<String> {
        self.call(
            ctx,
            "automation.GetPanelURL",
            json!({ "host_name": host_name, "panel_password": "***" }),
            self.inner.get_panel_url(ctx, host_name, panel_password),
        )
        .await
    }

    async fn get_vnc_url(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<String> {
        self.call(
            ctx,
            "automation.GetVNCURL",
            json!({ "host_id": host_id }),
            self.inner.get_vnc_url(ctx, host_id),
        )
        .await
    }

    async fn list_areas(&self, ctx: &AutomationContext) -> AutomationResult<Vec<Area>> {
        self.call(ctx, "automation.ListAreas", json!({}), self.inner.list_areas(ctx)).await
    }

    async fn list_images(&self, ctx: &AutomationContext, line_id: i64) -> AutomationResult<Vec<Image>> {
        self.call(
            ctx,
            "automation.ListImages",
            json!({ "line_id": line_id }),
            self.inner.list_images(ctx, line_id),
        )
        .await
    }

    async fn list_lines(&self, ctx: &AutomationContext) -> AutomationResult<Vec<Line>> {
        self.call(ctx, "automation.ListLines", json!({}), self.inner.list_lines(ctx)).await
    }

    async fn list_products(&self, ctx: &AutomationContext, line_id: i64) -> AutomationResult<Vec<Product>> {
        self.call(
            ctx,
            "automation.ListPackages",
            json!({ "line_id": line_id }),
            self.inner.list_products(ctx, line_id),
        )
        .await
    }

    async fn get_monitor(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Monitor> {
        self.call(
            ctx,
            "automation.GetMonitor",
            json!({ "host_id": host_id }),
            self.inner.get_monitor(ctx, host_id),
        )
        .await
    }
}
