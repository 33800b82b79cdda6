//! # Plugin Client
//!
//! Automation backends that run as separate plugin processes are reached
//! over a small JSON RPC:
//!
//! ```text
//! POST <endpoint>/rpc/automation.GetInstance
//! Authorization: Bearer <token>
//! {"instance_id": 981}
//!
//! ◄── {"code": 0, "msg": "", "data": {"instance": {...}}}
//! ◄── {"code": "unimplemented", "msg": "snapshots"}   → NotSupported
//! ◄── HTTP 501                                       → NotSupported
//! ```
//!
//! Mutating calls answer with an operation envelope `{status, msg, other}`;
//! any status outside `ok | success | succeeded | 1 | 200` (or empty) is a
//! failure. A plugin that proxies an HTTP upstream may append an
//! `http_trace=` suffix to its message; it is kept intact so the log sink
//! can record the upstream exchange.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::debug;

use super::trace::map_business_error;
use super::*;
use crate::config::PluginInstanceConfig;

/// Client for one plugin instance.
#[derive(Clone)]
pub struct PluginClient {
    http: reqwest::Client,
    plugin_id: String,
    instance_id: String,
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
}

impl PluginClient {
    pub fn new(cfg: &PluginInstanceConfig, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            plugin_id: cfg.plugin_id.clone(),
            instance_id: cfg.instance_id.clone(),
            endpoint: cfg.endpoint.trim().trim_end_matches('/').to_string(),
            token: cfg.token.clone().filter(|t| !t.trim().is_empty()),
            timeout,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Invoke `action` and return the `data` member of a `code = 0` reply.
    async fn rpc(&self, ctx: &AutomationContext, action: &str, params: Value) -> AutomationResult<Value> {
        let url = format!("{}/rpc/{}", self.endpoint, action);
        debug!("Plugin RPC {}/{} {}", self.plugin_id, self.instance_id, action);

        let mut builder = self.http.post(&url).timeout(self.timeout).json(&params);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let (status, body) = ctx
            .run(async {
                let response = builder
                    .send()
                    .await
                    .map_err(|e| AutomationError::Transport(e.to_string()))?;
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .map_err(|e| AutomationError::Transport(e.to_string()))?;
                Ok((status, body))
            })
            .await?;

        if status == StatusCode::NOT_IMPLEMENTED {
            return Err(AutomationError::NotSupported(not_supported_message(&body, action)));
        }

        let parsed: Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(e) if status.is_success() => {
                return Err(AutomationError::Decode(format!("{}: {}", action, e)));
            }
            Err(_) => {
                let text = if body.trim().is_empty() {
                    format!("{} failed: http {}", action, status.as_u16())
                } else {
                    body
                };
                return Err(AutomationError::Upstream(map_business_error(&text)));
            }
        };

        let msg = value_str(parsed.get("msg"));
        match parsed.get("code") {
            Some(Value::String(code)) if code.eq_ignore_ascii_case("unimplemented") => {
                Err(AutomationError::NotSupported(not_supported_message(&msg, action)))
            }
            Some(code) if value_i64(Some(code)) == 0 && status.is_success() => {
                Ok(parsed.get("data").cloned().unwrap_or(Value::Null))
            }
            _ => {
                let text = if msg.trim().is_empty() {
                    format!("{} failed", action)
                } else {
                    msg
                };
                Err(AutomationError::Upstream(map_business_error(&text)))
            }
        }
    }

    /// Invoke a mutating action and check its operation envelope.
    async fn op(&self, ctx: &AutomationContext, action: &str, params: Value) -> AutomationResult<()> {
        let data = self.rpc(ctx, action, params).await?;
        ensure_op_ok(&data)
    }

    async fn items(&self, ctx: &AutomationContext, action: &str, params: Value) -> AutomationResult<Vec<RemoteRecord>> {
        let data = self.rpc(ctx, action, params).await?;
        Ok(data
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_object().cloned()).collect())
            .unwrap_or_default())
    }
}

fn not_supported_message(raw: &str, action: &str) -> String {
    let msg = raw.trim();
    if msg.is_empty() {
        format!("{} not supported", action)
    } else {
        msg.to_string()
    }
}

fn ensure_op_ok(data: &Value) -> AutomationResult<()> {
    let status = value_str(data.get("status")).trim().to_ascii_lowercase();
    if matches!(status.as_str(), "" | "ok" | "success" | "succeeded" | "1" | "200") {
        return Ok(());
    }
    let msg = value_str(data.get("msg"));
    let msg = if msg.trim().is_empty() { "operation failed".to_string() } else { msg.trim().to_string() };
    let other = value_str(data.get("other"));
    if other.trim().is_empty() {
        Err(AutomationError::Upstream(msg))
    } else {
        Err(AutomationError::Upstream(format!("{} ({})", msg, other.trim())))
    }
}

fn unix_time(v: Option<&Value>) -> Option<DateTime<Utc>> {
    let secs = value_i64(v);
    if secs <= 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}

#[async_trait]
impl AutomationClient for PluginClient {
    async fn create_host(&self, ctx: &AutomationContext, req: &CreateHostRequest) -> AutomationResult<CreateHostResult> {
        let data = self
            .rpc(
                ctx,
                "automation.CreateInstance",
                json!({
                    "line_id": req.line_id,
                    "os": req.os,
                    "name": req.host_name,
                    "password": req.sys_password,
                    "vnc_password": req.vnc_password,
                    "expire_at_unix": req.expire_at.timestamp(),
                    "port_num": req.port_num,
                    "cpu": req.cpu,
                    "memory_gb": req.memory_gb,
                    "disk_gb": req.disk_gb,
                    "bandwidth_mbps": req.bandwidth_mbps,
                }),
            )
            .await?;
        let host_id = value_i64(data.get("instance_id"));
        Ok(CreateHostResult {
            host_id,
            raw: json!({ "instance_id": host_id }),
        })
    }

    async fn get_host_info(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<HostInfo> {
        let data = self
            .rpc(ctx, "automation.GetInstance", json!({ "instance_id": host_id }))
            .await?;
        let inst = data.get("instance").unwrap_or(&Value::Null);
        Ok(HostInfo {
            host_id: value_i64(inst.get("id")),
            host_name: value_str(inst.get("name")),
            state: value_i64(inst.get("state")) as i32,
            cpu: value_i64(inst.get("cpu")) as i32,
            memory_gb: value_i64(inst.get("memory_gb")) as i32,
            disk_gb: value_i64(inst.get("disk_gb")) as i32,
            bandwidth_mbps: value_i64(inst.get("bandwidth_mbps")) as i32,
            panel_password: value_str(inst.get("panel_password")),
            vnc_password: value_str(inst.get("vnc_password")),
            os_password: value_str(inst.get("os_password")),
            remote_ip: value_str(inst.get("remote_ip")),
            expire_at: unix_time(inst.get("expire_at_unix")),
        })
    }

    async fn list_host_simple(&self, ctx: &AutomationContext, search_tag: &str) -> AutomationResult<Vec<HostSimple>> {
        let items = self
            .items(ctx, "automation.ListInstancesSimple", json!({ "search_tag": search_tag }))
            .await?;
        Ok(items
            .iter()
            .map(|m| HostSimple {
                id: value_i64(m.get("id")),
                host_name: value_str(m.get("name")),
                ip: value_str(m.get("ip")),
            })
            .collect())
    }

    async fn elastic_update(&self, ctx: &AutomationContext, req: &ElasticUpdateRequest) -> AutomationResult<()> {
        let mut params = json!({ "instance_id": req.host_id });
        for (key, value) in [
            ("cpu", req.cpu),
            ("memory_gb", req.memory_gb),
            ("disk_gb", req.disk_gb),
            ("bandwidth_mbps", req.bandwidth_mbps),
            ("port_num", req.port_num),
        ] {
            if let (Some(v), Value::Object(map)) = (value, &mut params) {
                map.insert(key.to_string(), json!(v));
            }
        }
        self.op(ctx, "automation.ElasticUpdate", params).await
    }

    async fn renew_host(&self, ctx: &AutomationContext, host_id: i64, next_due_at: DateTime<Utc>) -> AutomationResult<()> {
        self.op(
            ctx,
            "automation.Renew",
            json!({ "instance_id": host_id, "next_due_at_unix": next_due_at.timestamp() }),
        )
        .await
    }

    async fn lock_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.op(ctx, "automation.Lock", json!({ "instance_id": host_id })).await
    }

    async fn unlock_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.op(ctx, "automation.Unlock", json!({ "instance_id": host_id })).await
    }

    async fn delete_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.op(ctx, "automation.Destroy", json!({ "instance_id": host_id })).await
    }

    async fn start_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.op(ctx, "automation.Start", json!({ "instance_id": host_id })).await
    }

    async fn shutdown_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.op(ctx, "automation.Shutdown", json!({ "instance_id": host_id })).await
    }

    async fn reboot_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.op(ctx, "automation.Reboot", json!({ "instance_id": host_id })).await
    }

    async fn reset_os(&self, ctx: &AutomationContext, host_id: i64, template_id: i64, password: &str) -> AutomationResult<()> {
        self.op(
            ctx,
            "automation.Rebuild",
            json!({ "instance_id": host_id, "image_id": template_id, "password": password }),
        )
        .await
    }

    async fn reset_os_password(&self, ctx: &AutomationContext, host_id: i64, password: &str) -> AutomationResult<()> {
        self.op(
            ctx,
            "automation.ResetPassword",
            json!({ "instance_id": host_id, "password": password }),
        )
        .await
    }

    async fn list_snapshots(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        self.items(ctx, "automation.ListSnapshots", json!({ "instance_id": host_id })).await
    }

    async fn create_snapshot(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.op(ctx, "automation.CreateSnapshot", json!({ "instance_id": host_id })).await
    }

    async fn delete_snapshot(&self, ctx: &AutomationContext, host_id: i64, snapshot_id: i64) -> AutomationResult<()> {
        self.op(
            ctx,
            "automation.DeleteSnapshot",
            json!({ "instance_id": host_id, "snapshot_id": snapshot_id }),
        )
        .await
    }

    async fn restore_snapshot(&self, ctx: &AutomationContext, host_id: i64, snapshot_id: i64) -> AutomationResult<()> {
        self.op(
            ctx,
            "automation.RestoreSnapshot",
            json!({ "instance_id": host_id, "snapshot_id": snapshot_id }),
        )
        .await
    }

    async fn list_backups(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        self.items(ctx, "automation.ListBackups", json!({ "instance_id": host_id })).await
    }

    async fn create_backup(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.op(ctx, "automation.CreateBackup", json!({ "instance_id": host_id })).await
    }

    async fn delete_backup(&self, ctx: &AutomationContext, host_id: i64, backup_id: i64) -> AutomationResult<()> {
        self.op(
            ctx,
            "automation.DeleteBackup",
            json!({ "instance_id": host_id, "backup_id": backup_id }),
        )
        .await
    }

    async fn restore_backup(&self, ctx: &AutomationContext, host_id: i64, backup_id: i64) -> AutomationResult<()> {
        self.op(
            ctx,
            "automation.RestoreBackup",
            json!({ "instance_id": host_id, "backup_id": backup_id }),
        )
        .await
    }

    async fn list_firewall_rules(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        self.items(ctx, "automation.ListFirewallRules", json!({ "instance_id": host_id })).await
    }

    async fn add_firewall_rule(&self, ctx: &AutomationContext, req: &FirewallRuleCreate) -> AutomationResult<()> {
        self.op(
            ctx,
            "automation.AddFirewallRule",
            json!({
                "instance_id": req.host_id,
                "direction": req.direction,
                "protocol": req.protocol,
                "method": req.method,
                "port": req.port,
                "ip": req.ip,
            }),
        )
        .await
    }

    async fn delete_firewall_rule(&self, ctx: &AutomationContext, host_id: i64, rule_id: i64) -> AutomationResult<()> {
        self.op(
            ctx,
            "automation.DeleteFirewallRule",
            json!({ "instance_id": host_id, "rule_id": rule_id }),
        )
        .await
    }

    async fn list_port_mappings(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        self.items(ctx, "automation.ListPortMappings", json!({ "instance_id": host_id })).await
    }

    async fn add_port_mapping(&self, ctx: &AutomationContext, req: &PortMappingCreate) -> AutomationResult<()> {
        self.op(
            ctx,
            "automation.AddPortMapping",
            json!({
                "instance_id": req.host_id,
                "name": req.name,
                "sport": req.sport,
                "dport": req.dport,
            }),
        )
        .await
    }

    async fn delete_port_mapping(&self, ctx: &AutomationContext, host_id: i64, mapping_id: i64) -> AutomationResult<()> {
        self.op(
            ctx,
            "automation.DeletePortMapping",
            json!({ "instance_id": host_id, "mapping_id": mapping_id }),
        )
        .await
    }

    async fn find_port_candidates(&self, ctx: &AutomationContext, host_id: i64, keywords: &str) -> AutomationResult<Vec<i64>> {
        let data = self
            .rpc(
                ctx,
                "automation.FindPortCandidates",
                json!({ "instance_id": host_id, "keywords": keywords }),
            )
            .await?;
        Ok(data
            .get("ports")
            .and_then(Value::as_array)
            .map(|ports| ports.iter().map(|p| value_i64(Some(p))).collect())
            .unwrap_or_default())
    }

    async fn get_panel_url(&self, ctx: &AutomationContext, host_name: &str, panel_password: &str) -> AutomationResult<String> {
        let data = self
            .rpc(
                ctx,
                "automation.GetPanelURL",
                json!({ "instance_name": host_name, "panel_password": panel_password }),
            )
            .await?;
        Ok(value_str(data.get("url")))
    }

    async fn get_vnc_url(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<String> {
        let data = self
            .rpc(ctx, "automation.GetVNCURL", json!({ "instance_id": host_id }))
            .await?;
        Ok(value_str(data.get("url")))
    }

    async fn list_areas(&self, ctx: &AutomationContext) -> AutomationResult<Vec<Area>> {
        let items = self.items(ctx, "automation.ListAreas", json!({})).await?;
        Ok(items
            .iter()
            .map(|m| Area {
                id: value_i64(m.get("id")),
                name: value_str(m.get("name")),
                state: value_i64(m.get("state")) as i32,
            })
            .collect())
    }

    async fn list_images(&self, ctx: &AutomationContext, line_id: i64) -> AutomationResult<Vec<Image>> {
        let items = self
            .items(ctx, "automation.ListImages", json!({ "line_id": line_id }))
            .await?;
        Ok(items
            .iter()
            .map(|m| Image {
                id: value_i64(m.get("id")),
                name: value_str(m.get("name")),
                image_type: value_str(m.get("type")),
            })
            .collect())
    }

    async fn list_lines(&self, ctx: &AutomationContext) -> AutomationResult<Vec<Line>> {
        let items = self.items(ctx, "automation.ListLines", json!({})).await?;
        Ok(items
            .iter()
            .map(|m| Line {
                id: value_i64(m.get("id")),
                name: value_str(m.get("name")),
                area_id: value_i64(m.get("area_id")),
                state: value_i64(m.get("state")) as i32,
            })
            .collect())
    }

    async fn list_products(&self, ctx: &AutomationContext, line_id: i64) -> AutomationResult<Vec<Product>> {
        let items = self
            .items(ctx, "automation.ListPackages", json!({ "line_id": line_id }))
            .await?;
        Ok(items
            .iter()
            .map(|m| Product {
                id: value_i64(m.get("id")),
                name: value_str(m.get("name")),
                cpu: value_i64(m.get("cpu")) as i32,
                memory_gb: value_i64(m.get("memory_gb")) as i32,
                disk_gb: value_i64(m.get("disk_gb")) as i32,
                bandwidth_mbps: value_i64(m.get("bandwidth_mbps")) as i32,
                price: value_i64(m.get("monthly_price")),
                port_num: value_i64(m.get("port_num")) as i32,
            })
            .collect())
    }

    /// The plugin relays the panel's raw monitor JSON.
    async fn get_monitor(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Monitor> {
        let data = self
            .rpc(ctx, "automation.GetMonitor", json!({ "instance_id": host_id }))
            .await?;
        let raw = value_str(data.get("raw_json"));
        if raw.trim().is_empty() {
            return Ok(Monitor::default());
        }
        let stats: Value = serde_json::from_str(&raw)
            .map_err(|e| AutomationError::Decode(format!("monitor: {}", e)))?;
        let pct = |key: &str| stats.get(key).and_then(Value::as_f64).unwrap_or(0.0).round() as i32;
        let (bytes_in, bytes_out) = parse_network_stats(stats.get("NetworkStats").unwrap_or(&Value::Null));
        Ok(Monitor {
            cpu_pct: pct("CpuStats"),
            mem_pct: pct("MemoryStats"),
            storage_pct: pct("StorageStats"),
            bytes_in,
            bytes_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{bearer_token, body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer) -> PluginClient {
        PluginClient::new(
            &PluginInstanceConfig {
                plugin_id: "lightboat".into(),
                instance_id: "hk-1".into(),
                endpoint: format!("{}/", server.uri()),
                token: Some("plugin-token".into()),
            },
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_get_instance_decodes_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/automation.GetInstance"))
            .and(bearer_token("plugin-token"))
            .and(body_json(json!({"instance_id": 42})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "data": {"instance": {
                    "id": 42, "name": "lb-42", "state": 2, "cpu": 4,
                    "memory_gb": 8, "remote_ip": "203.0.113.5",
                    "expire_at_unix": 1900000000
                }}
            })))
            .mount(&server)
            .await;

        let info = client(&server).get_host_info(&AutomationContext::default(), 42).await.unwrap();
        assert_eq!(info.host_id, 42);
        assert_eq!(info.state, 2);
        assert_eq!(info.memory_gb, 8);
        assert_eq!(info.remote_ip, "203.0.113.5");
        assert_eq!(info.expire_at.map(|t| t.timestamp()), Some(1900000000));
    }

    #[tokio::test]
    async fn test_unimplemented_code_is_not_supported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/automation.ListSnapshots"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": "unimplemented", "msg": "snapshots"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc/automation.ListBackups"))
            .respond_with(ResponseTemplate::new(501))
            .mount(&server)
            .await;

        let c = client(&server);
        let ctx = AutomationContext::default();
        assert_eq!(
            c.list_snapshots(&ctx, 1).await.unwrap_err(),
            AutomationError::NotSupported("snapshots".into())
        );
        assert!(matches!(c.list_backups(&ctx, 1).await, Err(AutomationError::NotSupported(_))));
    }

    #[tokio::test]
    async fn test_failed_operation_status_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/automation.Lock"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "data": {"status": "failed", "msg": "host busy", "other": "retry later"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc/automation.Unlock"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "data": {"status": "Succeeded"}})))
            .mount(&server)
            .await;

        let c = client(&server);
        let ctx = AutomationContext::default();
        assert_eq!(
            c.lock_host(&ctx, 1).await.unwrap_err(),
            AutomationError::Upstream("host busy (retry later)".into())
        );
        c.unlock_host(&ctx, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_business_json_message_is_extracted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/automation.Renew"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 3,
                "msg": "upstream said {\"msg\":\"balance too low\"}"
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .renew_host(&AutomationContext::default(), 7, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err, AutomationError::Upstream("balance too low".into()));
    }

    #[test]
    fn test_op_status_vocabulary() {
        for ok in ["", "ok", "SUCCESS", "succeeded", "1", "200"] {
            assert!(ensure_op_ok(&json!({"status": ok})).is_ok(), "{}", ok);
        }
        assert_eq!(
            ensure_op_ok(&json!({"status": "error"})),
            Err(AutomationError::Upstream("operation failed".into()))
        );
        assert!(ensure_op_ok(&Value::Null).is_ok());
    }
}
