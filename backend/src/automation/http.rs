//! # HTTP Upstream Client
//!
//! Talks to the cloud panel's form-encoded API. Every response is an
//! envelope `{code, msg, data}` where `code = 1` means success.
//!
//! ## Request Flow
//!
//! ```text
//! method ──► upstream() ──► settings: base_url, api_key, enabled, retry, dry_run
//!               │
//!               ├── dry_run ──► synthetic success (mutations only)
//!               ▼
//!           exchange() ──► reqwest ──► Exchange { status, headers, body }
//!               │
//!               ▼
//!           envelope() ──► code == 1 ? data : Upstream("automation error: msg http_trace=...")
//! ```
//!
//! Connection settings are read from the settings store on every call,
//! so operators can repoint the upstream without a restart.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use super::trace::{attach_trace, mask_headers, HttpTrace};
use super::*;
use crate::config::settings::{parse_cents, SettingsReader};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Effective connection settings for one call.
#[derive(Debug, Clone)]
struct Upstream {
    base_url: String,
    api_key: String,
    timeout: Duration,
    retry: u32,
    dry_run: bool,
}

/// One request to send.
#[derive(Debug, Clone)]
struct Req {
    method: Method,
    path: &'static str,
    query: Vec<(&'static str, String)>,
    form: Option<Vec<(&'static str, String)>>,
}

impl Req {
    fn get(path: &'static str) -> Self {
        Self {
            method: Method::GET,
            path,
            query: Vec::new(),
            form: None,
        }
    }

    fn post(path: &'static str) -> Self {
        Self {
            method: Method::POST,
            ..Self::get(path)
        }
    }

    fn query(mut self, key: &'static str, value: impl ToString) -> Self {
        self.query.push((key, value.to_string()));
        self
    }

    fn form(mut self, pairs: Vec<(&'static str, String)>) -> Self {
        self.form = Some(pairs);
        self
    }
}

/// A finished HTTP exchange, kept for tracing.
struct Exchange {
    action: String,
    method: String,
    url: String,
    request_headers: BTreeMap<String, String>,
    request_body: String,
    status: u16,
    response_headers: BTreeMap<String, String>,
    content_type: String,
    location: Option<String>,
    body: Vec<u8>,
    duration_ms: i64,
}

impl Exchange {
    fn trace(&self, error: Option<&str>) -> HttpTrace {
        HttpTrace::capture(
            &self.action,
            &self.method,
            &self.url,
            self.request_headers.clone(),
            &self.request_body,
            Some((
                self.status,
                self.response_headers.clone(),
                self.body.as_slice(),
                self.content_type.as_str(),
            )),
            self.duration_ms,
            error,
        )
    }

    /// An error of kind `make` whose message carries this exchange.
    fn fail(&self, make: fn(String) -> AutomationError, message: String) -> AutomationError {
        make(attach_trace(&message, &self.trace(Some(&message))))
    }
}

fn host_form(host_id: i64) -> Vec<(&'static str, String)> {
    // the panel is inconsistent about host_id vs hostid
    vec![("host_id", host_id.to_string()), ("hostid", host_id.to_string())]
}

/// Client for the HTTP upstream.
///
/// ## Usage
///
/// ```rust,ignore
/// let client = HttpAutomationClient::new(settings.clone());
/// let info = client.get_host_info(&ctx, 981).await?;
/// ```
#[derive(Clone)]
pub struct HttpAutomationClient {
    http: reqwest::Client,
    settings: SettingsReader,
}

impl HttpAutomationClient {
    pub fn new(settings: SettingsReader) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { http, settings }
    }

    async fn upstream(&self) -> AutomationResult<Upstream> {
        let cfg = self.settings.automation().await;
        if !cfg.enabled || cfg.base_url.trim().is_empty() || cfg.api_key.trim().is_empty() {
            return Err(AutomationError::Disabled);
        }
        Ok(Upstream {
            base_url: normalize_base_url(&cfg.base_url),
            api_key: cfg.api_key,
            timeout: Duration::from_secs(cfg.timeout_sec),
            retry: cfg.retry,
            dry_run: cfg.dry_run,
        })
    }

    /// Send one request and collect the raw exchange.
    async fn exchange(&self, ctx: &AutomationContext, up: &Upstream, req: &Req) -> AutomationResult<Exchange> {
        let mut url = Url::parse(&format!("{}{}", up.base_url, req.path))
            .map_err(|e| AutomationError::Transport(format!("invalid upstream url: {}", e)))?;
        if !req.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &req.query {
                pairs.append_pair(k, v);
            }
        }
        let body = req.form.as_ref().map(|pairs| {
            let mut ser = url::form_urlencoded::Serializer::new(String::new());
            for (k, v) in pairs {
                ser.append_pair(k, v);
            }
            ser.finish()
        });

        let mut request_headers = vec![("apikey", up.api_key.clone())];
        let mut builder = self
            .http
            .request(req.method.clone(), url.clone())
            .timeout(up.timeout)
            .header("apikey", &up.api_key);
        if let Some(body) = &body {
            request_headers.push(("Content-Type", FORM_CONTENT_TYPE.to_string()));
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, FORM_CONTENT_TYPE)
                .body(body.clone());
        }

        let mut exchange = Exchange {
            action: format!("{} {}", req.method, url.path()),
            method: req.method.to_string(),
            url: url.to_string(),
            request_headers: mask_headers(request_headers),
            request_body: body.unwrap_or_default(),
            status: 0,
            response_headers: BTreeMap::new(),
            content_type: String::new(),
            location: None,
            body: Vec::new(),
            duration_ms: 0,
        };

        debug!("Automation request: {}", exchange.action);
        let started = Instant::now();
        let sent = ctx
            .run(async { builder.send().await.map_err(|e| AutomationError::Transport(e.to_string())) })
            .await;
        let response = match sent {
            Ok(r) => r,
            Err(AutomationError::Transport(msg)) => {
                exchange.duration_ms = started.elapsed().as_millis() as i64;
                let trace = HttpTrace::capture(
                    &exchange.action,
                    &exchange.method,
                    &exchange.url,
                    exchange.request_headers.clone(),
                    &exchange.request_body,
                    None,
                    exchange.duration_ms,
                    Some(&msg),
                );
                return Err(AutomationError::Transport(attach_trace(&msg, &trace)));
            }
            Err(other) => return Err(other),
        };

        exchange.status = response.status().as_u16();
        exchange.response_headers = mask_headers(
            response
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str(), v.to_str().unwrap_or_default().to_string())),
        );
        exchange.content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        exchange.location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = ctx
            .run(async { response.bytes().await.map_err(|e| AutomationError::Transport(e.to_string())) })
            .await;
        exchange.duration_ms = started.elapsed().as_millis() as i64;
        match body {
            Ok(bytes) => exchange.body = bytes.to_vec(),
            Err(AutomationError::Transport(msg)) => {
                return Err(exchange.fail(AutomationError::Transport, msg));
            }
            Err(other) => return Err(other),
        }
        Ok(exchange)
    }

    /// Send with retries and unwrap a `code = 1` envelope into its `data`.
    async fn call(&self, ctx: &AutomationContext, up: &Upstream, req: Req) -> AutomationResult<Value> {
        let mut attempt = 0;
        loop {
            let outcome = match self.exchange(ctx, up, &req).await {
                Ok(exchange) => envelope(&exchange),
                Err(e) => Err(e),
            };
            match outcome {
                Err(e) if attempt < up.retry && retryable(&e) => {
                    let delay = Duration::from_millis(200u64 << attempt.min(6));
                    warn!("Automation call {} failed (attempt {}), retrying in {:?}", req.path, attempt + 1, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Fetch a one-hop redirect target (panel, VNC).
    async fn redirect(&self, ctx: &AutomationContext, up: &Upstream, req: Req, what: &str) -> AutomationResult<String> {
        let exchange = self.exchange(ctx, up, &req).await?;
        let status = StatusCode::from_u16(exchange.status).unwrap_or(StatusCode::OK);
        if !status.is_redirection() {
            return Err(exchange.fail(
                AutomationError::Upstream,
                format!("automation {} failed: {}", what, exchange.status),
            ));
        }
        match exchange.location.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            Some(location) => Ok(resolve_redirect(&up.base_url, location)),
            None => Err(exchange.fail(AutomationError::Upstream, format!("missing {} location", what))),
        }
    }
}

fn retryable(err: &AutomationError) -> bool {
    !matches!(
        err,
        AutomationError::NotSupported(_) | AutomationError::Cancelled | AutomationError::Disabled
    )
}

/// Decode `{code, msg, data}` and require `code = 1`.
fn envelope(exchange: &Exchange) -> AutomationResult<Value> {
    let parsed: Value = serde_json::from_slice(&exchange.body)
        .map_err(|e| exchange.fail(AutomationError::Decode, format!("decode response: {}", e)))?;
    let code = value_i64(parsed.get("code"));
    if code != 1 {
        let msg = value_str(parsed.get("msg"));
        if is_creating(&msg) {
            return Err(AutomationError::Upstream(msg));
        }
        return Err(exchange.fail(AutomationError::Upstream, format!("automation error: {}", msg)));
    }
    Ok(parsed.get("data").cloned().unwrap_or(Value::Null))
}

/// The panel reports a host still being created with this message.
fn is_creating(msg: &str) -> bool {
    msg.contains("创建中") || msg.to_ascii_lowercase().contains("creating")
}

/// Default the API path when the configured base URL has none.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    match Url::parse(trimmed) {
        Ok(mut url) => {
            if url.path().is_empty() || url.path() == "/" {
                url.set_path("/index.php/api/cloud");
            }
            url.to_string().trim_end_matches('/').to_string()
        }
        Err(_) => trimmed.trim_end_matches('/').to_string(),
    }
}

/// Rewrite a relative redirect against the upstream origin, keeping query
/// and fragment. Absolute locations pass through.
pub fn resolve_redirect(base_url: &str, location: &str) -> String {
    let location = location.trim();
    if location.is_empty() {
        return location.to_string();
    }
    if Url::parse(location).is_ok() {
        return location.to_string();
    }
    let Ok(base) = Url::parse(base_url) else {
        return location.to_string();
    };
    let Some(host) = base.host_str() else {
        return location.to_string();
    };
    let origin = match base.port() {
        Some(port) => format!("{}://{}:{}", base.scheme(), host, port),
        None => format!("{}://{}", base.scheme(), host),
    };
    let (rest, fragment) = match location.split_once('#') {
        Some((r, f)) => (r, Some(f)),
        None => (location, None),
    };
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    let mut out = origin;
    if path.is_empty() {
        out.push('/');
    } else {
        if !path.starts_with('/') {
            out.push('/');
        }
        out.push_str(path);
    }
    if let Some(q) = query {
        out.push('?');
        out.push_str(q);
    }
    if let Some(f) = fragment {
        out.push('#');
        out.push_str(f);
    }
    out
}

/// List payloads arrive as a bare array or as `{list: [...]}`.
fn parse_list(data: &Value) -> Vec<RemoteRecord> {
    let items = match data {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("list") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    items
        .iter()
        .filter_map(|v| v.as_object().cloned())
        .collect()
}

fn parse_host_info(data: &Value) -> HostInfo {
    let expire_at = data
        .get("end_time")
        .and_then(Value::as_str)
        .and_then(|s| NaiveDate::parse_from_str(s.trim().get(..10).unwrap_or(s), "%Y-%m-%d").ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    HostInfo {
        host_id: value_i64(data.get("id")),
        host_name: value_str(data.get("host_name")),
        state: value_i64(data.get("state")) as i32,
        cpu: value_i64(data.get("cpu")) as i32,
        memory_gb: value_i64(data.get("memory")) as i32,
        disk_gb: value_i64(data.get("hard_disks")) as i32,
        bandwidth_mbps: value_i64(data.get("bandwidth")) as i32,
        panel_password: value_str(data.get("panel_password")),
        vnc_password: value_str(data.get("vnc_password")),
        os_password: value_str(data.get("os_password")),
        remote_ip: value_str(data.get("remote_ip")),
        expire_at,
    }
}

fn upstream_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[async_trait]
impl AutomationClient for HttpAutomationClient {
    async fn create_host(&self, ctx: &AutomationContext, req: &CreateHostRequest) -> AutomationResult<CreateHostResult> {
        let up = self.upstream().await?;
        if up.dry_run {
            return Ok(CreateHostResult {
                host_id: Utc::now().timestamp(),
                raw: json!({"dry_run": true}),
            });
        }
        let mut r = Req::post("/create_host")
            .query("line_id", req.line_id)
            .query("os", &req.os)
            .query("cpu", req.cpu)
            .query("memory", req.memory_gb)
            .query("hard_disks", req.disk_gb)
            .query("bandwidth", req.bandwidth_mbps)
            .query("expire_time", upstream_time(req.expire_at));
        if !req.host_name.is_empty() {
            r = r.query("host_name", &req.host_name);
        }
        if !req.sys_password.is_empty() {
            r = r.query("sys_pwd", &req.sys_password);
        }
        if !req.vnc_password.is_empty() {
            r = r.query("vnc_pwd", &req.vnc_password);
        }
        if req.port_num > 0 {
            r = r.query("port_num", req.port_num);
        }
        if req.snapshots > 0 {
            r = r.query("snapshot", req.snapshots);
        }
        if req.backups > 0 {
            r = r.query("backups", req.backups);
        }
        let data = self.call(ctx, &up, r).await?;
        let host_id = match data.get("host_id") {
            Some(v) => value_i64(Some(v)),
            None => value_i64(data.get("id")),
        };
        Ok(CreateHostResult { host_id, raw: data })
    }

    async fn get_host_info(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<HostInfo> {
        let up = self.upstream().await?;
        if up.dry_run {
            return Ok(HostInfo {
                host_id,
                host_name: format!("dry-{}", host_id),
                state: 2,
                ..Default::default()
            });
        }
        match self.call(ctx, &up, Req::post("/hostinfo").form(host_form(host_id))).await {
            Ok(data) => Ok(parse_host_info(&data)),
            Err(AutomationError::Upstream(msg)) if is_creating(&msg) => Ok(HostInfo::creating(host_id)),
            Err(e) => Err(e),
        }
    }

    async fn list_host_simple(&self, ctx: &AutomationContext, search_tag: &str) -> AutomationResult<Vec<HostSimple>> {
        let up = self.upstream().await?;
        if up.dry_run {
            return Ok(Vec::new());
        }
        let mut r = Req::get("/hostlist").query("limit", 50).query("pages", 1);
        if !search_tag.is_empty() {
            r = r.query("search_tag", search_tag);
        }
        let data = self.call(ctx, &up, r).await?;
        Ok(parse_list(&data)
            .iter()
            .map(|m| HostSimple {
                id: value_i64(m.get("id")),
                host_name: value_str(m.get("host_name")),
                ip: value_str(m.get("ip")),
            })
            .collect())
    }

    async fn elastic_update(&self, ctx: &AutomationContext, req: &ElasticUpdateRequest) -> AutomationResult<()> {
        let up = self.upstream().await?;
        if up.dry_run {
            return Ok(());
        }
        let mut r = Req::post("/elastic_update").query("host_id", req.host_id);
        if let Some(v) = req.cpu {
            r = r.query("cpu", v);
        }
        if let Some(v) = req.memory_gb {
            r = r.query("memory", v);
        }
        if let Some(v) = req.disk_gb {
            r = r.query("hard_disks", v);
        }
        if let Some(v) = req.bandwidth_mbps {
            r = r.query("bandwidth", v);
        }
        if let Some(v) = req.port_num {
            r = r.query("port_num", v);
        }
        self.call(ctx, &up, r).await.map(|_| ())
    }

    async fn renew_host(&self, ctx: &AutomationContext, host_id: i64, next_due_at: DateTime<Utc>) -> AutomationResult<()> {
        let up = self.upstream().await?;
        if up.dry_run {
            return Ok(());
        }
        let form = vec![
            ("host_id", host_id.to_string()),
            ("nextduedate", upstream_time(next_due_at)),
        ];
        self.call(ctx, &up, Req::post("/renew").form(form)).await.map(|_| ())
    }

    async fn lock_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.simple(ctx, "/lock", host_id).await
    }

    async fn unlock_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.simple(ctx, "/unlock", host_id).await
    }

    async fn delete_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.simple(ctx, "/delete", host_id).await
    }

    async fn start_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.simple(ctx, "/start", host_id).await
    }

    async fn shutdown_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.simple(ctx, "/shutdown", host_id).await
    }

    async fn reboot_host(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.simple(ctx, "/reboot", host_id).await
    }

    async fn reset_os(&self, ctx: &AutomationContext, host_id: i64, template_id: i64, password: &str) -> AutomationResult<()> {
        let up = self.upstream().await?;
        if up.dry_run {
            return Ok(());
        }
        let mut form = vec![
            ("host_id", host_id.to_string()),
            ("template_id", template_id.to_string()),
        ];
        if !password.is_empty() {
            form.push(("password", password.to_string()));
        }
        self.call(ctx, &up, Req::post("/reset_os").form(form)).await.map(|_| ())
    }

    async fn reset_os_password(&self, ctx: &AutomationContext, host_id: i64, password: &str) -> AutomationResult<()> {
        let up = self.upstream().await?;
        if up.dry_run {
            return Ok(());
        }
        let mut form = vec![("host_id", host_id.to_string())];
        if !password.is_empty() {
            form.push(("password", password.to_string()));
        }
        self.call(ctx, &up, Req::post("/reset_password").form(form)).await.map(|_| ())
    }

    async fn list_snapshots(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        self.list(ctx, Req::post("/snapshot_list").form(vec![("host_id", host_id.to_string())])).await
    }

    async fn create_snapshot(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.mutate(ctx, Req::post("/snapshot_add").form(vec![("host_id", host_id.to_string())])).await
    }

    async fn delete_snapshot(&self, ctx: &AutomationContext, host_id: i64, snapshot_id: i64) -> AutomationResult<()> {
        self.mutate(ctx, Req::post("/snapshot_del").form(id_form(host_id, snapshot_id))).await
    }

    async fn restore_snapshot(&self, ctx: &AutomationContext, host_id: i64, snapshot_id: i64) -> AutomationResult<()> {
        self.mutate(ctx, Req::post("/snapshot_restore").form(id_form(host_id, snapshot_id))).await
    }

    async fn list_backups(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        self.list(ctx, Req::post("/backups_list").form(vec![("host_id", host_id.to_string())])).await
    }

    async fn create_backup(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.mutate(ctx, Req::post("/backups_add").form(vec![("host_id", host_id.to_string())])).await
    }

    async fn delete_backup(&self, ctx: &AutomationContext, host_id: i64, backup_id: i64) -> AutomationResult<()> {
        self.mutate(ctx, Req::post("/backups_del").form(id_form(host_id, backup_id))).await
    }

    async fn restore_backup(&self, ctx: &AutomationContext, host_id: i64, backup_id: i64) -> AutomationResult<()> {
        self.mutate(ctx, Req::post("/backups_restore").form(id_form(host_id, backup_id))).await
    }

    async fn list_firewall_rules(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        let mut r = Req::get("/security_acl_list");
        for (k, v) in host_form(host_id) {
            r = r.query(k, v);
        }
        self.list(ctx, r).await
    }

    async fn add_firewall_rule(&self, ctx: &AutomationContext, req: &FirewallRuleCreate) -> AutomationResult<()> {
        let mut form = host_form(req.host_id);
        for (k, v) in [
            ("direction", &req.direction),
            ("protocol", &req.protocol),
            ("method", &req.method),
            ("port", &req.port),
            ("ip", &req.ip),
        ] {
            if !v.is_empty() {
                form.push((k, v.clone()));
            }
        }
        self.mutate(ctx, Req::post("/security_acl_add").form(form)).await
    }

    async fn delete_firewall_rule(&self, ctx: &AutomationContext, host_id: i64, rule_id: i64) -> AutomationResult<()> {
        let mut form = host_form(host_id);
        form.push(("id", rule_id.to_string()));
        self.mutate(ctx, Req::post("/security_acl_del").form(form)).await
    }

    async fn list_port_mappings(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        let mut r = Req::get("/nat_acl_list");
        for (k, v) in host_form(host_id) {
            r = r.query(k, v);
        }
        self.list(ctx, r).await
    }

    async fn add_port_mapping(&self, ctx: &AutomationContext, req: &PortMappingCreate) -> AutomationResult<()> {
        let mut form = host_form(req.host_id);
        if !req.name.is_empty() {
            form.push(("name", req.name.clone()));
        }
        if !req.sport.is_empty() {
            form.push(("sport", req.sport.clone()));
        }
        if req.dport > 0 {
            form.push(("dport", req.dport.to_string()));
        }
        self.mutate(ctx, Req::post("/add_port_host").form(form)).await
    }

    async fn delete_port_mapping(&self, ctx: &AutomationContext, host_id: i64, mapping_id: i64) -> AutomationResult<()> {
        let mut form = host_form(host_id);
        form.push(("id", mapping_id.to_string()));
        self.mutate(ctx, Req::post("/remove_port_host").form(form)).await
    }

    /// This endpoint answers `{code, msg, content}` with `code = 0` as success.
    async fn find_port_candidates(&self, ctx: &AutomationContext, host_id: i64, keywords: &str) -> AutomationResult<Vec<i64>> {
        let up = self.upstream().await?;
        if up.dry_run {
            return Ok(Vec::new());
        }
        let mut r = Req::get("/findport");
        for (k, v) in host_form(host_id) {
            r = r.query(k, v);
        }
        if !keywords.trim().is_empty() {
            r = r.query("keywords", keywords.trim());
        }
        let exchange = self.exchange(ctx, &up, &r).await?;
        let parsed: Value = serde_json::from_slice(&exchange.body)
            .map_err(|e| exchange.fail(AutomationError::Decode, format!("decode response: {}", e)))?;
        if value_i64(parsed.get("code")) != 0 {
            let msg = value_str(parsed.get("msg"));
            let msg = if msg.trim().is_empty() { "findport failed".to_string() } else { msg };
            return Err(exchange.fail(AutomationError::Upstream, format!("automation error: {}", msg)));
        }
        Ok(parsed
            .get("content")
            .and_then(Value::as_array)
            .map(|ports| ports.iter().map(|p| value_i64(Some(p))).collect())
            .unwrap_or_default())
    }

    async fn get_panel_url(&self, ctx: &AutomationContext, host_name: &str, panel_password: &str) -> AutomationResult<String> {
        let up = self.upstream().await?;
        let form = vec![
            ("host_name", host_name.to_string()),
            ("panel_password", panel_password.to_string()),
        ];
        self.redirect(ctx, &up, Req::post("/panel").form(form), "panel").await
    }

    async fn get_vnc_url(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<String> {
        let up = self.upstream().await?;
        let form = vec![("host_id", host_id.to_string())];
        self.redirect(ctx, &up, Req::post("/vnc_view").form(form), "vnc").await
    }

    async fn list_areas(&self, ctx: &AutomationContext) -> AutomationResult<Vec<Area>> {
        let items = self.list(ctx, Req::get("/area_list")).await?;
        Ok(items
            .iter()
            .map(|m| Area {
                id: value_i64(m.get("id")),
                name: value_str(m.get("area_name")),
                state: value_i64(m.get("state")) as i32,
            })
            .collect())
    }

    async fn list_images(&self, ctx: &AutomationContext, line_id: i64) -> AutomationResult<Vec<Image>> {
        let mut r = Req::get("/mirror_image");
        if line_id > 0 {
            r = r.query("line_id", line_id);
        }
        let items = self.list(ctx, r).await?;
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
        let items = self.list(ctx, Req::get("/line")).await?;
        Ok(items
            .iter()
            .map(|m| {
                let id = value_i64(m.get("id"));
                let name = ["line_name", "name", "remark", "line_api"]
                    .iter()
                    .map(|k| value_str(m.get(*k)).trim().to_string())
                    .find(|n| !n.is_empty())
                    .unwrap_or_else(|| format!("line-{}", id));
                Line {
                    id,
                    name,
                    area_id: value_i64(m.get("area_id")),
                    state: value_i64(m.get("state")) as i32,
                }
            })
            .collect())
    }

    /// Products arrive keyed by id; prices are decimal strings.
    async fn list_products(&self, ctx: &AutomationContext, line_id: i64) -> AutomationResult<Vec<Product>> {
        let up = self.upstream().await?;
        if up.dry_run {
            return Ok(Vec::new());
        }
        let mut r = Req::get("/product");
        if line_id > 0 {
            r = r.query("line_id", line_id);
        }
        let data = self.call(ctx, &up, r).await?;
        let entries: Vec<&Value> = match &data {
            Value::Object(map) => map.values().collect(),
            Value::Array(items) => items.iter().collect(),
            _ => Vec::new(),
        };
        let mut products: Vec<Product> = entries
            .into_iter()
            .map(|m| Product {
                id: value_i64(m.get("id")),
                name: value_str(m.get("product_name")),
                cpu: value_i64(m.get("host_cpu")) as i32,
                memory_gb: value_i64(m.get("host_ram")) as i32,
                disk_gb: value_i64(m.get("host_data")) as i32,
                bandwidth_mbps: value_i64(m.get("bandwidth")) as i32,
                price: parse_cents(&value_str(m.get("price"))).unwrap_or(0),
                port_num: value_i64(m.get("nat_port_num")) as i32,
            })
            .collect();
        products.sort_by_key(|p| p.id);
        Ok(products)
    }

    async fn get_monitor(&self, ctx: &AutomationContext, host_id: i64) -> AutomationResult<Monitor> {
        let up = self.upstream().await?;
        if up.dry_run {
            return Ok(Monitor::default());
        }
        let data = self
            .call(ctx, &up, Req::post("/monitor").form(vec![("host_id", host_id.to_string())]))
            .await?;
        let pct = |key: &str| data.get(key).and_then(Value::as_f64).unwrap_or(0.0).round() as i32;
        let (bytes_in, bytes_out) = parse_network_stats(data.get("NetworkStats").unwrap_or(&Value::Null));
        Ok(Monitor {
            cpu_pct: pct("CpuStats"),
            mem_pct: pct("MemoryStats"),
            storage_pct: pct("StorageStats"),
            bytes_in,
            bytes_out,
        })
    }
}

fn id_form(host_id: i64, id: i64) -> Vec<(&'static str, String)> {
    vec![("host_id", host_id.to_string()), ("id", id.to_string())]
}

impl HttpAutomationClient {
    async fn simple(&self, ctx: &AutomationContext, path: &'static str, host_id: i64) -> AutomationResult<()> {
        self.mutate(ctx, Req::post(path).form(vec![("host_id", host_id.to_string())])).await
    }

    async fn mutate(&self, ctx: &AutomationContext, req: Req) -> AutomationResult<()> {
        let up = self.upstream().await?;
        if up.dry_run {
            return Ok(());
        }
        self.call(ctx, &up, req).await.map(|_| ())
    }

    async fn list(&self, ctx: &AutomationContext, req: Req) -> AutomationResult<Vec<RemoteRecord>> {
        let up = self.upstream().await?;
        if up.dry_run {
            return Ok(Vec::new());
        }
        let data = self.call(ctx, &up, req).await?;
        Ok(parse_list(&data))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::automation::trace::extract_trace;
    use crate::db::{MemoryStore, SettingsRepository};

    const API: &str = "/index.php/api/cloud";

    async fn client_for(server: &MockServer, extra: &[(&str, &str)]) -> HttpAutomationClient {
        let store = Arc::new(MemoryStore::new());
        store.upsert_setting("automation_base_url", &server.uri()).await.unwrap();
        store.upsert_setting("automation_api_key", "secret-key").await.unwrap();
        for (k, v) in extra {
            store.upsert_setting(k, v).await.unwrap();
        }
        HttpAutomationClient::new(SettingsReader::new(store))
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("https://cloud.example.com"), "https://cloud.example.com/index.php/api/cloud");
        assert_eq!(normalize_base_url("https://cloud.example.com/"), "https://cloud.example.com/index.php/api/cloud");
        assert_eq!(normalize_base_url("https://cloud.example.com/api/"), "https://cloud.example.com/api");
        assert_eq!(normalize_base_url(""), "");
    }

    #[test]
    fn test_resolve_redirect() {
        let base = "https://cloud.example.com:8443/index.php/api/cloud";
        assert_eq!(
            resolve_redirect(base, "/vnc/console?token=abc#top"),
            "https://cloud.example.com:8443/vnc/console?token=abc#top"
        );
        assert_eq!(resolve_redirect(base, "panel/login"), "https://cloud.example.com:8443/panel/login");
        assert_eq!(resolve_redirect(base, "?t=1"), "https://cloud.example.com:8443/?t=1");
        assert_eq!(resolve_redirect(base, "https://other.example/x"), "https://other.example/x");
    }

    #[tokio::test]
    async fn test_get_host_info_parses_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{}/hostinfo", API)))
            .and(header("apikey", "secret-key"))
            .and(body_string_contains("host_id=981"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 1,
                "msg": "ok",
                "data": {
                    "id": 981, "host_name": "ecs-7", "state": 2, "cpu": 2,
                    "memory": 4, "hard_disks": 40, "bandwidth": 10,
                    "os_password": "pw", "remote_ip": "10.0.0.9",
                    "end_time": "2030-01-31"
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, &[]).await;
        let info = client.get_host_info(&AutomationContext::default(), 981).await.unwrap();
        assert_eq!(info.host_id, 981);
        assert_eq!(info.state, 2);
        assert_eq!(info.disk_gb, 40);
        assert_eq!(info.remote_ip, "10.0.0.9");
        assert_eq!(info.expire_at.map(|t| t.date_naive().to_string()).as_deref(), Some("2030-01-31"));
    }

    #[tokio::test]
    async fn test_creating_host_is_state_zero() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{}/hostinfo", API)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "msg": "主机创建中"})))
            .mount(&server)
            .await;

        let client = client_for(&server, &[]).await;
        let info = client.get_host_info(&AutomationContext::default(), 5).await.unwrap();
        assert_eq!(info, HostInfo::creating(5));
    }

    #[tokio::test]
    async fn test_failure_carries_masked_trace() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{}/renew", API)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "msg": "host expired"})))
            .mount(&server)
            .await;

        let client = client_for(&server, &[]).await;
        let err = client
            .renew_host(&AutomationContext::default(), 9, Utc::now())
            .await
            .unwrap_err();
        let AutomationError::Upstream(message) = &err else {
            panic!("unexpected error {:?}", err);
        };
        assert!(message.starts_with("automation error: host expired"));
        let trace = extract_trace(message).unwrap();
        assert_eq!(trace.request["headers"]["apikey"], "***");
        assert_eq!(trace.response["format"], "json");
        assert!(!serde_json::to_string(&trace).unwrap().contains("secret-key"));
    }

    #[tokio::test]
    async fn test_vnc_url_follows_one_relative_hop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{}/vnc_view", API)))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/console/vnc?token=t1"))
            .mount(&server)
            .await;

        let client = client_for(&server, &[]).await;
        let url = client.get_vnc_url(&AutomationContext::default(), 3).await.unwrap();
        assert_eq!(url, format!("{}/console/vnc?token=t1", server.uri()));
    }

    #[tokio::test]
    async fn test_find_port_uses_code_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/findport", API)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "content": [20001, 20002]})))
            .mount(&server)
            .await;

        let client = client_for(&server, &[]).await;
        let ports = client
            .find_port_candidates(&AutomationContext::default(), 3, "")
            .await
            .unwrap();
        assert_eq!(ports, vec![20001, 20002]);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{}/lock", API)))
            .respond_with(ResponseTemplate::new(500).set_body_string("<html>busy</html>"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{}/lock", API)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 1})))
            .mount(&server)
            .await;

        let client = client_for(&server, &[("automation_retry", "2")]).await;
        client.lock_host(&AutomationContext::default(), 4).await.unwrap();
    }

    #[tokio::test]
    async fn test_dry_run_skips_network() {
        let server = MockServer::start().await;
        let client = client_for(&server, &[("automation_dry_run", "true")]).await;
        let ctx = AutomationContext::default();
        assert!(client.create_host(&ctx, &sample_create()).await.unwrap().host_id > 0);
        client.delete_host(&ctx, 1).await.unwrap();
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_missing_credentials_disable_client() {
        let store = Arc::new(MemoryStore::new());
        let client = HttpAutomationClient::new(SettingsReader::new(store));
        let err = client.lock_host(&AutomationContext::default(), 1).await.unwrap_err();
        assert_eq!(err, AutomationError::Disabled);
    }

    fn sample_create() -> CreateHostRequest {
        CreateHostRequest {
            line_id: 1,
            os: "debian-12".into(),
            cpu: 1,
            memory_gb: 1,
            disk_gb: 20,
            bandwidth_mbps: 5,
            expire_at: Utc::now(),
            host_name: "ecs-1".into(),
            sys_password: "pw".into(),
            vnc_password: "vnc".into(),
            port_num: 0,
            snapshots: 0,
            backups: 0,
        }
    }
}
