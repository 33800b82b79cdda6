//! Test doubles and a seeded in-memory broker.
//!
//! | Helper | Stands in for |
//! |--------|---------------|
//! | [`MockAutomationClient`] | a remote automation backend, scriptable per operation |
//! | [`StaticResolver`] | goods type routing, always answering with one client |
//! | [`RecordingSink`] | user notifications, kept for assertions |
//! | [`TestBed`] | a [`Services`] wired over a [`MemoryStore`] with one sellable package |

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

use crate::automation::{
    Area, AutomationClient, AutomationContext, AutomationError, AutomationResult, ClientResolver, CreateHostRequest,
    CreateHostResult, ElasticUpdateRequest, FirewallRuleCreate, HostInfo, HostSimple, Image, Line, Monitor,
    PortMappingCreate, Product, RemoteRecord,
};
use crate::config::settings::SettingsReader;
use crate::db::{
    AddonRange, AdminStatus, CartItem, CartSpec, GoodsType, Id, InstanceRepository, InstanceStatus, ItemAction,
    MemoryStore, Order, OrderCreateExtras, OrderItem, OrderRepository, OrderStatus, Package, PlanGroup,
    ProvisionJobRepository, Repositories, SystemImage, VpsInstance,
};
use crate::services::{MessageSink, ServiceContext, Services};
use crate::utils::SpecDoc;

// ============================================
// AUTOMATION MOCK
// ============================================

#[derive(Default)]
struct MockState {
    default_state: i32,
    states: HashMap<i64, i32>,
    failures: HashMap<String, AutomationError>,
    calls: Vec<String>,
    created: Vec<(i64, CreateHostRequest)>,
    renewals: Vec<(i64, DateTime<Utc>)>,
    elastic: Vec<ElasticUpdateRequest>,
    deleted: Vec<i64>,
    locked: Vec<i64>,
}

/// Scriptable automation backend.
///
/// Hosts report state 2 (running) unless told otherwise. A failure set
/// with [`fail_with`](Self::fail_with) sticks until cleared.
pub struct MockAutomationClient {
    next_host_id: AtomicI64,
    state: Mutex<MockState>,
}

impl Default for MockAutomationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAutomationClient {
    pub fn new() -> Self {
        Self {
            next_host_id: AtomicI64::new(1000),
            state: Mutex::new(MockState {
                default_state: 2,
                ..MockState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand out a host id the mock will answer for.
    pub fn next_host(&self) -> i64 {
        self.next_host_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn fail_with(&self, op: &str, err: AutomationError) {
        self.lock().failures.insert(op.to_string(), err);
    }

    pub fn clear_failure(&self, op: &str) {
        self.lock().failures.remove(op);
    }

    pub fn set_state(&self, host_id: i64, state: i32) {
        self.lock().states.insert(host_id, state);
    }

    pub fn set_default_state(&self, state: i32) {
        self.lock().default_state = state;
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.as_str() == op).count()
    }

    pub fn created_hosts(&self) -> Vec<CreateHostRequest> {
        self.lock().created.iter().map(|(_, req)| req.clone()).collect()
    }

    pub fn renewals(&self) -> Vec<(i64, DateTime<Utc>)> {
        self.lock().renewals.clone()
    }

    pub fn elastic_updates(&self) -> Vec<ElasticUpdateRequest> {
        self.lock().elastic.clone()
    }

    pub fn deleted_hosts(&self) -> Vec<i64> {
        self.lock().deleted.clone()
    }

    pub fn locked_hosts(&self) -> Vec<i64> {
        self.lock().locked.clone()
    }

    /// Record the call and return the scripted failure, if any.
    fn enter(&self, op: &str) -> AutomationResult<MutexGuard<'_, MockState>> {
        let mut state = self.lock();
        state.calls.push(op.to_string());
        match state.failures.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(state),
        }
    }
}

#[async_trait]
impl AutomationClient for MockAutomationClient {
    async fn create_host(&self, _ctx: &AutomationContext, req: &CreateHostRequest) -> AutomationResult<CreateHostResult> {
        let host_id = self.next_host();
        self.enter("create_host")?.created.push((host_id, req.clone()));
        Ok(CreateHostResult {
            host_id,
            raw: serde_json::json!({ "id": host_id }),
        })
    }

    async fn get_host_info(&self, _ctx: &AutomationContext, host_id: i64) -> AutomationResult<HostInfo> {
        let state = self.enter("get_host_info")?;
        let created = state.created.iter().find(|(id, _)| *id == host_id).map(|(_, req)| req);
        Ok(HostInfo {
            host_id,
            host_name: created.map(|r| r.host_name.clone()).unwrap_or_else(|| format!("host-{}", host_id)),
            state: state.states.get(&host_id).copied().unwrap_or(state.default_state),
            cpu: created.map(|r| r.cpu).unwrap_or_default(),
            memory_gb: created.map(|r| r.memory_gb).unwrap_or_default(),
            disk_gb: created.map(|r| r.disk_gb).unwrap_or_default(),
            bandwidth_mbps: created.map(|r| r.bandwidth_mbps).unwrap_or_default(),
            panel_password: "panel-pass".to_string(),
            vnc_password: "vnc-pass".to_string(),
            os_password: created.map(|r| r.sys_password.clone()).unwrap_or_default(),
            remote_ip: format!("10.0.{}.{}", host_id / 256 % 256, host_id % 256),
            expire_at: created.map(|r| r.expire_at),
        })
    }

    async fn list_host_simple(&self, _ctx: &AutomationContext, search_tag: &str) -> AutomationResult<Vec<HostSimple>> {
        let state = self.enter("list_host_simple")?;
        Ok(state
            .created
            .iter()
            .filter(|(_, req)| req.host_name.contains(search_tag))
            .map(|(id, req)| HostSimple {
                id: *id,
                host_name: req.host_name.clone(),
                ip: String::new(),
            })
            .collect())
    }

    async fn elastic_update(&self, _ctx: &AutomationContext, req: &ElasticUpdateRequest) -> AutomationResult<()> {
        self.enter("elastic_update")?.elastic.push(req.clone());
        Ok(())
    }

    async fn renew_host(&self, _ctx: &AutomationContext, host_id: i64, next_due_at: DateTime<Utc>) -> AutomationResult<()> {
        self.enter("renew_host")?.renewals.push((host_id, next_due_at));
        Ok(())
    }

    async fn lock_host(&self, _ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.enter("lock_host")?.locked.push(host_id);
        Ok(())
    }

    async fn unlock_host(&self, _ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.enter("unlock_host")?.locked.retain(|h| *h != host_id);
        Ok(())
    }

    async fn delete_host(&self, _ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.enter("delete_host")?.deleted.push(host_id);
        Ok(())
    }

    async fn start_host(&self, _ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.enter("start_host")?.states.insert(host_id, 2);
        Ok(())
    }

    async fn shutdown_host(&self, _ctx: &AutomationContext, host_id: i64) -> AutomationResult<()> {
        self.enter("shutdown_host")?.states.insert(host_id, 3);
        Ok(())
    }

    async fn reboot_host(&self, _ctx: &AutomationContext, _host_id: i64) -> AutomationResult<()> {
        self.enter("reboot_host").map(drop)
    }

    async fn reset_os(&self, _ctx: &AutomationContext, _host_id: i64, _template_id: i64, _password: &str) -> AutomationResult<()> {
        self.enter("reset_os").map(drop)
    }

    async fn reset_os_password(&self, _ctx: &AutomationContext, _host_id: i64, _password: &str) -> AutomationResult<()> {
        self.enter("reset_os_password").map(drop)
    }

    async fn list_snapshots(&self, _ctx: &AutomationContext, _host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        self.enter("list_snapshots").map(|_| Vec::new())
    }

    async fn create_snapshot(&self, _ctx: &AutomationContext, _host_id: i64) -> AutomationResult<()> {
        self.enter("create_snapshot").map(drop)
    }

    async fn delete_snapshot(&self, _ctx: &AutomationContext, _host_id: i64, _snapshot_id: i64) -> AutomationResult<()> {
        self.enter("delete_snapshot").map(drop)
    }

    async fn restore_snapshot(&self, _ctx: &AutomationContext, _host_id: i64, _snapshot_id: i64) -> AutomationResult<()> {
        self.enter("restore_snapshot").map(drop)
    }

    async fn list_backups(&self, _ctx: &AutomationContext, _host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        self.enter("list_backups").map(|_| Vec::new())
    }

    async fn create_backup(&self, _ctx: &AutomationContext, _host_id: i64) -> AutomationResult<()> {
        self.enter("create_backup").map(drop)
    }

    async fn delete_backup(&self, _ctx: &AutomationContext, _host_id: i64, _backup_id: i64) -> AutomationResult<()> {
        self.enter("delete_backup").map(drop)
    }

    async fn restore_backup(&self, _ctx: &AutomationContext, _host_id: i64, _backup_id: i64) -> AutomationResult<()> {
        self.enter("restore_backup").map(drop)
    }

    async fn list_firewall_rules(&self, _ctx: &AutomationContext, _host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        self.enter("list_firewall_rules").map(|_| Vec::new())
    }

    async fn add_firewall_rule(&self, _ctx: &AutomationContext, _req: &FirewallRuleCreate) -> AutomationResult<()> {
        self.enter("add_firewall_rule").map(drop)
    }

    async fn delete_firewall_rule(&self, _ctx: &AutomationContext, _host_id: i64, _rule_id: i64) -> AutomationResult<()> {
        self.enter("delete_firewall_rule").map(drop)
    }

    async fn list_port_mappings(&self, _ctx: &AutomationContext, _host_id: i64) -> AutomationResult<Vec<RemoteRecord>> {
        self.enter("list_port_mappings").map(|_| Vec::new())
    }

    async fn add_port_mapping(&self, _ctx: &AutomationContext, _req: &PortMappingCreate) -> AutomationResult<()> {
        self.enter("add_port_mapping").map(drop)
    }

    async fn delete_port_mapping(&self, _ctx: &AutomationContext, _host_id: i64, _mapping_id: i64) -> AutomationResult<()> {
        self.enter("delete_port_mapping").map(drop)
    }

    async fn find_port_candidates(&self, _ctx: &AutomationContext, _host_id: i64, _keywords: &str) -> AutomationResult<Vec<i64>> {
        self.enter("find_port_candidates").map(|_| Vec::new())
    }

    async fn get_panel_url(&self, _ctx: &AutomationContext, host_name: &str, _panel_password: &str) -> AutomationResult<String> {
        self.enter("get_panel_url")
            .map(|_| format!("https://panel.example.test/{}", host_name))
    }

    async fn get_vnc_url(&self, _ctx: &AutomationContext, host_id: i64) -> AutomationResult<String> {
        self.enter("get_vnc_url")
            .map(|_| format!("https://vnc.example.test/{}", host_id))
    }

    async fn list_areas(&self, _ctx: &AutomationContext) -> AutomationResult<Vec<Area>> {
        self.enter("list_areas").map(|_| Vec::new())
    }

    async fn list_images(&self, _ctx: &AutomationContext, _line_id: i64) -> AutomationResult<Vec<Image>> {
        self.enter("list_images").map(|_| Vec::new())
    }

    async fn list_lines(&self, _ctx: &AutomationContext) -> AutomationResult<Vec<Line>> {
        self.enter("list_lines").map(|_| Vec::new())
    }

    async fn list_products(&self, _ctx: &AutomationContext, _line_id: i64) -> AutomationResult<Vec<Product>> {
        self.enter("list_products").map(|_| Vec::new())
    }

    async fn get_monitor(&self, _ctx: &AutomationContext, _host_id: i64) -> AutomationResult<Monitor> {
        self.enter("get_monitor").map(|_| Monitor::default())
    }
}

/// Resolver that routes every goods type to one client.
pub struct StaticResolver(pub Arc<dyn AutomationClient>);

#[async_trait]
impl ClientResolver for StaticResolver {
    async fn client_for_goods_type(&self, _goods_type_id: Id) -> AutomationResult<Arc<dyn AutomationClient>> {
        Ok(self.0.clone())
    }
}

// ============================================
// NOTIFICATIONS
// ============================================

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub user_id: Id,
    pub kind: String,
    pub title: String,
    pub content: String,
}

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Kinds delivered to `user_id`, oldest first.
    pub fn kinds_for(&self, user_id: Id) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.kind)
            .collect()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn notify_user(&self, user_id: Id, kind: &str, title: &str, content: &str) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(SentMessage {
            user_id,
            kind: kind.to_string(),
            title: title.to_string(),
            content: content.to_string(),
        });
    }
}

// ============================================
// TEST BED
// ============================================

/// Monthly price of every seeded instance.
pub const SEEDED_INSTANCE_MONTHLY: i64 = 3000;

/// Services over a memory store holding one goods type, plan group,
/// package and system image.
pub struct TestBed {
    pub store: Arc<MemoryStore>,
    pub mock: Arc<MockAutomationClient>,
    pub sink: Arc<RecordingSink>,
    pub ctx: ServiceContext,
    pub services: Services,
    pub goods_type: GoodsType,
    pub plan: PlanGroup,
    pub package: Package,
    pub image: SystemImage,
    order_seq: AtomicI64,
}

impl TestBed {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockAutomationClient::new());
        let sink = Arc::new(RecordingSink::default());

        let goods_type = store.insert_goods_type(GoodsType {
            id: 0,
            name: "Hong Kong".into(),
            sort_order: 0,
            automation_category: "automation".into(),
            automation_plugin_id: "lightboat".into(),
            automation_instance_id: "hk-1".into(),
        });
        let addon = |max: i32, step: i32| AddonRange { min: 0, max, step };
        let plan = store.insert_plan_group(PlanGroup {
            id: 0,
            line_id: 7,
            add_core: addon(8, 1),
            add_mem: addon(16, 1),
            add_disk: addon(500, 10),
            add_bw: addon(100, 1),
            unit_core: 500,
            unit_mem: 300,
            unit_disk: 10,
            unit_bw: 20,
        });
        let package = store.insert_package(Package {
            id: 0,
            name: "Starter".into(),
            goods_type_id: goods_type.id,
            plan_group_id: plan.id,
            cpu: 2,
            memory_gb: 4,
            disk_gb: 40,
            bandwidth_mbps: 100,
            port_num: 5,
            monthly_price: 1000,
            active: true,
        });
        let image = store.insert_system_image(SystemImage {
            id: 0,
            name: "debian-12".into(),
            image_code: "debian12".into(),
        });

        let ctx = ServiceContext::new(
            Repositories::from_store(store.clone()),
            SettingsReader::new(store.clone()),
            Arc::new(StaticResolver(mock.clone())),
            sink.clone(),
            CancellationToken::new(),
        );
        Self {
            services: Services::new(ctx.clone()),
            store,
            mock,
            sink,
            ctx,
            goods_type,
            plan,
            package,
            image,
            order_seq: AtomicI64::new(0),
        }
    }

    fn next_order_no(&self, user_id: Id) -> String {
        format!("SEED-{}-{}", user_id, self.order_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn bind(&self, mut item: OrderItem) -> OrderItem {
        item.package_id = self.package.id;
        item.system_id = self.image.id;
        item.goods_type_id = self.goods_type.id;
        item
    }

    async fn insert(&self, order: Order, items: Vec<OrderItem>) -> (Order, Vec<OrderItem>) {
        self.store
            .create_order(order, items, OrderCreateExtras::default())
            .await
            .expect("seed order")
    }

    /// A purchase order with one one-month `create` item per status.
    pub async fn seed_order(&self, user_id: Id, status: OrderStatus, item_statuses: &[OrderStatus]) -> (Order, Vec<OrderItem>) {
        let mut order = Order::draft(user_id, self.next_order_no(user_id), status, "CNY");
        order.total_amount = self.package.monthly_price * item_statuses.len() as i64;
        let items = item_statuses
            .iter()
            .map(|st| {
                let mut spec = SpecDoc::new();
                spec.set("duration_months", 1);
                self.bind(OrderItem::draft(ItemAction::Create, *st, self.package.monthly_price, spec))
            })
            .collect();
        self.insert(order, items).await
    }

    /// A free order with one `action` item sharing the order status.
    pub async fn seed_order_with(
        &self,
        user_id: Id,
        status: OrderStatus,
        action: ItemAction,
        spec: SpecDoc,
    ) -> (Order, Vec<OrderItem>) {
        let order = Order::draft(user_id, self.next_order_no(user_id), status, "CNY");
        let item = self.bind(OrderItem::draft(action, status, 0, spec));
        self.insert(order, vec![item]).await
    }

    /// An approved order holding one `action` item, ready to execute.
    pub async fn seed_action_order(&self, user_id: Id, action: ItemAction, spec: SpecDoc) -> (Order, OrderItem) {
        let (order, mut items) = self.seed_order_with(user_id, OrderStatus::Approved, action, spec).await;
        (order, items.remove(0))
    }

    /// A running instance on the seeded package, bound to a fresh mock host.
    pub async fn seed_instance(&self, user_id: Id, expire_at: Option<DateTime<Utc>>) -> VpsInstance {
        let host_id = self.mock.next_host();
        let now = Utc::now();
        self.store
            .create_instance(VpsInstance {
                id: 0,
                user_id,
                order_item_id: 0,
                automation_instance_id: host_id.to_string(),
                goods_type_id: self.goods_type.id,
                name: format!("vps-{}", host_id),
                package_id: self.package.id,
                package_name: self.package.name.clone(),
                cpu: self.package.cpu,
                memory_gb: self.package.memory_gb,
                disk_gb: self.package.disk_gb,
                bandwidth_mbps: self.package.bandwidth_mbps,
                port_num: self.package.port_num,
                monthly_price: SEEDED_INSTANCE_MONTHLY,
                spec: SpecDoc::new(),
                system_id: self.image.id,
                status: InstanceStatus::Running,
                automation_state: 2,
                admin_status: AdminStatus::Normal,
                expire_at,
                panel_url_cache: None,
                access_info: Default::default(),
                last_emergency_renew_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("seed instance")
    }

    pub async fn add_to_cart(&self, user_id: Id, qty: i32) -> CartItem {
        self.store.add_cart_item(CartItem {
            id: 0,
            user_id,
            package_id: self.package.id,
            system_id: self.image.id,
            spec: CartSpec::default(),
            qty,
        })
    }

    /// Make the item's provisioning job due now.
    pub async fn expedite_job(&self, order_item_id: Id) {
        let mut job = self
            .store
            .find_job_by_item(order_item_id)
            .await
            .expect("job lookup")
            .expect("job exists");
        job.next_run_at = Utc::now() - Duration::seconds(1);
        self.store.save_job(&job).await.expect("save job");
    }
}
