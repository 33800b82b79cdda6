//! Goods type → automation client routing.
//!
//! | Binding | Result |
//! |---------|--------|
//! | `goods_type_id ≤ 0` | default goods type (smallest `(sort_order, id)`), else the HTTP fallback |
//! | category ≠ `automation` | `InvalidBinding` |
//! | empty plugin or instance id | `InvalidBinding` |
//! | configured plugin instance | [`PluginClient`] wrapped in [`LoggingClient`] |

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::logging::{LoggingClient, RpcTarget};
use super::plugin::PluginClient;
use super::{AutomationClient, AutomationError, AutomationResult};
use crate::config::settings::SettingsReader;
use crate::config::PluginInstanceConfig;
use crate::db::{AutomationLogRepository, CatalogRepository, DatabaseError, GoodsType, Id};

/// Produces the client responsible for a goods type.
#[async_trait]
pub trait ClientResolver: Send + Sync {
    async fn client_for_goods_type(&self, goods_type_id: Id) -> AutomationResult<Arc<dyn AutomationClient>>;
}

/// The goods type with the smallest `(sort_order, id)`.
pub fn default_goods_type(items: &[GoodsType]) -> Option<&GoodsType> {
    items.iter().min_by_key(|g| (g.sort_order, g.id))
}

type PluginKey = (String, String);

/// Resolver backed by the catalog and the configured plugin instances.
#[derive(Clone)]
pub struct GoodsTypeResolver {
    catalog: Arc<dyn CatalogRepository>,
    plugins: Arc<HashMap<PluginKey, PluginInstanceConfig>>,
    plugin_timeout: Duration,
    settings: SettingsReader,
    logs: Arc<dyn AutomationLogRepository>,
    fallback: Option<Arc<dyn AutomationClient>>,
    clients: Arc<Mutex<HashMap<PluginKey, Arc<dyn AutomationClient>>>>,
}

impl GoodsTypeResolver {
    pub fn new(
        catalog: Arc<dyn CatalogRepository>,
        plugins: Vec<PluginInstanceConfig>,
        plugin_timeout: Duration,
        settings: SettingsReader,
        logs: Arc<dyn AutomationLogRepository>,
    ) -> Self {
        let plugins = plugins
            .into_iter()
            .map(|p| ((p.plugin_id.trim().to_string(), p.instance_id.trim().to_string()), p))
            .collect();
        Self {
            catalog,
            plugins: Arc::new(plugins),
            plugin_timeout,
            settings,
            logs,
            fallback: None,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Client used when no goods type applies. Wrapped with logging here.
    pub fn with_fallback(mut self, client: Arc<dyn AutomationClient>) -> Self {
        self.fallback = Some(Arc::new(LoggingClient::new(
            client,
            RpcTarget::http_upstream(),
            self.settings.clone(),
            self.logs.clone(),
        )));
        self
    }

    async fn client_for(&self, goods_type: &GoodsType) -> AutomationResult<Arc<dyn AutomationClient>> {
        let category = match goods_type.automation_category.trim() {
            "" => "automation",
            other => other,
        };
        let plugin_id = goods_type.automation_plugin_id.trim();
        let instance_id = goods_type.automation_instance_id.trim();
        if category != "automation" || plugin_id.is_empty() || instance_id.is_empty() {
            return Err(AutomationError::InvalidBinding(format!(
                "goods type {} is not bound to an automation plugin",
                goods_type.id
            )));
        }

        let key = (plugin_id.to_string(), instance_id.to_string());
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let cfg = self.plugins.get(&key).ok_or_else(|| {
            AutomationError::InvalidBinding(format!("plugin instance {}/{} is not configured", plugin_id, instance_id))
        })?;
        debug!("Creating client for plugin {}/{}", plugin_id, instance_id);
        let client: Arc<dyn AutomationClient> = Arc::new(LoggingClient::new(
            Arc::new(PluginClient::new(cfg, self.plugin_timeout)),
            RpcTarget::plugin(plugin_id, instance_id),
            self.settings.clone(),
            self.logs.clone(),
        ));
        clients.insert(key, client.clone());
        Ok(client)
    }
}

fn lookup_error(err: DatabaseError) -> AutomationError {
    match err {
        DatabaseError::NotFound(what) => AutomationError::InvalidBinding(format!("{} not found", what)),
        other => AutomationError::Transport(other.to_string()),
    }
}

#[async_trait]
impl ClientResolver for GoodsTypeResolver {
    async fn client_for_goods_type(&self, goods_type_id: Id) -> AutomationResult<Arc<dyn AutomationClient>> {
        if goods_type_id > 0 {
            let goods_type = self.catalog.get_goods_type(goods_type_id).await.map_err(lookup_error)?;
            return self.client_for(&goods_type).await;
        }
        let all = self.catalog.list_goods_types().await.map_err(lookup_error)?;
        match (default_goods_type(&all), &self.fallback) {
            (Some(goods_type), _) => self.client_for(goods_type).await,
            (None, Some(fallback)) => Ok(fallback.clone()),
            (None, None) => Err(AutomationError::InvalidBinding("goods_type_id required".to_string())),
        }
    }
}
