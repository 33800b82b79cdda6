//! Collaborators shared by every service.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::events::EventPublisher;
use super::notify::MessageSink;
use super::realname::RealNameGate;
use super::wallet::WalletService;
use crate::automation::{AutomationClient, AutomationContext, ClientResolver};
use crate::config::settings::SettingsReader;
use crate::db::{AuditLog, Id, Repositories};
use crate::errors::BrokerResult;

/// Everything a service needs, cheap to clone.
///
/// ## Usage
///
/// ```rust,ignore
/// let ctx = ServiceContext::new(repos, settings, resolver, sink, shutdown.clone());
/// let services = Services::new(ctx);
/// ```
#[derive(Clone)]
pub struct ServiceContext {
    pub repos: Repositories,
    pub settings: SettingsReader,
    pub resolver: Arc<dyn ClientResolver>,
    pub events: EventPublisher,
    pub sink: Arc<dyn MessageSink>,
    pub wallet: WalletService,
    pub realname: RealNameGate,
    /// Process lifetime; cancelling it aborts in-flight automation calls.
    pub cancel: CancellationToken,
}

impl ServiceContext {
    pub fn new(
        repos: Repositories,
        settings: SettingsReader,
        resolver: Arc<dyn ClientResolver>,
        sink: Arc<dyn MessageSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            events: EventPublisher::new(repos.events.clone()),
            wallet: WalletService::new(repos.wallets.clone()),
            realname: RealNameGate::new(settings.clone(), repos.users.clone()),
            repos,
            settings,
            resolver,
            sink,
            cancel,
        }
    }

    /// Automation context attributed to an order item.
    pub fn automation(&self, order_id: Id, order_item_id: Id) -> AutomationContext {
        AutomationContext::new(self.cancel.clone()).for_item(order_id, order_item_id)
    }

    pub async fn client(&self, goods_type_id: Id) -> BrokerResult<Arc<dyn AutomationClient>> {
        Ok(self.resolver.client_for_goods_type(goods_type_id).await?)
    }

    /// Write an audit row; failures are logged and dropped.
    pub async fn audit(&self, actor_id: Id, action: &str, target_type: &str, target_id: Id, detail: Value) {
        let entry = AuditLog {
            id: 0,
            actor_id,
            action: action.to_string(),
            target_type: target_type.to_string(),
            target_id,
            detail,
            created_at: Utc::now(),
        };
        if let Err(e) = self.repos.audit.record_audit(entry).await {
            warn!("Failed to write audit {} for {} {}: {}", action, target_type, target_id, e);
        }
    }

    pub async fn notify(&self, user_id: Id, kind: &str, title: &str, content: &str) {
        self.sink.notify_user(user_id, kind, title, content).await;
    }
}
