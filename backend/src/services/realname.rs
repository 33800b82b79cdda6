//! Real-name verification gate.
//!
//! | Policy | Action in `block_actions` | User verified | Outcome |
//! |--------|---------------------------|---------------|---------|
//! | disabled | – | – | allowed |
//! | enabled | yes | no | `real_name_required` |
//! | enabled | no | no | allowed, order goes to review |
//! | enabled | – | yes | allowed |

use std::sync::Arc;

use crate::config::settings::SettingsReader;
use crate::db::{Id, UserDirectory};
use crate::errors::{BrokerError, BrokerResult};

/// Gated actions.
pub mod actions {
    pub const PURCHASE_VPS: &str = "purchase_vps";
    pub const RENEW_VPS: &str = "renew_vps";
    pub const RESIZE_VPS: &str = "resize_vps";
}

#[derive(Clone)]
pub struct RealNameGate {
    settings: SettingsReader,
    users: Arc<dyn UserDirectory>,
}

impl RealNameGate {
    pub fn new(settings: SettingsReader, users: Arc<dyn UserDirectory>) -> Self {
        Self { settings, users }
    }

    /// Fail with `real_name_required` when the policy blocks `action` for
    /// an unverified user.
    pub async fn require_action(&self, user_id: Id, action: &str) -> BrokerResult<()> {
        let policy = self.settings.realname().await;
        if !policy.enabled || !policy.blocks(action) {
            return Ok(());
        }
        if self.users.is_realname_verified(user_id).await? {
            return Ok(());
        }
        Err(BrokerError::RealNameRequired(action.to_string()))
    }

    /// True when the user is unverified but `action` is not blocked, so the
    /// resulting order must be reviewed by an admin.
    pub async fn needs_review(&self, user_id: Id, action: &str) -> BrokerResult<bool> {
        let policy = self.settings.realname().await;
        if !policy.enabled || policy.blocks(action) {
            return Ok(false);
        }
        Ok(!self.users.is_realname_verified(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, SettingsRepository};

    async fn gate(pairs: &[(&str, &str)]) -> (Arc<MemoryStore>, RealNameGate) {
        let store = Arc::new(MemoryStore::new());
        for (k, v) in pairs {
            store.upsert_setting(k, v).await.unwrap();
        }
        let gate = RealNameGate::new(SettingsReader::new(store.clone()), store.clone());
        (store, gate)
    }

    #[tokio::test]
    async fn test_disabled_policy_allows_everything() {
        let (_, gate) = gate(&[("realname_block_actions", r#"["purchase_vps"]"#)]).await;
        assert!(gate.require_action(1, actions::PURCHASE_VPS).await.is_ok());
        assert!(!gate.needs_review(1, actions::PURCHASE_VPS).await.unwrap());
    }

    #[tokio::test]
    async fn test_blocked_action_requires_verification() {
        let (store, gate) = gate(&[
            ("realname_enabled", "true"),
            ("realname_block_actions", r#"["PURCHASE_VPS"]"#),
        ])
        .await;
        assert_eq!(
            gate.require_action(1, actions::PURCHASE_VPS).await,
            Err(BrokerError::RealNameRequired("purchase_vps".into()))
        );
        assert!(gate.require_action(1, actions::RENEW_VPS).await.is_ok());
        assert!(gate.needs_review(1, actions::RENEW_VPS).await.unwrap());

        store.set_user_flags(1, false, true);
        assert!(gate.require_action(1, actions::PURCHASE_VPS).await.is_ok());
        assert!(!gate.needs_review(1, actions::RENEW_VPS).await.unwrap());
    }
}
