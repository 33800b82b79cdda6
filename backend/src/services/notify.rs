//! User notifications.

use async_trait::async_trait;

use crate::db::Id;

/// Notification kinds sent by the order flows.
pub mod kinds {
    pub const PROVISIONED: &str = "provisioned";
    pub const PROVISION_FAILED: &str = "provision_failed";
    pub const ORDER_APPROVED: &str = "order_approved";
    pub const ORDER_REJECTED: &str = "order_rejected";
    pub const EMERGENCY_RENEW_AVAILABLE: &str = "emergency_renew_available";
    pub const VPS_EXPIRED: &str = "vps_expired";
}

/// Delivers messages to a user. Delivery is best effort; implementations
/// log their own failures instead of returning them.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn notify_user(&self, user_id: Id, kind: &str, title: &str, content: &str);
}
