//! # API Request Models
//!
//! Bodies and query strings accepted by the HTTP surface. Service input
//! types ([`OrderLine`], [`OrderOptions`], [`PaymentInput`],
//! [`ResizeRequest`], [`TaskUpdate`]) are accepted as-is; the structs here
//! only add what the transport carries around them.

use serde::{Deserialize, Serialize};

use crate::db::Id;
use crate::services::orders::{OrderLine, OrderOptions};
use crate::services::payments::PaymentInput;

/// Request to create an order from explicit lines.
///
/// ## Example JSON
///
/// ```json
/// {
///     "items": [{"package_id": 3, "system_id": 1, "spec": {"add_cores": 1}, "qty": 2}],
///     "coupon_code": "SPRING",
///     "idempotency_key": "7f2c"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub items: Vec<OrderLine>,
    #[serde(flatten)]
    pub options: OrderOptions,
}

/// Payment submission; `idempotency_key` is scoped to the order.
///
/// ## Example JSON
///
/// ```json
/// {
///     "method": "approval",
///     "amount": 1000,
///     "trade_no": "ALI-20240501-77",
///     "idempotency_key": "pay-1"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitPaymentRequest {
    #[serde(flatten)]
    pub payment: PaymentInput,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewRequest {
    #[serde(default = "one_month")]
    pub months: i32,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn one_month() -> i32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefundRequest {
    #[serde(default)]
    pub reason: String,
}

/// Admin rejection of an order or payment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: String,
}

/// `?limit=` for the batch endpoints; absent or ≤ 0 means the default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

impl LimitQuery {
    pub fn limit_or(&self, default: i64) -> i64 {
        self.limit.filter(|l| *l > 0).unwrap_or(default)
    }
}

/// Filter for `GET /admin/automation-logs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutomationLogQuery {
    #[serde(default)]
    pub order_id: Option<Id>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_order_request_flattens_options() {
        let req: CreateOrderRequest = serde_json::from_str(
            r#"{"items":[{"package_id":3,"system_id":1}],"coupon_code":"SPRING","idempotency_key":"k"}"#,
        )
        .unwrap();
        assert_eq!(req.items[0].qty, 1);
        assert_eq!(req.options.coupon_code.as_deref(), Some("SPRING"));
        assert_eq!(req.options.idempotency_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_renew_defaults_to_one_month() {
        let req: RenewRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.months, 1);
        assert_eq!(LimitQuery { limit: Some(0) }.limit_or(20), 20);
    }
}
