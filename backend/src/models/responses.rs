//! # API Response Models
//!
//! Structures for outgoing API response bodies.
//! All responses are wrapped in a standard format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{Id, Order, OrderEvent, OrderItem, OrderPayment, WalletTransaction};
use crate::services::pricing::ResizeQuote;

/// Standard API response wrapper.
///
/// ## Success Response
///
/// ```json
/// {
///     "success": true,
///     "data": { ... },
///     "error": null
/// }
/// ```
///
/// ## Error Response
///
/// `code` is the broker error kind.
///
/// ```json
/// {
///     "success": false,
///     "data": null,
///     "error": {
///         "code": "resize_in_progress",
///         "message": "A resize is already in progress for this instance"
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable error kind, e.g. `not_found`.
    pub code: String,
    pub message: String,
}

/// An order with everything attached to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetailResponse {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub payments: Vec<OrderPayment>,
    pub events: Vec<OrderEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeOrderResponse {
    pub order: Order,
    pub quote: ResizeQuote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundOrderResponse {
    pub order: Order,
    /// Cents credited to the wallet once the order is approved.
    pub refund_amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletResponse {
    pub user_id: Id,
    pub balance: i64,
    pub transactions: Vec<WalletTransaction>,
}

/// Result of a manually triggered batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub processed: usize,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "healthy" or "unhealthy".
    pub status: String,
    /// Whether the settings store answered.
    pub storage: bool,
    pub websocket_connections: usize,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}
