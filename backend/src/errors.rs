//! # Broker Errors
//!
//! One error type for every order, payment, pricing and lifecycle
//! operation. Each variant is a *kind* with a stable snake_case code
//! that the HTTP layer and the event log expose to callers.
//!
//! ## Mapping
//!
//! ```text
//! DatabaseError::NotFound      ──► not_found
//! DatabaseError::Conflict      ──► conflict
//! DatabaseError::*             ──► internal
//! AutomationError::NotSupported──► not_supported
//! AutomationError::InvalidBinding ► invalid_input
//! AutomationError::*           ──► upstream_error
//! ```

use thiserror::Error;

use crate::automation::AutomationError;
use crate::db::DatabaseError;

/// Errors returned by the broker services.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    /// Request shape or value ranges violated.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Referenced entity is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Policy denies the operation (expiry window, cooldown, ownership).
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Idempotency or uniqueness clash.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Wallet debit would underflow.
    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: i64, requested: i64 },

    /// Real-name verification required for this action.
    #[error("Real-name verification required for {0}")]
    RealNameRequired(String),

    /// The automation backend does not implement the operation.
    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Resize is disabled for this package")]
    ResizeDisabled,

    #[error("Requested spec equals the current plan")]
    ResizeSamePlan,

    #[error("A resize is already in progress for this instance")]
    ResizeInProgress,

    /// Transient "not yet ready" signal from the provisioning worker.
    #[error("Host is still provisioning")]
    Provisioning,

    /// Remote RPC failure, remote message preserved.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The order total is zero or negative; nothing to pay.
    #[error("No payment required for this order")]
    NoPaymentRequired,

    /// Storage or other internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Stable machine-readable code for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::InvalidInput(_) => "invalid_input",
            BrokerError::NotFound(_) => "not_found",
            BrokerError::Forbidden(_) => "forbidden",
            BrokerError::Conflict(_) => "conflict",
            BrokerError::InsufficientBalance { .. } => "insufficient_balance",
            BrokerError::RealNameRequired(_) => "real_name_required",
            BrokerError::NotSupported(_) => "not_supported",
            BrokerError::ResizeDisabled => "resize_disabled",
            BrokerError::ResizeSamePlan => "resize_same_plan",
            BrokerError::ResizeInProgress => "resize_in_progress",
            BrokerError::Provisioning => "provisioning",
            BrokerError::Upstream(_) => "upstream_error",
            BrokerError::NoPaymentRequired => "no_payment_required",
            BrokerError::Internal(_) => "internal",
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        BrokerError::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        BrokerError::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        BrokerError::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        BrokerError::Conflict(msg.into())
    }
}

impl From<DatabaseError> for BrokerError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(what) => BrokerError::NotFound(what),
            DatabaseError::Conflict(what) => BrokerError::Conflict(what),
            DatabaseError::InsufficientBalance { available, requested } => {
                BrokerError::InsufficientBalance { available, requested }
            }
            other => BrokerError::Internal(other.to_string()),
        }
    }
}

impl From<AutomationError> for BrokerError {
    fn from(err: AutomationError) -> Self {
        match err {
            AutomationError::NotSupported(msg) => BrokerError::NotSupported(msg),
            AutomationError::InvalidBinding(_) => {
                BrokerError::InvalidInput("invalid automation binding".to_string())
            }
            other => BrokerError::Upstream(other.message()),
        }
    }
}

/// Result alias used across the service layer.
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_not_found_maps_to_not_found() {
        let err: BrokerError = DatabaseError::NotFound("order 9".into()).into();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_unimplemented_maps_to_not_supported() {
        let err: BrokerError = AutomationError::NotSupported("snapshots".into()).into();
        assert_eq!(err.kind(), "not_supported");
    }

    #[test]
    fn test_upstream_message_is_preserved() {
        let err: BrokerError = AutomationError::Upstream("host locked".into()).into();
        assert_eq!(err, BrokerError::Upstream("host locked".into()));
    }
}
