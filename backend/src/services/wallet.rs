//! # Wallet Service
//!
//! All balance movements go through here. The repository applies each
//! movement under a row lock and records the matching transaction row in
//! the same commit, so `balance = Σ transactions.amount` always holds.
//!
//! A movement is identified by `(user_id, ref_type, ref_id)`; replaying it
//! is a no-op that reports `applied = false`.

use std::sync::Arc;

use tracing::info;

use crate::db::{Id, WalletAdjustment, WalletMovement, WalletRepository, WalletTransaction};
use crate::errors::{BrokerError, BrokerResult};

/// Wallet reference types used by the order flows.
pub mod refs {
    pub const ORDER_PAYMENT: &str = "order_payment";
    pub const ORDER_PAYMENT_REVERSAL: &str = "order_payment_refund";
    pub const VPS_REFUND: &str = "vps_refund";
    pub const RESIZE_REFUND: &str = "resize_refund";
    pub const ADMIN_DELETE_REFUND: &str = "admin_delete_refund";
}

#[derive(Clone)]
pub struct WalletService {
    repo: Arc<dyn WalletRepository>,
}

impl WalletService {
    pub fn new(repo: Arc<dyn WalletRepository>) -> Self {
        Self { repo }
    }

    /// Add `amount` cents to the user's balance.
    pub async fn credit(
        &self,
        user_id: Id,
        amount: i64,
        ref_type: &str,
        ref_id: Id,
        note: &str,
    ) -> BrokerResult<WalletAdjustment> {
        if amount <= 0 {
            return Err(BrokerError::invalid("credit amount must be positive"));
        }
        self.apply(user_id, amount, "credit", ref_type, ref_id, note).await
    }

    /// Remove `amount` cents; fails with `insufficient_balance` on underflow.
    pub async fn debit(
        &self,
        user_id: Id,
        amount: i64,
        ref_type: &str,
        ref_id: Id,
        note: &str,
    ) -> BrokerResult<WalletAdjustment> {
        if amount <= 0 {
            return Err(BrokerError::invalid("debit amount must be positive"));
        }
        self.apply(user_id, -amount, "debit", ref_type, ref_id, note).await
    }

    async fn apply(
        &self,
        user_id: Id,
        amount: i64,
        tx_type: &str,
        ref_type: &str,
        ref_id: Id,
        note: &str,
    ) -> BrokerResult<WalletAdjustment> {
        let adjustment = self
            .repo
            .adjust(WalletMovement {
                user_id,
                amount,
                tx_type: tx_type.to_string(),
                ref_type: ref_type.to_string(),
                ref_id,
                note: note.to_string(),
            })
            .await?;
        if adjustment.applied {
            info!(
                "💰 Wallet {} {} {} ({} #{}), balance {}",
                user_id, tx_type, amount, ref_type, ref_id, adjustment.balance
            );
        }
        Ok(adjustment)
    }

    pub async fn balance(&self, user_id: Id) -> BrokerResult<i64> {
        Ok(self.repo.get_balance(user_id).await?)
    }

    pub async fn has_movement(&self, user_id: Id, ref_type: &str, ref_id: Id) -> BrokerResult<bool> {
        Ok(self.repo.has_transaction(user_id, ref_type, ref_id).await?)
    }

    pub async fn transactions(&self, user_id: Id) -> BrokerResult<Vec<WalletTransaction>> {
        Ok(self.repo.list_transactions(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    #[tokio::test]
    async fn test_balance_matches_ledger() {
        let wallet = WalletService::new(Arc::new(MemoryStore::new()));
        wallet.credit(1, 5000, refs::VPS_REFUND, 10, "refund").await.unwrap();
        wallet.debit(1, 1200, refs::ORDER_PAYMENT, 11, "pay").await.unwrap();

        let replay = wallet.credit(1, 5000, refs::VPS_REFUND, 10, "refund").await.unwrap();
        assert!(!replay.applied);

        let ledger: i64 = wallet.transactions(1).await.unwrap().iter().map(|t| t.amount).sum();
        assert_eq!(wallet.balance(1).await.unwrap(), 3800);
        assert_eq!(ledger, 3800);
    }

    #[tokio::test]
    async fn test_overdraft_is_rejected() {
        let wallet = WalletService::new(Arc::new(MemoryStore::new()));
        wallet.credit(2, 100, refs::VPS_REFUND, 1, "").await.unwrap();
        let err = wallet.debit(2, 500, refs::ORDER_PAYMENT, 2, "").await.unwrap_err();
        assert_eq!(err, BrokerError::InsufficientBalance { available: 100, requested: 500 });
        assert_eq!(wallet.balance(2).await.unwrap(), 100);
        assert!(!wallet.has_movement(2, refs::ORDER_PAYMENT, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_non_positive_amounts_are_invalid() {
        let wallet = WalletService::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            wallet.credit(1, 0, refs::VPS_REFUND, 1, "").await,
            Err(BrokerError::InvalidInput(_))
        ));
    }
}
