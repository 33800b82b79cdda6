//! # Payments
//!
//! Users submit payments against their orders; admins approve or reject
//! them. Approving a payment approves its order, which starts provisioning.
//!
//! | Method | Behavior |
//! |--------|----------|
//! | `balance` | wallet debited (`order_payment`, order id), approved at once by reviewer 0; trade number `BAL-<order>-<unix>` unless given |
//! | anything else | stored `pending_review` until an admin decides |
//!
//! `trade_no` is unique across all payments. Resubmitting a trade number
//! on the same order returns the stored row; using it on another order is
//! a conflict.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::context::ServiceContext;
use super::events::event_types;
use super::orders::OrderService;
use super::wallet::refs;
use crate::db::{Id, Order, OrderPayment, OrderStatus, PaymentStatus};
use crate::errors::{BrokerError, BrokerResult};
use crate::utils::{balance_trade_no, pending_trade_no};

pub const METHOD_BALANCE: &str = "balance";
const SYSTEM_REVIEWER: Id = 0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentInput {
    pub method: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub trade_no: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub screenshot_url: Option<String>,
}

impl PaymentInput {
    fn trade_no(&self) -> Option<&str> {
        self.trade_no.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

#[derive(Clone)]
pub struct PaymentService {
    ctx: ServiceContext,
    orders: OrderService,
}

impl PaymentService {
    pub fn new(ctx: ServiceContext, orders: OrderService) -> Self {
        Self { ctx, orders }
    }

    /// Record a user's payment for an order.
    pub async fn submit_payment(
        &self,
        user_id: Id,
        order_id: Id,
        input: PaymentInput,
        idempotency_key: Option<&str>,
    ) -> BrokerResult<OrderPayment> {
        let order = self.ctx.repos.orders.get_order(order_id).await?;
        if order.user_id != user_id {
            return Err(BrokerError::forbidden("order belongs to another user"));
        }
        let idempotency_key = idempotency_key.map(str::trim).filter(|k| !k.is_empty());
        if let Some(key) = idempotency_key {
            if let Some(existing) = self.ctx.repos.payments.find_payment_by_idempotency(order_id, key).await? {
                return Ok(existing);
            }
        }
        if !matches!(order.status, OrderStatus::PendingPayment | OrderStatus::PendingReview) {
            return Err(BrokerError::conflict(format!("order is {}", order.status)));
        }
        validate(&order, &input)?;

        let method = input.method.trim().to_lowercase();
        let now = Utc::now();
        let fallback = if method == METHOD_BALANCE {
            balance_trade_no(order_id, now)
        } else {
            pending_trade_no(order_id, now)
        };
        // trade_no clashes must surface before any money moves
        let payment = match self.resolve_trade_no(&order, &input, fallback).await? {
            TradeNo::Stored(existing) => existing,
            TradeNo::Fresh(trade_no) => {
                if method == METHOD_BALANCE {
                    self.ctx
                        .wallet
                        .debit(
                            user_id,
                            order.total_amount,
                            refs::ORDER_PAYMENT,
                            order_id,
                            &format!("payment for {}", order.order_no),
                        )
                        .await?;
                }
                self.store_payment(&order, &input, trade_no, idempotency_key).await?
            }
        };
        if payment.method == METHOD_BALANCE && payment.status == PaymentStatus::PendingReview {
            return self.approve_payment(SYSTEM_REVIEWER, payment.id).await;
        }
        Ok(payment)
    }

    /// Admin records an offline payment and approves it.
    pub async fn mark_paid(&self, admin_id: Id, order_id: Id, mut input: PaymentInput) -> BrokerResult<OrderPayment> {
        let order = self.ctx.repos.orders.get_order(order_id).await?;
        if !matches!(order.status, OrderStatus::PendingPayment | OrderStatus::PendingReview) {
            return Err(BrokerError::conflict(format!("order is {}", order.status)));
        }
        if input.amount == 0 {
            input.amount = order.total_amount;
        }
        if input.method.trim().is_empty() {
            input.method = "manual".to_string();
        }
        validate(&order, &input)?;
        let fallback = pending_trade_no(order_id, Utc::now());
        let payment = match self.resolve_trade_no(&order, &input, fallback).await? {
            TradeNo::Stored(existing) => existing,
            TradeNo::Fresh(trade_no) => self.store_payment(&order, &input, trade_no, None).await?,
        };
        self.approve_payment(admin_id, payment.id).await
    }

    pub async fn approve_payment(&self, admin_id: Id, payment_id: Id) -> BrokerResult<OrderPayment> {
        let repos = &self.ctx.repos;
        let mut payment = repos.payments.get_payment(payment_id).await?;
        match payment.status {
            PaymentStatus::Approved => return Ok(payment),
            PaymentStatus::Rejected => return Err(BrokerError::conflict("payment was rejected")),
            _ => {}
        }
        payment.status = PaymentStatus::Approved;
        payment.reviewed_by = Some(admin_id);
        repos.payments.save_payment(&payment).await?;
        info!("💳 Payment {} for order {} approved by {}", payment.trade_no, payment.order_id, admin_id);
        self.ctx
            .audit(admin_id, "payment.approve", "payment", payment_id, json!({ "order_id": payment.order_id }))
            .await;

        let order = repos.orders.get_order(payment.order_id).await?;
        if matches!(order.status, OrderStatus::PendingPayment | OrderStatus::PendingReview) {
            self.orders.approve_order(admin_id, order.id).await?;
        }
        Ok(repos.payments.get_payment(payment_id).await?)
    }

    /// Reject a payment; the order stays where it is.
    pub async fn reject_payment(&self, admin_id: Id, payment_id: Id, reason: &str) -> BrokerResult<OrderPayment> {
        let repos = &self.ctx.repos;
        let mut payment = repos.payments.get_payment(payment_id).await?;
        match payment.status {
            PaymentStatus::Rejected => return Ok(payment),
            PaymentStatus::Approved => return Err(BrokerError::conflict("payment was approved")),
            _ => {}
        }
        payment.status = PaymentStatus::Rejected;
        payment.reviewed_by = Some(admin_id);
        payment.review_reason = Some(reason.to_string());
        repos.payments.save_payment(&payment).await?;
        info!("Payment {} rejected by {}: {}", payment.trade_no, admin_id, reason);
        self.ctx
            .audit(admin_id, "payment.reject", "payment", payment_id, json!({ "reason": reason }))
            .await;
        self.ctx
            .events
            .emit(
                payment.order_id,
                event_types::ORDER_PAYMENT_REJECTED,
                json!({ "payment_id": payment.id, "reason": reason }),
            )
            .await;
        Ok(payment)
    }

    pub async fn list_payments(&self, order_id: Id) -> BrokerResult<Vec<OrderPayment>> {
        Ok(self.ctx.repos.payments.list_payments(order_id).await?)
    }

    /// The trade number a new payment on `order` would carry, or the row
    /// already stored under it for this order.
    async fn resolve_trade_no(&self, order: &Order, input: &PaymentInput, fallback: String) -> BrokerResult<TradeNo> {
        let trade_no = input.trade_no().map(str::to_string).unwrap_or(fallback);
        match self.ctx.repos.payments.find_payment_by_trade_no(&trade_no).await? {
            Some(existing) if existing.order_id == order.id => Ok(TradeNo::Stored(existing)),
            Some(_) => Err(BrokerError::conflict(format!("trade_no {} already used", trade_no))),
            None => Ok(TradeNo::Fresh(trade_no)),
        }
    }

    async fn store_payment(
        &self,
        order: &Order,
        input: &PaymentInput,
        trade_no: String,
        idempotency_key: Option<&str>,
    ) -> BrokerResult<OrderPayment> {
        let now = Utc::now();

        let payment = self
            .ctx
            .repos
            .payments
            .create_payment(OrderPayment {
                id: 0,
                order_id: order.id,
                user_id: order.user_id,
                method: input.method.trim().to_lowercase(),
                amount: input.amount,
                currency: order.currency.clone(),
                trade_no,
                note: input.note.clone(),
                screenshot_url: input.screenshot_url.clone(),
                status: PaymentStatus::PendingReview,
                idempotency_key: idempotency_key.map(str::to_string),
                reviewed_by: None,
                review_reason: None,
                created_at: now,
                updated_at: now,
            })
            .await?;
        info!("Payment {} submitted for order {} ({} {})", payment.trade_no, order.order_no, payment.amount, payment.currency);
        self.ctx
            .events
            .emit(
                order.id,
                event_types::ORDER_PAYMENT_SUBMITTED,
                json!({ "payment_id": payment.id, "method": payment.method, "amount": payment.amount }),
            )
            .await;
        Ok(payment)
    }
}

enum TradeNo {
    Stored(OrderPayment),
    Fresh(String),
}

fn validate(order: &Order, input: &PaymentInput) -> BrokerResult<()> {
    if order.total_amount <= 0 {
        return Err(BrokerError::NoPaymentRequired);
    }
    if input.method.trim().is_empty() {
        return Err(BrokerError::invalid("payment method required"));
    }
    if input.amount <= 0 || input.amount != order.total_amount {
        return Err(BrokerError::invalid(format!(
            "amount must equal the order total {}",
            order.total_amount
        )));
    }
    if let Some(currency) = input.currency.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        if !currency.eq_ignore_ascii_case(&order.currency) {
            return Err(BrokerError::invalid(format!("currency must be {}", order.currency)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{EventRepository, OrderRepository, PaymentRepository};
    use crate::testing::TestBed;

    fn input(amount: i64, trade_no: &str) -> PaymentInput {
        PaymentInput {
            method: "approval".into(),
            amount,
            trade_no: Some(trade_no.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_trade_no_reuse_across_orders_conflicts() {
        let bed = TestBed::new().await;
        let (a, _) = bed.seed_order(1, OrderStatus::PendingPayment, &[OrderStatus::PendingPayment]).await;
        let (b, _) = bed.seed_order(1, OrderStatus::PendingPayment, &[OrderStatus::PendingPayment]).await;

        let first = bed.services.payments.submit_payment(1, a.id, input(a.total_amount, "TN-CROSS"), None).await.unwrap();
        assert_eq!(first.status, PaymentStatus::PendingReview);
        let again = bed.services.payments.submit_payment(1, a.id, input(a.total_amount, "TN-CROSS"), None).await.unwrap();
        assert_eq!(again.id, first.id);

        let err = bed.services.payments.submit_payment(1, b.id, input(b.total_amount, "TN-CROSS"), None).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn test_idempotency_key_returns_same_row() {
        let bed = TestBed::new().await;
        let (order, _) = bed.seed_order(1, OrderStatus::PendingPayment, &[OrderStatus::PendingPayment]).await;
        let first = bed
            .services
            .payments
            .submit_payment(1, order.id, input(order.total_amount, ""), Some("pay-1"))
            .await
            .unwrap();
        assert!(first.trade_no.starts_with(&format!("pending-{}-", order.id)));
        let second = bed
            .services
            .payments
            .submit_payment(1, order.id, input(order.total_amount, ""), Some("pay-1"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(bed.store.list_payments(order.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_payment_validation() {
        let bed = TestBed::new().await;
        let (order, _) = bed.seed_order(1, OrderStatus::PendingPayment, &[OrderStatus::PendingPayment]).await;
        let payments = &bed.services.payments;

        let err = payments.submit_payment(2, order.id, input(order.total_amount, "X"), None).await.unwrap_err();
        assert_eq!(err.kind(), "forbidden");
        let err = payments.submit_payment(1, order.id, input(order.total_amount - 1, "X"), None).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        let mut usd = input(order.total_amount, "X");
        usd.currency = Some("USD".into());
        let err = payments.submit_payment(1, order.id, usd, None).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");

        let mut free = order.clone();
        free.total_amount = 0;
        bed.store.save_order(&free).await.unwrap();
        let err = payments.submit_payment(1, order.id, input(1, "Y"), None).await.unwrap_err();
        assert_eq!(err, BrokerError::NoPaymentRequired);
    }

    #[tokio::test]
    async fn test_balance_payment_debits_and_approves() {
        let bed = TestBed::new().await;
        let (order, _) = bed.seed_order(1, OrderStatus::PendingPayment, &[OrderStatus::PendingPayment]).await;
        let pay = PaymentInput {
            method: "balance".into(),
            amount: order.total_amount,
            ..Default::default()
        };
        let err = bed.services.payments.submit_payment(1, order.id, pay.clone(), None).await.unwrap_err();
        assert_eq!(err.kind(), "insufficient_balance");

        bed.ctx.wallet.credit(1, order.total_amount, "topup", 1, "seed").await.unwrap();
        let payment = bed.services.payments.submit_payment(1, order.id, pay, None).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Approved);
        assert_eq!(payment.reviewed_by, Some(0));
        assert_eq!(bed.ctx.wallet.balance(1).await.unwrap(), 0);
        assert_ne!(bed.store.get_order(order.id).await.unwrap().status, OrderStatus::PendingPayment);
    }

    #[tokio::test]
    async fn test_balance_payment_with_taken_trade_no_keeps_wallet() {
        let bed = TestBed::new().await;
        let (a, _) = bed.seed_order(1, OrderStatus::PendingPayment, &[OrderStatus::PendingPayment]).await;
        let (b, _) = bed.seed_order(1, OrderStatus::PendingPayment, &[OrderStatus::PendingPayment]).await;
        bed.services.payments.submit_payment(1, a.id, input(a.total_amount, "TN-DUP"), None).await.unwrap();
        bed.ctx.wallet.credit(1, b.total_amount, "topup", 1, "seed").await.unwrap();

        let pay = PaymentInput {
            method: "balance".into(),
            amount: b.total_amount,
            trade_no: Some("TN-DUP".into()),
            ..Default::default()
        };
        let err = bed.services.payments.submit_payment(1, b.id, pay, None).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(bed.ctx.wallet.balance(1).await.unwrap(), b.total_amount);
        assert!(bed.store.list_payments(b.id).await.unwrap().is_empty());
        assert_eq!(bed.store.get_order(b.id).await.unwrap().status, OrderStatus::PendingPayment);

        // without a trade number the wallet payment gets its own
        let pay = PaymentInput {
            method: "balance".into(),
            amount: b.total_amount,
            ..Default::default()
        };
        let payment = bed.services.payments.submit_payment(1, b.id, pay, None).await.unwrap();
        assert!(payment.trade_no.starts_with(&format!("BAL-{}-", b.id)));
        assert_eq!(payment.status, PaymentStatus::Approved);
        assert_eq!(bed.ctx.wallet.balance(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_balance_payment_approves_order_under_review() {
        let bed = TestBed::new().await;
        let (order, _) = bed.seed_order(1, OrderStatus::PendingReview, &[OrderStatus::PendingReview]).await;
        bed.ctx.wallet.credit(1, order.total_amount, "topup", 1, "seed").await.unwrap();
        let pay = PaymentInput {
            method: "balance".into(),
            amount: order.total_amount,
            ..Default::default()
        };

        let payment = bed.services.payments.submit_payment(1, order.id, pay, None).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Approved);
        assert_eq!(payment.reviewed_by, Some(0));
        let order = bed.store.get_order(order.id).await.unwrap();
        assert!(!matches!(order.status, OrderStatus::PendingReview | OrderStatus::PendingPayment));
        assert_eq!(order.approved_by, Some(0));
        assert_eq!(bed.ctx.wallet.balance(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_paid_records_and_approves() {
        let bed = TestBed::new().await;
        let (order, _) = bed.seed_order(1, OrderStatus::PendingPayment, &[OrderStatus::PendingPayment]).await;

        let payment = bed
            .services
            .payments
            .mark_paid(5, order.id, PaymentInput::default())
            .await
            .unwrap();
        assert_eq!(payment.method, "manual");
        assert_eq!(payment.amount, order.total_amount);
        assert_eq!(payment.status, PaymentStatus::Approved);
        assert_eq!(payment.reviewed_by, Some(5));
        assert_eq!(bed.store.get_order(order.id).await.unwrap().approved_by, Some(5));

        let err = bed.services.payments.mark_paid(5, order.id, PaymentInput::default()).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn test_reject_payment_keeps_order() {
        let bed = TestBed::new().await;
        let (order, _) = bed.seed_order(1, OrderStatus::PendingPayment, &[OrderStatus::PendingPayment]).await;
        let payment = bed.services.payments.submit_payment(1, order.id, input(order.total_amount, "TN-R"), None).await.unwrap();

        let rejected = bed.services.payments.reject_payment(3, payment.id, "blurry").await.unwrap();
        assert_eq!(rejected.status, PaymentStatus::Rejected);
        assert_eq!(bed.store.get_order(order.id).await.unwrap().status, OrderStatus::PendingPayment);
        let events = bed.store.list_events(order.id).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, "order.payment_rejected");
        let err = bed.services.payments.approve_payment(3, payment.id).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }
}
