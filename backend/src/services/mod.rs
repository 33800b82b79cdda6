//! # Services Module
//!
//! Business logic of the broker. Every service is a cheap `Clone` over a
//! shared [`ServiceContext`].
//!
//! ## Services Overview
//!
//! | Service | Responsibility |
//! |---------|---------------|
//! | `OrderService` | Purchase orders, review, approval, provisioning dispatch |
//! | `PaymentService` | Payment submission and admin review |
//! | `RequestService` | Renew, emergency renew, resize, refund, admin delete orders |
//! | `ProvisionWorker` | Polls remote hosts until provisioning finishes |
//! | `LifecycleService` | Expiry locking, deletion, reminders, retention |
//! | `Scheduler` | Runs the periodic tasks |
//!
//! ## Service Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SERVICES LAYER                            │
//! │                                                                  │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐     │
//! │  │ PaymentSvc   │──►│ OrderService │◄──│ RequestService   │     │
//! │  └──────────────┘   └──────┬───────┘   └──────────────────┘     │
//! │                            │                                     │
//! │              ┌─────────────┼──────────────┐                      │
//! │              ▼             ▼              ▼                      │
//! │     ┌──────────────┐ ┌───────────┐ ┌─────────────┐               │
//! │     │ProvisionWorker│ │ Actions   │ │ Reconcile   │               │
//! │     └──────┬───────┘ └─────┬─────┘ └─────────────┘               │
//! │            └───────┬───────┘                                     │
//! │                    ▼                                             │
//! │          AutomationClient (via resolver)                         │
//! │                                                                  │
//! │  Scheduler ──► worker / resize tasks / reconciler / lifecycle    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod actions;
pub mod context;
pub mod events;
pub mod lifecycle;
pub mod notify;
pub mod orders;
pub mod payments;
pub mod pricing;
pub mod provisioning;
pub mod realname;
pub mod reconcile;
pub mod requests;
pub mod scheduler;
pub mod wallet;

pub use context::ServiceContext;
pub use lifecycle::LifecycleService;
pub use notify::MessageSink;
pub use orders::OrderService;
pub use payments::PaymentService;
pub use provisioning::ProvisionWorker;
pub use requests::RequestService;
pub use scheduler::Scheduler;

/// Every service, wired over one context.
#[derive(Clone)]
pub struct Services {
    pub ctx: ServiceContext,
    pub orders: OrderService,
    pub payments: PaymentService,
    pub requests: RequestService,
    pub worker: ProvisionWorker,
    pub lifecycle: LifecycleService,
    pub scheduler: Scheduler,
}

impl Services {
    pub fn new(ctx: ServiceContext) -> Self {
        let worker = ProvisionWorker::new(ctx.clone());
        let orders = OrderService::new(ctx.clone(), worker.clone());
        let lifecycle = LifecycleService::new(ctx.clone());
        Self {
            payments: PaymentService::new(ctx.clone(), orders.clone()),
            requests: RequestService::new(ctx.clone(), orders.clone()),
            scheduler: Scheduler::new(ctx.clone(), orders.clone(), worker.clone(), lifecycle.clone()),
            worker,
            orders,
            lifecycle,
            ctx,
        }
    }
}
