//! # API Request Handlers
//!
//! Each handler:
//! 1. Extracts the path, body and acting admin
//! 2. Calls the appropriate service
//! 3. Renders the result through [`respond`]
//!
//! ## Error Handling
//!
//! Service errors become an [`ApiResponse`] whose `code` is the error
//! kind, with the status code from [`status_for`]:
//!
//! | Kind | Status |
//! |------|--------|
//! | `invalid_input` | 400 |
//! | `insufficient_balance` | 402 |
//! | `forbidden` | 403 |
//! | `not_found` | 404 |
//! | `conflict`, `resize_in_progress`, `provisioning` | 409 |
//! | `real_name_required`, `resize_disabled`, `resize_same_plan`, `no_payment_required` | 422 |
//! | `not_supported` | 501 |
//! | `upstream_error` | 502 |
//! | `internal` | 500 |

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::db::Id;
use crate::errors::{BrokerError, BrokerResult};
use crate::models::{
    ApiResponse, AutomationLogQuery, BatchResponse, CreateOrderRequest, HealthResponse, LimitQuery, OrderDetailResponse,
    RefundOrderResponse, RefundRequest, RejectRequest, RenewRequest, ResizeOrderResponse, SubmitPaymentRequest,
    WalletResponse,
};
use crate::services::orders::OrderOptions;
use crate::services::payments::PaymentInput;
use crate::services::requests::ResizeRequest;
use crate::services::scheduler::TaskUpdate;
use crate::AppState;

/// Header naming the admin performing an `/admin` call.
pub const ADMIN_HEADER: &str = "X-Admin-Id";

const DEFAULT_BATCH: i64 = 20;
const DEFAULT_LOG_LIMIT: i64 = 100;

type State = web::Data<Arc<AppState>>;

// ============================================
// RESPONSE HELPERS
// ============================================

pub fn status_for(err: &BrokerError) -> StatusCode {
    match err {
        BrokerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        BrokerError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
        BrokerError::Forbidden(_) => StatusCode::FORBIDDEN,
        BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
        BrokerError::Conflict(_) | BrokerError::ResizeInProgress | BrokerError::Provisioning => StatusCode::CONFLICT,
        BrokerError::RealNameRequired(_)
        | BrokerError::ResizeDisabled
        | BrokerError::ResizeSamePlan
        | BrokerError::NoPaymentRequired => StatusCode::UNPROCESSABLE_ENTITY,
        BrokerError::NotSupported(_) => StatusCode::NOT_IMPLEMENTED,
        BrokerError::Upstream(_) => StatusCode::BAD_GATEWAY,
        BrokerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(err: &BrokerError) -> HttpResponse {
    let status = status_for(err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        warn!("Request rejected: {}", err);
    }
    HttpResponse::build(status).json(ApiResponse::<()>::error(err.kind(), &err.to_string()))
}

pub fn respond<T: Serialize>(result: BrokerResult<T>) -> HttpResponse {
    match result {
        Ok(data) => HttpResponse::Ok().json(ApiResponse::success(data)),
        Err(e) => error_response(&e),
    }
}

/// The acting admin from [`ADMIN_HEADER`].
fn admin_id(req: &HttpRequest) -> BrokerResult<Id> {
    req.headers()
        .get(ADMIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<Id>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| BrokerError::invalid(format!("{} header is required", ADMIN_HEADER)))
}

// ============================================
// SERVICE INFO
// ============================================

/// `GET /`
pub async fn api_info() -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(json!({
        "name": "VPS Broker API",
        "version": env!("CARGO_PKG_VERSION"),
        "scopes": {
            "user": "/users/{user_id}",
            "admin": "/admin",
            "websocket": "/ws/{user_id}"
        }
    })))
}

/// `GET /health`
///
/// ```bash
/// curl http://127.0.0.1:8080/health
/// ```
pub async fn health_check(state: State) -> HttpResponse {
    let storage = state.services.ctx.repos.settings.list_settings().await.is_ok();
    let response = HealthResponse {
        status: if storage { "healthy" } else { "unhealthy" }.to_string(),
        storage,
        websocket_connections: state.ws_registry.total_connections().await,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    };
    let status = if storage {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    HttpResponse::build(status).json(ApiResponse::success(response))
}

// ============================================
// USER ORDERS & PAYMENTS
// ============================================

/// `POST /users/{user_id}/orders/cart`
pub async fn create_order_from_cart(state: State, path: web::Path<Id>, body: web::Json<OrderOptions>) -> HttpResponse {
    let user_id = path.into_inner();
    info!("Cart checkout for user {}", user_id);
    respond(state.services.orders.create_order_from_cart(user_id, &body).await)
}

/// `POST /users/{user_id}/orders`
pub async fn create_order(state: State, path: web::Path<Id>, body: web::Json<CreateOrderRequest>) -> HttpResponse {
    let user_id = path.into_inner();
    let CreateOrderRequest { items, options } = body.into_inner();
    respond(state.services.orders.create_order_from_items(user_id, items, &options).await)
}

/// `POST /users/{user_id}/orders/{order_id}/cancel`
pub async fn cancel_order(state: State, path: web::Path<(Id, Id)>) -> HttpResponse {
    let (user_id, order_id) = path.into_inner();
    respond(state.services.orders.cancel_order(user_id, order_id).await)
}

/// `POST /users/{user_id}/orders/{order_id}/payments`
pub async fn submit_payment(
    state: State,
    path: web::Path<(Id, Id)>,
    body: web::Json<SubmitPaymentRequest>,
) -> HttpResponse {
    let (user_id, order_id) = path.into_inner();
    let SubmitPaymentRequest {
        payment,
        idempotency_key,
    } = body.into_inner();
    respond(
        state
            .services
            .payments
            .submit_payment(user_id, order_id, payment, idempotency_key.as_deref())
            .await,
    )
}

/// `GET /users/{user_id}/wallet`
pub async fn get_wallet(state: State, path: web::Path<Id>) -> HttpResponse {
    respond(wallet_view(&state, path.into_inner()).await)
}

async fn wallet_view(state: &AppState, user_id: Id) -> BrokerResult<WalletResponse> {
    let wallet = &state.services.ctx.wallet;
    Ok(WalletResponse {
        user_id,
        balance: wallet.balance(user_id).await?,
        transactions: wallet.transactions(user_id).await?,
    })
}

// ============================================
// USER INSTANCE REQUESTS
// ============================================

/// `POST /users/{user_id}/vps/{vps_id}/renew`
pub async fn renew(state: State, path: web::Path<(Id, Id)>, body: web::Json<RenewRequest>) -> HttpResponse {
    let (user_id, vps_id) = path.into_inner();
    respond(
        state
            .services
            .requests
            .create_renew_order(user_id, vps_id, body.months, body.idempotency_key.as_deref())
            .await,
    )
}

/// `POST /users/{user_id}/vps/{vps_id}/emergency-renew`
pub async fn emergency_renew(state: State, path: web::Path<(Id, Id)>) -> HttpResponse {
    let (user_id, vps_id) = path.into_inner();
    respond(state.services.requests.create_emergency_renew_order(user_id, vps_id).await)
}

/// `POST /users/{user_id}/vps/{vps_id}/resize/quote`
pub async fn quote_resize(state: State, path: web::Path<(Id, Id)>, body: web::Json<ResizeRequest>) -> HttpResponse {
    let (user_id, vps_id) = path.into_inner();
    respond(state.services.requests.quote_resize(user_id, vps_id, &body).await)
}

/// `POST /users/{user_id}/vps/{vps_id}/resize`
pub async fn resize(state: State, path: web::Path<(Id, Id)>, body: web::Json<ResizeRequest>) -> HttpResponse {
    let (user_id, vps_id) = path.into_inner();
    respond(
        state
            .services
            .requests
            .create_resize_order(user_id, vps_id, body.into_inner())
            .await
            .map(|(order, quote)| ResizeOrderResponse { order, quote }),
    )
}

/// `POST /users/{user_id}/vps/{vps_id}/refund`
pub async fn refund(state: State, path: web::Path<(Id, Id)>, body: web::Json<RefundRequest>) -> HttpResponse {
    let (user_id, vps_id) = path.into_inner();
    respond(
        state
            .services
            .requests
            .create_refund_order(user_id, vps_id, &body.reason)
            .await
            .map(|(order, refund_amount)| RefundOrderResponse { order, refund_amount }),
    )
}

// ============================================
// ADMIN: ORDERS & PAYMENTS
// ============================================

/// `GET /admin/orders/{order_id}`
pub async fn get_order(state: State, path: web::Path<Id>) -> HttpResponse {
    respond(order_detail(&state, path.into_inner()).await)
}

async fn order_detail(state: &AppState, order_id: Id) -> BrokerResult<OrderDetailResponse> {
    let repos = &state.services.ctx.repos;
    Ok(OrderDetailResponse {
        order: repos.orders.get_order(order_id).await?,
        items: repos.orders.list_items(order_id).await?,
        payments: repos.payments.list_payments(order_id).await?,
        events: repos.events.list_events(order_id).await?,
    })
}

/// `GET /admin/orders/{order_id}/events`
pub async fn list_order_events(state: State, path: web::Path<Id>) -> HttpResponse {
    let order_id = path.into_inner();
    respond(
        state
            .services
            .ctx
            .repos
            .events
            .list_events(order_id)
            .await
            .map_err(BrokerError::from),
    )
}

/// `POST /admin/orders/{order_id}/approve`
pub async fn approve_order(state: State, req: HttpRequest, path: web::Path<Id>) -> HttpResponse {
    let order_id = path.into_inner();
    let admin = match admin_id(&req) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    info!("Admin {} approving order {}", admin, order_id);
    respond(state.services.orders.approve_order(admin, order_id).await)
}

/// `POST /admin/orders/{order_id}/reject`
pub async fn reject_order(
    state: State,
    req: HttpRequest,
    path: web::Path<Id>,
    body: web::Json<RejectRequest>,
) -> HttpResponse {
    let order_id = path.into_inner();
    let admin = match admin_id(&req) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    respond(state.services.orders.reject_order(admin, order_id, &body.reason).await)
}

/// `POST /admin/orders/{order_id}/retry-provision`
pub async fn retry_provision(state: State, req: HttpRequest, path: web::Path<Id>) -> HttpResponse {
    let order_id = path.into_inner();
    let admin = match admin_id(&req) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    respond(state.services.orders.retry_provision(admin, order_id).await)
}

/// `POST /admin/orders/{order_id}/mark-paid`
pub async fn mark_paid(
    state: State,
    req: HttpRequest,
    path: web::Path<Id>,
    body: web::Json<PaymentInput>,
) -> HttpResponse {
    let order_id = path.into_inner();
    let admin = match admin_id(&req) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    respond(state.services.payments.mark_paid(admin, order_id, body.into_inner()).await)
}

/// `GET /admin/orders/{order_id}/payments`
pub async fn list_payments(state: State, path: web::Path<Id>) -> HttpResponse {
    respond(state.services.payments.list_payments(path.into_inner()).await)
}

/// `POST /admin/payments/{payment_id}/approve`
pub async fn approve_payment(state: State, req: HttpRequest, path: web::Path<Id>) -> HttpResponse {
    let payment_id = path.into_inner();
    let admin = match admin_id(&req) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    respond(state.services.payments.approve_payment(admin, payment_id).await)
}

/// `POST /admin/payments/{payment_id}/reject`
pub async fn reject_payment(
    state: State,
    req: HttpRequest,
    path: web::Path<Id>,
    body: web::Json<RejectRequest>,
) -> HttpResponse {
    let payment_id = path.into_inner();
    let admin = match admin_id(&req) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    respond(state.services.payments.reject_payment(admin, payment_id, &body.reason).await)
}

/// `POST /admin/vps/{vps_id}/delete`
pub async fn admin_delete_vps(state: State, req: HttpRequest, path: web::Path<Id>) -> HttpResponse {
    let vps_id = path.into_inner();
    let admin = match admin_id(&req) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    info!("Admin {} deleting VPS {}", admin, vps_id);
    respond(state.services.requests.create_admin_delete_order(admin, vps_id).await)
}

// ============================================
// ADMIN: BATCHES, LOGS & TASKS
// ============================================

/// `POST /admin/jobs/provision`
pub async fn run_provision_jobs(state: State, query: web::Query<LimitQuery>) -> HttpResponse {
    respond(
        state
            .services
            .worker
            .process_provision_jobs(query.limit.unwrap_or(0))
            .await
            .map(|processed| BatchResponse { processed }),
    )
}

/// `POST /admin/jobs/resize`
pub async fn run_resize_tasks(state: State, query: web::Query<LimitQuery>) -> HttpResponse {
    respond(
        state
            .services
            .orders
            .process_resize_tasks(query.limit_or(DEFAULT_BATCH))
            .await
            .map(|processed| BatchResponse { processed }),
    )
}

/// `POST /admin/jobs/reconcile`
pub async fn run_reconcile(state: State, query: web::Query<LimitQuery>) -> HttpResponse {
    respond(
        state
            .services
            .orders
            .reconcile_provisioning_orders(query.limit_or(DEFAULT_BATCH))
            .await
            .map(|processed| BatchResponse { processed }),
    )
}

/// `GET /admin/automation-logs?order_id=&limit=`
pub async fn list_automation_logs(state: State, query: web::Query<AutomationLogQuery>) -> HttpResponse {
    let limit = query.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_LOG_LIMIT);
    respond(
        state
            .services
            .ctx
            .repos
            .automation_logs
            .list_logs(query.order_id, limit)
            .await
            .map_err(BrokerError::from),
    )
}

/// `GET /admin/tasks`
pub async fn list_tasks(state: State) -> HttpResponse {
    respond(state.services.scheduler.list_tasks().await)
}

/// `PUT /admin/tasks/{key}`
pub async fn update_task(state: State, path: web::Path<String>, body: web::Json<TaskUpdate>) -> HttpResponse {
    respond(state.services.scheduler.update_task(&path, body.into_inner()).await)
}

/// `POST /admin/tasks/{key}/run`
pub async fn run_task(state: State, path: web::Path<String>) -> HttpResponse {
    respond(state.services.scheduler.run_task(&path).await)
}
