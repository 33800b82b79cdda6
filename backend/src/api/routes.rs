//! # API Route Configuration

use actix_web::web;

use super::handlers;

/// Configure all API routes.
///
/// ## Route Structure
///
/// ```text
/// /
/// ├── /health                                  GET
/// ├── /users/{user_id}
/// │   ├── /orders                              POST  create from items
/// │   ├── /orders/cart                         POST  create from cart
/// │   ├── /orders/{order_id}/cancel            POST
/// │   ├── /orders/{order_id}/payments          POST
/// │   ├── /wallet                              GET
/// │   └── /vps/{vps_id}
/// │       ├── /renew                           POST
/// │       ├── /emergency-renew                 POST
/// │       ├── /resize/quote                    POST
/// │       ├── /resize                          POST
/// │       └── /refund                          POST
/// └── /admin                                   (X-Admin-Id on mutations)
///     ├── /orders/{order_id}                   GET
///     ├── /orders/{order_id}/events            GET
///     ├── /orders/{order_id}/payments          GET
///     ├── /orders/{order_id}/approve           POST
///     ├── /orders/{order_id}/reject            POST
///     ├── /orders/{order_id}/retry-provision   POST
///     ├── /orders/{order_id}/mark-paid         POST
///     ├── /payments/{payment_id}/approve       POST
///     ├── /payments/{payment_id}/reject        POST
///     ├── /vps/{vps_id}/delete                 POST
///     ├── /jobs/provision|resize|reconcile     POST  ?limit=
///     ├── /automation-logs                     GET   ?order_id=&limit=
///     └── /tasks, /tasks/{key}, /tasks/{key}/run
/// ```
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(handlers::api_info))
        .route("/health", web::get().to(handlers::health_check))
        .service(
            web::scope("/users/{user_id}")
                .route("/orders", web::post().to(handlers::create_order))
                .route("/orders/cart", web::post().to(handlers::create_order_from_cart))
                .route("/orders/{order_id}/cancel", web::post().to(handlers::cancel_order))
                .route("/orders/{order_id}/payments", web::post().to(handlers::submit_payment))
                .route("/wallet", web::get().to(handlers::get_wallet))
                .route("/vps/{vps_id}/renew", web::post().to(handlers::renew))
                .route("/vps/{vps_id}/emergency-renew", web::post().to(handlers::emergency_renew))
                .route("/vps/{vps_id}/resize/quote", web::post().to(handlers::quote_resize))
                .route("/vps/{vps_id}/resize", web::post().to(handlers::resize))
                .route("/vps/{vps_id}/refund", web::post().to(handlers::refund)),
        )
        .service(
            web::scope("/admin")
                .route("/orders/{order_id}", web::get().to(handlers::get_order))
                .route("/orders/{order_id}/events", web::get().to(handlers::list_order_events))
                .route("/orders/{order_id}/payments", web::get().to(handlers::list_payments))
                .route("/orders/{order_id}/approve", web::post().to(handlers::approve_order))
                .route("/orders/{order_id}/reject", web::post().to(handlers::reject_order))
                .route("/orders/{order_id}/retry-provision", web::post().to(handlers::retry_provision))
                .route("/orders/{order_id}/mark-paid", web::post().to(handlers::mark_paid))
                .route("/payments/{payment_id}/approve", web::post().to(handlers::approve_payment))
                .route("/payments/{payment_id}/reject", web::post().to(handlers::reject_payment))
                .route("/vps/{vps_id}/delete", web::post().to(handlers::admin_delete_vps))
                .route("/jobs/provision", web::post().to(handlers::run_provision_jobs))
                .route("/jobs/resize", web::post().to(handlers::run_resize_tasks))
                .route("/jobs/reconcile", web::post().to(handlers::run_reconcile))
                .route("/automation-logs", web::get().to(handlers::list_automation_logs))
                .route("/tasks", web::get().to(handlers::list_tasks))
                .route("/tasks/{key}", web::put().to(handlers::update_task))
                .route("/tasks/{key}/run", web::post().to(handlers::run_task)),
        );
}
