//! # Database Queries
//!
//! PostgreSQL implementation of the repository contracts in `repos.rs`.
//!
//! ## Query Organization
//!
//! Queries are grouped by the table they operate on:
//! - `orders` / `order_items` / `order_payments` / `order_events`
//! - `vps_instances` / `provision_jobs` / `resize_tasks`
//! - `wallets` / `wallet_transactions`
//! - settings, catalog, carts, coupons and observability tables
//!
//! ## Concurrency
//!
//! - Event sequencing locks the parent order row (`FOR UPDATE`) and
//!   computes `MAX(seq) + 1` in the same transaction as the insert.
//! - Wallet movements run in a `SERIALIZABLE` transaction holding the
//!   wallet row lock; the ledger row is written in the same commit.
//!
//! ## Error Handling
//!
//! All queries return `Result<T, DatabaseError>`. Common errors:
//! - `NotFound` - Record doesn't exist
//! - `Conflict` - A unique index rejected the write
//! - `QueryError` - SQL execution failed

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Object, Pool};
use serde_json::Value;
use tokio_postgres::{IsolationLevel, Row};
use tracing::{debug, info};

use super::models::*;
use super::repos::*;
use super::{Database, DatabaseError};
use crate::utils::SpecDoc;

/// Repository store backed by the shared connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    async fn conn(&self) -> DbResult<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))
    }
}

// ============================================
// HELPER FUNCTIONS
// ============================================

const ORDER_COLUMNS: &str = "id, user_id, order_no, source, status, total_amount, currency, \
    coupon_id, coupon_discount, idempotency_key, pending_reason, approved_by, approved_at, \
    rejected_reason, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, order_id, package_id, system_id, spec_json, qty, amount, status, \
    goods_type_id, automation_instance_id, action, duration_months, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, order_id, user_id, method, amount, currency, trade_no, note, \
    screenshot_url, status, idempotency_key, reviewed_by, review_reason, created_at, updated_at";

const INSTANCE_COLUMNS: &str = "id, user_id, order_item_id, automation_instance_id, goods_type_id, \
    name, package_id, package_name, cpu, memory_gb, disk_gb, bandwidth_mbps, port_num, \
    monthly_price, spec_json, system_id, status, automation_state, admin_status, expire_at, \
    panel_url_cache, access_info_json, last_emergency_renew_at, created_at, updated_at";

const JOB_COLUMNS: &str = "id, order_id, order_item_id, host_id, host_name, status, attempts, \
    next_run_at, last_error, created_at, updated_at";

const TASK_COLUMNS: &str = "id, vps_id, order_id, order_item_id, status, last_error, scheduled_at, \
    started_at, finished_at, created_at, updated_at";

const PLAN_GROUP_COLUMNS: &str = "id, line_id, \
    add_core_min, add_core_max, add_core_step, add_mem_min, add_mem_max, add_mem_step, \
    add_disk_min, add_disk_max, add_disk_step, add_bw_min, add_bw_max, add_bw_step, \
    unit_core, unit_mem, unit_disk, unit_bw";

/// Decode a text column into one of the string-backed enums.
fn decode<T>(row: &Row, column: &str, parse: fn(&str) -> Option<T>) -> Result<T, DatabaseError> {
    let raw: String = row.get(column);
    parse(&raw).ok_or_else(|| DatabaseError::Decode(format!("{} = {:?}", column, raw)))
}

fn row_to_order(row: &Row) -> Result<Order, DatabaseError> {
    Ok(Order {
        id: row.get("id"),
        user_id: row.get("user_id"),
        order_no: row.get("order_no"),
        source: decode(row, "source", OrderSource::parse)?,
        status: decode(row, "status", OrderStatus::parse)?,
        total_amount: row.get("total_amount"),
        currency: row.get("currency"),
        coupon_id: row.get("coupon_id"),
        coupon_discount: row.get("coupon_discount"),
        idempotency_key: row.get("idempotency_key"),
        pending_reason: row.get("pending_reason"),
        approved_by: row.get("approved_by"),
        approved_at: row.get("approved_at"),
        rejected_reason: row.get("rejected_reason"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_item(row: &Row) -> Result<OrderItem, DatabaseError> {
    Ok(OrderItem {
        id: row.get("id"),
        order_id: row.get("order_id"),
        package_id: row.get("package_id"),
        system_id: row.get("system_id"),
        spec: SpecDoc::from_value(row.get::<_, Value>("spec_json")),
        qty: row.get("qty"),
        amount: row.get("amount"),
        status: decode(row, "status", OrderStatus::parse)?,
        goods_type_id: row.get("goods_type_id"),
        automation_instance_id: row.get("automation_instance_id"),
        action: decode(row, "action", ItemAction::parse)?,
        duration_months: row.get("duration_months"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_payment(row: &Row) -> Result<OrderPayment, DatabaseError> {
    Ok(OrderPayment {
        id: row.get("id"),
        order_id: row.get("order_id"),
        user_id: row.get("user_id"),
        method: row.get("method"),
        amount: row.get("amount"),
        currency: row.get("currency"),
        trade_no: row.get("trade_no"),
        note: row.get("note"),
        screenshot_url: row.get("screenshot_url"),
        status: decode(row, "status", PaymentStatus::parse)?,
        idempotency_key: row.get("idempotency_key"),
        reviewed_by: row.get("reviewed_by"),
        review_reason: row.get("review_reason"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_event(row: &Row) -> OrderEvent {
    OrderEvent {
        id: row.get("id"),
        order_id: row.get("order_id"),
        seq: row.get("seq"),
        event_type: row.get("event_type"),
        data: row.get("data_json"),
        created_at: row.get("created_at"),
    }
}

fn row_to_instance(row: &Row) -> Result<VpsInstance, DatabaseError> {
    let access: Value = row.get("access_info_json");
    Ok(VpsInstance {
        id: row.get("id"),
        user_id: row.get("user_id"),
        order_item_id: row.get("order_item_id"),
        automation_instance_id: row.get("automation_instance_id"),
        goods_type_id: row.get("goods_type_id"),
        name: row.get("name"),
        package_id: row.get("package_id"),
        package_name: row.get("package_name"),
        cpu: row.get("cpu"),
        memory_gb: row.get("memory_gb"),
        disk_gb: row.get("disk_gb"),
        bandwidth_mbps: row.get("bandwidth_mbps"),
        port_num: row.get("port_num"),
        monthly_price: row.get("monthly_price"),
        spec: SpecDoc::from_value(row.get::<_, Value>("spec_json")),
        system_id: row.get("system_id"),
        status: decode(row, "status", InstanceStatus::parse)?,
        automation_state: row.get("automation_state"),
        admin_status: decode(row, "admin_status", AdminStatus::parse)?,
        expire_at: row.get("expire_at"),
        panel_url_cache: row.get("panel_url_cache"),
        access_info: serde_json::from_value(access).unwrap_or_default(),
        last_emergency_renew_at: row.get("last_emergency_renew_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_job(row: &Row) -> Result<ProvisionJob, DatabaseError> {
    Ok(ProvisionJob {
        id: row.get("id"),
        order_id: row.get("order_id"),
        order_item_id: row.get("order_item_id"),
        host_id: row.get("host_id"),
        host_name: row.get("host_name"),
        status: decode(row, "status", JobStatus::parse)?,
        attempts: row.get("attempts"),
        next_run_at: row.get("next_run_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_task(row: &Row) -> Result<ResizeTask, DatabaseError> {
    Ok(ResizeTask {
        id: row.get("id"),
        vps_id: row.get("vps_id"),
        order_id: row.get("order_id"),
        order_item_id: row.get("order_item_id"),
        status: decode(row, "status", ResizeTaskStatus::parse)?,
        last_error: row.get("last_error"),
        scheduled_at: row.get("scheduled_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_plan_group(row: &Row) -> PlanGroup {
    let range = |prefix: &str| AddonRange {
        min: row.get(format!("{}_min", prefix).as_str()),
        max: row.get(format!("{}_max", prefix).as_str()),
        step: row.get(format!("{}_step", prefix).as_str()),
    };
    PlanGroup {
        id: row.get("id"),
        line_id: row.get("line_id"),
        add_core: range("add_core"),
        add_mem: range("add_mem"),
        add_disk: range("add_disk"),
        add_bw: range("add_bw"),
        unit_core: row.get("unit_core"),
        unit_mem: row.get("unit_mem"),
        unit_disk: row.get("unit_disk"),
        unit_bw: row.get("unit_bw"),
    }
}

fn row_to_coupon(row: &Row) -> Result<Coupon, DatabaseError> {
    Ok(Coupon {
        id: row.get("id"),
        code: row.get("code"),
        kind: decode(row, "kind", CouponKind::parse)?,
        value: row.get("value"),
        min_order_amount: row.get("min_order_amount"),
        max_uses: row.get("max_uses"),
        per_user_limit: row.get("per_user_limit"),
        new_user_only: row.get("new_user_only"),
        active: row.get("active"),
        starts_at: row.get("starts_at"),
        ends_at: row.get("ends_at"),
    })
}

fn row_to_run(row: &Row) -> ScheduledTaskRun {
    ScheduledTaskRun {
        id: row.get("id"),
        task_key: row.get("task_key"),
        status: row.get("status"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        duration_sec: row.get("duration_sec"),
        message: row.get("message"),
    }
}

fn collect<T>(rows: &[Row], f: fn(&Row) -> Result<T, DatabaseError>) -> DbResult<Vec<T>> {
    rows.iter().map(f).collect()
}

fn access_json(info: &AccessInfo) -> Value {
    serde_json::to_value(info).unwrap_or_else(|_| Value::Object(Default::default()))
}

const OPEN_ITEM_STATUSES: &str = "('pending_payment', 'pending_review', 'approved', 'provisioning')";

// ============================================
// ORDER QUERIES
// ============================================

#[async_trait]
impl OrderRepository for PgStore {
    async fn create_order(
        &self,
        order: Order,
        items: Vec<OrderItem>,
        extras: OrderCreateExtras,
    ) -> DbResult<(Order, Vec<OrderItem>)> {
        debug!("Creating order {} for user {}", order.order_no, order.user_id);

        let mut client = self.conn().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_one(
                &*format!(
                    r#"
                    INSERT INTO orders (
                        user_id, order_no, source, status, total_amount, currency,
                        coupon_id, coupon_discount, idempotency_key, pending_reason
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    RETURNING {}
                    "#,
                    ORDER_COLUMNS
                ),
                &[
                    &order.user_id,
                    &order.order_no,
                    &order.source.as_str(),
                    &order.status.as_str(),
                    &order.total_amount,
                    &order.currency,
                    &order.coupon_id,
                    &order.coupon_discount,
                    &order.idempotency_key,
                    &order.pending_reason,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write(e, "order_no or idempotency key"))?;
        let created = row_to_order(&row)?;

        let mut created_items = Vec::with_capacity(items.len());
        for item in &items {
            let row = tx
                .query_one(
                    &*format!(
                        r#"
                        INSERT INTO order_items (
                            order_id, package_id, system_id, spec_json, qty, amount, status,
                            goods_type_id, automation_instance_id, action, duration_months
                        )
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                        RETURNING {}
                        "#,
                        ITEM_COLUMNS
                    ),
                    &[
                        &created.id,
                        &item.package_id,
                        &item.system_id,
                        &item.spec.to_value(),
                        &item.qty,
                        &item.amount,
                        &item.status.as_str(),
                        &item.goods_type_id,
                        &item.automation_instance_id,
                        &item.action.as_str(),
                        &item.duration_months,
                    ],
                )
                .await?;
            created_items.push(row_to_item(&row)?);
        }

        if let Some(user_id) = extras.consume_cart_of {
            tx.execute("DELETE FROM cart_items WHERE user_id = $1", &[&user_id])
                .await?;
        }

        if let Some(redemption) = extras.redemption {
            tx.execute(
                r#"
                INSERT INTO coupon_redemptions (coupon_id, order_id, user_id, status)
                VALUES ($1, $2, $3, $4)
                "#,
                &[
                    &redemption.coupon_id,
                    &created.id,
                    &redemption.user_id,
                    &redemption.status.as_str(),
                ],
            )
            .await?;
        }

        tx.commit().await?;

        info!("Order {} created with {} items", created.order_no, created_items.len());
        Ok((created, created_items))
    }

    async fn get_order(&self, id: Id) -> DbResult<Order> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS),
                &[&id],
            )
            .await?;
        match rows.first() {
            Some(row) => row_to_order(row),
            None => Err(DatabaseError::NotFound(format!("order {}", id))),
        }
    }

    async fn find_order_by_idempotency(&self, user_id: Id, key: &str) -> DbResult<Option<Order>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT {} FROM orders WHERE user_id = $1 AND idempotency_key = $2",
                    ORDER_COLUMNS
                ),
                &[&user_id, &key],
            )
            .await?;
        rows.first().map(row_to_order).transpose()
    }

    async fn save_order(&self, order: &Order) -> DbResult<()> {
        let client = self.conn().await?;
        let updated = client
            .execute(
                r#"
                UPDATE orders
                SET status = $2, pending_reason = $3, approved_by = $4, approved_at = $5,
                    rejected_reason = $6, updated_at = NOW()
                WHERE id = $1
                "#,
                &[
                    &order.id,
                    &order.status.as_str(),
                    &order.pending_reason,
                    &order.approved_by,
                    &order.approved_at,
                    &order.rejected_reason,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::NotFound(format!("order {}", order.id)));
        }
        Ok(())
    }

    async fn list_orders_by_status(&self, status: OrderStatus, limit: i64) -> DbResult<Vec<Order>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT {} FROM orders WHERE status = $1 ORDER BY id LIMIT $2",
                    ORDER_COLUMNS
                ),
                &[&status.as_str(), &limit],
            )
            .await?;
        collect(&rows, row_to_order)
    }

    async fn count_user_orders(&self, user_id: Id) -> DbResult<i64> {
        let client = self.conn().await?;
        let row = client
            .query_one(
                r#"
                SELECT COUNT(*) AS n FROM orders
                WHERE user_id = $1 AND status NOT IN ('canceled', 'rejected')
                "#,
                &[&user_id],
            )
            .await?;
        Ok(row.get("n"))
    }

    async fn list_items(&self, order_id: Id) -> DbResult<Vec<OrderItem>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT {} FROM order_items WHERE order_id = $1 ORDER BY id",
                    ITEM_COLUMNS
                ),
                &[&order_id],
            )
            .await?;
        collect(&rows, row_to_item)
    }

    async fn get_item(&self, id: Id) -> DbResult<OrderItem> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!("SELECT {} FROM order_items WHERE id = $1", ITEM_COLUMNS),
                &[&id],
            )
            .await?;
        match rows.first() {
            Some(row) => row_to_item(row),
            None => Err(DatabaseError::NotFound(format!("order item {}", id))),
        }
    }

    async fn save_item(&self, item: &OrderItem) -> DbResult<()> {
        let client = self.conn().await?;
        let updated = client
            .execute(
                r#"
                UPDATE order_items
                SET status = $2, automation_instance_id = $3, spec_json = $4, updated_at = NOW()
                WHERE id = $1
                "#,
                &[
                    &item.id,
                    &item.status.as_str(),
                    &item.automation_instance_id,
                    &item.spec.to_value(),
                ],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::NotFound(format!("order item {}", item.id)));
        }
        Ok(())
    }

    async fn list_open_items_for_vps(&self, vps_id: Id, action: ItemAction) -> DbResult<Vec<OrderItem>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT {} FROM order_items \
                     WHERE spec_json->>'vps_id' = $1 AND action = $2 AND status IN {} \
                     ORDER BY id",
                    ITEM_COLUMNS, OPEN_ITEM_STATUSES
                ),
                &[&vps_id.to_string(), &action.as_str()],
            )
            .await?;
        collect(&rows, row_to_item)
    }
}

// ============================================
// PAYMENT QUERIES
// ============================================

#[async_trait]
impl PaymentRepository for PgStore {
    async fn create_payment(&self, payment: OrderPayment) -> DbResult<OrderPayment> {
        debug!("Recording payment {} for order {}", payment.trade_no, payment.order_id);

        let client = self.conn().await?;
        let row = client
            .query_one(
                &*format!(
                    r#"
                    INSERT INTO order_payments (
                        order_id, user_id, method, amount, currency, trade_no, note,
                        screenshot_url, status, idempotency_key, reviewed_by, review_reason
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                    RETURNING {}
                    "#,
                    PAYMENT_COLUMNS
                ),
                &[
                    &payment.order_id,
                    &payment.user_id,
                    &payment.method,
                    &payment.amount,
                    &payment.currency,
                    &payment.trade_no,
                    &payment.note,
                    &payment.screenshot_url,
                    &payment.status.as_str(),
                    &payment.idempotency_key,
                    &payment.reviewed_by,
                    &payment.review_reason,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write(e, "trade_no or payment idempotency key"))?;
        row_to_payment(&row)
    }

    async fn get_payment(&self, id: Id) -> DbResult<OrderPayment> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!("SELECT {} FROM order_payments WHERE id = $1", PAYMENT_COLUMNS),
                &[&id],
            )
            .await?;
        match rows.first() {
            Some(row) => row_to_payment(row),
            None => Err(DatabaseError::NotFound(format!("payment {}", id))),
        }
    }

    async fn find_payment_by_idempotency(&self, order_id: Id, key: &str) -> DbResult<Option<OrderPayment>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT {} FROM order_payments WHERE order_id = $1 AND idempotency_key = $2",
                    PAYMENT_COLUMNS
                ),
                &[&order_id, &key],
            )
            .await?;
        rows.first().map(row_to_payment).transpose()
    }

    async fn find_payment_by_trade_no(&self, trade_no: &str) -> DbResult<Option<OrderPayment>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!("SELECT {} FROM order_payments WHERE trade_no = $1", PAYMENT_COLUMNS),
                &[&trade_no],
            )
            .await?;
        rows.first().map(row_to_payment).transpose()
    }

    async fn list_payments(&self, order_id: Id) -> DbResult<Vec<OrderPayment>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT {} FROM order_payments WHERE order_id = $1 ORDER BY id",
                    PAYMENT_COLUMNS
                ),
                &[&order_id],
            )
            .await?;
        collect(&rows, row_to_payment)
    }

    async fn save_payment(&self, payment: &OrderPayment) -> DbResult<()> {
        let client = self.conn().await?;
        client
            .execute(
                r#"
                UPDATE order_payments
                SET status = $2, reviewed_by = $3, review_reason = $4, updated_at = NOW()
                WHERE id = $1
                "#,
                &[
                    &payment.id,
                    &payment.status.as_str(),
                    &payment.reviewed_by,
                    &payment.review_reason,
                ],
            )
            .await?;
        Ok(())
    }
}

// ============================================
// EVENT QUERIES
// ============================================

#[async_trait]
impl EventRepository for PgStore {
    async fn append_event(&self, order_id: Id, event_type: &str, data: Value) -> DbResult<OrderEvent> {
        let mut client = self.conn().await?;
        let tx = client.transaction().await?;

        let locked = tx
            .query("SELECT id FROM orders WHERE id = $1 FOR UPDATE", &[&order_id])
            .await?;
        if locked.is_empty() {
            return Err(DatabaseError::NotFound(format!("order {}", order_id)));
        }

        let row = tx
            .query_one(
                "SELECT COALESCE(MAX(seq), 0) + 1 AS next FROM order_events WHERE order_id = $1",
                &[&order_id],
            )
            .await?;
        let seq: i64 = row.get("next");

        let row = tx
            .query_one(
                r#"
                INSERT INTO order_events (order_id, seq, event_type, data_json)
                VALUES ($1, $2, $3, $4)
                RETURNING id, order_id, seq, event_type, data_json, created_at
                "#,
                &[&order_id, &seq, &event_type, &data],
            )
            .await?;
        tx.commit().await?;

        debug!("Order {} event #{} {}", order_id, seq, event_type);
        Ok(row_to_event(&row))
    }

    async fn list_events(&self, order_id: Id) -> DbResult<Vec<OrderEvent>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                r#"
                SELECT id, order_id, seq, event_type, data_json, created_at
                FROM order_events WHERE order_id = $1 ORDER BY seq
                "#,
                &[&order_id],
            )
            .await?;
        Ok(rows.iter().map(row_to_event).collect())
    }
}

// ============================================
// INSTANCE QUERIES
// ============================================

#[async_trait]
impl InstanceRepository for PgStore {
    async fn create_instance(&self, instance: VpsInstance) -> DbResult<VpsInstance> {
        let client = self.conn().await?;
        let row = client
            .query_one(
                &*format!(
                    r#"
                    INSERT INTO vps_instances (
                        user_id, order_item_id, automation_instance_id, goods_type_id, name,
                        package_id, package_name, cpu, memory_gb, disk_gb, bandwidth_mbps,
                        port_num, monthly_price, spec_json, system_id, status, automation_state,
                        admin_status, expire_at, panel_url_cache, access_info_json,
                        last_emergency_renew_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                            $16, $17, $18, $19, $20, $21, $22)
                    RETURNING {}
                    "#,
                    INSTANCE_COLUMNS
                ),
                &[
                    &instance.user_id,
                    &instance.order_item_id,
                    &instance.automation_instance_id,
                    &instance.goods_type_id,
                    &instance.name,
                    &instance.package_id,
                    &instance.package_name,
                    &instance.cpu,
                    &instance.memory_gb,
                    &instance.disk_gb,
                    &instance.bandwidth_mbps,
                    &instance.port_num,
                    &instance.monthly_price,
                    &instance.spec.to_value(),
                    &instance.system_id,
                    &instance.status.as_str(),
                    &instance.automation_state,
                    &instance.admin_status.as_str(),
                    &instance.expire_at,
                    &instance.panel_url_cache,
                    &access_json(&instance.access_info),
                    &instance.last_emergency_renew_at,
                ],
            )
            .await?;
        row_to_instance(&row)
    }

    async fn get_instance(&self, id: Id) -> DbResult<VpsInstance> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!("SELECT {} FROM vps_instances WHERE id = $1", INSTANCE_COLUMNS),
                &[&id],
            )
            .await?;
        match rows.first() {
            Some(row) => row_to_instance(row),
            None => Err(DatabaseError::NotFound(format!("vps instance {}", id))),
        }
    }

    async fn find_instance_by_item(&self, order_item_id: Id) -> DbResult<Option<VpsInstance>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT {} FROM vps_instances WHERE order_item_id = $1 ORDER BY id LIMIT 1",
                    INSTANCE_COLUMNS
                ),
                &[&order_item_id],
            )
            .await?;
        rows.first().map(row_to_instance).transpose()
    }

    async fn save_instance(&self, instance: &VpsInstance) -> DbResult<()> {
        let client = self.conn().await?;
        let updated = client
            .execute(
                r#"
                UPDATE vps_instances
                SET automation_instance_id = $2, name = $3, package_id = $4, package_name = $5,
                    cpu = $6, memory_gb = $7, disk_gb = $8, bandwidth_mbps = $9, port_num = $10,
                    monthly_price = $11, spec_json = $12, status = $13, automation_state = $14,
                    admin_status = $15, expire_at = $16, panel_url_cache = $17,
                    access_info_json = $18, last_emergency_renew_at = $19, updated_at = NOW()
                WHERE id = $1
                "#,
                &[
                    &instance.id,
                    &instance.automation_instance_id,
                    &instance.name,
                    &instance.package_id,
                    &instance.package_name,
                    &instance.cpu,
                    &instance.memory_gb,
                    &instance.disk_gb,
                    &instance.bandwidth_mbps,
                    &instance.port_num,
                    &instance.monthly_price,
                    &instance.spec.to_value(),
                    &instance.status.as_str(),
                    &instance.automation_state,
                    &instance.admin_status.as_str(),
                    &instance.expire_at,
                    &instance.panel_url_cache,
                    &access_json(&instance.access_info),
                    &instance.last_emergency_renew_at,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::NotFound(format!("vps instance {}", instance.id)));
        }
        Ok(())
    }

    async fn delete_instance(&self, id: Id) -> DbResult<()> {
        let client = self.conn().await?;
        let deleted = client
            .execute("DELETE FROM vps_instances WHERE id = $1", &[&id])
            .await?;
        if deleted == 0 {
            return Err(DatabaseError::NotFound(format!("vps instance {}", id)));
        }
        info!("Deleted local instance {}", id);
        Ok(())
    }

    async fn list_expiring(&self, before: DateTime<Utc>) -> DbResult<Vec<VpsInstance>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT {} FROM vps_instances WHERE expire_at IS NOT NULL AND expire_at <= $1 \
                     ORDER BY expire_at",
                    INSTANCE_COLUMNS
                ),
                &[&before],
            )
            .await?;
        collect(&rows, row_to_instance)
    }
}

// ============================================
// PROVISION JOB & RESIZE TASK QUERIES
// ============================================

#[async_trait]
impl ProvisionJobRepository for PgStore {
    async fn upsert_job(&self, job: ProvisionJob) -> DbResult<ProvisionJob> {
        let client = self.conn().await?;
        let row = client
            .query_one(
                &*format!(
                    r#"
                    INSERT INTO provision_jobs (
                        order_id, order_item_id, host_id, host_name, status, attempts,
                        next_run_at, last_error
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (order_item_id) DO UPDATE SET
                        order_id = EXCLUDED.order_id,
                        host_id = EXCLUDED.host_id,
                        host_name = EXCLUDED.host_name,
                        status = EXCLUDED.status,
                        attempts = EXCLUDED.attempts,
                        next_run_at = EXCLUDED.next_run_at,
                        last_error = EXCLUDED.last_error,
                        updated_at = NOW()
                    RETURNING {}
                    "#,
                    JOB_COLUMNS
                ),
                &[
                    &job.order_id,
                    &job.order_item_id,
                    &job.host_id,
                    &job.host_name,
                    &job.status.as_str(),
                    &job.attempts,
                    &job.next_run_at,
                    &job.last_error,
                ],
            )
            .await?;
        row_to_job(&row)
    }

    async fn list_due_jobs(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<ProvisionJob>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT {} FROM provision_jobs \
                     WHERE status IN ('pending', 'retry', 'running') AND next_run_at <= $1 \
                     ORDER BY id LIMIT $2",
                    JOB_COLUMNS
                ),
                &[&now, &limit],
            )
            .await?;
        collect(&rows, row_to_job)
    }

    async fn save_job(&self, job: &ProvisionJob) -> DbResult<()> {
        let client = self.conn().await?;
        client
            .execute(
                r#"
                UPDATE provision_jobs
                SET host_id = $2, host_name = $3, status = $4, attempts = $5,
                    next_run_at = $6, last_error = $7, updated_at = NOW()
                WHERE id = $1
                "#,
                &[
                    &job.id,
                    &job.host_id,
                    &job.host_name,
                    &job.status.as_str(),
                    &job.attempts,
                    &job.next_run_at,
                    &job.last_error,
                ],
            )
            .await?;
        Ok(())
    }

    async fn find_job_by_item(&self, order_item_id: Id) -> DbResult<Option<ProvisionJob>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!("SELECT {} FROM provision_jobs WHERE order_item_id = $1", JOB_COLUMNS),
                &[&order_item_id],
            )
            .await?;
        rows.first().map(row_to_job).transpose()
    }
}

#[async_trait]
impl ResizeTaskRepository for PgStore {
    async fn create_task(&self, task: ResizeTask) -> DbResult<ResizeTask> {
        let client = self.conn().await?;
        let row = client
            .query_one(
                &*format!(
                    r#"
                    INSERT INTO resize_tasks (vps_id, order_id, order_item_id, status, scheduled_at)
                    VALUES ($1, $2, $3, $4, $5)
                    RETURNING {}
                    "#,
                    TASK_COLUMNS
                ),
                &[
                    &task.vps_id,
                    &task.order_id,
                    &task.order_item_id,
                    &task.status.as_str(),
                    &task.scheduled_at,
                ],
            )
            .await?;
        row_to_task(&row)
    }

    async fn get_task(&self, id: Id) -> DbResult<ResizeTask> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!("SELECT {} FROM resize_tasks WHERE id = $1", TASK_COLUMNS),
                &[&id],
            )
            .await?;
        match rows.first() {
            Some(row) => row_to_task(row),
            None => Err(DatabaseError::NotFound(format!("resize task {}", id))),
        }
    }

    async fn has_open_task(&self, vps_id: Id) -> DbResult<bool> {
        let client = self.conn().await?;
        let row = client
            .query_one(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM resize_tasks
                    WHERE vps_id = $1 AND status IN ('pending', 'running')
                ) AS open
                "#,
                &[&vps_id],
            )
            .await?;
        Ok(row.get("open"))
    }

    async fn list_due_tasks(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<ResizeTask>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT {} FROM resize_tasks \
                     WHERE status = 'pending' AND (scheduled_at IS NULL OR scheduled_at <= $1) \
                     ORDER BY id LIMIT $2",
                    TASK_COLUMNS
                ),
                &[&now, &limit],
            )
            .await?;
        collect(&rows, row_to_task)
    }

    async fn find_task_by_item(&self, order_item_id: Id) -> DbResult<Option<ResizeTask>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT {} FROM resize_tasks WHERE order_item_id = $1 ORDER BY id DESC LIMIT 1",
                    TASK_COLUMNS
                ),
                &[&order_item_id],
            )
            .await?;
        rows.first().map(row_to_task).transpose()
    }

    async fn save_task(&self, task: &ResizeTask) -> DbResult<()> {
        let client = self.conn().await?;
        client
            .execute(
                r#"
                UPDATE resize_tasks
                SET status = $2, last_error = $3, scheduled_at = $4, started_at = $5,
                    finished_at = $6, updated_at = NOW()
                WHERE id = $1
                "#,
                &[
                    &task.id,
                    &task.status.as_str(),
                    &task.last_error,
                    &task.scheduled_at,
                    &task.started_at,
                    &task.finished_at,
                ],
            )
            .await?;
        Ok(())
    }
}

// ============================================
// AUTOMATION LOG QUERIES
// ============================================

#[async_trait]
impl AutomationLogRepository for PgStore {
    async fn create_log(&self, log: AutomationLog) -> DbResult<()> {
        let client = self.conn().await?;
        client
            .execute(
                r#"
                INSERT INTO automation_logs (
                    order_id, order_item_id, action, request_json, response_json, success, message
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
                &[
                    &log.order_id,
                    &log.order_item_id,
                    &log.action,
                    &log.request_json,
                    &log.response_json,
                    &log.success,
                    &log.message,
                ],
            )
            .await?;
        Ok(())
    }

    async fn purge_logs_before(&self, before: DateTime<Utc>) -> DbResult<u64> {
        let client = self.conn().await?;
        let deleted = client
            .execute("DELETE FROM automation_logs WHERE created_at < $1", &[&before])
            .await?;
        Ok(deleted)
    }

    async fn list_logs(&self, order_id: Option<Id>, limit: i64) -> DbResult<Vec<AutomationLog>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                r#"
                SELECT id, order_id, order_item_id, action, request_json, response_json,
                       success, message, created_at
                FROM automation_logs
                WHERE ($1::BIGINT IS NULL OR order_id = $1)
                ORDER BY id DESC
                LIMIT $2
                "#,
                &[&order_id, &limit],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| AutomationLog {
                id: row.get("id"),
                order_id: row.get("order_id"),
                order_item_id: row.get("order_item_id"),
                action: row.get("action"),
                request_json: row.get("request_json"),
                response_json: row.get("response_json"),
                success: row.get("success"),
                message: row.get("message"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

// ============================================
// WALLET QUERIES
// ============================================

#[async_trait]
impl WalletRepository for PgStore {
    async fn adjust(&self, movement: WalletMovement) -> DbResult<WalletAdjustment> {
        debug!(
            "Wallet movement user={} amount={} ref={}:{}",
            movement.user_id, movement.amount, movement.ref_type, movement.ref_id
        );

        let mut client = self.conn().await?;
        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .await?;

        tx.execute(
            "INSERT INTO wallets (user_id, balance) VALUES ($1, 0) ON CONFLICT (user_id) DO NOTHING",
            &[&movement.user_id],
        )
        .await?;

        let row = tx
            .query_one(
                "SELECT balance FROM wallets WHERE user_id = $1 FOR UPDATE",
                &[&movement.user_id],
            )
            .await?;
        let balance: i64 = row.get("balance");

        let seen = tx
            .query(
                r#"
                SELECT 1 FROM wallet_transactions
                WHERE user_id = $1 AND ref_type = $2 AND ref_id = $3
                "#,
                &[&movement.user_id, &movement.ref_type, &movement.ref_id],
            )
            .await?;
        if !seen.is_empty() {
            tx.commit().await?;
            return Ok(WalletAdjustment { applied: false, balance });
        }

        let next = balance + movement.amount;
        if next < 0 {
            return Err(DatabaseError::InsufficientBalance {
                available: balance,
                requested: -movement.amount,
            });
        }

        tx.execute(
            "UPDATE wallets SET balance = $2, updated_at = NOW() WHERE user_id = $1",
            &[&movement.user_id, &next],
        )
        .await?;
        tx.execute(
            r#"
            INSERT INTO wallet_transactions (user_id, amount, tx_type, ref_type, ref_id, note)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            &[
                &movement.user_id,
                &movement.amount,
                &movement.tx_type,
                &movement.ref_type,
                &movement.ref_id,
                &movement.note,
            ],
        )
        .await?;
        tx.commit().await?;

        Ok(WalletAdjustment { applied: true, balance: next })
    }

    async fn get_balance(&self, user_id: Id) -> DbResult<i64> {
        let client = self.conn().await?;
        let rows = client
            .query("SELECT balance FROM wallets WHERE user_id = $1", &[&user_id])
            .await?;
        Ok(rows.first().map(|r| r.get("balance")).unwrap_or(0))
    }

    async fn has_transaction(&self, user_id: Id, ref_type: &str, ref_id: Id) -> DbResult<bool> {
        let client = self.conn().await?;
        let rows = client
            .query(
                r#"
                SELECT 1 FROM wallet_transactions
                WHERE user_id = $1 AND ref_type = $2 AND ref_id = $3
                "#,
                &[&user_id, &ref_type, &ref_id],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn list_transactions(&self, user_id: Id) -> DbResult<Vec<WalletTransaction>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                r#"
                SELECT id, user_id, amount, tx_type, ref_type, ref_id, note, created_at
                FROM wallet_transactions WHERE user_id = $1 ORDER BY id
                "#,
                &[&user_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| WalletTransaction {
                id: row.get("id"),
                user_id: row.get("user_id"),
                amount: row.get("amount"),
                tx_type: row.get("tx_type"),
                ref_type: row.get("ref_type"),
                ref_id: row.get("ref_id"),
                note: row.get("note"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

// ============================================
// SETTINGS QUERIES
// ============================================

#[async_trait]
impl SettingsRepository for PgStore {
    async fn get_setting(&self, key: &str) -> DbResult<Option<String>> {
        let client = self.conn().await?;
        let rows = client
            .query("SELECT value_json FROM settings WHERE key = $1", &[&key])
            .await?;
        Ok(rows.first().map(|r| r.get("value_json")))
    }

    async fn upsert_setting(&self, key: &str, value: &str) -> DbResult<()> {
        let client = self.conn().await?;
        client
            .execute(
                r#"
                INSERT INTO settings (key, value_json) VALUES ($1, $2)
                ON CONFLICT (key) DO UPDATE SET value_json = EXCLUDED.value_json, updated_at = NOW()
                "#,
                &[&key, &value],
            )
            .await?;
        Ok(())
    }

    async fn list_settings(&self) -> DbResult<Vec<Setting>> {
        let client = self.conn().await?;
        let rows = client
            .query("SELECT key, value_json, updated_at FROM settings ORDER BY key", &[])
            .await?;
        Ok(rows
            .iter()
            .map(|row| Setting {
                key: row.get("key"),
                value: row.get("value_json"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }
}

// ============================================
// CATALOG, CART & COUPON QUERIES
// ============================================

#[async_trait]
impl CatalogRepository for PgStore {
    async fn get_goods_type(&self, id: Id) -> DbResult<GoodsType> {
        let client = self.conn().await?;
        let rows = client
            .query(
                r#"
                SELECT id, name, sort_order, automation_category, automation_plugin_id,
                       automation_instance_id
                FROM goods_types WHERE id = $1
                "#,
                &[&id],
            )
            .await?;
        rows.first()
            .map(row_to_goods_type)
            .ok_or_else(|| DatabaseError::NotFound(format!("goods type {}", id)))
    }

    async fn list_goods_types(&self) -> DbResult<Vec<GoodsType>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                r#"
                SELECT id, name, sort_order, automation_category, automation_plugin_id,
                       automation_instance_id
                FROM goods_types ORDER BY sort_order, id
                "#,
                &[],
            )
            .await?;
        Ok(rows.iter().map(row_to_goods_type).collect())
    }

    async fn get_package(&self, id: Id) -> DbResult<Package> {
        let client = self.conn().await?;
        let rows = client
            .query(
                r#"
                SELECT id, name, goods_type_id, plan_group_id, cpu, memory_gb, disk_gb,
                       bandwidth_mbps, port_num, monthly_price, active
                FROM packages WHERE id = $1
                "#,
                &[&id],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| DatabaseError::NotFound(format!("package {}", id)))?;
        Ok(Package {
            id: row.get("id"),
            name: row.get("name"),
            goods_type_id: row.get("goods_type_id"),
            plan_group_id: row.get("plan_group_id"),
            cpu: row.get("cpu"),
            memory_gb: row.get("memory_gb"),
            disk_gb: row.get("disk_gb"),
            bandwidth_mbps: row.get("bandwidth_mbps"),
            port_num: row.get("port_num"),
            monthly_price: row.get("monthly_price"),
            active: row.get("active"),
        })
    }

    async fn get_plan_group(&self, id: Id) -> DbResult<PlanGroup> {
        let client = self.conn().await?;
        let rows = client
            .query(
                &*format!("SELECT {} FROM plan_groups WHERE id = $1", PLAN_GROUP_COLUMNS),
                &[&id],
            )
            .await?;
        rows.first()
            .map(row_to_plan_group)
            .ok_or_else(|| DatabaseError::NotFound(format!("plan group {}", id)))
    }

    async fn get_billing_cycle(&self, id: Id) -> DbResult<BillingCycle> {
        let client = self.conn().await?;
        let rows = client
            .query(
                r#"
                SELECT id, months, multiplier_bp, min_qty, max_qty, active
                FROM billing_cycles WHERE id = $1
                "#,
                &[&id],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| DatabaseError::NotFound(format!("billing cycle {}", id)))?;
        Ok(BillingCycle {
            id: row.get("id"),
            months: row.get("months"),
            multiplier_bp: row.get("multiplier_bp"),
            min_qty: row.get("min_qty"),
            max_qty: row.get("max_qty"),
            active: row.get("active"),
        })
    }

    async fn get_system_image(&self, id: Id) -> DbResult<SystemImage> {
        let client = self.conn().await?;
        let rows = client
            .query("SELECT id, name, image_code FROM system_images WHERE id = $1", &[&id])
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| DatabaseError::NotFound(format!("system image {}", id)))?;
        Ok(SystemImage {
            id: row.get("id"),
            name: row.get("name"),
            image_code: row.get("image_code"),
        })
    }
}

fn row_to_goods_type(row: &Row) -> GoodsType {
    GoodsType {
        id: row.get("id"),
        name: row.get("name"),
        sort_order: row.get("sort_order"),
        automation_category: row.get("automation_category"),
        automation_plugin_id: row.get("automation_plugin_id"),
        automation_instance_id: row.get("automation_instance_id"),
    }
}

#[async_trait]
impl CartRepository for PgStore {
    async fn list_cart(&self, user_id: Id) -> DbResult<Vec<CartItem>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                r#"
                SELECT id, user_id, package_id, system_id, spec_json, qty
                FROM cart_items WHERE user_id = $1 ORDER BY id
                "#,
                &[&user_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| CartItem {
                id: row.get("id"),
                user_id: row.get("user_id"),
                package_id: row.get("package_id"),
                system_id: row.get("system_id"),
                spec: serde_json::from_value(row.get::<_, Value>("spec_json")).unwrap_or_default(),
                qty: row.get("qty"),
            })
            .collect())
    }
}

#[async_trait]
impl CouponRepository for PgStore {
    async fn find_coupon(&self, code: &str) -> DbResult<Option<Coupon>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                r#"
                SELECT id, code, kind, value, min_order_amount, max_uses, per_user_limit,
                       new_user_only, active, starts_at, ends_at
                FROM coupons WHERE LOWER(code) = LOWER($1)
                "#,
                &[&code.trim()],
            )
            .await?;
        rows.first().map(row_to_coupon).transpose()
    }

    async fn count_redemptions(&self, coupon_id: Id, user_id: Option<Id>) -> DbResult<i64> {
        let client = self.conn().await?;
        let row = client
            .query_one(
                r#"
                SELECT COUNT(*) AS n FROM coupon_redemptions
                WHERE coupon_id = $1
                  AND ($2::BIGINT IS NULL OR user_id = $2)
                  AND status NOT IN ('rejected', 'canceled')
                "#,
                &[&coupon_id, &user_id],
            )
            .await?;
        Ok(row.get("n"))
    }

    async fn set_redemption_status(&self, order_id: Id, status: RedemptionStatus) -> DbResult<()> {
        let client = self.conn().await?;
        client
            .execute(
                "UPDATE coupon_redemptions SET status = $2 WHERE order_id = $1",
                &[&order_id, &status.as_str()],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn requires_manual_review(&self, user_id: Id) -> DbResult<bool> {
        let client = self.conn().await?;
        let rows = client
            .query("SELECT manual_review FROM user_flags WHERE user_id = $1", &[&user_id])
            .await?;
        Ok(rows.first().map(|r| r.get("manual_review")).unwrap_or(false))
    }

    async fn is_realname_verified(&self, user_id: Id) -> DbResult<bool> {
        let client = self.conn().await?;
        let rows = client
            .query(
                "SELECT realname_verified FROM user_flags WHERE user_id = $1",
                &[&user_id],
            )
            .await?;
        Ok(rows.first().map(|r| r.get("realname_verified")).unwrap_or(false))
    }
}

// ============================================
// OBSERVABILITY QUERIES
// ============================================

#[async_trait]
impl TaskRunRepository for PgStore {
    async fn create_run(&self, run: ScheduledTaskRun) -> DbResult<ScheduledTaskRun> {
        let client = self.conn().await?;
        let row = client
            .query_one(
                r#"
                INSERT INTO scheduled_task_runs (task_key, status, started_at, finished_at, duration_sec, message)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING id, task_key, status, started_at, finished_at, duration_sec, message
                "#,
                &[
                    &run.task_key,
                    &run.status,
                    &run.started_at,
                    &run.finished_at,
                    &run.duration_sec,
                    &run.message,
                ],
            )
            .await?;
        Ok(row_to_run(&row))
    }

    async fn save_run(&self, run: &ScheduledTaskRun) -> DbResult<()> {
        let client = self.conn().await?;
        client
            .execute(
                r#"
                UPDATE scheduled_task_runs
                SET status = $2, finished_at = $3, duration_sec = $4, message = $5
                WHERE id = $1
                "#,
                &[&run.id, &run.status, &run.finished_at, &run.duration_sec, &run.message],
            )
            .await?;
        Ok(())
    }

    async fn list_runs(&self, task_key: &str, limit: i64) -> DbResult<Vec<ScheduledTaskRun>> {
        let client = self.conn().await?;
        let rows = client
            .query(
                r#"
                SELECT id, task_key, status, started_at, finished_at, duration_sec, message
                FROM scheduled_task_runs WHERE task_key = $1
                ORDER BY started_at DESC, id DESC LIMIT $2
                "#,
                &[&task_key, &limit],
            )
            .await?;
        Ok(rows.iter().map(row_to_run).collect())
    }

    async fn purge_runs_before(&self, before: DateTime<Utc>) -> DbResult<u64> {
        let client = self.conn().await?;
        Ok(client
            .execute("DELETE FROM scheduled_task_runs WHERE started_at < $1", &[&before])
            .await?)
    }
}

#[async_trait]
impl AuditRepository for PgStore {
    async fn record_audit(&self, entry: AuditLog) -> DbResult<()> {
        let client = self.conn().await?;
        client
            .execute(
                r#"
                INSERT INTO audit_logs (actor_id, action, target_type, target_id, detail_json)
                VALUES ($1, $2, $3, $4, $5)
                "#,
                &[
                    &entry.actor_id,
                    &entry.action,
                    &entry.target_type,
                    &entry.target_id,
                    &entry.detail,
                ],
            )
            .await?;
        Ok(())
    }

    async fn purge_audit_before(&self, before: DateTime<Utc>) -> DbResult<u64> {
        let client = self.conn().await?;
        Ok(client
            .execute("DELETE FROM audit_logs WHERE created_at < $1", &[&before])
            .await?)
    }

    async fn purge_sync_logs_before(&self, before: DateTime<Utc>) -> DbResult<u64> {
        let client = self.conn().await?;
        Ok(client
            .execute("DELETE FROM integration_sync_logs WHERE created_at < $1", &[&before])
            .await?)
    }
}
