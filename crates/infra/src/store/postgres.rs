//! Postgres-backed inventory store.
//!
//! Every unit of work is one database transaction. Rows are locked with
//! `SELECT ... FOR UPDATE` and released on commit or rollback; dropping a
//! [`PostgresTransaction`] without committing rolls it back. Aggregate writes
//! additionally compare-and-set on `version`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database | `40001` | `Contention` | Serialization failure |
//! | Database | `40P01` | `Contention` | Deadlock detected |
//! | Database | `55P03` | `Contention` | `lock_timeout` expired while waiting for a row lock |
//! | Database | `23505` | `Contention` | Racing insert of the same item identity |
//! | Database | `23503`, `23514` | `Conflict` | Foreign key / check constraint violation |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolTimedOut | N/A | `Contention` | No connection available in time |
//! | Other | N/A | `Backend` | Network errors, connection failures, etc. |

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use stockledger_core::{AggregateId, CategoryId, DivisionId, ExpectedVersion, UserId};
use stockledger_inventory::{
    CartId, Item, ItemId, ItemRecord, ItemTransaction, OpnameLine, OpnameStatus, Scope,
    StockOpname, StockOpnameId, StockOpnameRecord, TransactionId, TransactionKind,
    WarehouseOrder, WarehouseOrderCart, WarehouseOrderId, WarehouseOrderRecord,
    WarehouseOrderStatus,
};

use super::{InventoryStore, StoreError, StoreResult, StoreTransaction};

const SCHEMA: &str = include_str!("../../migrations/0001_inventory.sql");

const ITEM_COLUMNS: &str = "id, name, category_id, division_id, unit_of_measure, stock, \
     multiplier, reference_item, version, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "t.id, t.item_id, t.kind, t.quantity, t.balance_after, \
     t.actor, t.description, t.correlation_id, t.occurred_at";

const ORDER_COLUMNS: &str = "id, order_number, division_id, requested_by, description, status, \
     rejection_reason, confirmed_by, confirmed_at, rejected_by, rejected_at, delivered_by, \
     delivered_at, received_by, received_at, version, created_at, updated_at";

const OPNAME_COLUMNS: &str = "id, division_id, performed_by, opname_date, status, confirmed_by, \
     confirmed_at, version, created_at, updated_at";

/// Postgres-backed inventory store.
///
/// Uses the SQLx connection pool, which is `Send + Sync` and cheap to clone.
#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: Duration::from_secs(5),
        }
    }

    /// Bound how long a unit of work waits for a row lock before failing
    /// with `Contention`.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema. Safe to run repeatedly.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn load_order_carts(&self, order_id: Uuid) -> StoreResult<Vec<WarehouseOrderCart>> {
        let rows = sqlx::query_as::<_, CartRow>(SELECT_CARTS)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_order_carts", e))?;
        Ok(rows.into_iter().map(WarehouseOrderCart::from).collect())
    }

    async fn load_opname_lines(&self, opname_id: Uuid) -> StoreResult<Vec<OpnameLine>> {
        let rows = sqlx::query_as::<_, OpnameLineRow>(SELECT_OPNAME_LINES)
            .bind(opname_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_opname_lines", e))?;
        Ok(rows.into_iter().map(OpnameLine::from).collect())
    }

    async fn hydrate_orders(&self, rows: Vec<OrderRow>) -> StoreResult<Vec<WarehouseOrder>> {
        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            let carts = self.load_order_carts(row.id).await?;
            orders.push(row.into_order(carts)?);
        }
        Ok(orders)
    }
}

/// One open database transaction.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PostgresTransaction {
    async fn select_item(&mut self, id: ItemId, for_update: bool) -> StoreResult<Option<Item>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE id = $1{}",
            if for_update { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query_as::<_, ItemRow>(&sql)
            .bind(uuid_of(id.0))
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("select_item", e))?;
        Ok(row.map(Item::from))
    }

    async fn replace_carts(&mut self, order: &WarehouseOrder) -> StoreResult<()> {
        let order_id = uuid_of(order.id_typed().0);
        sqlx::query("DELETE FROM warehouse_order_carts WHERE order_id = $1")
            .bind(order_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("replace_carts", e))?;

        for cart in order.carts() {
            sqlx::query(
                r#"
                INSERT INTO warehouse_order_carts
                    (id, order_id, line_no, item_id, quantity, delivered_quantity, received_quantity)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(uuid_of(cart.id.0))
            .bind(order_id)
            .bind(cart.line_no as i32)
            .bind(uuid_of(cart.item_id.0))
            .bind(cart.quantity)
            .bind(cart.delivered_quantity)
            .bind(cart.received_quantity)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("replace_carts", e))?;
        }
        Ok(())
    }

    async fn replace_opname_lines(&mut self, opname: &StockOpname) -> StoreResult<()> {
        let opname_id = uuid_of(opname.id_typed().0);
        sqlx::query("DELETE FROM stock_opname_lines WHERE opname_id = $1")
            .bind(opname_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("replace_opname_lines", e))?;

        for (idx, line) in opname.lines().iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO stock_opname_lines
                    (opname_id, item_id, line_no, recorded_quantity, counted_quantity)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(opname_id)
            .bind(uuid_of(line.item_id.0))
            .bind(idx as i32 + 1)
            .bind(line.recorded_quantity)
            .bind(line.counted_quantity)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("replace_opname_lines", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn lock_item(&mut self, id: ItemId) -> StoreResult<Option<Item>> {
        self.select_item(id, true).await
    }

    async fn fetch_item(&mut self, id: ItemId) -> StoreResult<Option<Item>> {
        self.select_item(id, false).await
    }

    async fn find_equivalent(
        &mut self,
        scope: Scope,
        name: &str,
        category_id: CategoryId,
        unit_of_measure: &str,
    ) -> StoreResult<Option<Item>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items \
             WHERE division_id IS NOT DISTINCT FROM $1 AND lower(name) = lower($2) \
               AND category_id = $3 AND lower(unit_of_measure) = lower($4) \
             LIMIT 1"
        );
        let row = sqlx::query_as::<_, ItemRow>(&sql)
            .bind(scope.division_id().map(Uuid::from))
            .bind(name.trim())
            .bind(Uuid::from(category_id))
            .bind(unit_of_measure.trim())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find_equivalent", e))?;
        Ok(row.map(Item::from))
    }

    async fn insert_item(&mut self, item: &Item) -> StoreResult<()> {
        let state = item.state();
        sqlx::query(
            r#"
            INSERT INTO items
                (id, name, category_id, division_id, unit_of_measure, stock, multiplier,
                 reference_item, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(uuid_of(state.id.0))
        .bind(&state.name)
        .bind(Uuid::from(state.category_id))
        .bind(state.scope.division_id().map(Uuid::from))
        .bind(&state.unit_of_measure)
        .bind(state.stock)
        .bind(state.multiplier)
        .bind(state.reference_item.map(|r| uuid_of(r.0)))
        .bind(state.version as i64)
        .bind(state.created_at)
        .bind(state.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_item", e))?;
        Ok(())
    }

    async fn update_item(&mut self, item: &Item, expected: ExpectedVersion) -> StoreResult<()> {
        let state = item.state();
        let result = sqlx::query(
            r#"
            UPDATE items
            SET name = $2, category_id = $3, unit_of_measure = $4, multiplier = $5,
                reference_item = $6, version = $7, updated_at = $8
            WHERE id = $1 AND stock = $9 AND ($10::BIGINT IS NULL OR version = $10)
            "#,
        )
        .bind(uuid_of(state.id.0))
        .bind(&state.name)
        .bind(Uuid::from(state.category_id))
        .bind(&state.unit_of_measure)
        .bind(state.multiplier)
        .bind(state.reference_item.map(|r| uuid_of(r.0)))
        .bind(state.version as i64)
        .bind(state.updated_at)
        .bind(state.stock)
        .bind(expected_param(expected))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_item", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "item {} changed concurrently (expected {expected:?})",
                state.id
            )));
        }
        Ok(())
    }

    async fn record_entry(&mut self, item: &Item, entry: &ItemTransaction) -> StoreResult<()> {
        let state = item.state();
        if entry.item_id != state.id || entry.balance_after != state.stock {
            return Err(StoreError::Conflict(format!(
                "ledger entry {} does not match item {}",
                entry.id, state.id
            )));
        }

        let result = sqlx::query(
            "UPDATE items SET stock = $2, version = $3, updated_at = $4 \
             WHERE id = $1 AND version = $3 - 1",
        )
        .bind(uuid_of(state.id.0))
        .bind(state.stock)
        .bind(state.version as i64)
        .bind(state.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("record_entry", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "item {} changed while posting entry {}",
                state.id, entry.id
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO item_transactions
                (id, item_id, kind, quantity, balance_after, actor, description,
                 correlation_id, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id.0)
        .bind(uuid_of(entry.item_id.0))
        .bind(entry.kind.as_str())
        .bind(entry.quantity)
        .bind(entry.balance_after)
        .bind(Uuid::from(entry.actor))
        .bind(&entry.description)
        .bind(entry.correlation_id)
        .bind(entry.occurred_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("record_entry", e))?;

        Ok(())
    }

    async fn next_order_sequence(&mut self, date: NaiveDate) -> StoreResult<u32> {
        let row = sqlx::query(
            r#"
            INSERT INTO warehouse_order_sequences (order_date, last_value)
            VALUES ($1, 1)
            ON CONFLICT (order_date)
            DO UPDATE SET last_value = warehouse_order_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(date)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("next_order_sequence", e))?;

        let value: i32 = row
            .try_get("last_value")
            .map_err(|e| map_sqlx_error("next_order_sequence", e))?;
        u32::try_from(value)
            .map_err(|_| StoreError::Backend(format!("invalid order sequence {value}")))
    }

    async fn insert_order(&mut self, order: &WarehouseOrder) -> StoreResult<()> {
        let s = order.state();
        sqlx::query(
            r#"
            INSERT INTO warehouse_orders
                (id, order_number, division_id, requested_by, description, status,
                 rejection_reason, confirmed_by, confirmed_at, rejected_by, rejected_at,
                 delivered_by, delivered_at, received_by, received_at, version,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(uuid_of(s.id.0))
        .bind(&s.order_number)
        .bind(Uuid::from(s.division_id))
        .bind(Uuid::from(s.requested_by))
        .bind(&s.description)
        .bind(s.status.as_str())
        .bind(&s.rejection_reason)
        .bind(s.confirmed_by.map(Uuid::from))
        .bind(s.confirmed_at)
        .bind(s.rejected_by.map(Uuid::from))
        .bind(s.rejected_at)
        .bind(s.delivered_by.map(Uuid::from))
        .bind(s.delivered_at)
        .bind(s.received_by.map(Uuid::from))
        .bind(s.received_at)
        .bind(s.version as i64)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;

        self.replace_carts(order).await
    }

    async fn lock_order(&mut self, id: WarehouseOrderId) -> StoreResult<Option<WarehouseOrder>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM warehouse_orders WHERE id = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(uuid_of(id.0))
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_order", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let carts = sqlx::query_as::<_, CartRow>(SELECT_CARTS)
            .bind(row.id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_order", e))?;

        row.into_order(carts.into_iter().map(WarehouseOrderCart::from).collect())
            .map(Some)
    }

    async fn update_order(&mut self, order: &WarehouseOrder, expected: ExpectedVersion) -> StoreResult<()> {
        let s = order.state();
        let result = sqlx::query(
            r#"
            UPDATE warehouse_orders
            SET description = $2, status = $3, rejection_reason = $4,
                confirmed_by = $5, confirmed_at = $6, rejected_by = $7, rejected_at = $8,
                delivered_by = $9, delivered_at = $10, received_by = $11, received_at = $12,
                version = $13, updated_at = $14
            WHERE id = $1 AND ($15::BIGINT IS NULL OR version = $15)
            "#,
        )
        .bind(uuid_of(s.id.0))
        .bind(&s.description)
        .bind(s.status.as_str())
        .bind(&s.rejection_reason)
        .bind(s.confirmed_by.map(Uuid::from))
        .bind(s.confirmed_at)
        .bind(s.rejected_by.map(Uuid::from))
        .bind(s.rejected_at)
        .bind(s.delivered_by.map(Uuid::from))
        .bind(s.delivered_at)
        .bind(s.received_by.map(Uuid::from))
        .bind(s.received_at)
        .bind(s.version as i64)
        .bind(s.updated_at)
        .bind(expected_param(expected))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_order", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "order {} changed concurrently (expected {expected:?})",
                s.order_number
            )));
        }

        self.replace_carts(order).await
    }

    async fn delete_order(&mut self, id: WarehouseOrderId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM warehouse_orders WHERE id = $1")
            .bind(uuid_of(id.0))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_order", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("order {id}")));
        }
        Ok(())
    }

    async fn insert_opname(&mut self, opname: &StockOpname) -> StoreResult<()> {
        let s = opname.state();
        sqlx::query(
            r#"
            INSERT INTO stock_opnames
                (id, division_id, performed_by, opname_date, status, confirmed_by,
                 confirmed_at, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(uuid_of(s.id.0))
        .bind(s.scope.division_id().map(Uuid::from))
        .bind(Uuid::from(s.performed_by))
        .bind(s.opname_date)
        .bind(s.status.as_str())
        .bind(s.confirmed_by.map(Uuid::from))
        .bind(s.confirmed_at)
        .bind(s.version as i64)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_opname", e))?;

        self.replace_opname_lines(opname).await
    }

    async fn lock_opname(&mut self, id: StockOpnameId) -> StoreResult<Option<StockOpname>> {
        let sql = format!("SELECT {OPNAME_COLUMNS} FROM stock_opnames WHERE id = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, OpnameRow>(&sql)
            .bind(uuid_of(id.0))
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_opname", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let lines = sqlx::query_as::<_, OpnameLineRow>(SELECT_OPNAME_LINES)
            .bind(row.id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_opname", e))?;

        row.into_opname(lines.into_iter().map(OpnameLine::from).collect())
            .map(Some)
    }

    async fn update_opname(&mut self, opname: &StockOpname, expected: ExpectedVersion) -> StoreResult<()> {
        let s = opname.state();
        let result = sqlx::query(
            r#"
            UPDATE stock_opnames
            SET status = $2, confirmed_by = $3, confirmed_at = $4, version = $5, updated_at = $6
            WHERE id = $1 AND ($7::BIGINT IS NULL OR version = $7)
            "#,
        )
        .bind(uuid_of(s.id.0))
        .bind(s.status.as_str())
        .bind(s.confirmed_by.map(Uuid::from))
        .bind(s.confirmed_at)
        .bind(s.version as i64)
        .bind(s.updated_at)
        .bind(expected_param(expected))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_opname", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "opname {} changed concurrently (expected {expected:?})",
                s.id
            )));
        }

        self.replace_opname_lines(opname).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }
}

#[async_trait]
impl InventoryStore for PostgresInventoryStore {
    #[instrument(skip(self), err)]
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        // SET does not take bind parameters.
        let set_timeout = format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        );
        sqlx::query(&set_timeout)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn item(&self, id: ItemId) -> StoreResult<Option<Item>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = $1");
        let row = sqlx::query_as::<_, ItemRow>(&sql)
            .bind(uuid_of(id.0))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("item", e))?;
        Ok(row.map(Item::from))
    }

    async fn items_in_scope(&self, scope: Scope) -> StoreResult<Vec<Item>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE division_id IS NOT DISTINCT FROM $1 \
             ORDER BY name, id"
        );
        let rows = sqlx::query_as::<_, ItemRow>(&sql)
            .bind(scope.division_id().map(Uuid::from))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("items_in_scope", e))?;
        Ok(rows.into_iter().map(Item::from).collect())
    }

    async fn all_items(&self) -> StoreResult<Vec<Item>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM items ORDER BY id");
        let rows = sqlx::query_as::<_, ItemRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("all_items", e))?;
        Ok(rows.into_iter().map(Item::from).collect())
    }

    #[instrument(skip(self), fields(item_id = %id), err)]
    async fn transactions_for_item(&self, id: ItemId) -> StoreResult<Vec<ItemTransaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM item_transactions t WHERE t.item_id = $1 ORDER BY t.seq"
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(uuid_of(id.0))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("transactions_for_item", e))?;
        rows.into_iter().map(TransactionRow::into_transaction).collect()
    }

    async fn recent_transactions(
        &self,
        scope: Option<Scope>,
        limit: usize,
    ) -> StoreResult<Vec<ItemTransaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM item_transactions t JOIN items i ON i.id = t.item_id \
             WHERE (NOT $1 OR i.division_id IS NOT DISTINCT FROM $2) \
             ORDER BY t.seq DESC LIMIT $3"
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(scope.is_some())
            .bind(scope.and_then(Scope::division_id).map(Uuid::from))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("recent_transactions", e))?;
        rows.into_iter().map(TransactionRow::into_transaction).collect()
    }

    async fn transactions_since(
        &self,
        scope: Option<Scope>,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ItemTransaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM item_transactions t JOIN items i ON i.id = t.item_id \
             WHERE t.occurred_at >= $3 AND (NOT $1 OR i.division_id IS NOT DISTINCT FROM $2) \
             ORDER BY t.seq"
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(scope.is_some())
            .bind(scope.and_then(Scope::division_id).map(Uuid::from))
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("transactions_since", e))?;
        rows.into_iter().map(TransactionRow::into_transaction).collect()
    }

    async fn order(&self, id: WarehouseOrderId) -> StoreResult<Option<WarehouseOrder>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM warehouse_orders WHERE id = $1");
        let row = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(uuid_of(id.0))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("order", e))?;
        match row {
            Some(row) => Ok(self.hydrate_orders(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn orders(
        &self,
        division_id: Option<DivisionId>,
        status: Option<WarehouseOrderStatus>,
    ) -> StoreResult<Vec<WarehouseOrder>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM warehouse_orders \
             WHERE ($1::UUID IS NULL OR division_id = $1) AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at, order_number"
        );
        let rows = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(division_id.map(Uuid::from))
            .bind(status.map(WarehouseOrderStatus::as_str))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("orders", e))?;
        self.hydrate_orders(rows).await
    }

    async fn opname(&self, id: StockOpnameId) -> StoreResult<Option<StockOpname>> {
        let sql = format!("SELECT {OPNAME_COLUMNS} FROM stock_opnames WHERE id = $1");
        let row = sqlx::query_as::<_, OpnameRow>(&sql)
            .bind(uuid_of(id.0))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("opname", e))?;
        match row {
            Some(row) => {
                let lines = self.load_opname_lines(row.id).await?;
                row.into_opname(lines).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn opnames_in_scope(&self, scope: Scope) -> StoreResult<Vec<StockOpname>> {
        let sql = format!(
            "SELECT {OPNAME_COLUMNS} FROM stock_opnames WHERE division_id IS NOT DISTINCT FROM $1 \
             ORDER BY opname_date, created_at"
        );
        let rows = sqlx::query_as::<_, OpnameRow>(&sql)
            .bind(scope.division_id().map(Uuid::from))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("opnames_in_scope", e))?;

        let mut opnames = Vec::with_capacity(rows.len());
        for row in rows {
            let lines = self.load_opname_lines(row.id).await?;
            opnames.push(row.into_opname(lines)?);
        }
        Ok(opnames)
    }
}

fn uuid_of(id: AggregateId) -> Uuid {
    Uuid::from(id)
}

fn expected_param(expected: ExpectedVersion) -> Option<i64> {
    match expected {
        ExpectedVersion::Any => None,
        ExpectedVersion::Exact(v) => Some(v as i64),
    }
}

/// Map SQLx errors to `StoreError` (see the module table).
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") | Some("55P03") => StoreError::Contention(msg),
                Some("23505") => StoreError::Contention(msg),
                Some("23503") | Some("23514") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Contention(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            StoreError::NotFound(format!("unexpected row not found in {operation}"))
        }
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

// SQLx row types

const SELECT_CARTS: &str = "SELECT id, line_no, item_id, quantity, delivered_quantity, \
     received_quantity FROM warehouse_order_carts WHERE order_id = $1 ORDER BY line_no";

const SELECT_OPNAME_LINES: &str = "SELECT item_id, recorded_quantity, counted_quantity \
     FROM stock_opname_lines WHERE opname_id = $1 ORDER BY line_no";

#[derive(Debug)]
struct ItemRow {
    id: Uuid,
    name: String,
    category_id: Uuid,
    division_id: Option<Uuid>,
    unit_of_measure: String,
    stock: i64,
    multiplier: i64,
    reference_item: Option<Uuid>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ItemRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ItemRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            category_id: row.try_get("category_id")?,
            division_id: row.try_get("division_id")?,
            unit_of_measure: row.try_get("unit_of_measure")?,
            stock: row.try_get("stock")?,
            multiplier: row.try_get("multiplier")?,
            reference_item: row.try_get("reference_item")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<ItemRow> for Item {
    fn from(row: ItemRow) -> Self {
        Item::restore(ItemRecord {
            id: ItemId::new(AggregateId::from_uuid(row.id)),
            name: row.name,
            category_id: CategoryId::from_uuid(row.category_id),
            scope: Scope::from_division(row.division_id.map(DivisionId::from_uuid)),
            unit_of_measure: row.unit_of_measure,
            stock: row.stock,
            multiplier: row.multiplier,
            reference_item: row
                .reference_item
                .map(|r| ItemId::new(AggregateId::from_uuid(r))),
            version: row.version as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct TransactionRow {
    id: Uuid,
    item_id: Uuid,
    kind: String,
    quantity: i64,
    balance_after: i64,
    actor: Uuid,
    description: String,
    correlation_id: Option<Uuid>,
    occurred_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TransactionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TransactionRow {
            id: row.try_get("id")?,
            item_id: row.try_get("item_id")?,
            kind: row.try_get("kind")?,
            quantity: row.try_get("quantity")?,
            balance_after: row.try_get("balance_after")?,
            actor: row.try_get("actor")?,
            description: row.try_get("description")?,
            correlation_id: row.try_get("correlation_id")?,
            occurred_at: row.try_get("occurred_at")?,
        })
    }
}

impl TransactionRow {
    fn into_transaction(self) -> StoreResult<ItemTransaction> {
        let kind = TransactionKind::from_str(&self.kind)
            .map_err(|e| StoreError::Backend(format!("corrupt ledger row {}: {e}", self.id)))?;
        Ok(ItemTransaction {
            id: TransactionId(self.id),
            item_id: ItemId::new(AggregateId::from_uuid(self.item_id)),
            kind,
            quantity: self.quantity,
            balance_after: self.balance_after,
            actor: UserId::from_uuid(self.actor),
            description: self.description,
            correlation_id: self.correlation_id,
            occurred_at: self.occurred_at,
        })
    }
}

#[derive(Debug)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    division_id: Uuid,
    requested_by: Uuid,
    description: String,
    status: String,
    rejection_reason: Option<String>,
    confirmed_by: Option<Uuid>,
    confirmed_at: Option<DateTime<Utc>>,
    rejected_by: Option<Uuid>,
    rejected_at: Option<DateTime<Utc>>,
    delivered_by: Option<Uuid>,
    delivered_at: Option<DateTime<Utc>>,
    received_by: Option<Uuid>,
    received_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for OrderRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OrderRow {
            id: row.try_get("id")?,
            order_number: row.try_get("order_number")?,
            division_id: row.try_get("division_id")?,
            requested_by: row.try_get("requested_by")?,
            description: row.try_get("description")?,
            status: row.try_get("status")?,
            rejection_reason: row.try_get("rejection_reason")?,
            confirmed_by: row.try_get("confirmed_by")?,
            confirmed_at: row.try_get("confirmed_at")?,
            rejected_by: row.try_get("rejected_by")?,
            rejected_at: row.try_get("rejected_at")?,
            delivered_by: row.try_get("delivered_by")?,
            delivered_at: row.try_get("delivered_at")?,
            received_by: row.try_get("received_by")?,
            received_at: row.try_get("received_at")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl OrderRow {
    fn into_order(self, carts: Vec<WarehouseOrderCart>) -> StoreResult<WarehouseOrder> {
        let status = WarehouseOrderStatus::from_str(&self.status)
            .map_err(|e| StoreError::Backend(format!("corrupt order row {}: {e}", self.id)))?;
        Ok(WarehouseOrder::restore(WarehouseOrderRecord {
            id: WarehouseOrderId::new(AggregateId::from_uuid(self.id)),
            order_number: self.order_number,
            division_id: DivisionId::from_uuid(self.division_id),
            requested_by: UserId::from_uuid(self.requested_by),
            description: self.description,
            status,
            rejection_reason: self.rejection_reason,
            confirmed_by: self.confirmed_by.map(UserId::from_uuid),
            confirmed_at: self.confirmed_at,
            rejected_by: self.rejected_by.map(UserId::from_uuid),
            rejected_at: self.rejected_at,
            delivered_by: self.delivered_by.map(UserId::from_uuid),
            delivered_at: self.delivered_at,
            received_by: self.received_by.map(UserId::from_uuid),
            received_at: self.received_at,
            carts,
            version: self.version as u64,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }))
    }
}

#[derive(Debug)]
struct CartRow {
    id: Uuid,
    line_no: i32,
    item_id: Uuid,
    quantity: i64,
    delivered_quantity: Option<i64>,
    received_quantity: Option<i64>,
}

impl<'r> FromRow<'r, PgRow> for CartRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(CartRow {
            id: row.try_get("id")?,
            line_no: row.try_get("line_no")?,
            item_id: row.try_get("item_id")?,
            quantity: row.try_get("quantity")?,
            delivered_quantity: row.try_get("delivered_quantity")?,
            received_quantity: row.try_get("received_quantity")?,
        })
    }
}

impl From<CartRow> for WarehouseOrderCart {
    fn from(row: CartRow) -> Self {
        WarehouseOrderCart {
            id: CartId(AggregateId::from_uuid(row.id)),
            line_no: row.line_no.max(0) as u32,
            item_id: ItemId::new(AggregateId::from_uuid(row.item_id)),
            quantity: row.quantity,
            delivered_quantity: row.delivered_quantity,
            received_quantity: row.received_quantity,
        }
    }
}

#[derive(Debug)]
struct OpnameRow {
    id: Uuid,
    division_id: Option<Uuid>,
    performed_by: Uuid,
    opname_date: NaiveDate,
    status: String,
    confirmed_by: Option<Uuid>,
    confirmed_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for OpnameRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OpnameRow {
            id: row.try_get("id")?,
            division_id: row.try_get("division_id")?,
            performed_by: row.try_get("performed_by")?,
            opname_date: row.try_get("opname_date")?,
            status: row.try_get("status")?,
            confirmed_by: row.try_get("confirmed_by")?,
            confirmed_at: row.try_get("confirmed_at")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl OpnameRow {
    fn into_opname(self, lines: Vec<OpnameLine>) -> StoreResult<StockOpname> {
        let status = OpnameStatus::from_str(&self.status)
            .map_err(|e| StoreError::Backend(format!("corrupt opname row {}: {e}", self.id)))?;
        Ok(StockOpname::restore(StockOpnameRecord {
            id: StockOpnameId::new(AggregateId::from_uuid(self.id)),
            scope: Scope::from_division(self.division_id.map(DivisionId::from_uuid)),
            performed_by: UserId::from_uuid(self.performed_by),
            opname_date: self.opname_date,
            status,
            confirmed_by: self.confirmed_by.map(UserId::from_uuid),
            confirmed_at: self.confirmed_at,
            lines,
            version: self.version as u64,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }))
    }
}

#[derive(Debug)]
struct OpnameLineRow {
    item_id: Uuid,
    recorded_quantity: i64,
    counted_quantity: i64,
}

impl<'r> FromRow<'r, PgRow> for OpnameLineRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OpnameLineRow {
            item_id: row.try_get("item_id")?,
            recorded_quantity: row.try_get("recorded_quantity")?,
            counted_quantity: row.try_get("counted_quantity")?,
        })
    }
}

impl From<OpnameLineRow> for OpnameLine {
    fn from(row: OpnameLineRow) -> Self {
        OpnameLine {
            item_id: ItemId::new(AggregateId::from_uuid(row.item_id)),
            recorded_quantity: row.recorded_quantity,
            counted_quantity: row.counted_quantity,
        }
    }
}
