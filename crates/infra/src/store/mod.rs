//! Persistence boundary for items, ledger entries, orders and opnames.
//!
//! A [`StoreTransaction`] is one atomic unit of work. Rows read through its
//! `lock_*` methods stay locked until the unit commits or is dropped; dropping
//! without [`StoreTransaction::commit`] discards every staged write.
//!
//! Stock is never written on its own: [`StoreTransaction::record_entry`] writes
//! the settled item and appends its ledger entry together.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use stockledger_core::{CategoryId, DivisionId, ExpectedVersion};
use stockledger_inventory::{
    Item, ItemId, ItemTransaction, Scope, StockOpname, StockOpnameId, WarehouseOrder,
    WarehouseOrderId, WarehouseOrderStatus,
};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryInventoryStore;
pub use postgres::PostgresInventoryStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Infrastructure failure while reading or writing inventory state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Lock timeout, deadlock, serialization failure or a racing insert.
    #[error("contention: {0}")]
    Contention(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Stale version or a write that contradicts stored state.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// One atomic unit of work.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Read an item and hold its row lock until the unit ends.
    async fn lock_item(&mut self, id: ItemId) -> StoreResult<Option<Item>>;

    /// Read an item without locking it.
    async fn fetch_item(&mut self, id: ItemId) -> StoreResult<Option<Item>>;

    async fn find_equivalent(
        &mut self,
        scope: Scope,
        name: &str,
        category_id: CategoryId,
        unit_of_measure: &str,
    ) -> StoreResult<Option<Item>>;

    async fn insert_item(&mut self, item: &Item) -> StoreResult<()>;

    /// Persist catalog attributes. Must not change stock.
    async fn update_item(&mut self, item: &Item, expected: ExpectedVersion) -> StoreResult<()>;

    /// Write the item's settled stock and append `entry`.
    ///
    /// `item` is the state after [`Item::settle`]; the stored row must still be
    /// at the version before settlement.
    async fn record_entry(&mut self, item: &Item, entry: &ItemTransaction) -> StoreResult<()>;

    /// Next per-day order sequence, starting at 1.
    async fn next_order_sequence(&mut self, date: NaiveDate) -> StoreResult<u32>;

    async fn insert_order(&mut self, order: &WarehouseOrder) -> StoreResult<()>;

    async fn lock_order(&mut self, id: WarehouseOrderId) -> StoreResult<Option<WarehouseOrder>>;

    async fn update_order(&mut self, order: &WarehouseOrder, expected: ExpectedVersion) -> StoreResult<()>;

    async fn delete_order(&mut self, id: WarehouseOrderId) -> StoreResult<()>;

    async fn insert_opname(&mut self, opname: &StockOpname) -> StoreResult<()>;

    async fn lock_opname(&mut self, id: StockOpnameId) -> StoreResult<Option<StockOpname>>;

    async fn update_opname(&mut self, opname: &StockOpname, expected: ExpectedVersion) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Store handle: opens units of work and serves committed reads.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;

    async fn item(&self, id: ItemId) -> StoreResult<Option<Item>>;

    async fn items_in_scope(&self, scope: Scope) -> StoreResult<Vec<Item>>;

    async fn all_items(&self) -> StoreResult<Vec<Item>>;

    /// Every entry for `id` in commit order.
    async fn transactions_for_item(&self, id: ItemId) -> StoreResult<Vec<ItemTransaction>>;

    /// Newest first; `None` covers every scope.
    async fn recent_transactions(
        &self,
        scope: Option<Scope>,
        limit: usize,
    ) -> StoreResult<Vec<ItemTransaction>>;

    async fn transactions_since(
        &self,
        scope: Option<Scope>,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ItemTransaction>>;

    async fn order(&self, id: WarehouseOrderId) -> StoreResult<Option<WarehouseOrder>>;

    /// Orders filtered by requesting division and status, oldest first.
    async fn orders(
        &self,
        division_id: Option<DivisionId>,
        status: Option<WarehouseOrderStatus>,
    ) -> StoreResult<Vec<WarehouseOrder>>;

    async fn opname(&self, id: StockOpnameId) -> StoreResult<Option<StockOpname>>;

    async fn opnames_in_scope(&self, scope: Scope) -> StoreResult<Vec<StockOpname>>;
}

#[async_trait]
impl<S> InventoryStore for Arc<S>
where
    S: InventoryStore + ?Sized,
{
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        (**self).begin().await
    }

    async fn item(&self, id: ItemId) -> StoreResult<Option<Item>> {
        (**self).item(id).await
    }

    async fn items_in_scope(&self, scope: Scope) -> StoreResult<Vec<Item>> {
        (**self).items_in_scope(scope).await
    }

    async fn all_items(&self) -> StoreResult<Vec<Item>> {
        (**self).all_items().await
    }

    async fn transactions_for_item(&self, id: ItemId) -> StoreResult<Vec<ItemTransaction>> {
        (**self).transactions_for_item(id).await
    }

    async fn recent_transactions(
        &self,
        scope: Option<Scope>,
        limit: usize,
    ) -> StoreResult<Vec<ItemTransaction>> {
        (**self).recent_transactions(scope, limit).await
    }

    async fn transactions_since(
        &self,
        scope: Option<Scope>,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ItemTransaction>> {
        (**self).transactions_since(scope, since).await
    }

    async fn order(&self, id: WarehouseOrderId) -> StoreResult<Option<WarehouseOrder>> {
        (**self).order(id).await
    }

    async fn orders(
        &self,
        division_id: Option<DivisionId>,
        status: Option<WarehouseOrderStatus>,
    ) -> StoreResult<Vec<WarehouseOrder>> {
        (**self).orders(division_id, status).await
    }

    async fn opname(&self, id: StockOpnameId) -> StoreResult<Option<StockOpname>> {
        (**self).opname(id).await
    }

    async fn opnames_in_scope(&self, scope: Scope) -> StoreResult<Vec<StockOpname>> {
        (**self).opnames_in_scope(scope).await
    }
}
