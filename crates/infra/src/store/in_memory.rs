use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use stockledger_core::{AggregateRoot, CategoryId, DivisionId, ExpectedVersion};
use stockledger_inventory::{
    Item, ItemId, ItemTransaction, Scope, StockOpname, StockOpnameId, WarehouseOrder,
    WarehouseOrderId, WarehouseOrderStatus,
};

use super::{InventoryStore, StoreError, StoreResult, StoreTransaction};

#[derive(Debug, Default)]
struct Tables {
    items: HashMap<ItemId, Item>,
    /// Global commit order.
    entries: Vec<ItemTransaction>,
    orders: HashMap<WarehouseOrderId, WarehouseOrder>,
    opnames: HashMap<StockOpnameId, StockOpname>,
    sequences: HashMap<NaiveDate, u32>,
}

impl Tables {
    fn scope_of(&self, item_id: ItemId) -> Option<Scope> {
        self.items.get(&item_id).map(Item::scope)
    }

    fn in_scope(&self, entry: &ItemTransaction, scope: Option<Scope>) -> bool {
        match scope {
            None => true,
            Some(scope) => self.scope_of(entry.item_id) == Some(scope),
        }
    }
}

/// In-memory inventory store.
///
/// Intended for tests/dev. A unit of work holds the table lock for its whole
/// lifetime, so units are fully serialized.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Writes staged by an open unit of work, applied on commit.
#[derive(Debug, Default)]
struct Staged {
    items: HashMap<ItemId, Item>,
    entries: Vec<ItemTransaction>,
    /// `None` marks a deleted order.
    orders: HashMap<WarehouseOrderId, Option<WarehouseOrder>>,
    opnames: HashMap<StockOpnameId, StockOpname>,
    sequences: HashMap<NaiveDate, u32>,
}

pub struct InMemoryTransaction {
    tables: OwnedMutexGuard<Tables>,
    staged: Staged,
}

impl InMemoryTransaction {
    fn current_item(&self, id: ItemId) -> Option<&Item> {
        self.staged
            .items
            .get(&id)
            .or_else(|| self.tables.items.get(&id))
    }

    fn current_order(&self, id: WarehouseOrderId) -> Option<&WarehouseOrder> {
        match self.staged.orders.get(&id) {
            Some(staged) => staged.as_ref(),
            None => self.tables.orders.get(&id),
        }
    }

    fn current_opname(&self, id: StockOpnameId) -> Option<&StockOpname> {
        self.staged
            .opnames
            .get(&id)
            .or_else(|| self.tables.opnames.get(&id))
    }

    fn check_version(what: &str, expected: ExpectedVersion, actual: u64) -> StoreResult<()> {
        if expected.matches(actual) {
            Ok(())
        } else {
            Err(StoreError::Conflict(format!(
                "{what} is at version {actual}, expected {expected:?}"
            )))
        }
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn lock_item(&mut self, id: ItemId) -> StoreResult<Option<Item>> {
        Ok(self.current_item(id).cloned())
    }

    async fn fetch_item(&mut self, id: ItemId) -> StoreResult<Option<Item>> {
        Ok(self.current_item(id).cloned())
    }

    async fn find_equivalent(
        &mut self,
        scope: Scope,
        name: &str,
        category_id: CategoryId,
        unit_of_measure: &str,
    ) -> StoreResult<Option<Item>> {
        let staged = self
            .staged
            .items
            .values()
            .find(|i| i.is_equivalent_in(scope, name, category_id, unit_of_measure));
        if let Some(item) = staged {
            return Ok(Some(item.clone()));
        }
        Ok(self
            .tables
            .items
            .values()
            .filter(|i| !self.staged.items.contains_key(&i.id_typed()))
            .find(|i| i.is_equivalent_in(scope, name, category_id, unit_of_measure))
            .cloned())
    }

    async fn insert_item(&mut self, item: &Item) -> StoreResult<()> {
        if self.current_item(item.id_typed()).is_some() {
            return Err(StoreError::Conflict(format!(
                "item {} already exists",
                item.id_typed()
            )));
        }
        let duplicate = self
            .find_equivalent(
                item.scope(),
                item.name(),
                item.category_id(),
                item.unit_of_measure(),
            )
            .await?;
        if duplicate.is_some() {
            return Err(StoreError::Conflict(format!(
                "item '{}' already exists in {}",
                item.name(),
                item.scope()
            )));
        }
        self.staged.items.insert(item.id_typed(), item.clone());
        Ok(())
    }

    async fn update_item(&mut self, item: &Item, expected: ExpectedVersion) -> StoreResult<()> {
        let stored = self
            .current_item(item.id_typed())
            .ok_or_else(|| StoreError::NotFound(format!("item {}", item.id_typed())))?;
        Self::check_version("item", expected, stored.version())?;
        if stored.stock() != item.stock() {
            return Err(StoreError::Conflict(
                "catalog updates cannot change stock".to_string(),
            ));
        }
        self.staged.items.insert(item.id_typed(), item.clone());
        Ok(())
    }

    async fn record_entry(&mut self, item: &Item, entry: &ItemTransaction) -> StoreResult<()> {
        let stored = self
            .current_item(item.id_typed())
            .ok_or_else(|| StoreError::NotFound(format!("item {}", item.id_typed())))?;
        Self::check_version("item", ExpectedVersion::Exact(item.version().saturating_sub(1)), stored.version())?;
        if entry.item_id != item.id_typed() || entry.balance_after != item.stock() {
            return Err(StoreError::Conflict(format!(
                "ledger entry {} does not match item {}",
                entry.id,
                item.id_typed()
            )));
        }
        self.staged.items.insert(item.id_typed(), item.clone());
        self.staged.entries.push(entry.clone());
        Ok(())
    }

    async fn next_order_sequence(&mut self, date: NaiveDate) -> StoreResult<u32> {
        let current = self
            .staged
            .sequences
            .get(&date)
            .or_else(|| self.tables.sequences.get(&date))
            .copied()
            .unwrap_or(0);
        let next = current + 1;
        self.staged.sequences.insert(date, next);
        Ok(next)
    }

    async fn insert_order(&mut self, order: &WarehouseOrder) -> StoreResult<()> {
        if self.current_order(order.id_typed()).is_some() {
            return Err(StoreError::Conflict(format!(
                "order {} already exists",
                order.id_typed()
            )));
        }
        self.staged
            .orders
            .insert(order.id_typed(), Some(order.clone()));
        Ok(())
    }

    async fn lock_order(&mut self, id: WarehouseOrderId) -> StoreResult<Option<WarehouseOrder>> {
        Ok(self.current_order(id).cloned())
    }

    async fn update_order(&mut self, order: &WarehouseOrder, expected: ExpectedVersion) -> StoreResult<()> {
        let stored = self
            .current_order(order.id_typed())
            .ok_or_else(|| StoreError::NotFound(format!("order {}", order.id_typed())))?;
        Self::check_version("order", expected, stored.version())?;
        self.staged
            .orders
            .insert(order.id_typed(), Some(order.clone()));
        Ok(())
    }

    async fn delete_order(&mut self, id: WarehouseOrderId) -> StoreResult<()> {
        if self.current_order(id).is_none() {
            return Err(StoreError::NotFound(format!("order {id}")));
        }
        self.staged.orders.insert(id, None);
        Ok(())
    }

    async fn insert_opname(&mut self, opname: &StockOpname) -> StoreResult<()> {
        if self.current_opname(opname.id_typed()).is_some() {
            return Err(StoreError::Conflict(format!(
                "opname {} already exists",
                opname.id_typed()
            )));
        }
        self.staged.opnames.insert(opname.id_typed(), opname.clone());
        Ok(())
    }

    async fn lock_opname(&mut self, id: StockOpnameId) -> StoreResult<Option<StockOpname>> {
        Ok(self.current_opname(id).cloned())
    }

    async fn update_opname(&mut self, opname: &StockOpname, expected: ExpectedVersion) -> StoreResult<()> {
        let stored = self
            .current_opname(opname.id_typed())
            .ok_or_else(|| StoreError::NotFound(format!("opname {}", opname.id_typed())))?;
        Self::check_version("opname", expected, stored.version())?;
        self.staged.opnames.insert(opname.id_typed(), opname.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let InMemoryTransaction { mut tables, staged } = *self;

        tables.items.extend(staged.items);
        tables.entries.extend(staged.entries);
        for (id, order) in staged.orders {
            match order {
                Some(order) => {
                    tables.orders.insert(id, order);
                }
                None => {
                    tables.orders.remove(&id);
                }
            }
        }
        tables.opnames.extend(staged.opnames);
        tables.sequences.extend(staged.sequences);
        Ok(())
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let tables = self.tables.clone().lock_owned().await;
        Ok(Box::new(InMemoryTransaction {
            tables,
            staged: Staged::default(),
        }))
    }

    async fn item(&self, id: ItemId) -> StoreResult<Option<Item>> {
        Ok(self.tables.lock().await.items.get(&id).cloned())
    }

    async fn items_in_scope(&self, scope: Scope) -> StoreResult<Vec<Item>> {
        let tables = self.tables.lock().await;
        let mut items: Vec<Item> = tables
            .items
            .values()
            .filter(|i| i.scope() == scope)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.name().cmp(b.name()).then(a.id_typed().cmp(&b.id_typed())));
        Ok(items)
    }

    async fn all_items(&self) -> StoreResult<Vec<Item>> {
        let tables = self.tables.lock().await;
        let mut items: Vec<Item> = tables.items.values().cloned().collect();
        items.sort_by_key(Item::id_typed);
        Ok(items)
    }

    async fn transactions_for_item(&self, id: ItemId) -> StoreResult<Vec<ItemTransaction>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .entries
            .iter()
            .filter(|e| e.item_id == id)
            .cloned()
            .collect())
    }

    async fn recent_transactions(
        &self,
        scope: Option<Scope>,
        limit: usize,
    ) -> StoreResult<Vec<ItemTransaction>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .entries
            .iter()
            .rev()
            .filter(|e| tables.in_scope(e, scope))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn transactions_since(
        &self,
        scope: Option<Scope>,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ItemTransaction>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .entries
            .iter()
            .filter(|e| e.occurred_at >= since && tables.in_scope(e, scope))
            .cloned()
            .collect())
    }

    async fn order(&self, id: WarehouseOrderId) -> StoreResult<Option<WarehouseOrder>> {
        Ok(self.tables.lock().await.orders.get(&id).cloned())
    }

    async fn orders(
        &self,
        division_id: Option<DivisionId>,
        status: Option<WarehouseOrderStatus>,
    ) -> StoreResult<Vec<WarehouseOrder>> {
        let tables = self.tables.lock().await;
        let mut orders: Vec<WarehouseOrder> = tables
            .orders
            .values()
            .filter(|o| division_id.is_none_or(|d| o.division_id() == d))
            .filter(|o| status.is_none_or(|s| o.status() == s))
            .cloned()
            .collect();
        orders.sort_by(|a, b| {
            a.state()
                .created_at
                .cmp(&b.state().created_at)
                .then_with(|| a.order_number().cmp(b.order_number()))
        });
        Ok(orders)
    }

    async fn opname(&self, id: StockOpnameId) -> StoreResult<Option<StockOpname>> {
        Ok(self.tables.lock().await.opnames.get(&id).cloned())
    }

    async fn opnames_in_scope(&self, scope: Scope) -> StoreResult<Vec<StockOpname>> {
        let tables = self.tables.lock().await;
        let mut opnames: Vec<StockOpname> = tables
            .opnames
            .values()
            .filter(|o| o.scope() == scope)
            .cloned()
            .collect();
        opnames.sort_by(|a, b| {
            a.opname_date()
                .cmp(&b.opname_date())
                .then_with(|| a.state().created_at.cmp(&b.state().created_at))
        });
        Ok(opnames)
    }
}
