//! Read-only dashboard summaries over items, the ledger, orders and opnames.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use stockledger_core::DivisionId;
use stockledger_inventory::{
    Item, ItemId, ItemTransaction, OpnameStatus, Scope, StockOpnameId, WarehouseOrder,
    WarehouseOrderStatus,
};

use crate::error::ServiceResult;
use crate::store::InventoryStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockLevel {
    pub item_id: ItemId,
    pub name: String,
    pub unit_of_measure: String,
    pub stock: i64,
}

impl From<&Item> for StockLevel {
    fn from(item: &Item) -> Self {
        Self {
            item_id: item.id_typed(),
            name: item.name().to_string(),
            unit_of_measure: item.unit_of_measure().to_string(),
            stock: item.stock(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemActivity {
    pub item_id: ItemId,
    pub name: String,
    pub movements: usize,
    /// Sum of absolute quantities moved.
    pub units_moved: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpnameMonthStatus {
    pub scope: Scope,
    pub confirmed: bool,
    pub opname_id: Option<StockOpnameId>,
    pub opname_date: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct ReportingService<S> {
    store: S,
    low_stock_threshold: i64,
}

impl<S> ReportingService<S>
where
    S: InventoryStore,
{
    pub fn new(store: S, low_stock_threshold: i64) -> Self {
        Self {
            store,
            low_stock_threshold,
        }
    }

    /// Current stock of every item in `scope`, by name.
    pub async fn stock_levels(&self, scope: Scope) -> ServiceResult<Vec<StockLevel>> {
        let items = self.store.items_in_scope(scope).await?;
        Ok(items.iter().map(StockLevel::from).collect())
    }

    /// Newest entries first; `None` covers every scope.
    pub async fn recent_transactions(
        &self,
        scope: Option<Scope>,
        limit: usize,
    ) -> ServiceResult<Vec<ItemTransaction>> {
        Ok(self.store.recent_transactions(scope, limit).await?)
    }

    /// Items at or below `threshold` (the configured default when `None`),
    /// lowest stock first.
    pub async fn low_stock_items(
        &self,
        scope: Scope,
        threshold: Option<i64>,
        limit: usize,
    ) -> ServiceResult<Vec<StockLevel>> {
        let threshold = threshold.unwrap_or(self.low_stock_threshold);
        let mut low: Vec<StockLevel> = self
            .store
            .items_in_scope(scope)
            .await?
            .iter()
            .filter(|item| item.stock() <= threshold)
            .map(StockLevel::from)
            .collect();
        low.sort_by(|a, b| a.stock.cmp(&b.stock).then_with(|| a.name.cmp(&b.name)));
        low.truncate(limit);
        Ok(low)
    }

    /// Items with the most ledger entries since `since`.
    pub async fn most_active_items(
        &self,
        scope: Option<Scope>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ServiceResult<Vec<ItemActivity>> {
        let entries = self.store.transactions_since(scope, since).await?;
        let items = match scope {
            Some(scope) => self.store.items_in_scope(scope).await?,
            None => self.store.all_items().await?,
        };
        let names: HashMap<ItemId, &str> =
            items.iter().map(|i| (i.id_typed(), i.name())).collect();

        let mut activity: HashMap<ItemId, ItemActivity> = HashMap::new();
        for entry in &entries {
            let row = activity.entry(entry.item_id).or_insert_with(|| ItemActivity {
                item_id: entry.item_id,
                name: names.get(&entry.item_id).copied().unwrap_or_default().to_string(),
                movements: 0,
                units_moved: 0,
            });
            row.movements += 1;
            row.units_moved = row.units_moved.saturating_add(entry.quantity);
        }

        let mut ranked: Vec<ItemActivity> = activity.into_values().collect();
        ranked.sort_by(|a, b| {
            b.movements
                .cmp(&a.movements)
                .then_with(|| b.units_moved.cmp(&a.units_moved))
                .then_with(|| a.name.cmp(&b.name))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Whether each scope has a confirmed opname dated in `year`/`month`.
    pub async fn opname_status(
        &self,
        scopes: &[Scope],
        year: i32,
        month: u32,
    ) -> ServiceResult<Vec<OpnameMonthStatus>> {
        let mut statuses = Vec::with_capacity(scopes.len());
        for &scope in scopes {
            let latest = self
                .store
                .opnames_in_scope(scope)
                .await?
                .into_iter()
                .filter(|o| o.status() == OpnameStatus::Confirmed && o.in_month(year, month))
                .max_by_key(|o| (o.opname_date(), o.state().confirmed_at));

            statuses.push(OpnameMonthStatus {
                scope,
                confirmed: latest.is_some(),
                opname_id: latest.as_ref().map(|o| o.id_typed()),
                opname_date: latest.as_ref().map(|o| o.opname_date()),
            });
        }
        Ok(statuses)
    }

    /// Orders still awaiting approval, oldest first.
    pub async fn pending_orders(
        &self,
        division_id: Option<DivisionId>,
    ) -> ServiceResult<Vec<WarehouseOrder>> {
        Ok(self
            .store
            .orders(division_id, Some(WarehouseOrderStatus::Pending))
            .await?)
    }
}
