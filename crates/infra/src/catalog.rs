//! ItemCatalog: item identity, scope and conversion linkage.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{info, instrument, warn};

use stockledger_core::{
    Actor, AggregateRoot, Capability, CategoryId, DomainError, ExpectedVersion,
};
use stockledger_inventory::{
    validate_conversion_link, Item, ItemDetails, ItemId, NewItem, Scope, TransactionKind,
    MAX_CONVERSION_DEPTH,
};

use crate::error::{ServiceError, ServiceResult};
use crate::ledger::{post, Movement};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{InventoryStore, StoreTransaction};

/// Input for [`ItemCatalog::create_item`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateItem {
    pub name: String,
    pub category_id: CategoryId,
    pub scope: Scope,
    pub unit_of_measure: String,
    pub multiplier: i64,
    pub reference_item: Option<ItemId>,
    /// Recorded as an `In` entry when positive.
    pub opening_stock: i64,
}

#[derive(Debug, Clone)]
pub struct ItemCatalog<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S> ItemCatalog<S>
where
    S: InventoryStore,
{
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    #[instrument(
        skip(self, actor, request),
        fields(name = %request.name, scope = %request.scope, user_id = %actor.user_id()),
        err
    )]
    pub async fn create_item(&self, actor: &Actor, request: CreateItem) -> ServiceResult<Item> {
        actor.require(Capability::CatalogManage)?;
        if request.opening_stock < 0 {
            return Err(DomainError::validation("opening stock cannot be negative").into());
        }

        let item = Item::create(
            NewItem {
                id: ItemId::generate(),
                name: request.name,
                category_id: request.category_id,
                scope: request.scope,
                unit_of_measure: request.unit_of_measure,
                multiplier: request.multiplier,
                reference_item: request.reference_item,
            },
            Utc::now(),
        )?;

        let created = with_retry(&self.retry, "create_item", || {
            self.insert(actor, &item, request.opening_stock)
        })
        .await?;

        info!(item_id = %created.id_typed(), stock = created.stock(), "item created");
        Ok(created)
    }

    async fn insert(&self, actor: &Actor, item: &Item, opening_stock: i64) -> ServiceResult<Item> {
        let mut tx = self.store.begin().await?;

        if let Some(existing) = tx
            .find_equivalent(item.scope(), item.name(), item.category_id(), item.unit_of_measure())
            .await?
        {
            return Err(DomainError::conflict(format!(
                "item {} already names these goods in {}",
                existing.id_typed(),
                item.scope()
            ))
            .into());
        }
        check_link(tx.as_mut(), item.id_typed(), item.scope(), item.reference_item()).await?;
        tx.insert_item(item).await?;

        let created = if opening_stock > 0 {
            let (settled, _) = post(
                tx.as_mut(),
                item.id_typed(),
                Movement {
                    kind: TransactionKind::In,
                    quantity: opening_stock,
                    actor: actor.user_id(),
                    description: "opening stock",
                    correlation_id: None,
                },
            )
            .await?;
            settled
        } else {
            item.clone()
        };

        tx.commit().await?;
        Ok(created)
    }

    /// Change catalog attributes. Scope and stock are not editable.
    #[instrument(skip(self, actor, details), fields(item_id = %item_id, user_id = %actor.user_id()), err)]
    pub async fn update_item(
        &self,
        actor: &Actor,
        item_id: ItemId,
        details: ItemDetails,
        expected: ExpectedVersion,
    ) -> ServiceResult<Item> {
        actor.require(Capability::CatalogManage)?;

        with_retry(&self.retry, "update_item", || async {
            let mut tx = self.store.begin().await?;
            let mut item = tx
                .lock_item(item_id)
                .await?
                .ok_or_else(|| DomainError::not_found(format!("item {item_id}")))?;
            let stored_version = item.version();
            expected.check(stored_version)?;

            item.update_details(details.clone(), Utc::now())?;

            if let Some(other) = tx
                .find_equivalent(item.scope(), item.name(), item.category_id(), item.unit_of_measure())
                .await?
                .filter(|other| other.id_typed() != item_id)
            {
                return Err(ServiceError::from(DomainError::conflict(format!(
                    "item {} already names these goods in {}",
                    other.id_typed(),
                    item.scope()
                ))));
            }
            check_link(tx.as_mut(), item_id, item.scope(), item.reference_item()).await?;

            tx.update_item(&item, ExpectedVersion::Exact(stored_version)).await?;
            tx.commit().await?;
            Ok(item)
        })
        .await
    }

    pub async fn get_item(&self, item_id: ItemId) -> ServiceResult<Item> {
        self.store
            .item(item_id)
            .await?
            .ok_or_else(|| ServiceError::from(DomainError::not_found(format!("item {item_id}"))))
    }

    pub async fn items_in_scope(&self, scope: Scope) -> ServiceResult<Vec<Item>> {
        Ok(self.store.items_in_scope(scope).await?)
    }

    /// Item in `scope` naming the same goods (name, category, unit).
    pub async fn find_equivalent(
        &self,
        scope: Scope,
        name: &str,
        category_id: CategoryId,
        unit_of_measure: &str,
    ) -> ServiceResult<Option<Item>> {
        Ok(self
            .store
            .items_in_scope(scope)
            .await?
            .into_iter()
            .find(|item| item.is_equivalent_in(scope, name, category_id, unit_of_measure)))
    }

    /// Base item and multiplier for a pack unit, `None` for base units.
    pub async fn resolve_conversion(&self, item_id: ItemId) -> ServiceResult<Option<(ItemId, i64)>> {
        Ok(self.get_item(item_id).await?.conversion())
    }
}

/// Validate `item_id -> reference` against the stored chain inside `tx`.
///
/// Every chain row is locked so a concurrent update cannot relink it into a
/// cycle before this unit commits.
pub(crate) async fn check_link(
    tx: &mut dyn StoreTransaction,
    item_id: ItemId,
    scope: Scope,
    reference: Option<ItemId>,
) -> ServiceResult<()> {
    let mut chain: HashMap<ItemId, Item> = HashMap::new();
    let mut next = reference;
    while let Some(id) = next {
        if id == item_id || chain.contains_key(&id) || chain.len() > MAX_CONVERSION_DEPTH {
            break;
        }
        match tx.lock_item(id).await? {
            Some(target) => {
                next = target.reference_item();
                chain.insert(id, target);
            }
            None => break,
        }
    }

    validate_conversion_link(item_id, scope, reference, |id| chain.get(&id)).map_err(|err| {
        warn!(item_id = %item_id, reference = ?reference, error = %err, "conversion link rejected");
        ServiceError::from(err)
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::NaiveDate;

    use stockledger_core::{DivisionId, UserId};
    use stockledger_inventory::{
        ItemTransaction, StockOpname, StockOpnameId, WarehouseOrder, WarehouseOrderId,
    };

    use super::*;
    use crate::store::{InMemoryInventoryStore, StoreResult};

    /// Unit of work that records which items were read with and without a lock.
    struct RecordingTransaction {
        inner: Box<dyn StoreTransaction>,
        locked: Vec<ItemId>,
        fetched: Vec<ItemId>,
    }

    #[async_trait]
    impl StoreTransaction for RecordingTransaction {
        async fn lock_item(&mut self, id: ItemId) -> StoreResult<Option<Item>> {
            self.locked.push(id);
            self.inner.lock_item(id).await
        }

        async fn fetch_item(&mut self, id: ItemId) -> StoreResult<Option<Item>> {
            self.fetched.push(id);
            self.inner.fetch_item(id).await
        }

        async fn find_equivalent(
            &mut self,
            scope: Scope,
            name: &str,
            category_id: CategoryId,
            unit_of_measure: &str,
        ) -> StoreResult<Option<Item>> {
            self.inner
                .find_equivalent(scope, name, category_id, unit_of_measure)
                .await
        }

        async fn insert_item(&mut self, item: &Item) -> StoreResult<()> {
            self.inner.insert_item(item).await
        }

        async fn update_item(&mut self, item: &Item, expected: ExpectedVersion) -> StoreResult<()> {
            self.inner.update_item(item, expected).await
        }

        async fn record_entry(&mut self, item: &Item, entry: &ItemTransaction) -> StoreResult<()> {
            self.inner.record_entry(item, entry).await
        }

        async fn next_order_sequence(&mut self, date: NaiveDate) -> StoreResult<u32> {
            self.inner.next_order_sequence(date).await
        }

        async fn insert_order(&mut self, order: &WarehouseOrder) -> StoreResult<()> {
            self.inner.insert_order(order).await
        }

        async fn lock_order(&mut self, id: WarehouseOrderId) -> StoreResult<Option<WarehouseOrder>> {
            self.inner.lock_order(id).await
        }

        async fn update_order(&mut self, order: &WarehouseOrder, expected: ExpectedVersion) -> StoreResult<()> {
            self.inner.update_order(order, expected).await
        }

        async fn delete_order(&mut self, id: WarehouseOrderId) -> StoreResult<()> {
            self.inner.delete_order(id).await
        }

        async fn insert_opname(&mut self, opname: &StockOpname) -> StoreResult<()> {
            self.inner.insert_opname(opname).await
        }

        async fn lock_opname(&mut self, id: StockOpnameId) -> StoreResult<Option<StockOpname>> {
            self.inner.lock_opname(id).await
        }

        async fn update_opname(&mut self, opname: &StockOpname, expected: ExpectedVersion) -> StoreResult<()> {
            self.inner.update_opname(opname, expected).await
        }

        async fn commit(self: Box<Self>) -> StoreResult<()> {
            self.inner.commit().await
        }
    }

    fn catalog() -> (ItemCatalog<InMemoryInventoryStore>, Actor) {
        (
            ItemCatalog::new(InMemoryInventoryStore::new(), RetryPolicy::no_retry()),
            Actor::superuser(UserId::new()),
        )
    }

    fn request(name: &str, scope: Scope, category_id: CategoryId) -> CreateItem {
        CreateItem {
            name: name.to_string(),
            category_id,
            scope,
            unit_of_measure: "pcs".to_string(),
            multiplier: 1,
            reference_item: None,
            opening_stock: 0,
        }
    }

    fn details(item: &Item, reference_item: Option<ItemId>, multiplier: i64) -> ItemDetails {
        ItemDetails {
            name: item.name().to_string(),
            category_id: item.category_id(),
            unit_of_measure: item.unit_of_measure().to_string(),
            multiplier,
            reference_item,
        }
    }

    #[tokio::test]
    async fn opening_stock_is_recorded_in_the_ledger() {
        let (catalog, actor) = catalog();
        let item = catalog
            .create_item(
                &actor,
                CreateItem {
                    opening_stock: 12,
                    ..request("Paper", Scope::Warehouse, CategoryId::new())
                },
            )
            .await
            .unwrap();

        assert_eq!(item.stock(), 12);
        let history = catalog.store.transactions_for_item(item.id_typed()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, TransactionKind::In);
    }

    #[tokio::test]
    async fn duplicate_identity_in_scope_is_a_conflict() {
        let (catalog, actor) = catalog();
        let category = CategoryId::new();
        catalog
            .create_item(&actor, request("Paper", Scope::Warehouse, category))
            .await
            .unwrap();

        let err = catalog
            .create_item(&actor, request("paper", Scope::Warehouse, category))
            .await
            .unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::Conflict(_))));

        // Same goods in a division is a different item.
        let division = Scope::Division(DivisionId::new());
        catalog
            .create_item(&actor, request("Paper", division, category))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cross_scope_reference_is_rejected() {
        let (catalog, actor) = catalog();
        let category = CategoryId::new();
        let pcs = catalog
            .create_item(&actor, request("Pen", Scope::Division(DivisionId::new()), category))
            .await
            .unwrap();

        let err = catalog
            .create_item(
                &actor,
                CreateItem {
                    unit_of_measure: "box".to_string(),
                    multiplier: 12,
                    reference_item: Some(pcs.id_typed()),
                    ..request("Pen", Scope::Warehouse, category)
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::InvalidConversionLink(_))));
    }

    #[tokio::test]
    async fn update_cannot_close_a_conversion_cycle() {
        let (catalog, actor) = catalog();
        let category = CategoryId::new();
        let pcs = catalog
            .create_item(&actor, request("Pen", Scope::Warehouse, category))
            .await
            .unwrap();
        let pack = catalog
            .create_item(
                &actor,
                CreateItem {
                    unit_of_measure: "box".to_string(),
                    multiplier: 12,
                    reference_item: Some(pcs.id_typed()),
                    ..request("Pen", Scope::Warehouse, category)
                },
            )
            .await
            .unwrap();
        assert_eq!(
            catalog.resolve_conversion(pack.id_typed()).await.unwrap(),
            Some((pcs.id_typed(), 12))
        );

        let err = catalog
            .update_item(
                &actor,
                pcs.id_typed(),
                details(&pcs, Some(pack.id_typed()), 1),
                ExpectedVersion::Any,
            )
            .await
            .unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::InvalidConversionLink(_))));
        assert_eq!(catalog.get_item(pcs.id_typed()).await.unwrap().reference_item(), None);
    }

    #[tokio::test]
    async fn update_checks_expected_version() {
        let (catalog, actor) = catalog();
        let item = catalog
            .create_item(&actor, request("Stapler", Scope::Warehouse, CategoryId::new()))
            .await
            .unwrap();

        let stale = ExpectedVersion::Exact(item.version() + 1);
        let err = catalog
            .update_item(&actor, item.id_typed(), details(&item, None, 1), stale)
            .await
            .unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::Conflict(_))));

        let mut renamed = details(&item, None, 1);
        renamed.name = "Heavy stapler".to_string();
        let updated = catalog
            .update_item(
                &actor,
                item.id_typed(),
                renamed,
                ExpectedVersion::Exact(item.version()),
            )
            .await
            .unwrap();
        assert_eq!(updated.name(), "Heavy stapler");
        assert_eq!(updated.stock(), item.stock());
    }

    #[tokio::test]
    async fn find_equivalent_matches_case_insensitively() {
        let (catalog, actor) = catalog();
        let category = CategoryId::new();
        let item = catalog
            .create_item(&actor, request("Envelope", Scope::Warehouse, category))
            .await
            .unwrap();

        let found = catalog
            .find_equivalent(Scope::Warehouse, "ENVELOPE", category, "PCS")
            .await
            .unwrap();
        assert_eq!(found.map(|i| i.id_typed()), Some(item.id_typed()));
        assert!(
            catalog
                .find_equivalent(Scope::Warehouse, "Envelope", CategoryId::new(), "pcs")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn catalog_changes_require_capability() {
        let (catalog, _) = catalog();
        let clerk = Actor::new(UserId::new(), [Capability::StockIssue]);
        let err = catalog
            .create_item(&clerk, request("Paper", Scope::Warehouse, CategoryId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn link_check_locks_every_item_in_the_chain() {
        let (catalog, actor) = catalog();
        let category = CategoryId::new();
        let pcs = catalog
            .create_item(&actor, request("Pen", Scope::Warehouse, category))
            .await
            .unwrap();
        let pack = |unit: &str, multiplier: i64, reference: &Item| CreateItem {
            unit_of_measure: unit.to_string(),
            multiplier,
            reference_item: Some(reference.id_typed()),
            ..request("Pen", Scope::Warehouse, category)
        };
        let dozen = catalog.create_item(&actor, pack("box", 12, &pcs)).await.unwrap();
        let carton = catalog.create_item(&actor, pack("carton", 10, &dozen)).await.unwrap();

        let mut tx = RecordingTransaction {
            inner: catalog.store.begin().await.unwrap(),
            locked: Vec::new(),
            fetched: Vec::new(),
        };
        check_link(&mut tx, ItemId::generate(), Scope::Warehouse, Some(carton.id_typed()))
            .await
            .unwrap();

        assert_eq!(
            tx.locked,
            vec![carton.id_typed(), dozen.id_typed(), pcs.id_typed()]
        );
        assert!(tx.fetched.is_empty());
    }
}
