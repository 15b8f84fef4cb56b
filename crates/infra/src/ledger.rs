//! StockLedger: the only path that changes an item's stock.
//!
//! Every mutation is one unit of work: lock the item row, decide the entry in
//! the domain (`Item::post`), settle it, write stock and entry together, commit.
//! Multi-item workflows call [`post`] inside their own unit of work.

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument};
use uuid::Uuid;

use stockledger_core::{Actor, Capability, DomainError, UserId};
use stockledger_inventory::{
    Item, ItemId, ItemTransaction, PostingRequest, Scope, TransactionId, TransactionKind,
};

use crate::error::{ServiceError, ServiceResult};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{InventoryStore, StoreTransaction};

/// Entry to append through [`post`].
#[derive(Debug, Clone)]
pub(crate) struct Movement<'a> {
    pub kind: TransactionKind,
    pub quantity: i64,
    pub actor: UserId,
    pub description: &'a str,
    pub correlation_id: Option<Uuid>,
}

/// Lock `item_id`, validate and append one entry inside `tx`.
///
/// Returns the settled item and its entry. Nothing is written when the domain
/// rejects the movement.
pub(crate) async fn post(
    tx: &mut dyn StoreTransaction,
    item_id: ItemId,
    movement: Movement<'_>,
) -> ServiceResult<(Item, ItemTransaction)> {
    let mut item = tx
        .lock_item(item_id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("item {item_id}")))?;

    let entry = item.post(PostingRequest {
        kind: movement.kind,
        quantity: movement.quantity,
        actor: movement.actor,
        description: movement.description.to_string(),
        correlation_id: movement.correlation_id,
        occurred_at: Utc::now(),
    })?;
    item.settle(&entry)?;
    tx.record_entry(&item, &entry).await?;

    Ok((item, entry))
}

/// Result of recomputing an item's stock from its ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceAudit {
    pub item_id: ItemId,
    pub cached_stock: i64,
    pub ledger_balance: i64,
    pub entry_count: usize,
    /// First entry whose `balance_after` does not equal the running prefix sum.
    pub broken_entry: Option<TransactionId>,
}

impl BalanceAudit {
    pub fn is_consistent(&self) -> bool {
        self.cached_stock == self.ledger_balance && self.broken_entry.is_none()
    }

    fn compute(item: &Item, entries: &[ItemTransaction]) -> Self {
        let mut running = 0i64;
        let mut broken_entry = None;
        for entry in entries {
            let Some(next) = running.checked_add(entry.signed_quantity()) else {
                // An overflowing sum is never a valid balance.
                broken_entry.get_or_insert(entry.id);
                break;
            };
            running = next;
            if broken_entry.is_none() && (entry.balance_after != running || running < 0) {
                broken_entry = Some(entry.id);
            }
        }

        Self {
            item_id: item.id_typed(),
            cached_stock: item.stock(),
            ledger_balance: running,
            entry_count: entries.len(),
            broken_entry,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StockLedger<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S> StockLedger<S>
where
    S: InventoryStore,
{
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Take `quantity` units out of stock.
    #[instrument(
        skip(self, actor, description),
        fields(item_id = %item_id, quantity, user_id = %actor.user_id()),
        err
    )]
    pub async fn issue(
        &self,
        actor: &Actor,
        item_id: ItemId,
        quantity: i64,
        description: &str,
    ) -> ServiceResult<ItemTransaction> {
        actor.require(Capability::StockIssue)?;
        with_retry(&self.retry, "issue", || {
            self.apply(actor, item_id, TransactionKind::Out, quantity, description)
        })
        .await
    }

    /// Put `quantity` units into stock.
    #[instrument(
        skip(self, actor, description),
        fields(item_id = %item_id, quantity, user_id = %actor.user_id()),
        err
    )]
    pub async fn receive(
        &self,
        actor: &Actor,
        item_id: ItemId,
        quantity: i64,
        description: &str,
    ) -> ServiceResult<ItemTransaction> {
        actor.require(Capability::StockReceive)?;
        with_retry(&self.retry, "receive", || {
            self.apply(actor, item_id, TransactionKind::In, quantity, description)
        })
        .await
    }

    /// Signed correction. The sign of `signed_quantity` must agree with `kind`.
    #[instrument(
        skip(self, actor, description),
        fields(item_id = %item_id, signed_quantity, kind = %kind, user_id = %actor.user_id()),
        err
    )]
    pub async fn adjust(
        &self,
        actor: &Actor,
        item_id: ItemId,
        signed_quantity: i64,
        kind: TransactionKind,
        description: &str,
    ) -> ServiceResult<ItemTransaction> {
        actor.require(Capability::StockAdjust)?;
        if signed_quantity == 0 {
            return Err(DomainError::validation("quantity must be non-zero").into());
        }
        if signed_quantity.signum() != kind.sign() {
            return Err(DomainError::validation(format!(
                "quantity {signed_quantity} disagrees with the sign of {kind}"
            ))
            .into());
        }
        let quantity = signed_quantity
            .checked_abs()
            .ok_or_else(|| DomainError::validation("stock quantity overflow"))?;

        with_retry(&self.retry, "adjust", || {
            self.apply(actor, item_id, kind, quantity, description)
        })
        .await
    }

    async fn apply(
        &self,
        actor: &Actor,
        item_id: ItemId,
        kind: TransactionKind,
        quantity: i64,
        description: &str,
    ) -> ServiceResult<ItemTransaction> {
        let mut tx = self.store.begin().await?;
        let (item, entry) = post(
            tx.as_mut(),
            item_id,
            Movement {
                kind,
                quantity,
                actor: actor.user_id(),
                description,
                correlation_id: None,
            },
        )
        .await?;
        tx.commit().await?;

        info!(
            item_id = %item_id,
            kind = %kind,
            quantity,
            stock = item.stock(),
            transaction_id = %entry.id,
            "stock movement committed"
        );
        Ok(entry)
    }

    pub async fn balance(&self, item_id: ItemId) -> ServiceResult<i64> {
        Ok(self.require_item(item_id).await?.stock())
    }

    /// Ledger entries for `item_id` in commit order.
    pub async fn history(&self, item_id: ItemId) -> ServiceResult<Vec<ItemTransaction>> {
        self.require_item(item_id).await?;
        Ok(self.store.transactions_for_item(item_id).await?)
    }

    #[instrument(skip(self), fields(item_id = %item_id), err)]
    pub async fn audit(&self, item_id: ItemId) -> ServiceResult<BalanceAudit> {
        let item = self.require_item(item_id).await?;
        self.audit_item(&item).await
    }

    pub async fn audit_scope(&self, scope: Scope) -> ServiceResult<Vec<BalanceAudit>> {
        let items = self.store.items_in_scope(scope).await?;
        self.audit_items(&items).await
    }

    pub async fn audit_all(&self) -> ServiceResult<Vec<BalanceAudit>> {
        let items = self.store.all_items().await?;
        self.audit_items(&items).await
    }

    async fn audit_items(&self, items: &[Item]) -> ServiceResult<Vec<BalanceAudit>> {
        let mut audits = Vec::with_capacity(items.len());
        for item in items {
            audits.push(self.audit_item(item).await?);
        }
        Ok(audits)
    }

    async fn audit_item(&self, item: &Item) -> ServiceResult<BalanceAudit> {
        let entries = self.store.transactions_for_item(item.id_typed()).await?;
        let audit = BalanceAudit::compute(item, &entries);
        if !audit.is_consistent() {
            error!(
                item_id = %audit.item_id,
                cached_stock = audit.cached_stock,
                ledger_balance = audit.ledger_balance,
                broken_entry = ?audit.broken_entry,
                "stock drifted from ledger"
            );
        }
        Ok(audit)
    }

    async fn require_item(&self, item_id: ItemId) -> ServiceResult<Item> {
        self.store
            .item(item_id)
            .await?
            .ok_or_else(|| ServiceError::from(DomainError::not_found(format!("item {item_id}"))))
    }
}

#[cfg(test)]
mod tests {
    use stockledger_core::CategoryId;
    use stockledger_inventory::NewItem;

    use super::*;
    use crate::store::InMemoryInventoryStore;

    async fn seeded(stock: i64) -> (StockLedger<InMemoryInventoryStore>, ItemId, Actor) {
        let store = InMemoryInventoryStore::new();
        let item = Item::create(
            NewItem {
                id: ItemId::generate(),
                name: "Stapler".to_string(),
                category_id: CategoryId::new(),
                scope: Scope::Warehouse,
                unit_of_measure: "pcs".to_string(),
                multiplier: 1,
                reference_item: None,
            },
            Utc::now(),
        )
        .unwrap();
        let id = item.id_typed();
        let mut tx = store.begin().await.unwrap();
        tx.insert_item(&item).await.unwrap();
        tx.commit().await.unwrap();

        let ledger = StockLedger::new(store, RetryPolicy::no_retry());
        let actor = Actor::superuser(UserId::new());
        if stock > 0 {
            ledger.receive(&actor, id, stock, "seed").await.unwrap();
        }
        (ledger, id, actor)
    }

    #[tokio::test]
    async fn issue_and_receive_keep_stock_equal_to_ledger() {
        let (ledger, id, actor) = seeded(10).await;

        let out = ledger.issue(&actor, id, 4, "office use").await.unwrap();
        assert_eq!(out.kind, TransactionKind::Out);
        assert_eq!(out.balance_after, 6);
        assert_eq!(out.actor, actor.user_id());

        assert_eq!(ledger.balance(id).await.unwrap(), 6);
        assert_eq!(ledger.history(id).await.unwrap().len(), 2);
        assert!(ledger.audit(id).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn overdraw_fails_without_side_effects() {
        let (ledger, id, actor) = seeded(3).await;

        let err = ledger.issue(&actor, id, 4, "too many").await.unwrap_err();
        assert!(matches!(
            err.domain(),
            Some(DomainError::InsufficientStock {
                requested: 4,
                available: 3,
                ..
            })
        ));
        assert_eq!(ledger.balance(id).await.unwrap(), 3);
        assert_eq!(ledger.history(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn adjust_requires_matching_sign() {
        let (ledger, id, actor) = seeded(5).await;

        assert!(
            ledger
                .adjust(&actor, id, 2, TransactionKind::OpnameDeficit, "count")
                .await
                .is_err()
        );
        assert!(
            ledger
                .adjust(&actor, id, 0, TransactionKind::OpnameSurplus, "count")
                .await
                .is_err()
        );

        let entry = ledger
            .adjust(&actor, id, -2, TransactionKind::OpnameDeficit, "count")
            .await
            .unwrap();
        assert_eq!(entry.quantity, 2);
        assert_eq!(ledger.balance(id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn missing_capability_is_rejected_before_any_write() {
        let (ledger, id, _) = seeded(5).await;
        let clerk = Actor::new(UserId::new(), [Capability::StockReceive]);

        let err = ledger.issue(&clerk, id, 1, "not allowed").await.unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::Unauthorized(_))));
        assert_eq!(ledger.balance(id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn unknown_item_is_not_found() {
        let (ledger, _, actor) = seeded(0).await;
        let err = ledger
            .receive(&actor, ItemId::generate(), 1, "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::NotFound(_))));
    }

    #[test]
    fn audit_flags_broken_running_balance() {
        let item = Item::create(
            NewItem {
                id: ItemId::generate(),
                name: "Ink".to_string(),
                category_id: CategoryId::new(),
                scope: Scope::Warehouse,
                unit_of_measure: "btl".to_string(),
                multiplier: 1,
                reference_item: None,
            },
            Utc::now(),
        )
        .unwrap();
        let entry = |quantity, balance_after| ItemTransaction {
            id: TransactionId::new(),
            item_id: item.id_typed(),
            kind: TransactionKind::In,
            quantity,
            balance_after,
            actor: UserId::new(),
            description: String::new(),
            correlation_id: None,
            occurred_at: Utc::now(),
        };

        let entries = vec![entry(5, 5), entry(5, 9)];
        let audit = BalanceAudit::compute(&item, &entries);
        assert_eq!(audit.ledger_balance, 10);
        assert_eq!(audit.broken_entry, Some(entries[1].id));
        assert!(!audit.is_consistent());

        let overflowing = vec![entry(i64::MAX, i64::MAX), entry(1, i64::MAX)];
        let audit = BalanceAudit::compute(&item, &overflowing);
        assert_eq!(audit.ledger_balance, i64::MAX);
        assert_eq!(audit.broken_entry, Some(overflowing[1].id));
        assert!(!audit.is_consistent());
    }
}
