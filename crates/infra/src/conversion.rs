//! ConversionEngine: breaks pack units into their base unit.
//!
//! A conversion is two ledger entries in one unit of work: `ConversionOut` on the
//! pack item and `ConversionIn` on the base item, sharing a correlation id. The
//! pack decrement is validated first, so an overdrawn pack writes nothing.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use stockledger_core::{Actor, Capability, DomainError};
use stockledger_inventory::{ItemId, ItemTransaction, TransactionKind};

use crate::error::{ServiceError, ServiceResult};
use crate::ledger::{post, Movement};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{InventoryStore, StoreError};

/// Both halves of a committed conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionOutcome {
    pub correlation_id: Uuid,
    pub pack: ItemTransaction,
    pub base: ItemTransaction,
}

impl ConversionOutcome {
    pub fn base_quantity(&self) -> i64 {
        self.base.quantity
    }
}

#[derive(Debug, Clone)]
pub struct ConversionEngine<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S> ConversionEngine<S>
where
    S: InventoryStore,
{
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Convert `quantity` pack units of `pack_id` into its reference item.
    #[instrument(
        skip(self, actor),
        fields(pack_id = %pack_id, quantity, user_id = %actor.user_id()),
        err
    )]
    pub async fn convert(
        &self,
        actor: &Actor,
        pack_id: ItemId,
        quantity: i64,
    ) -> ServiceResult<ConversionOutcome> {
        actor.require(Capability::StockConvert)?;
        if quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive").into());
        }

        let outcome =
            with_retry(&self.retry, "convert", || self.convert_once(actor, pack_id, quantity))
                .await?;

        info!(
            pack_id = %pack_id,
            base_id = %outcome.base.item_id,
            quantity,
            base_quantity = outcome.base_quantity(),
            correlation_id = %outcome.correlation_id,
            "conversion committed"
        );
        Ok(outcome)
    }

    async fn convert_once(
        &self,
        actor: &Actor,
        pack_id: ItemId,
        quantity: i64,
    ) -> ServiceResult<ConversionOutcome> {
        let mut tx = self.store.begin().await?;

        let pack = tx
            .fetch_item(pack_id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("item {pack_id}")))?;
        let (base_id, multiplier) = pack
            .conversion()
            .ok_or(DomainError::NotConvertible(pack_id.0))?;
        let base_quantity = quantity
            .checked_mul(multiplier)
            .ok_or_else(|| DomainError::validation("converted quantity overflows"))?;

        let mut lock_order = [pack_id, base_id];
        lock_order.sort();
        let mut locked = HashMap::new();
        for id in lock_order {
            if let Some(item) = tx.lock_item(id).await? {
                locked.insert(id, item);
            }
        }

        let pack = locked
            .remove(&pack_id)
            .ok_or_else(|| DomainError::not_found(format!("item {pack_id}")))?;
        if pack.conversion() != Some((base_id, multiplier)) {
            return Err(ServiceError::from(StoreError::Contention(format!(
                "conversion link of item {pack_id} changed during conversion"
            ))));
        }
        let base = locked.remove(&base_id).ok_or_else(|| {
            DomainError::invalid_link(format!("reference item {base_id} does not exist"))
        })?;
        if base.scope() != pack.scope() {
            return Err(DomainError::invalid_link(format!(
                "reference item {base_id} belongs to {} but item {pack_id} belongs to {}",
                base.scope(),
                pack.scope()
            ))
            .into());
        }

        let correlation_id = Uuid::now_v7();
        let description = format!(
            "convert {quantity} {} into {base_quantity} {}",
            pack.unit_of_measure(),
            base.unit_of_measure()
        );

        let (_, pack_entry) = post(
            tx.as_mut(),
            pack_id,
            Movement {
                kind: TransactionKind::ConversionOut,
                quantity,
                actor: actor.user_id(),
                description: &description,
                correlation_id: Some(correlation_id),
            },
        )
        .await?;
        let (_, base_entry) = post(
            tx.as_mut(),
            base_id,
            Movement {
                kind: TransactionKind::ConversionIn,
                quantity: base_quantity,
                actor: actor.user_id(),
                description: &description,
                correlation_id: Some(correlation_id),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(ConversionOutcome {
            correlation_id,
            pack: pack_entry,
            base: base_entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proptest::prelude::*;

    use stockledger_core::{CategoryId, UserId};
    use stockledger_inventory::{Item, NewItem, Scope};

    use super::*;
    use crate::ledger::StockLedger;
    use crate::store::InMemoryInventoryStore;

    struct Fixture {
        engine: ConversionEngine<InMemoryInventoryStore>,
        ledger: StockLedger<InMemoryInventoryStore>,
        pack: ItemId,
        base: ItemId,
        actor: Actor,
    }

    async fn insert(store: &InMemoryInventoryStore, item: &Item) {
        let mut tx = store.begin().await.unwrap();
        tx.insert_item(item).await.unwrap();
        tx.commit().await.unwrap();
    }

    fn item(name: &str, unit: &str, multiplier: i64, reference_item: Option<ItemId>) -> Item {
        Item::create(
            NewItem {
                id: ItemId::generate(),
                name: name.to_string(),
                category_id: CategoryId::new(),
                scope: Scope::Warehouse,
                unit_of_measure: unit.to_string(),
                multiplier,
                reference_item,
            },
            Utc::now(),
        )
        .unwrap()
    }

    async fn fixture(multiplier: i64, pack_stock: i64, base_stock: i64) -> Fixture {
        let store = InMemoryInventoryStore::new();
        let base = item("Pen", "pcs", 1, None);
        let pack = item("Pen", "box", multiplier, Some(base.id_typed()));
        insert(&store, &base).await;
        insert(&store, &pack).await;

        let actor = Actor::superuser(UserId::new());
        let ledger = StockLedger::new(store.clone(), RetryPolicy::no_retry());
        if pack_stock > 0 {
            ledger.receive(&actor, pack.id_typed(), pack_stock, "seed").await.unwrap();
        }
        if base_stock > 0 {
            ledger.receive(&actor, base.id_typed(), base_stock, "seed").await.unwrap();
        }

        Fixture {
            engine: ConversionEngine::new(store, RetryPolicy::no_retry()),
            ledger,
            pack: pack.id_typed(),
            base: base.id_typed(),
            actor,
        }
    }

    #[tokio::test]
    async fn box_of_twelve_breaks_into_pieces() {
        let f = fixture(12, 5, 0).await;

        let outcome = f.engine.convert(&f.actor, f.pack, 2).await.unwrap();

        assert_eq!(f.ledger.balance(f.pack).await.unwrap(), 3);
        assert_eq!(f.ledger.balance(f.base).await.unwrap(), 24);
        assert_eq!(outcome.pack.kind, TransactionKind::ConversionOut);
        assert_eq!(outcome.base.kind, TransactionKind::ConversionIn);
        assert_eq!(outcome.base_quantity(), 24);
        assert_eq!(outcome.pack.correlation_id, Some(outcome.correlation_id));
        assert_eq!(outcome.base.correlation_id, Some(outcome.correlation_id));
    }

    #[tokio::test]
    async fn overdrawn_pack_writes_neither_half() {
        let f = fixture(12, 1, 4).await;

        let err = f.engine.convert(&f.actor, f.pack, 2).await.unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::InsufficientStock { .. })));
        assert_eq!(f.ledger.balance(f.pack).await.unwrap(), 1);
        assert_eq!(f.ledger.balance(f.base).await.unwrap(), 4);
        assert_eq!(f.ledger.history(f.base).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn base_units_are_not_convertible() {
        let f = fixture(12, 0, 5).await;
        let err = f.engine.convert(&f.actor, f.base, 1).await.unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::NotConvertible(_))));
    }

    #[tokio::test]
    async fn multiplier_overflow_is_rejected() {
        let f = fixture(i64::MAX, 2, 0).await;
        let err = f.engine.convert(&f.actor, f.pack, 2).await.unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::Validation(_))));
        assert_eq!(f.ledger.balance(f.pack).await.unwrap(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: a conversion moves exactly `q` pack units into `q * multiplier`
        /// base units, or moves nothing at all.
        #[test]
        fn conversion_conserves_units(
            multiplier in 1i64..50,
            pack_stock in 0i64..20,
            quantity in 1i64..25,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let f = fixture(multiplier, pack_stock, 0).await;
                let result = f.engine.convert(&f.actor, f.pack, quantity).await;

                let pack_after = f.ledger.balance(f.pack).await.unwrap();
                let base_after = f.ledger.balance(f.base).await.unwrap();
                if quantity <= pack_stock {
                    assert!(result.is_ok());
                    assert_eq!(pack_after, pack_stock - quantity);
                    assert_eq!(base_after, quantity * multiplier);
                } else {
                    assert!(result.is_err());
                    assert_eq!(pack_after, pack_stock);
                    assert_eq!(base_after, 0);
                }
                assert!(f.ledger.audit(f.pack).await.unwrap().is_consistent());
                assert!(f.ledger.audit(f.base).await.unwrap().is_consistent());
            });
        }
    }
}
