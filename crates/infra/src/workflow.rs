//! WarehouseOrderWorkflow: division replenishment requests.
//!
//! ```text
//! Pending --confirm--> Confirmed --deliver--> Delivered --receive--> Finished
//!    \--reject--> Rejected
//! ```
//!
//! Delivery issues from the central warehouse items; receipt puts the goods
//! into the requesting division's equivalent items. Each of them is one unit of
//! work together with the order's status change.

use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use stockledger_core::{Actor, AggregateRoot, Capability, DivisionId, DomainError, ExpectedVersion};
use stockledger_inventory::{
    order_number, CartMovement, CartQuantity, Item, ItemId, NewItem, NewWarehouseOrder,
    OrderLine, Scope, TransactionKind, WarehouseOrder, WarehouseOrderId, WarehouseOrderStatus,
};

use crate::error::{ServiceError, ServiceResult};
use crate::ledger::{post, Movement};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{InventoryStore, StoreTransaction};

#[derive(Debug, Clone)]
pub struct WarehouseOrderWorkflow<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S> WarehouseOrderWorkflow<S>
where
    S: InventoryStore,
{
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Open a Pending order for `division_id`. No stock moves.
    #[instrument(
        skip(self, actor, lines, description),
        fields(division_id = %division_id, lines = lines.len(), user_id = %actor.user_id()),
        err
    )]
    pub async fn create(
        &self,
        actor: &Actor,
        division_id: DivisionId,
        lines: &[OrderLine],
        description: &str,
    ) -> ServiceResult<WarehouseOrder> {
        actor.require(Capability::OrderCreate)?;

        let order = with_retry(&self.retry, "create_order", || async {
            let mut tx = self.store.begin().await?;
            ensure_central_items(tx.as_mut(), lines).await?;

            let now = Utc::now();
            let sequence = tx.next_order_sequence(now.date_naive()).await?;
            let order = WarehouseOrder::create(
                NewWarehouseOrder {
                    id: WarehouseOrderId::generate(),
                    order_number: order_number(now.date_naive(), sequence),
                    division_id,
                    requested_by: actor.user_id(),
                    description: description.trim().to_string(),
                    lines: lines.to_vec(),
                },
                now,
            )?;
            tx.insert_order(&order).await?;
            tx.commit().await?;
            Ok(order)
        })
        .await?;

        info!(order_id = %order.id_typed(), order_number = order.order_number(), "warehouse order created");
        Ok(order)
    }

    /// Replace the cart lines of a Pending order.
    #[instrument(skip(self, actor, lines), fields(order_id = %order_id, user_id = %actor.user_id()), err)]
    pub async fn update_lines(
        &self,
        actor: &Actor,
        order_id: WarehouseOrderId,
        lines: &[OrderLine],
    ) -> ServiceResult<WarehouseOrder> {
        actor.require(Capability::OrderCreate)?;

        with_retry(&self.retry, "update_order_lines", || async {
            let mut tx = self.store.begin().await?;
            let mut order = lock_order(tx.as_mut(), order_id).await?;
            let version = order.version();

            order.replace_lines(lines, Utc::now())?;
            ensure_central_items(tx.as_mut(), lines).await?;

            tx.update_order(&order, ExpectedVersion::Exact(version)).await?;
            tx.commit().await?;
            Ok(order)
        })
        .await
    }

    /// Remove a Pending order.
    #[instrument(skip(self, actor), fields(order_id = %order_id, user_id = %actor.user_id()), err)]
    pub async fn delete(&self, actor: &Actor, order_id: WarehouseOrderId) -> ServiceResult<()> {
        actor.require(Capability::OrderCreate)?;

        with_retry(&self.retry, "delete_order", || async {
            let mut tx = self.store.begin().await?;
            let order = lock_order(tx.as_mut(), order_id).await?;
            order.ensure_deletable()?;
            tx.delete_order(order_id).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        info!(order_id = %order_id, "warehouse order deleted");
        Ok(())
    }

    #[instrument(skip(self, actor), fields(order_id = %order_id, user_id = %actor.user_id()), err)]
    pub async fn confirm(
        &self,
        actor: &Actor,
        order_id: WarehouseOrderId,
    ) -> ServiceResult<WarehouseOrder> {
        actor.require(Capability::OrderApprove)?;
        self.transition(order_id, "confirm_order", |order| {
            order.confirm(actor.user_id(), Utc::now())
        })
        .await
    }

    #[instrument(skip(self, actor, reason), fields(order_id = %order_id, user_id = %actor.user_id()), err)]
    pub async fn reject(
        &self,
        actor: &Actor,
        order_id: WarehouseOrderId,
        reason: &str,
    ) -> ServiceResult<WarehouseOrder> {
        actor.require(Capability::OrderApprove)?;
        self.transition(order_id, "reject_order", |order| {
            order.reject(reason, actor.user_id(), Utc::now())
        })
        .await
    }

    /// Status-only transition: lock, apply, compare-and-set.
    async fn transition<F>(
        &self,
        order_id: WarehouseOrderId,
        operation: &str,
        apply: F,
    ) -> ServiceResult<WarehouseOrder>
    where
        F: Fn(&mut WarehouseOrder) -> Result<(), DomainError>,
    {
        let order = with_retry(&self.retry, operation, || async {
            let mut tx = self.store.begin().await?;
            let mut order = lock_order(tx.as_mut(), order_id).await?;
            let version = order.version();

            apply(&mut order)?;

            tx.update_order(&order, ExpectedVersion::Exact(version)).await?;
            tx.commit().await?;
            Ok(order)
        })
        .await?;

        info!(order_id = %order_id, status = %order.status(), "warehouse order transitioned");
        Ok(order)
    }

    /// Issue delivered quantities from the central warehouse and mark Delivered.
    ///
    /// Cart lines missing from `deliveries` deliver zero. Any failing line
    /// aborts the whole delivery.
    #[instrument(skip(self, actor, deliveries), fields(order_id = %order_id, user_id = %actor.user_id()), err)]
    pub async fn deliver(
        &self,
        actor: &Actor,
        order_id: WarehouseOrderId,
        deliveries: &[CartQuantity],
    ) -> ServiceResult<WarehouseOrder> {
        actor.require(Capability::OrderDeliver)?;

        let order = with_retry(&self.retry, "deliver_order", || async {
            let mut tx = self.store.begin().await?;
            let mut order = lock_order(tx.as_mut(), order_id).await?;
            let version = order.version();

            let plan = order.plan_delivery(deliveries)?;
            let description = format!("delivery for order {}", order.order_number());
            let movements = plan
                .iter()
                .filter(|m| m.quantity > 0)
                .map(|m| (m.item_id, m.quantity))
                .collect();
            post_all(
                tx.as_mut(),
                movements,
                TransactionKind::Out,
                actor,
                &description,
            )
            .await?;

            order.mark_delivered(&plan, actor.user_id(), Utc::now())?;
            tx.update_order(&order, ExpectedVersion::Exact(version)).await?;
            tx.commit().await?;
            Ok(order)
        })
        .await?;

        info!(order_id = %order_id, order_number = order.order_number(), "warehouse order delivered");
        Ok(order)
    }

    /// Receive into the division's equivalent items and mark Finished.
    ///
    /// A division item with the central item's name, category and unit is
    /// created on first receipt.
    #[instrument(skip(self, actor, receipts), fields(order_id = %order_id, user_id = %actor.user_id()), err)]
    pub async fn receive(
        &self,
        actor: &Actor,
        order_id: WarehouseOrderId,
        receipts: &[CartQuantity],
    ) -> ServiceResult<WarehouseOrder> {
        actor.require(Capability::OrderReceive)?;

        let order = with_retry(&self.retry, "receive_order", || async {
            let mut tx = self.store.begin().await?;
            let mut order = lock_order(tx.as_mut(), order_id).await?;
            let version = order.version();

            let plan = order.plan_receipt(receipts)?;
            let scope = Scope::Division(order.division_id());
            let mut movements = Vec::new();
            for movement in plan.iter().filter(|m| m.quantity > 0) {
                let target = division_item(tx.as_mut(), scope, movement).await?;
                movements.push((target, movement.quantity));
            }
            let description = format!("receipt for order {}", order.order_number());
            post_all(
                tx.as_mut(),
                movements,
                TransactionKind::In,
                actor,
                &description,
            )
            .await?;

            order.mark_received(&plan, actor.user_id(), Utc::now())?;
            tx.update_order(&order, ExpectedVersion::Exact(version)).await?;
            tx.commit().await?;
            Ok(order)
        })
        .await?;

        info!(order_id = %order_id, order_number = order.order_number(), "warehouse order finished");
        Ok(order)
    }

    pub async fn get(&self, order_id: WarehouseOrderId) -> ServiceResult<WarehouseOrder> {
        self.store
            .order(order_id)
            .await?
            .ok_or_else(|| ServiceError::from(DomainError::not_found(format!("order {order_id}"))))
    }

    pub async fn list(
        &self,
        division_id: Option<DivisionId>,
        status: Option<WarehouseOrderStatus>,
    ) -> ServiceResult<Vec<WarehouseOrder>> {
        Ok(self.store.orders(division_id, status).await?)
    }
}

async fn lock_order(
    tx: &mut dyn StoreTransaction,
    order_id: WarehouseOrderId,
) -> ServiceResult<WarehouseOrder> {
    tx.lock_order(order_id)
        .await?
        .ok_or_else(|| ServiceError::from(DomainError::not_found(format!("order {order_id}"))))
}

async fn ensure_central_items(tx: &mut dyn StoreTransaction, lines: &[OrderLine]) -> ServiceResult<()> {
    for line in lines {
        let item = tx
            .fetch_item(line.item_id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("item {}", line.item_id)))?;
        if !item.scope().is_warehouse() {
            return Err(DomainError::validation(format!(
                "item {} belongs to {}, orders draw from the central warehouse",
                line.item_id,
                item.scope()
            ))
            .into());
        }
    }
    Ok(())
}

/// The division's item for the goods `movement` refers to, created if missing.
async fn division_item(
    tx: &mut dyn StoreTransaction,
    scope: Scope,
    movement: &CartMovement,
) -> ServiceResult<ItemId> {
    let central = tx
        .fetch_item(movement.item_id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("item {}", movement.item_id)))?;

    if let Some(existing) = tx
        .find_equivalent(scope, central.name(), central.category_id(), central.unit_of_measure())
        .await?
    {
        return Ok(existing.id_typed());
    }

    let created = Item::create(
        NewItem {
            id: ItemId::generate(),
            name: central.name().to_string(),
            category_id: central.category_id(),
            scope,
            unit_of_measure: central.unit_of_measure().to_string(),
            multiplier: 1,
            reference_item: None,
        },
        Utc::now(),
    )?;
    tx.insert_item(&created).await?;
    info!(item_id = %created.id_typed(), scope = %scope, "division item created on receipt");
    Ok(created.id_typed())
}

/// Post one entry per `(item, quantity)` in ascending item order, sharing a
/// correlation id.
async fn post_all(
    tx: &mut dyn StoreTransaction,
    mut movements: Vec<(ItemId, i64)>,
    kind: TransactionKind,
    actor: &Actor,
    description: &str,
) -> ServiceResult<()> {
    movements.sort_by_key(|(item_id, _)| *item_id);
    let correlation_id = Uuid::now_v7();
    for (item_id, quantity) in movements {
        post(
            tx,
            item_id,
            Movement {
                kind,
                quantity,
                actor: actor.user_id(),
                description,
                correlation_id: Some(correlation_id),
            },
        )
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use stockledger_core::{CategoryId, UserId};

    use super::*;
    use crate::catalog::{CreateItem, ItemCatalog};
    use crate::ledger::StockLedger;
    use crate::store::InMemoryInventoryStore;

    struct Fixture {
        workflow: WarehouseOrderWorkflow<InMemoryInventoryStore>,
        catalog: ItemCatalog<InMemoryInventoryStore>,
        ledger: StockLedger<InMemoryInventoryStore>,
        actor: Actor,
        division: DivisionId,
    }

    fn fixture() -> Fixture {
        let store = InMemoryInventoryStore::new();
        Fixture {
            workflow: WarehouseOrderWorkflow::new(store.clone(), RetryPolicy::no_retry()),
            catalog: ItemCatalog::new(store.clone(), RetryPolicy::no_retry()),
            ledger: StockLedger::new(store, RetryPolicy::no_retry()),
            actor: Actor::superuser(UserId::new()),
            division: DivisionId::new(),
        }
    }

    impl Fixture {
        async fn item(&self, name: &str, scope: Scope, opening_stock: i64) -> Item {
            self.catalog
                .create_item(
                    &self.actor,
                    CreateItem {
                        name: name.to_string(),
                        category_id: CategoryId::new(),
                        scope,
                        unit_of_measure: "pcs".to_string(),
                        multiplier: 1,
                        reference_item: None,
                        opening_stock,
                    },
                )
                .await
                .unwrap()
        }

        async fn order(&self, lines: &[OrderLine]) -> WarehouseOrder {
            self.workflow
                .create(&self.actor, self.division, lines, "monthly supplies")
                .await
                .unwrap()
        }
    }

    fn line(item: &Item, quantity: i64) -> OrderLine {
        OrderLine {
            item_id: item.id_typed(),
            quantity,
        }
    }

    fn cart_qty(order: &WarehouseOrder, index: usize, quantity: i64) -> CartQuantity {
        CartQuantity {
            cart_id: order.carts()[index].id,
            quantity,
        }
    }

    #[tokio::test]
    async fn create_numbers_orders_per_day() {
        let f = fixture();
        let paper = f.item("Paper", Scope::Warehouse, 10).await;

        let first = f.order(&[line(&paper, 2)]).await;
        let second = f.order(&[line(&paper, 3)]).await;

        assert_eq!(first.status(), WarehouseOrderStatus::Pending);
        assert!(first.order_number().starts_with("WO-"));
        assert!(first.order_number().ends_with("-0001"));
        assert!(second.order_number().ends_with("-0002"));
        assert_eq!(f.ledger.balance(paper.id_typed()).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn create_rejects_division_items() {
        let f = fixture();
        let local = f.item("Paper", Scope::Division(f.division), 5).await;

        let err = f
            .workflow
            .create(&f.actor, f.division, &[line(&local, 1)], "")
            .await
            .unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn full_lifecycle_moves_stock_into_the_division() {
        let f = fixture();
        let x = f.item("Toner", Scope::Warehouse, 10).await;
        let order = f.order(&[line(&x, 10)]).await;

        let order = f.workflow.confirm(&f.actor, order.id_typed()).await.unwrap();
        assert_eq!(order.status(), WarehouseOrderStatus::Confirmed);

        let order = f
            .workflow
            .deliver(&f.actor, order.id_typed(), &[cart_qty(&order, 0, 10)])
            .await
            .unwrap();
        assert_eq!(order.status(), WarehouseOrderStatus::Delivered);
        assert_eq!(order.carts()[0].delivered_quantity, Some(10));
        assert_eq!(f.ledger.balance(x.id_typed()).await.unwrap(), 0);

        let order = f
            .workflow
            .receive(&f.actor, order.id_typed(), &[cart_qty(&order, 0, 10)])
            .await
            .unwrap();
        assert_eq!(order.status(), WarehouseOrderStatus::Finished);

        let local = f
            .catalog
            .find_equivalent(Scope::Division(f.division), "Toner", x.category_id(), "pcs")
            .await
            .unwrap()
            .expect("division item created on receipt");
        assert_eq!(local.stock(), 10);
        assert_eq!(local.multiplier(), 1);
        assert_eq!(local.reference_item(), None);
    }

    #[tokio::test]
    async fn receipt_reuses_existing_division_item() {
        let f = fixture();
        let x = f.item("Toner", Scope::Warehouse, 10).await;
        let existing = f
            .catalog
            .create_item(
                &f.actor,
                CreateItem {
                    name: "toner".to_string(),
                    category_id: x.category_id(),
                    scope: Scope::Division(f.division),
                    unit_of_measure: "PCS".to_string(),
                    multiplier: 1,
                    reference_item: None,
                    opening_stock: 2,
                },
            )
            .await
            .unwrap();

        let order = f.order(&[line(&x, 4)]).await;
        f.workflow.confirm(&f.actor, order.id_typed()).await.unwrap();
        let order = f
            .workflow
            .deliver(&f.actor, order.id_typed(), &[cart_qty(&order, 0, 4)])
            .await
            .unwrap();
        f.workflow
            .receive(&f.actor, order.id_typed(), &[cart_qty(&order, 0, 3)])
            .await
            .unwrap();

        assert_eq!(f.ledger.balance(existing.id_typed()).await.unwrap(), 5);
        assert_eq!(
            f.catalog.items_in_scope(Scope::Division(f.division)).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn failed_line_aborts_the_whole_delivery() {
        let f = fixture();
        let plenty = f.item("Paper", Scope::Warehouse, 50).await;
        let scarce = f.item("Ink", Scope::Warehouse, 1).await;
        let order = f.order(&[line(&plenty, 5), line(&scarce, 3)]).await;
        f.workflow.confirm(&f.actor, order.id_typed()).await.unwrap();

        let err = f
            .workflow
            .deliver(
                &f.actor,
                order.id_typed(),
                &[cart_qty(&order, 0, 5), cart_qty(&order, 1, 3)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::InsufficientStock { .. })));

        assert_eq!(f.ledger.balance(plenty.id_typed()).await.unwrap(), 50);
        assert_eq!(f.ledger.history(plenty.id_typed()).await.unwrap().len(), 1);
        let order = f.workflow.get(order.id_typed()).await.unwrap();
        assert_eq!(order.status(), WarehouseOrderStatus::Confirmed);
    }

    #[tokio::test]
    async fn unlisted_lines_deliver_zero() {
        let f = fixture();
        let a = f.item("Paper", Scope::Warehouse, 10).await;
        let b = f.item("Clips", Scope::Warehouse, 10).await;
        let order = f.order(&[line(&a, 2), line(&b, 2)]).await;
        f.workflow.confirm(&f.actor, order.id_typed()).await.unwrap();

        let order = f
            .workflow
            .deliver(&f.actor, order.id_typed(), &[cart_qty(&order, 0, 2)])
            .await
            .unwrap();
        assert_eq!(order.carts()[1].delivered_quantity, Some(0));
        assert_eq!(f.ledger.balance(b.id_typed()).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn illegal_transitions_change_nothing() {
        let f = fixture();
        let x = f.item("Toner", Scope::Warehouse, 10).await;
        let order = f.order(&[line(&x, 5)]).await;

        let err = f
            .workflow
            .deliver(&f.actor, order.id_typed(), &[cart_qty(&order, 0, 5)])
            .await
            .unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::InvalidTransition { .. })));
        assert_eq!(f.ledger.balance(x.id_typed()).await.unwrap(), 10);

        let rejected = f
            .workflow
            .reject(&f.actor, order.id_typed(), "budget frozen")
            .await
            .unwrap();
        assert_eq!(rejected.status(), WarehouseOrderStatus::Rejected);
        assert_eq!(rejected.rejection_reason(), Some("budget frozen"));

        assert!(f.workflow.confirm(&f.actor, order.id_typed()).await.is_err());
        assert!(f.workflow.delete(&f.actor, order.id_typed()).await.is_err());
        assert_eq!(
            f.workflow.get(order.id_typed()).await.unwrap().status(),
            WarehouseOrderStatus::Rejected
        );
    }

    #[tokio::test]
    async fn reject_requires_a_reason() {
        let f = fixture();
        let x = f.item("Toner", Scope::Warehouse, 1).await;
        let order = f.order(&[line(&x, 1)]).await;

        let err = f
            .workflow
            .reject(&f.actor, order.id_typed(), "   ")
            .await
            .unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::Validation(_))));
        assert_eq!(
            f.workflow.get(order.id_typed()).await.unwrap().status(),
            WarehouseOrderStatus::Pending
        );
    }

    #[tokio::test]
    async fn pending_orders_can_be_edited_and_deleted() {
        let f = fixture();
        let a = f.item("Paper", Scope::Warehouse, 10).await;
        let b = f.item("Clips", Scope::Warehouse, 10).await;
        let order = f.order(&[line(&a, 2)]).await;

        let edited = f
            .workflow
            .update_lines(&f.actor, order.id_typed(), &[line(&a, 1), line(&b, 4)])
            .await
            .unwrap();
        assert_eq!(edited.carts().len(), 2);
        assert_eq!(edited.version(), order.version() + 1);

        f.workflow.delete(&f.actor, order.id_typed()).await.unwrap();
        let err = f.workflow.get(order.id_typed()).await.unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_filters_by_division_and_status() {
        let f = fixture();
        let x = f.item("Toner", Scope::Warehouse, 10).await;
        let first = f.order(&[line(&x, 1)]).await;
        f.order(&[line(&x, 1)]).await;
        f.workflow.confirm(&f.actor, first.id_typed()).await.unwrap();

        let pending = f
            .workflow
            .list(Some(f.division), Some(WarehouseOrderStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert!(f.workflow.list(Some(DivisionId::new()), None).await.unwrap().is_empty());
    }
}
