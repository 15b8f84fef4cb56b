//! StockOpnameReconciler: physical counts and their corrective entries.
//!
//! A draft snapshots each item's stock when it is counted. Confirmation locks
//! the counted items, refuses to proceed if any snapshot went stale, and posts
//! one surplus or deficit entry per non-zero delta.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use stockledger_core::{Actor, AggregateRoot, Capability, DomainError, ExpectedVersion};
use stockledger_inventory::{
    ItemId, ItemTransaction, NewStockOpname, OpnameEvent, OpnameLine, OpnameStatus, Scope,
    StockOpname, StockOpnameId,
};

use crate::error::{ServiceError, ServiceResult};
use crate::ledger::{post, Movement};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{InventoryStore, StoreTransaction};

/// A confirmed opname and the entries it wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpnameConfirmation {
    pub opname_id: StockOpnameId,
    pub correlation_id: Uuid,
    pub entries: Vec<ItemTransaction>,
}

#[derive(Debug, Clone)]
pub struct StockOpnameReconciler<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S> StockOpnameReconciler<S>
where
    S: InventoryStore,
{
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Open a Draft with `counts` as `(item, counted quantity)` pairs.
    #[instrument(
        skip(self, actor, counts),
        fields(scope = %scope, items = counts.len(), user_id = %actor.user_id()),
        err
    )]
    pub async fn start_draft(
        &self,
        actor: &Actor,
        scope: Scope,
        counts: &[(ItemId, i64)],
        opname_date: NaiveDate,
    ) -> ServiceResult<StockOpname> {
        actor.require(Capability::OpnameCount)?;

        let opname = with_retry(&self.retry, "start_opname", || async {
            let mut tx = self.store.begin().await?;
            let mut lines = Vec::with_capacity(counts.len());
            for &(item_id, counted_quantity) in counts {
                lines.push(OpnameLine {
                    item_id,
                    recorded_quantity: snapshot(tx.as_mut(), scope, item_id).await?,
                    counted_quantity,
                });
            }

            let opname = StockOpname::start(
                NewStockOpname {
                    id: StockOpnameId::generate(),
                    scope,
                    performed_by: actor.user_id(),
                    opname_date,
                    lines,
                },
                Utc::now(),
            )?;
            tx.insert_opname(&opname).await?;
            tx.commit().await?;
            Ok(opname)
        })
        .await?;

        info!(opname_id = %opname.id_typed(), lines = opname.lines().len(), "opname draft started");
        Ok(opname)
    }

    /// Update counted quantities. Items new to the draft are snapshotted now.
    #[instrument(skip(self, actor, counts), fields(opname_id = %opname_id, user_id = %actor.user_id()), err)]
    pub async fn recount(
        &self,
        actor: &Actor,
        opname_id: StockOpnameId,
        counts: &[(ItemId, i64)],
    ) -> ServiceResult<StockOpname> {
        actor.require(Capability::OpnameCount)?;

        with_retry(&self.retry, "recount_opname", || async {
            let mut tx = self.store.begin().await?;
            let mut opname = lock_opname(tx.as_mut(), opname_id).await?;
            let version = opname.version();
            opname.status().apply(OpnameEvent::Recount)?;

            let mut lines = Vec::with_capacity(counts.len());
            for &(item_id, counted_quantity) in counts {
                let recorded_quantity = match opname.lines().iter().find(|l| l.item_id == item_id) {
                    Some(existing) => existing.recorded_quantity,
                    None => snapshot(tx.as_mut(), opname.scope(), item_id).await?,
                };
                lines.push(OpnameLine {
                    item_id,
                    recorded_quantity,
                    counted_quantity,
                });
            }
            opname.recount(&lines, Utc::now())?;

            tx.update_opname(&opname, ExpectedVersion::Exact(version)).await?;
            tx.commit().await?;
            Ok(opname)
        })
        .await
    }

    /// Re-snapshot every line from current stock, keeping the counts.
    #[instrument(skip(self, actor), fields(opname_id = %opname_id, user_id = %actor.user_id()), err)]
    pub async fn rebaseline(
        &self,
        actor: &Actor,
        opname_id: StockOpnameId,
    ) -> ServiceResult<StockOpname> {
        actor.require(Capability::OpnameCount)?;

        with_retry(&self.retry, "rebaseline_opname", || async {
            let mut tx = self.store.begin().await?;
            let mut opname = lock_opname(tx.as_mut(), opname_id).await?;
            let version = opname.version();
            opname.status().apply(OpnameEvent::Rebaseline)?;

            let live = lock_counted_items(tx.as_mut(), &opname).await?;
            opname.rebaseline(&live, Utc::now())?;

            tx.update_opname(&opname, ExpectedVersion::Exact(version)).await?;
            tx.commit().await?;
            Ok(opname)
        })
        .await
    }

    /// Post the corrective entries and mark the opname Confirmed.
    ///
    /// Fails with `StaleOpname` when any counted item's stock moved since its
    /// snapshot; nothing is written in that case.
    #[instrument(skip(self, actor), fields(opname_id = %opname_id, user_id = %actor.user_id()), err)]
    pub async fn confirm(
        &self,
        actor: &Actor,
        opname_id: StockOpnameId,
    ) -> ServiceResult<OpnameConfirmation> {
        actor.require(Capability::OpnameConfirm)?;

        let confirmation = with_retry(&self.retry, "confirm_opname", || async {
            let mut tx = self.store.begin().await?;
            let mut opname = lock_opname(tx.as_mut(), opname_id).await?;
            let version = opname.version();
            opname.status().apply(OpnameEvent::Confirm)?;

            let live = lock_counted_items(tx.as_mut(), &opname).await?;
            if let Err(err) = opname.check_fresh(&live) {
                warn!(opname_id = %opname_id, error = %err, "opname snapshot is stale");
                return Err(ServiceError::from(err));
            }

            let correlation_id = Uuid::now_v7();
            let description = format!("stock opname {}", opname.opname_date());
            let mut adjustments = opname.adjustments();
            adjustments.sort_by_key(|a| a.item_id);

            let mut entries = Vec::with_capacity(adjustments.len());
            for adjustment in adjustments {
                let (_, entry) = post(
                    tx.as_mut(),
                    adjustment.item_id,
                    Movement {
                        kind: adjustment.kind,
                        quantity: adjustment.quantity,
                        actor: actor.user_id(),
                        description: &description,
                        correlation_id: Some(correlation_id),
                    },
                )
                .await?;
                entries.push(entry);
            }

            opname.confirm(actor.user_id(), Utc::now())?;
            tx.update_opname(&opname, ExpectedVersion::Exact(version)).await?;
            tx.commit().await?;

            Ok(OpnameConfirmation {
                opname_id,
                correlation_id,
                entries,
            })
        })
        .await?;

        info!(
            opname_id = %opname_id,
            adjustments = confirmation.entries.len(),
            "opname confirmed"
        );
        Ok(confirmation)
    }

    pub async fn get(&self, opname_id: StockOpnameId) -> ServiceResult<StockOpname> {
        self.store
            .opname(opname_id)
            .await?
            .ok_or_else(|| ServiceError::from(DomainError::not_found(format!("opname {opname_id}"))))
    }

    pub async fn opnames_in_scope(&self, scope: Scope) -> ServiceResult<Vec<StockOpname>> {
        Ok(self.store.opnames_in_scope(scope).await?)
    }

    /// Most recent confirmed opname dated within `year`/`month`.
    pub async fn latest_confirmed_in_month(
        &self,
        scope: Scope,
        year: i32,
        month: u32,
    ) -> ServiceResult<Option<StockOpname>> {
        Ok(self
            .store
            .opnames_in_scope(scope)
            .await?
            .into_iter()
            .filter(|o| o.status() == OpnameStatus::Confirmed && o.in_month(year, month))
            .max_by_key(|o| (o.opname_date(), o.state().confirmed_at)))
    }

    pub async fn has_confirmed_in_month(
        &self,
        scope: Scope,
        year: i32,
        month: u32,
    ) -> ServiceResult<bool> {
        Ok(self
            .latest_confirmed_in_month(scope, year, month)
            .await?
            .is_some())
    }
}

async fn lock_opname(
    tx: &mut dyn StoreTransaction,
    opname_id: StockOpnameId,
) -> ServiceResult<StockOpname> {
    tx.lock_opname(opname_id)
        .await?
        .ok_or_else(|| ServiceError::from(DomainError::not_found(format!("opname {opname_id}"))))
}

/// Current stock of an item that must belong to `scope`.
async fn snapshot(tx: &mut dyn StoreTransaction, scope: Scope, item_id: ItemId) -> ServiceResult<i64> {
    let item = tx
        .fetch_item(item_id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("item {item_id}")))?;
    if item.scope() != scope {
        return Err(DomainError::validation(format!(
            "item {item_id} belongs to {}, not {scope}",
            item.scope()
        ))
        .into());
    }
    Ok(item.stock())
}

/// Lock every counted item in ascending id order and return its live stock.
async fn lock_counted_items(
    tx: &mut dyn StoreTransaction,
    opname: &StockOpname,
) -> ServiceResult<HashMap<ItemId, i64>> {
    let mut ids: Vec<ItemId> = opname.lines().iter().map(|l| l.item_id).collect();
    ids.sort();

    let mut live = HashMap::with_capacity(ids.len());
    for id in ids {
        if let Some(item) = tx.lock_item(id).await? {
            live.insert(id, item.stock());
        }
    }
    Ok(live)
}
