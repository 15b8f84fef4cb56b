use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{
    AggregateId, AggregateRoot, CategoryId, DivisionId, DomainError, DomainResult, UserId,
};

use crate::transaction::{ItemTransaction, TransactionId, TransactionKind};

/// How many `reference_item` hops a link validation follows before failing closed.
pub const MAX_CONVERSION_DEPTH: usize = 16;

/// Inventory item identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub AggregateId);

impl ItemId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for ItemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Owning context of an item or opname.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "division_id")]
pub enum Scope {
    /// The central warehouse (no division).
    Warehouse,
    Division(DivisionId),
}

impl Scope {
    pub fn from_division(division_id: Option<DivisionId>) -> Self {
        match division_id {
            Some(d) => Scope::Division(d),
            None => Scope::Warehouse,
        }
    }

    pub fn division_id(self) -> Option<DivisionId> {
        match self {
            Scope::Warehouse => None,
            Scope::Division(d) => Some(d),
        }
    }

    pub fn is_warehouse(self) -> bool {
        matches!(self, Scope::Warehouse)
    }
}

impl core::fmt::Display for Scope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Scope::Warehouse => f.write_str("warehouse"),
            Scope::Division(d) => write!(f, "division:{d}"),
        }
    }
}

/// Persisted item state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    pub name: String,
    pub category_id: CategoryId,
    pub scope: Scope,
    pub unit_of_measure: String,
    pub stock: i64,
    pub multiplier: i64,
    pub reference_item: Option<ItemId>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering a new item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItem {
    pub id: ItemId,
    pub name: String,
    pub category_id: CategoryId,
    pub scope: Scope,
    pub unit_of_measure: String,
    pub multiplier: i64,
    pub reference_item: Option<ItemId>,
}

/// Editable item attributes. Scope and stock are not editable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDetails {
    pub name: String,
    pub category_id: CategoryId,
    pub unit_of_measure: String,
    pub multiplier: i64,
    pub reference_item: Option<ItemId>,
}

/// A request to move stock, validated by [`Item::post`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingRequest {
    pub kind: TransactionKind,
    pub quantity: i64,
    pub actor: UserId,
    pub description: String,
    pub correlation_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
}

/// Aggregate root: Item (a stock-keeping unit).
///
/// `stock` is a cache of the ledger. It only changes through [`Item::settle`],
/// which accepts an entry produced by [`Item::post`] against the same state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    state: ItemRecord,
}

impl Item {
    pub fn create(new: NewItem, at: DateTime<Utc>) -> DomainResult<Self> {
        validate_details(
            new.id,
            &new.name,
            &new.unit_of_measure,
            new.multiplier,
            new.reference_item,
        )?;

        Ok(Self {
            state: ItemRecord {
                id: new.id,
                name: new.name.trim().to_string(),
                category_id: new.category_id,
                scope: new.scope,
                unit_of_measure: new.unit_of_measure.trim().to_string(),
                stock: 0,
                multiplier: new.multiplier,
                reference_item: new.reference_item,
                version: 1,
                created_at: at,
                updated_at: at,
            },
        })
    }

    /// Rehydrate from persisted state.
    pub fn restore(state: ItemRecord) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &ItemRecord {
        &self.state
    }

    pub fn id_typed(&self) -> ItemId {
        self.state.id
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn category_id(&self) -> CategoryId {
        self.state.category_id
    }

    pub fn scope(&self) -> Scope {
        self.state.scope
    }

    pub fn unit_of_measure(&self) -> &str {
        &self.state.unit_of_measure
    }

    pub fn stock(&self) -> i64 {
        self.state.stock
    }

    pub fn multiplier(&self) -> i64 {
        self.state.multiplier
    }

    pub fn reference_item(&self) -> Option<ItemId> {
        self.state.reference_item
    }

    /// Base-unit item and multiplier when this item is a pack unit.
    pub fn conversion(&self) -> Option<(ItemId, i64)> {
        self.state
            .reference_item
            .map(|reference| (reference, self.state.multiplier))
    }

    /// True when this item names the same goods in `scope` (name, category, unit).
    pub fn is_equivalent_in(&self, scope: Scope, name: &str, category_id: CategoryId, unit: &str) -> bool {
        self.state.scope == scope
            && self.state.category_id == category_id
            && self.state.name.eq_ignore_ascii_case(name.trim())
            && self.state.unit_of_measure.eq_ignore_ascii_case(unit.trim())
    }

    pub fn update_details(&mut self, details: ItemDetails, at: DateTime<Utc>) -> DomainResult<()> {
        validate_details(
            self.state.id,
            &details.name,
            &details.unit_of_measure,
            details.multiplier,
            details.reference_item,
        )?;

        self.state.name = details.name.trim().to_string();
        self.state.category_id = details.category_id;
        self.state.unit_of_measure = details.unit_of_measure.trim().to_string();
        self.state.multiplier = details.multiplier;
        self.state.reference_item = details.reference_item;
        self.state.version += 1;
        self.state.updated_at = at;
        Ok(())
    }

    /// Decide a ledger entry for `request` against the current stock.
    ///
    /// Does not mutate; the caller persists the entry and then [`settle`](Self::settle)s it.
    pub fn post(&self, request: PostingRequest) -> DomainResult<ItemTransaction> {
        if request.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }

        let balance_after = self
            .state
            .stock
            .checked_add(request.kind.signed(request.quantity))
            .ok_or_else(|| DomainError::validation("stock quantity overflow"))?;

        if balance_after < 0 {
            return Err(DomainError::InsufficientStock {
                item_id: self.state.id.0,
                requested: request.quantity,
                available: self.state.stock,
            });
        }

        Ok(ItemTransaction {
            id: TransactionId::new(),
            item_id: self.state.id,
            kind: request.kind,
            quantity: request.quantity,
            balance_after,
            actor: request.actor,
            description: request.description,
            correlation_id: request.correlation_id,
            occurred_at: request.occurred_at,
        })
    }

    /// Apply a ledger entry to the cached stock.
    ///
    /// Rejects entries for another item or whose balance does not follow from the
    /// current stock, so the cache can never drift from the ledger prefix sum.
    pub fn settle(&mut self, entry: &ItemTransaction) -> DomainResult<()> {
        if entry.item_id != self.state.id {
            return Err(DomainError::invariant("ledger entry belongs to another item"));
        }

        let next = self
            .state
            .stock
            .checked_add(entry.signed_quantity())
            .ok_or_else(|| DomainError::invariant("stock quantity overflow"))?;

        if entry.quantity <= 0 || next < 0 || next != entry.balance_after {
            return Err(DomainError::invariant(format!(
                "ledger entry {} does not follow stock {} of item {}",
                entry.id, self.state.stock, self.state.id
            )));
        }

        self.state.stock = next;
        self.state.version += 1;
        self.state.updated_at = entry.occurred_at;
        Ok(())
    }
}

impl AggregateRoot for Item {
    type Id = ItemId;

    fn id(&self) -> &Self::Id {
        &self.state.id
    }

    fn version(&self) -> u64 {
        self.state.version
    }
}

fn validate_details(
    id: ItemId,
    name: &str,
    unit_of_measure: &str,
    multiplier: i64,
    reference_item: Option<ItemId>,
) -> DomainResult<()> {
    if name.trim().is_empty() {
        return Err(DomainError::validation("name cannot be empty"));
    }
    if unit_of_measure.trim().is_empty() {
        return Err(DomainError::validation("unit of measure cannot be empty"));
    }
    if multiplier < 1 {
        return Err(DomainError::validation("multiplier must be at least 1"));
    }
    if reference_item == Some(id) {
        return Err(DomainError::invalid_link(format!(
            "item {id} cannot reference itself"
        )));
    }
    Ok(())
}

/// Check that `item_id` (in `scope`) may point at `reference`.
///
/// Follows `reference_item` links through `lookup` until the chain ends. Fails
/// when a target is missing, lives in another scope, leads back to `item_id`, or
/// the chain is longer than [`MAX_CONVERSION_DEPTH`].
pub fn validate_conversion_link<'a, F>(
    item_id: ItemId,
    scope: Scope,
    reference: Option<ItemId>,
    lookup: F,
) -> DomainResult<()>
where
    F: Fn(ItemId) -> Option<&'a Item>,
{
    let mut next = reference;
    let mut depth = 0usize;

    while let Some(current) = next {
        if current == item_id {
            return Err(DomainError::invalid_link(format!(
                "linking item {item_id} would create a conversion cycle"
            )));
        }

        depth += 1;
        if depth > MAX_CONVERSION_DEPTH {
            return Err(DomainError::invalid_link(format!(
                "conversion chain from item {item_id} exceeds {MAX_CONVERSION_DEPTH} links"
            )));
        }

        let target = lookup(current).ok_or_else(|| {
            DomainError::invalid_link(format!("reference item {current} does not exist"))
        })?;

        if target.scope() != scope {
            return Err(DomainError::invalid_link(format!(
                "reference item {current} belongs to {} but item {item_id} belongs to {scope}",
                target.scope()
            )));
        }

        next = target.reference_item();
    }

    Ok(())
}
