//! Actor context: who is acting, and which capabilities they were granted.
//!
//! Authentication and role resolution happen outside the ledger core. Callers
//! resolve a principal into an `Actor` once, and every operation checks the
//! single capability it needs instead of consulting global role state.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{DivisionId, UserId};

/// A capability an operation may require.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CatalogManage,
    StockIssue,
    StockReceive,
    StockAdjust,
    StockConvert,
    OrderCreate,
    OrderApprove,
    OrderDeliver,
    OrderReceive,
    OpnameCount,
    OpnameConfirm,
}

impl Capability {
    pub const ALL: [Capability; 11] = [
        Capability::CatalogManage,
        Capability::StockIssue,
        Capability::StockReceive,
        Capability::StockAdjust,
        Capability::StockConvert,
        Capability::OrderCreate,
        Capability::OrderApprove,
        Capability::OrderDeliver,
        Capability::OrderReceive,
        Capability::OpnameCount,
        Capability::OpnameConfirm,
    ];

    /// Stable permission-style name (e.g. "inventory.stock.issue").
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::CatalogManage => "inventory.catalog.manage",
            Capability::StockIssue => "inventory.stock.issue",
            Capability::StockReceive => "inventory.stock.receive",
            Capability::StockAdjust => "inventory.stock.adjust",
            Capability::StockConvert => "inventory.stock.convert",
            Capability::OrderCreate => "inventory.orders.create",
            Capability::OrderApprove => "inventory.orders.approve",
            Capability::OrderDeliver => "inventory.orders.deliver",
            Capability::OrderReceive => "inventory.orders.receive",
            Capability::OpnameCount => "inventory.opname.count",
            Capability::OpnameConfirm => "inventory.opname.confirm",
        }
    }
}

impl core::fmt::Display for Capability {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated identity supplied by the permission layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    user_id: UserId,
    division_id: Option<DivisionId>,
    capabilities: BTreeSet<Capability>,
}

impl Actor {
    pub fn new(user_id: UserId, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            user_id,
            division_id: None,
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// Actor holding every capability (operators, migrations, tests).
    pub fn superuser(user_id: UserId) -> Self {
        Self::new(user_id, Capability::ALL)
    }

    pub fn with_division(mut self, division_id: DivisionId) -> Self {
        self.division_id = Some(division_id);
        self
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn division_id(&self) -> Option<DivisionId> {
        self.division_id
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn require(&self, capability: Capability) -> DomainResult<()> {
        if self.has(capability) {
            Ok(())
        } else {
            Err(DomainError::Unauthorized(capability.as_str().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_reports_missing_capability_name() {
        let actor = Actor::new(UserId::new(), [Capability::StockIssue]);
        assert!(actor.require(Capability::StockIssue).is_ok());

        let err = actor.require(Capability::OrderApprove).unwrap_err();
        assert_eq!(
            err,
            DomainError::Unauthorized("inventory.orders.approve".to_string())
        );
    }

    #[test]
    fn superuser_holds_everything() {
        let actor = Actor::superuser(UserId::new());
        assert!(Capability::ALL.iter().all(|c| actor.has(*c)));
    }
}
