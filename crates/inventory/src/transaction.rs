use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{DomainError, UserId};

use crate::item::ItemId;

/// Ledger entry identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// What a ledger entry did to the item's stock.
///
/// Quantities are always stored positive; the kind carries the sign.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    In,
    Out,
    ConversionIn,
    ConversionOut,
    OpnameSurplus,
    OpnameDeficit,
}

impl TransactionKind {
    pub const ALL: [TransactionKind; 6] = [
        TransactionKind::In,
        TransactionKind::Out,
        TransactionKind::ConversionIn,
        TransactionKind::ConversionOut,
        TransactionKind::OpnameSurplus,
        TransactionKind::OpnameDeficit,
    ];

    /// +1 for inflows, -1 for outflows.
    pub fn sign(self) -> i64 {
        if self.is_inflow() { 1 } else { -1 }
    }

    pub fn is_inflow(self) -> bool {
        matches!(
            self,
            TransactionKind::In | TransactionKind::ConversionIn | TransactionKind::OpnameSurplus
        )
    }

    /// Signed effect of `quantity` units of this kind.
    pub fn signed(self, quantity: i64) -> i64 {
        self.sign() * quantity
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::In => "in",
            TransactionKind::Out => "out",
            TransactionKind::ConversionIn => "conversion_in",
            TransactionKind::ConversionOut => "conversion_out",
            TransactionKind::OpnameSurplus => "opname_surplus",
            TransactionKind::OpnameDeficit => "opname_deficit",
        }
    }
}

impl core::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown transaction kind '{s}'")))
    }
}

/// Immutable ledger entry.
///
/// `balance_after` is the item's stock once this entry is applied; it equals the
/// prefix sum of signed quantities for the item up to and including this entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemTransaction {
    pub id: TransactionId,
    pub item_id: ItemId,
    pub kind: TransactionKind,
    pub quantity: i64,
    pub balance_after: i64,
    pub actor: UserId,
    pub description: String,
    /// Shared by entries written in one logical event (a conversion's two halves,
    /// every line of one order delivery, one opname confirmation).
    pub correlation_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
}

impl ItemTransaction {
    pub fn signed_quantity(&self) -> i64 {
        self.kind.signed(self.quantity)
    }
}

/// Sum of signed effects; the ledger's view of an item's stock.
pub fn ledger_balance<'a>(entries: impl IntoIterator<Item = &'a ItemTransaction>) -> i64 {
    entries.into_iter().map(ItemTransaction::signed_quantity).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_carry_their_sign() {
        assert_eq!(TransactionKind::In.signed(5), 5);
        assert_eq!(TransactionKind::Out.signed(5), -5);
        assert_eq!(TransactionKind::ConversionIn.signed(24), 24);
        assert_eq!(TransactionKind::ConversionOut.signed(2), -2);
        assert_eq!(TransactionKind::OpnameSurplus.signed(3), 3);
        assert_eq!(TransactionKind::OpnameDeficit.signed(3), -3);
    }

    #[test]
    fn kind_names_parse_back() {
        for kind in TransactionKind::ALL {
            assert_eq!(kind.as_str().parse::<TransactionKind>().unwrap(), kind);
        }
        assert!("refund".parse::<TransactionKind>().is_err());
    }
}
