use core::str::FromStr;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{AggregateId, AggregateRoot, DomainError, DomainResult, UserId};

use crate::item::{ItemId, Scope};
use crate::transaction::TransactionKind;

/// Stock opname identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StockOpnameId(pub AggregateId);

impl StockOpnameId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for StockOpnameId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpnameStatus {
    Draft,
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpnameEvent {
    Recount,
    Rebaseline,
    Confirm,
}

impl OpnameEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            OpnameEvent::Recount => "recount",
            OpnameEvent::Rebaseline => "rebaseline",
            OpnameEvent::Confirm => "confirm",
        }
    }
}

const OPNAME_TRANSITIONS: [(OpnameStatus, OpnameEvent, OpnameStatus); 3] = [
    (OpnameStatus::Draft, OpnameEvent::Recount, OpnameStatus::Draft),
    (OpnameStatus::Draft, OpnameEvent::Rebaseline, OpnameStatus::Draft),
    (OpnameStatus::Draft, OpnameEvent::Confirm, OpnameStatus::Confirmed),
];

impl OpnameStatus {
    pub fn apply(self, event: OpnameEvent) -> DomainResult<Self> {
        OPNAME_TRANSITIONS
            .iter()
            .find(|(from, on, _)| *from == self && *on == event)
            .map(|(_, _, to)| *to)
            .ok_or_else(|| DomainError::invalid_transition(self.as_str(), event.as_str()))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpnameStatus::Draft => "draft",
            OpnameStatus::Confirmed => "confirmed",
        }
    }
}

impl core::fmt::Display for OpnameStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpnameStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(OpnameStatus::Draft),
            "confirmed" => Ok(OpnameStatus::Confirmed),
            other => Err(DomainError::validation(format!(
                "unknown opname status '{other}'"
            ))),
        }
    }
}

/// One counted item: the stock snapshot at count time and the physical count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpnameLine {
    pub item_id: ItemId,
    pub recorded_quantity: i64,
    pub counted_quantity: i64,
}

impl OpnameLine {
    /// Positive for a surplus, negative for a deficit.
    pub fn delta(&self) -> i64 {
        self.counted_quantity - self.recorded_quantity
    }
}

/// Corrective ledger entry implied by a confirmed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpnameAdjustment {
    pub item_id: ItemId,
    pub kind: TransactionKind,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockOpnameRecord {
    pub id: StockOpnameId,
    pub scope: Scope,
    pub performed_by: UserId,
    pub opname_date: NaiveDate,
    pub status: OpnameStatus,
    pub confirmed_by: Option<UserId>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub lines: Vec<OpnameLine>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStockOpname {
    pub id: StockOpnameId,
    pub scope: Scope,
    pub performed_by: UserId,
    pub opname_date: NaiveDate,
    pub lines: Vec<OpnameLine>,
}

/// Aggregate root: StockOpname (a physical stock count for one scope).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockOpname {
    state: StockOpnameRecord,
}

impl StockOpname {
    pub fn start(new: NewStockOpname, at: DateTime<Utc>) -> DomainResult<Self> {
        if new.lines.is_empty() {
            return Err(DomainError::validation("opname must count at least one item"));
        }
        validate_lines(&new.lines)?;

        Ok(Self {
            state: StockOpnameRecord {
                id: new.id,
                scope: new.scope,
                performed_by: new.performed_by,
                opname_date: new.opname_date,
                status: OpnameStatus::Draft,
                confirmed_by: None,
                confirmed_at: None,
                lines: new.lines,
                version: 1,
                created_at: at,
                updated_at: at,
            },
        })
    }

    pub fn restore(state: StockOpnameRecord) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &StockOpnameRecord {
        &self.state
    }

    pub fn id_typed(&self) -> StockOpnameId {
        self.state.id
    }

    pub fn scope(&self) -> Scope {
        self.state.scope
    }

    pub fn status(&self) -> OpnameStatus {
        self.state.status
    }

    pub fn opname_date(&self) -> NaiveDate {
        self.state.opname_date
    }

    pub fn lines(&self) -> &[OpnameLine] {
        &self.state.lines
    }

    pub fn contains(&self, item_id: ItemId) -> bool {
        self.state.lines.iter().any(|l| l.item_id == item_id)
    }

    /// Update counts. Existing lines keep their recorded snapshot; lines for
    /// items not yet in the draft are appended as given.
    pub fn recount(&mut self, lines: &[OpnameLine], at: DateTime<Utc>) -> DomainResult<()> {
        self.state.status.apply(OpnameEvent::Recount)?;
        validate_lines(lines)?;

        for incoming in lines {
            match self
                .state
                .lines
                .iter_mut()
                .find(|l| l.item_id == incoming.item_id)
            {
                Some(existing) => existing.counted_quantity = incoming.counted_quantity,
                None => self.state.lines.push(*incoming),
            }
        }
        self.touch(at);
        Ok(())
    }

    /// Re-snapshot every recorded quantity from `live` stock.
    pub fn rebaseline(&mut self, live: &HashMap<ItemId, i64>, at: DateTime<Utc>) -> DomainResult<()> {
        self.state.status.apply(OpnameEvent::Rebaseline)?;
        for line in &self.state.lines {
            live_stock(live, line.item_id)?;
        }
        for line in &mut self.state.lines {
            line.recorded_quantity = live_stock(live, line.item_id)?;
        }
        self.touch(at);
        Ok(())
    }

    /// Fail with `StaleOpname` on the first line whose snapshot differs from live stock.
    pub fn check_fresh(&self, live: &HashMap<ItemId, i64>) -> DomainResult<()> {
        for line in &self.state.lines {
            let current = live_stock(live, line.item_id)?;
            if current != line.recorded_quantity {
                return Err(DomainError::StaleOpname {
                    item_id: line.item_id.0,
                    recorded: line.recorded_quantity,
                    live: current,
                });
            }
        }
        Ok(())
    }

    /// Surplus/deficit entries for every line with a non-zero delta.
    pub fn adjustments(&self) -> Vec<OpnameAdjustment> {
        self.state
            .lines
            .iter()
            .filter(|l| l.delta() != 0)
            .map(|l| {
                let delta = l.delta();
                OpnameAdjustment {
                    item_id: l.item_id,
                    kind: if delta > 0 {
                        TransactionKind::OpnameSurplus
                    } else {
                        TransactionKind::OpnameDeficit
                    },
                    quantity: delta.abs(),
                }
            })
            .collect()
    }

    pub fn confirm(&mut self, actor: UserId, at: DateTime<Utc>) -> DomainResult<()> {
        self.state.status = self.state.status.apply(OpnameEvent::Confirm)?;
        self.state.confirmed_by = Some(actor);
        self.state.confirmed_at = Some(at);
        self.touch(at);
        Ok(())
    }

    pub fn in_month(&self, year: i32, month: u32) -> bool {
        self.state.opname_date.year() == year && self.state.opname_date.month() == month
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.state.version += 1;
        self.state.updated_at = at;
    }
}

impl AggregateRoot for StockOpname {
    type Id = StockOpnameId;

    fn id(&self) -> &Self::Id {
        &self.state.id
    }

    fn version(&self) -> u64 {
        self.state.version
    }
}

fn validate_lines(lines: &[OpnameLine]) -> DomainResult<()> {
    let mut seen = HashSet::new();
    for line in lines {
        if line.counted_quantity < 0 {
            return Err(DomainError::validation("counted quantity cannot be negative"));
        }
        if line.recorded_quantity < 0 {
            return Err(DomainError::invariant("recorded quantity cannot be negative"));
        }
        if !seen.insert(line.item_id) {
            return Err(DomainError::validation(format!(
                "item {} counted more than once",
                line.item_id
            )));
        }
    }
    Ok(())
}

fn live_stock(live: &HashMap<ItemId, i64>, item_id: ItemId) -> DomainResult<i64> {
    live.get(&item_id)
        .copied()
        .ok_or_else(|| DomainError::not_found(format!("item {item_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_core::DivisionId;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn line(item_id: ItemId, recorded: i64, counted: i64) -> OpnameLine {
        OpnameLine {
            item_id,
            recorded_quantity: recorded,
            counted_quantity: counted,
        }
    }

    fn draft(lines: Vec<OpnameLine>) -> StockOpname {
        StockOpname::start(
            NewStockOpname {
                id: StockOpnameId::generate(),
                scope: Scope::Division(DivisionId::new()),
                performed_by: UserId::new(),
                opname_date: NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
                lines,
            },
            test_time(),
        )
        .unwrap()
    }

    #[test]
    fn start_rejects_negative_counts_and_duplicates() {
        let a = ItemId::generate();
        let new = NewStockOpname {
            id: StockOpnameId::generate(),
            scope: Scope::Warehouse,
            performed_by: UserId::new(),
            opname_date: NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
            lines: vec![line(a, 5, -1)],
        };
        assert!(StockOpname::start(new.clone(), test_time()).is_err());

        let dup = NewStockOpname {
            lines: vec![line(a, 5, 5), line(a, 5, 4)],
            ..new.clone()
        };
        assert!(StockOpname::start(dup, test_time()).is_err());

        let empty = NewStockOpname {
            lines: vec![],
            ..new
        };
        assert!(StockOpname::start(empty, test_time()).is_err());
    }

    #[test]
    fn adjustments_follow_delta_sign_and_skip_matches() {
        let (a, b, c) = (ItemId::generate(), ItemId::generate(), ItemId::generate());
        let opname = draft(vec![line(a, 10, 12), line(b, 10, 7), line(c, 4, 4)]);

        let adjustments = opname.adjustments();
        assert_eq!(
            adjustments,
            vec![
                OpnameAdjustment {
                    item_id: a,
                    kind: TransactionKind::OpnameSurplus,
                    quantity: 2
                },
                OpnameAdjustment {
                    item_id: b,
                    kind: TransactionKind::OpnameDeficit,
                    quantity: 3
                },
            ]
        );
    }

    #[test]
    fn recount_keeps_existing_snapshots_and_adds_new_lines() {
        let (a, b) = (ItemId::generate(), ItemId::generate());
        let mut opname = draft(vec![line(a, 10, 8)]);

        opname
            .recount(&[line(a, 99, 9), line(b, 3, 3)], test_time())
            .unwrap();

        assert_eq!(opname.lines()[0], line(a, 10, 9));
        assert_eq!(opname.lines()[1], line(b, 3, 3));
        assert_eq!(opname.version(), 2);
    }

    #[test]
    fn stale_snapshot_is_reported_and_rebaseline_clears_it() {
        let (a, b) = (ItemId::generate(), ItemId::generate());
        let mut opname = draft(vec![line(a, 10, 8), line(b, 5, 5)]);
        let live: HashMap<ItemId, i64> = [(a, 10), (b, 6)].into();

        let err = opname.check_fresh(&live).unwrap_err();
        assert_eq!(
            err,
            DomainError::StaleOpname {
                item_id: b.0,
                recorded: 5,
                live: 6
            }
        );

        opname.rebaseline(&live, test_time()).unwrap();
        opname.check_fresh(&live).unwrap();
        assert_eq!(opname.lines()[1].recorded_quantity, 6);
        assert_eq!(opname.lines()[1].counted_quantity, 5);
    }

    #[test]
    fn confirmed_opnames_are_immutable() {
        let a = ItemId::generate();
        let mut opname = draft(vec![line(a, 1, 1)]);
        opname.confirm(UserId::new(), test_time()).unwrap();
        assert_eq!(opname.status(), OpnameStatus::Confirmed);

        assert!(matches!(
            opname.recount(&[line(a, 1, 2)], test_time()),
            Err(DomainError::InvalidTransition { .. })
        ));
        assert!(opname.confirm(UserId::new(), test_time()).is_err());
    }

    #[test]
    fn month_filter_uses_opname_date() {
        let opname = draft(vec![line(ItemId::generate(), 0, 0)]);
        assert!(opname.in_month(2026, 3));
        assert!(!opname.in_month(2026, 4));
    }
}
