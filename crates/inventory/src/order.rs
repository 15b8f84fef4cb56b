use core::str::FromStr;
use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{AggregateId, AggregateRoot, DivisionId, DomainError, DomainResult, UserId};

use crate::item::ItemId;

/// Warehouse order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WarehouseOrderId(pub AggregateId);

impl WarehouseOrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for WarehouseOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Cart line identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CartId(pub AggregateId);

impl CartId {
    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for CartId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Warehouse order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseOrderStatus {
    Pending,
    Confirmed,
    Delivered,
    Finished,
    Rejected,
}

/// Events that drive a warehouse order through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderEvent {
    Confirm,
    Reject,
    Deliver,
    Receive,
    /// Changing or deleting cart lines.
    Edit,
}

impl OrderEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderEvent::Confirm => "confirm",
            OrderEvent::Reject => "reject",
            OrderEvent::Deliver => "deliver",
            OrderEvent::Receive => "receive",
            OrderEvent::Edit => "edit",
        }
    }
}

/// Legal (state, event) -> state moves. Anything absent is rejected.
const ORDER_TRANSITIONS: [(WarehouseOrderStatus, OrderEvent, WarehouseOrderStatus); 5] = [
    (WarehouseOrderStatus::Pending, OrderEvent::Confirm, WarehouseOrderStatus::Confirmed),
    (WarehouseOrderStatus::Pending, OrderEvent::Reject, WarehouseOrderStatus::Rejected),
    (WarehouseOrderStatus::Pending, OrderEvent::Edit, WarehouseOrderStatus::Pending),
    (WarehouseOrderStatus::Confirmed, OrderEvent::Deliver, WarehouseOrderStatus::Delivered),
    (WarehouseOrderStatus::Delivered, OrderEvent::Receive, WarehouseOrderStatus::Finished),
];

impl WarehouseOrderStatus {
    pub const ALL: [WarehouseOrderStatus; 5] = [
        WarehouseOrderStatus::Pending,
        WarehouseOrderStatus::Confirmed,
        WarehouseOrderStatus::Delivered,
        WarehouseOrderStatus::Finished,
        WarehouseOrderStatus::Rejected,
    ];

    /// Look up the target state for `event`, or fail with `InvalidTransition`.
    pub fn apply(self, event: OrderEvent) -> DomainResult<Self> {
        ORDER_TRANSITIONS
            .iter()
            .find(|(from, on, _)| *from == self && *on == event)
            .map(|(_, _, to)| *to)
            .ok_or_else(|| DomainError::invalid_transition(self.as_str(), event.as_str()))
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WarehouseOrderStatus::Finished | WarehouseOrderStatus::Rejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WarehouseOrderStatus::Pending => "pending",
            WarehouseOrderStatus::Confirmed => "confirmed",
            WarehouseOrderStatus::Delivered => "delivered",
            WarehouseOrderStatus::Finished => "finished",
            WarehouseOrderStatus::Rejected => "rejected",
        }
    }
}

impl core::fmt::Display for WarehouseOrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WarehouseOrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WarehouseOrderStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown order status '{s}'")))
    }
}

/// Cart line: one requested item within an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseOrderCart {
    pub id: CartId,
    pub line_no: u32,
    /// Central-warehouse item being requested.
    pub item_id: ItemId,
    pub quantity: i64,
    pub delivered_quantity: Option<i64>,
    pub received_quantity: Option<i64>,
}

/// Requested line when creating or editing an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub item_id: ItemId,
    pub quantity: i64,
}

/// Delivered or received quantity for one cart line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartQuantity {
    pub cart_id: CartId,
    pub quantity: i64,
}

/// Validated per-line stock movement for a delivery or receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CartMovement {
    pub cart_id: CartId,
    pub item_id: ItemId,
    pub quantity: i64,
}

/// Persisted warehouse order state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseOrderRecord {
    pub id: WarehouseOrderId,
    pub order_number: String,
    pub division_id: DivisionId,
    pub requested_by: UserId,
    pub description: String,
    pub status: WarehouseOrderStatus,
    pub rejection_reason: Option<String>,
    pub confirmed_by: Option<UserId>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<UserId>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub delivered_by: Option<UserId>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub received_by: Option<UserId>,
    pub received_at: Option<DateTime<Utc>>,
    pub carts: Vec<WarehouseOrderCart>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for opening a new order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWarehouseOrder {
    pub id: WarehouseOrderId,
    pub order_number: String,
    pub division_id: DivisionId,
    pub requested_by: UserId,
    pub description: String,
    pub lines: Vec<OrderLine>,
}

/// Human-facing order number, e.g. `WO-20260115-0007`.
pub fn order_number(date: NaiveDate, sequence: u32) -> String {
    format!("WO-{}-{:04}", date.format("%Y%m%d"), sequence)
}

/// Aggregate root: WarehouseOrder (a division's request for central stock).
///
/// The order itself never moves stock; it validates and records what the
/// ledger did at delivery and receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseOrder {
    state: WarehouseOrderRecord,
}

impl WarehouseOrder {
    pub fn create(new: NewWarehouseOrder, at: DateTime<Utc>) -> DomainResult<Self> {
        let carts = build_carts(&new.lines)?;

        Ok(Self {
            state: WarehouseOrderRecord {
                id: new.id,
                order_number: new.order_number,
                division_id: new.division_id,
                requested_by: new.requested_by,
                description: new.description,
                status: WarehouseOrderStatus::Pending,
                rejection_reason: None,
                confirmed_by: None,
                confirmed_at: None,
                rejected_by: None,
                rejected_at: None,
                delivered_by: None,
                delivered_at: None,
                received_by: None,
                received_at: None,
                carts,
                version: 1,
                created_at: at,
                updated_at: at,
            },
        })
    }

    pub fn restore(state: WarehouseOrderRecord) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &WarehouseOrderRecord {
        &self.state
    }

    pub fn id_typed(&self) -> WarehouseOrderId {
        self.state.id
    }

    pub fn order_number(&self) -> &str {
        &self.state.order_number
    }

    pub fn division_id(&self) -> DivisionId {
        self.state.division_id
    }

    pub fn status(&self) -> WarehouseOrderStatus {
        self.state.status
    }

    pub fn carts(&self) -> &[WarehouseOrderCart] {
        &self.state.carts
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.state.rejection_reason.as_deref()
    }

    /// Replace every cart line (Pending only).
    pub fn replace_lines(&mut self, lines: &[OrderLine], at: DateTime<Utc>) -> DomainResult<()> {
        self.state.status.apply(OrderEvent::Edit)?;
        self.state.carts = build_carts(lines)?;
        self.touch(at);
        Ok(())
    }

    /// Orders can only be removed before anyone approved them.
    pub fn ensure_deletable(&self) -> DomainResult<()> {
        self.state.status.apply(OrderEvent::Edit).map(|_| ())
    }

    pub fn confirm(&mut self, actor: UserId, at: DateTime<Utc>) -> DomainResult<()> {
        self.state.status = self.state.status.apply(OrderEvent::Confirm)?;
        self.state.confirmed_by = Some(actor);
        self.state.confirmed_at = Some(at);
        self.touch(at);
        Ok(())
    }

    pub fn reject(&mut self, reason: &str, actor: UserId, at: DateTime<Utc>) -> DomainResult<()> {
        let next = self.state.status.apply(OrderEvent::Reject)?;
        if reason.trim().is_empty() {
            return Err(DomainError::validation("rejection reason cannot be empty"));
        }
        self.state.status = next;
        self.state.rejection_reason = Some(reason.trim().to_string());
        self.state.rejected_by = Some(actor);
        self.state.rejected_at = Some(at);
        self.touch(at);
        Ok(())
    }

    /// Validate a delivery request against the requested quantities.
    ///
    /// Returns one movement per cart line; lines not mentioned deliver zero.
    pub fn plan_delivery(&self, deliveries: &[CartQuantity]) -> DomainResult<Vec<CartMovement>> {
        self.state.status.apply(OrderEvent::Deliver)?;
        let plan = self.plan(deliveries, "delivered", |cart| cart.quantity)?;
        if plan.iter().all(|m| m.quantity == 0) {
            return Err(DomainError::validation(
                "delivery must move at least one unit",
            ));
        }
        Ok(plan)
    }

    pub fn mark_delivered(
        &mut self,
        plan: &[CartMovement],
        actor: UserId,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        let next = self.state.status.apply(OrderEvent::Deliver)?;
        for cart in &mut self.state.carts {
            let moved = find_movement(plan, cart.id)?;
            cart.delivered_quantity = Some(moved);
        }
        self.state.status = next;
        self.state.delivered_by = Some(actor);
        self.state.delivered_at = Some(at);
        self.touch(at);
        Ok(())
    }

    /// Validate a receipt against what was delivered.
    ///
    /// Returned movements still reference the central item; the caller maps
    /// them onto the division's equivalent items.
    pub fn plan_receipt(&self, receipts: &[CartQuantity]) -> DomainResult<Vec<CartMovement>> {
        self.state.status.apply(OrderEvent::Receive)?;
        self.plan(receipts, "received", |cart| {
            cart.delivered_quantity.unwrap_or(0)
        })
    }

    pub fn mark_received(
        &mut self,
        plan: &[CartMovement],
        actor: UserId,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        let next = self.state.status.apply(OrderEvent::Receive)?;
        for cart in &mut self.state.carts {
            let moved = find_movement(plan, cart.id)?;
            cart.received_quantity = Some(moved);
        }
        self.state.status = next;
        self.state.received_by = Some(actor);
        self.state.received_at = Some(at);
        self.touch(at);
        Ok(())
    }

    fn plan<F>(&self, requests: &[CartQuantity], what: &str, limit: F) -> DomainResult<Vec<CartMovement>>
    where
        F: Fn(&WarehouseOrderCart) -> i64,
    {
        let mut seen = HashSet::new();
        for req in requests {
            if !seen.insert(req.cart_id) {
                return Err(DomainError::validation(format!(
                    "cart line {} listed more than once",
                    req.cart_id
                )));
            }
            let cart = self
                .state
                .carts
                .iter()
                .find(|c| c.id == req.cart_id)
                .ok_or_else(|| {
                    DomainError::validation(format!(
                        "cart line {} does not belong to order {}",
                        req.cart_id, self.state.order_number
                    ))
                })?;
            if req.quantity < 0 {
                return Err(DomainError::validation(format!(
                    "{what} quantity cannot be negative"
                )));
            }
            let max = limit(cart);
            if req.quantity > max {
                return Err(DomainError::validation(format!(
                    "{what} quantity {} exceeds {max} for cart line {}",
                    req.quantity, cart.id
                )));
            }
        }

        Ok(self
            .state
            .carts
            .iter()
            .map(|cart| CartMovement {
                cart_id: cart.id,
                item_id: cart.item_id,
                quantity: requests
                    .iter()
                    .find(|r| r.cart_id == cart.id)
                    .map(|r| r.quantity)
                    .unwrap_or(0),
            })
            .collect())
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.state.version += 1;
        self.state.updated_at = at;
    }
}

impl AggregateRoot for WarehouseOrder {
    type Id = WarehouseOrderId;

    fn id(&self) -> &Self::Id {
        &self.state.id
    }

    fn version(&self) -> u64 {
        self.state.version
    }
}

fn build_carts(lines: &[OrderLine]) -> DomainResult<Vec<WarehouseOrderCart>> {
    if lines.is_empty() {
        return Err(DomainError::validation("order must have at least one line"));
    }

    let mut seen = HashSet::new();
    let mut carts = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        if line.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if !seen.insert(line.item_id) {
            return Err(DomainError::validation(format!(
                "item {} requested more than once",
                line.item_id
            )));
        }
        let line_no = u32::try_from(idx + 1)
            .map_err(|_| DomainError::validation("order has too many lines"))?;
        carts.push(WarehouseOrderCart {
            id: CartId::generate(),
            line_no,
            item_id: line.item_id,
            quantity: line.quantity,
            delivered_quantity: None,
            received_quantity: None,
        });
    }
    Ok(carts)
}

fn find_movement(plan: &[CartMovement], cart_id: CartId) -> DomainResult<i64> {
    plan.iter()
        .find(|m| m.cart_id == cart_id)
        .map(|m| m.quantity)
        .ok_or_else(|| DomainError::invariant(format!("no movement planned for cart line {cart_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn pending_order(lines: &[OrderLine]) -> WarehouseOrder {
        WarehouseOrder::create(
            NewWarehouseOrder {
                id: WarehouseOrderId::generate(),
                order_number: order_number(NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(), 7),
                division_id: DivisionId::new(),
                requested_by: UserId::new(),
                description: "monthly supplies".to_string(),
                lines: lines.to_vec(),
            },
            test_time(),
        )
        .unwrap()
    }

    fn line(quantity: i64) -> OrderLine {
        OrderLine {
            item_id: ItemId::generate(),
            quantity,
        }
    }

    #[test]
    fn order_numbers_are_dated_and_padded() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        assert_eq!(order_number(date, 7), "WO-20260115-0007");
    }

    #[test]
    fn create_rejects_empty_duplicate_and_non_positive_lines() {
        let base = NewWarehouseOrder {
            id: WarehouseOrderId::generate(),
            order_number: "WO-1".to_string(),
            division_id: DivisionId::new(),
            requested_by: UserId::new(),
            description: String::new(),
            lines: vec![],
        };
        assert!(WarehouseOrder::create(base.clone(), test_time()).is_err());

        let dup = line(1);
        let with_dup = NewWarehouseOrder {
            lines: vec![dup, dup],
            ..base.clone()
        };
        assert!(WarehouseOrder::create(with_dup, test_time()).is_err());

        let zero = NewWarehouseOrder {
            lines: vec![line(0)],
            ..base
        };
        assert!(WarehouseOrder::create(zero, test_time()).is_err());
    }

    #[test]
    fn transition_table_only_allows_forward_moves() {
        use OrderEvent::*;
        use WarehouseOrderStatus::*;

        assert_eq!(Pending.apply(Confirm).unwrap(), Confirmed);
        assert_eq!(Pending.apply(Reject).unwrap(), Rejected);
        assert_eq!(Confirmed.apply(Deliver).unwrap(), Delivered);
        assert_eq!(Delivered.apply(Receive).unwrap(), Finished);

        for (state, event) in [
            (Pending, Deliver),
            (Pending, Receive),
            (Confirmed, Confirm),
            (Confirmed, Reject),
            (Confirmed, Edit),
            (Delivered, Deliver),
            (Finished, Receive),
            (Rejected, Confirm),
        ] {
            assert!(
                matches!(state.apply(event), Err(DomainError::InvalidTransition { .. })),
                "{state} --{}--> should be rejected",
                event.as_str()
            );
        }
    }

    #[test]
    fn reject_requires_reason_and_is_terminal() {
        let mut order = pending_order(&[line(3)]);
        assert!(order.reject("  ", UserId::new(), test_time()).is_err());
        assert_eq!(order.status(), WarehouseOrderStatus::Pending);

        order.reject("budget", UserId::new(), test_time()).unwrap();
        assert_eq!(order.status(), WarehouseOrderStatus::Rejected);
        assert_eq!(order.rejection_reason(), Some("budget"));
        assert!(order.confirm(UserId::new(), test_time()).is_err());
    }

    #[test]
    fn cart_lines_are_numbered_from_one_in_request_order() {
        let lines = [line(4), line(2), line(9)];
        let order = pending_order(&lines);
        let numbered: Vec<(u32, ItemId)> = order
            .carts()
            .iter()
            .map(|cart| (cart.line_no, cart.item_id))
            .collect();
        assert_eq!(
            numbered,
            vec![(1, lines[0].item_id), (2, lines[1].item_id), (3, lines[2].item_id)]
        );
    }

    #[test]
    fn lines_are_editable_only_while_pending() {
        let mut order = pending_order(&[line(3)]);
        order.replace_lines(&[line(1), line(2)], test_time()).unwrap();
        assert_eq!(order.carts().len(), 2);
        assert_eq!(order.carts()[1].line_no, 2);

        order.confirm(UserId::new(), test_time()).unwrap();
        let err = order.replace_lines(&[line(1)], test_time()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
        assert!(order.ensure_deletable().is_err());
    }

    #[test]
    fn delivery_plan_is_bounded_by_requested_quantity() {
        let mut order = pending_order(&[line(10), line(5)]);
        let first = order.carts()[0].id;
        let second = order.carts()[1].id;

        // Wrong state first.
        assert!(matches!(
            order.plan_delivery(&[CartQuantity { cart_id: first, quantity: 1 }]),
            Err(DomainError::InvalidTransition { .. })
        ));

        order.confirm(UserId::new(), test_time()).unwrap();

        assert!(order
            .plan_delivery(&[CartQuantity { cart_id: first, quantity: 11 }])
            .is_err());
        assert!(order
            .plan_delivery(&[CartQuantity { cart_id: CartId::generate(), quantity: 1 }])
            .is_err());
        assert!(order
            .plan_delivery(&[CartQuantity { cart_id: first, quantity: 0 }])
            .is_err());

        let plan = order
            .plan_delivery(&[CartQuantity { cart_id: first, quantity: 8 }])
            .unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.iter().find(|m| m.cart_id == second).unwrap().quantity, 0);

        order.mark_delivered(&plan, UserId::new(), test_time()).unwrap();
        assert_eq!(order.status(), WarehouseOrderStatus::Delivered);
        assert_eq!(order.carts()[0].delivered_quantity, Some(8));
        assert_eq!(order.carts()[1].delivered_quantity, Some(0));
    }

    #[test]
    fn receipt_is_bounded_by_delivered_quantity() {
        let mut order = pending_order(&[line(10)]);
        let cart = order.carts()[0].id;
        order.confirm(UserId::new(), test_time()).unwrap();
        let plan = order
            .plan_delivery(&[CartQuantity { cart_id: cart, quantity: 6 }])
            .unwrap();
        order.mark_delivered(&plan, UserId::new(), test_time()).unwrap();

        assert!(order
            .plan_receipt(&[CartQuantity { cart_id: cart, quantity: 7 }])
            .is_err());

        let plan = order
            .plan_receipt(&[CartQuantity { cart_id: cart, quantity: 6 }])
            .unwrap();
        order.mark_received(&plan, UserId::new(), test_time()).unwrap();
        assert_eq!(order.status(), WarehouseOrderStatus::Finished);
        assert_eq!(order.carts()[0].received_quantity, Some(6));
        assert!(order.status().is_terminal());
    }

    #[test]
    fn every_mutation_bumps_version() {
        let mut order = pending_order(&[line(1)]);
        assert_eq!(order.version(), 1);
        order.confirm(UserId::new(), test_time()).unwrap();
        assert_eq!(order.version(), 2);
    }
}
