//! Inventory domain module.
//!
//! This crate contains the business rules for items, ledger entries, warehouse
//! orders and stock opnames, implemented purely as deterministic domain logic
//! (no IO, no storage). Stock movement is decided here and persisted by infra.

pub mod item;
pub mod opname;
pub mod order;
pub mod transaction;

pub use item::{
    validate_conversion_link, Item, ItemDetails, ItemId, ItemRecord, NewItem, PostingRequest,
    Scope, MAX_CONVERSION_DEPTH,
};
pub use opname::{
    NewStockOpname, OpnameAdjustment, OpnameEvent, OpnameLine, OpnameStatus, StockOpname,
    StockOpnameId, StockOpnameRecord,
};
pub use order::{
    order_number, CartId, CartMovement, CartQuantity, NewWarehouseOrder, OrderEvent, OrderLine,
    WarehouseOrder, WarehouseOrderCart, WarehouseOrderId, WarehouseOrderRecord,
    WarehouseOrderStatus,
};
pub use transaction::{ledger_balance, ItemTransaction, TransactionId, TransactionKind};
