//! Infrastructure layer: stores, inventory services, retries, config.
//!
//! Domain decisions live in `stockledger-inventory`; the services here open a
//! unit of work, let the domain decide, and persist the outcome atomically.

pub mod catalog;
pub mod config;
pub mod conversion;
pub mod error;
pub mod ledger;
pub mod opname;
pub mod reporting;
pub mod retry;
pub mod services;
pub mod store;
pub mod workflow;


pub use catalog::{CreateItem, ItemCatalog};
pub use config::LedgerConfig;
pub use conversion::{ConversionEngine, ConversionOutcome};
pub use error::{ServiceError, ServiceResult};
pub use ledger::{BalanceAudit, StockLedger};
pub use opname::{OpnameConfirmation, StockOpnameReconciler};
pub use reporting::{ItemActivity, OpnameMonthStatus, ReportingService, StockLevel};
pub use retry::{with_retry, RetryPolicy};
pub use services::{build_services, InventoryServices, SharedStore};
pub use store::{InMemoryInventoryStore, InventoryStore, PostgresInventoryStore, StoreError, StoreTransaction};
pub use workflow::WarehouseOrderWorkflow;
