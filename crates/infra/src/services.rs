//! Service wiring: one store shared by every inventory service.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::catalog::ItemCatalog;
use crate::config::LedgerConfig;
use crate::conversion::ConversionEngine;
use crate::ledger::StockLedger;
use crate::opname::StockOpnameReconciler;
use crate::reporting::ReportingService;
use crate::store::{InMemoryInventoryStore, InventoryStore, PostgresInventoryStore};
use crate::workflow::WarehouseOrderWorkflow;

/// Store handle used when the backend is chosen at runtime.
pub type SharedStore = Arc<dyn InventoryStore>;

/// Every inventory service over one store.
#[derive(Debug, Clone)]
pub struct InventoryServices<S> {
    pub catalog: ItemCatalog<S>,
    pub ledger: StockLedger<S>,
    pub conversions: ConversionEngine<S>,
    pub orders: WarehouseOrderWorkflow<S>,
    pub opnames: StockOpnameReconciler<S>,
    pub reporting: ReportingService<S>,
}

impl<S> InventoryServices<S>
where
    S: InventoryStore + Clone,
{
    pub fn new(store: S, config: &LedgerConfig) -> Self {
        let retry = config.retry.clone();
        Self {
            catalog: ItemCatalog::new(store.clone(), retry.clone()),
            ledger: StockLedger::new(store.clone(), retry.clone()),
            conversions: ConversionEngine::new(store.clone(), retry.clone()),
            orders: WarehouseOrderWorkflow::new(store.clone(), retry.clone()),
            opnames: StockOpnameReconciler::new(store.clone(), retry),
            reporting: ReportingService::new(store, config.low_stock_threshold),
        }
    }
}

/// Build services over the in-memory store, or Postgres when
/// `USE_PERSISTENT_STORES=true`.
pub async fn build_services(config: &LedgerConfig) -> anyhow::Result<InventoryServices<SharedStore>> {
    if config.use_persistent_stores {
        match config.database_url.as_deref() {
            Some(url) => return build_persistent_services(url, config).await,
            None => warn!(
                "USE_PERSISTENT_STORES=true but DATABASE_URL is not set, falling back to in-memory"
            ),
        }
    }

    info!("using in-memory inventory store");
    let store: SharedStore = Arc::new(InMemoryInventoryStore::new());
    Ok(InventoryServices::new(store, config))
}

async fn build_persistent_services(
    database_url: &str,
    config: &LedgerConfig,
) -> anyhow::Result<InventoryServices<SharedStore>> {
    let store = PostgresInventoryStore::connect(database_url, config.database_max_connections)
        .await
        .context("failed to connect to Postgres")?;
    store
        .ensure_schema()
        .await
        .context("failed to apply inventory schema")?;

    info!(max_connections = config.database_max_connections, "using Postgres inventory store");
    let store: SharedStore = Arc::new(store);
    Ok(InventoryServices::new(store, config))
}
