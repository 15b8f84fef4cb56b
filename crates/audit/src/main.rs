//! `stockledger-audit`: recompute every item's stock from its ledger.
//!
//! Usage: `stockledger-audit [warehouse | <division-uuid>]`. Without an
//! argument every item is audited. Drifted items are printed as JSON lines and
//! the process exits with status 1.

use std::process::ExitCode;

use anyhow::Context;

use stockledger_core::DivisionId;
use stockledger_infra::{build_services, BalanceAudit, LedgerConfig};
use stockledger_inventory::Scope;

fn parse_scope(arg: Option<String>) -> anyhow::Result<Option<Scope>> {
    match arg.as_deref() {
        None => Ok(None),
        Some("warehouse") => Ok(Some(Scope::Warehouse)),
        Some(raw) => {
            let division: DivisionId = raw
                .parse()
                .with_context(|| format!("'{raw}' is neither 'warehouse' nor a division id"))?;
            Ok(Some(Scope::Division(division)))
        }
    }
}

async fn run() -> anyhow::Result<Vec<BalanceAudit>> {
    let scope = parse_scope(std::env::args().nth(1))?;
    let config = LedgerConfig::from_env();
    let services = build_services(&config).await?;

    let audits = match scope {
        Some(scope) => services.ledger.audit_scope(scope).await,
        None => services.ledger.audit_all().await,
    }
    .context("ledger audit failed")?;
    Ok(audits)
}

#[tokio::main]
async fn main() -> ExitCode {
    stockledger_observability::init();

    let audits = match run().await {
        Ok(audits) => audits,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "audit aborted");
            return ExitCode::from(2);
        }
    };

    let drifted: Vec<&BalanceAudit> = audits.iter().filter(|a| !a.is_consistent()).collect();
    for audit in &drifted {
        match serde_json::to_string(audit) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::error!(item_id = %audit.item_id, error = %err, "failed to encode audit"),
        }
    }

    tracing::info!(items = audits.len(), drifted = drifted.len(), "ledger audit finished");
    if drifted.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
