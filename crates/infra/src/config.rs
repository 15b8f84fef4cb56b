//! Configuration loading from the process environment.

use std::time::Duration;

use tracing::warn;

use crate::retry::RetryPolicy;

/// Runtime configuration for the ledger services.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    /// Use Postgres instead of the in-memory store.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub retry: RetryPolicy,
    /// Default threshold for low-stock reporting.
    pub low_stock_threshold: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            use_persistent_stores: false,
            database_url: None,
            database_max_connections: 10,
            retry: RetryPolicy::default(),
            low_stock_threshold: 10,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let retry = RetryPolicy::new(
            parse_or(&lookup, "LEDGER_RETRY_MAX_RETRIES", defaults.retry.max_retries),
            Duration::from_millis(parse_or(
                &lookup,
                "LEDGER_RETRY_BASE_DELAY_MS",
                defaults.retry.base_delay.as_millis() as u64,
            )),
            Duration::from_millis(parse_or(
                &lookup,
                "LEDGER_RETRY_MAX_DELAY_MS",
                defaults.retry.max_delay.as_millis() as u64,
            )),
        );

        Self {
            use_persistent_stores: parse_or(&lookup, "USE_PERSISTENT_STORES", false),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections: parse_or(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            ),
            retry,
            low_stock_threshold: parse_or(&lookup, "LOW_STOCK_THRESHOLD", defaults.low_stock_threshold),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy + core::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!(key, value = %raw, default = ?default, "invalid configuration value, using default");
            default
        }),
    }
}
