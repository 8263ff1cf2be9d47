//! Process configuration read from the environment.

use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8088";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Encrypted SQLite file. Unset keeps all state in memory.
    pub db_path: Option<PathBuf>,
    pub store_secret: Option<String>,
    /// Aggregator REST API. Unset serves the sandbox "Demo Bank" only.
    pub aggregator_url: Option<String>,
    /// Expense service REST API. Unset uses an in-memory ledger.
    pub expenses_url: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let value = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bind_addr = value("BANKFEED_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .context("BANKFEED_BIND_ADDR must be a socket address")?;
        let db_path = value("BANKFEED_DB_PATH").map(PathBuf::from);
        let store_secret = value("BANKFEED_STORE_SECRET");
        if db_path.is_some() && store_secret.is_none() {
            bail!("BANKFEED_STORE_SECRET is required when BANKFEED_DB_PATH is set");
        }

        Ok(Self {
            bind_addr,
            db_path,
            store_secret,
            aggregator_url: value("BANKFEED_AGGREGATOR_URL")
                .map(|v| v.trim_end_matches('/').to_string()),
            expenses_url: value("BANKFEED_EXPENSES_URL").map(|v| v.trim_end_matches('/').to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_run_fully_in_memory() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR.parse().unwrap());
        assert_eq!(config.db_path, None);
        assert_eq!(config.aggregator_url, None);
        assert_eq!(config.expenses_url, None);
    }

    #[test]
    fn database_requires_a_secret() {
        let err = Config::from_lookup(lookup(&[("BANKFEED_DB_PATH", "/tmp/bankfeed.db")]))
            .unwrap_err();
        assert!(err.to_string().contains("BANKFEED_STORE_SECRET"));

        let config = Config::from_lookup(lookup(&[
            ("BANKFEED_DB_PATH", "/tmp/bankfeed.db"),
            ("BANKFEED_STORE_SECRET", "s3cret"),
            ("BANKFEED_AGGREGATOR_URL", "https://agg.example/ "),
        ]))
        .unwrap();
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/bankfeed.db")));
        assert_eq!(config.aggregator_url.as_deref(), Some("https://agg.example"));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config =
            Config::from_lookup(lookup(&[("BANKFEED_EXPENSES_URL", "  "), ("BANKFEED_BIND_ADDR", "")]))
                .unwrap();
        assert_eq!(config.expenses_url, None);
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR.parse().unwrap());
    }

    #[test]
    fn bad_bind_address_is_reported() {
        assert!(Config::from_lookup(lookup(&[("BANKFEED_BIND_ADDR", "localhost")])).is_err());
    }
}
