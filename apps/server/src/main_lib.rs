//! Application state and its construction from [`Config`].

use std::sync::Arc;

use anyhow::Context;
use bankfeed_connect::{AggregatorClient, HttpExpenseLedger, SandboxProvider};
use bankfeed_core::auth::StoreBackedAuthenticator;
use bankfeed_core::connections::BankProvider;
use bankfeed_core::persistence::SecureStoreRepository;
use bankfeed_core::reconciliation::{ExpenseLedger, InMemoryExpenseLedger};
use bankfeed_core::secrets::{InMemorySecureStore, SecureStore};
use bankfeed_core::sync::SyncScheduler;
use bankfeed_core::BankingEngine;
use bankfeed_storage_sqlite::SqliteSecureStore;
use tracing::{info, warn};

use crate::config::Config;

pub struct AppState {
    pub engine: Arc<BankingEngine>,
    pub authenticator: Arc<StoreBackedAuthenticator>,
    pub scheduler: SyncScheduler,
}

impl AppState {
    pub fn new(engine: Arc<BankingEngine>, authenticator: Arc<StoreBackedAuthenticator>) -> Self {
        Self {
            engine,
            authenticator,
            scheduler: SyncScheduler::new(),
        }
    }
}

fn open_store(config: &Config) -> anyhow::Result<Arc<dyn SecureStore>> {
    match (&config.db_path, &config.store_secret) {
        (Some(path), Some(secret)) => {
            let store = SqliteSecureStore::open(path, secret.as_bytes())
                .with_context(|| format!("failed to open secure store at {}", path.display()))?;
            info!("Secure store: {}", path.display());
            Ok(Arc::new(store))
        }
        _ => {
            warn!("BANKFEED_DB_PATH not set, state will not survive a restart");
            Ok(Arc::new(InMemorySecureStore::new()))
        }
    }
}

/// Wires stores, providers and the ledger, then restores persisted state.
pub async fn build_state(config: &Config) -> anyhow::Result<Arc<AppState>> {
    let store = open_store(config)?;
    let authenticator = Arc::new(StoreBackedAuthenticator::new(store.clone()));

    let sandbox: Arc<dyn BankProvider> = Arc::new(SandboxProvider::new());
    let primary: Arc<dyn BankProvider> = match &config.aggregator_url {
        Some(url) => {
            info!("Aggregator: {}", url);
            Arc::new(AggregatorClient::new(url).context("failed to build aggregator client")?)
        }
        None => sandbox.clone(),
    };

    let ledger: Arc<dyn ExpenseLedger> = match &config.expenses_url {
        Some(url) => {
            info!("Expense service: {}", url);
            Arc::new(HttpExpenseLedger::new(url).context("failed to build expense client")?)
        }
        None => Arc::new(InMemoryExpenseLedger::new()),
    };

    let engine = BankingEngine::new(
        primary,
        authenticator.clone(),
        ledger,
        Arc::new(SecureStoreRepository::new(store)),
    )
    .with_provider(sandbox);
    engine
        .restore()
        .await
        .context("failed to restore persisted engine state")?;

    // A running server process is the signed-in user; sign-out goes through DELETE /session.
    authenticator.sign_in();
    Ok(Arc::new(AppState::new(Arc::new(engine), authenticator)))
}
