//! Persisted subset of engine state and the repository that stores it.

use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::alerts::SyncAlert;
use crate::connections::{BankAccount, BankConnection};
use crate::errors::Result;
use crate::queue::TransactionQueueItem;
use crate::reconciliation::ReconciliationState;
use crate::secrets::SecureStore;
use crate::sync::{SyncConfig, SyncStats};
use crate::transactions::BankTransaction;

pub const ACCOUNTS_KEY: &str = "accounts";
pub const TRANSACTIONS_KEY: &str = "transactions";
pub const CONNECTIONS_KEY: &str = "connections";
pub const SYNC_CONFIG_KEY: &str = "sync_config";
pub const SYNC_STATS_KEY: &str = "sync_stats";
pub const RECONCILIATION_STATE_KEY: &str = "reconciliation_state";
pub const ALERTS_KEY: &str = "alerts";
pub const TRANSACTION_QUEUE_KEY: &str = "transaction_queue";

/// Everything that survives a restart. In-flight sync state is never part of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub accounts: Vec<BankAccount>,
    pub transactions: Vec<BankTransaction>,
    pub connections: Vec<BankConnection>,
    pub sync_config: SyncConfig,
    pub sync_stats: SyncStats,
    pub reconciliation_state: ReconciliationState,
    pub alerts: Vec<SyncAlert>,
    pub transaction_queue: Vec<TransactionQueueItem>,
}

#[async_trait]
pub trait EngineRepository: Send + Sync {
    async fn load(&self) -> Result<EngineSnapshot>;
    async fn save(&self, snapshot: &EngineSnapshot) -> Result<()>;
}

/// Stores each part of the snapshot as its own encrypted blob.
pub struct SecureStoreRepository {
    store: Arc<dyn SecureStore>,
}

impl SecureStoreRepository {
    pub fn new(store: Arc<dyn SecureStore>) -> Self {
        Self { store }
    }

    async fn read<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        match self.store.get_encrypted(key).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(T::default()),
        }
    }

    async fn write<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.store.set_encrypted(key, &bytes).await
    }
}

#[async_trait]
impl EngineRepository for SecureStoreRepository {
    async fn load(&self) -> Result<EngineSnapshot> {
        let snapshot = EngineSnapshot {
            accounts: self.read(ACCOUNTS_KEY).await?,
            transactions: self.read(TRANSACTIONS_KEY).await?,
            connections: self.read(CONNECTIONS_KEY).await?,
            sync_config: self.read(SYNC_CONFIG_KEY).await?,
            sync_stats: self.read(SYNC_STATS_KEY).await?,
            reconciliation_state: self.read(RECONCILIATION_STATE_KEY).await?,
            alerts: self.read(ALERTS_KEY).await?,
            transaction_queue: self.read(TRANSACTION_QUEUE_KEY).await?,
        };
        debug!(
            "[Storage] Loaded {} accounts, {} transactions, {} queued items",
            snapshot.accounts.len(),
            snapshot.transactions.len(),
            snapshot.transaction_queue.len()
        );
        Ok(snapshot)
    }

    async fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        self.write(ACCOUNTS_KEY, &snapshot.accounts).await?;
        self.write(TRANSACTIONS_KEY, &snapshot.transactions).await?;
        self.write(CONNECTIONS_KEY, &snapshot.connections).await?;
        self.write(SYNC_CONFIG_KEY, &snapshot.sync_config).await?;
        self.write(SYNC_STATS_KEY, &snapshot.sync_stats).await?;
        self.write(RECONCILIATION_STATE_KEY, &snapshot.reconciliation_state)
            .await?;
        self.write(ALERTS_KEY, &snapshot.alerts).await?;
        self.write(TRANSACTION_QUEUE_KEY, &snapshot.transaction_queue)
            .await?;
        Ok(())
    }
}
