//! Secure key-value store contract.
//!
//! Implementations encrypt values at rest. The engine only ever sees opaque
//! byte blobs keyed by name.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::errors::{Error, Result};

#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn get_encrypted(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set_encrypted(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn remove_encrypted(&self, key: &str) -> Result<()>;
}

/// Process-local store for tests and the sandbox runtime. Nothing reaches disk.
#[derive(Debug, Default)]
pub struct InMemorySecureStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }
}

#[async_trait]
impl SecureStore for InMemorySecureStore {
    async fn get_encrypted(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::storage("secure store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    async fn set_encrypted(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::storage("secure store lock poisoned"))?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove_encrypted(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::storage("secure store lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}
