//! [`SecureStore`] over the `secure_blobs` table.

use async_trait::async_trait;
use bankfeed_core::secrets::SecureStore;
use chrono::Utc;
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::crypto::BlobKey;
use crate::db::{open_connection, run_migrations};
use crate::errors::StorageError;

/// Values are sealed before they reach SQLite; the file never holds plaintext.
#[derive(Clone)]
pub struct SqliteSecureStore {
    conn: Arc<Mutex<Connection>>,
    key: Arc<BlobKey>,
}

impl SqliteSecureStore {
    pub fn open(path: impl AsRef<Path>, master_secret: &[u8]) -> Result<Self, StorageError> {
        let conn = open_connection(path.as_ref())?;
        debug!("[Storage] Opened secure store at {}", path.as_ref().display());
        Self::from_connection(conn, master_secret)
    }

    pub fn open_in_memory(master_secret: &[u8]) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Self::from_connection(conn, master_secret)
    }

    fn from_connection(conn: Connection, master_secret: &[u8]) -> Result<Self, StorageError> {
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            key: Arc::new(BlobKey::derive(master_secret)?),
        })
    }

    /// Runs blocking SQLite work off the async runtime.
    async fn exec<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &BlobKey) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let key = Arc::clone(&self.key);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StorageError::internal("connection lock poisoned"))?;
            f(&guard, &key)
        })
        .await
        .map_err(|e| StorageError::internal(format!("storage task failed: {}", e)))?
    }

    /// Names of every stored blob, sorted.
    pub async fn names(&self) -> Result<Vec<String>, StorageError> {
        self.exec(|conn, _| {
            let mut stmt = conn.prepare("SELECT name FROM secure_blobs ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }
}

#[async_trait]
impl SecureStore for SqliteSecureStore {
    async fn get_encrypted(&self, key: &str) -> bankfeed_core::Result<Option<Vec<u8>>> {
        let name = key.to_string();
        let value = self
            .exec(move |conn, blob_key| {
                let row: Option<(Vec<u8>, Vec<u8>)> = conn
                    .query_row(
                        "SELECT nonce, ciphertext FROM secure_blobs WHERE name = ?1",
                        params![name],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                row.map(|(nonce, ciphertext)| blob_key.open(&name, &nonce, &ciphertext))
                    .transpose()
            })
            .await?;
        Ok(value)
    }

    async fn set_encrypted(&self, key: &str, value: &[u8]) -> bankfeed_core::Result<()> {
        let name = key.to_string();
        let plaintext = value.to_vec();
        self.exec(move |conn, blob_key| {
            let (nonce, ciphertext) = blob_key.seal(&name, &plaintext)?;
            conn.execute(
                "INSERT INTO secure_blobs (name, nonce, ciphertext, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    nonce = excluded.nonce,
                    ciphertext = excluded.ciphertext,
                    updated_at = excluded.updated_at",
                params![name, nonce.to_vec(), ciphertext, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await?;
        debug!("[Storage] Stored {} ({} bytes)", key, value.len());
        Ok(())
    }

    async fn remove_encrypted(&self, key: &str) -> bankfeed_core::Result<()> {
        let name = key.to_string();
        let removed = self
            .exec(move |conn, _| {
                Ok(conn.execute("DELETE FROM secure_blobs WHERE name = ?1", params![name])?)
            })
            .await?;
        if removed > 0 {
            debug!("[Storage] Removed {}", key);
        }
        Ok(())
    }
}
