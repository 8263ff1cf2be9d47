//! Connection setup and schema migrations.

use log::debug;
use rusqlite::Connection;
use std::path::Path;

use crate::errors::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

/// Opens (or creates) the database file and brings its schema up to date.
pub fn open_connection(path: impl AsRef<Path>) -> Result<Connection, StorageError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| StorageError::internal(format!("cannot create {}: {}", parent.display(), e)))?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    run_migrations(&conn)?;
    Ok(conn)
}

pub fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    let current: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    debug!(
        "[Storage] Running migrations: current_version={}, target_version={}",
        current, SCHEMA_VERSION
    );
    if current > SCHEMA_VERSION {
        return Err(StorageError::Migration(format!(
            "database schema {} is newer than supported version {}",
            current, SCHEMA_VERSION
        )));
    }

    if current < 1 {
        migrate_v1(conn)?;
    }

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS secure_blobs (
            name TEXT PRIMARY KEY NOT NULL,
            nonce BLOB NOT NULL,
            ciphertext BLOB NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}
