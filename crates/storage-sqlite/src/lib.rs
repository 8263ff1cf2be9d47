//! Encrypted SQLite key-value store for the bankfeed engine.

mod crypto;
mod db;
mod errors;
mod secure_store;

pub use crypto::BlobKey;
pub use db::{open_connection, run_migrations, SCHEMA_VERSION};
pub use errors::StorageError;
pub use secure_store::SqliteSecureStore;
