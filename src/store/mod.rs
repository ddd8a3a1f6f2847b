//! The shared key-value store contract all instances coordinate through.
//!
//! The store is deliberately weak: synchronous single-key reads and writes,
//! no compare-and-swap, no transactions, no change notifications. Every
//! algorithm in this crate (the bakery lock, stuck detection) is built to
//! survive exactly that weakness, so implementations must not be "upgraded"
//! with stronger guarantees the callers would then silently depend on.

pub mod db;
pub mod keys;
pub mod memory;
pub mod records;

pub use db::RedbStore;
pub use memory::MemoryStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
}

/// A key-value store visible to every instance of the same logical session.
///
/// Values are opaque strings; the records in [`records`] serialize as JSON.
/// Writing an empty string clears a record — readers treat `""` the same as
/// an absent key. Content read from the store may be concurrently stale;
/// callers must re-validate timestamps before trusting a "running" flag.
pub trait SharedStore: Send + Sync {
    /// Read the value under `key`, or `None` if never written.
    fn read(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `value` under `key`, overwriting any previous value.
    fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Read a key and treat the empty string as absent.
pub fn read_non_empty(
    store: &dyn SharedStore,
    key: &str,
) -> Result<Option<String>, StoreError> {
    Ok(store.read(key)?.filter(|v| !v.is_empty()))
}
