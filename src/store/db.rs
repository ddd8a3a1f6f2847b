use std::path::Path;

use redb::{Database as RedbDatabase, ReadableTable, TableDefinition};

use super::{SharedStore, StoreError};

const SHARED_KV: TableDefinition<&str, &str> = TableDefinition::new("shared_kv");

/// Persistent shared store backed by redb.
///
/// Same contract as [`super::MemoryStore`], but the key space survives a
/// process restart, so a relaunched session resumes with whatever renewal
/// state its predecessor left behind — including a dangling Running claim,
/// which stuck detection then recovers.
pub struct RedbStore {
    db: RedbDatabase,
}

impl RedbStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let db_path = data_dir.as_ref().join("renew-sync.redb");
        let db = RedbDatabase::create(db_path)?;

        // Create the table up front so reads never see a missing table
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SHARED_KV)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }
}

impl SharedStore for RedbStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SHARED_KV)?;

        match table.get(key)? {
            Some(value) => Ok(Some(value.value().to_string())),
            None => Ok(None),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SHARED_KV)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_store() -> (RedbStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RedbStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_read_missing_key() {
        let (store, _temp) = setup_store();
        assert_eq!(store.read("nothing").unwrap(), None);
    }

    #[test]
    fn test_write_then_read() {
        let (store, _temp) = setup_store();
        store.write("k", "v").unwrap();
        assert_eq!(store.read("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_state_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = RedbStore::open(temp_dir.path()).unwrap();
            store.write("renewal_running", "{\"state\":\"running\"}").unwrap();
        }

        let store = RedbStore::open(temp_dir.path()).unwrap();
        assert_eq!(
            store.read("renewal_running").unwrap().as_deref(),
            Some("{\"state\":\"running\"}")
        );
    }
}
