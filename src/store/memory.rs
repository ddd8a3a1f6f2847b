use std::collections::HashMap;
use std::sync::RwLock;

use super::{SharedStore, StoreError};

/// In-process shared store.
///
/// The primary deployment shape: all instances of a logical session live in
/// one process and share a single `MemoryStore` behind an `Arc`, the way
/// browser tabs share origin storage. Reads and writes are individually
/// consistent but there is deliberately no read-modify-write — callers get
/// exactly the weak contract of [`SharedStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_missing_key() {
        let store = MemoryStore::new();
        assert_eq!(store.read("nothing").unwrap(), None);
    }

    #[test]
    fn test_write_then_read() {
        let store = MemoryStore::new();
        store.write("k", "v").unwrap();
        assert_eq!(store.read("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_overwrite() {
        let store = MemoryStore::new();
        store.write("k", "first").unwrap();
        store.write("k", "second").unwrap();
        assert_eq!(store.read("k").unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn test_empty_string_reads_as_absent_via_helper() {
        let store = MemoryStore::new();
        store.write("k", "").unwrap();
        assert_eq!(super::super::read_non_empty(&store, "k").unwrap(), None);
    }
}
