//! Persistence contract and the durable outbox.
//!
//! The actual database (IndexedDB, SQLite, sled, ...) is implemented by the
//! application; the core only needs single-key transactional `put`/`get`/
//! `delete` and ordered prefix iteration. `MemoryStore` is the in-process
//! implementation used by tests and ephemeral clients.

pub mod outbox;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub use outbox::{DeliveryState, Outbox, OutboxEntry, OutboxError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(String),
    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("Storage lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Key-value contract (app implements)
// ---------------------------------------------------------------------------

/// Persistence collaborator. Each call is atomic for its single key.
///
/// Key layout used by this crate:
/// - `outbox/{message_id}`: JSON `OutboxEntry`
/// - `cache/{message_id}`: JSON `Message` applied to the merge cache
pub trait KvStore: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn delete(&self, key: &str) -> Result<()>;

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn iterate(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

impl<S: KvStore + ?Sized> KvStore for Arc<S> {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).put(key, value)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn iterate(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        (**self).iterate(prefix)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn iterate(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStore::new();
        assert!(store.get("a").unwrap().is_none());
        store.put("a", b"1").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"1".to_vec()));
        store.put("a", b"2").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"2".to_vec()));
        store.delete("a").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_iterate_prefix_in_order() {
        let store = MemoryStore::new();
        store.put("outbox/b", b"2").unwrap();
        store.put("cache/x", b"x").unwrap();
        store.put("outbox/a", b"1").unwrap();
        store.put("outboxes", b"no").unwrap();

        let rows = store.iterate("outbox/").unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["outbox/a", "outbox/b"]);
    }

    #[test]
    fn test_shared_through_arc() {
        let store = Arc::new(MemoryStore::new());
        let handle = store.clone();
        handle.put("k", b"v").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
    }
}
