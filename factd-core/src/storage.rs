//! Storage extension point: where index pages live.
//!
//! The fact store never touches files itself. It hands serialized pages to
//! a [`PageStorage`] under stable addresses and asks for them back on
//! demand, so an implementation is free to keep only a bounded working set
//! in memory.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Stable page address.
pub type Address = u64;

/// Address of the root page (index directories, schema, counters).
pub const ROOT_ADDRESS: Address = 0;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("page {0} not found")]
    NotFound(Address),
    #[error("page {address} is corrupt: {reason}")]
    Corrupt { address: Address, reason: String },
    #[error("storage I/O error: {0}")]
    Io(String),
}

/// Page storage used by a fact store.
///
/// Implementations must be safe for concurrent `restore` and `store`.
pub trait PageStorage: Send + Sync {
    /// Durably write a page before returning.
    fn store(&self, address: Address, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// Return a page's bytes exactly as stored.
    fn restore(&self, address: Address) -> Result<Arc<[u8]>, StorageError>;

    /// Every address currently stored.
    fn list_addresses(&self) -> Result<Vec<Address>, StorageError>;

    /// Remove specific pages. Unknown addresses are ignored.
    fn delete(&self, addresses: &[Address]) -> Result<(), StorageError>;

    /// Remove every page.
    fn delete_all(&self) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Unbounded in-memory storage. Keeps every page resident.
#[derive(Default)]
pub struct MemoryStorage {
    pages: RwLock<HashMap<Address, Arc<[u8]>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pages.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::Io("memory storage lock poisoned".into())
}

impl PageStorage for MemoryStorage {
    fn store(&self, address: Address, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.pages
            .write()
            .map_err(poisoned)?
            .insert(address, Arc::from(bytes));
        Ok(())
    }

    fn restore(&self, address: Address) -> Result<Arc<[u8]>, StorageError> {
        self.pages
            .read()
            .map_err(poisoned)?
            .get(&address)
            .cloned()
            .ok_or(StorageError::NotFound(address))
    }

    fn list_addresses(&self) -> Result<Vec<Address>, StorageError> {
        let mut addrs: Vec<Address> = self.pages.read().map_err(poisoned)?.keys().copied().collect();
        addrs.sort_unstable();
        Ok(addrs)
    }

    fn delete(&self, addresses: &[Address]) -> Result<(), StorageError> {
        let mut pages = self.pages.write().map_err(poisoned)?;
        for addr in addresses {
            pages.remove(addr);
        }
        Ok(())
    }

    fn delete_all(&self) -> Result<(), StorageError> {
        self.pages.write().map_err(poisoned)?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        storage.store(3, vec![1, 2, 3]).unwrap();
        assert_eq!(&*storage.restore(3).unwrap(), &[1, 2, 3]);
        assert!(matches!(storage.restore(4), Err(StorageError::NotFound(4))));
    }

    #[test]
    fn test_memory_storage_delete() {
        let storage = MemoryStorage::new();
        for addr in 0..5 {
            storage.store(addr, vec![addr as u8]).unwrap();
        }
        storage.delete(&[1, 3, 42]).unwrap();
        assert_eq!(storage.list_addresses().unwrap(), vec![0, 2, 4]);
        storage.delete_all().unwrap();
        assert!(storage.is_empty());
    }
}
