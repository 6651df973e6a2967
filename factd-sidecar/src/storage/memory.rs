//! Ephemeral backing store for graphs opened without a path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use factd_core::Address;

use super::{BackingError, BackingStore};

#[derive(Default)]
pub struct MemoryBackingStore {
    pages: RwLock<BTreeMap<Address, Vec<u8>>>,
    reject_writes: AtomicBool,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `put` and `delete_all` fail until called again
    /// with `false`.
    /// Used to exercise write-failure handling.
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.pages.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BackingStore for MemoryBackingStore {
    fn put(&self, address: Address, bytes: &[u8]) -> Result<(), BackingError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(BackingError::WriteRejected(format!("page {address}")));
        }
        self.pages
            .write()
            .map_err(|_| BackingError::Poisoned)?
            .insert(address, bytes.to_vec());
        Ok(())
    }

    fn get(&self, address: Address) -> Result<Option<Vec<u8>>, BackingError> {
        Ok(self
            .pages
            .read()
            .map_err(|_| BackingError::Poisoned)?
            .get(&address)
            .cloned())
    }

    fn addresses(&self) -> Result<Vec<Address>, BackingError> {
        Ok(self
            .pages
            .read()
            .map_err(|_| BackingError::Poisoned)?
            .keys()
            .copied()
            .collect())
    }

    fn delete(&self, addresses: &[Address]) -> Result<(), BackingError> {
        let mut pages = self.pages.write().map_err(|_| BackingError::Poisoned)?;
        for address in addresses {
            pages.remove(address);
        }
        Ok(())
    }

    fn delete_all(&self) -> Result<(), BackingError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(BackingError::WriteRejected("delete all".into()));
        }
        self.pages.write().map_err(|_| BackingError::Poisoned)?.clear();
        Ok(())
    }

    fn flush(&self) -> Result<(), BackingError> {
        Ok(())
    }
}
