//! Bounded page cache in front of a backing store.
//!
//! This is the fact store's [`PageStorage`] for every graph. Pages are
//! kept in LRU order under two hard budgets (bytes and page count). A page
//! being written sits in an in-flight table until the backing store accepts
//! it; readers see it there and eviction never touches it.
//!
//! Budget invariant: after any operation the resident size exceeds
//! `max_bytes` by at most one page, which only happens when that single
//! page is larger than the whole budget.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use factd_core::{Address, PageStorage, StorageError};

use super::{BackingError, BackingStore};

/// Cache budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Resident bytes (default: 64MB)
    pub max_bytes: usize,
    /// Resident pages (default: 8192)
    pub max_pages: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
            max_pages: 8192,
        }
    }
}

impl CacheConfig {
    /// Tiny budgets so tests exercise eviction.
    pub fn for_testing() -> Self {
        Self {
            max_bytes: 64 * 1024,
            max_pages: 16,
        }
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writes: u64,
    pub resident_pages: usize,
    pub resident_bytes: usize,
    pub in_flight: usize,
}

struct AtomicCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writes: AtomicU64,
}

impl AtomicCacheStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }
}

struct Resident {
    pages: LruCache<Address, Arc<[u8]>>,
    bytes: usize,
}

/// LRU page cache implementing the fact store's storage extension point.
pub struct CachedStorage {
    backing: Arc<dyn BackingStore>,
    config: CacheConfig,
    resident: Mutex<Resident>,
    in_flight: Mutex<HashMap<Address, Arc<[u8]>>>,
    stats: AtomicCacheStats,
}

fn storage_error(e: BackingError) -> StorageError {
    StorageError::Io(e.to_string())
}

impl CachedStorage {
    pub fn new(backing: Arc<dyn BackingStore>, config: CacheConfig) -> Self {
        Self {
            backing,
            config,
            resident: Mutex::new(Resident {
                pages: LruCache::unbounded(),
                bytes: 0,
            }),
            in_flight: Mutex::new(HashMap::new()),
            stats: AtomicCacheStats::new(),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    pub fn backing(&self) -> &Arc<dyn BackingStore> {
        &self.backing
    }

    fn resident(&self) -> MutexGuard<'_, Resident> {
        self.resident.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<Address, Arc<[u8]>>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Insert or refresh a page, then evict down to the budgets.
    fn admit(&self, address: Address, page: Arc<[u8]>) {
        let mut resident = self.resident();
        let size = page.len();
        if let Some(old) = resident.pages.put(address, page) {
            resident.bytes -= old.len();
        }
        resident.bytes += size;

        let mut evicted = 0u64;
        while resident.pages.len() > 1
            && (resident.bytes > self.config.max_bytes
                || resident.pages.len() > self.config.max_pages)
        {
            match resident.pages.pop_lru() {
                Some((_, old)) => {
                    resident.bytes -= old.len();
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    fn forget(&self, address: Address) {
        let mut resident = self.resident();
        if let Some(old) = resident.pages.pop(&address) {
            resident.bytes -= old.len();
        }
    }

    pub fn is_resident(&self, address: Address) -> bool {
        self.resident().pages.contains(&address)
    }

    pub fn stats(&self) -> CacheStats {
        let (resident_pages, resident_bytes) = {
            let resident = self.resident();
            (resident.pages.len(), resident.bytes)
        };
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            resident_pages,
            resident_bytes,
            in_flight: self.in_flight().len(),
        }
    }
}

impl PageStorage for CachedStorage {
    fn store(&self, address: Address, bytes: Vec<u8>) -> Result<(), StorageError> {
        let page: Arc<[u8]> = Arc::from(bytes);
        self.in_flight().insert(address, page.clone());

        let result = self.backing.put(address, &page);
        if result.is_ok() {
            // Resident before leaving the in-flight table, so a concurrent
            // restore never falls through to a stale copy.
            self.admit(address, page);
            self.stats.writes.fetch_add(1, Ordering::Relaxed);
        }
        self.in_flight().remove(&address);

        result.map_err(|e| {
            log::error!("Failed to store page {address}: {e}");
            storage_error(e)
        })
    }

    fn restore(&self, address: Address) -> Result<Arc<[u8]>, StorageError> {
        if let Some(page) = self.in_flight().get(&address) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(page.clone());
        }
        if let Some(page) = self.resident().pages.get(&address) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(page.clone());
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let bytes = self
            .backing
            .get(address)
            .map_err(storage_error)?
            .ok_or(StorageError::NotFound(address))?;
        let page: Arc<[u8]> = Arc::from(bytes);
        log::trace!("Loaded page {address} ({} bytes)", page.len());
        self.admit(address, page.clone());
        Ok(page)
    }

    fn list_addresses(&self) -> Result<Vec<Address>, StorageError> {
        self.backing.addresses().map_err(storage_error)
    }

    fn delete(&self, addresses: &[Address]) -> Result<(), StorageError> {
        self.backing.delete(addresses).map_err(storage_error)?;
        for address in addresses {
            self.forget(*address);
        }
        Ok(())
    }

    fn delete_all(&self) -> Result<(), StorageError> {
        self.backing.delete_all().map_err(storage_error)?;
        let mut resident = self.resident();
        resident.pages.clear();
        resident.bytes = 0;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.backing.flush().map_err(storage_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackingStore;

    fn cache(max_bytes: usize, max_pages: usize) -> (Arc<MemoryBackingStore>, CachedStorage) {
        let backing = Arc::new(MemoryBackingStore::new());
        let storage = CachedStorage::new(
            backing.clone(),
            CacheConfig {
                max_bytes,
                max_pages,
            },
        );
        (backing, storage)
    }

    fn page(address: Address, len: usize) -> Vec<u8> {
        (0..len).map(|i| (address as usize + i) as u8).collect()
    }

    #[test]
    fn test_roundtrip_after_eviction() {
        let (_backing, storage) = cache(1024, 4);
        for addr in 0..50u64 {
            storage.store(addr, page(addr, 100)).unwrap();
        }
        assert!(!storage.is_resident(0));
        for addr in 0..50u64 {
            assert_eq!(&*storage.restore(addr).unwrap(), &page(addr, 100)[..]);
        }
        let stats = storage.stats();
        assert!(stats.misses > 0);
        assert!(stats.evictions > 0);
        assert!(stats.resident_pages <= 4);
    }

    #[test]
    fn test_byte_budget_exceeded_by_at_most_one_page() {
        let (_backing, storage) = cache(1000, 1000);
        let sizes = [10usize, 700, 40, 999, 3, 1500, 250, 250, 250, 600, 1];
        let largest = *sizes.iter().max().unwrap();
        for (i, size) in sizes.iter().enumerate() {
            storage.store(i as Address, page(i as Address, *size)).unwrap();
            let stats = storage.stats();
            assert!(
                stats.resident_bytes <= 1000 + largest,
                "resident {} after page {i}",
                stats.resident_bytes
            );
            if stats.resident_pages > 1 {
                assert!(stats.resident_bytes <= 1000);
            }
        }
        for (i, size) in sizes.iter().enumerate() {
            assert_eq!(storage.restore(i as Address).unwrap().len(), *size);
            assert!(storage.stats().resident_bytes <= 1000 + largest);
        }
    }

    #[test]
    fn test_page_budget() {
        let (_backing, storage) = cache(usize::MAX, 3);
        for addr in 0..10u64 {
            storage.store(addr, page(addr, 8)).unwrap();
            assert!(storage.stats().resident_pages <= 3);
        }
        // Most recently used survive
        assert!(storage.is_resident(9));
        assert!(storage.is_resident(7));
        assert!(!storage.is_resident(6));
    }

    #[test]
    fn test_restore_refreshes_recency() {
        let (_backing, storage) = cache(usize::MAX, 2);
        storage.store(1, page(1, 4)).unwrap();
        storage.store(2, page(2, 4)).unwrap();
        storage.restore(1).unwrap();
        storage.store(3, page(3, 4)).unwrap();
        assert!(storage.is_resident(1));
        assert!(!storage.is_resident(2));
    }

    #[test]
    fn test_overwrite_adjusts_accounting() {
        let (_backing, storage) = cache(10_000, 10);
        storage.store(0, page(0, 500)).unwrap();
        storage.store(0, page(0, 20)).unwrap();
        let stats = storage.stats();
        assert_eq!(stats.resident_pages, 1);
        assert_eq!(stats.resident_bytes, 20);
    }

    #[test]
    fn test_failed_store_leaves_previous_page() {
        let (backing, storage) = cache(10_000, 10);
        storage.store(0, b"old root".to_vec()).unwrap();
        backing.reject_writes(true);
        assert!(matches!(
            storage.store(0, b"new root".to_vec()),
            Err(StorageError::Io(_))
        ));
        backing.reject_writes(false);
        assert_eq!(&*storage.restore(0).unwrap(), b"old root");
        assert_eq!(storage.stats().in_flight, 0);
    }

    #[test]
    fn test_failed_store_aborts_transaction() {
        use factd_core::{FactStore, Schema, TxOp, Value};

        let (backing, storage) = cache(64 * 1024, 16);
        let store = FactStore::open(Arc::new(storage), Schema::new()).unwrap();
        store
            .transact(vec![TxOp::entity([("block/name", Value::str("kept"))])], None)
            .unwrap();

        backing.reject_writes(true);
        let err = store
            .transact(vec![TxOp::entity([("block/name", Value::str("lost"))])], None)
            .unwrap_err();
        assert!(err.is_storage());
        backing.reject_writes(false);

        let names = store
            .query("[:find [?n ...] :where [?e :block/name ?n]]", &[])
            .unwrap();
        assert_eq!(names, Value::Vec(vec![Value::str("kept")]));
        assert_eq!(store.stats().datoms, 1);
    }

    #[test]
    fn test_missing_page() {
        let (_backing, storage) = cache(1024, 4);
        assert!(matches!(storage.restore(42), Err(StorageError::NotFound(42))));
    }

    #[test]
    fn test_delete_all_clears_cache() {
        let (backing, storage) = cache(1024, 4);
        for addr in 0..3u64 {
            storage.store(addr, page(addr, 10)).unwrap();
        }
        storage.delete(&[1]).unwrap();
        assert_eq!(storage.list_addresses().unwrap(), vec![0, 2]);
        assert!(!storage.is_resident(1));
        storage.delete_all().unwrap();
        assert!(backing.is_empty());
        assert_eq!(storage.stats().resident_bytes, 0);
    }

    #[test]
    fn test_concurrent_restore_and_store() {
        let (_backing, storage) = cache(2048, 8);
        let storage = Arc::new(storage);
        for addr in 0..32u64 {
            storage.store(addr, page(addr, 64)).unwrap();
        }
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let storage = storage.clone();
            handles.push(std::thread::spawn(move || {
                for round in 0..200u64 {
                    let addr = (t * 7 + round) % 32;
                    if round % 5 == 0 {
                        storage.store(addr, page(addr, 64)).unwrap();
                    } else {
                        assert_eq!(&*storage.restore(addr).unwrap(), &page(addr, 64)[..]);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(storage.stats().resident_bytes <= 2048);
    }
}
