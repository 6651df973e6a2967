//! RocksDB-backed page store.
//!
//! One column family, `pages`, keyed by page address (8 bytes big-endian).
//! Pages arrive already compressed by the fact store, so the column family
//! runs without block compression.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};

use factd_core::Address;

use super::{decode_page_key, page_key, BackingError, BackingStore};

const CF_PAGES: &str = "pages";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// RocksDB block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false, the RocksDB WAL is still written)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("factd_data"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

/// RocksDB page store for one graph.
pub struct RocksBackingStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksBackingStore {
    /// Open (or create) the page database at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, BackingError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let descriptor = ColumnFamilyDescriptor::new(CF_PAGES, Self::cf_options(&config));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![descriptor],
        )?;
        log::info!("Opened page store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Leaves are lz4 frames already
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts.disable_wal(false);
        write_opts
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, BackingError> {
        self.db
            .cf_handle(CF_PAGES)
            .ok_or(BackingError::MissingColumnFamily(CF_PAGES))
    }
}

impl BackingStore for RocksBackingStore {
    fn put(&self, address: Address, bytes: &[u8]) -> Result<(), BackingError> {
        let cf = self.cf()?;
        self.db
            .put_cf_opt(cf, page_key(address), bytes, &self.write_options())?;
        Ok(())
    }

    fn get(&self, address: Address) -> Result<Option<Vec<u8>>, BackingError> {
        let cf = self.cf()?;
        Ok(self.db.get_cf(cf, page_key(address))?)
    }

    fn addresses(&self) -> Result<Vec<Address>, BackingError> {
        let cf = self.cf()?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            out.push(decode_page_key(&key)?);
        }
        Ok(out)
    }

    fn delete(&self, addresses: &[Address]) -> Result<(), BackingError> {
        if addresses.is_empty() {
            return Ok(());
        }
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        for address in addresses {
            batch.delete_cf(cf, page_key(*address));
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn delete_all(&self) -> Result<(), BackingError> {
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        let mut count = 0usize;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(cf, &key);
            count += 1;
        }
        if count > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        log::info!(
            "Deleted {count} pages from {}",
            self.config.path.display()
        );
        Ok(())
    }

    fn flush(&self) -> Result<(), BackingError> {
        self.db.flush_wal(true)?;
        let cf = self.cf()?;
        self.db.flush_cf(cf)?;
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksBackingStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksBackingStore::open(StoreConfig::for_testing(dir.path().join("pages"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open_close() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.addresses().unwrap().is_empty());
    }

    #[test]
    fn test_put_get() {
        let (_dir, store) = open_temp();
        store.put(7, b"leaf bytes").unwrap();
        assert_eq!(store.get(7).unwrap().as_deref(), Some(&b"leaf bytes"[..]));
        assert_eq!(store.get(8).unwrap(), None);
    }

    #[test]
    fn test_addresses_in_order() {
        let (_dir, store) = open_temp();
        for addr in [300u64, 0, 2, 256, 1] {
            store.put(addr, &[addr as u8]).unwrap();
        }
        assert_eq!(store.addresses().unwrap(), vec![0, 1, 2, 256, 300]);
    }

    #[test]
    fn test_delete_and_delete_all() {
        let (_dir, store) = open_temp();
        for addr in 0..10u64 {
            store.put(addr, &[0u8; 32]).unwrap();
        }
        store.delete(&[3, 4, 99]).unwrap();
        assert_eq!(store.addresses().unwrap().len(), 8);
        store.delete_all().unwrap();
        assert!(store.addresses().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages");
        {
            let store = RocksBackingStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.put(0, b"root").unwrap();
            store.put(1, b"leaf").unwrap();
            store.flush().unwrap();
        }
        let store = RocksBackingStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.get(0).unwrap().as_deref(), Some(&b"root"[..]));
        assert_eq!(store.addresses().unwrap(), vec![0, 1]);
    }
}
