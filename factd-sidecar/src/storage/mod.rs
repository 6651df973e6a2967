//! Page persistence for graphs.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  store / restore  ┌───────────────┐   put / get   ┌──────────────────┐
//! │  FactStore  │ ────────────────► │ CachedStorage │ ────────────► │  BackingStore     │
//! │ (factd-core)│                   │ (LRU, budget) │               │  RocksDB "pages"  │
//! └─────────────┘                   └───────────────┘               │  or in-memory     │
//!                                                                   └──────────────────┘
//! ```
//!
//! The fact store only sees [`PageStorage`](factd_core::PageStorage). The
//! cache keeps a bounded working set resident and goes to the backing store
//! on a miss, so a graph may be larger than the memory it is given.

pub mod memory;
pub mod plugin;
pub mod rocks;

use factd_core::Address;
use thiserror::Error;

pub use memory::MemoryBackingStore;
pub use plugin::{CacheConfig, CacheStats, CachedStorage};
pub use rocks::{RocksBackingStore, StoreConfig};

/// Backing store errors.
#[derive(Debug, Clone, Error)]
pub enum BackingError {
    #[error("database error: {0}")]
    Database(String),
    #[error("column family '{0}' not found")]
    MissingColumnFamily(&'static str),
    #[error("malformed key of {0} bytes")]
    MalformedKey(usize),
    #[error("write rejected: {0}")]
    WriteRejected(String),
    #[error("backing store lock poisoned")]
    Poisoned,
}

impl From<rocksdb::Error> for BackingError {
    fn from(e: rocksdb::Error) -> Self {
        BackingError::Database(e.to_string())
    }
}

/// Persistent key/value store mapping page addresses to bytes.
///
/// Every call may block on disk and must be made from the blocking pool.
pub trait BackingStore: Send + Sync {
    fn put(&self, address: Address, bytes: &[u8]) -> Result<(), BackingError>;

    fn get(&self, address: Address) -> Result<Option<Vec<u8>>, BackingError>;

    /// Every stored address, ascending.
    fn addresses(&self) -> Result<Vec<Address>, BackingError>;

    fn delete(&self, addresses: &[Address]) -> Result<(), BackingError>;

    fn delete_all(&self) -> Result<(), BackingError>;

    fn flush(&self) -> Result<(), BackingError>;
}

/// Page key: address as 8 bytes big-endian, so iteration is address order.
pub(crate) fn page_key(address: Address) -> [u8; 8] {
    address.to_be_bytes()
}

pub(crate) fn decode_page_key(key: &[u8]) -> Result<Address, BackingError> {
    let buf: [u8; 8] = key
        .try_into()
        .map_err(|_| BackingError::MalformedKey(key.len()))?;
    Ok(u64::from_be_bytes(buf))
}
