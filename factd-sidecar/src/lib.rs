//! # factd-sidecar — Fact store sidecar process
//!
//! Hosts named fact graphs for an authoritative peer and answers its
//! queries over a framed TCP protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    framed TCP     ┌───────────────┐
//! │ SidecarClient    │ ◄───────────────► │ SidecarServer │
//! │ (authoritative)  │  request/response │               │
//! │ SyncProducer     │  + push events    └───────┬───────┘
//! └──────────────────┘                           │
//!                                        ┌───────┴───────┐
//!                                        │  Dispatcher   │
//!                                        └───────┬───────┘
//!                                                ▼
//!                                        ┌───────────────┐
//!                                        │ GraphRegistry │──► EventBus
//!                                        └───────┬───────┘
//!                                                ▼
//!                          Graph: TxQueue ─ FactStore ─ CachedStorage
//!                                                          │
//!                                                   RocksDB / memory
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Framing and bincode-encoded messages and operations
//! - [`transport`] — One framed connection: correlation, timeouts, pushes
//! - [`storage`] — LRU page cache over a backing store
//! - [`queue`] — Per-graph serialized transaction queue
//! - [`registry`] — Named graphs, opened on demand
//! - [`dispatcher`] — Routes operations to graphs
//! - [`sync`] — Batched fact sync from the authoritative peer
//! - [`events`] — Push events fanned out to every connection
//! - [`server`] — TCP server
//! - [`client`] — Client with typed operations

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod server;
pub mod storage;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use client::{ClientConfig, ConnectionState, SidecarClient};
pub use dispatcher::{DispatchStats, Dispatcher};
pub use error::{SidecarError, SidecarResult};
pub use events::{Event, EventBus, EventStats};
pub use protocol::{
    ErrorType, FrameDecoder, GraphOptions, Message, Op, Outcome, ProtocolError, Push, Request,
    Response, TxItem, PROTOCOL_VERSION,
};
pub use queue::{QueueStats, TxQueue};
pub use registry::{Graph, GraphRegistry, GraphStats, RegistryConfig, SyncProgress};
pub use server::{ServerConfig, ServerStats, SidecarServer};
pub use storage::{
    BackingError, BackingStore, CacheConfig, CacheStats, CachedStorage, MemoryBackingStore,
    RocksBackingStore, StoreConfig,
};
pub use sync::{SyncProducer, SyncReceipt, SyncSummary, DEFAULT_BATCH_SIZE};
pub use transport::{Connection, RequestHandler, TransportConfig};
