//! # factd-core — embedded fact store
//!
//! A datom store with schema-driven transactions, Datalog queries and pull,
//! kept in paged copy-on-write indexes behind a pluggable page storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  transact / apply_datoms  ┌────────────┐
//! │  FactStore   │ ─────────────────────────► │  tx        │
//! │ (snapshot)   │                            │ (resolve)  │
//! └──────┬───────┘                            └─────┬──────┘
//!        │ query / pull / datoms                    │ inserts, removes
//!        ▼                                          ▼
//! ┌──────────────┐   leaves + root page     ┌──────────────┐
//! │  Db          │ ───────────────────────► │ PageStorage  │
//! │ EAVT AEVT AVET│                          │ (pluggable)  │
//! └──────────────┘                          └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`value`], [`datom`], [`schema`] — data model
//! - [`storage`] — page storage extension point
//! - [`page`] — leaf/root codec and paged indexes
//! - [`db`] — immutable snapshot
//! - [`tx`] — transaction data and resolution
//! - [`query`], [`pull`], [`edn`] — read languages
//! - [`store`] — the fact store

pub mod datom;
pub mod db;
pub mod edn;
pub mod error;
pub mod page;
pub mod pull;
pub mod query;
pub mod schema;
pub mod storage;
pub mod store;
pub mod tx;
pub mod value;

pub use datom::{Components, Datom, IndexKind};
pub use db::Db;
pub use error::{CoreError, CoreResult};
pub use pull::PullPattern;
pub use query::Query;
pub use schema::{AttrSpec, Cardinality, Schema, Unique, ValueType, DB_ID};
pub use storage::{Address, MemoryStorage, PageStorage, StorageError, ROOT_ADDRESS};
pub use store::{FactStore, StoreStats};
pub use tx::{EntityRef, TxOp, TxReport};
pub use value::{EntityId, Float, TxId, Value};
