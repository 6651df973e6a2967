use thiserror::Error;

use crate::edn::EdnError;
use crate::storage::StorageError;
use crate::value::EntityId;

/// Errors raised by the fact store engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("unique conflict on {attr} = {value}: held by {existing}, asserted for {entity}")]
    UniqueConflict {
        attr: String,
        value: String,
        existing: EntityId,
        entity: EntityId,
    },
    #[error("unknown entity: {0}")]
    UnknownEntity(EntityId),
    #[error("lookup ref [{attr} {value}] did not resolve")]
    LookupNotFound { attr: String, value: String },
    #[error("invalid transaction: {0}")]
    InvalidTx(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("invalid pull pattern: {0}")]
    InvalidPull(String),
    #[error(transparent)]
    Edn(#[from] EdnError),
}

impl CoreError {
    /// Storage failures are fatal to the operation but not to the graph.
    pub fn is_storage(&self) -> bool {
        matches!(self, CoreError::Storage(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
