use std::time::Duration;
use thiserror::Error;

use factd_core::CoreError;

use crate::protocol::{ErrorType, Outcome, ProtocolError};
use crate::storage::BackingError;

/// Errors surfaced by the sidecar, on either end of a connection.
#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("graph not found: {0}")]
    GraphNotFound(String),
    #[error("graph {0} is closing")]
    GraphClosed(String),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("backing store: {0}")]
    Backing(#[from] BackingError),
    #[error("{0}")]
    Application(String),
    /// Failure reported by the other end.
    #[error("{error_type}: {message}")]
    Remote {
        error_type: ErrorType,
        message: String,
    },
}

impl SidecarError {
    /// Stable class reported on the wire.
    pub fn error_type(&self) -> ErrorType {
        match self {
            SidecarError::Connection(_) | SidecarError::ConnectionClosed => ErrorType::Connection,
            SidecarError::Timeout(_) => ErrorType::Timeout,
            SidecarError::Protocol(ProtocolError::UnknownOp(_)) => ErrorType::UnknownOp,
            SidecarError::Protocol(_) => ErrorType::Protocol,
            SidecarError::GraphNotFound(_) | SidecarError::GraphClosed(_) => {
                ErrorType::GraphNotFound
            }
            SidecarError::Core(e) if e.is_storage() => ErrorType::Storage,
            SidecarError::Core(_) | SidecarError::Application(_) => ErrorType::Application,
            SidecarError::Backing(_) => ErrorType::Storage,
            SidecarError::Remote { error_type, .. } => *error_type,
        }
    }

    pub fn to_outcome(&self) -> Outcome {
        Outcome::Err {
            message: self.to_string(),
            error_type: self.error_type(),
        }
    }
}

impl From<std::io::Error> for SidecarError {
    fn from(e: std::io::Error) -> Self {
        SidecarError::Connection(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SidecarError {
    fn from(e: tokio::task::JoinError) -> Self {
        SidecarError::Application(format!("task failed: {e}"))
    }
}

pub type SidecarResult<T> = Result<T, SidecarError>;

#[cfg(test)]
mod tests {
    use super::*;
    use factd_core::StorageError;

    #[test]
    fn test_error_tags() {
        let cases = [
            (SidecarError::ConnectionClosed, "connection"),
            (SidecarError::Timeout(Duration::from_millis(5)), "timeout"),
            (
                SidecarError::Protocol(ProtocolError::InvalidFrame("x".into())),
                "protocol",
            ),
            (
                SidecarError::Protocol(ProtocolError::UnknownOp("x".into())),
                "unknown-op",
            ),
            (
                SidecarError::Core(CoreError::Storage(StorageError::NotFound(3))),
                "storage",
            ),
            (SidecarError::Core(CoreError::UnknownEntity(9)), "application"),
            (SidecarError::GraphNotFound("g".into()), "graph-not-found"),
        ];
        for (err, tag) in cases {
            assert_eq!(err.error_type().as_str(), tag, "{err}");
        }
    }

    #[test]
    fn test_outcome_carries_message() {
        let Outcome::Err {
            message,
            error_type,
        } = SidecarError::GraphNotFound("notes".into()).to_outcome()
        else {
            panic!("expected error outcome");
        };
        assert_eq!(error_type, ErrorType::GraphNotFound);
        assert!(message.contains("notes"));
    }
}
