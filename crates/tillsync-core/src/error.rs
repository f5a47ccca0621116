//! Error types for tillsync

use thiserror::Error;

/// Main error type for tillsync operations
#[derive(Error, Debug)]
pub enum TillError {
    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Remote delivery failure (network unreachable, rejection, timeout).
    /// Always treated as retryable by the queue and sync layers.
    #[error("Network error: {0}")]
    Network(String),

    /// Print destination is not one of the known set
    #[error("Invalid print destination: {0}")]
    InvalidDestination(String),

    /// Collection name does not map to a known collection
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// Order status name does not map to a known status
    #[error("Unknown order status: {0}")]
    UnknownStatus(String),

    /// Order was submitted without any items
    #[error("Order has no items")]
    EmptyOrder,

    /// Referenced order does not exist in the local store
    #[error("Order not found: {0}")]
    OrderNotFound(String),
}

/// Result type alias using TillError
pub type TillResult<T> = Result<T, TillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TillError::InvalidDestination("fax".to_string());
        assert_eq!(format!("{}", err), "Invalid print destination: fax");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let till_err: TillError = io_err.into();
        assert!(matches!(till_err, TillError::Io(_)));
    }
}
