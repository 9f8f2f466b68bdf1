//! Error types for the storage crate.

use thiserror::Error;

use udfhost_core::CatalogError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage error types.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A row could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage/Database error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// No row for this function.
    #[error("Function not found: {0}")]
    NotFound(String),

    /// A row for this function already exists.
    #[error("Function already exists: {0}")]
    Duplicate(String),

    /// The transaction was already committed or aborted.
    #[error("Transaction is closed")]
    TransactionClosed,
}

// Convert to the catalog collaborator error
impl From<Error> for CatalogError {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => CatalogError::Storage(e.to_string()),
            Error::Serialization(s) => CatalogError::Corrupt(s),
            Error::Storage(s) => CatalogError::Storage(s),
            Error::NotFound(s) => CatalogError::NotFound(s),
            Error::Duplicate(s) => CatalogError::Duplicate(s),
            Error::TransactionClosed => CatalogError::NoTransaction,
        }
    }
}

// External error conversions
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        Error::Storage(format!("Redb error: {}", e))
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Storage(format!("Redb transaction error: {}", e))
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Storage(format!("Redb table error: {}", e))
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Storage(format!("Redb storage error: {}", e))
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Storage(format!("Redb commit error: {}", e))
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Storage(format!("Redb database error: {}", e))
    }
}
