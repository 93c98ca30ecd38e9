//! Error types for dersync

use thiserror::Error;

/// Main error type for dersync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Record was not found in the local store
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Plaintext could not be parsed into record fields
    #[error("Decode error: {0}")]
    Decode(String),

    /// No identity path could open a ciphertext
    #[error("Unseal failed: {0}")]
    Unseal(String),

    /// Remote store could not be reached or did not answer in time
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Remote store refused the caller
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Remote store answered with something we could not interpret
    #[error("Remote protocol error: {0}")]
    RemoteProtocol(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

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

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Identity-related error (keys, signatures)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Invalid DID format
    #[error("Invalid DID format: {0}")]
    InvalidDid(String),

    /// Broadcast medium error
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// Endpoint could not be bound or served
    #[error("Network error: {0}")]
    Network(String),

    /// Configuration could not be loaded
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Whether a background pass should log and swallow this error.
    ///
    /// Transient errors leave local state untouched and are retried by the
    /// next scheduled pass. Everything else is surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteUnavailable(_) | SyncError::Broadcast(_) | SyncError::Unseal(_)
        )
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::RecordNotFound("01HX".to_string());
        assert_eq!(format!("{}", err), "Record not found: 01HX");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::RemoteUnavailable("timeout".into()).is_transient());
        assert!(!SyncError::PermissionDenied("read-only".into()).is_transient());
        assert!(!SyncError::Decode("bad".into()).is_transient());
    }
}
