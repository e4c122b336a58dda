//! Error types for the verso store
//!
//! Every fallible operation returns [`Result`], whose error type is
//! [`VersoError`]. The variants follow the failure classes a caller has to
//! tell apart: bad input, lost optimistic-concurrency races, structural
//! violations of the revision graph, migration failures and plain I/O.
//!
//! Lookups of unknown UUIDs are *not* errors; query methods return `None` or
//! an empty collection instead. The `*NotFound` variants are only raised when
//! a mutation references something that must exist.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::types::TransactionId;

/// Type alias for Results in the verso library
pub type Result<T> = std::result::Result<T, VersoError>;

/// Main error type for all store operations
#[derive(Debug, Error)]
pub enum VersoError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Caller supplied a malformed identifier or an impossible request
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A mutation referenced a persistent root that does not exist
    #[error("Persistent root not found: {0}")]
    PersistentRootNotFound(Uuid),

    /// A mutation referenced a branch that does not exist
    #[error("Branch not found: {0}")]
    BranchNotFound(Uuid),

    /// A mutation referenced a revision that does not exist
    #[error("Revision not found: {0}")]
    RevisionNotFound(Uuid),

    /// The persistent root changed since the transaction was prepared
    #[error(
        "Transaction conflict on persistent root {persistent_root}: \
         expected transaction id {expected}, store has {actual}"
    )]
    TransactionConflict {
        /// Persistent root whose token did not match
        persistent_root: Uuid,
        /// Transaction id the caller last observed
        expected: TransactionId,
        /// Transaction id currently recorded in the store
        actual: TransactionId,
    },

    /// A structural rule of the revision graph or catalog would be broken
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    /// A selective undo or redo collides with a later edit of the same item
    #[error("Selective undo conflict on item {item}: {reason}")]
    SelectiveUndoConflict {
        /// Item whose current state no longer matches the undone change
        item: Uuid,
        /// What did not match
        reason: String,
    },

    /// Undo track was deleted or never created
    #[error("Undo track not found: {0}")]
    UndoTrackNotFound(String),

    /// Recording into a read-only (pattern) track
    #[error("Undo track '{0}' is read-only")]
    ReadOnlyTrack(String),

    /// No migration registered for a required version step
    #[error("No migration registered for package '{package}' to version {version}")]
    MigrationMissing {
        /// Package that needs migrating
        package: String,
        /// Version the missing step would produce
        version: u32,
    },

    /// A migration step failed or produced nonconforming output
    #[error("Migration failed for package '{package}': {reason}")]
    MigrationFailed {
        /// Package being migrated
        package: String,
        /// Failure description
        reason: String,
    },

    /// Migration steps depend on each other in a cycle
    #[error("Circular migration dependency: {0}")]
    CircularDependency(String),

    /// Compression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Decompression errors
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Corruption detected while reading or verifying payloads
    #[error("Corruption detected: {0}")]
    CorruptionDetected(String),

    /// Hash mismatch during verification
    #[error("Hash mismatch - expected: {expected}, actual: {actual}")]
    HashMismatch {
        /// Expected hash value
        expected: String,
        /// Actual computed hash value
        actual: String,
    },

    /// Store is not initialized
    #[error("Store not initialized at path: {0:?}")]
    StorageNotInitialized(PathBuf),

    /// Store already exists
    #[error("Store already exists at path: {0:?}")]
    StorageAlreadyExists(PathBuf),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error")]
    WalkDir(#[from] walkdir::Error),

    /// Invalid glob pattern for a pattern track
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversions for bincode 2.0 error types
impl From<bincode::error::DecodeError> for VersoError {
    fn from(err: bincode::error::DecodeError) -> Self {
        VersoError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for VersoError {
    fn from(err: bincode::error::EncodeError) -> Self {
        VersoError::Bincode(err.to_string())
    }
}

impl From<globset::Error> for VersoError {
    fn from(err: globset::Error) -> Self {
        VersoError::InvalidPattern(err.to_string())
    }
}

impl VersoError {
    /// Create an invalid-argument error with a custom message
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        VersoError::InvalidArgument(msg.into())
    }

    /// Create a consistency-violation error with a custom message
    pub fn consistency(msg: impl Into<String>) -> Self {
        VersoError::ConsistencyViolation(msg.into())
    }

    /// Create a compression error with a custom message
    pub fn compression(msg: impl Into<String>) -> Self {
        VersoError::Compression(msg.into())
    }

    /// Create a decompression error with a custom message
    pub fn decompression(msg: impl Into<String>) -> Self {
        VersoError::Decompression(msg.into())
    }

    /// Create a migration failure for `package`
    pub fn migration(package: impl Into<String>, reason: impl Into<String>) -> Self {
        VersoError::MigrationFailed {
            package: package.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        VersoError::Internal(msg.into())
    }

    /// Check if this error is recoverable
    ///
    /// A transaction conflict means the caller's view is stale; reloading
    /// and rebuilding the transaction is expected to succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VersoError::TransactionConflict { .. } | VersoError::SelectiveUndoConflict { .. }
        )
    }

    /// Check if this error names a missing root, branch or revision
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VersoError::PersistentRootNotFound(_)
                | VersoError::BranchNotFound(_)
                | VersoError::RevisionNotFound(_)
                | VersoError::UndoTrackNotFound(_)
        )
    }

    /// Check if this error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            VersoError::CorruptionDetected(_)
                | VersoError::HashMismatch { .. }
                | VersoError::Decompression(_)
                | VersoError::Bincode(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            VersoError::TransactionConflict { persistent_root, .. } => {
                format!(
                    "Persistent root {} was modified by another writer. Reload and try again.",
                    persistent_root
                )
            }
            VersoError::PersistentRootNotFound(uuid) => {
                format!("Persistent root '{}' not found. Use 'verso list' to see available roots.", uuid)
            }
            VersoError::StorageNotInitialized(path) => {
                format!("Store not initialized at {:?}. Run 'verso init' first.", path)
            }
            VersoError::SelectiveUndoConflict { item, .. } => {
                format!(
                    "Item {} was changed after the edit being undone. Undo the later edit first.",
                    item
                )
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let uuid = Uuid::nil();
        let err = VersoError::RevisionNotFound(uuid);
        assert_eq!(err.to_string(), format!("Revision not found: {}", uuid));
    }

    #[test]
    fn test_error_recoverable() {
        let err = VersoError::TransactionConflict {
            persistent_root: Uuid::new_v4(),
            expected: TransactionId(5),
            actual: TransactionId(6),
        };
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("expected transaction id 5"));
        assert!(!VersoError::CorruptionDetected("test".to_string()).is_recoverable());
    }

    #[test]
    fn test_error_classification() {
        assert!(VersoError::HashMismatch {
            expected: "abc".to_string(),
            actual: "def".to_string(),
        }
        .is_corruption());
        assert!(!VersoError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "test")).is_corruption());
        assert!(VersoError::BranchNotFound(Uuid::new_v4()).is_not_found());
        assert!(!VersoError::invalid_argument("nil uuid").is_not_found());
    }
}
