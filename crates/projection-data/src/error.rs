//! Error types for the storage gateway and record derivation.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors returned by [`Store`](crate::store::Store) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database was busy or locked; the operation may succeed if retried.
    #[error("transient storage failure: {0}")]
    Transient(#[source] rusqlite::Error),

    /// A primary, unique or foreign key constraint rejected the write.
    #[error("constraint violation: {0}")]
    ConstraintViolation(#[source] rusqlite::Error),

    /// A delete range reached a finalized block.
    #[error("block {finalized} is finalized; refusing to delete range starting at {from}")]
    FinalizedBlockProtected { from: u64, finalized: u64 },

    /// The referenced block is not in the projection.
    #[error("block {number} not found")]
    NotFound { number: u64 },

    /// The database schema does not match this build; run `migrate`.
    #[error("schema version {found} does not match required version {expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    /// A list column could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),
}

impl StoreError {
    /// Returns `true` if retrying the whole unit of work may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub const fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => Self::Transient(err),
            Some(ErrorCode::ConstraintViolation) => Self::ConstraintViolation(err),
            _ => Self::Sqlite(err),
        }
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Malformed chain input. A contract violation by the caller; nothing is derived.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DerivationError {
    #[error("block number {0} exceeds the storable range")]
    NumberOutOfRange(u64),

    #[error("receipt at position {position} in block {block} claims transaction index {claimed}")]
    ReceiptIndexMismatch {
        block: u64,
        position: usize,
        claimed: u64,
    },

    #[error("log index {index} appears twice in block {block}")]
    DuplicateLogIndex { block: u64, index: u64 },

    #[error("transaction {hash} appears twice in block {block}")]
    DuplicateTransaction { block: u64, hash: String },
}
