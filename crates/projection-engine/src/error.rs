use alloy::primitives::B256;
use projection_data::{DerivationError, StoreError};
use thiserror::Error;

/// Errors surfaced by [`ProjectionEngine`](crate::engine::ProjectionEngine).
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("malformed block input: {0}")]
    Derivation(#[from] DerivationError),

    /// The chain handle has no receipts for this block.
    #[error("receipts unavailable for block {number} ({hash})")]
    ReceiptsUnavailable { number: u64, hash: B256 },

    /// The chain handle failed while fetching receipts.
    #[error("failed to fetch receipts for block {hash}: {source}")]
    ReceiptFetch {
        hash: B256,
        #[source]
        source: eyre::Report,
    },

    #[error("reorg needs both old and new blocks (old: {old}, new: {new})")]
    EmptyReorg { old: usize, new: usize },

    /// Finality was signalled for a hash other than the one committed at that height.
    #[error("finalized block {number} has hash {announced}, projection holds {stored}")]
    FinalizedHashMismatch {
        number: u64,
        announced: B256,
        stored: String,
    },

    /// A head arrived before `on_init`.
    #[error("engine has no chain handle; on_init was not called")]
    NotInitialized,

    #[error("engine is closed")]
    Closed,
}

impl ProjectionError {
    /// Returns `true` when retrying the same event may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_transient())
    }

    /// Returns `true` for errors that mean the upstream contract was broken:
    /// finality violations and malformed input. Callers should stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::FinalizedBlockProtected { .. })
                | Self::FinalizedHashMismatch { .. }
                | Self::Derivation(_)
        )
    }
}

pub type ProjectionResult<T> = Result<T, ProjectionError>;
