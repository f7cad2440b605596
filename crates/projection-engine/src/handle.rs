use std::collections::HashMap;

use alloy::primitives::B256;
use projection_data::ChainReceipt;

/// Source of execution receipts for blocks the engine is asked to project.
///
/// Blocking: the engine calls it on the thread delivering the event.
pub trait ChainHandle {
    /// Receipts of the block with `hash`, in transaction order, or `None`
    /// if the node does not know the block.
    fn receipts(&self, hash: B256) -> eyre::Result<Option<Vec<ChainReceipt>>>;
}

/// In-memory receipt source keyed by block hash.
impl ChainHandle for HashMap<B256, Vec<ChainReceipt>> {
    fn receipts(&self, hash: B256) -> eyre::Result<Option<Vec<ChainReceipt>>> {
        Ok(self.get(&hash).cloned())
    }
}
