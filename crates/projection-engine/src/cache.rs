//! Receipt lookups for recent blocks, keyed by block hash.
//!
//! Reorgs replay blocks that were usually just seen as heads; keeping their
//! receipts avoids a second round trip to the node.

use std::num::NonZeroUsize;
use std::sync::Arc;

use alloy::primitives::B256;
use lru::LruCache;
use projection_data::ChainReceipt;

pub struct ReceiptCache {
    entries: LruCache<B256, Arc<[ChainReceipt]>>,
}

impl ReceiptCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Returns cached receipts for `hash`, or calls `fetch` and caches a
    /// non-empty result. Fetch errors and misses are not cached.
    pub fn get_or_fetch<F>(
        &mut self,
        hash: B256,
        fetch: F,
    ) -> eyre::Result<Option<Arc<[ChainReceipt]>>>
    where
        F: FnOnce(B256) -> eyre::Result<Option<Vec<ChainReceipt>>>,
    {
        if let Some(hit) = self.entries.get(&hash) {
            tracing::trace!(%hash, "receipt cache hit");
            return Ok(Some(Arc::clone(hit)));
        }

        let Some(receipts) = fetch(hash)? else {
            return Ok(None);
        };
        let receipts: Arc<[ChainReceipt]> = receipts.into();
        if !receipts.is_empty() {
            self.entries.put(hash, Arc::clone(&receipts));
        }
        Ok(Some(receipts))
    }

    pub fn contains(&self, hash: &B256) -> bool {
        self.entries.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
