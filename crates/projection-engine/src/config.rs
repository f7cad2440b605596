use std::num::NonZeroUsize;

use projection_data::StoreConfig;

use crate::retry::RetryPolicy;

/// Number of recent blocks whose receipts are kept in memory.
pub const DEFAULT_RECEIPT_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(32) {
    Some(capacity) => capacity,
    None => unreachable!(),
};

/// Engine settings.
#[derive(Clone, Debug)]
pub struct ProjectionConfig {
    pub receipt_cache_capacity: NonZeroUsize,
    /// Applied to every per-event transaction.
    pub retry: RetryPolicy,
    pub store: StoreConfig,
    /// Capacity of the event broadcast channel. Slow subscribers lag; writes never wait.
    pub event_capacity: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            receipt_cache_capacity: DEFAULT_RECEIPT_CACHE_CAPACITY,
            retry: RetryPolicy::default(),
            store: StoreConfig::default(),
            event_capacity: 256,
        }
    }
}
