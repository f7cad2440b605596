//! Change notifications published after each committed projection write.
//!
//! Delivery is best effort: a send with no subscribers is not an error, and
//! lagging subscribers miss events rather than slowing the writer.

use alloy::primitives::B256;
use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProjectionEvent {
    /// A block was written by a head event. `replaced` is set when a
    /// different block at the same height was removed first.
    HeadIndexed {
        number: u64,
        hash: B256,
        replaced: bool,
    },
    Finalized {
        number: u64,
        hash: B256,
    },
    /// Blocks from `pivot` upward were replaced by `applied` new blocks.
    Reorged {
        pivot: u64,
        removed: usize,
        applied: usize,
        new_head: u64,
    },
}

pub(crate) struct EventBus {
    tx: broadcast::Sender<ProjectionEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ProjectionEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn publish(&self, event: ProjectionEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("no event subscribers");
        }
    }
}
