//! Reorg-aware projection of chain events into the relational store.
//!
//! The engine receives the upstream node's events one at a time (`&mut self`
//! serializes delivery) and turns each into exactly one SQLite transaction:
//!
//! - `on_head`: derive and insert one block, or recognize it as already there.
//! - `on_final`: set the irrevocable finalized flag.
//! - `on_reorg`: delete everything from the pivot upward and replay the new
//!   branch, all or nothing.
//!
//! Receipts and derived records are prepared before a transaction opens, so
//! the write lock is held only for the inserts themselves.

use std::sync::Arc;

use alloy::hex;
use alloy::primitives::B256;
use projection_data::{
    derive_block, BlockGraph, BlockRef, ChainHeader, ChainReceipt, FinalizeOutcome, Store,
    StoreError,
};
use tokio::sync::broadcast;

use crate::cache::ReceiptCache;
use crate::config::ProjectionConfig;
use crate::error::{ProjectionError, ProjectionResult};
use crate::events::{EventBus, ProjectionEvent};
use crate::handle::ChainHandle;
use crate::retry::RetryPolicy;

/// What a head event did to the projection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadOutcome {
    /// New block written.
    Indexed,
    /// The same block was already committed; nothing written.
    AlreadyIndexed,
    /// A different block at the same height (and everything above it) was
    /// removed before writing.
    Replaced,
}

/// Summary of a committed reorg.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReorgOutcome {
    pub pivot: u64,
    /// Blocks deleted from `pivot` upward.
    pub removed: usize,
    /// New blocks written.
    pub applied: usize,
    /// New blocks below the pivot that were already committed.
    pub skipped: usize,
    pub new_head: u64,
}

pub struct ProjectionEngine<C> {
    store: Option<Store>,
    chain: Option<C>,
    cache: ReceiptCache,
    events: EventBus,
    retry: RetryPolicy,
}

impl<C: ChainHandle> ProjectionEngine<C> {
    /// Wraps an open store.
    ///
    /// # Errors
    /// Returns [`StoreError::SchemaMismatch`] if the store has not been
    /// migrated to this build's schema.
    pub fn new(store: Store, config: ProjectionConfig) -> ProjectionResult<Self> {
        store.ensure_schema_current()?;
        Ok(Self {
            store: Some(store),
            chain: None,
            cache: ReceiptCache::new(config.receipt_cache_capacity),
            events: EventBus::new(config.event_capacity),
            retry: config.retry,
        })
    }

    /// Opens the database at `path` and wraps it.
    pub fn open(path: &str, config: ProjectionConfig) -> ProjectionResult<Self> {
        let store = Store::open(path, &config.store)?;
        Self::new(store, config)
    }

    /// Registers the receipt source. Heads and reorgs fail until this is called.
    pub fn on_init(&mut self, chain: C) -> ProjectionResult<()> {
        let store = self.store.as_ref().ok_or(ProjectionError::Closed)?;
        tracing::info!(
            latest_block = ?store.latest_block()?,
            latest_finalized = ?store.latest_finalized()?,
            "projection initialized"
        );
        self.chain = Some(chain);
        Ok(())
    }

    /// Projects a new head block, fetching its receipts through the chain handle.
    ///
    /// # Errors
    /// Returns [`ProjectionError::NotInitialized`] before `on_init`, and
    /// [`ProjectionError::ReceiptsUnavailable`] if the node has no receipts
    /// for the block.
    #[tracing::instrument(skip_all, fields(number = header.number(), hash = %header.hash()))]
    pub fn on_head(&mut self, header: &ChainHeader) -> ProjectionResult<HeadOutcome> {
        if self.store.is_none() {
            return Err(ProjectionError::Closed);
        }
        let chain = self.chain.as_ref().ok_or(ProjectionError::NotInitialized)?;
        let receipts = fetch_receipts(&mut self.cache, chain, header)?;
        self.apply_head(header, &receipts)
    }

    /// Projects a head block with receipts supplied by the caller.
    pub fn apply_head(
        &mut self,
        header: &ChainHeader,
        receipts: &[ChainReceipt],
    ) -> ProjectionResult<HeadOutcome> {
        let graph = derive_block(header, receipts)?;
        let store = self.store.as_mut().ok_or(ProjectionError::Closed)?;

        let outcome = self.retry.run("head", || write_head(store, &graph))?;
        match outcome {
            HeadOutcome::AlreadyIndexed => {
                tracing::debug!(number = graph.number(), "head already indexed");
            }
            HeadOutcome::Indexed | HeadOutcome::Replaced => {
                tracing::info!(
                    number = graph.number(),
                    txs = graph.transactions.len(),
                    logs = graph.logs.len(),
                    replaced = outcome == HeadOutcome::Replaced,
                    "indexed head"
                );
                self.events.publish(ProjectionEvent::HeadIndexed {
                    number: header.number(),
                    hash: header.hash(),
                    replaced: outcome == HeadOutcome::Replaced,
                });
            }
        }
        Ok(outcome)
    }

    /// Marks a committed block finalized.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if the block was never indexed and
    /// [`ProjectionError::FinalizedHashMismatch`] if a different block holds
    /// that height.
    #[tracing::instrument(skip_all, fields(number = header.number(), hash = %header.hash()))]
    pub fn on_final(&mut self, header: &ChainHeader) -> ProjectionResult<FinalizeOutcome> {
        let store = self.store.as_mut().ok_or(ProjectionError::Closed)?;

        let result = self.retry.run("finalize", || write_final(store, header));
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error = %err, "failed to finalize block");
                return Err(err);
            }
        };

        if outcome == FinalizeOutcome::Marked {
            tracing::info!("block finalized");
            self.events.publish(ProjectionEvent::Finalized {
                number: header.number(),
                hash: header.hash(),
            });
        }
        Ok(outcome)
    }

    /// Replaces the blocks in `old` with the branch in `new`, atomically.
    ///
    /// The pivot is the lowest number in `old`. Every block at or above it is
    /// deleted, then `new` is inserted in ascending order. On any failure the
    /// projection is left exactly as it was.
    ///
    /// # Errors
    /// Returns [`ProjectionError::EmptyReorg`] if either list is empty and
    /// [`StoreError::FinalizedBlockProtected`] if the range reaches a
    /// finalized block.
    #[tracing::instrument(skip_all, fields(old = old.len(), new = new.len()))]
    pub fn on_reorg(
        &mut self,
        old: &[BlockRef],
        new: &[ChainHeader],
    ) -> ProjectionResult<ReorgOutcome> {
        let Some(pivot) = old.iter().map(|block| block.number).min() else {
            return Err(ProjectionError::EmptyReorg {
                old: old.len(),
                new: new.len(),
            });
        };
        if new.is_empty() {
            return Err(ProjectionError::EmptyReorg {
                old: old.len(),
                new: 0,
            });
        }
        if self.store.is_none() {
            return Err(ProjectionError::Closed);
        }
        let chain = self.chain.as_ref().ok_or(ProjectionError::NotInitialized)?;

        let mut branch: Vec<&ChainHeader> = new.iter().collect();
        branch.sort_by_key(|header| header.number());

        let mut graphs = Vec::with_capacity(branch.len());
        for header in branch {
            let receipts = fetch_receipts(&mut self.cache, chain, header)?;
            graphs.push(derive_block(header, &receipts)?);
        }

        let store = self.store.as_mut().ok_or(ProjectionError::Closed)?;
        let outcome = match self.retry.run("reorg", || write_reorg(store, pivot, &graphs)) {
            Ok(outcome) => outcome,
            Err(err @ ProjectionError::Store(StoreError::FinalizedBlockProtected { .. })) => {
                tracing::error!(pivot, error = %err, "reorg reaches a finalized block");
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        tracing::info!(
            pivot,
            removed = outcome.removed,
            applied = outcome.applied,
            skipped = outcome.skipped,
            new_head = outcome.new_head,
            "reorg applied"
        );
        self.events.publish(ProjectionEvent::Reorged {
            pivot,
            removed: outcome.removed,
            applied: outcome.applied,
            new_head: outcome.new_head,
        });
        Ok(outcome)
    }

    /// Closes the store. Safe to call repeatedly and before `on_init`.
    pub fn on_close(&mut self) -> ProjectionResult<()> {
        self.chain = None;
        if let Some(store) = self.store.take() {
            store.close()?;
            tracing::info!("projection closed");
        }
        Ok(())
    }

    /// Read access to the underlying store.
    pub fn store(&self) -> ProjectionResult<&Store> {
        self.store.as_ref().ok_or(ProjectionError::Closed)
    }

    /// Subscribes to change notifications for committed writes.
    pub fn subscribe(&self) -> broadcast::Receiver<ProjectionEvent> {
        self.events.subscribe()
    }
}

fn fetch_receipts<C: ChainHandle>(
    cache: &mut ReceiptCache,
    chain: &C,
    header: &ChainHeader,
) -> ProjectionResult<Arc<[ChainReceipt]>> {
    let hash = header.hash();
    cache
        .get_or_fetch(hash, |hash| chain.receipts(hash))
        .map_err(|source| ProjectionError::ReceiptFetch { hash, source })?
        .ok_or(ProjectionError::ReceiptsUnavailable {
            number: header.number(),
            hash,
        })
}

fn write_head(store: &mut Store, graph: &BlockGraph) -> ProjectionResult<HeadOutcome> {
    let tx = store.begin()?;

    let outcome = match tx.block_by_number(graph.number())? {
        Some(existing) if existing.hash == graph.hash() => return Ok(HeadOutcome::AlreadyIndexed),
        Some(existing) => {
            tracing::warn!(
                number = graph.number(),
                stored = %existing.hash,
                incoming = %graph.hash(),
                "head replaces a different block at the same height"
            );
            tx.delete_range(graph.number())?;
            HeadOutcome::Replaced
        }
        None => HeadOutcome::Indexed,
    };

    match tx.insert_block_graph(graph) {
        Ok(()) => {}
        Err(err) if err.is_constraint_violation() => {
            tx.rollback()?;
            // Only a concurrent writer that committed this exact block counts
            // as applied; any other conflict would drop the block.
            let stored = store.block_by_number(graph.number())?;
            if stored.is_some_and(|block| block.hash == graph.hash()) {
                tracing::warn!(
                    number = graph.number(),
                    hash = %graph.hash(),
                    error = %err,
                    "block was committed concurrently; treating head as applied"
                );
                return Ok(HeadOutcome::AlreadyIndexed);
            }
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    }

    tx.commit()?;
    Ok(outcome)
}

fn write_final(store: &mut Store, header: &ChainHeader) -> ProjectionResult<FinalizeOutcome> {
    let number = header.number();
    let tx = store.begin()?;

    let Some(block) = tx.block_by_number(number)? else {
        return Err(StoreError::NotFound { number }.into());
    };
    if block.hash != hex::encode_prefixed(header.hash()) {
        return Err(ProjectionError::FinalizedHashMismatch {
            number,
            announced: header.hash(),
            stored: block.hash,
        });
    }

    let outcome = tx.mark_finalized(number)?;
    tx.commit()?;
    Ok(outcome)
}

fn write_reorg(
    store: &mut Store,
    pivot: u64,
    graphs: &[BlockGraph],
) -> ProjectionResult<ReorgOutcome> {
    let tx = store.begin()?;
    let deletion = tx.delete_range(pivot)?;

    let mut applied = 0;
    let mut skipped = 0;
    for graph in graphs {
        if graph.number() < pivot {
            let existing = tx.block_by_number(graph.number())?;
            if existing.is_some_and(|block| block.hash == graph.hash()) {
                skipped += 1;
                continue;
            }
        }
        tx.insert_block_graph(graph)?;
        applied += 1;
    }

    tx.commit()?;
    Ok(ReorgOutcome {
        pivot,
        removed: deletion.blocks,
        applied,
        skipped,
        new_head: graphs.last().map_or(pivot, BlockGraph::number),
    })
}
