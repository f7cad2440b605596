//! Polling driver that turns a JSON-RPC node into head, reorg and finality
//! events for the projection engine.
//!
//! Each poll walks from the projection's tip to the node's latest block. A
//! block whose parent hash disagrees with the projection starts a reorg: the
//! new branch is walked back by parent hash until it meets a stored block,
//! and everything above that ancestor is replaced in one transaction.

use std::time::Duration;

use alloy::primitives::B256;
use eyre::{eyre, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use projection_data::{BlockRef, ChainHeader};
use projection_engine::{HeadOutcome, ProjectionEngine, ProjectionError};

use crate::rpc::RpcChain;

#[derive(Clone, Debug)]
pub struct FollowOptions {
    pub poll_interval: Duration,
    /// First block to project when the database is empty. Defaults to the
    /// node's latest block.
    pub from: Option<u64>,
    /// Deepest reorg followed before giving up.
    pub max_reorg_depth: usize,
}

/// Blocks written by one poll.
#[derive(Clone, Copy, Debug, Default)]
struct PollProgress {
    heads: usize,
    reorgs: usize,
    tip: Option<u64>,
    finalized: Option<u64>,
}

/// Follows the chain until ctrl-c or a fatal projection error, then closes the engine.
pub async fn run(
    engine: &mut ProjectionEngine<RpcChain>,
    chain: &RpcChain,
    opts: &FollowOptions,
) -> Result<()> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .wrap_err("failed to create progress style")?,
    );
    pb.set_message("waiting for first poll");
    pb.enable_steady_tick(Duration::from_millis(100));

    let mut interval = tokio::time::interval(opts.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut totals = PollProgress::default();

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, stopping");
                break Ok(());
            }
            _ = interval.tick() => {}
        }

        match poll_once(engine, chain, opts).await {
            Ok(progress) => {
                totals.heads += progress.heads;
                totals.reorgs += progress.reorgs;
                totals.tip = progress.tip.or(totals.tip);
                totals.finalized = progress.finalized.or(totals.finalized);
                pb.set_message(format!(
                    "tip {} | finalized {} | {} heads | {} reorgs",
                    display_number(totals.tip),
                    display_number(totals.finalized),
                    totals.heads,
                    totals.reorgs,
                ));
            }
            Err(err) if is_fatal(&err) => break Err(err),
            Err(err) => tracing::warn!(error = %err, "poll failed; retrying next tick"),
        }
    };

    pb.finish_with_message(format!(
        "stopped at tip {} ({} heads, {} reorgs)",
        display_number(totals.tip),
        totals.heads,
        totals.reorgs
    ));
    engine.on_close().wrap_err("failed to close projection")?;
    result
}

async fn poll_once(
    engine: &mut ProjectionEngine<RpcChain>,
    chain: &RpcChain,
    opts: &FollowOptions,
) -> Result<PollProgress> {
    let latest = chain.latest_number().await?;
    let mut progress = PollProgress::default();

    let mut next = match engine.store()?.latest_block()? {
        Some(tip) => tip + 1,
        None => opts.from.unwrap_or(latest),
    };

    while next <= latest {
        let Some(header) = chain.header_by_number(next).await? else {
            tracing::debug!(number = next, "block not yet available");
            break;
        };

        let parent = match next.checked_sub(1) {
            Some(parent_number) => stored_hash(engine, parent_number)?,
            None => None,
        };
        match parent {
            Some(parent) if parent != header.parent_hash() => {
                next = reconcile(engine, chain, header, opts.max_reorg_depth).await? + 1;
                progress.reorgs += 1;
            }
            _ => {
                if engine.on_head(&header)? != HeadOutcome::AlreadyIndexed {
                    progress.heads += 1;
                }
                next += 1;
            }
        }
        progress.tip = Some(next - 1);
    }

    progress.finalized = sync_finalized(engine, chain).await?;
    Ok(progress)
}

/// Replaces the projection's branch with the one ending at `tip`. Returns the
/// new tip number.
async fn reconcile(
    engine: &mut ProjectionEngine<RpcChain>,
    chain: &RpcChain,
    tip: ChainHeader,
    max_depth: usize,
) -> Result<u64> {
    let tip_number = tip.number();
    let mut branch = vec![tip];

    while let Some(lowest) = branch.last() {
        let Some(parent_number) = lowest.number().checked_sub(1) else {
            break;
        };
        match stored_hash(engine, parent_number)? {
            Some(stored) if stored == lowest.parent_hash() => break,
            None => break,
            Some(_) => {}
        }
        if branch.len() >= max_depth {
            return Err(eyre!(
                "reorg at block {tip_number} is deeper than {max_depth} blocks"
            ));
        }

        let parent_hash = lowest.parent_hash();
        let parent = chain
            .header_by_hash(parent_hash)
            .await?
            .ok_or_else(|| eyre!("node does not know parent block {parent_hash}"))?;
        branch.push(parent);
    }
    branch.reverse();

    let pivot = branch.first().map_or(tip_number, ChainHeader::number);
    let stored_tip = engine.store()?.latest_block()?.unwrap_or(pivot);
    let mut old = Vec::new();
    for number in pivot..=stored_tip {
        if let Some(hash) = stored_hash(engine, number)? {
            old.push(BlockRef { number, hash });
        }
    }

    if old.is_empty() {
        for header in &branch {
            engine.on_head(header)?;
        }
    } else {
        tracing::warn!(pivot, depth = old.len(), new = branch.len(), "chain reorganized");
        engine.on_reorg(&old, &branch)?;
    }
    Ok(tip_number)
}

/// Marks the node's finalized block when the projection holds the same block.
async fn sync_finalized(
    engine: &mut ProjectionEngine<RpcChain>,
    chain: &RpcChain,
) -> Result<Option<u64>> {
    let Some(finalized) = chain.finalized_header().await? else {
        return Ok(None);
    };
    let number = finalized.number();

    let stored_final = engine.store()?.latest_finalized()?;
    if stored_final.is_some_and(|stored| stored >= number) {
        return Ok(stored_final);
    }
    if stored_hash(engine, number)? != Some(finalized.hash()) {
        tracing::debug!(number, "finalized block not projected yet");
        return Ok(stored_final);
    }

    engine.on_final(&finalized)?;
    Ok(Some(number))
}

fn stored_hash(engine: &ProjectionEngine<RpcChain>, number: u64) -> Result<Option<B256>> {
    engine
        .store()?
        .block_by_number(number)?
        .map(|block| {
            block
                .hash
                .parse::<B256>()
                .wrap_err_with(|| format!("stored hash of block {number} is malformed"))
        })
        .transpose()
}

fn is_fatal(err: &eyre::Report) -> bool {
    err.downcast_ref::<ProjectionError>()
        .is_some_and(ProjectionError::is_fatal)
}

fn display_number(number: Option<u64>) -> String {
    number.map_or_else(|| "-".to_string(), |n| n.to_string())
}
