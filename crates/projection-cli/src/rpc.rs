//! JSON-RPC access to the upstream node via an Alloy provider.
//!
//! Maps Alloy RPC blocks and receipts to the projection's chain input types.
//! Standard RPC exposes no per-transaction state diffs, so receipts fetched
//! here carry no state changes.

use std::sync::Arc;

use alloy::consensus::{Transaction as _, Typed2718 as _};
use alloy::network::Ethereum;
use alloy::primitives::B256;
use alloy::providers::fillers::FillProvider;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::eth::{Block, BlockId, BlockNumberOrTag, Transaction, TransactionReceipt};
use eyre::{eyre, Context, Result};
use projection_data::{ChainHeader, ChainLog, ChainReceipt, ChainTransaction};
use projection_engine::ChainHandle;
use tokio::runtime::Handle;

type ProviderType = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider<Ethereum>,
>;

/// Upstream node reached over HTTP JSON-RPC. Cheap to clone.
#[derive(Clone)]
pub struct RpcChain {
    provider: Arc<ProviderType>,
}

impl RpcChain {
    /// Connects and verifies the endpoint with `eth_blockNumber`.
    ///
    /// # Errors
    /// Returns error if the URL is malformed or the node is unreachable.
    #[tracing::instrument(skip_all, fields(rpc_url = %rpc_url))]
    pub async fn connect(rpc_url: &str) -> Result<Self> {
        let provider =
            ProviderBuilder::new().on_http(rpc_url.parse().wrap_err("invalid RPC URL format")?);
        let provider = Arc::new(provider);

        let latest_block = provider
            .get_block_number()
            .await
            .wrap_err("failed to test RPC connectivity with eth_blockNumber")?;

        tracing::info!(rpc_url = %rpc_url, latest_block, "RPC connection successful");
        Ok(Self { provider })
    }

    pub async fn latest_number(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .wrap_err("failed to fetch latest block number")
    }

    pub async fn header_by_number(&self, number: u64) -> Result<Option<ChainHeader>> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await
            .wrap_err_with(|| format!("failed to fetch block {number}"))?;
        Ok(block.map(|block| chain_header(&block)))
    }

    pub async fn header_by_hash(&self, hash: B256) -> Result<Option<ChainHeader>> {
        let block = self
            .provider
            .get_block_by_hash(hash)
            .await
            .wrap_err_with(|| format!("failed to fetch block {hash}"))?;
        Ok(block.map(|block| chain_header(&block)))
    }

    /// Header at the node's `finalized` tag, if the node reports one.
    pub async fn finalized_header(&self) -> Result<Option<ChainHeader>> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Finalized)
            .await
            .wrap_err("failed to fetch finalized block")?;
        Ok(block.map(|block| chain_header(&block)))
    }

    /// Receipts of the block with `hash`, joined with their transactions.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_receipts(&self, hash: B256) -> Result<Option<Vec<ChainReceipt>>> {
        let (block, receipts) = futures::try_join!(
            async {
                self.provider
                    .get_block_by_hash(hash)
                    .full()
                    .await
                    .wrap_err_with(|| format!("failed to fetch block {hash}"))
            },
            async {
                self.provider
                    .get_block_receipts(BlockId::Hash(hash.into()))
                    .await
                    .wrap_err_with(|| format!("failed to fetch receipts of block {hash}"))
            },
        )?;

        let (Some(block), Some(receipts)) = (block, receipts) else {
            tracing::debug!(%hash, "block not found");
            return Ok(None);
        };
        let transactions = block
            .transactions
            .as_transactions()
            .ok_or_else(|| eyre!("node returned transaction hashes for a full block request"))?;
        if transactions.len() != receipts.len() {
            return Err(eyre!(
                "block {hash} has {} transactions but {} receipts",
                transactions.len(),
                receipts.len()
            ));
        }

        transactions
            .iter()
            .zip(&receipts)
            .enumerate()
            .map(|(position, (tx, receipt))| chain_receipt(position as u64, tx, receipt))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}

impl ChainHandle for RpcChain {
    /// Blocks the current worker thread; requires the multi-threaded runtime.
    fn receipts(&self, hash: B256) -> Result<Option<Vec<ChainReceipt>>> {
        tokio::task::block_in_place(|| Handle::current().block_on(self.fetch_receipts(hash)))
    }
}

fn chain_header(block: &Block) -> ChainHeader {
    ChainHeader::new_unchecked(block.header.hash, block.header.inner.clone())
}

fn chain_receipt(
    position: u64,
    tx: &Transaction,
    receipt: &TransactionReceipt,
) -> Result<ChainReceipt> {
    let hash = alloy::network::TransactionResponse::tx_hash(tx);
    if receipt.transaction_hash != hash {
        return Err(eyre!(
            "receipt {} does not belong to transaction {hash}",
            receipt.transaction_hash
        ));
    }

    let access_list = tx
        .access_list()
        .map(|list| {
            list.iter()
                .map(|item| (item.address, item.storage_keys.clone()))
                .collect()
        })
        .unwrap_or_default();

    let logs = receipt
        .inner
        .logs()
        .iter()
        .map(|log| {
            Ok(ChainLog {
                index: log
                    .log_index
                    .ok_or_else(|| eyre!("log of transaction {hash} has no index"))?,
                address: log.inner.address,
                topics: log.inner.data.topics().to_vec(),
                data: log.inner.data.data.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ChainReceipt {
        transaction: ChainTransaction {
            hash,
            from: alloy::network::TransactionResponse::from(tx),
            to: tx.to(),
            value: tx.value(),
            nonce: tx.nonce(),
            gas_limit: tx.gas_limit(),
            gas_price: receipt.effective_gas_price,
            max_fee_per_gas: tx.is_dynamic_fee().then(|| tx.max_fee_per_gas()),
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas(),
            input: tx.input().clone(),
            tx_type: tx.ty(),
            access_list,
        },
        transaction_index: receipt.transaction_index.unwrap_or(position),
        contract_address: receipt.contract_address,
        gas_used: receipt.gas_used,
        status: receipt.status(),
        blob_gas_used: receipt.blob_gas_used,
        blob_gas_price: receipt.blob_gas_price,
        error: None,
        logs,
        state_changes: Vec::new(),
    })
}
