//! Record derivation: maps a sealed header and its receipts to the
//! relational records of one block.
//!
//! Pure and deterministic. The same input always produces identical
//! records, which keeps replays during reorg reconciliation idempotent.

use std::collections::HashSet;
use std::fmt::LowerHex;

use alloy::hex;

use crate::chain::{ChainHeader, ChainReceipt, StateDeltaKind};
use crate::error::DerivationError;
use crate::types::{
    AccessListRecord, AccountRecord, BlockGraph, BlockRecord, LogRecord, ReceiptRecord,
    StateChangeRecord, TransactionRecord,
};

/// Largest block number SQLite can store in an INTEGER column.
const MAX_STORABLE_NUMBER: u64 = i64::MAX as u64;

/// Derives the full record graph of one block.
///
/// Receipts must be in block order (`transaction_index` equal to position).
/// Logs are emitted sorted by their block-level index.
///
/// # Errors
/// Returns [`DerivationError`] if the input is malformed. No partial output
/// is produced.
pub fn derive_block(
    header: &ChainHeader,
    receipts: &[ChainReceipt],
) -> Result<BlockGraph, DerivationError> {
    let number = header.number();
    if number > MAX_STORABLE_NUMBER {
        return Err(DerivationError::NumberOutOfRange(number));
    }

    let block_hash = hex::encode_prefixed(header.hash());
    let mut seen_txs = HashSet::with_capacity(receipts.len());
    let mut seen_logs = HashSet::new();

    let mut transactions = Vec::with_capacity(receipts.len());
    let mut receipt_records = Vec::with_capacity(receipts.len());
    let mut logs = Vec::new();
    let mut access_lists = Vec::new();
    let mut state_changes = Vec::new();
    let mut accounts = Vec::new();

    for (position, receipt) in receipts.iter().enumerate() {
        if receipt.transaction_index != position as u64 {
            return Err(DerivationError::ReceiptIndexMismatch {
                block: number,
                position,
                claimed: receipt.transaction_index,
            });
        }

        let tx = &receipt.transaction;
        let tx_hash = hex::encode_prefixed(tx.hash);
        if !seen_txs.insert(tx.hash) {
            return Err(DerivationError::DuplicateTransaction {
                block: number,
                hash: tx_hash,
            });
        }

        transactions.push(transaction_record(number, receipt, &tx_hash));
        receipt_records.push(ReceiptRecord {
            block_number: number,
            block_hash: block_hash.clone(),
            transaction_hash: tx_hash.clone(),
            transaction_index: receipt.transaction_index,
            contract_address: receipt.contract_address.map(hex::encode_prefixed),
            gas_used: receipt.gas_used,
            status: receipt.status.into(),
        });

        for log in &receipt.logs {
            if !seen_logs.insert(log.index) {
                return Err(DerivationError::DuplicateLogIndex {
                    block: number,
                    index: log.index,
                });
            }
            logs.push(LogRecord {
                transaction_hash: tx_hash.clone(),
                block_number: number,
                address: hex::encode_prefixed(log.address),
                topics: log.topics.iter().map(hex::encode_prefixed).collect(),
                data: hex::encode_prefixed(&log.data),
                log_index: log.index,
                removed: false,
            });
        }

        for (address, keys) in &tx.access_list {
            let address = hex::encode_prefixed(address);
            if keys.is_empty() {
                access_lists.push(AccessListRecord {
                    transaction_hash: tx_hash.clone(),
                    address,
                    storage_key: None,
                });
                continue;
            }
            for key in keys {
                access_lists.push(AccessListRecord {
                    transaction_hash: tx_hash.clone(),
                    address: address.clone(),
                    storage_key: Some(hex::encode_prefixed(key)),
                });
            }
        }

        for delta in &receipt.state_changes {
            state_changes.push(StateChangeRecord {
                block_number: number,
                transaction_hash: tx_hash.clone(),
                address: hex::encode_prefixed(delta.address),
                storage_key: delta.kind.storage_key().map(hex::encode_prefixed),
                prev_value: hex::encode_prefixed(&delta.prev_value),
                new_value: hex::encode_prefixed(&delta.new_value),
                change_type: delta.kind.as_str().to_string(),
            });
        }

        if let Some(account) = created_account(header, receipt, &tx_hash) {
            accounts.push(account);
        }
    }

    logs.sort_by_key(|log| log.log_index);

    let block = block_record(
        header,
        block_hash,
        transactions.iter().map(|tx| tx.hash.clone()).collect(),
    );

    Ok(BlockGraph {
        block,
        transactions,
        receipts: receipt_records,
        logs,
        access_lists,
        state_changes,
        accounts,
    })
}

fn block_record(header: &ChainHeader, hash: String, transactions: Vec<String>) -> BlockRecord {
    let h = header.header();
    BlockRecord {
        number: h.number,
        hash,
        parent_hash: hex::encode_prefixed(h.parent_hash),
        timestamp: h.timestamp,
        nonce: hex::encode_prefixed(h.nonce),
        difficulty: quantity(h.difficulty),
        extra_data: hex::encode_prefixed(&h.extra_data),
        gas_limit: h.gas_limit,
        gas_used: h.gas_used,
        logs_bloom: hex::encode_prefixed(h.logs_bloom),
        miner: hex::encode_prefixed(h.beneficiary),
        mix_hash: hex::encode_prefixed(h.mix_hash),
        receipts_root: hex::encode_prefixed(h.receipts_root),
        sha3_uncles: hex::encode_prefixed(h.ommers_hash),
        state_root: hex::encode_prefixed(h.state_root),
        transactions_root: hex::encode_prefixed(h.transactions_root),
        base_fee_per_gas: h.base_fee_per_gas.map(quantity),
        blob_gas_used: h.blob_gas_used,
        excess_blob_gas: h.excess_blob_gas,
        withdrawals_root: h.withdrawals_root.map(hex::encode_prefixed),
        parent_beacon_block_root: h.parent_beacon_block_root.map(hex::encode_prefixed),
        transactions,
        size: None,
        total_difficulty: None,
        block_reward: None,
        uncle_reward: None,
        finalized: false,
    }
}

fn transaction_record(number: u64, receipt: &ChainReceipt, tx_hash: &str) -> TransactionRecord {
    let tx = &receipt.transaction;
    TransactionRecord {
        hash: tx_hash.to_string(),
        block_number: number,
        transaction_index: receipt.transaction_index,
        from_address: hex::encode_prefixed(tx.from),
        to_address: tx.to.map(hex::encode_prefixed),
        value: quantity(tx.value),
        nonce: tx.nonce,
        gas_price: quantity(tx.gas_price),
        gas_limit: tx.gas_limit,
        gas_used: receipt.gas_used,
        input: hex::encode_prefixed(&tx.input),
        status: receipt.status.into(),
        tx_type: tx.tx_type.into(),
        max_fee_per_gas: tx.max_fee_per_gas.map(quantity),
        max_priority_fee_per_gas: tx.max_priority_fee_per_gas.map(quantity),
        blob_gas_used: receipt.blob_gas_used,
        blob_gas_price: receipt.blob_gas_price.map(quantity),
        error: receipt.error.clone(),
    }
}

/// Account metadata for a successful contract creation.
fn created_account(
    header: &ChainHeader,
    receipt: &ChainReceipt,
    tx_hash: &str,
) -> Option<AccountRecord> {
    let address = receipt.contract_address.filter(|_| receipt.status)?;
    let code = receipt
        .state_changes
        .iter()
        .find(|delta| delta.address == address && delta.kind == StateDeltaKind::Code)
        .map(|delta| hex::encode_prefixed(&delta.new_value));

    Some(AccountRecord {
        address: hex::encode_prefixed(address),
        balance: None,
        // EIP-161: contracts start at nonce 1.
        nonce: 1,
        code,
        creator_address: Some(hex::encode_prefixed(receipt.transaction.from)),
        creator_tx_hash: Some(tx_hash.to_string()),
        created_at: Some(header.header().timestamp),
    })
}

/// Formats a numeric quantity as `0x`-prefixed lowercase hex.
fn quantity<T: LowerHex>(value: T) -> String {
    format!("0x{value:x}")
}
