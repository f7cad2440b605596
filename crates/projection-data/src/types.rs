//! Relational record shapes of the chain projection.
//!
//! Hashes, addresses and wei amounts are lowercase hex text with a `0x`
//! prefix; counters are integers. Optional fork fields stay `None` when the
//! block version predates them, so "absent" and "zero" remain distinct.

use serde::{Deserialize, Serialize};

/// One row of the `blocks` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Block number (primary identity).
    pub number: u64,
    /// Block hash (unique).
    pub hash: String,
    pub parent_hash: String,
    /// Timestamp in unix seconds.
    pub timestamp: u64,
    /// Proof-of-work nonce, hex text.
    pub nonce: String,
    /// Difficulty, hex text.
    pub difficulty: String,
    pub extra_data: String,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub logs_bloom: String,
    /// Coinbase address.
    pub miner: String,
    pub mix_hash: String,
    pub receipts_root: String,
    pub sha3_uncles: String,
    pub state_root: String,
    pub transactions_root: String,
    /// London (EIP-1559) base fee, hex text.
    pub base_fee_per_gas: Option<String>,
    /// Cancun blob gas fields.
    pub blob_gas_used: Option<u64>,
    pub excess_blob_gas: Option<u64>,
    /// Shanghai withdrawals root.
    pub withdrawals_root: Option<String>,
    /// Cancun parent beacon block root.
    pub parent_beacon_block_root: Option<String>,
    /// Transaction hashes in block order.
    pub transactions: Vec<String>,
    /// Not computed by the projection; always `None`.
    pub size: Option<String>,
    /// Not computed by the projection; always `None`.
    pub total_difficulty: Option<String>,
    /// Not computed by the projection; always `None`.
    pub block_reward: Option<String>,
    /// Not computed by the projection; always `None`.
    pub uncle_reward: Option<String>,
    /// Set once the chain reports the block final. Never cleared.
    pub finalized: bool,
}

/// One row of the `transactions` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: String,
    pub block_number: u64,
    pub transaction_index: u64,
    pub from_address: String,
    /// `None` for contract creations.
    pub to_address: Option<String>,
    /// Value in wei, hex text.
    pub value: String,
    pub nonce: u64,
    /// Effective gas price in wei, hex text.
    pub gas_price: String,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Calldata, hex text.
    pub input: String,
    /// Execution status (1 = success, 0 = revert).
    pub status: u32,
    pub tx_type: u32,
    pub max_fee_per_gas: Option<String>,
    pub max_priority_fee_per_gas: Option<String>,
    pub blob_gas_used: Option<u64>,
    pub blob_gas_price: Option<String>,
    pub error: Option<String>,
}

/// One row of the `receipts` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_hash: String,
    pub transaction_index: u64,
    /// Address of the created contract, if the transaction deployed one.
    pub contract_address: Option<String>,
    pub gas_used: u64,
    pub status: u32,
}

/// One row of the `logs` table. The synthetic row id is storage-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub transaction_hash: String,
    pub block_number: u64,
    /// Emitting contract.
    pub address: String,
    /// Indexed topics in emission order.
    pub topics: Vec<String>,
    /// Non-indexed payload, hex text.
    pub data: String,
    /// Index within the block.
    pub log_index: u64,
    /// Always `false`: reorged logs are deleted, not flagged.
    pub removed: bool,
}

/// One row of the `state_changes` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeRecord {
    pub block_number: u64,
    pub transaction_hash: String,
    pub address: String,
    /// Set only for storage-slot changes.
    pub storage_key: Option<String>,
    pub prev_value: String,
    pub new_value: String,
    /// One of `balance`, `nonce`, `code`, `storage`.
    pub change_type: String,
}

/// One row of the `access_lists` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessListRecord {
    pub transaction_hash: String,
    pub address: String,
    /// `None` for an entry that warms the address without storage keys.
    pub storage_key: Option<String>,
}

/// One row of the `accounts` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub address: String,
    /// Balance in wei, hex text. `None` until observed.
    pub balance: Option<String>,
    pub nonce: u64,
    /// Runtime bytecode; `None` for externally-owned accounts.
    pub code: Option<String>,
    /// `None` for externally-owned accounts.
    pub creator_address: Option<String>,
    pub creator_tx_hash: Option<String>,
    /// Timestamp (unix seconds) of the creating block.
    pub created_at: Option<u64>,
}

/// Everything one block contributes to the projection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGraph {
    pub block: BlockRecord,
    pub transactions: Vec<TransactionRecord>,
    pub receipts: Vec<ReceiptRecord>,
    pub logs: Vec<LogRecord>,
    pub access_lists: Vec<AccessListRecord>,
    pub state_changes: Vec<StateChangeRecord>,
    pub accounts: Vec<AccountRecord>,
}

impl BlockGraph {
    pub fn number(&self) -> u64 {
        self.block.number
    }

    pub fn hash(&self) -> &str {
        &self.block.hash
    }
}
