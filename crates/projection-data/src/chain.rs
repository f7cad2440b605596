//! Chain-side input shapes handed to the projection by the upstream node.
//!
//! These mirror what a node knows about a block at head time: the sealed
//! header plus, per transaction, the execution receipt and its logs.

use alloy::consensus::Header;
use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// A block header paired with its hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainHeader {
    hash: B256,
    header: Header,
}

impl ChainHeader {
    /// Seals `header` by computing its hash.
    pub fn seal(header: Header) -> Self {
        let hash = header.hash_slow();
        Self { hash, header }
    }

    /// Pairs `header` with a hash reported by a trusted source (e.g. the node's RPC).
    pub const fn new_unchecked(hash: B256, header: Header) -> Self {
        Self { hash, header }
    }

    pub const fn hash(&self) -> B256 {
        self.hash
    }

    pub const fn number(&self) -> u64 {
        self.header.number
    }

    pub const fn parent_hash(&self) -> B256 {
        self.header.parent_hash
    }

    pub const fn header(&self) -> &Header {
        &self.header
    }

    pub const fn block_ref(&self) -> BlockRef {
        BlockRef {
            number: self.header.number,
            hash: self.hash,
        }
    }
}

/// Identity of a block: enough to locate it in the projection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: B256,
}

/// Transaction body as executed in a block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub hash: B256,
    pub from: Address,
    /// `None` for contract creations.
    pub to: Option<Address>,
    pub value: U256,
    pub nonce: u64,
    pub gas_limit: u64,
    /// Effective gas price paid.
    pub gas_price: u128,
    /// Present for EIP-1559 and later transaction types.
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    pub input: Bytes,
    pub tx_type: u8,
    /// EIP-2930 access list: accessed address and its storage keys.
    pub access_list: Vec<(Address, Vec<B256>)>,
}

/// Execution receipt of one transaction, carrying the transaction itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReceipt {
    pub transaction: ChainTransaction,
    pub transaction_index: u64,
    pub contract_address: Option<Address>,
    pub gas_used: u64,
    /// `true` when execution succeeded.
    pub status: bool,
    pub blob_gas_used: Option<u64>,
    pub blob_gas_price: Option<u128>,
    /// Revert reason or execution error, when the node reports one.
    pub error: Option<String>,
    pub logs: Vec<ChainLog>,
    /// Optional state diff; empty when the node does not trace state.
    pub state_changes: Vec<StateDelta>,
}

/// An event log as emitted during execution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLog {
    /// Index of the log within the block.
    pub index: u64,
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// One account-level state delta produced by a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDelta {
    pub address: Address,
    pub kind: StateDeltaKind,
    pub prev_value: Bytes,
    pub new_value: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateDeltaKind {
    Balance,
    Nonce,
    Code,
    Storage(B256),
}

impl StateDeltaKind {
    /// Label stored in the `change_type` column.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Balance => "balance",
            Self::Nonce => "nonce",
            Self::Code => "code",
            Self::Storage(_) => "storage",
        }
    }

    pub const fn storage_key(&self) -> Option<B256> {
        match self {
            Self::Storage(key) => Some(*key),
            _ => None,
        }
    }
}
