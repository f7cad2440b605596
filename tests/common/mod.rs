//! Shared test helpers and utilities.
//!
//! Factories for chain input (headers linked by parent hash, receipts with
//! logs, access lists and contract creations) and helpers to inspect the
//! projection at the SQL level.

#![allow(dead_code)]

use std::collections::HashMap;

use alloy::consensus::Header;
use alloy::primitives::{Address, Bytes, B256, U256};
use projection_data::{
    ChainHeader, ChainLog, ChainReceipt, ChainTransaction, StateDelta, StateDeltaKind, Store,
    StoreConfig,
};
use projection_engine::{ProjectionConfig, ProjectionEngine, RetryPolicy};
use rusqlite::types::Value;

/// Receipt source backed by a map from block hash to receipts.
pub type MemoryChain = HashMap<B256, Vec<ChainReceipt>>;

/// Tables of the projection, parents first.
pub const TABLES: [&str; 7] = [
    "blocks",
    "transactions",
    "receipts",
    "logs",
    "access_lists",
    "state_changes",
    "accounts",
];

/// Creates an in-memory SQLite Store with all migrations applied.
///
/// # Panics
/// Panics if the in-memory database cannot be created (should never happen).
pub fn test_store() -> Store {
    Store::in_memory().expect("in-memory store should always open")
}

/// Creates a migrated on-disk store inside `dir` and returns its path.
pub fn file_store(dir: &tempfile::TempDir) -> String {
    let path = dir
        .path()
        .join("projection.sqlite")
        .to_str()
        .expect("temp path should be UTF-8")
        .to_string();
    let mut store = Store::open(&path, &StoreConfig::default()).expect("store should open");
    store.migrate().expect("migrations should apply");
    store.close().expect("store should close");
    path
}

/// Engine config without retry delays.
pub fn test_config() -> ProjectionConfig {
    ProjectionConfig {
        retry: RetryPolicy::never(),
        ..Default::default()
    }
}

/// Creates an engine over an in-memory store whose chain knows every header
/// in `headers`.
pub fn test_engine(headers: &[ChainHeader]) -> ProjectionEngine<MemoryChain> {
    let mut engine =
        ProjectionEngine::new(test_store(), test_config()).expect("engine should accept store");
    engine
        .on_init(memory_chain(headers))
        .expect("init should succeed");
    engine
}

/// Creates an engine over the on-disk store at `path`.
pub fn file_engine(path: &str, headers: &[ChainHeader]) -> ProjectionEngine<MemoryChain> {
    let mut engine = ProjectionEngine::open(path, test_config()).expect("engine should open");
    engine
        .on_init(memory_chain(headers))
        .expect("init should succeed");
    engine
}

/// Receipt source with [`sample_receipts`] for each header.
pub fn memory_chain(headers: &[ChainHeader]) -> MemoryChain {
    headers
        .iter()
        .map(|header| (header.hash(), sample_receipts(header)))
        .collect()
}

/// Creates a sealed header. `branch` distinguishes competing blocks at the
/// same height.
///
/// # Example
/// ```ignore
/// let a = sample_header(10, B256::ZERO, 1);
/// let b = sample_header(10, B256::ZERO, 2);
/// assert_ne!(a.hash(), b.hash());
/// ```
pub fn sample_header(number: u64, parent_hash: B256, branch: u8) -> ChainHeader {
    ChainHeader::seal(Header {
        number,
        parent_hash,
        timestamp: 1_708_617_600 + number * 12, // ~12 second blocks
        gas_limit: 30_000_000,
        gas_used: 63_000,
        beneficiary: Address::repeat_byte(0x95),
        base_fee_per_gas: Some(1_000_000_000), // 1 gwei
        extra_data: Bytes::from(vec![branch]),
        ..Default::default()
    })
}

/// Builds `len` headers starting at `from`, each linked to the previous one.
pub fn build_chain(from: u64, len: u64, parent_hash: B256, branch: u8) -> Vec<ChainHeader> {
    let mut parent = parent_hash;
    (from..from + len)
        .map(|number| {
            let header = sample_header(number, parent, branch);
            parent = header.hash();
            header
        })
        .collect()
}

/// Transaction hash unique to `(block, index)`.
pub fn tx_hash(block: &ChainHeader, index: u8) -> B256 {
    let mut hash = block.hash();
    hash.0[31] ^= index.wrapping_add(1);
    hash.0[0] ^= 0xff;
    hash
}

/// Address of the contract created by the first transaction of `block`.
pub fn created_contract(block: &ChainHeader) -> Address {
    Address::from_slice(&block.hash()[..20])
}

/// Three receipts per block:
/// 0. a contract creation emitting log 2, with code and storage writes;
/// 1. a type-2 transfer with an access list emitting logs 0 and 1;
/// 2. a reverted call without logs.
pub fn sample_receipts(block: &ChainHeader) -> Vec<ChainReceipt> {
    let sender = Address::repeat_byte(0xf3);
    let contract = created_contract(block);
    let token = Address::repeat_byte(0x7a);

    let create = ChainReceipt {
        transaction: ChainTransaction {
            hash: tx_hash(block, 0),
            from: sender,
            to: None,
            nonce: block.number(),
            gas_limit: 200_000,
            gas_price: 2_000_000_000,
            input: Bytes::from(vec![0x60, 0x80, 0x60, 0x40]),
            tx_type: 0,
            ..Default::default()
        },
        transaction_index: 0,
        contract_address: Some(contract),
        gas_used: 21_000,
        status: true,
        logs: vec![transfer_log(2, contract, 0xaa)],
        state_changes: vec![
            StateDelta {
                address: contract,
                kind: StateDeltaKind::Code,
                prev_value: Bytes::new(),
                new_value: Bytes::from(vec![0x60, 0x80]),
            },
            StateDelta {
                address: contract,
                kind: StateDeltaKind::Storage(B256::with_last_byte(1)),
                prev_value: Bytes::from(vec![0]),
                new_value: Bytes::from(vec![1]),
            },
            StateDelta {
                address: sender,
                kind: StateDeltaKind::Nonce,
                prev_value: Bytes::from(block.number().to_be_bytes().to_vec()),
                new_value: Bytes::from((block.number() + 1).to_be_bytes().to_vec()),
            },
        ],
        ..Default::default()
    };

    let transfer = ChainReceipt {
        transaction: ChainTransaction {
            hash: tx_hash(block, 1),
            from: sender,
            to: Some(token),
            value: U256::from(10u64).pow(U256::from(18u64)),
            nonce: block.number() + 1,
            gas_limit: 60_000,
            gas_price: 1_500_000_000,
            max_fee_per_gas: Some(3_000_000_000),
            max_priority_fee_per_gas: Some(500_000_000),
            input: Bytes::from(vec![0xa9, 0x05, 0x9c, 0xbb]),
            tx_type: 2,
            access_list: vec![(
                token,
                vec![B256::with_last_byte(3), B256::with_last_byte(4)],
            )],
        },
        transaction_index: 1,
        gas_used: 21_000,
        status: true,
        logs: vec![transfer_log(0, token, 0xbb), transfer_log(1, token, 0xcc)],
        state_changes: vec![StateDelta {
            address: token,
            kind: StateDeltaKind::Balance,
            prev_value: Bytes::from(vec![0]),
            new_value: Bytes::from(vec![1]),
        }],
        ..Default::default()
    };

    let reverted = ChainReceipt {
        transaction: ChainTransaction {
            hash: tx_hash(block, 2),
            from: Address::repeat_byte(0x70),
            to: Some(token),
            gas_limit: 30_000,
            gas_price: 1_000_000_000,
            ..Default::default()
        },
        transaction_index: 2,
        gas_used: 21_000,
        status: false,
        error: Some("execution reverted".to_string()),
        ..Default::default()
    };

    vec![create, transfer, reverted]
}

fn transfer_log(index: u64, address: Address, marker: u8) -> ChainLog {
    ChainLog {
        index,
        address,
        topics: vec![B256::repeat_byte(0xdd), B256::repeat_byte(marker)],
        data: Bytes::from(vec![marker; 4]),
    }
}

/// Every row of every projection table, in a deterministic order. Two equal
/// dumps mean byte-identical table contents.
pub fn dump_tables(path: &str) -> Vec<(String, Vec<Vec<Value>>)> {
    let conn = rusqlite::Connection::open(path).expect("dump connection should open");
    TABLES
        .iter()
        .map(|table| {
            let mut stmt = conn
                .prepare(&format!("SELECT * FROM {table} ORDER BY rowid"))
                .expect("dump query should prepare");
            let columns = stmt.column_count();
            let rows = stmt
                .query_map([], |row| {
                    (0..columns)
                        .map(|i| row.get::<_, Value>(i))
                        .collect::<Result<Vec<_>, _>>()
                })
                .expect("dump query should run")
                .collect::<Result<Vec<_>, _>>()
                .expect("all rows should read");
            (table.to_string(), rows)
        })
        .collect()
}

/// Like [`dump_tables`] but without synthetic `id` columns, with rows
/// sorted. Equal dumps mean the same projected content even when rows were
/// deleted and inserted again.
pub fn dump_content(path: &str) -> Vec<(String, Vec<String>)> {
    let conn = rusqlite::Connection::open(path).expect("dump connection should open");
    TABLES
        .iter()
        .map(|table| {
            let columns: Vec<String> = conn
                .prepare(&format!("SELECT name FROM pragma_table_info('{table}')"))
                .expect("table info should prepare")
                .query_map([], |row| row.get(0))
                .expect("table info should run")
                .collect::<Result<Vec<String>, _>>()
                .expect("column names should read")
                .into_iter()
                .filter(|name| name != "id")
                .collect();
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM {table}", columns.join(", ")))
                .expect("content query should prepare");
            let mut rows = stmt
                .query_map([], |row| {
                    (0..columns.len())
                        .map(|i| row.get::<_, Value>(i))
                        .collect::<Result<Vec<_>, _>>()
                        .map(|values| format!("{values:?}"))
                })
                .expect("content query should run")
                .collect::<Result<Vec<_>, _>>()
                .expect("all rows should read");
            rows.sort();
            (table.to_string(), rows)
        })
        .collect()
}

/// Stored hash of block `number` as `0x` hex, if present.
pub fn stored_hash(store: &Store, number: u64) -> Option<String> {
    store
        .block_by_number(number)
        .expect("lookup should succeed")
        .map(|block| block.hash)
}

pub fn hex(hash: B256) -> String {
    alloy::hex::encode_prefixed(hash)
}
