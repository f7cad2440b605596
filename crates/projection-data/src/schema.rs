//! Versioned schema migrations.
//!
//! Step `i` of [`MIGRATIONS`] upgrades the database from `user_version = i`
//! to `i + 1`. Migrations run once at provisioning time through
//! [`Store::migrate`](crate::store::Store::migrate), never on the write path.

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;

/// Ordered migration steps.
pub const MIGRATIONS: &[&str] = &[
    V1_TABLES,
    V2_FINALIZED,
    V3_ACCOUNT_CREATIONS,
    V4_ADDRESS_ONLY_ACCESS,
];

const V1_TABLES: &str = "
    CREATE TABLE blocks (
        number INTEGER PRIMARY KEY,
        hash TEXT NOT NULL UNIQUE,
        parent_hash TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        nonce TEXT NOT NULL,
        difficulty TEXT NOT NULL,
        extra_data TEXT NOT NULL,
        gas_limit INTEGER NOT NULL,
        gas_used INTEGER NOT NULL,
        logs_bloom TEXT NOT NULL,
        miner TEXT NOT NULL,
        mix_hash TEXT NOT NULL,
        receipts_root TEXT NOT NULL,
        sha3_uncles TEXT NOT NULL,
        state_root TEXT NOT NULL,
        transactions_root TEXT NOT NULL,
        base_fee_per_gas TEXT,
        blob_gas_used INTEGER,
        excess_blob_gas INTEGER,
        withdrawals_root TEXT,
        parent_beacon_block_root TEXT,
        transactions TEXT NOT NULL,
        size TEXT,
        total_difficulty TEXT,
        block_reward TEXT,
        uncle_reward TEXT
    );

    CREATE TABLE transactions (
        hash TEXT PRIMARY KEY,
        block_number INTEGER NOT NULL REFERENCES blocks(number),
        transaction_index INTEGER NOT NULL,
        from_address TEXT NOT NULL,
        to_address TEXT,
        value TEXT NOT NULL,
        nonce INTEGER NOT NULL,
        gas_price TEXT NOT NULL,
        gas_limit INTEGER NOT NULL,
        gas_used INTEGER NOT NULL,
        input TEXT NOT NULL,
        status INTEGER NOT NULL,
        tx_type INTEGER NOT NULL,
        max_fee_per_gas TEXT,
        max_priority_fee_per_gas TEXT,
        blob_gas_used INTEGER,
        blob_gas_price TEXT,
        error TEXT
    );
    CREATE INDEX idx_transactions_block ON transactions(block_number);

    CREATE TABLE receipts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        block_number INTEGER NOT NULL REFERENCES blocks(number),
        block_hash TEXT NOT NULL,
        transaction_hash TEXT NOT NULL UNIQUE REFERENCES transactions(hash),
        transaction_index INTEGER NOT NULL,
        contract_address TEXT,
        gas_used INTEGER NOT NULL,
        status INTEGER NOT NULL
    );
    CREATE INDEX idx_receipts_block ON receipts(block_number);
    CREATE INDEX idx_receipts_contract ON receipts(contract_address);

    CREATE TABLE logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        transaction_hash TEXT NOT NULL REFERENCES transactions(hash),
        block_number INTEGER NOT NULL REFERENCES blocks(number),
        address TEXT NOT NULL,
        topics TEXT NOT NULL,
        data TEXT NOT NULL,
        log_index INTEGER NOT NULL,
        removed INTEGER NOT NULL DEFAULT 0,
        UNIQUE (block_number, log_index)
    );
    CREATE INDEX idx_logs_address ON logs(address);
    CREATE INDEX idx_logs_transaction ON logs(transaction_hash);

    CREATE TABLE state_changes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        block_number INTEGER NOT NULL REFERENCES blocks(number),
        transaction_hash TEXT NOT NULL REFERENCES transactions(hash),
        address TEXT NOT NULL,
        storage_key TEXT,
        prev_value TEXT NOT NULL,
        new_value TEXT NOT NULL,
        change_type TEXT NOT NULL
    );
    CREATE INDEX idx_state_changes_address ON state_changes(address);
    CREATE INDEX idx_state_changes_block ON state_changes(block_number);

    CREATE TABLE access_lists (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        transaction_hash TEXT NOT NULL REFERENCES transactions(hash),
        address TEXT NOT NULL,
        storage_key TEXT NOT NULL
    );
    CREATE INDEX idx_access_lists_address ON access_lists(address);
    CREATE INDEX idx_access_lists_transaction ON access_lists(transaction_hash);

    CREATE TABLE accounts (
        address TEXT PRIMARY KEY,
        balance TEXT,
        nonce INTEGER NOT NULL,
        code TEXT,
        creator_address TEXT,
        creator_tx_hash TEXT REFERENCES transactions(hash),
        created_at INTEGER
    );
    CREATE INDEX idx_accounts_creator ON accounts(creator_address);
    CREATE INDEX idx_accounts_creator_tx ON accounts(creator_tx_hash);
";

const V2_FINALIZED: &str = "
    ALTER TABLE blocks ADD COLUMN finalized INTEGER NOT NULL DEFAULT 0;
    CREATE INDEX idx_blocks_finalized ON blocks(number) WHERE finalized = 1;
";

// One row per creation, so undoing a block never touches a creation that
// belongs to another block. Readers take the latest creation per address.
const V3_ACCOUNT_CREATIONS: &str = "
    CREATE TABLE account_creations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        address TEXT NOT NULL,
        balance TEXT,
        nonce INTEGER NOT NULL,
        code TEXT,
        creator_address TEXT,
        creator_tx_hash TEXT REFERENCES transactions(hash),
        created_at INTEGER,
        UNIQUE (address, creator_tx_hash)
    );
    INSERT INTO account_creations (
        address, balance, nonce, code, creator_address, creator_tx_hash, created_at
    )
    SELECT address, balance, nonce, code, creator_address, creator_tx_hash, created_at
    FROM accounts;
    DROP TABLE accounts;
    ALTER TABLE account_creations RENAME TO accounts;
    CREATE INDEX idx_accounts_address ON accounts(address, id);
    CREATE INDEX idx_accounts_creator ON accounts(creator_address);
    CREATE INDEX idx_accounts_creator_tx ON accounts(creator_tx_hash);
";

// EIP-2930 entries may warm an address without any storage keys.
const V4_ADDRESS_ONLY_ACCESS: &str = "
    CREATE TABLE access_list_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        transaction_hash TEXT NOT NULL REFERENCES transactions(hash),
        address TEXT NOT NULL,
        storage_key TEXT
    );
    INSERT INTO access_list_entries (id, transaction_hash, address, storage_key)
    SELECT id, transaction_hash, address, storage_key FROM access_lists;
    DROP TABLE access_lists;
    ALTER TABLE access_list_entries RENAME TO access_lists;
    CREATE INDEX idx_access_lists_address ON access_lists(address);
    CREATE INDEX idx_access_lists_transaction ON access_lists(transaction_hash);
";
