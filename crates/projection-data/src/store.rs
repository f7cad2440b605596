//! SQLite storage gateway for the chain projection.
//!
//! Uses WAL mode so readers never observe a half-written block, enforces
//! foreign keys to catch ordering bugs, and exposes explicit transactions so
//! the engine can compose several operations into one atomic unit.
//!
//! ## Transaction scoping
//! [`Store::begin`] returns a [`StoreTx`]. Everything done through it becomes
//! visible on [`StoreTx::commit`]; dropping it without committing rolls back.

use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{StoreError, StoreResult};
use crate::schema::{MIGRATIONS, SCHEMA_VERSION};
use crate::types::{
    AccessListRecord, AccountRecord, BlockGraph, BlockRecord, LogRecord, ReceiptRecord,
    StateChangeRecord, TransactionRecord,
};

/// Connection settings for [`Store::open`].
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// How long a statement waits on a lock held elsewhere before failing
    /// with a transient error.
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Rows removed by [`StoreTx::delete_range`], per table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RangeDeletion {
    pub access_lists: usize,
    pub state_changes: usize,
    pub logs: usize,
    pub accounts: usize,
    pub receipts: usize,
    pub transactions: usize,
    pub blocks: usize,
}

/// Result of marking a block finalized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Marked,
    AlreadyFinal,
}

/// Row counts per table, for status reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub blocks: u64,
    pub transactions: u64,
    pub receipts: u64,
    pub logs: u64,
    pub state_changes: u64,
    pub access_lists: u64,
    pub accounts: u64,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens (or creates) a SQLite database with WAL mode and foreign keys enabled.
    ///
    /// Does not migrate; call [`Store::migrate`] when provisioning.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or configured.
    pub fn open(path: &str, config: &StoreConfig) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(config.busy_timeout)?;
        Ok(Self { conn })
    }

    /// Opens a private in-memory database with the schema fully migrated.
    ///
    /// # Errors
    /// Returns error if migrations fail.
    pub fn in_memory() -> StoreResult<Self> {
        let mut store = Self::open(":memory:", &StoreConfig::default())?;
        store.migrate()?;
        Ok(store)
    }

    /// Current `user_version` of the database.
    pub fn schema_version(&self) -> StoreResult<u32> {
        Ok(self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?)
    }

    /// Applies pending migrations in one transaction. Returns how many ran.
    ///
    /// # Errors
    /// Returns error if a migration fails (nothing is applied) or the
    /// database is newer than this build.
    pub fn migrate(&mut self) -> StoreResult<u32> {
        let found = self.schema_version()?;
        if found > SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                found,
                expected: SCHEMA_VERSION,
            });
        }

        let tx = self.conn.transaction()?;
        for (version, step) in MIGRATIONS.iter().enumerate().skip(found as usize) {
            tx.execute_batch(step)?;
            tracing::info!(version = version + 1, "applied schema migration");
        }
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tx.commit()?;

        Ok(SCHEMA_VERSION - found)
    }

    /// Fails unless the database is at exactly [`SCHEMA_VERSION`].
    pub fn ensure_schema_current(&self) -> StoreResult<()> {
        let found = self.schema_version()?;
        if found != SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                found,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(())
    }

    /// Opens a write transaction.
    pub fn begin(&mut self) -> StoreResult<StoreTx<'_>> {
        Ok(StoreTx {
            tx: self.conn.transaction()?,
        })
    }

    /// Marks one block finalized in its own transaction.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if the block was never indexed.
    pub fn mark_finalized(&mut self, number: u64) -> StoreResult<FinalizeOutcome> {
        let tx = self.begin()?;
        let outcome = tx.mark_finalized(number)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Highest finalized block number, or `None` if nothing is final yet.
    pub fn latest_finalized(&self) -> StoreResult<Option<u64>> {
        latest_finalized(&self.conn)
    }

    /// Highest indexed block number, or `None` if the projection is empty.
    pub fn latest_block(&self) -> StoreResult<Option<u64>> {
        Ok(self
            .conn
            .query_row("SELECT MAX(number) FROM blocks", [], |row| row.get(0))?)
    }

    pub fn block_by_number(&self, number: u64) -> StoreResult<Option<BlockRecord>> {
        block_by_number(&self.conn, number)
    }

    pub fn block_by_hash(&self, hash: &str) -> StoreResult<Option<BlockRecord>> {
        block_by_hash(&self.conn, hash)
    }

    /// Transactions of a block in execution order.
    pub fn transactions_by_block(&self, number: u64) -> StoreResult<Vec<TransactionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT hash, block_number, transaction_index, from_address, to_address, value,
                    nonce, gas_price, gas_limit, gas_used, input, status, tx_type,
                    max_fee_per_gas, max_priority_fee_per_gas, blob_gas_used,
                    blob_gas_price, error
             FROM transactions WHERE block_number = ? ORDER BY transaction_index",
        )?;
        let rows = stmt
            .query_map(params![number], transaction_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Receipts of a block in execution order.
    pub fn receipts_by_block(&self, number: u64) -> StoreResult<Vec<ReceiptRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT block_number, block_hash, transaction_hash, transaction_index,
                    contract_address, gas_used, status
             FROM receipts WHERE block_number = ? ORDER BY transaction_index",
        )?;
        let rows = stmt
            .query_map(params![number], |row| {
                Ok(ReceiptRecord {
                    block_number: row.get(0)?,
                    block_hash: row.get(1)?,
                    transaction_hash: row.get(2)?,
                    transaction_index: row.get(3)?,
                    contract_address: row.get(4)?,
                    gas_used: row.get(5)?,
                    status: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Logs of a block ordered by their block-level index.
    pub fn logs_by_block(&self, number: u64) -> StoreResult<Vec<LogRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT transaction_hash, block_number, address, topics, data, log_index, removed
             FROM logs WHERE block_number = ? ORDER BY log_index",
        )?;
        let rows = stmt
            .query_map(params![number], |row| {
                let topics: String = row.get(3)?;
                Ok(LogRecord {
                    transaction_hash: row.get(0)?,
                    block_number: row.get(1)?,
                    address: row.get(2)?,
                    topics: json_column(&topics, 3)?,
                    data: row.get(4)?,
                    log_index: row.get(5)?,
                    removed: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn access_lists_by_transaction(&self, tx_hash: &str) -> StoreResult<Vec<AccessListRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT transaction_hash, address, storage_key
             FROM access_lists WHERE transaction_hash = ? ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![tx_hash], |row| {
                Ok(AccessListRecord {
                    transaction_hash: row.get(0)?,
                    address: row.get(1)?,
                    storage_key: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn state_changes_by_block(&self, number: u64) -> StoreResult<Vec<StateChangeRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT block_number, transaction_hash, address, storage_key, prev_value,
                    new_value, change_type
             FROM state_changes WHERE block_number = ? ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![number], |row| {
                Ok(StateChangeRecord {
                    block_number: row.get(0)?,
                    transaction_hash: row.get(1)?,
                    address: row.get(2)?,
                    storage_key: row.get(3)?,
                    prev_value: row.get(4)?,
                    new_value: row.get(5)?,
                    change_type: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Latest creation of `address` in chain order.
    pub fn account(&self, address: &str) -> StoreResult<Option<AccountRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT a.address, a.balance, a.nonce, a.code, a.creator_address,
                        a.creator_tx_hash, a.created_at
                 FROM accounts a
                 LEFT JOIN transactions t ON t.hash = a.creator_tx_hash
                 WHERE a.address = ?
                 ORDER BY t.block_number DESC, t.transaction_index DESC, a.id DESC
                 LIMIT 1",
                params![address],
                |row| {
                    Ok(AccountRecord {
                        address: row.get(0)?,
                        balance: row.get(1)?,
                        nonce: row.get(2)?,
                        code: row.get(3)?,
                        creator_address: row.get(4)?,
                        creator_tx_hash: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn table_counts(&self) -> StoreResult<TableCounts> {
        let count = |table: &str| -> StoreResult<u64> {
            Ok(self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
        };

        Ok(TableCounts {
            blocks: count("blocks")?,
            transactions: count("transactions")?,
            receipts: count("receipts")?,
            logs: count("logs")?,
            state_changes: count("state_changes")?,
            access_lists: count("access_lists")?,
            accounts: count("accounts")?,
        })
    }

    /// Number of rows whose foreign key points at nothing. Zero on a healthy projection.
    pub fn foreign_key_violations(&self) -> StoreResult<usize> {
        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let mut rows = stmt.query([])?;
        let mut violations = 0;
        while rows.next()?.is_some() {
            violations += 1;
        }
        Ok(violations)
    }

    /// Closes the connection, flushing the WAL.
    pub fn close(self) -> StoreResult<()> {
        self.conn.close().map_err(|(_, err)| err.into())
    }
}

/// An open write transaction. Dropping it without [`commit`](Self::commit) rolls back.
pub struct StoreTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl StoreTx<'_> {
    /// Inserts one block and every record keyed to it, roots first.
    ///
    /// # Errors
    /// Returns [`StoreError::ConstraintViolation`] if the block number, hash
    /// or any transaction hash already exists.
    pub fn insert_block_graph(&self, graph: &BlockGraph) -> StoreResult<()> {
        insert_block(&self.tx, &graph.block)?;

        {
            let mut stmt = self.tx.prepare_cached(
                "INSERT INTO transactions (
                    hash, block_number, transaction_index, from_address, to_address, value,
                    nonce, gas_price, gas_limit, gas_used, input, status, tx_type,
                    max_fee_per_gas, max_priority_fee_per_gas, blob_gas_used,
                    blob_gas_price, error
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for t in &graph.transactions {
                stmt.execute(params![
                    t.hash,
                    t.block_number,
                    t.transaction_index,
                    t.from_address,
                    t.to_address,
                    t.value,
                    t.nonce,
                    t.gas_price,
                    t.gas_limit,
                    t.gas_used,
                    t.input,
                    t.status,
                    t.tx_type,
                    t.max_fee_per_gas,
                    t.max_priority_fee_per_gas,
                    t.blob_gas_used,
                    t.blob_gas_price,
                    t.error,
                ])?;
            }
        }

        {
            let mut stmt = self.tx.prepare_cached(
                "INSERT INTO receipts (
                    block_number, block_hash, transaction_hash, transaction_index,
                    contract_address, gas_used, status
                ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for r in &graph.receipts {
                stmt.execute(params![
                    r.block_number,
                    r.block_hash,
                    r.transaction_hash,
                    r.transaction_index,
                    r.contract_address,
                    r.gas_used,
                    r.status,
                ])?;
            }
        }

        {
            let mut stmt = self.tx.prepare_cached(
                "INSERT INTO logs (
                    transaction_hash, block_number, address, topics, data, log_index, removed
                ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for l in &graph.logs {
                stmt.execute(params![
                    l.transaction_hash,
                    l.block_number,
                    l.address,
                    serde_json::to_string(&l.topics)?,
                    l.data,
                    l.log_index,
                    l.removed,
                ])?;
            }
        }

        {
            let mut stmt = self.tx.prepare_cached(
                "INSERT INTO access_lists (transaction_hash, address, storage_key)
                 VALUES (?, ?, ?)",
            )?;
            for a in &graph.access_lists {
                stmt.execute(params![a.transaction_hash, a.address, a.storage_key])?;
            }
        }

        {
            let mut stmt = self.tx.prepare_cached(
                "INSERT INTO state_changes (
                    block_number, transaction_hash, address, storage_key,
                    prev_value, new_value, change_type
                ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for s in &graph.state_changes {
                stmt.execute(params![
                    s.block_number,
                    s.transaction_hash,
                    s.address,
                    s.storage_key,
                    s.prev_value,
                    s.new_value,
                    s.change_type,
                ])?;
            }
        }

        {
            // A CREATE2 redeployment adds a row; rows of earlier creations
            // are never rewritten.
            let mut stmt = self.tx.prepare_cached(
                "INSERT INTO accounts (
                    address, balance, nonce, code, creator_address, creator_tx_hash, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for a in &graph.accounts {
                stmt.execute(params![
                    a.address,
                    a.balance,
                    a.nonce,
                    a.code,
                    a.creator_address,
                    a.creator_tx_hash,
                    a.created_at,
                ])?;
            }
        }

        Ok(())
    }

    /// Deletes every block numbered `from` or higher and everything keyed to
    /// them, leaves first.
    ///
    /// # Errors
    /// Returns [`StoreError::FinalizedBlockProtected`] without deleting
    /// anything if a finalized block lies in range.
    pub fn delete_range(&self, from: u64) -> StoreResult<RangeDeletion> {
        let finalized: Option<u64> = self.tx.query_row(
            "SELECT MAX(number) FROM blocks WHERE finalized = 1 AND number >= ?",
            params![from],
            |row| row.get(0),
        )?;
        if let Some(finalized) = finalized {
            return Err(StoreError::FinalizedBlockProtected { from, finalized });
        }

        let delete = |sql: &str| -> StoreResult<usize> { Ok(self.tx.execute(sql, params![from])?) };

        let deletion = RangeDeletion {
            access_lists: delete(
                "DELETE FROM access_lists WHERE transaction_hash IN (
                    SELECT hash FROM transactions WHERE block_number >= ?1
                )",
            )?,
            state_changes: delete("DELETE FROM state_changes WHERE block_number >= ?1")?,
            logs: delete("DELETE FROM logs WHERE block_number >= ?1")?,
            accounts: delete(
                "DELETE FROM accounts WHERE creator_tx_hash IN (
                    SELECT hash FROM transactions WHERE block_number >= ?1
                )",
            )?,
            receipts: delete("DELETE FROM receipts WHERE block_number >= ?1")?,
            transactions: delete("DELETE FROM transactions WHERE block_number >= ?1")?,
            blocks: delete("DELETE FROM blocks WHERE number >= ?1")?,
        };

        tracing::debug!(from, ?deletion, "deleted block range");
        Ok(deletion)
    }

    /// Sets the finalized flag on one block. Idempotent.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if the block is absent.
    pub fn mark_finalized(&self, number: u64) -> StoreResult<FinalizeOutcome> {
        let updated = self.tx.execute(
            "UPDATE blocks SET finalized = 1 WHERE number = ? AND finalized = 0",
            params![number],
        )?;
        if updated == 1 {
            return Ok(FinalizeOutcome::Marked);
        }

        let exists = self
            .tx
            .query_row("SELECT 1 FROM blocks WHERE number = ?", params![number], |_| Ok(()))
            .optional()?;
        match exists {
            Some(()) => Ok(FinalizeOutcome::AlreadyFinal),
            None => Err(StoreError::NotFound { number }),
        }
    }

    pub fn block_by_number(&self, number: u64) -> StoreResult<Option<BlockRecord>> {
        block_by_number(&self.tx, number)
    }

    pub fn block_by_hash(&self, hash: &str) -> StoreResult<Option<BlockRecord>> {
        block_by_hash(&self.tx, hash)
    }

    pub fn latest_finalized(&self) -> StoreResult<Option<u64>> {
        latest_finalized(&self.tx)
    }

    pub fn commit(self) -> StoreResult<()> {
        Ok(self.tx.commit()?)
    }

    pub fn rollback(self) -> StoreResult<()> {
        Ok(self.tx.rollback()?)
    }
}

const BLOCK_COLUMNS: &str = "number, hash, parent_hash, timestamp, nonce, difficulty, extra_data,
    gas_limit, gas_used, logs_bloom, miner, mix_hash, receipts_root, sha3_uncles, state_root,
    transactions_root, base_fee_per_gas, blob_gas_used, excess_blob_gas, withdrawals_root,
    parent_beacon_block_root, transactions, size, total_difficulty, block_reward, uncle_reward,
    finalized";

fn insert_block(conn: &Connection, b: &BlockRecord) -> StoreResult<()> {
    conn.prepare_cached(&format!(
        "INSERT INTO blocks ({BLOCK_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))?
    .execute(params![
        b.number,
        b.hash,
        b.parent_hash,
        b.timestamp,
        b.nonce,
        b.difficulty,
        b.extra_data,
        b.gas_limit,
        b.gas_used,
        b.logs_bloom,
        b.miner,
        b.mix_hash,
        b.receipts_root,
        b.sha3_uncles,
        b.state_root,
        b.transactions_root,
        b.base_fee_per_gas,
        b.blob_gas_used,
        b.excess_blob_gas,
        b.withdrawals_root,
        b.parent_beacon_block_root,
        serde_json::to_string(&b.transactions)?,
        b.size,
        b.total_difficulty,
        b.block_reward,
        b.uncle_reward,
        b.finalized,
    ])?;
    Ok(())
}

fn block_by_number(conn: &Connection, number: u64) -> StoreResult<Option<BlockRecord>> {
    Ok(conn
        .query_row(
            &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE number = ?"),
            params![number],
            block_from_row,
        )
        .optional()?)
}

fn block_by_hash(conn: &Connection, hash: &str) -> StoreResult<Option<BlockRecord>> {
    Ok(conn
        .query_row(
            &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE hash = ?"),
            params![hash],
            block_from_row,
        )
        .optional()?)
}

fn latest_finalized(conn: &Connection) -> StoreResult<Option<u64>> {
    Ok(conn.query_row(
        "SELECT MAX(number) FROM blocks WHERE finalized = 1",
        [],
        |row| row.get(0),
    )?)
}

fn block_from_row(row: &Row<'_>) -> rusqlite::Result<BlockRecord> {
    let transactions: String = row.get(21)?;
    Ok(BlockRecord {
        number: row.get(0)?,
        hash: row.get(1)?,
        parent_hash: row.get(2)?,
        timestamp: row.get(3)?,
        nonce: row.get(4)?,
        difficulty: row.get(5)?,
        extra_data: row.get(6)?,
        gas_limit: row.get(7)?,
        gas_used: row.get(8)?,
        logs_bloom: row.get(9)?,
        miner: row.get(10)?,
        mix_hash: row.get(11)?,
        receipts_root: row.get(12)?,
        sha3_uncles: row.get(13)?,
        state_root: row.get(14)?,
        transactions_root: row.get(15)?,
        base_fee_per_gas: row.get(16)?,
        blob_gas_used: row.get(17)?,
        excess_blob_gas: row.get(18)?,
        withdrawals_root: row.get(19)?,
        parent_beacon_block_root: row.get(20)?,
        transactions: json_column(&transactions, 21)?,
        size: row.get(22)?,
        total_difficulty: row.get(23)?,
        block_reward: row.get(24)?,
        uncle_reward: row.get(25)?,
        finalized: row.get(26)?,
    })
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<TransactionRecord> {
    Ok(TransactionRecord {
        hash: row.get(0)?,
        block_number: row.get(1)?,
        transaction_index: row.get(2)?,
        from_address: row.get(3)?,
        to_address: row.get(4)?,
        value: row.get(5)?,
        nonce: row.get(6)?,
        gas_price: row.get(7)?,
        gas_limit: row.get(8)?,
        gas_used: row.get(9)?,
        input: row.get(10)?,
        status: row.get(11)?,
        tx_type: row.get(12)?,
        max_fee_per_gas: row.get(13)?,
        max_priority_fee_per_gas: row.get(14)?,
        blob_gas_used: row.get(15)?,
        blob_gas_price: row.get(16)?,
        error: row.get(17)?,
    })
}

/// Decodes a JSON list column (topics, transaction hashes).
fn json_column(text: &str, col: usize) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}
