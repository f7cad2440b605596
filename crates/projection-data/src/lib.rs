//! projection-data crate
//!
//! Chain input types, record derivation and the SQLite storage gateway of the
//! chain projection.

pub mod chain;
pub mod derive;
pub mod error;
pub mod schema;
pub mod store;
pub mod types;

pub use chain::{
    BlockRef, ChainHeader, ChainLog, ChainReceipt, ChainTransaction, StateDelta, StateDeltaKind,
};
pub use derive::derive_block;
pub use error::{DerivationError, StoreError, StoreResult};
pub use schema::SCHEMA_VERSION;
pub use store::{FinalizeOutcome, RangeDeletion, Store, StoreConfig, StoreTx, TableCounts};
pub use types::{
    AccessListRecord, AccountRecord, BlockGraph, BlockRecord, LogRecord, ReceiptRecord,
    StateChangeRecord, TransactionRecord,
};
