//! projection-engine: applies head, finality and reorg events from an
//! upstream node to the relational chain projection.
//!
//! Each event becomes one SQLite transaction. Reorgs delete from the pivot
//! upward and replay the new branch atomically; finalized blocks are never
//! touched again.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
pub mod retry;

pub use cache::ReceiptCache;
pub use config::ProjectionConfig;
pub use engine::{HeadOutcome, ProjectionEngine, ReorgOutcome};
pub use error::{ProjectionError, ProjectionResult};
pub use events::ProjectionEvent;
pub use handle::ChainHandle;
pub use retry::RetryPolicy;
