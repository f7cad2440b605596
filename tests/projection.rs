//! Integration tests for head, finality and reorg handling end to end.

mod common;

use alloy::primitives::B256;
use common::*;
use projection_data::{FinalizeOutcome, StoreError};
use projection_engine::{HeadOutcome, ProjectionEngine, ProjectionError, ProjectionEvent};

/// Delivering the same head twice leaves exactly one copy of every row.
#[test]
fn duplicate_head_is_idempotent() {
    let chain = build_chain(100, 1, B256::ZERO, 0);
    let mut engine = test_engine(&chain);

    assert_eq!(engine.on_head(&chain[0]).unwrap(), HeadOutcome::Indexed);
    let once = engine.store().unwrap().table_counts().unwrap();
    assert_eq!(engine.on_head(&chain[0]).unwrap(), HeadOutcome::AlreadyIndexed);
    let twice = engine.store().unwrap().table_counts().unwrap();

    assert_eq!(once, twice);
    assert_eq!(twice.blocks, 1);
    assert_eq!(twice.transactions, 3);
    assert_eq!(twice.receipts, 3);
    assert_eq!(twice.logs, 3);
    assert_eq!(twice.access_lists, 2);
    assert_eq!(twice.state_changes, 4);
    assert_eq!(twice.accounts, 1);
}

/// Replaying a head after restart against the same database is a no-op.
#[test]
fn head_replay_after_restart_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let path = file_store(&dir);
    let chain = build_chain(7, 2, B256::ZERO, 0);

    let mut engine = file_engine(&path, &chain);
    for header in &chain {
        engine.on_head(header).unwrap();
    }
    engine.on_close().unwrap();
    let before = dump_tables(&path);

    let mut engine = file_engine(&path, &chain);
    assert_eq!(engine.on_head(&chain[1]).unwrap(), HeadOutcome::AlreadyIndexed);
    engine.on_close().unwrap();

    assert_eq!(dump_tables(&path), before);
}

/// Heads [10, 11, 12], reorg to [11', 12', 13']: block 10 survives, the rest
/// is the new branch, and nothing of the old branch remains.
#[test]
fn reorg_replaces_branch_atomically() {
    let base = build_chain(10, 3, B256::ZERO, 0);
    let fork = build_chain(11, 3, base[0].hash(), 1);
    let known: Vec<_> = base.iter().chain(&fork).cloned().collect();
    let mut engine = test_engine(&known);
    for header in &base {
        engine.on_head(header).unwrap();
    }
    let mut events = engine.subscribe();

    let old: Vec<_> = base[1..].iter().map(|h| h.block_ref()).collect();
    let outcome = engine.on_reorg(&old, &fork).unwrap();

    assert_eq!(outcome.pivot, 11);
    assert_eq!(outcome.removed, 2);
    assert_eq!(outcome.applied, 3);
    assert_eq!(outcome.new_head, 13);

    let store = engine.store().unwrap();
    assert_eq!(stored_hash(store, 10), Some(hex(base[0].hash())));
    for header in &fork {
        assert_eq!(stored_hash(store, header.number()), Some(hex(header.hash())));
    }
    for header in &base[1..] {
        assert!(store.block_by_hash(&hex(header.hash())).unwrap().is_none());
        assert!(store
            .account(&alloy::hex::encode_prefixed(created_contract(header)))
            .unwrap()
            .is_none());
    }
    assert_eq!(store.table_counts().unwrap().blocks, 4);
    assert_eq!(store.foreign_key_violations().unwrap(), 0);
    assert_eq!(
        events.try_recv().unwrap(),
        ProjectionEvent::Reorged {
            pivot: 11,
            removed: 2,
            applied: 3,
            new_head: 13,
        }
    );
}

/// A failure while inserting the new branch leaves storage exactly as it was.
#[test]
fn failed_reorg_leaves_storage_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = file_store(&dir);
    let base = build_chain(10, 3, B256::ZERO, 0);
    let fork = build_chain(11, 3, base[0].hash(), 1);
    let known: Vec<_> = base.iter().chain(&fork).cloned().collect();

    let mut engine = file_engine(&path, &known);
    for header in &base {
        engine.on_head(header).unwrap();
    }

    // Abort the second insert of the replay.
    let admin = rusqlite::Connection::open(&path).unwrap();
    admin
        .execute_batch(&format!(
            "CREATE TRIGGER fail_replay BEFORE INSERT ON blocks
             WHEN NEW.number = 12 AND NEW.hash = '{}'
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
            hex(fork[1].hash())
        ))
        .unwrap();
    let before = dump_tables(&path);

    let old: Vec<_> = base[1..].iter().map(|h| h.block_ref()).collect();
    let err = engine.on_reorg(&old, &fork).unwrap_err();
    assert!(
        matches!(err, ProjectionError::Store(StoreError::ConstraintViolation(_))),
        "unexpected error: {err}"
    );

    assert_eq!(dump_tables(&path), before);
    let store = engine.store().unwrap();
    assert_eq!(stored_hash(store, 12), Some(hex(base[2].hash())));
    assert_eq!(store.latest_block().unwrap(), Some(12));

    // Once the fault is gone the same reorg applies cleanly.
    admin.execute_batch("DROP TRIGGER fail_replay;").unwrap();
    assert_eq!(engine.on_reorg(&old, &fork).unwrap().applied, 3);
}

/// A head whose rows collide with a different committed block is an error,
/// not a silent no-op, and nothing of it is written.
#[test]
fn conflicting_head_is_reported_and_not_written() {
    let dir = tempfile::tempdir().unwrap();
    let path = file_store(&dir);
    let chain = build_chain(10, 2, B256::ZERO, 0);
    let mut engine = file_engine(&path, &chain);
    engine.on_head(&chain[0]).unwrap();
    let before = dump_tables(&path);

    let mut receipts = sample_receipts(&chain[1]);
    receipts[0].transaction.hash = tx_hash(&chain[0], 0);
    let err = engine.apply_head(&chain[1], &receipts).unwrap_err();
    assert!(
        matches!(err, ProjectionError::Store(StoreError::ConstraintViolation(_))),
        "unexpected error: {err}"
    );

    assert_eq!(stored_hash(engine.store().unwrap(), 11), None);
    assert_eq!(dump_tables(&path), before);

    // The well-formed block still indexes afterwards.
    assert_eq!(engine.on_head(&chain[1]).unwrap(), HeadOutcome::Indexed);
}

/// Reorging onto a fork and back restores every table, auxiliary rows
/// included, to the same content.
#[test]
fn reorg_round_trip_restores_all_tables() {
    let dir = tempfile::tempdir().unwrap();
    let path = file_store(&dir);
    let base = build_chain(10, 3, B256::ZERO, 0);
    let fork = build_chain(11, 3, base[0].hash(), 1);
    let known: Vec<_> = base.iter().chain(&fork).cloned().collect();

    let mut engine = file_engine(&path, &known);
    for header in &base {
        engine.on_head(header).unwrap();
    }
    let before = dump_content(&path);

    let old: Vec<_> = base[1..].iter().map(|h| h.block_ref()).collect();
    engine.on_reorg(&old, &fork).unwrap();
    assert_ne!(dump_content(&path), before);

    let back: Vec<_> = fork.iter().map(|h| h.block_ref()).collect();
    engine.on_reorg(&back, &base[1..]).unwrap();
    assert_eq!(dump_content(&path), before);
    assert_eq!(engine.store().unwrap().foreign_key_violations().unwrap(), 0);
}

/// A contract recreated above a finalized creation does not disturb it, and
/// reorging the recreation away brings the original back.
#[test]
fn redeployment_above_finalized_creation_is_undone() {
    let base = build_chain(10, 3, B256::ZERO, 0);
    let fork = build_chain(11, 2, base[0].hash(), 1);
    let contract = created_contract(&base[0]);

    let mut chain = memory_chain(&[base.clone(), fork.clone()].concat());
    let mut redeploy = sample_receipts(&base[2]);
    redeploy[0].contract_address = Some(contract);
    chain.insert(base[2].hash(), redeploy);

    let mut engine = ProjectionEngine::new(test_store(), test_config()).unwrap();
    engine.on_init(chain).unwrap();
    for header in &base {
        engine.on_head(header).unwrap();
    }
    engine.on_final(&base[0]).unwrap();

    let address = alloy::hex::encode_prefixed(contract);
    let original_tx = hex(tx_hash(&base[0], 0));
    let latest = engine.store().unwrap().account(&address).unwrap().unwrap();
    assert_eq!(latest.creator_tx_hash, Some(hex(tx_hash(&base[2], 0))));

    let old: Vec<_> = base[1..].iter().map(|h| h.block_ref()).collect();
    engine.on_reorg(&old, &fork).unwrap();

    let account = engine.store().unwrap().account(&address).unwrap().unwrap();
    assert_eq!(account.creator_tx_hash, Some(original_tx));
    assert_eq!(account.code.as_deref(), Some("0x6080"));
    assert_eq!(account.created_at, Some(base[0].header().timestamp));
}

/// No event can delete or overwrite a finalized block.
#[test]
fn finalized_blocks_are_irrevocable() {
    let base = build_chain(10, 2, B256::ZERO, 0);
    let fork = build_chain(10, 2, B256::ZERO, 1);
    let known: Vec<_> = base.iter().chain(&fork).cloned().collect();
    let mut engine = test_engine(&known);
    for header in &base {
        engine.on_head(header).unwrap();
    }
    assert_eq!(engine.on_final(&base[0]).unwrap(), FinalizeOutcome::Marked);
    let counts = engine.store().unwrap().table_counts().unwrap();

    // Competing head at the finalized height.
    let err = engine.on_head(&fork[0]).unwrap_err();
    assert!(err.is_fatal());

    // Reorg whose pivot is the finalized block.
    let old: Vec<_> = base.iter().map(|h| h.block_ref()).collect();
    let err = engine.on_reorg(&old, &fork).unwrap_err();
    assert!(matches!(
        err,
        ProjectionError::Store(StoreError::FinalizedBlockProtected {
            from: 10,
            finalized: 10
        })
    ));

    // Finality for a different block at that height.
    let err = engine.on_final(&fork[0]).unwrap_err();
    assert!(matches!(err, ProjectionError::FinalizedHashMismatch { number: 10, .. }));

    let store = engine.store().unwrap();
    assert_eq!(stored_hash(store, 10), Some(hex(base[0].hash())));
    assert!(store.block_by_number(10).unwrap().unwrap().finalized);
    assert_eq!(store.table_counts().unwrap(), counts);

    // Above the finalized block, reorgs still apply.
    let tail = build_chain(11, 1, base[0].hash(), 2);
    let mut engine = test_engine(&[base.clone(), tail.clone()].concat());
    for header in &base {
        engine.on_head(header).unwrap();
    }
    engine.on_final(&base[0]).unwrap();
    engine.on_reorg(&[base[1].block_ref()], &tail).unwrap();
    assert_eq!(
        stored_hash(engine.store().unwrap(), 11),
        Some(hex(tail[0].hash()))
    );
}

/// Finalizing twice is harmless; finalizing an unknown block is reported.
#[test]
fn finality_is_idempotent() {
    let chain = build_chain(20, 1, B256::ZERO, 0);
    let mut engine = test_engine(&chain);
    engine.on_head(&chain[0]).unwrap();
    let mut events = engine.subscribe();

    assert_eq!(engine.on_final(&chain[0]).unwrap(), FinalizeOutcome::Marked);
    assert_eq!(engine.on_final(&chain[0]).unwrap(), FinalizeOutcome::AlreadyFinal);
    assert_eq!(engine.store().unwrap().latest_finalized().unwrap(), Some(20));

    assert!(matches!(
        events.try_recv().unwrap(),
        ProjectionEvent::Finalized { number: 20, .. }
    ));
    assert!(events.try_recv().is_err());

    let unknown = sample_header(21, chain[0].hash(), 0);
    let err = engine.on_final(&unknown).unwrap_err();
    assert!(matches!(
        err,
        ProjectionError::Store(StoreError::NotFound { number: 21 })
    ));
}

/// Closing before init, twice, and after use all succeed.
#[test]
fn close_is_safe_in_any_state() {
    let mut engine = ProjectionEngine::<MemoryChain>::new(test_store(), test_config()).unwrap();
    engine.on_close().unwrap();
    engine.on_close().unwrap();

    let chain = build_chain(1, 1, B256::ZERO, 0);
    let mut engine = test_engine(&chain);
    engine.on_head(&chain[0]).unwrap();
    engine.on_close().unwrap();
    assert!(matches!(
        engine.on_head(&chain[0]),
        Err(ProjectionError::Closed)
    ));
}
