mod common;

use std::sync::Arc;

use common::setup;
use small_store::{
    BufferPool, LockManager, LockMode, LockTarget, PageId, SourceId, TableId, TransactionId,
};

fn new_lock_manager() -> (Arc<BufferPool>, SourceId, LockManager) {
    let bm = Arc::new(BufferPool::new(4096, 1024).unwrap());
    let source = bm.load_memory_source();
    let lm = LockManager::new(bm.clone());
    (bm, source, lm)
}

#[test]
fn test_registering() {
    setup();
    let (_bm, source_a, lm) = new_lock_manager();
    let source_b = SourceId(9999);

    let table_a = TableId(1);
    let table_b = TableId(2);
    let trans_a = TransactionId(1);
    let trans_b = TransactionId(2);

    // registering a table against an unknown source fails
    assert!(lm.register_table(table_a, source_b).is_err());
    assert!(lm.register_table(table_a, source_a).is_ok());
    assert!(lm.register_table(table_a, source_a).is_err());

    assert!(lm.unregister_table(table_b).is_err());
    assert!(lm.unregister_table(table_a).is_ok());
    assert!(lm.unregister_table(table_b).is_err());
    assert!(lm.register_table(table_a, source_a).is_ok());

    assert!(lm.register_transaction(trans_a, 0).is_ok());
    assert!(lm.register_transaction(trans_a, 0).is_err());

    assert!(lm.unregister_transaction(trans_b).is_err());
    assert!(lm.unregister_transaction(trans_a).is_ok());
    assert!(lm.unregister_transaction(trans_b).is_err());
    assert!(lm.register_transaction(trans_a, 0).is_ok());
}

#[test]
fn test_input_validation() {
    setup();
    let (_bm, source, lm) = new_lock_manager();

    let table = TableId(1);
    let trans = TransactionId(1);
    lm.register_table(table, source).unwrap();
    lm.register_transaction(trans, 0).unwrap();

    // invalid handles are rejected without side effects
    assert!(lm
        .acquire_lock(trans, &LockTarget::table(TableId::INVALID, LockMode::Shared))
        .is_err());
    assert!(lm
        .acquire_lock(
            TransactionId::INVALID,
            &LockTarget::table(table, LockMode::Shared)
        )
        .is_err());
    assert!(lm
        .acquire_lock(
            trans,
            &LockTarget::page(table, PageId::INVALID, LockMode::Shared)
        )
        .is_err());

    // unregistered ids are rejected too
    assert!(lm
        .acquire_lock(TransactionId(99), &LockTarget::table(table, LockMode::Shared))
        .is_err());
    assert!(lm
        .acquire_lock(trans, &LockTarget::table(TableId(99), LockMode::Shared))
        .is_err());

    // releasing a never-acquired lock fails
    assert!(lm
        .release_lock(trans, &LockTarget::table(table, LockMode::Shared))
        .is_err());

    assert!(!lm.table_has_locks(table));
}

#[test]
fn test_table_compatibility_matrix() {
    setup();
    let (_bm, source, lm) = new_lock_manager();

    let table = TableId(1);
    let trans_1 = TransactionId(1);
    let trans_2 = TransactionId(2);
    lm.register_table(table, source).unwrap();
    lm.register_transaction(trans_1, 0).unwrap();
    lm.register_transaction(trans_2, 0).unwrap();

    for &mode_1 in LockMode::ALL.iter() {
        for &mode_2 in LockMode::ALL.iter() {
            let target_1 = LockTarget::table(table, mode_1);
            let target_2 = LockTarget::table(table, mode_2);

            let result = lm.acquire_lock(trans_1, &target_1).unwrap();
            assert!(!result.blocked);

            let result = lm.acquire_lock(trans_2, &target_2).unwrap();
            assert_eq!(
                result.blocked,
                !mode_2.is_compatible_with(mode_1),
                "requested {:?} against held {:?}",
                mode_2,
                mode_1
            );

            // release the acquired lock of trans_1 and whichever state
            // trans_2 ended up in, acquired or pending
            lm.release_lock(trans_1, &target_1).unwrap();
            lm.release_lock(trans_2, &target_2).unwrap();
            assert!(!lm.table_has_locks(table));
        }
    }
}

#[test]
fn test_granularity_hierarchy() {
    setup();
    let (bm, source, lm) = new_lock_manager();

    let table = TableId(1);
    let trans_1 = TransactionId(1);
    let trans_2 = TransactionId(2);
    lm.register_table(table, source).unwrap();
    lm.register_transaction(trans_1, 0).unwrap();
    lm.register_transaction(trans_2, 0).unwrap();

    let page = PageId(5);
    let row = bm.encode_pointer(page, 64).unwrap();
    let other_row = bm.encode_pointer(page, 128).unwrap();

    // the usual descent: IX on the table, IX on the page, X on the row
    let targets = [
        LockTarget::table(table, LockMode::IntentExclusive),
        LockTarget::page(table, page, LockMode::IntentExclusive),
        LockTarget::row(table, row, LockMode::Exclusive),
    ];
    for target in targets.iter() {
        let result = lm.acquire_lock(trans_1, target).unwrap();
        assert!(!result.blocked);
    }

    // a reader can still announce itself on the table and touch a
    // different row
    let result = lm
        .acquire_lock(trans_2, &LockTarget::table(table, LockMode::IntentShared))
        .unwrap();
    assert!(!result.blocked);
    let result = lm
        .acquire_lock(trans_2, &LockTarget::row(table, other_row, LockMode::Shared))
        .unwrap();
    assert!(!result.blocked);

    // the locked row itself conflicts
    let result = lm
        .acquire_lock(trans_2, &LockTarget::row(table, row, LockMode::Shared))
        .unwrap();
    assert!(result.blocked);

    lm.rollback(trans_1).unwrap();
    lm.rollback(trans_2).unwrap();
    assert!(!lm.table_has_locks(table));
}

#[test]
fn test_release_inverts_acquire() {
    setup();
    let (bm, source, lm) = new_lock_manager();

    let table = TableId(1);
    let trans = TransactionId(1);
    lm.register_table(table, source).unwrap();
    lm.register_transaction(trans, 0).unwrap();

    let row = bm.encode_pointer(PageId(9), 256).unwrap();
    let targets = [
        LockTarget::table(table, LockMode::IntentShared),
        LockTarget::page(table, PageId(9), LockMode::IntentShared),
        LockTarget::row(table, row, LockMode::Shared),
    ];

    for target in targets.iter() {
        lm.acquire_lock(trans, target).unwrap();
    }
    assert!(lm.table_has_locks(table));

    for target in targets.iter().rev() {
        lm.release_lock(trans, target).unwrap();
    }
    // every lock-info node was reaped
    assert!(!lm.table_has_locks(table));
    assert!(lm.unregister_transaction(trans).is_ok());
}

#[test]
fn test_pending_and_scheduler() {
    setup();
    let (_bm, source, lm) = new_lock_manager();

    let table = TableId(1);
    let trans_1 = TransactionId(1);
    let trans_2 = TransactionId(2);
    let trans_3 = TransactionId(3);
    lm.register_table(table, source).unwrap();
    lm.register_transaction(trans_1, 0).unwrap();
    lm.register_transaction(trans_2, 0).unwrap();
    lm.register_transaction(trans_3, 0).unwrap();

    let exclusive = LockTarget::table(table, LockMode::Exclusive);
    let shared = LockTarget::table(table, LockMode::Shared);

    assert!(!lm.acquire_lock(trans_1, &exclusive).unwrap().blocked);
    assert!(lm.acquire_lock(trans_2, &shared).unwrap().blocked);
    assert!(lm.acquire_lock(trans_3, &shared).unwrap().blocked);

    // a transaction may have only one pending lock
    assert!(lm.acquire_lock(trans_2, &shared).is_err());

    // nothing can be granted while the exclusive lock stands
    assert_eq!(lm.pick_transaction(), None);

    lm.release_lock(trans_1, &exclusive).unwrap();

    // both waiters drain, in some round-robin order
    let first = lm.pick_transaction().unwrap();
    let second = lm.pick_transaction().unwrap();
    assert!(first == trans_2 || first == trans_3);
    assert!(second == trans_2 || second == trans_3);
    assert_ne!(first, second);
    assert_eq!(lm.pick_transaction(), None);

    lm.release_lock(trans_2, &shared).unwrap();
    lm.release_lock(trans_3, &shared).unwrap();
    assert!(!lm.table_has_locks(table));
}

#[test]
fn test_scheduler_importance_order() {
    setup();
    let (_bm, source, lm) = new_lock_manager();

    let table = TableId(1);
    let holder = TransactionId(1);
    let trans_low = TransactionId(2);
    let trans_high = TransactionId(3);
    lm.register_table(table, source).unwrap();
    lm.register_transaction(holder, 0).unwrap();
    lm.register_transaction(trans_low, 1).unwrap();
    lm.register_transaction(trans_high, 10).unwrap();

    let exclusive = LockTarget::table(table, LockMode::Exclusive);
    let shared = LockTarget::table(table, LockMode::Shared);

    assert!(!lm.acquire_lock(holder, &exclusive).unwrap().blocked);
    assert!(lm.acquire_lock(trans_low, &shared).unwrap().blocked);
    assert!(lm.acquire_lock(trans_high, &shared).unwrap().blocked);

    lm.release_lock(holder, &exclusive).unwrap();

    // the more important transaction is served first
    assert_eq!(lm.pick_transaction(), Some(trans_high));
    assert_eq!(lm.pick_transaction(), Some(trans_low));
    assert_eq!(lm.pick_transaction(), None);
}

#[test]
fn test_scheduler_round_robin_fairness() {
    setup();
    let (_bm, source, lm) = new_lock_manager();

    let table = TableId(1);
    let holder = TransactionId(1);
    let waiters = [TransactionId(2), TransactionId(3), TransactionId(4)];
    lm.register_table(table, source).unwrap();
    lm.register_transaction(holder, 0).unwrap();
    for &trans in waiters.iter() {
        lm.register_transaction(trans, 5).unwrap();
    }

    let exclusive = LockTarget::table(table, LockMode::Exclusive);
    let shared = LockTarget::table(table, LockMode::Shared);

    assert!(!lm.acquire_lock(holder, &exclusive).unwrap().blocked);
    for &trans in waiters.iter() {
        assert!(lm.acquire_lock(trans, &shared).unwrap().blocked);
    }
    lm.release_lock(holder, &exclusive).unwrap();

    // every waiter gets its turn exactly once
    let mut granted = vec![
        lm.pick_transaction().unwrap(),
        lm.pick_transaction().unwrap(),
        lm.pick_transaction().unwrap(),
    ];
    assert_eq!(lm.pick_transaction(), None);
    granted.sort();
    granted.dedup();
    assert_eq!(granted.len(), waiters.len());
}

#[test]
fn test_upgrade_lock() {
    setup();
    let (_bm, source, lm) = new_lock_manager();

    let table = TableId(1);
    let trans_1 = TransactionId(1);
    let trans_2 = TransactionId(2);
    lm.register_table(table, source).unwrap();
    lm.register_transaction(trans_1, 0).unwrap();
    lm.register_transaction(trans_2, 0).unwrap();

    let shared = LockTarget::table(table, LockMode::Shared);

    // a lone transaction upgrades without blocking
    assert!(!lm.acquire_lock(trans_1, &shared).unwrap().blocked);
    let result = lm.upgrade_lock(trans_1, &shared, LockMode::Exclusive).unwrap();
    assert!(!result.blocked);

    // the old entry is gone, the new one is there
    assert!(lm.release_lock(trans_1, &shared).is_err());
    lm.release_lock(trans_1, &LockTarget::table(table, LockMode::Exclusive))
        .unwrap();
    assert!(!lm.table_has_locks(table));

    // a concurrent reader turns the upgrade into a pending request
    assert!(!lm.acquire_lock(trans_1, &shared).unwrap().blocked);
    assert!(!lm.acquire_lock(trans_2, &shared).unwrap().blocked);
    let result = lm.upgrade_lock(trans_1, &shared, LockMode::Exclusive).unwrap();
    assert!(result.blocked);

    lm.release_lock(trans_2, &shared).unwrap();
    assert_eq!(lm.pick_transaction(), Some(trans_1));
    lm.release_lock(trans_1, &LockTarget::table(table, LockMode::Exclusive))
        .unwrap();
    assert!(!lm.table_has_locks(table));
}

#[test]
fn test_unregister_requires_no_locks() {
    setup();
    let (_bm, source, lm) = new_lock_manager();

    let table = TableId(1);
    let trans_1 = TransactionId(1);
    let trans_2 = TransactionId(2);
    lm.register_table(table, source).unwrap();
    lm.register_transaction(trans_1, 0).unwrap();
    lm.register_transaction(trans_2, 0).unwrap();

    let shared = LockTarget::table(table, LockMode::Shared);
    let exclusive = LockTarget::table(table, LockMode::Exclusive);

    lm.acquire_lock(trans_1, &shared).unwrap();
    assert!(lm.unregister_transaction(trans_1).is_err());

    // a pending lock also blocks unregistration
    assert!(lm.acquire_lock(trans_2, &exclusive).unwrap().blocked);
    assert!(lm.unregister_transaction(trans_2).is_err());

    // a table with live locks cannot be unregistered either
    assert!(lm.unregister_table(table).is_err());

    lm.release_lock(trans_2, &exclusive).unwrap();
    lm.release_lock(trans_1, &shared).unwrap();
    assert!(lm.unregister_transaction(trans_1).is_ok());
    assert!(lm.unregister_transaction(trans_2).is_ok());
    assert!(lm.unregister_table(table).is_ok());
}

#[test]
fn test_deadlock_detection_and_rollback() {
    setup();
    let (_bm, source, lm) = new_lock_manager();

    let table_a = TableId(1);
    let table_b = TableId(2);
    let trans_1 = TransactionId(1);
    let trans_2 = TransactionId(2);
    lm.register_table(table_a, source).unwrap();
    lm.register_table(table_b, source).unwrap();
    lm.register_transaction(trans_1, 0).unwrap();
    lm.register_transaction(trans_2, 0).unwrap();

    // the classic crossing: each holds one table and wants the other
    assert!(
        !lm.acquire_lock(trans_1, &LockTarget::table(table_a, LockMode::Shared))
            .unwrap()
            .blocked
    );
    assert!(
        !lm.acquire_lock(trans_2, &LockTarget::table(table_b, LockMode::Shared))
            .unwrap()
            .blocked
    );
    assert!(
        lm.acquire_lock(trans_1, &LockTarget::table(table_b, LockMode::Exclusive))
            .unwrap()
            .blocked
    );
    assert!(
        lm.acquire_lock(trans_2, &LockTarget::table(table_a, LockMode::Exclusive))
            .unwrap()
            .blocked
    );

    // neither can make progress
    assert_eq!(lm.pick_transaction(), None);

    let infos = lm.detect_deadlock();
    assert_eq!(infos.len(), 1);
    let victim = infos[0].rollback_transaction;
    assert!(victim == trans_1 || victim == trans_2);
    assert!(infos[0].involved_transactions.contains(&trans_1));
    assert!(infos[0].involved_transactions.contains(&trans_2));

    // rolling the victim back unblocks the survivor
    lm.rollback(victim).unwrap();
    assert!(lm.detect_deadlock().is_empty());

    let survivor = if victim == trans_1 { trans_2 } else { trans_1 };
    assert_eq!(lm.pick_transaction(), Some(survivor));
    assert_eq!(lm.pick_transaction(), None);

    lm.rollback(survivor).unwrap();
    assert!(!lm.table_has_locks(table_a));
    assert!(!lm.table_has_locks(table_b));
    assert!(lm.unregister_transaction(trans_1).is_ok());
    assert!(lm.unregister_transaction(trans_2).is_ok());
}
