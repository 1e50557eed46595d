//! End-to-end behavior of the pool, transactions, migration and repair.

use proptest::prelude::*;
use sqlward_core::{
    Config, CoreError, Database, MigrationInfo, MigrationMode, MigrationState, RecoveryMode,
    RecoveryModeKind,
};
use sqlward_testkit::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn nested_scripts_use_one_handle(script in nested_script_strategy(30)) {
        let db = TestDatabase::new();
        db.execute("CREATE TABLE t(v INTEGER)").unwrap();

        let mut current = None;
        for op in &script {
            apply_script(&db, "t", std::slice::from_ref(op)).unwrap();
            if db.is_in_transaction() {
                let id = db.get_handle().unwrap().id();
                prop_assert_eq!(*current.get_or_insert(id), id);
            } else {
                current = None;
            }
        }
        prop_assert_eq!(db.transaction_depth(), 0);
        prop_assert!(!db.is_in_transaction());

        let rows: Vec<i64> = db
            .with_handle(|h| {
                let mut stmt = h.connection().prepare("SELECT v FROM t ORDER BY rowid")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<i64>, _>>()?;
                Ok(rows)
            })
            .unwrap();
        prop_assert_eq!(rows, expected_rows(&script));
    }
}

#[test]
fn transaction_keeps_its_handle_across_levels() {
    let db = TestDatabase::new();
    db.execute("CREATE TABLE t(v INTEGER)").unwrap();

    db.begin_nested_transaction().unwrap();
    let outer = db.get_handle().unwrap().id();
    db.begin_nested_transaction().unwrap();
    db.begin_nested_transaction().unwrap();
    assert_eq!(db.get_handle().unwrap().id(), outer);
    assert_eq!(db.transaction_depth(), 3);
    db.rollback_nested_transaction().unwrap();
    db.commit_or_rollback_nested_transaction().unwrap();
    assert_eq!(db.get_handle().unwrap().id(), outer);
    db.commit_or_rollback_nested_transaction().unwrap();
    assert_eq!(db.transaction_depth(), 0);
}

#[test]
fn concurrent_leases_never_share_a_handle() {
    let db = TestDatabase::with_config(Config::new().max_handles(3));
    let result = stress_concurrent_handles(
        &db,
        &StressConfig {
            operations: 100,
            threads: 6,
            seed_rows: 10,
        },
    );
    assert_eq!(result.shared_leases, 0);
    assert_eq!(result.failed_ops, 0);
    assert!(result.distinct_handles <= 3);
}

#[test]
fn close_drains_and_reopens() {
    let db = TestDatabase::new();
    let first = db.get_handle().unwrap().id();

    let (leased_tx, leased_rx) = mpsc::channel();
    let holder = {
        let db = db.db.clone();
        thread::spawn(move || {
            let lease = db.get_handle().unwrap();
            leased_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(150));
            drop(lease);
        })
    };
    leased_rx.recv().unwrap();

    let fired = AtomicUsize::new(0);
    let started = Instant::now();
    db.close(|| {
        fired.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(db.alive_handles(), 0);
    holder.join().unwrap();

    assert_ne!(db.get_handle().unwrap().id(), first);
}

#[test]
fn blockade_holds_other_threads() {
    let db = TestDatabase::new();
    assert!(db.can_open());
    db.blockade();
    assert!(db.is_blockaded());

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let db = db.db.clone();
        let acquired = Arc::clone(&acquired);
        thread::spawn(move || {
            let lease = db.get_handle().unwrap();
            acquired.store(true, Ordering::SeqCst);
            drop(lease);
        })
    };

    thread::sleep(Duration::from_millis(150));
    assert!(!acquired.load(Ordering::SeqCst));

    db.unblockade();
    waiter.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
    assert!(!db.is_blockaded());
}

#[test]
fn blockade_timeout_is_reported() {
    let db = TestDatabase::with_config(
        Config::new().blockade_timeout(Some(Duration::from_millis(50))),
    );
    db.blockade();
    let other = db.db.clone();
    let result = thread::spawn(move || other.get_handle().map(|_| ()))
        .join()
        .unwrap();
    assert!(result.is_err());
    db.unblockade();
}

#[test]
fn async_migration_moves_every_row() {
    let db = TestDatabase::with_config(Config::new().migration_batch_size(64));
    db.run_transaction(|db| {
        db.execute("CREATE TABLE old_t(id INTEGER PRIMARY KEY, name TEXT, score REAL)")?;
        for i in 1..=1000 {
            db.execute(format!(
                "INSERT INTO old_t VALUES ({i}, 'name-{i}', {}.5)",
                i % 10
            ))?;
        }
        Ok(true)
    })
    .unwrap();

    db.add_migration_info(MigrationInfo::new("old_t", "new_t"))
        .unwrap();
    db.async_migration().unwrap();
    wait_until("migration", || db.migration_state() == MigrationState::Inactive);

    assert!(db.migration_error().is_none());
    assert_eq!(row_count(&db, "new_t").unwrap(), 1000);
    assert!(!db.table_exists("old_t").unwrap());
    let name: String = db
        .with_handle(|h| {
            Ok(h.connection()
                .query_row("SELECT name FROM new_t WHERE id = 777", [], |r| r.get(0))?)
        })
        .unwrap();
    assert_eq!(name, "name-777");

    assert!(!db.step_migration().unwrap());
}

#[test]
fn old_name_stays_writable_during_migration() {
    let db = TestDatabase::with_config(Config::new().migration_batch_size(10));
    populate(&db, "old_t", 50).unwrap();
    db.add_migration_info(MigrationInfo::new("old_t", "new_t"))
        .unwrap();

    assert!(db.step_migration().unwrap());
    db.execute("INSERT INTO old_t(payload) VALUES ('late')").unwrap();
    db.execute("UPDATE old_t SET payload = 'changed' WHERE id = 1")
        .unwrap();
    db.execute("DELETE FROM old_t WHERE id = 50").unwrap();
    assert_eq!(row_count(&db, "old_t").unwrap(), 50);

    while db.step_migration().unwrap() {}
    assert_eq!(row_count(&db, "new_t").unwrap(), 50);
    let payload: String = db
        .with_handle(|h| {
            Ok(h.connection()
                .query_row("SELECT payload FROM new_t WHERE id = 1", [], |r| r.get(0))?)
        })
        .unwrap();
    assert_eq!(payload, "changed");
}

#[test]
fn migration_cannot_step_inside_a_transaction() {
    let db = TestDatabase::new();
    populate(&db, "old_t", 2).unwrap();
    db.add_migration_info(MigrationInfo::new("old_t", "new_t"))
        .unwrap();

    db.begin_transaction().unwrap();
    let err = db.step_migration().unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }));
    db.rollback_transaction().unwrap();

    assert_eq!(db.migration_state(), MigrationState::Migrating(MigrationMode::Manual));
    assert_eq!(row_count(&db, "old_t").unwrap(), 2);
    while db.step_migration().unwrap() {}
    assert_eq!(db.migration_state(), MigrationState::Inactive);
    assert_eq!(row_count(&db, "new_t").unwrap(), 2);
    assert!(!db.table_exists("old_t").unwrap());
    assert!(!db.table_exists("sqlward_migrating_old_t").unwrap());
}

#[test]
fn failed_step_is_kept_and_resumed() {
    let db = TestDatabase::with_config(Config::new().migration_batch_size(10));
    db.execute(
        "CREATE TABLE old_t(id INTEGER PRIMARY KEY, v TEXT); \
         CREATE TABLE new_t(id INTEGER PRIMARY KEY, v TEXT CHECK (v <> 'bad')); \
         INSERT INTO old_t VALUES (1, 'ok'), (2, 'ok'), (3, 'bad'), (4, 'ok'), (5, 'ok')",
    )
    .unwrap();
    db.add_migration_info(MigrationInfo::new("old_t", "new_t"))
        .unwrap();

    let err = db.step_migration().unwrap_err();
    assert!(matches!(err, CoreError::MigrationFailed { .. }));
    assert_eq!(db.migration_state(), MigrationState::Migrating(MigrationMode::Manual));
    let recorded = db.migration_error().unwrap();
    assert!(recorded.message.contains("old_t"));
    assert_eq!(row_count(&db, "new_t").unwrap(), 0);
    assert_eq!(row_count(&db, "old_t").unwrap(), 5);

    db.execute("UPDATE old_t SET v = 'fixed' WHERE id = 3").unwrap();
    while db.step_migration().unwrap() {}
    assert!(db.migration_error().is_none());
    assert_eq!(db.migration_state(), MigrationState::Inactive);
    assert_eq!(row_count(&db, "new_t").unwrap(), 5);
}

#[test]
fn backup_then_retrieve_recovers_everything() {
    let (db, tables) = scenarios::multi_table_database(3, 120);
    db.filter_backup(|table| table != "table_2");
    db.backup().unwrap();
    assert!(db.can_retrieve());

    let mut last_progress = 0.0;
    let score = db
        .retrieve(|progress| {
            assert!(progress >= last_progress);
            last_progress = progress;
        })
        .unwrap();
    assert!((score - 1.0).abs() < f64::EPSILON);
    assert!((last_progress - 1.0).abs() < f64::EPSILON);
    for table in &tables {
        assert_eq!(row_count(&db, table).unwrap(), 120);
    }
}

#[test]
fn deposit_recovers_truncated_file_automatically() {
    let db = scenarios::populated_database(800);
    db.backup().unwrap();
    db.close(|| ()).unwrap();
    corrupt_by_truncation(&db.path(), 0.5).unwrap();
    assert!(db.is_corrupted());

    let truncated = std::fs::read(db.path()).unwrap();

    db.set_recovery_mode(RecoveryMode::Deposit);
    assert_eq!(db.recovery_mode_kind(), Some(RecoveryModeKind::Deposit));
    db.execute("SELECT count(*) FROM items").unwrap();

    assert!(!db.is_corrupted());
    assert_eq!(row_count(&db, "items").unwrap(), 800);
    let deposits = db.deposits().unwrap();
    assert_eq!(deposits.len(), 1);
    let deposited = deposits[0].join(db.path().file_name().unwrap());
    assert!(deposited.exists());
    assert_eq!(std::fs::read(&deposited).unwrap(), truncated);
}

#[test]
fn later_retrieval_keeps_deleted_rows_deleted() {
    let db = scenarios::populated_database(3);
    db.deposit().unwrap();
    db.retrieve(|_| {}).unwrap();
    assert_eq!(row_count(&db, "items").unwrap(), 3);

    db.execute("DELETE FROM items WHERE id = 2").unwrap();
    db.set_recovery_mode(RecoveryMode::Deposit);
    db.recover().unwrap();

    assert_eq!(row_count(&db, "items").unwrap(), 2);
    assert_eq!(db.deposits().unwrap().len(), 2);
}

#[test]
fn remove_mode_starts_over() {
    let db = scenarios::populated_database(20);
    db.close(|| ()).unwrap();
    corrupt_by_garbling(&db.path(), 0, 64).unwrap();

    db.set_recovery_mode(RecoveryMode::Remove);
    db.execute("CREATE TABLE fresh(v)").unwrap();
    assert!(db.table_exists("fresh").unwrap());
    assert!(!db.table_exists("items").unwrap());
}

#[test]
fn failures_land_in_the_threaded_register() {
    let db = TestDatabase::new();
    Database::clear_threaded_error();
    assert!(db.execute("INSERT INTO nowhere VALUES (1)").is_err());
    let error = Database::threaded_error().unwrap();
    assert!(error.message.contains("nowhere"));
}
