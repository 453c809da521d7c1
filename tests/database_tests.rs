//! Black-box integration tests driving `Database` through its public API,
//! matching the way the existing test suite exercises the whole server.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use stratum::{CheckpointMode, Config, Database, Priority};

fn open(dir: &tempfile::TempDir, name: &str) -> Database {
    Database::open(Config {
        path: dir.path().join(name),
        ..Config::default()
    })
    .unwrap()
}

#[test]
fn open_write_close_reopen_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = open(&dir, "a.db");
        let mut h = db.get_handle(true).unwrap();
        h.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        h.execute("INSERT INTO t(id, v) VALUES (1, 'a')").unwrap();
        h.execute("INSERT INTO t(id, v) VALUES (2, 'b')").unwrap();
        db.close(|| {});
    }

    let db = open(&dir, "a.db");
    let mut h = db.get_handle(false).unwrap();
    h.prepare_main("SELECT id, v FROM t ORDER BY id").unwrap();
    let mut rows = Vec::new();
    loop {
        match h.step_main().unwrap() {
            stratum::engine::StepResult::Row => rows.push(h.row_main().unwrap()),
            stratum::engine::StepResult::Done => break,
        }
    }
    assert_eq!(rows.len(), 2);
}

#[test]
fn custom_config_round_trips_after_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, "b.db");

    let invoked = Arc::new(AtomicUsize::new(0));
    let i = invoked.clone();
    db.set_config(
        "audit",
        Priority::HIGH,
        Arc::new(move |_h| {
            i.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        None,
    );

    {
        let _h = db.get_handle(true).unwrap();
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 1);

    db.purge();
    {
        let _h = db.get_handle(true).unwrap();
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 2);
}

#[test]
fn checkpoint_does_not_error_on_a_fresh_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, "c.db");
    {
        let mut h = db.get_handle(true).unwrap();
        h.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)").unwrap();
    }
    db.checkpoint(CheckpointMode::Passive).unwrap();
}

#[test]
fn corruption_notifier_fires_once_on_bad_integrity_check() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, "d.db");
    {
        let mut h = db.get_handle(true).unwrap();
        h.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)").unwrap();
    }

    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    db.set_notification_when_corrupted(Arc::new(move |_p| {
        f.store(true, Ordering::SeqCst);
    }));

    // A genuinely corrupt file is exercised by the repair-engine tests;
    // here we only check that a clean database does not fire the notifier.
    assert!(db.check_integrity().unwrap());
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn migration_moves_all_rows_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    let legacy = open(&dir, "legacy.db");
    {
        let mut h = legacy.get_handle(true).unwrap();
        h.execute("CREATE TABLE old_t(id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        for i in 0..250 {
            h.execute(&format!("INSERT INTO old_t(id, v) VALUES ({i}, 'r{i}')")).unwrap();
        }
    }
    legacy.close(|| {});

    let target = open(&dir, "new.db");
    {
        let mut h = target.get_handle(true).unwrap();
        h.execute("CREATE TABLE new_t(id INTEGER PRIMARY KEY, v TEXT)").unwrap();
    }
    target.add_migration(
        "new_t",
        Some(dir.path().join("legacy.db").to_str().unwrap().to_string()),
        "old_t",
        None,
    );

    loop {
        match target.step_migration(false).unwrap() {
            stratum::StepOutcome::Idle | stratum::StepOutcome::Completed => break,
            stratum::StepOutcome::Advanced(_) => continue,
        }
    }

    assert!(target.is_migrated("new_t"));
    let mut h = target.get_handle(false).unwrap();
    h.prepare_main("SELECT COUNT(*) FROM new_t").unwrap();
    h.step_main().unwrap();
    assert_eq!(h.row_main().unwrap()[0].as_integer(), Some(250));
}

#[test]
fn auto_migration_config_drives_background_loop_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let legacy = open(&dir, "legacy2.db");
    {
        let mut h = legacy.get_handle(true).unwrap();
        h.execute("CREATE TABLE old_t(id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        for i in 0..30 {
            h.execute(&format!("INSERT INTO old_t(id, v) VALUES ({i}, 'r{i}')")).unwrap();
        }
    }
    legacy.close(|| {});

    let target = open(&dir, "new2.db");
    {
        let mut h = target.get_handle(true).unwrap();
        h.execute("CREATE TABLE new_t(id INTEGER PRIMARY KEY, v TEXT)").unwrap();
    }
    target.add_migration(
        "new_t",
        Some(dir.path().join("legacy2.db").to_str().unwrap().to_string()),
        "old_t",
        None,
    );

    // Force the next checkout to create a fresh handle: reconfiguration
    // (and so the "automigrate" config's invoke) only runs against
    // newly-opened handles, not idle ones reused as-is (§4.2).
    target.purge();
    target.enable_auto_migration(true);
    drop(target.get_handle(true).unwrap());

    let mut migrated = false;
    for _ in 0..200 {
        if target.is_migrated("new_t") {
            migrated = true;
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    assert!(migrated, "auto-migration did not complete in time");
    target.enable_auto_migration(false);
}
