//! Integration coverage for RepairEngine against a deliberately corrupted
//! file (§8 S4: corrupt one page, deposit, retrieve, verify surviving rows).

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use stratum::{Config, Database};

#[test]
fn retrieve_recovers_rows_survives_one_zeroed_page() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("corrupt.db");
    let db = Database::open(Config { path: db_path.clone(), ..Config::default() }).unwrap();

    {
        let mut h = db.get_handle(true).unwrap();
        h.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        for i in 0..200 {
            h.execute(&format!("INSERT INTO t(id, v) VALUES ({i}, 'row-{i}')")).unwrap();
        }
    }
    db.backup(|_| true).unwrap();
    db.close(|| {});

    // Zero out a page deep enough in the file to hit table data, not the
    // schema root page.
    let page_size = 4096u64;
    let mut file = OpenOptions::new().write(true).open(&db_path).unwrap();
    file.seek(SeekFrom::Start(page_size * 4)).unwrap();
    file.write_all(&vec![0u8; page_size as usize]).unwrap();
    drop(file);

    let fresh_path = dir.path().join("recovered.db");
    let fresh = Database::open(Config { path: fresh_path, ..Config::default() }).unwrap();

    let mut last_pct = 0.0_f64;
    let score = {
        // retrieve reads the material captured from db_path and writes into
        // fresh's own handle, so we drive it through the lower-level API.
        let mut handle = fresh.get_handle(true).unwrap();
        stratum::repair::retrieve(&mut handle, db_path.to_str().unwrap(), |pct, _inc| {
            assert!(pct >= last_pct);
            last_pct = pct;
        })
        .unwrap()
    };

    assert!(score > 0.0 && score <= 1.0);

    let mut h = fresh.get_handle(false).unwrap();
    h.prepare_main("SELECT COUNT(*) FROM t").unwrap();
    h.step_main().unwrap();
    let recovered = h.row_main().unwrap()[0].as_integer().unwrap();
    assert!(recovered > 0, "expected at least some rows to survive the corruption");
    assert!(recovered <= 200);
}
