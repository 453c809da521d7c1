//! TransactionCoordinator (C4): nested transaction state machine and
//! busy-retry policy (§4.4).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind, Result};
use crate::handle::HandleBase;

static SAVEPOINT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_savepoint_name() -> String {
    format!("stratum_sp_{}", SAVEPOINT_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Retries `f` on `Busy`/`Locked` with exponential backoff (base 1ms,
/// doubling, capped at 50ms), up to an overall deadline: 5s for background
/// callers, 1s for foreground ones (see SPEC_FULL.md's busy-retry decision).
pub fn with_busy_retry<T>(background: bool, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let budget = if background { Duration::from_secs(5) } else { Duration::from_secs(1) };
    let deadline = Instant::now() + budget;
    let mut delay = Duration::from_millis(1);
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if matches!(e.kind, ErrorKind::Busy | ErrorKind::Locked) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(e);
                }
                let remaining = deadline - now;
                std::thread::sleep(delay.min(remaining));
                delay = (delay * 2).min(Duration::from_millis(50));
            }
            Err(e) => return Err(e),
        }
    }
}

/// `runTransaction(f)`: begin; commit if `f` returns true, else rollback.
pub fn run_transaction(handle: &mut HandleBase, f: impl FnOnce(&mut HandleBase) -> Result<bool>) -> Result<()> {
    with_busy_retry(false, || handle.begin())?;
    match f(handle) {
        Ok(true) => with_busy_retry(false, || handle.commit()),
        Ok(false) => handle.rollback(),
        Err(e) => {
            let _ = handle.rollback();
            Err(e)
        }
    }
}

/// `runNestedTransaction(f)`: issues a savepoint if already inside a
/// transaction, otherwise begins one. A `false`/error return releases back
/// to the state before this call, never further.
pub fn run_nested_transaction(
    handle: &mut HandleBase,
    f: impl FnOnce(&mut HandleBase) -> Result<bool>,
) -> Result<()> {
    let nested = handle.depth() > 0;
    let savepoint = next_savepoint_name();

    if nested {
        with_busy_retry(false, || handle.savepoint(&savepoint))?;
    } else {
        with_busy_retry(false, || handle.begin())?;
    }

    match f(handle) {
        Ok(true) => {
            if nested {
                handle.release_savepoint(&savepoint)
            } else {
                with_busy_retry(false, || handle.commit())
            }
        }
        Ok(false) => {
            if nested {
                handle.rollback_to_savepoint(&savepoint)
            } else {
                handle.rollback()
            }
        }
        Err(e) => {
            let _ = if nested {
                handle.rollback_to_savepoint(&savepoint)
            } else {
                handle.rollback()
            };
            Err(e)
        }
    }
}

/// `runPauseableTransactionWithOneLoop(f)`: repeatedly invokes `f` inside a
/// single transaction. Whenever `waiting` reports a blocked foreground
/// caller, commits, yields for 100µs, and re-begins so the waiter gets a
/// window to run (§4.4, §8 S6).
pub fn run_pauseable_transaction_with_one_loop(
    handle: &mut HandleBase,
    waiting: impl Fn() -> bool,
    mut f: impl FnMut(&mut HandleBase, &mut bool, bool) -> Result<()>,
) -> Result<()> {
    with_busy_retry(true, || handle.begin())?;
    let mut stop = false;
    let mut is_new = true;

    loop {
        f(handle, &mut stop, is_new)?;
        is_new = false;
        if stop {
            break;
        }
        if waiting() {
            with_busy_retry(true, || handle.commit())?;
            std::thread::sleep(Duration::from_micros(100));
            with_busy_retry(true, || handle.begin())?;
            is_new = true;
        }
    }

    with_busy_retry(true, || handle.commit())
}

/// A `TransactionGuard`-equivalent scope: rolls back automatically if the
/// wrapped closure returns an error and the handle is still mid-transaction,
/// leaving a successful-but-unchanged-depth exit as a no-op (§4.4).
pub fn with_transaction_guard<T>(handle: &mut HandleBase, f: impl FnOnce(&mut HandleBase) -> Result<T>) -> Result<T> {
    match f(handle) {
        Ok(v) => Ok(v),
        Err(e) => {
            if handle.depth() > 0 {
                let _ = handle.rollback();
            }
            Err(e)
        }
    }
}

pub fn busy_budget_exhausted(err: &Error) -> bool {
    matches!(err.kind, ErrorKind::Busy | ErrorKind::Locked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleCategory;
    use crate::value::Value;

    fn open_tmp() -> (tempfile::TempDir, HandleBase) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.db");
        let mut h = HandleBase::open(path.to_str().unwrap(), HandleCategory::Normal).unwrap();
        h.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)").unwrap();
        (dir, h)
    }

    fn count(h: &mut HandleBase) -> i64 {
        h.prepare_main("SELECT COUNT(*) FROM t").unwrap();
        h.step_main().unwrap();
        let row = h.row_main().unwrap();
        h.finalize_main();
        row[0].as_integer().unwrap()
    }

    #[test]
    fn nested_rollback_only_undoes_inner_insert() {
        let (_dir, mut h) = open_tmp();
        run_nested_transaction(&mut h, |h| {
            h.execute("INSERT INTO t(id) VALUES (1)").unwrap();
            run_nested_transaction(h, |h| {
                h.execute("INSERT INTO t(id) VALUES (2)").unwrap();
                Ok(false)
            })
            .unwrap();
            Ok(true)
        })
        .unwrap();

        assert_eq!(count(&mut h), 1);
        h.prepare_main("SELECT id FROM t").unwrap();
        h.step_main().unwrap();
        assert_eq!(h.row_main().unwrap(), vec![Value::Integer(1)]);
    }

    #[test]
    fn outer_false_undoes_everything() {
        let (_dir, mut h) = open_tmp();
        run_transaction(&mut h, |h| {
            h.execute("INSERT INTO t(id) VALUES (1)").unwrap();
            Ok(false)
        })
        .unwrap();
        assert_eq!(count(&mut h), 0);
    }

    #[test]
    fn pauseable_loop_inserts_all_rows_and_stops() {
        let (_dir, mut h) = open_tmp();
        let mut remaining = 5;
        run_pauseable_transaction_with_one_loop(
            &mut h,
            || false,
            |h, stop, _is_new| {
                h.execute(&format!("INSERT INTO t(id) VALUES ({})", 100 - remaining))?;
                remaining -= 1;
                if remaining == 0 {
                    *stop = true;
                }
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(count(&mut h), 5);
    }
}
