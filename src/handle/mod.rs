//! HandleBase (C1): wraps one raw engine connection.
//!
//! Owns the connection, the table of live prepared statements, the current
//! error slot, and the transaction-nesting bookkeeping that
//! `TransactionCoordinator` drives from the outside. Everything here that
//! touches the engine goes through [`crate::engine::RawConnection`]; nothing
//! in this module is `unsafe`.

pub mod category;

use std::collections::HashMap;
use std::thread::ThreadId;
use std::time::Instant;

use crate::engine::{OpenFlags, PerformanceInfo, RawConnection, RawStatement, StepResult};
use crate::error::{Error, Result};
use crate::observability;
use crate::value::{Row, Value};

pub use category::HandleCategory;

/// Handle to one prepared statement other than the handle's "main" one
/// (§4.1: the main statement is bound to the handle's lifetime for
/// convenience `execute` semantics; additional ones are tracked here for
/// mass-finalize on close).
pub type StatementId = u64;

/// One connection to one database file.
pub struct HandleBase {
    conn: RawConnection,
    path: String,
    category: HandleCategory,
    tag: Option<i64>,
    main_statement: Option<RawStatement>,
    main_sql: Option<String>,
    statements: HashMap<StatementId, RawStatement>,
    statement_sql: HashMap<StatementId, String>,
    next_statement_id: StatementId,
    last_error: Option<Error>,
    depth: u32,
    ever_rolled_back: bool,
    owner: ThreadId,
}

impl HandleBase {
    pub fn open(path: &str, category: HandleCategory) -> Result<Self> {
        let flags = if category.is_read_only() {
            OpenFlags::READ_ONLY
        } else {
            OpenFlags::READ_WRITE
        }
        .with_no_mutex();
        let conn = RawConnection::open(path, flags)?;
        conn.disable_builtin_busy_handler();
        Ok(Self {
            conn,
            path: path.to_string(),
            category,
            tag: None,
            main_statement: None,
            main_sql: None,
            statements: HashMap::new(),
            statement_sql: HashMap::new(),
            next_statement_id: 1,
            last_error: None,
            depth: 0,
            ever_rolled_back: false,
            owner: std::thread::current().id(),
        })
    }

    fn check_owner(&self) -> Result<()> {
        if std::thread::current().id() != self.owner {
            return Err(Error::misuse("handle used from a thread other than the one that opened it"));
        }
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn category(&self) -> HandleCategory {
        self.category
    }

    pub fn tag(&self) -> Option<i64> {
        self.tag
    }

    pub fn set_tag(&mut self, tag: i64) {
        self.tag = Some(tag);
    }

    fn handle_id(&self) -> i64 {
        self.conn.raw() as i64
    }

    /// `prepare` on the main statement is idempotent: an already-prepared
    /// statement is finalized first (§4.1).
    pub fn prepare_main(&mut self, sql: &str) -> Result<()> {
        self.check_owner()?;
        self.main_statement = None;
        self.main_statement = Some(self.conn.prepare(sql).map_err(|e| self.record(e))?);
        self.main_sql = Some(sql.to_string());
        observability::global().trace_sql(&self.path, self.handle_id(), sql, "prepare_main");
        Ok(())
    }

    pub fn prepare(&mut self, sql: &str) -> Result<StatementId> {
        self.check_owner()?;
        let stmt = self.conn.prepare(sql).map_err(|e| self.record(e))?;
        let id = self.next_statement_id;
        self.next_statement_id += 1;
        self.statements.insert(id, stmt);
        self.statement_sql.insert(id, sql.to_string());
        observability::global().trace_sql(&self.path, self.handle_id(), sql, "prepare");
        Ok(id)
    }

    fn statement_mut(&mut self, id: StatementId) -> Result<&mut RawStatement> {
        self.statements
            .get_mut(&id)
            .ok_or_else(|| Error::misuse("unknown statement id"))
    }

    pub fn bind(&mut self, id: StatementId, index: i32, value: &Value) -> Result<()> {
        self.statement_mut(id)?.bind(index, value).map_err(|e| self.record(e))
    }

    pub fn bind_main(&mut self, index: i32, value: &Value) -> Result<()> {
        self.main_statement
            .as_mut()
            .ok_or_else(|| Error::misuse("no main statement prepared"))?
            .bind(index, value)
            .map_err(|e| self.record(e))
    }

    pub fn step(&mut self, id: StatementId) -> Result<StepResult> {
        let started = Instant::now();
        let r = self.statement_mut(id)?.step().map_err(|e| self.record(e))?;
        let sql = self.statement_sql.get(&id).cloned().unwrap_or_default();
        observability::global().trace_sql(&self.path, self.handle_id(), &sql, "step");
        self.trace_step_performance(started);
        Ok(r)
    }

    pub fn step_main(&mut self) -> Result<StepResult> {
        let started = Instant::now();
        let r = self
            .main_statement
            .as_mut()
            .ok_or_else(|| Error::misuse("no main statement prepared"))?
            .step()
            .map_err(|e| self.record(e))?;
        let sql = self.main_sql.clone().unwrap_or_default();
        observability::global().trace_sql(&self.path, self.handle_id(), &sql, "step_main");
        self.trace_step_performance(started);
        Ok(r)
    }

    /// Best-effort `PerformanceInfo` dispatch: `cost_ns` is real wall-clock
    /// timing around the step, but the page-count fields are left at 0.
    /// SQLite's public C API does not expose per-statement page attribution
    /// outside of a custom VFS, unlike the instrumented pager this field
    /// layout was modeled on, so those fields are honestly zeroed rather
    /// than faked.
    fn trace_step_performance(&self, started: Instant) {
        let info = PerformanceInfo {
            table_page_read: 0,
            table_page_write: 0,
            index_page_read: 0,
            index_page_write: 0,
            overflow_page_read: 0,
            overflow_page_write: 0,
            cost_ns: started.elapsed().as_nanos() as i64,
        };
        observability::global().trace_performance(&self.path, &info);
    }

    pub fn reset(&mut self, id: StatementId) -> Result<()> {
        self.statement_mut(id)?.reset().map_err(|e| self.record(e))
    }

    pub fn finalize(&mut self, id: StatementId) {
        self.statements.remove(&id);
        self.statement_sql.remove(&id);
    }

    pub fn finalize_main(&mut self) {
        self.main_statement = None;
        self.main_sql = None;
    }

    /// Returns the current row of the main statement as a `Row`.
    pub fn row_main(&self) -> Option<Row> {
        let stmt = self.main_statement.as_ref()?;
        let n = stmt.column_count();
        Some((0..n).map(|i| stmt.column_value(i)).collect())
    }

    pub fn row(&self, id: StatementId) -> Option<Row> {
        let stmt = self.statements.get(&id)?;
        let n = stmt.column_count();
        Some((0..n).map(|i| stmt.column_value(i)).collect())
    }

    /// `execute` = prepare; step-until-done; finalize, wrapped in a
    /// `TransactionGuard` scope so a mid-transaction failure rolls back
    /// instead of leaving the handle in a broken uncommitted state (§4.1,
    /// §4.4).
    pub fn execute(&mut self, sql: &str) -> Result<()> {
        crate::txn::with_transaction_guard(self, |h| h.execute_inner(sql))
    }

    fn execute_inner(&mut self, sql: &str) -> Result<()> {
        self.check_owner()?;
        let started = Instant::now();
        let mut stmt = self.conn.prepare(sql).map_err(|e| self.record(e))?;
        observability::global().trace_sql(&self.path, self.handle_id(), sql, "execute");
        let result = loop {
            match stmt.step() {
                Ok(StepResult::Done) => break Ok(()),
                Ok(StepResult::Row) => continue,
                Err(e) => break Err(self.record(e)),
            }
        };
        self.trace_step_performance(started);
        result
    }

    pub fn exec_direct(&mut self, sql: &str) -> Result<()> {
        self.conn.exec(sql).map_err(|e| self.record(e))
    }

    pub fn is_readonly(&self) -> bool {
        self.conn.is_readonly("main")
    }

    pub fn get_changes(&self) -> i64 {
        self.conn.changes()
    }

    pub fn get_last_inserted_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    pub fn interrupt(&self) {
        self.conn.interrupt();
    }

    pub fn set_error(&mut self, error: Error) {
        self.last_error = Some(error);
    }

    fn record(&mut self, error: Error) -> Error {
        let error = error.with_info("path", self.path.clone());
        self.last_error = Some(error.clone());
        observability::global().trace_error(&error);
        error
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub fn raw(&self) -> &RawConnection {
        &self.conn
    }

    /// Closes and reopens the underlying connection with the given flags,
    /// used by the reconfiguration protocol's "basic" read-only retry
    /// (§4.2: force write-main-DB enabled for one reopen).
    pub fn reopen_with_flags(&mut self, flags: crate::engine::OpenFlags) -> Result<()> {
        self.main_statement = None;
        self.statements.clear();
        self.conn = RawConnection::open(&self.path, flags)?;
        self.conn.disable_builtin_busy_handler();
        Ok(())
    }

    // --- transaction primitives driven by TransactionCoordinator ---

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn begin(&mut self) -> Result<()> {
        self.exec_direct("BEGIN IMMEDIATE")?;
        self.depth = 1;
        self.ever_rolled_back = false;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.exec_direct("COMMIT")?;
        self.depth = 0;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.exec_direct("ROLLBACK")?;
        self.depth = 0;
        self.ever_rolled_back = false;
        Ok(())
    }

    pub fn savepoint(&mut self, name: &str) -> Result<()> {
        self.exec_direct(&format!("SAVEPOINT {name}"))?;
        self.depth += 1;
        Ok(())
    }

    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.exec_direct(&format!("RELEASE SAVEPOINT {name}"))?;
        self.depth = self.depth.saturating_sub(1);
        Ok(())
    }

    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.exec_direct(&format!("ROLLBACK TO SAVEPOINT {name}"))?;
        self.exec_direct(&format!("RELEASE SAVEPOINT {name}"))?;
        self.depth = self.depth.saturating_sub(1);
        self.ever_rolled_back = true;
        Ok(())
    }

    pub fn ever_rolled_back(&self) -> bool {
        self.ever_rolled_back
    }
}

impl Drop for HandleBase {
    fn drop(&mut self) {
        self.statements.clear();
        self.main_statement = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> (tempfile::TempDir, HandleBase) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.db");
        let handle = HandleBase::open(path.to_str().unwrap(), HandleCategory::Normal).unwrap();
        (dir, handle)
    }

    #[test]
    fn execute_and_query_main_statement() {
        let (_dir, mut h) = open_tmp();
        h.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        h.execute("INSERT INTO t(id, v) VALUES (1, 'a')").unwrap();
        h.prepare_main("SELECT id, v FROM t").unwrap();
        assert_eq!(h.step_main().unwrap(), StepResult::Row);
        assert_eq!(h.row_main().unwrap(), vec![Value::Integer(1), Value::Text("a".into())]);
    }

    #[test]
    fn nested_transaction_depth_tracks_savepoints() {
        let (_dir, mut h) = open_tmp();
        h.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)").unwrap();
        h.begin().unwrap();
        assert_eq!(h.depth(), 1);
        h.savepoint("sp1").unwrap();
        assert_eq!(h.depth(), 2);
        h.rollback_to_savepoint("sp1").unwrap();
        assert_eq!(h.depth(), 1);
        assert!(h.ever_rolled_back());
        h.commit().unwrap();
        assert_eq!(h.depth(), 0);
    }

    #[test]
    fn execute_failure_mid_transaction_rolls_back_automatically() {
        let (_dir, mut h) = open_tmp();
        h.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        h.begin().unwrap();
        h.execute("INSERT INTO t(id, v) VALUES (1, 'a')").unwrap();
        assert_eq!(h.depth(), 1);

        let err = h.execute("INSERT INTO t(id, v) VALUES (1, 'b')").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Constraint);
        assert_eq!(h.depth(), 0, "TransactionGuard should roll back the open transaction on failure");

        h.execute("INSERT INTO t(id, v) VALUES (2, 'c')").unwrap();
        h.prepare_main("SELECT COUNT(*) FROM t").unwrap();
        h.step_main().unwrap();
        assert_eq!(h.row_main().unwrap()[0].as_integer(), Some(1));
    }
}
