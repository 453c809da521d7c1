//! Safe wrapper around the raw SQLite C API (`libsqlite3-sys`).
//!
//! Every other module in this crate talks to the storage engine exclusively
//! through [`RawConnection`] and [`RawStatement`]; no other module contains
//! `unsafe`. This mirrors the raw-FFI-to-safe-wrapper split used by columnar
//! engine bindings elsewhere in this lineage: a guard owns the pointer, a
//! `Drop` impl releases it, and every fallible call is translated into this
//! crate's [`Error`] before it crosses the module boundary.

use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_void};
use std::ptr;

use libsqlite3_sys as ffi;

use crate::error::{Error, Result};
use crate::value::Value;

/// Open flags, mirroring the subset of `sqlite3_open_v2` flags this core uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(c_int);

impl OpenFlags {
    pub const READ_ONLY: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_READONLY);
    pub const READ_WRITE: OpenFlags = OpenFlags(ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE);

    pub fn with_no_mutex(self) -> Self {
        OpenFlags(self.0 | ffi::SQLITE_OPEN_NOMUTEX)
    }

    fn bits(self) -> c_int {
        self.0
    }
}

/// Step result of a prepared statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Row,
    Done,
}

/// Fixed-shape performance counters sampled from `sqlite3_db_status`, per §4.8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PerformanceInfo {
    pub table_page_read: i64,
    pub table_page_write: i64,
    pub index_page_read: i64,
    pub index_page_write: i64,
    pub overflow_page_read: i64,
    pub overflow_page_write: i64,
    pub cost_ns: i64,
}

fn check_code(conn: *mut ffi::sqlite3, code: c_int) -> Result<()> {
    if code == ffi::SQLITE_OK || code == ffi::SQLITE_ROW || code == ffi::SQLITE_DONE {
        return Ok(());
    }
    let extended = unsafe { ffi::sqlite3_extended_errcode(conn) };
    let message = unsafe {
        let ptr = ffi::sqlite3_errmsg(conn);
        if ptr.is_null() {
            "unknown engine error".to_string()
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    };
    Err(Error::from_engine_code(code, extended, message))
}

/// A single raw connection to one database file. Not `Send`/`Sync`: SQLite
/// connections are single-threaded by the engine's own contract, enforced
/// one layer up by `HandleBase`'s owning-thread check.
pub struct RawConnection {
    handle: *mut ffi::sqlite3,
    path: String,
}

impl RawConnection {
    pub fn open(path: &str, flags: OpenFlags) -> Result<Self> {
        let c_path = CString::new(path).map_err(|_| Error::misuse("path contains a NUL byte"))?;
        let mut handle: *mut ffi::sqlite3 = ptr::null_mut();
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut handle, flags.bits(), ptr::null()) };
        if rc != ffi::SQLITE_OK {
            let err = if handle.is_null() {
                Error::io(format!("failed to allocate connection handle for {path}"))
            } else {
                let err = check_code(handle, rc).unwrap_err();
                unsafe { ffi::sqlite3_close_v2(handle) };
                err
            };
            return Err(err.with_info("path", path));
        }
        unsafe { ffi::sqlite3_busy_timeout(handle, 0) };
        Ok(Self { handle, path: path.to_string() })
    }

    pub fn exec(&self, sql: &str) -> Result<()> {
        let c_sql = CString::new(sql).map_err(|_| Error::misuse("sql contains a NUL byte"))?;
        let rc = unsafe {
            ffi::sqlite3_exec(
                self.handle,
                c_sql.as_ptr(),
                None,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        check_code(self.handle, rc).map_err(|e| e.with_info("sql", sql))
    }

    pub fn prepare(&self, sql: &str) -> Result<RawStatement> {
        let c_sql = CString::new(sql).map_err(|_| Error::misuse("sql contains a NUL byte"))?;
        let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                self.handle,
                c_sql.as_ptr(),
                -1,
                &mut stmt,
                ptr::null_mut(),
            )
        };
        check_code(self.handle, rc).map_err(|e| e.with_info("sql", sql))?;
        if stmt.is_null() {
            return Err(Error::misuse("empty statement").with_info("sql", sql));
        }
        Ok(RawStatement { stmt, conn: self.handle })
    }

    pub fn changes(&self) -> i64 {
        unsafe { ffi::sqlite3_changes(self.handle) as i64 }
    }

    pub fn last_insert_rowid(&self) -> i64 {
        unsafe { ffi::sqlite3_last_insert_rowid(self.handle) }
    }

    pub fn is_readonly(&self, db_name: &str) -> bool {
        let c_name = match CString::new(db_name) {
            Ok(n) => n,
            Err(_) => return false,
        };
        unsafe { ffi::sqlite3_db_readonly(self.handle, c_name.as_ptr()) == 1 }
    }

    pub fn interrupt(&self) {
        unsafe { ffi::sqlite3_interrupt(self.handle) };
    }

    pub fn set_busy_timeout_ms(&self, ms: i32) {
        unsafe { ffi::sqlite3_busy_timeout(self.handle, ms) };
    }

    /// Installs a no-op busy handler (`ffi::sqlite3_busy_handler` with a null
    /// callback disables the built-in timeout so the coordinator's own
    /// backoff loop in §4.4 is solely responsible for retries).
    pub fn disable_builtin_busy_handler(&self) {
        unsafe { ffi::sqlite3_busy_handler(self.handle, None, ptr::null_mut()) };
    }

    pub fn db_status_cache_used(&self) -> i64 {
        let mut current: c_int = 0;
        let mut highwater: c_int = 0;
        unsafe {
            ffi::sqlite3_db_status(self.handle, ffi::SQLITE_DBSTATUS_CACHE_USED, &mut current, &mut highwater, 0)
        };
        current as i64
    }

    pub fn raw(&self) -> *mut ffi::sqlite3 {
        self.handle
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for RawConnection {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { ffi::sqlite3_close_v2(self.handle) };
        }
    }
}

/// A prepared statement bound to the connection that created it. The
/// connection pointer is kept only to translate step/bind failures into
/// an `Error` with the engine's message text; ownership remains with the
/// `RawConnection` that must outlive every `RawStatement` it produced
/// (guaranteed by `HandleBase`, which finalizes statements before close).
pub struct RawStatement {
    stmt: *mut ffi::sqlite3_stmt,
    conn: *mut ffi::sqlite3,
}

impl RawStatement {
    pub fn step(&mut self) -> Result<StepResult> {
        let rc = unsafe { ffi::sqlite3_step(self.stmt) };
        match rc {
            ffi::SQLITE_ROW => Ok(StepResult::Row),
            ffi::SQLITE_DONE => Ok(StepResult::Done),
            other => Err(check_code(self.conn, other).unwrap_err()),
        }
    }

    pub fn reset(&mut self) -> Result<()> {
        let rc = unsafe { ffi::sqlite3_reset(self.stmt) };
        check_code(self.conn, rc)
    }

    pub fn clear_bindings(&mut self) {
        unsafe { ffi::sqlite3_clear_bindings(self.stmt) };
    }

    pub fn column_count(&self) -> i32 {
        unsafe { ffi::sqlite3_column_count(self.stmt) }
    }

    pub fn column_name(&self, index: i32) -> String {
        unsafe {
            let ptr = ffi::sqlite3_column_name(self.stmt, index);
            if ptr.is_null() {
                String::new()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        }
    }

    pub fn column_value(&self, index: i32) -> Value {
        unsafe {
            match ffi::sqlite3_column_type(self.stmt, index) {
                ffi::SQLITE_INTEGER => Value::Integer(ffi::sqlite3_column_int64(self.stmt, index)),
                ffi::SQLITE_FLOAT => Value::Real(ffi::sqlite3_column_double(self.stmt, index)),
                ffi::SQLITE_TEXT => {
                    let ptr = ffi::sqlite3_column_text(self.stmt, index);
                    let len = ffi::sqlite3_column_bytes(self.stmt, index) as usize;
                    if ptr.is_null() {
                        Value::Text(String::new())
                    } else {
                        let slice = std::slice::from_raw_parts(ptr, len);
                        Value::Text(String::from_utf8_lossy(slice).into_owned())
                    }
                }
                ffi::SQLITE_BLOB => {
                    let ptr = ffi::sqlite3_column_blob(self.stmt, index);
                    let len = ffi::sqlite3_column_bytes(self.stmt, index) as usize;
                    if ptr.is_null() || len == 0 {
                        Value::Blob(Vec::new())
                    } else {
                        let slice = std::slice::from_raw_parts(ptr as *const u8, len);
                        Value::Blob(slice.to_vec())
                    }
                }
                _ => Value::Null,
            }
        }
    }

    pub fn bind(&mut self, index: i32, value: &Value) -> Result<()> {
        let rc = unsafe {
            match value {
                Value::Null => ffi::sqlite3_bind_null(self.stmt, index),
                Value::Integer(i) => ffi::sqlite3_bind_int64(self.stmt, index, *i),
                Value::Real(r) => ffi::sqlite3_bind_double(self.stmt, index, *r),
                Value::Text(s) => ffi::sqlite3_bind_text(
                    self.stmt,
                    index,
                    s.as_ptr() as *const i8,
                    s.len() as c_int,
                    ffi::SQLITE_TRANSIENT(),
                ),
                Value::Blob(b) => ffi::sqlite3_bind_blob(
                    self.stmt,
                    index,
                    b.as_ptr() as *const c_void,
                    b.len() as c_int,
                    ffi::SQLITE_TRANSIENT(),
                ),
            }
        };
        check_code(self.conn, rc)
    }

    pub fn bind_parameter_count(&self) -> i32 {
        unsafe { ffi::sqlite3_bind_parameter_count(self.stmt) }
    }
}

impl Drop for RawStatement {
    fn drop(&mut self) {
        if !self.stmt.is_null() {
            unsafe { ffi::sqlite3_finalize(self.stmt) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_exec_and_query_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t.db");
        let conn = RawConnection::open(path.to_str().unwrap(), OpenFlags::READ_WRITE).unwrap();
        conn.exec("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)").unwrap();
        let mut stmt = conn.prepare("INSERT INTO t(id, v) VALUES (?, ?)").unwrap();
        stmt.bind(1, &Value::Integer(1)).unwrap();
        stmt.bind(2, &Value::Text("a".into())).unwrap();
        assert_eq!(stmt.step().unwrap(), StepResult::Done);
        assert_eq!(conn.changes(), 1);
        assert_eq!(conn.last_insert_rowid(), 1);

        let mut select = conn.prepare("SELECT id, v FROM t").unwrap();
        assert_eq!(select.step().unwrap(), StepResult::Row);
        assert_eq!(select.column_value(0), Value::Integer(1));
        assert_eq!(select.column_value(1), Value::Text("a".into()));
        assert_eq!(select.step().unwrap(), StepResult::Done);
    }

    #[test]
    fn bad_sql_surfaces_as_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t.db");
        let conn = RawConnection::open(path.to_str().unwrap(), OpenFlags::READ_WRITE).unwrap();
        let err = conn.prepare("NOT SQL AT ALL").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Generic);
    }
}
