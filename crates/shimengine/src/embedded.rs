//! Thin safe-ish wrapper over the embedded library's own C API (spec.md §1: "the embedded
//! library itself ... [is a] pre-existing librar[y] consumed through [its] documented API" —
//! this module is the one place that calls it directly, everything else in this crate goes
//! through it).
//!
//! Every statement the engine hands back to the host is backed by a real embedded statement
//! ("shadow statement", per the glossary) even when its rows actually come from the remote
//! side, so the host's metadata calls (`sql`, `bind_parameter_count`, ...) always have
//! something real to answer against.

use libsqlite3_sys as ffi;
use std::ffi::{CStr, CString};
use std::os::raw::c_int;
use std::ptr;

use crate::error::{EngineError, EngineResult};

pub struct EmbeddedConnection {
    pub(crate) raw: *mut ffi::sqlite3,
}

unsafe impl Send for EmbeddedConnection {}
unsafe impl Sync for EmbeddedConnection {}

pub struct EmbeddedStatement {
    pub(crate) raw: *mut ffi::sqlite3_stmt,
}

unsafe impl Send for EmbeddedStatement {}

impl EmbeddedConnection {
    pub fn open(path: &str) -> EngineResult<Self> {
        let c_path = CString::new(path).map_err(|_| EngineError::Embedded {
            code: ffi::SQLITE_MISUSE,
            message: "path contains a NUL byte".to_string(),
        })?;
        let mut raw: *mut ffi::sqlite3 = ptr::null_mut();
        let rc = unsafe { ffi::sqlite3_open(c_path.as_ptr(), &mut raw) };
        if rc != ffi::SQLITE_OK {
            let message = last_error_message(raw);
            unsafe { ffi::sqlite3_close(raw) };
            return Err(EngineError::Embedded { code: rc, message });
        }
        Ok(EmbeddedConnection { raw })
    }

    /// Compile `sql` into a shadow statement, or the placeholder `SELECT 1 WHERE 0` if `sql`
    /// is empty — used for no-op statements per the prepare algorithm's step 1.
    pub fn prepare(&self, sql: &str) -> EngineResult<EmbeddedStatement> {
        let c_sql = CString::new(sql).map_err(|_| EngineError::Embedded {
            code: ffi::SQLITE_MISUSE,
            message: "sql contains a NUL byte".to_string(),
        })?;
        let mut raw: *mut ffi::sqlite3_stmt = ptr::null_mut();
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(self.raw, c_sql.as_ptr(), -1, &mut raw, ptr::null_mut())
        };
        if rc != ffi::SQLITE_OK {
            return Err(EngineError::Embedded { code: rc, message: last_error_message(self.raw) });
        }
        Ok(EmbeddedStatement { raw })
    }

    /// Look up a column by name via `table_info`, used by the prepare algorithm to detect an
    /// `ALTER TABLE ADD COLUMN` that targets an already-present column.
    pub fn has_column(&self, table: &str, column: &str) -> EngineResult<bool> {
        let stmt = self.prepare(&format!("SELECT 1 FROM pragma_table_info('{}') WHERE name = '{}'", table, column))?;
        Ok(stmt.step()? == StepOutcome::Row)
    }

    pub fn changes(&self) -> i64 {
        unsafe { ffi::sqlite3_changes64(self.raw) }
    }

    pub fn last_insert_rowid(&self) -> i64 {
        unsafe { ffi::sqlite3_last_insert_rowid(self.raw) }
    }

    pub fn errmsg(&self) -> String {
        last_error_message(self.raw)
    }

    pub fn errcode(&self) -> i32 {
        unsafe { ffi::sqlite3_errcode(self.raw) }
    }
}

impl Drop for EmbeddedConnection {
    fn drop(&mut self) {
        unsafe {
            ffi::sqlite3_close(self.raw);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Row,
    Done,
}

impl EmbeddedStatement {
    pub fn step(&self) -> EngineResult<StepOutcome> {
        match unsafe { ffi::sqlite3_step(self.raw) } {
            ffi::SQLITE_ROW => Ok(StepOutcome::Row),
            ffi::SQLITE_DONE => Ok(StepOutcome::Done),
            rc => Err(EngineError::Embedded { code: rc, message: "step failed".to_string() }),
        }
    }

    pub fn reset(&self) -> EngineResult<()> {
        let rc = unsafe { ffi::sqlite3_reset(self.raw) };
        if rc != ffi::SQLITE_OK {
            return Err(EngineError::Embedded { code: rc, message: "reset failed".to_string() });
        }
        Ok(())
    }

    pub fn clear_bindings(&self) {
        unsafe {
            ffi::sqlite3_clear_bindings(self.raw);
        }
    }

    pub fn bind_parameter_count(&self) -> usize {
        unsafe { ffi::sqlite3_bind_parameter_count(self.raw) as usize }
    }

    pub fn bind_parameter_name(&self, index: usize) -> Option<String> {
        let ptr = unsafe { ffi::sqlite3_bind_parameter_name(self.raw, index as c_int) };
        if ptr.is_null() {
            return None;
        }
        let c_str = unsafe { CStr::from_ptr(ptr) };
        Some(c_str.to_string_lossy().into_owned())
    }

    pub fn sql(&self) -> Option<String> {
        let ptr = unsafe { ffi::sqlite3_sql(self.raw) };
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }

    pub fn bind_null(&self, index: usize) -> EngineResult<()> {
        check(unsafe { ffi::sqlite3_bind_null(self.raw, index as c_int) })
    }

    pub fn bind_int64(&self, index: usize, value: i64) -> EngineResult<()> {
        check(unsafe { ffi::sqlite3_bind_int64(self.raw, index as c_int, value) })
    }

    pub fn bind_double(&self, index: usize, value: f64) -> EngineResult<()> {
        check(unsafe { ffi::sqlite3_bind_double(self.raw, index as c_int, value) })
    }

    pub fn bind_text(&self, index: usize, value: &str) -> EngineResult<()> {
        check(unsafe {
            ffi::sqlite3_bind_text(
                self.raw,
                index as c_int,
                value.as_ptr() as *const i8,
                value.len() as c_int,
                ffi::SQLITE_TRANSIENT(),
            )
        })
    }

    pub fn bind_blob(&self, index: usize, value: &[u8]) -> EngineResult<()> {
        check(unsafe {
            ffi::sqlite3_bind_blob(
                self.raw,
                index as c_int,
                value.as_ptr() as *const std::os::raw::c_void,
                value.len() as c_int,
                ffi::SQLITE_TRANSIENT(),
            )
        })
    }

    pub fn column_count(&self) -> usize {
        unsafe { ffi::sqlite3_column_count(self.raw) as usize }
    }

    pub fn data_count(&self) -> usize {
        unsafe { ffi::sqlite3_data_count(self.raw) as usize }
    }

    pub fn column_type(&self, index: usize) -> i32 {
        unsafe { ffi::sqlite3_column_type(self.raw, index as c_int) }
    }

    pub fn column_int64(&self, index: usize) -> i64 {
        unsafe { ffi::sqlite3_column_int64(self.raw, index as c_int) }
    }

    pub fn column_double(&self, index: usize) -> f64 {
        unsafe { ffi::sqlite3_column_double(self.raw, index as c_int) }
    }

    pub fn column_text(&self, index: usize) -> String {
        let ptr = unsafe { ffi::sqlite3_column_text(self.raw, index as c_int) };
        if ptr.is_null() {
            return String::new();
        }
        unsafe { CStr::from_ptr(ptr as *const i8) }.to_string_lossy().into_owned()
    }

    pub fn column_blob(&self, index: usize) -> Vec<u8> {
        let len = unsafe { ffi::sqlite3_column_bytes(self.raw, index as c_int) } as usize;
        let ptr = unsafe { ffi::sqlite3_column_blob(self.raw, index as c_int) };
        if ptr.is_null() || len == 0 {
            return Vec::new();
        }
        unsafe { std::slice::from_raw_parts(ptr as *const u8, len) }.to_vec()
    }

    pub fn column_bytes(&self, index: usize) -> usize {
        unsafe { ffi::sqlite3_column_bytes(self.raw, index as c_int) as usize }
    }

    pub fn column_name(&self, index: usize) -> Option<String> {
        let ptr = unsafe { ffi::sqlite3_column_name(self.raw, index as c_int) };
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }

    pub fn expanded_sql(&self) -> Option<String> {
        let ptr = unsafe { ffi::sqlite3_expanded_sql(self.raw) };
        if ptr.is_null() {
            return None;
        }
        let s = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
        unsafe { ffi::sqlite3_free(ptr as *mut std::os::raw::c_void) };
        Some(s)
    }

    pub fn stmt_readonly(&self) -> bool {
        unsafe { ffi::sqlite3_stmt_readonly(self.raw) != 0 }
    }

    pub fn stmt_busy(&self) -> bool {
        unsafe { ffi::sqlite3_stmt_busy(self.raw) != 0 }
    }

    pub fn db_handle(&self) -> *mut ffi::sqlite3 {
        unsafe { ffi::sqlite3_db_handle(self.raw) }
    }

    /// The raw embedded statement handle, for callers that need to forward straight into the
    /// embedded library's own C API (e.g. `sqlite3_column_value`) rather than going through one
    /// of the typed wrappers above.
    pub fn raw_ptr(&self) -> *mut ffi::sqlite3_stmt {
        self.raw
    }
}

impl Drop for EmbeddedStatement {
    fn drop(&mut self) {
        unsafe {
            ffi::sqlite3_finalize(self.raw);
        }
    }
}

fn check(rc: c_int) -> EngineResult<()> {
    if rc != ffi::SQLITE_OK {
        return Err(EngineError::Embedded { code: rc, message: "bind failed".to_string() });
    }
    Ok(())
}

fn last_error_message(raw: *mut ffi::sqlite3) -> String {
    if raw.is_null() {
        return "no connection".to_string();
    }
    let ptr = unsafe { ffi::sqlite3_errmsg(raw) };
    if ptr.is_null() {
        return "unknown error".to_string();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}
