//! `prepare` (three variants plus UTF-16), `bind`, `step`, `reset`, `finalize`, and the
//! statement metadata calls (spec.md §6, §4.2).

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_double, c_int, c_void};

use shimcore::types::{HostHandle, ParamValue};
use shimengine::engine::{self, StepResult};
use shimengine::EngineError;

use crate::connection::lookup_connection;
use crate::handle;
use crate::last_error::{borrow_str, clear_last_error, set_last_error};

fn ctx() -> &'static shimengine::ShimContext {
    shimengine::global()
}

unsafe fn prepare_common(
    db: *mut c_void,
    sql: *const c_char,
    stmt_out: *mut *mut c_void,
    tail_out: *mut *const c_char,
) -> c_int {
    clear_last_error();
    if !stmt_out.is_null() {
        *stmt_out = std::ptr::null_mut();
    }
    let Some((connection, embedded)) = lookup_connection(db) else {
        set_last_error("db handle not found");
        return libsqlite3_sys::SQLITE_MISUSE;
    };
    let sql_str = match borrow_str(sql, "sql") {
        Ok(s) => s,
        Err(()) => return libsqlite3_sys::SQLITE_MISUSE,
    };
    if !tail_out.is_null() {
        // Multi-statement batches are handled by `qshim_exec`; prepare itself always consumes
        // the whole input, so the tail always points at the terminating NUL.
        *tail_out = sql.add(sql_str.len());
    }

    let host_stmt = handle::mint();
    match engine::prepare(ctx(), &connection, &embedded, host_stmt, sql_str, false) {
        Ok(prepared) => {
            ctx().shadow_statements.lock().insert(host_stmt, prepared.shadow);
            connection.lock().last_error = Default::default();
            if !stmt_out.is_null() {
                *stmt_out = handle::to_ptr(host_stmt);
            }
            libsqlite3_sys::SQLITE_OK
        }
        Err(e) => {
            handle::release(host_stmt);
            let code = e.tracked_code();
            connection.lock().record_error(code, e.to_string());
            set_last_error(e.to_string());
            code
        }
    }
}

/// # Safety
/// `db` must be live; `sql` NUL-terminated; `stmt_out` writable.
#[no_mangle]
pub unsafe extern "C" fn qshim_prepare(db: *mut c_void, sql: *const c_char, _len: c_int, stmt_out: *mut *mut c_void, tail_out: *mut *const c_char) -> c_int {
    prepare_common(db, sql, stmt_out, tail_out)
}

/// # Safety
/// Same contract as `qshim_prepare`.
#[no_mangle]
pub unsafe extern "C" fn qshim_prepare_v2(db: *mut c_void, sql: *const c_char, _len: c_int, stmt_out: *mut *mut c_void, tail_out: *mut *const c_char) -> c_int {
    prepare_common(db, sql, stmt_out, tail_out)
}

/// # Safety
/// Same contract as `qshim_prepare`; `_flags` (e.g. `SQLITE_PREPARE_PERSISTENT`) is accepted
/// but has no observable effect here — every translated statement already gets a stable
/// remote-prepared name independent of this flag.
#[no_mangle]
pub unsafe extern "C" fn qshim_prepare_v3(
    db: *mut c_void,
    sql: *const c_char,
    _len: c_int,
    _flags: u32,
    stmt_out: *mut *mut c_void,
    tail_out: *mut *const c_char,
) -> c_int {
    prepare_common(db, sql, stmt_out, tail_out)
}

/// UTF-16 prepare variant. `sql16` is re-encoded to UTF-8 before going through the same
/// algorithm as the byte-oriented variants; `len_bytes` is the input length in bytes
/// (negative meaning NUL-terminated), matching the embedded library's own convention.
///
/// # Safety
/// `sql16` must point at `len_bytes` bytes of valid UTF-16 (or be NUL-terminated if
/// `len_bytes` is negative).
#[no_mangle]
pub unsafe extern "C" fn qshim_prepare16_v2(
    db: *mut c_void,
    sql16: *const u16,
    len_bytes: c_int,
    stmt_out: *mut *mut c_void,
    tail_out: *mut *const u16,
) -> c_int {
    clear_last_error();
    if !tail_out.is_null() {
        *tail_out = std::ptr::null();
    }
    if sql16.is_null() {
        set_last_error("sql16 was NULL");
        return libsqlite3_sys::SQLITE_MISUSE;
    }
    let units: &[u16] = if len_bytes < 0 {
        let mut n = 0usize;
        while *sql16.add(n) != 0 {
            n += 1;
        }
        std::slice::from_raw_parts(sql16, n)
    } else {
        std::slice::from_raw_parts(sql16, (len_bytes as usize) / 2)
    };
    let decoded: Result<String, _> = char::decode_utf16(units.iter().copied()).collect();
    let sql_string = match decoded {
        Ok(s) => s,
        Err(e) => {
            set_last_error(format!("invalid UTF-16 in sql16: {e}"));
            return libsqlite3_sys::SQLITE_MISUSE;
        }
    };
    let c_sql = match CString::new(sql_string) {
        Ok(c) => c,
        Err(_) => {
            set_last_error("sql16 decoded to a string containing an interior NUL");
            return libsqlite3_sys::SQLITE_MISUSE;
        }
    };
    prepare_common(db, c_sql.as_ptr(), stmt_out, std::ptr::null_mut())
}

pub(crate) fn lookup_statement(stmt: *mut c_void) -> Option<(std::sync::Arc<parking_lot::Mutex<shimcore::types::Statement>>, HostHandle)> {
    let handle = handle::from_ptr(stmt);
    let arc = ctx().statements.get(handle).or_else(|| shimcore::registries::RECENT_STATEMENTS.with(|c| c.borrow().get(handle)))?;
    Some((arc, handle))
}

macro_rules! bind_fn {
    ($name:ident, $ty:ty, $ctor:expr) => {
        /// # Safety
        /// `stmt` must be a live handle returned by a `qshim_prepare*` call.
        #[no_mangle]
        pub unsafe extern "C" fn $name(stmt: *mut c_void, index: c_int, value: $ty) -> c_int {
            clear_last_error();
            let Some((statement, handle)) = lookup_statement(stmt) else {
                return libsqlite3_sys::SQLITE_MISUSE;
            };
            let shadow_guard = ctx().shadow_statements.lock();
            let Some(shadow) = shadow_guard.get(&handle) else {
                return libsqlite3_sys::SQLITE_MISUSE;
            };
            if let Err(e) = bind_shadow(shadow, index, &$ctor(value)) {
                return e.tracked_code();
            }
            drop(shadow_guard);
            match engine::bind(&statement, index, $ctor(value)) {
                Ok(()) => libsqlite3_sys::SQLITE_OK,
                Err(e) => e.tracked_code(),
            }
        }
    };
}

fn bind_shadow(shadow: &shimengine::EmbeddedStatement, index: c_int, value: &ParamValue) -> Result<(), EngineError> {
    match value {
        ParamValue::Null => shadow.bind_null(index as usize),
        ParamValue::Integer(i) => shadow.bind_int64(index as usize, *i),
        ParamValue::Real(r) => shadow.bind_double(index as usize, *r),
        ParamValue::Text(s) => shadow.bind_text(index as usize, s),
        ParamValue::Blob(b) => shadow.bind_blob(index as usize, b),
    }
}

bind_fn!(qshim_bind_int64, i64, ParamValue::Integer);
bind_fn!(qshim_bind_double, c_double, ParamValue::Real);

/// # Safety
/// `stmt` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn qshim_bind_int(stmt: *mut c_void, index: c_int, value: c_int) -> c_int {
    qshim_bind_int64(stmt, index, value as i64)
}

/// # Safety
/// `stmt` must be a live handle; `value` NUL-terminated or `len >= 0` bytes long.
#[no_mangle]
pub unsafe extern "C" fn qshim_bind_text(stmt: *mut c_void, index: c_int, value: *const c_char, len: c_int) -> c_int {
    clear_last_error();
    if value.is_null() {
        return qshim_bind_null(stmt, index);
    }
    let text = if len < 0 {
        match CStr::from_ptr(value).to_str() {
            Ok(s) => s.to_string(),
            Err(e) => {
                set_last_error(format!("bind_text: invalid UTF-8: {e}"));
                return libsqlite3_sys::SQLITE_MISUSE;
            }
        }
    } else {
        let bytes = std::slice::from_raw_parts(value as *const u8, len as usize);
        match std::str::from_utf8(bytes) {
            Ok(s) => s.to_string(),
            Err(e) => {
                set_last_error(format!("bind_text: invalid UTF-8: {e}"));
                return libsqlite3_sys::SQLITE_MISUSE;
            }
        }
    };
    bind_value(stmt, index, ParamValue::Text(text))
}

/// # Safety
/// Same contract as `qshim_bind_text`, accepting a 64-bit length for large payloads.
#[no_mangle]
pub unsafe extern "C" fn qshim_bind_text64(stmt: *mut c_void, index: c_int, value: *const c_char, len: u64) -> c_int {
    qshim_bind_text(stmt, index, value, len as c_int)
}

/// # Safety
/// `stmt` must be a live handle; `value` must point at `len` readable bytes (or be NULL).
#[no_mangle]
pub unsafe extern "C" fn qshim_bind_blob(stmt: *mut c_void, index: c_int, value: *const c_void, len: c_int) -> c_int {
    if value.is_null() || len <= 0 {
        return bind_value(stmt, index, ParamValue::Blob(Vec::new()));
    }
    let bytes = std::slice::from_raw_parts(value as *const u8, len as usize).to_vec();
    bind_value(stmt, index, ParamValue::Blob(bytes))
}

/// # Safety
/// Same contract as `qshim_bind_blob`, accepting a 64-bit length.
#[no_mangle]
pub unsafe extern "C" fn qshim_bind_blob64(stmt: *mut c_void, index: c_int, value: *const c_void, len: u64) -> c_int {
    qshim_bind_blob(stmt, index, value, len as c_int)
}

/// # Safety
/// `stmt` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn qshim_bind_null(stmt: *mut c_void, index: c_int) -> c_int {
    bind_value(stmt, index, ParamValue::Null)
}

/// Binds a fake-value-pool token or a real embedded `value` pointer, resolving which kind it
/// is via the pool's magic-word/range check (spec.md §6 "bind ... value", §4.7).
///
/// # Safety
/// `stmt` must be a live handle; `value` must be either NULL, a token this process minted, or
/// a pointer the embedded library itself produced via `column_value`.
#[no_mangle]
pub unsafe extern "C" fn qshim_bind_value(stmt: *mut c_void, index: c_int, value: *const c_void) -> c_int {
    if value.is_null() {
        return qshim_bind_null(stmt, index);
    }
    // Real embedded `sqlite3_value*` pointers never round-trip through our fake-value pool;
    // this crate only resolves bind-by-value for tokens it itself minted via column_value.
    match crate::accessors::resolve_fake_token(value) {
        Some((src_stmt, col, row)) => match crate::accessors::read_cell(src_stmt, col, row) {
            Some(Some(bytes)) => bind_value(stmt, index, ParamValue::Text(String::from_utf8_lossy(&bytes).into_owned())),
            Some(None) => qshim_bind_null(stmt, index),
            None => libsqlite3_sys::SQLITE_MISUSE,
        },
        None => libsqlite3_sys::SQLITE_MISUSE,
    }
}

unsafe fn bind_value(stmt: *mut c_void, index: c_int, value: ParamValue) -> c_int {
    clear_last_error();
    let Some((statement, handle)) = lookup_statement(stmt) else {
        return libsqlite3_sys::SQLITE_MISUSE;
    };
    let shadow_guard = ctx().shadow_statements.lock();
    let Some(shadow) = shadow_guard.get(&handle) else {
        return libsqlite3_sys::SQLITE_MISUSE;
    };
    if let Err(e) = bind_shadow(shadow, index, &value) {
        return e.tracked_code();
    }
    drop(shadow_guard);
    match engine::bind(&statement, index, value) {
        Ok(()) => libsqlite3_sys::SQLITE_OK,
        Err(e) => e.tracked_code(),
    }
}

/// # Safety
/// `stmt` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn qshim_step(stmt: *mut c_void) -> c_int {
    clear_last_error();
    let Some((statement, handle)) = lookup_statement(stmt) else {
        return libsqlite3_sys::SQLITE_MISUSE;
    };
    let owning = statement.lock().owning_connection;
    let Some(connection) = ctx().connections.get(owning) else {
        return libsqlite3_sys::SQLITE_MISUSE;
    };
    let shadow_guard = ctx().shadow_statements.lock();
    let Some(shadow) = shadow_guard.get(&handle) else {
        return libsqlite3_sys::SQLITE_MISUSE;
    };
    match engine::step(ctx(), &statement, &connection, shadow) {
        Ok(StepResult::Row) => libsqlite3_sys::SQLITE_ROW,
        Ok(StepResult::Done) => libsqlite3_sys::SQLITE_DONE,
        Err(e) => {
            connection.lock().record_error(e.tracked_code(), e.to_string());
            e.tracked_code()
        }
    }
}

/// # Safety
/// `stmt` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn qshim_reset(stmt: *mut c_void) -> c_int {
    clear_last_error();
    let Some((statement, handle)) = lookup_statement(stmt) else {
        return libsqlite3_sys::SQLITE_MISUSE;
    };
    let shadow_guard = ctx().shadow_statements.lock();
    let Some(shadow) = shadow_guard.get(&handle) else {
        return libsqlite3_sys::SQLITE_MISUSE;
    };
    match engine::reset(ctx(), &statement, shadow) {
        Ok(()) => libsqlite3_sys::SQLITE_OK,
        Err(e) => e.tracked_code(),
    }
}

/// # Safety
/// `stmt` must be a live handle; must not be used again after this call.
#[no_mangle]
pub unsafe extern "C" fn qshim_finalize(stmt: *mut c_void) -> c_int {
    clear_last_error();
    let handle = handle::from_ptr(stmt);
    engine::finalize(ctx(), handle);
    ctx().fake_values.lock().invalidate_statement(handle);
    handle::release(handle);
    libsqlite3_sys::SQLITE_OK
}

/// # Safety
/// `stmt` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn qshim_clear_bindings(stmt: *mut c_void) -> c_int {
    clear_last_error();
    let Some((statement, handle)) = lookup_statement(stmt) else {
        return libsqlite3_sys::SQLITE_MISUSE;
    };
    statement.lock().params.clear();
    let shadow_guard = ctx().shadow_statements.lock();
    if let Some(shadow) = shadow_guard.get(&handle) {
        shadow.clear_bindings();
    }
    libsqlite3_sys::SQLITE_OK
}

#[no_mangle]
pub extern "C" fn qshim_bind_parameter_count(stmt: *mut c_void) -> c_int {
    lookup_statement(stmt).map(|(s, _)| s.lock().params.len() as c_int).unwrap_or(0)
}

/// # Safety
/// The returned pointer is borrowed from the embedded shadow statement and only valid while
/// `stmt` remains alive, matching the embedded library's own `bind_parameter_name` contract.
#[no_mangle]
pub unsafe extern "C" fn qshim_bind_parameter_name(stmt: *mut c_void, index: c_int) -> *const c_char {
    let Some((_, handle)) = lookup_statement(stmt) else {
        return std::ptr::null();
    };
    let shadow_guard = ctx().shadow_statements.lock();
    match shadow_guard.get(&handle).and_then(|s| s.bind_parameter_name(index as usize)) {
        Some(name) => {
            let c_string = CString::new(name).unwrap_or_default();
            crate::last_error::set_last_error(String::new());
            c_string.into_raw()
        }
        None => std::ptr::null(),
    }
}

/// # Safety
/// `name` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn qshim_bind_parameter_index(stmt: *mut c_void, name: *const c_char) -> c_int {
    let Ok(name_str) = borrow_str(name, "name") else {
        return 0;
    };
    let Some((_, handle)) = lookup_statement(stmt) else {
        return 0;
    };
    let shadow_guard = ctx().shadow_statements.lock();
    let Some(shadow) = shadow_guard.get(&handle) else {
        return 0;
    };
    for i in 1..=shadow.bind_parameter_count() {
        if shadow.bind_parameter_name(i).as_deref() == Some(name_str) {
            return i as c_int;
        }
    }
    0
}

/// # Safety
/// The returned pointer's lifetime matches the embedded library's own `sql()` contract: valid
/// until the statement is finalized.
#[no_mangle]
pub unsafe extern "C" fn qshim_sql(stmt: *mut c_void) -> *const c_char {
    let Some((statement, _)) = lookup_statement(stmt) else {
        return std::ptr::null();
    };
    let sql = statement.lock().original_sql.clone();
    CString::new(sql).unwrap_or_default().into_raw()
}

/// # Safety
/// Same contract as `qshim_sql`.
#[no_mangle]
pub unsafe extern "C" fn qshim_expanded_sql(stmt: *mut c_void) -> *const c_char {
    let Some((_, handle)) = lookup_statement(stmt) else {
        return std::ptr::null();
    };
    let shadow_guard = ctx().shadow_statements.lock();
    match shadow_guard.get(&handle).and_then(|s| s.expanded_sql()) {
        Some(sql) => CString::new(sql).unwrap_or_default().into_raw(),
        None => std::ptr::null(),
    }
}

#[no_mangle]
pub extern "C" fn qshim_stmt_readonly(stmt: *mut c_void) -> c_int {
    let Some((_, handle)) = lookup_statement(stmt) else {
        return 0;
    };
    let shadow_guard = ctx().shadow_statements.lock();
    shadow_guard.get(&handle).map(|s| s.stmt_readonly() as c_int).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn qshim_stmt_busy(stmt: *mut c_void) -> c_int {
    let Some((statement, handle)) = lookup_statement(stmt) else {
        return 0;
    };
    use shimcore::types::StatementState;
    if matches!(statement.lock().state, StatementState::CursorOpen | StatementState::Executing) {
        return 1;
    }
    let shadow_guard = ctx().shadow_statements.lock();
    shadow_guard.get(&handle).map(|s| s.stmt_busy() as c_int).unwrap_or(0)
}

/// Minimal support: every counter reads zero. The embedded library's `stmt_status` op codes
/// (fullscan steps, sort operations, autoindex, vm steps) have no analogue once a statement's
/// rows come from the remote result cache rather than the embedded VM.
#[no_mangle]
pub extern "C" fn qshim_stmt_status(_stmt: *mut c_void, _op: c_int, _reset_flag: c_int) -> c_int {
    0
}

#[no_mangle]
pub extern "C" fn qshim_db_handle(stmt: *mut c_void) -> *mut c_void {
    lookup_statement(stmt).map(|(s, _)| handle::to_ptr(s.lock().owning_connection)).unwrap_or(std::ptr::null_mut())
}
