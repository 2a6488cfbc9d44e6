//! `column_*`/`value_*` family (spec.md §6, §4.7 "Fake Value Pool").
//!
//! A `PassThrough` statement's rows live in the embedded library's own row buffer, so these
//! calls forward straight to the shadow statement. A redirected-read statement's rows live in
//! the thread-local result cache instead (spec.md §4.5); there is no real embedded value
//! pointer backing them, so `column_value` mints a fake token (spec.md §4.7) rather than
//! returning one.

use std::ffi::CString;
use std::os::raw::{c_char, c_double, c_int, c_void};
use std::sync::Arc;

use libsqlite3_sys as ffi;
use parking_lot::Mutex as PLMutex;

use shimcore::fake_value_pool::FakeValueRef;
use shimcore::result_cache::RESULT_CACHE;
use shimcore::types::{HostHandle, Statement, StatementRole};

use crate::handle;
use crate::statement::lookup_statement;

fn ctx() -> &'static shimengine::ShimContext {
    shimengine::global()
}

/// Current row's cells for a redirected-read statement positioned on a row, or `None` for a
/// pass-through statement, a write, or a cursor that hasn't stepped onto a row yet.
fn current_row(statement: &Arc<PLMutex<Statement>>) -> Option<Vec<Option<Vec<u8>>>> {
    let guard = statement.lock();
    if guard.role != StatementRole::ReadRedirected {
        return None;
    }
    let fingerprint = guard.cached_result_fingerprint?;
    let owning_connection = guard.owning_connection;
    drop(guard);
    let row_cursor = ctx().runtimes.lock().get(&owning_connection).map(|r| r.row_cursor)?;
    if row_cursor == 0 {
        return None;
    }
    RESULT_CACHE.with(|c| c.borrow().get(fingerprint).and_then(|r| r.rows.get(row_cursor - 1).cloned()))
}

fn current_cell(statement: &Arc<PLMutex<Statement>>, index: c_int) -> Option<Vec<u8>> {
    current_row(statement).and_then(|row| row.get(index as usize).cloned().flatten())
}

/// Decode a cached cell into an integer, matching `engine::pg_cell_to_bytes`'s encoding: bool
/// columns are a single byte, every integer width is an 8-byte little-endian `i64`. Anything
/// else (a text/bytea cell coerced to an integer, as the embedded library itself allows) falls
/// back to parsing its UTF-8 text.
fn cell_as_i64(bytes: &[u8]) -> i64 {
    match bytes.len() {
        8 => i64::from_le_bytes(bytes.try_into().expect("checked length")),
        1 => bytes[0] as i64,
        _ => std::str::from_utf8(bytes).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(0),
    }
}

/// Decode a cached cell into a float, matching `engine::pg_cell_to_bytes`'s 8-byte little-endian
/// `f64` encoding for both `FLOAT4` and `FLOAT8` columns.
fn cell_as_f64(bytes: &[u8]) -> f64 {
    if bytes.len() == 8 {
        f64::from_le_bytes(bytes.try_into().expect("checked length"))
    } else {
        std::str::from_utf8(bytes).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(0.0)
    }
}

/// Read an arbitrary `(statement, column, row)` triple out of whatever cached result the
/// statement last produced, independent of its current cursor position. Used to resolve fake
/// value tokens minted earlier, possibly against a row the cursor has since moved past.
pub(crate) fn read_cell(src_stmt: HostHandle, column: usize, row: usize) -> Option<Option<Vec<u8>>> {
    let statement = ctx().statements.get(src_stmt).or_else(|| shimcore::registries::RECENT_STATEMENTS.with(|c| c.borrow().get(src_stmt)))?;
    let fingerprint = statement.lock().cached_result_fingerprint?;
    RESULT_CACHE.with(|c| c.borrow().get(fingerprint).and_then(|r| r.rows.get(row)).map(|cells| cells.get(column).cloned().flatten()))
}

pub(crate) fn resolve_fake_token(ptr: *const c_void) -> Option<(HostHandle, usize, usize)> {
    let token = FakeValueRef::decode(ptr as usize)?;
    ctx().fake_values.lock().resolve(token)
}

fn mint_token(owning_statement: HostHandle, column: usize, row: usize) -> usize {
    ctx().fake_values.lock().allocate(owning_statement, column, row).encode()
}

#[no_mangle]
pub extern "C" fn qshim_column_count(stmt: *mut c_void) -> c_int {
    let Some((statement, handle)) = lookup_statement(stmt) else {
        return 0;
    };
    if let Some(row) = current_row(&statement) {
        return row.len() as c_int;
    }
    let shadow_guard = ctx().shadow_statements.lock();
    shadow_guard.get(&handle).map(|s| s.column_count() as c_int).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn qshim_data_count(stmt: *mut c_void) -> c_int {
    qshim_column_count(stmt)
}

#[no_mangle]
pub extern "C" fn qshim_column_type(stmt: *mut c_void, index: c_int) -> c_int {
    let Some((statement, handle)) = lookup_statement(stmt) else {
        return libsqlite3_sys::SQLITE_NULL;
    };
    if statement.lock().role == StatementRole::ReadRedirected {
        return match current_row(&statement).and_then(|row| row.get(index as usize).cloned()) {
            Some(Some(_)) => libsqlite3_sys::SQLITE_TEXT,
            _ => libsqlite3_sys::SQLITE_NULL,
        };
    }
    let shadow_guard = ctx().shadow_statements.lock();
    shadow_guard.get(&handle).map(|s| s.column_type(index as usize)).unwrap_or(libsqlite3_sys::SQLITE_NULL)
}

#[no_mangle]
pub extern "C" fn qshim_column_int64(stmt: *mut c_void, index: c_int) -> i64 {
    let Some((statement, handle)) = lookup_statement(stmt) else {
        return 0;
    };
    if statement.lock().role == StatementRole::ReadRedirected {
        return current_cell(&statement, index).map(|b| cell_as_i64(&b)).unwrap_or(0);
    }
    let shadow_guard = ctx().shadow_statements.lock();
    shadow_guard.get(&handle).map(|s| s.column_int64(index as usize)).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn qshim_column_int(stmt: *mut c_void, index: c_int) -> c_int {
    qshim_column_int64(stmt, index) as c_int
}

#[no_mangle]
pub extern "C" fn qshim_column_double(stmt: *mut c_void, index: c_int) -> c_double {
    let Some((statement, handle)) = lookup_statement(stmt) else {
        return 0.0;
    };
    if statement.lock().role == StatementRole::ReadRedirected {
        return current_cell(&statement, index).map(|b| cell_as_f64(&b)).unwrap_or(0.0);
    }
    let shadow_guard = ctx().shadow_statements.lock();
    shadow_guard.get(&handle).map(|s| s.column_double(index as usize)).unwrap_or(0.0)
}

/// # Safety
/// The returned pointer is borrowed and only valid until the next call that advances or
/// resets this statement's cursor, matching the embedded library's own `column_text` contract.
#[no_mangle]
pub unsafe extern "C" fn qshim_column_text(stmt: *mut c_void, index: c_int) -> *const c_char {
    let Some((statement, handle)) = lookup_statement(stmt) else {
        return std::ptr::null();
    };
    if statement.lock().role == StatementRole::ReadRedirected {
        let text = current_cell(&statement, index).map(|b| String::from_utf8_lossy(&b).into_owned()).unwrap_or_default();
        return CString::new(text).unwrap_or_default().into_raw();
    }
    let shadow_guard = ctx().shadow_statements.lock();
    match shadow_guard.get(&handle) {
        Some(s) => CString::new(s.column_text(index as usize)).unwrap_or_default().into_raw(),
        None => std::ptr::null(),
    }
}

#[no_mangle]
pub extern "C" fn qshim_column_bytes(stmt: *mut c_void, index: c_int) -> c_int {
    let Some((statement, handle)) = lookup_statement(stmt) else {
        return 0;
    };
    if statement.lock().role == StatementRole::ReadRedirected {
        return current_cell(&statement, index).map(|b| b.len() as c_int).unwrap_or(0);
    }
    let shadow_guard = ctx().shadow_statements.lock();
    shadow_guard.get(&handle).map(|s| s.column_bytes(index as usize) as c_int).unwrap_or(0)
}

/// # Safety
/// The returned pointer is a freshly leaked buffer when reading a redirected row (the host is
/// expected to copy out before the next step/reset, as with any embedded blob pointer) or the
/// embedded library's own borrowed blob pointer for a pass-through statement.
#[no_mangle]
pub unsafe extern "C" fn qshim_column_blob(stmt: *mut c_void, index: c_int) -> *const c_void {
    let Some((statement, handle)) = lookup_statement(stmt) else {
        return std::ptr::null();
    };
    if statement.lock().role == StatementRole::ReadRedirected {
        return match current_cell(&statement, index) {
            Some(bytes) => Box::into_raw(bytes.into_boxed_slice()) as *const c_void,
            None => std::ptr::null(),
        };
    }
    let shadow_guard = ctx().shadow_statements.lock();
    match shadow_guard.get(&handle) {
        Some(s) => {
            let blob = s.column_blob(index as usize);
            if blob.is_empty() {
                std::ptr::null()
            } else {
                Box::into_raw(blob.into_boxed_slice()) as *const c_void
            }
        }
        None => std::ptr::null(),
    }
}

/// # Safety
/// The returned pointer is borrowed and only valid until the statement is finalized or reset.
#[no_mangle]
pub unsafe extern "C" fn qshim_column_name(stmt: *mut c_void, index: c_int) -> *const c_char {
    let Some((_, handle)) = lookup_statement(stmt) else {
        return std::ptr::null();
    };
    let shadow_guard = ctx().shadow_statements.lock();
    match shadow_guard.get(&handle).and_then(|s| s.column_name(index as usize)) {
        Some(name) => CString::new(name).unwrap_or_default().into_raw(),
        None => std::ptr::null(),
    }
}

/// Returns a fake-value-pool token for redirected rows, or forwards to the embedded library's
/// own `column_value` for pass-through rows.
///
/// # Safety
/// `stmt` must be a live handle positioned on a row.
#[no_mangle]
pub unsafe extern "C" fn qshim_column_value(stmt: *mut c_void, index: c_int) -> *mut c_void {
    let Some((statement, handle)) = lookup_statement(stmt) else {
        return std::ptr::null_mut();
    };
    let guard = statement.lock();
    if guard.role == StatementRole::ReadRedirected {
        let owning_connection = guard.owning_connection;
        drop(guard);
        let row_cursor = ctx().runtimes.lock().get(&owning_connection).map(|r| r.row_cursor).unwrap_or(0);
        let row = row_cursor.saturating_sub(1);
        return mint_token(handle, index as usize, row) as *mut c_void;
    }
    drop(guard);
    let shadow_guard = ctx().shadow_statements.lock();
    match shadow_guard.get(&handle) {
        Some(s) => ffi::sqlite3_column_value(s.raw_ptr(), index) as *mut c_void,
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn qshim_value_type(value: *const c_void) -> c_int {
    match resolve_fake_token(value) {
        Some((src, col, row)) => match read_cell(src, col, row) {
            Some(Some(_)) => libsqlite3_sys::SQLITE_TEXT,
            _ => libsqlite3_sys::SQLITE_NULL,
        },
        None if value.is_null() => libsqlite3_sys::SQLITE_NULL,
        None => unsafe { ffi::sqlite3_value_type(value as *mut ffi::sqlite3_value) },
    }
}

/// # Safety
/// Same lifetime contract as `qshim_column_text`.
#[no_mangle]
pub unsafe extern "C" fn qshim_value_text(value: *const c_void) -> *const c_char {
    match resolve_fake_token(value) {
        Some((s, c, r)) => match read_cell(s, c, r).flatten() {
            Some(bytes) => CString::new(String::from_utf8_lossy(&bytes).into_owned()).unwrap_or_default().into_raw(),
            None => std::ptr::null(),
        },
        None if value.is_null() => std::ptr::null(),
        None => ffi::sqlite3_value_text(value as *mut ffi::sqlite3_value) as *const c_char,
    }
}

#[no_mangle]
pub extern "C" fn qshim_value_int64(value: *const c_void) -> i64 {
    match resolve_fake_token(value) {
        Some((s, c, r)) => read_cell(s, c, r).flatten().map(|b| cell_as_i64(&b)).unwrap_or(0),
        None if value.is_null() => 0,
        None => unsafe { ffi::sqlite3_value_int64(value as *mut ffi::sqlite3_value) },
    }
}

#[no_mangle]
pub extern "C" fn qshim_value_int(value: *const c_void) -> c_int {
    qshim_value_int64(value) as c_int
}

#[no_mangle]
pub extern "C" fn qshim_value_double(value: *const c_void) -> c_double {
    match resolve_fake_token(value) {
        Some((s, c, r)) => read_cell(s, c, r).flatten().map(|b| cell_as_f64(&b)).unwrap_or(0.0),
        None if value.is_null() => 0.0,
        None => unsafe { ffi::sqlite3_value_double(value as *mut ffi::sqlite3_value) },
    }
}

/// # Safety
/// The returned pointer is a freshly leaked buffer; callers must not attempt to free it
/// through this crate's `qshim_free_string` (that's for `CString`s only).
#[no_mangle]
pub unsafe extern "C" fn qshim_value_blob(value: *const c_void) -> *const c_void {
    match resolve_fake_token(value) {
        Some((s, c, r)) => match read_cell(s, c, r).flatten() {
            Some(bytes) => Box::into_raw(bytes.into_boxed_slice()) as *const c_void,
            None => std::ptr::null(),
        },
        None if value.is_null() => std::ptr::null(),
        None => ffi::sqlite3_value_blob(value as *mut ffi::sqlite3_value),
    }
}

#[no_mangle]
pub extern "C" fn qshim_value_bytes(value: *const c_void) -> c_int {
    match resolve_fake_token(value) {
        Some((s, c, r)) => read_cell(s, c, r).flatten().map(|b| b.len() as c_int).unwrap_or(0),
        None if value.is_null() => 0,
        None => unsafe { ffi::sqlite3_value_bytes(value as *mut ffi::sqlite3_value) },
    }
}

/// Convenience wrapper composing `prepare`/`step`/`column_*`, mirroring the embedded library's
/// own `get_table` (spec.md §6 "get-table"): runs `sql` to completion and hands back a flat,
/// row-major array of heap-allocated C strings (headers first, then each row in turn).
///
/// # Safety
/// `db` must be a live handle; `sql` NUL-terminated; `result_out`/`rows_out`/`cols_out` must be
/// valid writable pointers when non-null.
#[no_mangle]
pub unsafe extern "C" fn qshim_get_table(
    db: *mut c_void,
    sql: *const c_char,
    result_out: *mut *mut *mut c_char,
    rows_out: *mut c_int,
    cols_out: *mut c_int,
    errmsg_out: *mut *mut c_char,
) -> c_int {
    use crate::connection::lookup_connection;
    use crate::last_error::{borrow_str, clear_last_error};

    clear_last_error();
    if !result_out.is_null() {
        *result_out = std::ptr::null_mut();
    }
    let Some((connection, embedded)) = lookup_connection(db) else {
        return libsqlite3_sys::SQLITE_MISUSE;
    };
    let sql_str = match borrow_str(sql, "sql") {
        Ok(s) => s,
        Err(()) => return libsqlite3_sys::SQLITE_MISUSE,
    };

    let host_stmt = handle::mint();
    let prepared = match shimengine::engine::prepare(ctx(), &connection, &embedded, host_stmt, sql_str, false) {
        Ok(p) => p,
        Err(e) => {
            handle::release(host_stmt);
            if !errmsg_out.is_null() {
                *errmsg_out = CString::new(e.to_string()).unwrap_or_default().into_raw();
            }
            return e.tracked_code();
        }
    };
    ctx().shadow_statements.lock().insert(host_stmt, prepared.shadow);
    let stmt_ptr = handle::to_ptr::<c_void>(host_stmt);

    let ncols = qshim_column_count(stmt_ptr) as usize;
    let mut flat: Vec<*mut c_char> = Vec::new();
    for i in 0..ncols {
        let name_ptr = qshim_column_name(stmt_ptr, i as c_int);
        let owned = if name_ptr.is_null() {
            CString::new("").unwrap()
        } else {
            CString::new(std::ffi::CStr::from_ptr(name_ptr).to_bytes()).unwrap_or_default()
        };
        flat.push(owned.into_raw());
    }

    let mut nrows = 0usize;
    loop {
        let step = {
            let shadow_guard = ctx().shadow_statements.lock();
            let shadow = shadow_guard.get(&host_stmt).expect("just inserted");
            shimengine::engine::step(ctx(), &prepared.statement, &connection, shadow)
        };
        match step {
            Ok(shimengine::engine::StepResult::Row) => {
                nrows += 1;
                for i in 0..ncols {
                    let ptr = qshim_column_text(stmt_ptr, i as c_int);
                    let owned = if ptr.is_null() {
                        std::ptr::null_mut()
                    } else {
                        let text = std::ffi::CStr::from_ptr(ptr).to_bytes().to_vec();
                        CString::new(text).unwrap_or_default().into_raw()
                    };
                    flat.push(owned);
                }
            }
            Ok(shimengine::engine::StepResult::Done) => break,
            Err(e) => {
                shimengine::engine::finalize(ctx(), host_stmt);
                handle::release(host_stmt);
                if !errmsg_out.is_null() {
                    *errmsg_out = CString::new(e.to_string()).unwrap_or_default().into_raw();
                }
                return e.tracked_code();
            }
        }
    }

    shimengine::engine::finalize(ctx(), host_stmt);
    handle::release(host_stmt);

    if !rows_out.is_null() {
        *rows_out = nrows as c_int;
    }
    if !cols_out.is_null() {
        *cols_out = ncols as c_int;
    }
    if !result_out.is_null() {
        let boxed = flat.into_boxed_slice();
        *result_out = Box::into_raw(boxed) as *mut *mut c_char;
    }
    libsqlite3_sys::SQLITE_OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_as_i64_reads_little_endian_eight_byte_cells() {
        assert_eq!(cell_as_i64(&42i64.to_le_bytes()), 42);
        assert_eq!(cell_as_i64(&(-7i64).to_le_bytes()), -7);
    }

    #[test]
    fn cell_as_i64_reads_single_byte_bool_cells() {
        assert_eq!(cell_as_i64(&[1]), 1);
        assert_eq!(cell_as_i64(&[0]), 0);
    }

    #[test]
    fn cell_as_i64_falls_back_to_text_for_other_widths() {
        assert_eq!(cell_as_i64(b"123"), 123);
        assert_eq!(cell_as_i64(b"not a number"), 0);
    }

    #[test]
    fn cell_as_f64_reads_little_endian_eight_byte_cells() {
        assert_eq!(cell_as_f64(&3.5f64.to_le_bytes()), 3.5);
    }

    #[test]
    fn cell_as_f64_falls_back_to_text_for_other_widths() {
        assert_eq!(cell_as_f64(b"2.5"), 2.5);
        assert_eq!(cell_as_f64(b"nope"), 0.0);
    }
}
