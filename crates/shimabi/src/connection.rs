//! `open`/`close`/`exec` and the connection-scoped metadata calls (spec.md §6 API surface).

use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::Arc;

use shimcore::types::{Connection, HostHandle, TrackedError};
use shimengine::{EmbeddedConnection, EngineError};

use crate::handle;
use crate::last_error::{borrow_str, clear_last_error, set_last_error};

fn ctx() -> &'static shimengine::ShimContext {
    shimengine::global()
}

pub(crate) fn lookup_connection(db: *mut c_void) -> Option<(Arc<parking_lot::Mutex<Connection>>, Arc<EmbeddedConnection>)> {
    let handle = handle::from_ptr(db);
    let conn = ctx().connections.get(handle)?;
    let embedded = ctx().embedded_connections.lock().get(&handle)?.clone();
    Some((conn, embedded))
}

/// Open `path`, redirecting it per the configured path-substring policy. On success, `*db_out`
/// receives an opaque handle; on failure it is set to NULL and the return code is a tracked
/// embedded-library-style result code.
///
/// # Safety
/// `path` must be a valid NUL-terminated C string; `db_out` must be a valid, writable pointer.
#[no_mangle]
pub unsafe extern "C" fn qshim_open(path: *const c_char, db_out: *mut *mut c_void) -> c_int {
    clear_last_error();
    if db_out.is_null() {
        set_last_error("db_out was NULL");
        return libsqlite3_sys::SQLITE_MISUSE;
    }
    *db_out = std::ptr::null_mut();

    let path_str = match borrow_str(path, "path") {
        Ok(s) => s,
        Err(()) => return libsqlite3_sys::SQLITE_MISUSE,
    };

    let embedded = match EmbeddedConnection::open(path_str) {
        Ok(conn) => conn,
        Err(EngineError::Embedded { code, message }) => {
            set_last_error(message);
            return code;
        }
        Err(_) => return libsqlite3_sys::SQLITE_ERROR,
    };

    let context = ctx();
    let host_handle = handle::mint();
    let mut connection = Connection::new(host_handle, path_str.to_string(), shimcore::types::EmbeddedHandle(0));
    connection.redirected = shimengine::redirect::should_redirect(path_str, &context.config);

    if let Err(e) = context.connections.insert(host_handle, connection) {
        handle::release(host_handle);
        set_last_error(e.to_string());
        return libsqlite3_sys::SQLITE_NOMEM;
    }
    context.embedded_connections.lock().insert(host_handle, Arc::new(embedded));

    *db_out = handle::to_ptr(host_handle);
    libsqlite3_sys::SQLITE_OK
}

/// # Safety
/// `db` must be a handle returned by `qshim_open` and not already closed.
#[no_mangle]
pub unsafe extern "C" fn qshim_close(db: *mut c_void) -> c_int {
    clear_last_error();
    let host_handle = handle::from_ptr(db);
    let context = ctx();
    if context.connections.remove(host_handle).is_none() {
        return libsqlite3_sys::SQLITE_MISUSE;
    }
    context.embedded_connections.lock().remove(&host_handle);
    context.fake_values.lock().invalidate_statement(host_handle);
    handle::release(host_handle);
    libsqlite3_sys::SQLITE_OK
}

type ExecCallback = extern "C" fn(*mut c_void, c_int, *mut *mut c_char, *mut *mut c_char) -> c_int;

/// Run each `;`-separated statement in `sql` to completion, invoking `callback` once per row
/// with freshly allocated column-value/column-name arrays. Mirrors the embedded library's own
/// `exec` convenience wrapper on top of prepare/step/finalize.
///
/// # Safety
/// `db` must be a live handle; `sql` must be NUL-terminated; `callback` (if non-null) must be
/// safe to invoke with the arity described above.
#[no_mangle]
pub unsafe extern "C" fn qshim_exec(
    db: *mut c_void,
    sql: *const c_char,
    callback: Option<ExecCallback>,
    callback_arg: *mut c_void,
    errmsg_out: *mut *mut c_char,
) -> c_int {
    clear_last_error();
    if !errmsg_out.is_null() {
        *errmsg_out = std::ptr::null_mut();
    }
    let Some((connection, embedded)) = lookup_connection(db) else {
        return libsqlite3_sys::SQLITE_MISUSE;
    };
    let sql_str = match borrow_str(sql, "sql") {
        Ok(s) => s,
        Err(()) => return libsqlite3_sys::SQLITE_MISUSE,
    };

    for statement_sql in sql_str.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let host_stmt = handle::mint();
        let prepared = shimengine::engine::prepare(ctx(), &connection, &embedded, host_stmt, statement_sql, false);
        let prepared = match prepared {
            Ok(p) => p,
            Err(e) => {
                handle::release(host_stmt);
                report_exec_error(&connection, e, errmsg_out);
                return libsqlite3_sys::SQLITE_ERROR;
            }
        };
        ctx().shadow_statements.lock().insert(host_stmt, prepared.shadow);

        loop {
            let shadow_guard = ctx().shadow_statements.lock();
            let shadow = shadow_guard.get(&host_stmt).expect("just inserted");
            let step = shimengine::engine::step(ctx(), &prepared.statement, &connection, shadow);
            match step {
                Ok(shimengine::engine::StepResult::Row) => {
                    drop(shadow_guard);
                    if let Some(cb) = callback {
                        if invoke_exec_callback(cb, callback_arg, &prepared.statement, host_stmt) != 0 {
                            shimengine::engine::finalize(ctx(), host_stmt);
                            handle::release(host_stmt);
                            return libsqlite3_sys::SQLITE_ABORT;
                        }
                    }
                }
                Ok(shimengine::engine::StepResult::Done) => break,
                Err(e) => {
                    drop(shadow_guard);
                    shimengine::engine::finalize(ctx(), host_stmt);
                    handle::release(host_stmt);
                    report_exec_error(&connection, e, errmsg_out);
                    return libsqlite3_sys::SQLITE_ERROR;
                }
            }
        }

        shimengine::engine::finalize(ctx(), host_stmt);
        handle::release(host_stmt);
    }

    libsqlite3_sys::SQLITE_OK
}

unsafe fn invoke_exec_callback(
    callback: ExecCallback,
    arg: *mut c_void,
    statement: &Arc<parking_lot::Mutex<shimcore::types::Statement>>,
    host_stmt: HostHandle,
) -> c_int {
    let shadow_guard = ctx().shadow_statements.lock();
    let shadow = match shadow_guard.get(&host_stmt) {
        Some(s) => s,
        None => return 0,
    };
    let count = shadow.column_count();
    let mut values: Vec<*mut c_char> = Vec::with_capacity(count);
    let mut names: Vec<*mut c_char> = Vec::with_capacity(count);
    let _ = statement;
    for i in 0..count {
        let text = shadow.column_text(i);
        values.push(CString::new(text).unwrap_or_default().into_raw());
        names.push(CString::new(shadow.column_name(i).unwrap_or_default()).unwrap_or_default().into_raw());
    }
    let rc = callback(arg, count as c_int, values.as_mut_ptr(), names.as_mut_ptr());
    for ptr in values.into_iter().chain(names.into_iter()) {
        drop(CString::from_raw(ptr));
    }
    rc
}

unsafe fn report_exec_error(connection: &Arc<parking_lot::Mutex<Connection>>, error: EngineError, errmsg_out: *mut *mut c_char) {
    connection.lock().record_error(error.tracked_code(), error.to_string());
    if !errmsg_out.is_null() {
        *errmsg_out = CString::new(error.to_string()).unwrap_or_default().into_raw();
    }
}

#[no_mangle]
pub extern "C" fn qshim_changes(db: *mut c_void) -> c_int {
    lookup_connection(db).map(|(c, _)| c.lock().last_changes as c_int).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn qshim_changes64(db: *mut c_void) -> i64 {
    lookup_connection(db).map(|(c, _)| c.lock().last_changes).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn qshim_last_insert_rowid(db: *mut c_void) -> i64 {
    lookup_connection(db).map(|(_, e)| e.last_insert_rowid()).unwrap_or(0)
}

/// Tracked error takes precedence over the embedded library's own state (spec.md §7
/// "Propagation"): the engine sometimes short-circuits before ever calling the real embedded
/// prepare, which would otherwise make `errmsg` spuriously read "not an error".
fn tracked_or_embedded(conn: &Arc<parking_lot::Mutex<Connection>>, embedded: &Arc<EmbeddedConnection>) -> TrackedError {
    let tracked = conn.lock().last_error.clone();
    if tracked.code != 0 {
        tracked
    } else {
        TrackedError { code: embedded.errcode(), message: embedded.errmsg() }
    }
}

/// # Safety
/// `db` must be a live handle returned by `qshim_open`.
#[no_mangle]
pub unsafe extern "C" fn qshim_errmsg(db: *mut c_void) -> *const c_char {
    let Some((conn, embedded)) = lookup_connection(db) else {
        return std::ptr::null();
    };
    let tracked = tracked_or_embedded(&conn, &embedded);
    set_last_error(tracked.message);
    crate::last_error::qshim_last_error()
}

#[no_mangle]
pub extern "C" fn qshim_errcode(db: *mut c_void) -> c_int {
    let Some((conn, embedded)) = lookup_connection(db) else {
        return libsqlite3_sys::SQLITE_MISUSE;
    };
    tracked_or_embedded(&conn, &embedded).code
}

#[no_mangle]
pub extern "C" fn qshim_extended_errcode(db: *mut c_void) -> c_int {
    qshim_errcode(db)
}

/// ICU-family collations are reported as successfully registered without actually being
/// registered (spec.md §6 "Collation synthesis") — the translator has already stripped or
/// rewritten every site that would have used them.
#[no_mangle]
pub extern "C" fn qshim_create_collation(_db: *mut c_void, _name: *const c_char, _encoding: c_int, _arg: *mut c_void, _compare: *mut c_void) -> c_int {
    libsqlite3_sys::SQLITE_OK
}

#[no_mangle]
pub extern "C" fn qshim_create_collation_v2(
    _db: *mut c_void,
    _name: *const c_char,
    _encoding: c_int,
    _arg: *mut c_void,
    _compare: *mut c_void,
    _destroy: *mut c_void,
) -> c_int {
    libsqlite3_sys::SQLITE_OK
}

