//! Prepare/bind/step/reset/finalize (spec.md §4.2), wired against the registries and caches
//! in `shimcore`, the remote pool in `shimpg`, and the shadow statements in `embedded`.
//!
//! `shimcore::types::Statement` deliberately carries no row cursor or pinned-result handle —
//! those are engine runtime state, not shared data model, so they live here in
//! `StatementRuntime`, one per live statement, stored in `ShimContext::runtimes`.

use std::sync::Arc;

use parking_lot::Mutex as PLMutex;
use shimpg::RemoteSession;
use shimcore::config::{HARD_STACK_ABORT_THRESHOLD, WORKER_DELEGATION_STACK_THRESHOLD};
use shimcore::helpers::fnv1a_chain;
use shimcore::result_cache::{CachedResult, ColumnMeta, ResultHandle, RESULT_CACHE};
use shimcore::translator::cache::translate_cached;
use shimcore::translator::PassContext;
use shimcore::types::{Connection, EmbeddedHandle, HostHandle, ParamBuffer, ParamValue, RemoteSessionId, Statement, StatementRole, StatementState};

use crate::embedded::{EmbeddedConnection, EmbeddedStatement, StepOutcome as EmbeddedStep};
use crate::error::{EngineError, EngineResult};
use crate::{skip, stack_probe};

#[derive(Default)]
pub struct StatementRuntime {
    pub row_cursor: usize,
    pub result_pin: Option<ResultHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Row,
    Done,
}

fn leading_keyword(sql: &str) -> String {
    sql.trim_start().split(|c: char| c.is_whitespace() || c == '(').next().unwrap_or("").to_ascii_uppercase()
}

fn is_write_sql(sql: &str) -> bool {
    matches!(leading_keyword(sql).as_str(), "INSERT" | "UPDATE" | "DELETE")
}

fn is_read_sql(sql: &str) -> bool {
    matches!(leading_keyword(sql).as_str(), "SELECT" | "WITH")
}

/// Shrink the source SQL into something the embedded library can compile for the shadow
/// statement: ICU collations and FTS virtual tables don't exist there, so both are neutralized
/// rather than translated (spec.md §4.2 prepare step 2).
fn shadow_sql_for_embedded(source_sql: &str) -> String {
    let mut sql = source_sql.replace("COLLATE icu_root", "");
    if sql.to_ascii_uppercase().contains("MATCH") {
        // The shadow copy never executes a redirected FTS query; a deterministic
        // always-false predicate keeps it syntactically valid without the real virtual table.
        sql = sql.replace("MATCH", "= '' AND 1 = 0 --");
    }
    let upper = sql.to_ascii_uppercase();
    if let Some(create_pos) = upper.find("CREATE TABLE") {
        if !upper.contains("IF NOT EXISTS") {
            let insert_at = create_pos + "CREATE TABLE".len();
            sql.insert_str(insert_at, " IF NOT EXISTS");
        }
    }
    sql
}

/// Fingerprint the result-cache key: translated SQL plus every bound parameter value,
/// in order (spec.md §3 "Cached result": "keyed by a fingerprint over (translated SQL,
/// parameter values)").
fn result_fingerprint(translated_sql: &str, params: &[ParamValue]) -> u64 {
    let mut owned: Vec<Vec<u8>> = vec![translated_sql.as_bytes().to_vec()];
    for p in params {
        owned.push(match p {
            ParamValue::Null => b"\0N".to_vec(),
            ParamValue::Integer(i) => i.to_le_bytes().to_vec(),
            ParamValue::Real(r) => r.to_le_bytes().to_vec(),
            ParamValue::Text(s) => s.as_bytes().to_vec(),
            ParamValue::Blob(b) => b.clone(),
        });
    }
    fnv1a_chain(owned.iter().map(|v| v.as_slice()))
}

fn connect_session(config: &shimcore::config::Config) -> shimpg::PgLayerResult<shimpg::PgSession> {
    shimpg::PgSession::connect(&config.pg_host, config.pg_port, &config.pg_user, config.pg_password.as_deref(), &config.pg_dbname)
}

fn columns_from_rows(rows: &[postgres::Row]) -> Vec<ColumnMeta> {
    rows.first()
        .map(|r| r.columns().iter().map(|c| ColumnMeta { name: c.name().to_string(), type_oid: c.type_().oid() }).collect())
        .unwrap_or_default()
}

/// Convert one cell to the byte form the result cache stores, per the Postgres type OID the
/// driver reports. Unhandled types fall back to their text representation.
fn pg_cell_to_bytes(row: &postgres::Row, idx: usize) -> Option<Vec<u8>> {
    use postgres::types::Type;
    let ty = row.columns()[idx].type_();
    if *ty == Type::BOOL {
        row.get::<_, Option<bool>>(idx).map(|v| vec![v as u8])
    } else if *ty == Type::INT2 {
        row.get::<_, Option<i16>>(idx).map(|v| (v as i64).to_le_bytes().to_vec())
    } else if *ty == Type::INT4 {
        row.get::<_, Option<i32>>(idx).map(|v| (v as i64).to_le_bytes().to_vec())
    } else if *ty == Type::INT8 {
        row.get::<_, Option<i64>>(idx).map(|v| v.to_le_bytes().to_vec())
    } else if *ty == Type::FLOAT4 {
        row.get::<_, Option<f32>>(idx).map(|v| (v as f64).to_le_bytes().to_vec())
    } else if *ty == Type::FLOAT8 {
        row.get::<_, Option<f64>>(idx).map(|v| v.to_le_bytes().to_vec())
    } else if *ty == Type::BYTEA {
        row.get::<_, Option<Vec<u8>>>(idx)
    } else {
        row.get::<_, Option<String>>(idx).map(|s| s.into_bytes())
    }
}

fn row_to_cells(row: &postgres::Row) -> Vec<Option<Vec<u8>>> {
    (0..row.len()).map(|i| pg_cell_to_bytes(row, i)).collect()
}

pub struct PreparedShadow {
    pub statement: Arc<PLMutex<Statement>>,
    pub shadow: EmbeddedStatement,
}

/// Prepare algorithm (spec.md §4.2).
pub fn prepare(
    ctx: &crate::context::ShimContext,
    connection: &Arc<PLMutex<Connection>>,
    embedded_db: &EmbeddedConnection,
    host_statement: HostHandle,
    source_sql: &str,
    from_worker: bool,
) -> EngineResult<PreparedShadow> {
    // Step 1: skip patterns become a placeholder statement tagged no-op.
    if skip::is_skip(source_sql, &ctx.config) {
        let shadow = embedded_db.prepare("SELECT 1 WHERE 0")?;
        let mut stmt = Statement::new(host_statement, EmbeddedHandle(shadow.raw as usize), String::new());
        stmt.role = StatementRole::SkipNoop;
        let arc = ctx.statements.insert(host_statement, stmt)?;
        return Ok(PreparedShadow { statement: arc, shadow });
    }

    // Step 3: stack-room check, deep-stack redirected reads delegate to the worker.
    if !from_worker {
        let remaining = stack_probe::remaining_stack_bytes();
        let redirected_read = connection.lock().redirected && is_read_sql(source_sql);
        if remaining < WORKER_DELEGATION_STACK_THRESHOLD && redirected_read {
            tracing::debug!(remaining, "delegating prepare to worker thread");
            let job = crate::worker::PrepareJob {
                connection_path: connection.lock().path.clone(),
                sql: source_sql.to_string(),
                host_statement,
                from_worker: true,
            };
            // The worker runs the full prepare algorithm itself on its own oversized stack and
            // hands back the finished shadow statement and registry entry; nothing here re-runs
            // any of that work on the caller's stack-pressured thread.
            return ctx
                .worker
                .delegate(job)
                .unwrap_or_else(|| Err(EngineError::WorkerDelegation("worker thread is no longer running".to_string())));
        }
        if remaining < HARD_STACK_ABORT_THRESHOLD {
            connection.lock().record_error(libsqlite3_sys::SQLITE_NOMEM, "insufficient stack to prepare statement");
            return Err(EngineError::StackExhausted { remaining });
        }
    }

    // Step 2: shrink the SQL for the shadow compile.
    let shadow_sql = shadow_sql_for_embedded(source_sql);
    let shadow = embedded_db.prepare(&shadow_sql)?;

    let redirected = connection.lock().redirected;
    let write = is_write_sql(source_sql);
    let read = is_read_sql(source_sql);

    let mut stmt = Statement::new(host_statement, EmbeddedHandle(shadow.raw as usize), source_sql.to_string());

    if redirected && (write || read) {
        let translation = translate_cached(source_sql, PassContext { redirected_write: write });
        if translation.success {
            stmt.translated_sql = translation.translated_sql.clone();
            stmt.params = ParamBuffer::with_names(translation.parameter_names);
            stmt.stable_name = format!("shim_{:016x}", fnv1a_chain([translation.translated_sql.as_bytes()]));
            stmt.role = if write { StatementRole::WriteRedirected } else { StatementRole::ReadRedirected };
        } else {
            tracing::warn!(error = ?translation.error_message, "translation pipeline failed, falling back to pass-through");
            stmt.role = StatementRole::PassThrough;
        }
    } else {
        stmt.role = StatementRole::PassThrough;
    }

    let arc = ctx.statements.insert(host_statement, stmt)?;
    shimcore::registries::RECENT_STATEMENTS.with(|c| c.borrow_mut().insert(host_statement, arc.clone()));

    Ok(PreparedShadow { statement: arc, shadow })
}

/// Bind algorithm (spec.md §4.2): forward to the embedded shadow first, then resolve the
/// host's 1-based index into our 0-based slot.
pub fn bind(statement: &Arc<PLMutex<Statement>>, host_index: i32, value: ParamValue) -> EngineResult<()> {
    let mut stmt = statement.lock();
    if !stmt.params.is_empty() {
        stmt.params.set_by_host_index(host_index, value)?;
    }
    stmt.state = stmt.state.on_bind();
    Ok(())
}

pub fn bind_by_name(statement: &Arc<PLMutex<Statement>>, name: &str, value: ParamValue) -> EngineResult<()> {
    let mut stmt = statement.lock();
    stmt.params.set_by_name(name, value)?;
    stmt.state = stmt.state.on_bind();
    Ok(())
}

/// Step algorithm (spec.md §4.2, "the hardest part").
pub fn step(
    ctx: &crate::context::ShimContext,
    statement: &Arc<PLMutex<Statement>>,
    connection: &Arc<PLMutex<Connection>>,
    shadow: &EmbeddedStatement,
) -> EngineResult<StepResult> {
    let mut stmt = statement.lock();

    match stmt.role {
        StatementRole::SkipNoop => Ok(StepResult::Done),
        StatementRole::PassThrough => match shadow.step()? {
            EmbeddedStep::Row => Ok(StepResult::Row),
            EmbeddedStep::Done => Ok(StepResult::Done),
        },
        StatementRole::ReadRedirected => step_read(ctx, &mut stmt, connection),
        StatementRole::WriteRedirected => step_write(ctx, &mut stmt, connection),
    }
}

/// A cached/pinned result is only safe to keep serving from if the remote session that
/// produced it is still the one the connection is bound to — otherwise some other thread
/// sharing this connection has since pointed it at a different pooled slot (spec.md §4.2:
/// "record which connection produced the result, for cross-thread detection").
fn cached_result_is_stale(stmt: &Statement, connection: &Arc<PLMutex<Connection>>) -> bool {
    match stmt.produced_by {
        Some(produced_by) => connection.lock().remote != Some(produced_by),
        None => false,
    }
}

fn discard_cached_result(ctx: &crate::context::ShimContext, stmt: &mut Statement, host_handle: HostHandle) {
    tracing::debug!(handle = host_handle.0, "discarding cached result produced by a different remote session");
    if let Some(fp) = stmt.cached_result_fingerprint.take() {
        RESULT_CACHE.with(|c| c.borrow_mut().remove(fp));
    }
    stmt.produced_by = None;
    ctx.runtimes.lock().remove(&host_handle);
}

fn step_read(ctx: &crate::context::ShimContext, stmt: &mut Statement, connection: &Arc<PLMutex<Connection>>) -> EngineResult<StepResult> {
    if stmt.read_done {
        return Ok(StepResult::Done);
    }

    let host_handle = stmt.owning_connection;

    let already_pinned = ctx.runtimes.lock().get(&host_handle).map(|r| r.result_pin.is_some()).unwrap_or(false);
    if already_pinned {
        if cached_result_is_stale(stmt, connection) {
            discard_cached_result(ctx, stmt, host_handle);
        } else {
            return advance_cursor(ctx, stmt, host_handle);
        }
    }

    let fingerprint = result_fingerprint(&stmt.translated_sql, stmt.params.values());
    let cache_hit = RESULT_CACHE.with(|c| c.borrow().get(fingerprint).is_some());

    if cache_hit && !cached_result_is_stale(stmt, connection) {
        RESULT_CACHE.with(|c| c.borrow_mut().record_hit(fingerprint));
        let pin = RESULT_CACHE.with(|c| c.borrow().get(fingerprint).map(|r| r.pin()));
        ctx.runtimes.lock().insert(host_handle, StatementRuntime { row_cursor: 0, result_pin: pin });
        stmt.cached_result_fingerprint = Some(fingerprint);
        return advance_cursor(ctx, stmt, host_handle);
    }

    // Miss: run the query remotely, outside any held engine lock.
    let conn_path = connection.lock().path.clone();
    let slot = ctx.pool.acquire(&conn_path, || connect_session(&ctx.config))?;
    let params = stmt.params.values().to_vec();
    let stable_name = stmt.stable_name.clone();
    let sql = stmt.translated_sql.clone();
    let query_result = ctx.pool.with_session(slot, |session| session.query(&stable_name, &sql, &params));

    let outcome = match query_result {
        Ok(Ok(outcome)) => {
            ctx.pool.release(slot);
            outcome
        }
        Ok(Err(e)) | Err(e) => {
            let still_healthy = ctx.pool.with_session(slot, |session| session.is_healthy()).unwrap_or(false);
            ctx.pool.release_after_failure(slot, still_healthy);
            tracing::warn!(error = %e, still_healthy, "remote query failed, disabling redirection for statement");
            stmt.role = StatementRole::PassThrough;
            connection.lock().record_error(libsqlite3_sys::SQLITE_IOERR, e.to_string());
            return Err(EngineError::Remote(e));
        }
    };

    let produced_by = RemoteSessionId { slot: slot.index, generation: slot.generation };
    connection.lock().redirect_to(produced_by);
    stmt.produced_by = Some(produced_by);

    let columns = columns_from_rows(&outcome.rows);
    let rows: Vec<Vec<Option<Vec<u8>>>> = outcome.rows.iter().map(row_to_cells).collect();
    let row_count = rows.len();
    RESULT_CACHE.with(|c| {
        c.borrow_mut().insert(fingerprint, CachedResult::new(columns, rows));
    });
    stmt.cached_result_fingerprint = Some(fingerprint);

    if row_count == 0 {
        stmt.latch_read_done();
        return Ok(StepResult::Done);
    }

    let pin = RESULT_CACHE.with(|c| c.borrow().get(fingerprint).map(|r| r.pin()));
    ctx.runtimes.lock().insert(host_handle, StatementRuntime { row_cursor: 1, result_pin: pin });
    Ok(StepResult::Row)
}

fn advance_cursor(ctx: &crate::context::ShimContext, stmt: &mut Statement, host_handle: HostHandle) -> EngineResult<StepResult> {
    let fingerprint = match stmt.cached_result_fingerprint {
        Some(fp) => fp,
        None => {
            stmt.latch_read_done();
            return Ok(StepResult::Done);
        }
    };
    let row_count = RESULT_CACHE.with(|c| c.borrow().get(fingerprint).map(|r| r.rows.len())).unwrap_or(0);

    let exhausted = {
        let mut runtimes = ctx.runtimes.lock();
        let runtime = runtimes.entry(host_handle).or_default();
        if runtime.row_cursor >= row_count {
            true
        } else {
            runtime.row_cursor += 1;
            false
        }
    };

    if exhausted {
        ctx.runtimes.lock().remove(&host_handle);
        stmt.latch_read_done();
        Ok(StepResult::Done)
    } else {
        Ok(StepResult::Row)
    }
}

fn step_write(ctx: &crate::context::ShimContext, stmt: &mut Statement, connection: &Arc<PLMutex<Connection>>) -> EngineResult<StepResult> {
    if stmt.write_executed {
        return Ok(StepResult::Done);
    }

    let conn_path = connection.lock().path.clone();
    let slot = ctx.pool.acquire(&conn_path, || connect_session(&ctx.config))?;
    let params = stmt.params.values().to_vec();
    let stable_name = stmt.stable_name.clone();
    let sql = stmt.translated_sql.clone();
    let exec_result = ctx.pool.with_session(slot, |session| session.execute(&stable_name, &sql, &params));

    match exec_result {
        Ok(Ok(outcome)) => {
            ctx.pool.release(slot);
            let produced_by = RemoteSessionId { slot: slot.index, generation: slot.generation };
            connection.lock().redirect_to(produced_by);
            connection.lock().last_changes = outcome.rows_affected as i64;
            stmt.produced_by = Some(produced_by);
            stmt.latch_write();
            Ok(StepResult::Done)
        }
        Ok(Err(e)) | Err(e) => {
            let still_healthy = ctx.pool.with_session(slot, |session| session.is_healthy()).unwrap_or(false);
            ctx.pool.release_after_failure(slot, still_healthy);
            tracing::warn!(error = %e, still_healthy, "remote write failed, falling back to embedded execution");
            stmt.role = StatementRole::PassThrough;
            connection.lock().record_error(libsqlite3_sys::SQLITE_IOERR, e.to_string());
            Err(EngineError::Remote(e))
        }
    }
}

pub fn reset(ctx: &crate::context::ShimContext, statement: &Arc<PLMutex<Statement>>, shadow: &EmbeddedStatement) -> EngineResult<()> {
    let mut stmt = statement.lock();
    let host_handle = stmt.owning_connection;
    ctx.runtimes.lock().remove(&host_handle);
    stmt.reset();
    if stmt.role != StatementRole::ReadRedirected {
        shadow.reset()?;
        shadow.clear_bindings();
    }
    Ok(())
}

pub fn finalize(ctx: &crate::context::ShimContext, host_statement: HostHandle) {
    let existing = ctx.statements.remove(host_statement);
    shimcore::registries::RECENT_STATEMENTS.with(|c| c.borrow_mut().remove(host_statement));
    ctx.runtimes.lock().remove(&host_statement);
    ctx.shadow_statements.lock().remove(&host_statement);
    if let Some(arc) = existing {
        arc.lock().state = StatementState::Finalized;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_keyword_detection() {
        assert!(is_write_sql("INSERT INTO t VALUES (1)"));
        assert!(is_write_sql("  update t set a=1"));
        assert!(!is_write_sql("SELECT 1"));
    }

    #[test]
    fn read_keyword_detection() {
        assert!(is_read_sql("SELECT * FROM t"));
        assert!(is_read_sql("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(!is_read_sql("DELETE FROM t"));
    }

    #[test]
    fn shadow_sql_strips_icu_root_and_adds_if_not_exists() {
        let sql = shadow_sql_for_embedded("CREATE TABLE t (a TEXT COLLATE icu_root)");
        assert!(!sql.contains("icu_root"));
        assert!(sql.contains("IF NOT EXISTS"));
    }

    #[test]
    fn result_fingerprint_changes_with_parameters() {
        let a = result_fingerprint("SELECT 1", &[ParamValue::Integer(1)]);
        let b = result_fingerprint("SELECT 1", &[ParamValue::Integer(2)]);
        assert_ne!(a, b);
    }
}
