//! Process-wide context (spec.md §9 "Cyclic/global state in the source becomes explicit").
//!
//! Every process-wide registry spec.md §9 names — statements, connections, the remote pool —
//! is grouped under this one singleton rather than read independently from scattered globals.
//! `init()` establishes the pool's fork handler before any remote connection can be opened, so
//! a fork occurring mid-session is always safe to recover from.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use shimcore::config::Config;
use shimcore::fake_value_pool::FakeValuePool;
use shimcore::registries::{ConnectionRegistry, StatementRegistry};
use shimcore::types::HostHandle;
use shimpg::{register_for_fork_reset, PgSession, Pool, PoolConfig};

use crate::embedded::{EmbeddedConnection, EmbeddedStatement};
use crate::engine::{PreparedShadow, StatementRuntime};
use crate::error::{EngineError, EngineResult};
use crate::worker::{PrepareJob, Worker};

/// Everything the statement engine needs that shimcore's engine-agnostic data model doesn't
/// carry: the actual embedded-library handles (shimcore only keeps their opaque addresses)
/// and per-statement runtime state (row cursor, pinned cached result) that `shimcore::types::
/// Statement` doesn't model because it isn't needed outside the engine.
pub struct ShimContext {
    pub config: Config,
    pub pool: Arc<Pool<PgSession>>,
    pub statements: StatementRegistry,
    pub connections: ConnectionRegistry,
    pub worker: Worker<EngineResult<PreparedShadow>>,
    pub embedded_connections: Mutex<HashMap<HostHandle, Arc<EmbeddedConnection>>>,
    pub shadow_statements: Mutex<HashMap<HostHandle, EmbeddedStatement>>,
    pub runtimes: Mutex<HashMap<HostHandle, StatementRuntime>>,
    /// Fake column-value tokens handed out for rows backed by the result cache rather than a
    /// live embedded row buffer (spec.md §4.7).
    pub fake_values: Mutex<FakeValuePool>,
}

static CONTEXT: OnceCell<ShimContext> = OnceCell::new();

fn build_context() -> ShimContext {
    let config = Config::from_env();
    let pool = Arc::new(Pool::new(PoolConfig {
        capacity: shimcore::config::MAX_CONNECTIONS,
        search_path: config.pg_schema.clone(),
        statement_timeout_ms: 30_000,
    }));
    register_for_fork_reset(pool.clone());

    // Runs on the worker's own oversized stack, so it performs the real prepare work (shadow
    // compile, translate, registry insert) itself rather than handing back a placeholder for
    // the caller to redo on its own stack-pressured thread.
    let worker = Worker::spawn(|job: PrepareJob| -> EngineResult<PreparedShadow> {
        let ctx = global();
        let connection = ctx.connections.find_by_path(&job.connection_path).ok_or_else(|| {
            EngineError::WorkerDelegation(format!("no connection registered for path {}", job.connection_path))
        })?;
        let conn_host_handle = connection.lock().host_handle;
        let embedded = ctx.embedded_connections.lock().get(&conn_host_handle).cloned().ok_or_else(|| {
            EngineError::WorkerDelegation(format!("no embedded connection registered for path {}", job.connection_path))
        })?;
        tracing::trace!(path = %job.connection_path, "worker running delegated prepare");
        crate::engine::prepare(ctx, &connection, embedded.as_ref(), job.host_statement, &job.sql, true)
    })
    .expect("failed to spawn prepare-delegation worker thread");

    ShimContext {
        statements: StatementRegistry::new(),
        connections: ConnectionRegistry::new(),
        pool,
        worker,
        config,
        embedded_connections: Mutex::new(HashMap::new()),
        shadow_statements: Mutex::new(HashMap::new()),
        runtimes: Mutex::new(HashMap::new()),
        fake_values: Mutex::new(FakeValuePool::new()),
    }
}

/// Initialize the process-wide context exactly once. Safe to call from multiple threads;
/// only the first call's work takes effect.
pub fn init() -> &'static ShimContext {
    CONTEXT.get_or_init(build_context)
}

/// Access the context, initializing it on first use — mirrors the host calling `open` before
/// anything else, which is always the first intercepted call on a fresh process.
pub fn global() -> &'static ShimContext {
    init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_context_initializes_lazily_and_is_stable() {
        let a = global() as *const ShimContext;
        let b = global() as *const ShimContext;
        assert_eq!(a, b);
    }
}
