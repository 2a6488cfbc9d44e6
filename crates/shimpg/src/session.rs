//! A single remote Postgres session plus its per-connection prepared-statement cache
//! (spec.md §4.2 step algorithm: "if the statement has a stable name and isn't yet in the
//! connection's per-connection prepared-statement cache, issue remote prepare, cache on
//! success, else fall back to parameterized exec").
//!
//! Abstracted behind `RemoteSession` so the pool (`pool.rs`) can be exercised in tests
//! without a live Postgres server, mirroring how the connection pool's `test_on_acquire` flag
//! on `PoolConfig` keeps validation pluggable rather than hard-wired to one transport.

use lru::LruCache;
use postgres::types::ToSql;
use postgres::{Client, NoTls, Row, Statement};
use shimcore::types::ParamValue;
use std::num::NonZeroUsize;
use std::time::Duration;

use crate::error::{PgLayerError, PgLayerResult};

/// Per-connection prepared-statement cache capacity. Smaller than the translation cache
/// (`shimcore::config::TRANSLATION_CACHE_SIZE`) since each entry here carries a live
/// server-side prepared statement, not just a string.
const PREPARED_STATEMENT_CACHE_SIZE: usize = 128;

pub struct QueryOutcome {
    pub rows: Vec<Row>,
}

pub struct ExecOutcome {
    pub rows_affected: u64,
}

/// Everything the statement engine needs from a live remote connection. Implemented by
/// `PgSession` for real traffic and by a test double in `pool.rs`'s unit tests.
pub trait RemoteSession: Send {
    fn is_healthy(&mut self) -> bool;
    fn reset(&mut self, search_path: &str, statement_timeout_ms: u64) -> PgLayerResult<()>;
    fn query(&mut self, stable_name: &str, sql: &str, params: &[ParamValue]) -> PgLayerResult<QueryOutcome>;
    fn execute(&mut self, stable_name: &str, sql: &str, params: &[ParamValue]) -> PgLayerResult<ExecOutcome>;
}

/// A live `postgres::Client` plus the prepared-statement names this connection has already
/// issued a remote `PREPARE` for.
pub struct PgSession {
    client: Client,
    prepared: LruCache<String, Statement>,
}

impl PgSession {
    pub fn connect(host: &str, port: u16, user: &str, password: Option<&str>, dbname: &str) -> PgLayerResult<Self> {
        let mut config = postgres::Config::new();
        config.host(host).port(port).user(user).dbname(dbname);
        if let Some(pw) = password {
            config.password(pw);
        }
        config.connect_timeout(Duration::from_secs(10));
        let client = config.connect(NoTls).map_err(|e| PgLayerError::Connect(e.to_string()))?;
        Ok(PgSession {
            client,
            prepared: LruCache::new(NonZeroUsize::new(PREPARED_STATEMENT_CACHE_SIZE).unwrap()),
        })
    }

    fn params_as_sql(params: &[ParamValue]) -> Vec<Box<dyn ToSql + Sync + Send>> {
        params
            .iter()
            .map(|p| -> Box<dyn ToSql + Sync + Send> {
                match p {
                    ParamValue::Null => Box::new(Option::<i64>::None),
                    ParamValue::Integer(i) => Box::new(*i),
                    ParamValue::Real(r) => Box::new(*r),
                    ParamValue::Text(s) => Box::new(s.clone()),
                    ParamValue::Blob(b) => Box::new(b.clone()),
                }
            })
            .collect()
    }

    /// Returns the server-side prepared statement for `stable_name`, preparing it on the
    /// connection the first time this name is seen and reusing the cached handle on every
    /// later call — `Statement` is a cheap `Arc` clone, so repeated lookups don't re-issue a
    /// remote `PREPARE`.
    fn ensure_prepared(&mut self, stable_name: &str, sql: &str) -> PgLayerResult<Statement> {
        if let Some(stmt) = self.prepared.get(stable_name) {
            return Ok(stmt.clone());
        }
        let stmt = self.client.prepare(sql).map_err(|e| PgLayerError::Query(e.to_string()))?;
        self.prepared.put(stable_name.to_string(), stmt.clone());
        Ok(stmt)
    }
}

impl RemoteSession for PgSession {
    fn is_healthy(&mut self) -> bool {
        self.client.simple_query("SELECT 1").is_ok()
    }

    fn reset(&mut self, search_path: &str, statement_timeout_ms: u64) -> PgLayerResult<()> {
        self.client
            .batch_execute(&format!(
                "SET search_path TO {}; SET statement_timeout = {}",
                search_path, statement_timeout_ms
            ))
            .map_err(|e| PgLayerError::Query(e.to_string()))?;
        self.prepared.clear();
        Ok(())
    }

    fn query(&mut self, stable_name: &str, sql: &str, params: &[ParamValue]) -> PgLayerResult<QueryOutcome> {
        let stmt = self.ensure_prepared(stable_name, sql)?;
        let boxed = Self::params_as_sql(params);
        let refs: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();
        let rows = self.client.query(&stmt, &refs).map_err(|e| PgLayerError::Query(e.to_string()))?;
        Ok(QueryOutcome { rows })
    }

    fn execute(&mut self, stable_name: &str, sql: &str, params: &[ParamValue]) -> PgLayerResult<ExecOutcome> {
        let stmt = self.ensure_prepared(stable_name, sql)?;
        let boxed = Self::params_as_sql(params);
        let refs: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();
        let rows_affected = self.client.execute(&stmt, &refs).map_err(|e| PgLayerError::Query(e.to_string()))?;
        Ok(ExecOutcome { rows_affected })
    }
}
