//! Runtime configuration (env-sourced) and compile-time tuning constants.
//!
//! Loading configuration from the environment is named an external concern in spec.md §1 —
//! the mechanism that wires environment variables into a running process (dotenv, secret
//! managers, container orchestration) is out of scope. What remains in scope is the small
//! data value those mechanisms populate, read here with plain `std::env::var` the way
//! `pg/src/driver/pool.rs`'s `PoolConfig::new` takes its inputs directly rather than parsing
//! a config file format.

use std::env;

/// Remote PostgreSQL endpoint and redirect/skip policy, sourced from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub pg_host: String,
    pub pg_port: u16,
    pub pg_dbname: String,
    pub pg_user: String,
    pub pg_password: Option<String>,
    pub pg_schema: String,
    pub log_level: String,
    pub log_file: String,
    /// Filesystem path substrings that mark a database as redirected. Defaults are supplied
    /// but overridable, per spec.md §6 "Redirect policy".
    pub redirect_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pg_host: "localhost".to_string(),
            pg_port: 5432,
            pg_dbname: "postgres".to_string(),
            pg_user: "postgres".to_string(),
            pg_password: None,
            pg_schema: "public".to_string(),
            log_level: "error".to_string(),
            log_file: "/var/log/qshim/shim.log".to_string(),
            redirect_patterns: vec!["__redirect__".to_string()],
        }
    }
}

impl Config {
    /// Build a `Config` from the documented environment variables, falling back to the
    /// documented literal defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pg_host: env::var("QSHIM_PG_HOST").unwrap_or(defaults.pg_host),
            pg_port: env::var("QSHIM_PG_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.pg_port),
            pg_dbname: env::var("QSHIM_PG_DBNAME").unwrap_or(defaults.pg_dbname),
            pg_user: env::var("QSHIM_PG_USER").unwrap_or(defaults.pg_user),
            pg_password: env::var("QSHIM_PG_PASSWORD").ok(),
            pg_schema: env::var("QSHIM_PG_SCHEMA").unwrap_or(defaults.pg_schema),
            log_level: env::var("QSHIM_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_file: env::var("QSHIM_LOG_FILE").unwrap_or(defaults.log_file),
            redirect_patterns: env::var("QSHIM_REDIRECT_PATTERNS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.redirect_patterns),
        }
    }

    /// Second list from spec.md §6 "Skip policy": substrings that force a statement to
    /// execute as a no-op regardless of the startup-pattern check.
    pub fn skip_substrings(&self) -> &'static [&'static str] {
        &[
            "sqlite_master",
            "sqlite_sequence",
            "sqlite_stat",
            "fts4_metadata",
            "fts5_metadata",
            "icu_tokenizer",
        ]
    }
}

// ---------------------------------------------------------------------------------------
// Compile-time constants (spec.md §6 "Configuration (compile-time constants)")
// ---------------------------------------------------------------------------------------

/// Maximum number of statements tracked by the global statement registry at once.
pub const MAX_CONCURRENT_STATEMENTS: usize = 4096;

/// Maximum bound parameters honored per statement.
pub const MAX_PARAMETERS_PER_STATEMENT: usize = 999;

/// Fixed capacity of the per-process connection pool.
pub const MAX_CONNECTIONS: usize = 64;

/// Stack size handed to the dedicated worker-delegation thread, in megabytes.
pub const WORKER_STACK_SIZE_MB: usize = 8;

/// Below this many bytes of stack remaining, a redirected-read prepare delegates to the
/// worker thread instead of running on the caller's stack.
pub const WORKER_DELEGATION_STACK_THRESHOLD: usize = 64 * 1024;

/// Below this many bytes of stack remaining, prepare fails outright with an
/// out-of-memory-class error rather than risking a stack overflow.
pub const HARD_STACK_ABORT_THRESHOLD: usize = 16 * 1024;

/// Number of entries in the per-thread result cache.
pub const RESULT_CACHE_SIZE: usize = 256;

/// A result with more rows than this is never cached.
pub const RESULT_CACHE_ROW_CAP: usize = 10_000;

/// A result occupying more bytes than this is never cached.
pub const RESULT_CACHE_BYTE_CAP: usize = 8 * 1024 * 1024;

/// Time-to-live for a cached result, in milliseconds.
pub const RESULT_CACHE_TTL_MS: u64 = 5_000;

/// Power-of-two size of the per-thread translation cache.
pub const TRANSLATION_CACHE_SIZE: usize = 256;

/// Linear-probe bound for translation cache lookups before giving up and treating the entry
/// as absent (LRU-by-last-probe eviction target).
pub const TRANSLATION_CACHE_PROBE_LIMIT: usize = 8;

/// Number of slots in the cyclic fake-value token pool.
pub const FAKE_VALUE_POOL_SIZE: usize = 4096;

/// Number of slots in the per-thread "recently prepared" statement cache.
pub const RECENT_STATEMENT_CACHE_SIZE: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.pg_host, "localhost");
        assert_eq!(cfg.pg_port, 5432);
    }

    #[test]
    fn translation_cache_size_is_power_of_two() {
        assert!(TRANSLATION_CACHE_SIZE.is_power_of_two());
    }

    #[test]
    fn fake_value_pool_size_is_power_of_two() {
        // Allocation uses `& (SIZE - 1)` bit-masking (spec.md §4.7), which requires a
        // power-of-two capacity.
        assert!(FAKE_VALUE_POOL_SIZE.is_power_of_two());
    }
}
