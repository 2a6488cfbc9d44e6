//! Errors surfaced by the remote session layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PgLayerError {
    #[error("failed to connect to remote Postgres: {0}")]
    Connect(String),

    #[error("remote query failed: {0}")]
    Query(String),

    #[error("no free connection slot (capacity {capacity})")]
    PoolExhausted { capacity: usize },

    #[error("pool slot {slot} generation mismatch (expected {expected}, found {found})")]
    GenerationMismatch { slot: usize, expected: u64, found: u64 },

    #[error("pool slot {slot} is in state {state:?}, not usable for acquisition")]
    SlotNotUsable { slot: usize, state: crate::pool::SlotState },
}

pub type PgLayerResult<T> = Result<T, PgLayerError>;
