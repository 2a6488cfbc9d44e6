//! Errors surfaced by the statement engine (spec.md §7, error kinds 4 and 5, plus the
//! "tracked error" connections carry in preference to the embedded library's own state).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not enough stack remaining to safely prepare ({remaining} bytes left)")]
    StackExhausted { remaining: usize },

    #[error("embedded library returned code {code}: {message}")]
    Embedded { code: i32, message: String },

    #[error("remote layer error: {0}")]
    Remote(#[from] shimpg::PgLayerError),

    #[error("translation failed: {0}")]
    Translate(#[from] shimcore::TranslateError),

    #[error(transparent)]
    Shim(#[from] shimcore::ShimError),

    #[error("worker delegation failed: {0}")]
    WorkerDelegation(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// A `(code, message)` pair a connection keeps around so `errmsg`/`errcode` return it instead
/// of the embedded library's own state, per spec.md §7 "Propagation". Constructed from
/// whichever error kind tripped it.
impl EngineError {
    pub fn tracked_code(&self) -> i32 {
        match self {
            EngineError::StackExhausted { .. } => libsqlite3_sys::SQLITE_NOMEM,
            EngineError::Embedded { code, .. } => *code,
            EngineError::Remote(_) => libsqlite3_sys::SQLITE_IOERR,
            EngineError::Translate(_) => libsqlite3_sys::SQLITE_ERROR,
            EngineError::Shim(_) => libsqlite3_sys::SQLITE_ERROR,
            EngineError::WorkerDelegation(_) => libsqlite3_sys::SQLITE_ERROR,
        }
    }
}
