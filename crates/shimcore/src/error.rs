//! Error types shared by the translator, registries and caches.

use thiserror::Error;

/// Failure of a single translation pass or the pipeline as a whole.
///
/// Per spec §4.1 "Failure model": any pass returning an error aborts the pipeline with a
/// specific message; the caller falls back to the original source SQL.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TranslateError {
    #[error("unterminated string literal starting at byte {0}")]
    UnterminatedString(usize),

    #[error("unbalanced parentheses while scanning {context}")]
    UnbalancedParens { context: &'static str },

    #[error("could not infer a conflict target for INSERT OR REPLACE on table '{table}'")]
    NoUpsertTarget { table: String },

    #[error("malformed placeholder near byte {0}")]
    MalformedPlaceholder(usize),

    #[error("malformed MATCH predicate: {0}")]
    MalformedMatch(String),

    #[error("{pass}: {message}")]
    Pass { pass: &'static str, message: String },

    #[error("unsupported target dialect '{name}'")]
    UnsupportedDialect { name: String },
}

pub type TranslateResult<T> = Result<T, TranslateError>;

/// Umbrella error threaded through registries, the result cache and the fake-value pool.
#[derive(Debug, Error)]
pub enum ShimError {
    #[error("translation failed: {0}")]
    Translate(#[from] TranslateError),

    #[error("statement registry is full (capacity {capacity})")]
    RegistryFull { capacity: usize },

    #[error("unknown statement handle")]
    UnknownStatement,

    #[error("unknown connection handle")]
    UnknownConnection,

    #[error("parameter index {index} out of range (count {count})")]
    ParamIndexOutOfRange { index: usize, count: usize },

    #[error("fake-value token does not belong to the pool")]
    NotAFakeValue,
}

pub type ShimResult<T> = Result<T, ShimError>;
