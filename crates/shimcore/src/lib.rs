//! SQL dialect translation and shared data model for the embedded-to-Postgres redirect shim.
//!
//! This crate has no knowledge of the embedded library's C ABI or of the Postgres wire
//! protocol — both of those live in `shimengine` and `shimpg` respectively. What lives here
//! is everything that can be reasoned about, and tested, without either: the multi-pass SQL
//! translator (`translator`), the statement/connection data model (`types`), the registries
//! that track live statements and connections (`registries`), and the two thread-local caches
//! (`result_cache`, `translator::cache`) plus the fake-value token pool (`fake_value_pool`).

pub mod config;
pub mod error;
pub mod fake_value_pool;
pub mod helpers;
pub mod registries;
pub mod result_cache;
pub mod translator;
pub mod types;

pub use error::{ShimError, ShimResult, TranslateError, TranslateResult};
pub use translator::{translate, translate_with_dialect, Dialect, PassContext, Translation};
