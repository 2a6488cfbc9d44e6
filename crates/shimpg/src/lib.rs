//! Remote PostgreSQL session pooling.
//!
//! Sits between `shimengine`'s statement machinery and the Postgres wire, owning connection
//! lifecycle (`pool`), a single live session's behavior (`session`), and the error type both
//! report through (`error`). Knows nothing about the embedded library's C ABI.

pub mod error;
pub mod pool;
pub mod session;

pub use error::{PgLayerError, PgLayerResult};
pub use pool::{register_for_fork_reset, Pool, PoolConfig, PoolStats, SlotHandle, SlotState};
pub use session::{ExecOutcome, PgSession, QueryOutcome, RemoteSession};
