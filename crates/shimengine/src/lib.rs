//! Statement engine, connection policy, and worker delegation for the embedded-to-Postgres
//! redirect shim: the layer between the C ABI surface and the data model/translator in
//! `shimcore` plus the remote session pool in `shimpg`.

pub mod context;
pub mod embedded;
pub mod engine;
pub mod error;
pub mod redirect;
pub mod skip;
pub mod stack_probe;
pub mod worker;

pub use context::{global, init, ShimContext};
pub use embedded::{EmbeddedConnection, EmbeddedStatement, StepOutcome};
pub use engine::{StatementRuntime, StepResult};
pub use error::{EngineError, EngineResult};
