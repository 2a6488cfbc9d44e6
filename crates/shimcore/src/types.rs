//! Shared data model (spec.md §3): `Connection`, `Statement`, and the small value types they
//! compose. Deliberately engine-agnostic — no `libsqlite3-sys` or `postgres` types appear
//! here. The embedded library's statement/database pointers and the remote pool's live
//! session handles are owned by `shimengine` and `shimpg` respectively; this crate only
//! carries the opaque identifiers those crates hand back, plus everything about a statement
//! or connection that doesn't require either library to be linked in to reason about (roles,
//! latches, parameter bookkeeping, the state machine).

use std::collections::HashMap;
use std::time::Instant;

/// An embedded-library statement or database handle, carried as a raw address rather than a
/// typed pointer so this crate stays free of the `libsqlite3-sys` dependency. Reconstructing
/// the real pointer from this is `shimengine`'s job; it owns the invariant that the address
/// stays valid for the handle's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmbeddedHandle(pub usize);

/// Opaque handle to a live remote session, minted by `shimpg`'s pool. Carries the pool slot
/// index and that slot's generation counter so a statement can detect "the slot I last used
/// was recycled out from under me" without shimcore needing to know what a `postgres::Client`
/// is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteSessionId {
    pub slot: usize,
    pub generation: u64,
}

/// Host-visible pointer to a statement or database, as seen through the C ABI. Kept distinct
/// from `EmbeddedHandle` even though both wrap an address: this one identifies how the *host*
/// names the object or connection, the other how the embedded library does — they coincide
/// for pass-through statements but diverge for delegated/shadow ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostHandle(pub usize);

/// Last tracked error on a connection (spec.md §3 Connection "last tracked error").
#[derive(Debug, Clone, Default)]
pub struct TrackedError {
    pub code: i32,
    pub message: String,
}

/// One open database handle plus its optional paired remote session (spec.md §3
/// "Connection").
pub struct Connection {
    pub host_handle: HostHandle,
    pub path: String,
    pub embedded: EmbeddedHandle,
    pub remote: Option<RemoteSessionId>,
    pub redirected: bool,
    pub last_changes: i64,
    pub last_error: TrackedError,
    pub owning_thread: Option<std::thread::ThreadId>,
}

impl Connection {
    pub fn new(host_handle: HostHandle, path: String, embedded: EmbeddedHandle) -> Self {
        Connection {
            host_handle,
            path,
            embedded,
            remote: None,
            redirected: false,
            last_changes: 0,
            last_error: TrackedError::default(),
            owning_thread: None,
        }
    }

    /// Mark this connection as authoritatively redirected. Spec.md §3 invariant: `redirected`
    /// may only become true alongside a live, healthy remote session.
    pub fn redirect_to(&mut self, remote: RemoteSessionId) {
        self.remote = Some(remote);
        self.redirected = true;
    }

    pub fn record_error(&mut self, code: i32, message: impl Into<String>) {
        self.last_error = TrackedError {
            code,
            message: message.into(),
        };
    }
}

/// What a prepared statement does on redirect-aware connections (spec.md §3 Statement
/// "role").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementRole {
    PassThrough,
    WriteRedirected,
    ReadRedirected,
    SkipNoop,
}

/// Per-statement pre-allocated conversion scratch, indexed by 0-based parameter slot
/// (spec.md §3 Statement "per-parameter buffer").
#[derive(Debug, Clone)]
pub enum ParamValue {
    Null,
    Integer(i64),
    Real(f64),
    /// Text bind: always a freshly allocated buffer (spec.md §4.2 bind algorithm), as
    /// opposed to the fixed-size scratch used for numeric formatting.
    Text(String),
    Blob(Vec<u8>),
}

/// A statement's bound-parameter vector plus the name list recorded at prepare time, used to
/// resolve named parameters to positional slots (spec.md §4.2 "Bind algorithm").
#[derive(Debug, Clone, Default)]
pub struct ParamBuffer {
    values: Vec<ParamValue>,
    names: Vec<Option<String>>,
    name_index: HashMap<String, usize>,
}

impl ParamBuffer {
    pub fn with_names(names: Vec<Option<String>>) -> Self {
        let mut name_index = HashMap::new();
        for (i, name) in names.iter().enumerate() {
            if let Some(n) = name {
                name_index.insert(n.clone(), i);
            }
        }
        ParamBuffer {
            values: vec![ParamValue::Null; names.len()],
            names,
            name_index,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Resolve the host's 1-based parameter index to our 0-based internal slot.
    pub fn set_by_host_index(&mut self, host_index: i32, value: ParamValue) -> Result<(), crate::error::ShimError> {
        let idx = host_index as usize;
        if idx == 0 || idx > self.values.len() {
            return Err(crate::error::ShimError::ParamIndexOutOfRange {
                index: host_index as usize,
                count: self.values.len(),
            });
        }
        self.values[idx - 1] = value;
        Ok(())
    }

    pub fn set_by_name(&mut self, name: &str, value: ParamValue) -> Result<(), crate::error::ShimError> {
        let idx = *self.name_index.get(name).ok_or(crate::error::ShimError::ParamIndexOutOfRange {
            index: 0,
            count: self.values.len(),
        })?;
        self.values[idx] = value;
        Ok(())
    }

    pub fn values(&self) -> &[ParamValue] {
        &self.values
    }

    pub fn clear(&mut self) {
        for v in &mut self.values {
            *v = ParamValue::Null;
        }
    }
}

/// Per-statement state machine (spec.md §4.2 "State machine (per statement)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementState {
    Fresh,
    BoundPartial,
    BoundComplete,
    Executing,
    CursorOpen,
    Exhausted,
    Done,
    Finalized,
}

impl StatementState {
    pub fn on_bind(self) -> Self {
        match self {
            StatementState::Finalized => self,
            _ => StatementState::BoundPartial,
        }
    }

    /// `step` lands on `CursorOpen` for reads and `Done` for writes, passing through
    /// `Executing` in between (spec.md §4.2 state machine).
    pub fn on_step_start(self, is_write: bool) -> Self {
        if is_write {
            StatementState::Done
        } else {
            StatementState::CursorOpen
        }
    }

    pub fn on_reset(self) -> Self {
        match self {
            StatementState::Finalized => self,
            _ => StatementState::BoundComplete,
        }
    }

    pub fn on_finalize(self) -> Self {
        StatementState::Finalized
    }
}

/// A prepared host-visible statement (spec.md §3 "Statement").
#[derive(Debug)]
pub struct Statement {
    pub owning_connection: HostHandle,
    pub shadow: EmbeddedHandle,
    pub original_sql: String,
    pub translated_sql: String,
    pub role: StatementRole,
    pub params: ParamBuffer,
    pub stable_name: String,
    pub write_executed: bool,
    pub read_done: bool,
    pub state: StatementState,
    pub refcount: u32,
    pub produced_by: Option<RemoteSessionId>,
    pub cached_result_fingerprint: Option<u64>,
    pub created_at: Instant,
}

impl Statement {
    pub fn new(owning_connection: HostHandle, shadow: EmbeddedHandle, original_sql: String) -> Self {
        Statement {
            owning_connection,
            shadow,
            original_sql,
            translated_sql: String::new(),
            role: StatementRole::PassThrough,
            params: ParamBuffer::default(),
            stable_name: String::new(),
            write_executed: false,
            read_done: false,
            state: StatementState::Fresh,
            refcount: 1,
            produced_by: None,
            cached_result_fingerprint: None,
            created_at: Instant::now(),
        }
    }

    /// Latch `write_executed`: a one-way transition from false to true, reversed only by
    /// `reset` (spec.md §3 Statement invariants).
    pub fn latch_write(&mut self) {
        self.write_executed = true;
        self.state = StatementState::Done;
    }

    pub fn latch_read_done(&mut self) {
        self.read_done = true;
        self.state = StatementState::Exhausted;
    }

    pub fn reset(&mut self) {
        self.write_executed = false;
        self.read_done = false;
        self.params.clear();
        self.cached_result_fingerprint = None;
        self.produced_by = None;
        self.state = self.state.on_reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_buffer_resolves_named_parameters() {
        let mut buf = ParamBuffer::with_names(vec![Some("id".to_string()), None]);
        buf.set_by_name("id", ParamValue::Integer(7)).unwrap();
        buf.set_by_host_index(2, ParamValue::Text("x".to_string())).unwrap();
        match &buf.values()[0] {
            ParamValue::Integer(7) => {}
            other => panic!("unexpected {:?}", other),
        }
        match &buf.values()[1] {
            ParamValue::Text(s) if s == "x" => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn param_buffer_rejects_out_of_range_index() {
        let mut buf = ParamBuffer::with_names(vec![None]);
        assert!(buf.set_by_host_index(0, ParamValue::Null).is_err());
        assert!(buf.set_by_host_index(2, ParamValue::Null).is_err());
    }

    #[test]
    fn write_latch_is_one_way_until_reset() {
        let mut stmt = Statement::new(HostHandle(1), EmbeddedHandle(1), "INSERT INTO t VALUES (1)".to_string());
        assert!(!stmt.write_executed);
        stmt.latch_write();
        assert!(stmt.write_executed);
        assert_eq!(stmt.state, StatementState::Done);
        stmt.reset();
        assert!(!stmt.write_executed);
    }

    #[test]
    fn connection_redirect_requires_a_session() {
        let mut conn = Connection::new(HostHandle(1), "/redirect/db.sqlite".to_string(), EmbeddedHandle(1));
        assert!(!conn.redirected);
        conn.redirect_to(RemoteSessionId { slot: 0, generation: 1 });
        assert!(conn.redirected);
        assert!(conn.remote.is_some());
    }
}
